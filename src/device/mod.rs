pub mod btle;
pub mod constants;
pub mod dispatcher;
pub mod gateway;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
