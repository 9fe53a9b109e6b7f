/**
 * How long (milliseconds) to wait before retrying a connection attempt that waits for the device.
 */
pub const CONNECT_DELAY: u64 = 1000;

/**
 * How long (milliseconds) a single connection attempt, including characteristic discovery, may take.
 */
pub const CONNECT_DEADLINE: u64 = 10000;

/**
 * How long (milliseconds) a read or write to a characteristic may take.
 */
pub const WRITE_DEADLINE: u64 = 2000;

/**
 * How long (milliseconds) checking if the peripheral is still connected may take
 */
pub const IS_CONNECTED_DEADLINE: u64 = 2000;

/**
 * How long (milliseconds) to wait between checks for a usable connection handle.
 */
pub const READY_POLL_DELAY: u64 = 10;

/**
 * How long (milliseconds) the command line tool scans before it looks up a device.
 */
pub const SCAN_DURATION: u64 = 5000;

/**
 * How many state changes the btleplug backend buffers per subscriber before it starts dropping the oldest.
 */
pub const STATE_CHANGE_BUFFER: usize = 64;

/**
 * Smallest ATT MTU allowed by the Bluetooth core specification, and the largest one.
 */
pub const MIN_MTU: u16 = 23;
pub const MAX_MTU: u16 = 517;
