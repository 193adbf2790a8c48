use std::time::Duration;

/// Shared byte budget for one HTTP header section: the request line plus
/// every header line, terminators included.
pub const HEADER_MAX_SIZE: usize = 4096;

/// Time allowed for a client to complete the upgrade handshake, from
/// socket acceptance to the 101 response.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default cap on one reassembled message (all fragments combined).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
