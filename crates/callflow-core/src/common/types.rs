//! Wire-level constants shared by the server and the client.

/// Port the server listens on and the client dials when none is given.
pub const DEFAULT_PORT: u16 = 50051;

/// Request string the client sends when none is given on the command line.
pub const DEFAULT_REQUEST: &str = "some answer to the request";

/// Prefix the default handler puts in front of every request string.
pub const REPLY_PREFIX: &str = "Dispatched ";

/// Largest `request_string` (in bytes) accepted unless configured otherwise.
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 4096;
