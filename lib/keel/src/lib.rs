#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

/// Largest payload a single UDP datagram can carry (65535 minus the IP and
/// UDP headers). Shared by the wire codec and the shared-state transport.
pub const UDP_DATA_MAX_LEN: usize = 65507;

pub mod crypto;
pub mod encoding;
pub mod logging;
pub mod time;
