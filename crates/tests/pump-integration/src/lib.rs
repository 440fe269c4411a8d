//! Integration test harness crate.

mod env;
mod greenmail;
mod imap;

pub use env::*;
pub use greenmail::*;
pub use imap::*;

/// The GreenMail plaintext IMAP port.
pub const IMAP_PORT: u16 = 3143;
