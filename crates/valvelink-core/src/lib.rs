//! valvelink-core — wire formats, Security1 cryptography, error taxonomy,
//! and configuration shared by every other valvelink crate.

pub mod config;
pub mod crypto;
pub mod error;
pub mod message;
pub mod wire;

pub use error::{ErrorCategory, ErrorComponent, ErrorSeverity, RecoveryStrategy};
pub use message::{Frame, Origin};
