//! Logging utilities.
//!
//! Everything in this crate logs through the `log` facade. Validation
//! messages forwarded from devices use the [`GPU_LOG_TARGET`] target so they
//! can be filtered separately.

mod init;

pub use crate::device::GPU_LOG_TARGET;
pub use init::{LoggingConfig, init_logging};
