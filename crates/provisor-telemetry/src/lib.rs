//! Provisor Telemetry - logging setup for the provisioning core.
//!
//! # Example
//!
//! ```rust,no_run
//! use provisor_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), provisor_telemetry::TelemetryError> {
//! let config = LogConfig::new("debug")
//!     .with_format(LogFormat::Pretty)
//!     .with_directive("provisor_plugins=trace");
//!
//! setup_logging(&config)?;
//! tracing::info!("worker pool starting");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{LogConfig, LogFormat, LogTarget, setup_default_logging, setup_logging};
