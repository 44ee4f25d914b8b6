//! Library surface for the telemetry extension binary.
//!
//! Split out so integration tests can exercise the embedded HTTP receivers
//! and the Coordinator the same way the extension binary wires them.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod logs;
pub mod metadata;
pub mod metrics_doc;
pub mod receiver;
pub mod signal;
pub mod transport;

pub const EXTENSION_NAME: &str = "lambda-telemetry-extension";
