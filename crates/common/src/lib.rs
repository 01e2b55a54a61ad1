//! Common utilities for usbnet
//!
//! Shared plumbing for the engine and the bridge binary: the common error
//! type and tracing subscriber setup.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::{init_test_logging, setup_logging};
