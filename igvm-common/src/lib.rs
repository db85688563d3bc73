//! # igvm-common
//!
//! Shared logging setup for the `igvm` binary: a human-readable layer for
//! an interactive terminal, a JSON layer for log aggregation.
//!
//! ```rust
//! use igvm_common::init_logging;
//!
//! init_logging("info").unwrap();
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json};
