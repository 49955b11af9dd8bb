//! Sleeper CRD Definitions
//!
//! Custom resource types owned by the sleeper controller.

#![warn(missing_docs)]

pub mod sleeper;

pub use sleeper::*;
