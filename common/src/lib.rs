//! Provides types and functions common to the kindling binaries.
#![deny(missing_docs)]
pub mod telemetry;
