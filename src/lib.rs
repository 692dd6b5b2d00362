//! Reservation availability discovery pipeline.
//!
//! Exposes the `pipeline` module for use by the binary and integration
//! tests.

pub mod pipeline;
