//! Testing utilities and mock implementations
//!
//! Lets the session state machine and listeners run without an MQTT broker.

pub mod mocks;

pub use mocks::*;
