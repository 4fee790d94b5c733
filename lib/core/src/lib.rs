//! Core domain types and utilities for switchboard.
//!
//! This crate provides the identifiers every other crate keys its state
//! on, the `Result` alias used for rootcause-based error handling, and the
//! clock abstraction used wherever wall-clock time drives a decision.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::Result;
pub use id::{EventId, Identity, ParseIdError, SessionId};
