//! Wire types shared by the sigrelay server and its clients.
//!
//! This crate provides:
//! - Envelope parsing and construction ([`envelope`])
//! - Identifier type and protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod types;

pub use envelope::{ClientEnvelope, Envelope, EnvelopeError, ServerEnvelope};
pub use types::ClientId;
