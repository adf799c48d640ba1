//! Core type definitions and protocol constants for sigrelay.

/// Identifier a peer registers under. Opaque, non-empty.
pub type ClientId = String;

/// Envelope `type` tags the relay reads from clients.
///
/// Server-sent tags come from [`crate::ServerEnvelope`]. Any other tag is
/// signaling content and is routed without inspection.
pub mod kind {
    /// Client → relay: claim an identifier.
    pub const REGISTER: &str = "register";
}

/// Machine-readable reasons carried in `error` envelopes and Close frames.
pub mod close_reason {
    /// No `register` arrived before the registration deadline.
    pub const REGISTRATION_TIMEOUT: &str = "registration_timeout";
    /// The first message was not a valid `register` envelope.
    pub const MUST_REGISTER_FIRST: &str = "must_register_first";
    /// A second `register` on an already registered connection.
    pub const ALREADY_REGISTERED: &str = "already_registered";
    /// The identifier was claimed by a newer connection.
    pub const EVICTED: &str = "evicted";
    /// No traffic for the configured idle window.
    pub const IDLE_TIMEOUT: &str = "idle_timeout";
    /// The relay is shutting down.
    pub const SHUTDOWN: &str = "shutdown";
}
