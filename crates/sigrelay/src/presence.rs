//! Join announcements.
//!
//! When a peer registers, every registered connection (the newcomer included)
//! learns its id, and the newcomer learns who was already there. The
//! newcomer's own two envelopes bypass its queue and are written by its
//! session directly, so they cannot be lost to a full queue.

use crate::metrics::counters;
use crate::registry::{ConnId, Registry};
use sigrelay_common::ServerEnvelope;

/// Outcome of one announcement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Announcement {
    /// Envelopes queued on other peers.
    pub delivered: usize,
    /// Envelopes that could not be queued.
    pub failed: usize,
    /// `registered` then `already_registered`, for the newcomer's socket.
    pub greeting: Vec<String>,
}

/// Announce `id` to every other peer and build the newcomer's greeting.
///
/// Best-effort: a peer that cannot take the message is logged and skipped.
pub fn announce(registry: &Registry, id: &str, newcomer: ConnId) -> Announcement {
    let snapshot = registry.snapshot();
    let mut tally = Announcement::default();

    let joined = ServerEnvelope::Registered { id: id.to_string() }.to_string();
    let mut ids = Vec::with_capacity(snapshot.len());
    for (peer, handle) in snapshot {
        if handle.id() == newcomer {
            continue;
        }
        match handle.send(joined.clone()) {
            Ok(()) => tally.delivered += 1,
            Err(e) => {
                tally.failed += 1;
                counters::presence_failures_total();
                tracing::debug!(peer = %peer, joined = id, error = %e, "presence broadcast failed");
            }
        }
        ids.push(peer);
    }

    let existing = ServerEnvelope::AlreadyRegistered { ids }.to_string();
    tally.greeting = vec![joined, existing];
    tally
}
