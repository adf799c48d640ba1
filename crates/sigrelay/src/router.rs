use crate::metrics::counters;
use crate::registry::{Registry, SendError};
use sigrelay_common::Envelope;

/// What happened to one routed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Queued on the target's connection.
    Forwarded,
    /// No `to` field, or an empty one.
    MissingTarget,
    /// `to` names no registered peer.
    UnknownTarget,
    /// The target is registered but could not take the message.
    ForwardFailed(SendError),
}

/// Forward `raw` to the peer named by `envelope.to()`.
///
/// `raw` is the text exactly as received; it is never re-encoded. None of the
/// outcomes are reported back to the sender.
pub fn route(registry: &Registry, from: &str, envelope: &Envelope, raw: String) -> RouteOutcome {
    let Some(to) = envelope.to().filter(|to| !to.is_empty()) else {
        counters::messages_dropped_total("no_target");
        tracing::debug!(from, kind = ?envelope.kind(), "dropping envelope without target");
        return RouteOutcome::MissingTarget;
    };

    let Some(target) = registry.lookup(to) else {
        counters::messages_dropped_total("unknown_target");
        tracing::debug!(from, to, "target not registered");
        return RouteOutcome::UnknownTarget;
    };

    match target.send(raw) {
        Ok(()) => {
            counters::messages_forwarded_total();
            tracing::trace!(from, to, kind = ?envelope.kind(), "forwarded");
            RouteOutcome::Forwarded
        }
        Err(e) => {
            let reason = match e {
                SendError::QueueFull => "queue_full",
                SendError::Closed => "target_closed",
            };
            counters::messages_dropped_total(reason);
            tracing::debug!(from, to, conn = %target.id(), error = %e, "forward failed");
            RouteOutcome::ForwardFailed(e)
        }
    }
}
