use crate::payload::Payload;
use crate::registry::{ConnId, Registry};
use tokio::sync::mpsc::error::TrySendError;

/// Why a recipient was dropped during a broadcast.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictReason {
    /// The recipient's task is gone.
    Closed,
    /// The recipient stopped draining its queue.
    Full,
}

impl EvictReason {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Full => "queue_full",
        }
    }
}

/// Outcome of a single broadcast.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Fanout {
    /// Recipients whose queue accepted the payload.
    pub delivered: usize,
    /// Recipients that failed and were removed from the registry.
    pub evicted: Vec<(ConnId, EvictReason)>,
}

impl Fanout {
    /// Number of recipients the broadcast tried to reach.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.delivered + self.evicted.len()
    }
}

/// Offer `payload` to every registered connection except `origin`.
///
/// Each recipient is tried on its own. A failed recipient is unregistered
/// and the loop moves on; nothing is reported back to the sender. Never
/// waits on a slow peer: a full queue counts as a failure.
pub fn broadcast(registry: &Registry, origin: ConnId, payload: &Payload) -> Fanout {
    let mut fanout = Fanout::default();

    for handle in registry.snapshot() {
        if handle.id == origin {
            continue;
        }
        let reason = match handle.tx.try_send(payload.clone()) {
            Ok(()) => {
                fanout.delivered += 1;
                continue;
            }
            Err(TrySendError::Closed(_)) => EvictReason::Closed,
            Err(TrySendError::Full(_)) => EvictReason::Full,
        };
        registry.unregister(handle.id);
        tracing::debug!(
            conn = %handle.id,
            peer = %handle.peer,
            reason = reason.as_str(),
            "evicted recipient during broadcast"
        );
        fanout.evicted.push((handle.id, reason));
    }

    fanout
}
