//! `AvailabilityBatchBuffer`: accumulates serialized availability
//! deltas produced during a batch and flushes them to `AvailabilityBus` once.

use poller_cache::AvailabilityBus;
use poller_common::AvailabilityDelta;

#[derive(Debug, Default)]
pub struct AvailabilityBatchBuffer {
    buf: Vec<u8>,
}

impl AvailabilityBatchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes `delta` only when at least one flag bit is set; otherwise
    /// a no-op. Returns whether anything was appended.
    pub fn append_delta(&mut self, delta: &AvailabilityDelta) -> bool {
        if !delta.flags.any() {
            return false;
        }
        self.buf.extend_from_slice(&delta.encode());
        true
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Sends the accumulated blob if non-empty and clears the buffer.
    pub async fn flush_to(&mut self, bus: &dyn AvailabilityBus) {
        if self.buf.is_empty() {
            return;
        }
        let blob = std::mem::take(&mut self.buf);
        bus.send(blob).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poller_cache::InMemoryAvailabilityBus;
    use poller_common::{AvailabilityDeltaFlags, AvailabilityState};

    #[test]
    fn append_delta_is_noop_when_no_flags_set() {
        let mut buffer = AvailabilityBatchBuffer::new();
        let delta = AvailabilityDelta {
            interfaceid: 1,
            flags: AvailabilityDeltaFlags::default(),
            available: AvailabilityState::Unknown,
            error: String::new(),
            errors_from: 0,
            disable_until: 0,
        };
        assert!(!buffer.append_delta(&delta));
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn flush_sends_once_and_clears() {
        let mut buffer = AvailabilityBatchBuffer::new();
        let delta = AvailabilityDelta {
            interfaceid: 1,
            flags: AvailabilityDeltaFlags { available: true, ..Default::default() },
            available: AvailabilityState::True,
            error: String::new(),
            errors_from: 0,
            disable_until: 0,
        };
        buffer.append_delta(&delta);

        let bus = InMemoryAvailabilityBus::new();
        buffer.flush_to(&bus).await;
        assert!(buffer.is_empty());
        assert_eq!(bus.sent().await.len(), 1);

        buffer.flush_to(&bus).await;
        assert_eq!(bus.sent().await.len(), 1);
    }
}
