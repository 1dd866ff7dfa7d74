//! Hand-off between the streaming loop and its consumers.
//!
//! One mutex guards the latest encoded frame and the pending alert. Writers
//! overwrite; an unread alert is lost when a newer one arrives.

use crate::types::Alert;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;

/// Write counters for status reporting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct SlotStats {
    pub frames_written: u64,
    pub alerts_written: u64,
    /// Sequence number of the newest frame; 0 before the first write.
    pub sequence: u64,
}

#[derive(Default)]
struct Inner {
    frame: Option<Bytes>,
    alert: Option<Alert>,
    stats: SlotStats,
}

#[derive(Default)]
pub struct SharedStateSlot {
    inner: Mutex<Inner>,
}

impl SharedStateSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a frame, and an alert if one was raised for it.
    ///
    /// A `None` alert leaves any pending alert in place.
    pub fn write(&self, frame: Bytes, alert: Option<Alert>) -> u64 {
        let mut inner = self.inner.lock();
        inner.frame = Some(frame);
        inner.stats.frames_written += 1;
        inner.stats.sequence += 1;
        if let Some(alert) = alert {
            inner.alert = Some(alert);
            inner.stats.alerts_written += 1;
        }
        inner.stats.sequence
    }

    /// Newest frame, if any has been written.
    pub fn read_frame(&self) -> Option<Bytes> {
        self.inner.lock().frame.clone()
    }

    /// Newest frame and its sequence, only if newer than `seen`.
    pub fn read_frame_after(&self, seen: u64) -> Option<(u64, Bytes)> {
        let inner = self.inner.lock();
        match &inner.frame {
            Some(frame) if inner.stats.sequence > seen => Some((inner.stats.sequence, frame.clone())),
            _ => None,
        }
    }

    /// Take the pending alert; the next call returns `None` until another write.
    pub fn read_and_clear_alert(&self) -> Option<Alert> {
        self.inner.lock().alert.take()
    }

    pub fn stats(&self) -> SlotStats {
        self.inner.lock().stats
    }
}
