//! Post-commit notifications.
//!
//! Hosts hand the coordinator the sending half of a tokio broadcast
//! channel; every subscriber (e.g. one per connected peer) gets its own
//! receiver. Notifications only say *that* something happened. Receivers
//! re-query the log for contents, and must not assume any delivery order
//! between notifications or relative to what a concurrent read observes.
//!
//! Sending never blocks. A channel with no live receivers simply counts the
//! notification as undelivered.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use crate::session::SessionId;

/// Emitted once per successful append, after commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppendedOperation {
    pub session: SessionId,
    pub operation: u64,
}

/// Emitted once per successful end, after commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionEnded {
    pub session: SessionId,
}

/// Snapshot of notification counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyStats {
    pub appended_sent: u64,
    pub ended_sent: u64,
    /// Notifications with no live receiver to take them
    pub undelivered: u64,
}

/// Lock-free counters, read via [`Notifier::stats`].
#[derive(Default)]
struct AtomicNotifyStats {
    appended_sent: AtomicU64,
    ended_sent: AtomicU64,
    undelivered: AtomicU64,
}

/// Owns the two optional caller-supplied sinks.
#[derive(Default)]
pub struct Notifier {
    appended: Option<broadcast::Sender<AppendedOperation>>,
    ended: Option<broadcast::Sender<SessionEnded>>,
    stats: AtomicNotifyStats,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_appended_sink(&mut self, sink: broadcast::Sender<AppendedOperation>) {
        self.appended = Some(sink);
    }

    pub fn set_ended_sink(&mut self, sink: broadcast::Sender<SessionEnded>) {
        self.ended = Some(sink);
    }

    /// Publish an append. Fire-and-forget.
    pub fn appended(&self, notification: AppendedOperation) {
        if let Some(sink) = &self.appended {
            self.stats.appended_sent.fetch_add(1, Ordering::Relaxed);
            if sink.send(notification).is_err() {
                self.stats.undelivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Publish an end. Fire-and-forget.
    pub fn ended(&self, notification: SessionEnded) {
        if let Some(sink) = &self.ended {
            self.stats.ended_sent.fetch_add(1, Ordering::Relaxed);
            if sink.send(notification).is_err() {
                self.stats.undelivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn stats(&self) -> NotifyStats {
        NotifyStats {
            appended_sent: self.stats.appended_sent.load(Ordering::Relaxed),
            ended_sent: self.stats.ended_sent.load(Ordering::Relaxed),
            undelivered: self.stats.undelivered.load(Ordering::Relaxed),
        }
    }
}
