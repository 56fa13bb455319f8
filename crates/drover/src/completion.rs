//! Completion detector.
//!
//! Polls every import cursor against its frozen end serial and latches a
//! one-time signal once the whole legacy history sits on the destination.
//! The signal never reverts; operators consume it to decide when the
//! storage node can be reconfigured off the adapter entirely.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use drover_proto::oid::SourceId;

use crate::config::Tuning;
use crate::cursor::CursorSet;

pub struct CompletionDetector {
    cursors: Arc<CursorSet>,
    poll: Duration,
    signal: watch::Sender<bool>,
}

impl CompletionDetector {
    pub fn new(cursors: Arc<CursorSet>, tuning: &Tuning) -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            cursors,
            poll: Duration::from_millis(tuning.completion_poll_ms.max(1)),
            signal,
        }
    }

    /// Receiver that flips to `true` exactly once, when every source is
    /// fully imported.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Whether the latched signal has fired.
    pub fn is_complete(&self) -> bool {
        *self.signal.borrow()
    }

    /// Poll until the signal latches or shutdown fires. The task exits
    /// after latching; there is nothing left to detect.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut seen = HashSet::new();
        loop {
            if *shutdown.borrow() {
                return;
            }
            if self.poll_once(&mut seen) {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    /// One sweep over the cursors; `true` once the signal is latched.
    fn poll_once(&self, seen: &mut HashSet<SourceId>) -> bool {
        for view in self.cursors.iter() {
            if view.is_complete() && seen.insert(view.source().clone()) {
                debug!(
                    "completion: source '{}' fully imported at serial {}",
                    view.source(),
                    view.end()
                );
            }
        }
        if self.cursors.all_complete() {
            // send_replace stores the value even with no subscribers yet.
            if !self.signal.send_replace(true) {
                info!(
                    "completion: all {} sources fully imported, adapter can be retired",
                    self.cursors.len()
                );
            }
            return true;
        }
        false
    }
}
