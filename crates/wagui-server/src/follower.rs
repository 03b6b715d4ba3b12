use crate::broadcaster::{Broadcaster, EventKind};
use crate::{lock_store, SharedStore};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use wag_core::AppRecord;
use wag_transcript::{TranscriptError, TranscriptTail};

struct ActiveFollower {
    app: String,
    handle: JoinHandle<()>,
}

/// Runs at most one transcript polling task at a time.
pub struct TranscriptFollower {
    tail: Arc<TranscriptTail>,
    store: SharedStore,
    broadcaster: Broadcaster,
    interval: Duration,
    active: Mutex<Option<ActiveFollower>>,
}

impl TranscriptFollower {
    pub fn new(
        tail: TranscriptTail,
        store: SharedStore,
        broadcaster: Broadcaster,
        interval: Duration,
    ) -> Self {
        Self {
            tail: Arc::new(tail),
            store,
            broadcaster,
            interval,
            active: Mutex::new(None),
        }
    }

    /// Stops any running follower, then starts polling `app`.
    pub fn start(&self, app: &AppRecord) {
        let mut active = self.lock();
        if let Some(previous) = active.take() {
            previous.handle.abort();
            info!(event = "follower_stop", app = %previous.app, reason = "replaced");
        }

        let tail = self.tail.clone();
        let store = self.store.clone();
        let broadcaster = self.broadcaster.clone();
        let name = app.name.clone();
        let root = app.app_root.clone();
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = tick(&tail, &store, &broadcaster, &name, &root) {
                    warn!(event = "transcript_error", app = %name, error = %err);
                }
            }
        });

        info!(
            event = "follower_start",
            app = %app.name,
            app_root = %app.app_root,
            interval_ms = period.as_millis() as u64
        );
        *active = Some(ActiveFollower {
            app: app.name.clone(),
            handle,
        });
    }

    /// Returns whether a follower was running.
    pub fn stop(&self) -> bool {
        match self.lock().take() {
            Some(previous) => {
                previous.handle.abort();
                info!(event = "follower_stop", app = %previous.app, reason = "stopped");
                true
            }
            None => false,
        }
    }

    pub fn active_app(&self) -> Option<String> {
        self.lock().as_ref().map(|active| active.app.clone())
    }

    /// Runs a single tick inline.
    pub fn poll_once(&self, app: &AppRecord) -> Result<usize, TranscriptError> {
        tick(
            &self.tail,
            &self.store,
            &self.broadcaster,
            &app.name,
            &app.app_root,
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ActiveFollower>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TranscriptFollower {
    fn drop(&mut self) {
        self.stop();
    }
}

fn tick(
    tail: &TranscriptTail,
    store: &SharedStore,
    broadcaster: &Broadcaster,
    app: &str,
    app_root: &str,
) -> Result<usize, TranscriptError> {
    let store = lock_store(store);
    let report = tail.poll(&store, app, app_root)?;

    if report.rotated {
        debug!(event = "transcript_rotated", app, file = ?report.file);
    }
    if !report.new_messages.is_empty() {
        info!(
            event = "transcript_ingest",
            app,
            messages = report.new_messages.len(),
            duplicates = report.duplicates,
            skipped = report.skipped_lines,
            offset = report.offset
        );
    }

    // Published before the store lock drops, matching the HTTP writers.
    let count = report.new_messages.len();
    for message in report.new_messages {
        broadcaster.publish(EventKind::Message, &message);
    }
    drop(store);
    Ok(count)
}
