//! Event batching.
//!
//! A batch is flushed once no new event has arrived for the quiet period,
//! or once the batch has been open for the maximum wait, whichever comes
//! first. Events for the same path are coalesced into one.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::trace;

use crate::domain::{FileEvent, FileEventKind};

/// Timer-reset debouncer over a bounded event channel.
///
/// `next_batch` is cancel safe: events collected by a call that is dropped
/// mid-window are kept and flushed by the next call.
#[derive(Debug)]
pub struct Debouncer {
    quiet: Duration,
    max_wait: Duration,
    pending: BTreeMap<PathBuf, FileEventKind>,
    opened_at: Option<Instant>,
}

impl Debouncer {
    pub fn new(quiet: Duration, max_wait: Duration) -> Self {
        Self {
            quiet,
            max_wait: max_wait.max(quiet),
            pending: BTreeMap::new(),
            opened_at: None,
        }
    }

    /// Wait for the next batch. Returns `None` once the channel is closed
    /// and nothing is left to flush.
    pub async fn next_batch(&mut self, rx: &mut mpsc::Receiver<FileEvent>) -> Option<Vec<FileEvent>> {
        if self.pending.is_empty() {
            let first = rx.recv().await?;
            self.push(first);
        }
        let opened_at = *self.opened_at.get_or_insert_with(Instant::now);
        let hard_deadline = opened_at + self.max_wait;

        loop {
            let deadline = (Instant::now() + self.quiet).min(hard_deadline);
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(event)) => self.push(event),
                Ok(None) | Err(_) => break,
            }
        }

        Some(self.flush())
    }

    /// Number of distinct paths waiting to be flushed
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn push(&mut self, event: FileEvent) {
        if self.pending.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        trace!(path = %event.path.display(), kind = ?event.kind, "Buffered file event");

        let kind = match self.pending.get(&event.path) {
            Some(previous) => coalesce(*previous, event.kind),
            None => event.kind,
        };
        self.pending.insert(event.path, kind);
    }

    fn flush(&mut self) -> Vec<FileEvent> {
        self.opened_at = None;
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(path, kind)| FileEvent::new(path, kind))
            .collect()
    }
}

/// Net effect of two consecutive events on one path
fn coalesce(previous: FileEventKind, next: FileEventKind) -> FileEventKind {
    use FileEventKind::*;
    match (previous, next) {
        (_, Deleted) => Deleted,
        (Deleted, Created) | (Deleted, Modified) => Modified,
        (Created, Modified) => Created,
        (_, kind) => kind,
    }
}
