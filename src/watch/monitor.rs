//! Workspace file monitor.

use std::collections::BTreeSet;
use std::path::{Component, PathBuf};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::FileEvent;

/// Errors that can occur while monitoring
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Watch root does not exist: {0}")]
    RootNotFound(PathBuf),

    #[error("No watch roots registered")]
    NoRoots,

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),
}

/// Source of raw file events, registered per workspace root.
///
/// `start` may be called again to restart the stream; the previous
/// receiver then closes.
pub trait FileMonitor: Send {
    fn register(&mut self, root: PathBuf);

    fn start(&mut self) -> Result<mpsc::Receiver<FileEvent>, WatchError>;

    fn stop(&mut self);
}

/// File monitor backed by the platform's native watcher
pub struct NotifyMonitor {
    roots: BTreeSet<PathBuf>,
    capacity: usize,
    watcher: Option<RecommendedWatcher>,
}

impl NotifyMonitor {
    /// `capacity` bounds the number of undelivered events
    pub fn new(capacity: usize) -> Self {
        Self {
            roots: BTreeSet::new(),
            capacity: capacity.max(1),
            watcher: None,
        }
    }

    pub fn roots(&self) -> impl Iterator<Item = &PathBuf> {
        self.roots.iter()
    }
}

impl FileMonitor for NotifyMonitor {
    fn register(&mut self, root: PathBuf) {
        // Nested roots are covered by their recursive parent
        if self.roots.iter().any(|r| root.starts_with(r)) {
            return;
        }
        self.roots.retain(|r| !r.starts_with(&root));
        self.roots.insert(root);
    }

    fn start(&mut self) -> Result<mpsc::Receiver<FileEvent>, WatchError> {
        self.stop();
        if self.roots.is_empty() {
            return Err(WatchError::NoRoots);
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for file_event in translate(event) {
                    // Blocks the notify thread when the consumer lags behind
                    if tx.blocking_send(file_event).is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "File watcher error"),
        })?;

        for root in &self.roots {
            if !root.exists() {
                return Err(WatchError::RootNotFound(root.clone()));
            }
            watcher.watch(root, RecursiveMode::Recursive)?;
            info!(root = %root.display(), "Watching workspace");
        }

        self.watcher = Some(watcher);
        Ok(rx)
    }

    fn stop(&mut self) {
        if self.watcher.take().is_some() {
            debug!("File watcher stopped");
        }
    }
}

fn is_ignored(path: &std::path::Path) -> bool {
    path.components().any(|c| match c {
        Component::Normal(name) => name == ".git",
        _ => false,
    })
}

/// Map a native event to file events, dropping access and directory events
fn translate(event: Event) -> Vec<FileEvent> {
    let paths: Vec<PathBuf> = event.paths.into_iter().filter(|p| !is_ignored(p)).collect();

    let events: Vec<FileEvent> = match event.kind {
        EventKind::Create(_) => paths.into_iter().map(FileEvent::created).collect(),
        EventKind::Remove(_) => paths.into_iter().map(FileEvent::deleted).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.into_iter().map(FileEvent::deleted).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.into_iter().map(FileEvent::created).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = paths.into_iter();
            let mut events = Vec::new();
            if let Some(from) = paths.next() {
                events.push(FileEvent::deleted(from));
            }
            events.extend(paths.map(FileEvent::created));
            events
        }
        EventKind::Modify(_) => paths.into_iter().map(FileEvent::modified).collect(),
        _ => Vec::new(),
    };

    events
        .into_iter()
        .filter(|e| e.is_deletion() || !e.path.is_dir())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};

    #[test]
    fn test_translate_kinds() {
        let created = Event::new(EventKind::Create(CreateKind::File)).add_path("/ws/a.txt".into());
        assert_eq!(translate(created), vec![FileEvent::created("/ws/a.txt")]);

        let modified = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path("/ws/a.txt".into());
        assert_eq!(translate(modified), vec![FileEvent::modified("/ws/a.txt")]);

        let renamed = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path("/ws/old.txt".into())
            .add_path("/ws/new.txt".into());
        assert_eq!(
            translate(renamed),
            vec![FileEvent::deleted("/ws/old.txt"), FileEvent::created("/ws/new.txt")]
        );

        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path("/ws/.git/index".into());
        assert!(translate(removed).is_empty());
    }

    #[test]
    fn test_nested_roots_collapse() {
        let mut monitor = NotifyMonitor::new(16);
        monitor.register(PathBuf::from("/ws/app"));
        monitor.register(PathBuf::from("/ws"));
        monitor.register(PathBuf::from("/ws/base"));

        assert_eq!(monitor.roots().collect::<Vec<_>>(), vec![&PathBuf::from("/ws")]);
    }

    #[test]
    fn test_start_without_roots() {
        let mut monitor = NotifyMonitor::new(16);
        assert!(matches!(monitor.start(), Err(WatchError::NoRoots)));
    }

    #[tokio::test]
    async fn test_reports_written_files() {
        let temp = tempfile::TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let mut monitor = NotifyMonitor::new(64);
        monitor.register(root.clone());
        let mut rx = monitor.start().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        std::fs::write(root.join("new.txt"), "hello").unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.path, root.join("new.txt"));
        monitor.stop();
    }
}
