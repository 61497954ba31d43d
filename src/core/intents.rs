//! Explicit one-shot requests that bypass change detection.
//!
//! Each latch is set by an external trigger and read-and-cleared by the
//! orchestrator. Setting a latch twice before it is taken yields one
//! request; taking an unset latch has no effect.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tracing::debug;

/// Latches taken by one orchestrator iteration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TakenIntents {
    pub build: bool,
    pub sync: bool,
    pub deploy: bool,
}

impl TakenIntents {
    pub fn any(&self) -> bool {
        self.build || self.sync || self.deploy
    }
}

/// Build/sync/deploy latches plus the "act automatically" switches
pub struct Intents {
    build: AtomicBool,
    sync: AtomicBool,
    deploy: AtomicBool,

    auto_build: AtomicBool,
    auto_sync: AtomicBool,
    auto_deploy: AtomicBool,

    notify: Notify,
}

impl Default for Intents {
    fn default() -> Self {
        Self::new(true, true, true)
    }
}

impl Intents {
    pub fn new(auto_build: bool, auto_sync: bool, auto_deploy: bool) -> Self {
        Self {
            build: AtomicBool::new(false),
            sync: AtomicBool::new(false),
            deploy: AtomicBool::new(false),
            auto_build: AtomicBool::new(auto_build),
            auto_sync: AtomicBool::new(auto_sync),
            auto_deploy: AtomicBool::new(auto_deploy),
            notify: Notify::new(),
        }
    }

    fn trigger(&self, latch: &AtomicBool, kind: &str) {
        latch.store(true, Ordering::SeqCst);
        debug!(intent = kind, "Intent triggered");
        self.notify.notify_one();
    }

    pub fn trigger_build(&self) {
        self.trigger(&self.build, "build");
    }

    pub fn trigger_sync(&self) {
        self.trigger(&self.sync, "sync");
    }

    pub fn trigger_deploy(&self) {
        self.trigger(&self.deploy, "deploy");
    }

    pub fn take_build(&self) -> bool {
        self.build.swap(false, Ordering::SeqCst)
    }

    pub fn take_sync(&self) -> bool {
        self.sync.swap(false, Ordering::SeqCst)
    }

    pub fn take_deploy(&self) -> bool {
        self.deploy.swap(false, Ordering::SeqCst)
    }

    /// Take every latch at once
    pub fn take_all(&self) -> TakenIntents {
        TakenIntents {
            build: self.take_build(),
            sync: self.take_sync(),
            deploy: self.take_deploy(),
        }
    }

    /// Whether any latch is currently set (without clearing it)
    pub fn pending(&self) -> bool {
        self.build.load(Ordering::SeqCst)
            || self.sync.load(Ordering::SeqCst)
            || self.deploy.load(Ordering::SeqCst)
    }

    /// Wait until a trigger fires. A trigger that fired while nobody was
    /// waiting is remembered for the next call.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    pub fn auto_build(&self) -> bool {
        self.auto_build.load(Ordering::SeqCst)
    }

    pub fn auto_sync(&self) -> bool {
        self.auto_sync.load(Ordering::SeqCst)
    }

    pub fn auto_deploy(&self) -> bool {
        self.auto_deploy.load(Ordering::SeqCst)
    }
}
