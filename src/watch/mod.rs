//! File watching: the native monitor and the debouncer feeding the dev loop.

pub mod debounce;
pub mod monitor;

pub use debounce::Debouncer;
pub use monitor::{FileMonitor, NotifyMonitor, WatchError};
