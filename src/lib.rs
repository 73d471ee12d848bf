//! Command notification on top of etcd
//!
//! A controller sends commands to uniquely identified recipients (unicast)
//! or to every watcher of a command (broadcast). Recipients either read
//! pending commands once or watch for them, resuming across restarts from a
//! revision checkpoint stored next to the commands.
//!
//! - [`Notifier`] - writers, one-shot reader and watch dispatchers
//! - [`NotifyPaths`] - key layout of a namespace root
//! - [`RevisionCheckpoint`] - where a dispatcher resumes from
//! - [`LeaseManager`] - TTL and keep-alive of leased commands
//! - [`KvStore`] - store seam, implemented by [`EtcdStore`] and [`MemoryStore`]

mod checkpoint;
mod config;
mod dispatcher;
mod errors;
mod lease;
mod metrics;
mod notifier;
mod path;
mod store;
pub(crate) mod utils;

pub use checkpoint::*;
pub use config::*;
pub use dispatcher::DispatchExit;
pub use dispatcher::DispatchSummary;
pub use dispatcher::ErrorSink;
pub use errors::*;
pub use lease::*;
pub use metrics::register_custom_metrics;
pub use notifier::*;
pub use path::*;
pub use store::*;

#[cfg(test)]
mod dispatcher_test;
