use std::sync::Arc;

use super::Notifier;
use crate::CheckpointConfig;
use crate::ErrorSink;
use crate::KvStore;
use crate::LeaseManager;
use crate::NotifyConfig;
use crate::NotifyPaths;
use crate::RevisionCheckpoint;
use crate::WatchConfig;

pub struct NotifierBuilder<S: KvStore + ?Sized> {
    root: String,
    store: Arc<S>,
    checkpoint: CheckpointConfig,
    watch: WatchConfig,
    errors: Option<ErrorSink>,
}

impl<S: KvStore + ?Sized> NotifierBuilder<S> {
    /// Create a new builder with default config for `root`
    pub fn new(
        root: impl Into<String>,
        store: Arc<S>,
    ) -> Self {
        Self {
            root: root.into(),
            store,
            checkpoint: CheckpointConfig::default(),
            watch: WatchConfig::default(),
            errors: None,
        }
    }

    /// Takes root, checkpoint and watch settings from a loaded configuration
    pub fn config(
        mut self,
        config: &NotifyConfig,
    ) -> Self {
        self.root = config.root.clone();
        self.checkpoint = config.checkpoint.clone();
        self.watch = config.watch.clone();
        self
    }

    pub fn checkpoint(
        mut self,
        checkpoint: CheckpointConfig,
    ) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn watch(
        mut self,
        watch: WatchConfig,
    ) -> Self {
        self.watch = watch;
        self
    }

    /// Errors a dispatcher recovers from are also sent here
    pub fn error_sink(
        mut self,
        sink: ErrorSink,
    ) -> Self {
        self.errors = Some(sink);
        self
    }

    pub fn build(self) -> Notifier<S> {
        let paths = NotifyPaths::new(self.root);
        let persist_retry = self.checkpoint.persist_retry;
        Notifier {
            checkpoint: RevisionCheckpoint::new(self.store.clone(), paths.revision(), self.checkpoint),
            lease: LeaseManager::new(self.store.clone()),
            store: self.store,
            paths,
            watch: self.watch,
            persist_retry,
            errors: self.errors,
        }
    }
}
