//! Key layout of the notification namespace.
//!
//! ```text
//! {root}/notify/command/{command}/{recipient}   unicast command
//! {root}/notify/command/{command}               broadcast command
//! {root}/notify/revision                        watch checkpoint
//! ```
//!
//! The layout is shared with every other producer and consumer of the same
//! root, so it must not change.

pub(crate) const NOTIFY_SEGMENT: &str = "notify";
pub(crate) const COMMAND_SEGMENT: &str = "command";
pub(crate) const REVISION_SEGMENT: &str = "revision";

/// Builds store keys for one namespace root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPaths {
    root: String,
}

impl NotifyPaths {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Key addressed to a single recipient
    pub fn unicast(
        &self,
        command: &str,
        recipient: &str,
    ) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.root, NOTIFY_SEGMENT, COMMAND_SEGMENT, command, recipient
        )
    }

    /// Key shared by every watcher of `command`
    ///
    /// This key is a string prefix of every unicast key of the same command.
    /// Broadcast watchers therefore watch it as an exact key, never as a prefix.
    pub fn broadcast(
        &self,
        command: &str,
    ) -> String {
        format!("{}/{}/{}/{}", self.root, NOTIFY_SEGMENT, COMMAND_SEGMENT, command)
    }

    /// Key holding the next revision a dispatcher should watch from
    pub fn revision(&self) -> String {
        format!("{}/{}/{}", self.root, NOTIFY_SEGMENT, REVISION_SEGMENT)
    }
}
