use lazy_static::lazy_static;
use prometheus::IntCounterVec;
use prometheus::Opts;
use prometheus::Registry;


pub(crate) const KIND_UNICAST: &str = "unicast";
pub(crate) const KIND_BROADCAST: &str = "broadcast";

lazy_static! {
    /// Commands written, labelled by `kind` (unicast | broadcast)
    pub static ref COMMANDS_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("commands_sent", "commands written to the store"),
        &["kind"]
    )
    .expect("metric can not be created");

    /// Commands handed to a caller, by one-shot read or dispatcher handler
    pub static ref COMMANDS_DELIVERED: IntCounterVec = IntCounterVec::new(
        Opts::new("commands_delivered", "commands handed to a handler or reader"),
        &["kind"]
    )
    .expect("metric can not be created");

    /// Best-effort deletes that failed after delivery
    pub static ref CLEANUP_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("cleanup_failures", "post-delivery deletes that failed"),
        &["kind"]
    )
    .expect("metric can not be created");

    /// Checkpoint writes that failed after exhausting retries
    pub static ref CHECKPOINT_PERSIST_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("checkpoint_persist_failures", "checkpoint writes that failed"),
        &["root"]
    )
    .expect("metric can not be created");
}

/// Registers every notification metric with `registry`
pub fn register_custom_metrics(registry: &Registry) -> prometheus::Result<()> {
    registry.register(Box::new(COMMANDS_SENT.clone()))?;
    registry.register(Box::new(COMMANDS_DELIVERED.clone()))?;
    registry.register(Box::new(CLEANUP_FAILURES.clone()))?;
    registry.register(Box::new(CHECKPOINT_PERSIST_FAILURES.clone()))?;
    Ok(())
}
