//! Workflow storage trait definition.
//!
//! Defines the durable state behind the engine: instances, the append-only
//! history log, signals and timers. The infrastructure layer (strand-infra)
//! implements this trait with SQLite persistence.

use chrono::{DateTime, Utc};
use strand_types::error::RepositoryError;
use strand_types::workflow::{
    HistoryEvent, InstanceStatus, Signal, StatusUpdate, Timer, WorkflowInstance,
};
use uuid::Uuid;

/// Storage trait for workflow instances, history, signals and timers.
///
/// Covers four entity families:
/// - **Instances:** create/read plus status-guarded transitions (the claim).
/// - **History:** sequence-checked, append-only event log per instance.
/// - **Signals:** externally delivered events, consumed at most once.
/// - **Timers:** wake-ups for sleeping or timing-out instances.
///
/// Every mutation is atomic per instance: two runners racing on the same
/// instance can never both claim it, and an append with a stale sequence
/// fails with `RepositoryError::Conflict`.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Insert a new instance. Fails with `Conflict` if the ID exists.
    fn create_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_instance(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// List instances, newest first, optionally filtered by status.
    fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    /// Set the status and the accompanying fields unconditionally.
    ///
    /// Sets `completed_at` when `status` is terminal. Fails with `NotFound`
    /// for an unknown instance.
    fn update_instance_status(
        &self,
        id: &Uuid,
        status: InstanceStatus,
        update: &StatusUpdate,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Move the instance to `to` only if its current status is one of `from`.
    ///
    /// Returns whether the transition applied. This is the claim that
    /// serializes concurrent resumptions.
    fn transition_status(
        &self,
        id: &Uuid,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Record a cancellation request on a non-terminal instance.
    ///
    /// Returns `false` if the instance is already terminal.
    fn request_cancel(
        &self,
        id: &Uuid,
        reason: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    /// All events of an instance ordered by sequence.
    fn get_events(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<HistoryEvent>, RepositoryError>> + Send;

    /// Atomically append a contiguous batch of events.
    ///
    /// The first event must carry `last_sequence + 1` and the batch must
    /// increase by one; otherwise nothing is written and `Conflict` is
    /// returned.
    fn append_events(
        &self,
        instance_id: &Uuid,
        events: &[HistoryEvent],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Signals
    // -----------------------------------------------------------------------

    fn save_signal(
        &self,
        signal: &Signal,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Unprocessed signals for an instance and event name, oldest first.
    fn get_pending_signals(
        &self,
        instance_id: &Uuid,
        event_name: &str,
    ) -> impl std::future::Future<Output = Result<Vec<Signal>, RepositoryError>> + Send;

    /// Mark a signal consumed. Returns `false` if it was already processed.
    fn mark_signal_processed(
        &self,
        signal_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// The oldest `Suspended` instance waiting on `event_name` and/or `token`.
    ///
    /// At least one of the two filters must be given.
    fn find_waiting_instance(
        &self,
        event_name: Option<&str>,
        token: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    fn create_timer(
        &self,
        timer: &Timer,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Timers with `fire_at <= now`, earliest first, at most `limit`.
    fn get_due_timers(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Timer>, RepositoryError>> + Send;

    /// Delete one timer. Returns `true` if it existed.
    fn delete_timer(
        &self,
        timer_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Delete every timer of an instance (used when it terminates).
    fn delete_timers_for_instance(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}

/// Validate that `events` continue a log whose last sequence is `last`.
///
/// Shared by every store implementation so the conflict rule is identical.
pub fn check_append_sequence(last: u64, events: &[HistoryEvent]) -> Result<(), RepositoryError> {
    let mut expected = last + 1;
    for event in events {
        if event.sequence != expected {
            return Err(RepositoryError::Conflict(format!(
                "sequence {expected} expected, got {}",
                event.sequence
            )));
        }
        expected += 1;
    }
    Ok(())
}
