//! Hooks notified after each durable transition.
//!
//! Observers see a transition only once it is committed. Their failures are
//! logged and dropped; they never affect the run.

use crate::store::TransitionRecord;

/// Receives every committed transition.
pub trait TransitionObserver: Send + Sync {
    fn on_transition(&self, transition: &TransitionRecord) -> anyhow::Result<()>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl TransitionObserver for NoopObserver {
    fn on_transition(&self, _transition: &TransitionRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Emits one structured `tracing` event per transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl TransitionObserver for TracingObserver {
    fn on_transition(&self, t: &TransitionRecord) -> anyhow::Result<()> {
        tracing::info!(
            run_id = %t.run_id,
            seq = t.seq,
            node = %t.node,
            from = %t.from_state,
            to = %t.to_state,
            attempts = t.attempts,
            reason = %t.reason,
            "flow transition"
        );
        Ok(())
    }
}

/// Notify an observer, logging and discarding its error.
pub(crate) fn notify(observer: &dyn TransitionObserver, transition: &TransitionRecord) {
    if let Err(e) = observer.on_transition(transition) {
        tracing::warn!(
            run_id = %transition.run_id,
            seq = transition.seq,
            error = %e,
            "transition observer failed"
        );
    }
}
