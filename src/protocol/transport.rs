//! Transport seam between the scheduler and whatever carries requests to a
//! chassis manager.
//!
//! `dispatch` never blocks. The transport owns the `Completion` handed to it
//! and resolves it exactly once; a completion dropped without being resolved
//! reports `TransportError::Dropped`, so every dispatch produces one event.

use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::error::TransportError;

use super::{Request, Response};

/// Identifies the exchange a completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    /// Index of the CM unit in the scheduler
    pub unit: usize,
    /// Monotonic per-unit counter; stale generations are discarded
    pub generation: u64,
}

#[derive(Debug)]
pub struct CompletionEvent {
    pub tag: Tag,
    pub result: Result<Response, TransportError>,
}

/// One-shot handle a transport resolves when its exchange finishes.
#[derive(Debug)]
pub struct Completion {
    tag: Tag,
    tx: Option<UnboundedSender<CompletionEvent>>,
}

impl Completion {
    pub fn new(tag: Tag, tx: UnboundedSender<CompletionEvent>) -> Self {
        Self { tag, tx: Some(tx) }
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn complete(mut self, result: Result<Response, TransportError>) {
        self.send(result);
    }

    fn send(&mut self, result: Result<Response, TransportError>) {
        if let Some(tx) = self.tx.take() {
            if tx.send(CompletionEvent { tag: self.tag, result }).is_err() {
                // Scheduler already shut down
                warn!(unit = self.tag.unit, "completion receiver closed");
            }
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.send(Err(TransportError::Dropped));
    }
}

/// Carries requests to chassis managers.
pub trait Transport: Send + Sync {
    /// Start an exchange with the CM behind `tag.unit`. Must not block.
    fn dispatch(&self, request: Request, completion: Completion);
}

/// Remaining attempts for a write-class exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    attempts_left: u32,
}

impl RetryBudget {
    /// Budget for `attempts` total sends, the first one included.
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts_left: attempts.saturating_sub(1),
        }
    }

    /// Take one resend from the budget. Returns false once exhausted.
    pub fn spend(&mut self) -> bool {
        if self.attempts_left == 0 {
            return false;
        }
        self.attempts_left -= 1;
        true
    }

    #[cfg(test)]
    pub fn remaining(&self) -> u32 {
        self.attempts_left
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn test_retry_budget_counts_first_attempt() {
        let mut budget = RetryBudget::new(5);
        let mut resends = 0;
        while budget.spend() {
            resends += 1;
        }
        assert_eq!(resends, 4);
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn test_completion_delivers_once() {
        let (tx, mut rx) = unbounded_channel();
        let tag = Tag { unit: 2, generation: 7 };
        Completion::new(tag, tx).complete(Ok(Response::ok(vec![1])));

        let event = rx.try_recv().expect("event delivered");
        assert_eq!(event.tag, tag);
        assert_eq!(event.result.expect("ok").data, vec![1]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_completion_reports_failure() {
        let (tx, mut rx) = unbounded_channel();
        let tag = Tag { unit: 0, generation: 1 };
        drop(Completion::new(tag, tx));

        let event = rx.try_recv().expect("event delivered");
        assert!(matches!(event.result, Err(TransportError::Dropped)));
    }
}
