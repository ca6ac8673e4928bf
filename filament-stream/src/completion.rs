//! Resettable, generation-counted completion source.
//!
//! A single-slot awaitable signal connecting an engine event to a suspended
//! consumer call. The slot is completed exactly once per generation, then
//! consumed by the waiter, which resets it for the next logical operation on
//! the same stream without allocating a new primitive per operation.
//!
//! The completer and the waiter may run on arbitrary threads, and completion
//! may land before the waiter suspends; the outcome is stored and the wait
//! returns immediately.

use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;

use crate::error::StreamError;

/// Token identifying one generation of a [`Completion`] slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation(u64);

struct Slot<T> {
    generation: u64,
    outcome: Option<Result<T, StreamError>>,
}

/// Single-slot, resettable completion source.
pub struct Completion<T> {
    slot: Mutex<Slot<T>>,
    notify: Notify,
}

impl<T> Completion<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                generation: 0,
                outcome: None,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Observe the current generation.
    ///
    /// The returned token stays valid until the outcome for this generation
    /// is consumed by [`wait`](Self::wait).
    pub fn arm(&self) -> Generation {
        Generation(self.lock().generation)
    }

    /// Complete the current generation with a success value.
    ///
    /// Panics if the current generation was already completed: under the
    /// first-writer-wins protocol exactly one actor signals per generation,
    /// so a second signal is a state-machine bug worth surfacing loudly.
    pub fn complete(&self, value: T) {
        self.finish(Ok(value));
    }

    /// Complete the current generation with an error.
    pub fn complete_err(&self, err: StreamError) {
        self.finish(Err(err));
    }

    /// Complete the current generation with an error only if nothing has
    /// been stored yet.
    ///
    /// Used by dispose, which legitimately races a natural completion that
    /// may already have stored its outcome; unlike
    /// [`complete_err`](Self::complete_err) this never treats the race as a
    /// bug.
    pub fn poison(&self, err: StreamError) {
        {
            let mut slot = self.lock();
            if slot.outcome.is_some() {
                return;
            }
            slot.outcome = Some(Err(err));
        }
        self.notify.notify_one();
    }

    fn finish(&self, outcome: Result<T, StreamError>) {
        {
            let mut slot = self.lock();
            assert!(
                slot.outcome.is_none(),
                "completion source signaled twice for one generation"
            );
            slot.outcome = Some(outcome);
        }
        self.notify.notify_one();
    }

    /// Suspend until the generation identified by `token` is completed, then
    /// return its outcome and advance to the next generation.
    ///
    /// Cancel-safe: dropping the returned future leaves a stored outcome in
    /// place for a subsequent `wait` with the same token.
    pub async fn wait(&self, token: Generation) -> Result<T, StreamError> {
        loop {
            // Register interest before inspecting the slot so a completion
            // landing in between still wakes us.
            let notified = self.notify.notified();
            {
                let mut slot = self.lock();
                if slot.generation != token.0 {
                    return Err(StreamError::StaleCompletion);
                }
                if let Some(outcome) = slot.outcome.take() {
                    slot.generation = slot.generation.wrapping_add(1);
                    return outcome;
                }
            }
            notified.await;
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn complete_before_wait_returns_immediately() {
        let source = Completion::new();
        let token = source.arm();
        source.complete(7u64);
        assert_eq!(source.wait(token).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn wait_suspends_until_completed_from_another_task() {
        let source = Arc::new(Completion::new());
        let token = source.arm();

        let completer = Arc::clone(&source);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            completer.complete(42u64);
        });

        assert_eq!(source.wait(token).await.unwrap(), 42);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn generation_advances_after_consume() {
        let source = Completion::new();

        let first = source.arm();
        source.complete(1u64);
        assert_eq!(source.wait(first).await.unwrap(), 1);

        let second = source.arm();
        assert_ne!(first, second);
        source.complete(2u64);
        assert_eq!(source.wait(second).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn stale_token_fails_instead_of_hanging() {
        let source = Completion::new();
        let stale = source.arm();
        source.complete(1u64);
        assert_eq!(source.wait(stale).await.unwrap(), 1);

        // The token now references a retired generation.
        assert!(matches!(
            source.wait(stale).await,
            Err(StreamError::StaleCompletion)
        ));
    }

    #[tokio::test]
    async fn error_outcome_is_propagated() {
        let source: Completion<u64> = Completion::new();
        let token = source.arm();
        source.complete_err(StreamError::Canceled);
        assert!(matches!(source.wait(token).await, Err(StreamError::Canceled)));
    }

    #[test]
    #[should_panic(expected = "signaled twice")]
    fn double_complete_panics() {
        let source = Completion::new();
        source.complete(1u64);
        source.complete(2u64);
    }
}
