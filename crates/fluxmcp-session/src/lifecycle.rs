//! Session lifecycle state machine.

use tokio::sync::watch;

/// Lifecycle states of a session.
///
/// `Created → Connecting → HandshakePending → Ready → Disposing → Disposed`.
/// Disposal can begin from any state and is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Constructed, dispatch loop not yet running
    Created,
    /// Transport starting
    Connecting,
    /// Connected, initialize exchange in progress
    HandshakePending,
    /// Handshake complete; normal traffic flows
    Ready,
    /// Teardown in progress
    Disposing,
    /// Fully quiesced
    Disposed,
}

/// Shared, watchable lifecycle cell.
///
/// Transitions only move forward; `begin_disposing` is the serialization
/// point for teardown and returns `true` to exactly one caller.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<SessionState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::Created);
        Self { tx }
    }

    pub(crate) fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// Advance to `next` if it is a forward transition short of disposal.
    pub(crate) fn advance(&self, next: SessionState) -> bool {
        debug_assert!(next < SessionState::Disposing);
        self.tx.send_if_modified(|state| {
            if *state < next {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    /// Enter `Disposing`. Returns `true` for the caller that won the
    /// transition; later callers should wait for `Disposed` instead.
    pub(crate) fn begin_disposing(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state < SessionState::Disposing {
                *state = SessionState::Disposing;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn set_disposed(&self) {
        self.tx.send_if_modified(|state| {
            if *state != SessionState::Disposed {
                *state = SessionState::Disposed;
                true
            } else {
                false
            }
        });
    }

    /// Wait until the session reaches at least `target`.
    pub(crate) async fn wait_for(&self, target: SessionState) {
        let mut rx = self.tx.subscribe();
        // wait_for returns immediately when the predicate already holds.
        let _ = rx.wait_for(|state| *state >= target).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_move_forward() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), SessionState::Created);
        assert!(cell.advance(SessionState::Connecting));
        assert!(cell.advance(SessionState::HandshakePending));
        assert!(!cell.advance(SessionState::Connecting));
        assert_eq!(cell.get(), SessionState::HandshakePending);
    }

    #[test]
    fn disposal_is_won_once() {
        let cell = StateCell::new();
        assert!(cell.begin_disposing());
        assert!(!cell.begin_disposing());
        cell.set_disposed();
        assert_eq!(cell.get(), SessionState::Disposed);
        // Forward transitions are refused after disposal began.
        assert!(!cell.advance(SessionState::Ready));
    }

    #[tokio::test]
    async fn waiters_observe_disposal() {
        let cell = std::sync::Arc::new(StateCell::new());
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait_for(SessionState::Disposed).await })
        };
        cell.begin_disposing();
        cell.set_disposed();
        waiter.await.unwrap();
    }
}
