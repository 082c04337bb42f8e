//! Outgoing-request bookkeeping.

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use fluxmcp_protocol::{ProgressToken, RequestId};

use crate::error::{SessionError, SessionResult};

/// One locally-issued request awaiting its reply.
///
/// Created when a caller issues a request and destroyed exactly once: when
/// the matching response or error arrives, when the caller cancels, or when
/// the session tears down.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub(crate) method: String,
    pub(crate) completer: oneshot::Sender<SessionResult<Value>>,
    pub(crate) progress_token: Option<ProgressToken>,
}

/// Map of outstanding request ids to their completers.
#[derive(Debug)]
pub(crate) struct PendingMap {
    entries: DashMap<RequestId, PendingRequest>,
    limit: usize,
}

impl PendingMap {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            entries: DashMap::new(),
            limit,
        }
    }

    /// Record a pending request, enforcing the outstanding-request bound.
    pub(crate) fn insert(
        &self,
        id: RequestId,
        pending: PendingRequest,
    ) -> SessionResult<()> {
        if self.entries.len() >= self.limit {
            return Err(SessionError::PendingLimitReached(self.limit));
        }
        self.entries.insert(id, pending);
        Ok(())
    }

    /// Complete and retire a pending request.
    ///
    /// Returns the retired entry's progress token so the caller can drop
    /// its sink registration, or `None` when the id is unknown (duplicate
    /// or stray response).
    pub(crate) fn complete(
        &self,
        id: &RequestId,
        outcome: SessionResult<Value>,
    ) -> Option<Option<ProgressToken>> {
        let (_, pending) = self.entries.remove(id)?;
        // The caller may have stopped waiting; a dropped receiver is fine.
        let _ = pending.completer.send(outcome);
        Some(pending.progress_token)
    }

    /// Remove an entry without completing it (cancellation path; the caller
    /// already owns the outcome).
    pub(crate) fn discard(&self, id: &RequestId) -> Option<PendingRequest> {
        self.entries.remove(id).map(|(_, pending)| pending)
    }

    /// Fail every outstanding request with `TransportClosed`.
    ///
    /// Returns the progress tokens of the retired entries.
    pub(crate) fn fail_all_closed(&self) -> Vec<ProgressToken> {
        let ids: Vec<RequestId> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut tokens = Vec::new();
        for id in ids {
            if let Some((_, pending)) = self.entries.remove(&id) {
                tracing::debug!(id = %id, method = %pending.method, "failing pending request: transport closed");
                let _ = pending.completer.send(Err(SessionError::TransportClosed));
                if let Some(token) = pending.progress_token {
                    tokens.push(token);
                }
            }
        }
        tokens
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(method: &str) -> (PendingRequest, oneshot::Receiver<SessionResult<Value>>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingRequest {
                method: method.to_string(),
                completer: tx,
                progress_token: None,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn complete_retires_exactly_once() {
        let map = PendingMap::new(16);
        let (pending, rx) = entry("a");
        map.insert(RequestId::Number(1), pending).unwrap();

        assert!(map.complete(&RequestId::Number(1), Ok(json!(1))).is_some());
        // A duplicate response for a retired id is unknown.
        assert!(map.complete(&RequestId::Number(1), Ok(json!(2))).is_none());
        assert_eq!(rx.await.unwrap().unwrap(), json!(1));
    }

    #[tokio::test]
    async fn fail_all_reaches_every_waiter() {
        let map = PendingMap::new(16);
        let (p1, rx1) = entry("a");
        let (p2, rx2) = entry("b");
        map.insert(RequestId::Number(1), p1).unwrap();
        map.insert(RequestId::Number(2), p2).unwrap();

        map.fail_all_closed();
        assert!(matches!(rx1.await.unwrap(), Err(SessionError::TransportClosed)));
        assert!(matches!(rx2.await.unwrap(), Err(SessionError::TransportClosed)));
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn limit_is_enforced() {
        let map = PendingMap::new(1);
        let (p1, _rx1) = entry("a");
        let (p2, _rx2) = entry("b");
        map.insert(RequestId::Number(1), p1).unwrap();
        let err = map.insert(RequestId::Number(2), p2).unwrap_err();
        assert!(matches!(err, SessionError::PendingLimitReached(1)));
    }
}
