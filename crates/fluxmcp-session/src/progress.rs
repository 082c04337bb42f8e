//! Progress-token minting and sink routing.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;

use fluxmcp_protocol::{ProgressParams, ProgressToken};

/// Callback invoked for each progress update on an outgoing request.
///
/// Sinks are best-effort and must not block; they run on the session's
/// dispatch task.
pub type ProgressSink = Arc<dyn Fn(ProgressParams) + Send + Sync>;

/// Session-scoped map of progress tokens to sinks.
#[derive(Default)]
pub(crate) struct ProgressRouter {
    sinks: DashMap<ProgressToken, ProgressSink>,
    next_token: AtomicI64,
}

impl std::fmt::Debug for ProgressRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressRouter")
            .field("registered", &self.sinks.len())
            .finish()
    }
}

impl ProgressRouter {
    pub(crate) fn new() -> Self {
        Self {
            sinks: DashMap::new(),
            next_token: AtomicI64::new(1),
        }
    }

    /// Mint a token distinct from every other token this session minted.
    pub(crate) fn mint(&self) -> ProgressToken {
        ProgressToken::Number(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn register(&self, token: ProgressToken, sink: ProgressSink) {
        self.sinks.insert(token, sink);
    }

    pub(crate) fn deregister(&self, token: &ProgressToken) {
        self.sinks.remove(token);
    }

    /// Forward an update to its sink. Returns `false` when no sink is
    /// registered for the token (the update is silently dropped).
    pub(crate) fn route(&self, params: ProgressParams) -> bool {
        match self.sinks.get(&params.progress_token) {
            Some(sink) => {
                sink(params);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn update(token: &ProgressToken, progress: f64) -> ProgressParams {
        ProgressParams {
            progress_token: token.clone(),
            progress,
            total: None,
            message: None,
        }
    }

    #[test]
    fn routes_to_registered_sink_until_deregistered() {
        let router = ProgressRouter::new();
        let token = ProgressToken::from("tok-A");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        router.register(
            token.clone(),
            Arc::new(move |p| sink_seen.lock().unwrap().push(p.progress)),
        );

        assert!(router.route(update(&token, 0.25)));
        assert!(router.route(update(&token, 0.5)));
        router.deregister(&token);
        // Late update after deregistration is dropped.
        assert!(!router.route(update(&token, 0.75)));

        assert_eq!(seen.lock().unwrap().as_slice(), &[0.25, 0.5]);
    }

    #[test]
    fn minted_tokens_are_unique() {
        let router = ProgressRouter::new();
        let a = router.mint();
        let b = router.mint();
        assert_ne!(a, b);
    }

    #[test]
    fn unknown_tokens_drop_silently() {
        let router = ProgressRouter::new();
        assert!(!router.route(update(&ProgressToken::from("nope"), 1.0)));
    }
}
