//! Distributed (multi-node) session routing.
//!
//! An optional layer above the transport keeps a shared
//! `session id → owner node` map with TTL. Each request is handled locally
//! when this node owns (or can claim) the session, reverse-proxied to the
//! owner otherwise, and rejected with 404 when the owner record is stale so
//! the client re-initializes.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response as AxumResponse};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::session::SESSION_ID_HEADER;

/// Fault from the shared cache. Tolerated: the caller proceeds as if the
/// cache were empty and retries ownership on the next request.
#[derive(Debug, Clone, Error)]
#[error("session cache unavailable: {0}")]
pub struct CacheFault(pub String);

/// Outcome of an atomic claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This node now owns the session
    Claimed,
    /// Another node already owns it
    OwnedBy(String),
}

/// One owner record.
#[derive(Debug, Clone)]
pub struct OwnerRecord {
    /// Owner node id (`name#generation`)
    pub owner: String,
    /// Last time the owner touched the record
    pub last_seen: SystemTime,
}

/// Shared session-owner map contract.
///
/// `claim` must be an atomic compare-and-set; `remove` is best-effort.
#[async_trait]
pub trait SessionOwnerCache: Send + Sync {
    /// Current owner of a session, if any.
    async fn get(&self, session_id: &str) -> Result<Option<OwnerRecord>, CacheFault>;

    /// Atomically claim an unowned session.
    async fn claim(
        &self,
        session_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<ClaimOutcome, CacheFault>;

    /// Drop a session record. Failure is logged, never fatal.
    async fn remove(&self, session_id: &str);
}

/// In-process owner cache for tests and single-binary clusters.
#[derive(Debug, Default)]
pub struct InMemoryOwnerCache {
    entries: DashMap<String, (String, Instant)>,
}

impl InMemoryOwnerCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionOwnerCache for InMemoryOwnerCache {
    async fn get(&self, session_id: &str) -> Result<Option<OwnerRecord>, CacheFault> {
        let expired = match self.entries.get(session_id) {
            Some(entry) if entry.value().1 > Instant::now() => {
                return Ok(Some(OwnerRecord {
                    owner: entry.value().0.clone(),
                    last_seen: SystemTime::now(),
                }));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(session_id);
        }
        Ok(None)
    }

    async fn claim(
        &self,
        session_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<ClaimOutcome, CacheFault> {
        let deadline = Instant::now() + ttl;
        let mut outcome = ClaimOutcome::Claimed;
        self.entries
            .entry(session_id.to_string())
            .and_modify(|entry| {
                if entry.1 > Instant::now() && entry.0 != owner {
                    outcome = ClaimOutcome::OwnedBy(entry.0.clone());
                } else {
                    *entry = (owner.to_string(), deadline);
                }
            })
            .or_insert_with(|| (owner.to_string(), deadline));
        Ok(outcome)
    }

    async fn remove(&self, session_id: &str) {
        self.entries.remove(session_id);
    }
}

/// Identity of this node: a stable name plus a per-process generation, so
/// a restarted node can detect its own stale ownership records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeId {
    /// Stable node name (host, pod, ...)
    pub name: String,
    /// Process generation, fresh on every start
    pub generation: Uuid,
}

impl NodeId {
    /// Create an identity with a fresh generation.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            generation: Uuid::new_v4(),
        }
    }

    /// The wire form stored in the owner cache.
    pub fn as_owner_id(&self) -> String {
        format!("{}#{}", self.name, self.generation.simple())
    }

    fn name_of(owner_id: &str) -> &str {
        owner_id.split_once('#').map_or(owner_id, |(name, _)| name)
    }
}

/// Where a request for a session should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Handle on this node
    Local,
    /// Reverse-proxy to the owner's base URL
    Forward(String),
    /// Record was stale and has been evicted; answer 404
    Expired,
}

/// Resolves an owner id to the node's base URL (`http://host:port`).
pub type OwnerResolver = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// The distributed routing layer.
pub struct DistributedSessions {
    cache: Arc<dyn SessionOwnerCache>,
    node: NodeId,
    resolver: OwnerResolver,
    http: reqwest::Client,
    ttl: Duration,
}

impl std::fmt::Debug for DistributedSessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedSessions")
            .field("node", &self.node)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl DistributedSessions {
    /// Create the layer.
    pub fn new(
        cache: Arc<dyn SessionOwnerCache>,
        node: NodeId,
        resolver: OwnerResolver,
        ttl: Duration,
    ) -> Self {
        Self {
            cache,
            node,
            resolver,
            http: reqwest::Client::new(),
            ttl,
        }
    }

    /// This node's owner id.
    pub fn owner_id(&self) -> String {
        self.node.as_owner_id()
    }

    /// Claim a freshly-minted session for this node, best-effort.
    pub(crate) async fn claim_new(&self, session_id: &str) {
        match self.cache.claim(session_id, &self.owner_id(), self.ttl).await {
            Ok(ClaimOutcome::Claimed) => {}
            Ok(ClaimOutcome::OwnedBy(other)) => {
                warn!(session_id, other, "freshly minted session id already claimed");
            }
            Err(fault) => warn!(%fault, "owner cache unavailable while claiming"),
        }
    }

    /// Release a session record, best-effort.
    pub(crate) async fn release(&self, session_id: &str) {
        self.cache.remove(session_id).await;
    }

    /// Decide where a request bearing `session_id` should be handled.
    pub async fn route(&self, session_id: &str) -> RouteDecision {
        let owner = match self.cache.get(session_id).await {
            Ok(Some(record)) => Some(record.owner),
            Ok(None) => None,
            Err(fault) => {
                // Cache faults are tolerated: proceed without it.
                warn!(%fault, "owner cache unavailable; handling locally");
                return RouteDecision::Local;
            }
        };

        let owner = match owner {
            Some(owner) => owner,
            None => {
                match self.cache.claim(session_id, &self.owner_id(), self.ttl).await {
                    Ok(ClaimOutcome::Claimed) | Err(_) => return RouteDecision::Local,
                    Ok(ClaimOutcome::OwnedBy(other)) => other,
                }
            }
        };

        self.decide(session_id, &owner).await
    }

    async fn decide(&self, session_id: &str, owner: &str) -> RouteDecision {
        if owner == self.owner_id() {
            return RouteDecision::Local;
        }
        if NodeId::name_of(owner) == self.node.name {
            // Our name, another generation: a stale record from a previous
            // life of this node. Evict; the client re-initializes.
            debug!(session_id, owner, "evicting stale ownership record");
            self.cache.remove(session_id).await;
            return RouteDecision::Expired;
        }
        match (self.resolver)(owner) {
            Some(base_url) => RouteDecision::Forward(base_url),
            None => {
                debug!(session_id, owner, "owner not resolvable; evicting");
                self.cache.remove(session_id).await;
                RouteDecision::Expired
            }
        }
    }

    /// Reverse-proxy a request verbatim to the owner node.
    ///
    /// An upstream 404 evicts the session record and surfaces 404 to the
    /// caller, so the client re-initializes against the cluster.
    pub(crate) async fn forward(
        &self,
        base_url: &str,
        endpoint_path: &str,
        method: Method,
        headers: &HeaderMap,
        body: bytes::Bytes,
        session_id: &str,
    ) -> AxumResponse {
        let url = format!("{base_url}{endpoint_path}");
        let method = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
            Ok(method) => method,
            Err(_) => return StatusCode::BAD_GATEWAY.into_response(),
        };
        let mut request = self.http.request(method, &url).body(body);
        for name in ["accept", "content-type", SESSION_ID_HEADER, "last-event-id"] {
            if let Some(value) = headers.get(name)
                && let Ok(value) = value.to_str()
            {
                request = request.header(name, value);
            }
        }

        let upstream = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, url, "reverse proxy to session owner failed");
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };

        let status =
            StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        if status == StatusCode::NOT_FOUND {
            self.cache.remove(session_id).await;
            return StatusCode::NOT_FOUND.into_response();
        }

        let mut response_headers = HeaderMap::new();
        for name in [
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderName::from_static(SESSION_ID_HEADER),
        ] {
            if let Some(value) = upstream.headers().get(name.as_str())
                && let Ok(value) = axum::http::HeaderValue::from_bytes(value.as_bytes())
            {
                response_headers.insert(name, value);
            }
        }

        use futures::TryStreamExt;
        let body = Body::from_stream(
            upstream
                .bytes_stream()
                .map_err(|e| std::io::Error::other(e.to_string())),
        );
        (status, response_headers, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> OwnerResolver {
        Arc::new(|owner: &str| {
            NodeId::name_of(owner)
                .strip_prefix("node-")
                .map(|n| format!("http://127.0.0.1:{}", 9000 + n.parse::<u16>().unwrap_or(0)))
        })
    }

    fn layer(name: &str, cache: Arc<InMemoryOwnerCache>) -> DistributedSessions {
        DistributedSessions::new(cache, NodeId::new(name), resolver(), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn claim_is_first_writer_wins() {
        let cache = InMemoryOwnerCache::new();
        let a = cache.claim("s1", "node-1#aaa", Duration::from_secs(60)).await.unwrap();
        assert_eq!(a, ClaimOutcome::Claimed);
        let b = cache.claim("s1", "node-2#bbb", Duration::from_secs(60)).await.unwrap();
        assert_eq!(b, ClaimOutcome::OwnedBy("node-1#aaa".to_string()));
        // Re-claiming by the current owner refreshes the TTL.
        let again = cache.claim("s1", "node-1#aaa", Duration::from_secs(60)).await.unwrap();
        assert_eq!(again, ClaimOutcome::Claimed);
    }

    #[tokio::test]
    async fn expired_records_are_reclaimable() {
        let cache = InMemoryOwnerCache::new();
        cache.claim("s1", "node-1#aaa", Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get("s1").await.unwrap().is_none());
        let outcome = cache.claim("s1", "node-2#bbb", Duration::from_secs(60)).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Claimed);
    }

    #[tokio::test]
    async fn unowned_sessions_are_claimed_locally() {
        let cache = Arc::new(InMemoryOwnerCache::new());
        let layer = layer("node-1", Arc::clone(&cache));
        assert_eq!(layer.route("s1").await, RouteDecision::Local);
        // The claim is recorded.
        let record = cache.get("s1").await.unwrap().unwrap();
        assert_eq!(record.owner, layer.owner_id());
    }

    #[tokio::test]
    async fn foreign_owners_are_forwarded_to() {
        let cache = Arc::new(InMemoryOwnerCache::new());
        cache.claim("s1", "node-2#bbb", Duration::from_secs(60)).await.unwrap();
        let layer = layer("node-1", Arc::clone(&cache));
        assert_eq!(
            layer.route("s1").await,
            RouteDecision::Forward("http://127.0.0.1:9002".to_string())
        );
    }

    #[tokio::test]
    async fn stale_own_generation_is_evicted() {
        let cache = Arc::new(InMemoryOwnerCache::new());
        // A previous life of node-1 owned the session.
        cache
            .claim("s1", "node-1#deadbeef", Duration::from_secs(60))
            .await
            .unwrap();
        let layer = layer("node-1", Arc::clone(&cache));
        assert_eq!(layer.route("s1").await, RouteDecision::Expired);
        // The stale record is gone; a retry claims locally.
        assert!(cache.get("s1").await.unwrap().is_none());
        assert_eq!(layer.route("s1").await, RouteDecision::Local);
    }

    #[tokio::test]
    async fn unresolvable_owner_is_evicted() {
        let cache = Arc::new(InMemoryOwnerCache::new());
        cache.claim("s1", "mystery#ccc", Duration::from_secs(60)).await.unwrap();
        let layer = layer("node-1", Arc::clone(&cache));
        assert_eq!(layer.route("s1").await, RouteDecision::Expired);
    }
}
