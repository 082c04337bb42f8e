//! Initialize-exchange version policy and the negotiated peer view.

use fluxmcp_protocol::{
    Capabilities, Implementation, LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};

/// What the handshake learned about the peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Negotiated protocol version
    pub protocol_version: String,
    /// Peer capability descriptor, recorded verbatim
    pub capabilities: Capabilities,
    /// Peer implementation name/version
    pub implementation: Implementation,
}

/// Whether this endpoint speaks `version`.
pub(crate) fn supports_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

/// Version a responder answers with: the proposal when supported,
/// otherwise this endpoint's latest. An initiator that cannot accept the
/// answer tears the session down.
pub(crate) fn responder_version(proposed: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .find(|v| **v == proposed)
        .copied()
        .unwrap_or(LATEST_PROTOCOL_VERSION)
}
