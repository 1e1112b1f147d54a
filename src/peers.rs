use crate::types::RequiredBehaviour;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandshakeState {
    #[default]
    None,
    PendingAck,
    Acknowledged,
}

/// Where a peer stands in the registration lifecycle. Derived, never stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerStatus {
    /// Invitation issued, first registration not yet received.
    Unregistered,
    Registered,
    HandshakePending,
    Acknowledged,
    Offline,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    /// No heartbeat received yet.
    Unknown,
    Online,
    Offline,
}

/// Persisted state of one counterpart, keyed by the token it presents to us.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
    pub local_token: String,
    pub remote_token: String,
    pub base_url: String,
    pub negotiated_version: String,
    #[serde(default)]
    pub group_ids: BTreeSet<String>,
    #[serde(default)]
    pub handshake_state: HandshakeState,
    #[serde(default)]
    pub required_behavior: Option<RequiredBehaviour>,
    #[serde(default)]
    pub next_heartbeat_due_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub peer_declared_offline_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pending_outbound_register: bool,
    /// Request id of the inbound registration the pending outbound register answers.
    #[serde(default)]
    pub register_correlation_id: Option<String>,
}

impl PeerRecord {
    /// A record holding nothing but a bootstrap token handed out of band.
    pub fn invitation(local_token: impl Into<String>) -> Self {
        Self::new(local_token, String::new(), String::new(), String::new())
    }

    pub fn new(
        local_token: impl Into<String>,
        remote_token: impl Into<String>,
        base_url: impl Into<String>,
        negotiated_version: impl Into<String>,
    ) -> Self {
        Self {
            local_token: local_token.into(),
            remote_token: remote_token.into(),
            base_url: base_url.into(),
            negotiated_version: negotiated_version.into(),
            group_ids: BTreeSet::new(),
            handshake_state: HandshakeState::None,
            required_behavior: None,
            next_heartbeat_due_at: None,
            peer_declared_offline_at: None,
            pending_outbound_register: false,
            register_correlation_id: None,
        }
    }

    pub fn is_registered(&self) -> bool {
        !self.base_url.is_empty()
    }

    pub fn heartbeat_interval(&self) -> Option<u64> {
        self.required_behavior
            .as_ref()
            .and_then(RequiredBehaviour::heartbeat_interval)
    }

    pub fn heartbeat_due(&self, now: DateTime<Utc>) -> bool {
        self.heartbeat_interval().is_some()
            && self.next_heartbeat_due_at.map_or(true, |due| due <= now)
    }

    /// Moves `next_heartbeat_due_at` forward, never back.
    pub fn advance_heartbeat(&mut self, due: DateTime<Utc>) {
        self.next_heartbeat_due_at = Some(match self.next_heartbeat_due_at {
            Some(current) if current > due => current,
            _ => due,
        });
    }

    pub fn liveness(&self, now: DateTime<Utc>) -> Liveness {
        match self.peer_declared_offline_at {
            None => Liveness::Unknown,
            Some(offline_at) if now > offline_at => Liveness::Offline,
            Some(_) => Liveness::Online,
        }
    }

    pub fn status(&self, now: DateTime<Utc>) -> PeerStatus {
        if !self.is_registered() {
            return PeerStatus::Unregistered;
        }
        if self.liveness(now) == Liveness::Offline {
            return PeerStatus::Offline;
        }
        match self.handshake_state {
            HandshakeState::None => PeerStatus::Registered,
            HandshakeState::PendingAck => PeerStatus::HandshakePending,
            HandshakeState::Acknowledged => PeerStatus::Acknowledged,
        }
    }

    /// Identifies the peer in logs without exposing its credential.
    pub fn label(&self) -> String {
        let url = if self.is_registered() {
            self.base_url.as_str()
        } else {
            "<invited>"
        };
        format!("{} ({})", url, short_token(&self.local_token))
    }
}

pub fn short_token(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    format!("{}…", prefix)
}
