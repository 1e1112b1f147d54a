//! Registration, handshake and heartbeat handling for inbound calls.
//!
//! Every inbound operation starts at the access guard, and every record it
//! touches is located by the token the guard returns.

use crate::auth::authorize;
use crate::error::RegistrationError;
use crate::peers::{HandshakeState, Liveness, PeerRecord};
use crate::registry::Registry;
use crate::store::StoreError;
use crate::token;
use crate::types::{
    parse_heartbeat_time, ConnectTarget, HandshakeAckPayload, HandshakePayload,
    HeartbeatPayload, RegisterPayload, RequestContext, VersionUrl,
};
use crate::version::negotiate;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// Initiating registration: the credential was retired and this token
    /// issued in its place; the scheduler owes the peer a register call.
    Issued { local_token: String },
    /// Reply to our own register call: the record was updated in place.
    Updated { local_token: String },
}

/// Tokens minted by [`RegistrationManager::bootstrap`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bootstrap {
    /// Invitations to hand to new peers out of band.
    pub invitations: Vec<String>,
    /// Our tokens for the registrations queued with targets.
    pub connections: Vec<String>,
}

pub struct RegistrationManager {
    registry: Arc<Registry>,
    version_urls: Vec<VersionUrl>,
}

impl RegistrationManager {
    pub fn new(registry: Arc<Registry>, version_urls: Vec<VersionUrl>) -> Self {
        Self {
            registry,
            version_urls,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn version_urls(&self) -> &[VersionUrl] {
        &self.version_urls
    }

    /// Mint a bootstrap token to hand to a new peer out of band.
    pub fn invite(&self) -> Result<String, StoreError> {
        let local_token = token::mint();
        self.registry.insert(PeerRecord::invitation(&local_token))?;
        info!("Issued invitation {}", crate::peers::short_token(&local_token));
        Ok(local_token)
    }

    /// Start registering with a peer whose token we received out of band.
    pub fn connect(
        &self,
        remote_token: &str,
        offered: &[VersionUrl],
    ) -> Result<String, RegistrationError> {
        let negotiated = negotiate(&self.version_urls, offered)?;
        let mut record = PeerRecord::new(
            token::mint(),
            remote_token,
            negotiated.base_url,
            negotiated.version,
        );
        record.pending_outbound_register = true;
        let local_token = record.local_token.clone();
        info!("Queued registration with {}", record.label());
        self.registry.insert(record)?;
        Ok(local_token)
    }

    /// Onboard peers into the live registry at startup.
    ///
    /// Mints `invitations` bootstrap tokens and queues a registration with
    /// every target. A target whose token is already on record is skipped,
    /// so restarting with the same arguments does not register twice.
    pub fn bootstrap(
        &self,
        invitations: usize,
        targets: &[ConnectTarget],
    ) -> Result<Bootstrap, RegistrationError> {
        let mut done = Bootstrap::default();
        for _ in 0..invitations {
            done.invitations.push(self.invite()?);
        }

        let mut known: HashSet<String> = self
            .registry
            .snapshot()?
            .into_iter()
            .map(|record| record.remote_token)
            .collect();
        for target in targets {
            if !known.insert(target.token.clone()) {
                info!(
                    "Already registering with {}, skipping",
                    target.version_url.base_url
                );
                continue;
            }
            let offered = std::slice::from_ref(&target.version_url);
            let local_token = self.connect(&target.token, offered)?;
            done.connections.push(local_token);
        }
        Ok(done)
    }

    pub fn register(
        &self,
        ctx: &RequestContext,
        payload: RegisterPayload,
    ) -> Result<RegisterOutcome, RegistrationError> {
        let token = authorize(&self.registry, ctx.credential.as_deref())?;
        let negotiated = negotiate(&self.version_urls, &payload.version_url)?;

        if ctx.correlation_id.is_some() {
            // A reply never triggers another outbound register.
            let label = self.registry.update(&token, |record| {
                record.remote_token = payload.token;
                record.base_url = negotiated.base_url;
                record.negotiated_version = negotiated.version;
                record.pending_outbound_register = false;
                record.register_correlation_id = None;
                record.label()
            })?;
            info!("Registration with {} confirmed", label);
            return Ok(RegisterOutcome::Updated { local_token: token });
        }

        let local_token = token::mint();
        let record = self.registry.replace(&token, |old| {
            let mut record = PeerRecord::new(
                &local_token,
                payload.token,
                negotiated.base_url,
                negotiated.version,
            );
            record.group_ids = old.group_ids;
            record.pending_outbound_register = true;
            record.register_correlation_id = ctx.request_id.clone();
            record
        })?;
        info!(
            "Registered {} on version {}, retired {}",
            record.label(),
            record.negotiated_version,
            crate::peers::short_token(&token)
        );
        Ok(RegisterOutcome::Issued { local_token })
    }

    /// Re-negotiate and overwrite the peer's endpoint; handshake and
    /// heartbeat state are kept.
    pub fn update(
        &self,
        ctx: &RequestContext,
        payload: RegisterPayload,
    ) -> Result<(), RegistrationError> {
        let token = authorize(&self.registry, ctx.credential.as_deref())?;
        let negotiated = negotiate(&self.version_urls, &payload.version_url)?;
        let label = self.registry.update(&token, |record| {
            record.remote_token = payload.token;
            record.base_url = negotiated.base_url;
            record.negotiated_version = negotiated.version;
            record.label()
        })?;
        info!("Updated endpoint for {}", label);
        Ok(())
    }

    pub fn unregister(&self, ctx: &RequestContext) -> Result<(), RegistrationError> {
        let token = authorize(&self.registry, ctx.credential.as_deref())?;
        let record = self.registry.remove(&token)?;
        info!("Unregistered {}. Goodbye", record.label());
        Ok(())
    }

    pub fn handshake(
        &self,
        ctx: &RequestContext,
        payload: HandshakePayload,
    ) -> Result<(), RegistrationError> {
        let token = authorize(&self.registry, ctx.credential.as_deref())?;
        let label = self.registry.update(&token, |record| {
            record.required_behavior = Some(payload.required_behaviour);
            record.handshake_state = HandshakeState::PendingAck;
            record.label()
        })?;
        info!("Handshake request from {}", label);
        Ok(())
    }

    pub fn handshake_ack(
        &self,
        ctx: &RequestContext,
        payload: HandshakeAckPayload,
    ) -> Result<(), RegistrationError> {
        let token = authorize(&self.registry, ctx.credential.as_deref())?;
        let label = self.registry.update(&token, |record| {
            if let Some(behaviour) = payload.required_behaviour {
                record.required_behavior = Some(behaviour);
            }
            record.handshake_state = HandshakeState::Acknowledged;
            record.label()
        })?;
        info!("Handshake acknowledged by {}", label);
        Ok(())
    }

    pub fn heartbeat(
        &self,
        ctx: &RequestContext,
        payload: HeartbeatPayload,
    ) -> Result<(), RegistrationError> {
        let token = authorize(&self.registry, ctx.credential.as_deref())?;
        let offline_at = parse_heartbeat_time(&payload.offline_mode_at)?;
        let label = self.registry.update(&token, |record| {
            record.peer_declared_offline_at = Some(offline_at);
            record.label()
        })?;
        debug!("Heartbeat from {}, offline at {}", label, offline_at);
        Ok(())
    }

    /// `(base_url, remote_token)` for a peer, by token or by group id.
    ///
    /// Best effort: exactly one key must be given, and anything that does
    /// not lead to a registered peer yields `None`.
    pub fn resolve(&self, token: Option<&str>, group_id: Option<&str>) -> Option<(String, String)> {
        let found = match (token, group_id) {
            (Some(token), None) => self.registry.get(token),
            (None, Some(group_id)) => self.registry.find_by_group_id(group_id),
            _ => {
                warn!("resolve needs exactly one of token or group id");
                return None;
            }
        };
        match found {
            Ok(record) if record.is_registered() => Some((record.base_url, record.remote_token)),
            Ok(_) | Err(StoreError::NotFound(_)) => None,
            Err(e) => {
                warn!("Peer lookup failed: {}", e);
                None
            }
        }
    }

    pub fn liveness(&self, token: &str, now: DateTime<Utc>) -> Result<Liveness, StoreError> {
        Ok(self.registry.get(token)?.liveness(now))
    }

    pub fn link_group(&self, token: &str, group_id: &str) -> Result<(), StoreError> {
        self.registry.link_group(token, group_id)
    }

    pub fn unlink_group(&self, token: &str, group_id: &str) -> Result<bool, StoreError> {
        self.registry
            .update(token, |record| record.group_ids.remove(group_id))
    }
}
