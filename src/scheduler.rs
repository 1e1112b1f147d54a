use crate::messenger::Messenger;
use crate::peers::{HandshakeState, Liveness, PeerRecord};
use crate::registration::RegistrationManager;
use crate::registry::blocking;
use crate::shutdown::Shutdown;
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::{task, time};
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Upper bound on every outbound call.
    pub request_timeout: Duration,
    /// Peers serviced at once within one tick.
    pub max_concurrent_peers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            max_concurrent_peers: 8,
        }
    }
}

/// What one tick did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub acks_sent: usize,
    pub heartbeats_sent: usize,
    pub registers_sent: usize,
    pub failures: usize,
    pub offline: usize,
}

impl AddAssign for TickReport {
    fn add_assign(&mut self, other: Self) {
        self.acks_sent += other.acks_sent;
        self.heartbeats_sent += other.heartbeats_sent;
        self.registers_sent += other.registers_sent;
        self.failures += other.failures;
        self.offline += other.offline;
    }
}

/// Periodically acknowledges handshakes, sends heartbeats and delivers
/// owed registrations to every known peer.
///
/// Sends happen without the registry lock; each result is written back with
/// a fresh read-modify-write. A failed send leaves the record as it was, so
/// the next tick tries again.
#[derive(Clone)]
pub struct Scheduler {
    manager: Arc<RegistrationManager>,
    messenger: Messenger,
    tick_interval: Duration,
    limit: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(
        manager: Arc<RegistrationManager>,
        messenger: Messenger,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            manager,
            messenger,
            tick_interval: config.tick_interval,
            limit: Arc::new(Semaphore::new(config.max_concurrent_peers.max(1))),
        }
    }

    /// Tick until `shutdown` fires. A tick in flight is always finished.
    pub async fn run(self, shutdown: Arc<Shutdown>) {
        info!("Liveness scheduler started, ticking every {:?}", self.tick_interval);

        let stop = shutdown.wait();
        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = time::sleep(self.tick_interval) => {
                    self.tick().await;
                }
                _ = &mut stop => {
                    info!("Scheduler: shutdown signal received");
                    break;
                }
            }
        }

        info!("Liveness scheduler exited");
    }

    pub async fn tick(&self) -> TickReport {
        let registry = self.manager.registry().clone();
        let peers = match blocking(move || registry.snapshot()).await {
            Ok(peers) => peers,
            Err(e) => {
                error!("Scheduler could not read the peer registry: {}", e);
                return TickReport::default();
            }
        };
        let now = Utc::now();

        let mut tasks = vec![];
        for record in peers.into_iter().filter(PeerRecord::is_registered) {
            let worker = self.clone();
            let label = record.label();
            tasks.push((
                label,
                task::spawn(async move {
                    let _permit = worker.limit.clone().acquire_owned().await.ok();
                    worker.service_peer(record, now).await
                }),
            ));
        }

        let mut report = TickReport::default();
        for (label, handle) in tasks {
            match handle.await {
                Ok(peer_report) => report += peer_report,
                Err(e) => {
                    error!("Processing {} failed: {}", label, e);
                    report.failures += 1;
                }
            }
        }
        debug!("Tick done: {:?}", report);
        report
    }

    async fn service_peer(&self, record: PeerRecord, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let label = record.label();

        if record.handshake_state == HandshakeState::PendingAck {
            let interval = record.heartbeat_interval();
            match self
                .messenger
                .send_handshake_ack(&record.base_url, &record.remote_token, interval)
                .await
            {
                Ok(()) => {
                    info!("Sent handshake acknowledgment to {}", label);
                    report.acks_sent += 1;
                    let acknowledged = record.required_behavior.clone();
                    self.write_back(&record, move |r| {
                        // A handshake that landed while this ack was in flight
                        // still needs an ack of its own.
                        if r.handshake_state == HandshakeState::PendingAck
                            && r.required_behavior == acknowledged
                        {
                            r.handshake_state = HandshakeState::Acknowledged;
                        }
                    })
                    .await;
                }
                Err(e) => {
                    warn!("Handshake acknowledgment to {} failed, will retry: {}", label, e);
                    report.failures += 1;
                }
            }
        } else if let Some(interval) = record
            .heartbeat_interval()
            .filter(|_| record.heartbeat_due(now))
        {
            match self
                .messenger
                .send_heartbeat(&record.base_url, &record.remote_token, interval)
                .await
            {
                Ok(next_due) => {
                    debug!("Sent heartbeat to {}, next due {}", label, next_due);
                    report.heartbeats_sent += 1;
                    self.write_back(&record, move |r| r.advance_heartbeat(next_due))
                        .await;
                }
                Err(e) => {
                    warn!("Heartbeat to {} failed, will retry: {}", label, e);
                    report.failures += 1;
                }
            }
        }

        if record.pending_outbound_register {
            match self
                .messenger
                .send_register(
                    &record.base_url,
                    &record.local_token,
                    &record.remote_token,
                    record.register_correlation_id.as_deref(),
                )
                .await
            {
                Ok(()) => {
                    info!("Delivered registration to {}", label);
                    report.registers_sent += 1;
                    self.write_back(&record, |r| {
                        r.pending_outbound_register = false;
                        r.register_correlation_id = None;
                        r.handshake_state = HandshakeState::PendingAck;
                    })
                    .await;
                }
                Err(e) => {
                    warn!("Registration with {} failed, will retry: {}", label, e);
                    report.failures += 1;
                }
            }
        }

        if let (Liveness::Offline, Some(offline_at)) =
            (record.liveness(now), record.peer_declared_offline_at)
        {
            warn!("{} is offline, no heartbeat since {}", label, offline_at);
            report.offline += 1;
        }

        report
    }

    async fn write_back(
        &self,
        record: &PeerRecord,
        change: impl FnOnce(&mut PeerRecord) + Send + 'static,
    ) {
        let registry = self.manager.registry().clone();
        let token = record.local_token.clone();
        let written: Result<(), StoreError> =
            blocking(move || registry.update(&token, change)).await;
        match written {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                debug!("{} went away while a call to it was in flight", record.label());
            }
            Err(e) => error!("Could not record result for {}: {}", record.label(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::test_peer::{unreachable_base_url, TestPeer};
    use crate::registry::Registry;
    use crate::store::InMemoryStore;
    use crate::types::{
        HandshakePayload, RegisterPayload, RequestContext, RequiredBehaviour, VersionUrl,
    };

    fn local() -> Vec<VersionUrl> {
        vec![VersionUrl {
            version: "2.0".into(),
            base_url: "http://me/cp/2.0".into(),
        }]
    }

    fn scheduler() -> (Scheduler, Arc<RegistrationManager>) {
        let manager = Arc::new(RegistrationManager::new(
            Arc::new(Registry::new(InMemoryStore::new())),
            local(),
        ));
        let config = SchedulerConfig {
            tick_interval: Duration::from_millis(20),
            request_timeout: Duration::from_secs(5),
            max_concurrent_peers: 4,
        };
        let messenger = Messenger::new(local(), config.request_timeout).unwrap();
        (Scheduler::new(manager.clone(), messenger, &config), manager)
    }

    fn peer_at(token: &str, base_url: &str) -> PeerRecord {
        PeerRecord::new(token, format!("remote-{}", token), base_url, "2.0")
    }

    fn with_heartbeats(mut record: PeerRecord, interval: u64) -> PeerRecord {
        record.handshake_state = HandshakeState::Acknowledged;
        record.required_behavior = Some(RequiredBehaviour {
            heartbeat_interval: Some(interval),
            ..Default::default()
        });
        record
    }

    #[tokio::test]
    async fn pending_handshake_is_acknowledged() {
        let (scheduler, manager) = scheduler();
        let peer = TestPeer::start().await;
        let mut record = peer_at("c", &peer.base_url);
        record.handshake_state = HandshakeState::PendingAck;
        manager.registry().insert(record).unwrap();

        peer.respond_with(500);
        scheduler.tick().await;
        assert_eq!(
            manager.registry().get("c").unwrap().handshake_state,
            HandshakeState::PendingAck
        );

        peer.respond_with(204);
        let report = scheduler.tick().await;
        assert_eq!(report.acks_sent, 1);
        assert_eq!(
            manager.registry().get("c").unwrap().handshake_state,
            HandshakeState::Acknowledged
        );
        let received = peer.received();
        assert_eq!(received.len(), 2);
        assert_eq!(received[1].authorization.as_deref(), Some("Token remote-c"));
    }

    #[tokio::test]
    async fn failed_heartbeat_is_retried_next_tick() {
        let (scheduler, manager) = scheduler();
        let peer = TestPeer::start().await;
        manager
            .registry()
            .insert(with_heartbeats(peer_at("c", &peer.base_url), 60))
            .unwrap();

        peer.respond_with(503);
        let report = scheduler.tick().await;
        assert_eq!(report.failures, 1);
        assert_eq!(manager.registry().get("c").unwrap().next_heartbeat_due_at, None);

        peer.respond_with(204);
        let report = scheduler.tick().await;
        assert_eq!(report.heartbeats_sent, 1);
        let due = manager.registry().get("c").unwrap().next_heartbeat_due_at.unwrap();
        assert!(due > Utc::now() + chrono::Duration::seconds(50));

        // Not due again yet.
        let report = scheduler.tick().await;
        assert_eq!(report.heartbeats_sent, 0);
        assert_eq!(peer.received().len(), 2);
    }

    #[tokio::test]
    async fn owed_registration_is_delivered_once() {
        let (scheduler, manager) = scheduler();
        let peer = TestPeer::start().await;
        let invite = manager.invite().unwrap();
        let payload = RegisterPayload {
            token: "R1".into(),
            version_url: vec![VersionUrl {
                version: "2.0".into(),
                base_url: peer.base_url.clone(),
            }],
        };
        manager
            .register(&RequestContext::new(invite, "req-1"), payload)
            .unwrap();

        scheduler.tick().await;

        let received = peer.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].path, "/oscp/fp/2.0/register");
        assert_eq!(received[0].authorization.as_deref(), Some("Token R1"));
        assert_eq!(received[0].correlation_id.as_deref(), Some("req-1"));

        let record = manager.registry().snapshot().unwrap().remove(0);
        assert_eq!(received[0].body["token"], record.local_token.as_str());
        assert!(!record.pending_outbound_register);
        assert_eq!(record.handshake_state, HandshakeState::PendingAck);

        // Next tick acknowledges the handshake cycle but never re-registers.
        scheduler.tick().await;
        let paths: Vec<_> = peer.received().into_iter().map(|r| r.path).collect();
        assert_eq!(
            paths,
            vec!["/oscp/fp/2.0/register", "/oscp/fp/2.0/handshake_acknowledgment"]
        );
    }

    #[tokio::test]
    async fn unreachable_peer_does_not_block_others() {
        let (scheduler, manager) = scheduler();
        let peer = TestPeer::start().await;
        let dead = unreachable_base_url().await;
        manager
            .registry()
            .insert(with_heartbeats(peer_at("dead", &dead), 60))
            .unwrap();
        manager
            .registry()
            .insert(with_heartbeats(peer_at("alive", &peer.base_url), 60))
            .unwrap();

        let report = scheduler.tick().await;
        assert_eq!(report.heartbeats_sent, 1);
        assert_eq!(report.failures, 1);
        assert!(manager.registry().get("alive").unwrap().next_heartbeat_due_at.is_some());
        assert!(manager.registry().get("dead").unwrap().next_heartbeat_due_at.is_none());
    }

    #[tokio::test]
    async fn offline_peer_is_reported_not_stored() {
        let (scheduler, manager) = scheduler();
        let peer = TestPeer::start().await;
        let mut record = peer_at("c", &peer.base_url);
        record.peer_declared_offline_at = Some(Utc::now() - chrono::Duration::seconds(1));
        manager.registry().insert(record.clone()).unwrap();

        let report = scheduler.tick().await;
        assert_eq!(report.offline, 1);
        assert_eq!(manager.registry().get("c").unwrap(), record);
    }

    #[tokio::test]
    async fn tick_and_update_keep_both_changes() {
        let (scheduler, manager) = scheduler();
        let peer = TestPeer::start().await;
        manager
            .registry()
            .insert(with_heartbeats(peer_at("c", &peer.base_url), 60))
            .unwrap();

        let ctx = RequestContext::new("c", "req-2");
        let moved = RegisterPayload {
            token: "remote-c".into(),
            version_url: vec![VersionUrl {
                version: "2.0".into(),
                base_url: format!("{}/moved", peer.base_url),
            }],
        };
        let (report, updated) = tokio::join!(scheduler.tick(), async {
            manager.update(&ctx, moved)
        });
        updated.unwrap();
        assert_eq!(report.heartbeats_sent, 1);

        let record = manager.registry().get("c").unwrap();
        assert!(record.base_url.ends_with("/moved"));
        assert!(record.next_heartbeat_due_at.is_some());
        assert_eq!(record.handshake_state, HandshakeState::Acknowledged);
    }

    #[tokio::test]
    async fn handshake_during_ack_is_acknowledged_again() {
        let (scheduler, manager) = scheduler();
        let peer = TestPeer::start().await;
        let mut record = with_heartbeats(peer_at("c", &peer.base_url), 10);
        record.handshake_state = HandshakeState::PendingAck;
        manager.registry().insert(record).unwrap();

        // The ack goes out for the state read before the new handshake landed.
        let stale = manager.registry().get("c").unwrap();
        let ctx = RequestContext::new("c", "req-2");
        let renegotiated = HandshakePayload {
            required_behaviour: RequiredBehaviour {
                heartbeat_interval: Some(30),
                ..Default::default()
            },
        };
        manager.handshake(&ctx, renegotiated).unwrap();
        let report = scheduler.service_peer(stale, Utc::now()).await;
        assert_eq!(report.acks_sent, 1);
        assert_eq!(
            manager.registry().get("c").unwrap().handshake_state,
            HandshakeState::PendingAck
        );

        let report = scheduler.tick().await;
        assert_eq!(report.acks_sent, 1);
        let record = manager.registry().get("c").unwrap();
        assert_eq!(record.handshake_state, HandshakeState::Acknowledged);
        assert_eq!(record.heartbeat_interval(), Some(30));

        let intervals: Vec<_> = peer
            .received()
            .into_iter()
            .map(|r| r.body["required_behaviour"]["heartbeat_interval"].clone())
            .collect();
        assert_eq!(intervals, vec![10, 30]);
    }

    #[tokio::test]
    async fn concurrent_tick_and_handshake_end_acknowledged() {
        let (scheduler, manager) = scheduler();
        let peer = TestPeer::start().await;
        let mut record = with_heartbeats(peer_at("c", &peer.base_url), 10);
        record.handshake_state = HandshakeState::PendingAck;
        manager.registry().insert(record).unwrap();

        let ctx = RequestContext::new("c", "req-2");
        let renegotiated = HandshakePayload {
            required_behaviour: RequiredBehaviour {
                heartbeat_interval: Some(30),
                ..Default::default()
            },
        };
        let (_, handshake) = tokio::join!(scheduler.tick(), async {
            manager.handshake(&ctx, renegotiated)
        });
        handshake.unwrap();
        scheduler.tick().await;

        // Whichever ran first, the last ack the peer saw carries the new interval.
        let last_ack = peer
            .received()
            .into_iter()
            .filter(|r| r.path.ends_with("/handshake_acknowledgment"))
            .last()
            .unwrap();
        assert_eq!(last_ack.body["required_behaviour"]["heartbeat_interval"], 30);
        assert_eq!(
            manager.registry().get("c").unwrap().handshake_state,
            HandshakeState::Acknowledged
        );
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (scheduler, _manager) = scheduler();
        let shutdown = Arc::new(Shutdown::new());
        let handle = tokio::spawn(scheduler.run(shutdown.clone()));

        time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();
        time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_before_start_is_not_lost() {
        let (scheduler, _manager) = scheduler();
        let shutdown = Arc::new(Shutdown::new());
        shutdown.trigger();
        time::timeout(Duration::from_secs(5), scheduler.run(shutdown))
            .await
            .expect("scheduler missed an earlier shutdown");
    }
}
