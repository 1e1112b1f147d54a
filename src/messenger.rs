use crate::auth::authorization_header;
use crate::token;
use crate::types::{
    format_heartbeat_time, HandshakeAckPayload, HeartbeatPayload, RegisterPayload,
    RequiredBehaviour, VersionUrl,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hyper::client::HttpConnector;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Body, Client, Method, Request, StatusCode};
use hyper_openssl::HttpsConnector;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time;
use tracing::debug;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Multiple of the heartbeat interval after which we declare ourselves offline.
const OFFLINE_AFTER_INTERVALS: i64 = 3;

const MAX_HEARTBEAT_INTERVAL: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("could not set up TLS connector: {0}")]
    Connector(#[from] openssl::error::ErrorStack),
    #[error("could not build request: {0}")]
    Request(#[from] hyper::http::Error),
    #[error("could not encode body: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("connection failed: {0}")]
    Transport(#[from] hyper::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("peer answered HTTP {0}")]
    Status(StatusCode),
}

/// Client for the calls this process makes to its peers.
#[derive(Clone)]
pub struct Messenger {
    client: Client<HttpsConnector<HttpConnector>, Body>,
    version_urls: Vec<VersionUrl>,
    timeout: Duration,
}

impl Messenger {
    pub fn new(version_urls: Vec<VersionUrl>, timeout: Duration) -> Result<Self, MessengerError> {
        let https = HttpsConnector::new()?;
        let client = Client::builder().build(https);
        Ok(Self {
            client,
            version_urls,
            timeout,
        })
    }

    /// Offer `new_local_token` and our versions to the peer.
    pub async fn send_register(
        &self,
        base_url: &str,
        new_local_token: &str,
        remote_token: &str,
        correlation_id: Option<&str>,
    ) -> Result<(), MessengerError> {
        let body = RegisterPayload {
            token: new_local_token.to_string(),
            version_url: self.version_urls.clone(),
        };
        self.post(base_url, "register", remote_token, correlation_id, &body)
            .await
    }

    pub async fn send_handshake_ack(
        &self,
        base_url: &str,
        remote_token: &str,
        heartbeat_interval: Option<u64>,
    ) -> Result<(), MessengerError> {
        let body = HandshakeAckPayload {
            required_behaviour: Some(RequiredBehaviour {
                heartbeat_interval,
                ..Default::default()
            }),
        };
        self.post(base_url, "handshake_acknowledgment", remote_token, None, &body)
            .await
    }

    /// Tell the peer we are alive; returns when the next heartbeat is due.
    pub async fn send_heartbeat(
        &self,
        base_url: &str,
        remote_token: &str,
        interval_seconds: u64,
    ) -> Result<DateTime<Utc>, MessengerError> {
        let now = Utc::now();
        let interval = interval_seconds.min(MAX_HEARTBEAT_INTERVAL) as i64;
        let body = HeartbeatPayload {
            offline_mode_at: format_heartbeat_time(
                now + ChronoDuration::seconds(interval * OFFLINE_AFTER_INTERVALS),
            ),
        };
        self.post(base_url, "heartbeat", remote_token, None, &body)
            .await?;
        Ok(now + ChronoDuration::seconds(interval))
    }

    async fn post<T: Serialize>(
        &self,
        base_url: &str,
        path: &str,
        remote_token: &str,
        correlation_id: Option<&str>,
        body: &T,
    ) -> Result<(), MessengerError> {
        let url = format!("{}/{}", base_url.trim_end_matches('/'), path);
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(&url)
            .header(AUTHORIZATION, authorization_header(remote_token))
            .header(REQUEST_ID_HEADER, token::request_id())
            .header(CONTENT_TYPE, "application/json");
        if let Some(correlation_id) = correlation_id {
            builder = builder.header(CORRELATION_ID_HEADER, correlation_id);
        }
        let req = builder.body(Body::from(serde_json::to_vec(body)?))?;

        let resp = time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| MessengerError::Timeout(self.timeout))??;
        if resp.status().is_success() {
            debug!("POST {} -> {}", url, resp.status());
            Ok(())
        } else {
            Err(MessengerError::Status(resp.status()))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_peer::{unreachable_base_url, TestPeer};
    use super::*;
    use crate::types::parse_heartbeat_time;

    fn messenger() -> Messenger {
        Messenger::new(
            vec![VersionUrl {
                version: "2.0".into(),
                base_url: "http://me/cp/2.0".into(),
            }],
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn register_carries_token_and_correlation() {
        let peer = TestPeer::start().await;
        messenger()
            .send_register(&peer.base_url, "C", "R1", Some("req-1"))
            .await
            .unwrap();

        let received = peer.received();
        assert_eq!(received.len(), 1);
        let call = &received[0];
        assert_eq!(call.path, "/oscp/fp/2.0/register");
        assert_eq!(call.authorization.as_deref(), Some("Token R1"));
        assert_eq!(call.correlation_id.as_deref(), Some("req-1"));
        assert!(call.request_id.is_some());
        assert_eq!(call.body["token"], "C");
        assert_eq!(call.body["version_url"][0]["version"], "2.0");
        assert_eq!(call.body["version_url"][0]["base_url"], "http://me/cp/2.0");
    }

    #[tokio::test]
    async fn heartbeat_declares_three_intervals() {
        let peer = TestPeer::start().await;
        let before = Utc::now();
        let next_due = messenger()
            .send_heartbeat(&peer.base_url, "R1", 10)
            .await
            .unwrap();

        assert!(next_due >= before + ChronoDuration::seconds(10));
        assert!(next_due <= Utc::now() + ChronoDuration::seconds(10));

        let received = peer.received();
        assert_eq!(received[0].path, "/oscp/fp/2.0/heartbeat");
        assert_eq!(received[0].correlation_id, None);
        let offline_at =
            parse_heartbeat_time(received[0].body["offline_mode_at"].as_str().unwrap()).unwrap();
        let expected = next_due + ChronoDuration::seconds(20);
        assert!((offline_at - expected).num_seconds().abs() <= 1);
    }

    #[tokio::test]
    async fn handshake_ack_carries_interval() {
        let peer = TestPeer::start().await;
        messenger()
            .send_handshake_ack(&peer.base_url, "R1", Some(30))
            .await
            .unwrap();
        let received = peer.received();
        assert_eq!(received[0].path, "/oscp/fp/2.0/handshake_acknowledgment");
        assert_eq!(received[0].body["required_behaviour"]["heartbeat_interval"], 30);
    }

    #[tokio::test]
    async fn failures_are_typed() {
        let peer = TestPeer::start().await;
        peer.respond_with(503);
        let err = messenger()
            .send_heartbeat(&peer.base_url, "R1", 10)
            .await
            .unwrap_err();
        assert!(matches!(err, MessengerError::Status(StatusCode::SERVICE_UNAVAILABLE)));

        let err = messenger()
            .send_handshake_ack(&unreachable_base_url().await, "R1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, MessengerError::Transport(_)));
    }
}
