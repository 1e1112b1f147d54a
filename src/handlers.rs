use crate::auth::{authorize, credential_from_header};
use crate::error::RegistrationError;
use crate::messenger::{CORRELATION_ID_HEADER, REQUEST_ID_HEADER};
use crate::registration::RegistrationManager;
use crate::registry::blocking;
use crate::types::RequestContext;
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{error, warn};

pub async fn handle_connection<S>(stream: S, manager: Arc<RegistrationManager>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let manager = manager.clone();
        async move { route_request(req, manager).await }
    });

    if let Err(e) = Http::new().serve_connection(stream, service).await {
        error!("HTTP connection error: {}", e);
    }
}

/// Dispatch on method and the last path segment, so the protocol can be
/// mounted under any base path.
pub async fn route_request(
    req: Request<Body>,
    manager: Arc<RegistrationManager>,
) -> Result<Response<Body>, hyper::Error> {
    let (parts, body) = req.into_parts();

    if parts.method == Method::GET && parts.uri.path() == "/health" {
        let version = env!("CARGO_PKG_VERSION");
        let build = option_env!("GIT_COMMIT_HASH").unwrap_or("unknown");
        let json = serde_json::json!({ "version": version, "build": build });
        return Ok(json_response(StatusCode::OK, json.to_string()));
    }

    let ctx = request_context(&parts.headers);
    let endpoint = parts.uri.path().trim_end_matches('/').rsplit('/').next().unwrap_or("");
    let Some(operation) = Operation::route(&parts.method, endpoint) else {
        return Ok(json_response(
            StatusCode::NOT_FOUND,
            r#"{"error": "not found"}"#.to_string(),
        ));
    };

    let bytes = hyper::body::to_bytes(body).await?;
    let outcome = {
        let ctx = ctx.clone();
        blocking(move || operation.apply(&manager, &ctx, &bytes)).await
    };

    let mut resp = match outcome {
        Ok(()) => {
            let mut resp = Response::new(Body::empty());
            *resp.status_mut() = StatusCode::NO_CONTENT;
            resp
        }
        Err(e) => {
            let status = e.status_code();
            if status.is_server_error() {
                error!("{} {} failed: {}", parts.method, parts.uri.path(), e);
            } else {
                warn!("{} {} refused ({}): {}", parts.method, parts.uri.path(), status, e);
            }
            let json = serde_json::json!({ "error": e.to_string() });
            json_response(status, json.to_string())
        }
    };
    if let Some(value) = ctx.request_id.as_deref().and_then(|id| HeaderValue::from_str(id).ok()) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    Ok(resp)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Operation {
    Register,
    Update,
    Unregister,
    Handshake,
    HandshakeAck,
    Heartbeat,
}

impl Operation {
    fn route(method: &Method, endpoint: &str) -> Option<Self> {
        match (method, endpoint) {
            (&Method::POST, "register") => Some(Operation::Register),
            (&Method::PUT, "register") => Some(Operation::Update),
            (&Method::DELETE, "register") => Some(Operation::Unregister),
            (&Method::POST, "handshake") => Some(Operation::Handshake),
            (&Method::POST, "handshake_acknowledgment") => Some(Operation::HandshakeAck),
            (&Method::POST, "heartbeat") => Some(Operation::Heartbeat),
            _ => None,
        }
    }

    /// Guard first, then headers, then the body.
    fn apply(
        self,
        manager: &RegistrationManager,
        ctx: &RequestContext,
        body: &[u8],
    ) -> Result<(), RegistrationError> {
        authorize(manager.registry(), ctx.credential.as_deref())?;
        if ctx.request_id.is_none() {
            return Err(RegistrationError::MissingRequestId);
        }
        match self {
            Operation::Register => manager.register(ctx, decode(body)?).map(|_| ()),
            Operation::Update => manager.update(ctx, decode(body)?),
            Operation::Unregister => manager.unregister(ctx),
            Operation::Handshake => manager.handshake(ctx, decode(body)?),
            Operation::HandshakeAck => manager.handshake_ack(ctx, decode(body)?),
            Operation::Heartbeat => manager.heartbeat(ctx, decode(body)?),
        }
    }
}

fn request_context(headers: &HeaderMap) -> RequestContext {
    let header = |name: &str| headers.get(name).and_then(|v: &HeaderValue| v.to_str().ok());
    let id = |name: &str| {
        header(name)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    RequestContext {
        credential: header(AUTHORIZATION.as_str()).and_then(credential_from_header),
        request_id: id(REQUEST_ID_HEADER),
        correlation_id: id(CORRELATION_ID_HEADER),
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RegistrationError> {
    serde_json::from_slice(bytes).map_err(|e| RegistrationError::InvalidPayload(e.to_string()))
}

fn json_response(status: StatusCode, body: String) -> Response<Body> {
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}
