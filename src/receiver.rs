//! Agent Receiver.
//!
//! Loopback HTTP server that accepts intake payloads and the terminal
//! "flush" marker from the in-function agent.

use std::io::Read;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Router,
};
use flate2::read::{DeflateDecoder, GzDecoder};
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, warn};

use crate::error::Result;
use crate::metadata::{looks_like_metadata_line, MetadataCache};
use crate::transport::{AgentPayload, Encoding, Transport};

#[derive(Clone)]
struct ReceiverState {
    transport: Transport,
    metadata: MetadataCache,
}

/// Embedded HTTP receiver for agent-produced telemetry.
pub struct AgentReceiver {
    state: ReceiverState,
    request_timeout: Duration,
}

impl AgentReceiver {
    pub fn new(transport: Transport, metadata: MetadataCache, request_timeout: Duration) -> Self {
        Self {
            state: ReceiverState { transport, metadata },
            request_timeout,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(health))
            .route("/healthcheck", get(health))
            .route("/intake/v2/events", post(intake))
            .route("/flush", post(flush))
            .with_state(self.state.clone())
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(TimeoutLayer::new(self.request_timeout)),
            )
    }

    /// Bind the loopback listener. Split from `serve` so the caller can
    /// treat a bind failure as fatal init before spawning the accept loop.
    pub async fn bind(port: u16) -> Result<tokio::net::TcpListener> {
        let addr = format!("127.0.0.1:{port}");
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr, "agent receiver listening");
        Ok(listener)
    }

    pub async fn serve(&self, port: u16) -> Result<()> {
        let listener = Self::bind(port).await?;
        self.serve_on(listener).await
    }

    pub async fn serve_on(&self, listener: tokio::net::TcpListener) -> Result<()> {
        axum::serve(listener, self.router())
            .await
            .map_err(|e| crate::error::Error::Io(std::io::Error::other(e)))
    }
}

async fn health() -> &'static str {
    "ok"
}

/// `POST /intake/v2/events` — enqueue the payload unchanged, after peeking
/// at its first line to detect the metadata marker. Responds 202 before
/// (and regardless of) the enqueue outcome, since enqueue never blocks.
async fn intake(
    State(state): State<ReceiverState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let encoding = detect_encoding(&headers, &body);

    match first_line(&body, encoding) {
        Ok(Some(line)) if looks_like_metadata_line(&line) => {
            state.metadata.try_capture(&line).await;
        }
        Ok(_) => {}
        Err(_) => {
            state.transport.record_decode_error();
            warn!("failed to decode agent payload for metadata detection; enqueuing as-is");
        }
    }

    state
        .transport
        .enqueue(AgentPayload {
            bytes: body.to_vec(),
            encoding,
        })
        .await;

    StatusCode::ACCEPTED
}

/// `POST /flush` — signal `AgentDoneSignal` for the current invocation.
async fn flush(State(state): State<ReceiverState>) -> StatusCode {
    debug!("agent signaled end of invocation");
    state.transport.fire_agent_done();
    StatusCode::ACCEPTED
}

fn detect_encoding(headers: &HeaderMap, body: &[u8]) -> Encoding {
    if let Some(value) = headers.get("content-encoding").and_then(|v| v.to_str().ok()) {
        return match value.to_ascii_lowercase().as_str() {
            "gzip" => Encoding::Gzip,
            "deflate" => Encoding::Deflate,
            _ => Encoding::None,
        };
    }
    if body.len() >= 2 && body[0] == 0x1f && body[1] == 0x8b {
        Encoding::Gzip
    } else {
        Encoding::None
    }
}

/// Decode only as far as the first newline (or EOF), to extract the
/// metadata-detection line. The original, still-encoded bytes are what
/// actually get enqueued — see SPEC_FULL.md §4.2.
fn first_line(body: &[u8], encoding: Encoding) -> std::result::Result<Option<Vec<u8>>, ()> {
    let decoded_prefix = match encoding {
        Encoding::None => body.to_vec(),
        Encoding::Gzip => decode_prefix(GzDecoder::new(body))?,
        Encoding::Deflate => decode_prefix(DeflateDecoder::new(body))?,
    };

    Ok(decoded_prefix
        .split(|&b| b == b'\n')
        .next()
        .filter(|l| !l.is_empty())
        .map(|l| l.to_vec()))
}

fn decode_prefix<R: Read>(mut reader: R) -> std::result::Result<Vec<u8>, ()> {
    // Read in small chunks until a newline shows up or the stream ends;
    // intake payloads keep the metadata line well under a few KB.
    let mut out = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        let n = reader.read(&mut chunk).map_err(|_| ())?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..n]);
        if out.contains(&b'\n') {
            break;
        }
        if out.len() > 64 * 1024 {
            break;
        }
    }
    Ok(out)
}
