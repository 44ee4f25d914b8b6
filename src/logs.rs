//! Logs Subscriber & Receiver.
//!
//! Subscribes to the host's platform-logs stream, then runs a second
//! embedded HTTP receiver (distinct from the Agent Receiver) that ingests
//! log batches, detects the per-invocation `platform.runtimeDone` and
//! `platform.report` records, and synthesizes a `MetricsetDoc` from the
//! report.

use std::sync::{Arc, RwLock};

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metadata::MetadataCache;
use crate::metrics_doc::{build_metricset_doc, synthesize_document, MetricsetContext, PlatformMetrics};
use crate::signal::OnceSignal;
use crate::transport::{AgentPayload, Encoding, Transport};

const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";
const LOGS_SCHEMA_VERSION: &str = "2021-03-18";

/// Raw log event as delivered by the host's logs receiver batch.
#[derive(Debug, Deserialize)]
struct LogEvent {
    time: String,
    #[serde(rename = "type")]
    event_type: String,
    record: serde_json::Value,
}

/// Subscribes this process to the host's platform logs stream.
pub struct LogsSubscriber {
    client: reqwest::Client,
    runtime_api_base_url: String,
}

impl LogsSubscriber {
    pub fn new(runtime_api_base_url: String) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            runtime_api_base_url,
        })
    }

    /// Subscribe, preferring a 25ms coalescing window (a deliberate
    /// latency reduction over the upstream's documented 100ms minimum —
    /// see SPEC_FULL.md §9). Falls back to 100ms if the host rejects the
    /// lower value.
    pub async fn subscribe(&self, extension_id: &str, destination_port: u16) -> Result<()> {
        match self.subscribe_with_timeout(extension_id, destination_port, 25).await {
            Ok(()) => Ok(()),
            Err(Error::LogsSubscribe(_)) => {
                warn!("logs subscription rejected 25ms buffering window; retrying at 100ms");
                self.subscribe_with_timeout(extension_id, destination_port, 100).await
            }
            Err(e) => Err(e),
        }
    }

    async fn subscribe_with_timeout(
        &self,
        extension_id: &str,
        destination_port: u16,
        timeout_ms: u32,
    ) -> Result<()> {
        let body = serde_json::json!({
            "schemaVersion": LOGS_SCHEMA_VERSION,
            "types": ["platform", "function", "extension"],
            "buffering": {
                "maxItems": 10_000,
                "maxBytes": 262_144,
                "timeoutMs": timeout_ms,
            },
            "destination": {
                "protocol": "HTTP",
                "URI": format!("http://sandbox.localdomain:{destination_port}/"),
                "method": "POST",
                "encoding": "JSON",
            },
        });

        let response = self
            .client
            .put(format!("http://{}/2020-08-15/logs", self.runtime_api_base_url))
            .header(EXTENSION_ID_HEADER, extension_id)
            .json(&body)
            .send()
            .await?;

        match response.status().as_u16() {
            200 => {
                info!(timeout_ms, "subscribed to platform logs");
                Ok(())
            }
            202 => {
                warn!("logs subscription not supported in this environment");
                Ok(())
            }
            other => Err(Error::LogsSubscribe(format!(
                "logs subscribe rejected with status {other}"
            ))),
        }
    }
}

struct InvocationMeta {
    request_id: String,
    timeout_ms: f64,
}

#[derive(Clone)]
struct LogsReceiverState {
    transport: Transport,
    metadata: MetadataCache,
    current: Arc<RwLock<Option<InvocationMeta>>>,
    runtime_done: Arc<RwLock<Arc<OnceSignal>>>,
}

/// Embedded HTTP receiver for the host's logs batches.
#[derive(Clone)]
pub struct LogsReceiver {
    state: LogsReceiverState,
}

impl LogsReceiver {
    pub fn new(transport: Transport, metadata: MetadataCache) -> Self {
        Self {
            state: LogsReceiverState {
                transport,
                metadata,
                current: Arc::new(RwLock::new(None)),
                runtime_done: Arc::new(RwLock::new(Arc::new(OnceSignal::new()))),
            },
        }
    }

    /// Start a fresh per-invocation `RuntimeDoneSignal`. Must be called by
    /// the Coordinator before waiting on `WaitRuntimeDone`.
    pub fn begin_invocation(&self, request_id: String, timeout_ms: f64) -> Arc<OnceSignal> {
        *self.state.current.write().unwrap() = Some(InvocationMeta {
            request_id,
            timeout_ms,
        });
        let signal = Arc::new(OnceSignal::new());
        *self.state.runtime_done.write().unwrap() = signal.clone();
        signal
    }

    /// Coordinator-facing wait: returns when `RuntimeDoneSignal(requestId)`
    /// has fired, or when `cancel` cancels.
    pub async fn wait_runtime_done(&self, cancel: &tokio_util::sync::CancellationToken) {
        let signal = self.state.runtime_done.read().unwrap().clone();
        tokio::select! {
            _ = signal.wait() => {}
            _ = cancel.cancelled() => {}
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", post(ingest_logs))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the loopback listener. Split from `serve` so the caller can
    /// treat a bind failure as fatal init before spawning the accept loop.
    pub async fn bind(port: u16) -> Result<tokio::net::TcpListener> {
        let addr = format!("127.0.0.1:{port}");
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(addr, "logs receiver listening");
        Ok(listener)
    }

    pub async fn serve(&self, port: u16) -> Result<()> {
        let listener = Self::bind(port).await?;
        self.serve_on(listener).await
    }

    pub async fn serve_on(&self, listener: tokio::net::TcpListener) -> Result<()> {
        axum::serve(listener, self.router())
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))
    }
}

async fn ingest_logs(
    State(state): State<LogsReceiverState>,
    Json(events): Json<Vec<LogEvent>>,
) -> StatusCode {
    for event in events {
        dispatch_event(&state, event).await;
    }
    StatusCode::OK
}

async fn dispatch_event(state: &LogsReceiverState, event: LogEvent) {
    let current_request_id = state
        .current
        .read()
        .unwrap()
        .as_ref()
        .map(|m| m.request_id.clone());

    match event.event_type.as_str() {
        "platform.runtimeDone" => {
            let request_id = event.record.get("requestId").and_then(|v| v.as_str());
            if request_id.is_some() && request_id == current_request_id.as_deref() {
                debug!(request_id, "runtime done");
                state.runtime_done.read().unwrap().fire();
            }
        }
        "platform.report" => {
            let request_id = event.record.get("requestId").and_then(|v| v.as_str());
            if request_id.is_none() || request_id != current_request_id.as_deref() {
                return;
            }
            let Some(timeout_ms) = state.current.read().unwrap().as_ref().map(|m| m.timeout_ms)
            else {
                return;
            };
            match build_metricset_payload(&state.metadata, &event, request_id.unwrap(), timeout_ms).await
            {
                Some(payload) => {
                    state.transport.enqueue(payload).await;
                }
                None => warn!("platform.report received but metadata/metrics unavailable; dropping synthesized document"),
            }
        }
        other => {
            debug!(event_type = other, "ignoring log event type");
        }
    }
}

async fn build_metricset_payload(
    metadata: &MetadataCache,
    event: &LogEvent,
    request_id: &str,
    timeout_ms: f64,
) -> Option<AgentPayload> {
    let metadata_bytes = metadata.get().await?;
    let metrics = parse_platform_metrics(&event.record)?;
    let timestamp_micros = parse_timestamp_micros(&event.time)?;
    let invoked_function_arn = event
        .record
        .get("invokedFunctionArn")
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    let ctx = MetricsetContext {
        timestamp_micros,
        timeout_ms,
        request_id,
        invoked_function_arn,
    };
    let metricset_json = build_metricset_doc(&metrics, &ctx);
    let bytes = synthesize_document(&metadata_bytes, &metricset_json);

    Some(AgentPayload {
        bytes,
        encoding: Encoding::None,
    })
}

fn parse_platform_metrics(record: &serde_json::Value) -> Option<PlatformMetrics> {
    let metrics = record.get("metrics")?;
    Some(PlatformMetrics {
        duration_ms: metrics.get("durationMs")?.as_f64()?,
        billed_duration_ms: metrics.get("billedDurationMs")?.as_f64()?,
        memory_size_mb: metrics.get("memorySizeMB")?.as_f64()?,
        max_memory_used_mb: metrics.get("maxMemoryUsedMB")?.as_f64()?,
        init_duration_ms: metrics.get("initDurationMs").and_then(|v| v.as_f64()).unwrap_or(0.0),
    })
}

fn parse_timestamp_micros(time: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(time)
        .ok()
        .map(|dt| dt.timestamp_micros())
}
