//! Lifecycle Client.
//!
//! Speaks the host's extension lifecycle protocol: register once at
//! startup, then long-poll for the next event.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

const EXTENSION_NAME_HEADER: &str = "Lambda-Extension-Name";
const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";

/// Tracing header the host attaches to an `Invoke` event.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Tracing {
    #[serde(rename = "type")]
    pub trace_type: String,
    pub value: String,
}

/// One event returned by `NextEvent`.
#[derive(Debug, Clone)]
pub enum Event {
    Invoke(InvocationCtx),
    Shutdown,
}

/// Per-invocation context, created on `NextEvent` and cancelled at the end
/// of the invocation or on global shutdown.
#[derive(Debug, Clone)]
pub struct InvocationCtx {
    pub request_id: String,
    pub deadline_ms: i64,
    pub invoked_function_arn: String,
    pub tracing: Option<Tracing>,
}

impl InvocationCtx {
    /// `flushDeadline = deadlineMs - 100ms`.
    pub fn flush_deadline_ms(&self) -> i64 {
        self.deadline_ms - 100
    }
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    events: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct NextEventResponse {
    #[serde(rename = "eventType")]
    event_type: String,
    #[serde(rename = "deadlineMs")]
    deadline_ms: Option<i64>,
    #[serde(rename = "requestId")]
    request_id: Option<String>,
    #[serde(rename = "invokedFunctionArn")]
    invoked_function_arn: Option<String>,
    tracing: Option<Tracing>,
}

#[derive(Debug, Serialize)]
struct ErrorRequest<'a> {
    #[serde(rename = "errorMessage")]
    error_message: &'a str,
    #[serde(rename = "errorType")]
    error_type: &'a str,
}

/// Client for the host's extension lifecycle API.
pub struct LifecycleClient {
    client: reqwest::Client,
    base_url: String,
    extension_id: Option<String>,
}

impl LifecycleClient {
    pub fn new(base_url: String) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base_url,
            extension_id: None,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.base_url, path)
    }

    /// One-shot at startup. Fatal on failure — the caller should report
    /// `InitError` and exit.
    pub async fn register(&mut self, extension_name: &str) -> Result<()> {
        let body = RegisterRequest {
            events: &["INVOKE", "SHUTDOWN"],
        };

        let response = self
            .client
            .post(self.url("/2020-01-01/extension/register"))
            .header(EXTENSION_NAME_HEADER, extension_name)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Lifecycle(format!(
                "register failed with status {}",
                response.status()
            )));
        }

        let extension_id = response
            .headers()
            .get(EXTENSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                Error::Lifecycle(format!("register response missing {EXTENSION_ID_HEADER}"))
            })?
            .to_string();

        info!(extension_id = %extension_id, "registered with host lifecycle API");
        self.extension_id = Some(extension_id);
        Ok(())
    }

    pub fn extension_id(&self) -> Option<&str> {
        self.extension_id.as_deref()
    }

    /// Long-polling GET. Blocks until the host answers; cancellation is the
    /// caller's responsibility (wrap the call in `tokio::select!`).
    pub async fn next_event(&self) -> Result<Event> {
        let extension_id = self.require_extension_id()?;

        let response = self
            .client
            .get(self.url("/2020-01-01/extension/event/next"))
            .header(EXTENSION_ID_HEADER, extension_id)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Lifecycle(format!(
                "next event failed with status {}",
                response.status()
            )));
        }

        let parsed: NextEventResponse = response.json().await?;
        match parsed.event_type.as_str() {
            "SHUTDOWN" => Ok(Event::Shutdown),
            "INVOKE" => {
                let request_id = parsed.request_id.ok_or_else(|| {
                    Error::Lifecycle("INVOKE event missing requestId".to_string())
                })?;
                let deadline_ms = parsed.deadline_ms.ok_or_else(|| {
                    Error::Lifecycle("INVOKE event missing deadlineMs".to_string())
                })?;
                Ok(Event::Invoke(InvocationCtx {
                    request_id,
                    deadline_ms,
                    invoked_function_arn: parsed.invoked_function_arn.unwrap_or_default(),
                    tracing: parsed.tracing,
                }))
            }
            other => {
                warn!(event_type = other, "unrecognized event type from host; treating as shutdown");
                Ok(Event::Shutdown)
            }
        }
    }

    pub async fn init_error(&self, message: &str) -> Result<()> {
        self.post_error("/2020-01-01/extension/init/error", message)
            .await
    }

    pub async fn exit_error(&self, message: &str) -> Result<()> {
        self.post_error("/2020-01-01/extension/exit/error", message)
            .await
    }

    async fn post_error(&self, path: &str, message: &str) -> Result<()> {
        let extension_id = self.require_extension_id()?;
        let body = ErrorRequest {
            error_message: message,
            error_type: "Extension.InternalError",
        };

        let response = self
            .client
            .post(self.url(path))
            .header(EXTENSION_ID_HEADER, extension_id)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            warn!(status = %response.status(), path, "error-report call itself failed");
        }
        Ok(())
    }

    fn require_extension_id(&self) -> Result<&str> {
        self.extension_id.as_deref().ok_or_else(|| {
            Error::Lifecycle("lifecycle client used before register() succeeded".to_string())
        })
    }
}
