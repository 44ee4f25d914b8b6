//! Configuration module.
//!
//! Loads and validates the extension's environment variables, mirroring the
//! teacher's `DeliveryConfig::from_env` / `IngestorConfig::from_env`
//! convention: plain `env::var` calls with `anyhow::Context`, defaults for
//! anything non-critical, fail-fast for anything the extension cannot run
//! without.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

/// How the Coordinator returns control to the host at the end of an
/// invocation: drain the Transport queue synchronously, or return
/// immediately and let telemetry land whenever it lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStrategy {
    SyncFlush,
    Background,
}

impl SendStrategy {
    fn parse(raw: &str) -> SendStrategy {
        match raw.to_ascii_lowercase().as_str() {
            "background" => SendStrategy::Background,
            _ => SendStrategy::SyncFlush,
        }
    }
}

/// Main configuration for the extension process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Ingest backend base URL (e.g. APM server). Required.
    pub apm_server_url: String,

    /// Secret token for backend authentication, if configured.
    pub secret_token: Option<String>,

    /// API key for backend authentication, if configured.
    pub api_key: Option<String>,

    /// Sync vs background flush at invocation end.
    pub send_strategy: SendStrategy,

    /// Host lifecycle/logs API base URL. Required.
    pub runtime_api_base_url: String,

    /// Per-request timeout applied to the Agent Receiver's router.
    pub data_receiver_timeout: Duration,

    /// Timeout for a single `PostToBackend` call.
    pub data_forwarder_timeout: Duration,

    /// Port the Agent Receiver binds on (loopback).
    pub agent_receiver_port: u16,

    /// Port the Logs Receiver binds on (loopback).
    pub logs_receiver_port: u16,

    /// Bounded FIFO capacity for queued agent payloads.
    pub forwarder_queue_size: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let apm_server_url = env::var("ELASTIC_APM_LAMBDA_APM_SERVER")
            .context("ELASTIC_APM_LAMBDA_APM_SERVER not set")?;

        let runtime_api_base_url =
            env::var("AWS_LAMBDA_RUNTIME_API").context("AWS_LAMBDA_RUNTIME_API not set")?;

        let secret_token = env::var("ELASTIC_APM_SECRET_TOKEN").ok();
        let api_key = env::var("ELASTIC_APM_API_KEY").ok();

        let send_strategy = env::var("ELASTIC_APM_SEND_STRATEGY")
            .map(|raw| SendStrategy::parse(&raw))
            .unwrap_or(SendStrategy::SyncFlush);

        let data_receiver_timeout = Duration::from_millis(
            env::var("ELASTIC_APM_DATA_RECEIVER_TIMEOUT")
                .unwrap_or_else(|_| "15000".to_string())
                .parse::<u64>()
                .context("ELASTIC_APM_DATA_RECEIVER_TIMEOUT must be a valid number")?,
        );

        let data_forwarder_timeout = Duration::from_millis(
            env::var("ELASTIC_APM_DATA_FORWARDER_TIMEOUT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u64>()
                .context("ELASTIC_APM_DATA_FORWARDER_TIMEOUT must be a valid number")?,
        );

        let agent_receiver_port = env::var("ELASTIC_APM_DATA_RECEIVER_PORT")
            .unwrap_or_else(|_| "8200".to_string())
            .parse::<u16>()
            .context("ELASTIC_APM_DATA_RECEIVER_PORT must be a valid port number")?;

        let logs_receiver_port = env::var("ELASTIC_APM_LOGS_RECEIVER_PORT")
            .unwrap_or_else(|_| "8201".to_string())
            .parse::<u16>()
            .context("ELASTIC_APM_LOGS_RECEIVER_PORT must be a valid port number")?;

        let forwarder_queue_size = env::var("ELASTIC_APM_DATA_FORWARDER_QUEUE_SIZE")
            .unwrap_or_else(|_| "1000".to_string())
            .parse::<usize>()
            .context("ELASTIC_APM_DATA_FORWARDER_QUEUE_SIZE must be a valid number")?;

        if secret_token.is_some() && api_key.is_some() {
            tracing::warn!(
                "both ELASTIC_APM_SECRET_TOKEN and ELASTIC_APM_API_KEY are set; API key takes precedence"
            );
        }

        Ok(Config {
            apm_server_url,
            secret_token,
            api_key,
            send_strategy,
            runtime_api_base_url,
            data_receiver_timeout,
            data_forwarder_timeout,
            agent_receiver_port,
            logs_receiver_port,
            forwarder_queue_size,
        })
    }

    /// Authorization header value, API key taking precedence over the
    /// secret token when both are configured.
    pub fn auth_header(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            Some(format!("ApiKey {key}"))
        } else {
            self.secret_token.as_ref().map(|t| format!("Bearer {t}"))
        }
    }
}
