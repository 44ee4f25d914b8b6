//! Lambda AWS Telemetry Extension.
//!
//! An in-process sidecar that registers with the host's extension lifecycle
//! API, accepts agent-produced telemetry over two loopback HTTP receivers,
//! and forwards it to a remote APM backend. See `SPEC_FULL.md` for the
//! full external-interface and protocol description.
//!
//! ## Architecture
//!
//! ```text
//! main
//!   ├──> Agent Receiver   (loopback :8200, intake + flush)
//!   ├──> Logs Receiver    (loopback :8201, platform log batches)
//!   └──> Coordinator      (lifecycle NextEvent loop, one invocation at a time)
//! ```
//!
//! ## Configuration
//!
//! See `config::Config` for the full list of environment variables.

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use lambda_telemetry_extension::config::Config;
use lambda_telemetry_extension::coordinator::Coordinator;
use lambda_telemetry_extension::lifecycle::LifecycleClient;
use lambda_telemetry_extension::logging;
use lambda_telemetry_extension::logs::{LogsReceiver, LogsSubscriber};
use lambda_telemetry_extension::metadata::MetadataCache;
use lambda_telemetry_extension::receiver::AgentReceiver;
use lambda_telemetry_extension::transport::Transport;
use lambda_telemetry_extension::EXTENSION_NAME;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing();
    info!("starting lambda telemetry extension");

    let config = Config::from_env().context("failed to load configuration")?;
    info!(
        apm_server = %config.apm_server_url,
        send_strategy = ?config.send_strategy,
        agent_port = config.agent_receiver_port,
        logs_port = config.logs_receiver_port,
        "configuration loaded"
    );

    let mut lifecycle = LifecycleClient::new(config.runtime_api_base_url.clone())
        .context("failed to build lifecycle client")?;

    if let Err(e) = lifecycle.register(EXTENSION_NAME).await {
        error!(error = %e, "extension registration failed; reporting init error");
        let _ = lifecycle.init_error(&e.to_string()).await;
        return Err(e.into());
    }

    let metadata = MetadataCache::new();
    let transport = Transport::new(
        config.apm_server_url.clone(),
        config.auth_header(),
        config.data_forwarder_timeout,
        config.forwarder_queue_size,
    )
    .context("failed to build backend transport")?;

    let agent_receiver = AgentReceiver::new(
        transport.clone(),
        metadata.clone(),
        config.data_receiver_timeout,
    );
    let logs_receiver = LogsReceiver::new(transport.clone(), metadata.clone());

    // Binding is fatal init per spec.md §7: failure here means the agent
    // and the host's logs stream would have nowhere to deliver, so it is
    // reported the same way a failed register() is.
    let agent_listener = match AgentReceiver::bind(config.agent_receiver_port).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "failed to bind agent receiver; reporting init error");
            let _ = lifecycle.init_error(&e.to_string()).await;
            return Err(e.into());
        }
    };
    let logs_listener = match LogsReceiver::bind(config.logs_receiver_port).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "failed to bind logs receiver; reporting init error");
            let _ = lifecycle.init_error(&e.to_string()).await;
            return Err(e.into());
        }
    };

    let global_cancel = CancellationToken::new();

    tokio::spawn(async move {
        if let Err(e) = agent_receiver.serve_on(agent_listener).await {
            error!(error = %e, "agent receiver exited");
        }
    });

    let logs_server_handle = logs_receiver.clone();
    tokio::spawn(async move {
        if let Err(e) = logs_server_handle.serve_on(logs_listener).await {
            error!(error = %e, "logs receiver exited");
        }
    });

    let logs_subscriber = LogsSubscriber::new(config.runtime_api_base_url.clone())
        .context("failed to build logs subscriber")?;
    if let Some(extension_id) = lifecycle.extension_id() {
        if let Err(e) = logs_subscriber
            .subscribe(extension_id, config.logs_receiver_port)
            .await
        {
            warn!(error = %e, "logs subscription failed; continuing without platform metrics");
        }
    }

    let mut coordinator = Coordinator::new(
        lifecycle,
        transport,
        logs_receiver,
        config.send_strategy,
        global_cancel.clone(),
    );

    let shutdown_reason = tokio::select! {
        _ = shutdown_signal() => "received termination signal",
        _ = coordinator.run() => "coordinator loop exited",
    };

    info!(reason = shutdown_reason, "shutting down");
    global_cancel.cancel();

    Ok(())
}

/// Resolves on Ctrl+C or, on Unix, `SIGTERM` — the host sends `SIGTERM`
/// ahead of a forced container freeze/teardown.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("received Ctrl+C"),
        _ = terminate => warn!("received SIGTERM"),
    }
}
