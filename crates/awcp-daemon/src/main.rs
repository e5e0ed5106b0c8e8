#![deny(unsafe_code)]
use anyhow::{Context, Result};
use async_trait::async_trait;
use awcp_admission::AdmissionController;
use awcp_config::{
    load_delegator_config, load_executor_config, validate_delegator_config, validate_executor_config,
    DelegatorConfig, ExecutorConfig, ListenerConfig as ConfigListener, TransportConfig as ConfigTransport,
};
use awcp_daemon::{AppState, EchoTaskRunner};
use awcp_delegator::{DelegatorEngine, SnapshotPolicy};
use awcp_environment::EnvironmentManager;
use awcp_error::AwcpError;
use awcp_executor::ExecutorEngine;
use awcp_listener::{HttpListener, Listener, WsTunnelListener};
use awcp_protocol::AwcpMessage;
use awcp_transport::archive::{ArchiveDelegatorTransport, ArchiveExecutorTransport};
use awcp_transport::sshcert::SshfsExecutorTransport;
use awcp_transport::{DelegatorTransport, ExecutorTransport};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "awcp-daemon", version, about = "AWCP Delegator/Executor control-plane daemon")]
struct Args {
    /// Path to a Delegator configuration file. Enables the Delegator role.
    #[arg(long)]
    delegator_config: Option<PathBuf>,

    /// Path to an Executor configuration file. Enables the Executor role.
    #[arg(long)]
    executor_config: Option<PathBuf>,

    /// Fallback Delegator callback URL, used when an inbound INVITE
    /// doesn't carry a `callbackUrl` in `auth.metadata`.
    #[arg(long)]
    delegator_url: Option<String>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

/// Delivers protocol messages over plain HTTP `POST <peer_url>`, shared by
/// both engines.
struct HttpOutboundChannel {
    client: reqwest::Client,
}

impl HttpOutboundChannel {
    fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn deliver(&self, peer_url: &str, msg: &AwcpMessage) -> Result<(), AwcpError> {
        let resp = self
            .client
            .post(peer_url)
            .json(msg)
            .send()
            .await
            .map_err(|e| {
                AwcpError::new(awcp_error::ErrorCode::SetupFailed, format!("deliver {} to {peer_url}", msg.kind()))
                    .with_context("cause", e.to_string())
            })?;
        if !resp.status().is_success() {
            return Err(AwcpError::new(
                awcp_error::ErrorCode::SetupFailed,
                format!("{peer_url} rejected {} with status {}", msg.kind(), resp.status()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl awcp_delegator::OutboundChannel for HttpOutboundChannel {
    async fn send(&self, peer_url: &str, msg: &AwcpMessage) -> Result<(), AwcpError> {
        self.deliver(peer_url, msg).await
    }
}

#[async_trait]
impl awcp_executor::OutboundChannel for HttpOutboundChannel {
    async fn send(&self, peer_url: &str, msg: &AwcpMessage) -> Result<(), AwcpError> {
        self.deliver(peer_url, msg).await
    }
}

fn build_delegator_transport(config: &DelegatorConfig) -> Arc<dyn DelegatorTransport> {
    // The Delegator side doesn't pin a transport in its own config table
    // (spec.md §6); the archive transport is the interoperable default.
    let _ = config;
    Arc::new(ArchiveDelegatorTransport::default())
}

fn build_executor_transport(config: &ExecutorConfig) -> Arc<dyn ExecutorTransport> {
    match &config.transport {
        ConfigTransport::Archive { .. } => Arc::new(ArchiveExecutorTransport::default()),
        ConfigTransport::Sshfs { .. } => Arc::new(SshfsExecutorTransport),
    }
}

fn build_delegator(config: DelegatorConfig, outbound: Arc<HttpOutboundChannel>) -> Arc<DelegatorEngine> {
    let environment = EnvironmentManager::new(config.environment.base_dir.clone());
    let policy = awcp_admission::AdmissionPolicy {
        max_concurrent_delegations: config.admission.max_concurrent_delegations,
        max_ttl_seconds: config.defaults.ttl_seconds.max(1),
        allowed_access_modes: vec![awcp_core::AccessMode::Ro, awcp_core::AccessMode::Rw],
        max_total_bytes: config.admission.max_total_bytes,
        max_file_count: config.admission.max_file_count,
        max_single_file_bytes: config.admission.max_single_file_bytes,
    };
    let transport = build_delegator_transport(&config);
    let hooks = awcp_delegator::DelegatorHooks {
        pre_delegate: config.hooks.pre_delegate.clone(),
        post_done: config.hooks.post_done.clone(),
    };
    Arc::new(
        DelegatorEngine::new(
            environment,
            AdmissionController::new(policy),
            transport,
            outbound,
            SnapshotPolicy::Auto,
        )
        .with_hooks(hooks),
    )
}

fn build_executor(config: ExecutorConfig, outbound: Arc<HttpOutboundChannel>) -> Arc<ExecutorEngine> {
    let policy = awcp_admission::AdmissionPolicy {
        max_concurrent_delegations: config.admission.max_concurrent_delegations,
        max_ttl_seconds: config.admission.max_ttl_seconds,
        allowed_access_modes: config
            .admission
            .allowed_access_modes
            .iter()
            .map(|m| match m {
                awcp_config::AccessModeConfig::Ro => awcp_core::AccessMode::Ro,
                awcp_config::AccessModeConfig::Rw => awcp_core::AccessMode::Rw,
            })
            .collect(),
        max_total_bytes: u64::MAX,
        max_file_count: u64::MAX,
        max_single_file_bytes: u64::MAX,
    };
    let transport = build_executor_transport(&config);
    let hooks = awcp_executor::ExecutorHooks {
        on_task_complete: config.hooks.on_task_complete.clone(),
        on_error: config.hooks.on_error.clone(),
    };
    Arc::new(
        ExecutorEngine::new(
            config.work_dir.clone(),
            AdmissionController::new(policy),
            transport,
            outbound,
            Arc::new(EchoTaskRunner),
        )
        .with_hooks(hooks),
    )
}

async fn start_listeners(state: Arc<AppState>, listeners: &[ConfigListener]) -> Result<Vec<Arc<dyn Listener>>> {
    let mut started = Vec::new();
    for listener_config in listeners {
        let listener: Arc<dyn Listener> = match listener_config {
            ConfigListener::Http { bind } => {
                let addr = bind.parse().with_context(|| format!("parse listener bind address {bind}"))?;
                Arc::new(HttpListener::new(addr))
            }
            ConfigListener::Ws { tunnel_url } => Arc::new(WsTunnelListener::new(tunnel_url.clone(), "", 10)),
        };
        let info = listener.start(state.clone()).await.map_err(|e| anyhow::anyhow!(e.to_string()))?;
        info!(kind = info.kind, public_url = ?info.public_url, "listener started");
        started.push(listener);
    }
    Ok(started)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("awcp=debug,awcp_daemon=debug")
    } else {
        EnvFilter::new("awcp=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if args.delegator_config.is_none() && args.executor_config.is_none() {
        anyhow::bail!("at least one of --delegator-config / --executor-config is required");
    }

    let outbound = Arc::new(HttpOutboundChannel::new());

    let delegator = match &args.delegator_config {
        Some(path) => {
            let config = load_delegator_config(path).context("load delegator config")?;
            for warning in validate_delegator_config(&config).context("validate delegator config")? {
                warn!(%warning, "delegator config warning");
            }
            Some(build_delegator(config, outbound.clone()))
        }
        None => None,
    };

    let (executor, executor_listeners) = match &args.executor_config {
        Some(path) => {
            let config = load_executor_config(path).context("load executor config")?;
            for warning in validate_executor_config(&config).context("validate executor config")? {
                warn!(%warning, "executor config warning");
            }
            let listeners = config.listeners.clone();
            (Some(build_executor(config, outbound.clone())), listeners)
        }
        None => (None, Vec::new()),
    };

    let state = Arc::new(AppState::new(delegator, executor, args.delegator_url));

    let listeners = start_listeners(state.clone(), &executor_listeners).await?;
    if listeners.is_empty() {
        warn!("no listeners configured; this daemon can only be driven as a Delegator via its own process API");
    }

    tokio::signal::ctrl_c().await.context("wait for shutdown signal")?;
    info!("shutting down");
    for listener in listeners {
        listener.stop().await;
    }
    Ok(())
}
