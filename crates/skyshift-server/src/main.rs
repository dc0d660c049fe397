//! SkyShift control plane binary
//!
//! Hosts the API server, the scheduler and the skylet manager in one
//! process. The scheduler and skylets consume the control plane through
//! the same HTTP API external clients use, authenticated as the
//! bootstrap admin.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use skyshift_api::{ApiServerConfig, AppState, AuthConfig, AuthHandle, ADMIN_USER};
use skyshift_client::ApiClient;
use skyshift_common::retry::{with_backoff, BackoffPolicy};
use skyshift_common::telemetry::{init_telemetry, TelemetryConfig};
use skyshift_common::{Error, Result};
use skyshift_scheduler::{FilterComposition, SchedulerConfig, SchedulerController};
use skyshift_skylet::{SkyletConfig, SkyletManager};
use skyshift_store::{EtcdStore, KvStore, MemoryStore};

/// SkyShift - a multi-cluster orchestrator control plane
#[derive(Parser, Debug)]
#[command(name = "skyshift-server", version, about, long_about = None)]
struct Cli {
    /// Address the API server listens on
    #[arg(long, env = "SKYSHIFT_LISTEN", default_value = "127.0.0.1:50051")]
    listen: SocketAddr,

    /// etcd endpoints; empty runs on the in-process store
    #[arg(long, env = "SKYSHIFT_ETCD_ENDPOINTS", value_delimiter = ',')]
    etcd_endpoints: Vec<String>,

    /// Bootstrap admin password
    #[arg(long, env = "SKYSHIFT_ADMIN_PASSWORD", default_value = "admin")]
    admin_password: String,

    /// Token signing key; generated at startup when unset
    #[arg(long, env = "SKYSHIFT_SIGNING_KEY")]
    signing_key: Option<String>,

    /// Session token lifetime in seconds
    #[arg(long, default_value = "86400")]
    session_ttl_secs: u64,

    /// Signing key rotation period in seconds
    #[arg(long, default_value = "604800")]
    signing_key_ttl_secs: u64,

    /// Scheduler plugin pipeline
    #[arg(long, value_delimiter = ',', default_values_t = ["default".to_string(), "cluster-affinity".to_string()])]
    scheduler_plugins: Vec<String>,

    /// How placement filter stanzas compose: "or" or "and"
    #[arg(long, default_value = "or")]
    filter_composition: String,

    /// Evict jobs pending longer than this many seconds; 0 waits forever
    #[arg(long, default_value = "0")]
    wait_timeout_secs: u64,

    /// Run only the API server (no scheduler, no skylets)
    #[arg(long)]
    api_only: bool,

    /// Log in a human-readable format instead of JSON
    #[arg(long)]
    pretty_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        service_name: "skyshift-server".to_string(),
        json: !cli.pretty_logs,
    })
    .map_err(|e| Error::fatal("server", e.to_string()))?;

    let kv: Arc<dyn KvStore> = if cli.etcd_endpoints.is_empty() {
        info!("no etcd endpoints configured, using the in-process store");
        Arc::new(MemoryStore::new())
    } else {
        info!(endpoints = ?cli.etcd_endpoints, "connecting to etcd");
        Arc::new(EtcdStore::connect(&cli.etcd_endpoints).await?)
    };

    let session_ttl = Duration::from_secs(cli.session_ttl_secs);
    let auth = match &cli.signing_key {
        Some(key) => AuthHandle::new(AuthConfig::new(key.clone().into_bytes(), session_ttl)),
        None => AuthHandle::new(AuthConfig::generate(session_ttl)?),
    };
    let state = AppState::new(kv, auth.clone());

    let api_config = ApiServerConfig {
        listen_addr: cli.listen,
        admin_password: cli.admin_password.clone(),
        session_ttl,
        signing_key_ttl: Duration::from_secs(cli.signing_key_ttl_secs),
    };

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let api_task = {
        let state = state.clone();
        let config = api_config.clone();
        let token = cancel.clone();
        tokio::spawn(async move { skyshift_api::serve(&config, state, token).await })
    };

    let mut controller_tasks = Vec::new();
    if !cli.api_only {
        // The controllers authenticate like any other client.
        let client = wait_for_api(&cli.listen, &auth, cancel.clone()).await?;

        let scheduler_config = SchedulerConfig {
            plugins: cli.scheduler_plugins.clone(),
            filter_composition: cli.filter_composition.parse::<FilterComposition>()?,
            ..Default::default()
        };
        let scheduler = SchedulerController::new(client.clone(), scheduler_config)?;
        let scheduler_token = cancel.child_token();
        controller_tasks.push(tokio::spawn(async move {
            scheduler.run(scheduler_token).await;
        }));

        let skylet_config = SkyletConfig {
            wait_timeout: (cli.wait_timeout_secs > 0)
                .then(|| Duration::from_secs(cli.wait_timeout_secs)),
            ..Default::default()
        };
        let manager = SkyletManager::new(client, skylet_config);
        let manager_token = cancel.child_token();
        controller_tasks.push(tokio::spawn(async move {
            manager.run(manager_token).await;
        }));
    }

    match api_task.await {
        Ok(Ok(())) => info!("API server exited cleanly"),
        Ok(Err(err)) => error!(error = %err, "API server failed"),
        Err(join_err) => error!(error = %join_err, "API server task panicked"),
    }
    cancel.cancel();
    for task in controller_tasks {
        let _ = task.await;
    }
    info!("shutdown complete");
    Ok(())
}

/// Cancel everything on ctrl-c
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, shutting down");
            cancel.cancel();
        }
    });
}

/// Wait until the API answers health checks, then return an
/// admin-authenticated client for the in-process controllers.
async fn wait_for_api(
    listen: &SocketAddr,
    auth: &AuthHandle,
    cancel: CancellationToken,
) -> Result<ApiClient> {
    let base_url = format!("http://{listen}");
    let probe = ApiClient::new(base_url.clone());
    let policy = BackoffPolicy {
        base: Duration::from_millis(100),
        ceiling: Duration::from_secs(2),
        growth: 2.0,
        attempt_budget: Some(30),
    };

    with_backoff(&policy, "wait_for_api", || {
        let probe = probe.clone();
        let cancel = cancel.clone();
        async move {
            if cancel.is_cancelled() {
                return Err(Error::fatal("server", "cancelled during startup"));
            }
            // An unauthenticated list is rejected with 401 once the
            // server is up; any HTTP answer beats a connection error.
            match probe
                .list(skyshift_common::object::Kind::Namespace, None)
                .await
            {
                Ok(_) => Ok(()),
                Err(Error::Unauthorized { .. }) => Ok(()),
                Err(err) if matches!(err, Error::Transient { .. }) => Err(err),
                Err(_) => Ok(()),
            }
        }
    })
    .await?;

    // The in-process controllers hold a session minted directly off the
    // signing key rather than a password round-trip.
    let token = auth.create_session_token(ADMIN_USER)?;
    Ok(ApiClient::new(base_url).with_token(token))
}
