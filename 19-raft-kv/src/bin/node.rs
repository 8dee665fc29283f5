//! CLI entry point for running a raft-kv node.
//!
//! # Example usage
//!
//! Start a 3-node cluster:
//! ```bash
//! # Terminal 1 (node 1)
//! cargo run --bin node -- \
//!   --id 1 --listen 127.0.0.1:7101 --http 127.0.0.1:9001 \
//!   --peer 1=127.0.0.1:7101,2=127.0.0.1:7102,3=127.0.0.1:7103
//!
//! # Terminals 2 and 3: same peers, --id 2/3, --listen 127.0.0.1:7102/7103,
//! # --http 127.0.0.1:9002/9003
//!
//! # A fourth node joining through the leader's HTTP API
//! cargo run --bin node -- \
//!   --id 4 --listen 127.0.0.1:7104 --http 127.0.0.1:9004 \
//!   --join http://127.0.0.1:9001
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};

use raft_kv::api::{router, JoinRequest, LEADER_HEADER};
use raft_kv::auth::AuthGate;
use raft_kv::config::Args;
use raft_kv::engine::ConsensusEngine;
use raft_kv::fsm::KvStateMachine;
use raft_kv::runtime::spawn_node;
use raft_kv::service::KvService;
use raft_kv::store::KvStore;

const JOIN_ATTEMPTS: u32 = 10;
const JOIN_RETRY_DELAY: Duration = Duration::from_secs(1);

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let node_config = args.node_config()?;
    let service_config = args.service_config()?;

    let store = Arc::new(KvStore::new());
    let fsm = KvStateMachine::new(Arc::clone(&store));
    let applied = fsm.applied();
    let handle = spawn_node(node_config, fsm)?;

    let engine: Arc<dyn ConsensusEngine> = Arc::new(handle.clone());
    let service = Arc::new(KvService::new(service_config, engine, store, applied));
    let gate = AuthGate::new(args.auth_token.clone());
    if !gate.is_enabled() {
        warn!("no auth token configured, mutating endpoints are open");
    }
    let app = router(service, gate);

    let listener = tokio::net::TcpListener::bind(&args.http)
        .await
        .with_context(|| format!("failed to bind HTTP address {}", args.http))?;
    info!(node = args.id, http = %args.http, raft = %args.listen, "serving HTTP API");

    if let Some(url) = args.join.clone() {
        let request = JoinRequest {
            id: args.id,
            address: args.listen.clone(),
        };
        let token = args.auth_token.clone();
        tokio::spawn(async move {
            if let Err(err) = join_cluster(&url, &request, token.as_deref()).await {
                warn!(error = ?err, "could not join the cluster");
            }
        });
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("HTTP server failed")?;

    handle.shutdown()?;
    Ok(())
}

/// Asks the leader at `base_url` to add this node, retrying a bounded number
/// of times while the cluster elects a leader or the leader is unreachable.
async fn join_cluster(base_url: &str, request: &JoinRequest, token: Option<&str>) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .context("failed to build HTTP client")?;
    let url = format!("{}/join", base_url.trim_end_matches('/'));

    for attempt in 1..=JOIN_ATTEMPTS {
        let mut post = client.post(&url).json(request);
        if let Some(token) = token {
            post = post.bearer_auth(token);
        }
        match post.send().await {
            Ok(response) if response.status().is_success() => {
                info!(url = %url, id = request.id, "joined cluster");
                return Ok(());
            }
            Ok(response) => {
                let status = response.status();
                let leader = response
                    .headers()
                    .get(LEADER_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_owned);
                let body = response.text().await.unwrap_or_default();
                warn!(attempt, %status, ?leader, body = body.trim(), "join rejected");
                if status == reqwest::StatusCode::UNAUTHORIZED {
                    bail!("join rejected by auth gate: {}", body.trim());
                }
            }
            Err(err) => warn!(attempt, error = %err, "join request failed"),
        }
        tokio::time::sleep(JOIN_RETRY_DELAY).await;
    }
    bail!("gave up joining through {url} after {JOIN_ATTEMPTS} attempts")
}
