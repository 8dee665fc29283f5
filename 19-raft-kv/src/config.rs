//! Command-line and environment configuration for a node.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, ValueHint};

use crate::node::DEFAULT_SNAPSHOT_INTERVAL;
use crate::runtime::NodeConfig;
use crate::service::{ServiceConfig, DEFAULT_PROPOSE_TIMEOUT, DEFAULT_READ_TIMEOUT};

/// Command-line arguments for a raft-kv node.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Run a replicated key-value store node")]
pub struct Args {
    /// Numeric node ID (must match one entry in --peer unless joining)
    #[arg(long)]
    pub id: u64,

    /// Address this node should listen on for Raft messages, e.g. 127.0.0.1:7101
    #[arg(long, value_hint = ValueHint::Hostname)]
    pub listen: String,

    /// Address of the HTTP API, e.g. 127.0.0.1:9001
    #[arg(long, value_hint = ValueHint::Hostname)]
    pub http: String,

    /// Comma-separated peer map: id=addr,id=addr,... (must include self unless joining)
    #[arg(long, value_delimiter = ',', value_hint = ValueHint::Other)]
    pub peer: Vec<String>,

    /// HTTP base URL of the leader to join through, e.g. http://127.0.0.1:9001
    #[arg(long, value_hint = ValueHint::Url)]
    pub join: Option<String>,

    /// Bearer token required on mutating requests
    #[arg(long, env = "RAFT_KV_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    #[arg(long, default_value_t = DEFAULT_PROPOSE_TIMEOUT.as_millis() as u64)]
    pub propose_timeout_ms: u64,

    #[arg(long, default_value_t = DEFAULT_READ_TIMEOUT.as_millis() as u64)]
    pub read_timeout_ms: u64,

    /// Applied entries between automatic snapshots
    #[arg(long, default_value_t = DEFAULT_SNAPSHOT_INTERVAL)]
    pub snapshot_interval: u64,
}

impl Args {
    /// Parses `--peer` and checks it against `--id` and `--listen`.
    pub fn peers(&self) -> Result<HashMap<u64, String>> {
        let peers = parse_peers(&self.peer)?;
        ensure!(self.id != 0, "node id 0 is reserved");
        if self.join.is_some() {
            return Ok(peers);
        }
        ensure!(
            !peers.is_empty(),
            "at least one --peer entry is required (include self)"
        );
        match peers.get(&self.id) {
            Some(addr) if *addr == self.listen => Ok(peers),
            Some(addr) => bail!(
                "--peer maps node {} to {addr}, but --listen is {}",
                self.id,
                self.listen
            ),
            None => bail!("node id {} missing from --peer", self.id),
        }
    }

    pub fn node_config(&self) -> Result<NodeConfig> {
        Ok(NodeConfig {
            id: self.id,
            listen_addr: self.listen.clone(),
            peers: self.peers()?,
            join: self.join.is_some(),
            snapshot_interval: self.snapshot_interval,
        })
    }

    pub fn service_config(&self) -> Result<ServiceConfig> {
        Ok(ServiceConfig {
            node_id: self.id,
            http_address: self.http.clone(),
            raft_address: self.listen.clone(),
            peers: self.peers()?,
            propose_timeout: Duration::from_millis(self.propose_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
        })
    }
}

/// Parses `id=addr` entries into a peer map.
pub fn parse_peers(entries: &[String]) -> Result<HashMap<u64, String>> {
    let mut peers = HashMap::new();
    for entry in entries {
        let Some((id_str, addr)) = entry.split_once('=') else {
            bail!("invalid peer entry '{entry}', expected id=addr");
        };
        let id: u64 = id_str
            .trim()
            .parse()
            .with_context(|| format!("invalid peer id in '{entry}'"))?;
        let addr = addr.trim();
        ensure!(!addr.is_empty(), "empty address in peer entry '{entry}'");
        peers.insert(id, addr.to_string());
    }
    Ok(peers)
}
