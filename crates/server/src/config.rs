use anyhow::Context;
use clap::Parser;
use hexforge_engine::{CraftError, Engine, NewNode};
use hexforge_protocol::{Blueprint, ItemStorage};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sweeper::SweepSettings;

#[derive(Debug, Clone, Default, Parser)]
#[command(name = "hexforge-server", about = "Crafting queue service for Hexforge nodes")]
pub struct Cli {
    /// YAML config file; flags below override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub addr: Option<SocketAddr>,
    #[arg(long)]
    pub db: Option<PathBuf>,
    /// YAML seed with cores, node kinds, blueprints and nodes.
    #[arg(long)]
    pub seed: Option<PathBuf>,
    #[arg(long)]
    pub sweep_interval_ms: Option<u64>,
    #[arg(long)]
    pub sweep_batch: Option<usize>,
    #[arg(long)]
    pub sweep_budget_ms: Option<u64>,
    #[arg(long)]
    pub catalog_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub seed: Option<PathBuf>,
    pub sweep_interval_ms: u64,
    pub sweep_batch: usize,
    pub sweep_budget_ms: u64,
    pub catalog_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let db_path = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hexforge")
            .join("hexforge.db");
        Self {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 39333),
            db_path,
            seed: None,
            sweep_interval_ms: 1_000,
            sweep_batch: 64,
            sweep_budget_ms: 250,
            catalog_ttl_secs: 300,
        }
    }
}

impl ServerConfig {
    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("parse server config")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("config: {}", path.display()))
    }

    /// Config file (if any) with CLI flags layered on top.
    pub fn resolve(cli: &Cli) -> anyhow::Result<Self> {
        let base = match &cli.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        Ok(base.with_overrides(cli))
    }

    pub fn with_overrides(mut self, cli: &Cli) -> Self {
        if let Some(addr) = cli.addr {
            self.addr = addr;
        }
        if let Some(db) = &cli.db {
            self.db_path = db.clone();
        }
        if let Some(seed) = &cli.seed {
            self.seed = Some(seed.clone());
        }
        if let Some(ms) = cli.sweep_interval_ms {
            self.sweep_interval_ms = ms;
        }
        if let Some(n) = cli.sweep_batch {
            self.sweep_batch = n;
        }
        if let Some(ms) = cli.sweep_budget_ms {
            self.sweep_budget_ms = ms;
        }
        if let Some(secs) = cli.catalog_ttl_secs {
            self.catalog_ttl_secs = secs;
        }
        self
    }

    pub fn sweep_settings(&self) -> SweepSettings {
        SweepSettings {
            interval: Duration::from_millis(self.sweep_interval_ms.max(1)),
            batch: self.sweep_batch.max(1),
            budget: Duration::from_millis(self.sweep_budget_ms),
        }
    }

    pub fn catalog_ttl(&self) -> Duration {
        Duration::from_secs(self.catalog_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoreSeed {
    pub id: String,
    pub efficiency: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeKindSeed {
    pub node_type: String,
    #[serde(default)]
    pub requires_core: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSeed {
    pub id: String,
    pub node_type: String,
    #[serde(default)]
    pub tier: u32,
    pub owner_player_id: String,
    pub session_id: String,
    #[serde(default)]
    pub installed_core_id: Option<String>,
    #[serde(default)]
    pub storage: ItemStorage,
}

/// Bootstrap data. Existing nodes are left alone; everything else is upserted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SeedFile {
    pub cores: Vec<CoreSeed>,
    pub node_kinds: Vec<NodeKindSeed>,
    pub blueprints: Vec<Blueprint>,
    pub nodes: Vec<NodeSeed>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub cores: usize,
    pub node_kinds: usize,
    pub blueprints: usize,
    pub nodes_created: usize,
    pub nodes_skipped: usize,
}

impl SeedFile {
    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("parse seed file")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read seed: {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("seed: {}", path.display()))
    }

    pub fn apply(&self, engine: &Engine) -> anyhow::Result<SeedReport> {
        let mut report = SeedReport::default();
        for core in &self.cores {
            engine.set_core_efficiency(&core.id, core.efficiency)?;
            report.cores += 1;
        }
        for kind in &self.node_kinds {
            engine.set_node_kind(&kind.node_type, kind.requires_core)?;
            report.node_kinds += 1;
        }
        for bp in &self.blueprints {
            engine.upsert_blueprint(bp)?;
            report.blueprints += 1;
        }
        for node in &self.nodes {
            match engine.get_storage(&node.id) {
                Ok(_) => {
                    report.nodes_skipped += 1;
                    continue;
                }
                Err(CraftError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
            engine.create_node(&NewNode {
                id: node.id.clone(),
                node_type: node.node_type.clone(),
                tier: node.tier,
                owner_player_id: node.owner_player_id.clone(),
                session_id: node.session_id.clone(),
                installed_core_id: node.installed_core_id.clone(),
                storage: node.storage.clone(),
            })?;
            report.nodes_created += 1;
        }
        Ok(report)
    }
}
