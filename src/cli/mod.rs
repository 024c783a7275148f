use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::agent::Agent;
use crate::config::{
    load_private_config, normalize_roots, parse_duration, parse_size, system_hostname,
    AgentConfig,
};
use crate::logging::{LogOptions, LogSink};
use crate::store::{StoreLocation, StoreOptions};

/// Resident filesystem indexing agent
#[derive(Parser, Debug)]
#[command(name = "fsindex-agent")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Comma-separated list of directories to index
    #[arg(long, value_delimiter = ',', required = true)]
    pub indexing_paths: Vec<String>,

    /// Store location: lmdb://DIR, tantivy://DIR, or a plain directory (LMDB)
    #[arg(long)]
    pub dbhost: String,

    /// Database name inside the store location
    #[arg(long)]
    pub dbid: String,

    /// JSON file with private store settings (must be mode 0600 or stricter)
    #[arg(long)]
    pub db_priv_cfg: Option<PathBuf>,

    /// Host identity for stored records (defaults to the system hostname)
    #[arg(long)]
    pub hostname: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Republish every existing entry on startup
    #[arg(long)]
    pub reindex: bool,

    /// Remove stale and misconfigured records after startup
    #[arg(long)]
    pub cleanup: bool,

    /// How often watchers flush coalesced events (e.g. 5s, 500ms)
    #[arg(long, default_value = "5s", value_parser = duration_arg)]
    pub flush_period: Duration,

    /// Compute SHA-1 checksums of regular files
    #[arg(long)]
    pub checksums: bool,

    /// Skip checksums for files larger than this (K/M/G/T suffixes, 0 = no limit)
    #[arg(long, default_value = "0", value_parser = size_arg)]
    pub max_checksum_size: u64,

    /// Count store changes without applying them
    #[arg(long)]
    pub db_readonly: bool,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Omit timestamps from log lines
    #[arg(long)]
    pub nologts: bool,
}

fn duration_arg(s: &str) -> std::result::Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

fn size_arg(s: &str) -> std::result::Result<u64, String> {
    parse_size(s).map_err(|e| e.to_string())
}

impl Cli {
    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            debug: self.debug,
            timestamps: !self.nologts,
            file: self.log_file.clone(),
        }
    }

    /// Resolves flags into an `AgentConfig`, reading the private config
    /// file and the system hostname as needed.
    pub fn into_config(self, cwd: &Path) -> crate::error::Result<AgentConfig> {
        let hostname = match &self.hostname {
            Some(h) => h.trim().to_lowercase(),
            None => system_hostname()?,
        };
        let store = match &self.db_priv_cfg {
            Some(path) => load_private_config(path)?,
            None => StoreOptions::default(),
        };

        let config = AgentConfig {
            roots: normalize_roots(&self.indexing_paths, cwd),
            location: StoreLocation::parse(&self.dbhost)?,
            dbid: self.dbid,
            hostname,
            log_file: self.log_file,
            reindex: self.reindex,
            cleanup: self.cleanup,
            flush_period: self.flush_period,
            checksums: self.checksums,
            max_checksum_size: self.max_checksum_size,
            read_only: self.db_readonly,
            debug: self.debug,
            no_log_timestamps: self.nologts,
            store,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Runs the agent until it is told to stop.
pub async fn run(cli: Cli, log: LogSink) -> Result<()> {
    let cwd = std::env::current_dir().context("cannot determine current directory")?;
    let config = cli.into_config(&cwd).context("invalid configuration")?;

    let agent = Agent::start(config, Some(log))
        .await
        .context("agent failed to start")?;
    agent.run().await?;
    info!("fsindex-agent exiting");
    Ok(())
}
