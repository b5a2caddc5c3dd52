//! Replica configuration: CLI flags over a TOML file.
//!
//! The file recognizes the same keys as the command line. Replica entries
//! are `"host:port,pubkey-hex"` with an optional `;cport` suffix on the
//! address naming the client port, e.g. `"127.0.0.1:10000;20000,ab12…"`.
//! Command-line values override file values. Any inconsistency is fatal at
//! startup.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use threechain_types::{PublicKey, ReplicaId, ReplicaInfo, ReplicaSet, SecretKey};

/// Errors resolving the configuration. All fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },

    #[error("invalid replica entry {entry:?}: {reason}")]
    Replica { entry: String, reason: String },

    #[error("replica idx {idx} out of range (have {n} replicas)")]
    IdxOutOfRange { idx: u16, n: usize },

    #[error("client port not specified and not derivable from the replica entry")]
    NoClientPort,

    #[error("missing private key")]
    NoPrivKey,

    #[error("invalid private key: {0}")]
    BadPrivKey(threechain_types::CryptoError),

    #[error("unknown pace-maker {0:?} (supported: rr)")]
    UnknownPacemaker(String),

    #[error("invalid replica set: {0}")]
    ReplicaSet(#[from] threechain_types::ReplicaSetError),
}

/// threechain replica node.
///
/// Runs one replica of the replicated state machine. Options given on the
/// command line override the configuration file.
#[derive(Parser, Debug, Default)]
#[command(name = "threechain-replica")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file (TOML).
    #[arg(long, default_value = "replica.toml")]
    pub config: PathBuf,

    /// Commands per proposed block.
    #[arg(long = "block-size")]
    pub block_size: Option<u32>,

    /// Max parents per block (-1 = unlimited).
    #[arg(long = "parent-limit")]
    pub parent_limit: Option<i64>,

    /// Seconds between stat dumps.
    #[arg(long = "stat-period")]
    pub stat_period: Option<f64>,

    /// Add a replica to the list ("addr,pubkey"); repeatable.
    #[arg(short = 'a', long = "replica")]
    pub replica: Vec<String>,

    /// This replica's index in the replica list.
    #[arg(short = 'i', long)]
    pub idx: Option<u16>,

    /// TCP port listening for clients.
    #[arg(short = 'c', long)]
    pub cport: Option<u16>,

    /// This replica's private key (hex).
    #[arg(long)]
    pub privkey: Option<String>,

    /// Pacemaker variant name.
    #[arg(short = 'p', long = "pace-maker")]
    pub pace_maker: Option<String>,

    /// Fixed proposer id (where applicable).
    #[arg(short = 'l', long)]
    pub proposer: Option<u16>,

    /// Pacemaker QC timeout in seconds.
    #[arg(short = 't', long = "qc-timeout")]
    pub qc_timeout: Option<f64>,

    /// Impeachment timeout in seconds.
    #[arg(short = 'u', long = "imp-timeout")]
    pub imp_timeout: Option<f64>,

    /// Signature-verification worker count.
    #[arg(short = 'n', long)]
    pub nworker: Option<usize>,

    /// Log level filter (overrides RUST_LOG).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// The configuration file, all keys optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(rename = "block-size")]
    pub block_size: Option<u32>,
    #[serde(rename = "parent-limit")]
    pub parent_limit: Option<i64>,
    #[serde(rename = "stat-period")]
    pub stat_period: Option<f64>,
    #[serde(default)]
    pub replica: Vec<String>,
    pub idx: Option<u16>,
    pub cport: Option<u16>,
    pub privkey: Option<String>,
    #[serde(rename = "pace-maker")]
    pub pace_maker: Option<String>,
    pub proposer: Option<u16>,
    #[serde(rename = "qc-timeout")]
    pub qc_timeout: Option<f64>,
    #[serde(rename = "imp-timeout")]
    pub imp_timeout: Option<f64>,
    pub nworker: Option<usize>,
}

impl FileConfig {
    /// Load the file; a missing file is an empty config (pure-CLI runs).
    pub fn load(path: &PathBuf) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.clone(),
                    source,
                })
            }
        };
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })
    }
}

/// Supported pacemaker variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacemakerKind {
    RoundRobin,
}

/// Fully-resolved replica options.
pub struct ReplicaOptions {
    pub blk_size: usize,
    pub parent_limit: Option<usize>,
    pub stat_period: Duration,
    pub impeach_timeout: Duration,
    /// QC timeout; only meaningful to pacemaker variants that wait on
    /// certificates (parsed for compatibility, unused by round-robin).
    pub qc_timeout: Duration,
    pub nworker: usize,
    pub idx: ReplicaId,
    pub cport: u16,
    pub privkey: SecretKey,
    pub pacemaker: PacemakerKind,
    /// Fixed proposer for the dummy variant (unused by round-robin).
    pub proposer: ReplicaId,
    pub replicas: ReplicaSet,
}

impl ReplicaOptions {
    /// Merge CLI over file values and validate everything.
    pub fn resolve(cli: Cli, file: FileConfig) -> Result<Self, ConfigError> {
        let entries = if cli.replica.is_empty() {
            file.replica
        } else {
            cli.replica
        };

        let mut infos = Vec::with_capacity(entries.len());
        let mut client_ports = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let (addr, cport, key) = parse_replica_entry(entry)?;
            infos.push(ReplicaInfo {
                id: ReplicaId(i as u16),
                addr,
                public_key: key,
            });
            client_ports.push(cport);
        }
        let replicas = ReplicaSet::new(infos)?;

        let idx = cli.idx.or(file.idx).unwrap_or(0);
        if idx as usize >= replicas.len() {
            return Err(ConfigError::IdxOutOfRange {
                idx,
                n: replicas.len(),
            });
        }

        let cport = cli
            .cport
            .or(file.cport)
            .or(client_ports[idx as usize])
            .ok_or(ConfigError::NoClientPort)?;

        let privkey_hex = cli
            .privkey
            .or(file.privkey)
            .ok_or(ConfigError::NoPrivKey)?;
        let privkey = SecretKey::from_hex(&privkey_hex).map_err(ConfigError::BadPrivKey)?;

        let pacemaker = match cli
            .pace_maker
            .or(file.pace_maker)
            .unwrap_or_else(|| "rr".to_string())
            .as_str()
        {
            "rr" => PacemakerKind::RoundRobin,
            other => return Err(ConfigError::UnknownPacemaker(other.to_string())),
        };

        let parent_limit = match cli.parent_limit.or(file.parent_limit).unwrap_or(-1) {
            v if v < 0 => None,
            v => Some(v as usize),
        };

        Ok(Self {
            blk_size: cli.block_size.or(file.block_size).unwrap_or(1) as usize,
            parent_limit,
            stat_period: Duration::from_secs_f64(
                cli.stat_period.or(file.stat_period).unwrap_or(10.0),
            ),
            impeach_timeout: Duration::from_secs_f64(
                cli.imp_timeout.or(file.imp_timeout).unwrap_or(11.0),
            ),
            qc_timeout: Duration::from_secs_f64(
                cli.qc_timeout.or(file.qc_timeout).unwrap_or(0.5),
            ),
            nworker: cli.nworker.or(file.nworker).unwrap_or(4),
            idx: ReplicaId(idx),
            cport,
            privkey,
            pacemaker,
            proposer: ReplicaId(cli.proposer.or(file.proposer).unwrap_or(0)),
            replicas,
        })
    }
}

/// Parse `"host:port[;cport],pubkey-hex"`.
fn parse_replica_entry(
    entry: &str,
) -> Result<(SocketAddr, Option<u16>, PublicKey), ConfigError> {
    let err = |reason: &str| ConfigError::Replica {
        entry: entry.to_string(),
        reason: reason.to_string(),
    };

    let (addr_part, key_part) = entry
        .split_once(',')
        .ok_or_else(|| err("expected \"addr,pubkey\""))?;
    let addr_part = addr_part.trim();
    let key_part = key_part.trim();

    let (addr_str, cport) = match addr_part.split_once(';') {
        Some((addr, cport)) => {
            let cport = cport
                .trim()
                .parse::<u16>()
                .map_err(|_| err("invalid cport"))?;
            (addr.trim(), Some(cport))
        }
        None => (addr_part, None),
    };

    let addr: SocketAddr = addr_str
        .parse()
        .map_err(|_| err("invalid socket address"))?;
    let key = PublicKey::from_hex(key_part).map_err(|_| err("invalid public key hex"))?;
    Ok((addr, cport, key))
}
