//! Command Line Configuration
//!
//! Every flag has an environment fallback so the collector can be configured
//! entirely from the environment in containers.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};
use thiserror::Error;

use crate::alias::{AliasError, SourceAliases};
use crate::files::{expand_path, is_valid_uid};
use crate::logging::LogOptions;
use crate::source::{SourceError, SourceKind, SourceSpec};

/// Default capacity of the shared ingress channel
pub const DEFAULT_INGRESS_CAPACITY: usize = 1024;

/// Smallest accepted ingress capacity
pub const MIN_INGRESS_CAPACITY: usize = 100;

/// Errors found while turning flags into runtime configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No sources configured: pass --node or a provider credential")]
    NoSources,

    #[error("Invalid uid {0:?}: must not contain '_' or path separators")]
    InvalidUid(String),

    #[error("Ingress capacity {0} is below the minimum of {MIN_INGRESS_CAPACITY}")]
    IngressCapacity(usize),

    #[error("Invalid source: {0}")]
    Source(#[from] SourceError),

    #[error("Invalid SRC_ALIASES: {0}")]
    Alias(#[from] AliasError),
}

/// Mempool transaction collector
#[derive(Debug, Clone, Parser)]
#[command(name = "mempool-collector", version, about)]
pub struct Cli {
    /// Base directory for the transaction and sourcelog CSV files.
    #[arg(long, env = "MEMPOOL_OUT")]
    pub out: String,

    /// Unique id embedded in file names; random when unset.
    #[arg(long, env = "MEMPOOL_UID")]
    pub uid: Option<String>,

    /// Full-node WebSocket URL; repeat for several nodes.
    #[arg(long = "node", env = "MEMPOOL_NODES", value_delimiter = ',')]
    pub nodes: Vec<String>,

    #[command(flatten)]
    pub providers: ProviderArgs,

    #[command(flatten)]
    pub receivers: ReceiverArgs,

    #[command(flatten)]
    pub server: ServerArgs,

    /// Do not write the per-observation sourcelog files.
    #[arg(long, default_value_t = false)]
    pub no_sourcelog: bool,

    /// Capacity of the channel between connectors and the processor.
    #[arg(long, env = "MEMPOOL_INGRESS_CAPACITY", default_value_t = DEFAULT_INGRESS_CAPACITY)]
    pub ingress_capacity: usize,

    #[command(flatten)]
    pub log: LogArgs,
}

/// Commercial mempool feeds. A provider is enabled by its credential.
#[derive(Debug, Clone, Default, Args)]
#[group()]
pub struct ProviderArgs {
    /// bloXroute authorization header.
    #[arg(long, env = "BLX_AUTH_HEADER")]
    pub blx_token: Option<String>,

    /// bloXroute endpoint; `ws://`/`wss://` selects WebSocket, anything else gRPC.
    #[arg(long, env = "BLX_ENDPOINT")]
    pub blx_endpoint: Option<String>,

    /// Eden authorization header.
    #[arg(long, env = "EDEN_AUTH_HEADER")]
    pub eden_token: Option<String>,

    #[arg(long, env = "EDEN_ENDPOINT")]
    pub eden_endpoint: Option<String>,

    /// Chainbound Fiber API key.
    #[arg(long, env = "CHAINBOUND_API_KEY")]
    pub chainbound_api_key: Option<String>,

    #[arg(long, env = "CHAINBOUND_ENDPOINT")]
    pub chainbound_endpoint: Option<String>,

    /// Merkle API key.
    #[arg(long, env = "MERKLE_API_KEY")]
    pub merkle_key: Option<String>,

    #[arg(long, env = "MERKLE_ENDPOINT")]
    pub merkle_endpoint: Option<String>,
}

/// HTTP receivers for first-seen transactions.
#[derive(Debug, Clone, Default, Args)]
#[group()]
pub struct ReceiverArgs {
    /// Receiver URL; repeat for several receivers.
    #[arg(long = "receiver", env = "MEMPOOL_RECEIVERS", value_delimiter = ',')]
    pub receivers: Vec<String>,

    /// Only forward transactions first seen by these source tags; empty forwards all.
    #[arg(long, env = "MEMPOOL_RECEIVERS_ALLOWED_SOURCES", value_delimiter = ',')]
    pub receivers_allowed_sources: Vec<String>,
}

/// Parameters used to configure the HTTP server.
#[derive(Debug, Clone, Args)]
#[group()]
pub struct ServerArgs {
    /// Address for the SSE and health endpoints; the server is disabled when unset.
    #[arg(long, env = "MEMPOOL_API_LISTEN_ADDR")]
    pub api_listen_addr: Option<String>,

    /// Timeout for non-streaming routes, in seconds.
    #[arg(long, env = "MEMPOOL_HTTP_TIMEOUT_SECS", default_value_t = 10)]
    pub http_timeout_secs: u64,

    /// Upper bound on graceful shutdown, in seconds.
    #[arg(long, env = "MEMPOOL_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Default, Args)]
#[group()]
pub struct LogArgs {
    /// Verbose logging.
    #[arg(long, env = "DEBUG", default_value_t = false)]
    pub debug: bool,

    /// One JSON object per log line.
    #[arg(long, default_value_t = false)]
    pub log_json: bool,
}

impl Cli {
    /// Check the values clap cannot check on its own
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(uid) = self.uid() {
            if !is_valid_uid(uid) {
                return Err(ConfigError::InvalidUid(uid.to_string()));
            }
        }
        if self.ingress_capacity < MIN_INGRESS_CAPACITY {
            return Err(ConfigError::IngressCapacity(self.ingress_capacity));
        }
        Ok(())
    }

    /// Output directory with `~` expanded
    pub fn out_dir(&self) -> PathBuf {
        expand_path(&self.out)
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref().filter(|uid| !uid.is_empty())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.http_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_grace_secs)
    }

    pub fn log_options(&self) -> LogOptions {
        LogOptions::from_env(self.log.debug, self.log.log_json)
    }

    /// Turn flags into one [`SourceSpec`] per configured upstream
    pub fn source_specs(&self, aliases: &SourceAliases) -> Result<Vec<SourceSpec>, ConfigError> {
        let mut specs = Vec::new();

        for node in self.nodes.iter().filter(|n| !n.is_empty()) {
            specs.push(SourceSpec::new(SourceKind::Node, Some(node.clone()), None, aliases)?);
        }

        let p = &self.providers;
        let providers = [
            (SourceKind::Bloxroute, &p.blx_token, &p.blx_endpoint),
            (SourceKind::Eden, &p.eden_token, &p.eden_endpoint),
            (SourceKind::Chainbound, &p.chainbound_api_key, &p.chainbound_endpoint),
            (SourceKind::Merkle, &p.merkle_key, &p.merkle_endpoint),
        ];
        for (kind, auth, endpoint) in providers {
            let Some(auth) = auth.as_ref().filter(|a| !a.is_empty()) else {
                continue;
            };
            let endpoint = endpoint.clone().filter(|e| !e.is_empty());
            specs.push(SourceSpec::new(kind, endpoint, Some(auth.clone()), aliases)?);
        }

        if specs.is_empty() {
            return Err(ConfigError::NoSources);
        }
        Ok(specs)
    }
}
