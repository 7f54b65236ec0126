//! Source Aliases
//!
//! Maps upstream endpoint URLs to short, stable source tags. Loaded once at
//! startup from `SRC_ALIASES` (`alias=url,alias=url`) and read-only afterwards.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

/// Environment variable holding the alias list
pub const ALIASES_ENV: &str = "SRC_ALIASES";

#[derive(Error, Debug, PartialEq)]
pub enum AliasError {
    #[error("Invalid alias entry '{0}', expected alias=url")]
    InvalidEntry(String),
}

/// Immutable `url -> tag` map
#[derive(Debug, Clone, Default)]
pub struct SourceAliases {
    by_url: HashMap<String, String>,
}

impl SourceAliases {
    /// Parse `alias=url` pairs separated by commas; blank entries are skipped
    pub fn parse(input: &str) -> Result<Self, AliasError> {
        let mut by_url = HashMap::new();
        for entry in input.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (alias, url) = entry
                .split_once('=')
                .map(|(a, u)| (a.trim(), u.trim()))
                .filter(|(a, u)| !a.is_empty() && !u.is_empty())
                .ok_or_else(|| AliasError::InvalidEntry(entry.to_string()))?;
            debug!(alias, url, "registered source alias");
            by_url.insert(url.to_string(), alias.to_string());
        }
        Ok(Self { by_url })
    }

    /// Load from `SRC_ALIASES`; unset means no aliases
    pub fn from_env() -> Result<Self, AliasError> {
        match std::env::var(ALIASES_ENV) {
            Ok(value) => Self::parse(&value),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Tag for an endpoint: its alias if one exists, otherwise `default`
    pub fn tag_for(&self, url: &str, default: &str) -> String {
        self.by_url
            .get(url)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    pub fn len(&self) -> usize {
        self.by_url.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_url.is_empty()
    }
}
