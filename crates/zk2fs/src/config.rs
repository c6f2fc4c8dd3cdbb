//! Configuration loading and management

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main configuration for the mirror daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Subtrees to mirror, in the order they are synced
    #[serde(default = "default_mirrors")]
    pub mirrors: Vec<MirrorSpec>,

    /// Path prefixes that never change once written; synced once, then marked done
    #[serde(default)]
    pub static_prefixes: Vec<String>,
}

/// One mirrored subtree
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MirrorSpec {
    /// Coordination path of the subtree root
    pub path: String,

    /// Shape of the subtree
    #[serde(default)]
    pub kind: MirrorKind,

    /// Keep data watches on the leaves
    #[serde(default)]
    pub watch_data: bool,
}

impl MirrorSpec {
    pub fn new(path: &str, kind: MirrorKind, watch_data: bool) -> Self {
        Self {
            path: path.to_string(),
            kind,
            watch_data,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MirrorKind {
    /// Children are leaf values
    #[default]
    Leaves,
    /// Children are directories of leaf values
    Subtrees,
    /// Children are trace shards holding trace event names
    TraceShards,
}

fn default_mirrors() -> Vec<MirrorSpec> {
    vec![
        MirrorSpec::new("/servers", MirrorKind::Leaves, false),
        // Running entries are ephemeral and come and go with their nodes.
        MirrorSpec::new("/running", MirrorKind::Leaves, false),
        MirrorSpec::new("/scheduled", MirrorKind::Leaves, false),
        MirrorSpec::new("/app-groups", MirrorKind::Leaves, true),
        MirrorSpec::new("/placement", MirrorKind::Leaves, true),
        MirrorSpec::new("/endpoints", MirrorKind::Subtrees, true),
        MirrorSpec::new("/identity-groups", MirrorKind::Subtrees, true),
        MirrorSpec::new("/trace", MirrorKind::TraceShards, false),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mirrors: default_mirrors(),
            static_prefixes: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let Some(config_file) = config_file else {
            tracing::info!("No config file given, using defaults");
            return Ok(Config::default());
        };

        if config_file.exists() {
            let content = std::fs::read_to_string(config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: Config = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {:?}", config_file))?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_file
            );
            Ok(Config::default())
        }
    }

    /// Whether `path` lies under a static prefix
    pub fn is_static(&self, path: &str) -> bool {
        self.static_prefixes.iter().any(|prefix| {
            let prefix = prefix.trim_end_matches('/');
            path == prefix || path.starts_with(&format!("{}/", prefix))
        })
    }
}
