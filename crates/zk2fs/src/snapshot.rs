//! Namespace snapshots served by the in-memory coordinator.
//!
//! A snapshot is a JSON object tree: objects are nodes with children, strings
//! are leaf data, `null` is a node without data.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::path::Path;
use zksync::coordinator::join_path;
use zksync::InMemoryCoordinator;

/// Load a snapshot file into a fresh coordinator.
pub fn load_snapshot(file: &Path) -> Result<InMemoryCoordinator> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read snapshot: {:?}", file))?;
    let value: Value =
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", file))?;

    let coord = InMemoryCoordinator::new();
    populate(&coord, "/", &value)?;
    tracing::info!("Loaded namespace snapshot from {:?}", file);
    Ok(coord)
}

/// Create the nodes described by `value` under `path`.
pub fn populate(coord: &InMemoryCoordinator, path: &str, value: &Value) -> Result<()> {
    match value {
        Value::Object(children) => {
            if path != "/" {
                coord.create(path, None);
            }
            for (name, child) in children {
                if name.is_empty() || name.contains('/') {
                    bail!("Invalid node name {:?} under {}", name, path);
                }
                populate(coord, &join_path(path, name), child)?;
            }
        }
        Value::String(data) => coord.create(path, Some(data.as_bytes())),
        Value::Null => coord.create(path, None),
        Value::Bool(_) | Value::Number(_) => {
            coord.create(path, Some(value.to_string().as_bytes()))
        }
        Value::Array(_) => bail!("Arrays are not nodes: {}", path),
    }
    Ok(())
}
