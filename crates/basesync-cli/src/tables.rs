use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use basesync_core::ResourceSpec;
use serde::Deserialize;

/// The `tables.yaml` registry of resources to synchronize.
#[derive(Debug, Clone, Deserialize)]
pub struct TableRegistry {
    pub tables: Vec<TableConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Fixed query parameters, e.g. `view` or `fields[]`.
    #[serde(default)]
    pub query: BTreeMap<String, String>,
}

fn enabled_by_default() -> bool {
    true
}

impl TableRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing table registry")?;

        let mut seen = HashSet::new();
        for table in &registry.tables {
            if table.name.trim().is_empty() {
                bail!("table registry contains an empty table name");
            }
            if !seen.insert(table.name.as_str()) {
                bail!("table {:?} is listed more than once", table.name);
            }
        }
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn resources(&self) -> Vec<ResourceSpec> {
        self.tables
            .iter()
            .filter(|table| table.enabled)
            .map(|table| ResourceSpec {
                name: table.name.clone(),
                query: table.query.clone(),
            })
            .collect()
    }
}
