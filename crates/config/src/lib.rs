use std::fs::{read_to_string, write};

use camino::{Utf8Path, Utf8PathBuf};
use eyre::{Result as EyreResult, WrapErr};
use jointmesh_network::NetworkConfig;
use jointmesh_primitives::id::UnitId;
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Default, Deserialize, Serialize)]
#[non_exhaustive]
pub struct ConfigFile {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub node: NodeSection,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[non_exhaustive]
pub struct NodeSection {
    /// Witness addresses seeded on first start.
    #[serde(default)]
    pub witnesses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genesis_unit: Option<UnitId>,
}

impl NodeSection {
    #[must_use]
    pub const fn new(witnesses: Vec<String>, genesis_unit: Option<UnitId>) -> Self {
        Self {
            witnesses,
            genesis_unit,
        }
    }
}

impl ConfigFile {
    #[must_use]
    pub const fn new(network: NetworkConfig, node: NodeSection) -> Self {
        Self { network, node }
    }

    #[must_use]
    pub fn path(dir: &Utf8Path) -> Utf8PathBuf {
        dir.join(CONFIG_FILE)
    }

    #[must_use]
    pub fn exists(dir: &Utf8Path) -> bool {
        Self::path(dir).is_file()
    }

    pub fn load(dir: &Utf8Path) -> EyreResult<Self> {
        let path = Self::path(dir);

        let content = read_to_string(&path).wrap_err_with(|| {
            format!("failed to read configuration from {path:?}")
        })?;

        toml::from_str(&content)
            .wrap_err_with(|| format!("failed to parse configuration from {path:?}"))
    }

    pub fn save(&self, dir: &Utf8Path) -> EyreResult<()> {
        let path = Self::path(dir);

        let content = toml::to_string_pretty(self)?;

        write(&path, content)
            .wrap_err_with(|| format!("failed to write configuration to {path:?}"))
    }
}

#[cfg(test)]
#[path = "tests/lib.rs"]
mod tests;
