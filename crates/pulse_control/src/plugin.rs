//! Plugin identity types

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The capability a plugin provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    Collector,
    Processor,
    Publisher,
}

impl PluginType {
    pub const ALL: [PluginType; 3] = [
        PluginType::Collector,
        PluginType::Processor,
        PluginType::Publisher,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginType::Collector => "collector",
            PluginType::Processor => "processor",
            PluginType::Publisher => "publisher",
        }
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PluginType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collector" => Ok(PluginType::Collector),
            "processor" => Ok(PluginType::Processor),
            "publisher" => Ok(PluginType::Publisher),
            other => Err(format!("unknown plugin type: {other}")),
        }
    }
}

/// Identifies one plugin build: its type, name and version
///
/// Pools are bucketed by key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginKey {
    pub plugin_type: PluginType,
    pub name: String,
    pub version: i32,
}

impl PluginKey {
    pub fn new(plugin_type: PluginType, name: impl Into<String>, version: i32) -> Self {
        Self {
            plugin_type,
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for PluginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.plugin_type, self.name, self.version)
    }
}

/// A plugin known to the plugin manager (on disk, not necessarily running)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedPlugin {
    pub name: String,
    pub version: i32,
    pub plugin_type: PluginType,
    pub path: PathBuf,
}

impl LoadedPlugin {
    pub fn new(
        plugin_type: PluginType,
        name: impl Into<String>,
        version: i32,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            version,
            plugin_type,
            path: path.into(),
        }
    }

    pub fn key(&self) -> PluginKey {
        PluginKey::new(self.plugin_type, self.name.clone(), self.version)
    }
}

/// A catalogued metric and the loaded plugin that serves it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricType {
    pub namespace: Vec<String>,
    pub version: i32,
    pub plugin: LoadedPlugin,
}
