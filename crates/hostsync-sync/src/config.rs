//! Run options and YAML column settings.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ReconcileError;

pub const SETTINGS_ENV: &str = "HOSTSYNC_SETTINGS";
pub const CONTENT_HOSTS: &str = "content-hosts";

/// A user-declared export column: `json` is the path walked through the host record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomColumn {
    pub name: String,
    pub json: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CommandColumns {
    #[serde(default)]
    pub export: Option<Vec<String>>,
    #[serde(default)]
    pub define: Vec<CustomColumn>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub columns: BTreeMap<String, CommandColumns>,
}

impl Settings {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing column settings")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Load from `explicit`, else `HOSTSYNC_SETTINGS`, else defaults.
    pub fn resolve(explicit: Option<PathBuf>) -> Result<Self> {
        match explicit.or_else(|| std::env::var(SETTINGS_ENV).ok().map(PathBuf::from)) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn content_hosts(&self) -> CommandColumns {
        self.columns.get(CONTENT_HOSTS).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Rows describe one subscription each and only update subscriptions.
    pub itemized_subscriptions: bool,
    pub clear_subscriptions: bool,
    pub organization: Option<String>,
    pub search: Option<String>,
    /// Only meaningful for export; rejected here.
    pub columns: Option<Vec<String>>,
}

impl ImportOptions {
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.columns.is_some() {
            return Err(ReconcileError::Precondition(
                "--columns option only relevant with --export".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub itemized_subscriptions: bool,
    pub clear_subscriptions: bool,
    /// Explicit column list; overrides the settings' export list.
    pub columns: Option<Vec<String>>,
    pub organization: Option<String>,
    pub search: Option<String>,
    pub settings_columns: Option<Vec<String>>,
    pub custom_columns: Vec<CustomColumn>,
}

impl ExportOptions {
    pub fn with_settings(mut self, settings: &Settings) -> Self {
        let columns = settings.content_hosts();
        self.settings_columns = columns.export;
        self.custom_columns = columns.define;
        self
    }

    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.clear_subscriptions {
            return Err(ReconcileError::Precondition(
                "--clear-subscriptions option only relevant during import".to_string(),
            ));
        }
        Ok(())
    }
}
