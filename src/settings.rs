use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::graph::DEFAULT_GRAPH_BASE_URL;
use crate::store::DEFAULT_PAGE_SIZE;

const APP_DIR: &str = "cockpit-tasks";
const DEFAULT_APP_NAME: &str = "Cockpit Central";
const DEFAULT_REDIRECT_URI: &str = "http://localhost:5173";
const PLACEHOLDER_PREFIX: &str = "YOUR_";
const MIN_PAGE_SIZE: u32 = 1;
const MAX_PAGE_SIZE: u32 = 5_000;
const MIN_REQUEST_TIMEOUT_MS: u64 = 1_000;
const MAX_REQUEST_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;

pub const ACCESS_TOKEN_ENV: &str = "COCKPIT_ACCESS_TOKEN";
pub const REFRESH_TOKEN_ENV: &str = "COCKPIT_REFRESH_TOKEN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub app_name: String,
    pub tenant_id: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub site_id: String,
    pub list_id: String,
    pub graph_base_url: String,
    pub page_size: u32,
    pub request_timeout_ms: u64,
    pub auth: AuthConfig,
    pub links: LinksConfig,
    pub poles: Vec<VocabEntry>,
    pub statuses: Vec<VocabEntry>,
    pub priorities: Vec<VocabEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LinksConfig {
    pub bien_chez_soi_app: String,
    pub evolumis_app: String,
    pub perso_app: String,
    pub sharepoint_folder_url: String,
    pub list_web_url: String,
}

/// Display metadata for one canonical key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabEntry {
    pub key: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
}

impl VocabEntry {
    fn new(key: &str, label: &str, emoji: Option<&str>) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            emoji: emoji.map(str::to_string),
        }
    }
}

fn default_poles() -> Vec<VocabEntry> {
    vec![
        VocabEntry::new("BCS", "Bien Chez Soi", Some("🏡")),
        VocabEntry::new("EVO", "Evolumis", Some("🚀")),
        VocabEntry::new("PERSO", "Personnel", Some("🧠")),
    ]
}

fn default_statuses() -> Vec<VocabEntry> {
    vec![
        VocabEntry::new("Backlog", "Backlog", None),
        VocabEntry::new("EnCours", "En cours", None),
        VocabEntry::new("EnAttente", "En attente", None),
        VocabEntry::new("Termine", "Terminé", None),
    ]
}

fn default_priorities() -> Vec<VocabEntry> {
    ["P1", "P2", "P3"]
        .into_iter()
        .map(|key| VocabEntry::new(key, key, None))
        .collect()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: DEFAULT_APP_NAME.to_string(),
            tenant_id: String::new(),
            client_id: String::new(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            site_id: String::new(),
            list_id: String::new(),
            graph_base_url: DEFAULT_GRAPH_BASE_URL.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            auth: AuthConfig::default(),
            links: LinksConfig::default(),
            poles: default_poles(),
            statuses: default_statuses(),
            priorities: default_priorities(),
        }
    }
}

impl Settings {
    pub fn config_path() -> Option<PathBuf> {
        let mut path = dirs::config_dir()?;
        path.push(APP_DIR);
        path.push("settings.toml");
        Some(path)
    }

    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };

        Self::load_from_path(&path)
    }

    pub fn load_from_path(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<Self>(&contents) {
                Ok(mut settings) => {
                    settings.validate();
                    settings
                }
                Err(error) => {
                    warn!(
                        "failed to parse settings config '{}': {}",
                        path.display(),
                        error
                    );
                    Self::default()
                }
            },
            Err(error) => {
                warn!(
                    "failed to read settings config '{}': {}",
                    path.display(),
                    error
                );
                Self::default()
            }
        }
    }

    /// Defaults with `YOUR_...` placeholders in the required keys.
    pub fn template() -> Self {
        Self {
            tenant_id: "YOUR_TENANT_ID_OR_DOMAIN".to_string(),
            client_id: "YOUR_APP_CLIENT_ID".to_string(),
            site_id: "YOUR_SITE_ID".to_string(),
            list_id: "YOUR_LIST_ID".to_string(),
            ..Self::default()
        }
    }

    pub fn save_to_path(&self, path: &Path) -> anyhow::Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("invalid settings config path"))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory '{}'", parent.display()))?;

        let mut validated = self.clone();
        validated.validate();
        let contents =
            toml::to_string_pretty(&validated).context("failed to serialize settings to TOML")?;

        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow!("invalid settings config file name"))?
            .to_string_lossy()
            .to_string();
        let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

        fs::write(&tmp_path, contents).with_context(|| {
            format!(
                "failed to write temporary settings file '{}'",
                tmp_path.display()
            )
        })?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "failed to atomically rename settings file '{}' to '{}'",
                tmp_path.display(),
                path.display()
            )
        })?;

        Ok(())
    }

    fn validate(&mut self) {
        self.page_size = self.page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE);
        self.request_timeout_ms = self
            .request_timeout_ms
            .clamp(MIN_REQUEST_TIMEOUT_MS, MAX_REQUEST_TIMEOUT_MS);

        let base_url = self.graph_base_url.trim().trim_end_matches('/');
        self.graph_base_url = if base_url.starts_with("https://") || base_url.starts_with("http://") {
            base_url.to_string()
        } else {
            warn!(
                "invalid graph_base_url '{}' in settings config; falling back to {}",
                self.graph_base_url, DEFAULT_GRAPH_BASE_URL
            );
            DEFAULT_GRAPH_BASE_URL.to_string()
        };

        if self.poles.is_empty() {
            self.poles = default_poles();
        }
        if self.statuses.is_empty() {
            self.statuses = default_statuses();
        }
        if self.priorities.is_empty() {
            self.priorities = default_priorities();
        }
    }

    /// Required keys that are empty or still hold a `YOUR_...` placeholder.
    pub fn missing_required(&self) -> Vec<String> {
        [
            ("tenant_id", &self.tenant_id),
            ("client_id", &self.client_id),
            ("site_id", &self.site_id),
            ("list_id", &self.list_id),
        ]
        .into_iter()
        .filter(|(_, value)| is_unset(value))
        .map(|(key, _)| key.to_string())
        .collect()
    }

    /// Access token from the environment, else from the file.
    pub fn access_token(&self) -> Option<String> {
        env_or(ACCESS_TOKEN_ENV, self.auth.access_token.as_deref())
    }

    pub fn refresh_token(&self) -> Option<String> {
        env_or(REFRESH_TOKEN_ENV, self.auth.refresh_token.as_deref())
    }

    pub fn pole_label(&self, key: &str) -> String {
        vocab_label(&self.poles, key)
    }

    pub fn pole_emoji(&self, key: &str) -> Option<&str> {
        self.poles
            .iter()
            .find(|entry| entry.key == key)
            .and_then(|entry| entry.emoji.as_deref())
    }

    pub fn status_label(&self, key: &str) -> String {
        vocab_label(&self.statuses, key)
    }

    pub fn priority_label(&self, key: &str) -> String {
        vocab_label(&self.priorities, key)
    }
}

fn is_unset(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value.starts_with(PLACEHOLDER_PREFIX)
}

fn env_or(var: &str, fallback: Option<&str>) -> Option<String> {
    std::env::var(var)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .or_else(|| fallback.map(str::to_string))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn vocab_label(entries: &[VocabEntry], key: &str) -> String {
    entries
        .iter()
        .find(|entry| entry.key == key)
        .map(|entry| entry.label.clone())
        .unwrap_or_else(|| key.to_string())
}
