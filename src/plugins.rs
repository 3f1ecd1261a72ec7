//! Build-time plugin bake-in.
//!
//! The host's plugin enablement (the `enabledPlugins` map of `settings.json`)
//! is resolved against a pinned clone of the plugin marketplace and turned into
//! the three manifests the agent reads at startup. The output is staged as a
//! home-directory overlay that the image build copies verbatim.

use crate::config::MarketplaceConfig;
use crate::error::BoxError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Marketplace subtrees searched for a plugin, in order; first match wins.
pub const PLUGIN_SUBTREES: &[&str] = &["plugins", "external_plugins"];
pub const SHORT_HASH_LEN: usize = 12;
const INSTALLED_PLUGINS_VERSION: u32 = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginEnablementSnapshot {
    entries: BTreeMap<String, bool>,
}

impl PluginEnablementSnapshot {
    #[cfg(test)]
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, bool)>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn from_settings_str(content: &str) -> Result<Self, BoxError> {
        let value: Value = serde_json::from_str(content)?;
        let entries = value
            .get("enabledPlugins")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(key, flag)| flag.as_bool().map(|flag| (key.clone(), flag)))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self { entries })
    }

    /// Reads the host settings file. A missing or unreadable file yields an
    /// empty snapshot; baking plugins never blocks an image build.
    pub fn read(settings_path: &Path) -> Self {
        let content = match fs::read_to_string(settings_path) {
            Ok(content) => content,
            Err(err) => {
                tracing::debug!(path = %settings_path.display(), %err, "no plugin settings to bake");
                return Self::default();
            }
        };
        Self::from_settings_str(&content).unwrap_or_else(|err| {
            tracing::warn!(path = %settings_path.display(), %err, "ignoring unparsable plugin settings");
            Self::default()
        })
    }

    pub fn enabled(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(key, _)| key.as_str())
    }

    pub fn has_enabled(&self) -> bool {
        self.enabled().next().is_some()
    }
}

/// Plugin name part of a `name@source` key.
pub fn plugin_name(key: &str) -> &str {
    key.split_once('@').map_or(key, |(name, _)| name)
}

/// A plugin name must stay a single directory component under a subtree.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && !name.contains(['/', '\\']) && !name.contains("..")
}

#[derive(Debug, Clone)]
pub struct MarketplaceSnapshot {
    pub name: String,
    pub repo: String,
    pub root: PathBuf,
    pub commit_sha: String,
}

impl MarketplaceSnapshot {
    pub fn short_hash(&self) -> &str {
        let end = self.commit_sha.len().min(SHORT_HASH_LEN);
        &self.commit_sha[..end]
    }

    pub fn locate(&self, plugin: &str) -> Option<PathBuf> {
        if !is_plain_name(plugin) {
            return None;
        }
        PLUGIN_SUBTREES
            .iter()
            .map(|subtree| self.root.join(subtree).join(plugin))
            .find(|candidate| candidate.is_dir())
    }
}

/// Shallow-clones the marketplace and pins it to its current commit.
pub fn clone_marketplace(
    marketplace: &MarketplaceConfig,
    dest: &Path,
) -> Result<MarketplaceSnapshot, BoxError> {
    let git = which::which("git").map_err(|_| {
        BoxError::Process("git is required to bake plugins into the image".to_string())
    })?;
    let status = Command::new(&git)
        .args(["clone", "--quiet", "--depth", "1", marketplace.url.as_str()])
        .arg(dest)
        .status()?;
    if !status.success() {
        return Err(BoxError::Process(format!(
            "failed to clone plugin marketplace {}",
            marketplace.url
        )));
    }
    let output = Command::new(&git)
        .arg("-C")
        .arg(dest)
        .args(["rev-parse", "HEAD"])
        .output()?;
    let commit_sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !output.status.success() || commit_sha.is_empty() {
        return Err(BoxError::Process(format!(
            "failed to resolve revision of plugin marketplace {}",
            marketplace.url
        )));
    }
    Ok(MarketplaceSnapshot {
        name: marketplace.name.clone(),
        repo: marketplace.repo.clone(),
        root: dest.to_path_buf(),
        commit_sha,
    })
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstallRecord {
    pub scope: String,
    pub install_path: String,
    pub version: String,
    pub installed_at: String,
    pub last_updated: String,
    pub git_commit_sha: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InstalledPlugins {
    pub version: u32,
    pub plugins: BTreeMap<String, Vec<InstallRecord>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SettingsFragment {
    #[serde(rename = "enabledPlugins")]
    pub enabled_plugins: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MarketplaceSource {
    pub source: String,
    pub repo: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MarketplaceRecord {
    pub source: MarketplaceSource,
    pub install_location: String,
    pub last_updated: String,
}

pub type KnownMarketplaces = BTreeMap<String, MarketplaceRecord>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginCopy {
    pub source: PathBuf,
    /// Destination relative to the home directory.
    pub dest: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BakePlan {
    pub installed: InstalledPlugins,
    pub settings: SettingsFragment,
    pub marketplaces: KnownMarketplaces,
    pub copies: Vec<PluginCopy>,
    pub skipped: Vec<String>,
}

fn plugins_relative() -> PathBuf {
    Path::new(".claude").join("plugins")
}

pub fn plan_bake(
    snapshot: &PluginEnablementSnapshot,
    marketplace: &MarketplaceSnapshot,
    container_home: &str,
    now: DateTime<Utc>,
) -> BakePlan {
    let timestamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    let short = marketplace.short_hash().to_string();
    let mut installed = InstalledPlugins {
        version: INSTALLED_PLUGINS_VERSION,
        plugins: BTreeMap::new(),
    };
    let mut settings = SettingsFragment {
        enabled_plugins: BTreeMap::new(),
    };
    let mut copies = Vec::new();
    let mut skipped = Vec::new();

    for key in snapshot.enabled() {
        let name = plugin_name(key);
        let Some(source) = marketplace.locate(name) else {
            tracing::warn!(plugin = key, marketplace = %marketplace.name, "plugin not found in marketplace, skipping");
            skipped.push(key.to_string());
            continue;
        };
        let dest = plugins_relative()
            .join("cache")
            .join(&marketplace.name)
            .join(name)
            .join(&short);
        installed.plugins.entry(key.to_string()).or_default().push(InstallRecord {
            scope: "user".to_string(),
            install_path: format!("{container_home}/{}", dest.display()),
            version: short.clone(),
            installed_at: timestamp.clone(),
            last_updated: timestamp.clone(),
            git_commit_sha: marketplace.commit_sha.clone(),
        });
        settings.enabled_plugins.insert(key.to_string(), true);
        copies.push(PluginCopy { source, dest });
    }

    let mut marketplaces = KnownMarketplaces::new();
    marketplaces.insert(
        marketplace.name.clone(),
        MarketplaceRecord {
            source: MarketplaceSource {
                source: "github".to_string(),
                repo: marketplace.repo.clone(),
            },
            install_location: format!(
                "{container_home}/{}",
                marketplace_relative(&marketplace.name).display()
            ),
            last_updated: timestamp,
        },
    );

    BakePlan {
        installed,
        settings,
        marketplaces,
        copies,
        skipped,
    }
}

fn marketplace_relative(name: &str) -> PathBuf {
    plugins_relative().join("marketplaces").join(name)
}

fn to_json_document<T: Serialize>(value: &T) -> Result<String, BoxError> {
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    Ok(text)
}

pub fn render_installed_plugins(plan: &BakePlan) -> Result<String, BoxError> {
    to_json_document(&plan.installed)
}

pub fn render_settings_fragment(plan: &BakePlan) -> Result<String, BoxError> {
    to_json_document(&plan.settings)
}

pub fn render_known_marketplaces(plan: &BakePlan) -> Result<String, BoxError> {
    to_json_document(&plan.marketplaces)
}

/// Materializes the plan under `stage_home`, which mirrors the container home.
pub fn write_bake(
    plan: &BakePlan,
    marketplace: &MarketplaceSnapshot,
    stage_home: &Path,
) -> Result<(), BoxError> {
    let plugins_dir = stage_home.join(plugins_relative());
    fs::create_dir_all(&plugins_dir)?;
    fs::write(
        plugins_dir.join("installed_plugins.json"),
        render_installed_plugins(plan)?,
    )?;
    fs::write(
        plugins_dir.join("known_marketplaces.json"),
        render_known_marketplaces(plan)?,
    )?;
    fs::write(
        stage_home.join(".claude").join("settings.json"),
        render_settings_fragment(plan)?,
    )?;
    copy_dir_recursive(
        &marketplace.root,
        &stage_home.join(marketplace_relative(&marketplace.name)),
    )?;
    for copy in &plan.copies {
        copy_dir_recursive(&copy.source, &stage_home.join(&copy.dest))?;
    }
    Ok(())
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        if entry.file_name() == ".git" {
            continue;
        }
        let file_type = entry.file_type()?;
        let target = dest.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
