//! Node configuration and the on-disk policy layout.
//!
//! File: `~/.depots/config.toml` or `/etc/depots/config.toml`.
//! Env overrides: `DEPOTS_PLOY_DIR`, `DEPOTS_PLOY_LANG`.
//!
//! Policy files live under `<ploy_dir>/<category>/`: `whitelist.json` and
//! `blacklist.json` (JSON arrays of patterns) plus `ploy.lua` or `ploy.rhai`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

use crate::policy::{PolicySource, RuleLang, RuleLimits, RuleSource};
use crate::policy::rule::{DEFAULT_MAX_OPERATIONS, DEFAULT_MEMORY_LIMIT};
use crate::protocol::DataKind;

pub const ENV_PLOY_DIR: &str = "DEPOTS_PLOY_DIR";
pub const ENV_PLOY_LANG: &str = "DEPOTS_PLOY_LANG";

const WHITELIST_FILE: &str = "whitelist.json";
const BLACKLIST_FILE: &str = "blacklist.json";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Root of the per-category policy directories (default `~/.depots/ploys`).
    #[serde(default = "default_ploy_dir")]
    pub ploy_dir: PathBuf,
    /// Rule script language (default lua).
    #[serde(default)]
    pub ploy_lang: RuleLang,
    /// Lua heap limit in bytes (default 16 MiB).
    #[serde(default = "default_memory_limit")]
    pub script_memory_limit: usize,
    /// Per-evaluation budget of Rhai operations or Lua instructions (default 1 000 000).
    #[serde(default = "default_max_operations")]
    pub script_max_operations: u64,
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_ploy_dir() -> PathBuf {
    home_dir().join(".depots").join("ploys")
}
fn default_memory_limit() -> usize {
    DEFAULT_MEMORY_LIMIT
}
fn default_max_operations() -> u64 {
    DEFAULT_MAX_OPERATIONS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ploy_dir: default_ploy_dir(),
            ploy_lang: RuleLang::default(),
            script_memory_limit: default_memory_limit(),
            script_max_operations: default_max_operations(),
        }
    }
}

impl Config {
    /// Load config: defaults, then the first config file found, then env vars.
    pub fn load() -> anyhow::Result<Self> {
        let mut c = match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        c.apply_overrides(|key| std::env::var(key).ok());
        Ok(c)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Apply `DEPOTS_*` overrides fetched through `lookup`. Unparsable values are logged and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_PLOY_DIR) {
            if !dir.is_empty() {
                self.ploy_dir = PathBuf::from(dir);
            }
        }
        if let Some(lang) = lookup(ENV_PLOY_LANG) {
            match lang.parse::<RuleLang>() {
                Ok(lang) => self.ploy_lang = lang,
                Err(e) => warn!(error = %e, "ignoring {}", ENV_PLOY_LANG),
            }
        }
    }

    pub fn rule_limits(&self) -> RuleLimits {
        RuleLimits {
            memory_limit: self.script_memory_limit,
            max_operations: self.script_max_operations,
        }
    }

    /// Policy directory for one content category.
    pub fn category_dir(&self, kind: DataKind) -> PathBuf {
        self.ploy_dir.join(kind.to_wire().to_string())
    }
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(h) = std::env::var_os("HOME") {
        out.push(PathBuf::from(h).join(".depots/config.toml"));
    }
    out.push(PathBuf::from("/etc/depots/config.toml"));
    out
}

/// Read lists and rule script for `kind`. Missing files mean empty lists and no rule.
pub fn load_policy_source(config: &Config, kind: DataKind) -> anyhow::Result<PolicySource> {
    let dir = config.category_dir(kind);
    let whitelist = read_patterns(&dir.join(WHITELIST_FILE))?;
    let blacklist = read_patterns(&dir.join(BLACKLIST_FILE))?;
    let script = dir.join(config.ploy_lang.file_name());
    let rule = match read_optional(&script)? {
        Some(code) => Some(RuleSource::new(config.ploy_lang, code)),
        None => None,
    };
    Ok(PolicySource {
        whitelist,
        blacklist,
        rule,
    })
}

fn read_patterns(path: &Path) -> anyhow::Result<Vec<String>> {
    match read_optional(path)? {
        Some(text) => serde_json::from_str(&text)
            .with_context(|| format!("parsing pattern list {}", path.display())),
        None => Ok(Vec::new()),
    }
}

fn read_optional(path: &Path) -> anyhow::Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}
