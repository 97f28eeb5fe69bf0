//! Pluggable admission rules: one trait, script-backed variants.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::lua_rule::LuaRule;
use super::rhai_rule::RhaiRule;

/// Entry point every rule script must define: `ploy(id, size) -> bool`.
pub const PLOY_FUNC: &str = "ploy";

/// Default Lua heap limit (16 MiB).
pub const DEFAULT_MEMORY_LIMIT: usize = 16 * 1024 * 1024;

/// Default per-evaluation budget: Rhai operations or Lua VM instructions.
pub const DEFAULT_MAX_OPERATIONS: u64 = 1_000_000;

/// Admission predicate beyond the static lists.
///
/// Implementations must be safe to call from several threads; a runtime that is not
/// (a single interpreter state) serializes calls internally.
pub trait Rule: Send + Sync {
    /// Decide whether content `id` of declared `size` should be stored.
    fn evaluate(&self, id: &[u8], size: u64) -> Result<bool, RuleError>;

    /// Free runtime resources. Later `evaluate` calls fail with `RuleError::Released`.
    fn release(&mut self);
}

/// Script language of a rule source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleLang {
    /// Sandboxed Lua 5.4.
    #[default]
    Lua,
    /// Rhai function script.
    Rhai,
}

impl RuleLang {
    /// File name of the rule script in a policy directory.
    pub fn file_name(self) -> &'static str {
        match self {
            RuleLang::Lua => "ploy.lua",
            RuleLang::Rhai => "ploy.rhai",
        }
    }
}

impl FromStr for RuleLang {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lua" => Ok(RuleLang::Lua),
            "rhai" => Ok(RuleLang::Rhai),
            other => Err(RuleError::UnsupportedLanguage(other.to_string())),
        }
    }
}

/// Language tag plus source text, as supplied by configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSource {
    pub lang: RuleLang,
    pub code: String,
}

impl RuleSource {
    pub fn new(lang: RuleLang, code: impl Into<String>) -> Self {
        Self {
            lang,
            code: code.into(),
        }
    }
}

/// Resource budgets applied to script runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleLimits {
    /// Lua heap limit in bytes.
    pub memory_limit: usize,
    /// Rhai operations or Lua VM instructions per evaluation.
    pub max_operations: u64,
}

impl Default for RuleLimits {
    fn default() -> Self {
        Self {
            memory_limit: DEFAULT_MEMORY_LIMIT,
            max_operations: DEFAULT_MAX_OPERATIONS,
        }
    }
}

/// Compile `source` into a ready rule.
pub fn build_rule(source: &RuleSource, limits: &RuleLimits) -> Result<Box<dyn Rule>, RuleError> {
    match source.lang {
        RuleLang::Lua => Ok(Box::new(LuaRule::load(&source.code, limits)?)),
        RuleLang::Rhai => Ok(Box::new(RhaiRule::compile(&source.code, limits)?)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("unsupported rule language: {0}")]
    UnsupportedLanguage(String),
    #[error("rule script failed to load: {0}")]
    Compile(String),
    #[error("rule script does not define function `{0}(id, size)`")]
    MissingFunction(&'static str),
    #[error("rule runtime error: {0}")]
    Runtime(String),
    #[error("rule returned {0}, expected boolean")]
    WrongReturnType(String),
    #[error("rule has been released")]
    Released,
    #[error("rule runtime lock poisoned")]
    Poisoned,
}
