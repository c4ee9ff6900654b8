use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::store::write_atomic;

const CONFIG_SCHEMA_VERSION: u32 = 1;

pub const GIT_CACHE_FILE: &str = ".git-cache.json";
pub const USAGE_CACHE_FILE: &str = ".usage-cache.json";
pub const SPEED_CACHE_FILE: &str = ".speed-cache.json";
pub const COST_CACHE_FILE: &str = ".cost-cache.json";
pub const STATS_CACHE_FILE: &str = ".session-stats.json";
pub const MEMORY_CACHE_FILE: &str = ".project-memory.json";
pub const KEYCHAIN_BACKOFF_FILE: &str = ".keychain-backoff";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HudConfig {
    pub schema_version: u32,
    pub cache: CacheConfig,
    pub display: DisplayConfig,
    pub pricing: PricingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DisplayConfig {
    pub show_git: bool,
    pub show_usage: bool,
    pub show_cost: bool,
    pub show_speed: bool,
    pub show_memory: bool,
    pub show_tools: bool,
    pub show_agents: bool,
    pub show_todos: bool,
    pub show_config_counts: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct CacheConfig {
    pub git: GitCacheConfig,
    pub api: ApiCacheConfig,
    pub speed: SpeedCacheConfig,
    pub memory: MemoryCacheConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GitCacheConfig {
    pub ttl_ms: u64,
    pub max_repositories: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiCacheConfig {
    pub ttl_ms: u64,
    pub failure_ttl_ms: u64,
    pub keychain_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SpeedCacheConfig {
    pub ttl_ms: u64,
    pub update_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryCacheConfig {
    pub max_projects: usize,
    pub max_files_per_project: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_tools: usize,
    pub max_agents: usize,
}

/// Per-model price overrides, keyed by lowercase model id prefix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PricingConfig {
    pub overrides: BTreeMap<String, ModelPricingOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ModelPricingOverride {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Default for HudConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            cache: CacheConfig::default(),
            display: DisplayConfig::default(),
            pricing: PricingConfig::default(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            show_git: true,
            show_usage: true,
            show_cost: true,
            show_speed: true,
            show_memory: false,
            show_tools: true,
            show_agents: true,
            show_todos: true,
            show_config_counts: true,
        }
    }
}

impl Default for GitCacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 5_000,
            max_repositories: 50,
        }
    }
}

impl Default for ApiCacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 60_000,
            failure_ttl_ms: 15_000,
            keychain_backoff_ms: 60_000,
        }
    }
}

impl Default for SpeedCacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 5_000,
            update_interval_ms: 2_000,
        }
    }
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_projects: 100,
            max_files_per_project: 500,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_tools: 20,
            max_agents: 10,
        }
    }
}

impl HudConfig {
    /// Reads `<hud_home>/config.json`. A missing file yields defaults and is
    /// not created; a file that needed normalising is rewritten.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut parsed: HudConfig = serde_json::from_str(&raw)
            .with_context(|| format!("invalid JSON in {}", path.display()))?;
        if parsed.normalize_and_migrate() {
            parsed.save_to(path)?;
        }
        Ok(parsed)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        write_atomic(path, &data).with_context(|| format!("failed to write {}", path.display()))
    }

    fn normalize_and_migrate(&mut self) -> bool {
        let mut changed = false;

        if self.schema_version < CONFIG_SCHEMA_VERSION {
            self.schema_version = CONFIG_SCHEMA_VERSION;
            changed = true;
        }

        let defaults = CacheConfig::default();
        let cache = &mut self.cache;
        for (value, default) in [
            (&mut cache.git.ttl_ms, defaults.git.ttl_ms),
            (&mut cache.api.ttl_ms, defaults.api.ttl_ms),
            (&mut cache.api.failure_ttl_ms, defaults.api.failure_ttl_ms),
            (&mut cache.api.keychain_backoff_ms, defaults.api.keychain_backoff_ms),
            (&mut cache.speed.ttl_ms, defaults.speed.ttl_ms),
            (&mut cache.speed.update_interval_ms, defaults.speed.update_interval_ms),
        ] {
            changed |= restore_if_zero(value, default);
        }
        for (value, default) in [
            (&mut cache.git.max_repositories, defaults.git.max_repositories),
            (&mut cache.memory.max_projects, defaults.memory.max_projects),
            (
                &mut cache.memory.max_files_per_project,
                defaults.memory.max_files_per_project,
            ),
            (&mut cache.retention.max_tools, defaults.retention.max_tools),
            (&mut cache.retention.max_agents, defaults.retention.max_agents),
        ] {
            changed |= restore_if_zero(value, default);
        }

        changed |= normalize_pricing_config(&mut self.pricing);
        changed
    }
}

impl ApiCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn failure_ttl(&self) -> Duration {
        Duration::from_millis(self.failure_ttl_ms)
    }

    pub fn keychain_backoff(&self) -> Duration {
        Duration::from_millis(self.keychain_backoff_ms)
    }
}

/// `$CLAUDE_CONFIG_DIR`, else `~/.claude`.
pub fn claude_home() -> PathBuf {
    if let Ok(custom) = env::var("CLAUDE_CONFIG_DIR") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
}

pub fn hud_home() -> PathBuf {
    claude_home().join("plugins").join("claude-hud")
}

pub fn config_path() -> PathBuf {
    hud_home().join("config.json")
}

/// `~/.claude.json`, which sits beside the Claude home rather than in it.
pub fn claude_json_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude.json")
}

pub fn credentials_path() -> PathBuf {
    claude_home().join(".credentials.json")
}

pub fn cache_path(file_name: &str) -> PathBuf {
    hud_home().join(file_name)
}

/// Every file `clear-cache` removes, paired with a display label.
pub fn cache_files() -> Vec<(&'static str, PathBuf)> {
    [
        ("git", GIT_CACHE_FILE),
        ("usage", USAGE_CACHE_FILE),
        ("speed", SPEED_CACHE_FILE),
        ("cost", COST_CACHE_FILE),
        ("session stats", STATS_CACHE_FILE),
        ("project memory", MEMORY_CACHE_FILE),
        ("keychain backoff", KEYCHAIN_BACKOFF_FILE),
    ]
    .into_iter()
    .map(|(label, file)| (label, cache_path(file)))
    .collect()
}

fn restore_if_zero<N: PartialEq + Default + Copy>(value: &mut N, default: N) -> bool {
    if *value == N::default() {
        *value = default;
        return true;
    }
    false
}

fn normalize_pricing_config(pricing: &mut PricingConfig) -> bool {
    let mut normalized: BTreeMap<String, ModelPricingOverride> = BTreeMap::new();
    for (raw_key, mut price) in pricing.overrides.clone() {
        let key = raw_key.trim().to_ascii_lowercase();
        if key.is_empty() {
            continue;
        }
        if !price.input_per_million.is_finite() || price.input_per_million < 0.0 {
            price.input_per_million = 0.0;
        }
        if !price.output_per_million.is_finite() || price.output_per_million < 0.0 {
            price.output_per_million = 0.0;
        }
        normalized.insert(key, price);
    }
    if pricing.overrides != normalized {
        pricing.overrides = normalized;
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_cache_constants() {
        let cfg = HudConfig::default();
        assert_eq!(cfg.cache.git.ttl_ms, 5_000);
        assert_eq!(cfg.cache.git.max_repositories, 50);
        assert_eq!(cfg.cache.api.failure_ttl(), Duration::from_secs(15));
        assert_eq!(cfg.cache.api.keychain_backoff(), Duration::from_secs(60));
        assert_eq!(cfg.cache.speed.update_interval_ms, 2_000);
        assert_eq!(cfg.cache.retention.max_tools, 20);
        assert!(cfg.display.show_git);
        assert!(!cfg.display.show_memory);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("config.json");
        fs::write(
            &path,
            r#"{"schema_version":1,"cache":{"git":{"ttl_ms":10000}},"display":{"show_cost":false}}"#,
        )
        .expect("write config");

        let cfg = HudConfig::load_from(&path).expect("load config");

        assert_eq!(cfg.cache.git.ttl_ms, 10_000);
        assert_eq!(cfg.cache.git.max_repositories, 50);
        assert_eq!(cfg.cache.api.ttl_ms, 60_000);
        assert!(!cfg.display.show_cost);
        assert!(cfg.display.show_usage);
    }

    #[test]
    fn zero_limits_are_restored_and_file_rewritten() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("config.json");
        fs::write(
            &path,
            r#"{"cache":{"api":{"failure_ttl_ms":0},"retention":{"max_tools":0}}}"#,
        )
        .expect("write config");

        let cfg = HudConfig::load_from(&path).expect("load config");

        assert_eq!(cfg.schema_version, CONFIG_SCHEMA_VERSION);
        assert_eq!(cfg.cache.api.failure_ttl_ms, 15_000);
        assert_eq!(cfg.cache.retention.max_tools, 20);
        let rewritten = fs::read_to_string(&path).expect("read config");
        assert!(rewritten.contains("\"failure_ttl_ms\": 15000"));
    }

    #[test]
    fn missing_file_is_defaults_without_creating_it() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("config.json");

        let cfg = HudConfig::load_from(&path).expect("load config");

        assert_eq!(cfg.cache, CacheConfig::default());
        assert!(!path.exists());
    }

    #[test]
    fn invalid_json_is_an_error() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("config.json");
        fs::write(&path, "{cache:").expect("write config");

        assert!(HudConfig::load_from(&path).is_err());
    }

    #[test]
    fn pricing_override_keys_are_normalised() {
        let mut cfg = HudConfig::default();
        cfg.pricing.overrides.insert(
            " Claude-Opus-4 ".to_string(),
            ModelPricingOverride {
                input_per_million: f64::NAN,
                output_per_million: 75.0,
            },
        );

        assert!(cfg.normalize_and_migrate());
        let price = cfg
            .pricing
            .overrides
            .get("claude-opus-4")
            .expect("normalised key");
        assert_eq!(price.input_per_million, 0.0);
        assert_eq!(price.output_per_million, 75.0);
        assert!(!cfg.normalize_and_migrate());
    }
}
