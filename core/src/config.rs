use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::result::Result as StdResult;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use rust_embed::RustEmbed;
use serde::Deserialize;
use serdable::{GlobPattern, Seconds};

use crate::executor::{ExecutorRegistry, ExecutorSpec};

/// Judge environment, read from `kvalid.toml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    #[serde(skip)]
    pub source_config_file: Option<PathBuf>,

    #[serde(default = "Config::default_problem_storage_globs")]
    pub problem_storage_globs: Vec<GlobPattern>,

    #[serde(default = "Config::default_generator_time_limit")]
    pub generator_time_limit: Seconds,

    /// KiB
    #[serde(default = "Config::default_generator_memory_limit")]
    pub generator_memory_limit: u64,

    #[serde(default = "Config::default_generator_compiler_time_limit")]
    pub generator_compiler_time_limit: Seconds,

    #[serde(default)]
    pub executors: BTreeMap<String, ExecutorSpec>,
}

/// Values taken from `KVALID_*` environment variables.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EnvOverrides {
    pub generator_time_limit: Option<f64>,
    pub generator_memory_limit: Option<u64>,
    pub generator_compiler_time_limit: Option<f64>,
}

#[derive(RustEmbed)]
#[folder = "assets/"]
struct Asset;

impl Default for Config {
    fn default() -> Self {
        Self {
            source_config_file: None,
            problem_storage_globs: Self::default_problem_storage_globs(),
            generator_time_limit: Self::default_generator_time_limit(),
            generator_memory_limit: Self::default_generator_memory_limit(),
            generator_compiler_time_limit: Self::default_generator_compiler_time_limit(),
            executors: BTreeMap::new(),
        }
    }
}

impl Config {
    pub const FILENAME: &str = "kvalid.toml";
    pub const ENV_PREFIX: &str = "KVALID_";

    fn default_problem_storage_globs() -> Vec<GlobPattern> {
        GlobPattern::parse("./problems/*").into_iter().collect()
    }

    fn default_generator_time_limit() -> Seconds {
        Seconds::from_duration(Duration::from_secs(20))
    }

    fn default_generator_memory_limit() -> u64 {
        524288
    }

    fn default_generator_compiler_time_limit() -> Seconds {
        Seconds::from_duration(Duration::from_secs(30))
    }

    pub fn example_toml() -> anyhow::Result<String> {
        let file = Asset::get(Self::FILENAME)
            .with_context(|| format!("'{}' is not embedded", Self::FILENAME))?;
        let s = std::str::from_utf8(file.data.as_ref())
            .with_context(|| format!("Embedded '{}' is not UTF-8", Self::FILENAME))?;
        Ok(s.to_owned())
    }

    pub fn from_toml(s: &str) -> StdResult<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn from_toml_file(filepath: PathBuf) -> anyhow::Result<Self> {
        let toml = fsutil::read_to_string(&filepath).context("Cannot read a file")?;
        let mut cfg = Self::from_toml(&toml)
            .with_context(|| format!("Invalid config TOML: {:?}", filepath))?;
        cfg.source_config_file = Some(filepath);
        Ok(cfg)
    }

    /// Find config file ancestor dirs, including current dir.
    pub fn find_file_in_ancestors(cur_dir: impl AsRef<Path>) -> anyhow::Result<PathBuf> {
        let cur_dir = cur_dir.as_ref();
        cur_dir
            .ancestors()
            .map(|dir| dir.join(Self::FILENAME))
            .find(|path| path.is_file())
            .with_context(|| {
                format!(
                    "Not in a kvalid judge dir: Cannot find '{}'",
                    Self::FILENAME
                )
            })
    }

    pub fn from_file_finding_in_ancestors(cur_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config_filepath = Config::find_file_in_ancestors(cur_dir)?;
        Self::from_toml_file(config_filepath)
    }

    pub fn with_env_overrides(self) -> anyhow::Result<Self> {
        let overrides = envy::prefixed(Self::ENV_PREFIX)
            .from_env::<EnvOverrides>()
            .with_context(|| format!("Invalid {}* environment variable", Self::ENV_PREFIX))?;
        self.apply_overrides(overrides)
    }

    pub fn apply_overrides(mut self, overrides: EnvOverrides) -> anyhow::Result<Self> {
        let seconds = |name: &str, v: f64| {
            Seconds::from_secs_f64(v).ok_or_else(|| {
                anyhow!("{}{} must be non-negative: {}", Self::ENV_PREFIX, name, v)
            })
        };
        if let Some(v) = overrides.generator_time_limit {
            self.generator_time_limit = seconds("GENERATOR_TIME_LIMIT", v)?;
        }
        if let Some(v) = overrides.generator_memory_limit {
            self.generator_memory_limit = v;
        }
        if let Some(v) = overrides.generator_compiler_time_limit {
            self.generator_compiler_time_limit = seconds("GENERATOR_COMPILER_TIME_LIMIT", v)?;
        }
        Ok(self)
    }

    /// Directory relative paths in this config are resolved against.
    pub fn base_dir(&self) -> PathBuf {
        self.source_config_file
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_owned)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn generator_memory_limit_bytes(&self) -> u64 {
        self.generator_memory_limit.saturating_mul(1024)
    }

    pub fn executor_registry(&self) -> ExecutorRegistry {
        ExecutorRegistry::builtin().with_overrides(self.executors.clone())
    }
}
