use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use serdable::{GlobPattern, Seconds};

use crate::testing::{
    CaseConfig, CaseData, DataSource, EmptyBatchError, FeedbackStream, TestCaseTree,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] fsutil::Error),

    #[error("Test case {0} has no 'in' file")]
    MissingInput(String),

    #[error("Test case {0}: batches cannot be nested")]
    NestedBatch(String),

    #[error(transparent)]
    EmptyBatch(#[from] EmptyBatchError),

    #[error("wall_time_factor must be positive: {0}")]
    InvalidWallTimeFactor(f64),
}

/// Contents of `problem.toml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProblemConfig {
    /// Limits for solutions, used by answer checking
    pub time_limit: Option<Seconds>,
    /// KiB
    pub memory_limit: Option<u64>,

    #[serde(default = "ProblemConfig::default_output_limit_length")]
    pub output_limit_length: usize,
    #[serde(default = "ProblemConfig::default_wall_time_factor")]
    pub wall_time_factor: f64,
    #[serde(default)]
    pub symlinks: BTreeMap<String, PathBuf>,

    pub validator: Option<ValidatorConfig>,

    #[serde(default)]
    pub test_cases: Vec<TestCaseConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ValidatorConfig {
    pub language: Option<String>,
    /// A file name or a list of file names, relative to the problem dir
    pub source: Option<toml::Value>,
    pub time: Option<Seconds>,
    /// KiB
    pub memory: Option<u64>,
    pub compiler_time_limit: Option<Seconds>,
    pub feedback: Option<String>,
    #[serde(rename = "type")]
    pub contrib_type: Option<String>,
    pub args_format_string: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TestCaseConfig {
    #[serde(rename = "in")]
    pub input: Option<PathBuf>,
    #[serde(rename = "out")]
    pub output: Option<PathBuf>,
    pub points: Option<f64>,
    pub output_limit_length: Option<usize>,
    pub wall_time_factor: Option<f64>,
    pub symlinks: Option<BTreeMap<String, PathBuf>>,
    pub batched: Option<Vec<TestCaseConfig>>,
}

impl ProblemConfig {
    pub const FILENAME: &str = "problem.toml";

    fn default_output_limit_length() -> usize {
        CaseConfig::DEFAULT_OUTPUT_LIMIT_LENGTH
    }

    fn default_wall_time_factor() -> f64 {
        CaseConfig::DEFAULT_WALL_TIME_FACTOR
    }

    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn load(problem_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = problem_dir.as_ref().join(Self::FILENAME);
        Ok(fsutil::read_toml_with_deserialize(path)?)
    }

    /// Builds the case tree. Paths are resolved against `problem_dir`; inputs are not read yet.
    pub fn test_case_tree(&self, problem_dir: &Path) -> Result<TestCaseTree, ConfigError> {
        let base = CaseConfig {
            output_limit_length: self.output_limit_length,
            wall_time_factor: self.wall_time_factor,
            symlinks: resolve_symlinks(&self.symlinks, problem_dir),
        };
        ensure_positive_factor(base.wall_time_factor)?;

        let mut builder = TestCaseTree::builder();
        for (i, tc) in self.test_cases.iter().enumerate() {
            let label = (i + 1).to_string();
            builder = match &tc.batched {
                None => builder.case(tc.case_data(&base, problem_dir, &label)?),
                Some(members) => {
                    let batch_cfg = tc.merge(&base, problem_dir)?;
                    let cases = members
                        .iter()
                        .enumerate()
                        .map(|(j, member)| {
                            let label = format!("{}.{}", label, j + 1);
                            if member.batched.is_some() {
                                return Err(ConfigError::NestedBatch(label));
                            }
                            member.case_data(&batch_cfg, problem_dir, &label)
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    builder.batch(tc.points.unwrap_or(0.0), cases)?
                }
            };
        }
        Ok(builder.build())
    }
}

impl TestCaseConfig {
    /// Settings of this entry layered over `parent`.
    fn merge(&self, parent: &CaseConfig, problem_dir: &Path) -> Result<CaseConfig, ConfigError> {
        let mut cfg = parent.clone();
        if let Some(len) = self.output_limit_length {
            cfg.output_limit_length = len;
        }
        if let Some(factor) = self.wall_time_factor {
            ensure_positive_factor(factor)?;
            cfg.wall_time_factor = factor;
        }
        if let Some(symlinks) = &self.symlinks {
            cfg.symlinks = resolve_symlinks(symlinks, problem_dir);
        }
        Ok(cfg)
    }

    fn case_data(
        &self,
        parent: &CaseConfig,
        problem_dir: &Path,
        label: &str,
    ) -> Result<CaseData, ConfigError> {
        let input = self
            .input
            .as_ref()
            .ok_or_else(|| ConfigError::MissingInput(label.to_owned()))?;
        let mut data = CaseData::new(DataSource::file(problem_dir.join(input)))
            .points(self.points.unwrap_or(0.0))
            .config(self.merge(parent, problem_dir)?);
        if let Some(output) = &self.output {
            data = data.expected_output(DataSource::file(problem_dir.join(output)));
        }
        Ok(data)
    }
}

impl ValidatorConfig {
    /// `None` when `source` is missing or is not a string / list of strings.
    pub fn source_files(&self, problem_dir: &Path) -> Option<Vec<PathBuf>> {
        let names: Vec<&str> = match self.source.as_ref()? {
            toml::Value::String(s) => vec![s.as_str()],
            toml::Value::Array(list) => list
                .iter()
                .map(toml::Value::as_str)
                .collect::<Option<Vec<_>>>()?,
            _ => return None,
        };
        if names.is_empty() || names.iter().any(|s| s.is_empty()) {
            return None;
        }
        Some(names.into_iter().map(|s| problem_dir.join(s)).collect())
    }

    /// `None` when the option names an unsupported stream.
    pub fn feedback_stream(&self) -> Option<FeedbackStream> {
        match &self.feedback {
            None => Some(FeedbackStream::default()),
            Some(s) => s.parse().ok(),
        }
    }
}

fn ensure_positive_factor(factor: f64) -> Result<(), ConfigError> {
    if factor > 0.0 && factor.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::InvalidWallTimeFactor(factor))
    }
}

fn resolve_symlinks(
    symlinks: &BTreeMap<String, PathBuf>,
    problem_dir: &Path,
) -> BTreeMap<String, PathBuf> {
    symlinks
        .iter()
        .map(|(link, target)| (link.clone(), problem_dir.join(target)))
        .collect()
}

/// Problem id => problem dir, found by globbing.
#[derive(Debug, Clone, Default)]
pub struct ProblemStore {
    problems: BTreeMap<String, PathBuf>,
}

impl ProblemStore {
    /// A directory matching one of `globs` and containing `problem.toml` is a problem whose
    /// id is the directory name. The first match wins for duplicate ids.
    pub fn discover(globs: &[GlobPattern], base_dir: &Path) -> Self {
        let mut problems = BTreeMap::new();
        for pattern in globs {
            let full = base_dir.join(pattern.as_str());
            let paths = match glob::glob(&full.to_string_lossy()) {
                Ok(paths) => paths,
                Err(e) => {
                    log::warn!("Invalid problem storage glob {:?}: {}", full, e);
                    continue;
                }
            };
            for entry in paths {
                let dir = match entry {
                    Ok(dir) => dir,
                    Err(e) => {
                        log::debug!("Skipping unreadable path: {}", e);
                        continue;
                    }
                };
                if !dir.join(ProblemConfig::FILENAME).is_file() {
                    continue;
                }
                let Some(id) = dir.file_name().and_then(|s| s.to_str()).map(str::to_owned) else {
                    continue
                };
                // Cases run in their own temp dirs, so symlink targets must not be relative.
                let dir = match fsutil::canonicalize_path(&dir) {
                    Ok(dir) => dir,
                    Err(e) => {
                        log::warn!("Skipping problem {}: {}", id, e);
                        continue;
                    }
                };
                problems.entry(id).or_insert(dir);
            }
        }
        log::debug!("Found {} problem(s)", problems.len());
        Self { problems }
    }

    pub fn get(&self, id: &str) -> Option<&Path> {
        self.problems.get(id).map(PathBuf::as_path)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.problems.contains_key(id)
    }

    /// Sorted
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.problems.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.problems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }
}
