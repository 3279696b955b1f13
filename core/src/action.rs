pub mod error {
    #[allow(unused_imports)]
    pub(crate) use anyhow::{anyhow, bail, ensure, Context as _};
    pub use anyhow::{Error, Result};
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use error::*;

use crate::config::Config;
use crate::contrib::ContribRegistry;
use crate::executor::{Executable, ExecutorRegistry};
use crate::interactive::Spinner;
use crate::problem::{ProblemConfig, ProblemStore, ValidatorConfig};
use crate::sandbox::{LocalSandbox, ResourceLimits, Sandbox, WallTimeRangeError};
use crate::style;
use crate::testing::{
    contiguous_runs, ArgsTemplate, CaseId, ExchangeOutcome, Grader, JudgeCode, RunRecord,
    StandardGrader, TestCase, TestCaseTree, ValidatorBinary, ValidatorGrader, Verdict,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SkipReason {
    #[strum(serialize = "No validator found")]
    NoValidator,
    #[strum(serialize = "Language not supported")]
    LanguageNotSupported,
    #[strum(serialize = "Feedback option not supported")]
    FeedbackNotSupported,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProblemOutcome {
    Skipped(SkipReason),
    /// `problem.toml` could not be loaded or describes a broken case tree
    InvalidConfig(String),
    InvalidContrib(String),
    CompileFailed(String),
    Validated(RunRecord),
}

impl ProblemOutcome {
    pub fn failed(&self) -> bool {
        use ProblemOutcome::*;
        match self {
            Skipped(_) => false,
            Validated(record) => record.failed(),
            InvalidConfig(_) | InvalidContrib(_) | CompileFailed(_) => true,
        }
    }
}

/// Everything needed to validate problems of one judge environment.
pub struct Session {
    cfg: Config,
    problems: ProblemStore,
    executors: ExecutorRegistry,
    contribs: ContribRegistry,
    sandbox: Arc<dyn Sandbox>,
}

impl Session {
    pub fn from_config(cfg: Config) -> Self {
        let problems = ProblemStore::discover(&cfg.problem_storage_globs, &cfg.base_dir());
        let executors = cfg.executor_registry();
        Self {
            cfg,
            problems,
            executors,
            contribs: ContribRegistry::builtin(),
            sandbox: Arc::new(LocalSandbox),
        }
    }

    pub fn executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = executors;
        self
    }

    pub fn contribs(mut self, contribs: ContribRegistry) -> Self {
        self.contribs = contribs;
        self
    }

    pub fn sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn problems(&self) -> &ProblemStore {
        &self.problems
    }

    /// Validates each problem in order and prints a summary. Returns the number of failed problems.
    ///
    /// Unknown ids are rejected before anything runs.
    pub async fn validate_many<S: AsRef<str>>(&self, problem_ids: &[S]) -> Result<usize> {
        let unknown: Vec<_> = problem_ids
            .iter()
            .map(AsRef::as_ref)
            .filter(|id| !self.problems.contains(id))
            .map(|id| format!("'{}'", id))
            .collect();
        ensure!(unknown.is_empty(), "Unknown problem(s) {}", unknown.join(", "));

        let mut total_fails = 0;
        for id in problem_ids.iter().map(AsRef::as_ref) {
            let failed = self.validate_problem(id).await?.failed();
            style::print_problem_result(id, failed);
            if failed {
                total_fails += 1;
            }
        }
        style::print_validation_summary(total_fails);
        Ok(total_fails)
    }

    pub async fn validate_problem(&self, problem_id: &str) -> Result<ProblemOutcome> {
        let dir = self
            .problems
            .get(problem_id)
            .with_context(|| format!("Unknown problem '{}'", problem_id))?;

        style::print_problem_header(problem_id);
        let outcome = self.run_validator(dir).await;

        use ProblemOutcome::*;
        match &outcome {
            Skipped(reason) => style::print_skipped(reason),
            InvalidConfig(msg) => style::print_problem_error(msg),
            InvalidContrib(id) => {
                style::print_problem_error(&format!("{} is not a valid contrib module!", id))
            }
            CompileFailed(msg) => style::print_compile_failure(msg),
            Validated(_) => {}
        }
        Ok(outcome)
    }

    async fn run_validator(&self, dir: &Path) -> ProblemOutcome {
        use ProblemOutcome::*;

        let cfg = match ProblemConfig::load(dir) {
            Ok(cfg) => cfg,
            Err(e) => return InvalidConfig(format!("Invalid problem config: {}", e)),
        };
        let Some(validator) = &cfg.validator else {
            return Skipped(SkipReason::NoValidator)
        };
        let Some(language) = validator
            .language
            .as_deref()
            .filter(|lang| self.executors.supports(lang)) else {
            return Skipped(SkipReason::LanguageNotSupported)
        };
        let Some(feedback) = validator.feedback_stream() else {
            return Skipped(SkipReason::FeedbackNotSupported)
        };
        let Some(sources) = validator.source_files(dir) else {
            return Skipped(SkipReason::NoValidator)
        };

        let contrib_id = validator
            .contrib_type
            .as_deref()
            .unwrap_or(ContribRegistry::DEFAULT);
        let Some(contrib) = self.contribs.get(contrib_id) else {
            return InvalidContrib(contrib_id.to_owned())
        };
        let args = ArgsTemplate::new(
            validator
                .args_format_string
                .as_deref()
                .unwrap_or_else(|| contrib.default_args_format_string()),
        );

        let tree = match cfg.test_case_tree(dir) {
            Ok(tree) => tree,
            Err(e) => return InvalidConfig(format!("Invalid test cases: {}", e)),
        };

        let binary = ValidatorBinary::Source {
            language: language.to_owned(),
            sources,
            compiler_time_limit: validator
                .compiler_time_limit
                .unwrap_or(self.cfg.generator_compiler_time_limit)
                .as_duration(),
        };
        let limits = self.validator_limits(validator);
        if let Err(e) = check_wall_times(&limits, &tree) {
            return InvalidConfig(format!("Invalid test cases: {}", e));
        }
        log::debug!("Validator limits: {:?}, args: '{}'", limits, args.as_str());

        let spinner = Spinner::start(format!("Compiling {} validator...", language));
        let built = ValidatorGrader::build(
            binary,
            &self.executors,
            self.sandbox.clone(),
            limits,
            args,
        )
        .await;
        spinner.finish();

        let grader = match built {
            Ok(grader) => grader.feedback(feedback),
            Err(e) => {
                log::info!("Compile error: {:?}", e);
                return CompileFailed(e.to_string());
            }
        };
        Validated(judge_cases(&grader, &tree, |_| ()).await)
    }

    fn validator_limits(&self, validator: &ValidatorConfig) -> ResourceLimits {
        let time = validator
            .time
            .unwrap_or(self.cfg.generator_time_limit)
            .as_duration();
        let memory = validator
            .memory
            .map(|kib| kib.saturating_mul(1024))
            .unwrap_or_else(|| self.cfg.generator_memory_limit_bytes());
        ResourceLimits::new(time, memory)
    }

    /// Runs a precompiled solution on every case of a problem and compares its output.
    pub async fn check_problem(&self, problem_id: &str, program: &Path) -> Result<RunRecord> {
        let dir = self
            .problems
            .get(problem_id)
            .with_context(|| format!("Unknown problem '{}'", problem_id))?;
        let cfg = ProblemConfig::load(dir)
            .with_context(|| format!("Failed to load config of problem '{}'", problem_id))?;
        let tree = cfg
            .test_case_tree(dir)
            .with_context(|| format!("Invalid test cases in problem '{}'", problem_id))?;
        ensure!(!tree.is_empty(), "Problem '{}' has no test cases", problem_id);

        let program = fsutil::canonicalize_path(program)?;
        let time = cfg
            .time_limit
            .unwrap_or(self.cfg.generator_time_limit)
            .as_duration();
        let memory = cfg
            .memory_limit
            .map(|kib| kib.saturating_mul(1024))
            .unwrap_or_else(|| self.cfg.generator_memory_limit_bytes());
        let limits = ResourceLimits::new(time, memory);
        check_wall_times(&limits, &tree)
            .with_context(|| format!("Invalid test cases in problem '{}'", problem_id))?;
        let grader = StandardGrader::new(
            Arc::new(Executable::precompiled(program.to_string_lossy(), vec![])),
            self.sandbox.clone(),
            limits,
        );

        println!("Checking {} on problem {}...", program.display(), problem_id);
        let mut wrong_answers = Vec::new();
        let record = judge_cases(&grader, &tree, |graded| {
            if graded.verdict.code() != JudgeCode::WA {
                return;
            }
            if let (Some(outcome), Some(Ok(expected))) =
                (graded.outcome, graded.case.expected_output())
            {
                wrong_answers.push((
                    graded.id,
                    graded.verdict.clone(),
                    expected.to_vec(),
                    outcome.stdout().to_vec(),
                ));
            }
        })
        .await;

        for (id, verdict, expected, actual) in &wrong_answers {
            style::print_wrong_answer_detail(id, verdict, expected, actual);
        }
        style::print_check_summary(&record);
        Ok(record)
    }
}

/// Fails if some case's wall time limit cannot be represented.
fn check_wall_times(
    limits: &ResourceLimits,
    tree: &TestCaseTree,
) -> Result<(), WallTimeRangeError> {
    tree.flatten().into_iter().try_for_each(|(_, case)| {
        limits
            .with_wall_time_factor(case.config.wall_time_factor)
            .map(drop)
    })
}

/// A case that was just judged.
pub struct Graded<'a> {
    pub id: CaseId,
    pub case: &'a TestCase,
    pub verdict: &'a Verdict,
    pub outcome: Option<&'a ExchangeOutcome>,
}

/// Judges all cases in declaration order, printing a header per batch and a line per case.
///
/// Case numbers run across the whole problem. Batches are told apart by contiguous runs of the
/// batch number.
pub async fn judge_cases<G, F>(grader: &G, tree: &TestCaseTree, mut on_graded: F) -> RunRecord
where
    G: Grader + ?Sized,
    F: FnMut(Graded<'_>),
{
    let flattened = tree.flatten();
    let mut record = RunRecord::new();
    let mut case_number = 0;

    for (batch_number, cases) in contiguous_runs(&flattened, |(batch, _)| *batch) {
        if let Some(n) = batch_number {
            style::print_batch_header(n);
        }
        for &(_, case) in cases {
            case_number += 1;
            let id = CaseId {
                number: case_number,
                batch_number: case.batch_number,
                position: case.position,
            };
            let (verdict, outcome) = grader.grade_with_outcome(case).await;
            style::print_case_line(&id, &verdict);
            on_graded(Graded {
                id,
                case,
                verdict: &verdict,
                outcome: outcome.as_ref(),
            });
            record.push(id, verdict);
        }
    }
    record
}

/// Writes the example `kvalid.toml` into `dir`. Returns the path written.
pub fn write_example_config(dir: impl AsRef<Path>, overwrite: bool) -> Result<PathBuf> {
    let path = dir.as_ref().join(Config::FILENAME);
    ensure!(
        overwrite || !path.exists(),
        "{} already exists",
        path.display()
    );
    fsutil::write_with_mkdir(&path, Config::example_toml()?)
        .context("Failed to write example config")?;
    Ok(path)
}
