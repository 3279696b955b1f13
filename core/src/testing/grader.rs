use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;

use super::{
    channel::{ExchangeError, ExchangeOutcome, ProcessChannel, DEFAULT_ERROR_CAP},
    result::{compute_verdict, describe, judge_exit, FeedbackStream, JudgeCode, Verdict},
    testcase::TestCase,
};
use crate::{
    executor::{CompileError, Executable, ExecutorRegistry},
    sandbox::{LaunchError, LaunchSpec, ResourceLimits, Sandbox, WallTimeRangeError},
    str_interp::{format_braces, InterpError},
};

#[derive(Debug, thiserror::Error)]
pub enum GradeError {
    #[error("Invalid argument template: {0}")]
    ArgsTemplate(#[from] InterpError),

    #[error("Unbalanced quotes in arguments: '{0}'")]
    ArgsQuote(String),

    #[error(transparent)]
    WallTime(#[from] WallTimeRangeError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("Cannot load test data: {0}")]
    TestData(#[from] fsutil::Error),

    #[error("No expected output for case #{0}")]
    NoExpectedOutput(u32),
}

/// Judges one case at a time: `launch_process`, then `interact`, then `score`.
#[async_trait]
pub trait Grader: Send + Sync {
    async fn launch_process(&self, case: &TestCase) -> Result<ProcessChannel, GradeError>;

    async fn interact(
        &self,
        case: &TestCase,
        channel: ProcessChannel,
    ) -> Result<ExchangeOutcome, GradeError>;

    fn score(&self, case: &TestCase, outcome: &ExchangeOutcome) -> Verdict;

    /// Never fails: anything that goes wrong becomes an `RTE` verdict for this case.
    async fn grade(&self, case: &TestCase) -> Verdict {
        self.grade_with_outcome(case).await.0
    }

    /// Like [`Grader::grade`], also handing back what the process produced if it ran.
    async fn grade_with_outcome(&self, case: &TestCase) -> (Verdict, Option<ExchangeOutcome>) {
        let channel = match self.launch_process(case).await {
            Ok(channel) => channel,
            Err(e) => {
                log::warn!("Failed to launch process: {:#}", e);
                return (Verdict::internal_error(&e), None);
            }
        };
        match self.interact(case, channel).await {
            Ok(outcome) => (self.score(case, &outcome), Some(outcome)),
            Err(e) => {
                log::warn!("Failed to judge case: {:#}", e);
                (Verdict::internal_error(&e), None)
            }
        }
    }
}

/// Argument template such as `{batch_no} {case_no}`, split shell-style after substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgsTemplate(String);

impl ArgsTemplate {
    pub fn new(fmt: impl Into<String>) -> Self {
        Self(fmt.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Unbatched cases get `0` as the batch number.
    pub fn resolve(
        &self,
        batch_number: Option<u32>,
        position: u32,
    ) -> Result<Vec<String>, GradeError> {
        let vars = maplit::hashmap! {
            "batch_no" => batch_number.unwrap_or(0).to_string(),
            "case_no" => position.to_string(),
        };
        let line = format_braces(&self.0, &vars)?;
        shlex::split(&line).ok_or(GradeError::ArgsQuote(line))
    }
}

#[derive(Debug, Clone)]
pub enum ValidatorBinary {
    Precompiled(Arc<Executable>),
    Source {
        language: String,
        sources: Vec<PathBuf>,
        compiler_time_limit: Duration,
    },
}

impl ValidatorBinary {
    pub async fn resolve(
        self,
        executors: &ExecutorRegistry,
    ) -> Result<Arc<Executable>, CompileError> {
        match self {
            Self::Precompiled(exe) => Ok(exe),
            Self::Source {
                language,
                sources,
                compiler_time_limit,
            } => executors
                .compile(&sources, &[], &language, compiler_time_limit)
                .await
                .map(Arc::new),
        }
    }
}

/// Runs a validator on the case input; exit 0 within limits means the input is valid.
pub struct ValidatorGrader {
    executable: Arc<Executable>,
    sandbox: Arc<dyn Sandbox>,
    limits: ResourceLimits,
    args: ArgsTemplate,
    feedback: FeedbackStream,
    error_cap: usize,
}

impl ValidatorGrader {
    /// `limits.wall_time` is ignored; each case scales `limits.time` by its own factor.
    pub fn new(
        executable: Arc<Executable>,
        sandbox: Arc<dyn Sandbox>,
        limits: ResourceLimits,
        args: ArgsTemplate,
    ) -> Self {
        Self {
            executable,
            sandbox,
            limits,
            args,
            feedback: FeedbackStream::default(),
            error_cap: DEFAULT_ERROR_CAP,
        }
    }

    pub async fn build(
        binary: ValidatorBinary,
        executors: &ExecutorRegistry,
        sandbox: Arc<dyn Sandbox>,
        limits: ResourceLimits,
        args: ArgsTemplate,
    ) -> Result<Self, CompileError> {
        let executable = binary.resolve(executors).await?;
        Ok(Self::new(executable, sandbox, limits, args))
    }

    pub fn feedback(mut self, feedback: FeedbackStream) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn error_cap(mut self, cap: usize) -> Self {
        self.error_cap = cap;
        self
    }

    fn case_limits(&self, case: &TestCase) -> Result<ResourceLimits, WallTimeRangeError> {
        self.limits.with_wall_time_factor(case.config.wall_time_factor)
    }
}

#[async_trait]
impl Grader for ValidatorGrader {
    async fn launch_process(&self, case: &TestCase) -> Result<ProcessChannel, GradeError> {
        let args = self.args.resolve(case.batch_number, case.position)?;
        let limits = self.case_limits(case)?;
        launch(&self.executable, &*self.sandbox, case, args, limits).await
    }

    async fn interact(
        &self,
        case: &TestCase,
        channel: ProcessChannel,
    ) -> Result<ExchangeOutcome, GradeError> {
        let input = case.input_data()?;
        let outcome = channel
            .exchange(input, case.config.output_limit_length, self.error_cap)
            .await?;
        Ok(outcome)
    }

    fn score(&self, case: &TestCase, outcome: &ExchangeOutcome) -> Verdict {
        match self.case_limits(case) {
            Ok(limits) => compute_verdict(outcome, &limits, self.feedback, case.points),
            Err(e) => Verdict::internal_error(&e),
        }
    }
}

/// Runs a solution on the case input and compares stdout with the expected output byte by byte.
pub struct StandardGrader {
    executable: Arc<Executable>,
    sandbox: Arc<dyn Sandbox>,
    limits: ResourceLimits,
    error_cap: usize,
}

impl StandardGrader {
    pub fn new(
        executable: Arc<Executable>,
        sandbox: Arc<dyn Sandbox>,
        limits: ResourceLimits,
    ) -> Self {
        Self {
            executable,
            sandbox,
            limits,
            error_cap: DEFAULT_ERROR_CAP,
        }
    }

    fn case_limits(&self, case: &TestCase) -> Result<ResourceLimits, WallTimeRangeError> {
        self.limits.with_wall_time_factor(case.config.wall_time_factor)
    }
}

#[async_trait]
impl Grader for StandardGrader {
    async fn launch_process(&self, case: &TestCase) -> Result<ProcessChannel, GradeError> {
        if case.expected_output().is_none() {
            return Err(GradeError::NoExpectedOutput(case.position));
        }
        let limits = self.case_limits(case)?;
        launch(&self.executable, &*self.sandbox, case, vec![], limits).await
    }

    async fn interact(
        &self,
        case: &TestCase,
        channel: ProcessChannel,
    ) -> Result<ExchangeOutcome, GradeError> {
        let input = case.input_data()?;
        // Load the answer up front so that a missing file is not reported as WA.
        if let Some(expected) = case.expected_output() {
            expected?;
        }
        let outcome = channel
            .exchange(input, case.config.output_limit_length, self.error_cap)
            .await?;
        Ok(outcome)
    }

    fn score(&self, case: &TestCase, outcome: &ExchangeOutcome) -> Verdict {
        let limits = match self.case_limits(case) {
            Ok(limits) => limits,
            Err(e) => return Verdict::internal_error(&e),
        };
        let report = outcome.report();
        let mut flags = judge_exit(report, &limits, outcome.output_limit_exceeded().is_some());
        if flags.is_empty() {
            match case.expected_output() {
                Some(Ok(expected)) if expected == outcome.stdout() => {}
                Some(Ok(_)) => flags.insert(JudgeCode::WA),
                Some(Err(e)) => return Verdict::internal_error(&e),
                None => {
                    let e = GradeError::NoExpectedOutput(case.position);
                    return Verdict::internal_error(&e);
                }
            }
        }
        let feedback = describe(flags.primary(), Some(report.status));
        Verdict::from_flags(flags, feedback, case.points, Some(*report))
    }
}

async fn launch(
    executable: &Executable,
    sandbox: &dyn Sandbox,
    case: &TestCase,
    args: Vec<String>,
    limits: ResourceLimits,
) -> Result<ProcessChannel, GradeError> {
    let (program, args) = executable.command_line(args);
    let spec = LaunchSpec::new(program, args, limits).symlinks(case.config.symlinks.clone());
    Ok(ProcessChannel::launch(sandbox, spec).await?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        sandbox::{ExitStatus, LocalSandbox, ADDRESS_SPACE_GRACE},
        testing::{CaseConfig, CaseData, DataSource, TestCaseTree},
    };

    fn sh_validator(script: &str) -> Arc<Executable> {
        Arc::new(Executable::precompiled(
            "/bin/sh",
            vec!["-c".to_owned(), script.to_owned(), "validator".to_owned()],
        ))
    }

    fn limits() -> ResourceLimits {
        ResourceLimits::new(Duration::from_secs(2), 256 << 20)
    }

    fn grader(script: &str) -> ValidatorGrader {
        ValidatorGrader::new(
            sh_validator(script),
            Arc::new(LocalSandbox),
            limits(),
            ArgsTemplate::new("{batch_no} {case_no}"),
        )
    }

    fn tree(inputs: &[&str]) -> TestCaseTree {
        inputs
            .iter()
            .fold(TestCaseTree::builder(), |b, input| {
                b.case(CaseData::new(DataSource::memory(*input)).points(5.0))
            })
            .build()
    }

    fn single_case(wall_time_factor: f64) -> TestCaseTree {
        TestCaseTree::builder()
            .case(
                CaseData::new(DataSource::memory("")).config(CaseConfig {
                    wall_time_factor,
                    ..Default::default()
                }),
            )
            .build()
    }

    #[test]
    fn args_template_resolution() {
        let t = ArgsTemplate::new("{batch_no} {case_no}");
        assert_eq!(t.resolve(Some(2), 3).unwrap(), ["2", "3"]);
        assert_eq!(t.resolve(None, 7).unwrap(), ["0", "7"]);

        let t = ArgsTemplate::new("--group 'st {batch_no}'");
        assert_eq!(t.resolve(Some(1), 1).unwrap(), ["--group", "st 1"]);

        let t = ArgsTemplate::new("{test_no}");
        assert!(matches!(t.resolve(None, 1), Err(GradeError::ArgsTemplate(_))));

        let t = ArgsTemplate::new("'{case_no}");
        assert!(matches!(t.resolve(None, 1), Err(GradeError::ArgsQuote(_))));
    }

    #[tokio::test]
    async fn precompiled_binary_skips_compilation() {
        let exe = sh_validator("exit 0");
        let resolved = ValidatorBinary::Precompiled(exe.clone())
            .resolve(&ExecutorRegistry::empty())
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&exe, &resolved));

        let res = ValidatorBinary::Source {
            language: "SH".to_owned(),
            sources: vec![PathBuf::from("v.sh")],
            compiler_time_limit: Duration::from_secs(1),
        }
        .resolve(&ExecutorRegistry::empty())
        .await;
        assert!(matches!(res, Err(CompileError::UnsupportedLanguage(_))));
    }

    #[tokio::test]
    async fn validator_sees_input_and_arguments() {
        let g = grader(
            r#"read n
[ "$n" -le 10 ] || { echo "n too large: $n" >&2; exit 3; }
[ "$1 $2" = "0 $n" ]"#,
        );
        let tree = tree(&["1\n", "2\n", "11\n"]);
        let verdicts: Vec<_> = {
            let mut v = Vec::new();
            for (_, case) in tree.flatten() {
                v.push(g.grade(case).await);
            }
            v
        };

        assert!(verdicts[0].is_accepted());
        assert_eq!(verdicts[0].points_awarded, 5.0);
        assert!(verdicts[1].is_accepted());
        assert_eq!(verdicts[2].code(), JudgeCode::IR);
        assert_eq!(verdicts[2].feedback, "n too large: 11");
        assert_eq!(verdicts[2].points_awarded, 0.0);
    }

    #[tokio::test]
    async fn feedback_stream_is_configurable() {
        let g = grader("echo on-stdout; echo on-stderr >&2").feedback(FeedbackStream::Stdout);
        let tree = tree(&[""]);
        let v = g.grade(tree.flatten()[0].1).await;
        assert!(v.is_accepted());
        assert_eq!(v.feedback, "on-stdout");
    }

    #[tokio::test]
    async fn output_limit_uses_case_config() {
        let g = grader("yes");
        let tree = TestCaseTree::builder()
            .case(
                CaseData::new(DataSource::memory("")).config(CaseConfig {
                    output_limit_length: 10,
                    ..Default::default()
                }),
            )
            .build();
        let v = g.grade(tree.flatten()[0].1).await;
        assert_eq!(v.code(), JudgeCode::OLE);
        assert_eq!(v.feedback, "output limit exceeded");
    }

    #[tokio::test]
    async fn launch_failure_is_runtime_error() {
        let g = ValidatorGrader::new(
            Arc::new(Executable::precompiled("/nonexistent/validator", vec![])),
            Arc::new(LocalSandbox),
            limits(),
            ArgsTemplate::new("{case_no}"),
        );
        let tree = tree(&["1\n"]);
        let v = g.grade(tree.flatten()[0].1).await;
        assert_eq!(v.code(), JudgeCode::RTE);
        assert!(v.feedback.contains("/nonexistent/validator"), "{}", v.feedback);
    }

    #[tokio::test]
    async fn missing_input_file_is_runtime_error() {
        let g = grader("exit 0");
        let tree = TestCaseTree::builder()
            .case(CaseData::new(DataSource::file("/nonexistent/kvalid/1.in")))
            .build();
        let v = g.grade(tree.flatten()[0].1).await;
        assert_eq!(v.code(), JudgeCode::RTE);
    }

    #[tokio::test]
    async fn standard_grader_compares_stdout() {
        let g = StandardGrader::new(
            sh_validator("read a b; echo $((a + b))"),
            Arc::new(LocalSandbox),
            limits(),
        );
        let tree = TestCaseTree::builder()
            .case(
                CaseData::new(DataSource::memory("1 2\n"))
                    .expected_output(DataSource::memory("3\n"))
                    .points(1.0),
            )
            .case(
                CaseData::new(DataSource::memory("2 2\n"))
                    .expected_output(DataSource::memory("5\n"))
                    .points(1.0),
            )
            .case(CaseData::new(DataSource::memory("0 0\n")))
            .build();
        let flat = tree.flatten();

        let v = g.grade(flat[0].1).await;
        assert!(v.is_accepted());
        assert_eq!(v.points_awarded, 1.0);

        let v = g.grade(flat[1].1).await;
        assert_eq!(v.code(), JudgeCode::WA);
        assert_eq!(v.feedback, "wrong answer");

        let v = g.grade(flat[2].1).await;
        assert_eq!(v.code(), JudgeCode::RTE);
    }

    #[tokio::test]
    async fn busy_loop_is_stopped_by_cpu_limit() {
        let g = ValidatorGrader::new(
            sh_validator("while :; do :; done"),
            Arc::new(LocalSandbox),
            ResourceLimits::new(Duration::from_millis(300), 256 << 20),
            ArgsTemplate::new(""),
        );
        let tree = single_case(20.0);
        let v = g.grade(tree.flatten()[0].1).await;
        assert_eq!(v.code(), JudgeCode::TLE, "{:?}", v);
        assert!(!v.flags.contains(JudgeCode::RTE));

        let usage = v.usage.unwrap();
        assert_eq!(usage.status, ExitStatus::Signaled(libc::SIGXCPU));
        assert!(usage.cpu_time >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn runaway_allocation_is_memory_limit_exceeded() {
        let memory = 64 << 20;
        let g = ValidatorGrader::new(
            sh_validator("exec env LC_ALL=C tail /dev/zero"),
            Arc::new(LocalSandbox),
            ResourceLimits::new(Duration::from_secs(5), memory),
            ArgsTemplate::new(""),
        );
        let tree = single_case(2.0);
        let v = g.grade(tree.flatten()[0].1).await;
        assert_eq!(v.code(), JudgeCode::MLE, "{:?}", v);

        let usage = v.usage.unwrap();
        assert!(usage.peak_memory >= memory);
        assert!(usage.peak_memory <= memory + ADDRESS_SPACE_GRACE);
    }

    #[tokio::test]
    async fn unrepresentable_wall_time_is_runtime_error() {
        let g = grader("exit 0");
        let tree = single_case(1e300);
        let v = g.grade(tree.flatten()[0].1).await;
        assert_eq!(v.code(), JudgeCode::RTE);
        assert!(v.feedback.contains("Wall time limit out of range"), "{}", v.feedback);
    }
}
