use std::collections::BTreeSet;

use crate::sandbox::{ExitReport, ExitStatus, ResourceLimits};

use super::channel::ExchangeOutcome;

/// Verdict codes. Declaration order is the precedence of the primary code.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
pub enum JudgeCode {
    /// Output limit exceeded
    OLE,
    /// Wall time limit exceeded
    WTLE,
    /// CPU time limit exceeded
    TLE,
    /// Memory limit exceeded
    MLE,
    /// Invalid return (non-zero exit code)
    IR,
    /// Runtime error (killed by a signal, or could not be run at all)
    RTE,
    /// Wrong answer
    WA,
    AC,
}

impl JudgeCode {
    pub fn is_accepted(self) -> bool {
        self == JudgeCode::AC
    }
}

/// Failure flags of a single run. Empty means accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ResultFlags(BTreeSet<JudgeCode>);

impl ResultFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, code: JudgeCode) {
        if code != JudgeCode::AC {
            self.0.insert(code);
        }
    }

    pub fn contains(&self, code: JudgeCode) -> bool {
        self.0.contains(&code)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn primary(&self) -> JudgeCode {
        self.0.iter().next().copied().unwrap_or(JudgeCode::AC)
    }

    pub fn iter(&self) -> impl Iterator<Item = JudgeCode> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<JudgeCode> for ResultFlags {
    fn from_iter<I: IntoIterator<Item = JudgeCode>>(iter: I) -> Self {
        let mut flags = Self::new();
        iter.into_iter().for_each(|c| flags.insert(c));
        flags
    }
}

/// Which output stream of the validator carries its human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::EnumString, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum FeedbackStream {
    Stdout,
    #[default]
    Stderr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub flags: ResultFlags,
    pub feedback: String,
    pub points_awarded: f64,
    pub usage: Option<ExitReport>,
}

impl Verdict {
    /// Maximum length of a diagnostic message turned into feedback.
    pub const MAX_DIAGNOSTIC_LEN: usize = 200;

    pub fn is_accepted(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn code(&self) -> JudgeCode {
        self.flags.primary()
    }

    pub fn from_flags(
        flags: ResultFlags,
        feedback: impl Into<String>,
        points: f64,
        usage: Option<ExitReport>,
    ) -> Self {
        let points_awarded = if flags.is_empty() { points } else { 0.0 };
        Self {
            flags,
            feedback: feedback.into(),
            points_awarded,
            usage,
        }
    }

    /// Runtime-error verdict for a case that could not be run or judged.
    pub fn internal_error(diagnostic: &dyn std::fmt::Display) -> Self {
        let mut feedback = diagnostic.to_string();
        if let Some((i, _)) = feedback.char_indices().nth(Self::MAX_DIAGNOSTIC_LEN) {
            feedback.truncate(i);
            feedback.push_str("...");
        }
        Self::from_flags(
            std::iter::once(JudgeCode::RTE).collect(),
            feedback,
            0.0,
            None,
        )
    }
}

/// Flags derived from how the process ended and what it consumed.
///
/// A kill signal is attributed to the resource limit that caused it, so `RTE` is only
/// raised for signals no limit flag explains. A non-zero exit code is always kept.
pub fn judge_exit(
    report: &ExitReport,
    limits: &ResourceLimits,
    output_limit_exceeded: bool,
) -> ResultFlags {
    let mut flags = ResultFlags::new();
    if output_limit_exceeded {
        flags.insert(JudgeCode::OLE);
        return flags;
    }
    if report.wall_time >= limits.wall_time {
        flags.insert(JudgeCode::WTLE);
    }
    if report.cpu_time >= limits.time {
        flags.insert(JudgeCode::TLE);
    }
    if report.peak_memory >= limits.memory {
        flags.insert(JudgeCode::MLE);
    }
    match report.status {
        ExitStatus::Exited(0) => {}
        ExitStatus::Exited(_) => flags.insert(JudgeCode::IR),
        ExitStatus::Signaled(_) if flags.is_empty() => flags.insert(JudgeCode::RTE),
        ExitStatus::Signaled(_) => {}
    }
    flags
}

pub fn describe(code: JudgeCode, status: Option<ExitStatus>) -> String {
    use JudgeCode::*;
    match code {
        OLE => "output limit exceeded".to_owned(),
        WTLE => "wall time limit exceeded".to_owned(),
        TLE => "time limit exceeded".to_owned(),
        MLE => "memory limit exceeded".to_owned(),
        IR => match status {
            Some(ExitStatus::Exited(code)) => format!("exited with code {}", code),
            _ => "exited with non-zero code".to_owned(),
        },
        RTE => match status {
            Some(ExitStatus::Signaled(sig)) => match signal_name(sig) {
                Some(name) => format!("killed by signal {} ({})", sig, name),
                None => format!("killed by signal {}", sig),
            },
            _ => "runtime error".to_owned(),
        },
        WA => "wrong answer".to_owned(),
        AC => String::new(),
    }
}

fn signal_name(sig: i32) -> Option<&'static str> {
    let name = match sig {
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGILL => "SIGILL",
        libc::SIGKILL => "SIGKILL",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGTERM => "SIGTERM",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        _ => return None,
    };
    Some(name)
}

/// Decodes captured bytes for display, dropping trailing whitespace.
pub fn utf8text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end().to_owned()
}

pub fn compute_verdict(
    outcome: &ExchangeOutcome,
    limits: &ResourceLimits,
    feedback_stream: FeedbackStream,
    points: f64,
) -> Verdict {
    let report = outcome.report();
    let flags = judge_exit(report, limits, outcome.output_limit_exceeded().is_some());

    let stream = match feedback_stream {
        FeedbackStream::Stdout => outcome.stdout(),
        FeedbackStream::Stderr => outcome.stderr(),
    };
    let mut feedback = utf8text(stream);
    if feedback.is_empty() {
        feedback = describe(flags.primary(), Some(report.status));
    }

    Verdict::from_flags(flags, feedback, points, Some(*report))
}

/// Where a verdict came from. `number` counts cases across the whole problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaseId {
    pub number: u32,
    pub batch_number: Option<u32>,
    pub position: u32,
}

/// Verdicts of a problem's cases in the order they were judged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunRecord {
    entries: Vec<(CaseId, Verdict)>,
}

impl RunRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: CaseId, verdict: Verdict) {
        self.entries.push((id, verdict));
    }

    pub fn entries(&self) -> &[(CaseId, Verdict)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if any case has a flag, whatever its points.
    pub fn failed(&self) -> bool {
        self.entries.iter().any(|(_, v)| !v.is_accepted())
    }

    pub fn codes(&self) -> Vec<JudgeCode> {
        self.entries.iter().map(|(_, v)| v.code()).collect()
    }

    pub fn points_awarded(&self) -> f64 {
        self.entries.iter().map(|(_, v)| v.points_awarded).sum()
    }
}
