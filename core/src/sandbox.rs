mod local;

use std::{collections::BTreeMap, fmt, io, path::PathBuf, time::Duration};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use local::{LocalSandbox, ADDRESS_SPACE_GRACE};

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    /// CPU time
    pub time: Duration,
    /// Peak resident memory in bytes
    pub memory: u64,
    pub wall_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("Wall time limit out of range: {time:?} x {factor}")]
pub struct WallTimeRangeError {
    pub time: Duration,
    pub factor: f64,
}

impl ResourceLimits {
    /// The wall time limit starts out equal to `time`.
    pub fn new(time: Duration, memory: u64) -> Self {
        Self {
            time,
            memory,
            wall_time: time,
        }
    }

    /// Sets the wall time limit to `time * wall_time_factor`.
    pub fn with_wall_time_factor(self, wall_time_factor: f64) -> Result<Self, WallTimeRangeError> {
        let wall_time = Duration::try_from_secs_f64(self.time.as_secs_f64() * wall_time_factor)
            .map_err(|_| WallTimeRangeError {
                time: self.time,
                factor: wall_time_factor,
            })?;
        Ok(Self { wall_time, ..self })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
    #[default]
    Piped,
    Null,
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub limits: ResourceLimits,
    /// link name (relative to the working dir) => target
    pub symlinks: BTreeMap<String, PathBuf>,
    pub stdin: StreamMode,
    pub stdout: StreamMode,
    pub stderr: StreamMode,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>, limits: ResourceLimits) -> Self {
        Self {
            program: program.into(),
            args,
            limits,
            symlinks: BTreeMap::new(),
            stdin: StreamMode::Piped,
            stdout: StreamMode::Piped,
            stderr: StreamMode::Piped,
        }
    }

    pub fn symlinks(mut self, symlinks: BTreeMap<String, PathBuf>) -> Self {
        self.symlinks = symlinks;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit code {}", code),
            ExitStatus::Signaled(sig) => write!(f, "signal {}", sig),
        }
    }
}

/// Exit status and resource usage of a reaped process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub status: ExitStatus,
    pub cpu_time: Duration,
    pub wall_time: Duration,
    /// bytes
    pub peak_memory: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Program not found: '{program}'")]
    NotFound {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to prepare working dir: {0}")]
    Setup(#[from] fsutil::Error),

    #[error("Failed to create working dir: {0}")]
    TempDir(#[source] io::Error),

    #[error("Launch did not finish within {0:?}")]
    TimedOut(Duration),
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn SandboxedProcess>, LaunchError>;
}

#[async_trait]
pub trait SandboxedProcess: Send {
    fn take_stdin(&mut self) -> Option<BoxedWriter>;
    fn take_stdout(&mut self) -> Option<BoxedReader>;
    fn take_stderr(&mut self) -> Option<BoxedReader>;

    /// Whether the process has exited, without reaping it. The first `true` fixes the end of its
    /// wall time, even if it is reaped later.
    fn check_exited(&mut self) -> io::Result<bool> {
        Ok(false)
    }

    /// Must be idempotent, and a no-op once the process has been reaped.
    fn kill(&mut self) -> io::Result<()>;

    /// Waits for exit and reaps. Cancel-safe; calling again after reaping returns the same report.
    async fn wait(&mut self) -> io::Result<ExitReport>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wall_time_is_scaled_by_factor() {
        let limits = ResourceLimits::new(Duration::from_secs(2), 1 << 20);
        assert_eq!(limits.wall_time, Duration::from_secs(2));

        let scaled = limits.with_wall_time_factor(1.5).unwrap();
        assert_eq!(scaled.wall_time, Duration::from_secs(3));
        assert_eq!(scaled.time, Duration::from_secs(2));
    }

    #[test]
    fn out_of_range_wall_time_is_an_error() {
        let limits = ResourceLimits::new(Duration::from_secs(2), 1 << 20);
        let err = limits.with_wall_time_factor(1e300).unwrap_err();
        assert_eq!(err.factor, 1e300);
        assert!(limits.with_wall_time_factor(f64::NAN).is_err());
    }
}
