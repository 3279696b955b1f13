use std::{convert::Infallible, future::Future, io, time::Duration};

use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    time::Instant,
};

use crate::sandbox::{
    BoxedReader, BoxedWriter, ExitReport, LaunchError, LaunchSpec, Sandbox, SandboxedProcess,
};

/// How long past the wall time limit a process may live before it is killed.
pub const WALL_TIME_GRACE: Duration = Duration::from_millis(500);

/// Default cap on captured stderr bytes.
pub const DEFAULT_ERROR_CAP: usize = 1 << 20;

const CHUNK_SIZE: usize = 8192;

const MAX_EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Exchanged {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        report: ExitReport,
    },
    /// `stream` went over its cap and was truncated to exactly the cap; the process was killed.
    OutputLimitExceeded {
        stream: Stream,
        partial_stdout: Vec<u8>,
        partial_stderr: Vec<u8>,
        report: ExitReport,
    },
}

impl ExchangeOutcome {
    pub fn report(&self) -> &ExitReport {
        match self {
            Self::Exchanged { report, .. } | Self::OutputLimitExceeded { report, .. } => report,
        }
    }

    pub fn stdout(&self) -> &[u8] {
        match self {
            Self::Exchanged { stdout, .. } => stdout,
            Self::OutputLimitExceeded { partial_stdout, .. } => partial_stdout,
        }
    }

    pub fn stderr(&self) -> &[u8] {
        match self {
            Self::Exchanged { stderr, .. } => stderr,
            Self::OutputLimitExceeded { partial_stderr, .. } => partial_stderr,
        }
    }

    pub fn output_limit_exceeded(&self) -> Option<Stream> {
        match self {
            Self::Exchanged { .. } => None,
            Self::OutputLimitExceeded { stream, .. } => Some(*stream),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("Failed to communicate with subprocess: {0}")]
    Io(#[source] io::Error),

    #[error("Failed to reap subprocess: {0}")]
    Reap(#[source] io::Error),
}

/// Owns one launched process for the span of a single exchange.
pub struct ProcessChannel {
    process: Box<dyn SandboxedProcess>,
    wall_time_limit: Duration,
}

impl ProcessChannel {
    pub async fn launch(sandbox: &dyn Sandbox, spec: LaunchSpec) -> Result<Self, LaunchError> {
        let wall_time_limit = spec.limits.wall_time;
        let budget = wall_time_limit.saturating_add(WALL_TIME_GRACE);
        let process = tokio::time::timeout(budget, sandbox.launch(spec))
            .await
            .map_err(|_| LaunchError::TimedOut(budget))??;
        Ok(Self {
            process,
            wall_time_limit,
        })
    }

    /// Feeds `input` and drains both output streams concurrently.
    ///
    /// Returns only after the process has been reaped, on every path.
    pub async fn exchange(
        mut self,
        input: &[u8],
        output_cap: usize,
        error_cap: usize,
    ) -> Result<ExchangeOutcome, ExchangeError> {
        let started_at = Instant::now();
        let deadline = started_at.checked_add(self.wall_time_limit.saturating_add(WALL_TIME_GRACE));

        let stdin = self.process.take_stdin();
        let stdout = self.process.take_stdout();
        let stderr = self.process.take_stderr();

        let mut captured = Captured::new(output_cap, error_cap);
        let process = &mut *self.process;
        let pumped = run_until(deadline, async {
            tokio::select! {
                res = captured.pump(stdin, stdout, stderr, input) => res,
                never = watch_exit(process) => match never {},
            }
        })
        .await;

        let (timed_out, io_error) = match pumped {
            Some(Ok(())) => (false, None),
            Some(Err(e)) => (false, Some(e)),
            None => {
                log::debug!("Wall clock ran out after {:?}", started_at.elapsed());
                (true, None)
            }
        };
        if timed_out || io_error.is_some() || captured.overflow.is_some() {
            self.terminate();
        }

        let report = self.reap(deadline).await?;
        if let Some(e) = io_error {
            return Err(ExchangeError::Io(e));
        }

        let Captured {
            stdout,
            stderr,
            overflow,
            ..
        } = captured;
        Ok(match overflow {
            None => ExchangeOutcome::Exchanged {
                stdout,
                stderr,
                report,
            },
            Some(stream) => ExchangeOutcome::OutputLimitExceeded {
                stream,
                partial_stdout: stdout,
                partial_stderr: stderr,
                report,
            },
        })
    }

    /// Kills the process. Safe to call any number of times.
    pub fn terminate(&mut self) {
        if let Err(e) = self.process.kill() {
            log::warn!("Failed to kill subprocess: {}", e);
        }
    }

    async fn reap(&mut self, deadline: Option<Instant>) -> Result<ExitReport, ExchangeError> {
        match run_until(deadline, self.process.wait()).await {
            Some(res) => res.map_err(ExchangeError::Reap),
            None => {
                // Streams are closed but the process lingers.
                self.terminate();
                self.process.wait().await.map_err(ExchangeError::Reap)
            }
        }
    }
}

/// `None` if `deadline` passes first. A deadline beyond the clock's range never passes.
async fn run_until<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Polls until the process is seen exited, so that its wall time does not include waiting for
/// descendants that still hold its pipes. Never completes.
async fn watch_exit(process: &mut dyn SandboxedProcess) -> Infallible {
    let mut interval = Duration::from_millis(1);
    loop {
        match process.check_exited() {
            Ok(false) => {}
            Ok(true) => break,
            Err(e) => {
                log::debug!("Failed to check subprocess exit: {}", e);
                break;
            }
        }
        tokio::time::sleep(interval).await;
        interval = (interval * 2).min(MAX_EXIT_POLL_INTERVAL);
    }
    std::future::pending().await
}

struct Captured {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    output_cap: usize,
    error_cap: usize,
    overflow: Option<Stream>,
}

impl Captured {
    fn new(output_cap: usize, error_cap: usize) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            output_cap,
            error_cap,
            overflow: None,
        }
    }

    /// Keeps at most the cap of `stream`; returns false once the cap is overrun.
    fn accept(&mut self, stream: Stream, chunk: &[u8]) -> bool {
        let (buf, cap) = match stream {
            Stream::Stdout => (&mut self.stdout, self.output_cap),
            Stream::Stderr => (&mut self.stderr, self.error_cap),
        };
        let room = cap.saturating_sub(buf.len());
        if chunk.len() > room {
            buf.extend_from_slice(&chunk[..room]);
            self.overflow = Some(stream);
            false
        } else {
            buf.extend_from_slice(chunk);
            true
        }
    }

    /// Runs until both output streams hit EOF and stdin is fully written, or a cap is overrun.
    /// Collected bytes live in `self`, so they survive cancellation by the wall clock.
    async fn pump(
        &mut self,
        stdin: Option<BoxedWriter>,
        mut stdout: Option<BoxedReader>,
        mut stderr: Option<BoxedReader>,
        input: &[u8],
    ) -> io::Result<()> {
        let feed = feed_input(stdin, input);
        tokio::pin!(feed);
        let mut fed = false;

        let mut out_chunk = vec![0u8; CHUNK_SIZE];
        let mut err_chunk = vec![0u8; CHUNK_SIZE];

        while !fed || stdout.is_some() || stderr.is_some() {
            tokio::select! {
                res = &mut feed, if !fed => {
                    fed = true;
                    res?;
                }
                res = read_chunk(&mut stdout, &mut out_chunk), if stdout.is_some() => {
                    match res? {
                        0 => stdout = None,
                        n => if !self.accept(Stream::Stdout, &out_chunk[..n]) {
                            return Ok(());
                        }
                    }
                }
                res = read_chunk(&mut stderr, &mut err_chunk), if stderr.is_some() => {
                    match res? {
                        0 => stderr = None,
                        n => if !self.accept(Stream::Stderr, &err_chunk[..n]) {
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

async fn feed_input(stdin: Option<BoxedWriter>, input: &[u8]) -> io::Result<()> {
    let Some(mut stdin) = stdin else {
        return Ok(())
    };
    let res = match stdin.write_all(input).await {
        Ok(()) => stdin.shutdown().await,
        Err(e) => Err(e),
    };
    match res {
        // The process may exit without reading all of its input.
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        res => res,
    }
}

async fn read_chunk(reader: &mut Option<BoxedReader>, buf: &mut [u8]) -> io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::sandbox::{ExitStatus, LocalSandbox, ResourceLimits};

    const MIB: u64 = 1 << 20;

    async fn run_sh(
        script: &str,
        time_limit: Duration,
        input: &[u8],
        output_cap: usize,
        error_cap: usize,
    ) -> ExchangeOutcome {
        let limits = ResourceLimits::new(time_limit, 256 * MIB);
        let spec = LaunchSpec::new("/bin/sh", vec!["-c".into(), script.into()], limits);
        let channel = ProcessChannel::launch(&LocalSandbox, spec).await.unwrap();
        channel.exchange(input, output_cap, error_cap).await.unwrap()
    }

    #[tokio::test]
    async fn echoes_input_and_collects_both_streams() {
        let o = run_sh(
            "cat; echo done >&2",
            Duration::from_secs(2),
            b"1 2\n3\n",
            1024,
            1024,
        )
        .await;
        assert_eq!(o.output_limit_exceeded(), None);
        assert_eq!(o.stdout(), b"1 2\n3\n");
        assert_eq!(o.stderr(), b"done\n");
        assert_eq!(o.report().status, ExitStatus::Exited(0));
    }

    #[tokio::test]
    async fn unread_input_does_not_break_the_exchange() {
        let input = vec![b'x'; 4 * MIB as usize];
        let o = run_sh("exit 0", Duration::from_secs(2), &input, 1024, 1024).await;
        assert_eq!(o.report().status, ExitStatus::Exited(0));
    }

    #[tokio::test]
    async fn stdout_overflow_is_truncated_and_killed() {
        let started = std::time::Instant::now();
        let o = run_sh("yes", Duration::from_secs(5), b"", 1000, 1024).await;
        assert!(started.elapsed() < Duration::from_secs(5));

        match o {
            ExchangeOutcome::OutputLimitExceeded {
                stream,
                partial_stdout,
                report,
                ..
            } => {
                assert_eq!(stream, Stream::Stdout);
                assert_eq!(partial_stdout.len(), 1000);
                assert!(partial_stdout.starts_with(b"y\ny\n"));
                assert_eq!(report.status, ExitStatus::Signaled(libc::SIGKILL));
            }
            other => panic!("expected output limit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stderr_overflow_keeps_stdout() {
        let o = run_sh(
            "echo hello; sleep 0.2; while :; do echo noise >&2; done",
            Duration::from_secs(5),
            b"",
            1024,
            64,
        )
        .await;
        assert_eq!(o.output_limit_exceeded(), Some(Stream::Stderr));
        assert_eq!(o.stdout(), b"hello\n");
        assert_eq!(o.stderr().len(), 64);
    }

    #[tokio::test]
    async fn wall_time_is_enforced() {
        let started = std::time::Instant::now();
        let o = run_sh("sleep 10", Duration::from_millis(200), b"", 1024, 1024).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(o.report().wall_time >= Duration::from_millis(200));
        assert_eq!(o.report().status, ExitStatus::Signaled(libc::SIGKILL));
    }

    #[tokio::test]
    async fn lingering_process_with_closed_streams_is_killed() {
        let started = std::time::Instant::now();
        let o = run_sh(
            "exec >/dev/null 2>&1 </dev/null; sleep 10",
            Duration::from_millis(200),
            b"",
            1024,
            1024,
        )
        .await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(o.report().status, ExitStatus::Signaled(libc::SIGKILL));
    }

    #[tokio::test]
    async fn wall_time_stops_at_exit_even_if_a_descendant_holds_stdout() {
        let o = run_sh("sleep 10 & exit 0", Duration::from_millis(300), b"", 1024, 1024).await;
        assert_eq!(o.report().status, ExitStatus::Exited(0));
        assert!(o.report().wall_time < Duration::from_millis(300), "{:?}", o.report());
    }
}
