use std::{
    io,
    mem::MaybeUninit,
    os::unix::process::CommandExt as _,
    process::{Command, Stdio},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};

use super::*;

const MAX_REAP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How far the address space may grow past the memory limit.
///
/// Allocations fail at `memory + ADDRESS_SPACE_GRACE`, so a runaway process still gets far enough
/// to show a peak RSS over the limit.
pub const ADDRESS_SPACE_GRACE: u64 = 256 << 20;

/// Runs programs as plain child processes in a scratch working dir.
///
/// CPU time is bounded by `RLIMIT_CPU` and the address space by `RLIMIT_AS`. The peak RSS
/// (`ru_maxrss`) is what the verdict compares against the memory limit. There is no isolation
/// beyond that.
#[derive(Debug, Clone, Default)]
pub struct LocalSandbox;

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn SandboxedProcess>, LaunchError> {
        let workdir = tempfile::Builder::new()
            .prefix("kvalid-run-")
            .tempdir()
            .map_err(LaunchError::TempDir)?;

        for (link, target) in &spec.symlinks {
            let link = fsutil::join_within(workdir.path(), link)?;
            fsutil::symlink_with_mkdir(target, link)?;
        }

        let cpu_secs = (spec.limits.time.as_secs_f64().ceil() as u64).saturating_add(1);
        let address_space = spec.limits.memory.saturating_add(ADDRESS_SPACE_GRACE);

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(workdir.path())
            .stdin(stdio(spec.stdin))
            .stdout(stdio(spec.stdout))
            .stderr(stdio(spec.stderr))
            .process_group(0);

        // SAFETY: only async-signal-safe calls (setrlimit) run between fork and exec.
        unsafe {
            cmd.pre_exec(move || apply_rlimits(cpu_secs, address_space));
        }

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => LaunchError::NotFound {
                program: spec.program.clone(),
                source: e,
            },
            _ => LaunchError::Spawn {
                program: spec.program.clone(),
                source: e,
            },
        })?;
        let started_at = Instant::now();
        let pid = child.id() as libc::pid_t;
        log::debug!("Launched '{}' (pid={}) {:?}", spec.program, pid, spec.args);

        let mut proc = LocalProcess {
            pid,
            started_at,
            exited_at: None,
            report: None,
            stdin: None,
            stdout: None,
            stderr: None,
            _workdir: workdir,
        };

        // From here on `proc` owns the pid; dropping it on error kills and reaps.
        let spawn_err = |e| LaunchError::Spawn {
            program: spec.program.clone(),
            source: e,
        };
        proc.stdin = child
            .stdin
            .take()
            .map(ChildStdin::from_std)
            .transpose()
            .map_err(spawn_err)?;
        proc.stdout = child
            .stdout
            .take()
            .map(ChildStdout::from_std)
            .transpose()
            .map_err(spawn_err)?;
        proc.stderr = child
            .stderr
            .take()
            .map(ChildStderr::from_std)
            .transpose()
            .map_err(spawn_err)?;

        Ok(Box::new(proc))
    }
}

fn stdio(mode: StreamMode) -> Stdio {
    match mode {
        StreamMode::Piped => Stdio::piped(),
        StreamMode::Null => Stdio::null(),
    }
}

fn apply_rlimits(cpu_secs: u64, address_space: u64) -> io::Result<()> {
    set_rlimit(libc::RLIMIT_CPU, cpu_secs, cpu_secs.saturating_add(1))?;
    set_rlimit(libc::RLIMIT_AS, address_space, address_space)?;
    set_rlimit(libc::RLIMIT_CORE, 0, 0)
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type Resource = libc::c_int;

fn set_rlimit(resource: Resource, soft: u64, hard: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Child process reaped by `wait4` so that rusage is available.
///
/// The std `Child` handle is dropped right after spawn; it never waits on its own.
struct LocalProcess {
    pid: libc::pid_t,
    started_at: Instant,
    /// First time the process was seen exited; it may have been reaped much later.
    exited_at: Option<Instant>,
    report: Option<ExitReport>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    _workdir: TempDir,
}

impl LocalProcess {
    fn try_reap(&mut self, options: libc::c_int) -> io::Result<Option<ExitReport>> {
        if let Some(report) = self.report {
            return Ok(Some(report));
        }

        let mut status: libc::c_int = 0;
        let mut usage = MaybeUninit::<libc::rusage>::zeroed();
        let ret = unsafe { libc::wait4(self.pid, &mut status, options, usage.as_mut_ptr()) };
        match ret {
            0 => Ok(None),
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
            _ => {
                let usage = unsafe { usage.assume_init() };
                let report = ExitReport {
                    status: decode_status(status),
                    cpu_time: timeval_to_duration(usage.ru_utime)
                        + timeval_to_duration(usage.ru_stime),
                    wall_time: self
                        .exited_at
                        .unwrap_or_else(Instant::now)
                        .duration_since(self.started_at),
                    peak_memory: maxrss_to_bytes(usage.ru_maxrss),
                };
                log::debug!("Reaped pid={}: {:?}", self.pid, report);
                self.report = Some(report);
                Ok(Some(report))
            }
        }
    }
}

#[async_trait]
impl SandboxedProcess for LocalProcess {
    fn take_stdin(&mut self) -> Option<BoxedWriter> {
        self.stdin.take().map(|w| Box::new(w) as BoxedWriter)
    }

    fn take_stdout(&mut self) -> Option<BoxedReader> {
        self.stdout.take().map(|r| Box::new(r) as BoxedReader)
    }

    fn take_stderr(&mut self) -> Option<BoxedReader> {
        self.stderr.take().map(|r| Box::new(r) as BoxedReader)
    }

    fn check_exited(&mut self) -> io::Result<bool> {
        if self.report.is_some() || self.exited_at.is_some() {
            return Ok(true);
        }
        let mut info = MaybeUninit::<libc::siginfo_t>::zeroed();
        let ret = unsafe {
            libc::waitid(
                libc::P_PID,
                self.pid as libc::id_t,
                info.as_mut_ptr(),
                libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
            )
        };
        if ret == -1 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::Interrupted => Ok(false),
                _ => Err(err),
            };
        }
        // With WNOHANG the pid stays zero while the child is still running.
        let info = unsafe { info.assume_init() };
        if unsafe { info.si_pid() } == 0 {
            return Ok(false);
        }
        self.exited_at = Some(Instant::now());
        Ok(true)
    }

    fn kill(&mut self) -> io::Result<()> {
        if self.report.is_some() {
            return Ok(());
        }
        // The child leads its own process group; take its descendants down with it.
        let ret = unsafe { libc::kill(-self.pid, libc::SIGKILL) };
        if ret == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err);
            }
        }
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<ExitReport> {
        let mut interval = Duration::from_millis(1);
        loop {
            if let Some(report) = self.try_reap(libc::WNOHANG)? {
                return Ok(report);
            }
            tokio::time::sleep(interval).await;
            interval = (interval * 2).min(MAX_REAP_POLL_INTERVAL);
        }
    }
}

impl Drop for LocalProcess {
    fn drop(&mut self) {
        if self.report.is_some() {
            return;
        }
        if let Err(e) = self.kill() {
            log::warn!("Failed to kill pid={}: {}", self.pid, e);
        }
        loop {
            match self.try_reap(0) {
                Ok(Some(_)) => break,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("Failed to reap pid={}: {}", self.pid, e);
                    break;
                }
            }
        }
    }
}

fn decode_status(status: libc::c_int) -> ExitStatus {
    if libc::WIFSIGNALED(status) {
        ExitStatus::Signaled(libc::WTERMSIG(status))
    } else {
        ExitStatus::Exited(libc::WEXITSTATUS(status))
    }
}

fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec as u64) + Duration::from_micros(tv.tv_usec as u64)
}

#[cfg(target_os = "macos")]
fn maxrss_to_bytes(maxrss: libc::c_long) -> u64 {
    maxrss as u64
}

#[cfg(not(target_os = "macos"))]
fn maxrss_to_bytes(maxrss: libc::c_long) -> u64 {
    maxrss as u64 * 1024
}

#[cfg(test)]
mod test {
    use tokio::io::AsyncReadExt as _;

    use super::*;

    fn limits() -> ResourceLimits {
        ResourceLimits::new(Duration::from_secs(2), 256 << 20)
            .with_wall_time_factor(3.0)
            .unwrap()
    }

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new("/bin/sh", vec!["-c".into(), script.into()], limits())
    }

    #[tokio::test]
    async fn exit_code_and_usage_are_reported() {
        let mut p = LocalSandbox.launch(sh("exit 3")).await.unwrap();
        let report = p.wait().await.unwrap();
        assert_eq!(report.status, ExitStatus::Exited(3));
        assert!(report.peak_memory > 0);
        assert!(report.wall_time < Duration::from_secs(2));

        // reaped: kill is a no-op and wait returns the same report
        p.kill().unwrap();
        assert_eq!(p.wait().await.unwrap(), report);
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let mut p = LocalSandbox.launch(sh("sleep 10")).await.unwrap();
        p.kill().unwrap();
        p.kill().unwrap();
        let report = p.wait().await.unwrap();
        assert_eq!(report.status, ExitStatus::Signaled(libc::SIGKILL));
        p.kill().unwrap();
    }

    #[tokio::test]
    async fn missing_program_is_not_found() {
        let spec = LaunchSpec::new("/nonexistent/kvalid-validator", vec![], limits());
        let err = LocalSandbox.launch(spec).await.err().unwrap();
        assert!(matches!(err, LaunchError::NotFound { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn symlinks_are_placed_in_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("aux.txt");
        fsutil::write(&target, "aux data").unwrap();

        let spec = sh("cat data/aux.txt").symlinks(maplit::btreemap! {
            "data/aux.txt".to_owned() => target,
        });
        let mut p = LocalSandbox.launch(spec).await.unwrap();
        let mut out = String::new();
        p.take_stdout()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert!(p.wait().await.unwrap().status.success());
        assert_eq!(out, "aux data");
    }

    #[tokio::test]
    async fn escaping_symlink_is_rejected() {
        let spec = sh("true").symlinks(maplit::btreemap! {
            "../outside".to_owned() => "/etc/hostname".into(),
        });
        let err = LocalSandbox.launch(spec).await.err().unwrap();
        assert!(matches!(err, LaunchError::Setup(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn address_space_is_capped_past_memory_limit() {
        let memory = 64 << 20;
        let limits = ResourceLimits::new(Duration::from_secs(5), memory);
        let script = "exec env LC_ALL=C tail /dev/zero";
        let spec = LaunchSpec::new("/bin/sh", vec!["-c".into(), script.into()], limits);

        let mut p = LocalSandbox.launch(spec).await.unwrap();
        let report = p.wait().await.unwrap();
        assert!(!report.status.success(), "{:?}", report);
        assert!(report.peak_memory >= memory, "{:?}", report);
        assert!(report.peak_memory <= memory + ADDRESS_SPACE_GRACE, "{:?}", report);
    }
}
