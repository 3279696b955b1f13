use std::{
    collections::{BTreeMap, HashMap},
    io,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use maplit::btreemap;
use serde::Deserialize;
use tempfile::TempDir;
use tokio::process::Command;

use crate::{
    str_interp::{interp, InterpError},
    testing::utf8text,
};

/// How to build and run programs of one language.
///
/// `compile` and `run` are expanded with [`interp`]; see [`ExecutorRegistry::compile`] for the
/// variables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExecutorSpec {
    pub compile: Option<String>,
    pub run: String,
    #[serde(default = "ExecutorSpec::default_exe")]
    pub exe: String,
}

impl ExecutorSpec {
    const SHELL: &str = "/bin/sh";

    fn default_exe() -> String {
        "main".to_owned()
    }

    fn new(compile: Option<&str>, run: &str) -> Self {
        Self {
            compile: compile.map(str::to_owned),
            run: run.to_owned(),
            exe: Self::default_exe(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("Language not supported: {0}")]
    UnsupportedLanguage(String),

    #[error("No source file given")]
    NoSource,

    #[error("Failed to create build dir: {0}")]
    BuildDir(#[source] io::Error),

    #[error(transparent)]
    Fs(#[from] fsutil::Error),

    #[error("Invalid command template: {0}")]
    Template(#[from] InterpError),

    #[error("Cannot quote path {0:?} for the shell")]
    Quote(PathBuf),

    #[error("Invalid run command: '{0}'")]
    InvalidRunCommand(String),

    #[error("Failed to spawn compiler: {0}")]
    Spawn(#[source] io::Error),

    #[error("Compilation took longer than {0:?}")]
    TimedOut(Duration),

    #[error("{message}")]
    Failed { message: String },
}

impl CompileError {
    pub const ABNORMAL_EXIT: &str = "compiler exited abnormally";
}

/// A runnable program. Owns the build dir, which is removed when the last handle is dropped.
#[derive(Debug)]
pub struct Executable {
    program: String,
    base_args: Vec<String>,
    _build_dir: Option<TempDir>,
}

impl Executable {
    /// An executable that already exists on disk, e.g. a binary built elsewhere.
    pub fn precompiled(program: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
            _build_dir: None,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Program and full argument list with `extra_args` appended.
    pub fn command_line(
        &self,
        extra_args: impl IntoIterator<Item = String>,
    ) -> (String, Vec<String>) {
        let mut args = self.base_args.clone();
        args.extend(extra_args);
        (self.program.clone(), args)
    }
}

/// Language name (e.g. `CPP17`) => executor.
#[derive(Debug, Clone)]
pub struct ExecutorRegistry {
    executors: BTreeMap<String, ExecutorSpec>,
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ExecutorRegistry {
    pub fn empty() -> Self {
        Self {
            executors: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let executors = btreemap! {
            "SH".to_owned() => ExecutorSpec::new(None, "/bin/sh #{main}"),
            "PY3".to_owned() => ExecutorSpec::new(None, "python3 #{main}"),
            "C".to_owned() => ExecutorSpec::new(
                Some("gcc -O2 -std=c11 -o #{exe} #{main} -lm"),
                "#{exe}",
            ),
            "CPP17".to_owned() => ExecutorSpec::new(
                Some("g++ -O2 -std=c++17 -o #{exe} #{main}"),
                "#{exe}",
            ),
            "RUST".to_owned() => ExecutorSpec::new(
                Some("rustc -O -o #{exe} #{main}"),
                "#{exe}",
            ),
        };
        Self { executors }
    }

    /// Adds or replaces executors by language name.
    pub fn with_overrides(mut self, overrides: BTreeMap<String, ExecutorSpec>) -> Self {
        self.executors.extend(overrides);
        self
    }

    pub fn get(&self, language: &str) -> Option<&ExecutorSpec> {
        self.executors.get(language)
    }

    pub fn supports(&self, language: &str) -> bool {
        self.executors.contains_key(language)
    }

    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.executors.keys().map(String::as_str)
    }

    /// Copies `sources` and `extra_files` into a fresh build dir and runs the compile command.
    ///
    /// Template variables: `dir` (build dir), `exe` (`<dir>/<exe>`), `main` (first source),
    /// `sources` (all sources). Values are shell-quoted.
    pub async fn compile(
        &self,
        sources: &[PathBuf],
        extra_files: &[PathBuf],
        language: &str,
        time_limit: Duration,
    ) -> Result<Executable, CompileError> {
        let spec = self
            .get(language)
            .ok_or_else(|| CompileError::UnsupportedLanguage(language.to_owned()))?;
        if sources.is_empty() {
            return Err(CompileError::NoSource);
        }

        let build_dir = tempfile::Builder::new()
            .prefix("kvalid-build-")
            .tempdir()
            .map_err(CompileError::BuildDir)?;

        let mut copied = Vec::with_capacity(sources.len());
        for (i, src) in sources.iter().chain(extra_files).enumerate() {
            let name = src.file_name().ok_or(CompileError::NoSource)?;
            let dst = build_dir.path().join(name);
            fsutil::copy_file(src, &dst)?;
            if i < sources.len() {
                copied.push(dst);
            }
        }

        let vars = make_interp_vars(build_dir.path(), &spec.exe, &copied)?;

        if let Some(fmt) = &spec.compile {
            let cmd = interp(fmt, &vars)?;
            log::info!("Compiling {} validator: {}", language, cmd);
            run_compiler(&cmd, build_dir.path(), time_limit).await?;
        }

        let run = interp(&spec.run, &vars)?;
        let mut argv = shlex::split(&run)
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| CompileError::InvalidRunCommand(run.clone()))?;
        let program = argv.remove(0);

        Ok(Executable {
            program,
            base_args: argv,
            _build_dir: Some(build_dir),
        })
    }
}

fn quote(path: &Path) -> Result<String, CompileError> {
    let s = path.to_string_lossy();
    shlex::try_quote(&s)
        .map(|q| q.into_owned())
        .map_err(|_| CompileError::Quote(path.to_owned()))
}

fn make_interp_vars(
    dir: &Path,
    exe_name: &str,
    sources: &[PathBuf],
) -> Result<HashMap<&'static str, String>, CompileError> {
    let mut vars = HashMap::new();
    vars.insert("dir", quote(dir)?);
    vars.insert("exe", quote(&dir.join(exe_name))?);
    vars.insert("main", quote(&sources[0])?);
    let quoted: Vec<_> = sources.iter().map(|p| quote(p)).collect::<Result<_, _>>()?;
    vars.insert("sources", quoted.join(" "));
    Ok(vars)
}

async fn run_compiler(cmd: &str, dir: &Path, time_limit: Duration) -> Result<(), CompileError> {
    let child = Command::new(ExecutorSpec::SHELL)
        .args(["-c", cmd])
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(CompileError::Spawn)?;

    let output = tokio::time::timeout(time_limit, child.wait_with_output())
        .await
        .map_err(|_| CompileError::TimedOut(time_limit))?
        .map_err(CompileError::Spawn)?;

    if output.status.success() {
        return Ok(());
    }
    let mut message = utf8text(&output.stderr);
    if message.is_empty() {
        message = utf8text(&output.stdout);
    }
    if message.is_empty() {
        message = CompileError::ABNORMAL_EXIT.to_owned();
    }
    Err(CompileError::Failed { message })
}
