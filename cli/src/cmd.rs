pub mod check;
pub mod init;
pub mod problems;
pub mod validate;

use std::path::PathBuf;

#[derive(Debug, clap::Parser)]
#[command(author, version, about, long_about = None)]
pub struct GlobalArgs {
    #[command(subcommand)]
    pub subcmd: Subcommand,

    /// Path to kvalid.toml (default: searched in current dir and its ancestors)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, clap::Subcommand)]
pub enum Subcommand {
    #[command(alias("v"))]
    Validate(validate::Args),

    Problems(problems::Args),
    Check(check::Args),
    Init(init::Args),
}

/// Exit status of the process on success.
pub type SubcmdResult = anyhow::Result<i32>;

impl GlobalArgs {
    pub async fn exec_subcmd(&self) -> SubcmdResult {
        use Subcommand::*;
        match &self.subcmd {
            Validate(args) => validate::exec(args, self).await,
            Problems(args) => problems::exec(args, self),
            Check(args) => check::exec(args, self).await,
            Init(args) => init::exec(args, self),
        }
    }
}
