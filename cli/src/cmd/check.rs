use std::path::PathBuf;

use kvalid_core::action::Session;

use super::{GlobalArgs, SubcmdResult};
use crate::config;

#[derive(Debug, clap::Args)]
pub struct Args {
    pub problem_id: String,

    /// Compiled solution to run on every test case
    pub executable: PathBuf,
}

pub async fn exec(args: &Args, global_args: &GlobalArgs) -> SubcmdResult {
    let cfg = config::load(global_args)?;
    let record = Session::from_config(cfg)
        .check_problem(&args.problem_id, &args.executable)
        .await?;
    Ok(if record.failed() { 1 } else { 0 })
}
