use kvalid_core::action::Session;

use super::{GlobalArgs, SubcmdResult};
use crate::{config, util};

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Ids of problems to validate
    #[arg(required = true)]
    pub problem_ids: Vec<String>,
}

pub async fn exec(args: &Args, global_args: &GlobalArgs) -> SubcmdResult {
    let cfg = config::load(global_args)?;
    let session = Session::from_config(cfg);
    let fails = session.validate_many(&args.problem_ids).await?;
    Ok(util::exit_code_for(fails))
}
