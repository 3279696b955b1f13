use std::path::PathBuf;

use anyhow::Context as _;
use kvalid_core::{action, interactive, print_success, Config};

use super::{GlobalArgs, SubcmdResult};
use crate::util;

#[derive(Debug, clap::Args)]
pub struct Args {
    #[arg(default_value = "./")]
    dir: PathBuf,

    /// Overwrite an existing kvalid.toml without asking
    #[arg(short, long)]
    force: bool,
}

pub fn exec(args: &Args, _: &GlobalArgs) -> SubcmdResult {
    let target = args.dir.join(Config::FILENAME);
    let mut overwrite = args.force;
    if !overwrite && target.exists() {
        let prompt = format!(
            "{} already exists. Overwrite?",
            util::replace_homedir_to_tilde(&target).display()
        );
        overwrite = interactive::confirm(&prompt).context("Failed to read answer")?;
        if !overwrite {
            return Ok(0);
        }
    }

    let path = action::write_example_config(&args.dir, overwrite)?;
    print_success!(
        "Successfully wrote example config. (path: {})",
        path.to_string_lossy()
    );
    Ok(0)
}
