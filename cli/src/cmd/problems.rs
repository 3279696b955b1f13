use std::{io, path::Path};

use kvalid_core::problem::ProblemStore;
use serde::Serialize;

use super::{GlobalArgs, SubcmdResult};
use crate::config;

#[derive(Debug, clap::Args)]
pub struct Args {
    #[arg(short, long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct ProblemEntry<'a> {
    id: &'a str,
    dir: &'a Path,
}

pub fn exec(args: &Args, global_args: &GlobalArgs) -> SubcmdResult {
    let cfg = config::load(global_args)?;
    let store = ProblemStore::discover(&cfg.problem_storage_globs, &cfg.base_dir());

    if args.json {
        let entries: Vec<_> = store
            .ids()
            .filter_map(|id| store.get(id).map(|dir| ProblemEntry { id, dir }))
            .collect();
        serde_json::to_writer_pretty(io::stdout(), &entries)?;
        println!();
        return Ok(0);
    }

    for id in store.ids() {
        println!("{}", id);
    }
    Ok(0)
}
