use std::path::PathBuf;

use anyhow::Context as _;
use kvalid_core::Config;

use crate::{cmd::GlobalArgs, util};

pub const APP_NAME: &str = "kvalid";

/// `<user config dir>/kvalid/kvalid.toml`
pub fn user_config_filepath() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_NAME).join(Config::FILENAME))
}

/// Lookup order: `--config`, current dir and its ancestors, user config dir.
/// `KVALID_*` environment variables are applied last.
pub fn load(args: &GlobalArgs) -> anyhow::Result<Config> {
    let cfg = match &args.config {
        Some(path) => Config::from_toml_file(path.clone())?,
        None => match Config::find_file_in_ancestors(util::current_dir()) {
            Ok(path) => Config::from_toml_file(path)?,
            Err(e) => {
                let path = user_config_filepath()
                    .filter(|path| path.is_file())
                    .ok_or(e)?;
                Config::from_toml_file(path)?
            }
        },
    };
    if let Some(path) = &cfg.source_config_file {
        log::info!("Using {:?}", util::replace_homedir_to_tilde(path));
    }
    cfg.with_env_overrides()
        .context("Failed to apply environment overrides")
}
