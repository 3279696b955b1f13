pub mod action;
pub mod config;
pub mod contrib;
pub mod executor;
pub mod interactive;
pub mod problem;
pub mod sandbox;
pub mod str_interp;
pub mod style;
pub mod testing;

pub use crate::config::Config;
