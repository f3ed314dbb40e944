//! Configuration loading for corral.
//!
//! Config files are TOML, YAML or JSON with `${ENV_VAR}` substitution. Every
//! section is optional and falls back to defaults.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{data_dir, discover_and_load, load_config, sessions_path},
    schema::CorralConfig,
};
