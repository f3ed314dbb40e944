use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::CorralConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["corral.toml", "corral.yaml", "corral.yml", "corral.json"];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<CorralConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./corral.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/corral/corral.{toml,yaml,yml,json}` (user-global)
///
/// Returns `CorralConfig::default()` if no config file is found or the file
/// fails to parse.
pub fn discover_and_load() -> CorralConfig {
    let Some(path) = find_config_file() else {
        debug!("no config file found, using defaults");
        return CorralConfig::default();
    };
    debug!(path = %path.display(), "loading config");
    match load_config(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            CorralConfig::default()
        },
    }
}

fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns `~/.config/corral/` on all platforms.
pub fn config_dir() -> Option<PathBuf> {
    home_dir().map(|h| h.join(".config").join("corral"))
}

/// Returns the data directory: `~/.corral/` on all platforms.
pub fn data_dir() -> PathBuf {
    home_dir()
        .map(|h| h.join(".corral"))
        .unwrap_or_else(|| PathBuf::from(".corral"))
}

/// Session store location: configured path or `<data_dir>/sessions.json`.
pub fn sessions_path(config: &CorralConfig) -> PathBuf {
    config
        .sessions
        .path
        .clone()
        .unwrap_or_else(|| data_dir().join("sessions.json"))
}

fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<CorralConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corral.toml");
        std::fs::write(&path, "[pool]\nsize = 7\n").unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.pool.size, 7);
    }

    #[test]
    fn loads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corral.yaml");
        std::fs::write(&path, "debounce:\n  window_ms: 250\n").unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.debounce.window_ms, 250);
    }

    #[test]
    fn loads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corral.json");
        std::fs::write(&path, r#"{"sessions":{"history_turns":5}}"#).unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.sessions.history_turns, 5);
    }

    #[test]
    fn substitutes_env_before_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corral.toml");
        std::fs::write(
            &path,
            "[provider]\nbase_url = \"${CORRAL_LOADER_UNSET_XYZ:-http://sandbox.internal}\"\n",
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.provider.base_url, "http://sandbox.internal");
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corral.ini");
        std::fs::write(&path, "size=1").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(&dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn sessions_path_prefers_config() {
        let mut cfg = CorralConfig::default();
        assert!(sessions_path(&cfg).ends_with("sessions.json"));
        cfg.sessions.path = Some(PathBuf::from("/tmp/x.json"));
        assert_eq!(sessions_path(&cfg), PathBuf::from("/tmp/x.json"));
    }
}
