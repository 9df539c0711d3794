//! Filesystem locations shared with the configuration tooling.

use std::env;
use std::path::{Path, PathBuf};

/// Settings file name inside the config directory.
pub const SETTINGS_FILE: &str = "settings.config.json";

/// Marker file whose presence switches the daemon to pure pass-through.
pub const TEST_MODE_FILE: &str = ".test-mode";

/// User configuration directory.
///
/// `$XDG_CONFIG_HOME/umlaut` when resolvable, `$HOME/.config/umlaut`
/// otherwise.
pub fn config_dir() -> PathBuf {
    xdg::BaseDirectories::with_prefix("umlaut")
        .map(|dirs| dirs.get_config_home())
        .ok()
        .or_else(|| {
            env::var("HOME").ok().map(|home| PathBuf::from(home).join(".config/umlaut"))
        })
        .unwrap_or_else(|| PathBuf::from(".config/umlaut"))
}

pub fn settings_path(config_dir: &Path) -> PathBuf {
    config_dir.join(SETTINGS_FILE)
}

/// Path of the sequence file for an `enabled_sequences` stem.
pub fn sequence_path(config_dir: &Path, stem: &str) -> PathBuf {
    config_dir.join(format!("{stem}.config.json"))
}

pub fn test_mode_path(config_dir: &Path) -> PathBuf {
    config_dir.join(TEST_MODE_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_paths_append_config_suffix() {
        let dir = Path::new("/tmp/umlaut");
        assert_eq!(sequence_path(dir, "german"), Path::new("/tmp/umlaut/german.config.json"));
        assert_eq!(settings_path(dir), Path::new("/tmp/umlaut/settings.config.json"));
    }
}
