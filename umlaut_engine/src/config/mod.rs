//! Configuration loading and the compiled runtime model.
//!
//! Two JSON shapes are consumed: the settings file
//! (`settings.config.json`) and one sequence file per `enabled_sequences`
//! stem. Malformed individual entries are dropped with a warning and never
//! abort loading; an empty trigger-key list or an empty sequence table after
//! all files are processed is fatal.

use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use evdev::Key;
use log::{info, warn};
use serde::Deserialize;

use crate::keycodes;
use crate::paths;

mod table;

pub use table::{compile_sequences, OutputAction, SequenceKey};

/// Log target for configuration-source messages.
pub const LOG_TARGET_CONFIG: &str = "umlaut_config";

/// Expected `version` field in config files.
const CONFIG_VERSION: i64 = 1;

/// Compose timeout applied when the configured value is missing or invalid.
const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Accepted `timeout_ms` range.
const TIMEOUT_RANGE_MS: std::ops::RangeInclusive<i64> = 100..=10000;

/// Trigger keys used when the settings file does not name any.
const DEFAULT_TRIGGER_KEYS: [&str; 2] = ["KEY_LEFTALT", "KEY_RIGHTALT"];

/// Result from config loading.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort startup (or leave the previous config in place on
/// reload).
#[derive(Debug)]
pub enum Error {
    /// Settings file not found.
    NotFound,

    /// I/O error reading the settings file.
    Io(io::Error),

    /// Settings file is not valid JSON.
    Json(serde_json::Error),

    /// No trigger key left after parsing.
    NoTriggerKeys,

    /// No sequence survived compilation.
    NoSequences,
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => err.source(),
            Error::Json(err) => err.source(),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "Unable to locate settings file"),
            Error::Io(err) => write!(f, "Error reading settings file: {err}"),
            Error::Json(err) => write!(f, "Problem with settings file: {err}"),
            Error::NoTriggerKeys => {
                write!(f, "No trigger key defined; check settings.config.json")
            },
            Error::NoSequences => {
                write!(f, "No sequences loaded; enable at least one sequence config")
            },
        }
    }
}

impl From<io::Error> for Error {
    fn from(val: io::Error) -> Self {
        if val.kind() == io::ErrorKind::NotFound {
            Error::NotFound
        } else {
            Error::Io(val)
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(val: serde_json::Error) -> Self {
        Error::Json(val)
    }
}

/// Compiled runtime configuration.
///
/// Built once at startup and rebuilt atomically on reload; read-only to
/// consumers after that.
#[derive(Debug)]
pub struct Config {
    /// Keys whose press opens a compose sequence.
    pub trigger_keys: Vec<Key>,

    /// Keys that abort a compose and pass through with the trigger held.
    pub passthrough_keys: AHashSet<Key>,

    /// Per-state compose deadline.
    pub timeout: Duration,

    /// Verbosity requested by the settings file.
    pub log_level: log::LevelFilter,

    /// Lookup table from compose tuples to output actions.
    pub sequences: AHashMap<SequenceKey, OutputAction>,

    /// Every compose key that appears in at least one sequence tuple.
    pub valid_compose_keys: AHashSet<Key>,
}

impl Config {
    /// Load and compile the configuration rooted at `config_dir`.
    pub fn load(config_dir: &Path) -> Result<Config> {
        let settings_path = paths::settings_path(config_dir);
        info!("Loading settings: {}", settings_path.display());

        let contents = fs::read_to_string(&settings_path)?;
        let settings: SettingsFile = serde_json::from_str(&contents)?;

        check_version(settings.version, &settings_path);

        let trigger_keys = parse_trigger_keys(&settings);
        let passthrough_keys = parse_passthrough_keys(&settings);
        let timeout = parse_timeout(&settings);
        let log_level = parse_log_level(&settings);

        let mut sequences = AHashMap::new();
        for stem in &settings.enabled_sequences {
            let path = paths::sequence_path(config_dir, stem);
            if !path.exists() {
                warn!(
                    target: LOG_TARGET_CONFIG,
                    "Sequence config '{}' not found in {}",
                    stem,
                    config_dir.display()
                );
                continue;
            }
            table::load_sequence_file(&path, &trigger_keys, &mut sequences);
        }

        if trigger_keys.is_empty() {
            return Err(Error::NoTriggerKeys);
        }
        if sequences.is_empty() {
            return Err(Error::NoSequences);
        }

        let valid_compose_keys = sequences.keys().map(|key| key.compose).collect();

        info!("Total loaded: {} key sequences", sequences.len());

        Ok(Config { trigger_keys, passthrough_keys, timeout, log_level, sequences, valid_compose_keys })
    }
}

/// On-disk settings file. Unknown fields (`icon_set`, …) belong to the
/// configuration UI and are ignored here.
#[derive(Deserialize, Default)]
#[serde(default)]
struct SettingsFile {
    version: Option<i64>,
    trigger_key: Option<TriggerKeys>,
    passthrough_keys: Vec<String>,
    enabled_sequences: Vec<String>,
    settings: Tunables,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TriggerKeys {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Tunables {
    timeout_ms: Option<i64>,
    log_level: Option<String>,
}

fn check_version(version: Option<i64>, path: &Path) {
    match version {
        None => warn!(
            target: LOG_TARGET_CONFIG,
            "Config {} has no version field (expected {})",
            path.display(),
            CONFIG_VERSION
        ),
        Some(version) if version != CONFIG_VERSION => warn!(
            target: LOG_TARGET_CONFIG,
            "Config {} version {} != expected {}",
            path.display(),
            version,
            CONFIG_VERSION
        ),
        _ => (),
    }
}

fn parse_trigger_keys(settings: &SettingsFile) -> Vec<Key> {
    let names: Vec<&str> = match &settings.trigger_key {
        Some(TriggerKeys::One(name)) => vec![name.as_str()],
        Some(TriggerKeys::Many(names)) => names.iter().map(String::as_str).collect(),
        None => DEFAULT_TRIGGER_KEYS.to_vec(),
    };

    let mut keys = Vec::new();
    for name in names {
        match keycodes::key_from_name(name) {
            Some(key) if !keys.contains(&key) => keys.push(key),
            Some(_) => (),
            None => warn!(target: LOG_TARGET_CONFIG, "Unknown trigger key: {name}"),
        }
    }
    if !keys.is_empty() {
        info!("Trigger keys set to: {keys:?}");
    }
    keys
}

fn parse_passthrough_keys(settings: &SettingsFile) -> AHashSet<Key> {
    let mut keys = AHashSet::new();
    for name in &settings.passthrough_keys {
        match table::parse_target_keys(name) {
            Ok(parsed) => {
                keys.insert(parsed[0]);
            },
            Err(err) => {
                warn!(target: LOG_TARGET_CONFIG, "Unknown passthrough key '{name}': {err}")
            },
        }
    }
    if !keys.is_empty() {
        info!("Passthrough keys set to: {:?}", settings.passthrough_keys);
    }
    keys
}

fn parse_timeout(settings: &SettingsFile) -> Duration {
    match settings.settings.timeout_ms {
        Some(value) if TIMEOUT_RANGE_MS.contains(&value) => {
            info!("Compose timeout: {value}ms");
            Duration::from_millis(value as u64)
        },
        Some(value) => {
            warn!(
                target: LOG_TARGET_CONFIG,
                "Invalid timeout_ms {} (must be {}-{}), keeping default {}ms",
                value,
                TIMEOUT_RANGE_MS.start(),
                TIMEOUT_RANGE_MS.end(),
                DEFAULT_TIMEOUT_MS
            );
            Duration::from_millis(DEFAULT_TIMEOUT_MS)
        },
        None => Duration::from_millis(DEFAULT_TIMEOUT_MS),
    }
}

fn parse_log_level(settings: &SettingsFile) -> log::LevelFilter {
    match &settings.settings.log_level {
        Some(level) => match log::LevelFilter::from_str(level) {
            Ok(filter) => filter,
            Err(_) => {
                warn!(target: LOG_TARGET_CONFIG, "Unknown log_level '{level}', keeping INFO");
                log::LevelFilter::Info
            },
        },
        None => log::LevelFilter::Info,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn write_config(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    fn settings_with(sequences: &[&str]) -> String {
        let stems: Vec<String> = sequences.iter().map(|s| format!("\"{s}\"")).collect();
        format!(
            r#"{{
                "version": 1,
                "trigger_key": ["KEY_LEFTALT", "KEY_RIGHTALT"],
                "passthrough_keys": ["KEY_TAB"],
                "enabled_sequences": [{}],
                "settings": {{ "timeout_ms": 500 }}
            }}"#,
            stems.join(", ")
        )
    }

    const GERMAN: &str = r#"{
        "version": 1,
        "name": "German umlauts",
        "sequences": {
            ";": { "a": "ä", "o": "ö", "u": "ü", "s": "ß" }
        }
    }"#;

    #[test]
    fn loads_settings_and_sequences() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "settings.config.json", &settings_with(&["german"]));
        write_config(dir.path(), "german.config.json", GERMAN);

        let config = Config::load(dir.path()).unwrap();

        assert_eq!(config.trigger_keys, vec![Key::KEY_LEFTALT, Key::KEY_RIGHTALT]);
        assert!(config.passthrough_keys.contains(&Key::KEY_TAB));
        assert_eq!(config.timeout, Duration::from_millis(500));
        // One tuple per trigger key per target.
        assert_eq!(config.sequences.len(), 8);
        assert_eq!(config.valid_compose_keys.len(), 1);
        assert!(config.valid_compose_keys.contains(&Key::KEY_SEMICOLON));

        let key = SequenceKey {
            trigger: Key::KEY_LEFTALT,
            compose_shifted: false,
            compose: Key::KEY_SEMICOLON,
            targets: vec![Key::KEY_A],
        };
        assert_eq!(config.sequences.get(&key), Some(&OutputAction::Text("ä".into())));
    }

    #[test]
    fn missing_settings_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(Config::load(dir.path()), Err(Error::NotFound)));
    }

    #[test]
    fn empty_sequence_table_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "settings.config.json", &settings_with(&[]));
        assert!(matches!(Config::load(dir.path()), Err(Error::NoSequences)));
    }

    #[test]
    fn missing_trigger_field_applies_default() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "settings.config.json",
            r#"{ "version": 1, "enabled_sequences": ["german"] }"#,
        );
        write_config(dir.path(), "german.config.json", GERMAN);

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.trigger_keys, vec![Key::KEY_LEFTALT, Key::KEY_RIGHTALT]);
    }

    #[test]
    fn unknown_trigger_names_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "settings.config.json",
            r#"{
                "trigger_key": ["KEY_BOGUS", "KEY_LEFTALT"],
                "enabled_sequences": ["german"]
            }"#,
        );
        write_config(dir.path(), "german.config.json", GERMAN);

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.trigger_keys, vec![Key::KEY_LEFTALT]);
    }

    #[test]
    fn out_of_range_timeout_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "settings.config.json",
            r#"{
                "trigger_key": "KEY_LEFTALT",
                "enabled_sequences": ["german"],
                "settings": { "timeout_ms": 50000 }
            }"#,
        );
        write_config(dir.path(), "german.config.json", GERMAN);

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));
    }

    #[test]
    fn missing_sequence_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "settings.config.json", &settings_with(&["german", "nope"]));
        write_config(dir.path(), "german.config.json", GERMAN);

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.sequences.len(), 8);
    }

    #[test]
    fn reloading_the_same_input_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "settings.config.json", &settings_with(&["german"]));
        write_config(dir.path(), "german.config.json", GERMAN);

        let first = Config::load(dir.path()).unwrap();
        let second = Config::load(dir.path()).unwrap();
        assert_eq!(*first.sequences, *second.sequences);
        assert_eq!(*first.valid_compose_keys, *second.valid_compose_keys);
    }

    #[test]
    fn shifted_compose_keys_are_distinct_tuples() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "settings.config.json",
            r#"{ "trigger_key": "KEY_LEFTALT", "enabled_sequences": ["caps"] }"#,
        );
        write_config(
            dir.path(),
            "caps.config.json",
            r#"{ "sequences": { ";": { "a": "ä" }, "SHIFT+;": { "a": "Ä" } } }"#,
        );

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.sequences.len(), 2);

        let shifted = SequenceKey {
            trigger: Key::KEY_LEFTALT,
            compose_shifted: true,
            compose: Key::KEY_SEMICOLON,
            targets: vec![Key::KEY_A],
        };
        assert_eq!(config.sequences.get(&shifted), Some(&OutputAction::Text("Ä".into())));
    }
}
