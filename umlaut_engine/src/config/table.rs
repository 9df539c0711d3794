//! Sequence-table compilation.
//!
//! Parses the target-key notation and output definitions of a sequence file
//! and expands them into one lookup tuple per configured trigger key.

use std::fmt::{self, Display, Formatter};
use std::fs;
use std::path::Path;

use ahash::AHashMap;
use evdev::Key;
use log::{info, warn};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{check_version, LOG_TARGET_CONFIG};
use crate::keycodes;

/// Upper bound on compose entries in a single sequence file.
const MAX_SEQUENCES: usize = 10_000;

/// Upper bound on a single output string, in characters.
const MAX_OUTPUT_LENGTH: usize = 10_000;

/// Upper bound on the elements of a sequence output.
const MAX_SEQUENCE_LENGTH: usize = 10;

/// Modifier tokens recognized in combo notation.
const MODIFIER_TOKENS: [&str; 6] = ["CTRL", "ALT", "SHIFT", "META", "ALTGR", "SUPER"];

/// Lookup tuple for a compiled sequence.
///
/// `targets` is the ordered target-key list, modifiers first.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SequenceKey {
    pub trigger: Key,
    pub compose_shifted: bool,
    pub compose: Key,
    pub targets: Vec<Key>,
}

/// What to synthesize when a sequence matches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputAction {
    /// A text string to type.
    Text(String),

    /// A key press with simultaneously held modifiers.
    KeyCombo { key: Key, modifiers: Vec<Key> },

    /// An ordered list of actions. Shift propagation applies to the first
    /// element only.
    Sequence(Vec<OutputAction>),
}

/// Entry-level parse failure. These are logged and skip the entry, never
/// the file.
#[derive(Debug, PartialEq, Eq)]
pub enum EntryError {
    UnknownChar(char),
    UnknownKeyName(String),
    OutputTooLong(usize),
    SequenceTooLong(usize),
    InvalidOutput,
}

impl Display for EntryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EntryError::UnknownChar(ch) => write!(f, "unknown character: {ch}"),
            EntryError::UnknownKeyName(name) => write!(f, "unknown key name: {name}"),
            EntryError::OutputTooLong(len) => {
                write!(f, "output string too long ({len} chars), max is {MAX_OUTPUT_LENGTH}")
            },
            EntryError::SequenceTooLong(len) => {
                write!(f, "sequence too long ({len} items), max is {MAX_SEQUENCE_LENGTH}")
            },
            EntryError::InvalidOutput => write!(f, "invalid output definition"),
        }
    }
}

/// Envelope of a sequence file. `name` and `description` belong to the
/// configuration UI.
#[derive(Deserialize, Default)]
#[serde(default)]
struct SequenceFile {
    version: Option<i64>,
    sequences: Map<String, Value>,
}

/// Load one sequence file and merge its compiled tuples into `table`.
///
/// Structural failures drop the whole file; malformed entries drop only
/// themselves.
pub fn load_sequence_file(
    path: &Path,
    trigger_keys: &[Key],
    table: &mut AHashMap<SequenceKey, OutputAction>,
) {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            warn!(
                target: LOG_TARGET_CONFIG,
                "Skipping unreadable sequence config {}: {}",
                path.display(),
                err
            );
            return;
        },
    };

    let file: SequenceFile = match serde_json::from_str(&contents) {
        Ok(file) => file,
        Err(err) => {
            warn!(
                target: LOG_TARGET_CONFIG,
                "Skipping invalid sequence config {}: {}",
                path.display(),
                err
            );
            return;
        },
    };

    check_version(file.version, path);

    if file.sequences.len() > MAX_SEQUENCES {
        warn!(
            target: LOG_TARGET_CONFIG,
            "Too many sequences in {} ({}), max is {}",
            path.display(),
            file.sequences.len(),
            MAX_SEQUENCES
        );
        return;
    }

    let added = compile_sequences(&file.sequences, trigger_keys, table);
    info!("Loaded {} sequences from {}", added, path.display());
}

/// Compile a `sequences` object into lookup tuples. Returns the number of
/// tuples inserted.
pub fn compile_sequences(
    sequences: &Map<String, Value>,
    trigger_keys: &[Key],
    table: &mut AHashMap<SequenceKey, OutputAction>,
) -> usize {
    let mut added = 0;

    for (compose_name, targets) in sequences {
        let targets = match resolve_alias(compose_name, targets, sequences) {
            Some(targets) => targets,
            None => continue,
        };

        // Optional SHIFT+ prefix on the compose key name.
        let shift_prefix =
            compose_name.get(..6).is_some_and(|prefix| prefix.eq_ignore_ascii_case("SHIFT+"));
        let (compose_shifted, compose_name) = if shift_prefix {
            (true, &compose_name[6..])
        } else {
            (false, compose_name.as_str())
        };

        let compose = match parse_target_keys(compose_name) {
            Ok(keys) => keys[0],
            Err(err) => {
                warn!(
                    target: LOG_TARGET_CONFIG,
                    "Skipping entire compose key '{compose_name}': {err}"
                );
                continue;
            },
        };

        if trigger_keys.contains(&compose) {
            warn!(
                target: LOG_TARGET_CONFIG,
                "Skipping compose key '{compose_name}': collides with a trigger key"
            );
            continue;
        }

        for (target_name, output_def) in targets {
            let (target_keys, output) =
                match (parse_target_keys(target_name), parse_output(output_def)) {
                    (Ok(keys), Ok(output)) => (keys, output),
                    (Err(err), _) | (_, Err(err)) => {
                        warn!(
                            target: LOG_TARGET_CONFIG,
                            "Skipping sequence {compose_name}+{target_name}: {err}"
                        );
                        continue;
                    },
                };

            for &trigger in trigger_keys {
                let key = SequenceKey {
                    trigger,
                    compose_shifted,
                    compose,
                    targets: target_keys.clone(),
                };
                table.insert(key, output.clone());
                added += 1;
            }
        }
    }

    added
}

/// Resolve a compose entry to its targets object, following at most one
/// alias level.
fn resolve_alias<'a>(
    compose_name: &str,
    targets: &'a Value,
    sequences: &'a Map<String, Value>,
) -> Option<&'a Map<String, Value>> {
    match targets {
        Value::Object(targets) => Some(targets),
        Value::String(alias) => match sequences.get(alias) {
            Some(Value::Object(targets)) => Some(targets),
            Some(Value::String(_)) => {
                warn!(
                    target: LOG_TARGET_CONFIG,
                    "Alias '{compose_name}' points to another alias '{alias}': chained aliases \
                     not supported"
                );
                None
            },
            _ => {
                warn!(
                    target: LOG_TARGET_CONFIG,
                    "Alias '{compose_name}' references unknown compose key '{alias}'"
                );
                None
            },
        },
        _ => {
            warn!(
                target: LOG_TARGET_CONFIG,
                "Compose key '{compose_name}' must map to an object or an alias"
            );
            None
        },
    }
}

/// Parse target key notation (`a`, `A`, `$`, `KEY_ENTER`, `CTRL+o`) into an
/// ordered key-code list.
pub fn parse_target_keys(notation: &str) -> Result<Vec<Key>, EntryError> {
    let upper = notation.to_uppercase();

    // Modifier+key combos; order of the resulting codes is as written.
    if notation.contains('+') && MODIFIER_TOKENS.iter().any(|token| upper.contains(token)) {
        return notation.split('+').map(|part| char_or_key_to_code(part.trim())).collect();
    }

    let mut chars = notation.chars();
    match (chars.next(), chars.next()) {
        (Some(ch), None) => {
            if let Some((base, _)) = keycodes::shifted_char(ch) {
                Ok(vec![Key::KEY_LEFTSHIFT, base])
            } else if let Some(key) = keycodes::char_to_key(ch) {
                Ok(vec![key])
            } else {
                Err(EntryError::UnknownChar(ch))
            }
        },
        _ => keycodes::key_from_name(notation)
            .map(|key| vec![key])
            .ok_or_else(|| EntryError::UnknownKeyName(notation.to_string())),
    }
}

/// Parse one part of a combo: a modifier shorthand, a single character, or a
/// `KEY_` name.
fn char_or_key_to_code(text: &str) -> Result<Key, EntryError> {
    match text.to_uppercase().as_str() {
        "CTRL" => return Ok(Key::KEY_LEFTCTRL),
        "ALT" => return Ok(Key::KEY_LEFTALT),
        "ALTGR" => return Ok(Key::KEY_RIGHTALT),
        "SHIFT" => return Ok(Key::KEY_LEFTSHIFT),
        "META" | "SUPER" => return Ok(Key::KEY_LEFTMETA),
        _ => (),
    }

    let mut chars = text.chars();
    if let (Some(ch), None) = (chars.next(), chars.next()) {
        if let Some(key) = keycodes::char_to_key(ch) {
            return Ok(key);
        }
    }

    keycodes::key_from_name(text).ok_or_else(|| EntryError::UnknownKeyName(text.to_string()))
}

/// Parse an output definition: a string, a list of actions, or an object
/// with a `key` or `string` field.
pub fn parse_output(output: &Value) -> Result<OutputAction, EntryError> {
    match output {
        Value::String(text) => parse_text(text),
        Value::Array(items) => {
            if items.len() > MAX_SEQUENCE_LENGTH {
                return Err(EntryError::SequenceTooLong(items.len()));
            }
            let mut actions = Vec::new();
            for item in items {
                match item {
                    Value::String(text) if text.starts_with("KEY_") => {
                        let key = value_to_key(item)?;
                        actions.push(OutputAction::KeyCombo { key, modifiers: Vec::new() });
                    },
                    Value::String(text) => actions.push(parse_text(text)?),
                    Value::Object(_) => actions.push(parse_output(item)?),
                    _ => (),
                }
            }
            Ok(OutputAction::Sequence(actions))
        },
        Value::Object(fields) => {
            if let Some(key) = fields.get("key") {
                let key = value_to_key(key)?;
                let modifiers = match fields.get("modifiers") {
                    Some(Value::Array(items)) => {
                        items.iter().map(value_to_key).collect::<Result<Vec<_>, _>>()?
                    },
                    _ => Vec::new(),
                };
                Ok(OutputAction::KeyCombo { key, modifiers })
            } else if let Some(Value::String(text)) = fields.get("string") {
                parse_text(text)
            } else {
                Err(EntryError::InvalidOutput)
            }
        },
        _ => Err(EntryError::InvalidOutput),
    }
}

fn parse_text(text: &str) -> Result<OutputAction, EntryError> {
    let len = text.chars().count();
    if len > MAX_OUTPUT_LENGTH {
        return Err(EntryError::OutputTooLong(len));
    }
    Ok(OutputAction::Text(text.to_string()))
}

/// A key reference in an output definition: a name string or a raw code.
fn value_to_key(value: &Value) -> Result<Key, EntryError> {
    match value {
        Value::String(name) => keycodes::key_from_name(name)
            .ok_or_else(|| EntryError::UnknownKeyName(name.clone())),
        Value::Number(code) => match code.as_u64() {
            Some(code) if code <= u16::MAX as u64 => Ok(Key::new(code as u16)),
            _ => Err(EntryError::InvalidOutput),
        },
        _ => Err(EntryError::InvalidOutput),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn compile(sequences: Value, triggers: &[Key]) -> AHashMap<SequenceKey, OutputAction> {
        let mut table = AHashMap::new();
        let map = match sequences {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        compile_sequences(&map, triggers, &mut table);
        table
    }

    #[test]
    fn lowercase_letter() {
        assert_eq!(parse_target_keys("a"), Ok(vec![Key::KEY_A]));
    }

    #[test]
    fn uppercase_adds_shift() {
        assert_eq!(parse_target_keys("A"), Ok(vec![Key::KEY_LEFTSHIFT, Key::KEY_A]));
    }

    #[test]
    fn shifted_symbol_adds_shift() {
        assert_eq!(parse_target_keys("!"), Ok(vec![Key::KEY_LEFTSHIFT, Key::KEY_1]));
    }

    #[test]
    fn key_name_with_and_without_prefix() {
        assert_eq!(parse_target_keys("KEY_ENTER"), Ok(vec![Key::KEY_ENTER]));
        assert_eq!(parse_target_keys("enter"), Ok(vec![Key::KEY_ENTER]));
    }

    #[test]
    fn combo_order_is_as_written() {
        assert_eq!(parse_target_keys("CTRL+o"), Ok(vec![Key::KEY_LEFTCTRL, Key::KEY_O]));
        assert_eq!(
            parse_target_keys("SHIFT+CTRL+a"),
            Ok(vec![Key::KEY_LEFTSHIFT, Key::KEY_LEFTCTRL, Key::KEY_A])
        );
        assert_eq!(parse_target_keys("ALTGR+e"), Ok(vec![Key::KEY_RIGHTALT, Key::KEY_E]));
    }

    #[test]
    fn unknown_notation_is_rejected() {
        assert_eq!(parse_target_keys("£"), Err(EntryError::UnknownChar('£')));
        assert!(matches!(
            parse_target_keys("KEY_DOESNOTEXIST"),
            Err(EntryError::UnknownKeyName(_))
        ));
    }

    #[test]
    fn string_output() {
        assert_eq!(parse_output(&json!("ä")), Ok(OutputAction::Text("ä".into())));
    }

    #[test]
    fn output_length_boundary() {
        let max = "x".repeat(MAX_OUTPUT_LENGTH);
        assert_eq!(parse_output(&json!(max.clone())), Ok(OutputAction::Text(max)));

        let over = "x".repeat(MAX_OUTPUT_LENGTH + 1);
        assert_eq!(
            parse_output(&json!(over)),
            Err(EntryError::OutputTooLong(MAX_OUTPUT_LENGTH + 1))
        );
    }

    #[test]
    fn sequence_length_boundary() {
        let ok: Vec<&str> = vec!["x"; MAX_SEQUENCE_LENGTH];
        assert!(parse_output(&json!(ok)).is_ok());

        let over: Vec<&str> = vec!["x"; MAX_SEQUENCE_LENGTH + 1];
        assert_eq!(
            parse_output(&json!(over)),
            Err(EntryError::SequenceTooLong(MAX_SEQUENCE_LENGTH + 1))
        );
    }

    #[test]
    fn list_output_mixes_keys_and_text() {
        let output = parse_output(&json!(["KEY_ENTER", "hello"])).unwrap();
        assert_eq!(
            output,
            OutputAction::Sequence(vec![
                OutputAction::KeyCombo { key: Key::KEY_ENTER, modifiers: Vec::new() },
                OutputAction::Text("hello".into()),
            ])
        );
    }

    #[test]
    fn object_output_with_modifiers() {
        let output = parse_output(&json!({ "key": "KEY_O", "modifiers": ["KEY_LEFTCTRL"] }));
        assert_eq!(
            output,
            Ok(OutputAction::KeyCombo { key: Key::KEY_O, modifiers: vec![Key::KEY_LEFTCTRL] })
        );
    }

    #[test]
    fn invalid_outputs_are_rejected() {
        assert_eq!(parse_output(&json!(42)), Err(EntryError::InvalidOutput));
        assert_eq!(parse_output(&json!({ "bogus": true })), Err(EntryError::InvalidOutput));
        assert!(matches!(
            parse_output(&json!({ "key": "KEY_BOGUS" })),
            Err(EntryError::UnknownKeyName(_))
        ));
    }

    #[test]
    fn expansion_produces_one_tuple_per_trigger() {
        let table = compile(
            json!({ ";": { "a": "ä" } }),
            &[Key::KEY_LEFTALT, Key::KEY_RIGHTALT],
        );
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn alias_reuses_targets() {
        let table = compile(
            json!({ ";": { "a": "ä" }, "'": ";" }),
            &[Key::KEY_LEFTALT],
        );
        assert_eq!(table.len(), 2);
        let via_alias = SequenceKey {
            trigger: Key::KEY_LEFTALT,
            compose_shifted: false,
            compose: Key::KEY_APOSTROPHE,
            targets: vec![Key::KEY_A],
        };
        assert_eq!(table.get(&via_alias), Some(&OutputAction::Text("ä".into())));
    }

    #[test]
    fn broken_and_chained_aliases_are_dropped() {
        let table = compile(
            json!({ ";": { "a": "ä" }, "'": "nope", ",": "." , ".": ";" }),
            &[Key::KEY_LEFTALT],
        );
        // ";" itself, plus "." aliasing ";". "," chains onto the "." alias
        // and is rejected; "'" references an unknown key.
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn unknown_compose_key_drops_only_its_group() {
        let table = compile(
            json!({ "£": { "a": "x" }, ";": { "a": "ä" } }),
            &[Key::KEY_LEFTALT],
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn compose_key_colliding_with_trigger_is_dropped() {
        let table = compile(
            json!({ "KEY_LEFTALT": { "a": "x" }, ";": { "a": "ä" } }),
            &[Key::KEY_LEFTALT],
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn malformed_target_drops_only_that_entry() {
        let table = compile(
            json!({ ";": { "a": "ä", "£": "x" } }),
            &[Key::KEY_LEFTALT],
        );
        assert_eq!(table.len(), 1);
    }
}
