//! Static registry mapping key names and printable characters to evdev key
//! codes.
//!
//! All tables are fixed at build time. Lookups return `None` for unknown
//! inputs; callers decide whether that is a fatal config error or a skipped
//! entry.

use evdev::Key;

/// Key code for an unshifted printable ASCII character.
pub fn char_to_key(ch: char) -> Option<Key> {
    let key = match ch {
        'a' => Key::KEY_A,
        'b' => Key::KEY_B,
        'c' => Key::KEY_C,
        'd' => Key::KEY_D,
        'e' => Key::KEY_E,
        'f' => Key::KEY_F,
        'g' => Key::KEY_G,
        'h' => Key::KEY_H,
        'i' => Key::KEY_I,
        'j' => Key::KEY_J,
        'k' => Key::KEY_K,
        'l' => Key::KEY_L,
        'm' => Key::KEY_M,
        'n' => Key::KEY_N,
        'o' => Key::KEY_O,
        'p' => Key::KEY_P,
        'q' => Key::KEY_Q,
        'r' => Key::KEY_R,
        's' => Key::KEY_S,
        't' => Key::KEY_T,
        'u' => Key::KEY_U,
        'v' => Key::KEY_V,
        'w' => Key::KEY_W,
        'x' => Key::KEY_X,
        'y' => Key::KEY_Y,
        'z' => Key::KEY_Z,
        '0' => Key::KEY_0,
        '1' => Key::KEY_1,
        '2' => Key::KEY_2,
        '3' => Key::KEY_3,
        '4' => Key::KEY_4,
        '5' => Key::KEY_5,
        '6' => Key::KEY_6,
        '7' => Key::KEY_7,
        '8' => Key::KEY_8,
        '9' => Key::KEY_9,
        ' ' => Key::KEY_SPACE,
        '-' => Key::KEY_MINUS,
        '=' => Key::KEY_EQUAL,
        '[' => Key::KEY_LEFTBRACE,
        ']' => Key::KEY_RIGHTBRACE,
        '\\' => Key::KEY_BACKSLASH,
        ';' => Key::KEY_SEMICOLON,
        '\'' => Key::KEY_APOSTROPHE,
        '`' => Key::KEY_GRAVE,
        ',' => Key::KEY_COMMA,
        '.' => Key::KEY_DOT,
        '/' => Key::KEY_SLASH,
        _ => return None,
    };
    Some(key)
}

/// Base character a shifted ASCII character decomposes to, e.g. `'!'` → `'1'`.
fn shifted_to_base(ch: char) -> Option<char> {
    let base = match ch {
        'A'..='Z' => ch.to_ascii_lowercase(),
        '!' => '1',
        '@' => '2',
        '#' => '3',
        '$' => '4',
        '%' => '5',
        '^' => '6',
        '&' => '7',
        '*' => '8',
        '(' => '9',
        ')' => '0',
        '_' => '-',
        '+' => '=',
        '{' => '[',
        '}' => ']',
        '|' => '\\',
        ':' => ';',
        '"' => '\'',
        '~' => '`',
        '<' => ',',
        '>' => '.',
        '?' => '/',
        _ => return None,
    };
    Some(base)
}

/// Decompose a shifted ASCII character into its base key code and the Shift
/// requirement. Returns `None` for characters that are not shifted variants.
pub fn shifted_char(ch: char) -> Option<(Key, bool)> {
    let base = shifted_to_base(ch)?;
    char_to_key(base).map(|key| (key, true))
}

/// Resolve a canonical key name (`KEY_A`, `KEY_SEMICOLON`, …) to its key
/// code. The `KEY_` prefix is optional and matching is case-insensitive.
pub fn key_from_name(name: &str) -> Option<Key> {
    let upper = name.to_uppercase();
    let full = if upper.starts_with("KEY_") { upper } else { format!("KEY_{upper}") };

    let key = match full.as_str() {
        "KEY_A" => Key::KEY_A,
        "KEY_B" => Key::KEY_B,
        "KEY_C" => Key::KEY_C,
        "KEY_D" => Key::KEY_D,
        "KEY_E" => Key::KEY_E,
        "KEY_F" => Key::KEY_F,
        "KEY_G" => Key::KEY_G,
        "KEY_H" => Key::KEY_H,
        "KEY_I" => Key::KEY_I,
        "KEY_J" => Key::KEY_J,
        "KEY_K" => Key::KEY_K,
        "KEY_L" => Key::KEY_L,
        "KEY_M" => Key::KEY_M,
        "KEY_N" => Key::KEY_N,
        "KEY_O" => Key::KEY_O,
        "KEY_P" => Key::KEY_P,
        "KEY_Q" => Key::KEY_Q,
        "KEY_R" => Key::KEY_R,
        "KEY_S" => Key::KEY_S,
        "KEY_T" => Key::KEY_T,
        "KEY_U" => Key::KEY_U,
        "KEY_V" => Key::KEY_V,
        "KEY_W" => Key::KEY_W,
        "KEY_X" => Key::KEY_X,
        "KEY_Y" => Key::KEY_Y,
        "KEY_Z" => Key::KEY_Z,
        "KEY_0" => Key::KEY_0,
        "KEY_1" => Key::KEY_1,
        "KEY_2" => Key::KEY_2,
        "KEY_3" => Key::KEY_3,
        "KEY_4" => Key::KEY_4,
        "KEY_5" => Key::KEY_5,
        "KEY_6" => Key::KEY_6,
        "KEY_7" => Key::KEY_7,
        "KEY_8" => Key::KEY_8,
        "KEY_9" => Key::KEY_9,
        "KEY_MINUS" => Key::KEY_MINUS,
        "KEY_EQUAL" => Key::KEY_EQUAL,
        "KEY_LEFTBRACE" => Key::KEY_LEFTBRACE,
        "KEY_RIGHTBRACE" => Key::KEY_RIGHTBRACE,
        "KEY_BACKSLASH" => Key::KEY_BACKSLASH,
        "KEY_SEMICOLON" => Key::KEY_SEMICOLON,
        "KEY_APOSTROPHE" => Key::KEY_APOSTROPHE,
        "KEY_GRAVE" => Key::KEY_GRAVE,
        "KEY_COMMA" => Key::KEY_COMMA,
        "KEY_DOT" => Key::KEY_DOT,
        "KEY_SLASH" => Key::KEY_SLASH,
        "KEY_SPACE" => Key::KEY_SPACE,
        "KEY_ENTER" => Key::KEY_ENTER,
        "KEY_TAB" => Key::KEY_TAB,
        "KEY_ESC" | "KEY_ESCAPE" => Key::KEY_ESC,
        "KEY_BACKSPACE" => Key::KEY_BACKSPACE,
        "KEY_DELETE" => Key::KEY_DELETE,
        "KEY_INSERT" => Key::KEY_INSERT,
        "KEY_HOME" => Key::KEY_HOME,
        "KEY_END" => Key::KEY_END,
        "KEY_PAGEUP" => Key::KEY_PAGEUP,
        "KEY_PAGEDOWN" => Key::KEY_PAGEDOWN,
        "KEY_UP" => Key::KEY_UP,
        "KEY_DOWN" => Key::KEY_DOWN,
        "KEY_LEFT" => Key::KEY_LEFT,
        "KEY_RIGHT" => Key::KEY_RIGHT,
        "KEY_CAPSLOCK" => Key::KEY_CAPSLOCK,
        "KEY_NUMLOCK" => Key::KEY_NUMLOCK,
        "KEY_SCROLLLOCK" => Key::KEY_SCROLLLOCK,
        "KEY_PAUSE" => Key::KEY_PAUSE,
        "KEY_COMPOSE" => Key::KEY_COMPOSE,
        "KEY_F1" => Key::KEY_F1,
        "KEY_F2" => Key::KEY_F2,
        "KEY_F3" => Key::KEY_F3,
        "KEY_F4" => Key::KEY_F4,
        "KEY_F5" => Key::KEY_F5,
        "KEY_F6" => Key::KEY_F6,
        "KEY_F7" => Key::KEY_F7,
        "KEY_F8" => Key::KEY_F8,
        "KEY_F9" => Key::KEY_F9,
        "KEY_F10" => Key::KEY_F10,
        "KEY_F11" => Key::KEY_F11,
        "KEY_F12" => Key::KEY_F12,
        "KEY_LEFTSHIFT" => Key::KEY_LEFTSHIFT,
        "KEY_RIGHTSHIFT" => Key::KEY_RIGHTSHIFT,
        "KEY_LEFTCTRL" => Key::KEY_LEFTCTRL,
        "KEY_RIGHTCTRL" => Key::KEY_RIGHTCTRL,
        "KEY_LEFTALT" => Key::KEY_LEFTALT,
        "KEY_RIGHTALT" => Key::KEY_RIGHTALT,
        "KEY_LEFTMETA" => Key::KEY_LEFTMETA,
        "KEY_RIGHTMETA" => Key::KEY_RIGHTMETA,
        _ => return None,
    };
    Some(key)
}

/// Display name for a key code, for log messages.
pub fn key_name(key: Key) -> String {
    format!("{key:?}")
}

pub fn is_shift(key: Key) -> bool {
    key == Key::KEY_LEFTSHIFT || key == Key::KEY_RIGHTSHIFT
}

pub fn is_ctrl(key: Key) -> bool {
    key == Key::KEY_LEFTCTRL || key == Key::KEY_RIGHTCTRL
}

pub fn is_alt(key: Key) -> bool {
    key == Key::KEY_LEFTALT || key == Key::KEY_RIGHTALT
}

pub fn is_meta(key: Key) -> bool {
    key == Key::KEY_LEFTMETA || key == Key::KEY_RIGHTMETA
}

/// True for any of the eight Shift/Ctrl/Alt/Meta keys.
pub fn is_modifier(key: Key) -> bool {
    is_shift(key) || is_ctrl(key) || is_alt(key) || is_meta(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chars_resolve_to_keys() {
        assert_eq!(char_to_key('a'), Some(Key::KEY_A));
        assert_eq!(char_to_key('5'), Some(Key::KEY_5));
        assert_eq!(char_to_key(';'), Some(Key::KEY_SEMICOLON));
        assert_eq!(char_to_key(' '), Some(Key::KEY_SPACE));
        assert_eq!(char_to_key('£'), None);
    }

    #[test]
    fn shifted_chars_decompose() {
        assert_eq!(shifted_char('A'), Some((Key::KEY_A, true)));
        assert_eq!(shifted_char('!'), Some((Key::KEY_1, true)));
        assert_eq!(shifted_char(':'), Some((Key::KEY_SEMICOLON, true)));
        assert_eq!(shifted_char('a'), None);
        assert_eq!(shifted_char('ä'), None);
    }

    #[test]
    fn names_resolve_case_insensitively() {
        assert_eq!(key_from_name("KEY_ENTER"), Some(Key::KEY_ENTER));
        assert_eq!(key_from_name("enter"), Some(Key::KEY_ENTER));
        assert_eq!(key_from_name("key_leftalt"), Some(Key::KEY_LEFTALT));
        assert_eq!(key_from_name("KEY_DOESNOTEXIST"), None);
    }

    #[test]
    fn modifier_classification() {
        assert!(is_modifier(Key::KEY_LEFTSHIFT));
        assert!(is_modifier(Key::KEY_RIGHTMETA));
        assert!(!is_modifier(Key::KEY_A));
        assert!(is_shift(Key::KEY_RIGHTSHIFT));
        assert!(!is_shift(Key::KEY_LEFTCTRL));
    }
}
