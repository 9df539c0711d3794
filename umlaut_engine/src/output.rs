//! Output synthesis through the virtual keyboard.
//!
//! ASCII characters are typed with direct key events; anything else goes
//! through the external `xdotool` helper when the session supports it.

use std::env;
use std::io;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use evdev::uinput::VirtualDevice;
use evdev::{EventType, InputEvent, Key};
use log::{debug, error, info, warn};

use crate::config::OutputAction;
use crate::keycodes;

/// Poll interval while waiting for a helper process.
const HELPER_POLL: Duration = Duration::from_millis(10);

/// Deadline for the startup `xdotool version` probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for a single `xdotool` typing invocation.
const TYPE_TIMEOUT: Duration = Duration::from_secs(1);

/// Sink for synthesized events.
///
/// Every `emit` call is followed by a synchronization mark on the device, so
/// consumers see individual key events rather than merged presses.
pub trait EventSink {
    fn emit(&mut self, events: &[InputEvent]) -> io::Result<()>;
}

impl EventSink for VirtualDevice {
    fn emit(&mut self, events: &[InputEvent]) -> io::Result<()> {
        VirtualDevice::emit(self, events)
    }
}

#[cfg(test)]
impl EventSink for Vec<(u16, i32)> {
    fn emit(&mut self, events: &[InputEvent]) -> io::Result<()> {
        for event in events {
            if event.event_type() == EventType::KEY {
                self.push((event.code(), event.value()));
            }
        }
        Ok(())
    }
}

/// Emission primitives on top of an [`EventSink`].
pub struct Synthesizer<S> {
    sink: S,
    unicode: UnicodeTyper,
}

impl<S: EventSink> Synthesizer<S> {
    pub fn new(sink: S, unicode: UnicodeTyper) -> Self {
        Synthesizer { sink, unicode }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Write a single key event.
    pub fn write_key(&mut self, key: Key, value: i32) -> io::Result<()> {
        self.sink.emit(&[InputEvent::new(EventType::KEY, key.code(), value)])
    }

    /// Forward a raw event from a physical device unchanged.
    pub fn forward(&mut self, event: InputEvent) -> io::Result<()> {
        self.sink.emit(&[event])
    }

    /// Emit `(key, value)` wrapped in the given modifiers: each modifier is
    /// pressed first, and released again when `value` is a release.
    pub fn emit_key(&mut self, key: Key, value: i32, modifiers: &[Key]) -> io::Result<()> {
        for &modifier in modifiers {
            self.write_key(modifier, 1)?;
        }
        self.write_key(key, value)?;
        if value == 0 {
            for &modifier in modifiers {
                self.write_key(modifier, 0)?;
            }
        }
        Ok(())
    }

    /// Type a string. ASCII characters use direct key events with Shift
    /// added only where required; other characters use the Unicode helper.
    pub fn emit_string(&mut self, text: &str) -> io::Result<()> {
        for ch in text.chars() {
            let direct = if ch.is_ascii() {
                keycodes::shifted_char(ch).or_else(|| keycodes::char_to_key(ch).map(|key| (key, false)))
            } else {
                None
            };

            match direct {
                Some((key, needs_shift)) => {
                    if needs_shift {
                        self.write_key(Key::KEY_LEFTSHIFT, 1)?;
                    }
                    self.write_key(key, 1)?;
                    self.write_key(key, 0)?;
                    if needs_shift {
                        self.write_key(Key::KEY_LEFTSHIFT, 0)?;
                    }
                },
                None => self.unicode.type_char(ch),
            }
        }
        Ok(())
    }

    /// Emit an output action.
    ///
    /// `target_shifted` propagates the Shift the user held on the target
    /// key: strings are upper-cased, key combos gain a Shift modifier unless
    /// one is already present, and sequences apply it to their first element
    /// only.
    pub fn emit_action(&mut self, action: &OutputAction, target_shifted: bool) -> io::Result<()> {
        debug!("emit_action: {action:?} (shifted={target_shifted})");
        match action {
            OutputAction::Text(text) => {
                if target_shifted {
                    self.emit_string(&text.to_uppercase())
                } else {
                    self.emit_string(text)
                }
            },
            OutputAction::KeyCombo { key, modifiers } => {
                let mut modifiers = modifiers.clone();
                if target_shifted && !modifiers.iter().copied().any(keycodes::is_shift) {
                    modifiers.push(Key::KEY_LEFTSHIFT);
                }
                self.emit_key(*key, 1, &modifiers)?;
                self.emit_key(*key, 0, &modifiers)
            },
            OutputAction::Sequence(actions) => {
                for (i, action) in actions.iter().enumerate() {
                    self.emit_action(action, target_shifted && i == 0)?;
                }
                Ok(())
            },
        }
    }
}

/// Unicode typing through the external `xdotool` helper.
///
/// Availability is probed once at startup; when unavailable, non-ASCII
/// characters are logged and skipped.
pub struct UnicodeTyper {
    available: bool,
    warned: bool,
}

impl UnicodeTyper {
    /// Probe the session for a working helper.
    pub fn probe() -> Self {
        let disabled = UnicodeTyper { available: false, warned: false };

        if env::var("XDG_SESSION_TYPE").map(|v| v == "wayland").unwrap_or(false)
            || env::var_os("WAYLAND_DISPLAY").is_some()
        {
            warn!("Wayland session detected: Unicode output via xdotool disabled");
            return disabled;
        }
        if env::var_os("DISPLAY").is_none() {
            warn!("DISPLAY not set: Unicode output via xdotool disabled");
            return disabled;
        }

        let mut probe = Command::new("xdotool");
        probe.arg("version");
        match run_with_timeout(probe, PROBE_TIMEOUT) {
            Ok(Some(status)) if status.success() => {
                info!("xdotool ready");
                UnicodeTyper { available: true, warned: false }
            },
            Ok(Some(_)) => {
                warn!("xdotool returned non-zero: Unicode output disabled");
                disabled
            },
            Ok(None) => {
                warn!("xdotool timed out during check: Unicode output disabled");
                disabled
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!("xdotool not found: Unicode output disabled");
                disabled
            },
            Err(err) => {
                warn!("xdotool probe failed ({err}): Unicode output disabled");
                disabled
            },
        }
    }

    /// A typer that always skips, for sessions without the helper.
    pub fn disabled() -> Self {
        UnicodeTyper { available: false, warned: false }
    }

    /// Type one character, holding Shift around upper-case characters.
    fn type_char(&mut self, ch: char) {
        if !self.available {
            if !self.warned {
                warn!("xdotool unavailable: cannot type Unicode characters");
                self.warned = true;
            }
            return;
        }

        debug!("xdotool type: {ch:?}");
        let result = if ch.is_uppercase() {
            self.invoke(&["keydown", "shift"])
                .and_then(|_| self.invoke(&["type", "--", &ch.to_string()]))
                .and_then(|_| self.invoke(&["keyup", "shift"]))
        } else {
            self.invoke(&["type", "--", &ch.to_string()])
        };

        if let Err(err) = result {
            if err.kind() == io::ErrorKind::NotFound {
                warn!("xdotool disappeared: disabling Unicode output");
                self.available = false;
            } else {
                error!("xdotool failed for {ch:?}: {err}");
            }
        }
    }

    fn invoke(&self, args: &[&str]) -> io::Result<()> {
        let mut command = Command::new("xdotool");
        command.args(args);
        match run_with_timeout(command, TYPE_TIMEOUT)? {
            Some(status) if status.success() => Ok(()),
            Some(status) => {
                Err(io::Error::new(io::ErrorKind::Other, format!("exit status {status}")))
            },
            None => Err(io::Error::new(io::ErrorKind::TimedOut, "helper timed out")),
        }
    }
}

/// Run a child process with all I/O detached, killing it at the deadline.
/// Returns `None` on timeout.
fn run_with_timeout(mut command: Command, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let mut child: Child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(HELPER_POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> Synthesizer<Vec<(u16, i32)>> {
        Synthesizer::new(Vec::new(), UnicodeTyper::disabled())
    }

    fn key(k: Key, value: i32) -> (u16, i32) {
        (k.code(), value)
    }

    #[test]
    fn emit_key_wraps_modifiers_around_release() {
        let mut out = recorder();
        out.emit_key(Key::KEY_O, 1, &[Key::KEY_LEFTCTRL]).unwrap();
        out.emit_key(Key::KEY_O, 0, &[Key::KEY_LEFTCTRL]).unwrap();
        assert_eq!(
            out.sink(),
            &vec![
                key(Key::KEY_LEFTCTRL, 1),
                key(Key::KEY_O, 1),
                key(Key::KEY_LEFTCTRL, 1),
                key(Key::KEY_O, 0),
                key(Key::KEY_LEFTCTRL, 0),
            ]
        );
    }

    #[test]
    fn emit_string_shifts_only_where_required() {
        let mut out = recorder();
        out.emit_string("Hi").unwrap();
        assert_eq!(
            out.sink(),
            &vec![
                key(Key::KEY_LEFTSHIFT, 1),
                key(Key::KEY_H, 1),
                key(Key::KEY_H, 0),
                key(Key::KEY_LEFTSHIFT, 0),
                key(Key::KEY_I, 1),
                key(Key::KEY_I, 0),
            ]
        );
    }

    #[test]
    fn emit_string_skips_non_ascii_without_helper() {
        let mut out = recorder();
        out.emit_string("aä").unwrap();
        assert_eq!(out.sink(), &vec![key(Key::KEY_A, 1), key(Key::KEY_A, 0)]);
    }

    #[test]
    fn text_action_uppercases_when_shifted() {
        let mut out = recorder();
        out.emit_action(&OutputAction::Text("ab".into()), true).unwrap();
        assert_eq!(
            out.sink(),
            &vec![
                key(Key::KEY_LEFTSHIFT, 1),
                key(Key::KEY_A, 1),
                key(Key::KEY_A, 0),
                key(Key::KEY_LEFTSHIFT, 0),
                key(Key::KEY_LEFTSHIFT, 1),
                key(Key::KEY_B, 1),
                key(Key::KEY_B, 0),
                key(Key::KEY_LEFTSHIFT, 0),
            ]
        );
    }

    #[test]
    fn combo_action_gains_shift_unless_present() {
        let mut out = recorder();
        let combo = OutputAction::KeyCombo { key: Key::KEY_O, modifiers: vec![Key::KEY_LEFTSHIFT] };
        out.emit_action(&combo, true).unwrap();
        // Shift already present, so no second Shift is appended.
        assert_eq!(
            out.sink(),
            &vec![
                key(Key::KEY_LEFTSHIFT, 1),
                key(Key::KEY_O, 1),
                key(Key::KEY_LEFTSHIFT, 1),
                key(Key::KEY_O, 0),
                key(Key::KEY_LEFTSHIFT, 0),
            ]
        );
    }

    #[test]
    fn sequence_action_shifts_first_element_only() {
        let mut out = recorder();
        let action = OutputAction::Sequence(vec![
            OutputAction::Text("a".into()),
            OutputAction::Text("b".into()),
        ]);
        out.emit_action(&action, true).unwrap();
        assert_eq!(
            out.sink(),
            &vec![
                key(Key::KEY_LEFTSHIFT, 1),
                key(Key::KEY_A, 1),
                key(Key::KEY_A, 0),
                key(Key::KEY_LEFTSHIFT, 0),
                key(Key::KEY_B, 1),
                key(Key::KEY_B, 0),
            ]
        );
    }
}
