//! The compose state machine.
//!
//! Consumes raw key events from the grabbed devices and decides, per event,
//! between pass-through, suppression, and output synthesis. A sequence runs
//! `IDLE` → `TRIGGER_PRESSED` → `COMPOSE_PRESSED` → `WAITING_TARGET`; any
//! abort replays the suppressed keys so downstream still sees what the user
//! physically typed.

use std::io;
use std::time::{Duration, Instant};

use ahash::AHashSet;
use evdev::Key;
use log::debug;

use crate::config::{Config, SequenceKey};
use crate::keycodes;
use crate::output::{EventSink, Synthesizer};

pub const RELEASE: i32 = 0;
pub const PRESS: i32 = 1;
pub const REPEAT: i32 = 2;

/// Wake-up interval while no deadline is pending.
const IDLE_WAKE: Duration = Duration::from_secs(1);

/// Lower bound on the poll timeout.
const MIN_POLL: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    TriggerPressed,
    ComposePressed,
    WaitingTarget,
}

pub struct ComposeMachine {
    state: State,

    /// Every currently held physical key; updated before state logic runs.
    pressed_keys: AHashSet<Key>,

    current_trigger: Option<Key>,
    current_compose: Option<Key>,
    compose_shifted: bool,
    trigger_start: Option<Instant>,
    compose_start: Option<Instant>,

    /// Pure pass-through for all events while the test-mode marker exists.
    test_mode: bool,
}

impl Default for ComposeMachine {
    fn default() -> Self {
        ComposeMachine {
            state: State::Idle,
            pressed_keys: AHashSet::new(),
            current_trigger: None,
            current_compose: None,
            compose_shifted: false,
            trigger_start: None,
            compose_start: None,
            test_mode: false,
        }
    }
}

impl ComposeMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    pub fn test_mode(&self) -> bool {
        self.test_mode
    }

    pub fn set_test_mode(&mut self, enabled: bool) {
        self.test_mode = enabled;
    }

    /// Drop all transient sequence state and return to `IDLE`.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.current_trigger = None;
        self.current_compose = None;
        self.compose_shifted = false;
        self.trigger_start = None;
        self.compose_start = None;
    }

    /// Process one key event from a grabbed device.
    pub fn process<S: EventSink>(
        &mut self,
        config: &Config,
        key: Key,
        value: i32,
        now: Instant,
        out: &mut Synthesizer<S>,
    ) -> io::Result<()> {
        if self.test_mode {
            return out.write_key(key, value);
        }

        match value {
            PRESS => {
                self.pressed_keys.insert(key);
            },
            RELEASE => {
                self.pressed_keys.remove(&key);
            },
            _ => (),
        }

        // Repeats only make sense for pass-through.
        if value == REPEAT && self.state != State::Idle {
            return Ok(());
        }

        // ESC is the in-band cancel: release everything we might be
        // concealing and swallow the press.
        if key == Key::KEY_ESC && value == PRESS && self.state != State::Idle {
            debug!("ESC pressed: force cancelling compose");
            return self.force_release(out);
        }

        let handled = match self.state {
            State::Idle => self.on_idle(config, key, value, now, out)?,
            State::TriggerPressed => self.on_trigger_pressed(config, key, value, out)?,
            State::ComposePressed => self.on_compose_pressed(key, value, now, out)?,
            State::WaitingTarget => self.on_waiting_target(config, key, value, out)?,
        };

        if handled {
            return Ok(());
        }
        out.write_key(key, value)
    }

    fn on_idle<S: EventSink>(
        &mut self,
        config: &Config,
        key: Key,
        value: i32,
        now: Instant,
        out: &mut Synthesizer<S>,
    ) -> io::Result<bool> {
        if value != PRESS || !config.trigger_keys.contains(&key) {
            return Ok(false);
        }

        // Ctrl or Meta already held means a regular shortcut, not a compose
        // opening. Shift is fine: it may be part of SHIFT+compose.
        let shortcut_modifiers =
            [Key::KEY_LEFTCTRL, Key::KEY_RIGHTCTRL, Key::KEY_LEFTMETA, Key::KEY_RIGHTMETA];
        if shortcut_modifiers.iter().any(|&m| m != key && self.pressed_keys.contains(&m)) {
            debug!("Trigger {} with other modifiers held: passing through", keycodes::key_name(key));
            out.write_key(key, value)?;
            return Ok(true);
        }

        self.current_trigger = Some(key);
        self.trigger_start = Some(now);
        self.state = State::TriggerPressed;
        debug!("Trigger pressed: {}", keycodes::key_name(key));
        Ok(true)
    }

    fn on_trigger_pressed<S: EventSink>(
        &mut self,
        config: &Config,
        key: Key,
        value: i32,
        out: &mut Synthesizer<S>,
    ) -> io::Result<bool> {
        let trigger = match self.current_trigger {
            Some(trigger) => trigger,
            None => return Ok(false),
        };

        // Trigger released before a compose key: downstream sees a normal tap.
        if value == RELEASE && key == trigger {
            debug!("Trigger released early: passing through");
            out.write_key(trigger, PRESS)?;
            out.write_key(trigger, RELEASE)?;
            self.reset();
            return Ok(true);
        }

        // A second, non-trigger modifier. Shift may still lead into a
        // SHIFT+compose sequence; Ctrl and Meta mean a regular shortcut.
        if value == PRESS
            && (keycodes::is_shift(key) || keycodes::is_ctrl(key) || keycodes::is_meta(key))
            && !config.trigger_keys.contains(&key)
        {
            if keycodes::is_shift(key) {
                debug!("Shift pressed during trigger: waiting for compose key");
                return Ok(true);
            }
            debug!("Additional modifier {} pressed: passing through", keycodes::key_name(key));
            out.write_key(trigger, PRESS)?;
            out.write_key(key, value)?;
            self.reset();
            return Ok(true);
        }

        // Passthrough keys abort the compose so e.g. Alt-Tab keeps working.
        if value == PRESS && config.passthrough_keys.contains(&key) {
            debug!("Passthrough key {}: aborting compose", keycodes::key_name(key));
            out.write_key(trigger, PRESS)?;
            out.write_key(key, value)?;
            self.reset();
            return Ok(true);
        }

        if value == PRESS && key != trigger {
            if !config.valid_compose_keys.contains(&key) {
                // No sequences on this key: preserve the shortcut.
                debug!("Key {} has no sequences: passing through", keycodes::key_name(key));
                out.write_key(trigger, PRESS)?;
                out.write_key(key, value)?;
                self.reset();
                return Ok(true);
            }

            self.current_compose = Some(key);
            self.compose_shifted = self.shift_held();
            self.state = State::ComposePressed;
            debug!(
                "Compose key pressed: {} (shifted={})",
                keycodes::key_name(key),
                self.compose_shifted
            );
            return Ok(true);
        }

        Ok(false)
    }

    fn on_compose_pressed<S: EventSink>(
        &mut self,
        key: Key,
        value: i32,
        now: Instant,
        out: &mut Synthesizer<S>,
    ) -> io::Result<bool> {
        // Trigger and compose releases drive the transition; once both are
        // up we wait for the target.
        if value == RELEASE
            && (Some(key) == self.current_trigger || Some(key) == self.current_compose)
        {
            let trigger_up =
                self.current_trigger.map_or(true, |k| !self.pressed_keys.contains(&k));
            let compose_up =
                self.current_compose.map_or(true, |k| !self.pressed_keys.contains(&k));
            if trigger_up && compose_up {
                self.state = State::WaitingTarget;
                self.compose_start = Some(now);
                debug!("Waiting for target key");
            }
            return Ok(true);
        }

        // Other modifier traffic is ignored, but Shift releases are
        // forwarded so downstream does not see Shift as still held.
        if keycodes::is_modifier(key) {
            if value == RELEASE && keycodes::is_shift(key) {
                out.write_key(key, RELEASE)?;
            }
            return Ok(true);
        }

        Ok(false)
    }

    fn on_waiting_target<S: EventSink>(
        &mut self,
        config: &Config,
        key: Key,
        value: i32,
        out: &mut Synthesizer<S>,
    ) -> io::Result<bool> {
        // The user may hold Shift for the target; only the non-modifier
        // press selects it. Shift releases are forwarded as above.
        if keycodes::is_modifier(key) {
            if value == RELEASE && keycodes::is_shift(key) {
                out.write_key(key, RELEASE)?;
            }
            return Ok(true);
        }

        if value != PRESS {
            return Ok(false);
        }

        let (trigger, compose) = match (self.current_trigger, self.current_compose) {
            (Some(trigger), Some(compose)) => (trigger, compose),
            _ => return Ok(false),
        };

        // Target keys in canonical order: Shift, Ctrl, Alt, then the key.
        let mut targets = Vec::with_capacity(4);
        let target_shifted = self.shift_held();
        if target_shifted {
            targets.push(Key::KEY_LEFTSHIFT);
        }
        if self.pressed_keys.contains(&Key::KEY_LEFTCTRL)
            || self.pressed_keys.contains(&Key::KEY_RIGHTCTRL)
        {
            targets.push(Key::KEY_LEFTCTRL);
        }
        let alt_held = self.pressed_keys.contains(&Key::KEY_LEFTALT)
            || self.pressed_keys.contains(&Key::KEY_RIGHTALT);
        if alt_held && !config.trigger_keys.contains(&key) {
            targets.push(Key::KEY_LEFTALT);
        }
        targets.push(key);

        let lookup = SequenceKey {
            trigger,
            compose_shifted: self.compose_shifted,
            compose,
            targets,
        };
        debug!("Looking up: {lookup:?}");

        let mut action = config.sequences.get(&lookup);
        if action.is_none() && target_shifted {
            // A rule configured without Shift also matches the shifted
            // target; the Shift propagates into the output instead.
            let unshifted = SequenceKey {
                targets: lookup
                    .targets
                    .iter()
                    .copied()
                    .filter(|&k| !keycodes::is_shift(k))
                    .collect(),
                ..lookup
            };
            debug!("Also trying unshifted lookup: {unshifted:?}");
            action = config.sequences.get(&unshifted);
        }

        match action {
            Some(action) => {
                debug!("Sequence matched");
                out.emit_action(action, target_shifted)?;
                self.reset();
            },
            None => {
                debug!("No match: replaying suppressed keys");
                self.replay_prefix(out)?;
                out.write_key(key, value)?;
                self.reset();
            },
        }
        Ok(true)
    }

    /// Replay the suppressed trigger tap and compose tap (with its Shift
    /// wrap) to the virtual device.
    fn replay_prefix<S: EventSink>(&self, out: &mut Synthesizer<S>) -> io::Result<()> {
        if let Some(trigger) = self.current_trigger {
            out.write_key(trigger, PRESS)?;
            out.write_key(trigger, RELEASE)?;
        }
        if let Some(compose) = self.current_compose {
            if self.compose_shifted {
                out.write_key(Key::KEY_LEFTSHIFT, PRESS)?;
            }
            out.write_key(compose, PRESS)?;
            out.write_key(compose, RELEASE)?;
            if self.compose_shifted {
                out.write_key(Key::KEY_LEFTSHIFT, RELEASE)?;
            }
        }
        Ok(())
    }

    /// Emit releases for every key the machine might be concealing and
    /// return to `IDLE`.
    pub fn force_release<S: EventSink>(&mut self, out: &mut Synthesizer<S>) -> io::Result<()> {
        debug!("Force releasing compose keys");
        if let Some(trigger) = self.current_trigger {
            out.write_key(trigger, RELEASE)?;
        }
        if let Some(compose) = self.current_compose {
            out.write_key(compose, RELEASE)?;
        }
        out.write_key(Key::KEY_LEFTSHIFT, RELEASE)?;
        out.write_key(Key::KEY_RIGHTSHIFT, RELEASE)?;
        self.reset();
        Ok(())
    }

    /// Fire any expired deadline for the current state.
    pub fn check_timeout<S: EventSink>(
        &mut self,
        config: &Config,
        now: Instant,
        out: &mut Synthesizer<S>,
    ) -> io::Result<()> {
        match self.state {
            State::TriggerPressed => {
                if let (Some(start), Some(trigger)) = (self.trigger_start, self.current_trigger) {
                    if now.duration_since(start) >= config.timeout {
                        debug!("Trigger timeout: passing through");
                        out.write_key(trigger, PRESS)?;
                        out.write_key(trigger, RELEASE)?;
                        self.reset();
                    }
                }
            },
            State::WaitingTarget => {
                if let Some(start) = self.compose_start {
                    if now.duration_since(start) >= config.timeout {
                        debug!("Compose timeout: replaying suppressed keys");
                        self.replay_prefix(out)?;
                        self.reset();
                    }
                }
            },
            _ => (),
        }
        Ok(())
    }

    /// How long the event loop may sleep before the next deadline.
    pub fn poll_timeout(&self, config: &Config, now: Instant) -> Duration {
        let deadline = match self.state {
            State::TriggerPressed => self.trigger_start.map(|start| start + config.timeout),
            State::WaitingTarget => self.compose_start.map(|start| start + config.timeout),
            _ => None,
        };
        match deadline {
            Some(deadline) => deadline.saturating_duration_since(now).max(MIN_POLL),
            None => IDLE_WAKE,
        }
    }

    fn shift_held(&self) -> bool {
        self.pressed_keys.contains(&Key::KEY_LEFTSHIFT)
            || self.pressed_keys.contains(&Key::KEY_RIGHTSHIFT)
    }
}
