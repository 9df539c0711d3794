//! The main event loop.
//!
//! Multiplexes the grabbed device fds, the `/dev/input` hotplug watch, and
//! the process signals in one poll set. The poll timeout follows the state
//! machine's pending deadline, so compose timeouts fire without busy
//! waiting.

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::time::Instant;

use evdev::uinput::VirtualDevice;
use evdev::{EventType, Key};
use inotify::{Inotify, WatchMask};
use log::{error, info, warn};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook_mio::v0_8::Signals;

use crate::compose::ComposeMachine;
use crate::config::Config;
use crate::device::{self, Keyboard};
use crate::output::{Synthesizer, UnicodeTyper};
use crate::paths;

const SIGNAL_TOKEN: Token = Token(0);
const HOTPLUG_TOKEN: Token = Token(1);
const FIRST_DEVICE_TOKEN: usize = 2;

const INPUT_DIR: &str = "/dev/input";

pub struct EventLoop {
    poll: Poll,
    devices: HashMap<Token, Keyboard>,
    next_token: usize,
    out: Synthesizer<VirtualDevice>,
    machine: ComposeMachine,
    config: Config,
    config_dir: PathBuf,
    signals: Signals,
    hotplug: Option<Inotify>,

    /// `--debug` pins the log level; reloads may not lower it.
    force_debug: bool,
}

impl EventLoop {
    /// Discover and grab the keyboards, create the virtual device, and wire
    /// every fd into the poll set.
    pub fn new(
        config: Config,
        config_dir: PathBuf,
        force_debug: bool,
    ) -> Result<EventLoop, Box<dyn std::error::Error>> {
        let mut keyboards = device::discover()?;
        let virtual_device = device::create_virtual_keyboard(&keyboards)?;
        device::grab_all(&mut keyboards)?;

        let poll = Poll::new()?;
        let mut signals = Signals::new([SIGTERM, SIGINT, SIGHUP])?;
        poll.registry().register(&mut signals, SIGNAL_TOKEN, Interest::READABLE)?;

        let hotplug = init_hotplug(&poll);
        let out = Synthesizer::new(virtual_device, UnicodeTyper::probe());

        let mut event_loop = EventLoop {
            poll,
            devices: HashMap::new(),
            next_token: FIRST_DEVICE_TOKEN,
            out,
            machine: ComposeMachine::new(),
            config,
            config_dir,
            signals,
            hotplug,
            force_debug,
        };
        for keyboard in keyboards {
            event_loop.register_device(keyboard)?;
        }
        Ok(event_loop)
    }

    /// Run until SIGTERM or SIGINT, then release everything.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);

        'event_loop: loop {
            let now = Instant::now();
            if let Err(err) = self.machine.check_timeout(&self.config, now, &mut self.out) {
                error!("Error replaying timed-out sequence: {err}");
                self.machine.reset();
            }

            self.update_test_mode();

            let timeout = self.machine.poll_timeout(&self.config, Instant::now());
            if let Err(err) = self.poll.poll(&mut events, Some(timeout)) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }

            for event in events.iter() {
                match event.token() {
                    SIGNAL_TOKEN => {
                        if !self.handle_signals() {
                            break 'event_loop;
                        }
                    },
                    HOTPLUG_TOKEN => self.handle_hotplug(),
                    token => self.handle_device(token),
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Returns `false` when the loop should terminate.
    fn handle_signals(&mut self) -> bool {
        let pending: Vec<i32> = self.signals.pending().collect();
        for signal in pending {
            match signal {
                SIGTERM | SIGINT => {
                    info!("Received signal {signal}, shutting down");
                    return false;
                },
                SIGHUP => self.reload(),
                _ => (),
            }
        }
        true
    }

    /// Rebuild the configuration. Errors leave the previous configuration
    /// in place.
    fn reload(&mut self) {
        info!("Reloading configuration");
        match Config::load(&self.config_dir) {
            Ok(config) => {
                if !self.force_debug {
                    log::set_max_level(config.log_level);
                }
                self.config = config;
                if let Err(err) = self.machine.force_release(&mut self.out) {
                    error!("Error releasing keys during reload: {err}");
                    self.machine.reset();
                }
                info!("Configuration reloaded successfully");
            },
            Err(err) => error!("Failed to reload config: {err}"),
        }
    }

    /// Track the test-mode marker; the transition into test mode releases
    /// anything the machine might be concealing.
    fn update_test_mode(&mut self) {
        let active = paths::test_mode_path(&self.config_dir).exists();
        if active == self.machine.test_mode() {
            return;
        }

        if active {
            info!("Test mode marker present: passing all events through");
            if !self.machine.is_idle() {
                if let Err(err) = self.machine.force_release(&mut self.out) {
                    error!("Error releasing keys entering test mode: {err}");
                    self.machine.reset();
                }
            }
        } else {
            info!("Test mode marker removed: resuming compose handling");
        }
        self.machine.set_test_mode(active);
    }

    fn handle_hotplug(&mut self) {
        let mut fresh: Vec<PathBuf> = Vec::new();
        if let Some(inotify) = &mut self.hotplug {
            let mut buffer = [0u8; 1024];
            loop {
                match inotify.read_events(&mut buffer) {
                    Ok(events) => {
                        for event in events {
                            let name = match event.name.and_then(|name| name.to_str()) {
                                Some(name) => name,
                                None => continue,
                            };
                            if name.starts_with("event") {
                                fresh.push(PathBuf::from(INPUT_DIR).join(name));
                            }
                        }
                    },
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) => {
                        warn!("Hotplug watch error: {err}");
                        break;
                    },
                }
            }
        }

        for path in fresh {
            if self.devices.values().any(|keyboard| keyboard.path == path) {
                continue;
            }
            if let Some(keyboard) = device::adopt(&path) {
                if let Err(err) = self.register_device(keyboard) {
                    warn!("Hotplug: failed to watch {}: {}", path.display(), err);
                }
            }
        }
    }

    /// Drain one readiness notification worth of events from a device.
    fn handle_device(&mut self, token: Token) {
        let keyboard = match self.devices.get_mut(&token) {
            Some(keyboard) => keyboard,
            None => return,
        };

        let mut failed = false;
        let mut fail_err = None;
        'drain: loop {
            match keyboard.device.fetch_events() {
                Ok(batch) => {
                    for event in batch {
                        match event.event_type() {
                            EventType::KEY => {
                                let key = Key::new(event.code());
                                let now = Instant::now();
                                if let Err(err) = self.machine.process(
                                    &self.config,
                                    key,
                                    event.value(),
                                    now,
                                    &mut self.out,
                                ) {
                                    error!("Error writing to virtual device: {err}");
                                    self.machine.reset();
                                }
                            },
                            // Every emission carries its own syn mark.
                            EventType::SYNCHRONIZATION => (),
                            _ => {
                                if let Err(err) = self.out.forward(event) {
                                    error!("Error forwarding event: {err}");
                                }
                            },
                        }
                    }
                },
                Err(err) if err.kind() == ErrorKind::WouldBlock => break 'drain,
                Err(err) => {
                    fail_err = Some(err);
                    failed = true;
                    break 'drain;
                },
            }
        }

        if let Some(err) = fail_err {
            warn!(
                "Device {} disconnected, removing from monitoring ({})",
                keyboard.name(),
                err
            );
        }

        if failed {
            self.remove_device(token);
        }
    }

    fn register_device(&mut self, keyboard: Keyboard) -> io::Result<()> {
        let token = Token(self.next_token);
        self.next_token += 1;

        let fd = keyboard.device.as_raw_fd();
        self.poll.registry().register(&mut SourceFd(&fd), token, Interest::READABLE)?;
        self.devices.insert(token, keyboard);
        Ok(())
    }

    fn remove_device(&mut self, token: Token) {
        if let Some(keyboard) = self.devices.remove(&token) {
            let fd = keyboard.device.as_raw_fd();
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
    }

    /// Release concealed keys and the device grabs before exit.
    fn shutdown(&mut self) {
        if let Err(err) = self.machine.force_release(&mut self.out) {
            warn!("Error releasing keys during shutdown: {err}");
        }
        for keyboard in self.devices.values_mut() {
            keyboard.ungrab();
        }
        info!("Cleanup complete");
    }
}

/// Watch `/dev/input` for new `event*` nodes. Failure disables hotplug but
/// never the daemon.
fn init_hotplug(poll: &Poll) -> Option<Inotify> {
    let inotify = match Inotify::init() {
        Ok(inotify) => inotify,
        Err(err) => {
            warn!("inotify unavailable, hotplug detection disabled: {err}");
            return None;
        },
    };

    if let Err(err) = inotify.watches().add(INPUT_DIR, WatchMask::CREATE) {
        warn!("Unable to watch {INPUT_DIR}, hotplug detection disabled: {err}");
        return None;
    }

    let fd = inotify.as_raw_fd();
    if let Err(err) = poll.registry().register(&mut SourceFd(&fd), HOTPLUG_TOKEN, Interest::READABLE)
    {
        warn!("Unable to poll hotplug watch, hotplug detection disabled: {err}");
        return None;
    }

    info!("Hotplug watch active on {INPUT_DIR}");
    Some(inotify)
}
