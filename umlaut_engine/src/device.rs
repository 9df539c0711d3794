//! Keyboard discovery, exclusive grabs, and the virtual output device.
//!
//! Discovery walks every input device and keeps only real keyboards: key
//! events present, no pointer or touch axes, no gamepad or mouse buttons,
//! and a large enough intersection with a reference key set to exclude
//! media remotes and headsets.

use std::fmt::{self, Display, Formatter};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AbsoluteAxisType, AttributeSet, Device, Key, LedType};
use log::{debug, info, warn};

/// Name of the daemon's own uinput device. The discovery filter recognizes
/// it to avoid self-grabbing.
pub const VIRTUAL_DEVICE_NAME: &str = "umlaut-virtual-keyboard";

/// Delay before evaluating a hotplugged node, letting udev settle.
const HOTPLUG_SETTLE: Duration = Duration::from_millis(300);

/// Keys that define a real keyboard. A device must expose at least
/// [`MIN_KEYBOARD_KEYS`] of them.
const REAL_KEYBOARD_KEYS: [Key; 10] = [
    Key::KEY_A,
    Key::KEY_B,
    Key::KEY_C,
    Key::KEY_D,
    Key::KEY_E,
    Key::KEY_SPACE,
    Key::KEY_ENTER,
    Key::KEY_BACKSPACE,
    Key::KEY_LEFTSHIFT,
    Key::KEY_LEFTCTRL,
];
const MIN_KEYBOARD_KEYS: usize = 8;

const GAMEPAD_BUTTONS: [Key; 4] = [Key::BTN_SOUTH, Key::BTN_EAST, Key::BTN_NORTH, Key::BTN_WEST];
const MOUSE_BUTTONS: [Key; 3] = [Key::BTN_LEFT, Key::BTN_RIGHT, Key::BTN_MIDDLE];

/// Startup-fatal device failures.
#[derive(Debug)]
pub enum Error {
    /// No device passed the keyboard filter.
    NoKeyboards,

    /// Exclusive grab failed.
    Grab { name: String, source: io::Error },

    /// Virtual device creation failed.
    Uinput(io::Error),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::NoKeyboards => None,
            Error::Grab { source, .. } => Some(source),
            Error::Uinput(source) => Some(source),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoKeyboards => write!(f, "No keyboard devices found"),
            Error::Grab { name, source } => write!(f, "Failed to grab {name}: {source}"),
            Error::Uinput(source) => write!(f, "Failed to create virtual keyboard: {source}"),
        }
    }
}

/// An exclusively grabbed physical keyboard.
pub struct Keyboard {
    pub path: PathBuf,
    pub device: Device,
}

impl Keyboard {
    pub fn name(&self) -> String {
        self.device.name().unwrap_or("unknown").to_string()
    }

    /// Switch the fd to non-blocking and take the exclusive grab.
    pub fn grab(&mut self) -> io::Result<()> {
        set_nonblocking(self.device.as_raw_fd())?;
        self.device.grab()
    }

    pub fn ungrab(&mut self) {
        match self.device.ungrab() {
            Ok(()) => info!("Released device: {}", self.name()),
            Err(err) => warn!("Error releasing {}: {}", self.name(), err),
        }
    }
}

/// Enumerate input devices and keep the keyboards.
pub fn discover() -> Result<Vec<Keyboard>, Error> {
    let mut keyboards = Vec::new();
    for (path, device) in evdev::enumerate() {
        if !is_keyboard(&device) {
            continue;
        }
        info!("Found keyboard: {} at {}", device.name().unwrap_or("unknown"), path.display());
        keyboards.push(Keyboard { path, device });
    }

    if keyboards.is_empty() {
        return Err(Error::NoKeyboards);
    }
    Ok(keyboards)
}

/// Exclusively grab every discovered keyboard. Any failure is fatal at
/// startup.
pub fn grab_all(keyboards: &mut [Keyboard]) -> Result<(), Error> {
    for keyboard in keyboards {
        keyboard
            .grab()
            .map_err(|source| Error::Grab { name: keyboard.name(), source })?;
        info!("Grabbed device: {}", keyboard.name());
    }
    Ok(())
}

/// The discovery filter.
fn is_keyboard(device: &Device) -> bool {
    let name = device.name().unwrap_or("unknown");

    // Never grab our own virtual keyboard.
    if name == VIRTUAL_DEVICE_NAME {
        return false;
    }

    let keys = match device.supported_keys() {
        Some(keys) => keys,
        None => return false,
    };

    // Relative axes mean a mouse or touchpad.
    if device.supported_relative_axes().is_some() {
        debug!("Skipping {name} (relative axes: likely mouse/touchpad)");
        return false;
    }

    if let Some(axes) = device.supported_absolute_axes() {
        // Absolute or multitouch positioning means a touchscreen or tablet.
        if axes.contains(AbsoluteAxisType::ABS_X) || axes.contains(AbsoluteAxisType::ABS_Y) {
            debug!("Skipping {name} (absolute X/Y: touchscreen/tablet)");
            return false;
        }
        if axes.contains(AbsoluteAxisType::ABS_MT_POSITION_X) {
            debug!("Skipping {name} (multitouch: touchscreen/touchpad)");
            return false;
        }
    }

    if GAMEPAD_BUTTONS.iter().any(|&button| keys.contains(button)) {
        debug!("Skipping {name} (gamepad buttons)");
        return false;
    }

    if MOUSE_BUTTONS.iter().any(|&button| keys.contains(button)) {
        debug!("Skipping {name} (mouse buttons)");
        return false;
    }

    // Require most of the reference set; filters media remotes and BT
    // headsets that expose a couple of keys.
    let matches = REAL_KEYBOARD_KEYS.iter().filter(|&&key| keys.contains(key)).count();
    if matches < MIN_KEYBOARD_KEYS {
        debug!("Skipping {name} (only {matches}/{MIN_KEYBOARD_KEYS} keyboard keys)");
        return false;
    }

    true
}

/// Create the single virtual output device, advertising the union of the
/// grabbed keyboards' key capabilities plus the lock LEDs so host LED state
/// tracking works.
pub fn create_virtual_keyboard(keyboards: &[Keyboard]) -> Result<VirtualDevice, Error> {
    let mut keys = AttributeSet::<Key>::new();
    for keyboard in keyboards {
        if let Some(supported) = keyboard.device.supported_keys() {
            for key in supported.iter() {
                keys.insert(key);
            }
        }
    }

    let mut leds = AttributeSet::<LedType>::new();
    leds.insert(LedType::LED_CAPSL);
    leds.insert(LedType::LED_NUML);
    leds.insert(LedType::LED_SCROLLL);

    let device = VirtualDeviceBuilder::new()
        .map_err(Error::Uinput)?
        .name(VIRTUAL_DEVICE_NAME)
        .with_keys(&keys)
        .map_err(Error::Uinput)?
        .with_leds(&leds)
        .map_err(Error::Uinput)?
        .build()
        .map_err(Error::Uinput)?;

    info!("Created virtual keyboard device");
    Ok(device)
}

/// Evaluate a hotplugged `/dev/input` node against the discovery filter
/// and grab it if it qualifies. Grab failures are logged, not fatal.
pub fn adopt(path: &Path) -> Option<Keyboard> {
    thread::sleep(HOTPLUG_SETTLE);

    let device = match Device::open(path) {
        Ok(device) => device,
        Err(err) => {
            debug!("Hotplug: could not open {}: {}", path.display(), err);
            return None;
        },
    };

    if !is_keyboard(&device) {
        return None;
    }

    let mut keyboard = Keyboard { path: path.to_path_buf(), device };
    match keyboard.grab() {
        Ok(()) => {
            info!("Hotplug: grabbed new keyboard {} at {}", keyboard.name(), path.display());
            Some(keyboard)
        },
        Err(err) => {
            warn!("Hotplug: failed to grab {}: {}", keyboard.name(), err);
            None
        },
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonblocking_flag_is_set() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        set_nonblocking(fds[0]).unwrap();
        let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFL, 0) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
