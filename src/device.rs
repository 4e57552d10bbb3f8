//! Physical input devices: evdev open, capability probing, grab/ungrab with
//! LED bookkeeping, and inotify-based hotplug monitoring of /dev/input.

use crate::config::{CAP_KEYBOARD, CAP_LEDS, CAP_MOUSE, CAP_MOUSE_ABS};
use crate::keys::{KEY_WHEELDOWN, KEY_WHEELLEFT, KEY_WHEELRIGHT, KEY_WHEELUP};
use evdev::{AbsoluteAxisCode, EventType, InputEvent, KeyCode, RelativeAxisCode};
use itertools::Itertools;
use log::{debug, warn};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Name prefix identifying our own virtual devices.
pub const VIRTUAL_DEV_PREFIX: &str = "remapd virtual ";

pub const MAX_DEVICES: usize = 128;
pub const LED_COUNT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Key { code: u16, pressed: bool },
    MouseMove { x: i32, y: i32 },
    MouseMoveAbs { x: i32, y: i32 },
    MouseScroll { x: i32, y: i32 },
    Led { led: u16, on: bool },
    Removed,
}

pub struct Device {
    pub dev: evdev::Device,
    pub num: usize,
    pub id: String,
    pub name: String,
    pub capabilities: u8,
    pub grabbed: bool,
    pub is_virtual: bool,
    pub led_state: [bool; LED_COUNT],
    /// Index of the config this device is mapped to, if any.
    pub data: Option<usize>,
    abs_x: (i32, i32),
    abs_y: (i32, i32),
}

fn djb2_uid(num_keys: u32, absmask: u8, relmask: u8, name: &str) -> u32 {
    let mut hash = 5183u32;
    let mut step = |b: u8| hash = hash.wrapping_mul(33).wrapping_add(u32::from(b));

    for shift in [24, 16, 8, 0] {
        step((num_keys >> shift) as u8);
    }
    step(absmask);
    step(relmask);
    for b in name.bytes() {
        step(b);
    }

    hash
}

impl Device {
    /// Opens `/dev/input/event<num>`, returning `None` for nodes with no
    /// keyboard or pointer capabilities.
    pub fn open(num: usize) -> Option<Device> {
        let path = PathBuf::from(format!("/dev/input/event{num}"));
        let dev = match evdev::Device::open(&path) {
            Ok(dev) => dev,
            Err(e) => {
                warn!("failed to open {}: {e}", path.display());
                return None;
            }
        };

        let name = dev.name().unwrap_or("").to_owned();

        // Baseline: the top two letter rows. Devices exposing brightness
        // or volume keys also count as keyboards to catch hotkey nodes.
        let keyboard_baseline = [
            KeyCode::KEY_1,
            KeyCode::KEY_2,
            KeyCode::KEY_3,
            KeyCode::KEY_4,
            KeyCode::KEY_5,
            KeyCode::KEY_6,
            KeyCode::KEY_7,
            KeyCode::KEY_8,
            KeyCode::KEY_9,
            KeyCode::KEY_0,
            KeyCode::KEY_Q,
            KeyCode::KEY_W,
            KeyCode::KEY_E,
            KeyCode::KEY_R,
            KeyCode::KEY_T,
            KeyCode::KEY_Y,
        ];

        let mut capabilities = 0u8;
        let mut num_keys = 0u32;

        let has_keys = dev.supported_keys();
        if let Some(keys) = has_keys {
            num_keys = keys
                .iter()
                .filter(|k| k.code() <= KeyCode::BTN_LEFT.code() + 31)
                .count() as u32;

            let baseline = keyboard_baseline.iter().all(|k| keys.contains(*k));
            if baseline
                || keys.contains(KeyCode::KEY_BRIGHTNESSUP)
                || keys.contains(KeyCode::KEY_VOLUMEUP)
            {
                capabilities |= CAP_KEYBOARD;
            }
        }

        let mut relmask = 0u8;
        if let Some(axes) = dev.supported_relative_axes() {
            for axis in axes.iter() {
                if axis.0 < 8 {
                    relmask |= 1 << axis.0;
                }
            }
        }

        let mut absmask = 0u8;
        if let Some(axes) = dev.supported_absolute_axes() {
            for axis in axes.iter() {
                if axis.0 < 8 {
                    absmask |= 1 << axis.0;
                }
            }
        }

        if relmask != 0 || absmask != 0 {
            capabilities |= CAP_MOUSE;
        }
        if absmask != 0 {
            capabilities |= CAP_MOUSE_ABS;
        }
        if dev.supported_leds().is_some_and(|l| l.iter().next().is_some()) {
            capabilities |= CAP_LEDS;
        }

        if capabilities == 0 {
            return None;
        }

        let mut abs_x = (0, 0);
        let mut abs_y = (0, 0);
        if capabilities & CAP_MOUSE_ABS != 0 {
            if let Ok(state) = dev.get_abs_state() {
                let x = state[AbsoluteAxisCode::ABS_X.0 as usize];
                let y = state[AbsoluteAxisCode::ABS_Y.0 as usize];
                abs_x = (x.minimum, x.maximum);
                abs_y = (y.minimum, y.maximum);
            }
        }

        let input_id = dev.input_id();
        // The product and vendor ids are not unique across the multiple
        // nodes some devices create, so fold the name and capability
        // masks into the identifier as well.
        let id = format!(
            "{:04x}:{:04x}:{:08x}",
            input_id.vendor(),
            input_id.product(),
            djb2_uid(num_keys, absmask, relmask, &name)
        );

        if let Err(e) = fcntl(dev.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK)) {
            warn!("{}: failed to set non-blocking: {e}", path.display());
            return None;
        }

        debug!("capabilities of {} ({name}): {capabilities:x}", path.display());

        let is_virtual = name.starts_with(VIRTUAL_DEV_PREFIX);

        Some(Device {
            dev,
            num,
            id,
            name,
            capabilities,
            grabbed: false,
            is_virtual,
            led_state: [false; LED_COUNT],
            data: None,
            abs_x,
            abs_y,
        })
    }

    /// Grabs the device, waiting out held keys first so residual key-up
    /// events reach their original destination.
    pub fn grab(&mut self) -> io::Result<()> {
        if self.grabbed {
            return Ok(());
        }

        let mut pending_release = false;
        for _ in 0..100 {
            let held = self.dev.get_key_state()?;
            pending_release = held.iter().next().is_some();
            if !pending_release {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        if pending_release {
            for key in self.dev.get_key_state()?.iter() {
                debug!("waiting for key {:?}...", key);
            }
            thread::sleep(Duration::from_millis(50));
        }

        if self.capabilities & CAP_LEDS != 0 {
            let leds = self.dev.get_led_state()?;
            self.led_state = [false; LED_COUNT];
            for led in leds.iter() {
                if (led.0 as usize) < LED_COUNT {
                    self.led_state[led.0 as usize] = true;
                }
            }
        }

        self.dev.grab()?;

        // Drain whatever queued up before the grab took effect.
        while let Ok(events) = self.dev.fetch_events() {
            if events.count() == 0 {
                break;
            }
        }

        self.grabbed = true;
        Ok(())
    }

    pub fn ungrab(&mut self) -> io::Result<()> {
        if !self.grabbed {
            return Ok(());
        }

        self.dev.ungrab()?;

        if self.capabilities & CAP_LEDS != 0 {
            for led in 0..LED_COUNT {
                self.set_led(led as u16, self.led_state[led]);
            }
        }

        self.grabbed = false;
        Ok(())
    }

    pub fn set_led(&mut self, led: u16, on: bool) {
        if led as usize >= LED_COUNT || self.capabilities & CAP_LEDS == 0 {
            return;
        }

        let ev = InputEvent::new(EventType::LED.0, led, i32::from(on));
        if let Err(e) = self.dev.send_events(&[ev]) {
            debug!("{}: failed to set led: {e}", self.name);
        }
    }

    /// Drains the device, translating evdev events. A read failure other
    /// than `WouldBlock` reports the device as removed.
    pub fn read_events(&mut self) -> Vec<DeviceEvent> {
        let mut out = Vec::new();

        let events = match self.dev.fetch_events() {
            Ok(events) => events,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return out,
            Err(_) => {
                out.push(DeviceEvent::Removed);
                return out;
            }
        };

        for ev in events {
            match ev.event_type() {
                EventType::KEY => {
                    // Ignore autorepeat.
                    if ev.value() == 2 {
                        continue;
                    }
                    out.push(DeviceEvent::Key {
                        code: ev.code(),
                        pressed: ev.value() != 0,
                    });
                }
                EventType::RELATIVE => match RelativeAxisCode(ev.code()) {
                    RelativeAxisCode::REL_WHEEL => {
                        out.push(DeviceEvent::MouseScroll { x: 0, y: ev.value() });
                    }
                    RelativeAxisCode::REL_HWHEEL => {
                        out.push(DeviceEvent::MouseScroll { x: ev.value(), y: 0 });
                    }
                    RelativeAxisCode::REL_X => {
                        out.push(DeviceEvent::MouseMove { x: ev.value(), y: 0 });
                    }
                    RelativeAxisCode::REL_Y => {
                        out.push(DeviceEvent::MouseMove { x: 0, y: ev.value() });
                    }
                    other => debug!("unrecognized EV_REL code: {}", other.0),
                },
                EventType::ABSOLUTE => match AbsoluteAxisCode(ev.code()) {
                    AbsoluteAxisCode::ABS_X => {
                        let range = (self.abs_x.1 - self.abs_x.0).max(1);
                        out.push(DeviceEvent::MouseMoveAbs {
                            x: ev.value().saturating_mul(1024) / range,
                            y: 0,
                        });
                    }
                    AbsoluteAxisCode::ABS_Y => {
                        let range = (self.abs_y.1 - self.abs_y.0).max(1);
                        out.push(DeviceEvent::MouseMoveAbs {
                            x: 0,
                            y: ev.value().saturating_mul(1024) / range,
                        });
                    }
                    other => debug!("unrecognized EV_ABS code: {:x}", other.0),
                },
                EventType::LED => {
                    out.push(DeviceEvent::Led {
                        led: ev.code(),
                        on: ev.value() != 0,
                    });
                }
                _ => (),
            }
        }

        out
    }

    pub fn fd(&self) -> i32 {
        self.dev.as_raw_fd()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let _ = self.ungrab();
    }
}

/// Scroll wheel ticks arrive as `MouseScroll`; the engine consumes them as
/// pseudo key strokes.
pub fn wheel_key(x: i32, y: i32) -> Option<u16> {
    if x > 0 {
        Some(KEY_WHEELLEFT)
    } else if x < 0 {
        Some(KEY_WHEELRIGHT)
    } else if y > 0 {
        Some(KEY_WHEELUP)
    } else if y < 0 {
        Some(KEY_WHEELDOWN)
    } else {
        None
    }
}

/// Enumerates the current /dev/input event nodes, in node order.
pub fn scan() -> Vec<Device> {
    let entries = match std::fs::read_dir("/dev/input") {
        Ok(entries) => entries,
        Err(e) => {
            warn!("failed to read /dev/input: {e}");
            return Vec::new();
        }
    };

    let devices: Vec<Device> = entries
        .flatten()
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_prefix("event"))
                .and_then(|n| n.parse::<usize>().ok())
        })
        .sorted_unstable()
        .filter_map(Device::open)
        .take(MAX_DEVICES)
        .collect();

    if devices.len() == MAX_DEVICES {
        warn!("device limit reached, some devices may be ignored");
    }

    devices
}

/// Hotplug monitor: an inotify watch for device node creation.
pub struct Devmon {
    inotify: Inotify,
}

impl Devmon {
    pub fn create() -> io::Result<Devmon> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;
        inotify.add_watch("/dev/input", AddWatchFlags::IN_CREATE)?;
        Ok(Devmon { inotify })
    }

    /// Returns newly created devices, skipping nodes that are not yet
    /// openable or carry no interesting capabilities.
    pub fn read_devices(&self) -> Vec<Device> {
        let mut out = Vec::new();

        let Ok(events) = self.inotify.read_events() else {
            return out;
        };

        for ev in events {
            let Some(num) = ev
                .name
                .as_ref()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("event"))
                .and_then(|n| n.parse::<usize>().ok())
            else {
                continue;
            };

            if let Some(dev) = Device::open(num) {
                out.push(dev);
            }
        }

        out
    }

    pub fn fd(&self) -> i32 {
        self.inotify.as_fd().as_raw_fd()
    }
}
