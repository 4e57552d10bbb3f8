//! Virtual output devices. The daemon replays processed events through a
//! uinput keyboard/pointer pair; a plain stdout sink backs `monitor`-style
//! debugging without touching uinput.

use crate::device::VIRTUAL_DEV_PREFIX;
use crate::keys::{self, KEY_WHEELDOWN, KEY_WHEELLEFT, KEY_WHEELRIGHT, KEY_WHEELUP, PHYS_KEY_COUNT};
use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{
    AbsInfo, AbsoluteAxisCode, AttributeSet, BusType, EventType, InputEvent, InputId, KeyCode,
    LedCode, RelativeAxisCode, UinputAbsSetup,
};
use log::warn;
use std::io;

pub enum Vkbd {
    Uinput {
        keyboard: VirtualDevice,
        pointer: VirtualDevice,
        /// Wheel ticks buffered until the next flush.
        wheel: (i32, i32),
    },
    Stdout,
}

fn mouse_button(code: u16) -> bool {
    (KeyCode::BTN_LEFT.code()..=KeyCode::BTN_TASK.code()).contains(&code)
}

impl Vkbd {
    pub fn uinput() -> io::Result<Vkbd> {
        let mut key_caps = AttributeSet::<KeyCode>::new();
        for code in 0..PHYS_KEY_COUNT {
            if !mouse_button(code) {
                key_caps.insert(KeyCode::new(code));
            }
        }

        let mut led_caps = AttributeSet::<LedCode>::new();
        for led in 0..crate::device::LED_COUNT as u16 {
            led_caps.insert(LedCode(led));
        }

        let keyboard = VirtualDeviceBuilder::new()?
            .name(&format!("{VIRTUAL_DEV_PREFIX}keyboard"))
            .input_id(InputId::new(BusType::BUS_USB, 0x0fac, 0x0ade, 1))
            .with_keys(&key_caps)?
            .with_leds(&led_caps)?
            .build()?;

        let mut button_caps = AttributeSet::<KeyCode>::new();
        for code in KeyCode::BTN_LEFT.code()..=KeyCode::BTN_TASK.code() {
            button_caps.insert(KeyCode::new(code));
        }

        let mut rel_caps = AttributeSet::<RelativeAxisCode>::new();
        rel_caps.insert(RelativeAxisCode::REL_X);
        rel_caps.insert(RelativeAxisCode::REL_Y);
        rel_caps.insert(RelativeAxisCode::REL_WHEEL);
        rel_caps.insert(RelativeAxisCode::REL_HWHEEL);

        let abs_info = AbsInfo::new(0, 0, 1024, 0, 0, 0);
        let pointer = VirtualDeviceBuilder::new()?
            .name(&format!("{VIRTUAL_DEV_PREFIX}pointer"))
            .input_id(InputId::new(BusType::BUS_USB, 0x0fac, 0x1ade, 1))
            .with_keys(&button_caps)?
            .with_relative_axes(&rel_caps)?
            .with_absolute_axis(&UinputAbsSetup::new(AbsoluteAxisCode::ABS_X, abs_info))?
            .with_absolute_axis(&UinputAbsSetup::new(AbsoluteAxisCode::ABS_Y, abs_info))?
            .build()?;

        Ok(Vkbd::Uinput {
            keyboard,
            pointer,
            wheel: (0, 0),
        })
    }

    pub fn stdout() -> Vkbd {
        Vkbd::Stdout
    }

    pub fn send_key(&mut self, code: u16, pressed: bool) {
        // Wheel pseudo codes become buffered scroll ticks on press.
        if keys::is_wheel(code) {
            if pressed {
                match code {
                    KEY_WHEELUP => self.mouse_scroll(0, 1),
                    KEY_WHEELDOWN => self.mouse_scroll(0, -1),
                    KEY_WHEELLEFT => self.mouse_scroll(-1, 0),
                    KEY_WHEELRIGHT => self.mouse_scroll(1, 0),
                    _ => unreachable!(),
                }
            }
            return;
        }

        match self {
            Vkbd::Uinput {
                keyboard, pointer, ..
            } => {
                if code >= PHYS_KEY_COUNT {
                    return;
                }

                let ev = InputEvent::new(EventType::KEY.0, code, i32::from(pressed));
                let target = if mouse_button(code) { pointer } else { keyboard };
                if let Err(e) = target.emit(&[ev]) {
                    warn!("virtual device write failed: {e}");
                }
            }
            Vkbd::Stdout => {
                println!(
                    "{} {}",
                    keys::key_name(code),
                    if pressed { "down" } else { "up" }
                );
            }
        }
    }

    pub fn mouse_move(&mut self, x: i32, y: i32) {
        match self {
            Vkbd::Uinput { pointer, .. } => {
                let mut events = Vec::with_capacity(2);
                if x != 0 {
                    events.push(InputEvent::new(
                        EventType::RELATIVE.0,
                        RelativeAxisCode::REL_X.0,
                        x,
                    ));
                }
                if y != 0 {
                    events.push(InputEvent::new(
                        EventType::RELATIVE.0,
                        RelativeAxisCode::REL_Y.0,
                        y,
                    ));
                }
                if !events.is_empty() {
                    let _ = pointer.emit(&events);
                }
            }
            Vkbd::Stdout => println!("mouse move {x} {y}"),
        }
    }

    pub fn mouse_move_abs(&mut self, x: i32, y: i32) {
        match self {
            Vkbd::Uinput { pointer, .. } => {
                let events = [
                    InputEvent::new(EventType::ABSOLUTE.0, AbsoluteAxisCode::ABS_X.0, x),
                    InputEvent::new(EventType::ABSOLUTE.0, AbsoluteAxisCode::ABS_Y.0, y),
                ];
                let _ = pointer.emit(&events);
            }
            Vkbd::Stdout => println!("mouse move abs {x} {y}"),
        }
    }

    pub fn mouse_scroll(&mut self, x: i32, y: i32) {
        match self {
            Vkbd::Uinput { wheel, .. } => {
                wheel.0 += x;
                wheel.1 += y;
            }
            Vkbd::Stdout => println!("mouse scroll {x} {y}"),
        }
    }

    /// Flushes buffered wheel movement at the end of an event-loop tick.
    pub fn flush(&mut self) {
        if let Vkbd::Uinput { pointer, wheel, .. } = self {
            let (x, y) = std::mem::take(wheel);
            if x != 0 {
                let _ = pointer.emit(&[InputEvent::new(
                    EventType::RELATIVE.0,
                    RelativeAxisCode::REL_HWHEEL.0,
                    x,
                )]);
            }
            if y != 0 {
                let _ = pointer.emit(&[InputEvent::new(
                    EventType::RELATIVE.0,
                    RelativeAxisCode::REL_WHEEL.0,
                    y,
                )]);
            }
        }
    }
}
