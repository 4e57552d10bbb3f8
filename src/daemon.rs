//! Daemon glue: config-directory scanning, device-to-config matching, the
//! layer-indicator LED, IPC dispatch and the main event loop.

use crate::config::{
    self, Config, EnvPack, CAP_LEDS, CAP_KEYBOARD, CAP_MOUSE, CAP_MOUSE_ABS, ID_ABS_PTR,
    ID_KEYBOARD, ID_MOUSE,
};
use crate::device::{Device, DeviceEvent, LED_COUNT};
use crate::evloop::EventLoop;
use crate::ipc::{self, Message, MsgType, MAX_TIMEOUT_US};
use crate::keyboard::{KeyEvent, Keyboard, LayerEvent, Output};
use crate::keys::{self, KEY_SPACE, KEY_WHEELDOWN, KEY_WHEELLEFT, KEY_WHEELRIGHT, KEY_WHEELUP};
use crate::macros;
use crate::unicode;
use crate::vkbd::Vkbd;
use evdev::KeyCode;
use log::{debug, error, info, warn};
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use nix::unistd::{getgid, getuid};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const DEFAULT_CONFIG_DIR: &str = "/etc/remapd";

const MAX_LISTENERS: usize = 32;

/// Send timeout for layer-state listeners: slow clients get this long to
/// relieve back pressure before being dropped.
const LISTENER_TIMEOUT: Duration = Duration::from_millis(50);

enum ClientAction {
    Continue,
    Done,
    Listen,
}

struct Sink<'a> {
    vkbd: &'a mut Vkbd,
    listeners: &'a mut Vec<UnixStream>,
    keystate: &'a mut [bool; KEY_SPACE],
}

impl Output for Sink<'_> {
    fn send_key(&mut self, code: u16, pressed: bool) {
        if (code as usize) < KEY_SPACE {
            self.keystate[code as usize] = pressed;
        }
        self.vkbd.send_key(code, pressed);
    }

    fn on_layer_change(&mut self, event: &LayerEvent) {
        if event.name.is_empty() {
            return;
        }
        let line = format!("{}{}\n", event.state, event.name);
        self.listeners
            .retain_mut(|l| l.write_all(line.as_bytes()).is_ok());
    }
}

pub struct Daemon {
    config_dir: PathBuf,
    vkbd: Vkbd,
    ipc: UnixListener,
    keyboards: Vec<Keyboard>,
    listeners: Vec<UnixStream>,
    keystate: Box<[bool; KEY_SPACE]>,
    /// Keyboard that last consumed input; timeout ticks go here.
    active: Option<usize>,
    panic_keys: [bool; 3],
}

impl Daemon {
    fn sink<'a>(
        vkbd: &'a mut Vkbd,
        listeners: &'a mut Vec<UnixStream>,
        keystate: &'a mut [bool; KEY_SPACE],
    ) -> Sink<'a> {
        Sink {
            vkbd,
            listeners,
            keystate,
        }
    }

    fn feed(&mut self, idx: usize, events: &[KeyEvent], real: bool) -> i64 {
        let kbd = &mut self.keyboards[idx];
        let mut sink = Self::sink(&mut self.vkbd, &mut self.listeners, &mut self.keystate);
        kbd.process_events(&mut sink, events, real)
    }

    /// Reflects layer state onto the indicator LED of every device mapped
    /// to this config.
    fn update_indicator(&mut self, evloop: &mut EventLoop, idx: usize) {
        let kbd = &self.keyboards[idx];
        let led = kbd.config.layer_indicator;
        if led as usize >= LED_COUNT {
            return;
        }

        let on = kbd.indicator_active();
        for dev in evloop.devices.iter_mut().flatten() {
            if dev.data == Some(idx) && dev.capabilities & CAP_LEDS != 0 {
                if std::mem::replace(&mut dev.led_state[led as usize], on) != on {
                    dev.set_led(u16::from(led), on);
                }
            }
        }
    }

    /// Simultaneous backspace+enter+escape on the input side terminates
    /// the daemon regardless of configuration.
    fn panic_check(&mut self, code: u16, pressed: bool) {
        if code == KeyCode::KEY_BACKSPACE.code() {
            self.panic_keys[0] = pressed;
        } else if code == KeyCode::KEY_ENTER.code() {
            self.panic_keys[1] = pressed;
        } else if code == KeyCode::KEY_ESC.code() {
            self.panic_keys[2] = pressed;
        }

        if self.panic_keys.iter().all(|&k| k) {
            error!("panic sequence detected");
            std::process::exit(1);
        }
    }

    fn load_configs(&mut self) {
        let entries = match std::fs::read_dir(&self.config_dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!("{}: {e}", self.config_dir.display());
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

            if !name.ends_with(".conf") || name.ends_with(".old.conf") {
                continue;
            }

            info!("CONFIG: parsing {}", path.display());

            let mut config = Config::default();
            match config::parse_file(&mut config, &path) {
                Ok(()) => self.keyboards.push(Keyboard::new(config)),
                Err(e) => warn!("failed to parse {}: {e}", path.display()),
            }
        }
    }

    fn lookup_config(&self, id: &str, flags: u8) -> Option<usize> {
        let mut best = None;
        let mut rank = 0;

        for (idx, kbd) in self.keyboards.iter().enumerate() {
            let r = kbd.config.check_match(id, flags);
            if r > rank {
                best = Some(idx);
                rank = r;
            }
        }

        best
    }

    fn manage_device(&mut self, evloop: &mut EventLoop, slot: usize) {
        let Some(dev) = evloop.devices.get_mut(slot).and_then(Option::as_mut) else {
            return;
        };
        if dev.is_virtual {
            evloop.update_interest(slot);
            return;
        }

        let mut flags = 0u8;
        if dev.capabilities & CAP_KEYBOARD != 0 {
            flags |= ID_KEYBOARD;
        }
        if dev.capabilities & (CAP_MOUSE | CAP_MOUSE_ABS) != 0 {
            flags |= ID_MOUSE;
        }
        if dev.capabilities & CAP_MOUSE_ABS != 0 {
            flags |= ID_ABS_PTR;
        }

        let id = dev.id.clone();
        match self.lookup_config(&id, flags) {
            Some(idx) => {
                if dev.grab().is_err() {
                    warn!("DEVICE: failed to grab /dev/input/event{}", dev.num);
                    dev.data = None;
                } else {
                    info!(
                        "DEVICE: match    {id}  {}\t({})",
                        self.keyboards[idx].config.path.display(),
                        dev.name
                    );
                    dev.data = Some(idx);
                    let led = self.keyboards[idx].config.layer_indicator;
                    if dev.capabilities & CAP_LEDS != 0 {
                        dev.set_led(u16::from(led), false);
                    }
                }
            }
            None => {
                dev.data = None;
                let _ = dev.ungrab();
                info!("DEVICE: ignoring {id}  ({})", dev.name);
            }
        }

        evloop.update_interest(slot);
    }

    fn clear_vkbd(&mut self) {
        for code in 0..KEY_SPACE {
            if self.keystate[code] {
                self.keystate[code] = false;
                self.vkbd.send_key(code as u16, false);
            }
        }
        self.vkbd.flush();
    }

    fn reload(&mut self, evloop: &mut EventLoop, env: Option<Arc<EnvPack>>) {
        for dev in evloop.devices.iter_mut().flatten() {
            if let Some(idx) = dev.data {
                if let Some(kbd) = self.keyboards.get(idx) {
                    let led = kbd.config.layer_indicator;
                    if (led as usize) < LED_COUNT {
                        dev.led_state[led as usize] = false;
                        dev.set_led(u16::from(led), false);
                    }
                }
            }
        }

        self.active = None;
        self.keyboards.clear();
        self.load_configs();

        // User bindings are only loaded on behalf of a real user session.
        if let Some(env) = &env {
            if env.uid >= 1000 {
                let path = env
                    .get("XDG_CONFIG_HOME")
                    .map(|v| PathBuf::from(v).join("remapd/bindings.conf"))
                    .or_else(|| {
                        env.get("HOME")
                            .map(|v| PathBuf::from(v).join(".config/remapd/bindings.conf"))
                    })
                    .unwrap_or_else(|| PathBuf::from("./remapd/bindings.conf"));

                match std::fs::read_to_string(&path) {
                    Ok(bindings) => {
                        for kbd in &mut self.keyboards {
                            kbd.config.cmd_env = Some(env.clone());
                            kbd.config.cmd_uid = env.uid;
                            kbd.config.cmd_gid = env.gid;
                            for line in bindings.lines() {
                                let line = line.trim();
                                if line.is_empty() || line == "reset" {
                                    continue;
                                }
                                if !kbd.eval(line) {
                                    warn!("invalid binding: {line}");
                                }
                            }
                        }
                    }
                    Err(e) => debug!("unable to open {}: {e}", path.display()),
                }
            }
        }

        for kbd in &mut self.keyboards {
            kbd.config.finalize();
        }

        let slots: Vec<usize> = (0..evloop.devices.len())
            .filter(|&s| evloop.devices[s].is_some())
            .collect();
        for slot in slots {
            self.manage_device(evloop, slot);
        }

        self.clear_vkbd();
    }

    fn add_listener(&mut self, con: UnixStream) {
        let _ = con.set_write_timeout(Some(LISTENER_TIMEOUT));
        let mut con = con;

        if let Some(idx) = self.active {
            let kbd = &self.keyboards[idx];
            let layout = kbd.layout();

            let line = format!("/{}\n", kbd.config.layers[layout].name);
            if con.write_all(line.as_bytes()).is_err() {
                return;
            }

            for idx in kbd.active_layers() {
                if idx == layout {
                    continue;
                }
                let layer = &kbd.config.layers[idx];
                if layer.name.is_empty() {
                    continue;
                }
                if con.write_all(format!("+{}\n", layer.name).as_bytes()).is_err() {
                    return;
                }
            }
        }

        if self.listeners.len() >= MAX_LISTENERS {
            warn!("too many listeners, ignoring");
            return;
        }

        self.listeners.push(con);
    }

    /// Types literal UTF-8 text through the virtual keyboard.
    fn input(&mut self, text: &str, timeout_us: u64) -> Result<(), String> {
        for c in text.chars() {
            let mut emitted = false;

            if c.is_ascii() {
                let mut buf = [0u8; 4];
                if let Some((seq, 0)) = keys::parse_key_sequence(c.encode_utf8(&mut buf)) {
                    if seq.code != 0 {
                        let shift = seq.mods & (1 << keys::MOD_SHIFT) != 0;
                        if shift {
                            self.send_direct(KeyCode::KEY_LEFTSHIFT.code(), true);
                        }
                        self.send_direct(seq.code, true);
                        self.send_direct(seq.code, false);
                        if shift {
                            self.send_direct(KeyCode::KEY_LEFTSHIFT.code(), false);
                        }
                        emitted = true;
                    }
                }
            }

            if !emitted {
                let Some(idx) = unicode::lookup_index(c as u32) else {
                    return Err(format!("could not find code for \"{c}\""));
                };
                for code in unicode::sequence(idx) {
                    self.send_direct(code, true);
                    self.send_direct(code, false);
                }
            }

            self.vkbd.flush();
            if timeout_us > 0 {
                thread::sleep(Duration::from_micros(timeout_us));
            }
        }

        Ok(())
    }

    fn send_direct(&mut self, code: u16, pressed: bool) {
        if (code as usize) < KEY_SPACE {
            self.keystate[code as usize] = pressed;
        }
        self.vkbd.send_key(code, pressed);
    }

    fn handle_message(
        &mut self,
        evloop: &mut EventLoop,
        con: &mut UnixStream,
        msg: Message,
        env: &Option<Arc<EnvPack>>,
    ) -> ClientAction {
        if msg.timeout > MAX_TIMEOUT_US {
            let _ = Message::fail("timeout cannot exceed 1000 ms").write_to(con);
            return ClientAction::Done;
        }

        match msg.msg_type {
            MsgType::Macro => {
                let mut data = msg.data.clone();
                while data.last() == Some(&b'\n') {
                    data.pop();
                }
                let text = String::from_utf8_lossy(&data).into_owned();

                // Commands parsed on a client's behalf run with its
                // credentials and environment.
                let mut scratch = Config::default();
                if let Some(env) = env {
                    scratch.cmd_uid = env.uid;
                    scratch.cmd_gid = env.gid;
                    scratch.cmd_env = Some(env.clone());
                }

                match macros::parse(&text, &mut scratch) {
                    Ok(mac) => {
                        let mut sink =
                            Self::sink(&mut self.vkbd, &mut self.listeners, &mut self.keystate);
                        macros::execute(
                            &mut |code, pressed| sink.send_key(code, pressed),
                            &mac,
                            msg.timeout,
                            &scratch,
                        );
                        self.vkbd.flush();
                        let _ = Message::success().write_to(con);
                    }
                    Err(e) => {
                        let _ = Message::fail(e).write_to(con);
                    }
                }
                ClientAction::Done
            }
            MsgType::Input => {
                let text = String::from_utf8_lossy(&msg.data).into_owned();
                match self.input(&text, msg.timeout) {
                    Ok(()) => {
                        let _ = Message::success().write_to(con);
                    }
                    Err(e) => {
                        let _ = Message::fail(e).write_to(con);
                    }
                }
                ClientAction::Done
            }
            MsgType::Reload => {
                self.reload(evloop, env.clone());
                let _ = Message::success().write_to(con);
                ClientAction::Done
            }
            MsgType::LayerListen => ClientAction::Listen,
            MsgType::Bind => {
                if self.keyboards.is_empty() {
                    let _ = Message::fail("no configs loaded").write_to(con);
                    return ClientAction::Done;
                }

                let expr = String::from_utf8_lossy(&msg.data).into_owned();

                let mut success = false;
                for kbd in &mut self.keyboards {
                    kbd.ensure_backup();
                    if let Some(env) = env {
                        kbd.config.cmd_env = Some(env.clone());
                        kbd.config.cmd_uid = env.uid;
                        kbd.config.cmd_gid = env.gid;
                    }
                    success |= kbd.eval(&expr);
                }

                if success {
                    let _ = Message::success().write_to(con);
                } else {
                    let _ = Message::fail(format!("invalid binding: {expr}")).write_to(con);
                }

                // Bind connections stream expressions until close.
                ClientAction::Continue
            }
            MsgType::Success | MsgType::Fail => {
                let _ = Message::fail("unknown command").write_to(con);
                ClientAction::Done
            }
        }
    }

    /// Snapshot of the caller's environment, taken when it is not the
    /// daemon's own user.
    fn client_env(con: &UnixStream) -> Option<Arc<EnvPack>> {
        let creds = getsockopt(con, PeerCredentials).ok()?;

        if creds.uid() == getuid().as_raw() && creds.gid() == getgid().as_raw() {
            return None;
        }

        let mut buf = Vec::new();
        std::fs::File::open(format!("/proc/{}/environ", creds.pid()))
            .and_then(|mut f| f.read_to_end(&mut buf))
            .ok()?;

        if buf.is_empty() {
            return None;
        }

        Some(Arc::new(EnvPack::new(buf, creds.uid(), creds.gid())))
    }

    fn handle_client(&mut self, evloop: &mut EventLoop, mut con: UnixStream) {
        let _ = con.set_nonblocking(false);
        let env = Self::client_env(&con);

        loop {
            match Message::read_from(&mut con) {
                Ok(Some(msg)) => match self.handle_message(evloop, &mut con, msg, &env) {
                    ClientAction::Continue => (),
                    ClientAction::Done => break,
                    ClientAction::Listen => {
                        self.add_listener(con);
                        return;
                    }
                },
                Ok(None) => break,
                Err(e) if e.kind() == ErrorKind::InvalidData => {
                    let _ = Message::fail(e.to_string()).write_to(&mut con);
                    break;
                }
                Err(_) => break,
            }
        }
    }

    fn accept_clients(&mut self, evloop: &mut EventLoop) {
        loop {
            match self.ipc.accept() {
                Ok((con, _)) => self.handle_client(evloop, con),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept: {e}");
                    break;
                }
            }
        }
    }

    fn on_timeout(&mut self, now: i64) -> i64 {
        let Some(idx) = self.active else {
            return 0;
        };

        self.feed(
            idx,
            &[KeyEvent {
                code: 0,
                pressed: false,
                timestamp: now,
            }],
            false,
        )
    }

    fn on_device(
        &mut self,
        evloop: &mut EventLoop,
        slot: usize,
        now: i64,
        mut timeout: i64,
    ) -> i64 {
        let Some(dev) = evloop.devices.get_mut(slot).and_then(Option::as_mut) else {
            return timeout;
        };

        let events = dev.read_events();
        let data = dev.data;
        let is_virtual = dev.is_virtual;

        for ev in events {
            match ev {
                DeviceEvent::Removed => {
                    if let Some(dev) = evloop.remove_device(slot) {
                        info!("DEVICE: removed {} ({})", dev.id, dev.name);
                    }
                    return timeout;
                }
                DeviceEvent::Key { code, pressed } => {
                    debug!("input {} {}", keys::key_name(code), if pressed { "down" } else { "up" });
                    self.panic_check(code, pressed);

                    if let Some(idx) = data {
                        self.active = Some(idx);
                        timeout = self.feed(
                            idx,
                            &[KeyEvent {
                                code,
                                pressed,
                                timestamp: now,
                            }],
                            true,
                        );
                        self.update_indicator(evloop, idx);
                    }
                }
                DeviceEvent::MouseMove { x, y } => {
                    if let Some(idx) = data {
                        let scroll = &mut self.keyboards[idx].scroll;
                        if scroll.active {
                            if scroll.sensitivity == 0 {
                                continue;
                            }
                            let sens = i32::from(scroll.sensitivity);

                            scroll.x += x;
                            scroll.y += y;

                            let xticks = scroll.x / sens;
                            scroll.x %= sens;
                            let yticks = scroll.y / sens;
                            scroll.y %= sens;

                            self.vkbd.mouse_scroll(xticks, -yticks);
                        } else {
                            self.vkbd.mouse_move(x, y);
                        }
                    }
                }
                DeviceEvent::MouseMoveAbs { x, y } => {
                    self.vkbd.mouse_move_abs(x, y);
                }
                DeviceEvent::MouseScroll { mut x, mut y } => {
                    let Some(idx) = data else {
                        continue;
                    };
                    self.active = Some(idx);

                    while x != 0 || y != 0 {
                        let code = if x > 0 {
                            x -= 1;
                            KEY_WHEELLEFT
                        } else if x < 0 {
                            x += 1;
                            KEY_WHEELRIGHT
                        } else if y > 0 {
                            y -= 1;
                            KEY_WHEELUP
                        } else {
                            y += 1;
                            KEY_WHEELDOWN
                        };

                        self.feed(
                            idx,
                            &[KeyEvent {
                                code,
                                pressed: true,
                                timestamp: now,
                            }],
                            false,
                        );
                        timeout = self.feed(
                            idx,
                            &[KeyEvent {
                                code,
                                pressed: false,
                                timestamp: now,
                            }],
                            false,
                        );
                    }
                }
                DeviceEvent::Led { led, on } => {
                    if is_virtual {
                        // LED state written to the virtual keyboard by the
                        // host propagates to every grabbed device, except
                        // the indicator LED which the engine owns.
                        for d in evloop.devices.iter_mut().flatten() {
                            let Some(idx) = d.data else {
                                continue;
                            };
                            if d.capabilities & CAP_LEDS == 0 {
                                continue;
                            }
                            if (led as usize) < LED_COUNT
                                && std::mem::replace(&mut d.led_state[led as usize], on) == on
                            {
                                continue;
                            }
                            if led == u16::from(self.keyboards[idx].config.layer_indicator) {
                                continue;
                            }
                            d.set_led(led, on);
                        }
                    } else if let Some(idx) = data {
                        if let Some(dev) = evloop.devices.get_mut(slot).and_then(Option::as_mut) {
                            if (led as usize) < LED_COUNT {
                                dev.led_state[led as usize] = on;
                            }
                        }
                        if led == u16::from(self.keyboards[idx].config.layer_indicator) {
                            self.update_indicator(evloop, idx);
                        }
                    }
                }
            }
        }

        timeout
    }

    pub fn run(config_dir: Option<PathBuf>) -> std::io::Result<()> {
        let ipc = ipc::create_server()?;
        let vkbd = Vkbd::uinput()?;

        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
        if unsafe { libc::nice(-20) } == -1 {
            debug!("failed to raise priority");
        }

        let mut evloop = EventLoop::new(std::os::fd::AsRawFd::as_raw_fd(&ipc))?;

        let mut daemon = Daemon {
            config_dir: config_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR)),
            vkbd,
            ipc,
            keyboards: Vec::new(),
            listeners: Vec::new(),
            keystate: Box::new([false; KEY_SPACE]),
            active: None,
            panic_keys: [false; 3],
        };

        for dev in crate::device::scan() {
            evloop.add_device(dev);
        }

        daemon.reload(&mut evloop, None);

        info!("starting remapd {}", env!("CARGO_PKG_VERSION"));

        let mut timeout = 0i64;
        let mut last = evloop.now_ms();

        loop {
            let wake = evloop.wait(timeout)?;
            let elapsed = wake.now - last;
            last = wake.now;

            if timeout > 0 && elapsed >= timeout {
                timeout = daemon.on_timeout(wake.now);
            } else if timeout > 0 {
                timeout -= elapsed;
            }

            for slot in &wake.devices {
                timeout = daemon.on_device(&mut evloop, *slot, wake.now, timeout);
            }

            if wake.hotplug {
                for dev in evloop.read_new_devices() {
                    if let Some(slot) = evloop.add_device(dev) {
                        daemon.manage_device(&mut evloop, slot);
                    }
                }
            }

            if wake.aux {
                daemon.accept_clients(&mut evloop);
            }

            daemon.vkbd.flush();
        }
    }
}

/// Opens devices read-only and prints their key activity. Used by the
/// `monitor` subcommand, no daemon required.
pub fn monitor(timestamps: bool) -> std::io::Result<()> {
    use mio::unix::SourceFd;
    use mio::{Events, Interest, Poll, Token};

    let mut devices: Vec<Device> = crate::device::scan()
        .into_iter()
        .filter(|d| !d.is_virtual)
        .collect();

    if devices.is_empty() {
        error!("no input devices found (are you in the input group?)");
        return Ok(());
    }

    let mut poll = Poll::new()?;
    for (i, dev) in devices.iter().enumerate() {
        poll.registry()
            .register(&mut SourceFd(&dev.fd()), Token(i), Interest::READABLE)?;
        println!("device: {} ({})", dev.id, dev.name);
    }

    let start = std::time::Instant::now();
    let mut events = Events::with_capacity(32);

    loop {
        poll.poll(&mut events, None)?;

        for event in events.iter() {
            let Token(i) = event.token();
            for ev in devices[i].read_events() {
                if let DeviceEvent::Key { code, pressed } = ev {
                    let name = keys::key_name(code);
                    let state = if pressed { "down" } else { "up" };
                    if timestamps {
                        let t = start.elapsed().as_millis();
                        println!("{t} {} {name} {state}", devices[i].id);
                    } else {
                        println!("{} {name} {state}", devices[i].id);
                    }
                }
            }
        }
    }
}

/// Config-dir scan used by `check`-style tooling and tests: parses every
/// config and reports whether all of them loaded.
pub fn check_configs(dir: &Path) -> bool {
    let mut ok = true;

    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !name.ends_with(".conf") || name.ends_with(".old.conf") {
                continue;
            }

            let mut config = Config::default();
            if let Err(e) = config::parse_file(&mut config, &path) {
                error!("{e}");
                ok = false;
            }
        }
    }

    ok
}
