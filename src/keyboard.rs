//! The per-device keyboard state machine.
//!
//! A keyboard consumes timestamp-ordered key events and emits output key
//! transitions through an [`Output`] sink. All timing is cooperative: the
//! engine never blocks, it returns the delay until its next deadline and is
//! driven forward by synthetic `code == 0` tick events.

use crate::config::{self, Arg, Config, ConfigBackup, Chord, Descriptor, Op, NO_LAYER};
use crate::keys::{
    self, CHORD_BASE, CHORD_SLOTS, FAKEMOD_BASE, KEY_NOOP, KEY_SPACE, MOD_COUNT, MOD_SHIFT,
};
use crate::macros;
use evdev::KeyCode;
use log::{debug, warn};

pub const CACHE_SIZE: usize = 16;
const QUEUE_SIZE: usize = 32;
const TIMEOUT_SLOTS: usize = 64;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub code: u16,
    pub pressed: bool,
    pub timestamp: i64,
}

/// A layer activation edge, one per simple layer involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerEvent<'a> {
    pub name: &'a str,
    /// `/` for the active layout, `+`/`-` for activation edges.
    pub state: char,
    /// Whether any non-layout layer remains active, for the indicator LED.
    pub indicator: bool,
}

pub trait Output {
    fn send_key(&mut self, code: u16, pressed: bool);
    fn on_layer_change(&mut self, event: &LayerEvent);
}

#[derive(Debug, Default, Clone, Copy)]
struct CacheEntry {
    code: u16,
    d: Descriptor,
    dl: i16,
    /// Layer activated by this key, retargeted by swap.
    layer: i16,
}

#[derive(Debug, Default, Clone, Copy)]
struct LayerState {
    activation_time: i64,
    active_count: i8,
    toggled: bool,
    oneshot_depth: u8,
    composite: bool,
}

impl LayerState {
    fn active(&self) -> bool {
        self.active_count > 0
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum ChordFsm {
    Resolving,
    #[default]
    Inactive,
    PendingDisambiguation,
    PendingHoldTimeout,
}

#[derive(Debug, Default)]
struct ChordResolver {
    queue: Vec<KeyEvent>,
    matched: Option<(Chord, i16)>,
    last_code_time: i64,
    state: ChordFsm,
}

#[derive(Debug, Default, Clone, Copy)]
struct ActiveChord {
    active: bool,
    chord: Chord,
    layer: i16,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PendingBehaviour {
    #[default]
    InterruptAction1,
    InterruptAction2,
    Uninterruptible,
    UninterruptibleTapAction2,
}

#[derive(Debug, Default)]
struct PendingKey {
    code: u16,
    dl: i16,
    expire: i64,
    tap_expiry: i64,
    behaviour: PendingBehaviour,
    queue: Vec<KeyEvent>,
    action1: Descriptor,
    action2: Descriptor,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Scroll {
    pub active: bool,
    pub sensitivity: i16,
    pub x: i32,
    pub y: i32,
}

/// May correspond to more than one physical input device.
pub struct Keyboard {
    pub config: Config,
    backup: Option<ConfigBackup>,

    /// Press-time descriptors, so release replays the same binding even if
    /// layers changed mid-stroke.
    cache: [CacheEntry; CACHE_SIZE],

    layout: i16,

    last_pressed_output_code: u16,
    last_pressed_code: u16,

    oneshot_latch: bool,
    inhibit_modifier_guard: bool,

    active_macro: Option<u16>,
    active_macro_layer: i16,
    macro_timeout: i64,
    macro_repeat_interval: i64,

    oneshot_timeout: i64,
    overload_start_time: i64,
    last_simple_key_time: i64,

    timeouts: Vec<i64>,

    active_chords: [ActiveChord; CHORD_SLOTS as usize],
    chord: ChordResolver,
    pending: PendingKey,

    layer_state: Vec<LayerState>,

    /// Physical key state (input side).
    capstate: Box<[bool; KEY_SPACE]>,
    /// Emitted key state (output side).
    keystate: Box<[bool; KEY_SPACE]>,

    pub scroll: Scroll,

    /// Logical clock ordering layer activations.
    tick: i64,
}

impl Keyboard {
    pub fn new(config: Config) -> Self {
        let mut kbd = Keyboard {
            config,
            backup: None,
            cache: Default::default(),
            layout: 0,
            last_pressed_output_code: 0,
            last_pressed_code: 0,
            oneshot_latch: false,
            inhibit_modifier_guard: false,
            active_macro: None,
            active_macro_layer: 0,
            macro_timeout: 0,
            macro_repeat_interval: 0,
            oneshot_timeout: 0,
            overload_start_time: 0,
            last_simple_key_time: 0,
            timeouts: Vec::with_capacity(TIMEOUT_SLOTS),
            active_chords: Default::default(),
            chord: ChordResolver::default(),
            pending: PendingKey::default(),
            layer_state: Vec::new(),
            capstate: Box::new([false; KEY_SPACE]),
            keystate: Box::new([false; KEY_SPACE]),
            scroll: Scroll::default(),
            tick: 1,
        };

        kbd.update_layer_state();
        kbd.layer_state[0].active_count = 1;
        kbd.layer_state[0].activation_time = 0;

        if !kbd.config.default_layout.is_empty()
            && kbd.config.default_layout != kbd.config.layers[0].name
        {
            match kbd
                .config
                .layers
                .iter()
                .position(|l| l.name == kbd.config.default_layout)
            {
                Some(idx) if idx > 0 => {
                    kbd.layer_state[idx].active_count = 1;
                    kbd.layer_state[idx].activation_time = 1;
                    kbd.layout = idx as i16;
                }
                _ => warn!(
                    "could not find default layout {}",
                    kbd.config.default_layout
                ),
            }
        }

        kbd
    }

    /// Resizes per-layer state after config mutation.
    pub fn update_layer_state(&mut self) {
        let n = self.config.layers.len();
        self.layer_state.resize(n, LayerState::default());
        for (state, layer) in self.layer_state.iter_mut().zip(&self.config.layers) {
            state.composite = layer.is_composite();
        }
    }

    pub fn layout(&self) -> usize {
        self.layout as usize
    }

    pub fn active_layers(&self) -> Vec<usize> {
        (1..self.layer_state.len())
            .filter(|&i| self.layer_state[i].active())
            .collect()
    }

    pub fn indicator_active(&self) -> bool {
        (1..self.layer_state.len())
            .any(|i| i != self.layout as usize && self.layer_state[i].active())
    }

    /// Takes the lazy pre-mutation snapshot used by `reset`.
    pub fn ensure_backup(&mut self) {
        if self.backup.is_none() {
            self.backup = Some(ConfigBackup::new(&self.config));
        }
    }

    pub fn has_backup(&self) -> bool {
        self.backup.is_some()
    }

    /// Evaluates a runtime expression: `reset`, `unbind_all`, or a binding
    /// `[<layer>.]<key> = <descriptor>`.
    pub fn eval(&mut self, exp: &str) -> bool {
        let exp = exp.trim();
        if exp.is_empty() {
            return true;
        }

        let ok = match exp {
            "reset" => {
                if let Some(backup) = &self.backup {
                    backup.restore(&mut self.config);
                    true
                } else {
                    false
                }
            }
            "unbind_all" => {
                for layer in &mut self.config.layers {
                    layer.chords.clear();
                    layer.keymap.clear();
                }
                true
            }
            _ => match config::add_entry_expr(&mut self.config, exp) {
                Ok(idx) => {
                    self.config.layers[idx].keymap.sort();
                    true
                }
                Err(e) => {
                    warn!("invalid binding: {e}");
                    false
                }
            },
        };

        self.update_layer_state();
        ok
    }

    fn now(&mut self) -> i64 {
        self.tick += 1;
        self.tick
    }

    fn cache_get(&mut self, code: u16) -> Option<&mut CacheEntry> {
        if code == 0 {
            return None;
        }
        self.cache.iter_mut().find(|e| e.code == code)
    }

    /// Records the descriptor chosen at press time. Fails when all slots
    /// are held, bounding concurrent keys.
    fn cache_set(&mut self, code: u16, ent: Option<CacheEntry>) -> bool {
        let slot = match self.cache.iter().position(|e| e.code == code) {
            Some(slot) => Some(slot),
            None => self.cache.iter().position(|e| e.code == 0),
        };

        let Some(slot) = slot else {
            return false;
        };

        match ent {
            Some(mut ent) => {
                ent.code = code;
                self.cache[slot] = ent;
            }
            None => self.cache[slot].code = 0,
        }

        true
    }

    fn send_key(&mut self, output: &mut dyn Output, code: u16, pressed: bool) {
        if code == KEY_NOOP {
            return;
        }
        if code as usize >= KEY_SPACE {
            warn!("send_key: invalid code {code}");
            return;
        }

        if pressed {
            self.last_pressed_output_code = code;
        }

        if self.keystate[code as usize] != pressed {
            self.keystate[code as usize] = pressed;
            output.send_key(code, pressed);
        }
    }

    fn reset_keystate(&mut self, output: &mut dyn Output) {
        for code in 0..KEY_SPACE {
            if self.keystate[code] {
                output.send_key(code as u16, false);
                self.keystate[code] = false;
            }
        }
    }

    /// Releases a modifier key. Some hosts bind solitary taps of certain
    /// modifiers (meta menus, alt accelerators); a Ctrl press interposed
    /// around the release suppresses that interpretation.
    fn clear_mod(&mut self, output: &mut dyn Output, code: u16) {
        let guard = self.last_pressed_output_code == code
            && (code == KeyCode::KEY_LEFTMETA.code()
                || code == KeyCode::KEY_LEFTALT.code()
                || code == KeyCode::KEY_RIGHTALT.code())
            && !self.inhibit_modifier_guard
            && !self.config.disable_modifier_guard;

        let ctrl = KeyCode::KEY_LEFTCTRL.code();
        if guard && !self.keystate[ctrl as usize] {
            self.send_key(output, ctrl, true);
            self.send_key(output, code, false);
            self.send_key(output, ctrl, false);
        } else {
            self.send_key(output, code, false);
        }
    }

    /// Brings the emitted modifier keys in line with `mods`, preferring
    /// keys the user physically holds over synthesized canonical ones.
    fn set_mods(&mut self, output: &mut dyn Output, mods: u8) {
        for class in 0..MOD_COUNT {
            let mask = 1u8 << class;
            let codes = self.config.modifiers[class].clone();

            if mods & mask != 0 {
                for &code in &codes {
                    let held = self.capstate[code as usize];
                    let down = self.keystate[code as usize];
                    if held && !down {
                        self.send_key(output, code, true);
                    }
                    if !held && down && Some(&code) != codes.first() {
                        self.send_key(output, code, false);
                    }
                }

                if self.keystate[(FAKEMOD_BASE as usize) + class] {
                    continue;
                }
                if codes.iter().any(|&c| self.keystate[c as usize]) {
                    continue;
                }
                if let Some(&canonical) = codes.first() {
                    self.send_key(output, canonical, true);
                }
            } else {
                self.keystate[(FAKEMOD_BASE as usize) + class] = false;
                for &code in &codes {
                    if self.keystate[code as usize] {
                        self.clear_mod(output, code);
                    }
                }
            }
        }
    }

    fn get_mods(&self) -> u8 {
        let mut mods = 0;
        for class in 0..MOD_COUNT {
            if self.layer_state[class + 1].active() {
                mods |= 1 << class;
            }
            if self.keystate[(FAKEMOD_BASE as usize) + class] {
                mods |= 1 << class;
            }
        }
        mods
    }

    /// Folds the active modifier layers (minus the classes covered by the
    /// excluded source layer) into `mods`, adds modifiers required by held
    /// key sequences, and applies their least common wildcard.
    fn update_mods(
        &mut self,
        output: &mut dyn Output,
        excl: i16,
        mut mods: u8,
        mut wildcard: u8,
        skip_code: Option<u16>,
    ) {
        if self.config.compat {
            wildcard = 0xff;
        }

        let excluded_mask = if excl >= 0 {
            self.config.layer_mods(excl as usize)
        } else {
            0
        };

        for class in 0..MOD_COUNT {
            if !self.layer_state[class + 1].active() {
                continue;
            }
            let mask = 1u8 << class;
            if excluded_mask & mask == 0 {
                mods |= mask;
            }
        }

        let mut addm = 0u8;
        for ent in &self.cache {
            if ent.code == 0 || ent.d.op != Op::KeySequence {
                continue;
            }
            if Some(ent.d.args[0].code()) == skip_code {
                continue;
            }
            let c_mods = ent.d.args[1].mods();
            let c_wildc = ent.d.args[2].mods();
            addm |= c_mods & !c_wildc;
            wildcard &= c_wildc;
        }

        self.set_mods(output, (mods & wildcard) | addm);
    }

    fn emit_layer_change(&self, output: &mut dyn Output, idx: usize, active: bool) {
        let indicator = self.indicator_active();
        let state = if idx == self.layout as usize {
            '/'
        } else if active {
            '+'
        } else {
            '-'
        };

        let layer = &self.config.layers[idx];
        if layer.is_composite() {
            for &c in &layer.constituents {
                output.on_layer_change(&LayerEvent {
                    name: &self.config.layers[c as usize].name,
                    state,
                    indicator,
                });
            }
        } else {
            output.on_layer_change(&LayerEvent {
                name: &layer.name,
                state,
                indicator,
            });
        }
    }

    /// Every activation must be paired with a deactivation; composite
    /// layers activate each constituent.
    fn activate_layer(&mut self, output: &mut dyn Output, code: u16, idx: i16) {
        if idx == 0 {
            return;
        }
        if idx < 0 {
            return self.deactivate_layer(output, -idx);
        }

        let idx = idx as usize;
        let ts = self.now();

        if self.config.layers[idx].is_composite() {
            for c in self.config.layers[idx].constituents.clone() {
                debug!("activating layer {}", self.config.layers[c as usize].name);
                let state = &mut self.layer_state[c as usize];
                state.active_count += 1;
                if state.active() {
                    state.activation_time = ts;
                }
            }
        } else {
            debug!("activating layer {}", self.config.layers[idx].name);
            let state = &mut self.layer_state[idx];
            state.active_count += 1;
            if state.active() {
                state.activation_time = ts;
            }
        }

        if let Some(ent) = self.cache_get(code) {
            ent.layer = idx as i16;
        }

        self.emit_layer_change(output, idx, true);
    }

    fn deactivate_layer(&mut self, output: &mut dyn Output, idx: i16) {
        if idx == 0 {
            return;
        }
        if idx < 0 {
            return self.activate_layer(output, 0, -idx);
        }

        let idx = idx as usize;
        if self.config.layers[idx].is_composite() {
            for c in self.config.layers[idx].constituents.clone() {
                debug!("deactivating layer {}", self.config.layers[c as usize].name);
                self.layer_state[c as usize].active_count -= 1;
            }
        } else {
            debug!("deactivating layer {}", self.config.layers[idx].name);
            self.layer_state[idx].active_count -= 1;
        }

        self.emit_layer_change(output, idx, false);
    }

    fn clear_oneshot(&mut self, output: &mut dyn Output) {
        for idx in 0..self.layer_state.len() {
            while self.layer_state[idx].oneshot_depth > 0 {
                self.deactivate_layer(output, idx as i16);
                self.layer_state[idx].oneshot_depth -= 1;
            }
        }

        self.oneshot_latch = false;
        self.oneshot_timeout = 0;
    }

    fn clear(&mut self, output: &mut dyn Output) {
        self.clear_oneshot(output);

        for idx in 1..self.layer_state.len() {
            if idx != self.layout as usize && self.layer_state[idx].toggled {
                self.layer_state[idx].toggled = false;
                self.deactivate_layer(output, idx as i16);
            }
        }

        self.active_macro = None;
        self.reset_keystate(output);
    }

    fn set_layout(&mut self, output: &mut dyn Output, idx: i16) {
        self.clear(output);

        // Switching to main just clears the occluding layout.
        if self.layout != 0 {
            self.layer_state[self.layout as usize].active_count -= 1;
        }
        if idx != 0 {
            self.layer_state[idx as usize].active_count += 1;
            self.layer_state[idx as usize].activation_time = 1;
        }
        self.layout = idx;
        self.emit_layer_change(output, idx as usize, true);
    }

    fn schedule_timeout(&mut self, deadline: i64) {
        if self.timeouts.len() < TIMEOUT_SLOTS {
            self.timeouts.push(deadline);
        }
    }

    /// Drops expired deadlines and returns the delay until the nearest
    /// remaining one, 0 when none is scheduled.
    fn main_loop_timeout(&mut self, time: i64) -> i64 {
        self.timeouts.retain(|&t| t > time);
        match self.timeouts.iter().min() {
            Some(&next) => next - time,
            None => 0,
        }
    }

    fn auto_layer(&self, code: u16) -> i16 {
        match self.config.mod_class(code) {
            Some(class) => (class + 1) as i16,
            None => 0,
        }
    }

    fn execute_macro(&mut self, output: &mut dyn Output, dl: i16, idx: u16, orig_code: u16) -> i64 {
        let mac_idx = (idx & !config::MACRO_WILDCARD_FLAG) as usize;

        // Minimize redundant modifier strokes for simple key sequences.
        if let Some((code, mods, wildc)) = self.config.macros[mac_idx].as_single_stroke() {
            let code = if code == 0 { orig_code } else { code };
            self.update_mods(output, dl, mods, wildc, None);
            self.send_key(output, code, true);
            self.send_key(output, code, false);
            return 0;
        }

        // Without a wildcard, the macro runs with all modifiers cleared.
        let wildcard = if self.config.compat || idx & config::MACRO_WILDCARD_FLAG != 0 {
            0xff
        } else {
            0
        };
        self.update_mods(output, dl, 0, wildcard, None);

        let mac = &self.config.macros[mac_idx];
        let timeout = self.config.macro_sequence_timeout.max(0) as u64;
        let slept = macros::execute(
            &mut |code, pressed| output.send_key(code, pressed),
            mac,
            timeout,
            &self.config,
        );
        (slept / 1000) as i64
    }

    fn lookup_descriptor(&self, code: u16) -> (Descriptor, i16) {
        if keys::is_chord_code(code) {
            let slot = (code - CHORD_BASE) as usize;
            return (
                self.active_chords[slot].chord.d,
                self.active_chords[slot].layer,
            );
        }

        let mods = self.get_mods();

        // The identity binding every unmatched key falls through to.
        let mut fallback = Descriptor {
            op: Op::KeySequence,
            id: code,
            mods,
            wildcard: 0,
            args: [Arg(code), Arg(u16::from(mods)), Arg(0xff)],
        };

        let mut d = Descriptor::default();
        let mut dl = 0i16;
        let mut maxts = 0i64;
        let mut max_size = 0usize;
        let mut conflicts = 0usize;
        let mut active: Vec<u16> = Vec::new();

        for i in 0..self.config.layers.len() {
            if !self.layer_state[i].active() {
                continue;
            }
            let act_ts = self.layer_state[i].activation_time;
            if i > 0 {
                active.push(i as u16);
            }
            if act_ts < maxts {
                continue;
            }
            if let Some(&m) = self.config.layers[i].keymap.get(code, mods) {
                if maxts < act_ts {
                    conflicts = 0;
                }
                maxts = act_ts;
                max_size = 1;
                // A deep-unequal hit at the same activation time is a real
                // conflict; identical actions are not.
                if conflicts == 0 || !d.deep_eq(&m, &self.config) {
                    conflicts += 1;
                }
                d = m;
                dl = i as i16;
            }
        }

        // Composite layers whose constituents are all active take
        // precedence, larger sets first.
        for i in (MOD_COUNT + 1)..self.config.layers.len() {
            if active.len() <= 1 {
                break;
            }
            if !self.layer_state[i].composite {
                continue;
            }

            let layer = &self.config.layers[i];
            let size = layer.constituents.len();
            if size > active.len() || size < max_size {
                continue;
            }
            if !layer.constituents.iter().all(|c| active.contains(c)) {
                continue;
            }

            if let Some(&m) = layer.keymap.get(code, mods) {
                if max_size < size {
                    conflicts = 0;
                }
                max_size = size;
                if conflicts == 0 || !d.deep_eq(&m, &self.config) {
                    conflicts += 1;
                }
                d = m;
                dl = i as i16;
            }
        }

        if !d.is_set() || conflicts > 1 {
            // A registered modifier key defaults to its class layer.
            if let Some(class) = self.config.mod_class(code) {
                fallback.op = Op::Layer;
                fallback.args[0] = Arg::from_idx((class + 1) as i16);
            }
            return (fallback, 0);
        }

        (d, dl)
    }

    fn do_keysequence(
        &mut self,
        output: &mut dyn Output,
        dl: i16,
        pressed: bool,
        time: i64,
        code: u16,
        mods: u8,
        wildcard: u8,
    ) {
        if pressed {
            if self.keystate[code as usize] {
                self.send_key(output, code, false);
            }

            self.update_mods(output, dl, mods, wildcard | mods, Some(code));
            self.send_key(output, code, true);
            self.clear_oneshot(output);
        } else {
            self.send_key(output, code, false);
            self.update_mods(output, -1, 0, 0xff, None);
        }

        if mods == 0 || mods == 1 << MOD_SHIFT {
            self.last_simple_key_time = time;
        }
    }

    fn process_descriptor(
        &mut self,
        output: &mut dyn Output,
        code: u16,
        d: &Descriptor,
        dl: i16,
        pressed: bool,
        time: i64,
    ) {
        // The macro-carrying ops first fire their macro; a single plain
        // stroke behaves like a key sequence so it gets proper release
        // semantics.
        match d.op {
            Op::ClearM | Op::LayerM | Op::OneshotM | Op::ToggleM | Op::OverloadM => {
                if d.op == Op::ClearM && pressed {
                    self.clear(output);
                }

                let macro_arg = d.args[usize::from(d.op != Op::ClearM)];
                let mac_idx = macro_arg.macro_idx();

                if let Some((seq_code, mods, wildc)) =
                    self.config.macros[mac_idx].as_single_seq().filter(|_| !self.config.compat)
                {
                    let new_code = if seq_code == 0 { code } else { seq_code };
                    self.do_keysequence(output, dl, pressed, time, new_code, mods, wildc);
                } else if pressed {
                    self.execute_macro(output, dl, macro_arg.code(), code);
                }
            }
            _ => (),
        }

        match d.op {
            Op::KeySequence => {
                let new_code = match d.args[0].code() {
                    0 => code,
                    c => c,
                };
                self.do_keysequence(
                    output,
                    dl,
                    pressed,
                    time,
                    new_code,
                    d.args[1].mods(),
                    d.args[2].mods(),
                );
            }
            Op::Scroll => {
                self.scroll.sensitivity = d.args[0].sensitivity();
                self.scroll.active = pressed;
            }
            Op::ScrollToggle => {
                self.scroll.sensitivity = d.args[0].sensitivity();
                if pressed {
                    self.scroll.active = !self.scroll.active;
                }
            }
            Op::OverloadIdleTimeout => {
                if pressed {
                    let idle_ms = i64::from(d.args[2].timeout());
                    let arg = if time - self.last_simple_key_time >= idle_ms {
                        d.args[1]
                    } else {
                        d.args[0]
                    };
                    let action = self.config.descriptors[arg.0 as usize];

                    self.process_descriptor(output, code, &action, dl, true, time);
                    if let Some(ent) = self.cache_get(code) {
                        ent.d = action;
                    }
                }
            }
            Op::OverloadTimeout | Op::OverloadTimeoutTap => {
                if pressed {
                    self.pending = PendingKey {
                        code,
                        dl,
                        expire: time + i64::from(d.args[2].timeout()),
                        tap_expiry: 0,
                        behaviour: if d.op == Op::OverloadTimeoutTap {
                            PendingBehaviour::UninterruptibleTapAction2
                        } else {
                            PendingBehaviour::Uninterruptible
                        },
                        queue: Vec::new(),
                        action1: self.config.descriptors[d.args[1].0 as usize],
                        action2: Descriptor {
                            op: Op::Layer,
                            id: code,
                            mods: 0,
                            wildcard: 0,
                            args: [Arg::from_idx(d.args[0].idx()), Arg(0), Arg(0)],
                        },
                    };
                    self.schedule_timeout(self.pending.expire);
                }
            }
            Op::Layout => {
                let idx = d.args[0].idx();
                if idx >= 0 && pressed {
                    self.set_layout(output, idx);
                }
            }
            Op::Layer | Op::LayerM => {
                let mut idx = d.args[0].idx();
                if idx == NO_LAYER {
                    idx = 0;
                } else if idx == 0 {
                    idx = self.auto_layer(code);
                }

                if pressed {
                    self.activate_layer(output, code, idx);
                } else {
                    self.deactivate_layer(output, idx);
                }

                if self.last_pressed_code == code {
                    self.inhibit_modifier_guard = true;
                    self.update_mods(output, -1, 0, 0xff, None);
                    self.inhibit_modifier_guard = false;
                } else {
                    self.update_mods(output, -1, 0, 0xff, None);
                }
            }
            Op::Clear => {
                if pressed {
                    self.clear(output);
                }
            }
            Op::ClearM => (),
            Op::Overload | Op::OverloadM => {
                let mut idx = d.args[0].idx();
                let action_arg = d.args[if d.op == Op::OverloadM { 2 } else { 1 }];
                if idx == NO_LAYER {
                    idx = 0;
                } else if idx == 0 {
                    idx = self.auto_layer(code);
                }

                if pressed {
                    self.overload_start_time = time;
                    self.activate_layer(output, code, idx);
                    self.update_mods(output, -1, 0, 0xff, None);
                } else {
                    self.deactivate_layer(output, idx);
                    self.update_mods(output, -1, 0, 0xff, None);

                    let tap_timeout = self.config.overload_tap_timeout;
                    if self.last_pressed_code == code
                        && (tap_timeout == 0 || time - self.overload_start_time < tap_timeout)
                    {
                        let action = self.config.descriptors[action_arg.0 as usize];
                        if action.op == Op::Macro {
                            // Macro release relies on event logic; a
                            // synthesized descriptor release won't do.
                            self.execute_macro(output, dl, action.args[0].code(), code);
                        } else {
                            self.process_descriptor(output, code, &action, dl, true, time);
                            self.process_descriptor(output, code, &action, dl, false, time);
                        }
                    }
                }
            }
            Op::Oneshot | Op::OneshotM => {
                let mut idx = d.args[0].idx();
                if idx >= 0 {
                    if idx == 0 {
                        idx = self.auto_layer(code);
                    }

                    if pressed {
                        self.activate_layer(output, code, idx);
                        self.update_mods(output, dl, 0, 0xff, None);
                        self.oneshot_latch = true;
                    } else if self.oneshot_latch {
                        self.layer_state[idx as usize].oneshot_depth += 1;
                        if self.config.oneshot_timeout > 0 {
                            self.oneshot_timeout = time + self.config.oneshot_timeout;
                            self.schedule_timeout(self.oneshot_timeout);
                        }
                    } else {
                        self.deactivate_layer(output, idx);
                        self.update_mods(output, -1, 0, 0xff, None);
                    }
                }
            }
            Op::Macro | Op::Macro2 => {
                if pressed {
                    let (macro_idx, mut timeout, repeat) = if d.op == Op::Macro2 {
                        (
                            d.args[2].code(),
                            i64::from(d.args[0].timeout()),
                            i64::from(d.args[1].timeout()),
                        )
                    } else {
                        (
                            d.args[0].code(),
                            self.config.macro_timeout,
                            self.config.macro_repeat_timeout,
                        )
                    };
                    self.macro_repeat_interval = repeat;

                    self.clear_oneshot(output);

                    timeout += self.execute_macro(output, dl, macro_idx, code);
                    self.active_macro = Some(macro_idx);
                    self.active_macro_layer = dl;

                    self.macro_timeout = time + timeout;
                    self.schedule_timeout(self.macro_timeout);
                }
            }
            Op::Toggle | Op::ToggleM if d.args[0].idx() == NO_LAYER => (),
            Op::Toggle | Op::ToggleM => {
                let arg_idx = d.args[0].idx();
                let idx = if arg_idx == 0 {
                    self.auto_layer(code)
                } else {
                    arg_idx.abs()
                };

                if pressed {
                    let was_toggled = self.layer_state[idx as usize].toggled;
                    // A negative argument only ever forces the layer off.
                    self.layer_state[idx as usize].toggled = arg_idx >= 0 && !was_toggled;

                    if self.layer_state[idx as usize].toggled {
                        self.activate_layer(output, code, idx);
                    } else if was_toggled {
                        self.deactivate_layer(output, idx);
                    }

                    self.update_mods(output, -1, 0, 0xff, None);
                    self.clear_oneshot(output);
                }
            }
            Op::Timeout => {
                if pressed {
                    self.pending = PendingKey {
                        code,
                        dl,
                        expire: time + i64::from(d.args[1].timeout()),
                        tap_expiry: 0,
                        behaviour: PendingBehaviour::InterruptAction1,
                        queue: Vec::new(),
                        action1: self.config.descriptors[d.args[0].0 as usize],
                        action2: self.config.descriptors[d.args[2].0 as usize],
                    };
                    self.schedule_timeout(self.pending.expire);
                }
            }
            Op::Swap | Op::SwapM if d.args[0].idx() < 0 => (),
            Op::Swap | Op::SwapM => {
                let mut idx = d.args[0].idx();
                if idx == 0 {
                    idx = self.auto_layer(code);
                }

                if pressed {
                    if self.layer_state[dl as usize].toggled {
                        self.deactivate_layer(output, dl);
                        self.layer_state[dl as usize].toggled = false;

                        self.activate_layer(output, 0, idx);
                        self.layer_state[idx as usize].toggled = true;
                        self.update_mods(output, -1, 0, 0xff, None);
                    } else if self.layer_state[dl as usize].oneshot_depth > 0 {
                        self.deactivate_layer(output, dl);
                        self.layer_state[dl as usize].oneshot_depth -= 1;

                        self.activate_layer(output, 0, idx);
                        self.layer_state[idx as usize].oneshot_depth += 1;
                        self.update_mods(output, -1, 0, 0xff, None);
                    } else {
                        // Retarget the cache entry holding the source layer
                        // so its release deactivates the new layer.
                        let slot = self.cache.iter().position(|e| {
                            e.code != 0 && e.layer == dl && e.layer != self.layout && e.layer != 0
                        });

                        if let Some(slot) = slot {
                            self.cache[slot].d.op = Op::Layer;
                            self.cache[slot].d.args[0] = Arg::from_idx(idx);
                            let swap_code = self.cache[slot].code;

                            self.deactivate_layer(output, dl);
                            self.activate_layer(output, swap_code, idx);

                            self.update_mods(output, -1, 0, 0xff, None);
                        }
                    }

                    if d.op == Op::SwapM {
                        self.execute_macro(output, dl, d.args[1].code(), code);
                    }
                } else if d.op == Op::SwapM {
                    let mac_idx = d.args[1].macro_idx();
                    if let Some((seq_code, _, _)) = self.config.macros[mac_idx].as_single_stroke()
                    {
                        self.send_key(output, seq_code, false);
                        self.update_mods(output, -1, 0, 0xff, None);
                    }
                }
            }
            Op::Null => (),
        }

        if pressed {
            self.last_pressed_code = code;
        }
    }

    fn chord_event_match(chord: &Chord, events: &[KeyEvent]) -> u8 {
        let mut matched = 0;
        let mut pressed = 0;

        for ev in events {
            if !ev.pressed {
                continue;
            }
            pressed += 1;
            if chord.keys.contains(&ev.code) {
                matched += 1;
            } else {
                return 0;
            }
        }

        if pressed == 0 {
            0
        } else if matched == chord.key_count() {
            2
        } else {
            1
        }
    }

    /// Scans the active layers for chords covering the queued presses.
    /// Returns 0 for no match, 1 partial, 2 unambiguous full match,
    /// 3 full match that a longer chord could still override.
    fn check_chord_match(&self) -> (u8, Option<(Chord, i16)>) {
        let mut full: Option<(Chord, i16)> = None;
        let mut partial = false;
        let mut maxts = -1i64;

        for idx in 0..self.config.layers.len() {
            let state = &self.layer_state[idx];
            if !state.composite && !state.active() {
                continue;
            }
            if state.composite {
                let all_active = self.config.layers[idx]
                    .constituents
                    .iter()
                    .all(|&c| self.layer_state[c as usize].active());
                if !all_active {
                    continue;
                }
            }

            for chord in &self.config.layers[idx].chords {
                match Self::chord_event_match(chord, &self.chord.queue) {
                    2 if maxts <= state.activation_time => {
                        full = Some((*chord, idx as i16));
                        maxts = state.activation_time;
                    }
                    1 => partial = true,
                    _ => (),
                }
            }
        }

        match (full, partial) {
            (Some(m), true) => (3, Some(m)),
            (Some(m), false) => (2, Some(m)),
            (None, true) => (1, None),
            (None, false) => (0, None),
        }
    }

    fn resolve_chord(&mut self, output: &mut dyn Output) -> bool {
        let mut queue_offset = 0;

        self.chord.state = ChordFsm::Resolving;

        if let Some((chord, layer)) = self.chord.matched.take() {
            let slot = self.active_chords.iter().position(|ac| !ac.active);

            if let Some(slot) = slot {
                self.active_chords[slot] = ActiveChord {
                    active: true,
                    chord,
                    layer,
                };
                queue_offset = chord.key_count();
                let code = CHORD_BASE + slot as u16;
                self.process_event(output, code, true, self.chord.last_code_time);
            }
        }

        let rest: Vec<KeyEvent> = self.chord.queue[queue_offset.min(self.chord.queue.len())..]
            .to_vec();
        self.process_events_internal(output, &rest, false);
        self.chord.state = ChordFsm::Inactive;
        true
    }

    fn abort_chord(&mut self, output: &mut dyn Output) -> bool {
        self.chord.matched = None;
        self.resolve_chord(output)
    }

    fn enqueue_chord_event(&mut self, code: u16, pressed: bool, time: i64) {
        if code != 0 && self.chord.queue.len() < QUEUE_SIZE {
            self.chord.queue.push(KeyEvent {
                code,
                pressed,
                timestamp: time,
            });
        }
    }

    fn handle_chord(&mut self, output: &mut dyn Output, code: u16, pressed: bool, time: i64) -> bool {
        let interkey_timeout = self.config.chord_interkey_timeout;
        let hold_timeout = self.config.chord_hold_timeout;

        // Releases of active chord members resolve against the chord, not
        // the individual keys.
        if code != 0 && !pressed {
            for slot in 0..self.active_chords.len() {
                if !self.active_chords[slot].active {
                    continue;
                }

                let mut found = false;
                let mut remaining = 0;
                for key in &mut self.active_chords[slot].chord.keys {
                    if *key == code {
                        *key = 0;
                        found = true;
                    }
                    if *key != 0 {
                        remaining += 1;
                    }
                }

                if found {
                    if remaining == 0 {
                        self.active_chords[slot].active = false;
                        self.process_event(output, CHORD_BASE + slot as u16, false, time);
                    }
                    return true;
                }
            }
        }

        match self.chord.state {
            ChordFsm::Resolving => false,
            ChordFsm::Inactive => {
                self.chord.queue.clear();
                self.chord.matched = None;

                self.enqueue_chord_event(code, pressed, time);
                let (status, matched) = self.check_chord_match();
                self.chord.matched = matched;

                match status {
                    0 => false,
                    1 | 3 => {
                        self.chord.state = ChordFsm::PendingDisambiguation;
                        self.chord.last_code_time = time;
                        self.schedule_timeout(time + interkey_timeout);
                        true
                    }
                    _ => {
                        self.chord.last_code_time = time;
                        if hold_timeout > 0 {
                            self.chord.state = ChordFsm::PendingHoldTimeout;
                            self.schedule_timeout(time + hold_timeout);
                            true
                        } else {
                            self.resolve_chord(output)
                        }
                    }
                }
            }
            ChordFsm::PendingDisambiguation => {
                if code == 0 {
                    if time - self.chord.last_code_time >= interkey_timeout {
                        if self.chord.matched.is_some() {
                            let timeleft = hold_timeout - interkey_timeout;
                            if timeleft > 0 {
                                self.schedule_timeout(time + timeleft);
                                self.chord.state = ChordFsm::PendingHoldTimeout;
                                return true;
                            }
                            return self.resolve_chord(output);
                        }
                        return self.abort_chord(output);
                    }
                    return false;
                }

                self.enqueue_chord_event(code, pressed, time);

                if !pressed {
                    return self.abort_chord(output);
                }

                let (status, matched) = self.check_chord_match();
                self.chord.matched = matched;

                match status {
                    0 => self.abort_chord(output),
                    1 | 3 => {
                        self.chord.last_code_time = time;
                        self.chord.state = ChordFsm::PendingDisambiguation;
                        self.schedule_timeout(time + interkey_timeout);
                        true
                    }
                    _ => {
                        self.chord.last_code_time = time;
                        if hold_timeout > 0 {
                            self.chord.state = ChordFsm::PendingHoldTimeout;
                            self.schedule_timeout(time + hold_timeout);
                            true
                        } else {
                            self.resolve_chord(output)
                        }
                    }
                }
            }
            ChordFsm::PendingHoldTimeout => {
                if code == 0 {
                    if time - self.chord.last_code_time >= hold_timeout {
                        return self.resolve_chord(output);
                    }
                    return false;
                }

                self.enqueue_chord_event(code, pressed, time);

                if !pressed {
                    let in_match = self
                        .chord
                        .matched
                        .as_ref()
                        .is_some_and(|(chord, _)| chord.keys.contains(&code));
                    if in_match {
                        return self.abort_chord(output);
                    }
                }

                true
            }
        }
    }

    fn handle_pending_key(
        &mut self,
        output: &mut dyn Output,
        code: u16,
        pressed: bool,
        time: i64,
    ) -> bool {
        if self.pending.code == 0 {
            return false;
        }

        if code != 0 {
            if !pressed {
                let queued = self.pending.queue.iter().any(|ev| ev.code == code);

                // Key-up events for keys struck before the pending key
                // propagate through the normal path.
                if !queued && code != self.pending.code {
                    return false;
                }
            }

            if self.pending.queue.len() < QUEUE_SIZE {
                self.pending.queue.push(KeyEvent {
                    code,
                    pressed,
                    timestamp: time,
                });
            }
        }

        let mut action: Option<Descriptor> = None;

        if time >= self.pending.expire {
            action = Some(self.pending.action2);
        } else if code == self.pending.code {
            if self.pending.tap_expiry != 0 && time >= self.pending.tap_expiry {
                action = Some(Descriptor {
                    op: Op::KeySequence,
                    id: code,
                    mods: 0,
                    wildcard: 0,
                    args: [Arg(KEY_NOOP), Arg(0), Arg(0)],
                });
            } else {
                action = Some(self.pending.action1);
            }
        } else if code != 0 && pressed {
            match self.pending.behaviour {
                PendingBehaviour::InterruptAction1 => action = Some(self.pending.action1),
                PendingBehaviour::InterruptAction2 => action = Some(self.pending.action2),
                _ => (),
            }
        } else if self.pending.behaviour == PendingBehaviour::UninterruptibleTapAction2
            && !pressed
            && self.pending.queue.iter().any(|ev| ev.code == code)
        {
            action = Some(self.pending.action2);
        }

        if let Some(action) = action {
            let queue = std::mem::take(&mut self.pending.queue);
            let pending_code = self.pending.code;
            let dl = self.pending.dl;

            self.pending.code = 0;
            self.pending.tap_expiry = 0;

            self.cache_set(
                pending_code,
                Some(CacheEntry {
                    code: 0,
                    d: action,
                    dl,
                    layer: 0,
                }),
            );
            self.process_descriptor(output, pending_code, &action, dl, true, time);

            // Flush events queued while the key was ambiguous.
            self.process_events_internal(output, &queue, false);
        }

        true
    }

    /// `code` may be 0 for a timeout tick. Returns the delay before the
    /// next required invocation, 0 when no deadline is pending.
    fn process_event(&mut self, output: &mut dyn Output, code: u16, pressed: bool, time: i64) -> i64 {
        if self.handle_chord(output, code, pressed, time) {
            return self.main_loop_timeout(time);
        }

        if self.handle_pending_key(output, code, pressed, time) {
            return self.main_loop_timeout(time);
        }

        if self.oneshot_timeout > 0 && time >= self.oneshot_timeout {
            self.clear_oneshot(output);
            self.update_mods(output, -1, 0, 0xff, None);
        }

        if let Some(active) = self.active_macro {
            if code != 0 {
                self.active_macro = None;
                self.update_mods(output, -1, 0, 0xff, None);
            } else if time >= self.macro_timeout {
                let add = self.execute_macro(output, self.active_macro_layer, active, code);
                self.macro_timeout = add + time + self.macro_repeat_interval;
                self.schedule_timeout(self.macro_timeout);
            }
        }

        if code != 0 {
            let (d, dl);

            if pressed {
                // Guard against successive key-down events of the same
                // code, e.g. two devices mapped to one config.
                if self.cache_get(code).is_some() {
                    return self.main_loop_timeout(time);
                }

                (d, dl) = self.lookup_descriptor(code);

                let ok = self.cache_set(
                    code,
                    Some(CacheEntry {
                        code: 0,
                        d,
                        dl,
                        layer: 0,
                    }),
                );
                if !ok {
                    return self.main_loop_timeout(time);
                }
            } else {
                let Some(ent) = self.cache_get(code) else {
                    return self.main_loop_timeout(time);
                };
                d = ent.d;
                dl = ent.dl;
                self.cache_set(code, None);
            }

            self.process_descriptor(output, code, &d, dl, pressed, time);
        }

        self.main_loop_timeout(time)
    }

    fn process_events_internal(
        &mut self,
        output: &mut dyn Output,
        events: &[KeyEvent],
        real: bool,
    ) -> i64 {
        let mut timeout = 0i64;
        let mut timeout_ts = 0i64;
        let mut i = 0;

        while i != events.len() {
            let ev = events[i];
            if real {
                self.capstate[ev.code as usize] = ev.pressed;
            }

            // Interleave expired deadlines as synthetic ticks so state
            // machines advance even between real events.
            if timeout > 0 && timeout_ts <= ev.timestamp {
                timeout = self.process_event(output, 0, false, timeout_ts);
                timeout_ts += timeout;
            } else {
                timeout = self.process_event(output, ev.code, ev.pressed, ev.timestamp);
                timeout_ts = ev.timestamp + timeout;
                i += 1;
            }
        }

        timeout
    }

    /// Feeds a batch of events; `real` marks events that came from a
    /// physical device and should update physical key state.
    pub fn process_events(&mut self, output: &mut dyn Output, events: &[KeyEvent], real: bool) -> i64 {
        debug_assert!(self.config.finalized);
        self.process_events_internal(output, events, real)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use evdev::KeyCode;

    #[derive(Default)]
    pub struct Recorder {
        pub keys: Vec<(u16, bool)>,
        pub layers: Vec<(String, char)>,
    }

    impl Output for Recorder {
        fn send_key(&mut self, code: u16, pressed: bool) {
            self.keys.push((code, pressed));
        }

        fn on_layer_change(&mut self, event: &LayerEvent) {
            self.layers.push((event.name.to_owned(), event.state));
        }
    }

    pub fn keyboard(content: &str) -> Keyboard {
        let mut config = Config::default();
        config::parse_string(&mut config, content).unwrap();
        config.finalize();
        Keyboard::new(config)
    }

    pub fn press(code: KeyCode, t: i64) -> KeyEvent {
        KeyEvent {
            code: code.code(),
            pressed: true,
            timestamp: t,
        }
    }

    pub fn release(code: KeyCode, t: i64) -> KeyEvent {
        KeyEvent {
            code: code.code(),
            pressed: false,
            timestamp: t,
        }
    }

    #[test]
    fn cache_press_release_symmetry() {
        let mut kbd = keyboard("[main]\na = b\n");
        let mut out = Recorder::default();

        kbd.process_events(
            &mut out,
            &[press(KeyCode::KEY_A, 0), release(KeyCode::KEY_A, 5)],
            true,
        );

        let b = KeyCode::KEY_B.code();
        assert_eq!(out.keys, vec![(b, true), (b, false)]);
        assert!(kbd.cache.iter().all(|e| e.code == 0));
    }

    #[test]
    fn release_uses_press_time_binding() {
        // The binding for `a` changes mid-stroke; the release must still
        // match the press.
        let mut kbd = keyboard("[main]\na = b\ncapslock = layer(nav)\n\n[nav]\na = c\n");
        let mut out = Recorder::default();

        kbd.process_events(
            &mut out,
            &[
                press(KeyCode::KEY_A, 0),
                press(KeyCode::KEY_CAPSLOCK, 5),
                release(KeyCode::KEY_A, 10),
                release(KeyCode::KEY_CAPSLOCK, 15),
            ],
            true,
        );

        let b = KeyCode::KEY_B.code();
        assert_eq!(out.keys, vec![(b, true), (b, false)]);
    }

    #[test]
    fn layer_counts_never_go_negative() {
        let mut kbd = keyboard("[main]\ncapslock = layer(nav)\n\n[nav]\nh = left\n");
        let mut out = Recorder::default();

        for _ in 0..3 {
            kbd.process_events(
                &mut out,
                &[
                    press(KeyCode::KEY_CAPSLOCK, 0),
                    release(KeyCode::KEY_CAPSLOCK, 5),
                ],
                true,
            );
        }

        assert!(kbd.layer_state.iter().all(|s| s.active_count >= 0));
        assert!(!kbd.layer_state[kbd.config.layer_names["nav"]].active());
    }

    #[test]
    fn repeated_key_down_is_ignored() {
        let mut kbd = keyboard("[main]\na = b\n");
        let mut out = Recorder::default();

        kbd.process_events(
            &mut out,
            &[
                press(KeyCode::KEY_A, 0),
                press(KeyCode::KEY_A, 1),
                release(KeyCode::KEY_A, 5),
            ],
            true,
        );

        let b = KeyCode::KEY_B.code();
        assert_eq!(out.keys, vec![(b, true), (b, false)]);
    }

    #[test]
    fn modifier_fallback_activates_class_layer() {
        let mut kbd = keyboard("[main]\na = b\n");
        let mut out = Recorder::default();

        kbd.process_events(&mut out, &[press(KeyCode::KEY_LEFTSHIFT, 0)], true);

        assert!(kbd.layer_state[1 + keys::MOD_SHIFT].active());
        assert_eq!(out.layers, vec![("shift".to_owned(), '+')]);

        kbd.process_events(&mut out, &[release(KeyCode::KEY_LEFTSHIFT, 5)], true);
        assert!(!kbd.layer_state[1 + keys::MOD_SHIFT].active());
    }

    #[test]
    fn eval_reset_restores_bindings() {
        let mut kbd = keyboard("[main]\na = b\n");
        let mut out = Recorder::default();

        kbd.ensure_backup();
        assert!(kbd.eval("a = c"));

        kbd.process_events(
            &mut out,
            &[press(KeyCode::KEY_A, 0), release(KeyCode::KEY_A, 5)],
            true,
        );
        assert_eq!(out.keys[0].0, KeyCode::KEY_C.code());

        assert!(kbd.eval("reset"));
        out.keys.clear();
        kbd.process_events(
            &mut out,
            &[press(KeyCode::KEY_A, 10), release(KeyCode::KEY_A, 15)],
            true,
        );
        assert_eq!(out.keys[0].0, KeyCode::KEY_B.code());
    }

    #[test]
    fn eval_unbind_all() {
        let mut kbd = keyboard("[main]\na = b\nj+k = esc\n");
        assert!(kbd.eval("unbind_all"));

        let mut out = Recorder::default();
        kbd.process_events(
            &mut out,
            &[press(KeyCode::KEY_A, 0), release(KeyCode::KEY_A, 5)],
            true,
        );
        assert_eq!(out.keys[0].0, KeyCode::KEY_A.code());
    }

    #[test]
    fn composite_layer_match_wins() {
        let mut kbd = keyboard(
            "[main]\ncapslock = layer(nav)\nspace = layer(num)\n\n\
             [nav]\nh = left\n\n[num]\nh = 1\n\n[nav+num]\nh = esc\n",
        );
        let mut out = Recorder::default();

        kbd.process_events(
            &mut out,
            &[
                press(KeyCode::KEY_CAPSLOCK, 0),
                press(KeyCode::KEY_SPACE, 5),
                press(KeyCode::KEY_H, 10),
                release(KeyCode::KEY_H, 15),
            ],
            true,
        );

        let esc = KeyCode::KEY_ESC.code();
        assert!(out.keys.contains(&(esc, true)));
    }
}
