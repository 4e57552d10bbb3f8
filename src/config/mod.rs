//! The configuration model: descriptors, layers, chords, macros, aliases,
//! commands and device-id rules, plus snapshot/restore for runtime binds.

pub mod ini;
mod parse;

pub use parse::{add_entry, add_entry_expr, parse as parse_file, parse_string};

use crate::keys::MOD_COUNT;
use crate::macros::Macro;
use evdev::KeyCode;
use log::debug;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::Arc;

pub const MAX_DESCRIPTOR_ARGS: usize = 3;

/// Device-id rule flags.
pub const ID_EXCLUDED: u8 = 1;
pub const ID_MOUSE: u8 = 2;
pub const ID_KEYBOARD: u8 = 4;
pub const ID_ABS_PTR: u8 = 8;

/// Device capability bits, shared with the device layer.
pub const CAP_KEYBOARD: u8 = 1;
pub const CAP_MOUSE: u8 = 2;
pub const CAP_MOUSE_ABS: u8 = 4;
pub const CAP_LEDS: u8 = 8;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    #[default]
    Null,
    KeySequence,
    Oneshot,
    OneshotM,
    LayerM,
    Swap,
    SwapM,
    Layer,
    Layout,
    Clear,
    ClearM,
    Overload,
    OverloadM,
    OverloadTimeout,
    OverloadTimeoutTap,
    OverloadIdleTimeout,
    Toggle,
    ToggleM,
    Macro,
    Macro2,
    Timeout,
    ScrollToggle,
    Scroll,
}

/// One 16-bit descriptor argument, read according to the descriptor's op.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Arg(pub u16);

/// Bit flagging a macro-index argument whose macro carried a wildcard.
pub const MACRO_WILDCARD_FLAG: u16 = 0x8000;

/// Sentinel layer index meaning "no layer".
pub const NO_LAYER: i16 = i16::MIN;

impl Arg {
    pub fn code(self) -> u16 {
        self.0
    }

    pub fn mods(self) -> u8 {
        self.0 as u8
    }

    pub fn idx(self) -> i16 {
        self.0 as i16
    }

    pub fn timeout(self) -> u16 {
        self.0
    }

    pub fn sensitivity(self) -> i16 {
        self.0 as i16
    }

    pub fn macro_idx(self) -> usize {
        usize::from(self.0 & !MACRO_WILDCARD_FLAG)
    }

    pub fn macro_wildcard(self) -> bool {
        self.0 & MACRO_WILDCARD_FLAG != 0
    }

    pub fn from_idx(idx: i16) -> Self {
        Arg(idx as u16)
    }
}

/// A single remap action: the key it triggers on, the modifier pattern it
/// requires, and the op-specific arguments.
#[derive(Debug, Default, Clone, Copy)]
pub struct Descriptor {
    pub op: Op,
    pub id: u16,
    pub mods: u8,
    pub wildcard: u8,
    pub args: [Arg; MAX_DESCRIPTOR_ARGS],
}

/// Identity is the binding pattern, not the action arguments.
impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        self.op == other.op
            && self.id == other.id
            && self.mods == other.mods
            && self.wildcard == other.wildcard
    }
}

impl Eq for Descriptor {}

#[derive(Clone, Copy)]
enum ArgKind {
    Raw,
    Macro,
    Descriptor,
}

fn arg_kinds(op: Op) -> [Option<ArgKind>; MAX_DESCRIPTOR_ARGS] {
    const RAW: Option<ArgKind> = Some(ArgKind::Raw);
    const MAC: Option<ArgKind> = Some(ArgKind::Macro);
    const DESC: Option<ArgKind> = Some(ArgKind::Descriptor);

    match op {
        Op::Null | Op::Clear => [None, None, None],
        Op::KeySequence => [RAW, RAW, RAW],
        Op::Layer | Op::Oneshot | Op::Swap | Op::Toggle | Op::Layout => [RAW, None, None],
        Op::ClearM | Op::Macro => [MAC, None, None],
        Op::LayerM | Op::OneshotM | Op::SwapM | Op::ToggleM => [RAW, MAC, None],
        Op::Overload => [RAW, DESC, None],
        Op::OverloadM => [RAW, MAC, DESC],
        Op::OverloadTimeout | Op::OverloadTimeoutTap => [RAW, DESC, RAW],
        Op::OverloadIdleTimeout => [DESC, DESC, RAW],
        Op::Timeout => [DESC, RAW, DESC],
        Op::Macro2 => [RAW, RAW, MAC],
        Op::Scroll | Op::ScrollToggle => [RAW, None, None],
    }
}

impl Descriptor {
    pub fn is_set(&self) -> bool {
        self.op != Op::Null
    }

    /// Structural comparison: walks the args with knowledge of the op's
    /// arity and follows macro and descriptor references.
    pub fn deep_eq(&self, other: &Descriptor, config: &Config) -> bool {
        if self != other {
            return false;
        }

        for (i, kind) in arg_kinds(self.op).into_iter().enumerate() {
            let (a, b) = (self.args[i], other.args[i]);

            match kind {
                None => (),
                Some(ArgKind::Raw) => {
                    if a != b {
                        return false;
                    }
                }
                Some(ArgKind::Macro) => {
                    if a.macro_wildcard() != b.macro_wildcard() {
                        return false;
                    }
                    match (config.macros.get(a.macro_idx()), config.macros.get(b.macro_idx())) {
                        (Some(ma), Some(mb)) if ma == mb => (),
                        _ => return false,
                    }
                }
                Some(ArgKind::Descriptor) => {
                    match (
                        config.descriptors.get(a.0 as usize),
                        config.descriptors.get(b.0 as usize),
                    ) {
                        (Some(da), Some(db)) if da.deep_eq(db, config) => (),
                        _ => return false,
                    }
                }
            }
        }

        true
    }
}

/// Flat per-layer keymap, sorted for range lookup by trigger code.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DescriptorMap {
    entries: Vec<Descriptor>,
}

impl DescriptorMap {
    pub fn sort(&mut self) {
        self.entries.sort_by_key(|d| {
            (
                d.id,
                d.mods.count_ones(),
                d.mods,
                d.wildcard.count_ones(),
                d.wildcard,
            )
        });
    }

    /// Inserts `d`, replacing any existing entry with the same
    /// `(id, mods, wildcard)` pattern.
    pub fn set(&mut self, d: Descriptor) {
        if let Some(slot) = self
            .entries
            .iter_mut()
            .find(|e| e.id == d.id && e.mods == d.mods && e.wildcard == d.wildcard)
        {
            *slot = d;
            return;
        }

        if d.is_set() {
            self.entries.push(d);
        }
    }

    /// Looks up the binding for `id` under the current modifier set: exact
    /// matches first, then wildcard-covered ones in specificity order.
    pub fn get(&self, id: u16, mods: u8) -> Option<&Descriptor> {
        let start = self.entries.partition_point(|e| e.id < id);
        let range = self.entries[start..]
            .iter()
            .take_while(move |e| e.id == id);

        for e in range.clone() {
            if e.wildcard == 0 && e.mods == mods {
                return Some(e);
            }
        }

        for e in range {
            if e.wildcard != 0 && (e.mods | e.wildcard) & mods == mods {
                return Some(e);
            }
        }

        None
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Descriptor> {
        self.entries.iter()
    }
}

pub const MAX_CHORD_KEYS: usize = 8;

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Chord {
    pub keys: [u16; MAX_CHORD_KEYS],
    pub d: Descriptor,
}

impl Chord {
    pub fn key_count(&self) -> usize {
        self.keys.iter().filter(|&&k| k != 0).count()
    }
}

/// A named remap table. Composite layers have an empty name and carry the
/// sorted set of simple layers whose joint activation they match.
#[derive(Debug, Default, Clone)]
pub struct Layer {
    pub name: String,
    pub keymap: DescriptorMap,
    pub chords: Vec<Chord>,
    pub constituents: Vec<u16>,
}

impl Layer {
    fn named(name: &str) -> Self {
        Layer {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn is_composite(&self) -> bool {
        !self.constituents.is_empty()
    }
}

/// Snapshot of a client environment, attached to commands parsed on its
/// behalf. The buffer holds NUL-separated `KEY=VALUE` entries.
#[derive(Debug, PartialEq, Eq)]
pub struct EnvPack {
    buf: Vec<u8>,
    pub uid: u32,
    pub gid: u32,
}

impl EnvPack {
    pub fn new(buf: Vec<u8>, uid: u32, gid: u32) -> Self {
        EnvPack { buf, uid, gid }
    }

    pub fn vars(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.buf
            .split(|&b| b == 0)
            .filter(|e| !e.is_empty())
            .filter_map(|e| {
                let eq = e.iter().position(|&b| b == b'=')?;
                Some((OsStr::from_bytes(&e[..eq]), OsStr::from_bytes(&e[eq + 1..])))
            })
    }

    pub fn get(&self, name: &str) -> Option<&OsStr> {
        self.vars()
            .find(|(k, _)| *k == OsStr::new(name))
            .map(|(_, v)| v)
    }
}

/// A `command(...)` action: shell text plus the credentials and environment
/// it runs under.
#[derive(Debug, Clone)]
pub struct Command {
    pub uid: u32,
    pub gid: u32,
    pub cmd: String,
    pub env: Option<Arc<EnvPack>>,
}

#[derive(Debug, Clone)]
pub struct DevId {
    pub flags: u8,
    pub id: String,
}

#[derive(Debug)]
pub struct Config {
    pub path: PathBuf,
    pub layers: Vec<Layer>,
    /// Simple layer name -> index.
    pub layer_names: BTreeMap<String, usize>,
    /// Sorted constituent set -> composite layer index.
    pub composite_index: BTreeMap<Vec<u16>, usize>,

    /// Auxiliary descriptors referenced by index from layer bindings.
    pub descriptors: Vec<Descriptor>,
    pub macros: Vec<Macro>,
    pub commands: Vec<Command>,
    pub aliases: BTreeMap<String, Vec<Descriptor>>,

    /// Physical key codes per modifier class; the first entry is the
    /// canonical key synthesized when none is physically held.
    pub modifiers: [Vec<u16>; MOD_COUNT],

    pub ids: Vec<DevId>,

    pub cmd_uid: u32,
    pub cmd_gid: u32,
    pub cmd_env: Option<Arc<EnvPack>>,

    pub macro_timeout: i64,
    pub macro_sequence_timeout: i64,
    pub macro_repeat_timeout: i64,
    pub oneshot_timeout: i64,
    pub overload_tap_timeout: i64,
    pub chord_interkey_timeout: i64,
    pub chord_hold_timeout: i64,

    pub wildcard: u8,
    pub layer_indicator: u8,
    pub disable_modifier_guard: bool,
    pub compat: bool,
    pub default_layout: String,

    pub finalized: bool,

    // Section-scoped modifier state, live only during parsing.
    pub(crate) add_left_mods: u8,
    pub(crate) add_left_wildc: u8,
    pub(crate) add_right_mods: u8,
    pub(crate) add_right_wildc: u8,
}

/// Reserved layer indices: 0 is main, 1..=8 shadow the modifier classes.
pub const LAYER_MAIN: usize = 0;
pub const MOD_LAYER_NAMES: [&str; MOD_COUNT] = [
    "alt", "meta", "shift", "control", "altgr", "hyper", "level5", "mod7",
];

impl Default for Config {
    fn default() -> Self {
        let mut layers = vec![Layer::named("main")];
        let mut layer_names = BTreeMap::new();
        layer_names.insert("main".to_owned(), 0);

        for (i, name) in MOD_LAYER_NAMES.iter().enumerate() {
            layers.push(Layer::named(name));
            layer_names.insert((*name).to_owned(), i + 1);
        }

        let mut modifiers: [Vec<u16>; MOD_COUNT] = Default::default();
        modifiers[crate::keys::MOD_ALT] = vec![KeyCode::KEY_LEFTALT.code()];
        modifiers[crate::keys::MOD_SUPER] =
            vec![KeyCode::KEY_LEFTMETA.code(), KeyCode::KEY_RIGHTMETA.code()];
        modifiers[crate::keys::MOD_SHIFT] =
            vec![KeyCode::KEY_LEFTSHIFT.code(), KeyCode::KEY_RIGHTSHIFT.code()];
        modifiers[crate::keys::MOD_CTRL] =
            vec![KeyCode::KEY_LEFTCTRL.code(), KeyCode::KEY_RIGHTCTRL.code()];
        modifiers[crate::keys::MOD_ALTGR] = vec![KeyCode::KEY_RIGHTALT.code()];

        Config {
            path: PathBuf::new(),
            layers,
            layer_names,
            composite_index: BTreeMap::new(),
            descriptors: Vec::new(),
            macros: Vec::new(),
            commands: Vec::new(),
            aliases: BTreeMap::new(),
            modifiers,
            ids: Vec::new(),
            cmd_uid: 0,
            cmd_gid: 0,
            cmd_env: None,
            macro_timeout: 600,
            macro_sequence_timeout: 0,
            macro_repeat_timeout: 50,
            oneshot_timeout: 0,
            overload_tap_timeout: 0,
            chord_interkey_timeout: 50,
            chord_hold_timeout: 0,
            wildcard: 0,
            layer_indicator: 255,
            disable_modifier_guard: false,
            compat: false,
            default_layout: String::new(),
            finalized: false,
            add_left_mods: 0,
            add_left_wildc: 0,
            add_right_mods: 0,
            add_right_wildc: 0,
        }
    }
}

impl Config {
    pub fn is_mod(&self, class: usize, code: u16) -> bool {
        self.modifiers[class].contains(&code)
    }

    /// The modifier class of `code`, when it belongs to exactly one.
    pub fn mod_class(&self, code: u16) -> Option<usize> {
        let mut found = None;
        for class in 0..MOD_COUNT {
            if self.is_mod(class, code) {
                if found.is_some() {
                    return None;
                }
                found = Some(class);
            }
        }
        found
    }

    /// Modifier mask contributed by a layer: its own class for the reserved
    /// layers, the union of constituent classes for composites.
    pub fn layer_mods(&self, idx: usize) -> u8 {
        let single = |i: usize| -> u8 {
            if (1..=MOD_COUNT).contains(&i) {
                1 << (i - 1)
            } else {
                0
            }
        };

        let layer = &self.layers[idx];
        if layer.is_composite() {
            layer.constituents.iter().fold(0, |m, &c| m | single(c as usize))
        } else {
            single(idx)
        }
    }

    /// Matches a device identifier against the id rules. Returns 0 for no
    /// match, 1 for a capability wildcard match, 2 for an explicit id match.
    pub fn check_match(&self, id: &str, flags: u8) -> u8 {
        for rule in &self.ids {
            // Prefix match, so `<vendor>:<product>` alone still matches.
            if id.starts_with(&rule.id) {
                if rule.flags & ID_EXCLUDED != 0 {
                    return 0;
                } else if rule.flags & flags != 0 {
                    if flags & ID_ABS_PTR != 0 && rule.flags & ID_ABS_PTR == 0 {
                        continue;
                    }
                    return 2;
                }
            }
        }

        if self.wildcard & CAP_KEYBOARD != 0 && flags & ID_KEYBOARD != 0 {
            return 1;
        }
        if self.wildcard & CAP_MOUSE != 0 && flags & ID_MOUSE != 0 && flags & ID_ABS_PTR == 0 {
            return 1;
        }
        if self.wildcard & CAP_MOUSE_ABS != 0 && flags & ID_ABS_PTR != 0 {
            return 1;
        }

        0
    }

    pub fn finalize(&mut self) {
        for layer in &mut self.layers {
            layer.keymap.sort();
        }

        for (i, layer) in self.layers.iter().enumerate() {
            if i > MOD_COUNT
                && !layer.is_composite()
                && layer.keymap.is_empty()
                && layer.chords.is_empty()
            {
                debug!("layer {} is never populated", layer.name);
            }
        }

        self.finalized = true;
    }
}

/// Captures the mutable parts of a config before runtime binds so `reset`
/// can restore them. The descriptor/macro/command tables are append-only,
/// so counts are enough there.
#[derive(Debug)]
pub struct ConfigBackup {
    descriptor_count: usize,
    macro_count: usize,
    cmd_count: usize,
    layer_count: usize,
    modifiers: [Vec<u16>; MOD_COUNT],
    layers: Vec<(DescriptorMap, Vec<Chord>)>,
    cmd_env: Option<Arc<EnvPack>>,
    cmd_uid: u32,
    cmd_gid: u32,
}

impl ConfigBackup {
    pub fn new(config: &Config) -> Self {
        ConfigBackup {
            descriptor_count: config.descriptors.len(),
            macro_count: config.macros.len(),
            cmd_count: config.commands.len(),
            layer_count: config.layers.len(),
            modifiers: config.modifiers.clone(),
            layers: config
                .layers
                .iter()
                .map(|l| (l.keymap.clone(), l.chords.clone()))
                .collect(),
            cmd_env: config.cmd_env.clone(),
            cmd_uid: config.cmd_uid,
            cmd_gid: config.cmd_gid,
        }
    }

    pub fn restore(&self, config: &mut Config) {
        for (i, (keymap, chords)) in self.layers.iter().enumerate() {
            let layer = &mut config.layers[i];
            layer.keymap = keymap.clone();
            layer.chords = chords.clone();
        }

        config.layers.truncate(self.layer_count);
        config.layer_names.retain(|_, &mut idx| idx < self.layer_count);
        config
            .composite_index
            .retain(|_, &mut idx| idx < self.layer_count);

        config.descriptors.truncate(self.descriptor_count);
        config.macros.truncate(self.macro_count);
        config.commands.truncate(self.cmd_count);
        config.modifiers = self.modifiers.clone();
        config.cmd_env = self.cmd_env.clone();
        config.cmd_uid = self.cmd_uid;
        config.cmd_gid = self.cmd_gid;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evdev::KeyCode;

    fn keyseq(id: u16, mods: u8, wildcard: u8) -> Descriptor {
        Descriptor {
            op: Op::KeySequence,
            id,
            mods,
            wildcard,
            args: [Arg(id), Arg(u16::from(mods)), Arg(u16::from(wildcard))],
        }
    }

    #[test]
    fn map_set_replaces_same_pattern() {
        let mut map = DescriptorMap::default();
        map.set(keyseq(30, 0, 0));

        let mut replacement = keyseq(30, 0, 0);
        replacement.args[0] = Arg(44);
        map.set(replacement);

        assert_eq!(map.iter().count(), 1);
        assert_eq!(map.get(30, 0).unwrap().args[0], Arg(44));
    }

    #[test]
    fn map_lookup_prefers_exact_over_wildcard() {
        let mut map = DescriptorMap::default();
        map.set(keyseq(30, 0, 0xff));
        map.set(keyseq(30, 1 << crate::keys::MOD_CTRL, 0));
        map.sort();

        let hit = map.get(30, 1 << crate::keys::MOD_CTRL).unwrap();
        assert_eq!(hit.wildcard, 0);

        // No exact entry for shift; wildcard covers it.
        let hit = map.get(30, 1 << crate::keys::MOD_SHIFT).unwrap();
        assert_eq!(hit.wildcard, 0xff);
    }

    #[test]
    fn map_sorted_lookup_matches_linear_scan() {
        let mut map = DescriptorMap::default();
        let patterns = [
            (30u16, 0u8, 0u8),
            (30, 0b0100, 0),
            (30, 0b1000, 0b0001),
            (30, 0, 0xff),
            (31, 0, 0),
            (48, 0b0001, 0b0110),
        ];
        for (id, mods, wildcard) in patterns {
            map.set(keyseq(id, mods, wildcard));
        }
        map.sort();

        for id in [30u16, 31, 48, 49] {
            for mods in 0u8..16 {
                let sorted = map.get(id, mods);
                let linear = map
                    .iter()
                    .find(|e| e.id == id && e.wildcard == 0 && e.mods == mods)
                    .or_else(|| {
                        map.iter().find(|e| {
                            e.id == id && e.wildcard != 0 && (e.mods | e.wildcard) & mods == mods
                        })
                    });
                assert_eq!(sorted.map(|d| (d.mods, d.wildcard)), linear.map(|d| (d.mods, d.wildcard)), "id {id} mods {mods:04b}");
            }
        }
    }

    #[test]
    fn backup_restore_round_trips() {
        let mut config = Config::default();
        crate::config::add_entry(&mut config, "", "a = b").unwrap();
        config.finalize();

        let backup = ConfigBackup::new(&config);
        let before_layers: Vec<(DescriptorMap, Vec<Chord>)> = config
            .layers
            .iter()
            .map(|l| (l.keymap.clone(), l.chords.clone()))
            .collect();
        let before_macros = config.macros.clone();
        let before_commands = config.commands.len();
        let before_mods = config.modifiers.clone();

        crate::config::add_entry(&mut config, "", "b = macro(C-t 100ms enter)").unwrap();
        crate::config::add_entry(&mut config, "nav", "h = left").unwrap();
        config.modifiers[crate::keys::MOD_CTRL].push(KeyCode::KEY_CAPSLOCK.code());

        backup.restore(&mut config);

        let after: Vec<(DescriptorMap, Vec<Chord>)> = config
            .layers
            .iter()
            .map(|l| (l.keymap.clone(), l.chords.clone()))
            .collect();
        assert_eq!(before_layers, after);
        assert_eq!(before_macros, config.macros);
        assert_eq!(before_commands, config.commands.len());
        assert_eq!(before_mods, config.modifiers);
        assert!(config.layer_names.values().all(|&i| i < config.layers.len()));
    }

    #[test]
    fn id_match_ranks() {
        let mut config = Config::default();
        config.ids.push(DevId {
            flags: ID_KEYBOARD | ID_MOUSE,
            id: "046d:c52b".into(),
        });
        config.ids.push(DevId {
            flags: ID_EXCLUDED,
            id: "ffff:0001".into(),
        });
        config.wildcard = CAP_KEYBOARD;

        assert_eq!(config.check_match("046d:c52b:1a2b3c4d", ID_KEYBOARD), 2);
        assert_eq!(config.check_match("ffff:0001:00000000", ID_KEYBOARD), 0);
        assert_eq!(config.check_match("beef:beef:00000000", ID_KEYBOARD), 1);
        assert_eq!(config.check_match("beef:beef:00000000", ID_MOUSE), 0);
    }

    #[test]
    fn deep_eq_follows_references() {
        let mut config = Config::default();

        let d1 = parse::parse_descriptor("overload(shift, esc)", &mut config).unwrap();
        let d2 = parse::parse_descriptor("overload(shift, esc)", &mut config).unwrap();
        let d3 = parse::parse_descriptor("overload(shift, tab)", &mut config).unwrap();

        assert!(d1.deep_eq(&d2, &config));
        assert!(!d1.deep_eq(&d3, &config));
        // Shallow equality deliberately ignores the args.
        assert_eq!(d1, d3);
    }
}
