//! Configuration file parsing: includes, the two-pass section reader,
//! descriptor and action expressions, aliases and composite layers.
//!
//! Parse problems are reported per line and the offending entry skipped;
//! only file I/O failures abort a parse.

use super::ini;
use super::{
    Arg, Chord, Config, DevId, Descriptor, Op, CAP_KEYBOARD, CAP_MOUSE, CAP_MOUSE_ABS,
    ID_ABS_PTR, ID_EXCLUDED, ID_KEYBOARD, ID_MOUSE, MACRO_WILDCARD_FLAG, MAX_CHORD_KEYS,
    MAX_DESCRIPTOR_ARGS, NO_LAYER,
};
use crate::keys::{self, parse_key_sequence, KEY_SPACE, MOD_IDS};
use crate::macros::{self, Macro, Step};
use log::{error, warn};
use std::path::Path;

/// Fallback directory for include files shipped with the daemon.
const DATA_DIR: &str = "/usr/share/remapd";

const MAX_INCLUDE_DEPTH: usize = 10;

/// Reads a file, splicing `include` directives in place.
fn read_file(path: &Path, depth: usize) -> String {
    let mut buf = String::new();

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!("failed to open {}: {e}", path.display());
            return buf;
        }
    };

    for line in content.lines() {
        let include = line
            .strip_prefix("include ")
            .or_else(|| line.strip_prefix("include\t"));

        let Some(include) = include else {
            buf.push_str(line);
            buf.push('\n');
            continue;
        };

        if include.ends_with(".conf") {
            warn!("{include}: included file has invalid extension");
            continue;
        }

        if depth >= MAX_INCLUDE_DEPTH {
            warn!("include depth too big or cyclic: {include}");
            continue;
        }

        let resolved = path
            .parent()
            .map(|dir| dir.join(include))
            .filter(|p| p.exists())
            .unwrap_or_else(|| Path::new(DATA_DIR).join(include));

        buf.push_str(&read_file(&resolved, depth + 1));
    }

    buf
}

/// Parses `path` into `config`.
pub fn parse(config: &mut Config, path: &Path) -> Result<(), String> {
    let content = read_file(path, 0);
    if content.is_empty() {
        return Err(format!("{}: empty or unreadable", path.display()));
    }

    config.path = path.to_owned();
    parse_string(config, &content)
}

pub fn parse_string(config: &mut Config, content: &str) -> Result<(), String> {
    parse_passes(config, content, content)
}

/// Two-pass parse: globals, ids and aliases first, then layer bindings.
/// Each pass checksums the content it saw; a mismatch rejects pass 2.
pub(crate) fn parse_passes(
    config: &mut Config,
    pass1: &str,
    pass2: &str,
) -> Result<(), String> {
    let (sections, sum1) = ini::parse(pass1);
    if sections.is_empty() {
        return Err("no sections found".into());
    }

    for section in &sections {
        match section.name.as_str() {
            "ids" => parse_id_section(config, section),
            "aliases" => parse_alias_section(config, section),
            "global" => parse_global_section(config, section),
            _ => (),
        }
    }

    let (sections, sum2) = ini::parse(pass2);
    if sum1 != sum2 {
        return Err("config changed between passes".into());
    }

    for section in &sections {
        if matches!(section.name.as_str(), "ids" | "aliases" | "global") {
            continue;
        }

        let mut name = section.name.split(':').next().unwrap_or("");
        if name.len() != section.name.len() {
            warn!("obsolete layer type specifier: {}", section.name);
        }

        config.add_right_mods = 0;
        config.add_right_wildc = 0;
        config.add_left_mods = 0;
        config.add_left_wildc = 0;

        // Section-scoped modifiers: `C-`/`C*`/`**` prefixes apply to the
        // left-hand side of every binding in the section, `-C`/`*C`/`**`
        // suffixes to the right-hand side.
        while name.len() >= 2 {
            let b = name.as_bytes();
            if name.ends_with("**") {
                config.add_right_wildc = 0xff;
            } else if let Some(pos) = MOD_IDS.iter().position(|&m| m == b[name.len() - 1]) {
                if b[name.len() - 2] == b'*' {
                    config.add_right_wildc |= 1 << pos;
                } else if b[name.len() - 2] == b'-' {
                    config.add_right_mods |= 1 << pos;
                } else {
                    break;
                }
            } else {
                break;
            }
            name = &name[..name.len() - 2];
        }

        while name.len() >= 2 {
            let b = name.as_bytes();
            if name.starts_with("**") {
                config.add_left_wildc = 0xff;
            } else if let Some(pos) = MOD_IDS.iter().position(|&m| m == b[0]) {
                if b[1] == b'-' {
                    config.add_left_mods |= 1 << pos;
                } else if b[1] == b'*' {
                    config.add_left_wildc |= 1 << pos;
                } else {
                    break;
                }
            } else {
                break;
            }
            name = &name[2..];
        }

        for ent in &section.entries {
            let Some(val) = &ent.val else {
                warn!("invalid binding on line {}", ent.lnum);
                continue;
            };

            let exp = format!("{} = {}", ent.key, val);
            if let Err(e) = add_entry(config, name, &exp) {
                error!("line {}: {e}", ent.lnum);
            }
        }
    }

    config.add_right_mods = 0;
    config.add_right_wildc = 0;
    config.add_left_mods = 0;
    config.add_left_wildc = 0;

    for layer in &mut config.layers {
        layer.keymap.sort();
    }

    Ok(())
}

fn parse_num(s: &str) -> i64 {
    let s = s.trim();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse::<i64>().unwrap_or(0) * sign
}

fn parse_global_section(config: &mut Config, section: &ini::Section) {
    for ent in &section.entries {
        let val = ent.val.as_deref().unwrap_or("");

        match ent.key.as_str() {
            "macro_timeout" => config.macro_timeout = parse_num(val),
            "macro_sequence_timeout" => config.macro_sequence_timeout = parse_num(val),
            "macro_repeat_timeout" => config.macro_repeat_timeout = parse_num(val),
            "oneshot_timeout" => config.oneshot_timeout = parse_num(val),
            "overload_tap_timeout" => config.overload_tap_timeout = parse_num(val),
            "chord_timeout" => config.chord_interkey_timeout = parse_num(val),
            "chord_hold_timeout" => config.chord_hold_timeout = parse_num(val),
            "layer_indicator" => config.layer_indicator = parse_num(val) as u8,
            "disable_modifier_guard" => config.disable_modifier_guard = parse_num(val) != 0,
            "default_layout" => config.default_layout = val.to_owned(),
            key => warn!("line {}: {key} is not a valid global option", ent.lnum),
        }
    }
}

const MAX_ID_LEN: usize = 20;

fn parse_id_section(config: &mut Config, section: &ini::Section) {
    for ent in &section.entries {
        let s = ent.key.as_str();

        // Wildcards only set capture flags; everything else appends a rule.
        if s == "*" {
            warn!("use k:* to capture keyboards, enabling wildcard compat mode");
            config.compat = true;
            config.wildcard |= CAP_KEYBOARD;
            continue;
        } else if s == "m:*" {
            config.wildcard |= CAP_MOUSE;
            continue;
        } else if s == "k:*" {
            config.wildcard |= CAP_KEYBOARD;
            continue;
        } else if s == "a:*" {
            config.wildcard |= CAP_MOUSE_ABS;
            continue;
        }

        let (flags, id) = if let Some(id) = s.strip_prefix("m:") {
            (ID_MOUSE, id)
        } else if let Some(id) = s.strip_prefix("a:") {
            (ID_MOUSE | ID_ABS_PTR, id)
        } else if let Some(id) = s.strip_prefix("k:") {
            (ID_KEYBOARD, id)
        } else if let Some(id) = s.strip_prefix('-') {
            (ID_EXCLUDED, id)
        } else {
            (ID_KEYBOARD | ID_MOUSE, s)
        };

        if id.len() > MAX_ID_LEN {
            warn!("{s} is not a valid device id");
            continue;
        }

        config.ids.push(DevId {
            flags,
            id: id.to_owned(),
        });
    }
}

fn parse_alias_section(config: &mut Config, section: &ini::Section) {
    for ent in &section.entries {
        let name = ent.val.as_deref().unwrap_or("");

        let Some(desc) = lookup_keycode(&ent.key).filter(Descriptor::is_set) else {
            warn!(
                "failed to define alias {name}, {} is not a valid keycode",
                ent.key
            );
            continue;
        };

        // A single-letter value assigns the key to that modifier class.
        if desc.mods == 0
            && desc.wildcard == 0
            && (desc.id as usize) < KEY_SPACE
            && name.len() == 1
        {
            let id = MOD_IDS.iter().position(|&m| m == name.as_bytes()[0]);

            if id.is_some() || name == "-" {
                for class in &mut config.modifiers {
                    class.retain(|&code| code != desc.id);
                }
                if let Some(id) = id {
                    config.modifiers[id].push(desc.id);
                }
                continue;
            }
        }

        if name.is_empty() {
            continue;
        }

        match lookup_keycode(name) {
            Some(alias) if alias.is_set() => {
                warn!("alias name represents a valid keycode: {name}");
            }
            _ => {
                config.aliases.entry(name.to_owned()).or_default().push(desc);
            }
        }
    }
}

/// Resolves a key name into a KEYSEQUENCE descriptor. A trailing modifier
/// word (e.g. `C-control`) maps to a class-expansion pseudo id at or above
/// `KEY_SPACE`; those are fanned out over the class members at entry time.
pub(crate) fn lookup_keycode(name: &str) -> Option<Descriptor> {
    let (seq, rest) = parse_key_sequence(name)?;

    let mut d = Descriptor {
        op: Op::KeySequence,
        id: seq.code,
        mods: seq.mods,
        wildcard: seq.wildcard,
        args: [
            Arg(seq.code),
            Arg(u16::from(seq.mods)),
            Arg(u16::from(seq.wildcard)),
        ],
    };

    if rest > 0 {
        let class = match &name[name.len() - rest..] {
            "control" | "ctrl" => keys::MOD_CTRL,
            "shift" => keys::MOD_SHIFT,
            "alt" => keys::MOD_ALT,
            "altgr" => keys::MOD_ALTGR,
            "meta" | "super" => keys::MOD_SUPER,
            "hyper" => keys::MOD_HYPER,
            "level5" => keys::MOD_LEVEL5,
            "mod7" | "nlock" => keys::MOD_NLOCK,
            _ => {
                d.op = Op::Null;
                return Some(d);
            }
        };
        d.id = (KEY_SPACE + class) as u16;
    }

    if d.id == 0 {
        d.op = Op::Null;
    }

    Some(d)
}

/// Maps composite names like `shift+control` to a sorted set of simple
/// layer indices, creating simple layers on first reference.
fn layer_composition(config: &mut Config, name: &str) -> Option<Vec<u16>> {
    let mut constituents = Vec::new();

    for part in name.split('+') {
        if part.is_empty() {
            return None;
        }
        if part == config.layers[0].name {
            continue;
        }

        let part = match part {
            "ctrl" => "control",
            "super" => "meta",
            "nlock" => "mod7",
            other => other,
        };

        let idx = match config.layer_names.get(part) {
            Some(&idx) => idx,
            None => {
                let idx = config.layers.len();
                if idx > i16::MAX as usize {
                    error!("max layers exceeded");
                    return None;
                }
                config.layers.push(super::Layer {
                    name: part.to_owned(),
                    ..Default::default()
                });
                config.layer_names.insert(part.to_owned(), idx);
                idx
            }
        };

        constituents.push(idx as u16);
    }

    constituents.sort_unstable();
    constituents.dedup();
    Some(constituents)
}

/// Returns the index of the named layer, creating simple layers and
/// interning composite layers as needed. `singular` rejects composites.
pub(crate) fn access_layer(
    config: &mut Config,
    name: &str,
    singular: bool,
) -> Result<usize, String> {
    if name.is_empty() {
        return Err("empty layer name".into());
    }
    if name.bytes().all(|b| b == b'+') {
        return Ok(0);
    }

    let name = name.split(':').next().unwrap_or(name);
    let constituents =
        layer_composition(config, name).ok_or_else(|| format!("{name} is not a valid layer"))?;

    match constituents.as_slice() {
        [] => Ok(0),
        [single] => Ok(*single as usize),
        _ if singular => Err(format!("{name} is not a singular layer")),
        set => {
            if let Some(&idx) = config.composite_index.get(set) {
                return Ok(idx);
            }

            let idx = config.layers.len();
            if idx > i16::MAX as usize {
                return Err("max layers exceeded".into());
            }
            config.layers.push(super::Layer {
                constituents: set.to_vec(),
                ..Default::default()
            });
            config.composite_index.insert(set.to_vec(), idx);
            Ok(idx)
        }
    }
}

/// Splits `name(arg, arg, ...)`, honoring nested parentheses and backslash
/// escapes inside arguments. Trailing text after the closing paren is
/// ignored.
fn parse_fn(s: &str) -> Option<(&str, Vec<&str>)> {
    let open = s.find('(')?;
    let name = &s[..open];
    let b = s.as_bytes();

    let mut args = Vec::new();
    let mut depth = 0i32;
    let mut start = open + 1;
    let mut i = start;

    while i < b.len() {
        match b[i] {
            b'\\' => i += 1,
            b'(' => depth += 1,
            b')' if depth > 0 => depth -= 1,
            b')' => {
                let arg = s[start..i].trim();
                if !arg.is_empty() {
                    args.push(arg);
                }
                return Some((name, args));
            }
            b',' if depth == 0 => {
                let arg = s[start..i].trim();
                if !arg.is_empty() {
                    args.push(arg);
                }
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }

    None
}

enum MacroParse {
    Parsed(Macro, u8),
    NotMacro,
    Invalid(String),
}

/// Attempts to read `s` as a macro expression: a bare key sequence, a
/// `macro(...)`/`type(...)`/`cmd(...)` call, or a single non-ASCII char.
fn parse_macro_expression(s: &str, config: &mut Config) -> MacroParse {
    let Some((seq, rest)) = parse_key_sequence(s) else {
        return MacroParse::NotMacro;
    };

    let mut wildc = seq.wildcard;
    if config.compat {
        wildc = 0xff;
    }
    wildc |= config.add_right_wildc;

    if rest == 0 {
        let mods = seq.mods | config.add_right_mods;
        let step = Step::KeySeq {
            code: seq.code,
            mods,
            wildcard: wildc | mods,
        };
        return MacroParse::Parsed(Macro(vec![step]), wildc | mods);
    }

    if rest < s.len() && wildc != 0xff {
        return MacroParse::Invalid(format!("invalid macro prefix (only ** is supported): {s}"));
    }

    let tail = &s[s.len() - rest..];

    let body = if let Some(inner) = tail.strip_prefix("macro(").and_then(|t| t.strip_suffix(')')) {
        inner
    } else if tail.ends_with(')')
        && ["type(", "text(", "txt(", "t(", "cmd(", "command("]
            .iter()
            .any(|p| tail.starts_with(p))
    {
        tail
    } else if tail.chars().count() == 1 {
        warn!("naked unicode is deprecated, use type(): {tail}");
        tail
    } else {
        return MacroParse::NotMacro;
    };

    match macros::parse(body, config) {
        Ok(mac) => MacroParse::Parsed(mac, wildc),
        Err(e) => MacroParse::Invalid(e),
    }
}

enum ActArg {
    Layer,
    Layout,
    Macro,
    Timeout,
    Sensitivity,
    Descriptor,
}

struct Action {
    name: &'static str,
    preferred: Option<&'static str>,
    op: Op,
    args: &'static [ActArg],
}

use ActArg as A;

const ACTIONS: &[Action] = &[
    Action { name: "swap", preferred: None, op: Op::Swap, args: &[A::Layer] },
    Action { name: "clear", preferred: None, op: Op::Clear, args: &[] },
    Action { name: "oneshot", preferred: None, op: Op::Oneshot, args: &[A::Layer] },
    Action { name: "toggle", preferred: None, op: Op::Toggle, args: &[A::Layer] },
    Action { name: "clearm", preferred: None, op: Op::ClearM, args: &[A::Macro] },
    Action { name: "swapm", preferred: None, op: Op::SwapM, args: &[A::Layer, A::Macro] },
    Action { name: "togglem", preferred: None, op: Op::ToggleM, args: &[A::Layer, A::Macro] },
    Action { name: "layerm", preferred: None, op: Op::LayerM, args: &[A::Layer, A::Macro] },
    Action { name: "oneshotm", preferred: None, op: Op::OneshotM, args: &[A::Layer, A::Macro] },
    Action { name: "overloadm", preferred: None, op: Op::OverloadM, args: &[A::Layer, A::Macro, A::Descriptor] },
    Action { name: "layer", preferred: None, op: Op::Layer, args: &[A::Layer] },
    Action { name: "overload", preferred: None, op: Op::Overload, args: &[A::Layer, A::Descriptor] },
    Action { name: "overloadt", preferred: None, op: Op::OverloadTimeout, args: &[A::Layer, A::Descriptor, A::Timeout] },
    Action { name: "overloadt2", preferred: None, op: Op::OverloadTimeoutTap, args: &[A::Layer, A::Descriptor, A::Timeout] },
    Action { name: "overloadi", preferred: None, op: Op::OverloadIdleTimeout, args: &[A::Descriptor, A::Descriptor, A::Timeout] },
    Action { name: "timeout", preferred: None, op: Op::Timeout, args: &[A::Descriptor, A::Timeout, A::Descriptor] },
    Action { name: "macro2", preferred: None, op: Op::Macro2, args: &[A::Timeout, A::Timeout, A::Macro] },
    Action { name: "setlayout", preferred: None, op: Op::Layout, args: &[A::Layout] },
    Action { name: "scrollt", preferred: None, op: Op::ScrollToggle, args: &[A::Sensitivity] },
    Action { name: "scroll", preferred: None, op: Op::Scroll, args: &[A::Sensitivity] },
    Action { name: "overload2", preferred: Some("overloadt"), op: Op::OverloadTimeout, args: &[A::Layer, A::Descriptor, A::Timeout] },
    Action { name: "overload3", preferred: Some("overloadt2"), op: Op::OverloadTimeoutTap, args: &[A::Layer, A::Descriptor, A::Timeout] },
    Action { name: "toggle2", preferred: Some("togglem"), op: Op::ToggleM, args: &[A::Layer, A::Macro] },
    Action { name: "swap2", preferred: Some("swapm"), op: Op::SwapM, args: &[A::Layer, A::Macro] },
];

/// Parses a right-hand-side expression into a descriptor, appending any
/// referenced macros, commands and auxiliary descriptors to the config.
pub(crate) fn parse_descriptor(s: &str, config: &mut Config) -> Result<Descriptor, String> {
    let s = s.trim();
    let mut d = Descriptor::default();

    if s.is_empty() {
        return Ok(d);
    }

    if let Some((seq, 0)) = parse_key_sequence(s) {
        let wildc = if config.compat { 0xff } else { seq.wildcard };
        d.op = Op::KeySequence;
        d.args[0] = Arg(seq.code);
        d.args[1] = Arg(u16::from(seq.mods | config.add_right_mods));
        d.args[2] = Arg(u16::from(wildc | config.add_right_wildc));
        return Ok(d);
    }

    match parse_macro_expression(s, config) {
        MacroParse::Parsed(mac, wildc) => {
            if config.macros.len() >= i16::MAX as usize {
                return Err("max macros exceeded".into());
            }
            d.op = Op::Macro;
            let flag = if wildc != 0 { MACRO_WILDCARD_FLAG } else { 0 };
            d.args[0] = Arg(config.macros.len() as u16 | flag);
            config.macros.push(mac);
            return Ok(d);
        }
        MacroParse::Invalid(e) => return Err(e),
        MacroParse::NotMacro => (),
    }

    let Some((fn_name, fn_args)) = parse_fn(s) else {
        return Err(format!("invalid key or action: {s}"));
    };

    if fn_name == "lettermod" {
        if fn_args.len() != 4 {
            return Err("lettermod requires 4 arguments".into());
        }
        let rewritten = format!(
            "overloadi({}, overloadt2({}, {}, {}), {})",
            fn_args[1], fn_args[0], fn_args[1], fn_args[3], fn_args[2]
        );
        return parse_descriptor(&rewritten, config);
    }

    let Some(action) = ACTIONS.iter().find(|a| a.name == fn_name) else {
        return Err(format!("invalid key or action: {s}"));
    };

    if let Some(preferred) = action.preferred {
        warn!("{} is deprecated (renamed to {preferred})", action.name);
    }

    if fn_args.len() != action.args.len() {
        return Err(format!(
            "{} requires {} argument{}",
            action.name,
            action.args.len(),
            if action.args.len() == 1 { "" } else { "s" }
        ));
    }

    d.op = action.op;

    for (i, (kind, argstr)) in action.args.iter().zip(&fn_args).enumerate() {
        debug_assert!(i < MAX_DESCRIPTOR_ARGS);

        match kind {
            A::Layer => {
                let idx = match *argstr {
                    "+" | "**" => 0,
                    "-" => NO_LAYER,
                    name => {
                        let negate = name.starts_with('-');
                        let name = name.strip_prefix('-').unwrap_or(name);
                        let idx = access_layer(config, name, false)
                            .map_err(|_| format!("{argstr} layer cannot be used"))?;
                        if idx == 0 {
                            return Err(format!("{argstr} layer cannot be used"));
                        }
                        let idx = idx as i16;
                        if negate {
                            -idx
                        } else {
                            idx
                        }
                    }
                };
                d.args[i] = Arg::from_idx(idx);
            }
            A::Layout => {
                let idx = access_layer(config, argstr, true)
                    .map_err(|_| format!("{argstr} layout cannot be used"))?;
                d.args[i] = Arg::from_idx(idx as i16);
            }
            A::Descriptor => {
                let desc = parse_descriptor(argstr, config)?;
                if config.descriptors.len() >= i16::MAX as usize {
                    return Err("maximum descriptors exceeded".into());
                }
                d.args[i] = Arg(config.descriptors.len() as u16);
                config.descriptors.push(desc);
            }
            A::Macro => {
                match parse_macro_expression(argstr, config) {
                    MacroParse::Parsed(mac, wildc) => {
                        if config.macros.len() >= i16::MAX as usize {
                            return Err("max macros exceeded".into());
                        }
                        let flag = if wildc != 0 { MACRO_WILDCARD_FLAG } else { 0 };
                        d.args[i] = Arg(config.macros.len() as u16 | flag);
                        config.macros.push(mac);
                    }
                    MacroParse::Invalid(e) => return Err(e),
                    MacroParse::NotMacro => {
                        return Err(format!("{argstr} is not a valid macro"));
                    }
                }
            }
            A::Timeout => d.args[i] = Arg(parse_num(argstr) as u16),
            A::Sensitivity => d.args[i] = Arg(parse_num(argstr) as i16 as u16),
        }
    }

    Ok(d)
}

/// Adds a binding `key = <descriptor>` (LHS still unparsed) to `layer_idx`.
fn set_layer_entry(
    config: &mut Config,
    layer_idx: usize,
    key: &str,
    d: &Descriptor,
) -> Result<(), String> {
    if key.contains('+') {
        let mut keys = [0u16; MAX_CHORD_KEYS];
        let mut n = 0;

        for tok in key.split('+') {
            let desc = lookup_keycode(tok)
                .filter(Descriptor::is_set)
                .ok_or_else(|| format!("{tok} is not a valid key"))?;

            if desc.mods != 0 || desc.wildcard != 0 {
                return Err(format!("{tok} is not a valid key"));
            }

            if let Some(class) = config.mod_class(desc.id) {
                return Err(format!(
                    "chord key {tok}+ is a modifier, did you mean a {}-key combo?",
                    MOD_IDS[class] as char
                ));
            }

            if n >= MAX_CHORD_KEYS {
                return Err(format!("chords cannot contain more than {n} keys"));
            }

            keys[n] = desc.id;
            n += 1;
        }

        let layer = &mut config.layers[layer_idx];
        let existing = layer.chords.iter_mut().find(|chord| {
            keys[..n]
                .iter()
                .all(|k| chord.keys.contains(k))
        });

        match existing {
            Some(chord) => chord.d = *d,
            None => layer.chords.push(Chord { keys, d: *d }),
        }

        return Ok(());
    }

    let layer_mods = config.layer_mods(layer_idx);

    // The alias name is whatever follows the modifier prefix.
    let alias_name = &key[key.rfind(['-', '*']).map_or(0, |p| p + 1)..];

    if let Some(expansions) = config.aliases.get(alias_name).cloned() {
        let aux = lookup_keycode(key).unwrap_or_default();

        for alias in expansions {
            if alias.op != Op::KeySequence {
                continue;
            }

            let mut desc = *d;
            desc.id = alias.id;
            desc.mods = aux.mods | alias.mods | layer_mods | config.add_left_mods;
            desc.wildcard = aux.wildcard | alias.wildcard | config.add_left_wildc;
            if config.compat {
                desc.wildcard = 0xff;
            }
            desc.wildcard &= !desc.mods;
            set_keymap_entry(config, layer_idx, desc);
        }

        return Ok(());
    }

    let mut desc = lookup_keycode(key)
        .filter(Descriptor::is_set)
        .ok_or_else(|| format!("{key} is not a valid key or alias"))?;

    desc.op = d.op;
    desc.args = d.args;
    desc.wildcard |= config.add_left_wildc;
    if config.compat {
        desc.wildcard = 0xff;
    }
    desc.mods |= layer_mods | config.add_left_mods;
    desc.wildcard &= !desc.mods;

    set_keymap_entry(config, layer_idx, desc);
    Ok(())
}

/// Fans class-expansion pseudo ids out over the class members.
fn set_keymap_entry(config: &mut Config, layer_idx: usize, mut desc: Descriptor) {
    if (desc.id as usize) >= KEY_SPACE {
        let class = desc.id as usize - KEY_SPACE;
        for code in config.modifiers[class].clone() {
            desc.id = code;
            config.layers[layer_idx].keymap.set(desc);
        }
    } else {
        config.layers[layer_idx].keymap.set(desc);
    }
}

/// Adds a binding of the form `<key> = <descriptor>` to the named section
/// (empty = main). Returns the index of the layer that was modified.
pub fn add_entry(config: &mut Config, section: &str, exp: &str) -> Result<usize, String> {
    let (key, val) = ini::parse_kvp(exp);

    let section = if section.is_empty() { "main" } else { section };
    let idx = access_layer(config, section, false)
        .map_err(|_| format!("{section} is not a valid layer"))?;

    let d = parse_descriptor(val.unwrap_or(""), config)?;
    set_layer_entry(config, idx, key, &d)?;

    Ok(idx)
}

/// Adds a binding of the form `[<layer>.]<key> = <descriptor>`.
pub fn add_entry_expr(config: &mut Config, exp: &str) -> Result<usize, String> {
    let sep = exp.find(['.', '=']).unwrap_or(exp.len());

    if exp.as_bytes().get(sep) == Some(&b'.') && sep > 0 {
        add_entry(config, &exp[..sep], &exp[sep + 1..])
    } else {
        add_entry(config, "", exp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evdev::KeyCode;

    fn parsed(content: &str) -> Config {
        let mut config = Config::default();
        parse_string(&mut config, content).unwrap();
        config.finalize();
        config
    }

    #[test]
    fn plain_binding() {
        let config = parsed("[main]\na = b\n");

        let d = config.layers[0]
            .keymap
            .get(KeyCode::KEY_A.code(), 0)
            .unwrap();
        assert_eq!(d.op, Op::KeySequence);
        assert_eq!(d.args[0].code(), KeyCode::KEY_B.code());
    }

    #[test]
    fn layer_actions() {
        let config = parsed("[main]\ncapslock = layer(nav)\n\n[nav]\nh = left\n");

        let nav = config.layer_names["nav"];
        assert!(nav > keys::MOD_COUNT);

        let d = config.layers[0]
            .keymap
            .get(KeyCode::KEY_CAPSLOCK.code(), 0)
            .unwrap();
        assert_eq!(d.op, Op::Layer);
        assert_eq!(d.args[0].idx() as usize, nav);

        let h = config.layers[nav]
            .keymap
            .get(KeyCode::KEY_H.code(), 0)
            .unwrap();
        assert_eq!(h.args[0].code(), KeyCode::KEY_LEFT.code());
    }

    #[test]
    fn mod_layer_bindings_inherit_class_mods() {
        let config = parsed("[control]\nj = down\n");

        let ctrl_layer = &config.layers[1 + keys::MOD_CTRL];
        let d = ctrl_layer
            .keymap
            .get(KeyCode::KEY_J.code(), 1 << keys::MOD_CTRL)
            .unwrap();
        assert_eq!(d.mods, 1 << keys::MOD_CTRL);
        assert_eq!(d.args[0].code(), KeyCode::KEY_DOWN.code());
    }

    #[test]
    fn composite_layers_are_interned() {
        let config = parsed("[shift+control]\na = esc\n");

        let shift = config.layer_names["shift"] as u16;
        let control = config.layer_names["control"] as u16;
        let mut expect = vec![shift, control];
        expect.sort_unstable();

        let &idx = config.composite_index.get(&expect).unwrap();
        assert!(config.layers[idx].is_composite());
        assert_eq!(config.layers[idx].constituents, expect);
        assert!(config.layers[idx]
            .keymap
            .get(KeyCode::KEY_A.code(), 0)
            .is_some());
    }

    #[test]
    fn chords() {
        let config = parsed("[main]\nj+k = esc\nj+k = tab\n");

        assert_eq!(config.layers[0].chords.len(), 1);
        let chord = &config.layers[0].chords[0];
        assert_eq!(chord.key_count(), 2);
        assert_eq!(chord.d.args[0].code(), KeyCode::KEY_TAB.code());
    }

    #[test]
    fn chord_of_modifier_is_rejected() {
        let mut config = Config::default();
        let err = add_entry(&mut config, "", "leftshift+j = esc").unwrap_err();
        assert!(err.contains("modifier"));
    }

    #[test]
    fn overload_arguments() {
        let config = parsed("[main]\nspace = overload(shift, space)\n");

        let d = config.layers[0]
            .keymap
            .get(KeyCode::KEY_SPACE.code(), 0)
            .unwrap();
        assert_eq!(d.op, Op::Overload);
        assert_eq!(d.args[0].idx(), (1 + keys::MOD_SHIFT) as i16);

        let tap = &config.descriptors[d.args[1].0 as usize];
        assert_eq!(tap.op, Op::KeySequence);
        assert_eq!(tap.args[0].code(), KeyCode::KEY_SPACE.code());
    }

    #[test]
    fn lettermod_rewrites() {
        let config = parsed("[main]\na = lettermod(shift, a, 150, 50)\n");

        let d = config.layers[0]
            .keymap
            .get(KeyCode::KEY_A.code(), 0)
            .unwrap();
        assert_eq!(d.op, Op::OverloadIdleTimeout);
        assert_eq!(d.args[2].timeout(), 150);

        let held = &config.descriptors[d.args[1].0 as usize];
        assert_eq!(held.op, Op::OverloadTimeoutTap);
        assert_eq!(held.args[2].timeout(), 50);
    }

    #[test]
    fn negative_and_special_layer_args() {
        let config = parsed("[main]\na = layer(-nav)\nb = layer(+)\nc = oneshot(-)\n\n[nav]\nh = left\n");

        let nav = config.layer_names["nav"] as i16;
        let a = config.layers[0].keymap.get(KeyCode::KEY_A.code(), 0).unwrap();
        assert_eq!(a.args[0].idx(), -nav);

        let b = config.layers[0].keymap.get(KeyCode::KEY_B.code(), 0).unwrap();
        assert_eq!(b.args[0].idx(), 0);

        let c = config.layers[0].keymap.get(KeyCode::KEY_C.code(), 0).unwrap();
        assert_eq!(c.args[0].idx(), NO_LAYER);
    }

    #[test]
    fn aliases_expand_bindings() {
        let config = parsed("[aliases]\ncapslock = hjkl\n\n[main]\nhjkl = esc\n");

        let d = config.layers[0]
            .keymap
            .get(KeyCode::KEY_CAPSLOCK.code(), 0)
            .unwrap();
        assert_eq!(d.args[0].code(), KeyCode::KEY_ESC.code());
    }

    #[test]
    fn alias_reassigns_modifier_class() {
        let config = parsed("[aliases]\ncapslock = C\n");

        assert!(config.is_mod(keys::MOD_CTRL, KeyCode::KEY_CAPSLOCK.code()));

        let config = parsed("[aliases]\nleftshift = -\n");
        assert!(!config.is_mod(keys::MOD_SHIFT, KeyCode::KEY_LEFTSHIFT.code()));
    }

    #[test]
    fn section_modifiers() {
        // Prefix applies to the left-hand side, suffix to the right.
        let config = parsed("[C-main-S]\na = b\n");

        let d = config.layers[0]
            .keymap
            .get(KeyCode::KEY_A.code(), 1 << keys::MOD_CTRL)
            .unwrap();
        assert_eq!(d.mods, 1 << keys::MOD_CTRL);
        assert_eq!(d.args[1].mods(), 1 << keys::MOD_SHIFT);
    }

    #[test]
    fn globals() {
        let config = parsed("[global]\noverload_tap_timeout = 200\nchord_timeout = 75\n\n[main]\na = b\n");
        assert_eq!(config.overload_tap_timeout, 200);
        assert_eq!(config.chord_interkey_timeout, 75);
    }

    #[test]
    fn parse_ids() {
        let config = parsed("[ids]\nk:*\n046d:c52b\n-beef:0001\nm:cafe:0002\n\n[main]\na = b\n");

        assert_eq!(config.wildcard, CAP_KEYBOARD);
        assert_eq!(config.ids.len(), 3);
        assert_eq!(config.ids[0].flags, ID_KEYBOARD | ID_MOUSE);
        assert_eq!(config.ids[0].id, "046d:c52b");
        assert_eq!(config.ids[1].flags, ID_EXCLUDED);
        assert_eq!(config.ids[2].flags, ID_MOUSE);
        assert_eq!(config.ids[2].id, "cafe:0002");
    }

    #[test]
    fn checksum_mismatch_rejects_second_pass() {
        let mut config = Config::default();
        let err = parse_passes(&mut config, "[main]\na = b\n", "[main]\na = c\n").unwrap_err();
        assert!(err.contains("changed between passes"));
    }

    #[test]
    fn bad_entries_are_skipped() {
        // The good binding survives its broken neighbours.
        let config = parsed("[main]\na = bogus_action(x)\nnotakey = b\nb = c\n");

        assert!(config.layers[0].keymap.get(KeyCode::KEY_A.code(), 0).is_none());
        assert!(config.layers[0].keymap.get(KeyCode::KEY_B.code(), 0).is_some());
    }

    #[test]
    fn add_entry_expr_splits_section() {
        let mut config = Config::default();

        let idx = add_entry_expr(&mut config, "nav.h = left").unwrap();
        assert_eq!(config.layers[idx].name, "nav");

        let idx = add_entry_expr(&mut config, "a = b").unwrap();
        assert_eq!(idx, 0);
    }

    #[test]
    fn macro_rhs() {
        let config = parsed("[main]\na = macro(C-t 50ms enter)\nb = cmd(notify-send hi)\n");

        let a = config.layers[0].keymap.get(KeyCode::KEY_A.code(), 0).unwrap();
        assert_eq!(a.op, Op::Macro);
        assert_eq!(config.macros[a.args[0].macro_idx()].0.len(), 3);

        let b = config.layers[0].keymap.get(KeyCode::KEY_B.code(), 0).unwrap();
        assert_eq!(b.op, Op::Macro);
        let mac = &config.macros[b.args[0].macro_idx()];
        assert_eq!(mac.0, vec![Step::Command(0)]);
        assert_eq!(config.commands[0].cmd, "notify-send hi");
    }
}
