//! Names and classes for the flat remapd key-code space.
//!
//! Codes 0..=767 are physical evdev codes (including the BTN_* range used by
//! pointer buttons). The remainder of the 1024-entry space is reserved for
//! pseudo codes: wheel events, active-chord slots, fake-modifier slots and a
//! terminal noop.

use evdev::KeyCode;
use std::sync::LazyLock;

pub const KEY_SPACE: usize = 1024;

/// Highest physical evdev code + 1. Codes at or above this are synthetic.
pub const PHYS_KEY_COUNT: u16 = 768;

pub const KEY_WHEELUP: u16 = 768;
pub const KEY_WHEELDOWN: u16 = 769;
pub const KEY_WHEELLEFT: u16 = 770;
pub const KEY_WHEELRIGHT: u16 = 771;

/// Synthetic codes held while a chord is resolved as pressed.
pub const CHORD_BASE: u16 = 772;
pub const CHORD_SLOTS: u16 = 8;

/// One slot per modifier class, tracking modifiers the engine synthesised.
pub const FAKEMOD_BASE: u16 = 900;

pub const KEY_NOOP: u16 = (KEY_SPACE - 1) as u16;

pub const MOD_COUNT: usize = 8;

pub const MOD_ALT: usize = 0;
pub const MOD_SUPER: usize = 1;
pub const MOD_SHIFT: usize = 2;
pub const MOD_CTRL: usize = 3;
pub const MOD_ALTGR: usize = 4;
pub const MOD_HYPER: usize = 5;
pub const MOD_LEVEL5: usize = 6;
pub const MOD_NLOCK: usize = 7;

/// Single-letter modifier ids, in class order.
pub const MOD_IDS: &[u8; MOD_COUNT] = b"AMSCGHLN";

pub fn is_wheel(code: u16) -> bool {
    (KEY_WHEELUP..=KEY_WHEELRIGHT).contains(&code)
}

pub fn is_chord_code(code: u16) -> bool {
    (CHORD_BASE..CHORD_BASE + CHORD_SLOTS).contains(&code)
}

#[derive(Default, Clone, Copy)]
pub struct KeyEnt {
    pub name: Option<&'static str>,
    pub alt_name: Option<&'static str>,
    pub shifted_name: Option<&'static str>,
}

/// Canonical name of `code`, falling back to the `key_NNN` spelling.
pub fn key_name(code: u16) -> String {
    match keycode_table().get(code as usize).and_then(|e| e.name) {
        Some(name) => name.to_owned(),
        None => format!("key_{code:03}"),
    }
}

pub fn keycode_table() -> &'static [KeyEnt; KEY_SPACE] {
    &TABLE
}

/// `"C-S-"`-style rendering of a modifier mask.
pub fn modstring(mods: u8) -> String {
    let mut s = String::new();
    for (i, id) in MOD_IDS.iter().enumerate() {
        if mods & (1 << i) != 0 {
            s.push(*id as char);
            s.push('-');
        }
    }
    s
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KeySeq {
    pub code: u16,
    pub mods: u8,
    pub wildcard: u8,
}

/// Parses a prefix of modifier tokens (`C-`, `C*`, `**`) followed by a key
/// name. Returns the sequence and the number of unconsumed trailing bytes;
/// a partial parse leaves `code == 0` so callers can interpret the tail
/// themselves. Returns `None` only for the empty string.
pub fn parse_key_sequence(s: &str) -> Option<(KeySeq, usize)> {
    if s.is_empty() {
        return None;
    }

    let mut seq = KeySeq::default();
    let mut rest = s.as_bytes();

    while rest.len() >= 2 {
        if rest[0] == b'*' && rest[1] == b'*' {
            seq.wildcard = 0xff;
        } else if let Some(id) = MOD_IDS.iter().position(|&m| m == rest[0]) {
            if rest[1] == b'*' {
                seq.wildcard |= 1 << id;
            } else if rest[1] == b'-' {
                seq.mods |= 1 << id;
            } else {
                break;
            }
        } else {
            break;
        }
        rest = &rest[2..];
    }

    let name = std::str::from_utf8(rest).unwrap_or("");

    for (code, ent) in keycode_table().iter().enumerate() {
        if ent.shifted_name == Some(name) {
            seq.mods |= 1 << MOD_SHIFT;
            seq.code = code as u16;
            return Some((seq, 0));
        }
        if ent.name == Some(name) || ent.alt_name == Some(name) {
            seq.code = code as u16;
            return Some((seq, 0));
        }
    }

    if let Some(num) = name.strip_prefix("key_") {
        if num.len() == 3 {
            if let Ok(code) = num.parse::<u16>() {
                if (code as usize) < KEY_SPACE {
                    seq.code = code;
                    return Some((seq, 0));
                }
            }
        }
    }

    Some((seq, rest.len()))
}

static TABLE: LazyLock<Box<[KeyEnt; KEY_SPACE]>> = LazyLock::new(|| {
    let mut r = vec![KeyEnt::default(); KEY_SPACE].into_boxed_slice();

    {
        let mut set = |k: KeyCode, name: &'static str, alt: Option<&'static str>, shifted: Option<&'static str>| {
            r[k.code() as usize] = KeyEnt {
                name: Some(name),
                alt_name: alt,
                shifted_name: shifted,
            };
        };

        set(KeyCode::KEY_ESC, "esc", Some("escape"), None);
        set(KeyCode::KEY_1, "1", None, Some("!"));
        set(KeyCode::KEY_2, "2", None, Some("@"));
        set(KeyCode::KEY_3, "3", None, Some("#"));
        set(KeyCode::KEY_4, "4", None, Some("$"));
        set(KeyCode::KEY_5, "5", None, Some("%"));
        set(KeyCode::KEY_6, "6", None, Some("^"));
        set(KeyCode::KEY_7, "7", None, Some("&"));
        set(KeyCode::KEY_8, "8", None, Some("*"));
        set(KeyCode::KEY_9, "9", None, Some("("));
        set(KeyCode::KEY_0, "0", None, Some(")"));
        set(KeyCode::KEY_MINUS, "-", Some("minus"), Some("_"));
        set(KeyCode::KEY_EQUAL, "=", Some("equal"), Some("+"));
        set(KeyCode::KEY_BACKSPACE, "backspace", Some("\u{8}"), None);
        set(KeyCode::KEY_TAB, "tab", Some("\t"), None);
        set(KeyCode::KEY_Q, "q", None, Some("Q"));
        set(KeyCode::KEY_W, "w", None, Some("W"));
        set(KeyCode::KEY_E, "e", None, Some("E"));
        set(KeyCode::KEY_R, "r", None, Some("R"));
        set(KeyCode::KEY_T, "t", None, Some("T"));
        set(KeyCode::KEY_Y, "y", None, Some("Y"));
        set(KeyCode::KEY_U, "u", None, Some("U"));
        set(KeyCode::KEY_I, "i", None, Some("I"));
        set(KeyCode::KEY_O, "o", None, Some("O"));
        set(KeyCode::KEY_P, "p", None, Some("P"));
        set(KeyCode::KEY_LEFTBRACE, "[", Some("leftbrace"), Some("{"));
        set(KeyCode::KEY_RIGHTBRACE, "]", Some("rightbrace"), Some("}"));
        set(KeyCode::KEY_ENTER, "enter", Some("\n"), None);
        set(KeyCode::KEY_LEFTCTRL, "leftcontrol", Some("leftctrl"), None);
        set(KeyCode::KEY_A, "a", None, Some("A"));
        set(KeyCode::KEY_S, "s", None, Some("S"));
        set(KeyCode::KEY_D, "d", None, Some("D"));
        set(KeyCode::KEY_F, "f", None, Some("F"));
        set(KeyCode::KEY_G, "g", None, Some("G"));
        set(KeyCode::KEY_H, "h", None, Some("H"));
        set(KeyCode::KEY_J, "j", None, Some("J"));
        set(KeyCode::KEY_K, "k", None, Some("K"));
        set(KeyCode::KEY_L, "l", None, Some("L"));
        set(KeyCode::KEY_SEMICOLON, ";", Some("semicolon"), Some(":"));
        set(KeyCode::KEY_APOSTROPHE, "'", Some("apostrophe"), Some("\""));
        set(KeyCode::KEY_GRAVE, "`", Some("grave"), Some("~"));
        set(KeyCode::KEY_LEFTSHIFT, "leftshift", None, None);
        set(KeyCode::KEY_BACKSLASH, "\\", Some("backslash"), Some("|"));
        set(KeyCode::KEY_Z, "z", None, Some("Z"));
        set(KeyCode::KEY_X, "x", None, Some("X"));
        set(KeyCode::KEY_C, "c", None, Some("C"));
        set(KeyCode::KEY_V, "v", None, Some("V"));
        set(KeyCode::KEY_B, "b", None, Some("B"));
        set(KeyCode::KEY_N, "n", None, Some("N"));
        set(KeyCode::KEY_M, "m", None, Some("M"));
        set(KeyCode::KEY_COMMA, ",", Some("comma"), Some("<"));
        set(KeyCode::KEY_DOT, ".", Some("dot"), Some(">"));
        set(KeyCode::KEY_SLASH, "/", Some("slash"), Some("?"));
        set(KeyCode::KEY_RIGHTSHIFT, "rightshift", None, None);
        set(KeyCode::KEY_KPASTERISK, "kpasterisk", None, None);
        set(KeyCode::KEY_LEFTALT, "leftalt", None, None);
        set(KeyCode::KEY_SPACE, "space", Some(" "), None);
        set(KeyCode::KEY_CAPSLOCK, "capslock", None, None);
        set(KeyCode::KEY_F1, "f1", None, None);
        set(KeyCode::KEY_F2, "f2", None, None);
        set(KeyCode::KEY_F3, "f3", None, None);
        set(KeyCode::KEY_F4, "f4", None, None);
        set(KeyCode::KEY_F5, "f5", None, None);
        set(KeyCode::KEY_F6, "f6", None, None);
        set(KeyCode::KEY_F7, "f7", None, None);
        set(KeyCode::KEY_F8, "f8", None, None);
        set(KeyCode::KEY_F9, "f9", None, None);
        set(KeyCode::KEY_F10, "f10", None, None);
        set(KeyCode::KEY_NUMLOCK, "numlock", None, None);
        set(KeyCode::KEY_SCROLLLOCK, "scrolllock", None, None);
        set(KeyCode::KEY_KP7, "kp7", None, None);
        set(KeyCode::KEY_KP8, "kp8", None, None);
        set(KeyCode::KEY_KP9, "kp9", None, None);
        set(KeyCode::KEY_KPMINUS, "kpminus", None, None);
        set(KeyCode::KEY_KP4, "kp4", None, None);
        set(KeyCode::KEY_KP5, "kp5", None, None);
        set(KeyCode::KEY_KP6, "kp6", None, None);
        set(KeyCode::KEY_KPPLUS, "kpplus", None, None);
        set(KeyCode::KEY_KP1, "kp1", None, None);
        set(KeyCode::KEY_KP2, "kp2", None, None);
        set(KeyCode::KEY_KP3, "kp3", None, None);
        set(KeyCode::KEY_KP0, "kp0", None, None);
        set(KeyCode::KEY_KPDOT, "kpdot", None, None);
        set(KeyCode::KEY_ZENKAKUHANKAKU, "zenkakuhankaku", None, None);
        set(KeyCode::KEY_102ND, "102nd", None, None);
        set(KeyCode::KEY_F11, "f11", None, None);
        set(KeyCode::KEY_F12, "f12", None, None);
        set(KeyCode::KEY_RO, "ro", None, None);
        set(KeyCode::KEY_KATAKANA, "katakana", None, None);
        set(KeyCode::KEY_HIRAGANA, "hiragana", None, None);
        set(KeyCode::KEY_HENKAN, "henkan", None, None);
        set(KeyCode::KEY_KATAKANAHIRAGANA, "katakanahiragana", None, None);
        set(KeyCode::KEY_MUHENKAN, "muhenkan", None, None);
        set(KeyCode::KEY_KPJPCOMMA, "kpjpcomma", None, None);
        set(KeyCode::KEY_KPENTER, "kpenter", None, None);
        set(KeyCode::KEY_RIGHTCTRL, "rightcontrol", Some("rightctrl"), None);
        set(KeyCode::KEY_KPSLASH, "kpslash", None, None);
        set(KeyCode::KEY_SYSRQ, "sysrq", None, None);
        set(KeyCode::KEY_RIGHTALT, "rightalt", None, None);
        set(KeyCode::KEY_LINEFEED, "linefeed", None, None);
        set(KeyCode::KEY_HOME, "home", None, None);
        set(KeyCode::KEY_UP, "up", None, None);
        set(KeyCode::KEY_PAGEUP, "pageup", None, None);
        set(KeyCode::KEY_LEFT, "left", None, None);
        set(KeyCode::KEY_RIGHT, "right", None, None);
        set(KeyCode::KEY_END, "end", None, None);
        set(KeyCode::KEY_DOWN, "down", None, None);
        set(KeyCode::KEY_PAGEDOWN, "pagedown", None, None);
        set(KeyCode::KEY_INSERT, "insert", None, None);
        set(KeyCode::KEY_DELETE, "delete", None, None);
        set(KeyCode::KEY_MACRO, "macro", None, None);
        set(KeyCode::KEY_MUTE, "mute", None, None);
        set(KeyCode::KEY_VOLUMEDOWN, "volumedown", None, None);
        set(KeyCode::KEY_VOLUMEUP, "volumeup", None, None);
        set(KeyCode::KEY_POWER, "power", None, None);
        set(KeyCode::KEY_KPEQUAL, "kpequal", None, None);
        set(KeyCode::KEY_KPPLUSMINUS, "kpplusminus", None, None);
        set(KeyCode::KEY_PAUSE, "pause", None, None);
        set(KeyCode::KEY_SCALE, "scale", None, None);
        set(KeyCode::KEY_KPCOMMA, "kpcomma", None, None);
        set(KeyCode::KEY_HANGEUL, "hangeul", None, None);
        set(KeyCode::KEY_HANJA, "hanja", None, None);
        set(KeyCode::KEY_YEN, "yen", None, None);
        set(KeyCode::KEY_LEFTMETA, "leftmeta", Some("leftsuper"), None);
        set(KeyCode::KEY_RIGHTMETA, "rightmeta", Some("rightsuper"), None);
        set(KeyCode::KEY_COMPOSE, "compose", None, None);
        set(KeyCode::KEY_STOP, "stop", None, None);
        set(KeyCode::KEY_AGAIN, "again", None, None);
        set(KeyCode::KEY_PROPS, "props", None, None);
        set(KeyCode::KEY_UNDO, "undo", None, None);
        set(KeyCode::KEY_FRONT, "front", None, None);
        set(KeyCode::KEY_COPY, "copy", None, None);
        set(KeyCode::KEY_OPEN, "open", None, None);
        set(KeyCode::KEY_PASTE, "paste", None, None);
        set(KeyCode::KEY_FIND, "find", None, None);
        set(KeyCode::KEY_CUT, "cut", None, None);
        set(KeyCode::KEY_HELP, "help", None, None);
        set(KeyCode::KEY_MENU, "menu", None, None);
        set(KeyCode::KEY_CALC, "calc", None, None);
        set(KeyCode::KEY_SETUP, "setup", None, None);
        set(KeyCode::KEY_SLEEP, "sleep", None, None);
        set(KeyCode::KEY_WAKEUP, "wakeup", None, None);
        set(KeyCode::KEY_FILE, "file", None, None);
        set(KeyCode::KEY_SENDFILE, "sendfile", None, None);
        set(KeyCode::KEY_DELETEFILE, "deletefile", None, None);
        set(KeyCode::KEY_XFER, "xfer", None, None);
        set(KeyCode::KEY_PROG1, "prog1", None, None);
        set(KeyCode::KEY_PROG2, "prog2", None, None);
        set(KeyCode::KEY_WWW, "www", None, None);
        set(KeyCode::KEY_MSDOS, "msdos", None, None);
        set(KeyCode::KEY_COFFEE, "coffee", None, None);
        set(KeyCode::KEY_ROTATE_DISPLAY, "display", None, None);
        set(KeyCode::KEY_CYCLEWINDOWS, "cyclewindows", None, None);
        set(KeyCode::KEY_MAIL, "mail", None, None);
        set(KeyCode::KEY_BOOKMARKS, "bookmarks", None, None);
        set(KeyCode::KEY_COMPUTER, "computer", None, None);
        set(KeyCode::KEY_BACK, "back", None, None);
        set(KeyCode::KEY_FORWARD, "forward", None, None);
        set(KeyCode::KEY_CLOSECD, "closecd", None, None);
        set(KeyCode::KEY_EJECTCD, "ejectcd", None, None);
        set(KeyCode::KEY_EJECTCLOSECD, "ejectclosecd", None, None);
        set(KeyCode::KEY_NEXTSONG, "nextsong", None, None);
        set(KeyCode::KEY_PLAYPAUSE, "playpause", None, None);
        set(KeyCode::KEY_PREVIOUSSONG, "previoussong", None, None);
        set(KeyCode::KEY_STOPCD, "stopcd", None, None);
        set(KeyCode::KEY_RECORD, "record", None, None);
        set(KeyCode::KEY_REWIND, "rewind", None, None);
        set(KeyCode::KEY_PHONE, "phone", None, None);
        set(KeyCode::KEY_ISO, "iso", None, None);
        set(KeyCode::KEY_CONFIG, "config", None, None);
        set(KeyCode::KEY_HOMEPAGE, "homepage", None, None);
        set(KeyCode::KEY_REFRESH, "refresh", None, None);
        set(KeyCode::KEY_EXIT, "exit", None, None);
        set(KeyCode::KEY_MOVE, "move", None, None);
        set(KeyCode::KEY_EDIT, "edit", None, None);
        set(KeyCode::KEY_SCROLLUP, "scrollup", None, None);
        set(KeyCode::KEY_SCROLLDOWN, "scrolldown", None, None);
        set(KeyCode::KEY_KPLEFTPAREN, "kpleftparen", None, None);
        set(KeyCode::KEY_KPRIGHTPAREN, "kprightparen", None, None);
        set(KeyCode::KEY_NEW, "new", None, None);
        set(KeyCode::KEY_REDO, "redo", None, None);
        set(KeyCode::KEY_F13, "f13", None, None);
        set(KeyCode::KEY_F14, "f14", None, None);
        set(KeyCode::KEY_F15, "f15", None, None);
        set(KeyCode::KEY_F16, "f16", None, None);
        set(KeyCode::KEY_F17, "f17", None, None);
        set(KeyCode::KEY_F18, "f18", None, None);
        set(KeyCode::KEY_F19, "f19", None, None);
        set(KeyCode::KEY_F20, "f20", None, None);
        set(KeyCode::KEY_F21, "f21", None, None);
        set(KeyCode::KEY_F22, "f22", None, None);
        set(KeyCode::KEY_F23, "f23", None, None);
        set(KeyCode::KEY_F24, "f24", None, None);
        set(KeyCode::KEY_PLAYCD, "playcd", None, None);
        set(KeyCode::KEY_PAUSECD, "pausecd", None, None);
        set(KeyCode::KEY_PROG3, "prog3", None, None);
        set(KeyCode::KEY_PROG4, "prog4", None, None);
        set(KeyCode::KEY_DASHBOARD, "dashboard", None, None);
        set(KeyCode::KEY_SUSPEND, "suspend", None, None);
        set(KeyCode::KEY_CLOSE, "close", None, None);
        set(KeyCode::KEY_PLAY, "play", None, None);
        set(KeyCode::KEY_FASTFORWARD, "fastforward", None, None);
        set(KeyCode::KEY_BASSBOOST, "bassboost", None, None);
        set(KeyCode::KEY_PRINT, "print", None, None);
        set(KeyCode::KEY_HP, "hp", None, None);
        set(KeyCode::KEY_CAMERA, "camera", None, None);
        set(KeyCode::KEY_SOUND, "sound", None, None);
        set(KeyCode::KEY_QUESTION, "question", None, None);
        set(KeyCode::KEY_EMAIL, "email", None, None);
        set(KeyCode::KEY_CHAT, "chat", None, None);
        set(KeyCode::KEY_SEARCH, "search", None, None);
        set(KeyCode::KEY_CONNECT, "connect", None, None);
        set(KeyCode::KEY_FINANCE, "finance", None, None);
        set(KeyCode::KEY_SPORT, "sport", None, None);
        set(KeyCode::KEY_SHOP, "shop", None, None);
        set(KeyCode::KEY_VOICECOMMAND, "voicecommand", None, None);
        set(KeyCode::KEY_CANCEL, "cancel", None, None);
        set(KeyCode::KEY_BRIGHTNESSDOWN, "brightnessdown", None, None);
        set(KeyCode::KEY_BRIGHTNESSUP, "brightnessup", None, None);
        set(KeyCode::KEY_MEDIA, "media", None, None);
        set(KeyCode::KEY_SWITCHVIDEOMODE, "switchvideomode", None, None);
        set(KeyCode::KEY_KBDILLUMTOGGLE, "kbdillumtoggle", None, None);
        set(KeyCode::KEY_KBDILLUMDOWN, "kbdillumdown", None, None);
        set(KeyCode::KEY_KBDILLUMUP, "kbdillumup", None, None);
        set(KeyCode::KEY_SEND, "send", None, None);
        set(KeyCode::KEY_REPLY, "reply", None, None);
        set(KeyCode::KEY_FORWARDMAIL, "forwardmail", None, None);
        set(KeyCode::KEY_SAVE, "save", None, None);
        set(KeyCode::KEY_DOCUMENTS, "documents", None, None);
        set(KeyCode::KEY_BATTERY, "battery", None, None);
        set(KeyCode::KEY_BLUETOOTH, "bluetooth", None, None);
        set(KeyCode::KEY_WLAN, "wlan", None, None);
        set(KeyCode::KEY_UWB, "uwb", None, None);
        set(KeyCode::KEY_UNKNOWN, "unknown", None, None);
        set(KeyCode::KEY_VIDEO_NEXT, "next", None, None);
        set(KeyCode::KEY_VIDEO_PREV, "prev", None, None);
        set(KeyCode::KEY_BRIGHTNESS_CYCLE, "cycle", None, None);
        set(KeyCode::KEY_BRIGHTNESS_AUTO, "auto", None, None);
        set(KeyCode::KEY_DISPLAY_OFF, "off", None, None);
        set(KeyCode::KEY_WWAN, "wwan", None, None);
        set(KeyCode::KEY_RFKILL, "rfkill", None, None);
        set(KeyCode::KEY_MICMUTE, "micmute", None, None);
        set(KeyCode::KEY_FN, "fn", None, None);
        set(KeyCode::KEY_ZOOM, "zoom", None, None);
        set(KeyCode::BTN_LEFT, "leftmouse", None, None);
        set(KeyCode::BTN_RIGHT, "rightmouse", None, None);
        set(KeyCode::BTN_MIDDLE, "middlemouse", None, None);
        set(KeyCode::BTN_SIDE, "mouse1", None, None);
        set(KeyCode::BTN_EXTRA, "mouse2", None, None);
        set(KeyCode::BTN_BACK, "mouseback", None, None);
        set(KeyCode::BTN_FORWARD, "mouseforward", None, None);
    }

    r[0] = KeyEnt {
        name: Some("autokey"),
        alt_name: Some("autocode"),
        shifted_name: None,
    };

    r[KEY_WHEELUP as usize].name = Some("wheelup");
    r[KEY_WHEELDOWN as usize].name = Some("wheeldown");
    r[KEY_WHEELLEFT as usize].name = Some("wheelleft");
    r[KEY_WHEELRIGHT as usize].name = Some("wheelright");

    r[(FAKEMOD_BASE + MOD_ALT as u16) as usize].name = Some("fakealt");
    r[(FAKEMOD_BASE + MOD_SUPER as u16) as usize] = KeyEnt {
        name: Some("fakemeta"),
        alt_name: Some("fakesuper"),
        shifted_name: None,
    };
    r[(FAKEMOD_BASE + MOD_SHIFT as u16) as usize].name = Some("fakeshift");
    r[(FAKEMOD_BASE + MOD_CTRL as u16) as usize] = KeyEnt {
        name: Some("fakecontrol"),
        alt_name: Some("fakectrl"),
        shifted_name: None,
    };
    r[(FAKEMOD_BASE + MOD_ALTGR as u16) as usize].name = Some("fakealtgr");
    r[(FAKEMOD_BASE + MOD_HYPER as u16) as usize].name = Some("fakehyper");
    r[(FAKEMOD_BASE + MOD_LEVEL5 as u16) as usize].name = Some("fakelevel5");
    r[(FAKEMOD_BASE + MOD_NLOCK as u16) as usize] = KeyEnt {
        name: Some("fakemod7"),
        alt_name: Some("fakenlock"),
        shifted_name: None,
    };

    r[KEY_NOOP as usize].name = Some("noop");

    let r: Box<[KeyEnt]> = r;
    r.try_into().ok().unwrap()
});

#[cfg(test)]
mod tests {
    use super::*;
    use evdev::KeyCode;

    #[test]
    fn plain_keys() {
        let (seq, rest) = parse_key_sequence("a").unwrap();
        assert_eq!(rest, 0);
        assert_eq!(seq.code, KeyCode::KEY_A.code());
        assert_eq!(seq.mods, 0);
        assert_eq!(seq.wildcard, 0);

        let (seq, rest) = parse_key_sequence("escape").unwrap();
        assert_eq!(rest, 0);
        assert_eq!(seq.code, KeyCode::KEY_ESC.code());
    }

    #[test]
    fn shifted_names_imply_shift() {
        let (seq, rest) = parse_key_sequence("A").unwrap();
        assert_eq!(rest, 0);
        assert_eq!(seq.code, KeyCode::KEY_A.code());
        assert_eq!(seq.mods, 1 << MOD_SHIFT);

        let (seq, _) = parse_key_sequence("!").unwrap();
        assert_eq!(seq.code, KeyCode::KEY_1.code());
        assert_eq!(seq.mods, 1 << MOD_SHIFT);
    }

    #[test]
    fn modifier_prefixes() {
        let (seq, rest) = parse_key_sequence("C-S-x").unwrap();
        assert_eq!(rest, 0);
        assert_eq!(seq.code, KeyCode::KEY_X.code());
        assert_eq!(seq.mods, (1 << MOD_CTRL) | (1 << MOD_SHIFT));

        let (seq, _) = parse_key_sequence("**C-t").unwrap();
        assert_eq!(seq.wildcard, 0xff);
        assert_eq!(seq.mods, 1 << MOD_CTRL);

        let (seq, _) = parse_key_sequence("M*a").unwrap();
        assert_eq!(seq.wildcard, 1 << MOD_SUPER);
        assert_eq!(seq.mods, 0);
    }

    #[test]
    fn partial_parse_returns_tail() {
        // The trailing word is not a key; callers get the tail back.
        let (seq, rest) = parse_key_sequence("C-control").unwrap();
        assert_eq!(seq.code, 0);
        assert_eq!(seq.mods, 1 << MOD_CTRL);
        assert_eq!(rest, "control".len());

        assert!(parse_key_sequence("").is_none());
    }

    #[test]
    fn numeric_names() {
        let (seq, rest) = parse_key_sequence("key_030").unwrap();
        assert_eq!(rest, 0);
        assert_eq!(seq.code, 30);
        assert_eq!(key_name(31), "s");
        assert_eq!(key_name(721), "key_721");
    }

    #[test]
    fn modstrings() {
        assert_eq!(modstring((1 << MOD_CTRL) | (1 << MOD_ALT)), "A-C-");
        assert_eq!(modstring(0), "");
    }
}
