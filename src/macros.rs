//! Macro expressions: parsing of `C-t type(hello) 100ms enter` style
//! sequences and the linear interpreter that replays them.

use crate::config::{Command, Config};
use crate::keys::{self, parse_key_sequence};
use crate::unicode;
use log::debug;
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A full key stroke with its required modifiers.
    KeySeq { code: u16, mods: u8, wildcard: u8 },
    /// Same stroke semantics, kept distinct for descriptor deep-comparison.
    KeyTap { code: u16, mods: u8, wildcard: u8 },
    /// Press without release; closed by the next `Release`.
    Hold(u16),
    Release,
    /// Index into the unicode table.
    Unicode(u32),
    /// Pause in milliseconds.
    Timeout(u16),
    /// Index into the config's command table.
    Command(u16),
}

impl Step {
    pub fn is_stroke(&self) -> bool {
        matches!(self, Step::KeySeq { .. } | Step::KeyTap { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Macro(pub Vec<Step>);

impl Macro {
    /// A macro consisting of exactly one key stroke behaves like a plain
    /// key sequence in several descriptor paths.
    pub fn as_single_stroke(&self) -> Option<(u16, u8, u8)> {
        match self.0.as_slice() {
            [Step::KeySeq { code, mods, wildcard }] | [Step::KeyTap { code, mods, wildcard }] => {
                Some((*code, *mods, *wildcard))
            }
            _ => None,
        }
    }

    /// Like [`Self::as_single_stroke`] but only for full key sequences,
    /// which carry release semantics of their own.
    pub fn as_single_seq(&self) -> Option<(u16, u8, u8)> {
        match self.0.as_slice() {
            [Step::KeySeq { code, mods, wildcard }] => Some((*code, *mods, *wildcard)),
            _ => None,
        }
    }
}

/// Resolves `\n`, `\t`, `\\`, `\(` and `\)` escapes.
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(e @ ('\\' | '(' | ')')) => out.push(e),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => break,
        }
    }

    out
}

fn push_char(entries: &mut Vec<Step>, c: char) -> bool {
    if c.is_ascii() {
        let mut buf = [0u8; 4];
        let name: &str = c.encode_utf8(&mut buf);

        for (code, ent) in keys::keycode_table().iter().enumerate() {
            let single = |n: Option<&str>| n.is_some_and(|n| n == name);

            if single(ent.name) || single(ent.alt_name) {
                entries.push(Step::KeySeq {
                    code: code as u16,
                    mods: 0,
                    wildcard: 0,
                });
                return true;
            }
            if single(ent.shifted_name) {
                entries.push(Step::KeySeq {
                    code: code as u16,
                    mods: 1 << keys::MOD_SHIFT,
                    wildcard: 0,
                });
                return true;
            }
        }
        false
    } else if let Some(idx) = unicode::lookup_index(c as u32) {
        entries.push(Step::Unicode(idx));
        true
    } else {
        false
    }
}

/// Locates the unescaped `)` terminating a `type(`/`cmd(` body.
fn body_end(s: &str) -> Option<usize> {
    let b = s.as_bytes();
    let mut i = 0;

    while i < b.len() {
        match b[i] {
            b'\\' => i += 1,
            b')' => return Some(i),
            _ => {}
        }
        i += 1;
    }

    None
}

fn timeout_token(tok: &str) -> Option<u16> {
    let ms = tok.strip_suffix("ms")?;
    if ms.is_empty() || !ms.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    ms.parse().ok()
}

/// Parses a macro expression into `mac`, appending any `cmd(...)` bodies to
/// the config's command table.
pub fn parse(s: &str, config: &mut Config) -> Result<Macro, String> {
    let mut entries = Vec::new();
    let mut s = s.trim_start();

    while !s.is_empty() {
        let tok = s.split_whitespace().next().unwrap_or("");

        let is_cmd = tok.starts_with("cmd(") || tok.starts_with("command(");
        let is_text = ["type(", "text(", "txt(", "t("]
            .iter()
            .any(|p| tok.starts_with(p));

        if is_cmd || is_text {
            let open = s.find('(').unwrap();
            let body = &s[open + 1..];
            let Some(end) = body_end(body) else {
                return Err("incomplete macro command".into());
            };
            let body_text = unescape(&body[..end]);
            s = body[end + 1..].trim_start();

            if is_cmd {
                if config.commands.len() > i16::MAX as usize {
                    return Err("max commands exceeded".into());
                }
                entries.push(Step::Command(config.commands.len() as u16));
                config.commands.push(Command {
                    uid: config.cmd_uid,
                    gid: config.cmd_gid,
                    cmd: body_text,
                    env: config.cmd_env.clone(),
                });
            } else {
                for c in body_text.chars() {
                    if !push_char(&mut entries, c) {
                        return Err(format!("invalid macro text: {body_text}"));
                    }
                }
            }
            continue;
        }

        s = s[tok.len()..].trim_start();
        let tok = unescape(tok);

        if let Some((seq, 0)) = parse_key_sequence(&tok) {
            if seq.code != 0 {
                if seq.wildcard != 0 {
                    return Err(format!("{tok} has a wildcard inside a macro"));
                }
                entries.push(Step::KeySeq {
                    code: seq.code,
                    mods: seq.mods,
                    wildcard: 0,
                });
                continue;
            }
        }

        if tok.contains('+') {
            for part in tok.split('+') {
                if let Some(ms) = timeout_token(part) {
                    entries.push(Step::Timeout(ms));
                } else {
                    match parse_key_sequence(part) {
                        Some((seq, 0)) if seq.code != 0 && seq.mods == 0 && seq.wildcard == 0 => {
                            entries.push(Step::Hold(seq.code))
                        }
                        _ => {
                            return Err(format!("{part} is not a valid compound key or timeout"));
                        }
                    }
                }
            }
            entries.push(Step::Release);
            continue;
        }

        if let Some(ms) = timeout_token(&tok) {
            entries.push(Step::Timeout(ms));
            continue;
        }

        let mut chars = tok.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            if push_char(&mut entries, c) {
                continue;
            }
        }

        return Err(format!("{tok} is not a valid key sequence"));
    }

    Ok(Macro(entries))
}

/// Replays `mac` through `output`, sleeping `timeout_us` between steps.
/// Returns the total time slept, in microseconds.
pub fn execute(
    output: &mut dyn FnMut(u16, bool),
    mac: &Macro,
    timeout_us: u64,
    config: &Config,
) -> u64 {
    let mut slept = 0u64;
    let mut hold_start: Option<usize> = None;

    let mut sleep_us = |us: u64, total: &mut u64| {
        if us > 0 {
            thread::sleep(Duration::from_micros(us));
            *total += us;
        }
    };

    for (i, step) in mac.0.iter().enumerate() {
        match *step {
            Step::Hold(code) => {
                hold_start.get_or_insert(i);
                output(code, true);
            }
            Step::Release => {
                if let Some(start) = hold_start.take() {
                    for held in &mac.0[start..i] {
                        if let Step::Hold(code) = held {
                            output(*code, false);
                        }
                    }
                }
            }
            Step::Unicode(idx) => {
                for code in unicode::sequence(idx) {
                    output(code, true);
                    output(code, false);
                }
            }
            Step::KeySeq { code, mods, .. } | Step::KeyTap { code, mods, .. } => {
                for (class, codes) in config.modifiers.iter().enumerate() {
                    if mods & (1 << class) != 0 {
                        if let Some(&key) = codes.first() {
                            output(key, true);
                        }
                    }
                }

                if mods != 0 {
                    sleep_us(timeout_us, &mut slept);
                }

                output(code, true);
                output(code, false);

                for (class, codes) in config.modifiers.iter().enumerate() {
                    if mods & (1 << class) != 0 {
                        if let Some(&key) = codes.first() {
                            output(key, false);
                        }
                    }
                }
            }
            Step::Timeout(ms) => {
                sleep_us(u64::from(ms) * 1000, &mut slept);
            }
            Step::Command(idx) => {
                if let Some(cmd) = config.commands.get(idx as usize) {
                    execute_command(cmd);
                }
            }
        }

        sleep_us(timeout_us, &mut slept);
    }

    slept
}

/// Spawns `sh -c <cmd>` detached, with stdio on /dev/null, dropped to the
/// captured credentials and environment.
pub fn execute_command(cmd: &Command) {
    debug!("executing command: {}", cmd.cmd);

    let mut child = std::process::Command::new("/bin/sh");
    child
        .arg("-c")
        .arg(&cmd.cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    if cmd.gid != 0 {
        child.gid(cmd.gid);
    }
    if cmd.uid != 0 {
        child.uid(cmd.uid);
    }

    if let Some(env) = &cmd.env {
        child.env_clear();
        child.envs(env.vars());
    }

    match child.spawn() {
        Ok(_) => (),
        Err(e) => log::error!("failed to spawn {}: {e}", cmd.cmd),
    }
}
