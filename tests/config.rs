//! Configuration parsing against real files: includes, depth limits, and
//! runtime binding mutation with snapshot/restore.

use evdev::KeyCode;
use remapd::config::{self, Config};
use remapd::keyboard::{KeyEvent, Keyboard, LayerEvent, Output};
use std::fs;
use std::path::PathBuf;

struct TempDir(PathBuf);

impl TempDir {
    fn new(tag: &str) -> TempDir {
        let path = std::env::temp_dir().join(format!("remapd-test-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&path);
        fs::create_dir_all(&path).unwrap();
        TempDir(path)
    }

    fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.0.join(name);
        fs::write(&path, content).unwrap();
        path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

#[test]
fn parse_file_with_include() {
    let dir = TempDir::new("include");
    dir.write("common", "[main]\n1 = f1\n");
    let main = dir.write("kbd.conf", "include common\n\n[main]\na = b\n");

    let mut config = Config::default();
    config::parse_file(&mut config, &main).unwrap();
    config.finalize();

    let keymap = &config.layers[0].keymap;
    assert!(keymap.get(KeyCode::KEY_A.code(), 0).is_some());
    assert!(keymap.get(KeyCode::KEY_1.code(), 0).is_some());
}

#[test]
fn include_cycle_terminates() {
    let dir = TempDir::new("cycle");
    let a = dir.0.join("a");
    let b = dir.0.join("b");
    fs::write(&a, "include b\n[main]\na = b\n").unwrap();
    fs::write(&b, format!("include {}\n", a.display())).unwrap();

    // Depth-limited: the cycle is reported and the real content survives.
    let mut config = Config::default();
    let path = dir.write("kbd.conf", &format!("include {}\n", a.display()));
    config::parse_file(&mut config, &path).unwrap();
    config.finalize();

    assert!(config.layers[0]
        .keymap
        .get(KeyCode::KEY_A.code(), 0)
        .is_some());
}

#[test]
fn conf_extension_is_not_includable() {
    let dir = TempDir::new("ext");
    dir.write("other.conf", "[main]\n1 = f1\n");
    let main = dir.write("kbd.conf", "include other.conf\n[main]\na = b\n");

    let mut config = Config::default();
    config::parse_file(&mut config, &main).unwrap();
    config.finalize();

    assert!(config.layers[0]
        .keymap
        .get(KeyCode::KEY_1.code(), 0)
        .is_none());
}

#[test]
fn missing_file_is_an_error() {
    let mut config = Config::default();
    assert!(config::parse_file(&mut config, std::path::Path::new("/nonexistent/x")).is_err());
}

struct NullSink;

impl Output for NullSink {
    fn send_key(&mut self, _code: u16, _pressed: bool) {}
    fn on_layer_change(&mut self, _event: &LayerEvent) {}
}

#[test]
fn runtime_bind_and_reset_round_trip() {
    let dir = TempDir::new("bind");
    let path = dir.write("kbd.conf", "[main]\na = b\n\n[nav]\nh = left\n");

    let mut config = Config::default();
    config::parse_file(&mut config, &path).unwrap();
    config.finalize();
    let mut kbd = Keyboard::new(config);

    kbd.ensure_backup();
    assert!(kbd.eval("a = esc"));
    assert!(kbd.eval("nav.j = down"));
    assert!(kbd.eval("newlayer.x = y"));
    assert!(!kbd.eval("notakey = b"));

    // The mutated bindings are live.
    let mut sink = NullSink;
    kbd.process_events(
        &mut sink,
        &[
            KeyEvent {
                code: KeyCode::KEY_A.code(),
                pressed: true,
                timestamp: 0,
            },
            KeyEvent {
                code: KeyCode::KEY_A.code(),
                pressed: false,
                timestamp: 1,
            },
        ],
        true,
    );

    assert!(kbd.eval("reset"));

    let keymap = &kbd.config.layers[0].keymap;
    let d = keymap.get(KeyCode::KEY_A.code(), 0).unwrap();
    assert_eq!(d.args[0].code(), KeyCode::KEY_B.code());
    assert!(!kbd.config.layer_names.contains_key("newlayer"));
}

#[test]
fn unbind_all_empties_every_layer() {
    let dir = TempDir::new("unbind");
    let path = dir.write("kbd.conf", "[main]\na = b\nj+k = esc\n\n[nav]\nh = left\n");

    let mut config = Config::default();
    config::parse_file(&mut config, &path).unwrap();
    config.finalize();
    let mut kbd = Keyboard::new(config);

    assert!(kbd.eval("unbind_all"));
    assert!(kbd
        .config
        .layers
        .iter()
        .all(|l| l.keymap.is_empty() && l.chords.is_empty()));
}

#[test]
fn default_layout_is_activated() {
    let dir = TempDir::new("layout");
    let path = dir.write(
        "kbd.conf",
        "[global]\ndefault_layout = colemak\n\n[colemak]\ne = f\n\n[main]\na = b\n",
    );

    let mut config = Config::default();
    config::parse_file(&mut config, &path).unwrap();
    config.finalize();
    let kbd = Keyboard::new(config);

    let idx = kbd.config.layer_names["colemak"];
    assert_eq!(kbd.layout(), idx);
    assert!(kbd.active_layers().contains(&idx));
}
