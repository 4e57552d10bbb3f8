//! End-to-end engine scenarios: events in, emitted key transitions out.

use evdev::KeyCode;
use remapd::config::{self, Config};
use remapd::keyboard::{KeyEvent, Keyboard, LayerEvent, Output};

#[derive(Default)]
struct Recorder {
    keys: Vec<(u16, bool)>,
    layers: Vec<(String, char)>,
}

impl Output for Recorder {
    fn send_key(&mut self, code: u16, pressed: bool) {
        self.keys.push((code, pressed));
    }

    fn on_layer_change(&mut self, event: &LayerEvent) {
        self.layers.push((event.name.to_owned(), event.state));
    }
}

fn keyboard(content: &str) -> Keyboard {
    let mut config = Config::default();
    config::parse_string(&mut config, content).unwrap();
    config.finalize();
    Keyboard::new(config)
}

fn down(code: KeyCode, t: i64) -> KeyEvent {
    KeyEvent {
        code: code.code(),
        pressed: true,
        timestamp: t,
    }
}

fn up(code: KeyCode, t: i64) -> KeyEvent {
    KeyEvent {
        code: code.code(),
        pressed: false,
        timestamp: t,
    }
}

fn run(kbd: &mut Keyboard, events: &[KeyEvent]) -> Vec<(u16, bool)> {
    let mut out = Recorder::default();
    kbd.process_events(&mut out, events, true);
    out.keys
}

fn named(out: &[(u16, bool)]) -> Vec<(KeyCode, bool)> {
    out.iter().map(|&(c, p)| (KeyCode::new(c), p)).collect()
}

#[test]
fn plain_remap() {
    let mut kbd = keyboard("[main]\na = b\n");
    let out = run(&mut kbd, &[down(KeyCode::KEY_A, 0), up(KeyCode::KEY_A, 5)]);

    assert_eq!(
        named(&out),
        vec![(KeyCode::KEY_B, true), (KeyCode::KEY_B, false)]
    );
}

#[test]
fn overload_hold() {
    let mut kbd = keyboard("[main]\nspace = overload(shift, space)\n");
    let out = run(
        &mut kbd,
        &[
            down(KeyCode::KEY_SPACE, 0),
            down(KeyCode::KEY_X, 5),
            up(KeyCode::KEY_X, 10),
            up(KeyCode::KEY_SPACE, 15),
        ],
    );

    assert_eq!(
        named(&out),
        vec![
            (KeyCode::KEY_LEFTSHIFT, true),
            (KeyCode::KEY_X, true),
            (KeyCode::KEY_X, false),
            (KeyCode::KEY_LEFTSHIFT, false),
        ]
    );
}

#[test]
fn overload_tap() {
    let mut kbd = keyboard(
        "[global]\noverload_tap_timeout = 200\n\n[main]\nspace = overload(shift, space)\n",
    );
    let out = run(
        &mut kbd,
        &[down(KeyCode::KEY_SPACE, 0), up(KeyCode::KEY_SPACE, 50)],
    );

    assert_eq!(
        named(&out),
        vec![
            (KeyCode::KEY_LEFTSHIFT, true),
            (KeyCode::KEY_LEFTSHIFT, false),
            (KeyCode::KEY_SPACE, true),
            (KeyCode::KEY_SPACE, false),
        ]
    );
}

#[test]
fn overload_slow_release_does_not_tap() {
    let mut kbd = keyboard(
        "[global]\noverload_tap_timeout = 200\n\n[main]\nspace = overload(shift, space)\n",
    );
    let out = run(
        &mut kbd,
        &[down(KeyCode::KEY_SPACE, 0), up(KeyCode::KEY_SPACE, 300)],
    );

    assert_eq!(
        named(&out),
        vec![
            (KeyCode::KEY_LEFTSHIFT, true),
            (KeyCode::KEY_LEFTSHIFT, false),
        ]
    );
}

#[test]
fn oneshot_modifier() {
    let mut kbd = keyboard("[main]\ncapslock = oneshot(shift)\n");
    let out = run(
        &mut kbd,
        &[
            down(KeyCode::KEY_CAPSLOCK, 0),
            up(KeyCode::KEY_CAPSLOCK, 5),
            down(KeyCode::KEY_A, 10),
            up(KeyCode::KEY_A, 15),
            down(KeyCode::KEY_B, 20),
            up(KeyCode::KEY_B, 25),
        ],
    );

    assert_eq!(
        named(&out),
        vec![
            (KeyCode::KEY_LEFTSHIFT, true),
            (KeyCode::KEY_A, true),
            (KeyCode::KEY_A, false),
            (KeyCode::KEY_LEFTSHIFT, false),
            (KeyCode::KEY_B, true),
            (KeyCode::KEY_B, false),
        ]
    );
}

#[test]
fn oneshot_expires_after_timeout() {
    let mut kbd = keyboard(
        "[global]\noneshot_timeout = 200\n\n[main]\ncapslock = oneshot(shift)\n",
    );
    let out = run(
        &mut kbd,
        &[
            down(KeyCode::KEY_CAPSLOCK, 0),
            up(KeyCode::KEY_CAPSLOCK, 5),
            down(KeyCode::KEY_A, 500),
            up(KeyCode::KEY_A, 505),
        ],
    );

    assert_eq!(
        named(&out),
        vec![
            (KeyCode::KEY_LEFTSHIFT, true),
            (KeyCode::KEY_LEFTSHIFT, false),
            (KeyCode::KEY_A, true),
            (KeyCode::KEY_A, false),
        ]
    );
}

#[test]
fn chord_fires() {
    let mut kbd = keyboard("[global]\nchord_timeout = 50\n\n[main]\nj+k = esc\n");
    let out = run(
        &mut kbd,
        &[
            down(KeyCode::KEY_J, 0),
            down(KeyCode::KEY_K, 10),
            up(KeyCode::KEY_J, 40),
            up(KeyCode::KEY_K, 45),
        ],
    );

    assert_eq!(
        named(&out),
        vec![(KeyCode::KEY_ESC, true), (KeyCode::KEY_ESC, false)]
    );
}

#[test]
fn chord_aborts_to_plain_keys() {
    let mut kbd = keyboard("[global]\nchord_timeout = 50\n\n[main]\nj+k = esc\n");
    let out = run(&mut kbd, &[down(KeyCode::KEY_J, 0), up(KeyCode::KEY_J, 100)]);

    assert_eq!(
        named(&out),
        vec![(KeyCode::KEY_J, true), (KeyCode::KEY_J, false)]
    );
}

#[test]
fn chord_abort_matches_plain_processing() {
    // Whatever the chord resolver does on abort must be byte-identical to
    // a config without the chord.
    let events = [
        down(KeyCode::KEY_J, 0),
        down(KeyCode::KEY_H, 10),
        up(KeyCode::KEY_H, 20),
        up(KeyCode::KEY_J, 30),
    ];

    let mut with_chord = keyboard("[global]\nchord_timeout = 50\n\n[main]\nj+k = esc\n");
    let mut without = keyboard("[main]\n# no chords\na = a\n");

    assert_eq!(
        run(&mut with_chord, &events),
        run(&mut without, &events)
    );
}

#[test]
fn pending_timeout_resolves_to_action2_on_expiry() {
    let mut kbd = keyboard("[main]\na = timeout(b, 100, c)\n");
    let out = run(&mut kbd, &[down(KeyCode::KEY_A, 0), up(KeyCode::KEY_A, 300)]);

    assert_eq!(
        named(&out),
        vec![(KeyCode::KEY_C, true), (KeyCode::KEY_C, false)]
    );
}

#[test]
fn pending_timeout_resolves_to_action1_on_quick_release() {
    let mut kbd = keyboard("[main]\na = timeout(b, 100, c)\n");
    let out = run(&mut kbd, &[down(KeyCode::KEY_A, 0), up(KeyCode::KEY_A, 30)]);

    assert_eq!(
        named(&out),
        vec![(KeyCode::KEY_B, true), (KeyCode::KEY_B, false)]
    );
}

#[test]
fn pending_timeout_interrupted_by_other_press() {
    let mut kbd = keyboard("[main]\na = timeout(b, 100, c)\n");
    let out = run(
        &mut kbd,
        &[
            down(KeyCode::KEY_A, 0),
            down(KeyCode::KEY_X, 20),
            up(KeyCode::KEY_X, 30),
            up(KeyCode::KEY_A, 40),
        ],
    );

    assert_eq!(
        named(&out),
        vec![
            (KeyCode::KEY_B, true),
            (KeyCode::KEY_X, true),
            (KeyCode::KEY_X, false),
            (KeyCode::KEY_B, false),
        ]
    );
}

#[test]
fn overloadt_holds_through_interrupting_press() {
    // Uninterruptible: the interposed press queues until expiry, then
    // replays under the layer.
    let mut kbd = keyboard("[main]\nspace = overloadt(shift, space, 150)\n");
    let out = run(
        &mut kbd,
        &[
            down(KeyCode::KEY_SPACE, 0),
            down(KeyCode::KEY_X, 50),
            up(KeyCode::KEY_X, 60),
            up(KeyCode::KEY_SPACE, 300),
        ],
    );

    assert_eq!(
        named(&out),
        vec![
            (KeyCode::KEY_LEFTSHIFT, true),
            (KeyCode::KEY_X, true),
            (KeyCode::KEY_X, false),
            (KeyCode::KEY_LEFTSHIFT, false),
        ]
    );
}

#[test]
fn overloadt_quick_release_taps() {
    let mut kbd = keyboard("[main]\nspace = overloadt(shift, space, 150)\n");
    let out = run(
        &mut kbd,
        &[down(KeyCode::KEY_SPACE, 0), up(KeyCode::KEY_SPACE, 50)],
    );

    assert_eq!(
        named(&out),
        vec![(KeyCode::KEY_SPACE, true), (KeyCode::KEY_SPACE, false)]
    );
}

#[test]
fn overloadt2_resolves_to_layer_on_foreign_release() {
    let mut kbd = keyboard("[main]\nspace = overloadt2(shift, space, 150)\n");
    let out = run(
        &mut kbd,
        &[
            down(KeyCode::KEY_SPACE, 0),
            down(KeyCode::KEY_X, 30),
            up(KeyCode::KEY_X, 60),
            up(KeyCode::KEY_SPACE, 80),
        ],
    );

    assert_eq!(
        named(&out),
        vec![
            (KeyCode::KEY_LEFTSHIFT, true),
            (KeyCode::KEY_X, true),
            (KeyCode::KEY_X, false),
            (KeyCode::KEY_LEFTSHIFT, false),
        ]
    );
}

#[test]
fn macro_fires_and_repeats() {
    let mut kbd = keyboard("[main]\na = macro(b)\n");
    let out = run(&mut kbd, &[down(KeyCode::KEY_A, 0), up(KeyCode::KEY_A, 800)]);

    // Initial fire plus at least one auto-repeat after macro_timeout.
    let b = KeyCode::KEY_B.code();
    let taps = out.iter().filter(|&&(c, p)| c == b && p).count();
    assert!(taps >= 2, "expected repeats, got {out:?}");

    let releases = out.iter().filter(|&&(c, p)| c == b && !p).count();
    assert_eq!(taps, releases);
}

#[test]
fn macro_repeat_cancelled_by_other_key() {
    let mut kbd = keyboard("[main]\na = macro(b)\n");
    let out = run(
        &mut kbd,
        &[
            down(KeyCode::KEY_A, 0),
            down(KeyCode::KEY_X, 10),
            up(KeyCode::KEY_X, 15),
            up(KeyCode::KEY_A, 20),
        ],
    );

    let b = KeyCode::KEY_B.code();
    let taps = out.iter().filter(|&&(c, p)| c == b && p).count();
    assert_eq!(taps, 1);
}

#[test]
fn layers_stack_and_release_in_order() {
    let mut kbd = keyboard(
        "[main]\ncapslock = layer(nav)\n\n[nav]\nh = left\nj = down\n",
    );

    let out = run(
        &mut kbd,
        &[
            down(KeyCode::KEY_CAPSLOCK, 0),
            down(KeyCode::KEY_H, 5),
            up(KeyCode::KEY_H, 10),
            down(KeyCode::KEY_J, 15),
            up(KeyCode::KEY_J, 20),
            up(KeyCode::KEY_CAPSLOCK, 25),
            down(KeyCode::KEY_H, 30),
            up(KeyCode::KEY_H, 35),
        ],
    );

    assert_eq!(
        named(&out),
        vec![
            (KeyCode::KEY_LEFT, true),
            (KeyCode::KEY_LEFT, false),
            (KeyCode::KEY_DOWN, true),
            (KeyCode::KEY_DOWN, false),
            (KeyCode::KEY_H, true),
            (KeyCode::KEY_H, false),
        ]
    );
}

#[test]
fn toggle_layer() {
    let mut kbd = keyboard("[main]\ncapslock = toggle(nav)\n\n[nav]\nh = left\n");

    let out = run(
        &mut kbd,
        &[
            down(KeyCode::KEY_CAPSLOCK, 0),
            up(KeyCode::KEY_CAPSLOCK, 5),
            down(KeyCode::KEY_H, 10),
            up(KeyCode::KEY_H, 15),
            down(KeyCode::KEY_CAPSLOCK, 20),
            up(KeyCode::KEY_CAPSLOCK, 25),
            down(KeyCode::KEY_H, 30),
            up(KeyCode::KEY_H, 35),
        ],
    );

    assert_eq!(
        named(&out),
        vec![
            (KeyCode::KEY_LEFT, true),
            (KeyCode::KEY_LEFT, false),
            (KeyCode::KEY_H, true),
            (KeyCode::KEY_H, false),
        ]
    );
}

#[test]
fn swap_retargets_held_layer() {
    let mut kbd = keyboard(
        "[main]\ncapslock = layer(a_layer)\n\n\
         [a_layer]\nx = swap(b_layer)\nh = left\n\n[b_layer]\nh = right\n",
    );

    let out = run(
        &mut kbd,
        &[
            down(KeyCode::KEY_CAPSLOCK, 0),
            down(KeyCode::KEY_X, 5),
            up(KeyCode::KEY_X, 10),
            down(KeyCode::KEY_H, 15),
            up(KeyCode::KEY_H, 20),
            up(KeyCode::KEY_CAPSLOCK, 25),
            down(KeyCode::KEY_H, 30),
            up(KeyCode::KEY_H, 35),
        ],
    );

    assert_eq!(
        named(&out),
        vec![
            (KeyCode::KEY_RIGHT, true),
            (KeyCode::KEY_RIGHT, false),
            (KeyCode::KEY_H, true),
            (KeyCode::KEY_H, false),
        ]
    );
}

#[test]
fn overload_idle_picks_by_recency() {
    // Fast typing keeps the letter behaviour; idle hands get the hold.
    let mut kbd = keyboard("[main]\nf = overloadi(f, overloadt2(shift, f, 150), 120)\n");

    // A simple key just before `f`: not idle, resolve to the letter.
    let out = run(
        &mut kbd,
        &[
            down(KeyCode::KEY_A, 0),
            up(KeyCode::KEY_A, 10),
            down(KeyCode::KEY_F, 50),
            up(KeyCode::KEY_F, 60),
        ],
    );

    assert_eq!(
        named(&out),
        vec![
            (KeyCode::KEY_A, true),
            (KeyCode::KEY_A, false),
            (KeyCode::KEY_F, true),
            (KeyCode::KEY_F, false),
        ]
    );
}

#[test]
fn modifier_guard_wraps_lone_meta_release() {
    let mut kbd = keyboard(
        "[global]\noneshot_timeout = 200\n\n[main]\ncapslock = oneshot(meta)\n",
    );
    let out = run(
        &mut kbd,
        &[
            down(KeyCode::KEY_CAPSLOCK, 0),
            up(KeyCode::KEY_CAPSLOCK, 5),
            down(KeyCode::KEY_A, 500),
            up(KeyCode::KEY_A, 505),
        ],
    );

    assert_eq!(
        named(&out),
        vec![
            (KeyCode::KEY_LEFTMETA, true),
            (KeyCode::KEY_LEFTCTRL, true),
            (KeyCode::KEY_LEFTMETA, false),
            (KeyCode::KEY_LEFTCTRL, false),
            (KeyCode::KEY_A, true),
            (KeyCode::KEY_A, false),
        ]
    );
}

#[test]
fn modifier_guard_can_be_disabled() {
    let mut kbd = keyboard(
        "[global]\noneshot_timeout = 200\ndisable_modifier_guard = 1\n\n\
         [main]\ncapslock = oneshot(meta)\n",
    );
    let out = run(
        &mut kbd,
        &[
            down(KeyCode::KEY_CAPSLOCK, 0),
            up(KeyCode::KEY_CAPSLOCK, 5),
            down(KeyCode::KEY_A, 500),
            up(KeyCode::KEY_A, 505),
        ],
    );

    assert_eq!(
        named(&out),
        vec![
            (KeyCode::KEY_LEFTMETA, true),
            (KeyCode::KEY_LEFTMETA, false),
            (KeyCode::KEY_A, true),
            (KeyCode::KEY_A, false),
        ]
    );
}

#[test]
fn shifted_binding_synthesizes_shift() {
    // `A` on the right-hand side requires shift, which nothing holds; the
    // engine wraps the stroke in a synthetic shift press.
    let mut kbd = keyboard("[main]\nb = A\n");
    let out = run(&mut kbd, &[down(KeyCode::KEY_B, 0), up(KeyCode::KEY_B, 5)]);

    assert_eq!(
        named(&out),
        vec![
            (KeyCode::KEY_LEFTSHIFT, true),
            (KeyCode::KEY_A, true),
            (KeyCode::KEY_A, false),
            (KeyCode::KEY_LEFTSHIFT, false),
        ]
    );
}

#[test]
fn physically_held_modifiers_are_not_duplicated() {
    // Holding real shift and striking an unbound key passes through with
    // the one physical shift press, never a second synthetic one.
    let mut kbd = keyboard("[main]\na = b\n");
    let out = run(
        &mut kbd,
        &[
            down(KeyCode::KEY_LEFTSHIFT, 0),
            down(KeyCode::KEY_X, 5),
            up(KeyCode::KEY_X, 10),
            up(KeyCode::KEY_LEFTSHIFT, 15),
        ],
    );

    let shift_downs = out
        .iter()
        .filter(|&&(c, p)| c == KeyCode::KEY_LEFTSHIFT.code() && p)
        .count();
    assert_eq!(shift_downs, 1);
    assert!(out.contains(&(KeyCode::KEY_X.code(), true)));
}

#[test]
fn deterministic_replay() {
    let events = [
        down(KeyCode::KEY_SPACE, 0),
        down(KeyCode::KEY_X, 5),
        up(KeyCode::KEY_X, 10),
        up(KeyCode::KEY_SPACE, 200),
        down(KeyCode::KEY_A, 300),
        up(KeyCode::KEY_A, 310),
    ];
    let conf = "[global]\noverload_tap_timeout = 100\n\n\
                [main]\nspace = overload(shift, space)\na = timeout(b, 50, c)\n";

    let first = run(&mut keyboard(conf), &events);
    let second = run(&mut keyboard(conf), &events);
    assert_eq!(first, second);
}
