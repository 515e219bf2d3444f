//! ANSI styling for the dashboard.
//!
//! Plain text when stdout is piped or `NO_COLOR` is set; the decision is
//! made once and cached in a tri-state flag.

use std::io::IsTerminal;
use std::sync::atomic::{AtomicU8, Ordering};

const UNDECIDED: u8 = 0;
const COLOR_ON: u8 = 1;
const COLOR_OFF: u8 = 2;

static STATE: AtomicU8 = AtomicU8::new(UNDECIDED);

fn colors_on() -> bool {
    match STATE.load(Ordering::Relaxed) {
        COLOR_ON => true,
        COLOR_OFF => false,
        _ => {
            let on =
                std::env::var_os("NO_COLOR").is_none() && std::io::stdout().is_terminal();
            STATE.store(if on { COLOR_ON } else { COLOR_OFF }, Ordering::Relaxed);
            on
        }
    }
}

/// Wrap `s` in a single SGR attribute.
fn paint(code: u8, s: &str) -> String {
    if colors_on() {
        format!("\x1b[{code}m{s}\x1b[0m")
    } else {
        s.to_owned()
    }
}

pub fn bold(s: &str) -> String {
    paint(1, s)
}

pub fn dim(s: &str) -> String {
    paint(2, s)
}

pub fn green(s: &str) -> String {
    paint(32, s)
}

pub fn yellow(s: &str) -> String {
    paint(33, s)
}

#[allow(dead_code)]
pub fn red(s: &str) -> String {
    paint(31, s)
}

pub fn bold_cyan(s: &str) -> String {
    bold(&paint(36, s))
}
