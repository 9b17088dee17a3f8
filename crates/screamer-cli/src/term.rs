//! Terminal raw mode and console byte I/O for the `sac` relay.

use std::io::{self, Write};
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;

use crate::console::ConsoleIo;

/// Puts the terminal into raw mode for the lifetime of the guard.
pub struct RawModeGuard(());

impl RawModeGuard {
    pub fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(RawModeGuard(()))
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Console relay backed by the local terminal. Output bytes go straight to
/// stdout; input is polled without blocking, since the firmware expects 0xFF
/// when no byte is pending.
#[derive(Default)]
pub struct TerminalConsole;

impl ConsoleIo for TerminalConsole {
    fn put_byte(&mut self, byte: u8) {
        let mut stdout = io::stdout();
        let _ = stdout.write_all(&[byte]);
        let _ = stdout.flush();
    }

    fn get_byte(&mut self) -> Option<u8> {
        if !event::poll(Duration::ZERO).unwrap_or(false) {
            return None;
        }
        match event::read() {
            Ok(Event::Key(key)) if key.kind != KeyEventKind::Release => key_byte(key),
            _ => None,
        }
    }
}

fn key_byte(key: KeyEvent) -> Option<u8> {
    match key.code {
        KeyCode::Char(c) if c.is_ascii() => {
            let b = c as u8;
            if key.modifiers.contains(KeyModifiers::CONTROL) {
                Some(b.to_ascii_uppercase() & 0x1F)
            } else {
                Some(b)
            }
        }
        KeyCode::Enter => Some(b'\r'),
        KeyCode::Tab => Some(b'\t'),
        KeyCode::Backspace => Some(0x7F),
        KeyCode::Esc => Some(0x1B),
        _ => None,
    }
}
