//! 80x25 VGA text console.
//!
//! Only ring 0 touches the screen. Outer rings print through the
//! `CG_CORE_PRINTR` call gate.

use core::fmt;

pub const COLS: usize = 80;
pub const ROWS: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Black = 0x0,
    Blue = 0x1,
    Green = 0x2,
    Cyan = 0x3,
    Red = 0x4,
    Magenta = 0x5,
    Brown = 0x6,
    LightGray = 0x7,
    DarkGray = 0x8,
    LightBlue = 0x9,
    LightGreen = 0xA,
    LightCyan = 0xB,
    LightRed = 0xC,
    Pink = 0xD,
    Yellow = 0xE,
    White = 0xF,
}

/// Attribute byte: foreground in the low nibble, background in the high one.
pub const fn attr(fg: Color, bg: Color) -> u8 {
    (fg as u8) | ((bg as u8) << 4)
}

const fn cell(byte: u8, color: u8) -> u16 {
    byte as u16 | ((color as u16) << 8)
}

pub struct TextConsole<'a> {
    cells: &'a mut [u16],
    row: usize,
    col: usize,
    cursor_hook: Option<fn(u16)>,
}

impl<'a> TextConsole<'a> {
    /// `cells` must hold at least `COLS * ROWS` entries.
    pub fn new(cells: &'a mut [u16]) -> Self {
        debug_assert!(cells.len() >= COLS * ROWS);
        Self {
            cells,
            row: 0,
            col: 0,
            cursor_hook: None,
        }
    }

    /// Called with the linear cursor position after every cursor move.
    pub fn with_cursor_hook(mut self, hook: fn(u16)) -> Self {
        self.cursor_hook = Some(hook);
        self
    }

    fn update_cursor(&self) {
        if let Some(hook) = self.cursor_hook {
            hook((self.row * COLS + self.col) as u16);
        }
    }

    pub fn cursor(&self) -> (usize, usize) {
        (self.row, self.col)
    }

    pub fn set_cursor(&mut self, row: usize, col: usize) {
        self.row = row.min(ROWS - 1);
        self.col = col.min(COLS - 1);
        self.update_cursor();
    }

    pub fn cell(&self, row: usize, col: usize) -> u16 {
        self.cells[row * COLS + col]
    }

    pub fn clear(&mut self) {
        let blank = cell(b' ', crate::config::colors::DEFAULT);
        self.cells[..COLS * ROWS].fill(blank);
        self.row = 0;
        self.col = 0;
        self.update_cursor();
    }

    pub fn scroll(&mut self) {
        self.cells.copy_within(COLS..COLS * ROWS, 0);
        let blank = cell(b' ', crate::config::colors::DEFAULT);
        self.cells[(ROWS - 1) * COLS..COLS * ROWS].fill(blank);
        self.row = self.row.saturating_sub(1);
    }

    fn advance(&mut self, byte: u8, color: u8) {
        match byte {
            b'\n' => {
                self.row += 1;
                self.col = 0;
            }
            b'\r' => self.col = 0,
            _ => {
                self.cells[self.row * COLS + self.col] = cell(byte, color);
                self.col += 1;
                if self.col >= COLS {
                    self.col = 0;
                    self.row += 1;
                }
            }
        }
        if self.row >= ROWS {
            self.scroll();
        }
    }

    pub fn putc(&mut self, byte: u8, color: u8) {
        self.advance(byte, color);
        self.update_cursor();
    }

    pub fn puts(&mut self, bytes: &[u8], color: u8) {
        for &byte in bytes {
            self.advance(byte, color);
        }
        self.update_cursor();
    }

    /// Prints at (`row`, `col`) and restores the cursor afterwards.
    /// Out-of-screen positions are ignored.
    pub fn puts_at(&mut self, bytes: &[u8], color: u8, row: usize, col: usize) {
        if row >= ROWS || col >= COLS {
            return;
        }
        let saved = (self.row, self.col);
        self.row = row;
        self.col = col;
        for &byte in bytes {
            self.advance(byte, color);
        }
        (self.row, self.col) = saved;
        self.update_cursor();
    }

    /// Writes one cell without moving the cursor.
    pub fn put_at(&mut self, row: usize, col: usize, byte: u8, color: u8) {
        if row < ROWS && col < COLS {
            self.cells[row * COLS + col] = cell(byte, color);
        }
    }

    pub fn writer(&mut self, color: u8) -> ColorWriter<'_, 'a> {
        ColorWriter { console: self, color }
    }
}

/// `fmt::Write` adapter printing in one colour.
pub struct ColorWriter<'c, 'a> {
    console: &'c mut TextConsole<'a>,
    color: u8,
}

impl fmt::Write for ColorWriter<'_, '_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.console.puts(s.as_bytes(), self.color);
        Ok(())
    }
}

#[cfg(target_arch = "x86")]
mod hardware {
    use super::*;
    use crate::arch::x86::port::{inb, outb};
    use spin::{Lazy, Mutex};

    const VGA_BUFFER: usize = 0xB8000;
    const CRTC_INDEX: u16 = 0x3D4;
    const CRTC_DATA: u16 = 0x3D5;
    const CURSOR_LOW: u8 = 0x0F;
    const CURSOR_HIGH: u8 = 0x0E;

    fn write_cursor(pos: u16) {
        unsafe {
            outb(CRTC_INDEX, CURSOR_LOW);
            outb(CRTC_DATA, pos as u8);
            outb(CRTC_INDEX, CURSOR_HIGH);
            outb(CRTC_DATA, (pos >> 8) as u8);
        }
    }

    fn read_cursor() -> u16 {
        unsafe {
            outb(CRTC_INDEX, CURSOR_LOW);
            let low = inb(CRTC_DATA) as u16;
            outb(CRTC_INDEX, CURSOR_HIGH);
            let high = inb(CRTC_DATA) as u16;
            (high << 8) | low
        }
    }

    pub static CONSOLE: Lazy<Mutex<TextConsole<'static>>> = Lazy::new(|| {
        // SAFETY: the VGA text buffer is identity mapped and owned by this console.
        let cells = unsafe { core::slice::from_raw_parts_mut(VGA_BUFFER as *mut u16, COLS * ROWS) };
        Mutex::new(TextConsole::new(cells).with_cursor_hook(write_cursor))
    });

    /// Adopts the cursor position left by the boot loader.
    pub fn init() {
        let pos = read_cursor() as usize;
        CONSOLE.lock().set_cursor(pos / COLS, pos % COLS);
    }

    pub fn with_console<R>(f: impl FnOnce(&mut TextConsole<'static>) -> R) -> R {
        f(&mut CONSOLE.lock())
    }

    /// For fatal paths: takes the console even if the faulting code held it.
    pub fn with_fault_console(f: impl FnOnce(&mut TextConsole<'static>)) {
        if CONSOLE.is_locked() {
            // SAFETY: the holder faulted and never resumes.
            unsafe { CONSOLE.force_unlock() };
        }
        f(&mut CONSOLE.lock());
    }
}

#[cfg(target_arch = "x86")]
pub use hardware::{init, with_console, with_fault_console, CONSOLE};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::colors;

    fn screen() -> [u16; COLS * ROWS] {
        [0; COLS * ROWS]
    }

    fn text_at(console: &TextConsole<'_>, row: usize, col: usize, len: usize) -> [u8; 16] {
        let mut out = [0u8; 16];
        for (i, slot) in out.iter_mut().enumerate().take(len) {
            *slot = console.cell(row, col + i) as u8;
        }
        out
    }

    #[test]
    fn test_putc_and_newline() {
        let mut cells = screen();
        let mut console = TextConsole::new(&mut cells);
        console.puts(b"R4R\nok", colors::DEFAULT);

        assert_eq!(&text_at(&console, 0, 0, 3)[..3], b"R4R");
        assert_eq!(&text_at(&console, 1, 0, 2)[..2], b"ok");
        assert_eq!(console.cursor(), (1, 2));
        assert_eq!(console.cell(0, 0) >> 8, colors::DEFAULT as u16);
    }

    #[test]
    fn test_wrap_and_scroll() {
        let mut cells = screen();
        let mut console = TextConsole::new(&mut cells);
        console.set_cursor(ROWS - 1, COLS - 1);
        console.putc(b'x', colors::DEFAULT);

        // Wrapping off the last row scrolls the screen up by one.
        assert_eq!(console.cursor(), (ROWS - 1, 0));
        assert_eq!(console.cell(ROWS - 2, COLS - 1) as u8, b'x');
        assert_eq!(console.cell(ROWS - 1, 0) as u8, b' ');
    }

    #[test]
    fn test_puts_at_restores_cursor() {
        let mut cells = screen();
        let mut console = TextConsole::new(&mut cells);
        console.puts(b"abc", colors::DEFAULT);
        console.puts_at(b"SYS", colors::SYS, 22, 31);

        assert_eq!(console.cursor(), (0, 3));
        assert_eq!(&text_at(&console, 22, 31, 3)[..3], b"SYS");
        assert_eq!(console.cell(22, 31) >> 8, colors::SYS as u16);

        console.puts_at(b"zz", colors::SYS, ROWS, 0);
        assert_eq!(console.cursor(), (0, 3));
    }

    #[test]
    fn test_set_cursor_clamps() {
        let mut cells = screen();
        let mut console = TextConsole::new(&mut cells);
        console.set_cursor(100, 200);
        assert_eq!(console.cursor(), (ROWS - 1, COLS - 1));
    }

    #[test]
    fn test_attribute_byte() {
        assert_eq!(attr(Color::Red, Color::Black), 0x04);
        assert_eq!(attr(Color::Black, Color::Green), 0x20);
    }
}
