//! Classic VGA text-mode writer. Kept and extended, rather than dropped, as
//! the renderer for the fatal-exception panic screen (`spec.md §7`): the
//! original's blue screen is a VBE/framebuffer panel, which is out of
//! scope (`spec.md` Non-goals, no GUI/graphics stack), but a kernel with no
//! surviving way to show a crash is worse than one that falls back to text
//! mode, and VGA text mode is the idiomatic minimal substitute on a 32-bit
//! PC target.
use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;

const BUFFER_HEIGHT: usize = 25;
const BUFFER_WIDTH: usize = 80;

#[repr(u8)]
#[allow(dead_code)]
#[derive(Clone, Copy)]
pub enum Color {
    Black = 0x0,
    Blue = 0x1,
    Green = 0x2,
    Cyan = 0x3,
    Red = 0x4,
    Magenta = 0x5,
    Brown = 0x6,
    Gray = 0x8,
    Pink = 0xd,
    Yellow = 0xe,
    White = 0xf,
    LightGray = 0x7,
    LightBlue = 0x9,
    LightGreen = 0xa,
    LightCyan = 0xb,
    LightRed = 0xc,
}

#[repr(transparent)]
#[derive(Clone, Copy)]
struct ColorCode(u8);

impl ColorCode {
    const fn new(foreground: Color, background: Color) -> ColorCode {
        ColorCode((background as u8) << 0x4 | (foreground as u8))
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ScreenChar {
    ascii_char: u8,
    color_code: ColorCode,
}

#[repr(transparent)]
struct ScreenBuff {
    chars: [[ScreenChar; BUFFER_WIDTH]; BUFFER_HEIGHT],
}

pub struct Writer {
    column: usize,
    row: usize,
    color_code: ColorCode,
    buffer: &'static mut ScreenBuff,
}

impl Writer {
    fn write_chr(&mut self, chr: u8) {
        match chr {
            0x20..=0x7e => {
                if self.column >= BUFFER_WIDTH {
                    self.newline();
                }

                self.buffer.chars[self.row][self.column] = ScreenChar {
                    ascii_char: chr,
                    color_code: self.color_code,
                };

                self.column += 1;
            }
            b'\n' => self.newline(),
            _ => {}
        }
    }

    fn newline(&mut self) {
        self.column = 0;
        self.row += 1;
        if self.row >= BUFFER_HEIGHT {
            self.scroll();
            self.row = BUFFER_HEIGHT - 1;
        }
    }

    fn scroll(&mut self) {
        for row in 1..BUFFER_HEIGHT {
            self.buffer.chars[row - 1] = self.buffer.chars[row];
        }
        self.clear_row(BUFFER_HEIGHT - 1);
    }

    fn clear_row(&mut self, row: usize) {
        let blank = ScreenChar { ascii_char: b' ', color_code: self.color_code };
        for col in 0..BUFFER_WIDTH {
            self.buffer.chars[row][col] = blank;
        }
    }

    pub fn clear_screen(&mut self) {
        for row in 0..BUFFER_HEIGHT {
            self.clear_row(row);
        }
        self.column = 0;
        self.row = 0;
    }

    pub fn set_colors(&mut self, foreground: Color, background: Color) {
        self.color_code = ColorCode::new(foreground, background);
    }

    fn write_str_inner(&mut self, str: &str) {
        for chr in str.bytes() {
            self.write_chr(chr);
        }
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_str_inner(s);
        Ok(())
    }
}

// spin locks are not the best but they work and we have no concept of blocking
// or even threads in this os to use a better alternative
lazy_static! {
    pub static ref WRITER: Mutex<Writer> = Mutex::new(Writer {
        column: 0,
        row: 0,
        color_code: ColorCode::new(Color::White, Color::Black),
        buffer: unsafe { &mut *(0xb8000 as *mut ScreenBuff) },
    });
}

/// Clears the screen to a blue background, sets white-on-blue, and hands
/// the writer to `render` for the panic message. Bypasses the `WRITER`
/// mutex's usual locking discipline reasoning: by the time this runs the
/// kernel has already decided to halt or reboot, so there is no one left
/// to contend with.
pub fn blue_screen(render: impl FnOnce(&mut Writer)) {
    let mut writer = WRITER.lock();
    writer.set_colors(Color::White, Color::Blue);
    writer.clear_screen();
    render(&mut writer);
}

macro_rules! println {
    ($fmt:expr) => {print!(concat!($fmt, "\n"))};
    ($fmt:expr, $($arg:tt)*) => {print!(concat!($fmt, "\n"), $($arg)*)};
}

macro_rules! print {
    ($($arg:tt)*) => {
        use core::fmt::Write;
        $crate::vga_buffer::WRITER.lock().write_fmt(format_args!($($arg)*)).unwrap();
    };
}
