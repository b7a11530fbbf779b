#![allow(dead_code)]

// https://wiki.osdev.org/I/O_Ports
// https://wiki.osdev.org/Serial_Ports
use crate::io_port::IoPort;
use core::fmt;
use spin::Mutex;

pub struct SerialPort {
    data: IoPort,
    interrupt_enable: IoPort,
    fifo_ctrl: IoPort,
    line_ctrl: IoPort,
    modem_ctrl: IoPort,
    line_status: IoPort,
}

/// 0x3F8 is the default addr for COM1.
pub static SERIAL_PORT: Mutex<SerialPort> = Mutex::new(SerialPort::new(crate::config::SERIAL_COM1));

impl SerialPort {
    const fn new(port: u16) -> SerialPort {
        SerialPort {
            data: IoPort::new(port),
            interrupt_enable: IoPort::new(port + 1),
            fifo_ctrl: IoPort::new(port + 2),
            line_ctrl: IoPort::new(port + 3),
            modem_ctrl: IoPort::new(port + 4),
            line_status: IoPort::new(port + 5),
        }
    }

    /// Must be called at least once before any data is sent; safe to call
    /// more than once.
    pub fn init(&self) {
        self.interrupt_enable.write_u8(0x00); // disable all interrupts
        self.line_ctrl.write_u8(0x80); // enable DLAB (set baud rate divisor)
        self.data.write_u8(0x03); // divisor lo byte: 38400 baud
        self.interrupt_enable.write_u8(0x00); // divisor hi byte
        self.line_ctrl.write_u8(0x03); // 8 bits, no parity, one stop bit
        self.fifo_ctrl.write_u8(0xC7); // enable FIFO, clear, 14-byte threshold
        self.modem_ctrl.write_u8(0x0F); // normal operation, IRQs + OUT1/OUT2 set
    }

    fn send(&self, value: u8) {
        while self.line_status.read_u8() & 0x20 == 0 {}
        self.data.write_u8(value);
    }

    fn receive(&self) -> u8 {
        while self.line_status.read_u8() & 1 == 0 {}
        self.data.read_u8()
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.send(byte);
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    SERIAL_PORT.lock().write_fmt(args).expect("serial write failed");
}
