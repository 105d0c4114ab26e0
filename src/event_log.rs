// Diagnostic ring of USB bus events and vendor requests (dumped by 0xEF).

use crate::config::EVENT_LOG_SIZE;

/// Entry codes; vendor requests are logged by their bRequest value.
pub mod code {
    pub const BUS_RESET: u8 = 0x01;
    pub const BUS_ENABLED: u8 = 0x02;
    pub const BUS_DISABLED: u8 = 0x03;
    pub const CONFIGURED: u8 = 0x04;
    pub const DECONFIGURED: u8 = 0x05;
    pub const SUSPEND: u8 = 0x06;
    pub const RESUME: u8 = 0x07;
    pub const STALL: u8 = 0x0F;
}

/// Two-byte entries: `[code, arg]`. Oldest entries are overwritten.
pub struct EventLog {
    buf: [u8; EVENT_LOG_SIZE],
    head: usize,
    wrapped: bool,
}

impl EventLog {
    pub const fn new() -> Self {
        Self {
            buf: [0; EVENT_LOG_SIZE],
            head: 0,
            wrapped: false,
        }
    }

    pub fn record(&mut self, code: u8, arg: u8) {
        self.buf[self.head] = code;
        self.buf[self.head + 1] = arg;
        self.head += 2;
        if self.head >= EVENT_LOG_SIZE {
            self.head = 0;
            self.wrapped = true;
        }
    }

    pub fn len(&self) -> usize {
        if self.wrapped {
            EVENT_LOG_SIZE
        } else {
            self.head
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy up to `out.len()` bytes, oldest first. Returns the byte count.
    pub fn dump(&self, out: &mut [u8]) -> usize {
        let n = self.len().min(out.len());
        if !self.wrapped {
            out[..n].copy_from_slice(&self.buf[..n]);
            return n;
        }
        let (newer, older) = self.buf.split_at(self.head);
        let first = older.len().min(n);
        out[..first].copy_from_slice(&older[..first]);
        out[first..n].copy_from_slice(&newer[..n - first]);
        n
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
