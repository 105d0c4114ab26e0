// Overrun/underrun counters for the three streaming channels.
//
// Incremented from the callback path, read (and optionally zeroed) from the
// control path. Each counter has a single writer, so a load followed by a
// store is enough on cores without read-modify-write atomics.

use core::sync::atomic::{AtomicU16, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Stream {
    /// FPGA to host frames (EP6 IN).
    Acquisition = 0,
    /// Host to FPGA generator samples (EP4 OUT).
    Generator = 1,
    /// Host to FPGA control words (EP2 OUT).
    Control = 2,
}

pub struct ErrorCounters {
    overrun: [AtomicU16; 3],
    underrun: [AtomicU16; 3],
}

fn bump(c: &AtomicU16) {
    let v = c.load(Ordering::Relaxed);
    c.store(v.wrapping_add(1), Ordering::Relaxed);
}

impl ErrorCounters {
    pub const fn new() -> Self {
        Self {
            overrun: [AtomicU16::new(0), AtomicU16::new(0), AtomicU16::new(0)],
            underrun: [AtomicU16::new(0), AtomicU16::new(0), AtomicU16::new(0)],
        }
    }

    pub fn record_overrun(&self, stream: Stream) {
        bump(&self.overrun[stream as usize]);
    }

    pub fn record_underrun(&self, stream: Stream) {
        bump(&self.underrun[stream as usize]);
    }

    /// All six counters, overruns first. With `reset` the counters are
    /// zeroed in the same critical section as the read.
    pub fn read_and_maybe_reset(&self, reset: bool) -> [u16; 6] {
        critical_section::with(|_| {
            let mut out = [0u16; 6];
            for (slot, c) in out.iter_mut().zip(self.overrun.iter().chain(&self.underrun)) {
                *slot = c.load(Ordering::Relaxed);
                if reset {
                    c.store(0, Ordering::Relaxed);
                }
            }
            out
        })
    }
}

impl Default for ErrorCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire layout of the 0xEB response.
pub fn to_le_bytes(counts: &[u16; 6]) -> [u8; 12] {
    let mut out = [0u8; 12];
    for (chunk, c) in out.chunks_exact_mut(2).zip(counts) {
        chunk.copy_from_slice(&c.to_le_bytes());
    }
    out
}
