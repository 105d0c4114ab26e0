// Device mode and bus personality, published as one snapshot.

use core::sync::atomic::{AtomicU8, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Mode {
    StreamingActive = 0,
    ConfigPending = 1,
    ConfigInProgress = 2,
    ConfigComplete = 3,
    ConfigFailed = 4,
}

/// Which set of bulk channels is currently instantiated on the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Personality {
    Detached = 0,
    Configuration = 1,
    Streaming = 2,
}

impl Mode {
    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Mode::ConfigPending,
            2 => Mode::ConfigInProgress,
            3 => Mode::ConfigComplete,
            4 => Mode::ConfigFailed,
            _ => Mode::StreamingActive,
        }
    }
}

impl Personality {
    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Personality::Configuration,
            2 => Personality::Streaming,
            _ => Personality::Detached,
        }
    }
}

/// Worker-owned status readable from the control callback.
///
/// Only the mode controller stores; everyone else loads. Mode sits in the low
/// nibble and personality in the high nibble of a single byte.
pub struct SharedStatus(AtomicU8);

impl SharedStatus {
    pub const fn new() -> Self {
        Self(AtomicU8::new(Mode::StreamingActive as u8))
    }

    pub fn publish(&self, mode: Mode, personality: Personality) {
        self.0
            .store((mode as u8) | ((personality as u8) << 4), Ordering::Release);
    }

    pub fn snapshot(&self) -> (Mode, Personality) {
        let bits = self.0.load(Ordering::Acquire);
        (Mode::from_bits(bits & 0x0F), Personality::from_bits(bits >> 4))
    }

    pub fn mode(&self) -> Mode {
        self.snapshot().0
    }

    /// Answer to the configuration status poll, before pending-load checks.
    pub fn configured_ok(&self) -> bool {
        matches!(
            self.snapshot(),
            (Mode::ConfigComplete, _) | (Mode::StreamingActive, Personality::Streaming)
        )
    }
}

impl Default for SharedStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boots_detached_and_streaming_idle() {
        let s = SharedStatus::new();
        assert_eq!(s.snapshot(), (Mode::StreamingActive, Personality::Detached));
        assert!(!s.configured_ok());
    }

    #[test]
    fn snapshot_round_trips_every_pair() {
        let s = SharedStatus::new();
        for mode in [
            Mode::StreamingActive,
            Mode::ConfigPending,
            Mode::ConfigInProgress,
            Mode::ConfigComplete,
            Mode::ConfigFailed,
        ] {
            for p in [
                Personality::Detached,
                Personality::Configuration,
                Personality::Streaming,
            ] {
                s.publish(mode, p);
                assert_eq!(s.snapshot(), (mode, p));
            }
        }
    }

    #[test]
    fn configured_ok_after_complete_or_switch() {
        let s = SharedStatus::new();
        s.publish(Mode::ConfigFailed, Personality::Configuration);
        assert!(!s.configured_ok());
        s.publish(Mode::ConfigComplete, Personality::Configuration);
        assert!(s.configured_ok());
        s.publish(Mode::StreamingActive, Personality::Streaming);
        assert!(s.configured_ok());
        s.publish(Mode::StreamingActive, Personality::Configuration);
        assert!(!s.configured_ok());
    }
}
