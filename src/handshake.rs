// FPGA configuration handshake lines: PROG_B (out), INIT_B and DONE (in).

use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::delay::DelayNs;

use crate::config::{FPGA_BOOT_MS, RESET_PULSE_MS};
use crate::log::{debug, trace};

/// Raw access to the three configuration lines.
pub trait ConfigPins {
    /// Drive PROG_B; `released == false` holds the FPGA in reset.
    fn set_prog(&mut self, released: bool);
    fn init_ready(&mut self) -> bool;
    fn done(&mut self) -> bool;
}

pub struct FpgaPins<P, I, D> {
    prog_b: P,
    init_b: I,
    done: D,
}

impl<P: OutputPin, I: InputPin, D: InputPin> FpgaPins<P, I, D> {
    pub fn new(prog_b: P, init_b: I, done: D) -> Self {
        Self {
            prog_b,
            init_b,
            done,
        }
    }
}

impl<P: OutputPin, I: InputPin, D: InputPin> ConfigPins for FpgaPins<P, I, D> {
    fn set_prog(&mut self, released: bool) {
        self.prog_b.set_state(released.into()).ok();
    }

    fn init_ready(&mut self) -> bool {
        self.init_b.is_high().unwrap_or(false)
    }

    fn done(&mut self) -> bool {
        self.done.is_high().unwrap_or(false)
    }
}

/// Reset strobe and readiness queries used by the loader.
pub struct HandshakeGate<P, D> {
    pins: P,
    delay: D,
}

impl<P: ConfigPins, D: DelayNs> HandshakeGate<P, D> {
    pub fn new(pins: P, delay: D) -> Self {
        Self { pins, delay }
    }

    /// Full reset pulse followed by the FPGA boot wait.
    pub async fn assert_reset(&mut self) {
        debug!("PROG_B pulse");
        self.hold_reset();
        self.delay.delay_ms(RESET_PULSE_MS).await;
        self.release_reset();
        self.delay.delay_ms(FPGA_BOOT_MS).await;
    }

    pub fn hold_reset(&mut self) {
        trace!("PROG_B low");
        self.pins.set_prog(false);
    }

    pub fn release_reset(&mut self) {
        trace!("PROG_B high");
        self.pins.set_prog(true);
    }

    pub fn is_ready(&mut self) -> bool {
        self.pins.init_ready()
    }

    pub fn is_done(&mut self) -> bool {
        self.pins.done()
    }

    pub async fn settle(&mut self, ms: u32) {
        self.delay.delay_ms(ms).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDelay, MockPins, Op, Trace};
    use embassy_futures::block_on;

    #[test]
    fn reset_pulse_timing() {
        let trace = Trace::default();
        let pins = MockPins::new(&trace);
        let mut gate = HandshakeGate::new(pins, MockDelay::new(&trace));

        block_on(gate.assert_reset());

        assert_eq!(
            trace.ops(),
            vec![
                Op::Prog(false),
                Op::Delay(RESET_PULSE_MS),
                Op::Prog(true),
                Op::Delay(FPGA_BOOT_MS),
            ]
        );
    }

    #[test]
    fn lines_sampled_on_every_query() {
        let trace = Trace::default();
        let pins = MockPins::new(&trace);
        let mut gate = HandshakeGate::new(pins.clone(), MockDelay::new(&trace));

        assert!(!gate.is_ready());
        pins.set_init(true);
        assert!(gate.is_ready());
        assert!(!gate.is_done());
        pins.set_done(true);
        assert!(gate.is_done());
    }

    #[test]
    fn pin_error_reads_as_deasserted() {
        use crate::mock::FaultyInput;
        let mut pins = FpgaPins::new(
            crate::mock::NullOutput,
            FaultyInput,
            FaultyInput,
        );
        assert!(!pins.init_ready());
        assert!(!pins.done());
    }

    #[test]
    fn prog_write_error_is_not_fatal() {
        use crate::mock::{FaultyInput, FaultyOutput};
        let mut pins = FpgaPins::new(FaultyOutput, FaultyInput, FaultyInput);
        pins.set_prog(false);
        pins.set_prog(true);
        assert!(!pins.init_ready());
    }
}
