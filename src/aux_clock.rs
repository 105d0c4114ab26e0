// ADC/FPGA auxiliary clock enable and ADC reset line.

use embedded_hal::digital::OutputPin;
use embedded_hal_async::delay::DelayNs;

use crate::config::{ADC_RESET_PULSE_MS, AUX_CLOCK_SETTLE_MS};
use crate::log::info;

pub trait AuxLines {
    fn set_clock(&mut self, on: bool);
    /// `true` drives ADC_RESETN low.
    fn set_adc_reset(&mut self, asserted: bool);
}

pub struct AdcLines<C, R> {
    clock_en: C,
    adc_reset_n: R,
}

impl<C: OutputPin, R: OutputPin> AdcLines<C, R> {
    pub fn new(clock_en: C, adc_reset_n: R) -> Self {
        Self {
            clock_en,
            adc_reset_n,
        }
    }
}

impl<C: OutputPin, R: OutputPin> AuxLines for AdcLines<C, R> {
    fn set_clock(&mut self, on: bool) {
        self.clock_en.set_state(on.into()).ok();
    }

    fn set_adc_reset(&mut self, asserted: bool) {
        self.adc_reset_n.set_state((!asserted).into()).ok();
    }
}

pub struct AuxClock<A, D> {
    lines: A,
    delay: D,
}

impl<A: AuxLines, D: DelayNs> AuxClock<A, D> {
    pub fn new(lines: A, delay: D) -> Self {
        Self { lines, delay }
    }

    /// Start the clock, let it settle, then pulse ADC_RESETN to kick off
    /// ADC calibration.
    pub async fn enable_and_calibrate(&mut self) {
        info!("aux clock on, ADC calibration");
        self.lines.set_clock(true);
        self.delay.delay_ms(AUX_CLOCK_SETTLE_MS).await;
        self.lines.set_adc_reset(true);
        self.delay.delay_ms(ADC_RESET_PULSE_MS).await;
        self.lines.set_adc_reset(false);
    }

    pub fn disable_clock(&mut self) {
        info!("aux clock off");
        self.lines.set_clock(false);
    }

    /// Park the front end after a failed configuration.
    pub fn power_down(&mut self) {
        info!("front end power down");
        self.lines.set_adc_reset(true);
        self.lines.set_clock(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockAux, MockDelay, Op, Trace};
    use embassy_futures::block_on;

    #[test]
    fn calibration_sequence() {
        let trace = Trace::default();
        let mut aux = AuxClock::new(MockAux::new(&trace), MockDelay::new(&trace));

        block_on(aux.enable_and_calibrate());

        assert_eq!(
            trace.ops(),
            vec![
                Op::Clock(true),
                Op::Delay(AUX_CLOCK_SETTLE_MS),
                Op::AdcReset(true),
                Op::Delay(ADC_RESET_PULSE_MS),
                Op::AdcReset(false),
            ]
        );
    }

    #[test]
    fn power_down_holds_adc_in_reset() {
        let trace = Trace::default();
        let mut aux = AuxClock::new(MockAux::new(&trace), MockDelay::new(&trace));
        aux.power_down();
        assert_eq!(trace.ops(), vec![Op::AdcReset(true), Op::Clock(false)]);
    }

    #[test]
    fn line_errors_do_not_stop_the_sequence() {
        use crate::mock::FaultyOutput;
        let trace = Trace::default();
        let mut aux = AuxClock::new(
            AdcLines::new(FaultyOutput, FaultyOutput),
            MockDelay::new(&trace),
        );

        block_on(aux.enable_and_calibrate());
        aux.power_down();

        assert_eq!(
            trace.ops(),
            vec![Op::Delay(AUX_CLOCK_SETTLE_MS), Op::Delay(ADC_RESET_PULSE_MS)]
        );
    }
}
