/// RP2040 side of the DMA pipelines: USB bulk endpoints on one end, PIO
/// slave-FIFO state machines on the other.
///
/// SM0 samples the 8-bit acquisition bus on every FPGA strobe, SM1 and SM2
/// clock generator nibbles and control dibits out to the FPGA. Each state
/// machine has its own DMA channel.
use core::future::pending;
use core::ops::Range;

use defmt::*;
use embassy_futures::join::join4;
use embassy_rp::dma::Channel;
use embassy_rp::pac;
use embassy_rp::peripherals::{DMA_CH2, DMA_CH3, DMA_CH4, PIO0, USB};
use embassy_rp::pio::program::pio_asm;
use embassy_rp::pio::{
    Common, Config, Direction as PioDirection, FifoJoin, Pin, ShiftConfig, ShiftDirection,
    StateMachine,
};
use embassy_rp::usb::Driver;
use embassy_rp::Peri;
use embassy_time::{with_timeout, Duration, Ticker};
use embassy_usb::driver::{Endpoint as _, EndpointIn as _, EndpointOut as _};

use scopefun_fw::config::{DMA_POOL_BYTES, EP_CONFIG_OUT, EP_FRAME_IN, EP_GENERATOR_OUT};
use scopefun_fw::error::{PipelineError, SourceError};
use scopefun_fw::mode::Personality;
use scopefun_fw::pipeline::{acquire_window_us, ChannelSpec, PipelineBackend, MAX_CHANNELS};
use scopefun_fw::telemetry::{ErrorCounters, Stream};

pub type UsbDriver = Driver<'static, USB>;
pub type EpOut = <UsbDriver as embassy_usb::driver::Driver<'static>>::EndpointOut;
pub type EpIn = <UsbDriver as embassy_usb::driver::Driver<'static>>::EndpointIn;

/// Full-speed bulk packet size on the RP2040.
const USB_PACKET: usize = 64;

/// How often the FIFO debug register is sampled for overruns/underruns.
const FAULT_SAMPLE_MS: u64 = 1;

// =============================================================================
// PIO slave-FIFO bus
// =============================================================================

pub struct FifoPins {
    pub frame_data: [Pin<'static, PIO0>; 8],
    pub frame_strobe: Pin<'static, PIO0>,
    pub generator_data: [Pin<'static, PIO0>; 4],
    pub generator_strobe: Pin<'static, PIO0>,
    pub control_data: [Pin<'static, PIO0>; 2],
    pub control_strobe: Pin<'static, PIO0>,
}

pub struct FifoBus {
    frames: StateMachine<'static, PIO0, 0>,
    generator: StateMachine<'static, PIO0, 1>,
    control: StateMachine<'static, PIO0, 2>,
    frames_dma: Peri<'static, DMA_CH2>,
    generator_dma: Peri<'static, DMA_CH3>,
    control_dma: Peri<'static, DMA_CH4>,
    _pins: FifoPins,
}

impl FifoBus {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        common: &mut Common<'static, PIO0>,
        mut frames: StateMachine<'static, PIO0, 0>,
        mut generator: StateMachine<'static, PIO0, 1>,
        mut control: StateMachine<'static, PIO0, 2>,
        pins: FifoPins,
        frames_dma: Peri<'static, DMA_CH2>,
        generator_dma: Peri<'static, DMA_CH3>,
        control_dma: Peri<'static, DMA_CH4>,
    ) -> Self {
        // Byte capture on the rising edge of the FPGA write strobe (IN base + 8).
        let capture = pio_asm!(
            ".wrap_target",
            "wait 1 pin 8",
            "in pins, 8",
            "wait 0 pin 8",
            ".wrap"
        );
        let mut cfg = Config::default();
        cfg.use_program(&common.load_program(&capture.program), &[]);
        cfg.set_in_pins(&pins.frame_data.each_ref());
        cfg.shift_in = ShiftConfig {
            auto_fill: true,
            threshold: 8,
            direction: ShiftDirection::Left,
        };
        cfg.fifo_join = FifoJoin::RxOnly;
        frames.set_config(&cfg);
        frames.set_pin_dirs(PioDirection::In, &pins.frame_data.each_ref());
        frames.set_pin_dirs(PioDirection::In, &[&pins.frame_strobe]);

        let nibbles = pio_asm!(
            ".side_set 1",
            ".wrap_target",
            "out pins, 4 side 0",
            "nop side 1",
            ".wrap"
        );
        let mut cfg = Config::default();
        cfg.use_program(&common.load_program(&nibbles.program), &[&pins.generator_strobe]);
        cfg.set_out_pins(&pins.generator_data.each_ref());
        cfg.shift_out = ShiftConfig {
            auto_fill: true,
            threshold: 8,
            direction: ShiftDirection::Right,
        };
        cfg.fifo_join = FifoJoin::TxOnly;
        generator.set_config(&cfg);
        generator.set_pin_dirs(PioDirection::Out, &pins.generator_data.each_ref());
        generator.set_pin_dirs(PioDirection::Out, &[&pins.generator_strobe]);

        let dibits = pio_asm!(
            ".side_set 1",
            ".wrap_target",
            "out pins, 2 side 0",
            "nop side 1",
            ".wrap"
        );
        let mut cfg = Config::default();
        cfg.use_program(&common.load_program(&dibits.program), &[&pins.control_strobe]);
        cfg.set_out_pins(&pins.control_data.each_ref());
        cfg.shift_out = ShiftConfig {
            auto_fill: true,
            threshold: 8,
            direction: ShiftDirection::Right,
        };
        cfg.fifo_join = FifoJoin::TxOnly;
        control.set_config(&cfg);
        control.set_pin_dirs(PioDirection::Out, &pins.control_data.each_ref());
        control.set_pin_dirs(PioDirection::Out, &[&pins.control_strobe]);

        Self {
            frames,
            generator,
            control,
            frames_dma,
            generator_dma,
            control_dma,
            _pins: pins,
        }
    }

    fn set_enable(&mut self, ep: u8, on: bool) {
        match ep {
            EP_FRAME_IN => self.frames.set_enable(on),
            EP_GENERATOR_OUT => self.generator.set_enable(on),
            EP_CONFIG_OUT => self.control.set_enable(on),
            _ => {}
        }
    }

    fn clear_fifos(&mut self, ep: u8) {
        match ep {
            EP_FRAME_IN => self.frames.clear_fifos(),
            EP_GENERATOR_OUT => self.generator.clear_fifos(),
            EP_CONFIG_OUT => self.control.clear_fifos(),
            _ => {}
        }
    }

    fn restart(&mut self, ep: u8) {
        match ep {
            EP_FRAME_IN => self.frames.restart(),
            EP_GENERATOR_OUT => self.generator.restart(),
            EP_CONFIG_OUT => self.control.restart(),
            _ => {}
        }
    }

    fn stop_all(&mut self) {
        for ep in [EP_FRAME_IN, EP_GENERATOR_OUT, EP_CONFIG_OUT] {
            self.set_enable(ep, false);
            self.clear_fifos(ep);
        }
    }
}

// =============================================================================
// Pipeline backend
// =============================================================================

pub struct Endpoints {
    pub config_out: EpOut,
    pub generator_out: EpOut,
    pub frame_in: EpIn,
}

#[derive(Clone)]
struct SlotState {
    endpoint: u8,
    region: Range<usize>,
    buffer_size: usize,
    buffer_count: usize,
    transfer_size: u32,
    next: usize,
    armed: bool,
}

impl SlotState {
    fn buffer(&self, index: usize) -> Range<usize> {
        let start = self.region.start + index * self.buffer_size;
        start..start + self.buffer_size
    }
}

pub struct RpBackend {
    eps: Endpoints,
    bus: FifoBus,
    pool: &'static mut [u8; DMA_POOL_BYTES],
    slots: [Option<SlotState>; MAX_CHANNELS],
    personality: Personality,
    counters: &'static ErrorCounters,
}

impl RpBackend {
    pub fn new(
        eps: Endpoints,
        bus: FifoBus,
        pool: &'static mut [u8; DMA_POOL_BYTES],
        counters: &'static ErrorCounters,
    ) -> Self {
        Self {
            eps,
            bus,
            pool,
            slots: [None, None, None],
            personality: Personality::Detached,
            counters,
        }
    }

    fn slot_for(&self, ep: u8) -> Option<SlotState> {
        self.slots
            .iter()
            .flatten()
            .find(|s| s.endpoint == ep && s.armed)
            .cloned()
    }

    fn streaming(&self) -> bool {
        self.personality == Personality::Streaming
    }
}

impl PipelineBackend for RpBackend {
    fn open(
        &mut self,
        slot: u8,
        spec: &ChannelSpec,
        region: Range<usize>,
    ) -> Result<(), PipelineError> {
        let entry = self
            .slots
            .get_mut(slot as usize)
            .ok_or(PipelineError::NoSlot)?;
        *entry = Some(SlotState {
            endpoint: spec.endpoint,
            region,
            buffer_size: spec.buffer_size as usize,
            buffer_count: spec.buffer_count as usize,
            transfer_size: spec.transfer_size,
            next: 0,
            armed: false,
        });
        Ok(())
    }

    fn close(&mut self, slot: u8) {
        if let Some(s) = self.slots.get_mut(slot as usize).and_then(Option::take) {
            if self.personality == Personality::Streaming {
                self.bus.set_enable(s.endpoint, false);
            }
        }
    }

    fn reset(&mut self, slot: u8) {
        let Some(Some(s)) = self.slots.get_mut(slot as usize) else {
            return;
        };
        s.next = 0;
        s.armed = false;
        let ep = s.endpoint;
        if self.streaming() {
            self.bus.set_enable(ep, false);
            self.bus.restart(ep);
        }
    }

    fn arm(&mut self, slot: u8, transfer_size: u32) -> Result<(), PipelineError> {
        let Some(Some(s)) = self.slots.get_mut(slot as usize) else {
            return Err(PipelineError::StaleHandle);
        };
        s.transfer_size = transfer_size;
        s.armed = true;
        let ep = s.endpoint;
        if self.streaming() {
            self.bus.set_enable(ep, true);
        }
        Ok(())
    }

    fn flush_endpoint(&mut self, ep: u8) {
        trace!("flush ep {=u8:#x}", ep);
        if self.streaming() {
            self.bus.clear_fifos(ep);
        }
    }

    fn clear_halt(&mut self, ep: u8) {
        // Data toggle and STALL are reset by the USB stack itself.
        trace!("halt cleared on ep {=u8:#x}", ep);
    }

    fn select_bus(&mut self, personality: Personality) {
        info!("FIFO bus: {}", personality);
        self.bus.stop_all();
        self.personality = personality;
    }

    async fn acquire(&mut self, slot: u8, timeout_ms: u32) -> Result<&[u8], SourceError> {
        let Some(Some(s)) = self.slots.get(slot as usize) else {
            return Err(SourceError::Stale);
        };
        if !s.armed {
            return Err(SourceError::Stale);
        }
        let range = s.buffer(s.next);

        let deadline = Duration::from_micros(acquire_window_us(timeout_ms));
        let read = with_timeout(deadline, self.eps.config_out.read(&mut self.pool[range.clone()]));
        match read.await {
            Ok(Ok(n)) => Ok(&self.pool[range.start..range.start + n]),
            Ok(Err(e)) => {
                warn!("bitstream endpoint: {}", e);
                Err(SourceError::Timeout)
            }
            Err(_) => Err(SourceError::Timeout),
        }
    }

    fn release(&mut self, slot: u8) -> Result<(), SourceError> {
        let Some(Some(s)) = self.slots.get_mut(slot as usize) else {
            return Err(SourceError::Stale);
        };
        // A reset while the buffer was out leaves nothing to hand it back to.
        if !s.armed {
            return Err(SourceError::Release);
        }
        s.next = (s.next + 1) % s.buffer_count;
        Ok(())
    }

    async fn service(&mut self) {
        if !self.streaming() {
            return pending().await;
        }
        let (Some(ctrl), Some(gen), Some(frames)) = (
            self.slot_for(EP_CONFIG_OUT),
            self.slot_for(EP_GENERATOR_OUT),
            self.slot_for(EP_FRAME_IN),
        ) else {
            return pending().await;
        };

        let [ctrl_ring, gen_ring, frame_ring] = carve(
            &mut self.pool[..],
            [ctrl.region.clone(), gen.region.clone(), frames.region.clone()],
        );
        let bus = &mut self.bus;
        join4(
            pump_out(
                &mut self.eps.config_out,
                &mut bus.control,
                bus.control_dma.reborrow(),
                ctrl_ring,
                &ctrl,
            ),
            pump_out(
                &mut self.eps.generator_out,
                &mut bus.generator,
                bus.generator_dma.reborrow(),
                gen_ring,
                &gen,
            ),
            pump_in(
                &mut self.eps.frame_in,
                &mut bus.frames,
                bus.frames_dma.reborrow(),
                frame_ring,
                &frames,
            ),
            sample_faults(self.counters),
        )
        .await;
    }
}

/// Split the pool into the three disjoint channel regions.
fn carve<'p>(mut pool: &'p mut [u8], regions: [Range<usize>; 3]) -> [&'p mut [u8]; 3] {
    let mut order = [0, 1, 2];
    order.sort_unstable_by_key(|&i| regions[i].start);

    let mut out: [&'p mut [u8]; 3] = [&mut [], &mut [], &mut []];
    let mut base = 0;
    for i in order {
        let r = &regions[i];
        let (_, rest) = core::mem::take(&mut pool).split_at_mut(r.start - base);
        let (mine, rest) = rest.split_at_mut(r.len());
        out[i] = mine;
        pool = rest;
        base = r.end;
    }
    out
}

/// Host to FPGA: bulk OUT packets into the ring, ring into the TX FIFO.
async fn pump_out<const SM: usize, C: Channel>(
    ep: &mut EpOut,
    sm: &mut StateMachine<'static, PIO0, SM>,
    mut dma: Peri<'_, C>,
    ring: &mut [u8],
    slot: &SlotState,
) {
    let mut index = 0;
    let mut moved = 0u32;
    loop {
        if slot.transfer_size != 0 && moved >= slot.transfer_size {
            return pending().await;
        }
        let buf = &mut ring[index * slot.buffer_size..(index + 1) * slot.buffer_size];
        let n = match ep.read(buf).await {
            Ok(n) => n,
            Err(_) => {
                ep.wait_enabled().await;
                continue;
            }
        };
        sm.tx().dma_push(dma.reborrow(), &buf[..n], false).await;
        moved = moved.wrapping_add(n as u32);
        index = (index + 1) % slot.buffer_count;
    }
}

/// FPGA to host: fill a ring buffer from the RX FIFO, send it as packets.
async fn pump_in<C: Channel>(
    ep: &mut EpIn,
    sm: &mut StateMachine<'static, PIO0, 0>,
    mut dma: Peri<'_, C>,
    ring: &mut [u8],
    slot: &SlotState,
) {
    let mut index = 0;
    let mut moved = 0u32;
    loop {
        if slot.transfer_size != 0 && moved >= slot.transfer_size {
            return pending().await;
        }
        let buf = &mut ring[index * slot.buffer_size..(index + 1) * slot.buffer_size];
        sm.rx().dma_pull(dma.reborrow(), &mut *buf, false).await;
        for packet in buf.chunks(USB_PACKET) {
            if ep.write(packet).await.is_err() {
                ep.wait_enabled().await;
                break;
            }
        }
        moved = moved.wrapping_add(buf.len() as u32);
        index = (index + 1) % slot.buffer_count;
    }
}

/// Turn PIO FIFO stall/overflow flags into telemetry counts.
///
/// SM0 faults belong to the acquisition stream, SM1 to the generator and
/// SM2 to the control stream.
async fn sample_faults(counters: &ErrorCounters) {
    const STREAMS: [(u8, Stream); 3] = [
        (1 << 0, Stream::Acquisition),
        (1 << 1, Stream::Generator),
        (1 << 2, Stream::Control),
    ];
    let mut ticker = Ticker::every(Duration::from_millis(FAULT_SAMPLE_MS));
    loop {
        ticker.next().await;
        let fdebug = pac::PIO0.fdebug().read();
        // RX side stalls/underflows only matter on SM0, TX side on SM1/SM2.
        let overrun = (fdebug.rxstall() & 0x1) | (fdebug.txover() & 0x6);
        let underrun = (fdebug.rxunder() & 0x1) | (fdebug.txstall() & 0x6);
        if overrun | underrun == 0 {
            continue;
        }
        pac::PIO0.fdebug().write(|w| {
            w.set_rxstall(overrun & 0x1);
            w.set_txover(overrun & 0x6);
            w.set_rxunder(underrun & 0x1);
            w.set_txstall(underrun & 0x6);
        });
        for (bit, stream) in STREAMS {
            if overrun & bit != 0 {
                counters.record_overrun(stream);
            }
            if underrun & bit != 0 {
                counters.record_underrun(stream);
            }
        }
    }
}
