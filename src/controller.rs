// Configuration worker: the single writer of mode and bus personality.

use embassy_futures::select::{select, Either};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::spi::SpiBus;

use crate::aux_clock::{AuxClock, AuxLines};
use crate::error::PipelineError;
use crate::handshake::{ConfigPins, HandshakeGate};
use crate::loader::{BitstreamTransfer, Loader};
use crate::log::{debug, error, info, warn};
use crate::mode::{Mode, Personality};
use crate::pipeline::{
    config_channel, streaming_channels, ChannelHandle, PipelineBackend, PipelineManager,
};
use crate::protocol::{EventFlags, UsbSpeed};
use crate::Shared;

/// FPGA-facing hardware the worker drives directly.
pub struct FrontEnd<P, A, D, L> {
    pub gate: HandshakeGate<P, D>,
    pub aux: AuxClock<A, D>,
    /// Slave-serial configuration link (CCLK/DIN).
    pub link: L,
}

pub struct ModeController<'a, P, A, D, L, B> {
    shared: &'a Shared,
    front: FrontEnd<P, A, D, L>,
    pipelines: PipelineManager<B>,
    loader: Loader,
    speed: UsbSpeed,
    config_channel: Option<ChannelHandle>,
    mode: Mode,
    personality: Personality,
    reboot: fn(),
}

impl<'a, P, A, D, L, B> ModeController<'a, P, A, D, L, B>
where
    P: ConfigPins,
    A: AuxLines,
    D: DelayNs,
    L: SpiBus<u8>,
    B: PipelineBackend,
{
    pub fn new(
        shared: &'a Shared,
        front: FrontEnd<P, A, D, L>,
        backend: B,
        speed: UsbSpeed,
        reboot: fn(),
    ) -> Self {
        let this = Self {
            shared,
            front,
            pipelines: PipelineManager::new(backend),
            loader: Loader::new(),
            speed,
            config_channel: None,
            mode: Mode::StreamingActive,
            personality: Personality::Detached,
            reboot,
        };
        this.publish();
        this
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn personality(&self) -> Personality {
        self.personality
    }

    pub fn transfer(&self) -> BitstreamTransfer {
        self.loader.transfer()
    }

    pub fn pipelines(&self) -> &PipelineManager<B> {
        &self.pipelines
    }

    /// Worker loop. Only returns on a fault the device cannot recover from.
    pub async fn run(&mut self) -> PipelineError {
        loop {
            if let Err(e) = self.step().await {
                error!("pipeline fault: {}", e);
                return e;
            }
        }
    }

    /// Wait for the next batch of events that touches the channels or the
    /// mode, and dispatch it.
    ///
    /// The streaming service keeps running underneath. Clock requests are
    /// handled in place so they never cut an in-flight transfer short.
    pub async fn step(&mut self) -> Result<(), PipelineError> {
        let events = &self.shared.events;
        let aux = &mut self.front.aux;
        let watch = async {
            loop {
                let flags = events.wait().await;
                if !flags.difference(EventFlags::AUX).is_empty() {
                    return flags;
                }
                debug!("events {} while servicing", flags);
                drive_aux(aux, flags).await;
            }
        };
        let flags = match select(watch, self.pipelines.service()).await {
            Either::First(flags) => flags,
            Either::Second(()) => return Ok(()),
        };
        self.dispatch(flags).await
    }

    async fn dispatch(&mut self, flags: EventFlags) -> Result<(), PipelineError> {
        debug!("events {}", flags);

        if flags.contains(EventFlags::USB_RESET) {
            self.on_bus_reset();
        }
        if flags.contains(EventFlags::USB_CONFIGURED) {
            self.enter_configuration()?;
        }
        for flag in (flags & EventFlags::CLEAR_HALT).iter() {
            if let Some(ep) = flag.halted_endpoint() {
                self.clear_halt(ep);
            }
        }
        drive_aux(&mut self.front.aux, flags).await;
        if flags.contains(EventFlags::SWITCH_TO_STREAMING) {
            if self.mode == Mode::ConfigComplete {
                self.enter_streaming()?;
            } else {
                debug!("switch ignored in {}", self.mode);
            }
        }
        if flags.contains(EventFlags::START_CONFIG) {
            self.configure().await?;
        }
        if flags.contains(EventFlags::DEVICE_RESET) {
            warn!("FPGA reset, then device reset");
            self.front.gate.assert_reset().await;
            (self.reboot)();
        }
        Ok(())
    }

    fn publish(&self) {
        self.shared.status.publish(self.mode, self.personality);
    }

    fn set_mode(&mut self, mode: Mode) {
        debug!("mode {} -> {}", self.mode, mode);
        self.mode = mode;
        self.publish();
    }

    fn teardown(&mut self) {
        self.pipelines.destroy_all();
        self.config_channel = None;
    }

    fn on_bus_reset(&mut self) {
        info!("bus reset: tearing down channels");
        self.teardown();
        self.loader.clear();
        self.mode = Mode::StreamingActive;
        self.personality = Personality::Detached;
        self.publish();
    }

    fn enter_configuration(&mut self) -> Result<(), PipelineError> {
        self.teardown();
        self.pipelines.select_bus(Personality::Configuration);
        self.config_channel = Some(self.pipelines.create(config_channel(self.speed))?);
        self.personality = Personality::Configuration;
        self.publish();
        info!("configuration personality");
        Ok(())
    }

    fn enter_streaming(&mut self) -> Result<(), PipelineError> {
        self.teardown();
        self.pipelines.select_bus(Personality::Streaming);
        for spec in streaming_channels() {
            self.pipelines.create(spec)?;
        }
        self.personality = Personality::Streaming;
        self.mode = Mode::StreamingActive;
        self.publish();
        info!("streaming personality");
        Ok(())
    }

    fn clear_halt(&mut self, ep: u8) {
        let Some(handle) = self.pipelines.find_by_endpoint(ep) else {
            debug!("clear halt on idle ep {=u8:#x}", ep);
            return;
        };
        if let Err(e) = self.pipelines.reset(handle) {
            warn!("channel reset on ep {=u8:#x} failed: {}", ep, e);
        }
    }

    /// One configuration cycle: ADC clock up, bitstream in, verdict out.
    async fn configure(&mut self) -> Result<(), PipelineError> {
        let total = self.shared.events.load_length();
        let handle = match self.config_channel {
            Some(h) if self.personality == Personality::Configuration => h,
            _ => {
                self.enter_configuration()?;
                self.config_channel.ok_or(PipelineError::StaleHandle)?
            }
        };

        self.loader.clear();
        self.set_mode(Mode::ConfigPending);
        self.front.aux.enable_and_calibrate().await;
        self.set_mode(Mode::ConfigInProgress);

        let session = self.shared.events.session();
        let packet = self.speed.bulk_packet_size();
        let mut source = self.pipelines.reader(handle)?;
        let result = self
            .loader
            .load(
                total,
                packet,
                &mut self.front.gate,
                &mut source,
                &mut self.front.link,
                session,
            )
            .await;

        // Nothing the host queued for this cycle may feed the next one.
        self.pipelines.reset(handle)?;

        let t = self.loader.transfer();
        match result {
            Ok(()) => {
                info!("configured: {} bytes", t.bytes_transferred);
                self.set_mode(Mode::ConfigComplete);
            }
            Err(e) => {
                warn!(
                    "configuration failed: {} ({}/{} bytes)",
                    e,
                    t.bytes_transferred,
                    t.total_length
                );
                self.set_mode(Mode::ConfigFailed);
            }
        }
        self.loader.clear();
        Ok(())
    }
}

async fn drive_aux<A: AuxLines, D: DelayNs>(aux: &mut AuxClock<A, D>, flags: EventFlags) {
    if flags.contains(EventFlags::AUX_ENABLE) {
        aux.enable_and_calibrate().await;
    }
    if flags.contains(EventFlags::AUX_DISABLE) {
        aux.disable_clock();
    }
    if flags.contains(EventFlags::POWER_DOWN) {
        aux.power_down();
    }
}
