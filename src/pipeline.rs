// DMA channel bookkeeping between USB bulk endpoints and the FPGA FIFO.
//
// The manager owns the static DMA region and hands slices of it to the
// backend. Channels are addressed by generation-tagged handles, so a handle
// kept across a personality switch is rejected instead of touching the
// channel that now lives in its slot.

use core::ops::Range;

use crate::config::{
    CONFIG_BUF_COUNT, DMA_POOL_BYTES, EP_CONFIG_OUT, EP_FRAME_IN, EP_GENERATOR_OUT,
    STREAM_BUF_SIZE, STREAM_IN_BUF_COUNT, STREAM_OUT_BUF_COUNT,
};
use crate::error::{PipelineError, SourceError};
use crate::loader::ChunkSource;
use crate::log::{debug, info, warn};
use crate::mode::Personality;
use crate::protocol::UsbSpeed;

/// Channels live at the same time (three while streaming).
pub const MAX_CHANNELS: usize = 3;

const POOL_ALIGN: usize = 4;

/// Length in microseconds of a buffer wait bounded by `timeout_ms`. The
/// bound is inclusive: a buffer completing exactly at `timeout_ms` is in time.
pub const fn acquire_window_us(timeout_ms: u32) -> u64 {
    timeout_ms as u64 * 1_000 + 1
}

pub const fn arrives_in_time(latency_us: u64, timeout_ms: u32) -> bool {
    latency_us < acquire_window_us(timeout_ms)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Host to device.
    Out,
    /// Device to host.
    In,
}

impl Direction {
    pub fn of_endpoint(ep: u8) -> Self {
        if ep & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelSpec {
    pub endpoint: u8,
    pub direction: Direction,
    pub buffer_size: u16,
    pub buffer_count: u16,
    /// Bytes before the channel stops; 0 runs until destroyed.
    pub transfer_size: u32,
}

impl ChannelSpec {
    pub const fn pool_bytes(&self) -> usize {
        self.buffer_size as usize * self.buffer_count as usize
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.buffer_size == 0
            || self.buffer_count == 0
            || Direction::of_endpoint(self.endpoint) != self.direction
        {
            return Err(PipelineError::InvalidSpec);
        }
        Ok(())
    }
}

/// Bitstream channel on EP2 OUT; buffers follow the bulk packet size.
pub fn config_channel(speed: UsbSpeed) -> ChannelSpec {
    ChannelSpec {
        endpoint: EP_CONFIG_OUT,
        direction: Direction::Out,
        buffer_size: speed.bulk_packet_size(),
        buffer_count: CONFIG_BUF_COUNT,
        transfer_size: 0,
    }
}

/// Control OUT, generator OUT and acquisition IN, in that order.
pub fn streaming_channels() -> [ChannelSpec; MAX_CHANNELS] {
    let out = |endpoint| ChannelSpec {
        endpoint,
        direction: Direction::Out,
        buffer_size: STREAM_BUF_SIZE,
        buffer_count: STREAM_OUT_BUF_COUNT,
        transfer_size: 0,
    };
    [
        out(EP_CONFIG_OUT),
        out(EP_GENERATOR_OUT),
        ChannelSpec {
            endpoint: EP_FRAME_IN,
            direction: Direction::In,
            buffer_size: STREAM_BUF_SIZE,
            buffer_count: STREAM_IN_BUF_COUNT,
            transfer_size: 0,
        },
    ]
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelHandle {
    slot: u8,
    generation: u16,
}

impl ChannelHandle {
    pub fn slot(&self) -> u8 {
        self.slot
    }
}

/// Hardware side of a channel: DMA descriptors, FIFO state machines and the
/// USB endpoints they feed.
#[allow(async_fn_in_trait)]
pub trait PipelineBackend {
    /// Bind `slot` to the endpoint with its buffers placed in `region` of
    /// the DMA pool.
    fn open(&mut self, slot: u8, spec: &ChannelSpec, region: Range<usize>)
        -> Result<(), PipelineError>;
    fn close(&mut self, slot: u8);
    /// Abort in-flight transfers and drop queued buffers.
    fn reset(&mut self, slot: u8);
    fn arm(&mut self, slot: u8, transfer_size: u32) -> Result<(), PipelineError>;
    fn flush_endpoint(&mut self, ep: u8);
    fn clear_halt(&mut self, ep: u8);
    /// Route the FPGA-facing pins for the given personality.
    fn select_bus(&mut self, personality: Personality);

    async fn acquire(&mut self, slot: u8, timeout_ms: u32) -> Result<&[u8], SourceError>;
    fn release(&mut self, slot: u8) -> Result<(), SourceError>;

    /// Move streaming data until cancelled. Pending forever when no
    /// streaming channel is open.
    async fn service(&mut self);
}

#[derive(Clone, Debug)]
struct Live {
    spec: ChannelSpec,
    region: Range<usize>,
}

pub struct PipelineManager<B> {
    backend: B,
    slots: [Option<Live>; MAX_CHANNELS],
    generations: [u16; MAX_CHANNELS],
}

impl<B: PipelineBackend> PipelineManager<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            slots: [None, None, None],
            generations: [0; MAX_CHANNELS],
        }
    }

    pub fn create(&mut self, spec: ChannelSpec) -> Result<ChannelHandle, PipelineError> {
        spec.validate()?;
        if self.find_by_endpoint(spec.endpoint).is_some() {
            return Err(PipelineError::EndpointBusy);
        }
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(PipelineError::NoSlot)?;
        let region = self.carve(spec.pool_bytes())?;

        self.backend.flush_endpoint(spec.endpoint);
        self.backend.open(slot as u8, &spec, region.clone())?;
        if let Err(e) = self.backend.arm(slot as u8, spec.transfer_size) {
            self.backend.close(slot as u8);
            return Err(e);
        }

        debug!(
            "channel {} on ep {=u8:#x}: {}x{} @ {}",
            slot,
            spec.endpoint,
            spec.buffer_count,
            spec.buffer_size,
            region.start
        );
        self.slots[slot] = Some(Live { spec, region });
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        Ok(ChannelHandle {
            slot: slot as u8,
            generation: self.generations[slot],
        })
    }

    pub fn destroy(&mut self, handle: ChannelHandle) -> Result<(), PipelineError> {
        let live = self.live(handle)?;
        let ep = live.spec.endpoint;
        self.backend.flush_endpoint(ep);
        self.backend.close(handle.slot);
        self.slots[handle.slot as usize] = None;
        debug!("channel {} on ep {=u8:#x} destroyed", handle.slot, ep);
        Ok(())
    }

    /// Flush and re-arm after CLEAR_FEATURE(ENDPOINT_HALT).
    pub fn reset(&mut self, handle: ChannelHandle) -> Result<(), PipelineError> {
        let spec = self.live(handle)?.spec;
        info!("reset channel on ep {=u8:#x}", spec.endpoint);
        self.backend.reset(handle.slot);
        self.backend.flush_endpoint(spec.endpoint);
        self.backend.clear_halt(spec.endpoint);
        self.backend.arm(handle.slot, spec.transfer_size)
    }

    /// Tear down every channel; used on bus reset and personality change.
    pub fn destroy_all(&mut self) {
        for (slot, entry) in self.slots.iter_mut().enumerate() {
            if let Some(live) = entry.take() {
                self.backend.flush_endpoint(live.spec.endpoint);
                self.backend.close(slot as u8);
            }
        }
    }

    pub fn find_by_endpoint(&self, ep: u8) -> Option<ChannelHandle> {
        self.slots.iter().enumerate().find_map(|(slot, entry)| match entry {
            Some(live) if live.spec.endpoint == ep => Some(ChannelHandle {
                slot: slot as u8,
                generation: self.generations[slot],
            }),
            _ => None,
        })
    }

    pub fn spec(&self, handle: ChannelHandle) -> Result<ChannelSpec, PipelineError> {
        Ok(self.live(handle)?.spec)
    }

    pub fn live_channels(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn select_bus(&mut self, personality: Personality) {
        self.backend.select_bus(personality);
    }

    /// Chunk source over an OUT channel, for the bitstream loader.
    pub fn reader(&mut self, handle: ChannelHandle) -> Result<ChannelReader<'_, B>, PipelineError> {
        self.live(handle)?;
        Ok(ChannelReader {
            manager: self,
            handle,
            held: false,
        })
    }

    pub async fn service(&mut self) {
        self.backend.service().await
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn live(&self, handle: ChannelHandle) -> Result<&Live, PipelineError> {
        match self.slots.get(handle.slot as usize) {
            Some(Some(live)) if self.generations[handle.slot as usize] == handle.generation => {
                Ok(live)
            }
            _ => Err(PipelineError::StaleHandle),
        }
    }

    /// First-fit placement of `len` bytes in the DMA region.
    fn carve(&self, len: usize) -> Result<Range<usize>, PipelineError> {
        let mut start = 0;
        'retry: loop {
            let end = start + len;
            if end > DMA_POOL_BYTES {
                warn!("DMA pool exhausted: {} bytes wanted", len);
                return Err(PipelineError::PoolExhausted);
            }
            for live in self.slots.iter().flatten() {
                if live.region.start < end && start < live.region.end {
                    start = live.region.end.next_multiple_of(POOL_ALIGN);
                    continue 'retry;
                }
            }
            return Ok(start..end);
        }
    }
}

pub struct ChannelReader<'a, B> {
    manager: &'a mut PipelineManager<B>,
    handle: ChannelHandle,
    /// A buffer has been handed out and not yet given back.
    held: bool,
}

impl<B: PipelineBackend> ChunkSource for ChannelReader<'_, B> {
    async fn acquire(&mut self, timeout_ms: u32) -> Result<&[u8], SourceError> {
        if self.manager.live(self.handle).is_err() {
            return Err(SourceError::Stale);
        }
        let chunk = self.manager.backend.acquire(self.handle.slot, timeout_ms).await?;
        self.held = true;
        Ok(chunk)
    }

    fn release(&mut self) -> Result<(), SourceError> {
        if self.manager.live(self.handle).is_err() {
            return Err(SourceError::Stale);
        }
        if !core::mem::take(&mut self.held) {
            return Err(SourceError::Release);
        }
        self.manager.backend.release(self.handle.slot)
    }
}
