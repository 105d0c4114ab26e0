// Scripted hardware for host tests.

use core::cell::RefCell;
use core::convert::Infallible;
use std::collections::VecDeque;
use std::rc::Rc;

use embassy_usb::driver::{Bus, EndpointAddress, Event, Unsupported};
use embedded_hal::digital::{self, ErrorType as PinErrorType, InputPin, OutputPin};
use embedded_hal::i2c::{self, I2c, Operation};
use embedded_hal::spi;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::spi::SpiBus;

use crate::aux_clock::AuxLines;
use crate::error::{PipelineError, SourceError};
use crate::handshake::ConfigPins;
use crate::loader::ChunkSource;
use crate::mode::Personality;
use crate::pipeline::{arrives_in_time, ChannelSpec, PipelineBackend};

// =============================================================================
// Shared trace of observable line changes and delays
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Prog(bool),
    Delay(u32),
    Clock(bool),
    AdcReset(bool),
    Shift(usize),
}

#[derive(Clone, Default)]
pub struct Trace(Rc<RefCell<Vec<Op>>>);

impl Trace {
    pub fn push(&self, op: Op) {
        self.0.borrow_mut().push(op);
    }

    pub fn ops(&self) -> Vec<Op> {
        self.0.borrow().clone()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }
}

pub struct MockDelay(Trace);

impl MockDelay {
    pub fn new(trace: &Trace) -> Self {
        Self(trace.clone())
    }
}

impl DelayNs for MockDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.0.push(Op::Delay(ns / 1_000_000));
    }

    async fn delay_ms(&mut self, ms: u32) {
        self.0.push(Op::Delay(ms));
    }
}

// =============================================================================
// FPGA configuration lines
// =============================================================================

struct PinState {
    released: bool,
    ready_while_held: bool,
    ready: bool,
    done: bool,
}

/// INIT_B follows PROG_B: low while held unless `ready_while_held`.
#[derive(Clone)]
pub struct MockPins {
    trace: Trace,
    state: Rc<RefCell<PinState>>,
}

impl MockPins {
    pub fn new(trace: &Trace) -> Self {
        Self {
            trace: trace.clone(),
            state: Rc::new(RefCell::new(PinState {
                released: true,
                ready_while_held: false,
                ready: false,
                done: false,
            })),
        }
    }

    pub fn set_init(&self, ready: bool) {
        self.state.borrow_mut().ready = ready;
    }

    pub fn set_done(&self, done: bool) {
        self.state.borrow_mut().done = done;
    }

    pub fn set_ready_while_held(&self, ready: bool) {
        self.state.borrow_mut().ready_while_held = ready;
    }
}

impl ConfigPins for MockPins {
    fn set_prog(&mut self, released: bool) {
        self.state.borrow_mut().released = released;
        self.trace.push(Op::Prog(released));
    }

    fn init_ready(&mut self) -> bool {
        let s = self.state.borrow();
        if s.released {
            s.ready
        } else {
            s.ready_while_held
        }
    }

    fn done(&mut self) -> bool {
        self.state.borrow().done
    }
}

pub struct FaultyInput;

impl PinErrorType for FaultyInput {
    type Error = digital::ErrorKind;
}

impl InputPin for FaultyInput {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Err(digital::ErrorKind::Other)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Err(digital::ErrorKind::Other)
    }
}

pub struct NullOutput;

impl PinErrorType for NullOutput {
    type Error = Infallible;
}

impl OutputPin for NullOutput {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

pub struct FaultyOutput;

impl PinErrorType for FaultyOutput {
    type Error = digital::ErrorKind;
}

impl OutputPin for FaultyOutput {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Err(digital::ErrorKind::Other)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        Err(digital::ErrorKind::Other)
    }
}

pub struct MockAux(Trace);

impl MockAux {
    pub fn new(trace: &Trace) -> Self {
        Self(trace.clone())
    }
}

impl AuxLines for MockAux {
    fn set_clock(&mut self, on: bool) {
        self.0.push(Op::Clock(on));
    }

    fn set_adc_reset(&mut self, asserted: bool) {
        self.0.push(Op::AdcReset(asserted));
    }
}

// =============================================================================
// Serial configuration link
// =============================================================================

#[derive(Default)]
struct SpiState {
    shifted: Vec<u8>,
    sizes: Vec<usize>,
    fail_after: Option<usize>,
}

#[derive(Clone)]
pub struct MockSpi {
    trace: Trace,
    state: Rc<RefCell<SpiState>>,
}

impl MockSpi {
    pub fn new(trace: &Trace) -> Self {
        Self {
            trace: trace.clone(),
            state: Rc::default(),
        }
    }

    pub fn shifted(&self) -> Vec<u8> {
        self.state.borrow().shifted.clone()
    }

    pub fn write_sizes(&self) -> Vec<usize> {
        self.state.borrow().sizes.clone()
    }

    /// Fail any write that would take the total past `limit` bytes.
    pub fn fail_after(&self, limit: usize) {
        self.state.borrow_mut().fail_after = Some(limit);
    }
}

impl spi::ErrorType for MockSpi {
    type Error = spi::ErrorKind;
}

impl SpiBus<u8> for MockSpi {
    async fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        words.fill(0xFF);
        Ok(())
    }

    async fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        let mut s = self.state.borrow_mut();
        if let Some(limit) = s.fail_after {
            if s.shifted.len() + words.len() > limit {
                return Err(spi::ErrorKind::Other);
            }
        }
        s.shifted.extend_from_slice(words);
        s.sizes.push(words.len());
        self.trace.push(Op::Shift(words.len()));
        Ok(())
    }

    async fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        self.write(write).await?;
        read.fill(0xFF);
        Ok(())
    }

    async fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.write(words).await?;
        words.fill(0xFF);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

// =============================================================================
// EEPROM bus
// =============================================================================

struct I2cState {
    memory: Vec<u8>,
    writes: Vec<(u8, Vec<u8>)>,
    nacks_left: u32,
    polls: u32,
}

#[derive(Clone)]
pub struct MockI2c(Rc<RefCell<I2cState>>);

impl Default for MockI2c {
    fn default() -> Self {
        Self(Rc::new(RefCell::new(I2cState {
            memory: vec![0xFF; 0x1_0000],
            writes: Vec::new(),
            nacks_left: 0,
            polls: 0,
        })))
    }
}

impl MockI2c {
    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.0.borrow().writes.clone()
    }

    pub fn memory(&self, at: usize) -> u8 {
        self.0.borrow().memory[at]
    }

    pub fn nack_polls(&self, n: u32) {
        self.0.borrow_mut().nacks_left = n;
    }

    pub fn poll_count(&self) -> u32 {
        self.0.borrow().polls
    }
}

impl i2c::ErrorType for MockI2c {
    type Error = i2c::ErrorKind;
}

impl I2c for MockI2c {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let mut s = self.0.borrow_mut();
        match operations {
            [Operation::Write(frame)] => {
                let at = u16::from_be_bytes([frame[0], frame[1]]) as usize;
                let n = frame.len() - 2;
                s.memory[at..at + n].copy_from_slice(&frame[2..]);
                s.writes.push((address, frame.to_vec()));
                Ok(())
            }
            [Operation::Read(_)] => {
                s.polls += 1;
                if s.nacks_left > 0 {
                    s.nacks_left -= 1;
                    Err(i2c::ErrorKind::NoAcknowledge(i2c::NoAcknowledgeSource::Address))
                } else {
                    Ok(())
                }
            }
            [Operation::Write(addr), Operation::Read(buf)] => {
                let at = u16::from_be_bytes([addr[0], addr[1]]) as usize;
                let n = buf.len();
                buf.copy_from_slice(&s.memory[at..at + n]);
                Ok(())
            }
            _ => Err(i2c::ErrorKind::Other),
        }
    }
}

// =============================================================================
// Bitstream producers
// =============================================================================

#[derive(Default)]
pub struct MockSource {
    queue: VecDeque<Vec<u8>>,
    current: Vec<u8>,
    released: usize,
    fail_release: bool,
}

impl MockSource {
    /// Split `data` into host transfers of `chunk` bytes; the queue runs dry
    /// afterwards, which reads as a timeout.
    pub fn from_chunks(data: &[u8], chunk: usize) -> Self {
        Self {
            queue: data.chunks(chunk).map(<[u8]>::to_vec).collect(),
            ..Self::default()
        }
    }

    pub fn push_front_empty(&mut self) {
        self.queue.push_front(Vec::new());
    }

    pub fn fail_release(&mut self) {
        self.fail_release = true;
    }

    pub fn released(&self) -> usize {
        self.released
    }
}

impl ChunkSource for MockSource {
    async fn acquire(&mut self, _timeout_ms: u32) -> Result<&[u8], SourceError> {
        self.current = self.queue.pop_front().ok_or(SourceError::Timeout)?;
        Ok(&self.current)
    }

    fn release(&mut self) -> Result<(), SourceError> {
        self.released += 1;
        if self.fail_release {
            Err(SourceError::Release)
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendOp {
    Open(u8, u8, core::ops::Range<usize>),
    Close(u8),
    Reset(u8),
    Arm(u8, u32),
    Flush(u8),
    ClearHalt(u8),
    SelectBus(Personality),
    Release(u8),
}

#[derive(Default)]
struct BackendState {
    ops: Vec<BackendOp>,
    /// (payload, arrival latency in ms)
    chunks: VecDeque<(Vec<u8>, u32)>,
    fail_open: bool,
    service_runs: u32,
}

#[derive(Clone, Default)]
pub struct MockBackend {
    state: Rc<RefCell<BackendState>>,
    current: Vec<u8>,
}

impl MockBackend {
    pub fn ops(&self) -> Vec<BackendOp> {
        self.state.borrow().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.borrow_mut().ops.clear();
    }

    pub fn push_chunk(&self, data: &[u8], latency_ms: u32) {
        self.state
            .borrow_mut()
            .chunks
            .push_back((data.to_vec(), latency_ms));
    }

    /// Queue `data` as on-time host transfers of `chunk` bytes.
    pub fn push_stream(&self, data: &[u8], chunk: usize) {
        for c in data.chunks(chunk) {
            self.push_chunk(c, 0);
        }
    }

    /// How many times a streaming service has been started.
    pub fn service_runs(&self) -> u32 {
        self.state.borrow().service_runs
    }

    pub fn fail_open(&self) {
        self.state.borrow_mut().fail_open = true;
    }

    fn record(&self, op: BackendOp) {
        self.state.borrow_mut().ops.push(op);
    }
}

impl PipelineBackend for MockBackend {
    fn open(
        &mut self,
        slot: u8,
        spec: &ChannelSpec,
        region: core::ops::Range<usize>,
    ) -> Result<(), PipelineError> {
        if self.state.borrow().fail_open {
            return Err(PipelineError::Backend);
        }
        self.record(BackendOp::Open(slot, spec.endpoint, region));
        Ok(())
    }

    fn close(&mut self, slot: u8) {
        self.record(BackendOp::Close(slot));
    }

    /// Drops whatever the device has already accepted for the channel.
    fn reset(&mut self, slot: u8) {
        self.state.borrow_mut().chunks.clear();
        self.record(BackendOp::Reset(slot));
    }

    fn arm(&mut self, slot: u8, transfer_size: u32) -> Result<(), PipelineError> {
        self.record(BackendOp::Arm(slot, transfer_size));
        Ok(())
    }

    fn flush_endpoint(&mut self, ep: u8) {
        self.record(BackendOp::Flush(ep));
    }

    fn clear_halt(&mut self, ep: u8) {
        self.record(BackendOp::ClearHalt(ep));
    }

    fn select_bus(&mut self, personality: Personality) {
        self.record(BackendOp::SelectBus(personality));
    }

    async fn acquire(&mut self, _slot: u8, timeout_ms: u32) -> Result<&[u8], SourceError> {
        let next = self.state.borrow_mut().chunks.pop_front();
        match next {
            Some((data, latency)) if arrives_in_time(u64::from(latency) * 1_000, timeout_ms) => {
                self.current = data;
                Ok(&self.current)
            }
            _ => Err(SourceError::Timeout),
        }
    }

    fn release(&mut self, slot: u8) -> Result<(), SourceError> {
        self.record(BackendOp::Release(slot));
        Ok(())
    }

    async fn service(&mut self) {
        self.state.borrow_mut().service_runs += 1;
        core::future::pending::<()>().await
    }
}

// =============================================================================
// USB bus
// =============================================================================

/// Records every stall change the device stack makes.
#[derive(Clone, Default)]
pub struct MockBus {
    stalls: Rc<RefCell<Vec<(u8, bool)>>>,
}

impl MockBus {
    pub fn stalls(&self) -> Vec<(u8, bool)> {
        self.stalls.borrow().clone()
    }
}

impl Bus for MockBus {
    async fn enable(&mut self) {}

    async fn disable(&mut self) {}

    async fn poll(&mut self) -> Event {
        core::future::pending().await
    }

    fn endpoint_set_enabled(&mut self, _ep_addr: EndpointAddress, _enabled: bool) {}

    fn endpoint_set_stalled(&mut self, ep_addr: EndpointAddress, stalled: bool) {
        self.stalls.borrow_mut().push((ep_addr.into(), stalled));
    }

    fn endpoint_is_stalled(&mut self, ep_addr: EndpointAddress) -> bool {
        let ep = u8::from(ep_addr);
        self.stalls
            .borrow()
            .iter()
            .rev()
            .find(|(e, _)| *e == ep)
            .is_some_and(|&(_, stalled)| stalled)
    }

    async fn remote_wakeup(&mut self) -> Result<(), Unsupported> {
        Err(Unsupported)
    }
}
