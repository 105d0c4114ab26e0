//! USB driver wrapper that reports endpoint halt clears to the worker.
//!
//! The device stack answers CLEAR_FEATURE(ENDPOINT_HALT) itself and never
//! passes it to a [`Handler`](embassy_usb::Handler); it only surfaces as
//! `Bus::endpoint_set_stalled(ep, false)`. [`HaltWatch`] wraps any driver and
//! raises the matching clear-halt flag from there.

use embassy_usb::driver::{
    Bus, Driver, EndpointAddress, EndpointAllocError, EndpointType, Event, Unsupported,
};

use crate::events::EventGroup;
use crate::log::info;
use crate::protocol::EventFlags;

pub struct HaltWatch<'e, D> {
    inner: D,
    events: &'e EventGroup,
}

impl<'e, D> HaltWatch<'e, D> {
    pub fn new(inner: D, events: &'e EventGroup) -> Self {
        Self { inner, events }
    }
}

impl<'a, 'e: 'a, D: Driver<'a>> Driver<'a> for HaltWatch<'e, D> {
    type EndpointOut = D::EndpointOut;
    type EndpointIn = D::EndpointIn;
    type ControlPipe = D::ControlPipe;
    type Bus = HaltWatchBus<'e, D::Bus>;

    fn alloc_endpoint_out(
        &mut self,
        ep_type: EndpointType,
        ep_addr: Option<EndpointAddress>,
        max_packet_size: u16,
        interval_ms: u8,
    ) -> Result<Self::EndpointOut, EndpointAllocError> {
        self.inner
            .alloc_endpoint_out(ep_type, ep_addr, max_packet_size, interval_ms)
    }

    fn alloc_endpoint_in(
        &mut self,
        ep_type: EndpointType,
        ep_addr: Option<EndpointAddress>,
        max_packet_size: u16,
        interval_ms: u8,
    ) -> Result<Self::EndpointIn, EndpointAllocError> {
        self.inner
            .alloc_endpoint_in(ep_type, ep_addr, max_packet_size, interval_ms)
    }

    fn start(self, control_max_packet_size: u16) -> (Self::Bus, Self::ControlPipe) {
        let (bus, pipe) = self.inner.start(control_max_packet_size);
        (HaltWatchBus::new(bus, self.events), pipe)
    }
}

pub struct HaltWatchBus<'e, B> {
    inner: B,
    events: &'e EventGroup,
}

impl<'e, B> HaltWatchBus<'e, B> {
    pub fn new(inner: B, events: &'e EventGroup) -> Self {
        Self { inner, events }
    }
}

impl<B: Bus> Bus for HaltWatchBus<'_, B> {
    async fn enable(&mut self) {
        self.inner.enable().await
    }

    async fn disable(&mut self) {
        self.inner.disable().await
    }

    async fn poll(&mut self) -> Event {
        self.inner.poll().await
    }

    fn endpoint_set_enabled(&mut self, ep_addr: EndpointAddress, enabled: bool) {
        self.inner.endpoint_set_enabled(ep_addr, enabled)
    }

    fn endpoint_set_stalled(&mut self, ep_addr: EndpointAddress, stalled: bool) {
        self.inner.endpoint_set_stalled(ep_addr, stalled);
        if stalled {
            return;
        }
        let ep = u8::from(ep_addr);
        if let Some(flag) = EventFlags::clear_halt_for(ep) {
            info!("CLEAR_FEATURE(HALT) ep {=u8:#x}", ep);
            self.events.raise(flag);
        }
    }

    fn endpoint_is_stalled(&mut self, ep_addr: EndpointAddress) -> bool {
        self.inner.endpoint_is_stalled(ep_addr)
    }

    fn force_reset(&mut self) -> Result<(), Unsupported> {
        self.inner.force_reset()
    }

    async fn remote_wakeup(&mut self) -> Result<(), Unsupported> {
        self.inner.remote_wakeup().await
    }
}
