//! Firmware core for the ScopeFun FPGA front end.
//!
//! The device boots with an unconfigured FPGA. The host pushes a bitstream
//! over a bulk endpoint, which is shifted into the FPGA in slave-serial mode,
//! then the bus switches to three slave-FIFO streaming channels. Everything
//! here is hardware-agnostic behind `embedded-hal` traits and the
//! [`pipeline::PipelineBackend`] seam; the RP2040 binding lives in the
//! firmware binary.
#![cfg_attr(not(test), no_std)]

pub(crate) mod log;

pub mod aux_clock;
pub mod config;
pub mod controller;
pub mod eeprom;
pub mod error;
pub mod event_log;
pub mod events;
pub mod handshake;
pub mod loader;
pub mod mode;
pub mod pipeline;
pub mod protocol;
pub mod telemetry;
pub mod usb_bus;
pub mod usb_handler;

#[cfg(test)]
mod mock;

use events::EventGroup;
use mode::SharedStatus;
use telemetry::ErrorCounters;

/// State shared between the USB callback path and the configuration worker.
pub struct Shared {
    pub events: EventGroup,
    pub status: SharedStatus,
    pub counters: ErrorCounters,
}

impl Shared {
    pub const fn new() -> Self {
        Self {
            events: EventGroup::new(),
            status: SharedStatus::new(),
            counters: ErrorCounters::new(),
        }
    }
}

impl Default for Shared {
    fn default() -> Self {
        Self::new()
    }
}
