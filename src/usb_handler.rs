/// USB control request handler for the ScopeFun vendor commands.
///
/// Implements `embassy_usb::Handler` and runs synchronously in the USB
/// device task. Nothing here blocks on the FPGA: requests that need the
/// worker raise an event flag and return.
use embassy_usb::control::{InResponse, OutResponse, Recipient, Request, RequestType};
use embassy_usb::types::StringIndex;
use embassy_usb::Handler;
use embedded_hal::i2c::I2c;

use crate::config::{self, EEPROM_MAX_TRANSFER};
use crate::eeprom::Eeprom;
use crate::error::CommandError;
use crate::event_log::{code, EventLog};
use crate::log::{debug, info, warn};
use crate::mode::Mode;
use crate::protocol::*;
use crate::telemetry;
use crate::Shared;

type InResult = Result<usize, CommandError>;

pub struct VendorHandler<'a, I> {
    shared: &'a Shared,
    eeprom: Eeprom<I>,
    log: EventLog,
}

impl<'a, I: I2c> VendorHandler<'a, I> {
    pub fn new(shared: &'a Shared, eeprom: Eeprom<I>) -> Self {
        Self {
            shared,
            eeprom,
            log: EventLog::new(),
        }
    }

    // =========================================================================
    // 0xB2: begin FPGA configuration
    // =========================================================================

    fn cmd_cfg_load(&mut self, data: &[u8]) -> Result<(), CommandError> {
        let len = parse_load_length(data).ok_or(CommandError::BadLength)?;
        info!("CFG_LOAD: {} bytes", len);
        self.shared.events.request_load(len);
        Ok(())
    }

    // =========================================================================
    // 0xB1: configuration status poll
    // =========================================================================

    /// Reports 1 once the FPGA is configured. The first true poll after a
    /// load triggers the switch to streaming; a false poll after a failed
    /// load powers the front end down.
    fn cmd_cfg_status(&self, buf: &mut [u8]) -> InResult {
        let Shared { events, status, .. } = self.shared;
        let load_pending = events.pending(EventFlags::START_CONFIG);
        let ok = status.configured_ok() && !load_pending;

        match status.mode() {
            Mode::ConfigComplete if ok => events.raise(EventFlags::SWITCH_TO_STREAMING),
            Mode::ConfigFailed if !load_pending => events.raise(EventFlags::POWER_DOWN),
            _ => {}
        }
        debug!("CFG_STATUS: {}", ok);
        match buf.first_mut() {
            Some(b) => {
                *b = ok as u8;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    // =========================================================================
    // 0xB0: firmware identity
    // =========================================================================

    fn cmd_id_check(&self, buf: &mut [u8]) -> InResult {
        let id = &config::FIRMWARE_ID;
        let len = id.len().min(buf.len());
        buf[..len].copy_from_slice(&id[..len]);
        Ok(len)
    }

    // =========================================================================
    // 0xBA / 0xBB: external EEPROM
    // =========================================================================

    fn cmd_eeprom_write(&mut self, req: Request, data: &[u8]) -> Result<(), CommandError> {
        self.eeprom
            .write(eeprom_address(req.value), req.index, data)
            .map_err(CommandError::from)
    }

    fn cmd_eeprom_read(&mut self, req: Request, buf: &mut [u8]) -> InResult {
        let len = req.length as usize;
        if len > EEPROM_MAX_TRANSFER || len > buf.len() {
            return Err(CommandError::BadLength);
        }
        self.eeprom
            .read(eeprom_address(req.value), req.index, &mut buf[..len])?;
        Ok(len)
    }

    // =========================================================================
    // 0xEF / 0xEB: diagnostics
    // =========================================================================

    fn cmd_event_log(&self, buf: &mut [u8]) -> InResult {
        Ok(self.log.dump(buf))
    }

    fn cmd_error_counters(&self, req: Request, buf: &mut [u8]) -> InResult {
        let counts = self.shared.counters.read_and_maybe_reset(req.value != 0);
        let bytes = telemetry::to_le_bytes(&counts);
        let len = bytes.len().min(buf.len());
        buf[..len].copy_from_slice(&bytes[..len]);
        Ok(len)
    }

    // =========================================================================
    // 0xDD: MS OS 1.0 feature descriptors
    // =========================================================================

    fn cmd_ms_descriptor(&self, req: Request, buf: &mut [u8]) -> InResult {
        let desc: &[u8] = match (req.index, req.recipient) {
            (MS_OS_EXT_COMPAT_ID, Recipient::Device) => &MS_OS_COMPAT_ID_DESCRIPTOR,
            (MS_OS_EXT_PROPERTIES, Recipient::Device | Recipient::Interface) => {
                &MS_OS_PROPERTIES_DESCRIPTOR
            }
            _ => return Err(CommandError::UnknownCommand),
        };
        let len = ms_os_descriptor_len(desc).min(buf.len());
        buf[..len].copy_from_slice(&desc[..len]);
        Ok(len)
    }

    fn vendor_out(&mut self, req: Request, data: &[u8]) -> Result<(), CommandError> {
        let Shared { events, .. } = self.shared;
        match req.request {
            VND_CMD_CFG_LOAD => self.cmd_cfg_load(data),
            VND_CMD_EEPROM_WRITE => self.cmd_eeprom_write(req, data),
            VND_CMD_AUX_CLOCK_ON => {
                events.raise(EventFlags::AUX_ENABLE);
                Ok(())
            }
            VND_CMD_AUX_CLOCK_OFF => {
                events.raise(EventFlags::AUX_DISABLE);
                Ok(())
            }
            VND_CMD_DEVICE_RESET => {
                warn!("DEVICE_RESET requested");
                events.raise(EventFlags::DEVICE_RESET);
                Ok(())
            }
            _ => Err(CommandError::UnknownCommand),
        }
    }

    fn vendor_in(&mut self, req: Request, buf: &mut [u8]) -> InResult {
        match req.request {
            VND_CMD_CFG_STATUS => self.cmd_cfg_status(buf),
            VND_CMD_ID_CHECK => self.cmd_id_check(buf),
            VND_CMD_EEPROM_READ => self.cmd_eeprom_read(req, buf),
            VND_CMD_EVENT_LOG => self.cmd_event_log(buf),
            VND_CMD_ERROR_COUNTERS => self.cmd_error_counters(req, buf),
            VND_CMD_GET_MS_DESCRIPTOR => self.cmd_ms_descriptor(req, buf),
            _ => Err(CommandError::UnknownCommand),
        }
    }

    fn bus_lost(&mut self, code: u8) {
        self.log.record(code, 0);
        self.shared.events.raise(EventFlags::USB_RESET);
    }
}

// =============================================================================
// embassy_usb::Handler implementation
// =============================================================================

impl<I: I2c> Handler for VendorHandler<'_, I> {
    fn enabled(&mut self, enabled: bool) {
        if enabled {
            self.log.record(code::BUS_ENABLED, 0);
        } else {
            info!("USB disabled");
            self.bus_lost(code::BUS_DISABLED);
        }
    }

    fn reset(&mut self) {
        info!("USB reset");
        self.bus_lost(code::BUS_RESET);
    }

    fn configured(&mut self, configured: bool) {
        if configured {
            info!("USB configured");
            self.log.record(code::CONFIGURED, 1);
            self.shared.events.raise(EventFlags::USB_CONFIGURED);
        } else {
            info!("USB deconfigured");
            self.bus_lost(code::DECONFIGURED);
        }
    }

    fn suspended(&mut self, suspended: bool) {
        let code = if suspended { code::SUSPEND } else { code::RESUME };
        self.log.record(code, 0);
    }

    fn control_out(&mut self, req: Request, data: &[u8]) -> Option<OutResponse> {
        if req.request_type != RequestType::Vendor {
            return None;
        }

        self.log.record(req.request, req.value as u8);
        match self.vendor_out(req, data) {
            Ok(()) => Some(OutResponse::Accepted),
            Err(CommandError::UnknownCommand) => {
                debug!("Unknown OUT cmd {=u8:#x}, stall", req.request);
                self.log.record(code::STALL, req.request);
                None
            }
            Err(e) => {
                warn!("OUT cmd {=u8:#x} rejected: {}", req.request, e);
                Some(OutResponse::Rejected)
            }
        }
    }

    fn control_in<'a>(&'a mut self, req: Request, buf: &'a mut [u8]) -> Option<InResponse<'a>> {
        if req.request_type != RequestType::Vendor {
            return None;
        }

        self.log.record(req.request, req.value as u8);
        let limit = (req.length as usize).min(buf.len());
        match self.vendor_in(req, &mut buf[..limit]) {
            Ok(len) => Some(InResponse::Accepted(&buf[..len])),
            Err(CommandError::UnknownCommand) => {
                debug!("Unknown IN cmd {=u8:#x}, stall", req.request);
                self.log.record(code::STALL, req.request);
                None
            }
            Err(e) => {
                warn!("IN cmd {=u8:#x} rejected: {}", req.request, e);
                Some(InResponse::Rejected)
            }
        }
    }

    fn get_string(&mut self, index: StringIndex, _lang_id: u16) -> Option<&str> {
        (index.0 == MS_OS_STRING_INDEX).then_some(MS_OS_STRING)
    }
}
