// Vendor request codes, event flags and EP0 payload formats.

use bitflags::bitflags;

// =============================================================================
// Vendor request codes (bRequest)
// =============================================================================

pub const VND_CMD_ID_CHECK: u8 = 0xB0;
pub const VND_CMD_CFG_STATUS: u8 = 0xB1;
pub const VND_CMD_CFG_LOAD: u8 = 0xB2;
pub const VND_CMD_EEPROM_WRITE: u8 = 0xBA;
pub const VND_CMD_EEPROM_READ: u8 = 0xBB;
pub const VND_CMD_GET_MS_DESCRIPTOR: u8 = 0xDD;
pub const VND_CMD_AUX_CLOCK_ON: u8 = 0xE0;
pub const VND_CMD_AUX_CLOCK_OFF: u8 = 0xE1;
pub const VND_CMD_ERROR_COUNTERS: u8 = 0xEB;
pub const VND_CMD_DEVICE_RESET: u8 = 0xEE;
pub const VND_CMD_EVENT_LOG: u8 = 0xEF;

/// wIndex of the MS OS 1.0 Extended Compat ID request.
pub const MS_OS_EXT_COMPAT_ID: u16 = 0x0004;
/// wIndex of the MS OS 1.0 Extended Properties request.
pub const MS_OS_EXT_PROPERTIES: u16 = 0x0005;

/// String index Windows probes for the MS OS 1.0 string descriptor.
pub const MS_OS_STRING_INDEX: u8 = 0xEE;

/// "MSFT100" followed by the vendor code; UTF-16LE encoding of U+00DD is
/// `0xDD, 0x00`, which is exactly bMS_VendorCode + bPad.
pub const MS_OS_STRING: &str = "MSFT100\u{DD}";

// =============================================================================
// Worker events
// =============================================================================

bitflags! {
    /// Flags the callback path raises for the configuration worker.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EventFlags: u16 {
        const START_CONFIG = 1 << 0;
        const SWITCH_TO_STREAMING = 1 << 1;
        const USB_RESET = 1 << 2;
        const USB_CONFIGURED = 1 << 3;
        const AUX_ENABLE = 1 << 4;
        const AUX_DISABLE = 1 << 5;
        const POWER_DOWN = 1 << 6;
        const DEVICE_RESET = 1 << 7;
        const CLEAR_HALT_CONFIG_OUT = 1 << 8;
        const CLEAR_HALT_GENERATOR_OUT = 1 << 9;
        const CLEAR_HALT_FRAME_IN = 1 << 10;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for EventFlags {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "EventFlags({=u16:#x})", self.bits())
    }
}

impl EventFlags {
    pub const CLEAR_HALT: Self = Self::CLEAR_HALT_CONFIG_OUT
        .union(Self::CLEAR_HALT_GENERATOR_OUT)
        .union(Self::CLEAR_HALT_FRAME_IN);

    /// Requests that only touch the ADC clock lines, never the channels.
    pub const AUX: Self = Self::AUX_ENABLE
        .union(Self::AUX_DISABLE)
        .union(Self::POWER_DOWN);

    /// Clear-halt flag for a streaming endpoint address.
    pub fn clear_halt_for(ep: u8) -> Option<Self> {
        match ep {
            crate::config::EP_CONFIG_OUT => Some(Self::CLEAR_HALT_CONFIG_OUT),
            crate::config::EP_GENERATOR_OUT => Some(Self::CLEAR_HALT_GENERATOR_OUT),
            crate::config::EP_FRAME_IN => Some(Self::CLEAR_HALT_FRAME_IN),
            _ => None,
        }
    }

    /// Endpoint address of a single clear-halt flag.
    pub fn halted_endpoint(self) -> Option<u8> {
        if self == Self::CLEAR_HALT_CONFIG_OUT {
            Some(crate::config::EP_CONFIG_OUT)
        } else if self == Self::CLEAR_HALT_GENERATOR_OUT {
            Some(crate::config::EP_GENERATOR_OUT)
        } else if self == Self::CLEAR_HALT_FRAME_IN {
            Some(crate::config::EP_FRAME_IN)
        } else {
            None
        }
    }
}

// =============================================================================
// Bus speed
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbSpeed {
    Full,
    High,
    Super,
}

impl UsbSpeed {
    /// Bulk max packet size; also the bitstream chunk size.
    pub const fn bulk_packet_size(self) -> u16 {
        match self {
            UsbSpeed::Full => 64,
            UsbSpeed::High => 512,
            UsbSpeed::Super => 1024,
        }
    }
}

// =============================================================================
// Payload parsing
// =============================================================================

/// Parse the 0xB2 data stage: total bitstream length, little-endian.
pub fn parse_load_length(data: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// I2C address of the EEPROM selected by the low two wValue bits.
pub fn eeprom_address(value: u16) -> u8 {
    crate::config::EEPROM_I2C_BASE | (value & 0x0003) as u8
}

// =============================================================================
// MS OS 1.0 feature descriptors
// =============================================================================

/// Extended Compat ID descriptor binding interface 0 to WinUSB.
pub const MS_OS_COMPAT_ID_DESCRIPTOR: [u8; 40] = [
    0x28, 0x00, 0x00, 0x00, // dwLength
    0x00, 0x01, // bcdVersion
    0x04, 0x00, // wIndex
    0x01, // bCount
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // reserved
    0x00, // bFirstInterfaceNumber
    0x01, // reserved
    b'W', b'I', b'N', b'U', b'S', b'B', 0x00, 0x00, // compatibleID
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // subCompatibleID
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // reserved
];

const GUID_PROPERTY_NAME: &str = "DeviceInterfaceGUID";
const GUID_PROPERTY_VALUE: &str = "{5A6C1154-04C8-4998-9A3A-D953C87EAA35}";

const EXT_PROPERTIES_LEN: usize = 142;

/// Extended Properties descriptor carrying the DeviceInterfaceGUID.
pub const MS_OS_PROPERTIES_DESCRIPTOR: [u8; EXT_PROPERTIES_LEN] = build_ext_properties();

const fn put_utf16(buf: &mut [u8; EXT_PROPERTIES_LEN], at: usize, s: &str) -> usize {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        buf[at + 2 * i] = bytes[i];
        buf[at + 2 * i + 1] = 0;
        i += 1;
    }
    // UTF-16 NUL terminator
    buf[at + 2 * i] = 0;
    buf[at + 2 * i + 1] = 0;
    at + 2 * i + 2
}

const fn build_ext_properties() -> [u8; EXT_PROPERTIES_LEN] {
    let mut d = [0u8; EXT_PROPERTIES_LEN];
    // Header: dwLength, bcdVersion 1.00, wIndex 5, wCount 1
    d[0] = EXT_PROPERTIES_LEN as u8;
    d[5] = 0x01;
    d[6] = 0x05;
    d[8] = 0x01;
    // Property section: dwSize 132, REG_SZ, name length 40
    d[10] = 132;
    d[14] = 0x01;
    d[18] = ((GUID_PROPERTY_NAME.len() + 1) * 2) as u8;
    let at = put_utf16(&mut d, 20, GUID_PROPERTY_NAME);
    // dwPropertyDataLength 78
    d[at] = ((GUID_PROPERTY_VALUE.len() + 1) * 2) as u8;
    put_utf16(&mut d, at + 4, GUID_PROPERTY_VALUE);
    d
}

/// Descriptor length as declared in its dwLength field.
pub fn ms_os_descriptor_len(desc: &[u8]) -> usize {
    match desc.get(..4) {
        Some(&[a, b, c, d]) => u32::from_le_bytes([a, b, c, d]) as usize,
        _ => 0,
    }
    .min(desc.len())
}
