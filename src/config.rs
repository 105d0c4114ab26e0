// Device identity, timing and channel geometry.

// =============================================================================
// Device identity
// =============================================================================

/// Response to VND_CMD_ID_CHECK (0xB0): NUL-padded to 16 bytes.
pub const FIRMWARE_ID: [u8; 16] = *b"ScopeFun v1.00\0\0";

pub const USB_VID: u16 = 0x04B4;
pub const USB_PID: u16 = 0x00F1;
pub const USB_MANUFACTURER: &str = "ScopeFun";
pub const USB_PRODUCT: &str = "ScopeFun Oscilloscope";
pub const USB_SERIAL: &str = "0000000000000000";

// =============================================================================
// Endpoints
// =============================================================================

/// EP2 OUT: bitstream in configuration mode, control stream when streaming.
pub const EP_CONFIG_OUT: u8 = 0x02;

/// EP4 OUT: generator stream.
pub const EP_GENERATOR_OUT: u8 = 0x04;

/// EP6 IN: acquisition frames.
pub const EP_FRAME_IN: u8 = 0x86;

// =============================================================================
// Handshake and clock timing (milliseconds)
// =============================================================================

/// PROG_B low time.
pub const RESET_PULSE_MS: u32 = 10;

/// Time the FPGA gets to clear its configuration memory after PROG_B rises.
pub const FPGA_BOOT_MS: u32 = 100;

/// Settle time between the last shifted byte and sampling DONE.
pub const DONE_SETTLE_MS: u32 = 10;

/// Per-chunk deadline while waiting for bitstream data from the host.
pub const CHUNK_TIMEOUT_MS: u32 = 2000;

/// Clock stabilisation after enabling the ADC/FPGA clock.
pub const AUX_CLOCK_SETTLE_MS: u32 = 10;

/// ADC_RESETN low time; the falling edge starts ADC calibration.
pub const ADC_RESET_PULSE_MS: u32 = 10;

// =============================================================================
// DMA channel geometry
// =============================================================================

/// Buffers in the configuration (bitstream) channel.
pub const CONFIG_BUF_COUNT: u16 = 16;

/// Streaming buffer size in bytes.
pub const STREAM_BUF_SIZE: u16 = 1024;

/// Buffers per host-to-FPGA streaming channel.
pub const STREAM_OUT_BUF_COUNT: u16 = 2;

/// Buffers in the FPGA-to-host acquisition channel.
pub const STREAM_IN_BUF_COUNT: u16 = 64;

/// Size of the static region all channel pools are carved from.
pub const DMA_POOL_BYTES: usize = 70 * 1024;

// =============================================================================
// EEPROM (24-series, I2C)
// =============================================================================

/// 7-bit base address; wValue bits [1:0] select the device.
pub const EEPROM_I2C_BASE: u8 = 0x50;

pub const EEPROM_PAGE_SIZE: usize = 64;

/// Largest single EEPROM transfer accepted over EP0.
pub const EEPROM_MAX_TRANSFER: usize = 4096;

/// Acknowledge-polling attempts after a page write before giving up.
pub const EEPROM_WRITE_POLL_LIMIT: u32 = 5000;

// =============================================================================
// Diagnostics and EP0
// =============================================================================

pub const EVENT_LOG_SIZE: usize = 4096;

/// EP0 data-stage buffer; must hold the largest EEPROM transfer.
pub const CONTROL_BUF_SIZE: usize = 4096;

// =============================================================================
// Serial configuration link
// =============================================================================

/// CCLK frequency for slave-serial configuration.
pub const CONFIG_SPI_FREQ_HZ: u32 = 25_000_000;
