#![no_std]
#![no_main]

mod fifo;

use defmt::*;
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_rp::bind_interrupts;
use embassy_rp::gpio::{Input, Level, Output, Pull};
use embassy_rp::i2c::{self, I2c};
use embassy_rp::peripherals::{I2C1, PIO0, SPI0, USB};
use embassy_rp::pio::{self, Pio};
use embassy_rp::spi::{self, Spi};
use embassy_rp::usb::{Driver, InterruptHandler};
use embassy_time::Delay;
use embassy_usb::driver::{Direction, EndpointAddress};
use embassy_usb::Builder;
use panic_probe as _;
use static_cell::StaticCell;

use scopefun_fw::aux_clock::{AdcLines, AuxClock};
use scopefun_fw::config::*;
use scopefun_fw::controller::{FrontEnd, ModeController};
use scopefun_fw::eeprom::Eeprom;
use scopefun_fw::handshake::{FpgaPins, HandshakeGate};
use scopefun_fw::protocol::UsbSpeed;
use scopefun_fw::usb_bus::HaltWatch;
use scopefun_fw::usb_handler::VendorHandler;
use scopefun_fw::Shared;

use crate::fifo::{Endpoints, FifoBus, FifoPins, RpBackend, UsbDriver};

// =============================================================================
// Interrupt bindings
// =============================================================================

bind_interrupts!(struct Irqs {
    USBCTRL_IRQ => InterruptHandler<USB>;
    PIO0_IRQ_0 => pio::InterruptHandler<PIO0>;
});

// =============================================================================
// State shared between the USB handler (sync) and the worker task (async)
// =============================================================================

static SHARED: Shared = Shared::new();

// =============================================================================
// Concrete worker type
// =============================================================================

type ConfigLink = Spi<'static, SPI0, spi::Async>;
type Pins = FpgaPins<Output<'static>, Input<'static>, Input<'static>>;
type Adc = AdcLines<Output<'static>, Output<'static>>;
type Worker = ModeController<'static, Pins, Adc, Delay, ConfigLink, RpBackend>;
type WatchedDriver = HaltWatch<'static, UsbDriver>;
type Handler = VendorHandler<'static, I2c<'static, I2C1, i2c::Blocking>>;

fn reboot() {
    cortex_m::peripheral::SCB::sys_reset();
}

// =============================================================================
// Entry point
// =============================================================================

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let p = embassy_rp::init(Default::default());

    info!("ScopeFun firmware starting up");

    // ---- Slave-serial configuration link ----
    // DIN is sampled by the FPGA on the rising CCLK edge, MSB first.
    let mut spi_config = spi::Config::default();
    spi_config.frequency = CONFIG_SPI_FREQ_HZ;
    spi_config.phase = spi::Phase::CaptureOnSecondTransition;
    spi_config.polarity = spi::Polarity::IdleHigh;
    let link: ConfigLink = Spi::new_txonly(p.SPI0, p.PIN_18, p.PIN_19, p.DMA_CH0, spi_config);

    let prog_b = Output::new(p.PIN_17, Level::High);
    let init_b = Input::new(p.PIN_20, Pull::Up);
    let done = Input::new(p.PIN_21, Pull::Up);
    let gate = HandshakeGate::new(FpgaPins::new(prog_b, init_b, done), Delay);

    // ---- ADC clock and reset ----
    let clock_en = Output::new(p.PIN_22, Level::Low);
    let adc_reset_n = Output::new(p.PIN_28, Level::Low);
    let aux = AuxClock::new(AdcLines::new(clock_en, adc_reset_n), Delay);

    // ---- Board EEPROM ----
    let i2c = I2c::new_blocking(p.I2C1, p.PIN_27, p.PIN_26, i2c::Config::default());

    // ---- Slave-FIFO state machines ----
    let Pio {
        mut common,
        sm0,
        sm1,
        sm2,
        ..
    } = Pio::new(p.PIO0, Irqs);
    let pins = FifoPins {
        frame_data: [
            common.make_pio_pin(p.PIN_0),
            common.make_pio_pin(p.PIN_1),
            common.make_pio_pin(p.PIN_2),
            common.make_pio_pin(p.PIN_3),
            common.make_pio_pin(p.PIN_4),
            common.make_pio_pin(p.PIN_5),
            common.make_pio_pin(p.PIN_6),
            common.make_pio_pin(p.PIN_7),
        ],
        frame_strobe: common.make_pio_pin(p.PIN_8),
        generator_data: [
            common.make_pio_pin(p.PIN_9),
            common.make_pio_pin(p.PIN_10),
            common.make_pio_pin(p.PIN_11),
            common.make_pio_pin(p.PIN_12),
        ],
        generator_strobe: common.make_pio_pin(p.PIN_13),
        control_data: [common.make_pio_pin(p.PIN_14), common.make_pio_pin(p.PIN_15)],
        control_strobe: common.make_pio_pin(p.PIN_16),
    };
    let bus = FifoBus::new(
        &mut common,
        sm0,
        sm1,
        sm2,
        pins,
        p.DMA_CH2,
        p.DMA_CH3,
        p.DMA_CH4,
    );

    // ---- USB driver ----
    // Endpoint halt clears never reach the handler, so the bus reports them.
    let driver = HaltWatch::new(Driver::new(p.USB, Irqs), &SHARED.events);

    let mut usb_config = embassy_usb::Config::new(USB_VID, USB_PID);
    usb_config.manufacturer = Some(USB_MANUFACTURER);
    usb_config.product = Some(USB_PRODUCT);
    usb_config.serial_number = Some(USB_SERIAL);
    usb_config.max_power = 500;
    usb_config.max_packet_size_0 = 64;

    // Descriptor buffers (must be 'static)
    static CONFIG_DESC: StaticCell<[u8; 256]> = StaticCell::new();
    static BOS_DESC: StaticCell<[u8; 256]> = StaticCell::new();
    static MSOS_DESC: StaticCell<[u8; 256]> = StaticCell::new();
    static CONTROL_BUF: StaticCell<[u8; CONTROL_BUF_SIZE]> = StaticCell::new();

    let mut builder = Builder::new(
        driver,
        usb_config,
        CONFIG_DESC.init([0; 256]),
        BOS_DESC.init([0; 256]),
        MSOS_DESC.init([0; 256]),
        CONTROL_BUF.init([0; CONTROL_BUF_SIZE]),
    );

    // ---- Handler ----
    static HANDLER: StaticCell<Handler> = StaticCell::new();
    let handler = HANDLER.init(VendorHandler::new(&SHARED, Eeprom::new(i2c)));
    builder.handler(handler);

    // ---- Vendor-class interface with bulk endpoints ----
    //
    // The host library addresses EP2 OUT (bitstream, then control), EP4 OUT
    // (generator) and EP6 IN (frames) directly.
    let speed = UsbSpeed::Full;
    let packet = speed.bulk_packet_size();

    let mut func = builder.function(0xFF, 0x00, 0x00);
    let mut iface = func.interface();
    let mut alt = iface.alt_setting(0xFF, 0x00, 0x00, None);

    let config_out = alt.endpoint_bulk_out(
        Some(EndpointAddress::from_parts(2, Direction::Out)),
        packet,
    );
    let generator_out = alt.endpoint_bulk_out(
        Some(EndpointAddress::from_parts(4, Direction::Out)),
        packet,
    );
    let frame_in = alt.endpoint_bulk_in(
        Some(EndpointAddress::from_parts(6, Direction::In)),
        packet,
    );

    drop(func); // release borrow on builder

    // ---- Worker ----
    static POOL: StaticCell<[u8; DMA_POOL_BYTES]> = StaticCell::new();
    let backend = RpBackend::new(
        Endpoints {
            config_out,
            generator_out,
            frame_in,
        },
        bus,
        POOL.init([0; DMA_POOL_BYTES]),
        &SHARED.counters,
    );
    let worker = ModeController::new(
        &SHARED,
        FrontEnd { gate, aux, link },
        backend,
        speed,
        reboot,
    );

    // ---- Build and launch ----
    let usb = builder.build();

    spawner.must_spawn(usb_device_task(usb));
    spawner.must_spawn(config_worker_task(worker));

    info!("ScopeFun ready: VID:PID = {:04x}:{:04x}", USB_VID, USB_PID);

    // Main task has nothing else to do; park forever.
    loop {
        embassy_time::Timer::after_secs(3600).await;
    }
}

// =============================================================================
// USB device task: runs the USB stack, dispatches control transfers
// =============================================================================

#[embassy_executor::task]
async fn usb_device_task(mut usb: embassy_usb::UsbDevice<'static, WatchedDriver>) {
    usb.run().await;
}

// =============================================================================
// Configuration worker: bitstream loads, mode switches, pipeline teardown
// =============================================================================

#[embassy_executor::task]
async fn config_worker_task(mut worker: Worker) {
    let fault = worker.run().await;
    defmt::panic!("configuration worker stopped: {}", fault);
}
