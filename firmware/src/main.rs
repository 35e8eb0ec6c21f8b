#![no_std]
#![no_main]

mod app;
mod dap;
mod jtag;
mod swd;
mod usb;
mod vcp;

use swj_probe_bsp as bsp;

use panic_rtt_target as _;
use cortex_m_rt::{entry, pre_init};
use rtt_target::{rtt_init_print, rprintln};

use bsp::rcc::CoreFrequency;

/// Maximum size in bytes of a single CMSIS-DAP v1 (HID) report.
pub const DAP1_PACKET_SIZE: u16 = 64;
/// Maximum size in bytes of a single CMSIS-DAP v2 (bulk) packet.
pub const DAP2_PACKET_SIZE: u16 = 512;
/// Maximum size in bytes of a single VCP (CDC-ACM) packet.
pub const VCP_PACKET_SIZE: u16 = 64;

pub const GIT_VERSION: &str = git_version::git_version!(fallback = "unknown");

/// Run before RAM is initialised, to check for a pending bootloader request.
#[pre_init]
unsafe fn pre_init() {
    bsp::bootload::check();
}

#[entry]
fn main() -> ! {
    rtt_init_print!();
    rprintln!("Starting swj-probe firmware {}", GIT_VERSION);

    let rcc = bsp::rcc::RCC::new(stm32ral::rcc::RCC::take().unwrap());
    let dma = bsp::dma::DMA::new(
        stm32ral::dma::DMA1::take().unwrap(),
        stm32ral::dma::DMA2::take().unwrap(),
    );
    let delay = bsp::delay::Delay::new(stm32ral::syst::SYST::take().unwrap());

    let gpioa = bsp::gpio::GPIO::new(stm32ral::gpio::GPIOA::take().unwrap());
    let gpiob = bsp::gpio::GPIO::new(stm32ral::gpio::GPIOB::take().unwrap());
    let gpioc = bsp::gpio::GPIO::new(stm32ral::gpio::GPIOC::take().unwrap());
    let gpiod = bsp::gpio::GPIO::new(stm32ral::gpio::GPIOD::take().unwrap());

    // Pin assignments for the SWJ probe board. Note the physical crossover
    // between the "spi1_*"/"spi2_*" logical names and the SPI peripherals
    // they're wired to: spi1_clk is physically SPI2_CLK and vice versa, per
    // the silkscreen labelling the pin names were inherited from.
    let pins = bsp::gpio::Pins {
        led_red: gpioc.pin(6),
        led_green: gpioc.pin(7),
        led_blue: gpioc.pin(8),

        t5v_en: gpiod.pin(0),
        tvcc_en: gpiod.pin(1),
        reset: gpiod.pin(2),
        gnd_detect: gpiod.pin(3),

        usart1_rx: gpiob.pin(7),

        usart2_rx: gpioa.pin(3),
        usart2_tx: gpioa.pin(2),

        spi1_clk: gpiob.pin(13),
        spi1_miso: gpiob.pin(14),
        spi1_mosi: gpiob.pin(15),

        spi2_clk: gpioa.pin(5),
        spi2_miso: gpioa.pin(6),
        spi2_mosi: gpioa.pin(7),

        usb_dm: gpioa.pin(11),
        usb_dp: gpioa.pin(12),
        usb_sel: gpiod.pin(4),
    };

    // spi1_clk/miso/mosi are physically wired to the SPI2 peripheral, and
    // spi2_clk/miso/mosi to SPI1; construct the SWD/JTAG engines against
    // the peripheral that's actually wired to their pins.
    let swd_spi = bsp::spi::SPI::new(stm32ral::spi::SPI2::take().unwrap());
    let jtag_spi = bsp::spi::SPI::new(stm32ral::spi::SPI1::take().unwrap());

    let vcp_uart = stm32ral::usart::USART2::take().unwrap();

    let usb_phy = stm32ral::usbphyc::USBPHYC::take().unwrap();
    let usb_global = stm32ral::otg_hs_global::OTG_HS_GLOBAL::take().unwrap();
    let usb_device = stm32ral::otg_hs_device::OTG_HS_DEVICE::take().unwrap();
    let usb_pwrclk = stm32ral::otg_hs_pwrclk::OTG_HS_PWRCLK::take().unwrap();
    let mut usb = crate::usb::USB::new(usb_phy, usb_global, usb_device, usb_pwrclk);

    let swd = swd::SWD::new(&swd_spi, &pins, &delay);
    let jtag = jtag::JTAG::new(&jtag_spi, &dma, &pins, &delay);
    let mut dap = dap::DAP::new(swd, jtag, &pins);

    let mut vcp = vcp::VCP::new(vcp_uart, &pins, &dma);

    let mut app = app::App::new(
        &rcc, &dma, &pins, &swd_spi, &jtag_spi, &mut usb, &mut dap, &mut vcp, &delay,
    );

    let serial = stm32_device_signature::device_id_hex();

    // Initialise application, including system peripherals.
    unsafe { app.setup(serial) };

    loop {
        app.poll();
    }
}
