use stm32ral::{
    usbphyc,
    otg_hs_global,
    otg_hs_device,
    otg_hs_pwrclk,
};
use crate::app::Request;
use crate::VCP_PACKET_SIZE;
use swj_probe_bsp::rcc::Clocks;
use swj_probe_bsp::otg_hs::{UsbBusType, UsbBus};
use usb_device::prelude::*;
use usb_device::bus::UsbBusAllocator;
use usbd_serial::{LineCoding, SerialPort};

mod winusb;
mod dap_v1;
mod dap_v2;

use winusb::MicrosoftDescriptors;
use dap_v1::CmsisDapV1;
use dap_v2::CmsisDapV2;

struct UninitializedUSB {
    usb_phy: usbphyc::Instance,
    global: otg_hs_global::Instance,
    device: otg_hs_device::Instance,
    pwrclk: otg_hs_pwrclk::Instance,
}

struct InitializedUSB {
    device: UsbDevice<'static, UsbBusType>,
    winusb: MicrosoftDescriptors,
    dap_v1: CmsisDapV1<'static, UsbBusType>,
    dap_v2: CmsisDapV2<'static, UsbBusType>,
    serial: SerialPort<'static, UsbBusType>,
}

enum State {
    Uninitialized(UninitializedUSB),
    Initialized(InitializedUSB),
    Initializing,
}

impl State {
    pub fn as_initialized(&self) -> &InitializedUSB {
        if let State::Initialized(initialized) = self {
            return initialized;
        } else {
            panic!("USB is not initialized yet");
        }
    }

    pub fn as_initialized_mut(&mut self) -> &mut InitializedUSB {
        if let State::Initialized(initialized) = self {
            return initialized;
        } else {
            panic!("USB is not initialized yet");
        }
    }
}

static mut EP_MEMORY: [u32; 1024] = [0; 1024];
static mut USB_BUS: Option<UsbBusAllocator<UsbBusType>> = None;

/// USB stack interface
pub struct USB {
    state: State,
}

impl USB {
    /// Create a new USB object from the peripheral instances
    pub fn new(
        usb_phy: usbphyc::Instance,
        global: otg_hs_global::Instance,
        device: otg_hs_device::Instance,
        pwrclk: otg_hs_pwrclk::Instance,
    ) -> Self {
        let usb = UninitializedUSB {
            usb_phy,
            global,
            device,
            pwrclk,
        };
        USB {
            state: State::Uninitialized(usb),
        }
    }

    /// Initialise the USB peripheral ready to start processing packets
    pub fn setup(&mut self, clocks: &Clocks, serial: &'static str) {
        let state = core::mem::replace(&mut self.state, State::Initializing);
        if let State::Uninitialized(usb) = state {
            cortex_m::interrupt::free(|_| unsafe {
                let usb = swj_probe_bsp::otg_hs::USB {
                    usb_phy: usb.usb_phy,
                    usb_global: usb.global,
                    usb_device: usb.device,
                    usb_pwrclk: usb.pwrclk,
                    hclk: clocks.hclk(),
                };

                let usb_bus = UsbBus::new(usb, &mut EP_MEMORY);
                USB_BUS = Some(usb_bus);
                let usb_bus = USB_BUS.as_ref().unwrap();

                let winusb = MicrosoftDescriptors;
                let dap_v1 = CmsisDapV1::new(&usb_bus);
                let dap_v2 = CmsisDapV2::new(&usb_bus);
                let serial_port = SerialPort::new(&usb_bus);

                let device = UsbDeviceBuilder::new(&usb_bus, UsbVidPid(0x1209, 0xFF50))
                    .manufacturer("SWJ Probe")
                    .product("SWJ Probe with CMSIS-DAP Support")
                    .serial_number(serial)
                    .device_class(0)
                    .build();

                let usb = InitializedUSB {
                    device,
                    winusb,
                    dap_v1,
                    dap_v2,
                    serial: serial_port,
                };
                self.state = State::Initialized(usb)
            });
        } else {
            panic!("Invalid state");
        }
    }

    /// Process a pending USB interrupt.
    ///
    /// Call this function when a USB interrupt occurs, or on every poll of
    /// the main loop since this firmware has no USB interrupt handler.
    ///
    /// `vcp_tx_idle` indicates whether the VCP UART's TX DMA is idle; while
    /// it's busy we don't pull new bytes out of the host-facing serial
    /// endpoint, since there's nowhere to put them yet.
    ///
    /// Returns Some(Request) if a new request has been received
    /// from the host.
    pub fn interrupt(&mut self, vcp_tx_idle: bool) -> Option<Request> {
        let usb = self.state.as_initialized_mut();
        if usb.device.poll(&mut [
            &mut usb.winusb,
            &mut usb.dap_v1,
            &mut usb.dap_v2,
            &mut usb.serial,
        ]) {
            let r = usb.dap_v1.process();
            if r.is_some() {
                return r;
            }

            let r = usb.dap_v2.process();
            if r.is_some() {
                return r;
            }

            if vcp_tx_idle {
                let mut buf = [0u8; VCP_PACKET_SIZE as usize];
                if let Ok(size) = usb.serial.read(&mut buf) {
                    if size > 0 {
                        return Some(Request::VCPPacket((buf, size)));
                    }
                }
            }
        }
        None
    }

    /// Transmit a DAP report back over the DAPv1 HID interface
    pub fn dap1_reply(&mut self, data: &[u8]) {
        let usb = self.state.as_initialized_mut();
        usb.dap_v1.write_packet(data).expect("DAPv1 EP write failed");
    }

    /// Transmit a DAP report back over the DAPv2 bulk interface
    pub fn dap2_reply(&mut self, data: &[u8]) {
        let usb = self.state.as_initialized_mut();
        usb.dap_v2.write_packet(data).expect("DAPv2 EP write failed");
    }

    /// Current line coding (baud rate, data bits, parity, stop bits)
    /// requested by the host over the CDC-ACM control interface.
    pub fn serial_line_encoding(&self) -> LineCoding {
        let usb = self.state.as_initialized();
        usb.serial.line_coding().clone()
    }

    /// Return data received from the target over the VCP UART to the host.
    pub fn serial_return(&mut self, data: &[u8]) {
        let usb = self.state.as_initialized_mut();
        let _ = usb.serial.write(data);
    }
}
