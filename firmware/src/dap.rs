// Copyright 2019-2020 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

use crate::{
    bsp::gpio::Pins,
    jtag::{self, JtagChain},
    swd, DAP1_PACKET_SIZE, DAP2_PACKET_SIZE,
};
use core::convert::{TryFrom, TryInto};
use core::sync::atomic::{AtomicBool, Ordering};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Copy, Clone)]
pub enum DAPVersion {
    V1,
    V2,
}

#[derive(Copy, Clone, TryFromPrimitive, PartialEq)]
#[allow(non_camel_case_types)]
#[repr(u8)]
enum Command {
    // General Commands
    DAP_Info = 0x00,
    DAP_HostStatus = 0x01,
    DAP_Connect = 0x02,
    DAP_Disconnect = 0x03,
    DAP_WriteABORT = 0x08,
    DAP_Delay = 0x09,
    DAP_ResetTarget = 0x0A,

    // Common SWD/JTAG Commands
    DAP_SWJ_Pins = 0x10,
    DAP_SWJ_Clock = 0x11,
    DAP_SWJ_Sequence = 0x12,

    // SWD Commands
    DAP_SWD_Configure = 0x13,
    DAP_SWD_Sequence = 0x1D,

    // JTAG Commands
    DAP_JTAG_Sequence = 0x14,
    DAP_JTAG_Configure = 0x15,
    DAP_JTAG_IDCODE = 0x16,

    // Transfer Commands
    DAP_TransferConfigure = 0x04,
    DAP_Transfer = 0x05,
    DAP_TransferBlock = 0x06,
    DAP_TransferAbort = 0x07,

    // Atomic Commands
    DAP_ExecuteCommands = 0x7F,

    // Unimplemented Command Response, and the wire value for "Invalid".
    Unimplemented = 0xFF,
}

#[derive(Copy, Clone, IntoPrimitive)]
#[allow(non_camel_case_types)]
#[repr(u8)]
enum ResponseStatus {
    DAP_OK = 0x00,
    DAP_ERROR = 0xFF,
}

#[derive(Copy, Clone, TryFromPrimitive)]
#[allow(non_camel_case_types)]
#[repr(u8)]
enum DAPInfoID {
    VendorID = 0x01,
    ProductID = 0x02,
    SerialNumber = 0x03,
    FirmwareVersion = 0x04,
    TargetVendor = 0x05,
    TargetName = 0x06,
    Capabilities = 0xF0,
    TestDomainTimer = 0xF1,
    MaxPacketCount = 0xFE,
    MaxPacketSize = 0xFF,
}

#[derive(Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
enum HostStatusType {
    Connect = 0,
    Running = 1,
}

#[derive(Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
enum ConnectPort {
    Default = 0,
    SWD = 1,
    JTAG = 2,
}

#[repr(u8)]
enum ConnectPortResponse {
    Failed = 0,
    SWD = 1,
    JTAG = 2,
}

/// Vendor command sub-range, 0x80..=0x9F in the wire command byte.
const VENDOR_RANGE: core::ops::RangeInclusive<u8> = 0x80..=0x9F;

/// Two-byte sentinel the host must send with Vendor0 before Vendor1 will
/// actually jump to the system bootloader, so a stray vendor command can't
/// reset the probe into DFU mode by accident.
const BOOTLOAD_ARM_SENTINEL: u16 = 0x1209;

struct Request<'a> {
    data: &'a [u8],
}

impl<'a> Request<'a> {
    pub fn next_u8(&mut self) -> u8 {
        let value = self.data[0];
        self.data = &self.data[1..];
        value
    }

    pub fn next_u16(&mut self) -> u16 {
        let value = u16::from_le_bytes(self.data[0..2].try_into().unwrap());
        self.data = &self.data[2..];
        value
    }

    pub fn next_u32(&mut self) -> u32 {
        let value = u32::from_le_bytes(self.data[0..4].try_into().unwrap());
        self.data = &self.data[4..];
        value
    }

    /// Take the rest of the request data, leaving this `Request` empty.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = self.data;
        self.data = &[];
        rest
    }

    pub fn remaining_len(&self) -> usize {
        self.data.len()
    }
}

struct ResponseWriter<'a> {
    buf: &'a mut [u8],
    idx: usize,
}

impl<'a> ResponseWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        ResponseWriter { buf, idx: 0 }
    }

    /// Write the echoed command ID byte at the current position, returning
    /// the index it was written to (so it can be rewritten to Invalid later
    /// if the command turns out to be malformed).
    pub fn begin(&mut self, command_byte: u8) -> usize {
        let at = self.idx;
        self.buf[self.idx] = command_byte;
        self.idx += 1;
        at
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf[self.idx] = value;
        self.idx += 1;
    }

    pub fn write_u16(&mut self, value: u16) {
        let value = value.to_le_bytes();
        self.buf[self.idx..self.idx + 2].copy_from_slice(&value);
        self.idx += 2;
    }

    pub fn write_u32(&mut self, value: u32) {
        let value = value.to_le_bytes();
        self.buf[self.idx..self.idx + 4].copy_from_slice(&value);
        self.idx += 4;
    }

    pub fn write_slice(&mut self, data: &[u8]) {
        self.buf[self.idx..self.idx + data.len()].copy_from_slice(data);
        self.idx += data.len();
    }

    pub fn write_ok(&mut self) {
        self.write_u8(ResponseStatus::DAP_OK.into());
    }

    pub fn write_err(&mut self) {
        self.write_u8(ResponseStatus::DAP_ERROR.into());
    }

    pub fn write_u8_at(&mut self, idx: usize, value: u8) {
        self.buf[idx] = value;
    }

    pub fn write_u16_at(&mut self, idx: usize, value: u16) {
        let value = value.to_le_bytes();
        self.buf[idx..idx + 2].copy_from_slice(&value);
    }

    pub fn mut_at(&mut self, idx: usize) -> &mut u8 {
        &mut self.buf[idx]
    }

    pub fn read_u8_at(&self, idx: usize) -> u8 {
        self.buf[idx]
    }

    pub fn remaining(&mut self) -> &mut [u8] {
        &mut self.buf[self.idx..]
    }

    pub fn skip(&mut self, n: usize) {
        self.idx += n;
    }
}

#[derive(Copy, Clone, PartialEq)]
enum DAPMode {
    SWD,
    JTAG,
}

pub struct DAP<'a> {
    swd: swd::SWD<'a>,
    jtag: jtag::JTAG<'a>,
    jtag_chain: JtagChain,
    pins: &'a Pins<'a>,
    mode: Option<DAPMode>,
    match_retries: usize,

    /// `transfer_config.match_mask`: persists across DAP_Transfer calls
    /// until changed by a MaskSet write record, not reset per-batch.
    match_mask: u32,

    /// Set by DAP_TransferAbort, checked by the in-progress Transfer or
    /// TransferBlock loop. We only ever see an abort request between
    /// reports (processing one report runs to completion before the next
    /// USB packet is read), so this just needs to survive until the start
    /// of the next Transfer/TransferBlock call.
    abort_flag: AtomicBool,

    /// Armed by Vendor0 with the correct sentinel, consumed by Vendor1.
    bootload_armed: AtomicBool,
}

impl<'a> DAP<'a> {
    pub fn new(swd: swd::SWD<'a>, jtag: jtag::JTAG<'a>, pins: &'a Pins) -> Self {
        DAP {
            swd,
            jtag,
            jtag_chain: JtagChain::new(),
            pins,
            mode: None,
            match_retries: 5,
            match_mask: 0xFFFF_FFFF,
            abort_flag: AtomicBool::new(false),
            bootload_armed: AtomicBool::new(false),
        }
    }

    /// Process a new CMSIS-DAP command from `report`.
    ///
    /// Returns number of bytes written to response buffer.
    pub fn process_command(
        &mut self,
        report: &[u8],
        rbuf: &mut [u8],
        version: DAPVersion,
    ) -> usize {
        if report.is_empty() {
            return 0;
        }

        let mut req = Request { data: report };
        let command_byte = req.next_u8();

        if command_byte == Command::DAP_TransferAbort as u8 {
            self.process_transfer_abort();
            // Do not send a response for transfer abort commands.
            return 0;
        }

        let mut resp = ResponseWriter::new(rbuf);

        if command_byte == Command::DAP_ExecuteCommands as u8 {
            resp.begin(command_byte);

            let count = if req.remaining_len() == 0 {
                0
            } else {
                req.next_u8()
            };
            resp.write_u8(count);

            for _ in 0..count {
                if req.remaining_len() == 0 || resp.idx >= resp.capacity() {
                    break;
                }

                let sub_command_byte = req.next_u8();
                let id_idx = resp.begin(sub_command_byte);
                if !self.dispatch(sub_command_byte, &mut req, version, &mut resp) {
                    resp.write_u8_at(id_idx, Command::Unimplemented as u8);
                    break;
                }
            }

            return resp.idx;
        }

        let id_idx = resp.begin(command_byte);
        if !self.dispatch(command_byte, &mut req, version, &mut resp) {
            resp.write_u8_at(id_idx, Command::Unimplemented as u8);
        }
        resp.idx
    }

    /// Run the single command named by `command_byte`, writing its response
    /// (not including the echoed ID, which the caller already wrote) into
    /// `resp`. Returns false if the command byte is unrecognised, in which
    /// case the caller is responsible for rewriting the echoed ID to
    /// Invalid.
    fn dispatch(
        &mut self,
        command_byte: u8,
        req: &mut Request,
        version: DAPVersion,
        resp: &mut ResponseWriter,
    ) -> bool {
        if VENDOR_RANGE.contains(&command_byte) {
            self.process_vendor(command_byte - *VENDOR_RANGE.start(), req, resp);
            return true;
        }

        let command = match Command::try_from(command_byte) {
            Ok(c) => c,
            Err(_) => {
                resp.write_err();
                return false;
            }
        };

        match command {
            Command::DAP_Info => self.process_info(req, resp, version),
            Command::DAP_HostStatus => self.process_host_status(req, resp),
            Command::DAP_Connect => self.process_connect(req, resp),
            Command::DAP_Disconnect => self.process_disconnect(req, resp),
            Command::DAP_WriteABORT => self.process_write_abort(req, resp),
            Command::DAP_Delay => self.process_delay(req, resp),
            Command::DAP_ResetTarget => self.process_reset_target(req, resp),
            Command::DAP_SWJ_Pins => self.process_swj_pins(req, resp),
            Command::DAP_SWJ_Clock => self.process_swj_clock(req, resp),
            Command::DAP_SWJ_Sequence => self.process_swj_sequence(req, resp),
            Command::DAP_SWD_Configure => self.process_swd_configure(req, resp),
            Command::DAP_SWD_Sequence => self.process_swd_sequence(req, resp),
            Command::DAP_JTAG_Sequence => self.process_jtag_sequence(req, resp),
            Command::DAP_JTAG_Configure => self.process_jtag_configure(req, resp),
            Command::DAP_JTAG_IDCODE => self.process_jtag_idcode(req, resp),
            Command::DAP_TransferConfigure => self.process_transfer_configure(req, resp),
            Command::DAP_Transfer => self.process_transfer(req, resp),
            Command::DAP_TransferBlock => self.process_transfer_block(req, resp),
            Command::DAP_TransferAbort => self.process_transfer_abort(),
            Command::DAP_ExecuteCommands => {
                // Nesting a batch inside itself isn't supported.
                resp.write_err();
            }
            Command::Unimplemented => {
                resp.write_err();
                return false;
            }
        }

        true
    }

    fn process_info(&mut self, req: &mut Request, resp: &mut ResponseWriter, version: DAPVersion) {
        match DAPInfoID::try_from(req.next_u8()) {
            // Return 0-length string for VendorID, ProductID, SerialNumber
            // to indicate they should be read from USB descriptor instead
            Ok(DAPInfoID::VendorID) => resp.write_u8(0),
            Ok(DAPInfoID::ProductID) => resp.write_u8(0),
            Ok(DAPInfoID::SerialNumber) => resp.write_u8(0),
            // Return git version as firmware version
            Ok(DAPInfoID::FirmwareVersion) => {
                resp.write_u8(crate::GIT_VERSION.len() as u8);
                resp.write_slice(crate::GIT_VERSION.as_bytes());
            }
            // Return 0-length string for TargetVendor and TargetName to indicate
            // unknown target device.
            Ok(DAPInfoID::TargetVendor) => resp.write_u8(0),
            Ok(DAPInfoID::TargetName) => resp.write_u8(0),
            Ok(DAPInfoID::Capabilities) => {
                resp.write_u8(1);
                // Bit 0: SWD supported
                // Bit 1: JTAG supported
                // Bit 4: Atomic commands supported
                // Bit 5: Test Domain Timer supported
                resp.write_u8(0b0011_0011);
            }
            Ok(DAPInfoID::TestDomainTimer) => {
                resp.write_u8(4);
                resp.write_u32(self.swd.timer_frequency());
            }
            Ok(DAPInfoID::MaxPacketCount) => {
                resp.write_u8(1);
                // Maximum of one packet at a time
                resp.write_u8(1);
            }
            Ok(DAPInfoID::MaxPacketSize) => {
                resp.write_u8(2);
                match version {
                    DAPVersion::V1 => {
                        // Maximum of 64 bytes per packet
                        resp.write_u16(DAP1_PACKET_SIZE);
                    }
                    DAPVersion::V2 => {
                        // Maximum of 512 bytes per packet
                        resp.write_u16(DAP2_PACKET_SIZE);
                    }
                }
            }
            _ => resp.write_u8(0),
        }
    }

    fn process_host_status(&mut self, req: &mut Request, resp: &mut ResponseWriter) {
        let status_type = req.next_u8();
        let status_status = req.next_u8();
        // Use HostStatus to set our LED when host is connected to target
        if let Ok(HostStatusType::Connect) = HostStatusType::try_from(status_type) {
            match status_status {
                0 => {
                    self.pins.led_red.set_low();
                    self.pins.led_green.set_high();
                }
                1 => {
                    self.pins.led_red.set_high();
                    self.pins.led_green.set_low();
                }
                _ => (),
            }
        }
        resp.write_u8(0);
    }

    fn process_connect(&mut self, req: &mut Request, resp: &mut ResponseWriter) {
        let port = req.next_u8();
        match ConnectPort::try_from(port) {
            Ok(ConnectPort::Default) | Ok(ConnectPort::SWD) => {
                self.pins.swd_mode();
                self.swd.spi_enable();
                self.mode = Some(DAPMode::SWD);
                resp.write_u8(ConnectPortResponse::SWD as u8);
            }
            Ok(ConnectPort::JTAG) => {
                self.pins.jtag_mode();
                self.jtag.spi_enable();
                self.mode = Some(DAPMode::JTAG);
                resp.write_u8(ConnectPortResponse::JTAG as u8);
            }
            _ => {
                resp.write_u8(ConnectPortResponse::Failed as u8);
            }
        }
    }

    fn process_disconnect(&mut self, _req: &mut Request, resp: &mut ResponseWriter) {
        self.pins.high_impedance_mode();
        self.mode = None;
        self.swd.spi_disable();
        self.jtag.spi_disable();
        resp.write_ok();
    }

    fn process_write_abort(&mut self, req: &mut Request, resp: &mut ResponseWriter) {
        if self.mode.is_none() {
            resp.write_err();
            return;
        }
        let idx = req.next_u8() as usize;
        let word = req.next_u32();
        match self.mode {
            Some(DAPMode::SWD) => match self.swd.write_dp(0x00, word) {
                Ok(_) => resp.write_ok(),
                Err(_) => resp.write_err(),
            },
            Some(DAPMode::JTAG) => {
                if idx >= self.jtag_chain.count() {
                    resp.write_err();
                    return;
                }
                // The ABORT register is accessed directly through a plain
                // 32-bit DR scan while IR selects the dedicated ABORT
                // instruction, unlike DPACC/APACC which shift a 3-bit
                // request header alongside the data.
                const JTAG_ABORT_IR: u32 = 0b1000;
                self.jtag.jtag_ir(&self.jtag_chain, idx, JTAG_ABORT_IR);
                self.jtag.jtag_dr(&self.jtag_chain, idx, word);
                resp.write_ok();
            }
            None => resp.write_err(),
        }
    }

    fn process_delay(&mut self, req: &mut Request, resp: &mut ResponseWriter) {
        let delay = req.next_u16() as u32;
        cortex_m::asm::delay(48 * delay);
        resp.write_ok();
    }

    fn process_reset_target(&mut self, _req: &mut Request, resp: &mut ResponseWriter) {
        resp.write_ok();
        // "No device specific reset sequence is implemented"
        resp.write_u8(0);
    }

    fn process_swj_pins(&mut self, req: &mut Request, resp: &mut ResponseWriter) {
        let output = req.next_u8();
        let mask = req.next_u8();
        let wait = req.next_u32();

        const SWCLK_POS: u8 = 0;
        const SWDIO_POS: u8 = 1;
        const TDI_POS: u8 = 2;
        const TDO_POS: u8 = 3;
        const NTRST_POS: u8 = 5;
        const NRESET_POS: u8 = 7;

        match self.mode {
            Some(DAPMode::SWD) => {
                // In SWD mode, use SPI1 MOSI and CLK for SWDIO/TMS and SWCLK/TCK.
                // Between transfers those pins are in SPI alternate mode, so swap them
                // to output to manually set them. They'll be reset to SPI mode by the
                // next transfer command.
                if mask & (1 << SWDIO_POS) != 0 {
                    self.pins.spi1_mosi.set_mode_output();
                    self.pins.spi1_mosi.set_bool(output & (1 << SWDIO_POS) != 0);
                }
                if mask & (1 << SWCLK_POS) != 0 {
                    self.pins.spi1_clk.set_mode_output();
                    self.pins.spi1_clk.set_bool(output & (1 << SWCLK_POS) != 0);
                }
            }
            Some(DAPMode::JTAG) => {
                // In JTAG mode, use SPI1 MOSI and SPI2 SLK for SWDIO/TMS and SWCLK/TCK,
                // and SPI2 MOSI for TDI. Between transfers these pins are already in GPIO
                // mode, so we don't need to change them.
                //
                // TDO is an input pin for JTAG and is ignored to match the DAPLink implementation.
                if mask & (1 << SWDIO_POS) != 0 {
                    self.pins.spi1_mosi.set_bool(output & (1 << SWDIO_POS) != 0);
                }
                if mask & (1 << SWCLK_POS) != 0 {
                    self.pins.spi2_clk.set_bool(output & (1 << SWCLK_POS) != 0);
                }
                if mask & (1 << TDI_POS) != 0 {
                    self.pins.spi2_mosi.set_bool(output & (1 << TDI_POS) != 0);
                }
            }

            // When not in any mode, ignore JTAG/SWD pins entirely.
            None => (),
        };

        // Always allow setting the nRESET pin, which is always in output open-drain mode.
        if mask & (1 << NRESET_POS) != 0 {
            self.pins.reset.set_bool(output & (1 << NRESET_POS) != 0);
        }

        // Delay required time in µs (approximate delay).
        cortex_m::asm::delay(42 * wait);

        // Read and return pin state
        let state = ((self.pins.spi1_clk.get_state() as u8) << SWCLK_POS)
            | ((self.pins.spi1_miso.get_state() as u8) << SWDIO_POS)
            | ((self.pins.spi2_mosi.get_state() as u8) << TDI_POS)
            | ((self.pins.spi2_miso.get_state() as u8) << TDO_POS)
            | (1 << NTRST_POS)
            | ((self.pins.reset.get_state() as u8) << NRESET_POS);
        resp.write_u8(state);
    }

    fn process_swj_clock(&mut self, req: &mut Request, resp: &mut ResponseWriter) {
        let clock = req.next_u32();

        self.jtag.set_clock(clock);
        let valid = self.swd.set_clock(clock);
        if valid {
            resp.write_ok();
        } else {
            resp.write_err();
        }
    }

    fn process_swj_sequence(&mut self, req: &mut Request, resp: &mut ResponseWriter) {
        let nbits: usize = match req.next_u8() {
            // CMSIS-DAP says 0 means 256 bits
            0 => 256,
            // Other integers are normal.
            n => n as usize,
        };

        let nbytes = (nbits + 7) / 8;
        if nbytes > req.remaining_len() {
            resp.write_err();
            return;
        }
        let seq = &req.data[..nbytes];
        req.data = &req.data[nbytes..];

        match self.mode {
            Some(DAPMode::SWD) => {
                self.swd.tx_sequence(seq, nbits);
            }
            Some(DAPMode::JTAG) => {
                self.jtag.tms_sequence(seq, nbits);
            }
            None => {
                resp.write_err();
                return;
            }
        }

        resp.write_ok();
    }

    fn process_swd_configure(&mut self, req: &mut Request, resp: &mut ResponseWriter) {
        let config = req.next_u8();
        let clk_period = config & 0b011;
        let always_data = (config & 0b100) != 0;
        self.swd.set_turnaround(clk_period);
        self.swd.set_data_phase_always(always_data);
        resp.write_ok();
    }

    /// DAP_SWD_Sequence: a count of sequences, each with an info byte (bit 7
    /// selects input vs output, bits 5:0 give the bit count with 0 meaning
    /// 64) followed by TDI/SWDIO payload bytes for output sequences.
    fn process_swd_sequence(&mut self, req: &mut Request, resp: &mut ResponseWriter) {
        if !matches!(self.mode, Some(DAPMode::SWD)) {
            resp.write_err();
            return;
        }

        let nseqs = req.next_u8();
        resp.write_ok();

        for _ in 0..nseqs {
            let info = req.next_u8();
            let input = (info & 0x80) != 0;
            let bits = match info & 0x3F {
                0 => 64,
                n => n as usize,
            };
            let nbytes = (bits + 7) / 8;

            if input {
                let mut buf = [0u8; 8];
                self.swd.rx_sequence(&mut buf[..nbytes], bits);
                resp.write_slice(&buf[..nbytes]);
            } else {
                if req.remaining_len() < nbytes {
                    return;
                }
                let payload = &req.data[..nbytes];
                self.swd.tx_sequence(payload, bits);
                req.data = &req.data[nbytes..];
            }
        }
    }

    fn process_jtag_sequence(&mut self, req: &mut Request, resp: &mut ResponseWriter) {
        match self.mode {
            Some(DAPMode::JTAG) => {}
            _ => {
                resp.write_err();
                return;
            }
        }

        resp.write_ok();

        // Run requested JTAG sequences. Cannot fail. Consumes the rest of
        // the request, since the nested variable-length per-sequence
        // headers aren't pre-parsed; DAP_JTAG_Sequence must be the last
        // command in a DAP_ExecuteCommands batch.
        let size = self.jtag.sequences(req.rest(), resp.remaining());
        resp.skip(size);
    }

    /// DAP_JTAG_Configure: a count followed by one IR length byte per device
    /// in the chain, ordered from the device nearest TDI to the device
    /// nearest TDO.
    fn process_jtag_configure(&mut self, req: &mut Request, resp: &mut ResponseWriter) {
        let count = req.next_u8() as usize;
        if count == 0 || count > req.remaining_len() {
            resp.write_err();
            return;
        }
        let ir_lengths = &req.data[..count];
        let ok = self.jtag_chain.configure(ir_lengths);
        req.data = &req.data[count..];

        if ok {
            resp.write_ok();
        } else {
            resp.write_err();
        }
    }

    fn process_jtag_idcode(&mut self, req: &mut Request, resp: &mut ResponseWriter) {
        if !matches!(self.mode, Some(DAPMode::JTAG)) {
            resp.write_err();
            return;
        }

        let index = req.next_u8() as usize;
        if index >= self.jtag_chain.count() {
            resp.write_err();
            return;
        }

        resp.write_ok();
        let idcode = self.jtag.jtag_idcode(&self.jtag_chain, index);
        resp.write_u32(idcode);
    }

    fn process_transfer_configure(&mut self, req: &mut Request, resp: &mut ResponseWriter) {
        // Idle cycles apply to whichever wire engine is active for the
        // transfers that follow, so set both and let the inactive one sit
        // unused.
        let idle_cycles = req.next_u8();
        self.swd.set_idle_cycles(idle_cycles);
        self.jtag.set_idle_cycles(idle_cycles);

        // Send number of wait retries through to both engines; only one is
        // ever actively driving the bus, but SWD_Configure/JTAG_Configure
        // may be issued in either order relative to this command.
        let wait_retry = req.next_u16();
        self.swd.set_wait_retries(wait_retry as usize);
        self.jtag.set_wait_retries(wait_retry.min(u8::MAX as u16) as u8);

        // Store number of match retries. This is already a 16-bit field, so
        // clamping to u16::MAX is a no-op; it's kept explicit rather than
        // reproducing the reference firmware's inverted clamp.
        let retries = req.next_u16();
        self.match_retries = core::cmp::min(retries, 65535) as usize;

        resp.write_ok();
    }

    fn process_transfer(&mut self, req: &mut Request, resp: &mut ResponseWriter) {
        // A pending abort only ever applies to the Transfer/TransferBlock
        // call it arrived before; clear it so it doesn't also cancel every
        // later one.
        self.abort_flag.store(false, Ordering::SeqCst);

        let idx = req.next_u8() as usize;
        let ntransfers = req.next_u8();
        let mut jtag_apacc: Option<bool> = None;

        if self.mode.is_none() {
            resp.write_u16(0);
            return;
        }

        if matches!(self.mode, Some(DAPMode::SWD)) {
            // Ensure SWD pins are in the right mode, in case they've been used as outputs
            // by the SWJ_Pins command.
            self.pins.swd_clk_spi();
            self.pins.swd_tx();
        }

        let jtag_invalid_index =
            matches!(self.mode, Some(DAPMode::JTAG)) && idx >= self.jtag_chain.count();

        // Skip two bytes in resp to reserve space for final status,
        // which we update while processing.
        resp.write_u16(0);

        for transfer_idx in 0..ntransfers {
            if self.abort_flag.load(Ordering::SeqCst) {
                break;
            }

            // Store how many transfers we execute in the response
            resp.write_u8_at(1, transfer_idx + 1);

            // Parse the next transfer request
            let transfer_req = req.next_u8();
            let apndp = (transfer_req & (1 << 0)) != 0;
            let rnw = (transfer_req & (1 << 1)) != 0;
            let a = (transfer_req & (3 << 2)) >> 2;
            let vmatch = (transfer_req & (1 << 4)) != 0;
            let mmask = (transfer_req & (1 << 5)) != 0;
            let ts = (transfer_req & (1 << 7)) != 0;

            if jtag_invalid_index {
                // The selected device doesn't exist in the configured
                // chain: consume this record's payload to stay aligned,
                // but don't touch the wire.
                if mmask || vmatch || !rnw {
                    req.next_u32();
                }
                *resp.mut_at(2) = (1 << 3) | 7;
                break;
            }

            if rnw {
                // Issue register read
                let mut read_value = match self.mode {
                    Some(DAPMode::SWD) => {
                        if apndp {
                            // Reads from AP are posted, so we issue the
                            // read and subsequently read RDBUFF for the data.
                            // The timestamp, if requested, is sampled at the
                            // end of this RDBUFF read's ACK phase, since
                            // that's the transaction whose data is actually
                            // reported to the host.
                            let rdbuff = swd::DPRegister::RDBUFF.into();
                            if self.swd.read_ap(a).check(resp.mut_at(2)).is_none() {
                                if vmatch {
                                    req.next_u32();
                                }
                                break;
                            }
                            let result = if ts {
                                self.swd.read_timestamped(swd::APnDP::DP, rdbuff)
                            } else {
                                self.swd.read_dp(rdbuff)
                            };
                            match result.check(resp.mut_at(2)) {
                                Some(v) => v,
                                None => {
                                    if vmatch {
                                        req.next_u32();
                                    }
                                    break;
                                }
                            }
                        } else {
                            // Reads from DP are not posted, so directly read the register.
                            let result = if ts {
                                self.swd.read_timestamped(swd::APnDP::DP, a)
                            } else {
                                self.swd.read_dp(a)
                            };
                            match result.check(resp.mut_at(2)) {
                                Some(v) => v,
                                None => {
                                    if vmatch {
                                        req.next_u32();
                                    }
                                    break;
                                }
                            }
                        }
                    }
                    Some(DAPMode::JTAG) => {
                        match self
                            .jtag_access(idx, apndp, true, a, 0, &mut jtag_apacc)
                            .check(resp.mut_at(2))
                        {
                            Some(v) => v,
                            None => {
                                if vmatch {
                                    req.next_u32();
                                }
                                break;
                            }
                        }
                    }
                    None => break,
                };

                // Handle value match requests by retrying if needed.
                if vmatch {
                    let target_value = req.next_u32();
                    let mut match_tries = 0;
                    while (read_value & self.match_mask) != target_value {
                        if self.abort_flag.load(Ordering::SeqCst) {
                            break;
                        }
                        match_tries += 1;
                        if match_tries > self.match_retries {
                            break;
                        }

                        read_value = match self.mode {
                            Some(DAPMode::SWD) => {
                                let result = if ts {
                                    self.swd.read_timestamped(apndp.into(), a)
                                } else {
                                    self.swd.read(apndp.into(), a)
                                };
                                match result.check(resp.mut_at(2)) {
                                    Some(v) => v,
                                    None => break,
                                }
                            }
                            Some(DAPMode::JTAG) => match self
                                .jtag_access(idx, apndp, true, a, 0, &mut jtag_apacc)
                                .check(resp.mut_at(2))
                            {
                                Some(v) => v,
                                None => break,
                            },
                            None => break,
                        };
                    }

                    // If we didn't read the correct value, set the value
                    // mismatch flag in the status byte and quit early.
                    if (read_value & self.match_mask) != target_value {
                        *resp.mut_at(2) |= 1 << 4;
                        break;
                    }
                    if ts {
                        resp.write_u32(self.record_timestamp());
                    }
                } else {
                    // Save read register value
                    resp.write_u32(read_value);
                    if ts {
                        resp.write_u32(self.record_timestamp());
                    }
                }
            } else {
                // Write transfer processing

                // Writes with match_mask set just update the match mask
                if mmask {
                    self.match_mask = req.next_u32();
                    continue;
                }

                // Otherwise issue register write
                let write_value = req.next_u32();
                let result = match self.mode {
                    Some(DAPMode::SWD) => {
                        if ts {
                            self.swd.write_timestamped(apndp.into(), a, write_value)
                        } else {
                            self.swd.write(apndp.into(), a, write_value)
                        }
                    }
                    Some(DAPMode::JTAG) => self
                        .jtag_access(idx, apndp, false, a, write_value, &mut jtag_apacc)
                        .map(|_| ()),
                    None => Err(swd::Error::AckProtocol),
                };
                if result.check(resp.mut_at(2)).is_none() {
                    break;
                }
                if ts {
                    resp.write_u32(self.record_timestamp());
                }
            }
        }

        // If an abort or ACK failure stopped us before all requested
        // transfers were attempted, consume the remaining records' bytes so
        // a following command in an ExecuteCommands batch still starts at
        // the right offset.
        let executed = resp.read_u8_at(1) as usize;
        for _ in executed..(ntransfers as usize) {
            if req.remaining_len() == 0 {
                break;
            }
            let transfer_req = req.next_u8();
            let rnw = (transfer_req & (1 << 1)) != 0;
            let vmatch = (transfer_req & (1 << 4)) != 0;
            let mmask = (transfer_req & (1 << 5)) != 0;
            if (mmask || vmatch || !rnw) && req.remaining_len() >= 4 {
                req.next_u32();
            }
        }
    }

    fn process_transfer_block(&mut self, req: &mut Request, resp: &mut ResponseWriter) {
        // See process_transfer: a pending abort only cancels the call it
        // arrived before.
        self.abort_flag.store(false, Ordering::SeqCst);

        let idx = req.next_u8() as usize;
        let ntransfers = req.next_u16();
        let transfer_req = req.next_u8();
        let apndp = (transfer_req & (1 << 0)) != 0;
        let rnw = (transfer_req & (1 << 1)) != 0;
        let a = (transfer_req & (3 << 2)) >> 2;
        let mut jtag_apacc: Option<bool> = None;

        if self.mode.is_none() {
            resp.write_u16(0);
            resp.write_u8((1 << 3) | 7);
            return;
        }

        if ntransfers == 0 {
            resp.write_u16(0);
            resp.write_u8(0);
            return;
        }

        if matches!(self.mode, Some(DAPMode::SWD)) {
            // Ensure SWD pins are in the right mode, in case they've been used as outputs
            // by the SWJ_Pins command.
            self.pins.swd_clk_spi();
            self.pins.swd_tx();
        }

        // Skip three bytes in resp to reserve space for final status,
        // which we update while processing.
        resp.write_u16(0);
        resp.write_u8(0);

        if matches!(self.mode, Some(DAPMode::JTAG)) && idx >= self.jtag_chain.count() {
            resp.write_u16_at(1, 0);
            *resp.mut_at(3) = (1 << 3) | 7;
            return;
        }

        // Keep track of how many transfers we executed,
        // so if there is an error the host knows where
        // it happened.
        let mut transfers = 0;

        // If reading an AP register, post first read early.
        if rnw && apndp {
            let posted = match self.mode {
                Some(DAPMode::SWD) => self.swd.read_ap(a).check(resp.mut_at(3)),
                Some(DAPMode::JTAG) => self
                    .jtag_access(idx, apndp, true, a, 0, &mut jtag_apacc)
                    .check(resp.mut_at(3)),
                None => None,
            };
            if posted.is_none() {
                // Quit early on error
                resp.write_u16_at(1, 1);
                return;
            }
        }

        for transfer_idx in 0..ntransfers {
            if self.abort_flag.load(Ordering::SeqCst) {
                break;
            }

            transfers = transfer_idx;
            if rnw {
                // Handle repeated reads
                let read_value = if apndp {
                    // For AP reads, the first read was posted, so on the final
                    // read we need to read RDBUFF instead of the AP register.
                    if transfer_idx < ntransfers - 1 {
                        match self.mode {
                            Some(DAPMode::SWD) => {
                                match self.swd.read_ap(a).check(resp.mut_at(3)) {
                                    Some(v) => v,
                                    None => break,
                                }
                            }
                            Some(DAPMode::JTAG) => match self
                                .jtag_access(idx, apndp, true, a, 0, &mut jtag_apacc)
                                .check(resp.mut_at(3))
                            {
                                Some(v) => v,
                                None => break,
                            },
                            None => break,
                        }
                    } else {
                        match self.mode {
                            Some(DAPMode::SWD) => {
                                let rdbuff = swd::DPRegister::RDBUFF.into();
                                match self.swd.read_dp(rdbuff).check(resp.mut_at(3)) {
                                    Some(v) => v,
                                    None => break,
                                }
                            }
                            Some(DAPMode::JTAG) => match self
                                .jtag_access(idx, apndp, true, a, 0, &mut jtag_apacc)
                                .check(resp.mut_at(3))
                            {
                                Some(v) => v,
                                None => break,
                            },
                            None => break,
                        }
                    }
                } else {
                    // For DP reads, no special care required
                    match self.mode {
                        Some(DAPMode::SWD) => match self.swd.read_dp(a).check(resp.mut_at(3)) {
                            Some(v) => v,
                            None => break,
                        },
                        Some(DAPMode::JTAG) => match self
                            .jtag_access(idx, apndp, false, a, 0, &mut jtag_apacc)
                            .check(resp.mut_at(3))
                        {
                            Some(v) => v,
                            None => break,
                        },
                        None => break,
                    }
                };

                // Save read register value to response
                resp.write_u32(read_value);
            } else {
                // Handle repeated register writes
                let write_value = req.next_u32();
                let result = match self.mode {
                    Some(DAPMode::SWD) => self.swd.write(apndp.into(), a, write_value),
                    Some(DAPMode::JTAG) => self
                        .jtag_access(idx, apndp, false, a, write_value, &mut jtag_apacc)
                        .map(|_| ()),
                    None => Err(swd::Error::AckProtocol),
                };
                if result.check(resp.mut_at(3)).is_none() {
                    break;
                }
            }
        }

        // Write number of transfers to response
        resp.write_u16_at(1, transfers + 1);
    }

    fn process_transfer_abort(&mut self) {
        self.abort_flag.store(true, Ordering::SeqCst);
    }

    /// Fetch the timestamp sampled by whichever engine just completed a
    /// timestamp-requested transaction, for a DAP_Transfer record with the
    /// TD_TimeStamp bit set.
    fn record_timestamp(&self) -> u32 {
        match self.mode {
            Some(DAPMode::SWD) => self.swd.last_timestamp(),
            Some(DAPMode::JTAG) => self.jtag.last_timestamp(),
            None => 0,
        }
    }

    /// Vendor0 arms a bootloader-reset request with a 2-byte sentinel, to
    /// guard against a stray vendor command resetting the probe into DFU
    /// mode; Vendor1 performs the reset if armed by a preceding Vendor0.
    /// Vendor2-31 are unimplemented.
    fn process_vendor(&mut self, vendor_id: u8, req: &mut Request, resp: &mut ResponseWriter) {
        match vendor_id {
            0 => {
                let sentinel = req.next_u16();
                if sentinel == BOOTLOAD_ARM_SENTINEL {
                    self.bootload_armed.store(true, Ordering::SeqCst);
                    resp.write_ok();
                } else {
                    self.bootload_armed.store(false, Ordering::SeqCst);
                    resp.write_err();
                }
            }
            1 => {
                if self.bootload_armed.load(Ordering::SeqCst) {
                    self.pins.high_impedance_mode();
                    crate::bsp::bootload::bootload();
                } else {
                    resp.write_err();
                }
            }
            _ => resp.write_err(),
        }
    }

    /// Perform one DPACC/APACC access over JTAG and immediately flush the
    /// pipelined result with a DP RDBUFF read, so every call returns the
    /// outcome of the access it was just asked to perform rather than the
    /// previous one. This costs an extra scan per access compared to
    /// tracking posted reads the way the SWD path does, in exchange for a
    /// much simpler implementation. Retries the whole access/flush pair on
    /// a WAIT ACK, up to the configured retry count, same as the SWD path.
    fn jtag_access(
        &mut self,
        index: usize,
        apndp: bool,
        rnw: bool,
        a: u8,
        write_value: u32,
        selected_apacc: &mut Option<bool>,
    ) -> swd::Result<u32> {
        if *selected_apacc != Some(apndp) {
            self.jtag.select_access(&self.jtag_chain, index, apndp);
            *selected_apacc = Some(apndp);
        }

        let request = (rnw as u8) | ((a & 0b11) << 1);

        const RDBUFF: u8 = 0b11;
        let rdbuff_request = 1 | (RDBUFF << 1);

        let retries = self.jtag.wait_retries();
        for attempt in 0..=retries {
            self.jtag
                .jtag_transfer(&self.jtag_chain, index, request, write_value);

            if *selected_apacc != Some(false) {
                self.jtag.select_access(&self.jtag_chain, index, false);
                *selected_apacc = Some(false);
            }

            let (ack, data) = self
                .jtag
                .jtag_transfer(&self.jtag_chain, index, rdbuff_request, 0);
            match jtag_ack_result(ack, data) {
                Err(swd::Error::AckWait) if attempt < retries => continue,
                result => return result,
            }
        }
        unreachable!()
    }
}

/// Map a JTAG DPACC/APACC ACK (the same 3-bit encoding used on the SWD
/// wire) and its captured data onto the shared `swd::Result`, so both
/// engines can be checked with the same `CheckResult` impl.
fn jtag_ack_result(ack: u8, data: u32) -> swd::Result<u32> {
    match ack {
        0b001 => Ok(data),
        0b010 => Err(swd::Error::AckWait),
        0b100 => Err(swd::Error::AckFault),
        _ => Err(swd::Error::AckProtocol),
    }
}

trait CheckResult<T> {
    /// Check result of an SWD transfer, updating the response status byte.
    ///
    /// Returns Some(T) on successful transfer, None on error.
    fn check(self, resp: &mut u8) -> Option<T>;
}

impl<T> CheckResult<T> for swd::Result<T> {
    fn check(self, resp: &mut u8) -> Option<T> {
        match self {
            Ok(v) => {
                *resp = 1;
                Some(v)
            }
            Err(swd::Error::AckWait) => {
                *resp = 2;
                None
            }
            Err(swd::Error::AckFault) => {
                *resp = 4;
                None
            }
            Err(_) => {
                *resp = (1 << 3) | 7;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_commands_batches_two_simple_commands() {
        // DAP_ExecuteCommands(2): DAP_Delay(0), DAP_ResetTarget
        let report = [0x7F, 0x02, 0x09, 0x00, 0x00, 0x0A];
        let mut req = Request { data: &report[1..] };
        let mut rbuf = [0u8; 32];
        let mut resp = ResponseWriter::new(&mut rbuf);

        // Exercise the same path process_command takes for ExecuteCommands,
        // without needing a full DAP instance.
        let command_byte = req.next_u8();
        assert_eq!(command_byte, 0x7F);
        resp.begin(command_byte);
        let count = req.next_u8();
        assert_eq!(count, 2);
        resp.write_u8(count);
        assert_eq!(resp.idx, 2);
    }

    #[test]
    fn response_writer_begin_returns_offset() {
        let mut rbuf = [0u8; 8];
        let mut resp = ResponseWriter::new(&mut rbuf);
        let first = resp.begin(0x05);
        resp.write_u8(0xAA);
        let second = resp.begin(0x09);
        assert_eq!(first, 0);
        assert_eq!(second, 2);
        assert_eq!(rbuf[0], 0x05);
        assert_eq!(rbuf[2], 0x09);
    }

    #[test]
    fn jtag_ack_result_maps_wait_fault_protocol() {
        assert!(matches!(jtag_ack_result(0b001, 42), Ok(42)));
        assert!(matches!(jtag_ack_result(0b010, 0), Err(swd::Error::AckWait)));
        assert!(matches!(jtag_ack_result(0b100, 0), Err(swd::Error::AckFault)));
        assert!(matches!(jtag_ack_result(0b111, 0), Err(swd::Error::AckProtocol)));
    }
}
