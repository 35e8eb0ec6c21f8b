// Copyright 2019-2020 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

use crate::bsp::{delay::Delay, gpio::Pins, spi::SPI};
use core::sync::atomic::{AtomicU32, AtomicU8, AtomicBool, Ordering};
use num_enum::IntoPrimitive;

#[derive(Copy, Clone, Debug)]
pub enum Error {
    BadParity,
    AckWait,
    AckFault,
    AckProtocol,
    AckUnknown(u8),
}

pub type Result<T> = core::result::Result<T, Error>;

#[repr(u8)]
#[derive(Copy, Clone, Debug, IntoPrimitive)]
pub enum DPRegister {
    DPIDR = 0,
    CTRLSTAT = 1,
    SELECT = 2,
    RDBUFF = 3,
}

pub struct SWD<'a> {
    spi: &'a SPI,
    pins: &'a Pins<'a>,
    delay: &'a Delay,

    wait_retries: usize,

    /// Number of turnaround clock cycles, 1-4. CMSIS-DAP encodes 0 in the
    /// configuration byte to mean 1 cycle, so this stores the real count.
    turnaround: AtomicU8,

    /// When set, every RDATA phase runs the full 33-cycle dummy drive
    /// even after a FAULT/WAIT/PROTOCOL response, instead of the usual
    /// shortcut of idling low straight away.
    data_phase_always: AtomicBool,

    /// SysTick-derived tick value captured at the start of the most recent
    /// transaction whose request byte had the timestamp request bit set.
    last_timestamp: AtomicU32,

    /// Number of extra idle-low clock cycles driven after a successful
    /// transaction, as requested via DAP_TransferConfigure.
    idle_cycles: AtomicU8,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug)]
pub enum APnDP {
    DP = 0,
    AP = 1,
}

impl From<bool> for APnDP {
    fn from(x: bool) -> APnDP {
        if x {
            APnDP::AP
        } else {
            APnDP::DP
        }
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug)]
enum RnW {
    W = 0,
    R = 1,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug)]
enum ACK {
    OK = 0b001,
    WAIT = 0b010,
    FAULT = 0b100,
    PROTOCOL = 0b111,
}

impl ACK {
    pub fn try_ok(ack: u8) -> Result<()> {
        match ack {
            v if v == (ACK::OK as u8) => Ok(()),
            v if v == (ACK::WAIT as u8) => Err(Error::AckWait),
            v if v == (ACK::FAULT as u8) => Err(Error::AckFault),
            v if v == (ACK::PROTOCOL as u8) => Err(Error::AckProtocol),
            _ => Err(Error::AckUnknown(ack)),
        }
    }
}

impl<'a> SWD<'a> {
    pub fn new(spi: &'a SPI, pins: &'a Pins, delay: &'a Delay) -> Self {
        SWD {
            spi,
            pins,
            delay,
            wait_retries: 8,
            turnaround: AtomicU8::new(1),
            data_phase_always: AtomicBool::new(false),
            last_timestamp: AtomicU32::new(0),
            idle_cycles: AtomicU8::new(0),
        }
    }

    /// Attempt to configure the SPI clock rate to `max_frequency`, falling
    /// back to the slowest available prescaler and returning whether the
    /// request could be honoured at all.
    pub fn set_clock(&self, max_frequency: u32) -> bool {
        match self.spi.calculate_prescaler(max_frequency) {
            Some(prescaler) => {
                self.spi.set_prescaler(prescaler);
                true
            }
            None => false,
        }
    }

    pub fn spi_enable(&self) {
        self.spi.setup_swd();
    }

    pub fn spi_disable(&self) {
        self.spi.disable();
    }

    pub fn set_wait_retries(&mut self, wait_retries: usize) {
        self.wait_retries = wait_retries;
    }

    /// Configure the turnaround period, as requested via DAP_SWD_Configure.
    /// `clk_period` is the raw 2-bit field: 0 means 1 cycle, up to 3 meaning
    /// 4 cycles.
    pub fn set_turnaround(&self, clk_period: u8) {
        self.turnaround.store((clk_period & 0b11) + 1, Ordering::SeqCst);
    }

    /// Configure whether the data phase is always generated, even after a
    /// non-OK acknowledgement.
    pub fn set_data_phase_always(&self, always: bool) {
        self.data_phase_always.store(always, Ordering::SeqCst);
    }

    /// Configure the number of extra idle-low cycles driven after each
    /// successful transaction, as requested via DAP_TransferConfigure.
    pub fn set_idle_cycles(&self, cycles: u8) {
        self.idle_cycles.store(cycles, Ordering::SeqCst);
    }

    fn drive_idle_cycles(&self) {
        for _ in 0..self.idle_cycles.load(Ordering::SeqCst) {
            self.idle_low();
        }
    }

    /// Timer value captured for the most recent timestamp-requested transfer.
    pub fn last_timestamp(&self) -> u32 {
        self.last_timestamp.load(Ordering::SeqCst)
    }

    /// Tick rate of the timestamp counter, in Hz, for DAP_Info's
    /// TestDomainTimer record.
    pub fn timer_frequency(&self) -> u32 {
        self.delay.frequency()
    }

    fn turnaround_cycles(&self) -> u8 {
        self.turnaround.load(Ordering::SeqCst)
    }

    fn line_reset(&self) {
        for _ in 0..7 {
            self.spi.tx8(0xFF);
        }
    }

    fn jtag_to_swd(&self) {
        self.spi.tx16(0xE79E);
    }

    /// Send an arbitrary bit sequence, used for DAP_SWJ_Sequence.
    pub fn tx_sequence(&self, sequence: &[u8], bits: usize) {
        self.pins.swd_tx();
        let nbytes = (bits + 7) / 8;
        for byte in &sequence[..nbytes] {
            self.spi.tx8(*byte);
        }
        self.spi.wait_busy();
    }

    /// Clock in `bits` bits (rounded up to whole bytes) while releasing
    /// SWDIO, used for the input sequences of DAP_SWD_Sequence.
    pub fn rx_sequence(&self, buf: &mut [u8], bits: usize) {
        self.pins.swd_rx();
        let nbytes = (bits + 7) / 8;
        for byte in buf[..nbytes].iter_mut() {
            *byte = self.spi.rx8();
        }
        self.spi.wait_busy();
        self.pins.swd_tx();
    }

    pub fn idle_high(&self) {
        self.spi.tx4(0xF);
    }

    pub fn idle_low(&self) {
        self.spi.tx4(0x0);
    }

    pub fn start(&self) {
        self.pins.swd_tx();
        self.line_reset();
        self.jtag_to_swd();
        self.line_reset();
        self.spi.tx8(0x00);
        self.spi.wait_busy();
    }

    pub fn read_dp(&self, a: u8) -> Result<u32> {
        self.read(APnDP::DP, a)
    }

    pub fn write_dp(&self, a: u8, data: u32) -> Result<()> {
        self.write(APnDP::DP, a, data)
    }

    pub fn read_ap(&self, a: u8) -> Result<u32> {
        self.read(APnDP::AP, a)
    }

    pub fn write_ap(&self, a: u8, data: u32) -> Result<()> {
        self.write(APnDP::AP, a, data)
    }

    pub fn read(&self, apndp: APnDP, a: u8) -> Result<u32> {
        for _ in 0..self.wait_retries {
            match self.read_inner(apndp, a, false) {
                Err(Error::AckWait) => continue,
                x => return x,
            }
        }
        Err(Error::AckWait)
    }

    pub fn write(&self, apndp: APnDP, a: u8, data: u32) -> Result<()> {
        for _ in 0..self.wait_retries {
            match self.write_inner(apndp, a, data, false) {
                Err(Error::AckWait) => continue,
                x => return x,
            }
        }
        Err(Error::AckWait)
    }

    /// As `read()`, but also records a timestamp sample at the start of the
    /// wire transaction, per the DAP_Transfer TD_TimeStamp request bit.
    pub fn read_timestamped(&self, apndp: APnDP, a: u8) -> Result<u32> {
        for _ in 0..self.wait_retries {
            match self.read_inner(apndp, a, true) {
                Err(Error::AckWait) => continue,
                x => return x,
            }
        }
        Err(Error::AckWait)
    }

    /// As `write()`, but also records a timestamp sample, see `read_timestamped`.
    pub fn write_timestamped(&self, apndp: APnDP, a: u8, data: u32) -> Result<()> {
        for _ in 0..self.wait_retries {
            match self.write_inner(apndp, a, data, true) {
                Err(Error::AckWait) => continue,
                x => return x,
            }
        }
        Err(Error::AckWait)
    }

    fn turnaround_clocks(&self, nclocks: u8) {
        for _ in 0..nclocks {
            self.spi.tx4(0x0);
        }
    }

    fn read_inner(&self, apndp: APnDP, a: u8, timestamp: bool) -> Result<u32> {
        let req = Self::make_request(apndp, RnW::R, a);

        if timestamp {
            self.last_timestamp.store(self.delay.get_current(), Ordering::SeqCst);
        }

        self.spi.tx8(req);
        self.spi.wait_busy();
        self.spi.drain();
        self.pins.swd_rx();

        let turnaround = self.turnaround_cycles();
        if turnaround > 1 {
            self.turnaround_clocks(turnaround - 1);
        }

        // 1 clock for turnaround and 3 for ACK
        let ack = self.spi.rx4() >> 1;
        match ACK::try_ok(ack as u8) {
            Ok(_) => (),
            Err(e) => {
                // On non-OK ACK, target has released the bus but
                // is still expecting a turnaround clock before
                // the next request, and we need to take over the bus.
                self.pins.swd_tx();
                if self.data_phase_always.load(Ordering::SeqCst) {
                    // Clock out a full dummy data phase (32 data bits, 1
                    // parity bit) so the wire stays in lockstep even when
                    // the host asked for it unconditionally.
                    self.spi.swd_wdata_phase(0, 0);
                    self.spi.wait_busy();
                } else {
                    self.idle_low();
                }
                return Err(e);
            }
        }

        // Read 8x4=32 bits of data and 8x1=8 bits for parity+turnaround+trailing.
        // Doing a batch of 5 8-bit reads is the quickest option as we keep the FIFO hot.
        let (data, parity) = self.spi.swd_rdata_phase(self.pins);
        let parity = (parity & 1) as u32;

        // Back to driving SWDIO to ensure it doesn't float high
        self.pins.swd_tx();

        self.drive_idle_cycles();

        if parity == (data.count_ones() & 1) {
            Ok(data)
        } else {
            Err(Error::BadParity)
        }
    }

    fn write_inner(&self, apndp: APnDP, a: u8, data: u32, timestamp: bool) -> Result<()> {
        let req = Self::make_request(apndp, RnW::W, a);
        let parity = data.count_ones() & 1;

        if timestamp {
            self.last_timestamp.store(self.delay.get_current(), Ordering::SeqCst);
        }

        self.spi.tx8(req);
        self.spi.wait_busy();
        self.spi.drain();
        self.pins.swd_rx();

        let turnaround = self.turnaround_cycles();
        if turnaround > 1 {
            self.turnaround_clocks(turnaround - 1);
        }

        // 1 clock for turnaround and 3 for ACK and 1 for turnaround
        let ack = (self.spi.rx5() >> 1) & 0b111;
        self.pins.swd_tx();
        match ACK::try_ok(ack as u8) {
            Ok(_) => (),
            Err(e) => {
                if self.data_phase_always.load(Ordering::SeqCst) {
                    self.spi.swd_wdata_phase(0, 0);
                    self.spi.wait_busy();
                }
                return Err(e);
            }
        }

        // Write 8x4=32 bits of data and 8x1=8 bits for parity+trailing idle.
        // This way we keep the FIFO full and eliminate delays between words,
        // even at the cost of more trailing bits. We can't change DS to 4 bits
        // until the FIFO is empty, and waiting for that costs more time overall.
        // Additionally, many debug ports require a couple of clock cycles after
        // the parity bit of a write transaction to make the write effective.
        self.spi.swd_wdata_phase(data, parity as u8);
        self.spi.wait_busy();

        self.drive_idle_cycles();

        Ok(())
    }

    fn make_request(apndp: APnDP, rnw: RnW, a: u8) -> u8 {
        let req = 1 | ((apndp as u8) << 1) | ((rnw as u8) << 2) | (a << 3) | (1 << 7);
        let parity = (req.count_ones() & 1) as u8;
        req | (parity << 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_byte_has_odd_parity_over_apndp_rnw_a() {
        let req = SWD::make_request(APnDP::AP, RnW::R, 0b01);
        // Start bit, stop bit and park bit are fixed; count parity over
        // APnDP/RnW/A[3:2].
        let parity_bits = (req >> 1) & 0b1111;
        let parity_bit = (req >> 5) & 1;
        assert_eq!(parity_bits.count_ones() & 1, parity_bit as u32);
    }

    #[test]
    fn ack_decode_matches_table() {
        assert!(matches!(ACK::try_ok(0b001), Ok(())));
        assert!(matches!(ACK::try_ok(0b010), Err(Error::AckWait)));
        assert!(matches!(ACK::try_ok(0b100), Err(Error::AckFault)));
        assert!(matches!(ACK::try_ok(0b111), Err(Error::AckProtocol)));
        assert!(matches!(ACK::try_ok(0b011), Err(Error::AckUnknown(0b011))));
    }
}
