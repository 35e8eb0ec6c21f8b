// Copyright 2020 Adam Greig
// Dual licensed under the Apache 2.0 and MIT licenses.

use crate::bsp::delay::Delay;
use crate::bsp::dma::DMA;
use crate::bsp::gpio::{Pin, Pins};
use crate::bsp::spi::SPI;
use crate::DAP2_PACKET_SIZE;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

/// Maximum number of devices supported in a single JTAG scan chain.
pub const MAX_CHAIN_DEVICES: usize = 8;

/// Describes the IR length of every device in the scan chain and the
/// number of bypass bits that precede/follow the selected device's IR or
/// DR field, so that devices other than the one being addressed can be
/// left in BYPASS.
///
/// `ir_before[i]` and `ir_after[i]` are computed with a two-pass walk over
/// `ir_length`: first a forward running sum gives the number of IR bits
/// belonging to devices upstream of `i`, then a backward pass subtracts
/// from the running total to give the number of bits belonging to devices
/// downstream of `i`.
#[derive(Copy, Clone)]
pub struct JtagChain {
    count: usize,
    ir_length: [u8; MAX_CHAIN_DEVICES],
    ir_before: [u32; MAX_CHAIN_DEVICES],
    ir_after: [u32; MAX_CHAIN_DEVICES],
}

impl JtagChain {
    /// Default chain: a single device with a 4-bit IR, matching most
    /// Cortex-M SWJ-DP/JTAG-DP implementations.
    pub fn new() -> Self {
        let mut chain = JtagChain {
            count: 1,
            ir_length: [4; MAX_CHAIN_DEVICES],
            ir_before: [0; MAX_CHAIN_DEVICES],
            ir_after: [0; MAX_CHAIN_DEVICES],
        };
        chain.recompute();
        chain
    }

    /// Reconfigure the chain from a list of IR lengths, one per device,
    /// ordered from the device nearest TDI to the device nearest TDO.
    /// Returns false if the chain is empty or longer than supported.
    pub fn configure(&mut self, ir_lengths: &[u8]) -> bool {
        if ir_lengths.is_empty() || ir_lengths.len() > MAX_CHAIN_DEVICES {
            return false;
        }
        self.count = ir_lengths.len();
        self.ir_length = [0; MAX_CHAIN_DEVICES];
        self.ir_length[..self.count].copy_from_slice(ir_lengths);
        self.recompute();
        true
    }

    fn recompute(&mut self) {
        let mut sum = 0u32;
        for i in 0..self.count {
            self.ir_before[i] = sum;
            sum += self.ir_length[i] as u32;
        }
        let mut after = 0u32;
        for i in (0..self.count).rev() {
            self.ir_after[i] = after;
            after += self.ir_length[i] as u32;
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn ir_length(&self, index: usize) -> u8 {
        self.ir_length[index]
    }

    fn dr_before(&self, index: usize) -> u32 {
        index as u32
    }

    fn dr_after(&self, index: usize) -> u32 {
        (self.count - 1 - index) as u32
    }
}

impl Default for JtagChain {
    fn default() -> Self {
        Self::new()
    }
}

struct JTAGPins<'a> {
    tms: &'a Pin<'a>,
    tck: &'a Pin<'a>,
    tdo: &'a Pin<'a>,
    tdi: &'a Pin<'a>,
}

#[allow(clippy::upper_case_acronyms)]
pub struct JTAG<'a> {
    spi: &'a SPI,
    dma: &'a DMA,
    pins: JTAGPins<'a>,
    delay: &'a Delay,
    half_period_ticks: AtomicU32,
    use_bitbang: AtomicBool,

    /// SysTick-derived tick value captured at the end of the most recent
    /// `jtag_transfer` scan, mirroring `swd::SWD::last_timestamp` so
    /// DAP_Transfer's TD_TimeStamp bit is supported uniformly across ports.
    last_timestamp: AtomicU32,

    /// Number of extra Run-Test/Idle cycles run after a DR scan, as
    /// requested via DAP_TransferConfigure.
    idle_cycles: AtomicU8,

    /// Number of times a WAIT ACK on a DPACC/APACC access is retried
    /// before giving up, mirroring `swd::SWD`'s `wait_retries`.
    wait_retries: AtomicU8,
}

impl<'a> JTAG<'a> {
    /// Create a new JTAG object from the provided Pins struct.
    pub fn new(spi: &'a SPI, dma: &'a DMA, pins: &'a Pins, delay: &'a Delay) -> Self {
        let jtag_pins = JTAGPins {
            tms: &pins.spi1_mosi,
            tck: &pins.spi2_clk,
            tdo: &pins.spi2_miso,
            tdi: &pins.spi2_mosi,
        };

        JTAG {
            spi,
            dma,
            pins: jtag_pins,
            delay,
            half_period_ticks: AtomicU32::new(10000),
            use_bitbang: AtomicBool::new(true),
            last_timestamp: AtomicU32::new(0),
            idle_cycles: AtomicU8::new(0),
            wait_retries: AtomicU8::new(8),
        }
    }

    /// Timer value captured at the end of the most recent `jtag_transfer`
    /// scan, for DAP_Transfer records with the timestamp bit set.
    pub fn last_timestamp(&self) -> u32 {
        self.last_timestamp.load(Ordering::SeqCst)
    }

    /// Configure the number of extra Run-Test/Idle cycles run after each
    /// DR scan, as requested via DAP_TransferConfigure.
    pub fn set_idle_cycles(&self, cycles: u8) {
        self.idle_cycles.store(cycles, Ordering::SeqCst);
    }

    fn run_idle_cycles(&self) {
        for _ in 0..self.idle_cycles.load(Ordering::SeqCst) {
            self.shift_one(false, false);
        }
    }

    /// Configure the number of times a WAIT ACK is retried before giving up,
    /// as requested via DAP_TransferConfigure.
    pub fn set_wait_retries(&self, retries: u8) {
        self.wait_retries.store(retries, Ordering::SeqCst);
    }

    pub fn wait_retries(&self) -> u8 {
        self.wait_retries.load(Ordering::SeqCst)
    }

    pub fn set_clock(&self, max_frequency: u32) {
        let period = self.delay.calc_period_ticks(max_frequency);
        self.half_period_ticks.store(period / 2, Ordering::SeqCst);

        if let Some(prescaler) = self.spi.calculate_prescaler(max_frequency) {
            self.spi.set_prescaler(prescaler);
            self.use_bitbang.store(false, Ordering::SeqCst);
        } else {
            self.use_bitbang.store(true, Ordering::SeqCst);
        }
    }

    pub fn spi_enable(&self) {
        self.spi.setup_jtag();
    }

    pub fn spi_disable(&self) {
        self.spi.disable();
    }

    #[inline(never)]
    pub fn tms_sequence(&self, data: &[u8], mut bits: usize) {
        self.bitbang_mode();

        let half_period_ticks = self.half_period_ticks.load(Ordering::SeqCst);
        let mut last = self.delay.get_current();
        last = self.delay.delay_ticks_from_last(half_period_ticks, last);

        for byte in data {
            let mut byte = *byte;
            let frame_bits = core::cmp::min(bits, 8);
            for _ in 0..frame_bits {
                let bit = byte & 1;
                byte >>= 1;

                self.pins.tms.set_bool(bit != 0);
                self.pins.tck.set_low();
                last = self.delay.delay_ticks_from_last(half_period_ticks, last);
                self.pins.tck.set_high();
                last = self.delay.delay_ticks_from_last(half_period_ticks, last);
            }
            bits -= frame_bits;
        }
    }

    /// Handle a sequence request. The request data follows the CMSIS-DAP
    /// DAP_JTAG_Sequence command:
    /// * First byte contains the number of sequences, then
    /// * First byte of each sequence contains:
    ///     * Bits 5..0: Number of clock cycles, where 0 means 64 cycles
    ///     * Bit 6: TMS value
    ///     * Bit 7: TDO capture enable
    /// * Subsequent bytes of each sequence contain TDI data, one bit per
    ///   clock cycle, with the final byte padded. Data is transmitted from
    ///   successive bytes, least significant bit first.
    ///
    /// Captured TDO data is written least significant bit first to successive
    /// bytes of `rxbuf`, which must be long enough for the requested capture,
    /// or conservatively as long as `data`.
    /// The final byte of TDO data for each sequence is padded, in other words,
    /// as many TDO bytes will be returned as there were TDI bytes in sequences
    /// with capture enabled.
    ///
    /// Returns the number of bytes of rxbuf which were written to.
    pub fn sequences(&self, data: &[u8], rxbuf: &mut [u8]) -> usize {
        // Read request header containing number of sequences.
        if data.is_empty() {
            return 0;
        };
        let mut nseqs = data[0];
        let mut data = &data[1..];
        let mut rxidx = 0;

        // Sanity check
        if nseqs == 0 || data.is_empty() {
            return 0;
        }

        let half_period_ticks = self.half_period_ticks.load(Ordering::SeqCst);
        self.delay.delay_ticks(half_period_ticks);

        // Process alike sequences in one shot
        // This
        if !self.use_bitbang.load(Ordering::SeqCst) {
            let mut buffer = [0u8; DAP2_PACKET_SIZE as usize];
            let mut buffer_idx = 0;
            let transfer_type = data[0] & 0b1100_0000;
            while nseqs > 0 {
                // Read header byte for this sequence.
                if data.is_empty() {
                    break;
                };
                let header = data[0];
                if (header & 0b1100_0000) != transfer_type {
                    // This sequence can't be processed in the same way
                    break;
                }
                let nbits = header & 0b0011_1111;
                if nbits & 7 != 0 {
                    // We can handle only 8*N bit sequences here
                    break;
                }
                let nbits = if nbits == 0 { 64 } else { nbits as usize };
                let nbytes = Self::bytes_for_bits(nbits);

                if data.len() < (nbytes + 1) {
                    break;
                };
                data = &data[1..];

                buffer[buffer_idx..buffer_idx + nbytes].copy_from_slice(&data[..nbytes]);
                buffer_idx += nbytes;
                nseqs -= 1;
                data = &data[nbytes..];
            }
            if buffer_idx > 0 {
                let capture = transfer_type & 0b1000_0000;
                let tms = transfer_type & 0b0100_0000;

                // Set TMS for this transfer.
                self.pins.tms.set_bool(tms != 0);

                self.spi_mode();
                self.spi
                    .jtag_exchange(self.dma, &buffer[..buffer_idx], &mut rxbuf[rxidx..]);
                if capture != 0 {
                    rxidx += buffer_idx;
                }
                // Set TDI GPIO to the last bit the SPI peripheral transmitted,
                // to prevent it changing state when we set it to an output.
                self.pins.tdi.set_bool((buffer[buffer_idx - 1] >> 7) != 0);
                self.bitbang_mode();
                self.spi.disable();
            }
        }

        // Process each sequence.
        for _ in 0..nseqs {
            // Read header byte for this sequence.
            if data.is_empty() {
                break;
            };
            let header = data[0];
            data = &data[1..];
            let capture = header & 0b1000_0000;
            let tms = header & 0b0100_0000;
            let nbits = header & 0b0011_1111;
            let nbits = if nbits == 0 { 64 } else { nbits as usize };
            let nbytes = Self::bytes_for_bits(nbits);
            if data.len() < nbytes {
                break;
            };

            // Split data into TDI data for this sequence and data for remaining sequences.
            let tdi = &data[..nbytes];
            data = &data[nbytes..];

            // Set TMS for this transfer.
            self.pins.tms.set_bool(tms != 0);

            // Run one transfer, either read-write or write-only.
            if capture != 0 {
                self.transfer_rw(nbits, tdi, &mut rxbuf[rxidx..]);
                rxidx += nbytes;
            } else {
                self.transfer_wo(nbits, tdi);
            }
        }

        rxidx
    }

    /// Write-only JTAG transfer without capturing TDO.
    ///
    /// Writes `n` bits from successive bytes of `tdi`, LSbit first.
    #[inline(never)]
    fn transfer_wo(&self, n: usize, tdi: &[u8]) {
        let half_period_ticks = self.half_period_ticks.load(Ordering::SeqCst);
        let mut last = self.delay.get_current();

        for (byte_idx, byte) in tdi.iter().enumerate() {
            for bit_idx in 0..8 {
                // Stop after transmitting `n` bits.
                if byte_idx * 8 + bit_idx == n {
                    return;
                }

                // Set TDI and toggle TCK.
                self.pins.tdi.set_bool(byte & (1 << bit_idx) != 0);
                last = self.delay.delay_ticks_from_last(half_period_ticks, last);
                self.pins.tck.set_high();
                last = self.delay.delay_ticks_from_last(half_period_ticks, last);
                self.pins.tck.set_low();
            }
        }
    }

    /// Read-write JTAG transfer, with TDO capture.
    ///
    /// Writes `n` bits from successive bytes of `tdi`, LSbit first.
    /// Captures `n` bits from TDO and writes into successive bytes of `tdo`, LSbit first.
    #[inline(never)]
    fn transfer_rw(&self, n: usize, tdi: &[u8], tdo: &mut [u8]) {
        let half_period_ticks = self.half_period_ticks.load(Ordering::SeqCst);
        let mut last = self.delay.get_current();

        for (byte_idx, (tdi, tdo)) in tdi.iter().zip(tdo.iter_mut()).enumerate() {
            *tdo = 0;
            for bit_idx in 0..8 {
                // Stop after transmitting `n` bits.
                if byte_idx * 8 + bit_idx == n {
                    return;
                }

                // We set TDI half a period before the clock rising edge where it is sampled
                // by the target, and we sample TDO immediately before the clock falling edge
                // where it is updated by the target.
                self.pins.tdi.set_bool(tdi & (1 << bit_idx) != 0);
                last = self.delay.delay_ticks_from_last(half_period_ticks, last);
                self.pins.tck.set_high();
                last = self.delay.delay_ticks_from_last(half_period_ticks, last);
                if self.pins.tdo.is_high() {
                    *tdo |= 1 << bit_idx;
                }
                self.pins.tck.set_low();
            }
        }
    }

    /// Drive the TAP through Test-Logic-Reset and back to Run-Test/Idle.
    /// Five or more TCK cycles with TMS high guarantee entry to
    /// Test-Logic-Reset from any state.
    pub fn tap_reset(&self) {
        self.bitbang_mode();
        for _ in 0..6 {
            self.shift_one(false, true);
        }
        self.shift_one(false, false);
    }

    /// Scan `ir` into the instruction register of the device at `index` in
    /// `chain`, leaving all other devices' IR in BYPASS. Assumes and
    /// restores the Run-Test/Idle state.
    pub fn jtag_ir(&self, chain: &JtagChain, index: usize, ir: u32) {
        self.bitbang_mode();
        self.goto_shift_ir();

        let before = chain.ir_before[index];
        let len = chain.ir_length[index] as u32;
        let total = before + len + chain.ir_after[index];

        let mut bit = 0u32;
        while bit < total {
            let tdi = if bit < before {
                true
            } else if bit < before + len {
                (ir >> (bit - before)) & 1 != 0
            } else {
                true
            };
            let tms = bit + 1 == total;
            self.shift_one(tdi, tms);
            bit += 1;
        }

        self.update_to_idle();
    }

    /// Scan `data` into the data register of the device at `index` in
    /// `chain`, with devices before/after left in single-bit BYPASS, and
    /// return the 32 bits captured from that device's DR.
    pub fn jtag_dr(&self, chain: &JtagChain, index: usize, data: u32) -> u32 {
        self.bitbang_mode();
        self.goto_shift_dr();

        let before = chain.dr_before(index);
        let total = before + 32 + chain.dr_after(index);

        let mut captured = 0u32;
        let mut bit = 0u32;
        while bit < total {
            let tdi = if bit >= before && bit < before + 32 {
                (data >> (bit - before)) & 1 != 0
            } else {
                false
            };
            let tms = bit + 1 == total;
            let tdo = self.shift_one(tdi, tms);
            if bit >= before && bit < before + 32 {
                captured |= (tdo as u32) << (bit - before);
            }
            bit += 1;
        }

        self.update_to_idle();
        self.run_idle_cycles();
        captured
    }

    /// Read the IDCODE of the device at `index` by resetting the TAP (which
    /// loads IDCODE, or all-ones BYPASS, into DR) and scanning out 32 bits.
    pub fn jtag_idcode(&self, chain: &JtagChain, index: usize) -> u32 {
        self.tap_reset();
        self.jtag_dr(chain, index, 0)
    }

    /// Perform one DPACC/APACC scan: a 3-bit request header (RnW, A2, A3,
    /// LSB-first) followed by 32 bits of write data, with the device at
    /// `index` selected and all others left in BYPASS.
    ///
    /// Returns the 3-bit ACK and 32-bit data captured during this scan. Per
    /// the ADIv5 JTAG-DP protocol, both are the result of the *previous*
    /// scan on this access port, not the one just requested: callers must
    /// follow up with another scan (typically a DP RDBUFF read) to retrieve
    /// this request's result.
    pub fn jtag_transfer(&self, chain: &JtagChain, index: usize, request: u8, data: u32) -> (u8, u32) {
        self.bitbang_mode();
        self.goto_shift_dr();

        let before = chain.dr_before(index);
        let total = before + 35 + chain.dr_after(index);

        let mut ack = 0u8;
        let mut captured = 0u32;
        let mut bit = 0u32;
        while bit < total {
            let tdi = if bit >= before && bit < before + 3 {
                (request >> (bit - before)) & 1 != 0
            } else if bit >= before + 3 && bit < before + 35 {
                (data >> (bit - before - 3)) & 1 != 0
            } else {
                false
            };
            let tms = bit + 1 == total;
            let tdo = self.shift_one(tdi, tms);
            if bit >= before && bit < before + 3 {
                ack |= (tdo as u8) << (bit - before);
            } else if bit >= before + 3 && bit < before + 35 {
                captured |= (tdo as u32) << (bit - before - 3);
            }
            bit += 1;
        }

        self.update_to_idle();
        self.run_idle_cycles();
        self.last_timestamp.store(self.delay.get_current(), Ordering::SeqCst);

        // Scanned out LSB-first in the chip's wire order; swap bit0/bit1 to
        // get the DAP convention ACK value (OK/FAULT/WAIT) that jtag_ack_result
        // expects.
        let ack = (ack & 0b100) | ((ack & 0b010) >> 1) | ((ack & 0b001) << 1);

        (ack, captured)
    }

    /// Select the DPACC (IR = 0b1010) or APACC (IR = 0b1011) instruction for
    /// the device at `index`, matching the standard ADIv5 JTAG-DP opcodes.
    pub fn select_access(&self, chain: &JtagChain, index: usize, apacc: bool) {
        const DPACC: u32 = 0b1010;
        const APACC: u32 = 0b1011;
        self.jtag_ir(chain, index, if apacc { APACC } else { DPACC });
    }

    /// Shift a single TMS/TDI bit and sample TDO, toggling TCK once.
    /// TDI is set half a period before the rising edge where it is sampled
    /// by the target, and TDO is sampled immediately before the falling
    /// edge where it is updated by the target, matching `transfer_rw`.
    fn shift_one(&self, tdi: bool, tms: bool) -> bool {
        let half_period_ticks = self.half_period_ticks.load(Ordering::SeqCst);
        let mut last = self.delay.get_current();

        self.pins.tdi.set_bool(tdi);
        self.pins.tms.set_bool(tms);
        last = self.delay.delay_ticks_from_last(half_period_ticks, last);
        self.pins.tck.set_high();
        let _ = self.delay.delay_ticks_from_last(half_period_ticks, last);
        let tdo = self.pins.tdo.is_high();
        self.pins.tck.set_low();
        tdo
    }

    fn tms_walk(&self, bits: &[bool]) {
        for &tms in bits {
            self.shift_one(false, tms);
        }
    }

    /// Run-Test/Idle -> Select-DR -> Select-IR -> Capture-IR -> Shift-IR
    fn goto_shift_ir(&self) {
        self.tms_walk(&[true, true, false, false]);
    }

    /// Run-Test/Idle -> Select-DR -> Capture-DR -> Shift-DR
    fn goto_shift_dr(&self) {
        self.tms_walk(&[true, false, false]);
    }

    /// Exit1-IR/DR -> Update-IR/DR -> Run-Test/Idle
    fn update_to_idle(&self) {
        self.tms_walk(&[true, false]);
    }

    /// Compute required number of bytes to store a number of bits.
    fn bytes_for_bits(bits: usize) -> usize {
        (bits + 7) / 8
    }

    fn bitbang_mode(&self) {
        self.pins.tdo.set_mode_input();
        self.pins.tdi.set_mode_output();
        self.pins.tck.set_low().set_mode_output();
    }

    fn spi_mode(&self) {
        self.pins.tdo.set_mode_alternate();
        self.pins.tdi.set_mode_alternate();
        self.pins.tck.set_mode_alternate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_device_chain_has_no_bypass_bits() {
        let chain = JtagChain::new();
        assert_eq!(chain.count(), 1);
        assert_eq!(chain.ir_before[0], 0);
        assert_eq!(chain.ir_after[0], 0);
    }

    #[test]
    fn three_device_chain_ir_before_after() {
        let mut chain = JtagChain::new();
        assert!(chain.configure(&[4, 5, 4]));
        // Device 0 (nearest TDI) has nothing before it, and devices 1+2 after.
        assert_eq!(chain.ir_before[0], 0);
        assert_eq!(chain.ir_after[0], 9);
        // Device 1 has device 0's IR before it, device 2's IR after it.
        assert_eq!(chain.ir_before[1], 4);
        assert_eq!(chain.ir_after[1], 4);
        // Device 2 (nearest TDO) has everything before it, nothing after.
        assert_eq!(chain.ir_before[2], 9);
        assert_eq!(chain.ir_after[2], 0);
    }

    #[test]
    fn dr_bypass_is_one_bit_per_other_device() {
        let mut chain = JtagChain::new();
        chain.configure(&[4, 4, 4, 4]);
        assert_eq!(chain.dr_before(2), 2);
        assert_eq!(chain.dr_after(2), 1);
    }

    #[test]
    fn configure_rejects_oversized_chain() {
        let mut chain = JtagChain::new();
        let too_many = [4u8; MAX_CHAIN_DEVICES + 1];
        assert!(!chain.configure(&too_many));
        // Original single-device configuration is left untouched.
        assert_eq!(chain.count(), 1);
    }
}
