//! RC522 contactless reader protocol driver
//!
//! Drives the reader chip's command/response protocol over a byte-oriented
//! register bus to detect a card, resolve its UID and release it.
//!
//! Protocol:
//! - Register frame: one address byte `(reg << 1) & 0x7E` (bit7 set for
//!   reads), then one value byte
//! - Request: 16-bit ATQA expected, any other length is a protocol error
//! - Anticollision: 5 bytes back, byte[4] must equal XOR of bytes[0..4]
//! - Select: `[0x93, 0x70, uid[0..5]]` + CRC_A, exactly 0x18 response bits
//! - Timeouts are bounded register-poll budgets, never wall-clock waits
//!
//! Every public operation reports failure through [`ProtocolError`]; callers
//! treat any error as "no card this cycle" and retry on the next loop
//! iteration. Nothing here is fatal.

use crate::domain::types::{CardUid, UID_LEN};
use crate::io::hal::RegisterBus;
use thiserror::Error;
use tracing::{debug, trace};

// Register map. Addresses and the init values below are carried verbatim
// from the deployed driver; re-verify against the chip datasheet before
// porting to a different reader IC.
const COMMAND_REG: u8 = 0x01;
const COM_IEN_REG: u8 = 0x02;
const COM_IRQ_REG: u8 = 0x04;
const DIV_IRQ_REG: u8 = 0x05;
const ERROR_REG: u8 = 0x06;
const FIFO_DATA_REG: u8 = 0x09;
const FIFO_LEVEL_REG: u8 = 0x0A;
const CONTROL_REG: u8 = 0x0C;
const BIT_FRAMING_REG: u8 = 0x0D;
const MODE_REG: u8 = 0x11;
const TX_CONTROL_REG: u8 = 0x14;
const TX_ASK_REG: u8 = 0x15;
const CRC_RESULT_HI_REG: u8 = 0x21;
const CRC_RESULT_LO_REG: u8 = 0x22;
const T_MODE_REG: u8 = 0x2A;
const T_PRESCALER_REG: u8 = 0x2B;
const T_RELOAD_HI_REG: u8 = 0x2C;
const T_RELOAD_LO_REG: u8 = 0x2D;

// Chip commands
const CMD_IDLE: u8 = 0x00;
const CMD_CALC_CRC: u8 = 0x03;
const CMD_TRANSCEIVE: u8 = 0x0C;
const CMD_MF_AUTHENT: u8 = 0x0E;
const CMD_SOFT_RESET: u8 = 0x0F;

// Card-level command set
/// Probe cards in IDLE state only.
pub const PICC_REQIDL: u8 = 0x26;
/// Probe all cards, including halted ones.
pub const PICC_REQALL: u8 = 0x52;
const PICC_ANTICOLL: u8 = 0x93;
const PICC_SELECT_ARG: u8 = 0x70;
const PICC_HALT: u8 = 0x50;

/// Fatal bits in ERROR_REG (protocol, parity, CRC, buffer overflow).
const ERROR_MASK: u8 = 0x1B;

// Expected response sizes. Chip/card-specific magic values, asserted rather
// than derived; see the anticollision check byte rule above.
const REQUEST_BITS: usize = 0x10;
const SELECT_BITS: usize = 0x18;
const ANTICOLL_LEN: usize = 5;

// Bounded poll budgets standing in for hardware timeouts
const TRANSCEIVE_POLL_BUDGET: u32 = 2000;
const CRC_POLL_BUDGET: u32 = 0xFF;

/// The chip FIFO is 64 bytes; responses we care about never exceed this.
const FIFO_MAX_READ: usize = 16;

/// Protocol-level failure. Always recovered by returning to idle and
/// retrying on the next poll cycle.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("no card in field")]
    NoTag,
    #[error("chip poll budget exhausted")]
    Timeout,
    #[error("chip error flags {0:#04x}")]
    ChipError(u8),
    #[error("unexpected response length: {bits} bits")]
    BadLength { bits: usize },
    #[error("uid check byte mismatch")]
    Checksum,
}

/// Register-level driver for the contactless reader chip.
///
/// Generic over the register bus so tests can script a fake chip.
pub struct CardReader<B: RegisterBus> {
    bus: B,
}

impl<B: RegisterBus> CardReader<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    /// Soft-reset the chip and program the timer, modulation and framing
    /// registers, then switch the antenna on. Idempotent.
    pub fn init(&mut self) {
        self.reset();
        self.bus.write_reg(T_MODE_REG, 0x8D);
        self.bus.write_reg(T_PRESCALER_REG, 0x3E);
        self.bus.write_reg(T_RELOAD_LO_REG, 30);
        self.bus.write_reg(T_RELOAD_HI_REG, 0);
        self.bus.write_reg(TX_ASK_REG, 0x40);
        self.bus.write_reg(MODE_REG, 0x3D);
        self.antenna_on();
    }

    pub fn reset(&mut self) {
        self.bus.write_reg(COMMAND_REG, CMD_SOFT_RESET);
    }

    pub fn antenna_on(&mut self) {
        if self.bus.read_reg(TX_CONTROL_REG) & 0x03 != 0x03 {
            self.set_bitmask(TX_CONTROL_REG, 0x03);
        }
    }

    fn set_bitmask(&mut self, reg: u8, mask: u8) {
        let cur = self.bus.read_reg(reg);
        self.bus.write_reg(reg, cur | mask);
    }

    fn clear_bitmask(&mut self, reg: u8, mask: u8) {
        let cur = self.bus.read_reg(reg);
        self.bus.write_reg(reg, cur & !mask);
    }

    /// Clock a command frame to the card and read back the response.
    ///
    /// Writes every byte to the FIFO, starts `cmd`, then polls the IRQ
    /// register with a bounded budget until receive-complete/idle or the
    /// chip timer fires. Returns the FIFO contents and the valid bit count.
    fn transceive(&mut self, cmd: u8, send: &[u8]) -> Result<(Vec<u8>, usize), ProtocolError> {
        let (irq_en, wait_irq) = match cmd {
            CMD_MF_AUTHENT => (0x12u8, 0x10u8),
            CMD_TRANSCEIVE => (0x77, 0x30),
            _ => (0x00, 0x00),
        };

        self.bus.write_reg(COM_IEN_REG, irq_en | 0x80);
        self.clear_bitmask(COM_IRQ_REG, 0x80);
        self.set_bitmask(FIFO_LEVEL_REG, 0x80); // flush FIFO
        self.bus.write_reg(COMMAND_REG, CMD_IDLE);

        for &b in send {
            self.bus.write_reg(FIFO_DATA_REG, b);
        }

        self.bus.write_reg(COMMAND_REG, cmd);
        if cmd == CMD_TRANSCEIVE {
            self.set_bitmask(BIT_FRAMING_REG, 0x80); // StartSend
        }

        let mut budget = TRANSCEIVE_POLL_BUDGET;
        let mut irq;
        loop {
            irq = self.bus.read_reg(COM_IRQ_REG);
            budget -= 1;
            if budget == 0 || irq & 0x01 != 0 || irq & wait_irq != 0 {
                break;
            }
        }

        self.clear_bitmask(BIT_FRAMING_REG, 0x80);

        if budget == 0 {
            return Err(ProtocolError::Timeout);
        }

        let err = self.bus.read_reg(ERROR_REG) & ERROR_MASK;
        if err != 0 {
            return Err(ProtocolError::ChipError(err));
        }

        // Chip timer expired before anything answered
        if irq & irq_en & 0x01 != 0 {
            return Err(ProtocolError::NoTag);
        }

        let mut data = Vec::new();
        let mut bits = 0;
        if cmd == CMD_TRANSCEIVE {
            let mut n = self.bus.read_reg(FIFO_LEVEL_REG) as usize;
            // 0 in the "bits in last byte" field means all 8 bits are valid
            let last_bits = (self.bus.read_reg(CONTROL_REG) & 0x07) as usize;
            bits = if last_bits != 0 { n.saturating_sub(1) * 8 + last_bits } else { n * 8 };
            n = n.clamp(1, FIFO_MAX_READ);
            for _ in 0..n {
                data.push(self.bus.read_reg(FIFO_DATA_REG));
            }
        }

        Ok((data, bits))
    }

    /// Probe for a card in the field.
    ///
    /// Succeeds only on an exact 16-bit answer; presence is never cached
    /// across failed probes.
    pub fn request(&mut self, mode: u8) -> Result<usize, ProtocolError> {
        self.bus.write_reg(BIT_FRAMING_REG, 0x07);
        let (_, bits) = self.transceive(CMD_TRANSCEIVE, &[mode])?;
        if bits != REQUEST_BITS {
            return Err(ProtocolError::BadLength { bits });
        }
        Ok(bits)
    }

    /// Run the chip's collision-resolution command and verify the UID check
    /// byte (XOR fold of the first four response bytes against the fifth).
    ///
    /// Returns the raw 5-byte response; the UID is bytes 0..4.
    pub fn anticollision(&mut self) -> Result<[u8; ANTICOLL_LEN], ProtocolError> {
        self.bus.write_reg(BIT_FRAMING_REG, 0x00);
        let (data, bits) = self.transceive(CMD_TRANSCEIVE, &[PICC_ANTICOLL, 0x20])?;
        if data.len() != ANTICOLL_LEN {
            return Err(ProtocolError::BadLength { bits });
        }
        let check = data[..UID_LEN].iter().fold(0u8, |acc, &b| acc ^ b);
        if check != data[UID_LEN] {
            return Err(ProtocolError::Checksum);
        }
        let mut out = [0u8; ANTICOLL_LEN];
        out.copy_from_slice(&data);
        Ok(out)
    }

    /// Select the card whose anticollision response is `ser`.
    ///
    /// Builds `[0x93, 0x70, ser[0..5]]`, appends the hardware CRC and
    /// requires an exact 0x18-bit answer.
    pub fn select(&mut self, ser: &[u8; ANTICOLL_LEN]) -> Result<(), ProtocolError> {
        let mut frame = Vec::with_capacity(9);
        frame.push(PICC_ANTICOLL);
        frame.push(PICC_SELECT_ARG);
        frame.extend_from_slice(ser);
        let crc = self.calculate_crc(&frame)?;
        frame.extend_from_slice(&crc);

        let (_, bits) = self.transceive(CMD_TRANSCEIVE, &frame)?;
        if bits != SELECT_BITS {
            return Err(ProtocolError::BadLength { bits });
        }
        Ok(())
    }

    /// Drive the chip's CRC coprocessor over `data`.
    ///
    /// Deterministic and pure with respect to the input bytes. Result is
    /// low byte first.
    pub fn calculate_crc(&mut self, data: &[u8]) -> Result<[u8; 2], ProtocolError> {
        self.clear_bitmask(DIV_IRQ_REG, 0x04);
        self.set_bitmask(FIFO_LEVEL_REG, 0x80);
        for &b in data {
            self.bus.write_reg(FIFO_DATA_REG, b);
        }
        self.bus.write_reg(COMMAND_REG, CMD_CALC_CRC);

        let mut budget = CRC_POLL_BUDGET;
        loop {
            let n = self.bus.read_reg(DIV_IRQ_REG);
            budget -= 1;
            if n & 0x04 != 0 {
                break;
            }
            if budget == 0 {
                return Err(ProtocolError::Timeout);
            }
        }

        Ok([self.bus.read_reg(CRC_RESULT_LO_REG), self.bus.read_reg(CRC_RESULT_HI_REG)])
    }

    /// Release the currently selected card so it stops answering REQIDL.
    ///
    /// No response is awaited; the card goes silent on success, so the
    /// transceive outcome is deliberately ignored.
    pub fn halt(&mut self) {
        let mut frame = vec![PICC_HALT, 0x00];
        match self.calculate_crc(&frame) {
            Ok(crc) => {
                frame.extend_from_slice(&crc);
                let _ = self.transceive(CMD_TRANSCEIVE, &frame);
            }
            Err(e) => debug!(error = %e, "halt_crc_failed"),
        }
    }

    /// One full detection cycle: request, anticollision, select, halt.
    ///
    /// Any protocol error means "no card this cycle"; errors other than the
    /// quiet no-tag cases are logged at debug level.
    pub fn poll_card(&mut self) -> Option<CardUid> {
        match self.try_poll_card() {
            Ok(uid) => Some(uid),
            Err(ProtocolError::NoTag) | Err(ProtocolError::Timeout) => None,
            Err(e) => {
                debug!(error = %e, "card_protocol_error");
                None
            }
        }
    }

    fn try_poll_card(&mut self) -> Result<CardUid, ProtocolError> {
        self.request(PICC_REQIDL)?;
        let ser = self.anticollision()?;
        let uid = CardUid([ser[0], ser[1], ser[2], ser[3]]);
        self.select(&ser)?;
        self.halt();
        trace!(uid = %uid, "card_resolved");
        Ok(uid)
    }

    #[cfg(test)]
    pub(crate) fn bus(&self) -> &B {
        &self.bus
    }
}
