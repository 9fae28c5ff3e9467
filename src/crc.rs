//! CRC16 as computed by the boot loader (`_crc16_update` from avr-libc).
//!
//! Reflected polynomial 0xA001, initial value 0, no final XOR
//! (also known as CRC-16/ARC).

pub const POLYNOMIAL: u16 = 0xA001;

/// Fold one byte into a running CRC
pub fn update(crc: u16, value: u8) -> u16 {
    let mut crc = crc ^ value as u16;
    for _ in 0..8 {
        if crc & 1 != 0 {
            crc = (crc >> 1) ^ POLYNOMIAL;
        } else {
            crc >>= 1;
        }
    }
    crc
}

/// Running CRC over a byte stream
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct Crc16(u16);

impl Crc16 {
    pub fn new() -> Self {
        Self(0)
    }

    /// Resume from a previously computed value
    pub fn from_value(value: u16) -> Self {
        Self(value)
    }

    pub fn update(&mut self, value: u8) {
        self.0 = update(self.0, value);
    }

    pub fn update_slice(&mut self, data: &[u8]) {
        data.iter().for_each(|&v| self.update(v));
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

/// CRC of a complete buffer
pub fn checksum(data: &[u8]) -> u16 {
    data.iter().fold(0, |crc, &v| update(crc, v))
}
