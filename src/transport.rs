//! Byte level SPI link to the card slot
//!
//! Every exchange first samples the media-removed line so that pulling the
//! card aborts a transfer within one byte time.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::SpiBus;

use crate::error::IoError;

/// SPI bus, chip select, media-removed input (high when the slot is empty)
/// and a delay source
pub struct Transport<SPI, CS, EJ, D> {
    spi: SPI,
    cs: CS,
    eject: EJ,
    delay: D,
}

impl <SPI, CS, EJ, D> Transport<SPI, CS, EJ, D>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    EJ: InputPin,
    D: DelayNs,
{
    pub fn new(spi: SPI, mut cs: CS, eject: EJ, delay: D) -> Self {
        if cs.set_high().is_err() {
            crate::warn!("Chip select release failed");
        }
        Self { spi, cs, eject, delay }
    }

    /// Media-removed line, a failed read counts as removed
    pub fn ejected(&mut self) -> bool {
        self.eject.is_high().unwrap_or(true)
    }

    /// Drive chip select, a pin fault aborts the transfer like a stalled bus
    pub fn select(&mut self, selected: bool) -> Result<(), IoError> {
        let r = if selected { self.cs.set_low() } else { self.cs.set_high() };
        r.map_err(|_| {
            crate::warn!("Chip select {} failed", if selected { "assert" } else { "release" });
            IoError::Timeout
        })
    }

    /// Full duplex exchange of one byte
    pub fn transfer(&mut self, byte: u8) -> Result<u8, IoError> {
        if self.ejected() {
            return Err(IoError::Ejected);
        }
        let mut frame = [byte];
        self.spi.transfer_in_place(&mut frame).map_err(|_| IoError::Timeout)?;
        Ok(frame[0])
    }

    pub fn write_byte(&mut self, byte: u8) -> Result<(), IoError> {
        self.transfer(byte).map(|_| ())
    }

    /// Clock in one byte with the output held high
    pub fn read_byte(&mut self) -> Result<u8, IoError> {
        self.transfer(0xFF)
    }

    /// Clock bytes until `accept` matches, giving up after `polls` bytes
    pub fn poll_until<F: FnMut(u8) -> bool>(&mut self, polls: u32, mut accept: F) -> Result<u8, IoError> {
        for _ in 0..polls {
            let b = self.read_byte()?;
            if accept(b) {
                return Ok(b);
            }
        }
        Err(IoError::Timeout)
    }

    pub fn flush(&mut self) -> Result<(), IoError> {
        self.spi.flush().map_err(|_| IoError::Timeout)
    }

    pub fn delay_us(&mut self, us: u32) {
        self.delay.delay_us(us);
    }

    /// Recover the underlying peripherals
    pub fn release(self) -> (SPI, CS, EJ, D) {
        (self.spi, self.cs, self.eject, self.delay)
    }
}
