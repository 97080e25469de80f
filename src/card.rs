//! SD card in SPI mode
//!
//! Supports standard capacity (byte addressed) and high capacity (block
//! addressed) cards. Data CRCs are clocked but not checked.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::SpiBus;

use crate::block::{Block, BlockDevice, RemovableMedia, BLOCK_SIZE};
use crate::boot::Geometry;
use crate::error::{IoError, MediaError};
use crate::transport::Transport;

const CMD0: u8 = 0;
const CMD8: u8 = 8;
const CMD16: u8 = 16;
const CMD17: u8 = 17;
const CMD24: u8 = 24;
const CMD55: u8 = 55;
const ACMD41: u8 = 41;
const CMD58: u8 = 58;

const R1_READY: u8 = 0x00;
const R1_IDLE: u8 = 0x01;
const R1_ILLEGAL_COMMAND: u8 = 0x04;
const DATA_TOKEN: u8 = 0xFE;
const DATA_ACCEPTED: u8 = 0x05;
const OCR_CCS: u8 = 0x40;

const RESPONSE_POLLS: u32 = 16;
const TOKEN_POLLS: u32 = 50_000;
const BUSY_POLLS: u32 = 200_000;
const RESET_ATTEMPTS: u32 = 16;
/// ACMD41 attempts, one millisecond apart
const READY_ATTEMPTS: u32 = 1_000;
/// Card must stay inserted this long before initialisation
const DEBOUNCE_US: u32 = 50_000;
const DEBOUNCE_STEP_US: u32 = 1_000;

/// SD card on an SPI bus with card-detect and write-protect sense lines
pub struct SdCard<SPI, CS, EJ, WP, D> {
    bus: Transport<SPI, CS, EJ, D>,
    write_protect: WP,
    block_addressing: bool,
    geometry: Option<Geometry>,
}

impl <SPI, CS, EJ, WP, D> SdCard<SPI, CS, EJ, WP, D>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    EJ: InputPin,
    WP: InputPin,
    D: DelayNs,
{
    /// `write_protect` reads high when the card tab is in the locked position
    pub fn new(bus: Transport<SPI, CS, EJ, D>, write_protect: WP) -> Self {
        Self { bus, write_protect, block_addressing: false, geometry: None }
    }

    pub fn transport(&mut self) -> &mut Transport<SPI, CS, EJ, D> {
        &mut self.bus
    }

    /// Run the SPI-mode power up sequence and read the volume geometry
    pub fn initialize(&mut self) -> Result<Geometry, MediaError> {
        self.geometry = None;
        if self.bus.ejected() {
            return Err(MediaError::Ejected);
        }

        // At least 74 clocks with CS released
        self.bus.select(false)?;
        for _ in 0..10 {
            self.bus.write_byte(0xFF)?;
        }

        self.transaction(|card| {
            for _ in 0..RESET_ATTEMPTS {
                if card.command(CMD0, 0, 0x95)? == R1_IDLE {
                    return Ok(());
                }
            }
            Err(IoError::Timeout)
        })?;

        let mut r7 = [0u8; 4];
        let r1 = self.transaction(|card| card.command_with(CMD8, 0x1AA, 0x87, &mut r7))?;
        let v2 = match r1 {
            R1_IDLE if r7[2] & 0x0F == 0x01 && r7[3] == 0xAA => true,
            R1_IDLE => {
                crate::warn!("Card rejected interface condition: {:?}", r7);
                return Err(MediaError::Timeout);
            },
            r if r & R1_ILLEGAL_COMMAND != 0 => false,
            r => {
                crate::warn!("Unexpected CMD8 response: 0x{:02x}", r);
                return Err(MediaError::Timeout);
            },
        };

        let hcs = if v2 { 0x4000_0000 } else { 0 };
        let mut ready = false;
        for _ in 0..READY_ATTEMPTS {
            let r1 = self.transaction(|card| {
                let r = card.command(CMD55, 0, 0xFF)?;
                if r > R1_IDLE {
                    return Ok(r);
                }
                card.command(ACMD41, hcs, 0xFF)
            })?;
            if r1 == R1_READY {
                ready = true;
                break;
            }
            self.bus.delay_us(1_000);
        }
        if !ready {
            crate::warn!("Card did not leave idle state");
            return Err(MediaError::Timeout);
        }

        self.block_addressing = false;
        if v2 {
            let mut ocr = [0u8; 4];
            let r1 = self.transaction(|card| card.command_with(CMD58, 0, 0xFF, &mut ocr))?;
            if r1 != R1_READY {
                return Err(MediaError::Timeout);
            }
            self.block_addressing = ocr[0] & OCR_CCS != 0;
        }

        if self.transaction(|card| card.command(CMD16, BLOCK_SIZE as u32, 0xFF))? != R1_READY {
            return Err(MediaError::Timeout);
        }

        crate::debug!("Card ready (v2: {}, block addressing: {})", v2, self.block_addressing);

        let block_addressing = self.block_addressing;
        let g = Geometry::detect(self, block_addressing)?;
        self.geometry = Some(g);
        Ok(g)
    }

    /// Select the card for `f`, always releasing it afterwards
    fn transaction<T, F>(&mut self, f: F) -> Result<T, IoError>
    where
        F: FnOnce(&mut Self) -> Result<T, IoError>,
    {
        self.bus.select(true)?;
        let r = f(self);

        // Release and clock once more even when `f` failed
        let released = self.bus.select(false).and_then(|_| self.bus.write_byte(0xFF));
        let v = r?;
        released.map(|_| v)
    }

    fn command(&mut self, cmd: u8, arg: u32, crc: u8) -> Result<u8, IoError> {
        self.command_with(cmd, arg, crc, &mut [])
    }

    /// Send a command frame, returning R1 and filling any trailing response bytes
    fn command_with(&mut self, cmd: u8, arg: u32, crc: u8, extra: &mut [u8]) -> Result<u8, IoError> {
        let frame = [
            0x40 | cmd,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            crc,
        ];

        self.bus.write_byte(0xFF)?;
        for b in frame {
            self.bus.write_byte(b)?;
        }

        let r1 = self.bus.poll_until(RESPONSE_POLLS, |r| r & 0x80 == 0)?;
        for slot in extra {
            *slot = self.bus.read_byte()?;
        }
        Ok(r1)
    }

    fn address(&self, index: u32) -> u32 {
        if self.block_addressing {
            index
        } else {
            index.saturating_mul(BLOCK_SIZE as u32)
        }
    }

    fn wait_inserted(&mut self) {
        let mut settled = 0;
        while settled < DEBOUNCE_US {
            if self.bus.ejected() {
                settled = 0;
            } else {
                settled += DEBOUNCE_STEP_US;
            }
            self.bus.delay_us(DEBOUNCE_STEP_US);
        }
    }
}

impl <SPI, CS, EJ, WP, D> BlockDevice for SdCard<SPI, CS, EJ, WP, D>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    EJ: InputPin,
    WP: InputPin,
    D: DelayNs,
{
    fn read_block(&mut self, index: u32, block: &mut Block) -> Result<(), IoError> {
        let arg = self.address(index);
        let mut data = [0u8; BLOCK_SIZE];

        self.transaction(|card| {
            if card.command(CMD17, arg, 0xFF)? != R1_READY {
                return Err(IoError::Timeout);
            }
            if card.bus.poll_until(TOKEN_POLLS, |t| t != 0xFF)? != DATA_TOKEN {
                return Err(IoError::Timeout);
            }
            for slot in data.iter_mut() {
                *slot = card.bus.read_byte()?;
            }
            // CRC
            card.bus.read_byte()?;
            card.bus.read_byte()?;
            Ok(())
        })?;

        *block = data;
        Ok(())
    }

    fn write_block(&mut self, index: u32, block: &Block) -> Result<(), IoError> {
        let arg = self.address(index);

        self.transaction(|card| {
            if card.command(CMD24, arg, 0xFF)? != R1_READY {
                return Err(IoError::Timeout);
            }
            card.bus.write_byte(0xFF)?;
            card.bus.write_byte(DATA_TOKEN)?;
            for b in block.iter() {
                card.bus.write_byte(*b)?;
            }
            card.bus.write_byte(0xFF)?;
            card.bus.write_byte(0xFF)?;

            let response = card.bus.read_byte()? & 0x1F;
            if response != DATA_ACCEPTED {
                crate::warn!("Write of block {} rejected: 0x{:02x}", index, response);
                return Err(IoError::Timeout);
            }
            card.bus.poll_until(BUSY_POLLS, |b| b == 0xFF)?;
            Ok(())
        })
    }
}

impl <SPI, CS, EJ, WP, D> RemovableMedia for SdCard<SPI, CS, EJ, WP, D>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    EJ: InputPin,
    WP: InputPin,
    D: DelayNs,
{
    fn detect(&mut self, force: bool) -> bool {
        if !force && !self.bus.ejected() && self.geometry.is_some() {
            return false;
        }

        self.geometry = None;
        loop {
            self.wait_inserted();
            match self.initialize() {
                Ok(_) => return true,
                Err(e) => crate::warn!("Card initialisation failed: {:?}", e),
            }
        }
    }

    fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }

    fn write_protected(&mut self) -> bool {
        self.write_protect.is_high().unwrap_or(true)
    }

    fn media_present(&mut self) -> bool {
        !self.bus.ejected()
    }
}
