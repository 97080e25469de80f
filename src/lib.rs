//! SD card backed disk emulator core for 8-bit Apple II style hosts
//!
//! Image files on a FAT16/FAT32 formatted SD card are presented to the host
//! either as Disk II floppy drives (a nibble stream driven by the stepper
//! phases) or as SmartPort block devices (checksummed packets over a REQ/ACK
//! handshake). Hardware is reached only through traits so the same core runs
//! on a microcontroller or against the test doubles in `tests/`.

#![cfg_attr(not(feature="std"), no_std)]

#[cfg(feature = "defmt")]
#[allow(unused_imports)]
use defmt::{debug, info, trace, warn, error};

#[cfg(not(feature = "defmt"))]
#[allow(unused_imports)]
use log::{debug, info, trace, warn, error};

mod error;
pub use error::{BusError, ChecksumError, FsError, IoError, MediaError};

mod block;
pub use block::{Block, BlockDevice, RemovableMedia, BLOCK_SIZE};

mod config;
pub use config::Config;

pub mod transport;
pub use transport::Transport;

pub mod card;
pub use card::SdCard;

mod boot;
pub use boot::{FatBootBlock, FatWidth, Geometry};

mod dir;
pub use dir::{Attrs, DirectoryEntry, FileListEntry, ImagePath, ShortName, LIST_CAPACITY};

mod file;
pub use file::{ChainIndex, OpenFile, CHAIN_SAMPLES};

mod fat;

mod fs;
pub use fs::FileSystem;

pub mod gcr;

pub mod disk2;
pub use disk2::Disk2;

pub mod packet;
pub use packet::RawPacket;

pub mod smartport;
pub use smartport::SmartPort;

pub mod bus;
pub use bus::{Event, HostBus, Irq};

mod store;
pub use store::{NvStore, PersistentStore, StoreKey};

mod ini;
pub use ini::MountTable;

pub mod convert;

mod emulator;
pub use emulator::{Emulator, Mode, StatusDisplay};

const ASCII_SPACE: u8 = 0x20;

#[cfg(test)]
pub(crate) mod testutil;
