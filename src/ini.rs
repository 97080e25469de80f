//! Mount table file remembering the image mounted in each slot
//!
//! The file holds one block: six 64-byte path records followed by spaces.
//! Slots 0 and 1 belong to the nibble drives, slots 2 to 5 to the packet
//! partitions.

use crate::block::{Block, BlockDevice, BLOCK_SIZE};
use crate::dir::{ImagePath, ShortName};
use crate::error::FsError;
use crate::file::OpenFile;
use crate::fs::FileSystem;
use crate::ASCII_SPACE;

pub const SLOTS: usize = 6;
pub const RECORD_LEN: usize = 64;

/// First slot used by packet partitions
pub const PACKET_SLOTS: usize = 2;

pub const fn nibble_slot(drive: usize) -> usize {
    drive
}

pub const fn packet_slot(partition: usize) -> usize {
    PACKET_SLOTS + partition
}

/// Open handle on the mount table file
#[derive(Debug)]
pub struct MountTable {
    file: OpenFile,
}

impl MountTable {
    /// Open the table in the root directory, creating an empty one when it
    /// is missing and the card is writable
    pub fn open_or_create<D: BlockDevice>(fs: &mut FileSystem<D>, name: &str, write_protect: bool) -> Result<Self, FsError> {
        let mut path = ImagePath::new();
        path.push(ShortName::parse(name)?)?;

        match fs.open_path(&path) {
            Ok(file) => return Ok(Self { file }),
            Err(FsError::NotFound) => (),
            Err(e) => return Err(e),
        }

        if write_protect {
            crate::warn!("Mount table missing on a write protected card");
            return Err(FsError::WriteProtected);
        }

        crate::info!("Creating mount table {}", name);
        fs.create_path(&path, BLOCK_SIZE as u32)?;
        let mut file = fs.open_path(&path)?;

        let mut block: Block = [ASCII_SPACE; BLOCK_SIZE];
        for record in block[..SLOTS * RECORD_LEN].chunks_exact_mut(RECORD_LEN) {
            ImagePath::new().write_record(record)?;
        }
        fs.write_sector(&mut file, 0, &block)?;

        Ok(Self { file })
    }

    pub fn file(&self) -> &OpenFile {
        &self.file
    }

    pub fn read_path<D: BlockDevice>(&mut self, fs: &mut FileSystem<D>, slot: usize) -> Result<ImagePath, FsError> {
        if slot >= SLOTS {
            return Err(FsError::Invalid);
        }
        let mut block = [0u8; BLOCK_SIZE];
        fs.read_sector(&mut self.file, 0, &mut block)?;
        Ok(ImagePath::from_record(&block[slot * RECORD_LEN..][..RECORD_LEN]))
    }

    /// Replace one record, leaving the others untouched
    pub fn write_path<D: BlockDevice>(&mut self, fs: &mut FileSystem<D>, slot: usize, path: &ImagePath) -> Result<(), FsError> {
        if slot >= SLOTS {
            return Err(FsError::Invalid);
        }
        let mut block = [0u8; BLOCK_SIZE];
        fs.read_sector(&mut self.file, 0, &mut block)?;
        path.write_record(&mut block[slot * RECORD_LEN..][..RECORD_LEN])?;
        fs.write_sector(&mut self.file, 0, &block)
    }
}
