//! Conversion between DOS order `.DSK` images and `.NIC` nibble images

use crate::block::{Block, BlockDevice, BLOCK_SIZE};
use crate::disk2::{nic_sector, SECTORS};
use crate::error::FsError;
use crate::file::OpenFile;
use crate::fs::FileSystem;
use crate::gcr::{self, NIBBLE_SECTOR, RAW_SECTOR};

pub const TRACKS: u8 = 35;

/// Physical sector holding each logical DOS sector
pub const INTERLEAVE: [u8; SECTORS as usize] = [0, 13, 11, 9, 7, 5, 3, 1, 14, 12, 10, 8, 6, 4, 2, 15];

pub const DSK_IMAGE_LEN: u32 = TRACKS as u32 * SECTORS as u32 * RAW_SECTOR as u32;
pub const NIC_IMAGE_LEN: u32 = TRACKS as u32 * SECTORS as u32 * NIBBLE_SECTOR as u32;

/// DSK block holding a logical sector, two sectors per block
const fn dsk_block(track: u8, sector: u8) -> u32 {
    track as u32 * (SECTORS as u32 / 2) + sector as u32 / 2
}

/// Nibblize every sector of `dsk` into `nic`
pub fn dsk_to_nic<D: BlockDevice>(fs: &mut FileSystem<D>, nic: &mut OpenFile, dsk: &mut OpenFile, volume: u8) -> Result<(), FsError> {
    crate::debug!("Converting {:?} to {:?}", dsk.name, nic.name);

    let mut block: Block = [0u8; BLOCK_SIZE];
    let mut out = [0u8; NIBBLE_SECTOR];
    let mut raw = [0u8; RAW_SECTOR];

    for track in 0..TRACKS {
        for sector in 0..SECTORS {
            if sector & 1 == 0 {
                fs.read_sector(dsk, dsk_block(track, sector), &mut block)?;
            }
            let half = (sector & 1) as usize * RAW_SECTOR;
            raw.copy_from_slice(&block[half..half + RAW_SECTOR]);

            let physical = INTERLEAVE[sector as usize];
            gcr::encode_sector(&mut out, volume, track, physical, &raw);
            fs.write_sector(nic, nic_sector(track, physical), &out)?;
        }
    }

    Ok(())
}

/// Decode every nibble sector of `nic` back into `dsk`
pub fn nic_to_dsk<D: BlockDevice>(fs: &mut FileSystem<D>, dsk: &mut OpenFile, nic: &mut OpenFile) -> Result<(), FsError> {
    crate::debug!("Writing back {:?} to {:?}", nic.name, dsk.name);

    let mut sector_buf = [0u8; NIBBLE_SECTOR];
    let mut block: Block = [0u8; BLOCK_SIZE];

    for track in 0..TRACKS {
        for sector in 0..SECTORS {
            let physical = INTERLEAVE[sector as usize];
            fs.read_sector(nic, nic_sector(track, physical), &mut sector_buf)?;

            let half = (sector & 1) as usize * RAW_SECTOR;
            block[half..half + RAW_SECTOR].copy_from_slice(&gcr::decode_sector(&sector_buf));

            if sector & 1 == 1 {
                fs.write_sector(dsk, dsk_block(track, sector), &block)?;
            }
        }
    }

    Ok(())
}
