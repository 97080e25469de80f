
use packing::{Packed, PackedSize};

use crate::block::{Block, BlockDevice, BLOCK_SIZE};
use crate::error::MediaError;

/// Boot sector / BIOS parameter block, covering the FAT16 and FAT32 shared
/// fields plus the FAT32 extension up to the root cluster
#[derive(Clone, Copy, Eq, PartialEq, Debug, Packed)]
#[cfg_attr(feature="defmt", derive(defmt::Format))]
#[packed(little_endian, lsb0)]
pub struct FatBootBlock {
    #[pkd(7, 0, 0, 2)]
    pub jump_instruction: [u8; 3],

    #[pkd(7, 0, 3, 10)]
    pub oem_info: [u8; 8],

    #[pkd(7, 0, 11, 12)]
    pub bytes_per_sector: u16,

    #[pkd(7, 0, 13, 13)]
    pub sectors_per_cluster: u8,

    #[pkd(7, 0, 14, 15)]
    pub reserved_sectors: u16,

    #[pkd(7, 0, 16, 16)]
    pub fat_copies: u8,

    #[pkd(7, 0, 17, 18)]
    pub root_directory_entries: u16,

    #[pkd(7, 0, 19, 20)]
    pub total_sectors16: u16,

    #[pkd(7, 0, 21, 21)]
    pub media_descriptor: u8,

    #[pkd(7, 0, 22, 23)]
    pub sectors_per_fat: u16,

    #[pkd(7, 0, 24, 25)]
    pub sectors_per_track: u16,

    #[pkd(7, 0, 26, 27)]
    pub heads: u16,

    #[pkd(7, 0, 28, 31)]
    pub hidden_sectors: u32,

    #[pkd(7, 0, 32, 35)]
    pub total_sectors32: u32,

    #[pkd(7, 0, 36, 39)]
    pub sectors_per_fat32: u32,

    #[pkd(7, 0, 40, 41)]
    pub ext_flags: u16,

    #[pkd(7, 0, 42, 43)]
    pub fs_version: u16,

    #[pkd(7, 0, 44, 47)]
    pub root_cluster: u32,
}

const FAT16_ID: (usize, &[u8]) = (54, b"FAT16");
const FAT32_ID: (usize, &[u8]) = (82, b"FAT32");
const PARTITION0_LBA: usize = 0x1C6;
const SIGNATURE: usize = 510;

/// Width of a FAT entry
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature="defmt", derive(defmt::Format))]
pub enum FatWidth {
    Fat16,
    Fat32,
}

impl FatWidth {
    pub const fn entry_bytes(self) -> u32 {
        match self {
            FatWidth::Fat16 => 2,
            FatWidth::Fat32 => 4,
        }
    }

    /// Smallest entry value treated as the end of a chain
    pub const fn end_of_chain(self) -> u32 {
        match self {
            FatWidth::Fat16 => 0xFFF7,
            FatWidth::Fat32 => 0x0FFF_FFF7,
        }
    }

    /// Value written to terminate a newly allocated chain
    pub const fn terminator(self) -> u32 {
        match self {
            FatWidth::Fat16 => 0xFFFF,
            FatWidth::Fat32 => 0x0FFF_FFFF,
        }
    }

    pub const fn is_end(self, entry: u32) -> bool {
        entry >= self.end_of_chain()
    }
}

/// Layout of a mounted FAT volume, all positions in absolute card blocks
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature="defmt", derive(defmt::Format))]
pub struct Geometry {
    /// Block holding the BPB, 0 for a superfloppy card
    pub bpb_start: u32,
    pub sectors_per_cluster: u8,
    pub fat_start: u32,
    /// Blocks per FAT copy
    pub fat_len: u32,
    pub fat_copies: u8,
    /// Fixed root region (FAT16 only, zero length on FAT32)
    pub root_start: u32,
    pub root_sectors: u32,
    /// First cluster of the FAT32 root directory
    pub root_cluster: u32,
    pub data_start: u32,
    pub cluster_count: u32,
    pub width: FatWidth,
    /// Card addresses blocks rather than bytes
    pub block_addressing: bool,
}

impl Geometry {
    /// Locate the BPB on a freshly initialised card and derive its layout
    pub fn detect<D: BlockDevice>(dev: &mut D, block_addressing: bool) -> Result<Self, MediaError> {
        let mut block = [0u8; BLOCK_SIZE];
        dev.read_block(0, &mut block)?;

        let mut bpb_start = 0;
        if !has_id(&block, FAT16_ID) && !has_id(&block, FAT32_ID) {
            // Partitioned card, follow the first MBR entry
            bpb_start = u32::from_le_bytes([
                block[PARTITION0_LBA], block[PARTITION0_LBA + 1],
                block[PARTITION0_LBA + 2], block[PARTITION0_LBA + 3],
            ]);
            crate::debug!("MBR partition 0 at block {}", bpb_start);
            dev.read_block(bpb_start, &mut block)?;
        }

        Self::from_boot_sector(&block, bpb_start, block_addressing)
    }

    /// Derive the layout from a boot sector read at `bpb_start`
    pub fn from_boot_sector(block: &Block, bpb_start: u32, block_addressing: bool) -> Result<Self, MediaError> {
        if block[SIGNATURE] != 0x55 || block[SIGNATURE + 1] != 0xAA {
            crate::warn!("Missing boot sector signature");
            return Err(MediaError::BadGeometry);
        }

        let bpb = FatBootBlock::unpack(&block[..FatBootBlock::BYTES])
            .map_err(|_| MediaError::BadGeometry)?;
        crate::debug!("BootBlock: {:?}", bpb);

        if bpb.bytes_per_sector as usize != BLOCK_SIZE || bpb.sectors_per_cluster == 0 || bpb.fat_copies == 0 {
            return Err(MediaError::BadGeometry);
        }

        let fat_len = match bpb.sectors_per_fat {
            0 => bpb.sectors_per_fat32,
            n => n as u32,
        };
        let total = match bpb.total_sectors16 {
            0 => bpb.total_sectors32,
            n => n as u32,
        };

        let root_sectors = (32 * bpb.root_directory_entries as u32 + BLOCK_SIZE as u32 - 1) / BLOCK_SIZE as u32;
        let meta = bpb.reserved_sectors as u32 + fat_len * bpb.fat_copies as u32 + root_sectors;
        let data_sectors = total.checked_sub(meta).ok_or(MediaError::BadGeometry)?;
        let cluster_count = data_sectors / bpb.sectors_per_cluster as u32;

        let width = match cluster_count {
            4086..=65525 => FatWidth::Fat16,
            n if n >= 65526 => FatWidth::Fat32,
            n => {
                crate::warn!("Unsupported cluster count: {}", n);
                return Err(MediaError::BadGeometry);
            },
        };

        let fat_start = bpb_start + bpb.reserved_sectors as u32;
        let root_start = fat_start + fat_len * bpb.fat_copies as u32;

        let g = Geometry {
            bpb_start,
            sectors_per_cluster: bpb.sectors_per_cluster,
            fat_start,
            fat_len,
            fat_copies: bpb.fat_copies,
            root_start,
            root_sectors,
            root_cluster: match width {
                FatWidth::Fat16 => 0,
                FatWidth::Fat32 => bpb.root_cluster,
            },
            data_start: root_start + root_sectors,
            cluster_count,
            width,
            block_addressing,
        };

        crate::info!("Mounted {:?} volume, {} clusters of {} blocks", g.width, g.cluster_count, g.sectors_per_cluster);

        Ok(g)
    }

    pub const fn cluster_bytes(&self) -> u32 {
        self.sectors_per_cluster as u32 * BLOCK_SIZE as u32
    }

    /// Clusters needed to hold `length` bytes
    pub const fn clusters_for(&self, length: u32) -> u32 {
        length.div_ceil(BLOCK_SIZE as u32).div_ceil(self.sectors_per_cluster as u32)
    }

    /// First block of a data cluster
    pub const fn cluster_block(&self, cluster: u32) -> u32 {
        self.data_start + (cluster - 2) * self.sectors_per_cluster as u32
    }

    /// Block and byte offset of a cluster's entry in the first FAT copy
    pub const fn fat_entry_location(&self, cluster: u32) -> (u32, usize) {
        let byte = cluster * self.width.entry_bytes();
        (self.fat_start + byte / BLOCK_SIZE as u32, (byte % BLOCK_SIZE as u32) as usize)
    }

    /// Highest valid cluster number
    pub const fn last_cluster(&self) -> u32 {
        self.cluster_count + 1
    }
}

fn has_id(block: &Block, id: (usize, &[u8])) -> bool {
    &block[id.0..id.0 + id.1.len()] == id.1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemDisk;

    fn boot_block(root_entries: u16, fat16_sectors: u16, total: u32) -> Block {
        let bpb = FatBootBlock {
            jump_instruction: [0xEB, 0x3C, 0x90],
            oem_info: *b"MSWIN4.1",
            bytes_per_sector: 512,
            sectors_per_cluster: 4,
            reserved_sectors: 4,
            fat_copies: 2,
            root_directory_entries: root_entries,
            total_sectors16: 0,
            media_descriptor: 0xF8,
            sectors_per_fat: fat16_sectors,
            sectors_per_track: 63,
            heads: 255,
            hidden_sectors: 0,
            total_sectors32: total,
            sectors_per_fat32: 0,
            ext_flags: 0,
            fs_version: 0,
            root_cluster: 0,
        };

        let mut block = [0u8; BLOCK_SIZE];
        bpb.pack(&mut block[..FatBootBlock::BYTES]).unwrap();
        block[54..59].copy_from_slice(b"FAT16");
        block[510] = 0x55;
        block[511] = 0xAA;
        block
    }

    #[test]
    fn fat16_layout() {
        let block = boot_block(512, 64, 65536);
        let g = Geometry::from_boot_sector(&block, 0, true).unwrap();

        assert_eq!(g.width, FatWidth::Fat16);
        assert_eq!(g.root_sectors, 32);
        assert_eq!(g.fat_start, 4);
        assert_eq!(g.root_start, 4 + 128);
        assert_eq!(g.data_start, 4 + 128 + 32);
        assert_eq!(g.cluster_count, (65536 - 164) / 4);
        assert_eq!(g.clusters_for(0), 0);
        assert_eq!(g.clusters_for(2049), 2);
    }

    #[test]
    fn rejects_bad_sector_size() {
        let mut block = boot_block(512, 64, 65536);
        block[11] = 0x00;
        block[12] = 0x04;
        assert_eq!(Geometry::from_boot_sector(&block, 0, true), Err(MediaError::BadGeometry));
    }

    #[test]
    fn rejects_missing_signature() {
        let mut block = boot_block(512, 64, 65536);
        block[511] = 0x00;
        assert_eq!(Geometry::from_boot_sector(&block, 0, true), Err(MediaError::BadGeometry));
    }

    #[test]
    fn rejects_fat12_cluster_count() {
        let block = boot_block(512, 8, 8000);
        assert_eq!(Geometry::from_boot_sector(&block, 0, true), Err(MediaError::BadGeometry));
    }

    #[test]
    fn follows_mbr_partition() {
        let mut disk = MemDisk::new(70_000);
        let mut mbr = [0u8; BLOCK_SIZE];
        mbr[PARTITION0_LBA..PARTITION0_LBA + 4].copy_from_slice(&100u32.to_le_bytes());
        mbr[510] = 0x55;
        mbr[511] = 0xAA;
        disk.write_block(0, &mbr).unwrap();
        disk.write_block(100, &boot_block(512, 64, 65536)).unwrap();

        let g = Geometry::detect(&mut disk, false).unwrap();
        assert_eq!(g.bpb_start, 100);
        assert_eq!(g.fat_start, 104);
        assert!(!g.block_addressing);
    }
}
