//! File allocation table access
//!
//! Entries are read through the one-block cache and every update is applied
//! to each FAT copy so the mirrors never diverge.

use crate::block::BLOCK_SIZE;
use crate::boot::FatWidth;
use crate::error::FsError;
use crate::fs::FileSystem;
use crate::BlockDevice;

/// Location that records the next cluster of a chain
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Link {
    /// Start cluster fields of the directory entry at `offset` in `block`
    Entry { block: u32, offset: usize },
    /// FAT entry of a cluster
    Cluster(u32),
}

impl <D: BlockDevice> FileSystem<D> {

    /// Raw FAT entry for `cluster`
    pub fn fat_entry(&mut self, cluster: u32) -> Result<u32, FsError> {
        let g = *self.geometry();
        let (block, offset) = g.fat_entry_location(cluster);
        let b = self.load(block)?;

        Ok(match g.width {
            FatWidth::Fat16 => u16::from_le_bytes([b[offset], b[offset + 1]]) as u32,
            FatWidth::Fat32 => u32::from_le_bytes([b[offset], b[offset + 1], b[offset + 2], b[offset + 3]]) & 0x0FFF_FFFF,
        })
    }

    /// Update the FAT entry for `cluster` in every FAT copy
    pub(crate) fn set_fat_entry(&mut self, cluster: u32, value: u32) -> Result<(), FsError> {
        let g = *self.geometry();
        let (block, offset) = g.fat_entry_location(cluster);

        for copy in 0..g.fat_copies as u32 {
            self.modify(block + copy * g.fat_len, |b| match g.width {
                FatWidth::Fat16 => {
                    b[offset..offset + 2].copy_from_slice(&(value as u16).to_le_bytes());
                },
                FatWidth::Fat32 => {
                    let high = b[offset + 3] & 0xF0;
                    b[offset..offset + 4].copy_from_slice(&(value & 0x0FFF_FFFF).to_le_bytes());
                    b[offset + 3] |= high;
                },
            })?;
        }

        crate::trace!("FAT[{}] = 0x{:08x}", cluster, value);

        Ok(())
    }

    /// Follow one link, `None` at the end of the chain
    pub(crate) fn next_cluster(&mut self, cluster: u32) -> Result<Option<u32>, FsError> {
        if !self.is_data_cluster(cluster) {
            return Ok(None);
        }

        let next = self.fat_entry(cluster)?;
        if self.geometry().width.is_end(next) || !self.is_data_cluster(next) {
            Ok(None)
        } else {
            Ok(Some(next))
        }
    }

    /// Cluster `steps` links after `cluster`
    pub(crate) fn walk(&mut self, mut cluster: u32, steps: u32) -> Result<u32, FsError> {
        if !self.is_data_cluster(cluster) {
            return Err(FsError::Invalid);
        }
        for _ in 0..steps {
            cluster = self.next_cluster(cluster)?.ok_or(FsError::Invalid)?;
        }
        Ok(cluster)
    }

    /// Final cluster of the chain starting at `cluster`
    pub(crate) fn chain_tail(&mut self, mut cluster: u32) -> Result<u32, FsError> {
        if !self.is_data_cluster(cluster) {
            return Err(FsError::Invalid);
        }
        let mut remaining = self.geometry().cluster_count;
        while let Some(next) = self.next_cluster(cluster)? {
            cluster = next;
            remaining = remaining.checked_sub(1).ok_or(FsError::Invalid)?;
        }
        Ok(cluster)
    }

    /// Claim `count` free clusters in ascending order, linking the first
    /// from `owner` and terminating the last.
    ///
    /// Returns the first claimed cluster, or 0 when `count` is 0. Running out
    /// of free clusters terminates what was claimed and fails with
    /// `OutOfSpace`.
    pub(crate) fn allocate_chain(&mut self, owner: Link, count: u32, zero_fill: bool) -> Result<u32, FsError> {
        let g = *self.geometry();
        let mut owner = owner;
        let mut first = 0;
        let mut claimed = 0;
        let mut cluster = 2;

        while claimed < count {
            if cluster > g.last_cluster() {
                crate::warn!("Out of space after {} of {} clusters", claimed, count);
                if let Link::Cluster(_) = owner {
                    self.link(owner, g.width.terminator())?;
                }
                return Err(FsError::OutOfSpace);
            }

            if self.fat_entry(cluster)? == 0 {
                if zero_fill {
                    let zero = [0u8; BLOCK_SIZE];
                    let base = g.cluster_block(cluster);
                    for s in 0..g.sectors_per_cluster as u32 {
                        self.write_through(base + s, &zero)?;
                    }
                }

                self.link(owner, cluster)?;
                if first == 0 {
                    first = cluster;
                }
                owner = Link::Cluster(cluster);
                claimed += 1;
            }

            cluster += 1;
        }

        if claimed > 0 {
            self.link(owner, g.width.terminator())?;
        }

        crate::debug!("Allocated {} clusters from {}", count, first);

        Ok(first)
    }

    fn link(&mut self, owner: Link, value: u32) -> Result<(), FsError> {
        match owner {
            Link::Cluster(c) => self.set_fat_entry(c, value),
            Link::Entry { block, offset } => {
                let wide = self.geometry().width == FatWidth::Fat32;
                self.modify(block, |b| {
                    b[offset + 26..offset + 28].copy_from_slice(&(value as u16).to_le_bytes());
                    if wide {
                        b[offset + 20..offset + 22].copy_from_slice(&((value >> 16) as u16).to_le_bytes());
                    }
                })?;
                Ok(())
            },
        }
    }

    fn is_data_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster <= self.geometry().last_cluster()
    }
}
