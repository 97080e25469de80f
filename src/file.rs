
use crate::block::{BlockDevice, BLOCK_SIZE};
use crate::dir::{DirectoryEntry, ShortName};
use crate::error::FsError;
use crate::fs::FileSystem;

/// Number of sampled clusters kept per open file
pub const CHAIN_SAMPLES: usize = 64;

/// Evenly spaced samples of a cluster chain so random access walks at most
/// `stride` links from the nearest sample
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainIndex {
    samples: [u32; CHAIN_SAMPLES],
    stride: u32,
    clusters: u32,
}

impl ChainIndex {
    /// Sample the chain from `start` covering `clusters` clusters
    pub(crate) fn build<D: BlockDevice>(fs: &mut FileSystem<D>, start: u32, clusters: u32) -> Result<Self, FsError> {
        let n = CHAIN_SAMPLES as u32;
        let stride = clusters.div_ceil(n).max(1);

        let mut samples = [fs.geometry().width.end_of_chain(); CHAIN_SAMPLES];
        samples[0] = start;

        let mut cluster = start;
        for i in 1..clusters {
            cluster = match fs.next_cluster(cluster)? {
                Some(c) => c,
                None => {
                    crate::warn!("Chain from {} ends after {} of {} clusters", start, i, clusters);
                    break;
                },
            };
            if i % stride == 0 {
                samples[(i / stride) as usize] = cluster;
            }
        }

        Ok(Self { samples, stride, clusters })
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn clusters(&self) -> u32 {
        self.clusters
    }

    pub fn samples(&self) -> &[u32; CHAIN_SAMPLES] {
        &self.samples
    }

    /// Nearest sample at or before a cluster position, as (position, cluster)
    pub fn sample(&self, position: u32) -> (u32, u32) {
        let slot = (position / self.stride).min(CHAIN_SAMPLES as u32 - 1);
        (slot * self.stride, self.samples[slot as usize])
    }
}

/// Handle to a file or directory found by a lookup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenFile {
    pub name: ShortName,
    /// Directory holding the entry, 0 for the root
    pub dir_cluster: u32,
    pub start_cluster: u32,
    pub length: u32,
    pub protect: bool,
    pub is_dir: bool,
    /// Set by any successful sector write
    pub written: bool,
    pub(crate) index: ChainIndex,
    /// Last resolved (cluster position, cluster)
    recent: (u32, u32),
    valid: bool,
}

impl OpenFile {
    pub(crate) fn from_entry<D: BlockDevice>(fs: &mut FileSystem<D>, dir: u32, entry: &DirectoryEntry) -> Result<Self, FsError> {
        let start = entry.first_cluster();
        let clusters = fs.geometry().clusters_for(entry.size);
        let index = ChainIndex::build(fs, start, clusters)?;

        Ok(Self {
            name: entry.short_name(),
            dir_cluster: dir,
            start_cluster: start,
            length: entry.size,
            protect: entry.attrs & 0x01 != 0,
            is_dir: entry.is_dir(),
            written: false,
            index,
            recent: (0, start),
            valid: true,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Refuse all further sector access, used after the card went away
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn index(&self) -> &ChainIndex {
        &self.index
    }

    /// Number of 512-byte sectors holding the file
    pub fn sectors(&self) -> u32 {
        self.length.div_ceil(BLOCK_SIZE as u32)
    }

    /// File carries a 64 byte 2MG container header
    pub fn is_2mg(&self) -> bool {
        self.name.ext() == *b"2MG"
    }

    /// Absolute card block of a file sector
    pub(crate) fn locate<D: BlockDevice>(&mut self, fs: &mut FileSystem<D>, sector: u32) -> Result<u32, FsError> {
        if !self.valid {
            return Err(FsError::Invalid);
        }

        let g = *fs.geometry();
        let spc = g.sectors_per_cluster as u32;
        let position = sector / spc;
        if position >= self.index.clusters {
            return Err(FsError::Invalid);
        }

        let cluster = if position == self.recent.0 {
            self.recent.1
        } else {
            let (base, from) = self.index.sample(position);
            let c = fs.walk(from, position - base)?;
            self.recent = (position, c);
            c
        };

        Ok(g.cluster_block(cluster) + sector % spc)
    }
}
