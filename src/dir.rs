use core::cmp::Ordering;

use packing::{Packed, PackedSize};

use crate::error::FsError;
use crate::ASCII_SPACE;

bitflags::bitflags! {
    pub struct Attrs: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_LABEL=0x08;
        const SUBDIR = 0x10;
        const ARCHIVE = 0x20;
        const DEVICE = 0x40;
    }
}

/// Attribute byte used by long-name fragments
pub const LONG_NAME: u8 = 0x0F;
/// First name byte of a deleted entry
pub const DELETED: u8 = 0xE5;
/// First name byte past the last used entry
pub const END_OF_DIR: u8 = 0x00;

/// 32-byte on-disk directory entry
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Packed)]
#[cfg_attr(feature="defmt", derive(defmt::Format))]
#[packed(little_endian, lsb0)]
pub struct DirectoryEntry {
    #[pkd(7, 0, 0, 10)]
    pub name: [u8; 11],

    #[pkd(7, 0, 11, 11)]
    pub attrs: u8,

    #[pkd(7, 0, 12, 12)]
    _reserved: u8,

    #[pkd(7, 0, 13, 13)]
    pub create_time_fine: u8,

    #[pkd(7, 0, 14, 15)]
    pub create_time: u16,

    #[pkd(7, 0, 16, 17)]
    pub create_date: u16,

    #[pkd(7, 0, 18, 19)]
    pub last_access_date: u16,

    #[pkd(7, 0, 20, 21)]
    pub high_start_cluster: u16,

    #[pkd(7, 0, 22, 23)]
    pub update_time: u16,

    #[pkd(7, 0, 24, 25)]
    pub update_date: u16,

    #[pkd(7, 0, 26, 27)]
    pub start_cluster: u16,

    #[pkd(7, 0, 28, 31)]
    pub size: u32,
}

impl DirectoryEntry {
    /// Fresh entry for a created file, everything but name and size zeroed
    pub fn new(name: &ShortName, size: u32) -> Self {
        Self {
            name: name.0,
            size,
            ..Default::default()
        }
    }

    pub fn read(raw: &[u8]) -> Result<Self, FsError> {
        Self::unpack(&raw[..Self::BYTES]).map_err(|_| FsError::Invalid)
    }

    pub fn write(&self, raw: &mut [u8]) -> Result<(), FsError> {
        self.pack(&mut raw[..Self::BYTES]).map_err(|_| FsError::Invalid)
    }

    pub fn first_cluster(&self) -> u32 {
        (self.high_start_cluster as u32) << 16 | self.start_cluster as u32
    }

    pub fn attributes(&self) -> Attrs {
        Attrs::from_bits_truncate(self.attrs)
    }

    pub fn is_dir(&self) -> bool {
        self.attributes().contains(Attrs::SUBDIR)
    }

    /// Modification stamp, ordered by date then time
    pub fn modified(&self) -> (u16, u16) {
        (self.update_date, self.update_time)
    }

    pub fn short_name(&self) -> ShortName {
        ShortName(self.name)
    }
}

/// Space padded 8.3 name as stored on disk
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
#[cfg_attr(feature="defmt", derive(defmt::Format))]
pub struct ShortName(pub [u8; 11]);

impl ShortName {
    /// Eleven spaces, written to a mount record to unmount a slot
    pub const BLANK: ShortName = ShortName([ASCII_SPACE; 11]);

    /// Build from a `NAME.EXT` string
    pub fn parse(name: &str) -> Result<Self, FsError> {
        let mut n = name.splitn(2, '.');
        let (prefix, ext) = match (n.next(), n.next()) {
            (Some(p), Some(e)) => (p, e),
            (Some(p), None) => (p, ""),
            _ => return Err(FsError::InvalidName),
        };

        if prefix.is_empty() || prefix.len() > 8 || ext.len() > 3 || ext.contains('.') {
            return Err(FsError::InvalidName);
        }

        let mut short = [ASCII_SPACE; 11];
        short[..prefix.len()].copy_from_slice(prefix.as_bytes());
        short[8..][..ext.len()].copy_from_slice(ext.as_bytes());

        Ok(Self(short))
    }

    pub fn stem(&self) -> [u8; 8] {
        let mut s = [0u8; 8];
        s.copy_from_slice(&self.0[..8]);
        s
    }

    pub fn ext(&self) -> [u8; 3] {
        [self.0[8], self.0[9], self.0[10]]
    }

    pub fn with_ext(&self, ext: &[u8; 3]) -> Self {
        let mut n = *self;
        n.0[8..].copy_from_slice(ext);
        n
    }

    pub fn is_blank(&self) -> bool {
        self.0 == Self::BLANK.0
    }

    pub fn is_dot(&self) -> bool {
        self.0[0] == b'.'
    }

    pub fn is_dotdot(&self) -> bool {
        self.0[0] == b'.' && self.0[1] == b'.'
    }
}

/// Maximum directory depth of a mount path
pub const MAX_DEPTH: usize = 5;

/// Root-relative path of an image, one 8.3 name per level
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImagePath {
    segments: heapless::Vec<ShortName, MAX_DEPTH>,
}

impl ImagePath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a `/` separated string of 8.3 names
    pub fn parse(path: &str) -> Result<Self, FsError> {
        let mut p = Self::new();
        for s in path.split('/').filter(|s| !s.is_empty()) {
            p.push(ShortName::parse(s)?)?;
        }
        Ok(p)
    }

    /// Decode a mount record, eleven-byte segments ended by a NUL
    pub fn from_record(record: &[u8]) -> Self {
        let mut p = Self::new();
        for chunk in record.chunks_exact(11) {
            if chunk[0] == 0 {
                break;
            }
            let mut n = [0u8; 11];
            n.copy_from_slice(chunk);
            if p.segments.push(ShortName(n)).is_err() {
                break;
            }
        }
        p
    }

    /// Encode into a mount record, padding the remainder with spaces
    pub fn write_record(&self, record: &mut [u8]) -> Result<(), FsError> {
        let needed = self.segments.len() * 11 + 1;
        if needed > record.len() {
            return Err(FsError::InvalidName);
        }
        for (chunk, name) in record.chunks_exact_mut(11).zip(self.segments.iter()) {
            chunk.copy_from_slice(&name.0);
        }
        record[needed - 1] = 0;
        record[needed..].fill(ASCII_SPACE);
        Ok(())
    }

    /// Path recorded for an empty slot
    pub fn unmounted() -> Self {
        let mut p = Self::new();
        let _ = p.segments.push(ShortName::BLANK);
        p
    }

    pub fn is_unmounted(&self) -> bool {
        self.segments.first().map_or(true, |n| n.is_blank())
    }

    pub fn push(&mut self, name: ShortName) -> Result<(), FsError> {
        self.segments.push(name).map_err(|_| FsError::InvalidName)
    }

    pub fn pop(&mut self) -> Option<ShortName> {
        self.segments.pop()
    }

    pub fn segments(&self) -> &[ShortName] {
        &self.segments
    }

    pub fn file_name(&self) -> Option<&ShortName> {
        self.segments.last()
    }

    /// Same path with the final extension replaced
    pub fn with_extension(&self, ext: &[u8; 3]) -> Self {
        let mut p = self.clone();
        if let Some(last) = p.segments.last_mut() {
            *last = last.with_ext(ext);
        }
        p
    }
}

/// Directory listing capacity including the leading unmount entry
pub const LIST_CAPACITY: usize = 180;

/// One row of a directory listing
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature="defmt", derive(defmt::Format))]
pub struct FileListEntry {
    /// Card block holding the entry, 0 for the unmount sentinel
    pub block: u32,
    /// Byte offset of the entry within `block`
    pub offset: u16,
    pub name: ShortName,
    pub is_dir: bool,
    pub start_cluster: u32,
}

impl FileListEntry {
    /// Leading "unmount" row of every listing
    pub const UNMOUNT: FileListEntry = FileListEntry {
        block: 0,
        offset: 0,
        name: ShortName(*b"UNMOUNT    "),
        is_dir: false,
        start_cluster: 0,
    };

    pub fn is_unmount(&self) -> bool {
        self.block == 0 && self.offset == 0
    }
}

/// In-place comb sort with a 10/13 gap shrink
pub(crate) fn comb_sort<T, F>(items: &mut [T], mut cmp: F)
where
    F: FnMut(&T, &T) -> Ordering,
{
    let mut gap = items.len();
    let mut swapped = true;

    while gap > 1 || swapped {
        gap = (gap * 10 / 13).max(1);
        swapped = false;

        for i in 0..items.len().saturating_sub(gap) {
            if cmp(&items[i], &items[i + gap]) == Ordering::Greater {
                items.swap(i, i + gap);
                swapped = true;
            }
        }
    }
}
