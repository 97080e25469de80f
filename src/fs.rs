
use crate::block::{Block, BlockDevice, RemovableMedia};
use crate::boot::{FatWidth, Geometry};
use crate::dir::{comb_sort, DirectoryEntry, FileListEntry, ImagePath, ShortName, DELETED, END_OF_DIR, LIST_CAPACITY, LONG_NAME};
use crate::error::{FsError, IoError};
use crate::fat::Link;
use crate::file::OpenFile;

/// Attribute bits that hide an entry from lookups and listings
const HIDDEN_ATTRS: u8 = 0x0E;
const SUBDIR: u8 = 0x10;
const ENTRY_SIZE: usize = 32;

/// Minimal FAT16/FAT32 view over a block device
///
/// Only short names are understood. Directory cluster 0 always means the
/// root directory, whichever way the volume stores it.
pub struct FileSystem<D> {
    dev: D,
    geometry: Geometry,
    cache: Block,
    cached: Option<u32>,
}

/// Scanner callback result
enum Visit<T> {
    Next,
    End,
    Found(T),
}

/// Slot sense lines, sampled without touching the block cache
impl <D: RemovableMedia> FileSystem<D> {
    pub fn media_present(&mut self) -> bool {
        self.dev.media_present()
    }

    pub fn write_protected(&mut self) -> bool {
        self.dev.write_protected()
    }
}

/// Position within a directory's blocks
enum DirCursor {
    Fixed { next: u32, end: u32 },
    Chain { cluster: u32, sector: u32 },
}

impl <D: BlockDevice> FileSystem<D> {
    pub fn new(dev: D, geometry: Geometry) -> Self {
        Self { dev, geometry, cache: [0u8; 512], cached: None }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Raw access to the card, the block cache is dropped
    pub fn device(&mut self) -> &mut D {
        self.cached = None;
        &mut self.dev
    }

    pub fn into_inner(self) -> D {
        self.dev
    }

    /// Fetch a block through the cache
    pub(crate) fn load(&mut self, block: u32) -> Result<&mut Block, IoError> {
        if self.cached != Some(block) {
            self.cached = None;
            self.dev.read_block(block, &mut self.cache)?;
            self.cached = Some(block);
        }
        Ok(&mut self.cache)
    }

    /// Read-modify-write a block through the cache
    pub(crate) fn modify<F: FnOnce(&mut Block)>(&mut self, block: u32, f: F) -> Result<(), IoError> {
        f(self.load(block)?);
        let r = self.dev.write_block(block, &self.cache);
        if r.is_err() {
            self.cached = None;
        }
        r
    }

    /// Write a whole block, keeping the cache coherent
    pub(crate) fn write_through(&mut self, block: u32, data: &Block) -> Result<(), IoError> {
        if self.cached == Some(block) {
            self.cached = None;
        }
        self.dev.write_block(block, data)
    }

    /// Read one 512-byte sector of an open file
    pub fn read_sector(&mut self, file: &mut OpenFile, sector: u32, out: &mut Block) -> Result<(), FsError> {
        let block = file.locate(self, sector)?;
        if self.cached == Some(block) {
            out.copy_from_slice(&self.cache);
            return Ok(());
        }
        self.dev.read_block(block, out)?;
        Ok(())
    }

    /// Write one 512-byte sector of an open file
    pub fn write_sector(&mut self, file: &mut OpenFile, sector: u32, data: &Block) -> Result<(), FsError> {
        if file.protect {
            return Err(FsError::WriteProtected);
        }
        let block = file.locate(self, sector)?;
        self.write_through(block, data)?;
        file.written = true;
        Ok(())
    }

    /// Find the most recently modified entry in directory `dir` matching an
    /// optional 8 byte name and any of `exts` (every extension when empty)
    pub fn open(&mut self, dir: u32, name: Option<&[u8; 8]>, exts: &[[u8; 3]]) -> Result<OpenFile, FsError> {
        let mut best: Option<DirectoryEntry> = None;

        self.scan::<(), _>(dir, |_, _, raw| {
            match raw[0] {
                END_OF_DIR => return Visit::End,
                b'.' | DELETED => return Visit::Next,
                _ => (),
            }

            let attr = raw[11];
            if attr == LONG_NAME || attr & HIDDEN_ATTRS != 0 {
                return Visit::Next;
            }
            if let Some(n) = name {
                if raw[..8] != n[..] {
                    return Visit::Next;
                }
            }
            if !exts.is_empty() && !exts.iter().any(|e| raw[8..11] == e[..]) {
                return Visit::Next;
            }

            if let Ok(e) = DirectoryEntry::read(raw) {
                // Later entries win ties
                if best.map_or(true, |b| e.modified() >= b.modified()) {
                    best = Some(e);
                }
            }
            Visit::Next
        })?;

        let entry = best.ok_or(FsError::NotFound)?;
        crate::debug!("Open {:?} at cluster {}", entry.short_name(), entry.first_cluster());

        OpenFile::from_entry(self, dir, &entry)
    }

    /// Resolve a path from the root, one directory level per segment
    pub fn open_path(&mut self, path: &ImagePath) -> Result<OpenFile, FsError> {
        let (last, dirs) = path.segments().split_last().ok_or(FsError::NotFound)?;
        let dir = self.resolve_dirs(dirs)?;
        self.open(dir, Some(&last.stem()), &[last.ext()])
    }

    /// Directory cluster of a path, 0 for the root
    pub fn open_dir(&mut self, path: &ImagePath) -> Result<u32, FsError> {
        self.resolve_dirs(path.segments())
    }

    /// Create a file entry of `length` bytes and allocate its clusters
    ///
    /// The directory is extended by one zeroed cluster when it has no free
    /// slot, which the fixed FAT16 root cannot do.
    pub fn create(&mut self, dir: u32, name: &ShortName, length: u32) -> Result<(), FsError> {
        let (block, offset) = loop {
            let free = self.scan(dir, |block, offset, raw| {
                if (raw[0] == DELETED || raw[0] == END_OF_DIR) && raw[11] != LONG_NAME {
                    Visit::Found((block, offset))
                } else {
                    Visit::Next
                }
            })?;
            if let Some(slot) = free {
                break slot;
            }

            if dir == 0 && self.geometry.width == FatWidth::Fat16 {
                return Err(FsError::DirectoryFull);
            }

            let tail = self.chain_tail(self.dir_start(dir))?;
            crate::debug!("Extending directory {} after cluster {}", dir, tail);
            match self.allocate_chain(Link::Cluster(tail), 1, true) {
                Err(FsError::OutOfSpace) => return Err(FsError::DirectoryFull),
                r => r?,
            };
        };

        let mut raw = [0u8; ENTRY_SIZE];
        DirectoryEntry::new(name, length).write(&mut raw)?;
        self.modify(block, |b| b[offset..offset + ENTRY_SIZE].copy_from_slice(&raw))?;

        let clusters = self.geometry.clusters_for(length);
        self.allocate_chain(Link::Entry { block, offset }, clusters, false)?;

        crate::info!("Created {:?}, {} bytes in {} clusters", name, length, clusters);

        Ok(())
    }

    /// Create a file at a path whose directories already exist
    pub fn create_path(&mut self, path: &ImagePath, length: u32) -> Result<(), FsError> {
        let (last, dirs) = path.segments().split_last().ok_or(FsError::InvalidName)?;
        let dir = self.resolve_dirs(dirs)?;
        self.create(dir, last, length)
    }

    /// Sorted listing of subdirectories and files matching `exts`, led by
    /// the unmount sentinel
    pub fn list(&mut self, dir: u32, exts: &[[u8; 3]]) -> Result<heapless::Vec<FileListEntry, LIST_CAPACITY>, FsError> {
        let mut out: heapless::Vec<FileListEntry, LIST_CAPACITY> = heapless::Vec::new();
        let _ = out.push(FileListEntry::UNMOUNT);

        self.scan::<(), _>(dir, |block, offset, raw| {
            match raw[0] {
                END_OF_DIR => return Visit::End,
                DELETED => return Visit::Next,
                b'.' if raw[1] != b'.' => return Visit::Next,
                _ => (),
            }

            let attr = raw[11];
            if attr & HIDDEN_ATTRS != 0 {
                return Visit::Next;
            }
            let is_dir = attr & SUBDIR != 0;
            if !is_dir && !exts.iter().any(|e| raw[8..11] == e[..]) {
                return Visit::Next;
            }

            let e = match DirectoryEntry::read(raw) {
                Ok(e) => e,
                Err(_) => return Visit::Next,
            };
            let row = FileListEntry {
                block,
                offset: offset as u16,
                name: e.short_name(),
                is_dir,
                start_cluster: e.first_cluster(),
            };

            match out.push(row) {
                Ok(()) if !out.is_full() => Visit::Next,
                _ => Visit::End,
            }
        })?;

        comb_sort(&mut out[1..], |a, b| a.name.cmp(&b.name));

        Ok(out)
    }

    /// Re-read the directory entry behind a listing row
    pub fn entry(&mut self, row: &FileListEntry) -> Result<DirectoryEntry, FsError> {
        if row.is_unmount() {
            return Err(FsError::NotFound);
        }
        let offset = row.offset as usize;
        let b = self.load(row.block)?;
        DirectoryEntry::read(&b[offset..offset + ENTRY_SIZE])
    }

    fn resolve_dirs(&mut self, dirs: &[ShortName]) -> Result<u32, FsError> {
        let mut dir = 0;
        for name in dirs {
            let d = self.open(dir, Some(&name.stem()), &[name.ext()])?;
            if !d.is_dir {
                return Err(FsError::NotADirectory);
            }
            dir = d.start_cluster;
        }
        Ok(dir)
    }

    /// First cluster of a directory's chain
    fn dir_start(&self, dir: u32) -> u32 {
        match dir {
            0 => self.geometry.root_cluster,
            c => c,
        }
    }

    fn cursor(&self, dir: u32) -> DirCursor {
        match (dir, self.geometry.width) {
            (0, FatWidth::Fat16) => DirCursor::Fixed {
                next: self.geometry.root_start,
                end: self.geometry.root_start + self.geometry.root_sectors,
            },
            _ => DirCursor::Chain { cluster: self.dir_start(dir), sector: 0 },
        }
    }

    fn next_dir_block(&mut self, cursor: &mut DirCursor) -> Result<Option<u32>, FsError> {
        match *cursor {
            DirCursor::Fixed { next, end } => {
                if next >= end {
                    return Ok(None);
                }
                *cursor = DirCursor::Fixed { next: next + 1, end };
                Ok(Some(next))
            },
            DirCursor::Chain { cluster, sector } => {
                let spc = self.geometry.sectors_per_cluster as u32;
                let (cluster, sector) = if sector < spc {
                    (cluster, sector)
                } else {
                    match self.next_cluster(cluster)? {
                        Some(c) => (c, 0),
                        None => return Ok(None),
                    }
                };
                if cluster < 2 || cluster > self.geometry.last_cluster() {
                    return Ok(None);
                }
                *cursor = DirCursor::Chain { cluster, sector: sector + 1 };
                Ok(Some(self.geometry.cluster_block(cluster) + sector))
            },
        }
    }

    /// Visit every 32-byte slot of a directory in on-disk order
    fn scan<T, F>(&mut self, dir: u32, mut visit: F) -> Result<Option<T>, FsError>
    where
        F: FnMut(u32, usize, &[u8]) -> Visit<T>,
    {
        let mut cursor = self.cursor(dir);

        while let Some(block) = self.next_dir_block(&mut cursor)? {
            let data = *self.load(block)?;

            for (i, raw) in data.chunks_exact(ENTRY_SIZE).enumerate() {
                match visit(block, i * ENTRY_SIZE, raw) {
                    Visit::Next => (),
                    Visit::End => return Ok(None),
                    Visit::Found(t) => return Ok(Some(t)),
                }
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn open_by_name_and_extension() {
        init_logger();
        let mut fs = mount(fat16_disk(&[
            ("GAME.DSK", &pattern(143_360, 1)),
            ("NOTES.TXT", &pattern(10, 2)),
        ]));

        let f = fs.open(0, Some(b"GAME    "), &[*b"DSK"]).unwrap();
        assert_eq!(f.length, 143_360);
        assert!(!f.is_dir);
        assert!(!f.protect);

        assert_eq!(fs.open(0, Some(b"GAME    "), &[*b"PO "]), Err(FsError::NotFound));
        assert_eq!(fs.open(0, Some(b"MISSING "), &[*b"DSK"]), Err(FsError::NotFound));
    }

    #[test]
    fn open_is_idempotent() {
        let mut fs = mount(fat16_disk(&[("GAME.DSK", &pattern(143_360, 1))]));
        let a = fs.open(0, Some(b"GAME    "), &[*b"DSK"]).unwrap();
        let b = fs.open(0, Some(b"GAME    "), &[*b"DSK"]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn read_sectors_match_file() {
        let data = pattern(10_000, 7);
        let mut fs = mount(fat16_disk(&[("DATA.PO", &data)]));
        let mut f = fs.open_path(&ImagePath::parse("DATA.PO").unwrap()).unwrap();

        let mut block = [0u8; 512];
        for s in [0u32, 5, 1, 19, 3] {
            fs.read_sector(&mut f, s, &mut block).unwrap();
            let start = s as usize * 512;
            let end = (start + 512).min(data.len());
            assert_eq!(&block[..end - start], &data[start..end]);
        }

        assert_eq!(fs.read_sector(&mut f, 20, &mut block), Err(FsError::Invalid));
    }

    #[test]
    fn subdirectory_paths() {
        let data = pattern(2048, 3);
        let mut fs = mount(fat16_disk(&[
            ("IMAGES/", &[]),
            ("IMAGES/GAME.PO", &data),
        ]));

        let mut f = fs.open_path(&ImagePath::parse("IMAGES/GAME.PO").unwrap()).unwrap();
        let mut block = [0u8; 512];
        fs.read_sector(&mut f, 3, &mut block).unwrap();
        assert_eq!(&block[..], &data[1536..2048]);

        assert_eq!(
            fs.open_path(&ImagePath::parse("NOPE/GAME.PO").unwrap()),
            Err(FsError::NotFound)
        );
    }

    #[test]
    fn list_sorts_and_leads_with_unmount() {
        let mut fs = mount(fat16_disk(&[
            ("ZORK.DSK", &[1]),
            ("APPLE.DSK", &[2]),
            ("README.TXT", &[3]),
            ("MIDDLE.DO", &[4]),
            ("GAMES/", &[]),
        ]));

        let l = fs.list(0, &[*b"DSK", *b"DO "]).unwrap();
        let names: std::vec::Vec<[u8; 11]> = l.iter().map(|e| e.name.0).collect();
        assert_eq!(names, vec![
            *b"UNMOUNT    ",
            *b"APPLE   DSK",
            *b"GAMES      ",
            *b"MIDDLE  DO ",
            *b"ZORK    DSK",
        ]);
        assert!(l[0].is_unmount());
        assert!(l[2].is_dir);

        let e = fs.entry(&l[1]).unwrap();
        assert_eq!(e.size, 1);
        assert_eq!(fs.entry(&l[0]), Err(FsError::NotFound));
    }

    #[test]
    fn list_includes_parent_but_not_self() {
        let mut fs = mount(fat16_disk(&[
            ("SUB/", &[]),
            ("SUB/A.PO", &[1, 2, 3]),
        ]));
        let sub = fs.open(0, Some(b"SUB     "), &[]).unwrap();
        assert!(sub.is_dir);

        let l = fs.list(sub.start_cluster, &[*b"PO "]).unwrap();
        let names: std::vec::Vec<[u8; 11]> = l.iter().map(|e| e.name.0).collect();
        assert_eq!(names, vec![*b"UNMOUNT    ", *b"..         ", *b"A       PO "]);
        assert_eq!(l[1].start_cluster, 0);
    }

    #[test]
    fn list_caps_entries() {
        let names: std::vec::Vec<std::string::String> = (0..200).map(|i| format!("F{:03}.DSK", i)).collect();
        let entries: std::vec::Vec<(&str, &[u8])> = names.iter().map(|n| (n.as_str(), &[0u8][..])).collect();

        let mut fs = mount(MemDisk::from_image(format_image(4 * 1024 * 1024, fatfs::FatType::Fat16, &entries)));
        let l = fs.list(0, &[*b"DSK"]).unwrap();
        assert_eq!(l.len(), LIST_CAPACITY);
        assert!(l[0].is_unmount());
        assert!(l[1..].windows(2).all(|w| w[0].name <= w[1].name));
    }

    #[test]
    fn create_then_open_and_write() {
        let mut fs = mount(fat16_disk(&[("GAME.DSK", &pattern(4096, 1))]));
        let path = ImagePath::parse("GAME.NIC").unwrap();

        fs.create_path(&path, 286_720).unwrap();
        let mut f = fs.open_path(&path).unwrap();
        assert_eq!(f.length, 286_720);
        assert_eq!(f.index.clusters(), 560);

        let data = [0x5Au8; 512];
        fs.write_sector(&mut f, 559, &data).unwrap();
        let mut back = [0u8; 512];
        fs.read_sector(&mut f, 559, &mut back).unwrap();
        assert_eq!(back, data);
        assert!(f.written);

        // Existing file untouched
        let mut g = fs.open_path(&ImagePath::parse("GAME.DSK").unwrap()).unwrap();
        fs.read_sector(&mut g, 7, &mut back).unwrap();
        assert_eq!(&back[..], &pattern(4096, 1)[3584..]);
    }

    #[test]
    fn create_zero_length_allocates_nothing() {
        let mut fs = mount(fat16_disk(&[]));
        let before = fs.device().writes.len();
        fs.create(0, &ShortName::parse("EMPTY.PO").unwrap(), 0).unwrap();
        assert_eq!(fs.device().writes.len(), before + 1);

        let f = fs.open(0, Some(b"EMPTY   "), &[*b"PO "]).unwrap();
        assert_eq!(f.start_cluster, 0);
        assert_eq!(f.length, 0);
    }

    #[test]
    fn fixed_root_fills_up() {
        let mut fs = mount(fat16_disk(&[]));
        let entries = fs.geometry().root_sectors * 16;

        // Formatting may have left a volume label in the first slot
        let mut created = 0;
        for i in 0..=entries {
            let name = ShortName::parse(&format!("F{}.PO", i)).unwrap();
            match fs.create(0, &name, 0) {
                Ok(()) => created += 1,
                Err(e) => {
                    assert_eq!(e, FsError::DirectoryFull);
                    break;
                },
            }
        }
        assert!(created == entries || created == entries - 1, "created {}", created);

        let name = ShortName::parse("LAST.PO").unwrap();
        assert_eq!(fs.create(0, &name, 0), Err(FsError::DirectoryFull));
    }

    #[test]
    fn subdirectory_grows_when_full() {
        let mut fs = mount(fat16_disk(&[("SUB/", &[])]));
        let sub = fs.open(0, Some(b"SUB     "), &[]).unwrap();

        // One block per cluster, 16 slots, two taken by '.' and '..'
        for i in 0..20 {
            let name = ShortName::parse(&format!("F{}.PO", i)).unwrap();
            fs.create(sub.start_cluster, &name, 0).unwrap();
        }

        let l = fs.list(sub.start_cluster, &[*b"PO "]).unwrap();
        assert_eq!(l.len(), 1 + 1 + 20);
        assert!(fs.next_cluster(sub.start_cluster).unwrap().is_some());
    }

    #[test]
    fn newest_entry_wins() {
        let mut fs = mount(fat16_disk(&[("A.DSK", &[1]), ("B.DSK", &[2, 2])]));

        // Stamp B newer than A
        let l = fs.list(0, &[*b"DSK"]).unwrap();
        let (a, b) = (l[1], l[2]);
        fs.modify(a.block, |blk| {
            let o = a.offset as usize;
            blk[o + 24..o + 26].copy_from_slice(&0x4000u16.to_le_bytes());
        }).unwrap();
        fs.modify(b.block, |blk| {
            let o = b.offset as usize;
            blk[o + 24..o + 26].copy_from_slice(&0x5000u16.to_le_bytes());
        }).unwrap();

        let f = fs.open(0, None, &[*b"DSK"]).unwrap();
        assert_eq!(f.name.0, *b"B       DSK");
        assert_eq!(f.length, 2);
    }

    #[test]
    fn sense_lines_keep_cache() {
        let mut fs = mount(fat16_disk(&[("GAME.DSK", &[1])]));
        let root = fs.geometry().root_start;
        fs.load(root).unwrap();

        assert!(fs.media_present());
        assert!(!fs.write_protected());
        assert_eq!(fs.cached, Some(root));

        fs.device().write_protect = true;
        assert_eq!(fs.cached, None);
        assert!(fs.write_protected());
    }

    #[test]
    fn open_entry_near_size_limit() {
        let data = pattern(2048, 5);
        let mut fs = mount(fat16_disk(&[("BIG.PO", &data)]));

        let l = fs.list(0, &[*b"PO "]).unwrap();
        let big = l[1];
        fs.modify(big.block, |blk| {
            let o = big.offset as usize;
            blk[o + 28..o + 32].copy_from_slice(&0xFFFF_FFF0u32.to_le_bytes());
        }).unwrap();

        let mut f = fs.open(0, Some(b"BIG     "), &[*b"PO "]).unwrap();
        assert_eq!(f.length, 0xFFFF_FFF0);
        assert_eq!(f.sectors(), 0x0080_0000);
        assert_eq!(f.index().clusters(), 0x0080_0000);
        assert_eq!(crate::smartport::image_blocks(&f), 0x0080_0000);

        let mut block = [0u8; 512];
        fs.read_sector(&mut f, 2, &mut block).unwrap();
        assert_eq!(&block[..], &data[1024..1536]);
    }
}
