//! In-memory cards and fatfs formatted images for unit tests

use std::collections::VecDeque;
use std::io::{Cursor, Write};
use std::vec::Vec;

use simplelog::{LevelFilter, Config as LogConfig};
use fatfs::{FatType, FormatVolumeOptions, FsOptions};

use crate::{Block, BlockDevice, Geometry, HostBus, Irq, IoError, RemovableMedia, FileSystem, BLOCK_SIZE};

pub fn init_logger() {
    let _ = simplelog::TermLogger::init(LevelFilter::Info, LogConfig::default(), simplelog::TerminalMode::Mixed, simplelog::ColorChoice::Auto);
}

/// Card backed by a byte vector, recording every block written
pub struct MemDisk {
    pub data: Vec<u8>,
    pub writes: Vec<u32>,
    pub write_protect: bool,
    pub present: bool,
    geometry: Option<Geometry>,
}

impl MemDisk {
    pub fn new(blocks: usize) -> Self {
        Self::from_image(vec![0u8; blocks * BLOCK_SIZE])
    }

    pub fn from_image(data: Vec<u8>) -> Self {
        Self { data, writes: Vec::new(), write_protect: false, present: true, geometry: None }
    }

    pub fn block(&self, index: u32) -> &[u8] {
        &self.data[index as usize * BLOCK_SIZE..][..BLOCK_SIZE]
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&mut self, index: u32, block: &mut Block) -> Result<(), IoError> {
        if !self.present {
            return Err(IoError::Ejected);
        }
        let start = index as usize * BLOCK_SIZE;
        let src = self.data.get(start..start + BLOCK_SIZE).ok_or(IoError::Timeout)?;
        block.copy_from_slice(src);
        Ok(())
    }

    fn write_block(&mut self, index: u32, block: &Block) -> Result<(), IoError> {
        if !self.present {
            return Err(IoError::Ejected);
        }
        let start = index as usize * BLOCK_SIZE;
        let dst = self.data.get_mut(start..start + BLOCK_SIZE).ok_or(IoError::Timeout)?;
        dst.copy_from_slice(block);
        self.writes.push(index);
        Ok(())
    }
}

impl RemovableMedia for MemDisk {
    fn detect(&mut self, force: bool) -> bool {
        if !force && self.geometry.is_some() && self.present {
            return false;
        }
        self.geometry = Geometry::detect(self, true).ok();
        self.geometry.is_some()
    }

    fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }

    fn write_protected(&mut self) -> bool {
        self.write_protect
    }

    fn media_present(&mut self) -> bool {
        self.present
    }
}

/// Format an image and populate it, entries ending in '/' are directories
pub fn format_image(bytes: usize, fat_type: FatType, entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut cursor = Cursor::new(vec![0u8; bytes]);

    let opts = FormatVolumeOptions::new()
        .bytes_per_cluster(512)
        .fat_type(fat_type);
    fatfs::format_volume(&mut cursor, opts).unwrap();

    {
        let fs = fatfs::FileSystem::new(&mut cursor, FsOptions::new()).unwrap();
        let root = fs.root_dir();

        for (path, data) in entries {
            if let Some(dir) = path.strip_suffix('/') {
                root.create_dir(dir).unwrap();
            } else {
                let mut f = root.create_file(path).unwrap();
                f.write_all(data).unwrap();
            }
        }
    }

    cursor.into_inner()
}

/// Small FAT16 card (4 MiB, one block per cluster)
pub fn fat16_disk(entries: &[(&str, &[u8])]) -> MemDisk {
    MemDisk::from_image(format_image(4 * 1024 * 1024, FatType::Fat16, entries))
}

pub fn mount(mut disk: MemDisk) -> FileSystem<MemDisk> {
    let geometry = Geometry::detect(&mut disk, true).unwrap();
    FileSystem::new(disk, geometry)
}

/// Deterministic payload for content checks
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Host bus fed from a byte script, the clock advances on every read
pub struct ScriptBus {
    pub phases: u8,
    pub enabled: [bool; 2],
    pub req: bool,
    pub ack: bool,
    pub write_protect: bool,
    pub read_data: Vec<bool>,
    pub inbound: VecDeque<u8>,
    pub outbound: Vec<u8>,
    pub suspended: Vec<Irq>,
    pub now: u32,
}

impl ScriptBus {
    pub fn new() -> Self {
        Self {
            phases: 0,
            enabled: [false; 2],
            req: true,
            ack: false,
            write_protect: false,
            read_data: Vec::new(),
            inbound: VecDeque::new(),
            outbound: Vec::new(),
            suspended: Vec::new(),
            now: 0,
        }
    }
}

impl HostBus for ScriptBus {
    fn phases(&mut self) -> u8 {
        self.phases
    }

    fn drive_enabled(&mut self, drive: usize) -> bool {
        self.enabled[drive]
    }

    fn set_read_data(&mut self, level: bool) {
        self.read_data.push(level);
    }

    fn set_write_protect(&mut self, protected: bool) {
        self.write_protect = protected;
    }

    fn req(&mut self) -> bool {
        self.req
    }

    fn set_ack(&mut self, high: bool) {
        self.ack = high;
    }

    fn recv_byte(&mut self) -> Option<u8> {
        self.inbound.pop_front()
    }

    fn send_byte(&mut self, byte: u8) {
        self.outbound.push(byte);
    }

    fn micros(&mut self) -> u32 {
        self.now = self.now.wrapping_add(10);
        self.now
    }

    fn suspend(&mut self, irq: Irq) {
        self.suspended.push(irq);
    }

    fn resume(&mut self, irq: Irq) {
        self.suspended.retain(|i| *i != irq);
    }
}

/// Erased non-volatile memory
pub struct MemStorage {
    pub cells: [u8; 64],
    pub writes: usize,
}

impl MemStorage {
    pub fn new() -> Self {
        Self { cells: [0xFF; 64], writes: 0 }
    }
}

impl embedded_storage::ReadStorage for MemStorage {
    type Error = ();

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), ()> {
        let src = self.cells.get(offset as usize..offset as usize + bytes.len()).ok_or(())?;
        bytes.copy_from_slice(src);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.cells.len()
    }
}

impl embedded_storage::Storage for MemStorage {
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), ()> {
        let dst = self.cells.get_mut(offset as usize..offset as usize + bytes.len()).ok_or(())?;
        dst.copy_from_slice(bytes);
        self.writes += 1;
        Ok(())
    }
}
