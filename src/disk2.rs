//! Disk II floppy drive emulation
//!
//! The host sees a spinning disk: nibble sectors of the mounted `.NIC` image
//! are shifted out one bit per [`Disk2::tick`], the head follows the stepper
//! phase lines, and bytes written by the host are gathered into a small
//! batch of sector slots that is flushed to the image as a group.

use crate::block::{Block, BlockDevice};
use crate::error::FsError;
use crate::file::OpenFile;
use crate::fs::FileSystem;
use crate::gcr::{self, DATA_FIELD, DATA_FIELD_LEN, NIBBLE_SECTOR, STREAM_LEN};

/// Drives on one controller
pub const DRIVES: usize = 2;
/// Upper bound on buffered sector writes
pub const MAX_WRITE_SLOTS: usize = 5;
/// Bytes captured per write slot
pub const SLOT_LEN: usize = 350;
/// Sectors per track
pub const SECTORS: u8 = 16;

/// Signed 4-bit head deltas indexed by (phase offset + position) / 2,
/// odd offsets use the low nibble
pub const STEPPER: [u8; 4] = [0x0F, 0xED, 0x03, 0x21];
/// Head position at power on, in quarter tracks
pub const INITIAL_POSITION: u8 = 70;
/// Last reachable head position
pub const MAX_POSITION: u8 = 139;
/// Positions above this are a step below zero that wrapped
const WRAPPED_POSITION: u8 = 196;

/// Nibble stream progress
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature="defmt", derive(defmt::Format))]
pub enum StreamState {
    /// No sector loaded yet
    Idle,
    /// Next sector must be loaded from the image
    Preparing,
    /// Bits are being shifted to the host
    Streaming,
    /// Host write in progress, the read stream is paused
    Buffering,
}

/// Destination of a buffered write
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature="defmt", derive(defmt::Format))]
pub struct SectorTag {
    pub track: u8,
    pub sector: u8,
}

#[derive(Debug)]
struct Drive {
    image: Option<OpenFile>,
    position: u8,
}

/// Two-drive Disk II controller state
pub struct Disk2 {
    drives: [Drive; DRIVES],
    current: usize,
    state: StreamState,
    /// State to return to once a write burst is committed
    resume: StreamState,
    sector: u8,
    prev_phase: u8,
    volume: u8,

    formatting: bool,
    format_sector: u8,

    stream: [u8; STREAM_LEN],
    pos: usize,
    mask: u8,

    slots: [[u8; SLOT_LEN]; MAX_WRITE_SLOTS],
    tags: [Option<SectorTag>; MAX_WRITE_SLOTS],
    depth: usize,
    active: usize,
    fill: usize,
    capturing: bool,
    commit_pending: bool,
}

impl Disk2 {
    /// `depth` write slots (1..=5) are filled before a batch is flushed
    pub fn new(volume: u8, depth: usize, positions: [u8; DRIVES]) -> Self {
        Self {
            drives: [
                Drive { image: None, position: clamp_position(positions[0]) },
                Drive { image: None, position: clamp_position(positions[1]) },
            ],
            current: 0,
            state: StreamState::Idle,
            resume: StreamState::Idle,
            sector: 0,
            prev_phase: 0,
            volume,
            formatting: false,
            format_sector: 0,
            stream: [0xFF; STREAM_LEN],
            pos: 0,
            mask: 0x80,
            slots: [[0u8; SLOT_LEN]; MAX_WRITE_SLOTS],
            tags: [None; MAX_WRITE_SLOTS],
            depth: depth.clamp(1, MAX_WRITE_SLOTS),
            active: 0,
            fill: 0,
            capturing: false,
            commit_pending: false,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn current_drive(&self) -> usize {
        self.current
    }

    /// Sector most recently loaded into the stream
    pub fn sector(&self) -> u8 {
        self.sector
    }

    /// Head position of a drive in quarter tracks
    pub fn position(&self, drive: usize) -> u8 {
        self.drives[drive].position
    }

    /// Track under the head of the selected drive
    pub fn track(&self) -> u8 {
        self.drives[self.current].position >> 2
    }

    pub fn image(&self, drive: usize) -> Option<&OpenFile> {
        self.drives[drive].image.as_ref()
    }

    pub fn image_mut(&mut self, drive: usize) -> Option<&mut OpenFile> {
        self.drives[drive].image.as_mut()
    }

    /// Attach a `.NIC` image, restarting the stream when the drive is selected
    pub fn mount(&mut self, drive: usize, image: OpenFile) {
        crate::info!("Drive {} mounted {:?}", drive + 1, image.name);
        self.drives[drive].image = Some(image);
        if drive == self.current {
            self.state = StreamState::Preparing;
        }
    }

    pub fn unmount(&mut self, drive: usize) -> Option<OpenFile> {
        if drive == self.current {
            self.clear_buffer();
            self.state = StreamState::Idle;
        }
        self.drives[drive].image.take()
    }

    /// Switch the selected drive, pending writes belong to the old one
    /// and must be flushed by the caller first
    pub fn select(&mut self, drive: usize) {
        if drive != self.current && drive < DRIVES {
            crate::debug!("Drive {} selected", drive + 1);
            self.current = drive;
            self.state = StreamState::Preparing;
        }
    }

    /// Move the head of the selected drive on a stepper phase change
    ///
    /// Only single-phase patterns move the head; anything else just
    /// records the new phase.
    pub fn advance_head(&mut self, phase: u8) {
        if phase == self.prev_phase {
            return;
        }
        self.prev_phase = phase;

        let offset = match phase {
            0b1000 => 2,
            0b0100 => 4,
            0b0010 => 6,
            0b0001 => 0,
            _ => return,
        };

        let drive = &mut self.drives[self.current];
        let index = (offset + drive.position) & 7;
        let packed = STEPPER[(index >> 1) as usize];
        let nibble = if index & 1 == 1 { packed & 0x0F } else { packed >> 4 };
        let delta = ((nibble << 4) as i8) >> 4;

        let mut next = drive.position.wrapping_add(delta as u8);
        if next > WRAPPED_POSITION {
            next = 0;
        }
        if next > MAX_POSITION {
            next = MAX_POSITION;
        }

        if next != drive.position {
            crate::trace!("Head {} -> {}", drive.position, next);
            drive.position = next;
        }
    }

    /// Advance to the next sector and load it into the stream
    ///
    /// A buffered write aimed at the sector about to be read is flushed
    /// first so the host reads back its own data.
    pub fn prepare_sector<D: BlockDevice>(&mut self, fs: &mut FileSystem<D>) -> Result<(), FsError> {
        self.sector = (self.sector + 1) & 0x0F;
        let track = self.track();

        let target = SectorTag { track, sector: self.sector };
        if self.tags[..self.depth].iter().any(|t| *t == Some(target)) {
            self.flush_writes(fs)?;
        }

        let image = match self.drives[self.current].image.as_mut() {
            Some(f) if f.is_valid() => f,
            _ => {
                self.state = StreamState::Idle;
                return Ok(());
            },
        };

        let mut block: Block = [0u8; NIBBLE_SECTOR];
        fs.read_sector(image, nic_sector(track, self.sector), &mut block)?;

        self.stream.copy_from_slice(&block[..STREAM_LEN]);
        self.pos = 0;
        self.mask = 0x80;
        self.state = StreamState::Streaming;

        Ok(())
    }

    /// Next bit of the read stream, `None` when nothing is streaming
    pub fn tick(&mut self) -> Option<bool> {
        if self.state != StreamState::Streaming {
            return None;
        }

        let bit = self.stream[self.pos] & self.mask != 0;
        self.mask >>= 1;
        if self.mask == 0 {
            self.mask = 0x80;
            self.pos += 1;
            if self.pos == STREAM_LEN {
                self.state = StreamState::Preparing;
            }
        }

        Some(bit)
    }

    /// Capture one byte written by the host
    ///
    /// Sync bytes ahead of the first prologue byte are dropped. A full slot
    /// is committed on the next [`Disk2::commit_write`].
    pub fn accumulate_write_byte(&mut self, byte: u8) {
        if !self.capturing {
            if byte != gcr::DATA_PROLOGUE[0] {
                return;
            }
            self.capturing = true;
            self.fill = 0;
            if self.state != StreamState::Buffering {
                self.resume = self.state;
            }
            self.state = StreamState::Buffering;
        }

        if self.fill < SLOT_LEN {
            self.slots[self.active][self.fill] = byte;
            self.fill += 1;
        }
        if self.fill == SLOT_LEN {
            self.commit_pending = true;
        }
    }

    /// Host released the write request
    pub fn end_write(&mut self) {
        if self.capturing {
            self.capturing = false;
            self.commit_pending = true;
        }
    }

    pub fn commit_pending(&self) -> bool {
        self.commit_pending
    }

    /// Inspect the active slot after a write burst
    ///
    /// A data field is tagged with the current sector and track and the
    /// sector counter skips ahead to match the host's interleave. An address
    /// field resynchronises the sector counter during formatting.
    pub fn commit_write<D: BlockDevice>(&mut self, fs: &mut FileSystem<D>) -> Result<(), FsError> {
        self.commit_pending = false;
        self.capturing = false;

        let marker = self.slots[self.active][2];
        let mut result = Ok(());

        if marker == gcr::DATA_PROLOGUE[2] {
            if self.formatting {
                self.sector = self.format_sector;
                self.formatting = false;
            } else {
                let tag = SectorTag { track: self.track(), sector: self.sector };
                crate::debug!("Write buffered for T{} S{} in slot {}", tag.track, tag.sector, self.active);
                self.tags[self.active] = Some(tag);

                self.sector = skew(self.sector);

                if self.active + 1 >= self.depth {
                    result = self.flush_writes(fs);
                } else {
                    self.active += 1;
                }
            }
        } else if marker == gcr::ADDRESS_PROLOGUE[2] {
            let slot = &self.slots[self.active];
            self.format_sector = gcr::from_odd_even(slot[7], slot[8]);
            self.formatting = true;
            crate::debug!("Format resync to sector {}", self.format_sector);
        }

        if self.state == StreamState::Buffering {
            self.state = self.resume;
        }

        result
    }

    pub fn has_pending_writes(&self) -> bool {
        self.tags.iter().any(|t| t.is_some())
    }

    /// Write every tagged slot to the selected drive's image, then clear
    /// the batch whether or not the writes succeeded
    pub fn flush_writes<D: BlockDevice>(&mut self, fs: &mut FileSystem<D>) -> Result<(), FsError> {
        let mut result = Ok(());
        let volume = self.volume;

        if let Some(image) = self.drives[self.current].image.as_mut() {
            let mut block: Block = [0u8; NIBBLE_SECTOR];

            for (slot, tag) in self.slots.iter().zip(self.tags.iter()) {
                let tag = match tag {
                    Some(t) => t,
                    None => continue,
                };

                gcr::write_address_field(&mut block, volume, tag.track, tag.sector);
                block[DATA_FIELD..DATA_FIELD + DATA_FIELD_LEN].copy_from_slice(&slot[..DATA_FIELD_LEN]);
                gcr::write_trailer(&mut block);

                if let Err(e) = fs.write_sector(image, nic_sector(tag.track, tag.sector), &block) {
                    crate::warn!("Flush of T{} S{} failed: {:?}", tag.track, tag.sector, e);
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }

        self.clear_buffer();
        result
    }

    /// Drop every buffered write
    pub fn clear_buffer(&mut self) {
        for (slot, tag) in self.slots.iter_mut().zip(self.tags.iter_mut()) {
            slot[2] = 0;
            *tag = None;
        }
        self.active = 0;
        self.fill = 0;
    }

    /// Write-protect sense presented to the host
    pub fn write_protect_sense(&self, wp_line: bool, phase: u8) -> bool {
        let protected = self.drives[self.current].image.as_ref()
            .map_or(false, |f| f.is_valid() && f.protect);
        wp_line || protected || phase & 0b0010 != 0
    }
}

/// Sector counter advance after a buffered write
const fn skew(sector: u8) -> u8 {
    let step = if sector == 0x0F || sector == 0x0D { 2 } else { 1 };
    (sector + step) & 0x0F
}

/// Nibble image sector holding a track/sector pair
pub const fn nic_sector(track: u8, sector: u8) -> u32 {
    track as u32 * SECTORS as u32 + sector as u32
}

fn clamp_position(p: u8) -> u8 {
    if p > MAX_POSITION { INITIAL_POSITION } else { p }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use crate::ImagePath;
    use pretty_assertions::assert_eq;

    const NIC_LEN: u32 = 35 * 16 * 512;

    fn nic_fs() -> (FileSystem<MemDisk>, OpenFile) {
        init_logger();
        let mut fs = mount(fat16_disk(&[]));
        let path = ImagePath::parse("GAME.NIC").unwrap();
        fs.create_path(&path, NIC_LEN).unwrap();
        let f = fs.open_path(&path).unwrap();
        (fs, f)
    }

    fn data_field(fill: u8) -> [u8; SLOT_LEN] {
        let mut s = [fill; SLOT_LEN];
        s[..3].copy_from_slice(&gcr::DATA_PROLOGUE);
        s
    }

    fn host_write(d: &mut Disk2, bytes: &[u8]) {
        for b in [0xFF, 0xFF, 0xFF] {
            d.accumulate_write_byte(b);
        }
        for b in bytes {
            d.accumulate_write_byte(*b);
        }
        d.end_write();
    }

    #[test]
    fn stepper_moves_head() {
        let mut d = Disk2::new(0xFE, 5, [INITIAL_POSITION; 2]);

        d.advance_head(0b0010);
        assert_eq!(d.position(0), 70);
        d.advance_head(0b0001);
        assert_eq!(d.position(0), 72);

        // Repeated phase is ignored
        d.advance_head(0b0001);
        assert_eq!(d.position(0), 72);

        // Two phases at once never move the head
        d.advance_head(0b0011);
        assert_eq!(d.position(0), 72);
        assert_eq!(d.position(1), 70);
    }

    #[test]
    fn stepper_clamps_at_both_ends() {
        let mut d = Disk2::new(0xFE, 5, [0, MAX_POSITION]);

        // Stepping outwards from zero wraps and is pulled back to zero
        for p in [0b0001, 0b1000, 0b0100, 0b0010, 0b0001, 0b1000] {
            d.advance_head(p);
            assert!(d.position(0) <= MAX_POSITION);
        }
        assert_eq!(d.position(0), 0);

        d.select(1);
        for _ in 0..10 {
            for p in [0b0001, 0b0010, 0b0100, 0b1000] {
                d.advance_head(p);
                assert!(d.position(1) <= MAX_POSITION);
            }
        }
        assert_eq!(d.position(1), MAX_POSITION);
    }

    #[test]
    fn streams_the_sector_bits() {
        let (mut fs, mut f) = nic_fs();

        let raw = [0x42u8; 256];
        let mut sector = [0u8; 512];
        gcr::encode_sector(&mut sector, 0xFE, 17, 1, &raw);
        fs.write_sector(&mut f, nic_sector(17, 1), &sector).unwrap();

        let mut d = Disk2::new(0xFE, 5, [INITIAL_POSITION; 2]);
        d.mount(0, f);
        assert_eq!(d.state(), StreamState::Preparing);

        d.prepare_sector(&mut fs).unwrap();
        assert_eq!(d.sector(), 1);
        assert_eq!(d.state(), StreamState::Streaming);

        let mut bytes = std::vec::Vec::new();
        let mut byte = 0u8;
        for i in 0..STREAM_LEN * 8 {
            byte = byte << 1 | d.tick().unwrap() as u8;
            if i % 8 == 7 {
                bytes.push(byte);
            }
        }
        assert_eq!(&bytes[..], &sector[..STREAM_LEN]);
        assert_eq!(d.state(), StreamState::Preparing);
        assert_eq!(d.tick(), None);
    }

    #[test]
    fn write_batch_keeps_last_write_per_sector() {
        let (mut fs, f) = nic_fs();
        let mut d = Disk2::new(0xFE, 5, [INITIAL_POSITION; 2]);
        d.mount(0, f);
        d.prepare_sector(&mut fs).unwrap();

        let order = [3u8, 7, 3, 9, 11];
        for (i, s) in order.iter().enumerate() {
            d.sector = *s;
            host_write(&mut d, &data_field(i as u8 + 1));
            assert!(d.commit_pending());
            d.commit_write(&mut fs).unwrap();
        }

        // Fifth commit fills the batch and flushes it
        assert!(!d.has_pending_writes());

        let track = d.track();
        let mut f = d.unmount(0).unwrap();
        let mut block = [0u8; 512];
        for (s, fill) in [(3u8, 3u8), (7, 2), (9, 4), (11, 5)] {
            fs.read_sector(&mut f, nic_sector(track, s), &mut block).unwrap();
            assert_eq!(&block[53..56], &gcr::DATA_PROLOGUE);
            assert!(block[56..402].iter().all(|b| *b == fill), "sector {}", s);
            assert_eq!(gcr::from_odd_even(block[41], block[42]), s);
            assert_eq!(gcr::from_odd_even(block[39], block[40]), track);
        }

        // Untouched sectors stay zeroed
        fs.read_sector(&mut f, nic_sector(track, 4), &mut block).unwrap();
        assert!(block.iter().all(|b| *b == 0));
    }

    #[test]
    fn commit_skews_sector_counter() {
        let (mut fs, f) = nic_fs();
        let mut d = Disk2::new(0xFE, 5, [INITIAL_POSITION; 2]);
        d.mount(0, f);

        for (from, to) in [(0x0Fu8, 0x01u8), (0x0D, 0x0F), (0x04, 0x05)] {
            d.sector = from;
            host_write(&mut d, &data_field(0));
            d.commit_write(&mut fs).unwrap();
            assert_eq!(d.sector(), to);
        }
    }

    #[test]
    fn reading_a_buffered_sector_flushes_first() {
        let (mut fs, f) = nic_fs();
        let mut d = Disk2::new(0xFE, 5, [INITIAL_POSITION; 2]);
        d.mount(0, f);

        d.sector = 5;
        host_write(&mut d, &data_field(0x77));
        d.commit_write(&mut fs).unwrap();
        assert!(d.has_pending_writes());

        // Counter skewed to 6, step back so the next prepare targets sector 5
        d.sector = 4;
        d.prepare_sector(&mut fs).unwrap();
        assert!(!d.has_pending_writes());
        assert_eq!(&d.stream[53..56], &gcr::DATA_PROLOGUE);
        assert_eq!(d.stream[100], 0x77);
    }

    #[test]
    fn address_field_resyncs_format() {
        let (mut fs, f) = nic_fs();
        let mut d = Disk2::new(0xFE, 5, [INITIAL_POSITION; 2]);
        d.mount(0, f);

        let mut addr = [0xFFu8; 20];
        addr[..3].copy_from_slice(&gcr::ADDRESS_PROLOGUE);
        addr[3..5].copy_from_slice(&gcr::odd_even(0xFE));
        addr[5..7].copy_from_slice(&gcr::odd_even(2));
        addr[7..9].copy_from_slice(&gcr::odd_even(9));

        d.sector = 0;
        host_write(&mut d, &addr);
        d.commit_write(&mut fs).unwrap();

        host_write(&mut d, &data_field(0));
        d.commit_write(&mut fs).unwrap();
        assert_eq!(d.sector(), 9);
        assert!(!d.has_pending_writes());
    }

    #[test]
    fn write_protect_sense_sources() {
        let (_fs, mut f) = nic_fs();
        let mut d = Disk2::new(0xFE, 5, [INITIAL_POSITION; 2]);
        assert!(!d.write_protect_sense(false, 0));
        assert!(d.write_protect_sense(true, 0));
        assert!(d.write_protect_sense(false, 0b0010));

        f.protect = true;
        d.mount(0, f);
        assert!(d.write_protect_sense(false, 0));
    }
}
