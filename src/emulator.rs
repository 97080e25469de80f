//! Top level runtime tying the card, the mount table and the active drive
//! personality together
//!
//! Interrupt handlers [`Emulator::post`] events; the main loop calls
//! [`Emulator::poll`] which drains them and performs any storage work that
//! was deferred.

use core::fmt::Write;

use crate::bus::{Event, EventQueue, HostBus, Irq, Suspended};
use crate::config::Config;
use crate::convert::{self, NIC_IMAGE_LEN};
use crate::dir::{FileListEntry, ImagePath, LIST_CAPACITY};
use crate::disk2::{Disk2, StreamState, DRIVES, INITIAL_POSITION};
use crate::error::FsError;
use crate::file::OpenFile;
use crate::fs::FileSystem;
use crate::ini::{self, MountTable, PACKET_SLOTS, SLOTS};
use crate::smartport::{Activity, SmartPort};
use crate::store::{PersistentStore, StoreKey};
use crate::{RemovableMedia, ASCII_SPACE};

/// Characters per status line
pub const LINE_WIDTH: usize = 8;

/// Two line character display
pub trait StatusDisplay {
    fn show(&mut self, row: u8, text: &[u8; LINE_WIDTH]);
}

/// Which drive the host sees
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature="defmt", derive(defmt::Format))]
pub enum Mode {
    /// Disk II floppy drives
    Nibble,
    /// SmartPort block device
    Packet,
}

impl Mode {
    const fn code(self) -> u8 {
        match self {
            Mode::Nibble => 0,
            Mode::Packet => 1,
        }
    }

    const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Mode::Nibble),
            1 => Some(Mode::Packet),
            _ => None,
        }
    }

    /// Mode for this boot, a held selector wins and is remembered
    pub fn restore<S: PersistentStore>(store: &mut S, selector: Option<Mode>) -> Self {
        if let Some(m) = selector {
            store.store(StoreKey::Mode, m.code());
            return m;
        }
        store.load(StoreKey::Mode)
            .and_then(Mode::from_code)
            .unwrap_or(Mode::Nibble)
    }

    /// List filter for images this mode can mount
    pub fn extensions(self, config: &Config) -> &'static [[u8; 3]] {
        match self {
            Mode::Nibble => config.nibble_extensions,
            Mode::Packet => config.packet_extensions,
        }
    }
}

/// State owned by the active mode
enum Personality {
    Nibble {
        disk2: Disk2,
        /// Image each nibble image was converted from
        sources: [Option<OpenFile>; DRIVES],
        /// Drive and track last shown on the display
        shown: Option<(usize, u8)>,
    },
    Packet(SmartPort),
}

pub struct Emulator<M, B, S, L> {
    config: Config,
    mode: Mode,
    personality: Personality,

    fs: Option<FileSystem<M>>,
    media: Option<M>,
    table: Option<MountTable>,

    bus: B,
    store: S,
    display: L,

    events: EventQueue,
    phase: u8,
}

impl <M, B, S, L> Emulator<M, B, S, L>
where
    M: RemovableMedia,
    B: HostBus,
    S: PersistentStore,
    L: StatusDisplay,
{
    /// Set up the emulator for the persisted or selected mode, call
    /// [`Emulator::mount_all`] to bring the card up
    pub fn new(config: Config, media: M, bus: B, mut store: S, display: L, selector: Option<Mode>) -> Self {
        let mode = Mode::restore(&mut store, selector);
        crate::info!("Starting in {:?} mode", mode);

        let personality = match mode {
            Mode::Nibble => {
                let mut positions = [INITIAL_POSITION; DRIVES];
                for (d, p) in positions.iter_mut().enumerate() {
                    if let Some(v) = store.load(StoreKey::Track(d as u8)) {
                        *p = v;
                    }
                }
                Personality::Nibble {
                    disk2: Disk2::new(config.volume, config.write_slot_count(), positions),
                    sources: [None, None],
                    shown: None,
                }
            },
            Mode::Packet => Personality::Packet(SmartPort::new()),
        };

        Self {
            config,
            mode,
            personality,
            fs: None,
            media: Some(media),
            table: None,
            bus,
            store,
            display,
            events: EventQueue::new(),
            phase: 0,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn bus(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn display(&mut self) -> &mut L {
        &mut self.display
    }

    pub fn store(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn filesystem(&mut self) -> Option<&mut FileSystem<M>> {
        self.fs.as_mut()
    }

    pub fn disk2(&self) -> Option<&Disk2> {
        match &self.personality {
            Personality::Nibble { disk2, .. } => Some(disk2),
            _ => None,
        }
    }

    pub fn smartport(&self) -> Option<&SmartPort> {
        match &self.personality {
            Personality::Packet(sp) => Some(sp),
            _ => None,
        }
    }

    /// Queue an event from interrupt context, never blocks
    pub fn post(&mut self, event: Event) {
        if self.events.enqueue(event).is_err() {
            crate::warn!("Event queue full, {:?} dropped", event);
        }
    }

    /// Run one pass of the main loop
    pub fn poll(&mut self) {
        if self.media_removed() {
            self.eject();
            if let Err(e) = self.mount_all(false) {
                crate::warn!("Remount failed: {:?}", e);
            }
            return;
        }

        while let Some(event) = self.events.dequeue() {
            self.handle(event);
        }

        self.service_nibble();
    }

    fn media_removed(&mut self) -> bool {
        match self.fs.as_mut() {
            Some(fs) => !fs.media_present(),
            None => true,
        }
    }

    fn handle(&mut self, event: Event) {
        if let Event::Phase(p) = event {
            return self.on_phase(p);
        }

        let disk2 = match &mut self.personality {
            Personality::Nibble { disk2, .. } => disk2,
            Personality::Packet(_) => return,
        };

        match event {
            Event::Tick => {
                if let Some(bit) = disk2.tick() {
                    self.bus.set_read_data(bit);
                }
            },
            Event::WriteByte(b) => disk2.accumulate_write_byte(b),
            Event::WriteEnd => disk2.end_write(),
            Event::Phase(_) => (),
        }
    }

    fn on_phase(&mut self, phase: u8) {
        self.phase = phase;
        let fs = match self.fs.as_mut() {
            Some(fs) => fs,
            None => return,
        };

        let activity = match &mut self.personality {
            Personality::Nibble { disk2, .. } => {
                // With no drive enabled the stepper lines belong to nobody
                if let Some(drive) = enabled_drive(&mut self.bus) {
                    if drive != disk2.current_drive() {
                        if let Err(e) = disk2.flush_writes(fs) {
                            nibble_fault(disk2, e);
                        }
                        disk2.select(drive);
                    }
                    disk2.advance_head(phase);
                }
                return;
            },
            Personality::Packet(sp) => {
                let write_protect = fs.write_protected();
                sp.on_phase_change(phase, &mut self.bus, fs, write_protect, &self.config)
            },
        };

        self.report(activity);
    }

    /// Deferred write commits, sector preparation and the write-protect sense
    fn service_nibble(&mut self) {
        let (fs, disk2, shown) = match (self.fs.as_mut(), &mut self.personality) {
            (Some(fs), Personality::Nibble { disk2, shown, .. }) => (fs, disk2, shown),
            _ => return,
        };

        if disk2.commit_pending() {
            let _tick = Suspended::new(&mut self.bus, Irq::Tick);
            if let Err(e) = disk2.commit_write(fs) {
                nibble_fault(disk2, e);
            }
        }

        if disk2.state() == StreamState::Preparing {
            let mut bus = Suspended::new(&mut self.bus, Irq::Tick);

            if let Some(drive) = enabled_drive(&mut *bus) {
                if drive != disk2.current_drive() {
                    if let Err(e) = disk2.flush_writes(fs) {
                        nibble_fault(disk2, e);
                    }
                    disk2.select(drive);
                }
            }

            match disk2.prepare_sector(fs) {
                Ok(()) => {
                    let at = (disk2.current_drive(), disk2.track());
                    if *shown != Some(at) && disk2.state() == StreamState::Streaming {
                        *shown = Some(at);
                        let mut line: heapless::String<LINE_WIDTH> = heapless::String::new();
                        let _ = write!(line, "DR{} TR{:02}", at.0 + 1, at.1);
                        let name = disk2.image(at.0).map(|f| f.name.stem());
                        show(&mut self.display, 0, line.as_bytes());
                        if let Some(n) = name {
                            show(&mut self.display, 1, &n);
                        }
                    }
                },
                Err(e) => nibble_fault(disk2, e),
            }
        }

        let wp_line = fs.write_protected();
        self.bus.set_write_protect(disk2.write_protect_sense(wp_line, self.phase));
        self.bus.set_activity(disk2.state() == StreamState::Buffering || disk2.has_pending_writes());
    }

    fn report(&mut self, activity: Activity) {
        self.bus.set_activity(matches!(activity, Activity::Read { .. } | Activity::Write { .. }));

        let (label, partition, block) = match activity {
            Activity::Read { partition, block } => ("RD", partition, block),
            Activity::Write { partition, block } => ("WR", partition, block),
            Activity::Reset => {
                show(&mut self.display, 0, b"RESET");
                return;
            },
            Activity::Failed { partition, error } => {
                crate::warn!("Partition {} failed: {:?}", partition + 1, error);
                if let (FsError::Io(_), Personality::Packet(sp)) = (error, &mut self.personality) {
                    if let Some(f) = sp.image_mut(partition) {
                        f.invalidate();
                    }
                }
                return;
            },
            _ => return,
        };

        let mut line: heapless::String<LINE_WIDTH> = heapless::String::new();
        let _ = write!(line, "{}{:06X}", label, block);
        show(&mut self.display, 0, line.as_bytes());

        let name = self.smartport().and_then(|sp| sp.image(partition)).map(|f| f.name.stem());
        if let Some(n) = name {
            show(&mut self.display, 1, &n);
        }
    }

    /// Card went away, remember head positions and drop every image
    pub fn eject(&mut self) {
        crate::info!("Card ejected");
        show(&mut self.display, 0, b"SD EJECT");

        if let Personality::Nibble { disk2, .. } = &self.personality {
            for d in 0..DRIVES {
                self.store.store(StoreKey::Track(d as u8), disk2.position(d));
            }
        }

        self.release_all();
    }

    fn release_all(&mut self) {
        match &mut self.personality {
            Personality::Nibble { disk2, sources, shown } => {
                disk2.clear_buffer();
                for d in 0..DRIVES {
                    disk2.unmount(d);
                    sources[d] = None;
                }
                *shown = None;
            },
            Personality::Packet(sp) => {
                for p in 0..crate::smartport::PARTITIONS {
                    sp.unmount(p);
                }
            },
        }
        self.table = None;
    }

    fn take_media(&mut self) -> Option<M> {
        match self.fs.take() {
            Some(fs) => Some(fs.into_inner()),
            None => self.media.take(),
        }
    }

    /// Detect the card and mount every slot of the active mode from the
    /// mount table, returns whether a card was mounted
    pub fn mount_all(&mut self, start: bool) -> Result<bool, FsError> {
        self.release_all();

        let mut media = match self.take_media() {
            Some(m) => m,
            None => return Ok(false),
        };

        self.bus.suspend(Irq::Phase);
        media.detect(start);
        self.bus.resume(Irq::Phase);

        let geometry = match media.geometry() {
            Some(g) => g,
            None => {
                self.media = Some(media);
                show(&mut self.display, 0, b"SD EJECT");
                return Ok(false);
            },
        };
        let write_protect = media.write_protected();
        show(&mut self.display, 0, b"SD MOUNT");

        let mut fs = FileSystem::new(media, geometry);
        let table = MountTable::open_or_create(&mut fs, self.config.mount_file, write_protect);
        self.fs = Some(fs);

        match table {
            Ok(t) => self.table = Some(t),
            Err(e) => {
                if e == FsError::WriteProtected {
                    show(&mut self.display, 0, b"Write");
                    show(&mut self.display, 1, b"protect.");
                }
                return Err(e);
            },
        }

        let (count, slot_of): (usize, fn(usize) -> usize) = match self.mode {
            Mode::Nibble => (self.config.drive_count(), ini::nibble_slot),
            Mode::Packet => (self.config.partition_count(), ini::packet_slot),
        };
        for slot in (0..count).map(slot_of) {
            if let Err(e) = self.mount_slot(slot) {
                crate::warn!("Slot {} not mounted: {:?}", slot, e);
            }
        }

        Ok(true)
    }

    /// Change the image in a mount table slot, flushing the old one
    pub fn mount(&mut self, slot: usize, path: &ImagePath) -> Result<(), FsError> {
        if slot >= SLOTS {
            return Err(FsError::Invalid);
        }

        self.bus.suspend(Irq::Phase);
        let r = self.remount(slot, path);
        self.bus.resume(Irq::Phase);
        r
    }

    pub fn unmount(&mut self, slot: usize) -> Result<(), FsError> {
        self.mount(slot, &ImagePath::unmounted())
    }

    fn remount(&mut self, slot: usize, path: &ImagePath) -> Result<(), FsError> {
        self.release(slot)?;

        let fs = self.fs.as_mut().ok_or(FsError::Invalid)?;
        let table = self.table.as_mut().ok_or(FsError::Invalid)?;
        table.write_path(fs, slot, path)?;

        self.mount_slot(slot)
    }

    /// Detach whatever the slot holds, writing nibble changes back first
    fn release(&mut self, slot: usize) -> Result<(), FsError> {
        let r = match self.mode {
            Mode::Nibble if slot < PACKET_SLOTS => self.write_back(slot),
            _ => Ok(()),
        };

        match &mut self.personality {
            Personality::Nibble { disk2, sources, .. } if slot < PACKET_SLOTS => {
                disk2.unmount(slot);
                sources[slot] = None;
            },
            Personality::Packet(sp) if slot >= PACKET_SLOTS => {
                sp.unmount(slot - PACKET_SLOTS);
            },
            _ => (),
        }

        r
    }

    fn mount_slot(&mut self, slot: usize) -> Result<(), FsError> {
        let fs = self.fs.as_mut().ok_or(FsError::Invalid)?;
        let table = self.table.as_mut().ok_or(FsError::Invalid)?;
        let path = table.read_path(fs, slot)?;
        if path.is_unmounted() {
            return Ok(());
        }

        match &mut self.personality {
            Personality::Nibble { disk2, sources, .. } if slot < PACKET_SLOTS => {
                let (nic, source) = open_nibble(fs, &path, &self.config, &mut self.display)?;
                show(&mut self.display, 1, &nic.name.stem());
                disk2.mount(slot, nic);
                sources[slot] = Some(source);
            },
            Personality::Packet(sp) if slot >= PACKET_SLOTS => {
                let file = fs.open_path(&path)?;
                show(&mut self.display, 1, &file.name.stem());
                sp.mount(slot - PACKET_SLOTS, file);
            },
            _ => (),
        }

        Ok(())
    }

    /// Convert a written nibble image back into the image it came from
    pub fn write_back(&mut self, drive: usize) -> Result<(), FsError> {
        let (fs, disk2, sources) = match (self.fs.as_mut(), &mut self.personality) {
            (Some(fs), Personality::Nibble { disk2, sources, .. }) => (fs, disk2, sources),
            _ => return Ok(()),
        };
        if drive >= DRIVES {
            return Err(FsError::Invalid);
        }

        if drive == disk2.current_drive() && disk2.has_pending_writes() {
            disk2.flush_writes(fs)?;
        }

        let write_protect = fs.write_protected();
        let (nic, source) = match (disk2.image_mut(drive), sources[drive].as_mut()) {
            (Some(n), Some(s)) => (n, s),
            _ => return Ok(()),
        };

        if !nic.written || !nic.is_valid() || source.name == nic.name {
            return Ok(());
        }
        if source.protect || write_protect {
            crate::debug!("{:?} is write protected, changes stay in {:?}", source.name, nic.name);
            return Ok(());
        }

        convert::nic_to_dsk(fs, source, nic)?;
        nic.written = false;
        Ok(())
    }

    /// Listing of a directory filtered for the active mode
    pub fn list(&mut self, dir: &ImagePath) -> Result<heapless::Vec<FileListEntry, LIST_CAPACITY>, FsError> {
        let exts = self.mode.extensions(&self.config);
        let fs = self.fs.as_mut().ok_or(FsError::Invalid)?;

        self.bus.suspend(Irq::Phase);
        let r = fs.open_dir(dir).and_then(|d| fs.list(d, exts));
        self.bus.resume(Irq::Phase);
        r
    }
}

/// Drive whose enable line is active, drive 1 winning
fn enabled_drive<B: HostBus>(bus: &mut B) -> Option<usize> {
    if bus.drive_enabled(0) {
        Some(0)
    } else if bus.drive_enabled(1) {
        Some(1)
    } else {
        None
    }
}

/// Media faults take the selected drive's image offline
fn nibble_fault(disk2: &mut Disk2, e: FsError) {
    crate::warn!("Drive {} failed: {:?}", disk2.current_drive() + 1, e);
    if let FsError::Io(_) = e {
        let drive = disk2.current_drive();
        if let Some(f) = disk2.image_mut(drive) {
            f.invalidate();
        }
    }
}

/// Open the nibble image for a mount path, creating it from the source image
/// when missing
fn open_nibble<M, L>(fs: &mut FileSystem<M>, path: &ImagePath, config: &Config, display: &mut L) -> Result<(OpenFile, OpenFile), FsError>
where
    M: RemovableMedia,
    L: StatusDisplay,
{
    let mut source = fs.open_path(path)?;
    let nic_path = path.with_extension(b"NIC");

    match fs.open_path(&nic_path) {
        Ok(nic) => return Ok((nic, source)),
        Err(FsError::NotFound) => (),
        Err(e) => return Err(e),
    }

    if fs.write_protected() {
        show(display, 0, b"Write");
        show(display, 1, b"protect.");
        return Err(FsError::WriteProtected);
    }

    show(display, 0, b"Creating");
    show(display, 1, b"NIC file");

    fs.create_path(&nic_path, NIC_IMAGE_LEN)?;
    let mut nic = fs.open_path(&nic_path)?;
    convert::dsk_to_nic(fs, &mut nic, &mut source, config.volume)?;
    nic.protect = source.protect;
    nic.written = false;

    Ok((nic, source))
}

/// Show `text` on one line, padded with spaces
fn show<L: StatusDisplay>(display: &mut L, row: u8, text: &[u8]) {
    let mut line = [ASCII_SPACE; LINE_WIDTH];
    let n = text.len().min(LINE_WIDTH);
    line[..n].copy_from_slice(&text[..n]);
    display.show(row, &line);
}
