//! SmartPort block device emulation
//!
//! The host resets the bus, assigns a device id to each partition with INIT
//! commands, then addresses partitions by id with STATUS, READ, WRITE and
//! FORMAT commands. Every exchange starts with the phase lines entering the
//! enable pattern.

use crate::block::{Block, BlockDevice, BLOCK_SIZE};
use crate::bus::{self, HostBus};
use crate::config::Config;
use crate::error::FsError;
use crate::file::OpenFile;
use crate::fs::FileSystem;
use crate::packet::{self, RawPacket, TYPE_COMMAND, TYPE_DATA, TYPE_STATUS};
use crate::ASCII_SPACE;

/// Partitions served on the bus
pub const PARTITIONS: usize = 4;

/// Phase pattern holding the bus in reset
pub const PHASE_RESET: u8 = 0b0101;
/// Phase bits that must both be set to enable the bus
pub const PHASE_ENABLE: u8 = 0b1010;

/// Raw command bytes, top bit set as sent on the wire
pub const CMD_STATUS: u8 = 0x80;
pub const CMD_READ: u8 = 0x81;
pub const CMD_WRITE: u8 = 0x82;
pub const CMD_FORMAT: u8 = 0x83;
pub const CMD_INIT: u8 = 0x85;

/// Status code requesting the device information block
const STATUS_DIB: u8 = 0x03;

/// INIT reply status, more partitions follow
pub const INIT_MORE: u8 = 0x80;
/// INIT reply status, last partition
pub const INIT_LAST: u8 = 0xFF;

pub const STATUS_IO_ERROR: u8 = 0x27;
pub const STATUS_WRITE_PROTECTED: u8 = 0x2B;

/// Size of the 2MG container header ahead of the block data
pub const TWO_MG_HEADER: usize = 64;

/// Decoded command packet length
const COMMAND_LEN: usize = 9;
const DIB_LEN: usize = 25;
const STATUS_LEN: usize = 4;

/// Bus protocol progress
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature="defmt", derive(defmt::Format))]
pub enum BusState {
    WaitPhase,
    Reset,
    /// ACK raised, waiting for REQ
    Enabled,
    Receiving,
    Dispatching,
    Sending,
}

/// Outcome of one phase event, used to drive the status display
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature="defmt", derive(defmt::Format))]
pub enum Activity {
    /// Nothing was addressed to us
    Idle,
    Reset,
    Status { partition: usize },
    Read { partition: usize, block: u32 },
    Write { partition: usize, block: u32 },
    Format { partition: usize },
    Init { partition: usize, last: bool },
    /// Storage failed while serving a partition
    Failed { partition: usize, error: FsError },
}

#[derive(Debug, Default)]
struct Partition {
    image: Option<OpenFile>,
    device_id: Option<u8>,
}

/// SmartPort device with up to [`PARTITIONS`] partitions
pub struct SmartPort {
    partitions: [Partition; PARTITIONS],
    initialised: usize,
    state: BusState,
    data: Block,
}

impl Default for SmartPort {
    fn default() -> Self {
        Self::new()
    }
}

impl SmartPort {
    pub fn new() -> Self {
        Self {
            partitions: Default::default(),
            initialised: 0,
            state: BusState::WaitPhase,
            data: [0u8; BLOCK_SIZE],
        }
    }

    pub fn state(&self) -> BusState {
        self.state
    }

    pub fn image(&self, partition: usize) -> Option<&OpenFile> {
        self.partitions.get(partition)?.image.as_ref()
    }

    pub fn image_mut(&mut self, partition: usize) -> Option<&mut OpenFile> {
        self.partitions.get_mut(partition)?.image.as_mut()
    }

    pub fn mount(&mut self, partition: usize, image: OpenFile) {
        if let Some(p) = self.partitions.get_mut(partition) {
            crate::info!("Partition {} mounted {:?}", partition + 1, image.name);
            p.image = Some(image);
        }
    }

    pub fn unmount(&mut self, partition: usize) -> Option<OpenFile> {
        self.partitions.get_mut(partition)?.image.take()
    }

    /// Partitions with a usable image
    pub fn mounted(&self) -> usize {
        self.partitions.iter()
            .filter(|p| p.image.as_ref().map_or(false, |f| f.is_valid()))
            .count()
    }

    /// Device id assigned to a partition since the last bus reset
    pub fn device_id(&self, partition: usize) -> Option<u8> {
        self.partitions.get(partition)?.device_id
    }

    fn partition_for(&self, id: u8) -> Option<usize> {
        self.partitions.iter().position(|p| p.device_id == Some(id))
    }

    fn enter(&mut self, state: BusState) {
        crate::trace!("Bus {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Handle a change of the phase lines
    ///
    /// `write_protect` is the card's write-protect line.
    pub fn on_phase_change<B, D>(&mut self, phase: u8, bus: &mut B, fs: &mut FileSystem<D>, write_protect: bool, config: &Config) -> Activity
    where
        B: HostBus,
        D: BlockDevice,
    {
        if phase == PHASE_RESET {
            return self.reset(bus, config);
        }
        if phase & PHASE_ENABLE != PHASE_ENABLE {
            return Activity::Idle;
        }

        self.enter(BusState::Enabled);
        bus.set_ack(true);
        if bus::wait_for(bus, config.ack_timeout_us, |b| b.req()).is_err() {
            bus.set_ack(false);
            self.enter(BusState::WaitPhase);
            return Activity::Idle;
        }

        self.enter(BusState::Receiving);
        let activity = match packet::receive_packet(bus, config.packet_timeout_us) {
            Ok(p) => {
                self.enter(BusState::Dispatching);
                self.dispatch(&p, bus, fs, write_protect, config)
            },
            Err(e) => {
                crate::debug!("Command packet lost: {:?}", e);
                bus.set_ack(false);
                Activity::Idle
            },
        };

        self.enter(BusState::WaitPhase);
        activity
    }

    /// Hold while the reset pattern stays on the bus, then forget all ids
    fn reset<B: HostBus>(&mut self, bus: &mut B, config: &Config) -> Activity {
        self.enter(BusState::Reset);

        if bus::wait_for(bus, config.reset_timeout_us, |b| b.phases() != PHASE_RESET).is_err() {
            crate::warn!("Bus held in reset");
        }

        for p in self.partitions.iter_mut() {
            p.device_id = None;
        }
        self.initialised = 0;

        crate::debug!("Bus reset");
        self.enter(BusState::WaitPhase);
        Activity::Reset
    }

    fn dispatch<B, D>(&mut self, command: &RawPacket, bus: &mut B, fs: &mut FileSystem<D>, write_protect: bool, config: &Config) -> Activity
    where
        B: HostBus,
        D: BlockDevice,
    {
        let mut payload = [0u8; COMMAND_LEN];
        let len = command.payload_len().min(COMMAND_LEN);
        if packet::decode_packet(command, &mut payload[..len]).is_err() {
            crate::warn!("Command checksum mismatch, ignored");
            return Activity::Idle;
        }

        let id = command.dest();
        if command.command() == CMD_INIT {
            return self.init(id, bus, config);
        }

        // Ids from an earlier reset epoch are not ours
        let partition = match self.partition_for(id) {
            Some(p) => p,
            None => return Activity::Idle,
        };

        match command.command() {
            CMD_STATUS => self.status(partition, id, payload[4], bus, write_protect, config),
            CMD_READ => self.read(partition, id, command.block_number(), bus, fs, config),
            CMD_WRITE => self.write(partition, id, command.block_number(), bus, fs, write_protect, config),
            CMD_FORMAT => {
                if !self.usable(partition) {
                    return Activity::Idle;
                }
                self.reply(bus, &packet::encode_packet(id, TYPE_COMMAND, 0, &[]), config);
                Activity::Format { partition }
            },
            c => {
                crate::debug!("Unsupported command 0x{:02x}", c);
                Activity::Idle
            },
        }
    }

    fn usable(&self, partition: usize) -> bool {
        self.partitions[partition].image.as_ref().map_or(false, |f| f.is_valid())
    }

    fn init<B: HostBus>(&mut self, id: u8, bus: &mut B, config: &Config) -> Activity {
        let partition = self.initialised;
        if partition >= config.partition_count() {
            crate::debug!("INIT for id {} beyond partition count", id);
            return Activity::Idle;
        }

        self.partitions[partition].device_id = Some(id);
        self.initialised += 1;

        let last = self.initialised >= config.init_target(self.mounted());
        let status = if last { INIT_LAST } else { INIT_MORE };
        crate::debug!("Partition {} assigned id {}", partition + 1, id);

        self.reply(bus, &packet::encode_packet(id, TYPE_COMMAND, status, &[]), config);
        Activity::Init { partition, last }
    }

    fn status<B: HostBus>(&mut self, partition: usize, id: u8, code: u8, bus: &mut B, write_protect: bool, config: &Config) -> Activity {
        let image = self.partitions[partition].image.as_ref().filter(|f| f.is_valid());

        let mut dib = [0u8; DIB_LEN];
        dib[0] = match image {
            Some(f) => 0xE8 | 0x10 | if f.protect || write_protect { 0x04 } else { 0x00 },
            None => 0xE8 | 0x04,
        };
        let blocks = image.map_or(0, image_blocks);
        dib[1..4].copy_from_slice(&blocks.to_le_bytes()[..3]);
        dib[5..21].fill(ASCII_SPACE);
        dib[21] = 0x02;

        // Chosen by the status code parameter, never by the host's buffer pointer
        let len = if code == STATUS_DIB { DIB_LEN } else { STATUS_LEN };
        self.reply(bus, &packet::encode_packet(id, TYPE_STATUS, 0, &dib[..len]), config);
        Activity::Status { partition }
    }

    fn read<B, D>(&mut self, partition: usize, id: u8, block: u32, bus: &mut B, fs: &mut FileSystem<D>, config: &Config) -> Activity
    where
        B: HostBus,
        D: BlockDevice,
    {
        let image = match self.partitions[partition].image.as_mut() {
            Some(f) if f.is_valid() => f,
            _ => return Activity::Idle,
        };

        match read_image_block(fs, image, block, &mut self.data) {
            Ok(()) => {
                let reply = packet::encode_packet(id, TYPE_DATA, 0, &self.data);
                self.reply(bus, &reply, config);
                Activity::Read { partition, block }
            },
            Err(error) => {
                crate::warn!("Read of block {} failed: {:?}", block, error);
                self.reply(bus, &packet::encode_packet(id, TYPE_STATUS, STATUS_IO_ERROR, &[]), config);
                Activity::Failed { partition, error }
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write<B, D>(&mut self, partition: usize, id: u8, block: u32, bus: &mut B, fs: &mut FileSystem<D>, write_protect: bool, config: &Config) -> Activity
    where
        B: HostBus,
        D: BlockDevice,
    {
        let image = match self.partitions[partition].image.as_mut() {
            Some(f) if f.is_valid() => f,
            _ => return Activity::Idle,
        };

        // Data packet follows on the next REQ
        bus.set_ack(true);
        if bus::wait_for(bus, config.ack_timeout_us, |b| b.req()).is_err() {
            bus.set_ack(false);
            return Activity::Idle;
        }
        let data = match packet::receive_packet(bus, config.packet_timeout_us) {
            Ok(p) => p,
            Err(e) => {
                crate::debug!("Data packet lost: {:?}", e);
                bus.set_ack(false);
                return Activity::Idle;
            },
        };

        let mut activity = Activity::Write { partition, block };
        let status = match packet::decode_packet(&data, &mut self.data) {
            Err(e) => {
                crate::warn!("Data checksum mismatch for block {}", block);
                e.status()
            },
            Ok(()) if write_protect || image.protect => STATUS_WRITE_PROTECTED,
            Ok(()) => match write_image_block(fs, image, block, &self.data) {
                Ok(()) => 0,
                Err(FsError::WriteProtected) => STATUS_WRITE_PROTECTED,
                Err(error) => {
                    crate::warn!("Write of block {} failed: {:?}", block, error);
                    activity = Activity::Failed { partition, error };
                    STATUS_IO_ERROR
                },
            },
        };

        self.reply(bus, &packet::encode_packet(id, TYPE_STATUS, status, &[]), config);
        activity
    }

    fn reply<B: HostBus>(&mut self, bus: &mut B, reply: &RawPacket, config: &Config) {
        self.enter(BusState::Sending);
        if let Err(e) = packet::send_packet(bus, reply, config.ack_timeout_us) {
            crate::debug!("Reply not collected: {:?}", e);
        }
    }
}

/// Block count reported for an image
pub fn image_blocks(file: &OpenFile) -> u32 {
    let data = if file.is_2mg() {
        file.length.saturating_sub(TWO_MG_HEADER as u32)
    } else {
        file.length
    };
    data.div_ceil(BLOCK_SIZE as u32)
}

/// Read one host block, skipping the 2MG header where present
pub fn read_image_block<D: BlockDevice>(fs: &mut FileSystem<D>, file: &mut OpenFile, block: u32, out: &mut Block) -> Result<(), FsError> {
    if !file.is_2mg() {
        return fs.read_sector(file, block, out);
    }

    let split = BLOCK_SIZE - TWO_MG_HEADER;
    let mut sector = [0u8; BLOCK_SIZE];

    fs.read_sector(file, block, &mut sector)?;
    out[..split].copy_from_slice(&sector[TWO_MG_HEADER..]);
    fs.read_sector(file, block + 1, &mut sector)?;
    out[split..].copy_from_slice(&sector[..TWO_MG_HEADER]);

    Ok(())
}

/// Write one host block, preserving the bytes of neighbouring blocks that
/// share a sector in a 2MG image
pub fn write_image_block<D: BlockDevice>(fs: &mut FileSystem<D>, file: &mut OpenFile, block: u32, data: &Block) -> Result<(), FsError> {
    if !file.is_2mg() {
        return fs.write_sector(file, block, data);
    }

    let split = BLOCK_SIZE - TWO_MG_HEADER;
    let mut sector = [0u8; BLOCK_SIZE];

    fs.read_sector(file, block, &mut sector)?;
    sector[TWO_MG_HEADER..].copy_from_slice(&data[..split]);
    fs.write_sector(file, block, &sector)?;

    fs.read_sector(file, block + 1, &mut sector)?;
    sector[..TWO_MG_HEADER].copy_from_slice(&data[split..]);
    fs.write_sector(file, block + 1, &sector)
}
