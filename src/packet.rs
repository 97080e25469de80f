//! SmartPort bus packets
//!
//! Payload bytes travel with their top bit forced high. Odd bytes (length
//! modulo 7) lead, carried by one byte holding their high bits, then groups
//! of seven bytes each follow their own high-bit carrier. A checksum split
//! into odd and even bits closes the packet.

use crate::bus::{self, HostBus};
use crate::error::{BusError, ChecksumError};

pub const SYNC: [u8; 6] = [0xFF, 0x3F, 0xCF, 0xF3, 0xFC, 0xFF];
pub const PACKET_BEGIN: u8 = 0xC3;
pub const PACKET_END: u8 = 0xC8;

/// Largest payload carried by one packet
pub const MAX_PAYLOAD: usize = 512;
/// Bytes reserved for a packet with its sync prefix
pub const FRAME_CAPACITY: usize = 640;

/// Sync bytes a receiver skips before giving up on a packet start
const MAX_LEADIN: usize = 32;

const BEGIN: usize = 6;
const DEST: usize = 7;
const SRC: usize = 8;
const TYPE: usize = 9;
const AUX: usize = 10;
const STAT: usize = 11;
const ODDCNT: usize = 12;
const GRP7CNT: usize = 13;
const BODY: usize = 14;

/// Packet types
pub const TYPE_COMMAND: u8 = 0x00;
pub const TYPE_STATUS: u8 = 0x01;
pub const TYPE_DATA: u8 = 0x02;

/// A packet as it appears on the wire, sync prefix included
#[derive(Clone)]
pub struct RawPacket {
    bytes: [u8; FRAME_CAPACITY],
    len: usize,
}

impl core::fmt::Debug for RawPacket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RawPacket")
            .field("dest", &self.dest())
            .field("source", &self.source())
            .field("type", &self.kind())
            .field("status", &self.status())
            .field("payload", &self.payload_len())
            .finish()
    }
}

impl Default for RawPacket {
    fn default() -> Self {
        let mut bytes = [0u8; FRAME_CAPACITY];
        bytes[..BEGIN].copy_from_slice(&SYNC);
        bytes[BEGIN] = PACKET_BEGIN;
        Self { bytes, len: BEGIN + 1 }
    }
}

impl RawPacket {
    /// Wire bytes from the first sync byte through the end marker
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.len]
    }

    pub fn dest(&self) -> u8 {
        self.bytes[DEST] & 0x7F
    }

    pub fn source(&self) -> u8 {
        self.bytes[SRC] & 0x7F
    }

    pub fn kind(&self) -> u8 {
        self.bytes[TYPE] & 0x7F
    }

    pub fn status(&self) -> u8 {
        self.bytes[STAT] & 0x7F
    }

    pub fn odd_count(&self) -> usize {
        (self.bytes[ODDCNT] & 0x7F) as usize
    }

    pub fn group_count(&self) -> usize {
        (self.bytes[GRP7CNT] & 0x7F) as usize
    }

    /// Payload length announced by the header
    pub fn payload_len(&self) -> usize {
        self.odd_count() + 7 * self.group_count()
    }

    /// Raw command byte of a command packet, top bit set
    pub fn command(&self) -> u8 {
        self.bytes[BODY + 1]
    }

    /// 24-bit block number of a read or write command, taken from payload
    /// bytes 4 to 6 with their high bits from the group carrier
    pub fn block_number(&self) -> u32 {
        let carrier = self.bytes[17];
        let b0 = (self.bytes[20] & 0x7F) | ((carrier << 3) & 0x80);
        let b1 = (self.bytes[21] & 0x7F) | ((carrier << 4) & 0x80);
        let b2 = (self.bytes[22] & 0x7F) | ((carrier << 5) & 0x80);
        u32::from_le_bytes([b0, b1, b2, 0])
    }
}

/// Offset of the first group carrier for a given odd byte count
const fn groups_start(odd: usize) -> usize {
    if odd > 0 { BODY + 1 + odd } else { BODY }
}

/// Offset of the checksum pair
const fn checksum_at(odd: usize, groups: usize) -> usize {
    groups_start(odd) + groups * 8
}

/// Build a reply packet from this device to the host
///
/// Payloads longer than [`MAX_PAYLOAD`] are truncated.
pub fn encode_packet(source: u8, kind: u8, status: u8, data: &[u8]) -> RawPacket {
    let data = &data[..data.len().min(MAX_PAYLOAD)];
    let odd = data.len() % 7;
    let groups = data.len() / 7;

    let mut p = RawPacket::default();
    let b = &mut p.bytes;

    b[DEST] = 0x80;
    b[SRC] = 0x80 | source;
    b[TYPE] = 0x80 | kind;
    b[AUX] = 0x80;
    b[STAT] = 0x80 | status;
    b[ODDCNT] = 0x80 | odd as u8;
    b[GRP7CNT] = 0x80 | groups as u8;

    if odd > 0 {
        let mut carrier = 0x80;
        for (i, v) in data[..odd].iter().enumerate() {
            carrier |= (v >> (i + 1)) & (0x80 >> (i + 1));
            b[BODY + 1 + i] = v | 0x80;
        }
        b[BODY] = carrier;
    }

    for (g, chunk) in data[odd..].chunks_exact(7).enumerate() {
        let at = groups_start(odd) + g * 8;
        let mut carrier = 0x80;
        for (k, v) in chunk.iter().enumerate() {
            carrier |= (v >> (k + 1)) & (0x80 >> (k + 1));
            b[at + 1 + k] = v | 0x80;
        }
        b[at] = carrier;
    }

    let checksum = data.iter().fold(0, |c, v| c ^ v)
        ^ b[DEST..BODY].iter().fold(0, |c, v| c ^ v);

    let at = checksum_at(odd, groups);
    b[at] = checksum | 0xAA;
    b[at + 1] = (checksum >> 1) | 0xAA;
    b[at + 2] = PACKET_END;
    b[at + 3] = 0x00;
    p.len = at + 3;

    p
}

/// Decode `out.len()` payload bytes and verify the checksum
///
/// `out` is left untouched when the checksum does not match.
pub fn decode_packet(packet: &RawPacket, out: &mut [u8]) -> Result<(), ChecksumError> {
    let length = out.len().min(MAX_PAYLOAD);
    let odd = length % 7;
    let groups = length / 7;
    let b = &packet.bytes;

    let at = checksum_at(odd, groups);
    if at + 1 >= FRAME_CAPACITY {
        return Err(ChecksumError::Mismatch);
    }

    let mut data = [0u8; MAX_PAYLOAD];

    for i in 0..odd {
        data[i] = ((b[BODY] << (i + 1)) & 0x80) | (b[BODY + 1 + i] & 0x7F);
    }

    for g in 0..groups {
        let base = groups_start(odd) + g * 8;
        let carrier = b[base];
        for k in 0..7 {
            data[odd + g * 7 + k] = ((carrier << (k + 1)) & 0x80) | (b[base + 1 + k] & 0x7F);
        }
    }

    let checksum = data[..length].iter().fold(0, |c, v| c ^ v)
        ^ b[DEST..BODY].iter().fold(0, |c, v| c ^ v);
    let received = (b[at] & 0x55) | ((b[at + 1] & 0x55) << 1);

    if checksum != received {
        crate::debug!("Packet checksum 0x{:02x} != 0x{:02x}", checksum, received);
        return Err(ChecksumError::Mismatch);
    }

    out[..length].copy_from_slice(&data[..length]);
    Ok(())
}

fn next_byte<B: HostBus>(bus: &mut B, timeout_us: u32) -> Result<u8, BusError> {
    let mut byte = None;
    bus::wait_for(bus, timeout_us, |b| {
        byte = b.recv_byte();
        byte.is_some()
    })?;
    byte.ok_or(BusError::Timeout)
}

/// Read one packet from the host once REQ has been seen
///
/// Sync bytes before the start marker are skipped and the packet length is
/// taken from the header counts. ACK is dropped once the end marker arrives.
pub fn receive_packet<B: HostBus>(bus: &mut B, timeout_us: u32) -> Result<RawPacket, BusError> {
    let mut p = RawPacket::default();

    let mut started = false;
    for _ in 0..MAX_LEADIN {
        if next_byte(bus, timeout_us)? == PACKET_BEGIN {
            started = true;
            break;
        }
    }
    if !started {
        return Err(BusError::Framing);
    }

    for i in DEST..BODY {
        p.bytes[i] = next_byte(bus, timeout_us)?;
    }

    let end = checksum_at(p.odd_count(), p.group_count()) + 2;
    if p.odd_count() > 6 || end >= FRAME_CAPACITY {
        return Err(BusError::Framing);
    }

    for i in BODY..=end {
        p.bytes[i] = next_byte(bus, timeout_us)?;
    }
    if p.bytes[end] != PACKET_END {
        return Err(BusError::Framing);
    }
    p.len = end + 1;

    bus.set_ack(false);

    crate::trace!("Received {:?}", p);

    Ok(p)
}

/// Hand a packet to the host once it raises REQ
pub fn send_packet<B: HostBus>(bus: &mut B, packet: &RawPacket, timeout_us: u32) -> Result<(), BusError> {
    bus.set_ack(true);
    if let Err(e) = bus::wait_for(bus, timeout_us, |b| b.req()) {
        bus.set_ack(false);
        return Err(e);
    }

    for b in packet.as_bytes() {
        bus.send_byte(*b);
    }
    bus.set_ack(false);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptBus;
    use pretty_assertions::assert_eq;

    fn payload(len: usize) -> std::vec::Vec<u8> {
        (0..len).map(|_| rand::random::<u8>()).collect()
    }

    #[test]
    fn round_trip_every_length() {
        for len in 0..=MAX_PAYLOAD {
            let data = payload(len);
            let p = encode_packet(1, TYPE_DATA, 0, &data);

            assert!(p.as_bytes()[BODY..].iter().all(|b| *b & 0x80 != 0), "high bits at length {}", len);
            assert_eq!(p.payload_len(), len);

            let mut out = vec![0u8; len];
            decode_packet(&p, &mut out).unwrap();
            assert_eq!(out, data, "length {}", len);
        }
    }

    #[test]
    fn header_fields() {
        let p = encode_packet(3, TYPE_STATUS, 0x06, &[1, 2, 3, 4]);
        let b = p.as_bytes();

        assert_eq!(&b[..6], &SYNC);
        assert_eq!(b[6], PACKET_BEGIN);
        assert_eq!(b[7], 0x80);
        assert_eq!(p.source(), 3);
        assert_eq!(p.kind(), TYPE_STATUS);
        assert_eq!(p.status(), 0x06);
        assert_eq!(p.odd_count(), 4);
        assert_eq!(p.group_count(), 0);
        assert_eq!(*b.last().unwrap(), PACKET_END);
        assert_eq!(b.len(), 14 + 1 + 4 + 2 + 1);
    }

    #[test]
    fn flipped_checksum_is_rejected() {
        let data = payload(512);
        let mut p = encode_packet(1, TYPE_DATA, 0, &data);

        let at = checksum_at(512 % 7, 512 / 7);
        p.as_bytes_mut()[at] ^= 0x01;

        let mut out = [0xEEu8; 512];
        assert_eq!(decode_packet(&p, &mut out), Err(ChecksumError::Mismatch));
        assert!(out.iter().all(|b| *b == 0xEE));
        assert_eq!(ChecksumError::Mismatch.status(), 0x06);
    }

    #[test]
    fn corrupted_payload_is_rejected() {
        let data = payload(100);
        let mut p = encode_packet(1, TYPE_DATA, 0, &data);
        p.as_bytes_mut()[30] ^= 0x04;

        let mut out = [0u8; 100];
        assert_eq!(decode_packet(&p, &mut out), Err(ChecksumError::Mismatch));
    }

    #[test]
    fn block_number_from_command() {
        // READ command payload: cmd, count, buffer pointer, block number, spare
        let cmd = [0x01, 0x03, 0x00, 0x20, 0x34, 0x92, 0x81, 0x00, 0x00];
        let p = encode_packet(1, TYPE_COMMAND, 0, &cmd);

        assert_eq!(p.block_number(), 0x81_9234);
        assert_eq!(p.command(), 0x81);
    }

    #[test]
    fn receive_skips_sync_and_drops_ack() {
        let data = payload(9);
        let p = encode_packet(2, TYPE_COMMAND, 0, &data);

        let mut bus = ScriptBus::new();
        bus.inbound.extend([0x00, 0xFF, 0xFF]);
        bus.inbound.extend(p.as_bytes().iter().copied());
        bus.ack = true;

        let r = receive_packet(&mut bus, 1000).unwrap();
        assert_eq!(r.as_bytes(), p.as_bytes());
        assert!(!bus.ack);

        let mut out = [0u8; 9];
        decode_packet(&r, &mut out).unwrap();
        assert_eq!(&out[..], &data[..]);
    }

    #[test]
    fn receive_times_out_on_short_packet() {
        let p = encode_packet(2, TYPE_COMMAND, 0, &[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let mut bus = ScriptBus::new();
        bus.inbound.extend(p.as_bytes()[..12].iter().copied());

        assert_eq!(receive_packet(&mut bus, 1000).unwrap_err(), BusError::Timeout);
    }

    #[test]
    fn send_waits_for_req() {
        let p = encode_packet(2, TYPE_STATUS, 0, &[]);

        let mut bus = ScriptBus::new();
        bus.req = false;
        assert_eq!(send_packet(&mut bus, &p, 1000), Err(BusError::Timeout));
        assert!(bus.outbound.is_empty());
        assert!(!bus.ack);

        bus.req = true;
        send_packet(&mut bus, &p, 1000).unwrap();
        assert_eq!(&bus.outbound[..], p.as_bytes());
    }
}
