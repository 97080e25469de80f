//! Disk II 6-and-2 group code recording and the nibble sector layout
//!
//! A nibble sector is the 512-byte record stored in `.NIC` images: the
//! self-sync gap, the address field, the encoded data field and padding.
//! Only the first [`STREAM_LEN`] bytes are shifted out to the host.

/// Decoded sector payload
pub const RAW_SECTOR: usize = 256;
/// Encoded payload plus its checksum nibble
pub const NIBBLE_DATA: usize = 343;
/// Stored nibble sector record
pub const NIBBLE_SECTOR: usize = 512;
/// Bytes of a nibble sector streamed to the host
pub const STREAM_LEN: usize = 412;

/// Start of the data prologue within a nibble sector
pub const DATA_FIELD: usize = 53;
/// Start of the encoded payload within a nibble sector
pub const DATA_OFFSET: usize = 0x38;
/// Data prologue, payload and epilogue as written by the host
pub const DATA_FIELD_LEN: usize = 3 + NIBBLE_DATA + 3;
/// Start of the trailing gap
const TRAILER: usize = DATA_FIELD + DATA_FIELD_LEN;

/// Timing bytes ahead of the address field, 10-bit sync patterns packed into
/// 8-bit bytes
const SYNC: [u8; 12] = [0x03, 0xFC, 0xFF, 0x3F, 0xCF, 0xF3, 0xFC, 0xFF, 0x3F, 0xCF, 0xF3, 0xFC];
const GAP1: usize = 22;
const GAP2: usize = 5;
const GAP3: usize = 14;

pub const ADDRESS_PROLOGUE: [u8; 3] = [0xD5, 0xAA, 0x96];
pub const DATA_PROLOGUE: [u8; 3] = [0xD5, 0xAA, 0xAD];
pub const EPILOGUE: [u8; 3] = [0xDE, 0xAA, 0xEB];

/// 6-bit value to disk nibble
pub const ENCODE: [u8; 64] = [
    0x96, 0x97, 0x9A, 0x9B, 0x9D, 0x9E, 0x9F, 0xA6,
    0xA7, 0xAB, 0xAC, 0xAD, 0xAE, 0xAF, 0xB2, 0xB3,
    0xB4, 0xB5, 0xB6, 0xB7, 0xB9, 0xBA, 0xBB, 0xBC,
    0xBD, 0xBE, 0xBF, 0xCB, 0xCD, 0xCE, 0xCF, 0xD3,
    0xD6, 0xD7, 0xD9, 0xDA, 0xDB, 0xDC, 0xDD, 0xDE,
    0xDF, 0xE5, 0xE6, 0xE7, 0xE9, 0xEA, 0xEB, 0xEC,
    0xED, 0xEE, 0xEF, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6,
    0xF7, 0xF9, 0xFA, 0xFB, 0xFC, 0xFD, 0xFE, 0xFF,
];

/// Disk nibble to 6-bit value, zero for bytes that are not valid nibbles
pub const DECODE: [u8; 256] = decode_table();

const fn decode_table() -> [u8; 256] {
    let mut t = [0u8; 256];
    let mut i = 0;
    while i < ENCODE.len() {
        t[ENCODE[i] as usize] = i as u8;
        i += 1;
    }
    t
}

/// Swap the two low bits
const BIT_SWAP: [u8; 4] = [0, 2, 1, 3];

/// Encode a sector payload into 342 nibbles plus a checksum nibble
pub fn raw_to_nibble(raw: &[u8; RAW_SECTOR]) -> [u8; NIBBLE_DATA] {
    let mut out = [0u8; NIBBLE_DATA];
    let mut prev = 0u8;

    for i in 0..86 {
        let mut x = BIT_SWAP[(raw[i] & 3) as usize]
            | BIT_SWAP[(raw[i + 86] & 3) as usize] << 2;
        if i + 172 < RAW_SECTOR {
            x |= BIT_SWAP[(raw[i + 172] & 3) as usize] << 4;
        }
        out[i] = ENCODE[(x ^ prev) as usize];
        prev = x;
    }

    for i in 0..RAW_SECTOR {
        let x = raw[i] >> 2;
        out[86 + i] = ENCODE[(x ^ prev) as usize];
        prev = x;
    }

    out[342] = ENCODE[prev as usize];
    out
}

/// Decode 342 nibbles back into the sector payload, ignoring the checksum
pub fn nibble_to_raw(nibbles: &[u8; NIBBLE_DATA]) -> [u8; RAW_SECTOR] {
    let mut out = [0u8; RAW_SECTOR];
    let mut prev = 0u8;

    for j in 0..86 {
        let x = (prev ^ DECODE[nibbles[j] as usize]) & 0x3F;
        out[j] = BIT_SWAP[(x & 3) as usize];
        out[j + 86] = BIT_SWAP[((x >> 2) & 3) as usize];
        if j + 172 < RAW_SECTOR {
            out[j + 172] = BIT_SWAP[((x >> 4) & 3) as usize];
        }
        prev = x;
    }

    for j in 0..RAW_SECTOR {
        let x = (prev ^ DECODE[nibbles[86 + j] as usize]) & 0x3F;
        out[j] |= x << 2;
        prev = x;
    }

    out
}

/// 4-and-4 encoding used by address fields
pub const fn odd_even(v: u8) -> [u8; 2] {
    [(v >> 1) | 0xAA, v | 0xAA]
}

pub const fn from_odd_even(odd: u8, even: u8) -> u8 {
    ((odd & 0x55) << 1) | (even & 0x55)
}

/// Fill the gap, sync run and address field of a nibble sector
pub fn write_address_field(out: &mut [u8; NIBBLE_SECTOR], volume: u8, track: u8, sector: u8) {
    out[..GAP1].fill(0xFF);
    let mut i = GAP1;

    let mut put = |bytes: &[u8]| {
        out[i..i + bytes.len()].copy_from_slice(bytes);
        i += bytes.len();
    };

    put(&SYNC);
    put(&ADDRESS_PROLOGUE);
    put(&odd_even(volume));
    put(&odd_even(track));
    put(&odd_even(sector));
    put(&odd_even(volume ^ track ^ sector));
    put(&EPILOGUE);
    put(&[0xFF; GAP2]);
}

/// Fill the gap after the data field and the unused tail
pub fn write_trailer(out: &mut [u8; NIBBLE_SECTOR]) {
    out[TRAILER..TRAILER + GAP3].fill(0xFF);
    out[TRAILER + GAP3..].fill(0x00);
}

/// Build the full nibble sector for a decoded payload
pub fn encode_sector(out: &mut [u8; NIBBLE_SECTOR], volume: u8, track: u8, sector: u8, raw: &[u8; RAW_SECTOR]) {
    write_address_field(out, volume, track, sector);

    out[DATA_FIELD..DATA_OFFSET].copy_from_slice(&DATA_PROLOGUE);
    out[DATA_OFFSET..DATA_OFFSET + NIBBLE_DATA].copy_from_slice(&raw_to_nibble(raw));
    out[DATA_OFFSET + NIBBLE_DATA..TRAILER].copy_from_slice(&EPILOGUE);

    write_trailer(out);
}

/// Recover the payload of a nibble sector
pub fn decode_sector(sector: &[u8; NIBBLE_SECTOR]) -> [u8; RAW_SECTOR] {
    let mut nibbles = [0u8; NIBBLE_DATA];
    nibbles.copy_from_slice(&sector[DATA_OFFSET..DATA_OFFSET + NIBBLE_DATA]);
    nibble_to_raw(&nibbles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decode_inverts_encode_table() {
        for (i, n) in ENCODE.iter().enumerate() {
            assert_eq!(DECODE[*n as usize] as usize, i);
        }
    }

    #[test]
    fn payload_round_trip() {
        for _ in 0..32 {
            let mut raw = [0u8; RAW_SECTOR];
            raw.iter_mut().for_each(|b| *b = rand::random::<u8>());

            let nib = raw_to_nibble(&raw);
            assert!(nib.iter().all(|n| *n >= 0x96), "nibbles must have the high bit set");
            assert_eq!(nibble_to_raw(&nib), raw);
        }
    }

    #[test]
    fn zero_sector_encoding() {
        let nib = raw_to_nibble(&[0u8; RAW_SECTOR]);
        assert!(nib.iter().all(|n| *n == 0x96));
    }

    #[test]
    fn sector_layout() {
        let raw = [0xA5u8; RAW_SECTOR];
        let mut s = [0u8; NIBBLE_SECTOR];
        encode_sector(&mut s, 0xFE, 17, 5, &raw);

        assert!(s[..22].iter().all(|b| *b == 0xFF));
        assert_eq!(&s[22..34], &SYNC);
        assert_eq!(&s[34..37], &ADDRESS_PROLOGUE);
        assert_eq!(from_odd_even(s[37], s[38]), 0xFE);
        assert_eq!(from_odd_even(s[39], s[40]), 17);
        assert_eq!(from_odd_even(s[41], s[42]), 5);
        assert_eq!(from_odd_even(s[43], s[44]), 0xFE ^ 17 ^ 5);
        assert_eq!(&s[45..48], &EPILOGUE);
        assert!(s[48..53].iter().all(|b| *b == 0xFF));
        assert_eq!(&s[53..56], &DATA_PROLOGUE);
        assert_eq!(&s[0x18F..0x192], &EPILOGUE);
        assert!(s[0x192..0x1A0].iter().all(|b| *b == 0xFF));
        assert!(s[0x1A0..].iter().all(|b| *b == 0x00));

        assert_eq!(decode_sector(&s), raw);
    }
}
