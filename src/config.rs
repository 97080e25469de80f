
use crate::disk2::{DRIVES, MAX_WRITE_SLOTS};
use crate::smartport::PARTITIONS;

/// Emulator configuration
pub struct Config {
    /// Number of SmartPort partitions offered to the host, at most 4
    pub partitions: usize,
    /// Number of Disk II drives, at most 2
    pub nibble_drives: usize,
    /// Number of buffered write slots before a flush, at most 5
    pub write_slots: usize,

    /// Volume number written into nibble address fields, defaults to 0xFE
    pub volume: u8,

    /// Desktop mode answers INIT based on the mounted partition count
    /// rather than the configured partition count
    pub desktop: bool,

    /// Mount table file in the root directory, defaults to "UNISDISK.INI"
    pub mount_file: &'static str,

    /// Extensions listed for nibble drives, defaults to "DSK" and "DO"
    pub nibble_extensions: &'static [[u8; 3]],
    /// Extensions listed for packet partitions, defaults to "PO" and "2MG"
    pub packet_extensions: &'static [[u8; 3]],

    /// Wait for REQ after an enable phase pattern
    pub ack_timeout_us: u32,
    /// Wait for each byte of an incoming packet
    pub packet_timeout_us: u32,
    /// Longest bus reset honoured before giving up on the release
    pub reset_timeout_us: u32,

    /// Force use of Default::default() for construction
    _reserved: (),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            partitions: PARTITIONS,
            nibble_drives: DRIVES,
            write_slots: MAX_WRITE_SLOTS,
            volume: 0xFE,
            desktop: false,
            mount_file: "UNISDISK.INI",
            nibble_extensions: { const E: &[[u8; 3]] = &[*b"DSK", *b"DO "]; E },
            packet_extensions: { const E: &[[u8; 3]] = &[*b"PO ", *b"2MG"]; E },
            ack_timeout_us: 20_000,
            packet_timeout_us: 10_000,
            reset_timeout_us: 1_000_000,
            _reserved: (),
        }
    }
}

impl Config {

    /// Partition count clamped to what the emulator can hold
    pub const fn partition_count(&self) -> usize {
        if self.partitions > PARTITIONS { PARTITIONS } else { self.partitions }
    }

    /// Drive count clamped to what the emulator can hold
    pub const fn drive_count(&self) -> usize {
        if self.nibble_drives > DRIVES { DRIVES } else { self.nibble_drives }
    }

    /// Write slot count clamped to 1..=5
    pub const fn write_slot_count(&self) -> usize {
        match self.write_slots {
            0 => 1,
            n if n > MAX_WRITE_SLOTS => MAX_WRITE_SLOTS,
            n => n,
        }
    }

    /// Number of INIT commands acknowledged before the chain is reported complete
    pub const fn init_target(&self, mounted: usize) -> usize {
        if self.desktop { mounted } else { self.partition_count() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_counts() {
        let mut c = Config::default();
        c.partitions = 9;
        c.write_slots = 0;
        assert_eq!(c.partition_count(), PARTITIONS);
        assert_eq!(c.write_slot_count(), 1);

        c.desktop = true;
        assert_eq!(c.init_target(2), 2);
        c.desktop = false;
        assert_eq!(c.init_target(2), PARTITIONS);
    }
}
