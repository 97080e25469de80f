
/// Failure of a single block transfer with the card
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature="defmt", derive(defmt::Format))]
pub enum IoError {
    /// A bounded wait on the card expired
    Timeout,
    /// The media-removed line was asserted mid transfer
    Ejected,
}

/// Failure to bring up a card and derive its geometry
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature="defmt", derive(defmt::Format))]
pub enum MediaError {
    Timeout,
    Ejected,
    /// Signature missing, sector size other than 512 or unsupported cluster count
    BadGeometry,
}

impl From<IoError> for MediaError {
    fn from(e: IoError) -> Self {
        match e {
            IoError::Timeout => MediaError::Timeout,
            IoError::Ejected => MediaError::Ejected,
        }
    }
}

/// Filesystem level failures, surfaced to the UI as a mount failure
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature="defmt", derive(defmt::Format))]
pub enum FsError {
    NotFound,
    NotADirectory,
    DirectoryFull,
    OutOfSpace,
    /// Handle never opened, invalidated, or offset outside the cluster chain
    Invalid,
    InvalidName,
    /// Creation refused because the card write-protect tab is set
    WriteProtected,
    Io(IoError),
}

impl From<IoError> for FsError {
    fn from(e: IoError) -> Self {
        FsError::Io(e)
    }
}

/// Packet payload did not match its interleaved checksum
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature="defmt", derive(defmt::Format))]
pub enum ChecksumError {
    Mismatch,
}

impl ChecksumError {
    /// SmartPort status code reported back to the host
    pub const fn status(&self) -> u8 {
        match self {
            ChecksumError::Mismatch => 0x06,
        }
    }
}

/// Packet bus handshake failures
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature="defmt", derive(defmt::Format))]
pub enum BusError {
    /// REQ or a framing byte did not show up before the deadline
    Timeout,
    /// Header counts describe a packet that does not fit or lacks its end marker
    Framing,
}
