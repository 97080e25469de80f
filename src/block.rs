use crate::boot::Geometry;
use crate::error::IoError;

/// Size of every block moved between the card and the filesystem
pub const BLOCK_SIZE: usize = 512;

/// One card block
pub type Block = [u8; BLOCK_SIZE];

/// Synchronous 512-byte block storage
///
/// A failed transfer never leaves a partial block in `block`.
pub trait BlockDevice {
    /// Read the block at `index` (block units, not bytes)
    fn read_block(&mut self, index: u32, block: &mut Block) -> Result<(), IoError>;

    /// Write the block at `index` (block units, not bytes)
    fn write_block(&mut self, index: u32, block: &Block) -> Result<(), IoError>;
}

impl <T: BlockDevice + ?Sized> BlockDevice for &mut T {
    fn read_block(&mut self, index: u32, block: &mut Block) -> Result<(), IoError> {
        (**self).read_block(index, block)
    }

    fn write_block(&mut self, index: u32, block: &Block) -> Result<(), IoError> {
        (**self).write_block(index, block)
    }
}

/// Block storage that can be pulled out and re-inserted at runtime
pub trait RemovableMedia: BlockDevice {
    /// Wait for usable media.
    ///
    /// Returns immediately with `false` when `force` is unset and media is
    /// present, otherwise blocks until a card initialises and returns `true`.
    fn detect(&mut self, force: bool) -> bool;

    /// Geometry of the last successfully initialised card
    fn geometry(&self) -> Option<Geometry>;

    /// State of the card write-protect tab
    fn write_protected(&mut self) -> bool;

    /// State of the card-present line
    fn media_present(&mut self) -> bool;
}
