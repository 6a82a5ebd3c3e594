// kernel/src/drivers/mod.rs
//
// Block devices as seen by the swap subsystem.
//
// The swap area is a flat run of 512-byte sectors; the VM core only needs
// whole-sector reads and writes plus the device size.  The storage driver
// itself lives outside this crate and implements `BlockDevice`.

pub mod ram_disk;

pub use ram_disk::RamDisk;

/// Bytes per device sector.
pub const SECTOR_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// Sector index past the end of the device.
    OutOfRange,
    /// The device reported a transfer failure.
    IOError,
}

pub type BlockResult<T> = Result<T, BlockError>;

/// Synchronous sector device.  Calls block until the transfer is done.
pub trait BlockDevice: Send {
    fn read_sector(&mut self, sector: u64, buf: &mut [u8; SECTOR_SIZE]) -> BlockResult<()>;

    fn write_sector(&mut self, sector: u64, buf: &[u8; SECTOR_SIZE]) -> BlockResult<()>;

    fn size_in_sectors(&self) -> u64;

    /// Nombre para debugging
    fn name(&self) -> &str {
        "<block>"
    }
}
