// kernel/src/drivers/ram_disk.rs
//
// RAM-backed block device.  Used as the swap disk when no real storage
// driver is attached (and by the host test suite).

use alloc::vec;
use alloc::vec::Vec;

use super::{BlockDevice, BlockError, BlockResult, SECTOR_SIZE};

pub struct RamDisk {
    data: Vec<u8>,
    reads: u64,
    writes: u64,
}

impl RamDisk {
    pub fn new(sectors: u64) -> Self {
        Self {
            data: vec![0; sectors as usize * SECTOR_SIZE],
            reads: 0,
            writes: 0,
        }
    }

    /// Sectors transferred so far, `(reads, writes)`.
    pub fn stats(&self) -> (u64, u64) {
        (self.reads, self.writes)
    }

    fn range(&self, sector: u64) -> BlockResult<core::ops::Range<usize>> {
        if sector >= self.size_in_sectors() {
            return Err(BlockError::OutOfRange);
        }
        let start = sector as usize * SECTOR_SIZE;
        Ok(start..start + SECTOR_SIZE)
    }
}

impl BlockDevice for RamDisk {
    fn read_sector(&mut self, sector: u64, buf: &mut [u8; SECTOR_SIZE]) -> BlockResult<()> {
        let range = self.range(sector)?;
        buf.copy_from_slice(&self.data[range]);
        self.reads += 1;
        Ok(())
    }

    fn write_sector(&mut self, sector: u64, buf: &[u8; SECTOR_SIZE]) -> BlockResult<()> {
        let range = self.range(sector)?;
        self.data[range].copy_from_slice(buf);
        self.writes += 1;
        Ok(())
    }

    fn size_in_sectors(&self) -> u64 {
        (self.data.len() / SECTOR_SIZE) as u64
    }

    fn name(&self) -> &str {
        "ramdisk"
    }
}
