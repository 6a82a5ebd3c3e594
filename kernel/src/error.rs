// kernel/src/error.rs
//
// One error type for the whole VM core.  Every variant belongs to exactly
// one class; the trap layer kills the process on any fault error, the
// syscall layer turns errors into negative errno values.

use core::fmt;

use crate::drivers::BlockError;
use crate::memory::paging::{MapError, UnmapError};
use crate::process::file::FileError;
use crate::process::syscall::errno;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad arguments.  Reported to the caller, does not kill anything by itself.
    Precondition,
    /// Disallowed access.  The faulting process is terminated.
    Protection,
    /// No frame, no victim, no swap slot.  Recoverable.
    Exhaustion,
    /// The file or swap device failed a transfer.
    Io,
    /// Bookkeeping bug.
    Invariant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    // ── precondition ────────────────────────────────────────────────
    NullAddress,
    KernelAddress,
    Misaligned,
    InvalidLength,
    AlreadyMapped,
    NotMapped,
    BadFileDescriptor,
    InvalidConfig,

    // ── protection ──────────────────────────────────────────────────
    WriteProtected,
    ProtectionViolation,
    SegmentationFault,
    ReservedBit,

    // ── exhaustion ──────────────────────────────────────────────────
    OutOfFrames,
    SwapFull,

    // ── io ──────────────────────────────────────────────────────────
    File(FileError),
    Device(BlockError),

    // ── invariant ───────────────────────────────────────────────────
    SlotNotInUse(usize),
    NotResident,
    AlreadyResident,
    UntrackedFrame,
    PageTable,
}

pub type VmResult<T> = Result<T, VmError>;

impl VmError {
    pub fn class(&self) -> ErrorClass {
        match self {
            VmError::NullAddress
            | VmError::KernelAddress
            | VmError::Misaligned
            | VmError::InvalidLength
            | VmError::AlreadyMapped
            | VmError::NotMapped
            | VmError::BadFileDescriptor
            | VmError::InvalidConfig => ErrorClass::Precondition,
            VmError::WriteProtected
            | VmError::ProtectionViolation
            | VmError::SegmentationFault
            | VmError::ReservedBit => ErrorClass::Protection,
            VmError::OutOfFrames | VmError::SwapFull => ErrorClass::Exhaustion,
            VmError::File(_) | VmError::Device(_) => ErrorClass::Io,
            VmError::SlotNotInUse(_)
            | VmError::NotResident
            | VmError::AlreadyResident
            | VmError::UntrackedFrame
            | VmError::PageTable => ErrorClass::Invariant,
        }
    }

    /// Protection and invariant errors are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self.class(), ErrorClass::Protection | ErrorClass::Invariant)
    }

    /// Negative errno for the syscall return register.
    pub fn errno(&self) -> i64 {
        match self {
            VmError::BadFileDescriptor => errno::EBADF,
            VmError::AlreadyMapped => errno::EEXIST,
            VmError::OutOfFrames | VmError::SwapFull => errno::ENOMEM,
            VmError::File(_) | VmError::Device(_) => errno::EIO,
            _ => match self.class() {
                ErrorClass::Precondition => errno::EINVAL,
                ErrorClass::Protection => errno::EFAULT,
                _ => errno::EIO,
            },
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::NullAddress => write!(f, "null address"),
            VmError::KernelAddress => write!(f, "address is not in user space"),
            VmError::Misaligned => write!(f, "address or offset not page aligned"),
            VmError::InvalidLength => write!(f, "invalid length"),
            VmError::AlreadyMapped => write!(f, "a page is already present at that address"),
            VmError::NotMapped => write!(f, "no mapping at that address"),
            VmError::BadFileDescriptor => write!(f, "bad file descriptor"),
            VmError::InvalidConfig => write!(f, "invalid address-space layout"),
            VmError::WriteProtected => write!(f, "write to a read-only page"),
            VmError::ProtectionViolation => write!(f, "protection violation on a present page"),
            VmError::SegmentationFault => write!(f, "segmentation fault: no page for address"),
            VmError::ReservedBit => write!(f, "reserved bit set in page table entry"),
            VmError::OutOfFrames => write!(f, "no free frame and no evictable victim"),
            VmError::SwapFull => write!(f, "swap device full"),
            VmError::File(e) => write!(f, "file I/O failed: {:?}", e),
            VmError::Device(e) => write!(f, "swap device I/O failed: {:?}", e),
            VmError::SlotNotInUse(slot) => write!(f, "swap slot {} is not in use", slot),
            VmError::NotResident => write!(f, "page is not resident"),
            VmError::AlreadyResident => write!(f, "page is already resident"),
            VmError::UntrackedFrame => write!(f, "frame missing from the frame table"),
            VmError::PageTable => write!(f, "page table out of sync with page descriptor"),
        }
    }
}

impl From<FileError> for VmError {
    fn from(err: FileError) -> Self {
        VmError::File(err)
    }
}

impl From<BlockError> for VmError {
    fn from(err: BlockError) -> Self {
        VmError::Device(err)
    }
}

impl From<MapError> for VmError {
    fn from(err: MapError) -> Self {
        match err {
            MapError::FrameAllocationFailed => VmError::OutOfFrames,
            MapError::PageAlreadyMapped => VmError::PageTable,
        }
    }
}

impl From<UnmapError> for VmError {
    fn from(err: UnmapError) -> Self {
        match err {
            UnmapError::PageNotMapped => VmError::PageTable,
        }
    }
}
