// kernel/src/memory/page.rs
//
// Page descriptors.
//
// A page is born `Uninit` (lazily, by the loader, mmap or stack growth)
// and becomes `Anon` or `File` the first time it is faulted in.  The
// transition happens once; after it the page moves between "resident"
// (owns a Frame) and "not resident" (content in swap or in its file).
//
//   Uninit ──first swap_in──► Anon  ⇄ swap slot
//                        └──► File  ⇄ backing file (written back if dirty)

use alloc::sync::Arc;
use bitflags::bitflags;
use core::fmt;
use spin::Mutex;
use x86_64::VirtAddr;

use crate::error::{VmError, VmResult};
use crate::process::file::BackingFile;

use super::frame_table::{Frame, FrameTable};
use super::paging::PageMapper;
use super::swap::SwapTable;
use super::{UserPage, PAGE_SIZE};

/// Handle to a page shared by its SPT and the frame table.
pub type PageRef = Arc<Mutex<Page>>;

bitflags! {
    /// Extra bits carried by a page, independent of its variant.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageMarkers: u8 {
        /// Created by stack growth.
        const STACK = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmType {
    Anon,
    File,
}

// ============================================================================
// Initializers
// ============================================================================

/// Fills a freshly claimed frame the first time an `Uninit` page is
/// faulted in (the loader's "copy this segment" step, for instance).
pub trait PageInit: Send + Sync {
    fn init(&self, upage: UserPage, target: &PageTarget, frame: &mut [u8]) -> VmResult<()>;
}

impl<F> PageInit for F
where
    F: Fn(UserPage, &PageTarget, &mut [u8]) -> VmResult<()> + Send + Sync,
{
    fn init(&self, upage: UserPage, target: &PageTarget, frame: &mut [u8]) -> VmResult<()> {
        self(upage, target, frame)
    }
}

// ============================================================================
// File segments
// ============================================================================

/// Where a file-backed page's bytes live: `read_bytes` from `file` at
/// `offset`, then `zero_bytes` of zeros.
#[derive(Clone)]
pub struct FileSegment {
    pub file: Arc<dyn BackingFile>,
    pub offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

impl FileSegment {
    pub fn new(file: Arc<dyn BackingFile>, offset: u64, read_bytes: usize) -> Self {
        let read_bytes = read_bytes.min(PAGE_SIZE);
        Self {
            file,
            offset,
            read_bytes,
            zero_bytes: PAGE_SIZE - read_bytes,
        }
    }

    pub fn load(&self, frame: &mut [u8]) -> VmResult<()> {
        let (head, tail) = frame.split_at_mut(self.read_bytes);
        let n = self.file.read_at(head, self.offset)?;
        if n != self.read_bytes {
            log::warn!(
                "{}: short read at {:#x} ({} of {})",
                self.file.name(),
                self.offset,
                n,
                self.read_bytes
            );
            head[n..].fill(0);
        }
        tail.fill(0);
        Ok(())
    }

    pub fn write_back(&self, frame: &[u8]) -> VmResult<()> {
        if self.read_bytes == 0 {
            return Ok(());
        }
        self.file.write_at(&frame[..self.read_bytes], self.offset)?;
        Ok(())
    }
}

impl fmt::Debug for FileSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSegment")
            .field("file", &self.file.name())
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .finish()
    }
}

// ============================================================================
// Variants
// ============================================================================

/// What an `Uninit` page turns into.
#[derive(Debug, Clone)]
pub enum PageTarget {
    Anon,
    File(FileSegment),
}

impl PageTarget {
    pub fn vm_type(&self) -> VmType {
        match self {
            PageTarget::Anon => VmType::Anon,
            PageTarget::File(_) => VmType::File,
        }
    }

    fn promote(&self) -> PageKind {
        match self {
            PageTarget::Anon => PageKind::Anon { slot: None },
            PageTarget::File(segment) => PageKind::File(segment.clone()),
        }
    }
}

pub enum PageKind {
    Uninit {
        init: Option<Arc<dyn PageInit>>,
        target: PageTarget,
    },
    /// `slot` is set while the content lives in swap.
    Anon { slot: Option<usize> },
    File(FileSegment),
}

impl fmt::Debug for PageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageKind::Uninit { init, target } => f
                .debug_struct("Uninit")
                .field("init", &init.is_some())
                .field("target", target)
                .finish(),
            PageKind::Anon { slot } => f.debug_struct("Anon").field("slot", slot).finish(),
            PageKind::File(segment) => f.debug_tuple("File").field(segment).finish(),
        }
    }
}

// ============================================================================
// Page
// ============================================================================

#[derive(Debug)]
pub struct Page {
    upage: UserPage,
    writable: bool,
    markers: PageMarkers,
    kind: PageKind,
    frame: Option<Frame>,
}

impl Page {
    pub fn new_uninit(
        upage: UserPage,
        writable: bool,
        target: PageTarget,
        init: Option<Arc<dyn PageInit>>,
    ) -> Self {
        Self {
            upage,
            writable,
            markers: PageMarkers::empty(),
            kind: PageKind::Uninit { init, target },
            frame: None,
        }
    }

    /// Non-resident copy of a page whose content lives elsewhere; used
    /// by fork for uninit and evicted file pages.
    pub(crate) fn clone_lazy(&self) -> Option<Self> {
        let kind = match &self.kind {
            PageKind::Uninit { init, target } => PageKind::Uninit {
                init: init.clone(),
                target: target.clone(),
            },
            PageKind::File(segment) if self.frame.is_none() => PageKind::File(segment.clone()),
            _ => return None,
        };
        Some(Self {
            upage: self.upage,
            writable: self.writable,
            markers: self.markers,
            kind,
            frame: None,
        })
    }

    /// Resident copy for fork: same variant, no swap slot, content
    /// already in `frame`.
    pub(crate) fn clone_resident(&self, frame: Frame) -> Self {
        let kind = match &self.kind {
            PageKind::Uninit { init, target } => PageKind::Uninit {
                init: init.clone(),
                target: target.clone(),
            },
            PageKind::Anon { .. } => PageKind::Anon { slot: None },
            PageKind::File(segment) => PageKind::File(segment.clone()),
        };
        Self {
            upage: self.upage,
            writable: self.writable,
            markers: self.markers,
            kind,
            frame: Some(frame),
        }
    }

    pub fn upage(&self) -> UserPage {
        self.upage
    }

    pub fn addr(&self) -> VirtAddr {
        self.upage.start_address()
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn markers(&self) -> PageMarkers {
        self.markers
    }

    pub fn mark(&mut self, markers: PageMarkers) {
        self.markers |= markers;
    }

    pub fn kind(&self) -> &PageKind {
        &self.kind
    }

    pub fn is_uninit(&self) -> bool {
        matches!(self.kind, PageKind::Uninit { .. })
    }

    /// Type the page has, or will have once faulted in.
    pub fn target_type(&self) -> VmType {
        match &self.kind {
            PageKind::Uninit { target, .. } => target.vm_type(),
            PageKind::Anon { .. } => VmType::Anon,
            PageKind::File(_) => VmType::File,
        }
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    pub fn frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    pub fn swap_slot(&self) -> Option<usize> {
        match self.kind {
            PageKind::Anon { slot } => slot,
            _ => None,
        }
    }

    /// File location of the page's content, for file pages and uninit
    /// pages that will become one.
    pub fn segment(&self) -> Option<&FileSegment> {
        match &self.kind {
            PageKind::File(segment) => Some(segment),
            PageKind::Uninit {
                target: PageTarget::File(segment),
                ..
            } => Some(segment),
            _ => None,
        }
    }

    /// Point the page's file segment at `file`.  Fork uses it to move a
    /// copied page onto the child's own handle.
    pub(crate) fn rebind_file(&mut self, file: &Arc<dyn BackingFile>) {
        match &mut self.kind {
            PageKind::File(segment)
            | PageKind::Uninit {
                target: PageTarget::File(segment),
                ..
            } => segment.file = file.clone(),
            _ => {}
        }
    }

    pub(crate) fn attach(&mut self, frame: Frame) -> VmResult<()> {
        if self.frame.is_some() {
            return Err(VmError::AlreadyResident);
        }
        self.frame = Some(frame);
        Ok(())
    }

    pub(crate) fn detach(&mut self) -> Option<Frame> {
        self.frame.take()
    }

    // ====================================================================
    // swap_in / swap_out / destroy
    // ====================================================================

    /// Fill the attached frame with the page's content.  An `Uninit` page
    /// becomes its target variant only if this succeeds.
    pub fn swap_in(&mut self, swap: &mut SwapTable) -> VmResult<()> {
        let frame = self.frame.as_mut().ok_or(VmError::NotResident)?;
        let buf = frame.bytes_mut();

        let next = match &self.kind {
            PageKind::Uninit { init, target } => {
                match (init, target) {
                    (Some(init), _) => init.init(self.upage, target, buf)?,
                    (None, PageTarget::Anon) => buf.fill(0),
                    (None, PageTarget::File(segment)) => segment.load(buf)?,
                }
                target.promote()
            }
            PageKind::Anon { slot } => {
                // Not resident and no slot: the content is gone.
                let slot = slot.ok_or(VmError::NotResident)?;
                swap.swap_in(slot, buf)?;
                PageKind::Anon { slot: None }
            }
            PageKind::File(segment) => {
                segment.load(buf)?;
                return Ok(());
            }
        };

        self.kind = next;
        Ok(())
    }

    /// Save the content so the frame can be reused, unmap the page and
    /// hand the frame back.
    pub fn swap_out(&mut self, mapper: &mut dyn PageMapper, swap: &mut SwapTable) -> VmResult<Frame> {
        let frame = self.frame.as_ref().ok_or(VmError::NotResident)?;

        match &mut self.kind {
            // Never promoted; the initializer runs again on the next fault.
            PageKind::Uninit { .. } => {}
            PageKind::Anon { slot } => {
                *slot = Some(swap.swap_out(frame.bytes())?);
            }
            PageKind::File(segment) => {
                if mapper.is_dirty(self.upage) {
                    segment.write_back(frame.bytes())?;
                    mapper.set_dirty(self.upage, false);
                }
            }
        }

        if let Err(err) = mapper.unmap(self.upage) {
            // Still resident, so the slot just written is not needed.
            if let PageKind::Anon { slot } = &mut self.kind {
                if let Some(slot) = slot.take() {
                    let _ = swap.free(slot);
                }
            }
            return Err(err.into());
        }
        self.frame.take().ok_or(VmError::NotResident)
    }

    /// Release everything the page holds: dirty file content is written
    /// back, a swap slot is freed, the frame is unmapped and returned.
    /// Calling it again on a destroyed page does nothing.
    pub fn destroy(
        &mut self,
        mapper: &mut dyn PageMapper,
        frames: &mut FrameTable,
        swap: &mut SwapTable,
    ) -> VmResult<()> {
        let mut result = Ok(());

        match &mut self.kind {
            PageKind::File(segment) => {
                if let Some(frame) = &self.frame {
                    if mapper.is_dirty(self.upage) {
                        result = segment.write_back(frame.bytes());
                        mapper.set_dirty(self.upage, false);
                    }
                }
            }
            PageKind::Anon { slot } => {
                if let Some(slot) = slot.take() {
                    result = swap.free(slot);
                }
            }
            PageKind::Uninit { .. } => {}
        }

        if let Some(frame) = self.frame.take() {
            let unmapped = mapper.unmap(self.upage);
            frames.release(frame);
            unmapped?;
        }
        result
    }
}
