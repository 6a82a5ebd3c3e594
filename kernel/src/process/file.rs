// kernel/src/process/file.rs
// Archivos vistos desde la VM: lectura/escritura posicional, largo y reopen.
//
// The on-disk filesystem is not part of this crate.  The VM core only needs
// the positional contract below; `MemFile` is the RAM implementation used
// when no filesystem is mounted and by the tests.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

// ============================================================================
// ERRORES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileError {
    BadFileDescriptor,
    InvalidArgument,
    IOError,
    NotSupported,
}

pub type FileResult<T> = Result<T, FileError>;

// ============================================================================
// TRAIT: BackingFile
// ============================================================================

/// A file that can back memory: program images and mmap'd files.
///
/// Reads and writes are positional, so several mappings can share one open
/// file without a shared cursor.
pub trait BackingFile: Send + Sync {
    /// Lee hasta `buf.len()` bytes desde `offset`.
    /// Retorna el número de bytes leídos (0 en EOF).
    fn read_at(&self, buf: &mut [u8], offset: u64) -> FileResult<usize>;

    /// Escribe `buf` en `offset`.  Retorna el número de bytes escritos.
    fn write_at(&self, buf: &[u8], offset: u64) -> FileResult<usize>;

    /// Current length in bytes.
    fn length(&self) -> u64;

    /// New handle onto the same file whose lifetime is independent of `self`.
    fn reopen(&self) -> FileResult<Arc<dyn BackingFile>>;

    /// Nombre para debugging
    fn name(&self) -> &str {
        "<unknown>"
    }
}

// ============================================================================
// MemFile
// ============================================================================

/// File whose contents live in kernel memory.
///
/// Handles produced by `reopen` share the contents but are distinct
/// objects, like two `open()`s of the same inode.
pub struct MemFile {
    name: &'static str,
    data: Arc<Mutex<Vec<u8>>>,
    writable: bool,
}

impl MemFile {
    pub fn new(name: &'static str, contents: &[u8]) -> Self {
        Self {
            name,
            data: Arc::new(Mutex::new(contents.to_vec())),
            writable: true,
        }
    }

    /// Handle that rejects writes (a program image, for instance).
    pub fn read_only(name: &'static str, contents: &[u8]) -> Self {
        Self {
            writable: false,
            ..Self::new(name, contents)
        }
    }

    /// Copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Do `self` and `other` refer to the same underlying file?
    pub fn same_file(&self, other: &MemFile) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl BackingFile for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> FileResult<usize> {
        let data = self.data.lock();
        let start = offset as usize;
        if start >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> FileResult<usize> {
        if !self.writable {
            return Err(FileError::NotSupported);
        }
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .ok_or(FileError::InvalidArgument)?;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn length(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn reopen(&self) -> FileResult<Arc<dyn BackingFile>> {
        Ok(Arc::new(MemFile {
            name: self.name,
            data: Arc::clone(&self.data),
            writable: self.writable,
        }))
    }

    fn name(&self) -> &str {
        self.name
    }
}

// ============================================================================
// TABLA DE FILE DESCRIPTORS
// ============================================================================

const MAX_FILES: usize = 16;

/// First descriptor handed out; 0 and 1 are the console.
pub const FIRST_FILE_FD: usize = 2;

/// Tabla de archivos abiertos por un proceso
#[derive(Clone)]
pub struct FileTable {
    files: [Option<Arc<dyn BackingFile>>; MAX_FILES],
}

impl FileTable {
    /// Crea una tabla vacía
    pub const fn new() -> Self {
        const NONE: Option<Arc<dyn BackingFile>> = None;
        Self {
            files: [NONE; MAX_FILES],
        }
    }

    /// Obtiene un file handle.  Console descriptors are not files.
    pub fn get(&self, fd: usize) -> FileResult<&Arc<dyn BackingFile>> {
        if fd < FIRST_FILE_FD || fd >= MAX_FILES {
            return Err(FileError::BadFileDescriptor);
        }
        self.files[fd].as_ref().ok_or(FileError::BadFileDescriptor)
    }

    /// Asigna un nuevo file handle al primer FD disponible
    pub fn allocate(&mut self, handle: Arc<dyn BackingFile>) -> FileResult<usize> {
        for (fd, slot) in self.files.iter_mut().enumerate().skip(FIRST_FILE_FD) {
            if slot.is_none() {
                *slot = Some(handle);
                return Ok(fd);
            }
        }
        Err(FileError::InvalidArgument) // Too many files open
    }

    /// Cierra un file descriptor
    pub fn close(&mut self, fd: usize) -> FileResult<()> {
        if fd < FIRST_FILE_FD || fd >= MAX_FILES {
            return Err(FileError::BadFileDescriptor);
        }
        self.files[fd]
            .take()
            .map(|_| ())
            .ok_or(FileError::BadFileDescriptor)
    }

    pub fn clear(&mut self) {
        for slot in self.files.iter_mut() {
            *slot = None;
        }
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}
