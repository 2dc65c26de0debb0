//! Byte buffers that segments encode into
//!
//! A `Buffer` is a cheap, cloneable handle to a fixed-size byte region. The
//! region may live on the heap or inside a memory-mapped backing file; the
//! codec only ever sees `read_at` / `write_at`, so both behave identically.

use memmap2::MmapMut;
use parking_lot::RwLock;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A fixed-size region of bytes
pub trait ByteRegion: Send + Sync {
    /// Region size in bytes
    fn len(&self) -> usize;

    /// Copy `dst.len()` bytes starting at `offset` into `dst`
    fn read_at(&self, offset: usize, dst: &mut [u8]);

    /// Copy `src` into the region starting at `offset`
    fn write_at(&self, offset: usize, src: &[u8]);

    /// Push pending writes to durable storage
    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Heap-backed region, used by the in-memory allocator and compaction trials
pub struct HeapRegion {
    bytes: RwLock<Box<[u8]>>,
}

impl HeapRegion {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: RwLock::new(vec![0u8; len].into_boxed_slice()),
        }
    }
}

impl ByteRegion for HeapRegion {
    fn len(&self) -> usize {
        self.bytes.read().len()
    }

    fn read_at(&self, offset: usize, dst: &mut [u8]) {
        let bytes = self.bytes.read();
        dst.copy_from_slice(&bytes[offset..offset + dst.len()]);
    }

    fn write_at(&self, offset: usize, src: &[u8]) {
        let mut bytes = self.bytes.write();
        bytes[offset..offset + src.len()].copy_from_slice(src);
    }
}

/// One memory-mapped backing file shared by many regions
pub struct MappedFile {
    path: PathBuf,
    mmap: RwLock<MmapMut>,
}

impl MappedFile {
    /// Map `path`, creating or extending it to `len` bytes
    pub fn open(path: &Path, len: u64) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if file.metadata()?.len() < len {
            file.set_len(len)?;
        }
        // SAFETY: the file is owned by this process' allocator and is never
        // truncated while mapped.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            path: path.to_path_buf(),
            mmap: RwLock::new(mmap),
        })
    }

    pub fn len(&self) -> usize {
        self.mmap.read().len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush(&self) -> io::Result<()> {
        self.mmap.read().flush()
    }
}

/// A slice of a mapped backing file
pub struct MappedRegion {
    file: Arc<MappedFile>,
    offset: usize,
    len: usize,
}

impl MappedRegion {
    pub fn new(file: Arc<MappedFile>, offset: usize, len: usize) -> Self {
        Self { file, offset, len }
    }
}

impl ByteRegion for MappedRegion {
    fn len(&self) -> usize {
        self.len
    }

    fn read_at(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.len, "read past end of region");
        let start = self.offset + offset;
        let mmap = self.file.mmap.read();
        dst.copy_from_slice(&mmap[start..start + dst.len()]);
    }

    fn write_at(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.len, "write past end of region");
        let start = self.offset + offset;
        let mut mmap = self.file.mmap.write();
        mmap[start..start + src.len()].copy_from_slice(src);
    }

    fn flush(&self) -> io::Result<()> {
        self.file
            .mmap
            .read()
            .flush_range(self.offset, self.len)
    }
}

/// Shared handle to a byte region
#[derive(Clone)]
pub struct Buffer {
    region: Arc<dyn ByteRegion>,
}

impl Buffer {
    pub fn new(region: Arc<dyn ByteRegion>) -> Self {
        Self { region }
    }

    /// A private heap buffer that no allocator tracks
    pub fn scratch(len: usize) -> Self {
        Self::new(Arc::new(HeapRegion::new(len)))
    }

    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    pub fn read_at(&self, offset: usize, dst: &mut [u8]) {
        self.region.read_at(offset, dst)
    }

    pub fn write_at(&self, offset: usize, src: &[u8]) {
        self.region.write_at(offset, src)
    }

    pub fn get_u8(&self, offset: usize) -> u8 {
        let mut b = [0u8; 1];
        self.read_at(offset, &mut b);
        b[0]
    }

    pub fn put_u8(&self, offset: usize, value: u8) {
        self.write_at(offset, &[value]);
    }

    pub fn get_u32(&self, offset: usize) -> u32 {
        let mut b = [0u8; 4];
        self.read_at(offset, &mut b);
        u32::from_le_bytes(b)
    }

    pub fn put_u32(&self, offset: usize, value: u32) {
        self.write_at(offset, &value.to_le_bytes());
    }

    pub fn get_i64(&self, offset: usize) -> i64 {
        let mut b = [0u8; 8];
        self.read_at(offset, &mut b);
        i64::from_le_bytes(b)
    }

    pub fn put_i64(&self, offset: usize, value: i64) {
        self.write_at(offset, &value.to_le_bytes());
    }

    /// Copy the first `len` bytes out
    pub fn to_vec(&self, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.read_at(0, &mut out);
        out
    }

    pub fn flush(&self) -> io::Result<()> {
        self.region.flush()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.capacity())
            .finish()
    }
}
