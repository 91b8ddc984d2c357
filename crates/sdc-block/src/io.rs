use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use memmap2::MmapOptions;
use tracing::debug;

use crate::data::{BlockData, WeakBlockData};
use crate::error::BlockResult;
use crate::header::BLOCK_MAGIC;

/// Storage a [`BlockFile`] can sit on.
pub trait Backing: Read + Write + Seek + Send {
    /// The underlying file, when there is one that can be memory-mapped.
    fn as_file(&self) -> Option<&File> {
        None
    }

    /// Cut the storage to `len` bytes. Returns `false` if unsupported.
    fn truncate(&mut self, _len: u64) -> io::Result<bool> {
        Ok(false)
    }
}

impl Backing for File {
    fn as_file(&self) -> Option<&File> {
        Some(self)
    }

    fn truncate(&mut self, len: u64) -> io::Result<bool> {
        self.set_len(len)?;
        Ok(true)
    }
}

impl Backing for Cursor<Vec<u8>> {
    fn truncate(&mut self, len: u64) -> io::Result<bool> {
        self.get_mut().truncate(len as usize);
        Ok(true)
    }
}

struct ViewEntry {
    offset: u64,
    len: u64,
    data: WeakBlockData,
}

impl ViewEntry {
    fn overlaps(&self, start: u64, end: u64) -> bool {
        start < end && self.offset < end && start < self.offset + self.len
    }
}

/// A mapping handed out by [`BlockFile::map`] that is still referenced.
#[derive(Clone, Debug)]
pub struct MappedView {
    pub offset: u64,
    pub len: u64,
    pub data: BlockData,
}

impl MappedView {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    /// Handles on the mapped bytes besides this view's own.
    pub fn holders(&self) -> usize {
        self.data.handle_count() - 1
    }
}

/// Shared handle onto the file a document's blocks live in.
///
/// Clones refer to the same storage. Positional operations (`read_at`,
/// `write_at`) seek and transfer under one lock, so lazily loading blocks
/// never disturb a writer working through the same handle.
///
/// Every mapping returned by [`map`](Self::map) is tracked until its last
/// handle is dropped. Writes and truncation that would touch a tracked range
/// fail instead of changing bytes under a live view.
#[derive(Clone)]
pub struct BlockFile {
    inner: Arc<Mutex<Box<dyn Backing>>>,
    views: Arc<Mutex<Vec<ViewEntry>>>,
    uri: Option<String>,
}

impl BlockFile {
    pub fn new(backing: impl Backing + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(backing))),
            views: Arc::new(Mutex::new(Vec::new())),
            uri: None,
        }
    }

    /// In-memory storage seeded with `bytes`, positioned at the start.
    pub fn in_memory(bytes: Vec<u8>) -> Self {
        Self::new(Cursor::new(bytes))
    }

    /// Open an existing file for reading and writing.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self::new(file).with_uri(path_uri(path)?))
    }

    /// Create (or truncate) a file for reading and writing.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::new(file).with_uri(path_uri(path)?))
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// URI of the storage, if known.
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    /// Whether both handles refer to the same storage.
    pub fn same_as(&self, other: &BlockFile) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn Backing>> {
        self.inner.lock().expect("block file lock poisoned")
    }

    // Lock order: `inner` before `views`.
    fn views(&self) -> MutexGuard<'_, Vec<ViewEntry>> {
        let mut views = self.views.lock().expect("mapped views lock poisoned");
        views.retain(|v| v.data.is_live());
        views
    }

    fn ensure_unmapped(&self, start: u64, end: u64) -> io::Result<()> {
        match self.views().iter().find(|v| v.overlaps(start, end)) {
            Some(v) => Err(io::Error::other(format!(
                "bytes {}..{} are held by a mapped view",
                v.offset,
                v.offset + v.len
            ))),
            None => Ok(()),
        }
    }

    /// Mappings of this storage that are still referenced, oldest first.
    pub fn mapped_views(&self) -> Vec<MappedView> {
        self.views()
            .iter()
            .filter_map(|v| {
                Some(MappedView {
                    offset: v.offset,
                    len: v.len,
                    data: v.data.upgrade()?,
                })
            })
            .collect()
    }

    pub fn tell(&self) -> io::Result<u64> {
        self.lock().stream_position()
    }

    pub fn seek(&self, pos: u64) -> io::Result<()> {
        self.lock().seek(SeekFrom::Start(pos)).map(|_| ())
    }

    /// Total length; the current position is preserved.
    pub fn len(&self) -> io::Result<u64> {
        let mut guard = self.lock();
        let pos = guard.stream_position()?;
        let len = guard.seek(SeekFrom::End(0))?;
        guard.seek(SeekFrom::Start(pos))?;
        Ok(len)
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Fill `buf` from `offset`. Fails with `UnexpectedEof` on a short read.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut guard = self.lock();
        guard.seek(SeekFrom::Start(offset))?;
        guard.read_exact(buf)
    }

    /// Read up to `len` bytes from `offset`; shorter only at end-of-file.
    pub fn read_up_to(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut guard = self.lock();
        guard.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(len);
        (&mut *guard).take(len as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Everything from `offset` to end-of-file.
    pub fn read_to_end_from(&self, offset: u64) -> io::Result<Vec<u8>> {
        let mut guard = self.lock();
        guard.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        guard.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Write `data` at `offset`, leaving the position just after it. Fails
    /// if the range overlaps a live mapped view.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut guard = self.lock();
        self.ensure_unmapped(offset, offset.saturating_add(data.len() as u64))?;
        guard.seek(SeekFrom::Start(offset))?;
        guard.write_all(data)
    }

    pub fn flush(&self) -> io::Result<()> {
        self.lock().flush()
    }

    /// Cut the storage to `len` bytes. Returns `false` if unsupported.
    /// Fails if a live mapped view extends past `len`.
    pub fn truncate(&self, len: u64) -> io::Result<bool> {
        let mut guard = self.lock();
        self.ensure_unmapped(len, u64::MAX)?;
        guard.flush()?;
        guard.truncate(len)
    }

    /// Map `len` bytes at `offset` read-only as a tracked view. Returns
    /// `None` when the storage is not a file or the range is empty, and
    /// `UnexpectedEof` when the range runs past the end of the file.
    pub fn map(&self, offset: u64, len: usize) -> io::Result<Option<BlockData>> {
        if len == 0 {
            return Ok(None);
        }
        let mut guard = self.lock();
        guard.flush()?;
        let Some(file) = guard.as_file() else {
            return Ok(None);
        };
        let file_len = file.metadata()?.len();
        let end = offset.checked_add(len as u64);
        if end.map_or(true, |end| end > file_len) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("cannot map {len} bytes at {offset}: file is {file_len} bytes"),
            ));
        }
        // SAFETY: the mapping is read-only and lies within the file. It is
        // registered below while the handle lock is still held, and from then
        // on `write_at` and `truncate` refuse to touch its range until the
        // last handle on it is dropped.
        let map = unsafe { MmapOptions::new().offset(offset).len(len).map(file)? };
        let data = BlockData::mapped(map);
        self.views().push(ViewEntry {
            offset,
            len: len as u64,
            data: data.downgrade(),
        });
        debug!(offset, len, "mapped block range");
        Ok(Some(data))
    }

    /// Copy out the whole storage. Intended for tests and tools.
    pub fn contents(&self) -> io::Result<Vec<u8>> {
        self.read_to_end_from(0)
    }
}

fn path_uri(path: &Path) -> io::Result<String> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(format!("file://{}", absolute.display()))
}

/// Scan forward from the current position for the first block magic.
///
/// On success the handle is positioned at the magic and its offset is
/// returned; `None` means no block was found before end-of-file.
pub fn seek_to_first_block(file: &BlockFile, chunk_size: usize) -> BlockResult<Option<u64>> {
    let chunk_size = chunk_size.max(BLOCK_MAGIC.len());
    let mut pos = file.tell()?;
    let mut window: Vec<u8> = Vec::new();
    let mut window_start = pos;
    loop {
        let chunk = file.read_up_to(pos, chunk_size)?;
        if chunk.is_empty() {
            return Ok(None);
        }
        pos += chunk.len() as u64;
        window.extend_from_slice(&chunk);
        if let Some(found) = window
            .windows(BLOCK_MAGIC.len())
            .position(|w| w == BLOCK_MAGIC)
        {
            let offset = window_start + found as u64;
            file.seek(offset)?;
            debug!(offset, "found first block");
            return Ok(Some(offset));
        }
        let keep = BLOCK_MAGIC.len() - 1;
        let drop = window.len().saturating_sub(keep);
        window.drain(..drop);
        window_start += drop as u64;
    }
}
