use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};
use lru::LruCache;

use crate::error::{Result, StoneError};
use crate::stats::Statistics;

pub type PageId = u64;

/// "SDB1", little-endian in the first four header bytes.
pub const DB_MAGIC: u32 = 0x5344_4231;
pub const DB_VERSION: u32 = 1;

/// Structured file header in the first bytes of page 0:
/// magic(4) + version(4) + page_size(4) + pad(4) + page_count(8) + freelist_head(8).
pub const DB_HEADER_SIZE: usize = 32;

pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Smallest page size accepted when reading an existing header.
const MIN_OPEN_PAGE_SIZE: u32 = 512;

/// Bounded page cache capacity.
const CACHE_MAX: usize = 256;

/// Freelist terminator.
const NO_FREE_PAGE: i64 = -1;

struct CachedPage {
    data: Vec<u8>,
    dirty: bool,
}

/// Owns the database file: the header, a free-list of reclaimed page ids
/// threaded through the freed pages on disk, and a bounded LRU page cache.
///
/// The cache is not write-through: `write` marks the cached copy dirty and
/// persistence happens on `flush_page`, `flush_all`, `sync`, or eviction.
pub struct Pager {
    file: File,
    page_size: usize,
    page_count: u64,
    freelist_head: i64,
    cache: LruCache<PageId, CachedPage>,
    stats: Arc<Statistics>,
    closed: bool,
}

impl Pager {
    /// Open the database file, creating it when missing and allowed.
    ///
    /// On create, `page_size` must be a power of two >= 4096 and is fixed for
    /// the life of the file. On open the header's page size wins and the
    /// parameter is ignored.
    pub fn open(
        path: &Path,
        create_if_missing: bool,
        page_size: u32,
        stats: Arc<Statistics>,
    ) -> Result<Self> {
        if path.exists() {
            Self::open_existing(path, stats)
        } else if create_if_missing {
            Self::create(path, page_size, stats)
        } else {
            Err(StoneError::FileNotFound(path.display().to_string()))
        }
    }

    fn create(path: &Path, page_size: u32, stats: Arc<Statistics>) -> Result<Self> {
        if page_size < DEFAULT_PAGE_SIZE || !page_size.is_power_of_two() {
            return Err(StoneError::Storage(format!(
                "page size must be a power of two >= {}, got {}",
                DEFAULT_PAGE_SIZE, page_size
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let mut pager = Pager {
            file,
            page_size: page_size as usize,
            page_count: 1, // page 0 carries the header
            freelist_head: NO_FREE_PAGE,
            cache: LruCache::new(NonZeroUsize::new(CACHE_MAX).unwrap()),
            stats,
            closed: false,
        };

        // Page 0: header followed by zeros.
        let mut page0 = vec![0u8; pager.page_size];
        pager.encode_header(&mut page0);
        pager.file.seek(SeekFrom::Start(0))?;
        pager.file.write_all(&page0)?;
        pager.file.sync_all()?;

        info!("created database {} (page size {})", path.display(), page_size);
        Ok(pager)
    }

    fn open_existing(path: &Path, stats: Arc<Statistics>) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header = [0u8; DB_HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)
            .map_err(|_| StoneError::CorruptHeader("file shorter than header".into()))?;

        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
        let page_size = u32::from_le_bytes(header[8..12].try_into().unwrap());
        let page_count = u64::from_le_bytes(header[16..24].try_into().unwrap());
        let freelist_head = i64::from_le_bytes(header[24..32].try_into().unwrap());

        if magic != DB_MAGIC {
            return Err(StoneError::CorruptHeader(format!(
                "bad magic {:#010x}",
                magic
            )));
        }
        if version != DB_VERSION {
            return Err(StoneError::CorruptHeader(format!(
                "unsupported version {}",
                version
            )));
        }
        if page_size < MIN_OPEN_PAGE_SIZE || !page_size.is_power_of_two() {
            return Err(StoneError::CorruptHeader(format!(
                "implausible page size {}",
                page_size
            )));
        }
        if page_count == 0 {
            return Err(StoneError::CorruptHeader("zero page count".into()));
        }

        info!(
            "opened database {} ({} pages of {} bytes)",
            path.display(),
            page_count,
            page_size
        );

        Ok(Pager {
            file,
            page_size: page_size as usize,
            page_count,
            freelist_head,
            cache: LruCache::new(NonZeroUsize::new(CACHE_MAX).unwrap()),
            stats,
            closed: false,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    /// Allocate a page id, reusing the free-list head when available.
    /// The returned page's content is undefined; callers must overwrite it.
    pub fn allocate(&mut self) -> Result<PageId> {
        let page_id = if self.freelist_head != NO_FREE_PAGE {
            let page_id = self.freelist_head as PageId;
            self.freelist_head = self.read_free_link(page_id)?;
            page_id
        } else {
            let page_id = self.page_count;
            self.page_count += 1;
            // Extend the file so the new page is addressable.
            let zeros = vec![0u8; self.page_size];
            self.file
                .seek(SeekFrom::Start(page_id * self.page_size as u64))?;
            self.file.write_all(&zeros)?;
            page_id
        };
        self.write_header()?;
        debug!("allocated page {}", page_id);
        Ok(page_id)
    }

    /// Return a page to the free-list. Its first 8 bytes on disk become the
    /// link to the previous head; any cached copy is discarded.
    pub fn free(&mut self, page_id: PageId) -> Result<()> {
        self.check_page_id(page_id)?;
        self.cache.pop(&page_id);

        self.file
            .seek(SeekFrom::Start(page_id * self.page_size as u64))?;
        self.file.write_all(&self.freelist_head.to_le_bytes())?;
        self.freelist_head = page_id as i64;
        self.write_header()?;
        debug!("freed page {}", page_id);
        Ok(())
    }

    /// Copy the page into `buf`, which must be exactly one page long.
    pub fn read(&mut self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        self.check_page_id(page_id)?;
        if buf.len() != self.page_size {
            return Err(StoneError::SizeMismatch {
                expected: self.page_size,
                actual: buf.len(),
            });
        }

        if let Some(page) = self.cache.get(&page_id) {
            self.stats.record_cache_hit();
            buf.copy_from_slice(&page.data);
            return Ok(());
        }

        self.stats.record_cache_miss();
        let data = self.read_from_disk(page_id)?;
        buf.copy_from_slice(&data);
        self.insert_cached(page_id, data, false)?;
        Ok(())
    }

    /// Replace the page's content. The write lands in the cache; the page is
    /// persisted on flush or eviction.
    pub fn write(&mut self, page_id: PageId, buf: &[u8]) -> Result<()> {
        self.check_page_id(page_id)?;
        if buf.len() != self.page_size {
            return Err(StoneError::SizeMismatch {
                expected: self.page_size,
                actual: buf.len(),
            });
        }

        if let Some(page) = self.cache.get_mut(&page_id) {
            page.data.copy_from_slice(buf);
            page.dirty = true;
            return Ok(());
        }
        self.insert_cached(page_id, buf.to_vec(), true)
    }

    /// Write the page to disk now if it is dirty in the cache.
    pub fn flush_page(&mut self, page_id: PageId) -> Result<()> {
        if let Some(page) = self.cache.peek_mut(&page_id) {
            if page.dirty {
                write_raw(&mut self.file, self.page_size, page_id, &page.data)?;
                page.dirty = false;
            }
        }
        Ok(())
    }

    /// Write every dirty cached page to disk.
    pub fn flush_all(&mut self) -> Result<()> {
        let dirty: Vec<PageId> = self
            .cache
            .iter()
            .filter(|(_, page)| page.dirty)
            .map(|(id, _)| *id)
            .collect();
        for page_id in dirty {
            if let Some(page) = self.cache.peek_mut(&page_id) {
                write_raw(&mut self.file, self.page_size, page_id, &page.data)?;
                page.dirty = false;
            }
        }
        Ok(())
    }

    /// Flush all dirty pages, rewrite the header, and fsync the file.
    pub fn sync(&mut self) -> Result<()> {
        self.flush_all()?;
        self.write_header()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Best-effort flush; idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.sync()?;
        self.closed = true;
        Ok(())
    }

    /// Walk the on-disk free-list. Used to rebuild the allocated-page roster
    /// on open; a link outside the file or a cycle is reported as corruption.
    pub fn free_pages(&mut self) -> Result<Vec<PageId>> {
        let mut free = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut head = self.freelist_head;
        while head != NO_FREE_PAGE {
            let page_id = head as PageId;
            if page_id == 0 || page_id >= self.page_count {
                return Err(StoneError::Corruption(format!(
                    "free-list links to page {} outside the file",
                    page_id
                )));
            }
            if !seen.insert(page_id) {
                return Err(StoneError::Corruption(format!(
                    "free-list cycle through page {}",
                    page_id
                )));
            }
            free.push(page_id);
            head = self.read_free_link(page_id)?;
        }
        Ok(free)
    }

    fn check_page_id(&self, page_id: PageId) -> Result<()> {
        if page_id == 0 || page_id >= self.page_count {
            return Err(StoneError::BadPageId(page_id));
        }
        Ok(())
    }

    fn read_free_link(&mut self, page_id: PageId) -> Result<i64> {
        let mut link = [0u8; 8];
        self.file
            .seek(SeekFrom::Start(page_id * self.page_size as u64))?;
        self.file.read_exact(&mut link)?;
        Ok(i64::from_le_bytes(link))
    }

    fn read_from_disk(&mut self, page_id: PageId) -> Result<Vec<u8>> {
        let mut data = vec![0u8; self.page_size];
        self.file
            .seek(SeekFrom::Start(page_id * self.page_size as u64))?;
        self.file.read_exact(&mut data)?;
        Ok(data)
    }

    /// Insert a page into the cache, evicting first when at capacity:
    /// the least-recently-used clean page goes, or when every entry is
    /// dirty, the oldest dirty page is flushed and then evicted.
    fn insert_cached(&mut self, page_id: PageId, data: Vec<u8>, dirty: bool) -> Result<()> {
        if self.cache.len() >= CACHE_MAX && !self.cache.contains(&page_id) {
            let victim = self
                .cache
                .iter()
                .rev()
                .find(|(_, page)| !page.dirty)
                .map(|(id, _)| *id);
            match victim {
                Some(id) => {
                    self.cache.pop(&id);
                }
                None => {
                    if let Some((id, page)) = self.cache.pop_lru() {
                        write_raw(&mut self.file, self.page_size, id, &page.data)?;
                    }
                }
            }
        }
        self.cache.put(page_id, CachedPage { data, dirty });
        Ok(())
    }

    fn encode_header(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&DB_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&DB_VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&(self.page_size as u32).to_le_bytes());
        buf[12..16].copy_from_slice(&0u32.to_le_bytes());
        buf[16..24].copy_from_slice(&self.page_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.freelist_head.to_le_bytes());
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = [0u8; DB_HEADER_SIZE];
        self.encode_header(&mut header);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        Ok(())
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn write_raw(file: &mut File, page_size: usize, page_id: PageId, data: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(page_id * page_size as u64))?;
    file.write_all(data)?;
    Ok(())
}
