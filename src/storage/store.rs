use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};

use crate::error::{Result, StoneError};
use crate::stats::Statistics;
use crate::storage::pager::{PageId, Pager};
use crate::storage::slot::{self, PutOutcome, MAX_KEY, MAX_VALUE, SLOT_HEADER};

/// Key-value storage across pages.
///
/// `key_index` maps each key to the page believed to hold its live slot. It
/// is rebuilt by walking every allocated page on open and maintained by
/// put/delete, but readers always verify it: on a mismatch they fall back to
/// a linear scan over the allocated roster and repair the entry.
pub struct KvStore {
    pager: Pager,
    key_index: HashMap<Vec<u8>, PageId>,
    allocated: BTreeSet<PageId>,
}

/// Reject keys and values the engine can never store. Values are bounded by
/// `MAX_VALUE` and by page capacity, since records do not span pages.
pub fn validate_record(key: &[u8], value: &[u8], page_size: usize) -> Result<()> {
    if key.is_empty() {
        return Err(StoneError::InvalidKey);
    }
    if key.len() > MAX_KEY {
        return Err(StoneError::KeyTooLarge(key.len()));
    }
    if value.len() > MAX_VALUE || SLOT_HEADER + key.len() + value.len() > page_size {
        return Err(StoneError::ValueTooLarge(value.len()));
    }
    Ok(())
}

pub fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(StoneError::InvalidKey);
    }
    if key.len() > MAX_KEY {
        return Err(StoneError::KeyTooLarge(key.len()));
    }
    Ok(())
}

impl KvStore {
    pub fn open(
        path: &Path,
        create_if_missing: bool,
        page_size: u32,
        stats: Arc<Statistics>,
    ) -> Result<Self> {
        let mut pager = Pager::open(path, create_if_missing, page_size, stats)?;

        let free: BTreeSet<PageId> = pager.free_pages()?.into_iter().collect();
        let allocated: BTreeSet<PageId> = (1..pager.page_count())
            .filter(|id| !free.contains(id))
            .collect();

        let mut store = KvStore {
            pager,
            key_index: HashMap::new(),
            allocated,
        };
        store.rebuild_index()?;
        Ok(store)
    }

    fn rebuild_index(&mut self) -> Result<()> {
        self.key_index.clear();
        let mut buf = vec![0u8; self.pager.page_size()];
        for &page_id in &self.allocated {
            self.pager.read(page_id, &mut buf)?;
            for (key, _) in slot::records(&buf) {
                self.key_index.insert(key, page_id);
            }
        }
        debug!(
            "index rebuilt: {} keys across {} pages",
            self.key_index.len(),
            self.allocated.len()
        );
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.pager.page_size()
    }

    /// Find the page whose live slot holds `key`, verifying the index hint
    /// and repairing it from a full scan when it lies.
    fn locate(&mut self, key: &[u8]) -> Result<Option<PageId>> {
        let mut buf = vec![0u8; self.pager.page_size()];

        if let Some(&hinted) = self.key_index.get(key) {
            if self.allocated.contains(&hinted) {
                self.pager.read(hinted, &mut buf)?;
                if slot::find(&buf, key).is_some() {
                    return Ok(Some(hinted));
                }
            }
            warn!("stale index entry for key of {} bytes", key.len());
        }

        let pages: Vec<PageId> = self.allocated.iter().copied().collect();
        for page_id in pages {
            self.pager.read(page_id, &mut buf)?;
            if slot::find(&buf, key).is_some() {
                self.key_index.insert(key.to_vec(), page_id);
                return Ok(Some(page_id));
            }
        }
        self.key_index.remove(key);
        Ok(None)
    }

    /// Insert or update a record. Placement tries the page that already holds
    /// the key, then every allocated page in increasing id order, then a
    /// freshly allocated page.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        validate_record(key, value, self.pager.page_size())?;

        let mut buf = vec![0u8; self.pager.page_size()];

        if let Some(page_id) = self.locate(key)? {
            self.pager.read(page_id, &mut buf)?;
            match slot::put(&mut buf, key, value) {
                PutOutcome::Stored => {
                    self.pager.write(page_id, &buf)?;
                    self.key_index.insert(key.to_vec(), page_id);
                    return Ok(());
                }
                PutOutcome::NoSpace => {
                    // The grown record no longer fits: the old slot is now a
                    // tombstone, which must be persisted before the record
                    // moves elsewhere.
                    self.pager.write(page_id, &buf)?;
                    self.key_index.remove(key);
                }
            }
        }

        let pages: Vec<PageId> = self.allocated.iter().copied().collect();
        for page_id in pages {
            self.pager.read(page_id, &mut buf)?;
            if slot::put(&mut buf, key, value) == PutOutcome::Stored {
                self.pager.write(page_id, &buf)?;
                self.key_index.insert(key.to_vec(), page_id);
                return Ok(());
            }
        }

        let page_id = self.pager.allocate()?;
        buf.fill(0);
        match slot::put(&mut buf, key, value) {
            PutOutcome::Stored => {}
            PutOutcome::NoSpace => {
                // validate_record guarantees the record fits an empty page.
                return Err(StoneError::PageFull);
            }
        }
        self.pager.write(page_id, &buf)?;
        self.allocated.insert(page_id);
        self.key_index.insert(key.to_vec(), page_id);
        debug!("record spilled to new page {}", page_id);
        Ok(())
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let Some(page_id) = self.locate(key)? else {
            return Ok(None);
        };
        let mut buf = vec![0u8; self.pager.page_size()];
        self.pager.read(page_id, &mut buf)?;
        Ok(slot::find(&buf, key).map(|v| v.to_vec()))
    }

    /// Tombstone the record. Returns whether a live slot existed. A page
    /// left without any live record is returned to the free-list.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        validate_key(key)?;
        let Some(page_id) = self.locate(key)? else {
            return Ok(false);
        };

        let mut buf = vec![0u8; self.pager.page_size()];
        self.pager.read(page_id, &mut buf)?;
        let found = slot::delete(&mut buf, key);
        if found {
            self.key_index.remove(key);
            if slot::has_records(&buf) {
                self.pager.write(page_id, &buf)?;
            } else {
                self.allocated.remove(&page_id);
                self.pager.free(page_id)?;
                debug!("page {} emptied and reclaimed", page_id);
            }
        }
        Ok(found)
    }

    /// All live records, in page-id order and slot order within a page.
    pub fn scan(&mut self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; self.pager.page_size()];
        let pages: Vec<PageId> = self.allocated.iter().copied().collect();
        for page_id in pages {
            self.pager.read(page_id, &mut buf)?;
            out.extend(slot::records(&buf));
        }
        Ok(out)
    }

    pub fn flush_all(&mut self) -> Result<()> {
        self.pager.flush_all()
    }

    pub fn sync(&mut self) -> Result<()> {
        self.pager.sync()
    }

    pub fn close(&mut self) -> Result<()> {
        self.pager.close()
    }

    #[cfg(test)]
    fn allocated_pages(&self) -> Vec<PageId> {
        self.allocated.iter().copied().collect()
    }
}
