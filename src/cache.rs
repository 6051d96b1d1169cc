//! The on-disk record cache and the bounded set of live records.
//!
//! Every record serializes to `<cache_dir>/structs/struct_<hex>`. A
//! process-wide LRU keeps the only strong reference to each live record;
//! [RecordHandle]s hold weak ones and transparently rematerialize from disk
//! after eviction. Dirty records are flushed before they are evicted, so
//! nothing reversed is ever lost to memory pressure.
use crate::context::TypeRegistry;
use crate::error::{Error, Result};
use crate::fields::RecordType;
use crate::mem::MemorySource;
use crate::record::{AnonymousRecord, RecordRef};
use log::{debug, warn};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::fs;
use std::rc::{Rc, Weak};

/// Live records kept in memory at once.
pub const DEFAULT_LRU_CAPACITY: usize = 5000;

/// Cache file for the record at `address`.
pub fn record_file(structs_dir: &Path, address: u64) -> PathBuf {
    structs_dir.join(format!("struct_{:x}", address))
}

/// The persisted shape of a record. Bytes are not stored; they are re-read
/// from the dump on demand.
#[derive(Serialize, Deserialize)]
struct CachedRecord {
    address: u64,
    size: u64,
    reverse_level: u32,
    final_type: bool,
    record_type: RecordType,
}

/// Write one record to its cache file.
pub fn save(record: &AnonymousRecord, structs_dir: &Path) -> Result<()> {
    let cached = CachedRecord {
        address: record.address(),
        size: record.size() as u64,
        reverse_level: record.reverse_level(),
        final_type: record.is_final(),
        record_type: (**record.record_type()).clone(),
    };
    let path = record_file(structs_dir, record.address());
    let bytes = bincode::serialize(&cached)
        .map_err(|e| Error::invariant(format!("could not encode {}: {}", record, e)))?;
    fs::write(&path, bytes)?;
    debug!("saved {} to {:?}", record, path);
    Ok(())
}

fn load_file(
    path: &Path,
    mem: Rc<dyn MemorySource>,
    registry: &TypeRegistry,
) -> Result<AnonymousRecord> {
    let bytes = fs::read(path)?;
    let cached: CachedRecord = bincode::deserialize(&bytes).map_err(|e| Error::CacheCorrupt {
        path: path.to_owned(),
        reason: e.to_string(),
    })?;
    if cached.size == 0 {
        return Err(Error::CacheCorrupt {
            path: path.to_owned(),
            reason: "zero-sized record".to_owned(),
        });
    }
    let record_type = registry.intern_loaded(cached.record_type);
    Ok(AnonymousRecord::from_parts(
        mem,
        cached.address,
        cached.size as usize,
        record_type,
        cached.reverse_level,
        cached.final_type,
    ))
}

/// A handle to the record at one address. Holds no strong reference; the
/// store's LRU does.
struct RecordHandle {
    address: u64,
    size: usize,
    live: RefCell<Weak<RefCell<AnonymousRecord>>>,
}

/// Address-keyed store of all records, backed by the cache directory.
///
/// Guarantees at most one in-memory [AnonymousRecord] per address: the
/// handle's weak reference is the rendezvous point, the LRU decides
/// lifetime.
pub struct RecordStore {
    structs_dir: PathBuf,
    mem: Rc<dyn MemorySource>,
    registry: TypeRegistry,
    slots: BTreeMap<u64, RecordHandle>,
    lru: RefCell<LruCache<u64, RecordRef>>,
}

impl RecordStore {
    pub fn new(
        structs_dir: PathBuf,
        mem: Rc<dyn MemorySource>,
        registry: TypeRegistry,
        capacity: usize,
    ) -> Result<RecordStore> {
        fs::create_dir_all(&structs_dir)?;
        let capacity = NonZeroUsize::new(capacity.max(2))
            .expect("capacity is clamped to at least 2");
        Ok(RecordStore {
            structs_dir,
            mem,
            registry,
            slots: BTreeMap::new(),
            lru: RefCell::new(LruCache::new(capacity)),
        })
    }

    pub fn structs_dir(&self) -> &Path {
        &self.structs_dir
    }

    pub fn insert_allocation(&mut self, address: u64, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::input(format!(
                "allocation at {:#x} has no size",
                address
            )));
        }
        if self.slots.contains_key(&address) {
            return Err(Error::input(format!(
                "duplicate allocation at {:#x}",
                address
            )));
        }
        self.slots.insert(
            address,
            RecordHandle {
                address,
                size,
                live: RefCell::new(Weak::new()),
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, address: u64) -> bool {
        self.slots.contains_key(&address)
    }

    pub fn size_of(&self, address: u64) -> Option<usize> {
        self.slots.get(&address).map(|h| h.size)
    }

    /// All record addresses, ascending.
    pub fn addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.slots.keys().copied()
    }

    /// The record at `address`, reloading from disk or recreating it as
    /// needed. Fails only for unknown addresses or unrecoverable i/o.
    pub fn get(&self, address: u64) -> Result<RecordRef> {
        let handle = self
            .slots
            .get(&address)
            .ok_or_else(|| Error::input(format!("no allocation at {:#x}", address)))?;

        if let Some(live) = handle.live.borrow().upgrade() {
            self.touch(address, &live)?;
            return Ok(live);
        }

        let record = self.materialize(handle)?;
        let live = Rc::new(RefCell::new(record));
        *handle.live.borrow_mut() = Rc::downgrade(&live);
        self.touch(address, &live)?;
        Ok(live)
    }

    fn materialize(&self, handle: &RecordHandle) -> Result<AnonymousRecord> {
        let path = record_file(&self.structs_dir, handle.address);
        if path.exists() {
            match load_file(&path, self.mem.clone(), &self.registry) {
                Ok(record) if record.address() == handle.address && record.size() == handle.size => {
                    return Ok(record);
                }
                Ok(record) => {
                    warn!(
                        "cache file {:?} describes {:#x}/{} bytes, expected {:#x}/{}; discarding",
                        path,
                        record.address(),
                        record.size(),
                        handle.address,
                        handle.size
                    );
                    self.discard(&path)?;
                }
                Err(err @ Error::CacheCorrupt { .. }) => {
                    warn!("{}; recomputing record", err);
                    self.discard(&path)?;
                }
                Err(other) => return Err(other),
            }
        }
        AnonymousRecord::new(self.mem.clone(), handle.address, handle.size)
    }

    fn discard(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|e| Error::CacheCorrupt {
            path: path.to_owned(),
            reason: format!("could not remove corrupt file: {}", e),
        })
    }

    /// Mark `address` most recently used, flushing whatever the insertion
    /// pushes out.
    fn touch(&self, address: u64, live: &RecordRef) -> Result<()> {
        let mut lru = self.lru.borrow_mut();
        let mut evicted = lru.push(address, live.clone());
        while let Some((evicted_addr, record)) = evicted {
            if evicted_addr == address {
                // same-key update, nothing was pushed out
                break;
            }
            if record.try_borrow_mut().is_err() {
                // currently borrowed by a pass; keep it and pick another victim
                evicted = lru.push(evicted_addr, record);
            } else {
                let mut rec = record.try_borrow_mut().unwrap();
                if rec.is_dirty() {
                    save(&rec, &self.structs_dir)?;
                    rec.mark_clean();
                }
                drop(rec);
                evicted = None;
            }
        }
        Ok(())
    }

    /// Flush every live dirty record. Returns the number written.
    pub fn save_all(&self) -> Result<usize> {
        let mut written = 0;
        for handle in self.slots.values() {
            let live = handle.live.borrow().upgrade();
            if let Some(record) = live {
                let mut rec = record.borrow_mut();
                if rec.is_dirty() {
                    save(&rec, &self.structs_dir)?;
                    rec.mark_clean();
                    written += 1;
                }
            }
        }
        Ok(written)
    }

    /// Drop every live record, flushing dirty ones first. Mostly useful in
    /// tests to force reloads from disk.
    pub fn evict_all(&self) -> Result<usize> {
        let flushed = self.save_all()?;
        self.lru.borrow_mut().clear();
        Ok(flushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{MemBuffer, Perms};
    use crate::{Endianness, TargetPlatform, WordSize};

    fn mem() -> Rc<dyn MemorySource> {
        let mut mem = MemBuffer::new(
            "t",
            TargetPlatform::new(WordSize::U64, Endianness::Little),
        );
        mem.add_mapping(0x1000, Perms::RW, "[heap]", vec![0u8; 0x100]);
        Rc::new(mem)
    }

    fn store(dir: &Path, capacity: usize) -> RecordStore {
        let mut store = RecordStore::new(
            dir.to_owned(),
            mem(),
            TypeRegistry::new(),
            capacity,
        )
        .unwrap();
        store.insert_allocation(0x1000, 16).unwrap();
        store.insert_allocation(0x1010, 16).unwrap();
        store.insert_allocation(0x1020, 16).unwrap();
        store
    }

    #[test]
    fn one_live_record_per_address() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 16);

        let a = store.get(0x1000).unwrap();
        let b = store.get(0x1000).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn eviction_flushes_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 16);

        {
            let record = store.get(0x1000).unwrap();
            record.borrow_mut().set_reverse_level(10);
        }
        store.evict_all().unwrap();

        let reloaded = store.get(0x1000).unwrap();
        let rec = reloaded.borrow();
        assert_eq!(10, rec.reverse_level());
        assert!(!rec.is_dirty());
    }

    #[test]
    fn corrupt_cache_files_are_removed_and_recomputed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 16);

        let path = record_file(dir.path(), 0x1010);
        fs::write(&path, b"not a record").unwrap();

        let record = store.get(0x1010).unwrap();
        assert_eq!(0, record.borrow().reverse_level());
        assert!(!path.exists());
    }

    #[test]
    fn small_lru_evicts_transparently() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 2);

        store.get(0x1000).unwrap().borrow_mut().set_reverse_level(10);
        store.get(0x1010).unwrap();
        store.get(0x1020).unwrap();

        // 0x1000 was pushed out; its level must have survived on disk
        let record = store.get(0x1000).unwrap();
        assert_eq!(10, record.borrow().reverse_level());
    }
}
