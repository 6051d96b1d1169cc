//! The shared mutable root the pipeline passes operate on: per-heap
//! allocation indexes, the record store and the reversed-type registry.
use crate::cache::{RecordStore, DEFAULT_LRU_CAPACITY};
use crate::error::{Error, Result};
use crate::fields::{RecordType, SharedType};
use crate::graphs::PointerGraphs;
use crate::mem::{HeapSpec, MemorySource};
use crate::record::RecordRef;
use crate::TargetPlatform;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::fs;

/// Tunables for one reversing run. Defaults match the analysis constants
/// the heuristics were tuned with.
#[derive(Debug, Clone)]
pub struct Config {
    /// The cache directory is `<cache_root>/<dump_name>.d`.
    pub cache_root: PathBuf,
    pub lru_capacity: usize,
    /// Signature similarity required to chain two records.
    pub similarity_threshold: f64,
    /// Shortest byte run promoted to a string.
    pub min_string_len: usize,
    /// How many high in-degree records get a neighborhood dump.
    pub important_top_k: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            cache_root: PathBuf::from("."),
            lru_capacity: DEFAULT_LRU_CAPACITY,
            similarity_threshold: 0.75,
            min_string_len: 4,
            important_top_k: 10,
        }
    }
}

/// Registry of reversed record types, shared between the context and the
/// cache loader so reloading an instance restores type identity.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    inner: Rc<RefCell<HashMap<String, SharedType>>>,
}

impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        TypeRegistry::default()
    }

    pub fn register(&self, record_type: SharedType) {
        self.inner
            .borrow_mut()
            .insert(record_type.type_name().to_owned(), record_type);
    }

    pub fn get(&self, name: &str) -> Option<SharedType> {
        self.inner.borrow().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.borrow().keys().cloned().collect();
        names.sort();
        names
    }

    /// Re-establish sharing for a type loaded from the cache: if a type of
    /// the same name and shape is already registered, its `Rc` wins.
    pub fn intern_loaded(&self, loaded: RecordType) -> SharedType {
        if let Some(existing) = self.get(loaded.type_name()) {
            if *existing == loaded {
                return existing;
            }
        }
        let shared = Rc::new(loaded);
        // per-instance struct_<addr> placeholders stay out of the registry
        if !shared.type_name().starts_with("struct_") {
            self.register(shared.clone());
        }
        shared
    }
}

/// One heap segment: its start address and the sorted allocation index.
pub struct HeapContext {
    heap_start: u64,
    /// `(address, size)`, ascending by address.
    allocations: Vec<(u64, usize)>,
}

impl HeapContext {
    fn new(spec: &HeapSpec) -> Result<HeapContext> {
        let mut allocations = Vec::with_capacity(spec.allocations.len());
        for &(addr, size) in &spec.allocations {
            if size == 0 {
                return Err(Error::input(format!(
                    "allocation at {:#x} has no size",
                    addr
                )));
            }
            allocations.push((addr, size as usize));
        }
        allocations.sort_unstable();
        for pair in allocations.windows(2) {
            let (a, a_size) = pair[0];
            let (b, _) = pair[1];
            if a + a_size as u64 > b {
                return Err(Error::input(format!(
                    "allocations at {:#x} and {:#x} overlap",
                    a, b
                )));
            }
        }
        Ok(HeapContext {
            heap_start: spec.heap_start,
            allocations,
        })
    }

    pub fn heap_start(&self) -> u64 {
        self.heap_start
    }

    pub fn allocations(&self) -> &[(u64, usize)] {
        &self.allocations
    }

    fn end(&self) -> u64 {
        self.allocations
            .last()
            .map(|&(addr, size)| addr + size as u64)
            .unwrap_or(self.heap_start)
    }

    /// True when `addr` falls in this heap's span.
    pub fn contains(&self, addr: u64) -> bool {
        self.heap_start <= addr && addr < self.end()
    }

    /// The allocation whose span covers `addr`, if any.
    pub fn allocation_containing(&self, addr: u64) -> Option<(u64, usize)> {
        let idx = match self.allocations.binary_search_by_key(&addr, |&(a, _)| a) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let (start, size) = self.allocations[idx];
        if addr < start + size as u64 {
            Some((start, size))
        } else {
            None
        }
    }

    /// Exact allocation head lookup.
    pub fn allocation_at(&self, addr: u64) -> Option<usize> {
        self.allocations
            .binary_search_by_key(&addr, |&(a, _)| a)
            .ok()
            .map(|idx| self.allocations[idx].1)
    }
}

/// Process-wide reversing state. Single mutable root: passes run one at a
/// time and own exclusive mutation of the records they touch.
pub struct ProcessContext {
    dump_name: String,
    cache_dir: PathBuf,
    config: Config,
    mem: Rc<dyn MemorySource>,
    heaps: Vec<HeapContext>,
    registry: TypeRegistry,
    store: RecordStore,
    graphs: RefCell<Option<Rc<PointerGraphs>>>,
}

impl ProcessContext {
    /// Build the context from heap-walker output. Creates the cache
    /// directory; records materialize lazily, reusing cache files from a
    /// previous run on the same dump.
    pub fn load(
        mem: Rc<dyn MemorySource>,
        heaps: &[HeapSpec],
        config: Config,
    ) -> Result<ProcessContext> {
        if heaps.is_empty() {
            return Err(Error::input("no heaps to reverse"));
        }
        let dump_name = mem.name().to_owned();
        let cache_dir = config.cache_root.join(format!("{}.d", dump_name));
        fs::create_dir_all(&cache_dir)?;

        let mut heap_contexts = Vec::with_capacity(heaps.len());
        for spec in heaps {
            heap_contexts.push(HeapContext::new(spec)?);
        }
        // every record address lies in exactly one heap
        for (i, a) in heap_contexts.iter().enumerate() {
            for b in &heap_contexts[i + 1..] {
                if a.heap_start < b.end() && b.heap_start < a.end() {
                    return Err(Error::input(format!(
                        "heaps at {:#x} and {:#x} overlap",
                        a.heap_start, b.heap_start
                    )));
                }
            }
        }

        let registry = TypeRegistry::new();
        let mut store = RecordStore::new(
            cache_dir.join("structs"),
            mem.clone(),
            registry.clone(),
            config.lru_capacity,
        )?;
        for heap in &heap_contexts {
            for &(addr, size) in heap.allocations() {
                store.insert_allocation(addr, size)?;
            }
        }

        Ok(ProcessContext {
            dump_name,
            cache_dir,
            config,
            mem,
            heaps: heap_contexts,
            registry,
            store,
            graphs: RefCell::new(None),
        })
    }

    pub fn dump_name(&self) -> &str {
        &self.dump_name
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mem(&self) -> &Rc<dyn MemorySource> {
        &self.mem
    }

    pub fn platform(&self) -> TargetPlatform {
        self.mem.platform()
    }

    pub fn heaps(&self) -> &[HeapContext] {
        &self.heaps
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// The heap owning `addr`, if any.
    pub fn heap_for(&self, addr: u64) -> Option<&HeapContext> {
        self.heaps.iter().find(|h| h.contains(addr))
    }

    /// The allocation whose span covers `addr`, across all heaps.
    pub fn allocation_containing(&self, addr: u64) -> Option<(u64, usize)> {
        self.heap_for(addr)
            .and_then(|h| h.allocation_containing(addr))
    }

    /// All record addresses, ascending. Pass iteration order.
    pub fn addresses(&self) -> Vec<u64> {
        self.store.addresses().collect()
    }

    pub fn record_count(&self) -> usize {
        self.store.len()
    }

    /// The record at exactly `addr`.
    pub fn record(&self, addr: u64) -> Result<RecordRef> {
        self.store.get(addr)
    }

    /// The record at exactly `addr`, or `None` for addresses that are not
    /// allocation heads.
    pub fn record_at(&self, addr: u64) -> Option<RecordRef> {
        if self.store.contains(addr) {
            self.store.get(addr).ok()
        } else {
            None
        }
    }

    /// Flush all dirty records to the cache. Returns the number written.
    pub fn save_all(&self) -> Result<usize> {
        self.store.save_all()
    }

    pub fn set_graphs(&self, graphs: Rc<PointerGraphs>) {
        *self.graphs.borrow_mut() = Some(graphs);
    }

    pub fn graphs(&self) -> Option<Rc<PointerGraphs>> {
        self.graphs.borrow().clone()
    }

    /// Addresses of records holding a pointer into `[addr, addr + size)`,
    /// where size is the target allocation's span (one word when `addr` is
    /// not a tracked allocation).
    pub fn predecessors(&self, addr: u64) -> Result<Vec<u64>> {
        let span = self
            .allocation_containing(addr)
            .map(|(start, size)| (start, size as u64))
            .unwrap_or((addr, self.platform().word_bytes() as u64));
        let (target_start, target_len) = span;

        let mut parents = Vec::new();
        for source_addr in self.addresses() {
            let record = self.record(source_addr)?;
            let rec = record.borrow();
            // decode pointer values from each instance's own bytes; the
            // decls may belong to a type shared across many records
            let points_in = rec.fields().iter().any(|field| {
                field.decl().kind().is_pointer()
                    && field
                        .word()
                        .map(|v| target_start <= v && v < target_start + target_len)
                        .unwrap_or(false)
            });
            if points_in {
                parents.push(source_addr);
            }
        }
        Ok(parents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{HeapSpec, MemBuffer, Perms};
    use crate::{Endianness, WordSize};

    fn test_config(dir: &Path) -> Config {
        Config {
            cache_root: dir.to_owned(),
            ..Config::default()
        }
    }

    fn source() -> (Rc<dyn MemorySource>, Vec<HeapSpec>) {
        let mut mem = MemBuffer::new(
            "ctx",
            TargetPlatform::new(WordSize::U64, Endianness::Little),
        );
        mem.add_mapping(0x1000, Perms::RW, "[heap]", vec![0u8; 0x100]);
        let heaps = vec![HeapSpec {
            heap_start: 0x1000,
            allocations: vec![(0x1000, 0x10), (0x1020, 0x10)],
        }];
        (Rc::new(mem), heaps)
    }

    #[test]
    fn empty_heap_lists_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mem, _) = source();
        assert!(matches!(
            ProcessContext::load(mem, &[], test_config(dir.path())),
            Err(Error::Input(_))
        ));
    }

    #[test]
    fn zero_sized_allocations_are_rejected_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let (mem, _) = source();
        let heaps = vec![HeapSpec {
            heap_start: 0x1000,
            allocations: vec![(0x1000, 0)],
        }];
        assert!(matches!(
            ProcessContext::load(mem, &heaps, test_config(dir.path())),
            Err(Error::Input(_))
        ));
    }

    #[test]
    fn allocation_lookup_finds_heads_and_interiors() {
        let dir = tempfile::tempdir().unwrap();
        let (mem, heaps) = source();
        let ctx = ProcessContext::load(mem, &heaps, test_config(dir.path())).unwrap();

        assert_eq!(Some((0x1000, 0x10)), ctx.allocation_containing(0x1008));
        assert_eq!(Some((0x1020, 0x10)), ctx.allocation_containing(0x1020));
        assert_eq!(None, ctx.allocation_containing(0x1018));
        assert!(ctx.record_at(0x1008).is_none());
        assert!(ctx.record_at(0x1020).is_some());
    }

    #[test]
    fn addresses_iterate_ascending() {
        let dir = tempfile::tempdir().unwrap();
        let (mem, heaps) = source();
        let ctx = ProcessContext::load(mem, &heaps, test_config(dir.path())).unwrap();
        assert_eq!(vec![0x1000, 0x1020], ctx.addresses());
    }
}
