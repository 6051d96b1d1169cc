//! The byte oracle: read-only access to the dump's memory.
//!
//! The reversing core never touches acquisition or heap walking; it consumes
//! a [MemorySource] (mappings + bytes + target platform) and a list of
//! [HeapSpec]s produced by an external heap walker. [DumpDir] implements the
//! oracle over an on-disk dump (a `layout.json` description next to a
//! memory-mapped `memory.bin`), [MemBuffer] over plain in-memory buffers.
use crate::error::{Error, Result};
use crate::{Endianness, TargetPlatform, WordSize};
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::rc::Rc;
use std::{fmt, fs, ops};

/// rwx permission bits of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Perms {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Perms {
    pub const R: Perms = Perms {
        read: true,
        write: false,
        execute: false,
    };
    pub const RW: Perms = Perms {
        read: true,
        write: true,
        execute: false,
    };
    pub const RX: Perms = Perms {
        read: true,
        write: false,
        execute: true,
    };

    /// Parse the `"rwx"` / `"r-x"` notation used by `/proc/<pid>/maps`.
    pub fn parse(s: &str) -> Result<Perms> {
        let mut chars = s.chars();
        let mut next = |on: char| -> Result<bool> {
            match chars.next() {
                Some(c) if c == on => Ok(true),
                Some('-') => Ok(false),
                other => Err(Error::input(format!("bad perms {:?}: {:?}", s, other))),
            }
        };
        Ok(Perms {
            read: next('r')?,
            write: next('w')?,
            execute: next('x')?,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read && !self.write
    }
}

impl fmt::Display for Perms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |on: bool, c: char| if on { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            bit(self.read, 'r'),
            bit(self.write, 'w'),
            bit(self.execute, 'x')
        )
    }
}

/// One mapped region of the dumped address space.
#[derive(Debug, Clone, Getters, CopyGetters, PartialEq, Eq)]
pub struct Mapping {
    #[get_copy = "pub"]
    start: u64,
    /// Exclusive end address.
    #[get_copy = "pub"]
    end: u64,
    #[get_copy = "pub"]
    perms: Perms,
    #[get = "pub"]
    name: String,
}

impl Mapping {
    pub fn new(start: u64, end: u64, perms: Perms, name: impl Into<String>) -> Mapping {
        Mapping {
            start,
            end,
            perms,
            name: name.into(),
        }
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }
}

/// Backing storage a [ByteView] can borrow from.
pub trait Backing {
    fn bytes(&self) -> &[u8];
}

impl Backing for Vec<u8> {
    fn bytes(&self) -> &[u8] {
        self
    }
}

impl Backing for memmap::Mmap {
    fn bytes(&self) -> &[u8] {
        self
    }
}

/// A reference-counted window into a dump segment. No copies: cloning a view
/// or slicing a record's bytes shares the underlying mapped storage.
#[derive(Clone)]
pub struct ByteView {
    data: Rc<dyn Backing>,
    start: usize,
    len: usize,
}

impl ByteView {
    pub(crate) fn new(data: Rc<dyn Backing>, start: usize, len: usize) -> ByteView {
        ByteView { data, start, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ops::Deref for ByteView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data.bytes()[self.start..self.start + self.len]
    }
}

impl fmt::Debug for ByteView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteView({} bytes)", self.len)
    }
}

impl PartialEq for ByteView {
    fn eq(&self, other: &Self) -> bool {
        **self == **other
    }
}

/// Read-only view of the dump consumed by the reversing core.
pub trait MemorySource {
    /// Identifies the dump; the cache directory is keyed by this.
    fn name(&self) -> &str;

    fn platform(&self) -> TargetPlatform;

    fn mappings(&self) -> &[Mapping];

    /// Read `len` bytes at `addr`, or [Error::OutOfRange] when the span is
    /// not fully inside one backed mapping.
    fn read(&self, addr: u64, len: usize) -> Result<ByteView>;

    fn mapping_for(&self, addr: u64) -> Option<&Mapping> {
        self.mappings().iter().find(|m| m.contains(addr))
    }
}

/// One heap segment as reported by the external heap walker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeapSpec {
    pub heap_start: u64,
    /// `(address, size)` of each allocated chunk.
    pub allocations: Vec<(u64, u64)>,
}

#[derive(Serialize, Deserialize)]
struct LayoutMapping {
    start: u64,
    size: u64,
    perms: String,
    name: String,
    /// Offset of the mapping's bytes inside `memory.bin`; absent for
    /// mappings present in the address space but not captured in the dump.
    #[serde(default)]
    offset: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct LayoutFile {
    word_size: u8,
    endianness: String,
    mappings: Vec<LayoutMapping>,
    #[serde(default)]
    heaps: Vec<HeapSpec>,
}

/// An on-disk dump: a directory holding `layout.json` (mappings, platform,
/// heap-walker output) and `memory.bin` (the captured bytes, memory mapped).
pub struct DumpDir {
    name: String,
    platform: TargetPlatform,
    mappings: Vec<Mapping>,
    /// Parallel to `mappings`: offset of each mapping in `memory.bin`.
    offsets: Vec<Option<usize>>,
    data: Rc<memmap::Mmap>,
    heaps: Vec<HeapSpec>,
}

impl DumpDir {
    pub fn open(dir: &Path) -> Result<DumpDir> {
        let layout_path = dir.join("layout.json");
        let layout: LayoutFile = serde_json::from_reader(fs::File::open(&layout_path)?)?;

        let word_size = match layout.word_size {
            4 => WordSize::U32,
            8 => WordSize::U64,
            n => return Err(Error::input(format!("unsupported word size {}", n))),
        };
        let endianness = match layout.endianness.as_str() {
            "little" => Endianness::Little,
            "big" => Endianness::Big,
            other => return Err(Error::input(format!("unsupported endianness {:?}", other))),
        };

        let file = fs::File::open(dir.join("memory.bin"))?;
        let data = unsafe { memmap::MmapOptions::new().map(&file) }?;

        let mut mappings = Vec::with_capacity(layout.mappings.len());
        let mut offsets = Vec::with_capacity(layout.mappings.len());
        for m in &layout.mappings {
            if m.size == 0 {
                return Err(Error::input(format!("empty mapping at {:#x}", m.start)));
            }
            if let Some(off) = m.offset {
                let end = off
                    .checked_add(m.size)
                    .ok_or_else(|| Error::input(format!("mapping {:#x} overflows", m.start)))?;
                if end > data.len() as u64 {
                    return Err(Error::input(format!(
                        "mapping {:#x} extends past the dump file",
                        m.start
                    )));
                }
            }
            mappings.push(Mapping::new(
                m.start,
                m.start + m.size,
                Perms::parse(&m.perms)?,
                m.name.clone(),
            ));
            offsets.push(m.offset.map(|o| o as usize));
        }

        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dump".to_owned());

        Ok(DumpDir {
            name,
            platform: TargetPlatform::new(word_size, endianness),
            mappings,
            offsets,
            data: Rc::new(data),
            heaps: layout.heaps,
        })
    }

    /// Heap walker output bundled with the dump description.
    pub fn heaps(&self) -> &[HeapSpec] {
        &self.heaps
    }
}

impl MemorySource for DumpDir {
    fn name(&self) -> &str {
        &self.name
    }

    fn platform(&self) -> TargetPlatform {
        self.platform
    }

    fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    fn read(&self, addr: u64, len: usize) -> Result<ByteView> {
        let idx = self
            .mappings
            .iter()
            .position(|m| m.contains(addr))
            .ok_or(Error::OutOfRange { addr, len })?;
        let mapping = &self.mappings[idx];
        if addr + len as u64 > mapping.end() {
            return Err(Error::OutOfRange { addr, len });
        }
        let base = self.offsets[idx].ok_or(Error::OutOfRange { addr, len })?;
        let start = base + (addr - mapping.start()) as usize;
        Ok(ByteView::new(self.data.clone(), start, len))
    }
}

/// In-memory byte oracle, for tests and embedders that already hold the
/// dump's segments.
pub struct MemBuffer {
    name: String,
    platform: TargetPlatform,
    mappings: Vec<Mapping>,
    segments: Vec<Option<Rc<Vec<u8>>>>,
    heaps: Vec<HeapSpec>,
}

impl MemBuffer {
    pub fn new(name: impl Into<String>, platform: TargetPlatform) -> MemBuffer {
        MemBuffer {
            name: name.into(),
            platform,
            mappings: Vec::new(),
            segments: Vec::new(),
            heaps: Vec::new(),
        }
    }

    pub fn add_mapping(&mut self, start: u64, perms: Perms, name: &str, bytes: Vec<u8>) {
        let end = start + bytes.len() as u64;
        self.mappings.push(Mapping::new(start, end, perms, name));
        self.segments.push(Some(Rc::new(bytes)));
    }

    /// A mapping present in the address space but without captured bytes;
    /// reads inside it fail with [Error::OutOfRange].
    pub fn add_unbacked_mapping(&mut self, start: u64, size: u64, perms: Perms, name: &str) {
        self.mappings
            .push(Mapping::new(start, start + size, perms, name));
        self.segments.push(None);
    }

    pub fn add_heap(&mut self, heap: HeapSpec) {
        self.heaps.push(heap);
    }

    pub fn heaps(&self) -> &[HeapSpec] {
        &self.heaps
    }
}

impl MemorySource for MemBuffer {
    fn name(&self) -> &str {
        &self.name
    }

    fn platform(&self) -> TargetPlatform {
        self.platform
    }

    fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    fn read(&self, addr: u64, len: usize) -> Result<ByteView> {
        let idx = self
            .mappings
            .iter()
            .position(|m| m.contains(addr))
            .ok_or(Error::OutOfRange { addr, len })?;
        let mapping = &self.mappings[idx];
        if addr + len as u64 > mapping.end() {
            return Err(Error::OutOfRange { addr, len });
        }
        let data = self.segments[idx]
            .as_ref()
            .ok_or(Error::OutOfRange { addr, len })?;
        let start = (addr - mapping.start()) as usize;
        Ok(ByteView::new(data.clone() as Rc<dyn Backing>, start, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform() -> TargetPlatform {
        TargetPlatform::new(WordSize::U64, Endianness::Little)
    }

    #[test]
    fn perms_round_trip() {
        let p = Perms::parse("r-x").unwrap();
        assert_eq!(Perms::RX, p);
        assert_eq!("r-x", p.to_string());
        assert!(Perms::parse("bogus").is_err());
    }

    #[test]
    fn membuffer_reads_inside_mappings() {
        let mut mem = MemBuffer::new("t", platform());
        mem.add_mapping(0x1000, Perms::RW, "[heap]", vec![0xaa; 0x100]);

        let view = mem.read(0x1010, 8).unwrap();
        assert_eq!(&[0xaa; 8][..], &*view);

        assert!(matches!(
            mem.read(0x10f9, 16),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(mem.read(0x2000, 1), Err(Error::OutOfRange { .. })));
    }

    #[test]
    fn unbacked_mappings_resolve_but_do_not_read() {
        let mut mem = MemBuffer::new("t", platform());
        mem.add_unbacked_mapping(0x7000_0000, 0x1000, Perms::RX, "libc.so");

        assert_eq!(
            "libc.so",
            mem.mapping_for(0x7000_0008).map(|m| m.name().as_str()).unwrap()
        );
        assert!(matches!(
            mem.read(0x7000_0008, 4),
            Err(Error::OutOfRange { .. })
        ));
    }
}
