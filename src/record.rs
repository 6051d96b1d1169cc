//! Record instances: an [AnonymousRecord] is one allocated chunk at an
//! address, shadowed field-for-field by [FieldInstance]s that decode values
//! out of the parent's bytes.
use crate::error::{Error, Result};
use crate::fields::{FieldDecl, FieldKind, PointeeDesc, RecordType, SharedType};
use crate::mem::{ByteView, MemorySource};
use crate::{Endianness, TargetPlatform};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

/// How records are handed around: one shared, mutable instance per address.
pub type RecordRef = Rc<RefCell<AnonymousRecord>>;

/// Default middle-truncation width for rendered values.
pub const VALUE_MAX_LEN: usize = 120;

/// One allocator chunk, treated as a single structure instance at an
/// absolute address.
///
/// Created at dump-load time from heap-walker output, mutated in place by
/// the pipeline passes, persisted on demand and possibly evicted/reloaded
/// by the record cache.
pub struct AnonymousRecord {
    address: u64,
    size: usize,
    mem: Rc<dyn MemorySource>,
    record_type: SharedType,
    reverse_level: u32,
    final_type: bool,
    dirty: bool,
    bytes: RefCell<Option<ByteView>>,
}

impl AnonymousRecord {
    pub fn new(mem: Rc<dyn MemorySource>, address: u64, size: usize) -> Result<AnonymousRecord> {
        if size == 0 {
            return Err(Error::input(format!(
                "allocation at {:#x} has no size",
                address
            )));
        }
        let record_type = Rc::new(RecordType::anonymous(address, size));
        Ok(AnonymousRecord {
            address,
            size,
            mem,
            record_type,
            reverse_level: 0,
            final_type: false,
            dirty: true,
            bytes: RefCell::new(None),
        })
    }

    /// Rebuild a record from persisted state; used by the cache loader.
    pub(crate) fn from_parts(
        mem: Rc<dyn MemorySource>,
        address: u64,
        size: usize,
        record_type: SharedType,
        reverse_level: u32,
        final_type: bool,
    ) -> AnonymousRecord {
        AnonymousRecord {
            address,
            size,
            mem,
            record_type,
            reverse_level,
            final_type,
            dirty: false,
            bytes: RefCell::new(None),
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn mem(&self) -> &Rc<dyn MemorySource> {
        &self.mem
    }

    pub fn target(&self) -> TargetPlatform {
        self.mem.platform()
    }

    pub fn record_type(&self) -> &SharedType {
        &self.record_type
    }

    /// Assign a reversed type to this instance, invalidating the field
    /// instances shadowing the previous type. Passing `final_type` freezes
    /// the record after type unification.
    pub fn set_record_type(&mut self, record_type: SharedType, final_type: bool) {
        self.record_type = record_type;
        self.final_type = final_type;
        self.dirty = true;
    }

    pub fn reverse_level(&self) -> u32 {
        self.reverse_level
    }

    pub fn set_reverse_level(&mut self, level: u32) {
        if self.reverse_level != level {
            self.reverse_level = level;
            self.dirty = true;
        }
    }

    pub fn is_final(&self) -> bool {
        self.final_type
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn name(&self) -> String {
        self.record_type.type_name().to_owned()
    }

    /// The chunk's bytes, read lazily from the byte oracle and shared from
    /// then on.
    pub fn bytes(&self) -> Result<ByteView> {
        if let Some(view) = &*self.bytes.borrow() {
            return Ok(view.clone());
        }
        let view = self.mem.read(self.address, self.size)?;
        *self.bytes.borrow_mut() = Some(view.clone());
        Ok(view)
    }

    pub fn signature_text(&self) -> String {
        self.record_type.signature_text()
    }

    /// True when `addr` falls inside this record's address space.
    pub fn contains(&self, addr: u64) -> bool {
        self.address <= addr && addr < self.address + self.size as u64
    }

    /// Field instances shadowing the record type's declarations one-for-one.
    pub fn fields(&self) -> Vec<FieldInstance<'_>> {
        self.record_type
            .fields()
            .iter()
            .map(|decl| FieldInstance { decl, record: self })
            .collect()
    }

    pub fn field_named(&self, name: &str) -> Option<FieldInstance<'_>> {
        self.fields().into_iter().find(|f| f.decl.name() == name)
    }

    pub fn field_at_offset(&self, offset: usize) -> Option<FieldInstance<'_>> {
        let decl = self.record_type.field_at_offset(offset)?;
        Some(FieldInstance { decl, record: self })
    }

    /// Render the record as a class definition, the shape emitted in the
    /// catalog and neighborhood listings.
    pub fn describe(&self) -> String {
        let mut out = format!(
            "class {}(Structure):  # size:{}\n  _fields_ = [\n",
            self.name(),
            self.size
        );
        for field in self.fields() {
            out.push_str(&format!(
                "    ( '{}' , {} ), # {}\n",
                field.decl().name(),
                field
                    .decl()
                    .kind()
                    .type_decl(field.decl().size(), self.target()),
                field.comment_text()
            ));
        }
        out.push_str("  ]\n");
        out
    }
}

impl fmt::Debug for AnonymousRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnonymousRecord")
            .field("address", &format_args!("{:#x}", self.address))
            .field("size", &self.size)
            .field("type", &self.record_type.type_name())
            .field("reverse_level", &self.reverse_level)
            .finish()
    }
}

impl fmt::Display for AnonymousRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "struct_{:x}", self.address)
    }
}

impl PartialEq for AnonymousRecord {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for AnonymousRecord {}

impl PartialOrd for AnonymousRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AnonymousRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address.cmp(&other.address)
    }
}

/// The instance of a field: a declaration plus the enclosing record, whose
/// bytes supply the value. No owned state.
pub struct FieldInstance<'a> {
    decl: &'a FieldDecl,
    record: &'a AnonymousRecord,
}

impl<'a> FieldInstance<'a> {
    pub fn decl(&self) -> &'a FieldDecl {
        self.decl
    }

    fn slice(&self) -> Result<ByteView> {
        let bytes = self.record.bytes()?;
        if self.decl.end() > bytes.len() {
            return Err(Error::invariant(format!(
                "field {} extends past record {}",
                self.decl.name(),
                self.record
            )));
        }
        Ok(ByteView::clone(&bytes))
    }

    /// Decode the word at this field's offset.
    pub fn word(&self) -> Result<u64> {
        let bytes = self.slice()?;
        let target = self.record.target();
        let word = target.word_bytes();
        let end = (self.decl.offset() + word).min(bytes.len());
        target
            .read_word(&bytes[self.decl.offset()..end])
            .ok_or_else(|| Error::invariant(format!("truncated word in {}", self.record)))
    }

    /// Render the value the way the catalog does: pointers as hex, integers
    /// decoded, zeroes as `0`, strings quoted and middle-truncated, anything
    /// else as raw bytes.
    pub fn rendered(&self, max_len: usize) -> Result<String> {
        let decl = self.decl;
        let value = match decl.kind() {
            // always decode from the instance's own bytes: the decl is part
            // of a type that may be shared by many records
            FieldKind::Pointer | FieldKind::StringPointer => {
                format!("{:#x}", self.word()?)
            }
            FieldKind::Integer { signed } | FieldKind::SmallInt { signed } => {
                let word = self.word()?;
                if *signed {
                    self.record.target().sign_extend(word).to_string()
                } else {
                    word.to_string()
                }
            }
            FieldKind::Zeroes => "0".to_owned(),
            FieldKind::StringUtf16 => format!("'{}'", truncate(&self.decode_utf16()?, max_len)),
            FieldKind::StringAscii | FieldKind::StringNull => {
                format!("'{}'", truncate(&self.decode_ascii()?, max_len))
            }
            _ => {
                let bytes = self.slice()?;
                truncate(
                    &hex_bytes(&bytes[decl.offset()..decl.end()]),
                    max_len,
                )
            }
        };
        Ok(value)
    }

    fn decode_ascii(&self) -> Result<String> {
        let bytes = self.slice()?;
        let raw = &bytes[self.decl.offset()..self.decl.end()];
        let trimmed = match raw.iter().position(|&b| b == 0) {
            Some(n) => &raw[..n],
            None => raw,
        };
        Ok(trimmed
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                }
            })
            .collect())
    }

    fn decode_utf16(&self) -> Result<String> {
        let bytes = self.slice()?;
        let raw = &bytes[self.decl.offset()..self.decl.end()];
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| match self.record.target().endianness() {
                Endianness::Little => u16::from_le_bytes([pair[0], pair[1]]),
                Endianness::Big => u16::from_be_bytes([pair[0], pair[1]]),
            })
            .take_while(|&u| u != 0)
            .collect();
        Ok(String::from_utf16_lossy(&units))
    }

    /// The comment rendered next to the field in class listings.
    pub fn comment_text(&self) -> String {
        let decl = self.decl;
        match decl.kind() {
            FieldKind::Pointer | FieldKind::StringPointer => {
                let value = self.word().unwrap_or(0);
                // the resolved annotation only applies when the shared decl
                // was resolved from this very value
                let resolved = decl
                    .pointer()
                    .filter(|p| p.value == value)
                    .map(|p| &p.desc);
                let target = match resolved {
                    Some(PointeeDesc::KnownRecord { addr, offset: 0 }) => {
                        format!(" -> struct_{:x}", addr)
                    }
                    Some(PointeeDesc::KnownRecord { addr, offset }) => {
                        format!(" -> struct_{:x}+{}", addr, offset)
                    }
                    Some(PointeeDesc::String) => " -> string".to_owned(),
                    Some(PointeeDesc::ExternalLibrary { mapping }) => {
                        format!(" -> {}", mapping)
                    }
                    Some(PointeeDesc::Null) => " null".to_owned(),
                    _ => String::new(),
                };
                format!("@ {:#010x}{} {}", value, target, decl.comment())
            }
            FieldKind::Integer { .. } | FieldKind::SmallInt { .. } => {
                let word = self.word().unwrap_or(0);
                format!("0x{:x} {}", word, decl.comment())
            }
            FieldKind::Zeroes => format!("{} zeroes: '\\x00'*{}", decl.comment(), decl.size()),
            kind if kind.is_string() => {
                let text = self.rendered(VALUE_MAX_LEN).unwrap_or_default();
                format!(
                    "{} {}: {}",
                    decl.comment(),
                    decl.kind().tag().basename(),
                    text
                )
            }
            FieldKind::Record => format!("field struct {}", decl.comment()),
            _ => {
                let text = self.rendered(VALUE_MAX_LEN).unwrap_or_default();
                format!("{} bytes:{}", decl.comment(), text)
            }
        }
    }
}

fn hex_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4);
    for b in bytes {
        out.push_str(&format!("\\x{:02x}", b));
    }
    out
}

/// Keep the head and the tail; the middle of a long value is rarely the
/// interesting part.
fn truncate(s: &str, max_len: usize) -> String {
    if s.len() < max_len || s.len() < 2 {
        return s.to_owned();
    }
    let half = max_len / 2;
    let head: String = s.chars().take(half).collect();
    let tail: String = s
        .chars()
        .rev()
        .take(half)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("{}...{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{HeapSpec, MemBuffer, Perms};
    use crate::{Endianness, WordSize};

    fn source_with(addr: u64, bytes: Vec<u8>) -> Rc<dyn MemorySource> {
        let mut mem = MemBuffer::new(
            "t",
            TargetPlatform::new(WordSize::U64, Endianness::Little),
        );
        let len = bytes.len() as u64;
        mem.add_mapping(addr, Perms::RW, "[heap]", bytes);
        mem.add_heap(HeapSpec {
            heap_start: addr,
            allocations: vec![(addr, len)],
        });
        Rc::new(mem)
    }

    #[test]
    fn zero_sized_allocations_are_rejected() {
        let mem = source_with(0x1000, vec![0; 8]);
        assert!(matches!(
            AnonymousRecord::new(mem, 0x1000, 0),
            Err(Error::Input(_))
        ));
    }

    #[test]
    fn bytes_are_read_lazily_and_shared() {
        let mem = source_with(0x1000, vec![0xab; 16]);
        let record = AnonymousRecord::new(mem, 0x1000, 16).unwrap();
        let first = record.bytes().unwrap();
        let second = record.bytes().unwrap();
        assert_eq!(first, second);
        assert_eq!(16, first.len());
    }

    #[test]
    fn string_values_render_quoted() {
        let mut bytes = b"Hello\0\0\0".to_vec();
        bytes.resize(8, 0);
        let mem = source_with(0x3000, bytes);
        let mut record = AnonymousRecord::new(mem, 0x3000, 8).unwrap();
        let t = RecordType::new(
            "struct_3000",
            8,
            vec![
                FieldDecl::new(0, 6, FieldKind::StringNull),
                FieldDecl::new(6, 2, FieldKind::Zeroes),
            ],
        )
        .unwrap();
        record.set_record_type(Rc::new(t), false);

        let fields = record.fields();
        assert_eq!("'Hello'", fields[0].rendered(VALUE_MAX_LEN).unwrap());
        assert_eq!("0", fields[1].rendered(VALUE_MAX_LEN).unwrap());
    }

    #[test]
    fn long_values_are_middle_truncated() {
        let long = "x".repeat(300);
        let out = truncate(&long, 120);
        assert!(out.len() <= 123);
        assert!(out.contains("..."));
    }

    #[test]
    fn describe_renders_a_class_block() {
        let mem = source_with(0x2000, 0x1000u64.to_le_bytes().to_vec());
        let mut record = AnonymousRecord::new(mem, 0x2000, 8).unwrap();
        let t = RecordType::new(
            "struct_2000",
            8,
            vec![FieldDecl::pointer_to(0, 8, 0x1000)],
        )
        .unwrap();
        record.set_record_type(Rc::new(t), false);

        let text = record.describe();
        assert!(text.starts_with("class struct_2000(Structure):  # size:8\n"));
        assert!(text.contains("( 'ptr_0' , ctypes.c_void_p ), # @ 0x00001000"));
    }
}
