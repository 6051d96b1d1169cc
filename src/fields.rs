//! The record/field data model: field kinds, field declarations and the
//! shared record types the analysis passes refine.
use crate::error::{Error, Result};
use crate::TargetPlatform;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use strum_macros::EnumIter;

/// Discriminant of a [FieldKind], carrying the per-kind constants: a unique
/// id, the one-character signature code and a short base name used to
/// generate field names.
// Since this enum has no data, add EnumIter to allow enumerating the kinds
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, Serialize, Deserialize)]
pub enum FieldKindTag {
    Unknown,
    Zeroes,
    Integer,
    SmallInt,
    Pointer,
    StringAscii,
    StringUtf16,
    StringNull,
    StringPointer,
    Array,
    ByteArray,
    Record,
    Padding,
}

impl FieldKindTag {
    /// Stable unique id, used for equality and ordering of kinds.
    pub fn type_id(&self) -> u8 {
        match self {
            FieldKindTag::Unknown => 0x00,
            FieldKindTag::Record => 0x01,
            FieldKindTag::Zeroes => 0x02,
            FieldKindTag::StringAscii => 0x04,
            FieldKindTag::StringUtf16 => 0x05,
            FieldKindTag::StringNull => 0x06,
            FieldKindTag::SmallInt => 0x08,
            FieldKindTag::Pointer => 0x0a,
            FieldKindTag::StringPointer => 0x0e,
            FieldKindTag::Integer => 0x18,
            FieldKindTag::Array => 0x40,
            FieldKindTag::ByteArray => 0x50,
            FieldKindTag::Padding => 0xff,
        }
    }

    /// One-character signature code.
    pub fn sig_char(&self) -> char {
        match self {
            FieldKindTag::Unknown => 'u',
            FieldKindTag::Zeroes => 'z',
            FieldKindTag::Integer => 'I',
            FieldKindTag::SmallInt => 'i',
            FieldKindTag::Pointer => 'P',
            FieldKindTag::StringAscii | FieldKindTag::StringUtf16 | FieldKindTag::StringNull => 'T',
            FieldKindTag::StringPointer => 's',
            FieldKindTag::Array | FieldKindTag::ByteArray => 'a',
            FieldKindTag::Record => 'K',
            FieldKindTag::Padding => 'X',
        }
    }

    /// Base name used when generating `<basename>_<offset>` field names.
    pub fn basename(&self) -> &'static str {
        match self {
            FieldKindTag::Unknown => "untyped",
            FieldKindTag::Zeroes => "zeroes",
            FieldKindTag::Integer => "int",
            FieldKindTag::SmallInt => "small_int",
            FieldKindTag::Pointer => "ptr",
            FieldKindTag::StringAscii => "text",
            FieldKindTag::StringUtf16 => "utf16_text",
            FieldKindTag::StringNull => "text0",
            FieldKindTag::StringPointer => "text_ptr",
            FieldKindTag::Array => "array",
            FieldKindTag::ByteArray => "bytes",
            FieldKindTag::Record => "struct",
            FieldKindTag::Padding => "pad",
        }
    }
}

/// The inferred semantic category of a byte range inside a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    Unknown,
    Zeroes,
    Integer {
        signed: bool,
    },
    SmallInt {
        signed: bool,
    },
    Pointer,
    StringAscii,
    StringUtf16,
    StringNull,
    StringPointer,
    Array {
        item: Box<FieldKind>,
        item_size: usize,
        count: usize,
    },
    ByteArray,
    /// A nested record embedded in the parent.
    Record,
    Padding,
}

impl FieldKind {
    pub fn tag(&self) -> FieldKindTag {
        match self {
            FieldKind::Unknown => FieldKindTag::Unknown,
            FieldKind::Zeroes => FieldKindTag::Zeroes,
            FieldKind::Integer { .. } => FieldKindTag::Integer,
            FieldKind::SmallInt { .. } => FieldKindTag::SmallInt,
            FieldKind::Pointer => FieldKindTag::Pointer,
            FieldKind::StringAscii => FieldKindTag::StringAscii,
            FieldKind::StringUtf16 => FieldKindTag::StringUtf16,
            FieldKind::StringNull => FieldKindTag::StringNull,
            FieldKind::StringPointer => FieldKindTag::StringPointer,
            FieldKind::Array { .. } => FieldKindTag::Array,
            FieldKind::ByteArray => FieldKindTag::ByteArray,
            FieldKind::Record => FieldKindTag::Record,
            FieldKind::Padding => FieldKindTag::Padding,
        }
    }

    pub fn is_pointer(&self) -> bool {
        match self {
            FieldKind::Pointer | FieldKind::StringPointer => true,
            _ => false,
        }
    }

    pub fn is_string(&self) -> bool {
        match self {
            FieldKind::StringAscii
            | FieldKind::StringUtf16
            | FieldKind::StringNull
            | FieldKind::StringPointer => true,
            _ => false,
        }
    }

    pub fn is_integer(&self) -> bool {
        match self {
            FieldKind::Integer { .. } | FieldKind::SmallInt { .. } => true,
            _ => false,
        }
    }

    pub fn is_zeroes(&self) -> bool {
        *self == FieldKind::Zeroes
    }

    pub fn is_record(&self) -> bool {
        *self == FieldKind::Record
    }

    /// The ctypes spelling used in the emitted catalog.
    pub fn type_decl(&self, size: usize, _target: TargetPlatform) -> String {
        match self {
            FieldKind::Unknown
            | FieldKind::Zeroes
            | FieldKind::ByteArray
            | FieldKind::Padding => format!("ctypes.c_ubyte * {}", size),
            FieldKind::Integer { signed: true } => "ctypes.c_int".to_owned(),
            FieldKind::Integer { signed: false } => "ctypes.c_uint".to_owned(),
            FieldKind::SmallInt { signed: true } => "ctypes.c_int".to_owned(),
            FieldKind::SmallInt { signed: false } => "ctypes.c_uint".to_owned(),
            FieldKind::Pointer => "ctypes.c_void_p".to_owned(),
            FieldKind::StringAscii | FieldKind::StringNull => {
                format!("ctypes.c_char * {}", size)
            }
            FieldKind::StringUtf16 => format!("ctypes.c_wchar * {}", size / 2),
            FieldKind::StringPointer => "ctypes.c_char_p".to_owned(),
            FieldKind::Array {
                item,
                item_size,
                count,
            } => format!("{} * {}", item.type_decl(*item_size, _target), count),
            FieldKind::Record => "ctypes.Structure".to_owned(),
        }
    }
}

/// What a pointer field was resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointeeDesc {
    /// Not resolved yet, or resolved to nothing we can name.
    Unresolved,
    Null,
    /// Points at (or inside, when `offset > 0`) a tracked allocation.
    KnownRecord { addr: u64, offset: u64 },
    /// Points at a C string in a read-only mapping.
    String,
    /// Points outside the tracked heaps, into a named mapping.
    ExternalLibrary { mapping: String },
}

/// Pointer metadata attached to a [FieldDecl] of pointer kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerInfo {
    pub value: u64,
    pub desc: PointeeDesc,
    /// A guess at the pointee's own kind, when one exists.
    pub kind_hint: Option<FieldKindTag>,
}

impl PointerInfo {
    pub fn unresolved(value: u64) -> PointerInfo {
        PointerInfo {
            value,
            desc: PointeeDesc::Unresolved,
            kind_hint: None,
        }
    }
}

/// A field declaration inside a [RecordType].
///
/// Equality and ordering consider `(offset, size, kind)` only; names and
/// comments are presentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDecl {
    offset: usize,
    size: usize,
    kind: FieldKind,
    name: Option<String>,
    padding: bool,
    comment: String,
    pointer: Option<PointerInfo>,
}

impl FieldDecl {
    pub fn new(offset: usize, size: usize, kind: FieldKind) -> FieldDecl {
        FieldDecl {
            offset,
            size,
            kind,
            name: None,
            padding: false,
            comment: String::new(),
            pointer: None,
        }
    }

    pub fn padding(offset: usize, size: usize) -> FieldDecl {
        let mut f = FieldDecl::new(offset, size, FieldKind::Padding);
        f.padding = true;
        f
    }

    pub fn pointer_to(offset: usize, size: usize, value: u64) -> FieldDecl {
        let mut f = FieldDecl::new(offset, size, FieldKind::Pointer);
        f.pointer = Some(PointerInfo::unresolved(value));
        f
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn is_padding(&self) -> bool {
        self.padding
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn set_comment(&mut self, comment: impl Into<String>) {
        self.comment = comment.into();
    }

    pub fn set_kind(&mut self, kind: FieldKind) {
        self.kind = kind;
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn pointer(&self) -> Option<&PointerInfo> {
        self.pointer.as_ref()
    }

    pub fn set_pointer(&mut self, info: PointerInfo) {
        self.pointer = Some(info);
    }

    /// The declared name, or `<basename>_<offset>` when none was assigned.
    pub fn name(&self) -> String {
        match &self.name {
            Some(n) => n.clone(),
            None => format!("{}_{}", self.kind.tag().basename(), self.offset),
        }
    }

    pub fn signature(&self) -> (char, usize) {
        (self.kind.tag().sig_char(), self.size)
    }

    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

impl PartialEq for FieldDecl {
    fn eq(&self, other: &Self) -> bool {
        (self.offset, self.size, &self.kind) == (other.offset, other.size, &other.kind)
    }
}

impl Eq for FieldDecl {}

impl Hash for FieldDecl {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.offset.hash(state);
        self.size.hash(state);
        self.kind.hash(state);
    }
}

impl PartialOrd for FieldDecl {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldDecl {
    fn cmp(&self, other: &Self) -> Ordering {
        self.offset
            .cmp(&other.offset)
            .then(self.size.cmp(&other.size))
            .then(self.kind.tag().type_id().cmp(&other.kind.tag().type_id()))
    }
}

/// A reusable record type: a name, a size and an ordered, non-overlapping
/// field list tiling `[0, size)`.
///
/// Shared as [SharedType]; after unification all instances of one chain hold
/// the *same* `Rc`, so type identity is `Rc::ptr_eq`, not name equality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordType {
    type_name: String,
    size: usize,
    fields: Vec<FieldDecl>,
}

pub type SharedType = Rc<RecordType>;

impl RecordType {
    /// Build a type, validating field ordering and bounds.
    pub fn new(
        type_name: impl Into<String>,
        size: usize,
        fields: Vec<FieldDecl>,
    ) -> Result<RecordType> {
        let type_name = type_name.into();
        let mut end = 0usize;
        let mut total = 0usize;
        for f in &fields {
            if f.size == 0 {
                return Err(Error::invariant(format!(
                    "{}: zero-sized field at offset {}",
                    type_name, f.offset
                )));
            }
            if f.offset < end {
                return Err(Error::invariant(format!(
                    "{}: field at offset {} overlaps the previous field",
                    type_name, f.offset
                )));
            }
            end = f.end();
            total += f.size;
        }
        if total > size {
            return Err(Error::invariant(format!(
                "{}: fields cover {} bytes of a {} byte record",
                type_name, total, size
            )));
        }
        Ok(RecordType {
            type_name,
            size,
            fields,
        })
    }

    /// The placeholder type every record starts with.
    pub fn anonymous(address: u64, size: usize) -> RecordType {
        RecordType {
            type_name: format!("struct_{:x}", address),
            size,
            fields: Vec::new(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn fields(&self) -> &[FieldDecl] {
        &self.fields
    }

    pub fn field_at_offset(&self, offset: usize) -> Option<&FieldDecl> {
        self.fields
            .iter()
            .find(|f| f.offset <= offset && offset < f.end())
    }

    pub fn pointer_fields(&self) -> impl Iterator<Item = &FieldDecl> {
        self.fields.iter().filter(|f| f.kind.is_pointer())
    }

    /// Concatenation of `<sig char><size>` over the fields.
    pub fn signature_text(&self) -> String {
        let mut sig = String::new();
        for f in &self.fields {
            let (c, n) = f.signature();
            sig.push(c);
            sig.push_str(&n.to_string());
        }
        sig
    }

    /// A copy of this type under a new name.
    pub fn renamed(&self, type_name: impl Into<String>) -> RecordType {
        RecordType {
            type_name: type_name.into(),
            size: self.size,
            fields: self.fields.clone(),
        }
    }

    /// A copy with one field replaced (matched by offset).
    pub fn with_field(&self, field: FieldDecl) -> RecordType {
        let mut fields = self.fields.clone();
        if let Some(slot) = fields.iter_mut().find(|f| f.offset == field.offset) {
            *slot = field;
        }
        RecordType {
            type_name: self.type_name.clone(),
            size: self.size,
            fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Endianness, WordSize};
    use strum::IntoEnumIterator;

    #[test]
    fn kind_ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for tag in FieldKindTag::iter() {
            assert!(seen.insert(tag.type_id()), "duplicate id for {:?}", tag);
        }
    }

    #[test]
    fn signature_text_concatenates_codes_and_sizes() {
        let t = RecordType::new(
            "t",
            16,
            vec![
                FieldDecl::pointer_to(0, 8, 0x1000),
                FieldDecl::new(8, 8, FieldKind::Zeroes),
            ],
        )
        .unwrap();
        assert_eq!("P8z8", t.signature_text());
    }

    #[test]
    fn overlapping_fields_are_rejected() {
        let res = RecordType::new(
            "t",
            8,
            vec![
                FieldDecl::new(0, 8, FieldKind::Zeroes),
                FieldDecl::new(4, 4, FieldKind::Unknown),
            ],
        );
        assert!(matches!(res, Err(Error::Invariant(_))));
    }

    #[test]
    fn oversized_fields_are_rejected() {
        let res = RecordType::new("t", 4, vec![FieldDecl::new(0, 8, FieldKind::Zeroes)]);
        assert!(matches!(res, Err(Error::Invariant(_))));
    }

    #[test]
    fn generated_names_use_basename_and_offset() {
        let f = FieldDecl::new(8, 8, FieldKind::Pointer);
        assert_eq!("ptr_8", f.name());

        let mut named = f.clone();
        named.set_name("next");
        assert_eq!("next", named.name());
        // naming does not affect equality
        assert_eq!(f, named);
    }

    #[test]
    fn array_type_decl_nests() {
        let target = TargetPlatform::new(WordSize::U64, Endianness::Little);
        let kind = FieldKind::Array {
            item: Box::new(FieldKind::Pointer),
            item_size: 8,
            count: 4,
        };
        assert_eq!("ctypes.c_void_p * 4", kind.type_decl(32, target));
    }
}
