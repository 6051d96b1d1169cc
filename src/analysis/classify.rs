//! The field classifier: tile every allocation with typed field
//! declarations using byte-pattern matchers.
//!
//! Matchers apply in priority order per word window: null, pointer, ascii,
//! utf-16, integer. Classification is infallible; anything unreadable
//! degrades to padding.
use super::{strings, ReversePass};
use crate::context::ProcessContext;
use crate::error::{Error, Result};
use crate::fields::{FieldDecl, FieldKind};
use crate::record::RecordRef;
use crate::{Endianness, TargetPlatform};
use std::rc::Rc;

pub struct FieldClassifier;

impl FieldClassifier {
    pub const REVERSE_LEVEL: u32 = 10;

    pub fn new() -> FieldClassifier {
        FieldClassifier
    }
}

impl Default for FieldClassifier {
    fn default() -> Self {
        FieldClassifier::new()
    }
}

impl ReversePass for FieldClassifier {
    fn name(&self) -> &'static str {
        "FieldClassifier"
    }

    fn level(&self) -> u32 {
        FieldClassifier::REVERSE_LEVEL
    }

    fn reverse_record(&mut self, ctx: &ProcessContext, record: &RecordRef) -> Result<()> {
        let mut rec = record.borrow_mut();
        let address = rec.address();
        let size = rec.size();

        let fields = match rec.bytes() {
            Ok(bytes) => classify_bytes(&bytes, address, ctx),
            // reads past the captured mappings degrade to padding
            Err(Error::OutOfRange { .. }) => vec![FieldDecl::padding(0, size)],
            Err(e) => return Err(e),
        };

        let record_type =
            crate::fields::RecordType::new(format!("struct_{:x}", address), size, fields)?;
        rec.set_record_type(Rc::new(record_type), false);
        Ok(())
    }
}

/// Produce the ordered field list tiling `[0, bytes.len())`.
pub fn classify_bytes(bytes: &[u8], address: u64, ctx: &ProcessContext) -> Vec<FieldDecl> {
    let target = ctx.platform();
    let word = target.word_bytes();
    let min_len = ctx.config().min_string_len;
    let size = bytes.len();

    let mut fields: Vec<FieldDecl> = Vec::new();
    let mut offset = 0;

    while offset + word <= size {
        let value = word_at(bytes, offset, target);

        // zero run, greedy over whole words (plus trailing zero bytes when
        // the run reaches the truncated tail)
        if value == 0 {
            let start = offset;
            while offset + word <= size && word_at(bytes, offset, target) == 0 {
                offset += word;
            }
            if size - offset < word {
                while offset < size && bytes[offset] == 0 {
                    offset += 1;
                }
            }
            fields.push(FieldDecl::new(start, offset - start, FieldKind::Zeroes));
            continue;
        }

        if pointer_match(value, address, size, ctx, target) {
            fields.push(FieldDecl::pointer_to(offset, word, value));
            offset += word;
            continue;
        }

        if let Some((len, terminated)) = ascii_match(bytes, offset, word, min_len) {
            let kind = if terminated {
                FieldKind::StringNull
            } else {
                FieldKind::StringAscii
            };
            fields.push(FieldDecl::new(offset, len, kind));
            offset += len;
            continue;
        }

        if let Some(len) = utf16_match(bytes, offset, target.endianness(), min_len) {
            fields.push(FieldDecl::new(offset, len, FieldKind::StringUtf16));
            offset += len;
            continue;
        }

        fields.push(integer_field(offset, word, value, target));
        offset += word;
    }

    // the final word may be truncated by allocator metadata
    if offset < size {
        let rest = &bytes[offset..];
        if rest.iter().all(|&b| b == 0) {
            fields.push(FieldDecl::new(offset, size - offset, FieldKind::Zeroes));
        } else {
            fields.push(FieldDecl::padding(offset, size - offset));
        }
    }

    let fields = coalesce_byte_runs(fields, bytes, target);
    coalesce_pointer_arrays(fields, word)
}

fn word_at(bytes: &[u8], offset: usize, target: TargetPlatform) -> u64 {
    target
        .read_word(&bytes[offset..])
        .expect("caller checked a full word remains")
}

/// High half of the word is all zero (a small value) or all ones (a small
/// negative value).
fn small_int_class(value: u64, target: TargetPlatform) -> Option<bool> {
    let half_bits = (target.word_bytes() * 8 / 2) as u32;
    let hi = value >> half_bits;
    let all_ones = (1u64 << half_bits) - 1;
    if hi == 0 {
        Some(false)
    } else if hi == all_ones {
        Some(true)
    } else {
        None
    }
}

fn integer_field(offset: usize, word: usize, value: u64, target: TargetPlatform) -> FieldDecl {
    let kind = match small_int_class(value, target) {
        Some(signed) => FieldKind::SmallInt { signed },
        None => FieldKind::Integer { signed: false },
    };
    FieldDecl::new(offset, word, kind)
}

/// A word is a pointer when it lands in a known mapping, does not point
/// into the record being classified (self-embedded offsets are data), and,
/// when it could equally be a small integer, only if the target is an
/// allocated record or a known string region.
fn pointer_match(
    value: u64,
    record_address: u64,
    record_size: usize,
    ctx: &ProcessContext,
    target: TargetPlatform,
) -> bool {
    if value == 0 {
        return false;
    }
    if record_address <= value && value < record_address + record_size as u64 {
        return false;
    }
    if ctx.mem().mapping_for(value).is_none() {
        return false;
    }
    if small_int_class(value, target).is_some() {
        return ctx.allocation_containing(value).is_some()
            || strings::read_only_c_string(ctx, value).is_some();
    }
    true
}

/// `Some((field_len, nul_terminated))` when a printable run of at least
/// `min_len` bytes starts at `offset` and ends in a NUL or at a word
/// boundary.
fn ascii_match(
    bytes: &[u8],
    offset: usize,
    word: usize,
    min_len: usize,
) -> Option<(usize, bool)> {
    let mut end = offset;
    while end < bytes.len() && is_printable(bytes[end]) {
        end += 1;
    }
    let run = end - offset;
    if run < min_len {
        return None;
    }
    if end < bytes.len() && bytes[end] == 0 {
        return Some((run + 1, true));
    }
    if end == bytes.len() || end % word == 0 {
        return Some((run, false));
    }
    None
}

/// `Some(field_len)` for a run of at least `min_len` UTF-16 code units of
/// printable ASCII, `(printable, 0)` pairs on little endian targets and
/// `(0, printable)` on big endian. A terminating zero pair is included.
pub(crate) fn utf16_match(
    bytes: &[u8],
    offset: usize,
    endianness: Endianness,
    min_len: usize,
) -> Option<usize> {
    let mut pairs = 0;
    let mut pos = offset;
    while pos + 1 < bytes.len() {
        let (lo, hi) = match endianness {
            Endianness::Little => (bytes[pos], bytes[pos + 1]),
            Endianness::Big => (bytes[pos + 1], bytes[pos]),
        };
        if hi == 0 && is_printable(lo) {
            pairs += 1;
            pos += 2;
        } else {
            break;
        }
    }
    if pairs < min_len {
        return None;
    }
    let mut len = pairs * 2;
    if pos + 1 < bytes.len() && bytes[pos] == 0 && bytes[pos + 1] == 0 {
        len += 2;
    }
    Some(len)
}

pub(crate) fn is_printable(b: u8) -> bool {
    b.is_ascii_graphic() || b == b' ' || b == b'\t'
}

/// Runs of identical small integers in `[0, 255]` become a byte array.
fn coalesce_byte_runs(
    fields: Vec<FieldDecl>,
    bytes: &[u8],
    target: TargetPlatform,
) -> Vec<FieldDecl> {
    let mut out: Vec<FieldDecl> = Vec::with_capacity(fields.len());
    let mut i = 0;
    while i < fields.len() {
        let value = byte_run_value(&fields[i], bytes, target);
        if let Some(value) = value {
            let mut j = i + 1;
            while j < fields.len() && byte_run_value(&fields[j], bytes, target) == Some(value) {
                j += 1;
            }
            if j - i >= 2 {
                let offset = fields[i].offset();
                let size = fields[j - 1].end() - offset;
                let mut decl = FieldDecl::new(offset, size, FieldKind::ByteArray);
                decl.set_comment(format!("{} x {:#04x}", j - i, value));
                out.push(decl);
                i = j;
                continue;
            }
        }
        out.push(fields[i].clone());
        i += 1;
    }
    out
}

fn byte_run_value(field: &FieldDecl, bytes: &[u8], target: TargetPlatform) -> Option<u64> {
    match field.kind() {
        FieldKind::SmallInt { signed: false } if field.size() == target.word_bytes() => {
            let value = word_at(bytes, field.offset(), target);
            if value <= 0xff {
                Some(value)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Runs of four or more pointers collapse into a pointer array (a table,
/// not list links; shorter runs stay word-granular so list detection sees
/// them).
fn coalesce_pointer_arrays(fields: Vec<FieldDecl>, word: usize) -> Vec<FieldDecl> {
    let mut out: Vec<FieldDecl> = Vec::with_capacity(fields.len());
    let mut i = 0;
    while i < fields.len() {
        if *fields[i].kind() == FieldKind::Pointer {
            let mut j = i + 1;
            while j < fields.len()
                && *fields[j].kind() == FieldKind::Pointer
                && fields[j].offset() == fields[j - 1].end()
            {
                j += 1;
            }
            if j - i >= 4 {
                let offset = fields[i].offset();
                let count = j - i;
                out.push(FieldDecl::new(
                    offset,
                    count * word,
                    FieldKind::Array {
                        item: Box::new(FieldKind::Pointer),
                        item_size: word,
                        count,
                    },
                ));
                i = j;
                continue;
            }
        }
        out.push(fields[i].clone());
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Config, ProcessContext};
    use crate::mem::{HeapSpec, MemBuffer, MemorySource, Perms};
    use crate::{WordSize};

    fn ctx_with_allocs(
        bytes: Vec<u8>,
        allocations: Vec<(u64, u64)>,
    ) -> (ProcessContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut mem = MemBuffer::new(
            "classify",
            TargetPlatform::new(WordSize::U64, Endianness::Little),
        );
        let base = 0x1000u64;
        mem.add_mapping(base, Perms::RW, "[heap]", bytes);
        mem.add_heap(HeapSpec {
            heap_start: base,
            allocations,
        });
        let heaps = mem.heaps().to_vec();
        let config = Config {
            cache_root: dir.path().to_owned(),
            ..Config::default()
        };
        let ctx =
            ProcessContext::load(Rc::new(mem) as Rc<dyn MemorySource>, &heaps, config).unwrap();
        (ctx, dir)
    }

    fn ctx_with(bytes: Vec<u8>) -> (ProcessContext, tempfile::TempDir) {
        let len = bytes.len() as u64;
        ctx_with_allocs(bytes, vec![(0x1000, len)])
    }

    fn signature_of(bytes: Vec<u8>) -> String {
        let (ctx, _dir) = ctx_with(bytes);
        let fields = classify_bytes(&ctx.record(0x1000).unwrap().borrow().bytes().unwrap(), 0x1000, &ctx);
        let t = crate::fields::RecordType::new("t", fields.iter().map(|f| f.size()).sum(), fields)
            .unwrap();
        t.signature_text()
    }

    #[test]
    fn all_zero_record_is_one_zeroes_field() {
        assert_eq!("z8", signature_of(vec![0u8; 8]));
    }

    #[test]
    fn one_word_record_yields_exactly_one_field() {
        let (ctx, _dir) = ctx_with(vec![0x2a, 0, 0, 0, 0, 0, 0, 0]);
        let bytes = ctx.record(0x1000).unwrap().borrow().bytes().unwrap();
        let fields = classify_bytes(&bytes, 0x1000, &ctx);
        assert_eq!(1, fields.len());
        assert_eq!(
            FieldKind::SmallInt { signed: false },
            *fields[0].kind()
        );
    }

    #[test]
    fn known_allocation_target_classifies_as_pointer() {
        // first chunk points at the head of the second one
        let mut bytes = 0x1010u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 16]);
        let (ctx, _dir) = ctx_with_allocs(bytes, vec![(0x1000, 8), (0x1010, 8)]);

        let view = ctx.record(0x1000).unwrap().borrow().bytes().unwrap();
        let fields = classify_bytes(&view, 0x1000, &ctx);
        assert_eq!(1, fields.len());
        assert!(fields[0].kind().is_pointer());
        assert_eq!(0x1010, fields[0].pointer().unwrap().value);
    }

    #[test]
    fn self_address_is_an_integer_not_a_pointer() {
        let mut bytes = 0x1000u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0xffu8; 8]);
        let (ctx, _dir) = ctx_with(bytes);
        let view = ctx.record(0x1000).unwrap().borrow().bytes().unwrap();
        let fields = classify_bytes(&view, 0x1000, &ctx);
        assert!(!fields[0].kind().is_pointer());
        assert!(fields[0].kind().is_integer());
    }

    #[test]
    fn ascii_string_with_nul_and_zero_tail() {
        assert_eq!(
            "T6z2",
            signature_of(vec![0x48, 0x65, 0x6c, 0x6c, 0x6f, 0x00, 0x00, 0x00])
        );
    }

    #[test]
    fn short_byte_runs_are_not_strings() {
        // "ab" is below the 4-byte minimum
        let sig = signature_of(vec![0x61, 0x62, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert!(!sig.contains('T'), "got {}", sig);
    }

    #[test]
    fn utf16_pairs_classify_as_wide_string() {
        // "abcd" in UTF-16LE plus terminator, 16 bytes total
        let bytes = vec![
            0x61, 0x00, 0x62, 0x00, 0x63, 0x00, 0x64, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00,
        ];
        let (ctx, _dir) = ctx_with(bytes);
        let view = ctx.record(0x1000).unwrap().borrow().bytes().unwrap();
        let fields = classify_bytes(&view, 0x1000, &ctx);
        assert_eq!(FieldKind::StringUtf16, *fields[0].kind());
        assert_eq!(10, fields[0].size());
    }

    #[test]
    fn identical_small_int_words_coalesce_into_a_byte_array() {
        let mut bytes = Vec::new();
        for _ in 0..3 {
            bytes.extend_from_slice(&7u64.to_le_bytes());
        }
        let (ctx, _dir) = ctx_with(bytes);
        let view = ctx.record(0x1000).unwrap().borrow().bytes().unwrap();
        let fields = classify_bytes(&view, 0x1000, &ctx);
        assert_eq!(1, fields.len());
        assert_eq!(FieldKind::ByteArray, *fields[0].kind());
        assert_eq!(24, fields[0].size());
    }

    #[test]
    fn truncated_tail_becomes_padding() {
        let mut bytes = 0xdead_beef_dead_beefu64.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0xaa, 0xbb, 0xcc]);
        let (ctx, _dir) = ctx_with(bytes);
        let view = ctx.record(0x1000).unwrap().borrow().bytes().unwrap();
        let fields = classify_bytes(&view, 0x1000, &ctx);
        let last = fields.last().unwrap();
        assert!(last.is_padding());
        assert_eq!(3, last.size());
    }

    #[test]
    fn classification_is_deterministic() {
        let bytes = vec![
            0x48, 0x65, 0x6c, 0x6c, 0x6f, 0x00, 0x00, 0x00, 0x2a, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00,
        ];
        let (ctx, _dir) = ctx_with(bytes);
        let view = ctx.record(0x1000).unwrap().borrow().bytes().unwrap();
        let a = classify_bytes(&view, 0x1000, &ctx);
        let b = classify_bytes(&view, 0x1000, &ctx);
        assert_eq!(a, b);
    }
}
