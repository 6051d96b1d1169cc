//! The string corrector: promote byte runs the word-sized classifier could
//! not see as text, and demote pointers whose target is a C string.
//!
//! The pass is idempotent; promoted fields are never re-examined.
use super::classify::{is_printable, utf16_match};
use super::ReversePass;
use crate::context::ProcessContext;
use crate::error::Result;
use crate::fields::{FieldDecl, FieldKind, FieldKindTag, PointerInfo, RecordType};
use crate::record::RecordRef;
use crate::Endianness;
use std::rc::Rc;

/// Longest pointee prefix examined when deciding whether a pointer targets
/// a string.
const STRING_PROBE_LEN: u64 = 256;

pub struct StringCorrector;

impl StringCorrector {
    pub const REVERSE_LEVEL: u32 = 20;

    pub fn new() -> StringCorrector {
        StringCorrector
    }
}

impl Default for StringCorrector {
    fn default() -> Self {
        StringCorrector::new()
    }
}

impl ReversePass for StringCorrector {
    fn name(&self) -> &'static str {
        "StringCorrector"
    }

    fn level(&self) -> u32 {
        StringCorrector::REVERSE_LEVEL
    }

    fn reverse_record(&mut self, ctx: &ProcessContext, record: &RecordRef) -> Result<()> {
        let mut rec = record.borrow_mut();
        let bytes = rec.bytes()?;
        let min_len = ctx.config().min_string_len;
        let endianness = ctx.platform().endianness();

        let decls = rec.record_type().fields().to_vec();
        let mut out: Vec<FieldDecl> = Vec::with_capacity(decls.len());
        let mut changed = false;

        let mut i = 0;
        while i < decls.len() {
            let decl = &decls[i];

            if promotable(decl.kind()) {
                // merge the contiguous promotable run before matching
                let mut j = i;
                let start = decl.offset();
                let mut end = decl.end();
                while j + 1 < decls.len()
                    && promotable(decls[j + 1].kind())
                    && decls[j + 1].offset() == end
                {
                    j += 1;
                    end = decls[j].end();
                }
                if let Some(promoted) = promote_run(&bytes[start..end], start, endianness, min_len)
                {
                    out.extend(promoted);
                    changed = true;
                    i = j + 1;
                    continue;
                }
            }

            if *decl.kind() == FieldKind::Pointer {
                if let Some(info) = decl.pointer() {
                    if info.value != 0 && read_c_string(ctx, info.value).is_some() {
                        let mut demoted = decl.clone();
                        demoted.set_kind(FieldKind::StringPointer);
                        demoted.set_pointer(PointerInfo {
                            value: info.value,
                            desc: info.desc.clone(),
                            kind_hint: Some(FieldKindTag::StringNull),
                        });
                        out.push(demoted);
                        changed = true;
                        i += 1;
                        continue;
                    }
                }
            }

            out.push(decl.clone());
            i += 1;
        }

        if changed {
            let record_type =
                RecordType::new(rec.record_type().type_name().to_owned(), rec.size(), out)?;
            rec.set_record_type(Rc::new(record_type), false);
        }
        Ok(())
    }
}

fn promotable(kind: &FieldKind) -> bool {
    match kind {
        FieldKind::Unknown | FieldKind::ByteArray => true,
        _ => false,
    }
}

/// Try to turn a merged byte window into string fields. Leftover bytes stay
/// a byte array.
fn promote_run(
    window: &[u8],
    start: usize,
    endianness: Endianness,
    min_len: usize,
) -> Option<Vec<FieldDecl>> {
    let printable = window.iter().take_while(|&&b| is_printable(b)).count();

    if printable >= min_len && printable < window.len() && window[printable] == 0 {
        let mut fields = vec![FieldDecl::new(start, printable + 1, FieldKind::StringNull)];
        push_leftover(&mut fields, start + printable + 1, window.len() - printable - 1);
        return Some(fields);
    }
    if printable == window.len() && printable >= min_len {
        return Some(vec![FieldDecl::new(start, printable, FieldKind::StringAscii)]);
    }

    if let Some(len) = utf16_match(window, 0, endianness, min_len) {
        let mut fields = vec![FieldDecl::new(start, len, FieldKind::StringUtf16)];
        push_leftover(&mut fields, start + len, window.len() - len);
        return Some(fields);
    }
    None
}

fn push_leftover(fields: &mut Vec<FieldDecl>, offset: usize, len: usize) {
    if len > 0 {
        fields.push(FieldDecl::new(offset, len, FieldKind::ByteArray));
    }
}

/// The NUL-terminated printable string at `addr`, if the bytes there form
/// one.
pub(crate) fn read_c_string(ctx: &ProcessContext, addr: u64) -> Option<String> {
    let min_len = ctx.config().min_string_len;
    let mapping = ctx.mem().mapping_for(addr)?;
    let probe = STRING_PROBE_LEN.min(mapping.end() - addr) as usize;
    let view = ctx.mem().read(addr, probe).ok()?;

    let printable = view.iter().take_while(|&&b| is_printable(b)).count();
    if printable >= min_len && printable < view.len() && view[printable] == 0 {
        Some(
            view[..printable]
                .iter()
                .map(|&b| b as char)
                .collect::<String>(),
        )
    } else {
        None
    }
}

/// Like [read_c_string], restricted to read-only mappings; the definition
/// of a "known string region" for pointer classification.
pub(crate) fn read_only_c_string(ctx: &ProcessContext, addr: u64) -> Option<String> {
    let mapping = ctx.mem().mapping_for(addr)?;
    if !mapping.perms().is_read_only() {
        return None;
    }
    read_c_string(ctx, addr)
}
