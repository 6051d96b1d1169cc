//! Resolve every pointer field to what it targets: a known record (exactly
//! or at an interior offset), a string, an external mapping, null, or
//! nothing we can name.
use super::{strings, ReversePass};
use crate::context::ProcessContext;
use crate::error::Result;
use crate::fields::{FieldKindTag, PointeeDesc, PointerInfo, RecordType};
use crate::record::RecordRef;
use std::rc::Rc;

pub struct PointerResolver;

impl PointerResolver {
    pub const REVERSE_LEVEL: u32 = 150;

    pub fn new() -> PointerResolver {
        PointerResolver
    }
}

impl Default for PointerResolver {
    fn default() -> Self {
        PointerResolver::new()
    }
}

impl ReversePass for PointerResolver {
    fn name(&self) -> &'static str {
        "PointerResolver"
    }

    fn level(&self) -> u32 {
        PointerResolver::REVERSE_LEVEL
    }

    fn reverse_record(&mut self, ctx: &ProcessContext, record: &RecordRef) -> Result<()> {
        let mut rec = record.borrow_mut();
        let bytes = rec.bytes()?;
        let target = ctx.platform();

        let mut fields = rec.record_type().fields().to_vec();
        let mut changed = false;
        for field in &mut fields {
            if !field.kind().is_pointer() {
                continue;
            }
            // decode from this instance's bytes: the decl may belong to a
            // type shared with records holding different values
            let value = match target.read_word(&bytes[field.offset()..]) {
                Some(value) => value,
                None => continue,
            };
            let desc = resolve(ctx, value);
            let kind_hint = field
                .pointer()
                .and_then(|p| p.kind_hint)
                .or_else(|| kind_hint_for(ctx, &desc));
            let info = PointerInfo {
                value,
                desc,
                kind_hint,
            };
            if field.pointer() != Some(&info) {
                field.set_pointer(info);
                changed = true;
            }
        }

        if changed {
            let record_type =
                RecordType::new(rec.record_type().type_name().to_owned(), rec.size(), fields)?;
            rec.set_record_type(Rc::new(record_type), false);
        }
        Ok(())
    }
}

/// Resolution order: null, known record (head or interior), string in a
/// read-only mapping, external mapping, unresolved.
pub fn resolve(ctx: &ProcessContext, value: u64) -> PointeeDesc {
    if value == 0 {
        return PointeeDesc::Null;
    }
    if let Some((head, _size)) = ctx.allocation_containing(value) {
        return PointeeDesc::KnownRecord {
            addr: head,
            offset: value - head,
        };
    }
    if strings::read_only_c_string(ctx, value).is_some() {
        return PointeeDesc::String;
    }
    if let Some(mapping) = ctx.mem().mapping_for(value) {
        if ctx.heap_for(value).is_none() {
            return PointeeDesc::ExternalLibrary {
                mapping: mapping.name().clone(),
            };
        }
    }
    PointeeDesc::Unresolved
}

/// Fill the kind hint for pointers to known records, once targets have
/// been classified.
pub fn kind_hint_for(ctx: &ProcessContext, desc: &PointeeDesc) -> Option<FieldKindTag> {
    match desc {
        PointeeDesc::KnownRecord { addr, .. } => {
            let record = ctx.record_at(*addr)?;
            let rec = record.borrow();
            rec.record_type()
                .fields()
                .first()
                .map(|f| f.kind().tag())
        }
        PointeeDesc::String => Some(FieldKindTag::StringNull),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Config, ProcessContext};
    use crate::mem::{HeapSpec, MemBuffer, MemorySource, Perms};
    use crate::{Endianness, TargetPlatform, WordSize};

    fn ctx() -> (ProcessContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut mem = MemBuffer::new(
            "resolve",
            TargetPlatform::new(WordSize::U64, Endianness::Little),
        );
        mem.add_mapping(0x1000, Perms::RW, "[heap]", vec![0u8; 0x40]);
        mem.add_mapping(0x6000, Perms::R, ".rodata", b"some text\0".to_vec());
        mem.add_mapping(0x7000, Perms::RX, "libc.so", vec![0x90; 0x20]);
        mem.add_heap(HeapSpec {
            heap_start: 0x1000,
            allocations: vec![(0x1000, 0x10), (0x1010, 0x10)],
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

    #[test]
    fn resolution_covers_every_outcome() {
        let (ctx, _dir) = ctx();

        assert_eq!(PointeeDesc::Null, resolve(&ctx, 0));
        assert_eq!(
            PointeeDesc::KnownRecord {
                addr: 0x1010,
                offset: 0
            },
            resolve(&ctx, 0x1010)
        );
        assert_eq!(
            PointeeDesc::KnownRecord {
                addr: 0x1010,
                offset: 4
            },
            resolve(&ctx, 0x1014)
        );
        assert_eq!(PointeeDesc::String, resolve(&ctx, 0x6000));
        assert_eq!(
            PointeeDesc::ExternalLibrary {
                mapping: "libc.so".to_owned()
            },
            resolve(&ctx, 0x7008)
        );
        assert_eq!(PointeeDesc::Unresolved, resolve(&ctx, 0x9999_9999));
    }
}
