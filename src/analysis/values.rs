//! Per-type value aggregation: for every unified record type, a histogram
//! of observed values per field across all instances, emitted as the
//! `headers_values.txt` catalog.
use super::{CancelToken, PassStats, ReversePass};
use crate::context::{HeapContext, ProcessContext};
use crate::counter::Counter;
use crate::error::Result;
use crate::fields::{FieldKind, SharedType};
use crate::record::{RecordRef, VALUE_MAX_LEN};
use log::{info, warn};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::rc::Rc;

pub struct ValueRangeAggregator;

impl ValueRangeAggregator {
    pub const REVERSE_LEVEL: u32 = 350;

    pub fn new() -> ValueRangeAggregator {
        ValueRangeAggregator
    }
}

impl Default for ValueRangeAggregator {
    fn default() -> Self {
        ValueRangeAggregator::new()
    }
}

impl ReversePass for ValueRangeAggregator {
    fn name(&self) -> &'static str {
        "ValueRangeAggregator"
    }

    fn level(&self) -> u32 {
        ValueRangeAggregator::REVERSE_LEVEL
    }

    fn reverse_record(&mut self, _ctx: &ProcessContext, _record: &RecordRef) -> Result<()> {
        // aggregation is type-wide; see reverse
        Ok(())
    }

    fn reverse(&mut self, ctx: &ProcessContext, cancel: &CancelToken) -> Result<PassStats> {
        let mut stats = PassStats::default();
        info!(
            "[+] {}: start on {} records",
            self.name(),
            ctx.record_count()
        );

        let groups = group_by_type(ctx)?;

        // the process-wide catalog, then one per heap
        write_catalog(ctx, &groups, &ctx.cache_dir().join("headers_values.txt"), None)?;
        for heap in ctx.heaps() {
            let path = ctx
                .cache_dir()
                .join(format!("headers_values.{:x}.txt", heap.heap_start()));
            write_catalog(ctx, &groups, &path, Some(heap))?;
        }

        for addr in ctx.addresses() {
            if cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }
            let record = ctx.record(addr)?;
            let mut rec = record.borrow_mut();
            if rec.reverse_level() >= self.level() {
                stats.skipped += 1;
                continue;
            }
            rec.set_reverse_level(self.level());
            stats.processed += 1;
        }

        ctx.save_all()?;
        info!("[+] {}: {} types cataloged", self.name(), groups.len());
        Ok(stats)
    }
}

/// Instances grouped by record type *identity* (shared `Rc`, not name),
/// ordered by (size, lowest instance address).
fn group_by_type(ctx: &ProcessContext) -> Result<Vec<(SharedType, Vec<u64>)>> {
    let mut by_identity: HashMap<usize, (SharedType, Vec<u64>)> = HashMap::new();
    for addr in ctx.addresses() {
        let record = ctx.record(addr)?;
        let rec = record.borrow();
        let shared = rec.record_type().clone();
        let key = Rc::as_ptr(&shared) as usize;
        by_identity
            .entry(key)
            .or_insert_with(|| (shared, Vec::new()))
            .1
            .push(addr);
    }
    let mut groups: Vec<(SharedType, Vec<u64>)> =
        by_identity.into_iter().map(|(_, g)| g).collect();
    // addresses were visited ascending, so members[0] is the minimum
    groups.sort_by_key(|(t, members)| (t.size(), members[0]));
    Ok(groups)
}

fn write_catalog(
    ctx: &ProcessContext,
    groups: &[(SharedType, Vec<u64>)],
    path: &std::path::Path,
    heap: Option<&HeapContext>,
) -> Result<()> {
    let mut out = fs::File::create(path)?;
    for (record_type, members) in groups {
        let members: Vec<u64> = match heap {
            Some(h) => members.iter().copied().filter(|&a| h.contains(a)).collect(),
            None => members.to_vec(),
        };
        if members.is_empty() {
            continue;
        }
        let block = render_block(ctx, record_type, &members)?;
        out.write_all(block.as_bytes())?;
        writeln!(out)?;
    }
    Ok(())
}

/// One catalog block: size, signature, instances, per-field histograms,
/// then the class definition.
fn render_block(
    ctx: &ProcessContext,
    record_type: &SharedType,
    members: &[u64],
) -> Result<String> {
    let mut lines = String::new();
    lines.push_str(&format!("# size: {}\n", record_type.size()));
    lines.push_str(&format!("# signature: {}\n", record_type.signature_text()));
    lines.push_str(&format!("# {} instances\n", members.len()));
    let addrs: Vec<String> = members.iter().map(|a| format!("{:#x}", a)).collect();
    lines.push_str(&format!("# @ instances: [{}]\n", addrs.join(",")));

    for (index, decl) in record_type.fields().iter().enumerate() {
        // nested records are too deep to summarize in one line
        if decl.kind().is_record() {
            continue;
        }
        let mut counter: Counter<String> = Counter::new();
        for &addr in members {
            let record = ctx.record(addr)?;
            let rec = record.borrow();
            let fields = rec.fields();
            let field = match fields.get(index) {
                Some(f) => f,
                None => continue,
            };
            match histogram_key(decl.kind(), field) {
                Ok(key) => counter.increment(key),
                Err(e) => warn!("value of {} in {:#x} unreadable: {}", decl.name(), addr, e),
            }
        }
        lines.push_str(&format!(
            "# field: {} values: {}\n",
            decl.name(),
            counter
        ));
    }

    let reference = ctx.record(members[0])?;
    lines.push_str(&reference.borrow().describe());
    Ok(lines)
}

/// Histogram keys follow the catalog's repr conventions: quoted hex for
/// pointers, bare numbers for integers and zeroes, double-quoted reprs for
/// in-record strings.
fn histogram_key(
    kind: &FieldKind,
    field: &crate::record::FieldInstance<'_>,
) -> Result<String> {
    Ok(match kind {
        FieldKind::Pointer | FieldKind::StringPointer => {
            format!("'{}'", field.rendered(VALUE_MAX_LEN)?)
        }
        FieldKind::Integer { .. } | FieldKind::SmallInt { .. } | FieldKind::Zeroes => {
            field.rendered(VALUE_MAX_LEN)?
        }
        kind if kind.is_string() => format!("\"{}\"", field.rendered(VALUE_MAX_LEN)?),
        _ => format!("'{}'", field.rendered(VALUE_MAX_LEN)?),
    })
}
