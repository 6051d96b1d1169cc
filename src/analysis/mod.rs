//! The reversing passes and the pipeline driver.
//!
//! Each pass establishes the invariants of its `REVERSE_LEVEL`; downstream
//! passes assume them. Records whose level already meets a pass's level are
//! skipped, which is what makes a re-run on a warm cache cheap.
use crate::context::ProcessContext;
use crate::error::Result;
use crate::record::{RecordRef, VALUE_MAX_LEN};
use log::{info, warn};
use std::fs;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod classify;
pub mod graph;
pub mod lists;
pub mod pointers;
pub mod strings;
pub mod types;
pub mod values;

/// Cooperative cancellation flag, checked between records (never inside
/// one).
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// What one pass did.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassStats {
    pub processed: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

/// One reversing pass over the shared context.
///
/// The default `reverse` drives the common shape: iterate records in
/// ascending address order, early-out on records already at this pass's
/// level, recover per-record failures by logging and skipping. Passes that
/// need a global view (list detection, type unification) override it.
pub trait ReversePass {
    fn name(&self) -> &'static str;

    /// The reverse level this pass establishes.
    fn level(&self) -> u32;

    fn reverse_record(&mut self, ctx: &ProcessContext, record: &RecordRef) -> Result<()>;

    /// Called once after the record sweep; context-wide work and artifact
    /// emission go here.
    fn finish(&mut self, _ctx: &ProcessContext) -> Result<()> {
        Ok(())
    }

    fn reverse(&mut self, ctx: &ProcessContext, cancel: &CancelToken) -> Result<PassStats> {
        let mut stats = PassStats::default();
        info!(
            "[+] {}: start on {} records",
            self.name(),
            ctx.record_count()
        );
        for addr in ctx.addresses() {
            if cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }
            let record = ctx.record(addr)?;
            if record.borrow().reverse_level() >= self.level() {
                stats.skipped += 1;
                continue;
            }
            match self.reverse_record(ctx, &record) {
                Ok(()) => {
                    record.borrow_mut().set_reverse_level(self.level());
                    stats.processed += 1;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("{}: skipping {:#x}: {}", self.name(), addr, e),
            }
        }
        if !stats.cancelled {
            self.finish(ctx)?;
        }
        // partially updated records are flushed even on cancellation
        ctx.save_all()?;
        info!(
            "[+] {}: {} reversed, {} already done",
            self.name(),
            stats.processed,
            stats.skipped
        );
        Ok(stats)
    }
}

/// Outcome of a pipeline run.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReverseSummary {
    pub records: usize,
    pub processed: usize,
    pub cancelled: bool,
}

/// Run the whole pipeline over the context, leaf passes first.
///
/// On cancellation the current pass flushes what it finished and the
/// pipeline exits cleanly with the partial summary.
pub fn reverse_instances(ctx: &ProcessContext, cancel: &CancelToken) -> Result<ReverseSummary> {
    let mut passes: Vec<Box<dyn ReversePass>> = vec![
        Box::new(classify::FieldClassifier::new()),
        Box::new(strings::StringCorrector::new()),
        Box::new(lists::DoubleLinkedListDetector::new()),
        Box::new(pointers::PointerResolver::new()),
        Box::new(graph::PointerGraphBuilder::new()),
        Box::new(types::SignatureTypist::new()),
        Box::new(values::ValueRangeAggregator::new()),
    ];

    let mut summary = ReverseSummary {
        records: ctx.record_count(),
        ..ReverseSummary::default()
    };
    for pass in &mut passes {
        let stats = pass.reverse(ctx, cancel)?;
        summary.processed += stats.processed;
        if stats.cancelled {
            summary.cancelled = true;
            break;
        }
    }

    if !summary.cancelled {
        write_strings(ctx)?;
    }
    ctx.save_all()?;
    info!(
        "analysis results are in {}",
        ctx.cache_dir().display()
    );
    Ok(summary)
}

/// Run only the field-level passes; enough for showing single records.
pub fn ensure_classified(ctx: &ProcessContext, cancel: &CancelToken) -> Result<()> {
    classify::FieldClassifier::new().reverse(ctx, cancel)?;
    strings::StringCorrector::new().reverse(ctx, cancel)?;
    Ok(())
}

/// Emit the `strings` listing: every string field discovered, with its
/// absolute address.
pub fn write_strings(ctx: &ProcessContext) -> Result<usize> {
    let path = ctx.cache_dir().join("strings");
    let mut out = fs::File::create(&path)?;
    let mut count = 0;
    for addr in ctx.addresses() {
        let record = ctx.record(addr)?;
        let rec = record.borrow();
        for field in rec.fields() {
            if !field.decl().kind().is_string() {
                continue;
            }
            let rendered = match field.rendered(VALUE_MAX_LEN) {
                Ok(text) => text,
                Err(e) => {
                    warn!("strings: skipping field in {:#x}: {}", addr, e);
                    continue;
                }
            };
            writeln!(
                out,
                "{:#x} {} {}",
                addr + field.decl().offset() as u64,
                field.decl().kind().tag().basename(),
                rendered
            )?;
            count += 1;
        }
    }
    info!("wrote {} strings to {:?}", count, path);
    Ok(count)
}
