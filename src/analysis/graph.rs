//! Build the two pointer graphs, prune them, group components by
//! isomorphism and emit the graph artifacts.
use super::{CancelToken, PassStats, ReversePass};
use crate::context::ProcessContext;
use crate::error::Result;
use crate::fields::PointeeDesc;
use crate::graphs::{isomorphism_classes, PointerGraph, PointerGraphs};
use crate::record::RecordRef;
use log::info;
use std::fs;
use std::io::Write;
use std::mem;
use std::rc::Rc;

pub struct PointerGraphBuilder {
    full: PointerGraph,
    heaps: PointerGraph,
}

impl PointerGraphBuilder {
    pub const REVERSE_LEVEL: u32 = 150;

    /// Components this small are noise and are pruned.
    const MIN_COMPONENT: usize = 3;
    /// Neighborhood depth of the important-record dumps.
    const IMPORTANT_DEPTH: usize = 2;

    pub fn new() -> PointerGraphBuilder {
        PointerGraphBuilder {
            full: PointerGraph::new(),
            heaps: PointerGraph::new(),
        }
    }
}

impl Default for PointerGraphBuilder {
    fn default() -> Self {
        PointerGraphBuilder::new()
    }
}

impl ReversePass for PointerGraphBuilder {
    fn name(&self) -> &'static str {
        "PointerGraphBuilder"
    }

    fn level(&self) -> u32 {
        PointerGraphBuilder::REVERSE_LEVEL
    }

    /// Graphs are in-memory artifacts, so this pass walks every record on
    /// every run instead of early-outing on the reverse level (which the
    /// pointer resolver shares).
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
            self.reverse_record(ctx, &record)?;
            let mut rec = record.borrow_mut();
            if rec.reverse_level() < self.level() {
                rec.set_reverse_level(self.level());
            }
            stats.processed += 1;
        }
        if !stats.cancelled {
            self.finish(ctx)?;
        }
        ctx.save_all()?;
        info!(
            "[+] {}: full graph {} nodes / {} edges, heaps graph {} nodes / {} edges",
            self.name(),
            self.full.node_count(),
            self.full.edge_count(),
            self.heaps.node_count(),
            self.heaps.edge_count()
        );
        Ok(stats)
    }

    fn reverse_record(&mut self, ctx: &ProcessContext, record: &RecordRef) -> Result<()> {
        let rec = record.borrow();
        let addr = rec.address();
        let heap = ctx.heap_for(addr).map(|h| h.heap_start());

        self.full.ensure_node(addr, heap, rec.size(), None);
        self.heaps.ensure_node(addr, heap, rec.size(), None);

        for field in rec.fields() {
            if !field.decl().kind().is_pointer() {
                continue;
            }
            // per-instance value; the decl may belong to a shared type
            let value = match field.word() {
                Ok(value) => value,
                Err(_) => continue,
            };
            if value == 0 {
                continue;
            }
            match super::pointers::resolve(ctx, value) {
                PointeeDesc::KnownRecord { addr: head, .. } => {
                    let target_heap = ctx.heap_for(head).map(|h| h.heap_start());
                    let target_size = ctx.store().size_of(head).unwrap_or(0);
                    self.full.ensure_node(value, target_heap, target_size, None);
                    self.full.add_edge(addr, value);
                    self.heaps.ensure_node(head, target_heap, target_size, None);
                    self.heaps.add_edge(addr, head);
                }
                _ => {
                    // out-of-heap target: a virtual node tagged by mapping
                    let mapping = ctx.mem().mapping_for(value).map(|m| m.name().clone());
                    self.full.ensure_node(value, None, 0, mapping);
                    self.full.add_edge(addr, value);
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self, ctx: &ProcessContext) -> Result<()> {
        self.full.prune_small_components(Self::MIN_COMPONENT);
        self.heaps.prune_small_components(Self::MIN_COMPONENT);

        let iso_classes = isomorphism_classes(&self.heaps);
        for class in &iso_classes {
            info!(
                "isomorphism class at {:#x}: {} components",
                class.representative,
                class.members.len()
            );
        }

        let mut out = fs::File::create(ctx.cache_dir().join("graph.gexf"))?;
        self.full.write_gexf(&mut out)?;
        let mut out = fs::File::create(ctx.cache_dir().join("graph.heaps.gexf"))?;
        self.heaps.write_gexf(&mut out)?;

        self.write_important(ctx)?;

        ctx.set_graphs(Rc::new(PointerGraphs {
            full: mem::take(&mut self.full),
            heaps: mem::take(&mut self.heaps),
            iso_classes,
        }));
        Ok(())
    }
}

impl PointerGraphBuilder {
    /// Dump the depth-2 out-neighborhood of the most pointed-to records.
    fn write_important(&self, ctx: &ProcessContext) -> Result<()> {
        for addr in self.heaps.top_in_degree(ctx.config().important_top_k) {
            let nodes = self
                .heaps
                .depth_subgraph(&[addr], Self::IMPORTANT_DEPTH);
            let path = ctx
                .cache_dir()
                .join(format!("{:#x}.subdigraph.py", addr));
            let mut out = fs::File::create(&path)?;
            for node in nodes {
                if let Some(record) = ctx.record_at(node) {
                    let rec = record.borrow();
                    writeln!(out, "# {:#x}\n{}", node, rec.describe())?;
                }
            }
        }
        Ok(())
    }
}
