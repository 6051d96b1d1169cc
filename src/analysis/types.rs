//! Signature-based type unification: records of the same size whose
//! signatures are Levenshtein-similar become one shared record type under a
//! freshly minted dictionary-word name.
use super::{CancelToken, PassStats, ReversePass};
use crate::context::ProcessContext;
use crate::error::Result;
use crate::record::RecordRef;
use crate::words::NamePool;
use log::{debug, info};
use petgraph::unionfind::UnionFind;
use std::collections::HashMap;
use std::rc::Rc;

pub struct SignatureTypist {
    pool: NamePool,
}

impl SignatureTypist {
    pub const REVERSE_LEVEL: u32 = 300;

    pub fn new() -> SignatureTypist {
        SignatureTypist {
            pool: NamePool::new(),
        }
    }

    fn fresh_name(&mut self, ctx: &ProcessContext) -> String {
        // a warm cache may already hold names from a previous run
        loop {
            let name = self.pool.next_name();
            if ctx.registry().get(&name).is_none() {
                return name;
            }
        }
    }
}

impl Default for SignatureTypist {
    fn default() -> Self {
        SignatureTypist::new()
    }
}

impl ReversePass for SignatureTypist {
    fn name(&self) -> &'static str {
        "SignatureTypist"
    }

    fn level(&self) -> u32 {
        SignatureTypist::REVERSE_LEVEL
    }

    fn reverse_record(&mut self, _ctx: &ProcessContext, _record: &RecordRef) -> Result<()> {
        // unification needs every signature at once; see reverse
        Ok(())
    }

    fn reverse(&mut self, ctx: &ProcessContext, cancel: &CancelToken) -> Result<PassStats> {
        let mut stats = PassStats::default();
        info!(
            "[+] {}: start on {} records",
            self.name(),
            ctx.record_count()
        );

        // 1. gather (size, address, signature), already-final records stay
        // untouched so a re-run renames nothing
        let mut signatures: Vec<(usize, u64, String)> = Vec::new();
        for addr in ctx.addresses() {
            if cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }
            let record = ctx.record(addr)?;
            let rec = record.borrow();
            if rec.reverse_level() >= self.level() {
                stats.skipped += 1;
                continue;
            }
            signatures.push((rec.size(), addr, rec.signature_text()));
        }
        if stats.cancelled {
            ctx.save_all()?;
            return Ok(stats);
        }
        signatures.sort();

        // 2. pairwise similarity inside equal-size runs; records of
        // different size are never similar
        let threshold = ctx.config().similarity_threshold;
        let mut uf = UnionFind::<usize>::new(signatures.len());
        for i in 0..signatures.len() {
            for j in (i + 1)..signatures.len() {
                if signatures[j].0 != signatures[i].0 {
                    break;
                }
                if levenshtein_ratio(&signatures[i].2, &signatures[j].2) >= threshold {
                    uf.union(i, j);
                }
            }
        }

        // 3. connected components are the chains
        let mut groups: HashMap<usize, Vec<u64>> = HashMap::new();
        for (i, &(_, addr, _)) in signatures.iter().enumerate() {
            groups.entry(uf.find(i)).or_default().push(addr);
        }
        let mut chains: Vec<Vec<u64>> = groups
            .into_iter()
            .map(|(_, mut members)| {
                members.sort_unstable();
                members
            })
            .filter(|members| members.len() >= 2)
            .collect();
        // short chains first gives a near-stable naming across runs
        chains.sort_by_key(|c| (c.len(), c[0]));

        // 4. each chain gets one dictionary-word name and one shared type,
        // donated by its lowest-address record
        for chain in &chains {
            let name = self.fresh_name(ctx);
            debug!(
                "chain of {} records named {} (reference {:#x})",
                chain.len(),
                name,
                chain[0]
            );
            let reference = ctx.record(chain[0])?;
            let shared = Rc::new(reference.borrow().record_type().renamed(name.clone()));
            ctx.registry().register(shared.clone());
            for &addr in chain {
                let record = ctx.record(addr)?;
                let mut rec = record.borrow_mut();
                rec.set_record_type(shared.clone(), true);
                rec.set_reverse_level(self.level());
                stats.processed += 1;
            }
        }

        // 5. tag the unchained records too; their per-instance type stands
        for &(_, addr, _) in &signatures {
            let record = ctx.record(addr)?;
            let mut rec = record.borrow_mut();
            if rec.reverse_level() < self.level() {
                rec.set_reverse_level(self.level());
                stats.processed += 1;
            }
        }

        ctx.save_all()?;
        info!(
            "[+] {}: {} chains, {} records typed",
            self.name(),
            chains.len(),
            stats.processed
        );
        Ok(stats)
    }
}

/// Levenshtein ratio with substitutions weighted 2 (an indel distance),
/// `(|a| + |b| - dist) / (|a| + |b|)`.
pub fn levenshtein_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let lensum = a.len() + b.len();
    if lensum == 0 {
        return 1.0;
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for (i, &ca) in a.iter().enumerate() {
        let mut cur = Vec::with_capacity(b.len() + 1);
        cur.push(i + 1);
        for (j, &cb) in b.iter().enumerate() {
            let subst = prev[j] + if ca == cb { 0 } else { 2 };
            let insert = cur[j] + 1;
            let delete = prev[j + 1] + 1;
            cur.push(subst.min(insert).min(delete));
        }
        prev = cur;
    }
    (lensum - prev[b.len()]) as f64 / lensum as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_signatures_have_ratio_one() {
        assert_eq!(1.0, levenshtein_ratio("P8z8", "P8z8"));
        assert_eq!(1.0, levenshtein_ratio("", ""));
    }

    #[test]
    fn one_substitution_in_twelve_chars_is_about_091() {
        let ratio = levenshtein_ratio("I4i4I4I4I4I4", "I4I4I4I4I4I4");
        assert!((ratio - 22.0 / 24.0).abs() < 1e-9, "got {}", ratio);
        assert!(ratio >= 0.75);
    }

    #[test]
    fn disjoint_signatures_fall_below_threshold() {
        assert!(levenshtein_ratio("P8P8P8", "z4T12u1") < 0.75);
    }

    #[test]
    fn ratio_matches_the_weighted_distance() {
        // one substitution costs 2
        let ratio = levenshtein_ratio("abc", "abd");
        assert!((ratio - 4.0 / 6.0).abs() < 1e-9);
        // pure insertion costs 1
        let ratio = levenshtein_ratio("abc", "abcd");
        assert!((ratio - 6.0 / 7.0).abs() < 1e-9);
    }
}
