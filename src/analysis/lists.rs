//! Intrusive doubly linked list discovery.
//!
//! A record with two pointer fields at adjacent offsets `(o, o + word)` is a
//! candidate node when both targets are same-size records whose back
//! pointers agree (a closed ring, or an open list with null ends). Walks
//! abort at the first mismatched node, keeping the prefix collected so far.
use super::{CancelToken, PassStats, ReversePass};
use crate::context::ProcessContext;
use crate::error::Result;
use crate::record::RecordRef;
use log::{debug, info};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::rc::Rc;

/// Shortest accepted list.
const MIN_LIST_LEN: usize = 2;

/// One discovered list: ordered member addresses plus the link offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedList {
    pub members: Vec<u64>,
    pub next_offset: usize,
    pub prev_offset: usize,
    pub closed: bool,
}

struct RecordSnap {
    size: usize,
    /// pointer field offset -> pointee value
    ptrs: HashMap<usize, u64>,
}

pub struct DoubleLinkedListDetector {
    lists: Vec<LinkedList>,
}

impl DoubleLinkedListDetector {
    pub const REVERSE_LEVEL: u32 = 100;

    pub fn new() -> DoubleLinkedListDetector {
        DoubleLinkedListDetector { lists: Vec::new() }
    }

    pub fn lists(&self) -> &[LinkedList] {
        &self.lists
    }
}

impl Default for DoubleLinkedListDetector {
    fn default() -> Self {
        DoubleLinkedListDetector::new()
    }
}

impl ReversePass for DoubleLinkedListDetector {
    fn name(&self) -> &'static str {
        "DoubleLinkedListDetector"
    }

    fn level(&self) -> u32 {
        DoubleLinkedListDetector::REVERSE_LEVEL
    }

    fn reverse_record(&mut self, _ctx: &ProcessContext, _record: &RecordRef) -> Result<()> {
        // detection needs the whole heap at once; see reverse
        Ok(())
    }

    /// Detection runs over a snapshot of every record still below this
    /// level (records typed by an earlier run keep their types), then the
    /// participating types are renamed and the levels bumped.
    fn reverse(&mut self, ctx: &ProcessContext, cancel: &CancelToken) -> Result<PassStats> {
        let mut stats = PassStats::default();
        info!(
            "[+] {}: start on {} records",
            self.name(),
            ctx.record_count()
        );

        let mut snaps: BTreeMap<u64, RecordSnap> = BTreeMap::new();
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
            snaps.insert(addr, snapshot_record(&rec));
        }
        if stats.cancelled {
            ctx.save_all()?;
            return Ok(stats);
        }

        self.lists = discover_lists(&snaps, ctx.platform().word_bytes());
        info!("{}: {} lists found", self.name(), self.lists.len());

        // rename the participating types; all members of one list share one
        // RecordType with next/prev tagged
        for (n, list) in self.lists.iter().enumerate() {
            let seed = list.members[0];
            let record = ctx.record(seed)?;
            let mut fields = record.borrow().record_type().fields().to_vec();
            for field in &mut fields {
                if field.offset() == list.next_offset {
                    field.set_name("next");
                } else if field.offset() == list.prev_offset {
                    field.set_name("prev");
                }
            }
            let type_name = format!("list_{}_{}", n, list.next_offset);
            debug!(
                "list of {} nodes at ({}, {}) -> {}",
                list.members.len(),
                list.next_offset,
                list.prev_offset,
                type_name
            );
            let record_type = Rc::new(crate::fields::RecordType::new(
                type_name,
                record.borrow().size(),
                fields,
            )?);
            ctx.registry().register(record_type.clone());
            for &addr in &list.members {
                let member = ctx.record(addr)?;
                member.borrow_mut().set_record_type(record_type.clone(), false);
            }
        }

        for &addr in snaps.keys() {
            let record = ctx.record(addr)?;
            record.borrow_mut().set_reverse_level(self.level());
            stats.processed += 1;
        }

        ctx.save_all()?;
        info!("[+] {}: {} records scanned", self.name(), stats.processed);
        Ok(stats)
    }
}

fn snapshot_record(rec: &crate::record::AnonymousRecord) -> RecordSnap {
    // pointer values come from each instance's bytes, not the decl
    let mut ptrs = HashMap::new();
    for field in rec.fields() {
        if field.decl().kind().is_pointer() {
            if let Ok(value) = field.word() {
                ptrs.insert(field.decl().offset(), value);
            }
        }
    }
    RecordSnap {
        size: rec.size(),
        ptrs,
    }
}

fn discover_lists(snaps: &BTreeMap<u64, RecordSnap>, word: usize) -> Vec<LinkedList> {
    let mut claimed: HashSet<u64> = HashSet::new();
    let mut lists = Vec::new();

    for (&seed, snap) in snaps {
        if claimed.contains(&seed) {
            continue;
        }
        // candidate (next, prev) offset pairs, ascending; first confirmed
        // walk wins the record
        let mut offsets: Vec<usize> = snap.ptrs.keys().copied().collect();
        offsets.sort_unstable();
        for &o in &offsets {
            if !snap.ptrs.contains_key(&(o + word)) {
                continue;
            }
            if let Some(list) = walk(snaps, &claimed, seed, o, o + word, word) {
                claimed.extend(list.members.iter().copied());
                lists.push(list);
                break;
            }
        }
    }
    lists
}

/// Confirm `seed` as a node of a `(next @ next_off, prev @ prev_off)` list
/// and collect its members in list order.
fn walk(
    snaps: &BTreeMap<u64, RecordSnap>,
    claimed: &HashSet<u64>,
    seed: u64,
    next_off: usize,
    prev_off: usize,
    word: usize,
) -> Option<LinkedList> {
    let seed_snap = &snaps[&seed];
    let ok_peer = |addr: u64| -> bool {
        if claimed.contains(&addr) {
            return false;
        }
        match snaps.get(&addr) {
            Some(s) => {
                s.size == seed_snap.size
                    && s.ptrs.contains_key(&next_off)
                    && s.ptrs.contains_key(&(next_off + word))
            }
            None => false,
        }
    };

    let forward = seed_snap.ptrs[&next_off];
    let backward = seed_snap.ptrs[&prev_off];
    // both ends null means no list at all
    if forward == 0 && backward == 0 {
        return None;
    }
    // peers must point back at the seed
    if forward != 0 && (!ok_peer(forward) || snaps[&forward].ptrs[&prev_off] != seed) {
        return None;
    }
    if backward != 0 && (!ok_peer(backward) || snaps[&backward].ptrs[&next_off] != seed) {
        return None;
    }

    let mut members: VecDeque<u64> = VecDeque::new();
    let mut in_list: HashSet<u64> = HashSet::new();
    members.push_back(seed);
    in_list.insert(seed);

    // forward walk; a mismatch aborts the walk keeping the prefix
    let mut closed = false;
    let mut cur = seed;
    loop {
        let next = snaps[&cur].ptrs[&next_off];
        if next == 0 {
            break;
        }
        if next == seed {
            closed = true;
            break;
        }
        if !ok_peer(next) || in_list.contains(&next) {
            break;
        }
        if snaps[&next].ptrs[&prev_off] != cur {
            break;
        }
        members.push_back(next);
        in_list.insert(next);
        cur = next;
    }

    // backward walk only matters for open lists
    if !closed {
        let mut cur = seed;
        loop {
            let prev = snaps[&cur].ptrs[&prev_off];
            if prev == 0 {
                break;
            }
            if !ok_peer(prev) || in_list.contains(&prev) {
                break;
            }
            if snaps[&prev].ptrs[&next_off] != cur {
                break;
            }
            members.push_front(prev);
            in_list.insert(prev);
            cur = prev;
        }
    }

    if members.len() < MIN_LIST_LEN {
        return None;
    }
    Some(LinkedList {
        members: members.into_iter().collect(),
        next_offset: next_off,
        prev_offset: prev_off,
        closed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(size: usize, ptrs: &[(usize, u64)]) -> RecordSnap {
        RecordSnap {
            size,
            ptrs: ptrs.iter().copied().collect(),
        }
    }

    #[test]
    fn closed_ring_of_three_is_one_list() {
        let mut snaps = BTreeMap::new();
        snaps.insert(0x4000, snap(16, &[(0, 0x4010), (8, 0x4020)]));
        snaps.insert(0x4010, snap(16, &[(0, 0x4020), (8, 0x4000)]));
        snaps.insert(0x4020, snap(16, &[(0, 0x4000), (8, 0x4010)]));

        let lists = discover_lists(&snaps, 8);
        assert_eq!(1, lists.len());
        let list = &lists[0];
        assert!(list.closed);
        assert_eq!(vec![0x4000, 0x4010, 0x4020], list.members);
        assert_eq!((0, 8), (list.next_offset, list.prev_offset));
    }

    #[test]
    fn open_list_walks_both_ways_from_a_middle_seed() {
        // discovery starts at the lowest address, which here is the middle
        // node; the backward walk must still find the head
        let mut snaps = BTreeMap::new();
        snaps.insert(0x5000, snap(16, &[(0, 0x5020), (8, 0x5010)]));
        snaps.insert(0x5010, snap(16, &[(0, 0x5000), (8, 0)]));
        snaps.insert(0x5020, snap(16, &[(0, 0), (8, 0x5000)]));

        let lists = discover_lists(&snaps, 8);
        assert_eq!(1, lists.len());
        let list = &lists[0];
        assert!(!list.closed);
        assert_eq!(vec![0x5010, 0x5000, 0x5020], list.members);
    }

    #[test]
    fn mismatched_back_pointer_keeps_the_prefix() {
        let mut snaps = BTreeMap::new();
        snaps.insert(0x6000, snap(16, &[(0, 0x6010), (8, 0)]));
        snaps.insert(0x6010, snap(16, &[(0, 0x6020), (8, 0x6000)]));
        // broken: prev points elsewhere
        snaps.insert(0x6020, snap(16, &[(0, 0), (8, 0x9999)]));

        let lists = discover_lists(&snaps, 8);
        assert_eq!(1, lists.len());
        assert_eq!(vec![0x6000, 0x6010], lists[0].members);
    }

    #[test]
    fn size_mismatch_disqualifies_a_peer() {
        let mut snaps = BTreeMap::new();
        snaps.insert(0x7000, snap(16, &[(0, 0x7010), (8, 0)]));
        snaps.insert(0x7010, snap(24, &[(0, 0), (8, 0x7000)]));

        assert!(discover_lists(&snaps, 8).is_empty());
    }

    #[test]
    fn standalone_record_is_not_a_list() {
        let mut snaps = BTreeMap::new();
        snaps.insert(0x8000, snap(16, &[(0, 0), (8, 0)]));

        assert!(discover_lists(&snaps, 8).is_empty());
    }
}
