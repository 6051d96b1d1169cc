//! Dictionary word pool for freshly minted type names.
//!
//! Unified record types get human-friendly names from a bundled word list;
//! when the list runs out, names continue as ordered tuples of words of
//! increasing length (`ableable`, `ableacid`, ...), so the pool never
//! exhausts.
use itertools::Itertools;

const WORDS: &str = include_str!("words.txt");

/// Hands out type names in a deterministic order.
pub struct NamePool {
    words: Vec<&'static str>,
    /// Index into the single-word prefix of the sequence.
    next: usize,
    tuple_len: usize,
    /// Ordered word tuples of the current length, joined.
    tuples: Option<Box<dyn Iterator<Item = String>>>,
}

impl NamePool {
    pub fn new() -> NamePool {
        let words: Vec<&'static str> = WORDS
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .collect();
        NamePool {
            words,
            next: 0,
            tuple_len: 1,
            tuples: None,
        }
    }

    /// The next unused name.
    pub fn next_name(&mut self) -> String {
        if self.next < self.words.len() {
            let name = self.words[self.next].to_owned();
            self.next += 1;
            return name;
        }
        loop {
            if let Some(tuples) = &mut self.tuples {
                if let Some(name) = tuples.next() {
                    return name;
                }
            }
            // current tuple length is exhausted (or never started); move on
            // to ordered tuples one word longer
            self.tuple_len += 1;
            let words = self.words.clone();
            let product = (0..self.tuple_len)
                .map(|_| words.clone().into_iter())
                .multi_cartesian_product()
                .map(|parts| parts.concat());
            self.tuples = Some(Box::new(product));
        }
    }
}

impl Default for NamePool {
    fn default() -> Self {
        NamePool::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn names_are_unique_across_the_tuple_boundary() {
        let mut pool = NamePool::new();
        let single = pool.words.len();
        let mut seen = HashSet::new();
        for _ in 0..(single + 50) {
            assert!(seen.insert(pool.next_name()));
        }
    }

    #[test]
    fn tuples_start_after_the_single_words() {
        let mut pool = NamePool::new();
        let words = pool.words.clone();
        for expected in &words {
            assert_eq!(*expected, pool.next_name());
        }
        assert_eq!(format!("{}{}", words[0], words[0]), pool.next_name());
        assert_eq!(format!("{}{}", words[0], words[1]), pool.next_name());
    }

    #[test]
    fn order_is_deterministic() {
        let mut a = NamePool::new();
        let mut b = NamePool::new();
        for _ in 0..100 {
            assert_eq!(a.next_name(), b.next_name());
        }
    }
}
