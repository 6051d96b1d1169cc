use std::fmt;
use std::{borrow, collections, hash};

/// A convenience wrapper around a HashMap<K, u64>, displayed the way the
/// value-range catalog prints histograms: `Counter({k: n, ...})` with the
/// highest counts first.
pub struct Counter<K> {
    counts: collections::HashMap<K, u64>,
}

impl<K: Eq + hash::Hash> Counter<K> {
    pub fn new() -> Counter<K> {
        Counter {
            counts: collections::HashMap::new(),
        }
    }

    pub fn increment(&mut self, key: K) {
        self.counts
            .entry(key)
            .and_modify(|count| *count += 1)
            .or_insert(1);
    }

    pub fn get<Q>(&self, key: &Q) -> Option<u64>
    where
        K: borrow::Borrow<Q>,
        Q: hash::Hash + Eq + ?Sized,
    {
        self.counts.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &u64)> {
        self.counts.iter()
    }

    pub fn retain<F>(&mut self, f: F)
    where
        F: FnMut(&K, &mut u64) -> bool,
    {
        self.counts.retain(f)
    }
}

impl<K: Eq + hash::Hash + Ord> Counter<K> {
    /// Entries ordered by descending count, ties broken by key.
    pub fn most_common(&self) -> Vec<(&K, u64)> {
        let mut entries: Vec<(&K, u64)> = self.counts.iter().map(|(k, &v)| (k, v)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        entries
    }
}

impl<K: Eq + hash::Hash> Default for Counter<K> {
    fn default() -> Self {
        Counter::new()
    }
}

impl<K: Eq + hash::Hash> std::ops::AddAssign for Counter<K> {
    fn add_assign(&mut self, rhs: Self) {
        rhs.counts.into_iter().for_each(|(key, count)| {
            self.counts
                .entry(key)
                .and_modify(|orig_count| *orig_count += count)
                .or_insert(count);
        })
    }
}

impl<K: Eq + hash::Hash + Ord + fmt::Display> fmt::Display for Counter<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Counter({{")?;
        for (i, (key, count)) in self.most_common().into_iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", key, count)?;
        }
        write!(f, "}})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    #[test]
    fn get_gets() {
        let mut counter = Counter::new();

        counter.increment("foo");
        counter.increment("foo");
        counter.increment("bar");

        assert_eq!(Some(2), counter.get("foo"));
        assert_eq!(Some(1), counter.get("bar"));
        assert_eq!(None, counter.get("baz"));
    }

    #[test]
    fn add_assign_sums() {
        let mut counter = Counter::new();

        counter.increment("foo");
        counter.increment("foo");
        counter.increment("bar");

        let mut counter2 = Counter::new();

        counter2.increment("foo");
        counter2.increment("quux");

        counter += counter2;

        let mut pairs = counter.iter().map(|(&k, &v)| (k, v)).collect_vec();
        pairs.sort_by_key(|&(key, _val)| key);

        assert_eq!(vec![("bar", 1_u64), ("foo", 3), ("quux", 1)], pairs);
    }

    #[test]
    fn display_matches_the_catalog_format() {
        let mut counter = Counter::new();
        counter.increment("'foo'");
        counter.increment("'bar'");
        counter.increment("'foo'");

        assert_eq!("Counter({'foo': 2, 'bar': 1})", counter.to_string());
    }
}
