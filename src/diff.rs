use std::cmp::Ordering;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::prelude::*;

/// The next pending element of an in-order traversal: a subtree not yet
/// expanded, or an entry ready to be compared.
enum Item<K, V> {
    Subtree(Link<K, V>),
    Entry(K, V),
}

/// An in-order cursor over one tree, expanding subtrees lazily so that
/// whole shared subtrees can be skipped without loading them.
struct Cursor<K, V> {
    stack: Vec<Item<K, V>>,
}

impl<K: Clone, V: Clone> Cursor<K, V> {
    fn new(root: Link<K, V>) -> Self {
        let mut stack = Vec::new();
        if !root.is_empty() {
            stack.push(Item::Subtree(root));
        }
        Cursor { stack }
    }

    fn top(&self) -> Option<&Item<K, V>> {
        self.stack.last()
    }

    fn pop_subtree(&mut self) -> Link<K, V> {
        match self.stack.pop() {
            Some(Item::Subtree(link)) => link,
            _ => unreachable!("caller checked the top item"),
        }
    }

    fn pop_entry(&mut self) -> (K, V) {
        match self.stack.pop() {
            Some(Item::Entry(key, value)) => (key, value),
            _ => unreachable!("caller checked the top item"),
        }
    }

    /// Pushes a node's children and entries in reverse, leaving its leftmost
    /// descendant on top.
    fn push_node(&mut self, node: &Node<K, V>) {
        let n = node.keys.len();
        if !node.links[n].is_empty() {
            self.stack.push(Item::Subtree(node.links[n].clone()));
        }
        for i in (0..n).rev() {
            self.stack
                .push(Item::Entry(node.keys[i].clone(), node.values[i].clone()));
            if !node.links[i].is_empty() {
                self.stack.push(Item::Subtree(node.links[i].clone()));
            }
        }
    }
}

/// What the merged walk should do next; computed from the cursor tops
/// before anything is popped.
enum Step {
    Done,
    SkipShared,
    ExpandNew,
    ExpandOld,
    EmitNew,
    EmitOld,
    CompareEntries(Ordering),
}

impl<K, V> Mast<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned,
    V: Clone + PartialEq + Serialize + DeserializeOwned,
{
    /// Invokes `f` for every entry that differs between this tree and
    /// `old`, in ascending key order, as `f(added, removed, key,
    /// added_value, removed_value)`.
    ///
    /// An entry only in `self` reports as added, one only in `old` as
    /// removed, and a key with differing values reports once with both
    /// flags and both values set. Returning `false` ends the traversal
    /// early.
    ///
    /// Subtrees sharing a node identity are skipped without being loaded,
    /// which is what makes diffing two versions of a tree cheap.
    pub fn diff_iter<F>(&self, old: &Mast<K, V>, mut f: F) -> Result<()>
    where
        F: FnMut(bool, bool, &K, Option<&V>, Option<&V>) -> Result<bool>,
    {
        self.diff_walk(old, Some(&mut f), None)
    }

    /// Invokes `f(removed, link)` for every subtree link present on one
    /// side only, as the walk reaches it. Returning `false` ends the
    /// traversal early.
    pub fn diff_links<F>(&self, old: &Mast<K, V>, mut f: F) -> Result<()>
    where
        F: FnMut(bool, &Link<K, V>) -> Result<bool>,
    {
        self.diff_walk(old, None, Some(&mut f))
    }

    fn diff_walk(
        &self,
        old: &Mast<K, V>,
        mut entry_cb: Option<&mut dyn FnMut(bool, bool, &K, Option<&V>, Option<&V>) -> Result<bool>>,
        mut link_cb: Option<&mut dyn FnMut(bool, &Link<K, V>) -> Result<bool>>,
    ) -> Result<()> {
        let mut new_side = Cursor::new(self.root.clone());
        let mut old_side = Cursor::new(old.root.clone());
        loop {
            let step = match (new_side.top(), old_side.top()) {
                (None, None) => Step::Done,
                (Some(Item::Subtree(a)), Some(Item::Subtree(b))) if a.same_node(b) => {
                    Step::SkipShared
                }
                (Some(Item::Subtree(_)), _) => Step::ExpandNew,
                (_, Some(Item::Subtree(_))) => Step::ExpandOld,
                (Some(Item::Entry(a, _)), Some(Item::Entry(b, _))) => {
                    Step::CompareEntries(a.cmp(b))
                }
                (Some(Item::Entry(..)), None) => Step::EmitNew,
                (None, Some(Item::Entry(..))) => Step::EmitOld,
            };
            match step {
                Step::Done => return Ok(()),
                Step::SkipShared => {
                    new_side.pop_subtree();
                    old_side.pop_subtree();
                }
                Step::ExpandNew => {
                    let link = new_side.pop_subtree();
                    if let Some(f) = link_cb.as_deref_mut() {
                        if !f(false, &link)? {
                            return Ok(());
                        }
                    }
                    let node = self.load_link(&link)?;
                    new_side.push_node(&node);
                }
                Step::ExpandOld => {
                    let link = old_side.pop_subtree();
                    if let Some(f) = link_cb.as_deref_mut() {
                        if !f(true, &link)? {
                            return Ok(());
                        }
                    }
                    let node = old.load_link(&link)?;
                    old_side.push_node(&node);
                }
                Step::EmitNew | Step::CompareEntries(Ordering::Less) => {
                    let (key, value) = new_side.pop_entry();
                    if let Some(f) = entry_cb.as_deref_mut() {
                        if !f(true, false, &key, Some(&value), None)? {
                            return Ok(());
                        }
                    }
                }
                Step::EmitOld | Step::CompareEntries(Ordering::Greater) => {
                    let (key, value) = old_side.pop_entry();
                    if let Some(f) = entry_cb.as_deref_mut() {
                        if !f(false, true, &key, None, Some(&value))? {
                            return Ok(());
                        }
                    }
                }
                Step::CompareEntries(Ordering::Equal) => {
                    let (key, added) = new_side.pop_entry();
                    let (_, removed) = old_side.pop_entry();
                    if added != removed {
                        if let Some(f) = entry_cb.as_deref_mut() {
                            if !f(true, true, &key, Some(&added), Some(&removed))? {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::testing::distinct_entries;

    #[derive(Debug, Clone, PartialEq)]
    enum Change {
        Added(u64, u64),
        Removed(u64, u64),
        Changed(u64, u64, u64),
    }

    fn changes(new: &Mast<u64, u64>, old: &Mast<u64, u64>) -> Vec<Change> {
        let mut out = Vec::new();
        new.diff_iter(old, |added, removed, k, av, rv| {
            out.push(match (added, removed) {
                (true, false) => Change::Added(*k, *av.unwrap()),
                (false, true) => Change::Removed(*k, *rv.unwrap()),
                (true, true) => Change::Changed(*k, *av.unwrap(), *rv.unwrap()),
                (false, false) => panic!("callback fired without a change"),
            });
            Ok(true)
        })
        .unwrap();
        out
    }

    fn tree(entries: impl IntoIterator<Item = (u64, u64)>) -> Mast<u64, u64> {
        let mut mast = Mast::new_in_memory();
        for (k, v) in entries {
            mast.insert(k, v).unwrap();
        }
        mast
    }

    #[test]
    fn identical_trees_report_nothing() {
        let a = tree((1..=100).map(|i| (i, i)));
        let b = a.clone();
        assert_eq!(changes(&a, &b), vec![]);

        // Also when built independently, without shared nodes.
        let c = tree((1..=100).map(|i| (i, i)));
        assert_eq!(changes(&a, &c), vec![]);
    }

    #[test]
    fn one_insert_and_one_delete() {
        let a = tree((1..=100).map(|i| (i, i)));
        let mut b = a.clone();
        b.insert(101, 101).unwrap();
        b.delete(&50, &50).unwrap();

        assert_eq!(
            changes(&b, &a),
            vec![Change::Removed(50, 50), Change::Added(101, 101)]
        );
    }

    #[test]
    fn changed_value_reports_once_with_both_sides() {
        let a = tree([(1, 10), (2, 20)]);
        let mut b = a.clone();
        b.insert(2, 21).unwrap();
        assert_eq!(changes(&b, &a), vec![Change::Changed(2, 21, 20)]);
    }

    #[test]
    fn diff_against_the_empty_tree_reports_everything() {
        let a = tree((1..=500).map(|i| (i, i)));
        let empty = tree([]);
        let out = changes(&a, &empty);
        assert_eq!(out.len(), 500);
        assert!(out
            .iter()
            .enumerate()
            .all(|(i, c)| *c == Change::Added(i as u64 + 1, i as u64 + 1)));

        let out = changes(&empty, &a);
        assert_eq!(out.len(), 500);
        assert!(matches!(out[0], Change::Removed(1, 1)));
    }

    #[test]
    fn callback_can_stop_the_walk() {
        let a = tree((1..=100).map(|i| (i, i)));
        let empty = tree([]);
        let mut seen = 0;
        a.diff_iter(&empty, |_, _, _, _, _| {
            seen += 1;
            Ok(seen < 3)
        })
        .unwrap();
        assert_eq!(seen, 3);
    }

    #[test]
    fn diff_links_reports_changed_subtrees() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let mut a: Mast<u64, u64> = Root::new(CreateOptions::default())
            .load(RemoteConfig::new(store.clone()))
            .unwrap();
        for i in 1..=100u64 {
            a.insert(i, i).unwrap();
        }
        a.make_root().unwrap();

        let mut b = a.clone();
        b.insert(101, 101).unwrap();
        b.make_root().unwrap();

        let mut added = 0;
        let mut removed = 0;
        b.diff_links(&a, |was_removed, _| {
            if was_removed {
                removed += 1;
            } else {
                added += 1;
            }
            Ok(true)
        })
        .unwrap();
        // The changed spine differs on both sides; shared siblings do not
        // get reported.
        assert!(added >= 1);
        assert!(removed >= 1);
        let total_stored = store.len();
        assert!(added < total_stored, "diff visited every node: {added} of {total_stored}");
    }

    #[test]
    fn persisted_versions_diff_like_in_memory_ones() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let mut a: Mast<u64, u64> = Root::new(CreateOptions::default())
            .load(RemoteConfig::new(store.clone()))
            .unwrap();
        for i in 1..=100u64 {
            a.insert(i, i).unwrap();
        }
        let root_a = a.make_root().unwrap();

        let mut b: Mast<u64, u64> = root_a.load(RemoteConfig::new(store.clone())).unwrap();
        b.insert(101, 101).unwrap();
        b.delete(&50, &50).unwrap();

        assert_eq!(
            changes(&b, &a),
            vec![Change::Removed(50, 50), Change::Added(101, 101)]
        );
    }

    #[test_strategy::proptest]
    fn reports_exactly_the_symmetric_difference(
        #[strategy(distinct_entries(0..40))] left: Vec<(u64, u64)>,
        #[strategy(distinct_entries(0..40))] right: Vec<(u64, u64)>,
    ) {
        let a = tree(left.iter().copied());
        let b = tree(right.iter().copied());
        let left: BTreeMap<u64, u64> = left.into_iter().collect();
        let right: BTreeMap<u64, u64> = right.into_iter().collect();

        let mut expected = Vec::new();
        for (k, v) in &left {
            match right.get(k) {
                None => expected.push(Change::Added(*k, *v)),
                Some(w) if w != v => expected.push(Change::Changed(*k, *v, *w)),
                Some(_) => {}
            }
        }
        for (k, w) in &right {
            if !left.contains_key(k) {
                expected.push(Change::Removed(*k, *w));
            }
        }
        expected.sort_by_key(|c| match c {
            Change::Added(k, _) | Change::Removed(k, _) | Change::Changed(k, _, _) => *k,
        });

        prop_assert_eq!(changes(&a, &b), expected);
    }
}
