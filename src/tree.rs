use std::mem::take;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

use crate::prelude::*;

/// An ordered key/value map whose shape is a deterministic function of its
/// contents: two trees holding the same entries share the same node
/// structure, and therefore the same content hashes, no matter the insertion
/// order.
///
/// Each key lives at a fixed layer derived from a hash of its encoding, so
/// inserts and deletes reshape only the path to that layer. Mutations copy
/// the affected path; everything else is shared, which is what makes
/// set-difference between two versions cheap (see [`Mast::diff_iter`]) and
/// lets nodes live in a content-addressed store, loaded on demand.
pub struct Mast<K, V> {
    pub(crate) root: Link<K, V>,
    pub(crate) size: u64,
    pub(crate) height: u8,
    pub(crate) branch_factor: u32,
    pub(crate) grow_after_size: u64,
    pub(crate) shrink_below_size: u64,
    pub(crate) layer: Option<Arc<LayerFn<K>>>,
    pub(crate) persist: Option<Arc<dyn Persist>>,
    pub(crate) codec: Arc<dyn Codec<K, V>>,
    pub(crate) cache: Option<Arc<NodeCache<K, V>>>,
}

impl<K, V> Clone for Mast<K, V>
where
    K: Clone,
    V: Clone,
{
    fn clone(&self) -> Self {
        Mast {
            root: self.root.clone(),
            size: self.size,
            height: self.height,
            branch_factor: self.branch_factor,
            grow_after_size: self.grow_after_size,
            shrink_below_size: self.shrink_below_size,
            layer: self.layer.clone(),
            persist: self.persist.clone(),
            codec: self.codec.clone(),
            cache: self.cache.clone(),
        }
    }
}

/// One step of a root-to-target descent: the node visited and the entry
/// index the search landed on.
struct PathEntry<K, V> {
    node: Arc<Node<K, V>>,
    index: usize,
}

impl<K, V> Mast<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned,
    V: Clone + PartialEq + Serialize + DeserializeOwned,
{
    /// A new tree for use as an in-memory data structure, not intended to be
    /// remotely persisted.
    pub fn new_in_memory() -> Self {
        Mast {
            root: Link::Empty,
            size: 0,
            height: 0,
            branch_factor: DEFAULT_BRANCH_FACTOR,
            grow_after_size: u64::from(DEFAULT_BRANCH_FACTOR),
            shrink_below_size: 1,
            layer: None,
            persist: None,
            codec: Arc::new(JsonCodec),
            cache: None,
        }
    }

    /// The number of entries in the tree.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn height(&self) -> u8 {
        self.height
    }

    pub fn branch_factor(&self) -> u32 {
        self.branch_factor
    }

    /// The layer the given key lives at, via the configured or default layer
    /// function.
    pub(crate) fn key_layer(&self, key: &K) -> Result<u8> {
        match &self.layer {
            Some(f) => f(key, self.branch_factor),
            None => {
                let encoded = self.codec.encode_key(key)?;
                Ok(default_layer(&encoded, self.branch_factor))
            }
        }
    }

    /// Adds or replaces the value for the given key. Re-inserting the stored
    /// value is a no-op.
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        let path = self
            .find_path(&key, true)?
            .ok_or_else(|| Error::Invariant("find with create lost its path".to_string()))?;
        let tail = path.last().expect("path is never empty");
        let node = &tail.node;
        let i = tail.index;

        if i < node.keys.len() && node.keys[i] == key {
            if node.values[i] == value {
                return Ok(());
            }
            let mut replaced = (**node).clone();
            replaced.values[i] = value;
            self.save_path(&path, replaced);
            return Ok(());
        }

        // The child that occupied this slot straddles the new key.
        let (left, right) = self.split_link(&node.links[i], &key)?;
        let mut spliced = (**node).clone();
        spliced.keys.insert(i, key);
        spliced.values.insert(i, value);
        spliced.links[i] = left;
        spliced.links.insert(i + 1, right);
        debug_assert!(spliced.check().is_ok());
        self.save_path(&path, spliced);

        while self.size >= self.grow_after_size && self.can_grow()? {
            self.grow()?;
        }
        self.size += 1;
        trace!(size = self.size, height = self.height, "inserted entry");
        Ok(())
    }

    /// Removes the entry with the given key and value.
    ///
    /// Fails with [`Error::NotFound`] when the key is absent and
    /// [`Error::ValueMismatch`] when it is present with a different value;
    /// the tree is unchanged on failure.
    pub fn delete(&mut self, key: &K, value: &V) -> Result<()> {
        if self.root.is_empty() {
            return Err(Error::NotFound);
        }
        let path = self.find_path(key, false)?.ok_or(Error::NotFound)?;
        let tail = path.last().expect("path is never empty");
        let node = &tail.node;
        let i = tail.index;
        if i == node.keys.len() || node.keys[i] != *key {
            return Err(Error::NotFound);
        }
        if node.values[i] != *value {
            return Err(Error::ValueMismatch(
                "stored value differs from the one given".to_string(),
            ));
        }

        // Both flanks of the removed entry lie between the same outer
        // neighbors, so they fold into one subtree.
        let merged = self.merge_links(&node.links[i], &node.links[i + 1])?;
        let mut spliced = (**node).clone();
        spliced.keys.remove(i);
        spliced.values.remove(i);
        spliced.links.remove(i);
        spliced.links[i] = merged;
        debug_assert!(spliced.check().is_ok());
        self.save_path(&path, spliced);

        self.size -= 1;
        while self.size < self.shrink_below_size && self.height > 0 {
            self.shrink()?;
        }
        trace!(size = self.size, height = self.height, "deleted entry");
        Ok(())
    }

    /// Looks up the value stored for `key`. Absence is not an error.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let path = match self.find_path(key, false)? {
            Some(path) => path,
            None => return Ok(None),
        };
        let tail = path.last().expect("path is never empty");
        if tail.index < tail.node.keys.len() && tail.node.keys[tail.index] == *key {
            Ok(Some(tail.node.values[tail.index].clone()))
        } else {
            Ok(None)
        }
    }

    /// Invokes `f` for every entry in ascending key order, loading stored
    /// subtrees on demand.
    pub fn iter<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&K, &V) -> Result<()>,
    {
        self.walk_link(&self.root, &mut f)
    }

    /// The tree's entries as a sorted vector.
    pub fn to_vec(&self) -> Result<Vec<(K, V)>> {
        let mut entries = Vec::with_capacity(self.size as usize);
        self.iter(|k, v| {
            entries.push((k.clone(), v.clone()));
            Ok(())
        })?;
        Ok(entries)
    }

    /// The tree's keys as a sorted vector.
    pub fn keys(&self) -> Result<Vec<K>> {
        let mut keys = Vec::with_capacity(self.size as usize);
        self.iter(|k, _| {
            keys.push(k.clone());
            Ok(())
        })?;
        Ok(keys)
    }

    pub(crate) fn walk_link(
        &self,
        link: &Link<K, V>,
        f: &mut dyn FnMut(&K, &V) -> Result<()>,
    ) -> Result<()> {
        let node = match link {
            Link::Empty => return Ok(()),
            link => self.load_link(link)?,
        };
        for i in 0..node.keys.len() {
            self.walk_link(&node.links[i], f)?;
            f(&node.keys[i], &node.values[i])?;
        }
        self.walk_link(node.links.last().expect("node always has links"), f)
    }

    /// Descends from the root to the node where `key` belongs, recording the
    /// `(node, index)` path. With `create`, empty links on the way are
    /// materialized as empty nodes; without it, hitting one means the key is
    /// absent and `None` is returned.
    fn find_path(&self, key: &K, create: bool) -> Result<Option<Vec<PathEntry<K, V>>>> {
        let target = self.key_layer(key)?.min(self.height);
        let mut level = self.height;
        let mut node = match &self.root {
            Link::Empty => {
                if !create {
                    return Ok(None);
                }
                Arc::new(Node::empty())
            }
            link => self.load_link(link)?,
        };
        let mut path = Vec::with_capacity(usize::from(self.height) + 1);
        loop {
            let index = node.search(key);
            path.push(PathEntry {
                node: node.clone(),
                index,
            });
            if level == target {
                return Ok(Some(path));
            }
            let child = node.links[index].clone();
            node = match &child {
                Link::Empty => {
                    if !create {
                        return Ok(None);
                    }
                    Arc::new(Node::empty())
                }
                link => self.load_link(link)?,
            };
            level -= 1;
        }
    }

    /// Replaces the path's final node and propagates fresh parent copies up
    /// to a new root. Nodes left fully empty collapse out of their parents.
    fn save_path(&mut self, path: &[PathEntry<K, V>], new_tail: Node<K, V>) {
        let mut link = new_tail.into_link();
        for entry in path[..path.len() - 1].iter().rev() {
            let mut parent = (*entry.node).clone();
            parent.links[entry.index] = link;
            link = parent.into_link();
        }
        self.root = link;
    }

    /// Whether the root holds an entry whose layer exceeds the current
    /// height, the signal that the root should be lifted.
    fn can_grow(&self) -> Result<bool> {
        let root = match &self.root {
            Link::Empty => return Ok(false),
            link => self.load_link(link)?,
        };
        for key in &root.keys {
            if self.key_layer(key)? > self.height {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Lifts the root one level: entries whose layer exceeds the old height
    /// move into the new root, and the runs between them stay below as its
    /// children.
    fn grow(&mut self) -> Result<()> {
        let new_height = self
            .height
            .checked_add(1)
            .ok_or_else(|| Error::Invariant("tree height overflow".to_string()))?;
        if let Link::Empty = &self.root {
            // Nothing to partition; the empty subtree just gets taller.
        } else {
            let old = self.load_link(&self.root)?;
            let mut new_keys = Vec::new();
            let mut new_values = Vec::new();
            let mut new_links = Vec::new();
            let mut run_keys: Vec<K> = Vec::new();
            let mut run_values: Vec<V> = Vec::new();
            let mut run_links: Vec<Link<K, V>> = Vec::new();
            for j in 0..old.keys.len() {
                run_links.push(old.links[j].clone());
                if self.key_layer(&old.keys[j])? > self.height {
                    let child = Node::new(take(&mut run_keys), take(&mut run_values), take(&mut run_links));
                    new_keys.push(old.keys[j].clone());
                    new_values.push(old.values[j].clone());
                    new_links.push(child.into_link());
                } else {
                    run_keys.push(old.keys[j].clone());
                    run_values.push(old.values[j].clone());
                }
            }
            run_links.push(old.links.last().expect("node always has links").clone());
            new_links.push(Node::new(run_keys, run_values, run_links).into_link());
            let new_root = Node::new(new_keys, new_values, new_links);
            debug_assert!(new_root.check().is_ok());
            self.root = new_root.into_link();
        }
        self.height = new_height;
        self.recompute_thresholds();
        debug!(height = self.height, size = self.size, "grew tree");
        Ok(())
    }

    /// The inverse of [`Mast::grow`]: folds the root's entries and children
    /// into a single node one level lower.
    fn shrink(&mut self) -> Result<()> {
        if self.height == 0 {
            return Err(Error::Invariant(
                "cannot shrink a tree of height zero".to_string(),
            ));
        }
        if !self.root.is_empty() {
            let old = self.load_link(&self.root)?;
            let mut keys = Vec::new();
            let mut values = Vec::new();
            let mut links = Vec::new();
            for j in 0..old.links.len() {
                match &old.links[j] {
                    Link::Empty => links.push(Link::Empty),
                    link => {
                        let child = self.load_link(link)?;
                        keys.extend_from_slice(&child.keys);
                        values.extend_from_slice(&child.values);
                        links.extend(child.links.iter().cloned());
                    }
                }
                if j < old.keys.len() {
                    keys.push(old.keys[j].clone());
                    values.push(old.values[j].clone());
                }
            }
            let folded = Node::new(keys, values, links);
            debug_assert!(folded.check().is_ok());
            self.root = folded.into_link();
        }
        self.height -= 1;
        self.recompute_thresholds();
        debug!(height = self.height, size = self.size, "shrank tree");
        Ok(())
    }

    fn recompute_thresholds(&mut self) {
        self.shrink_below_size = u64::from(self.branch_factor).saturating_pow(u32::from(self.height));
        self.grow_after_size = self
            .shrink_below_size
            .saturating_mul(u64::from(self.branch_factor));
    }

    /// Full structural validation of every invariant, for tests: parallel
    /// array shapes, key ordering and bounds, layer placement, leaf links,
    /// entry count, and the empty-root rule.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> Result<()> {
        if (self.size == 0) != self.root.is_empty() {
            return Err(Error::Invariant(format!(
                "size {} does not match root emptiness",
                self.size
            )));
        }
        let mut counted = 0u64;
        self.check_subtree(&self.root, self.height, None, None, &mut counted)?;
        if counted != self.size {
            return Err(Error::Invariant(format!(
                "counted {} entries, size says {}",
                counted, self.size
            )));
        }
        Ok(())
    }

    #[cfg(test)]
    fn check_subtree(
        &self,
        link: &Link<K, V>,
        level: u8,
        lower: Option<&K>,
        upper: Option<&K>,
        counted: &mut u64,
    ) -> Result<()> {
        let node = match link {
            Link::Empty => return Ok(()),
            link => self.load_link(link)?,
        };
        node.check()?;
        for key in &node.keys {
            if lower.is_some_and(|b| key <= b) || upper.is_some_and(|b| key >= b) {
                return Err(Error::Invariant("key outside subtree bounds".to_string()));
            }
            if self.key_layer(key)?.min(self.height) != level {
                return Err(Error::Invariant("entry stored at the wrong height".to_string()));
            }
        }
        if level == 0 && !node.links.iter().all(Link::is_empty) {
            return Err(Error::Invariant("leaf node has child links".to_string()));
        }
        *counted += node.keys.len() as u64;
        for i in 0..node.links.len() {
            let child_lower = if i == 0 { lower } else { Some(&node.keys[i - 1]) };
            let child_upper = if i == node.keys.len() { upper } else { Some(&node.keys[i]) };
            if level > 0 {
                self.check_subtree(&node.links[i], level - 1, child_lower, child_upper, counted)?;
            }
        }
        Ok(())
    }
}
