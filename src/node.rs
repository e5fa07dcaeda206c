use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::prelude::*;

/// A child pointer in a node: an empty subtree, the content hash of a
/// persisted node, or an in-memory node that has not been persisted yet.
///
/// Loading never rewrites a `Stored` link in place; promotion to an in-memory
/// node happens on the side, through the node cache.
#[derive(Debug, Clone)]
pub enum Link<K, V> {
    /// The empty subtree.
    Empty,
    /// A persisted node, addressable by content hash.
    Stored(String),
    /// A dirty in-memory node, owned by one tree until flushed.
    Inline(Arc<Node<K, V>>),
}

impl<K, V> Link<K, V> {
    pub fn is_empty(&self) -> bool {
        matches!(self, Link::Empty)
    }

    /// Whether both links denote the same node without loading either:
    /// equal content hashes, or the same in-memory allocation.
    pub(crate) fn same_node(&self, other: &Link<K, V>) -> bool {
        match (self, other) {
            (Link::Empty, Link::Empty) => true,
            (Link::Stored(a), Link::Stored(b)) => a == b,
            (Link::Inline(a), Link::Inline(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[cfg(test)]
impl<K: PartialEq, V: PartialEq> Link<K, V> {
    /// Structural equality over in-memory subtrees, for shape tests.
    pub(crate) fn deep_eq(&self, other: &Link<K, V>) -> bool {
        match (self, other) {
            (Link::Empty, Link::Empty) => true,
            (Link::Stored(a), Link::Stored(b)) => a == b,
            (Link::Inline(a), Link::Inline(b)) => {
                a.keys == b.keys
                    && a.values == b.values
                    && a.links.len() == b.links.len()
                    && a.links.iter().zip(&b.links).all(|(x, y)| x.deep_eq(y))
            }
            _ => false,
        }
    }
}

/// An in-memory tree node: `N` sorted entries and `N + 1` child links, one
/// between each pair of adjacent entries plus the two outer flanks.
///
/// Nodes are immutable once shared; mutations copy the node first. The copy
/// shares child subtrees, since links are hashes or reference-counted nodes.
#[derive(Debug, Clone)]
pub struct Node<K, V> {
    pub(crate) keys: Vec<K>,
    pub(crate) values: Vec<V>,
    pub(crate) links: Vec<Link<K, V>>,
}

impl<K, V> Node<K, V> {
    pub(crate) fn new(keys: Vec<K>, values: Vec<V>, links: Vec<Link<K, V>>) -> Self {
        Node { keys, values, links }
    }

    pub(crate) fn empty() -> Self {
        Node {
            keys: Vec::new(),
            values: Vec::new(),
            links: vec![Link::Empty],
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// An empty node carries no entries and no child subtrees. Nodes with no
    /// entries but a live child act as bridges between layers and are not
    /// empty.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.links.iter().all(Link::is_empty)
    }

    /// Wraps the node as a dirty link, collapsing a fully empty node into
    /// `Link::Empty`.
    pub(crate) fn into_link(self) -> Link<K, V> {
        if self.is_empty() {
            Link::Empty
        } else {
            Link::Inline(Arc::new(self))
        }
    }
}

impl<K: Ord, V> Node<K, V> {
    /// Index of the first key >= `key`; also the index of `key` itself when
    /// present.
    pub(crate) fn search(&self, key: &K) -> usize {
        self.keys.binary_search(key).unwrap_or_else(|i| i)
    }

    /// Structural sanity: parallel arrays line up and keys ascend strictly.
    pub(crate) fn check(&self) -> Result<()> {
        if self.keys.len() != self.values.len() {
            return Err(Error::Invariant(format!(
                "mismatched keys and values: {} != {}",
                self.keys.len(),
                self.values.len()
            )));
        }
        if self.links.len() != self.keys.len() + 1 {
            return Err(Error::Invariant(format!(
                "expected {} links, have {}",
                self.keys.len() + 1,
                self.links.len()
            )));
        }
        if self.keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::Invariant("keys out of order".to_string()));
        }
        Ok(())
    }
}

impl<K, V> Mast<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned,
    V: Clone + PartialEq + Serialize + DeserializeOwned,
{
    /// Partitions the subtree at `link` around `key`, which must not occur in
    /// it: entries below `key` go left, entries above go right, and the one
    /// child straddling the pivot is split recursively.
    ///
    /// Either side collapses to `Link::Empty` when nothing lands on it.
    pub(crate) fn split_link(&self, link: &Link<K, V>, key: &K) -> Result<(Link<K, V>, Link<K, V>)> {
        let node = match link {
            Link::Empty => return Ok((Link::Empty, Link::Empty)),
            other => self.load_link(other)?,
        };
        let i = node.search(key);
        debug_assert!(i == node.keys.len() || node.keys[i] != *key);

        let mut left = Node::new(
            node.keys[..i].to_vec(),
            node.values[..i].to_vec(),
            node.links[..=i].to_vec(),
        );
        let mut right = Node::new(
            node.keys[i..].to_vec(),
            node.values[i..].to_vec(),
            node.links[i..].to_vec(),
        );
        let (straddle_left, straddle_right) = self.split_link(&node.links[i], key)?;
        *left.links.last_mut().expect("node always has links") = straddle_left;
        right.links[0] = straddle_right;
        Ok((left.into_link(), right.into_link()))
    }

    /// The inverse of [`Mast::split_link`]: concatenates two adjacent
    /// subtrees whose key ranges meet between the same outer neighbors,
    /// merging the one pair of inner children recursively.
    pub(crate) fn merge_links(&self, left: &Link<K, V>, right: &Link<K, V>) -> Result<Link<K, V>> {
        if left.is_empty() {
            return Ok(right.clone());
        }
        if right.is_empty() {
            return Ok(left.clone());
        }
        let left = self.load_link(left)?;
        let right = self.load_link(right)?;

        let mut keys = left.keys.clone();
        keys.extend_from_slice(&right.keys);
        let mut values = left.values.clone();
        values.extend_from_slice(&right.values);

        let middle = self.merge_links(
            left.links.last().expect("node always has links"),
            &right.links[0],
        )?;
        let mut links = left.links[..left.links.len() - 1].to_vec();
        links.push(middle);
        links.extend_from_slice(&right.links[1..]);

        Ok(Node::new(keys, values, links).into_link())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(entries: &[(u64, u64)]) -> Link<u64, u64> {
        let keys: Vec<u64> = entries.iter().map(|(k, _)| *k).collect();
        let values: Vec<u64> = entries.iter().map(|(_, v)| *v).collect();
        let links = vec![Link::Empty; keys.len() + 1];
        Node::new(keys, values, links).into_link()
    }

    fn contents(mast: &Mast<u64, u64>, link: &Link<u64, u64>) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        mast.walk_link(link, &mut |k: &u64, v: &u64| {
            out.push((*k, *v));
            Ok(())
        })
        .unwrap();
        out
    }

    #[test]
    fn empty_node_collapses_into_empty_link() {
        assert!(Node::<u64, u64>::empty().into_link().is_empty());
    }

    #[test]
    fn bridge_node_is_not_empty() {
        let child = leaf(&[(1, 1)]);
        let bridge = Node::new(vec![], vec![], vec![child]);
        assert!(!bridge.is_empty());
        assert!(!bridge.into_link().is_empty());
    }

    #[test]
    fn split_partitions_a_leaf() {
        let mast: Mast<u64, u64> = Mast::new_in_memory();
        let link = leaf(&[(1, 10), (3, 30), (5, 50)]);
        let (l, r) = mast.split_link(&link, &4).unwrap();
        assert_eq!(contents(&mast, &l), vec![(1, 10), (3, 30)]);
        assert_eq!(contents(&mast, &r), vec![(5, 50)]);
    }

    #[test]
    fn split_below_smallest_leaves_left_empty() {
        let mast: Mast<u64, u64> = Mast::new_in_memory();
        let link = leaf(&[(2, 20), (4, 40)]);
        let (l, r) = mast.split_link(&link, &1).unwrap();
        assert!(l.is_empty());
        assert_eq!(contents(&mast, &r), vec![(2, 20), (4, 40)]);
    }

    #[test]
    fn merge_is_inverse_of_split() {
        let mast: Mast<u64, u64> = Mast::new_in_memory();
        let link = leaf(&[(1, 10), (3, 30), (5, 50), (7, 70)]);
        let (l, r) = mast.split_link(&link, &4).unwrap();
        let merged = mast.merge_links(&l, &r).unwrap();
        assert_eq!(contents(&mast, &merged), vec![(1, 10), (3, 30), (5, 50), (7, 70)]);
    }

    #[test]
    fn check_rejects_malformed_nodes() {
        let node = Node::new(vec![1u64, 2], vec![1u64], vec![Link::Empty; 3]);
        assert!(matches!(node.check(), Err(Error::Invariant(_))));

        let node = Node::new(vec![2u64, 1], vec![2u64, 1], vec![Link::Empty; 3]);
        assert!(matches!(node.check(), Err(Error::Invariant(_))));

        let node = Node::new(vec![1u64], vec![1u64], vec![Link::Empty; 3]);
        assert!(matches!(node.check(), Err(Error::Invariant(_))));
    }
}
