use std::collections::HashMap;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};

use digest::Digest;
use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, trace};

use crate::prelude::*;

/// Loading and storing of serialized tree nodes.
///
/// An identifier names content that is never modified: the store chooses the
/// identifier, it must be a pure function of the bytes, and storing the same
/// bytes twice is benign.
pub trait Persist: Send + Sync {
    /// The identifier the store files the given bytes under.
    fn content_id(&self, bytes: &[u8]) -> String;

    /// Makes the bytes retrievable by `id`.
    fn store(&self, id: &str, bytes: &[u8]) -> Result<()>;

    /// Retrieves previously stored bytes.
    fn load(&self, id: &str) -> Result<Vec<u8>>;
}

/// A content-addressed blob store held in memory, addressing blobs by the
/// hex digest of their bytes. Useful for tests and as the reference
/// [`Persist`] implementation.
pub struct MemoryStore<D: Digest = Sha256> {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    _digest: PhantomData<D>,
}

impl<D: Digest> MemoryStore<D> {
    pub fn new() -> Self {
        MemoryStore {
            blobs: RwLock::new(HashMap::new()),
            _digest: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<D: Digest> Default for MemoryStore<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Digest + Send + Sync> Persist for MemoryStore<D> {
    fn content_id(&self, bytes: &[u8]) -> String {
        hex::encode(D::digest(bytes))
    }

    fn store(&self, id: &str, bytes: &[u8]) -> Result<()> {
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| Error::Persistence("memory store lock poisoned".to_string()))?;
        blobs.insert(id.to_string(), bytes.to_vec());
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Vec<u8>> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| Error::Persistence("memory store lock poisoned".to_string()))?;
        blobs
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Persistence(format!("no stored content for {}", id)))
    }
}

/// A node decoded from its serialized form, with child links still in wire
/// form: content-hash strings, empty meaning the empty subtree.
#[derive(Debug)]
pub struct DecodedNode<K, V> {
    pub keys: Vec<K>,
    pub values: Vec<V>,
    pub links: Vec<String>,
}

/// Serialization strategy for nodes.
///
/// The default [`JsonCodec`] decodes in two stages, key and value blobs
/// first and typed entries second; a codec whose format is self-describing
/// can decode in a single stage by implementing this trait directly.
pub trait Codec<K, V>: Send + Sync {
    /// Canonical encoding of a key on its own; feeds the default layer
    /// function, so it must be deterministic.
    fn encode_key(&self, key: &K) -> Result<Vec<u8>>;

    fn encode_node(&self, keys: &[K], values: &[V], links: &[String]) -> Result<Vec<u8>>;

    fn decode_node(&self, bytes: &[u8], id: &str) -> Result<DecodedNode<K, V>>;
}

/// The default codec: canonical JSON with two-stage decoding.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

#[derive(Serialize, Deserialize)]
struct WireNode {
    #[serde(rename = "Key")]
    keys: Vec<serde_json::Value>,
    #[serde(rename = "Value")]
    values: Vec<serde_json::Value>,
    #[serde(rename = "Link", default, skip_serializing_if = "Option::is_none")]
    links: Option<Vec<String>>,
}

impl<K, V> Codec<K, V> for JsonCodec
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    fn encode_key(&self, key: &K) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(key)?)
    }

    fn encode_node(&self, keys: &[K], values: &[V], links: &[String]) -> Result<Vec<u8>> {
        let wire = WireNode {
            keys: keys
                .iter()
                .map(serde_json::to_value)
                .collect::<std::result::Result<_, _>>()?,
            values: values
                .iter()
                .map(serde_json::to_value)
                .collect::<std::result::Result<_, _>>()?,
            links: if links.iter().all(String::is_empty) {
                None
            } else {
                Some(links.to_vec())
            },
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    fn decode_node(&self, bytes: &[u8], id: &str) -> Result<DecodedNode<K, V>> {
        let wire: WireNode = serde_json::from_slice(bytes)
            .map_err(|e| Error::Decoding(format!("cannot unmarshal {}: {}", id, e)))?;
        if wire.keys.len() != wire.values.len() {
            return Err(Error::Decoding(format!(
                "cannot unmarshal {}: mismatched keys and values",
                id
            )));
        }
        let links = match wire.links {
            None => vec![String::new(); wire.keys.len() + 1],
            Some(links) => {
                if links.len() != wire.keys.len() + 1 {
                    return Err(Error::Decoding(format!(
                        "cannot unmarshal {}: expected {} links, have {}",
                        id,
                        wire.keys.len() + 1,
                        links.len()
                    )));
                }
                links
            }
        };
        let mut keys = Vec::with_capacity(wire.keys.len());
        for (i, raw) in wire.keys.into_iter().enumerate() {
            keys.push(
                serde_json::from_value(raw)
                    .map_err(|e| Error::Decoding(format!("cannot unmarshal key[{}] in {}: {}", i, id, e)))?,
            );
        }
        let mut values = Vec::with_capacity(wire.values.len());
        for (i, raw) in wire.values.into_iter().enumerate() {
            values.push(
                serde_json::from_value(raw).map_err(|e| {
                    Error::Decoding(format!("cannot unmarshal value[{}] in {}: {}", i, id, e))
                })?,
            );
        }
        Ok(DecodedNode { keys, values, links })
    }
}

/// A bounded cache of deserialized nodes, keyed by content hash. May be
/// shared across trees; cached nodes are immutable, so a hit never needs
/// revalidation.
pub struct NodeCache<K, V> {
    nodes: Mutex<LruCache<String, Arc<Node<K, V>>>>,
}

impl<K, V> NodeCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one");
        NodeCache {
            nodes: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn get(&self, id: &str) -> Option<Arc<Node<K, V>>> {
        self.nodes.lock().ok()?.get(id).cloned()
    }

    fn put(&self, id: String, node: Arc<Node<K, V>>) {
        if let Ok(mut nodes) = self.nodes.lock() {
            nodes.put(id, node);
        }
    }
}

impl<K, V> Mast<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned,
    V: Clone + PartialEq + Serialize + DeserializeOwned,
{
    /// Resolves a link to its node, loading and caching stored nodes.
    pub(crate) fn load_link(&self, link: &Link<K, V>) -> Result<Arc<Node<K, V>>> {
        match link {
            Link::Empty => Ok(Arc::new(Node::empty())),
            Link::Inline(node) => Ok(node.clone()),
            Link::Stored(id) => self.load_stored(id),
        }
    }

    fn load_stored(&self, id: &str) -> Result<Arc<Node<K, V>>> {
        if let Some(cache) = &self.cache {
            if let Some(node) = cache.get(id) {
                trace!(%id, "node cache hit");
                return Ok(node);
            }
        }
        let persist = self.persist.as_ref().ok_or_else(|| {
            Error::Configuration("no persistence mechanism set for stored link".to_string())
        })?;
        let bytes = persist.load(id)?;
        let decoded = self.codec.decode_node(&bytes, id)?;
        let links = decoded
            .links
            .into_iter()
            .map(|l| if l.is_empty() { Link::Empty } else { Link::Stored(l) })
            .collect();
        let node = Node::new(decoded.keys, decoded.values, links);
        node.check()
            .map_err(|e| Error::Decoding(format!("malformed node {}: {}", id, e)))?;
        let node = Arc::new(node);
        if let Some(cache) = &self.cache {
            cache.put(id.to_string(), node.clone());
        }
        trace!(%id, "loaded node");
        Ok(node)
    }

    /// Serializes changed nodes into the persistent store bottom-up and
    /// returns the root's content hash, or `None` for the empty tree.
    pub(crate) fn flush(&mut self) -> Result<Option<String>> {
        if self.persist.is_none() {
            return Err(Error::Configuration(
                "no persistence mechanism set; configure a store for immutable parts".to_string(),
            ));
        }
        let id = match &self.root {
            Link::Empty => return Ok(None),
            Link::Stored(id) => return Ok(Some(id.clone())),
            Link::Inline(node) => {
                if node.is_empty() {
                    return Ok(None);
                }
                self.store_node(&node.clone())?
            }
        };
        self.root = Link::Stored(id.clone());
        debug!(root = %id, size = self.size, "flushed tree");
        Ok(Some(id))
    }

    /// Stores one dirty node, its dirty descendants first, and returns its
    /// content hash.
    fn store_node(&self, node: &Node<K, V>) -> Result<String> {
        let mut link_ids = Vec::with_capacity(node.links.len());
        let mut clean_links = Vec::with_capacity(node.links.len());
        for link in &node.links {
            match link {
                Link::Empty => {
                    link_ids.push(String::new());
                    clean_links.push(Link::Empty);
                }
                Link::Stored(id) => {
                    link_ids.push(id.clone());
                    clean_links.push(Link::Stored(id.clone()));
                }
                Link::Inline(child) => {
                    if child.is_empty() {
                        link_ids.push(String::new());
                        clean_links.push(Link::Empty);
                    } else {
                        let id = self.store_node(child)?;
                        link_ids.push(id.clone());
                        clean_links.push(Link::Stored(id));
                    }
                }
            }
        }
        let bytes = self.codec.encode_node(&node.keys, &node.values, &link_ids)?;
        let persist = self
            .persist
            .as_ref()
            .expect("flush checks for a persistence mechanism");
        let id = persist.content_id(&bytes);
        persist.store(&id, &bytes)?;
        if let Some(cache) = &self.cache {
            let clean = Node::new(node.keys.clone(), node.values.clone(), clean_links);
            cache.put(id.clone(), Arc::new(clean));
        }
        Ok(id)
    }
}
