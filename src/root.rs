use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::prelude::*;

/// Initial parameters for a tree, painful to change once it holds data.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateOptions {
    /// Number of entries per node. 0 means use the default.
    pub branch_factor: u32,
}

/// How nodes are persisted and loaded.
pub struct RemoteConfig<K, V> {
    pub(crate) store: Arc<dyn Persist>,
    pub(crate) codec: Arc<dyn Codec<K, V>>,
    pub(crate) cache: Option<Arc<NodeCache<K, V>>>,
    pub(crate) layer: Option<Arc<LayerFn<K>>>,
}

impl<K, V> RemoteConfig<K, V>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    pub fn new(store: Arc<dyn Persist>) -> Self {
        RemoteConfig {
            store,
            codec: Arc::new(JsonCodec),
            cache: None,
            layer: None,
        }
    }

    /// Replaces the default two-stage JSON codec.
    pub fn with_codec(mut self, codec: Arc<dyn Codec<K, V>>) -> Self {
        self.codec = codec;
        self
    }

    /// Shares a deserialization cache, possibly across multiple trees.
    pub fn with_node_cache(mut self, cache: Arc<NodeCache<K, V>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Overrides the default layer function. The replacement must be pure
    /// and stable across runs, or trees stop converging.
    pub fn with_layer(mut self, layer: Arc<LayerFn<K>>) -> Self {
        self.layer = Some(layer);
        self
    }
}

/// Identifies a version of a tree whose nodes live in a persistent store.
/// A `None` link denotes the empty tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Root {
    pub link: Option<String>,
    pub size: u64,
    pub height: u8,
    pub branch_factor: u32,
}

impl Root {
    /// An empty tree whose nodes will be persisted according to `options`.
    pub fn new(options: CreateOptions) -> Self {
        let branch_factor = if options.branch_factor == 0 {
            DEFAULT_BRANCH_FACTOR
        } else {
            options.branch_factor
        };
        Root {
            link: None,
            size: 0,
            height: 0,
            branch_factor,
        }
    }

    /// Loads this tree version from the remote store. The root node is
    /// loaded and verified up front; everything else loads on demand.
    pub fn load<K, V>(&self, config: RemoteConfig<K, V>) -> Result<Mast<K, V>>
    where
        K: Ord + Clone + Serialize + DeserializeOwned,
        V: Clone + PartialEq + Serialize + DeserializeOwned,
    {
        let shrink_below_size =
            u64::from(self.branch_factor).saturating_pow(u32::from(self.height));
        let mast = Mast {
            root: match &self.link {
                Some(id) => Link::Stored(id.clone()),
                None => Link::Empty,
            },
            size: self.size,
            height: self.height,
            branch_factor: self.branch_factor,
            grow_after_size: shrink_below_size.saturating_mul(u64::from(self.branch_factor)),
            shrink_below_size,
            layer: config.layer,
            persist: Some(config.store),
            codec: config.codec,
            cache: config.cache,
        };
        mast.check_root()?;
        Ok(mast)
    }
}

impl<K, V> Mast<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned,
    V: Clone + PartialEq + Serialize + DeserializeOwned,
{
    /// Writes all changed nodes to the persistent store and publishes the
    /// result as a new root handle.
    pub fn make_root(&mut self) -> Result<Root> {
        let link = self.flush()?;
        Ok(Root {
            link,
            size: self.size,
            height: self.height,
            branch_factor: self.branch_factor,
        })
    }

    fn check_root(&self) -> Result<()> {
        if let Link::Stored(_) = &self.root {
            self.load_link(&self.root)?;
        }
        Ok(())
    }
}
