//! An implementation of a Merkle Search Tree, as described in [Merkle Search
//! Trees: Efficient State-Based CRDTs in Open
//! Networks](https://inria.hal.science/hal-02303490/document): an ordered,
//! content-addressed key/value map whose shape is a deterministic function of
//! its contents.
//!
//! Two trees holding the same entries share the same node structure and
//! therefore the same content hashes, regardless of insertion order. That
//! makes set-difference between two tree versions cheap (shared subtrees are
//! recognized by identity and skipped) and lets nodes live in an immutable
//! content-addressed store, loaded on demand and written back lazily.
//!
//! The entry points are [`Mast`] for the tree itself, [`Root`] for a
//! persisted, publishable tree version, and [`Persist`] for the
//! content-addressed store the nodes live in.
//!
//! ```
//! use std::sync::Arc;
//! use mast::{CreateOptions, Mast, MemoryStore, RemoteConfig, Root};
//!
//! # fn main() -> mast::Result<()> {
//! let store: Arc<MemoryStore> = Arc::new(MemoryStore::default());
//! let mut tree: Mast<String, u64> =
//!     Root::new(CreateOptions::default()).load(RemoteConfig::new(store.clone()))?;
//!
//! tree.insert("a".to_string(), 1)?;
//! let version = tree.make_root()?;
//!
//! let reloaded: Mast<String, u64> = version.load(RemoteConfig::new(store))?;
//! assert_eq!(reloaded.get(&"a".to_string())?, Some(1));
//! # Ok(())
//! # }
//! ```

mod diff;
mod error;
mod layer;
mod node;
mod root;
mod store;
mod tree;

#[cfg(test)]
mod testing;

pub use crate::{
    error::{Error, Result},
    layer::{default_layer, layer_of_encoded, LayerFn, DEFAULT_BRANCH_FACTOR},
    node::{Link, Node},
    root::{CreateOptions, RemoteConfig, Root},
    store::{Codec, DecodedNode, JsonCodec, MemoryStore, NodeCache, Persist},
    tree::Mast,
};

pub mod prelude {
    pub use crate::{
        error::{Error, Result},
        layer::{default_layer, layer_of_encoded, LayerFn, DEFAULT_BRANCH_FACTOR},
        node::{Link, Node},
        root::{CreateOptions, RemoteConfig, Root},
        store::{Codec, DecodedNode, JsonCodec, MemoryStore, NodeCache, Persist},
        tree::Mast,
    };
}
