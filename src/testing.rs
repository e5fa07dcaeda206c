use itertools::Itertools;
use proptest::{
    collection::{hash_map, SizeRange},
    prelude::*,
};

/// A mutation against the tree under test, mirrored against a model map.
#[derive(Debug, Clone, Copy)]
pub enum TreeOp {
    Insert(u64, u64),
    Delete(u64),
}

impl Arbitrary for TreeOp {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        prop_oneof![
            3 => (0..200u64, any::<u64>()).prop_map(|(k, v)| TreeOp::Insert(k, v)),
            1 => (0..200u64).prop_map(TreeOp::Delete),
        ]
        .boxed()
    }
}

/// Entry sets with distinct keys, sorted for reproducibility.
pub fn distinct_entries(size: impl Into<SizeRange>) -> impl Strategy<Value = Vec<(u64, u64)>> {
    hash_map(any::<u64>(), any::<u64>(), size)
        .prop_map(|entries| entries.into_iter().sorted().collect_vec())
}
