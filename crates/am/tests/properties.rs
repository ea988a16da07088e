//! Property-based checks for the allocator and the append buffer.
//! Run with `cargo test -p am --features proptest`.
#![cfg(feature = "proptest")]

use am::{AppendBuffer, IdAssigner};
use proptest::collection;
use proptest::prelude::*;
use std::collections::BTreeSet;

proptest! {
    /// Replaying any alloc/free schedule never yields a duplicate live ID,
    /// and freed IDs become eligible again.
    #[test]
    fn id_assigner_live_set_stays_unique(ops in collection::vec(any::<bool>(), 1..200)) {
        let assigner = IdAssigner::new();
        let mut live = BTreeSet::new();
        for alloc in ops {
            if alloc || live.is_empty() {
                let id = assigner.allocate();
                prop_assert!(live.insert(id), "ID {id} handed out while live");
            } else {
                let id = *live.iter().next_back().unwrap();
                live.remove(&id);
                assigner.free(id);
            }
            prop_assert_eq!(assigner.live(), live.len());
        }
    }

    /// Every pushed value is retrievable at the index push_back returned,
    /// and indices form exactly `0..n`.
    #[test]
    fn append_buffer_indices_are_dense(values in collection::vec(any::<u64>(), 1..500)) {
        let buf = AppendBuffer::new();
        let mut indices = Vec::new();
        for v in &values {
            indices.push(buf.push_back(*v));
        }
        let expected: Vec<usize> = (0..values.len()).collect();
        prop_assert_eq!(&indices, &expected);
        for (i, v) in values.iter().enumerate() {
            prop_assert_eq!(buf[i], *v);
        }
        prop_assert_eq!(buf.len(), values.len());
    }
}
