//! Property tests for chain identity and the metadata KV store.

use proptest::prelude::*;

use strata_cache::{BatchOp, KvStore, MemoryKvStore};
use strata_snapshot::Digest;

proptest! {
    #[test]
    fn prop_digest_is_deterministic(data in proptest::collection::vec(any::<u8>(), 0..256)) {
        prop_assert_eq!(Digest::from_bytes(&data), Digest::from_bytes(&data));
    }

    #[test]
    fn prop_digest_parse_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..64)) {
        let d = Digest::from_bytes(&data);
        prop_assert_eq!(Digest::parse(d.as_str()), Some(d));
    }

    #[test]
    fn prop_chain_is_order_sensitive(a in "[a-z]{1,16}", b in "[a-z]{1,16}") {
        let da = Digest::from_string(&a);
        let db = Digest::from_string(&b);
        let ab = Digest::chain(&da, &db);
        let ba = Digest::chain(&db, &da);
        if a != b {
            prop_assert_ne!(ab.clone(), ba);
        }
        // chaining always produces a fresh identity
        prop_assert_ne!(ab.clone(), da);
        prop_assert_ne!(ab, db);
    }

    #[test]
    fn prop_chain_composition_is_injective_per_parent(
        parent in "[a-z]{1,12}",
        x in "[a-z]{1,12}",
        y in "[a-z]{1,12}",
    ) {
        let p = Digest::from_string(&parent);
        let dx = Digest::from_string(&x);
        let dy = Digest::from_string(&y);
        if x != y {
            prop_assert_ne!(Digest::chain(&p, &dx), Digest::chain(&p, &dy));
        } else {
            prop_assert_eq!(Digest::chain(&p, &dx), Digest::chain(&p, &dy));
        }
    }

    #[test]
    fn prop_scan_prefix_matches_filtered_scan(
        entries in proptest::collection::btree_map("[a-z/]{1,12}", "[a-z]{0,8}", 0..32),
        prefix in "[a-z/]{0,4}",
    ) {
        let store = MemoryKvStore::new();
        for (k, v) in &entries {
            store.put(k.clone().into_bytes(), v.clone().into_bytes()).unwrap();
        }
        let got = store.scan_prefix(prefix.as_bytes()).unwrap();
        let want: Vec<(Vec<u8>, Vec<u8>)> = entries
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (k.clone().into_bytes(), v.clone().into_bytes()))
            .collect();
        prop_assert_eq!(got, want);
    }

    #[test]
    fn prop_write_batch_is_equivalent_to_sequential_ops(
        puts in proptest::collection::vec(("[a-z]{1,8}", "[a-z]{0,8}"), 0..16),
        deletes in proptest::collection::vec("[a-z]{1,8}", 0..8),
    ) {
        let batched = MemoryKvStore::new();
        let sequential = MemoryKvStore::new();

        let mut ops = Vec::new();
        for (k, v) in &puts {
            ops.push(BatchOp::Put { key: k.clone().into_bytes(), value: v.clone().into_bytes() });
            sequential.put(k.clone().into_bytes(), v.clone().into_bytes()).unwrap();
        }
        for k in &deletes {
            ops.push(BatchOp::Delete { key: k.clone().into_bytes() });
            sequential.delete(k.as_bytes()).unwrap();
        }
        batched.write_batch(ops).unwrap();

        prop_assert_eq!(
            batched.scan_prefix(b"").unwrap(),
            sequential.scan_prefix(b"").unwrap()
        );
    }
}
