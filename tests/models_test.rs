//! Property tests for content addressing.

use proptest::prelude::*;
use std::collections::BTreeMap;

use flotilla::models::{ServiceRevision, ServiceUnit, REV_HASH_LEN};

fn arb_environment() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::btree_map("[A-Z_]{1,12}", "[ -~]{0,32}", 0..8)
        .prop_map(|map| map.into_iter().collect())
}

proptest! {
    /// The unit hash depends only on content, not on environment insertion
    /// order.
    #[test]
    fn unit_hash_ignores_env_insertion_order(
        name in "[a-z]{1,16}\\.service",
        unit_file in "[ -~\\n]{0,256}",
        pairs in arb_environment(),
    ) {
        let forward: BTreeMap<String, String> = pairs.iter().cloned().collect();
        let reverse: BTreeMap<String, String> = pairs.iter().rev().cloned().collect();

        let a = ServiceUnit::new(name.clone(), unit_file.clone(), forward);
        let b = ServiceUnit::new(name, unit_file, reverse);
        prop_assert_eq!(a.unit_hash(), b.unit_hash());
        prop_assert_eq!(a.unit_hash().len(), REV_HASH_LEN);
    }

    /// The revision hash ignores unit list order.
    #[test]
    fn revision_hash_ignores_unit_order(
        label in "[a-z0-9-]{1,16}",
        files in prop::collection::vec("[ -~\\n]{1,64}", 1..5),
    ) {
        let units: Vec<ServiceUnit> = files
            .iter()
            .enumerate()
            .map(|(i, file)| ServiceUnit::new(format!("u{i}.service"), file.clone(), BTreeMap::new()))
            .collect();
        let mut shuffled = units.clone();
        shuffled.reverse();

        let a = ServiceRevision::new(label.clone(), 1, units);
        let b = ServiceRevision::new(label, 1, shuffled);
        prop_assert_eq!(a.revision_hash(), b.revision_hash());
    }

    /// Distinct unit files produce distinct hashes.
    #[test]
    fn unit_hash_separates_content(
        file_a in "[ -~]{1,64}",
        file_b in "[ -~]{1,64}",
    ) {
        prop_assume!(file_a != file_b);
        let a = ServiceUnit::new("app.service", file_a, BTreeMap::new());
        let b = ServiceUnit::new("app.service", file_b, BTreeMap::new());
        prop_assert_ne!(a.unit_hash(), b.unit_hash());
    }
}
