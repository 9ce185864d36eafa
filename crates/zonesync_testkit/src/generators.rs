//! Property-based test generators using proptest.
//!
//! Mutations address devices and objects by index. The harness resolves an
//! index against the objects the device holds when the mutation runs, so
//! every generated sequence is applicable.

use proptest::prelude::*;
use zonesync_engine::FullSyncPolicy;

/// One step of a multi-device scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Insert a group.
    CreateGroup {
        /// Device index.
        device: usize,
        /// Group name.
        name: String,
    },
    /// Insert an item, inside the `group`-th group if the device has one.
    CreateItem {
        /// Device index.
        device: usize,
        /// Item name.
        name: String,
        /// Group index.
        group: Option<usize>,
    },
    /// Rename the `target`-th object.
    Rename {
        /// Device index.
        device: usize,
        /// Object index.
        target: usize,
        /// New name.
        name: String,
    },
    /// Move the `item`-th item.
    Reposition {
        /// Device index.
        device: usize,
        /// Item index.
        item: usize,
        /// New position.
        position: i64,
    },
    /// Point the `item`-th item at the `group`-th group.
    Link {
        /// Device index.
        device: usize,
        /// Item index.
        item: usize,
        /// Group index.
        group: usize,
    },
    /// Delete the `target`-th object.
    Delete {
        /// Device index.
        device: usize,
        /// Object index.
        target: usize,
    },
    /// Run one incremental session.
    Sync {
        /// Device index.
        device: usize,
    },
    /// Rebuild one side of the sync from the other.
    FullSync {
        /// Device index.
        device: usize,
        /// Which side is replaced.
        policy: FullSyncPolicy,
    },
}

impl Mutation {
    /// The device this step runs on.
    pub fn device(&self) -> usize {
        match self {
            Mutation::CreateGroup { device, .. }
            | Mutation::CreateItem { device, .. }
            | Mutation::Rename { device, .. }
            | Mutation::Reposition { device, .. }
            | Mutation::Link { device, .. }
            | Mutation::Delete { device, .. }
            | Mutation::Sync { device }
            | Mutation::FullSync { device, .. } => *device,
        }
    }
}

/// Strategy for object names.
pub fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex")
}

/// Strategy for object indexes.
pub fn index_strategy() -> impl Strategy<Value = usize> {
    0usize..8
}

/// Strategy for full sync policies.
pub fn policy_strategy() -> impl Strategy<Value = FullSyncPolicy> {
    prop_oneof![
        Just(FullSyncPolicy::ReplaceRemote),
        Just(FullSyncPolicy::ReplaceLocal),
    ]
}

/// Strategy for one mutation on one of `devices` devices.
pub fn mutation_strategy(devices: usize) -> impl Strategy<Value = Mutation> {
    let device = 0..devices.max(1);
    prop_oneof![
        3 => (device.clone(), name_strategy())
            .prop_map(|(device, name)| Mutation::CreateGroup { device, name }),
        3 => (device.clone(), name_strategy(), prop::option::of(index_strategy()))
            .prop_map(|(device, name, group)| Mutation::CreateItem { device, name, group }),
        3 => (device.clone(), index_strategy(), name_strategy())
            .prop_map(|(device, target, name)| Mutation::Rename { device, target, name }),
        1 => (device.clone(), index_strategy(), -100i64..100)
            .prop_map(|(device, item, position)| Mutation::Reposition { device, item, position }),
        2 => (device.clone(), index_strategy(), index_strategy())
            .prop_map(|(device, item, group)| Mutation::Link { device, item, group }),
        2 => (device.clone(), index_strategy())
            .prop_map(|(device, target)| Mutation::Delete { device, target }),
        2 => device.clone().prop_map(|device| Mutation::Sync { device }),
        1 => (device, policy_strategy())
            .prop_map(|(device, policy)| Mutation::FullSync { device, policy }),
    ]
}

/// Strategy for a sequence of up to `max_len` mutations.
pub fn mutations_strategy(devices: usize, max_len: usize) -> impl Strategy<Value = Vec<Mutation>> {
    prop::collection::vec(mutation_strategy(devices), 0..=max_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;

    #[test]
    fn mutations_stay_on_known_devices() {
        let mut runner = TestRunner::default();
        for _ in 0..64 {
            let mutation = mutation_strategy(2)
                .new_tree(&mut runner)
                .unwrap()
                .current();
            assert!(mutation.device() < 2);
        }
    }

    #[test]
    fn full_syncs_are_generated() {
        let mut runner = TestRunner::deterministic();
        let full_syncs = (0..512)
            .map(|_| mutation_strategy(2).new_tree(&mut runner).unwrap().current())
            .filter(|m| matches!(m, Mutation::FullSync { .. }))
            .count();
        assert!(full_syncs > 0);
    }

    proptest! {
        #[test]
        fn sequences_respect_max_len(seq in mutations_strategy(3, 12)) {
            prop_assert!(seq.len() <= 12);
            prop_assert!(seq.iter().all(|m| m.device() < 3));
        }
    }
}
