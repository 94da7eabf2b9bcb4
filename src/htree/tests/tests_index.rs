//! Hash tree get/set, compare-and-set and snapshot tests.

#[cfg(test)]
mod tests {
    use crate::htree::{HashTree, HashTreeError, snapshot_file_name};
    use crate::key::{KeyDescriptor, fnv1a_64};
    use crate::position::{HintSegmentId, Position};
    use crate::record::VersionedMeta;
    use std::fs;
    use tempfile::TempDir;

    fn meta(version: i32) -> VersionedMeta {
        VersionedMeta {
            version,
            value_hash: (version as u32).wrapping_add(100),
        }
    }

    #[test]
    fn one_entry_per_hash() {
        let tree = HashTree::new();
        let a = KeyDescriptor::new(b"a", |_| 1);
        let b = KeyDescriptor::new(b"b", |_| 1);

        tree.set(&a, meta(1), Position::new(0, 0)).unwrap();
        tree.set(&b, meta(1), Position::new(0, 40)).unwrap();

        assert_eq!(tree.len().unwrap(), 1);
        assert_eq!(tree.get(&a).unwrap(), Some((meta(1), Position::new(0, 40))));
    }

    /// # Scenario
    /// GC tries to move an entry that a writer already moved elsewhere.
    ///
    /// # Expected behavior
    /// The stale compare-and-set fails and leaves the writer's position.
    #[test]
    fn update_position_rejects_stale_old_position() {
        let tree = HashTree::new();
        let k = KeyDescriptor::new(b"k", fnv1a_64);
        tree.set(&k, meta(1), Position::new(1, 0)).unwrap();
        tree.set(&k, meta(2), Position::new(5, 0)).unwrap();

        assert!(!tree
            .update_position(&k, Position::new(1, 0), Position::new(0, 0))
            .unwrap());
        assert_eq!(tree.get(&k).unwrap().unwrap().1, Position::new(5, 0));

        assert!(tree
            .update_position(&k, Position::new(5, 0), Position::new(0, 8))
            .unwrap());
        assert_eq!(tree.get(&k).unwrap(), Some((meta(2), Position::new(0, 8))));
    }

    #[test]
    fn snapshot_round_trip_and_live_count() {
        let tmp = TempDir::new().unwrap();
        let tree = HashTree::new();
        for i in 0..50u32 {
            let k = KeyDescriptor::new(format!("key{i}").as_bytes(), fnv1a_64);
            let v = if i % 5 == 0 { -2 } else { 1 };
            tree.set(&k, meta(v), Position::new(i / 10, i * 32)).unwrap();
        }
        let path = tmp.path().join(snapshot_file_name(HintSegmentId::new(4, 2)));
        assert!(path.ends_with("004.002.hash"));
        tree.dump(&path).unwrap();

        let loaded = HashTree::new();
        loaded.load(&path).unwrap();
        assert_eq!(loaded.len().unwrap(), 50);
        assert_eq!(loaded.live_count().unwrap(), 40);
        let k7 = KeyDescriptor::new(b"key7", fnv1a_64);
        assert_eq!(loaded.get(&k7).unwrap(), Some((meta(1), Position::new(0, 224))));
    }

    #[test]
    fn corrupt_snapshot_fails_to_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("001.001.hash");
        let tree = HashTree::new();
        tree.set(&KeyDescriptor::new(b"x", fnv1a_64), meta(1), Position::new(0, 0))
            .unwrap();
        tree.dump(&path).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x55;
        fs::write(&path, bytes).unwrap();

        let fresh = HashTree::new();
        assert!(matches!(fresh.load(&path), Err(HashTreeError::Snapshot(_))));
        assert!(fresh.is_empty().unwrap());
    }
}
