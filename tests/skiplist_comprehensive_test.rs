// Comprehensive Skip List Integration Tests
// Test ID Format: SKIP-XXX
//
// Single-threaded scenarios and algebraic laws, run against all three
// variants through the shared SkipMap trait.

use skipset::{CoarseSkipList, LockFreeSkipList, OptimisticSkipList, SkipMap};

fn all_variants() -> Vec<Box<dyn SkipMap>> {
    vec![
        Box::new(CoarseSkipList::new()),
        Box::new(OptimisticSkipList::new()),
        Box::new(LockFreeSkipList::new()),
    ]
}

// SKIP-001: Insert a fixed sequence with a duplicate and check the result
// vector, membership, and size
#[test]
fn test_skip_001_single_threaded_smoke() {
    for mut list in all_variants() {
        let keys = [3i64, 1, 4, 1, 5, 9, 2, 6];
        let expected = [true, true, true, false, true, true, true, true];
        for (key, expect) in keys.iter().zip(expected) {
            assert_eq!(list.insert(*key, key * 100), expect);
        }
        assert!(list.contains(1));
        assert!(!list.contains(7));
        assert_eq!(list.len(), 7);
        assert!(list.validate().is_ok());
    }
    println!("SKIP-001: PASSED - smoke sequence on all variants");
}

// SKIP-002: Delete in the middle of a run leaves the neighbors intact
#[test]
fn test_skip_002_delete_cascade() {
    for mut list in all_variants() {
        for key in 1..=10 {
            assert!(list.insert(key, key));
        }
        assert!(list.remove(5));
        assert!(!list.contains(5));
        assert!(list.contains(4));
        assert!(list.contains(6));
        assert_eq!(list.len(), 9);
        assert!(list.validate().is_ok());
    }
    println!("SKIP-002: PASSED - delete cascade on all variants");
}

// SKIP-003: Operations on the empty list
#[test]
fn test_skip_003_empty_list() {
    for mut list in all_variants() {
        assert!(!list.remove(7));
        assert!(!list.contains(7));
        assert_eq!(list.get(7), None);
        assert_eq!(list.len(), 0);
        assert!(list.is_empty());
        assert!(list.validate().is_ok());
    }
    println!("SKIP-003: PASSED - empty-list operations on all variants");
}

// SKIP-004: Algebraic laws - double insert, insert/remove/remove,
// contains idempotence
#[test]
fn test_skip_004_laws() {
    for list in all_variants() {
        assert!(list.insert(11, 1));
        assert!(!list.insert(11, 2));
        assert!(list.contains(11));

        assert!(list.remove(11));
        assert!(!list.contains(11));
        assert!(!list.remove(11));

        assert!(list.insert(12, 3));
        assert_eq!(list.contains(12), list.contains(12));
        assert_eq!(list.get(12), list.get(12));
    }
    println!("SKIP-004: PASSED - set laws on all variants");
}

// SKIP-005: Values are immutable while live, and a re-insert after remove
// installs a fresh value
#[test]
fn test_skip_005_value_semantics() {
    for list in all_variants() {
        assert!(list.insert(42, 1));
        assert!(!list.insert(42, 2));
        assert_eq!(list.get(42), Some(1));

        assert!(list.remove(42));
        assert!(list.insert(42, 2));
        assert_eq!(list.get(42), Some(2));
    }
    println!("SKIP-005: PASSED - value immutability on all variants");
}

// SKIP-006: The validator accepts the structure after an arbitrary mixed
// sequence and the size matches the surviving keys
#[test]
fn test_skip_006_validate_after_mixed_sequence() {
    for mut list in all_variants() {
        for key in 0..200 {
            assert!(list.insert(key, key * 7));
        }
        for key in (0..200).step_by(3) {
            assert!(list.remove(key));
        }
        for key in (0..200).step_by(6) {
            assert!(list.insert(key, key));
        }

        let live = (0..200).filter(|&k| list.contains(k)).count();
        assert_eq!(list.len(), live);
        assert!(list.validate().is_ok());
    }
    println!("SKIP-006: PASSED - validator after mixed sequence on all variants");
}

// SKIP-007: Negative and widely spread keys order correctly
#[test]
fn test_skip_007_key_domain() {
    for mut list in all_variants() {
        let keys = [i64::MIN + 1, -1_000_000, -1, 0, 1, 1_000_000, i64::MAX - 1];
        for key in keys {
            assert!(list.insert(key, key));
        }
        for key in keys {
            assert_eq!(list.get(key), Some(key));
        }
        assert_eq!(list.len(), keys.len());
        assert!(list.validate().is_ok());
    }
    println!("SKIP-007: PASSED - key domain boundaries on all variants");
}

// SKIP-008: Bulk load large enough that towers at or near the height cap
// are drawn, then check every level of the structure
#[test]
fn test_skip_008_tall_towers() {
    for mut list in all_variants() {
        for key in 0..70_000 {
            assert!(list.insert(key, key));
        }
        assert_eq!(list.len(), 70_000);
        assert!(list.contains(0));
        assert!(list.contains(69_999));
        assert!(!list.contains(70_000));
        assert!(list.validate().is_ok());
    }
    println!("SKIP-008: PASSED - tall-tower bulk load on all variants");
}
