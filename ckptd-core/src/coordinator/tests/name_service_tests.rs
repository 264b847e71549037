use crate::coordinator::NameService;

const NS_A: [u8; 8] = *b"ns-aaaa\0";
const NS_B: [u8; 8] = *b"ns-bbbb\0";

#[test]
fn test_register_and_query() {
    let mut ns = NameService::new();
    ns.register(NS_A, b"key".to_vec(), b"value".to_vec());
    assert_eq!(ns.query(&NS_A, b"key"), Some(b"value".as_slice()));
    assert_eq!(ns.query(&NS_A, b"other"), None);
    assert_eq!(ns.query(&NS_B, b"key"), None);
}

#[test]
fn test_namespaces_are_disjoint() {
    let mut ns = NameService::new();
    ns.register(NS_A, b"key".to_vec(), b"a".to_vec());
    ns.register(NS_B, b"key".to_vec(), b"b".to_vec());
    assert_eq!(ns.query(&NS_A, b"key"), Some(b"a".as_slice()));
    assert_eq!(ns.query(&NS_B, b"key"), Some(b"b".as_slice()));
}

#[test]
fn test_colliding_registrations_keep_smallest_value() {
    let mut ns = NameService::new();
    ns.register(NS_A, b"shared".to_vec(), vec![0, 9, 9]);
    ns.register(NS_A, b"shared".to_vec(), vec![0, 1, 1]);
    ns.register(NS_A, b"shared".to_vec(), vec![0, 5, 5]);
    assert_eq!(ns.query(&NS_A, b"shared"), Some([0u8, 1, 1].as_slice()));
}

#[test]
fn test_unique_ids_are_monotonic_per_namespace() {
    let mut ns = NameService::new();
    assert_eq!(ns.get_unique_ids(NS_A, 1), 1);
    assert_eq!(ns.get_unique_ids(NS_A, 4), 2);
    assert_eq!(ns.get_unique_ids(NS_A, 1), 6);
    // Other namespaces run their own counter.
    assert_eq!(ns.get_unique_ids(NS_B, 1), 1);
}

#[test]
fn test_unique_id_span_zero_still_advances() {
    let mut ns = NameService::new();
    assert_eq!(ns.get_unique_ids(NS_A, 0), 1);
    assert_eq!(ns.get_unique_ids(NS_A, 0), 2);
}

#[test]
fn test_clear_wipes_entries_and_counters() {
    let mut ns = NameService::new();
    ns.register(NS_A, b"key".to_vec(), b"value".to_vec());
    ns.get_unique_ids(NS_A, 5);
    assert_eq!(ns.entry_count(&NS_A), 1);

    ns.clear();
    assert_eq!(ns.entry_count(&NS_A), 0);
    assert_eq!(ns.query(&NS_A, b"key"), None);
    assert_eq!(ns.get_unique_ids(NS_A, 1), 1);
}
