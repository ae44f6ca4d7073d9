//! Tests for size estimates.

use serde_json::json;

use super::size::{entry_size, Weigh, ENTRY_OVERHEAD};

#[test]
fn test_strings_grow_with_length() {
    let short = json!("ab");
    let long = json!("a".repeat(1000));
    assert_eq!(long.weigh() - short.weigh(), 998);
    assert_eq!("abc".to_string().weigh(), json!("abc").weigh());
}

#[test]
fn test_large_arrays_are_extrapolated_from_sample() {
    let small: Vec<serde_json::Value> = (0..16).map(|_| json!("xxxxxxxx")).collect();
    let large: Vec<serde_json::Value> = (0..1600).map(|_| json!("xxxxxxxx")).collect();
    let small = serde_json::Value::Array(small).weigh();
    let large = serde_json::Value::Array(large).weigh();
    assert!(large > small * 90, "1600 items must weigh about 100x 16 items: {small} vs {large}");
}

#[test]
fn test_deep_nesting_is_bounded() {
    let mut v = json!("leaf");
    for _ in 0..64 {
        v = json!({ "child": v });
    }
    assert!(v.weigh() < 4096, "depth beyond the bound must not be walked");
}

#[test]
fn test_entry_size_counts_key_and_overhead() {
    let v = json!(1);
    assert_eq!(entry_size("k", &v), ENTRY_OVERHEAD + 1 + v.weigh());
    assert_eq!(Some(vec![1u64, 2, 3]).weigh(), vec![1u64, 2, 3].weigh());
    assert_eq!(vec![0u8; 100].weigh(), vec![0u8; 50].weigh() + 50);
}
