// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn put_bumps_revision_and_get_returns_it() {
    let kv = MemoryKv::new();
    let rev = kv.put("k", json!(1), None).await.unwrap();
    assert_eq!(rev, 1);
    let rev = kv.put("k", json!(2), Some(1)).await.unwrap();
    assert_eq!(rev, 2);
    assert_eq!(kv.get("k").await.unwrap(), Some((json!(2), 2)));
}

#[tokio::test]
async fn stale_revision_conflicts() {
    let kv = MemoryKv::new();
    kv.put("k", json!(1), None).await.unwrap();
    kv.put("k", json!(2), None).await.unwrap();

    let err = kv.put("k", json!(3), Some(1)).await.unwrap_err();
    assert!(matches!(err, KvError::Conflict { expected: 1, found: 2, .. }));
}

#[tokio::test]
async fn expected_zero_asserts_absence() {
    let kv = MemoryKv::new();
    kv.put("k", json!(1), Some(0)).await.unwrap();
    let err = kv.put("k", json!(1), Some(0)).await.unwrap_err();
    assert!(matches!(err, KvError::Conflict { .. }));
}

#[tokio::test]
async fn append_by_index_places_out_of_order_completions() {
    let kv = MemoryKv::new();
    kv_append_by_index(&kv, "loop", 2, json!("c")).await.unwrap();
    kv_append_by_index(&kv, "loop", 0, json!("a")).await.unwrap();

    let (value, _) = kv.get("loop").await.unwrap().unwrap();
    assert_eq!(value, json!(["a", serde_json::Value::Null, "c"]));
}

#[tokio::test]
async fn concurrent_appends_all_land() {
    let kv = Arc::new(MemoryKv::new());
    let mut handles = Vec::new();
    for i in 0..8usize {
        let kv = Arc::clone(&kv);
        handles.push(tokio::spawn(async move {
            kv_append_by_index(kv.as_ref(), "loop", i, json!(i)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let (value, _) = kv.get("loop").await.unwrap().unwrap();
    let items = value.as_array().unwrap();
    assert_eq!(items.len(), 8);
    for (i, item) in items.iter().enumerate() {
        assert_eq!(item, &json!(i));
    }
}
