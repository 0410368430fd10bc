#![cfg(target_os = "linux")]
use shmdict::{
    AttachError, CreationError, DecodeError, EncodeError, Mapping, SharedBuffer, Store, StoreError,
    StoreOptions, Value, FORMAT_VERSION, HEADER_LEN, MAGIC, MAX_DEPTH,
};

use std::path::PathBuf;

const CAPACITY: usize = 1024;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn scratch() -> (tempfile::TempDir, PathBuf) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dict");
    (dir, path)
}

fn increment(store: &Store, key: &str) {
    store
        .update(|mapping| {
            let current = mapping.get(key).and_then(Value::as_int).unwrap_or(0);
            mapping.insert(key.to_owned(), Value::Int(current + 1));
        })
        .unwrap();
}

#[test]
fn set_then_get() {
    let (_dir, path) = scratch();
    let store = Store::create(&path, CAPACITY).unwrap();

    store.set("k1", "v1").unwrap();
    store.set("k2", 2).unwrap();
    assert_eq!(store.get("k1").unwrap(), Value::Str("v1".into()));
    assert_eq!(store.get("k2").unwrap(), Value::Int(2));
}

#[test]
fn length_counts_distinct_keys() {
    let (_dir, path) = scratch();
    let store = Store::create(&path, CAPACITY).unwrap();
    assert_eq!(store.len().unwrap(), 0);
    assert!(store.is_empty().unwrap());

    for n in 0..10 {
        store.set(format!("key-{n}"), n).unwrap();
    }
    assert_eq!(store.len().unwrap(), 10);

    store.set("key-3", "replaced").unwrap();
    assert_eq!(store.len().unwrap(), 10);
    assert_eq!(store.get("key-3").unwrap(), Value::from("replaced"));
}

#[test]
fn missing_key() {
    let (_dir, path) = scratch();
    let store = Store::create(&path, CAPACITY).unwrap();

    let err = store.get("nonexistent").unwrap_err();
    assert!(matches!(err, StoreError::KeyNotFound(ref key) if key == "nonexistent"), "{err:?}");
}

#[test]
fn nested_values() {
    let (_dir, path) = scratch();
    let store = Store::create(&path, CAPACITY).unwrap();

    let mut inner = Mapping::new();
    inner.insert("pi".into(), Value::Float(3.5));
    inner.insert("bytes".into(), Value::Bytes(vec![1, 2, 3]));
    let value = Value::List(vec![Value::Map(inner), Value::Null, Value::Bool(false)]);

    store.set("nested", value.clone()).unwrap();
    assert_eq!(store.get("nested").unwrap(), value);
}

fn nested_lists(levels: usize) -> Value {
    let mut value = Value::Null;
    for _ in 0..levels {
        value = Value::List(vec![value]);
    }
    value
}

#[test]
fn deeply_nested_set_keeps_previous_mapping() {
    let (_dir, path) = scratch();
    let store = Store::create(&path, CAPACITY).unwrap();
    store.set("kept", 1).unwrap();

    store.set("deepest", nested_lists(MAX_DEPTH)).unwrap();
    assert_eq!(store.get("deepest").unwrap(), nested_lists(MAX_DEPTH));

    for levels in [MAX_DEPTH + 1, 100_000] {
        let err = store.set("deeper", nested_lists(levels)).unwrap_err();
        assert!(matches!(err, StoreError::Encode(EncodeError::TooDeep)), "{err:?}");
    }

    assert_eq!(store.len().unwrap(), 2);
    assert_eq!(store.get("kept").unwrap(), Value::Int(1));
}

/// Some other writer put a deeply nested value there.
#[test]
fn deeply_nested_region() {
    let (_dir, path) = scratch();
    let buffer = SharedBuffer::create(&path, 64 * 1024).unwrap();

    // `{"a": [[..[null]..]]}`
    let mut body = vec![1, 1, b'a'];
    for _ in 0..20_000 {
        body.extend_from_slice(&[6, 1]);
    }
    body.push(0);

    let mut region = MAGIC.to_vec();
    region.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    region.extend_from_slice(&(body.len() as u64).to_le_bytes());
    region.extend_from_slice(&body);
    buffer.write(0, &region).unwrap();

    let err = Store::from_buffer(buffer).unwrap_err();
    assert!(matches!(err, StoreError::Decode(DecodeError::Malformed(_))), "{err:?}");
}

#[test]
fn oversized_set_keeps_previous_mapping() {
    let (_dir, path) = scratch();
    let store = Store::create(&path, 128).unwrap();
    store.set("small", 1).unwrap();

    let err = store.set("large", "x".repeat(256)).unwrap_err();
    assert!(
        matches!(err, StoreError::Capacity(cap) if cap.capacity == 128 && cap.len > 128),
        "{err:?}"
    );

    assert_eq!(store.get("small").unwrap(), Value::Int(1));
    assert_eq!(store.len().unwrap(), 1);
    assert!(matches!(store.get("large"), Err(StoreError::KeyNotFound(_))));
}

#[test]
fn shrinking_mapping_leaves_stale_bytes_harmless() {
    let (_dir, path) = scratch();
    let store = Store::create(&path, CAPACITY).unwrap();

    store.set("long", "y".repeat(500)).unwrap();
    store.set("short", 1).unwrap();
    assert_eq!(store.remove("long").unwrap(), Some(Value::Str("y".repeat(500))));

    assert_eq!(store.render().unwrap(), r#"{"short": 1}"#);
    let attacher = Store::attach(&path, CAPACITY).unwrap();
    assert_eq!(attacher.len().unwrap(), 1);
}

#[test]
fn attacher_sees_creator_writes() {
    let (_dir, path) = scratch();
    let creator = Store::create(&path, CAPACITY).unwrap();
    creator.set("x", 1).unwrap();

    let attacher = Store::open(
        &path,
        &StoreOptions {
            create: false,
            capacity: CAPACITY,
        },
    )
    .unwrap();
    assert_eq!(attacher.get("x").unwrap(), Value::Int(1));

    attacher.set("y", true).unwrap();
    assert_eq!(creator.get("y").unwrap(), Value::Bool(true));
}

#[test]
fn open_with_default_options_creates() {
    let (_dir, path) = scratch();
    let store = Store::open(&path, &StoreOptions::default()).unwrap();
    assert_eq!(store.buffer().capacity(), StoreOptions::DEFAULT_CAPACITY);
    assert!(store.is_empty().unwrap());
}

#[test]
fn create_twice_fails() {
    let (_dir, path) = scratch();
    let first = Store::create(&path, CAPACITY).unwrap();
    first.set("kept", 1).unwrap();

    let err = Store::create(&path, CAPACITY).unwrap_err();
    assert!(matches!(err, StoreError::Creation(CreationError::AlreadyExists(_))), "{err:?}");
    assert_eq!(first.get("kept").unwrap(), Value::Int(1));
}

#[test]
fn capacity_too_small_for_empty_mapping() {
    let (_dir, path) = scratch();

    let err = Store::create(&path, HEADER_LEN).unwrap_err();
    assert!(matches!(err, StoreError::Capacity(_)), "{err:?}");
    assert!(!path.exists());
}

#[test]
fn attach_missing_region() {
    let (_dir, path) = scratch();
    let err = Store::attach(&path, CAPACITY).unwrap_err();
    assert!(matches!(err, StoreError::Attach(AttachError::NotFound(_))), "{err:?}");
}

#[test]
fn attach_with_other_capacity() {
    let (_dir, path) = scratch();
    let _creator = Store::create(&path, CAPACITY).unwrap();

    let err = Store::attach(&path, CAPACITY * 2).unwrap_err();
    assert!(matches!(err, StoreError::Attach(AttachError::SizeMismatch { .. })), "{err:?}");
}

/// The creator has made the region, but not yet written the empty mapping into it.
#[test]
fn attach_before_initialize() {
    let (_dir, path) = scratch();
    let buffer = SharedBuffer::create(&path, CAPACITY).unwrap();

    let err = Store::attach(&path, CAPACITY).unwrap_err();
    assert!(matches!(err, StoreError::Decode(DecodeError::Uninitialized)), "{err:?}");

    // Once initialized, attaching works.
    Store::initialize(&buffer).unwrap();
    let store = Store::attach(&path, CAPACITY).unwrap();
    assert!(store.is_empty().unwrap());
}

/// The creator has made the name, but not even sized it yet.
#[test]
fn attach_before_sizing() {
    let (_dir, path) = scratch();
    std::fs::File::create(&path).unwrap();

    let err = Store::attach(&path, CAPACITY).unwrap_err();
    assert!(matches!(err, StoreError::Decode(DecodeError::Uninitialized)), "{err:?}");
}

#[test]
fn garbage_region() {
    let (_dir, path) = scratch();
    let buffer = SharedBuffer::create(&path, CAPACITY).unwrap();
    buffer.write(0, b"definitely not a mapping").unwrap();

    let err = Store::from_buffer(buffer).unwrap_err();
    assert!(matches!(err, StoreError::Decode(DecodeError::BadMagic(_))), "{err:?}");
}

#[test]
fn remove_contains_clear() {
    let (_dir, path) = scratch();
    let store = Store::create(&path, CAPACITY).unwrap();
    store.set("a", 1).unwrap();
    store.set("b", 2).unwrap();

    assert!(store.contains_key("a").unwrap());
    assert_eq!(store.remove("a").unwrap(), Some(Value::Int(1)));
    assert_eq!(store.remove("a").unwrap(), None);
    assert!(!store.contains_key("a").unwrap());

    let snapshot = store.snapshot().unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot["b"], Value::Int(2));

    store.clear().unwrap();
    assert!(store.is_empty().unwrap());
}

#[test]
fn update_returns_closure_result() {
    let (_dir, path) = scratch();
    let store = Store::create(&path, CAPACITY).unwrap();
    store.set("n", 41).unwrap();

    let previous = store
        .update(|mapping| mapping.insert("n".into(), Value::Int(42)))
        .unwrap();
    assert_eq!(previous, Some(Value::Int(41)));
    assert_eq!(store.get("n").unwrap(), Value::Int(42));
}

#[test]
fn render_is_ordered() {
    let (_dir, path) = scratch();
    let store = Store::create(&path, CAPACITY).unwrap();
    assert_eq!(store.render().unwrap(), "{}");

    store.set("zeta", 0.5).unwrap();
    store.set("alpha", "first").unwrap();
    assert_eq!(store.render().unwrap(), r#"{"alpha": "first", "zeta": 0.5}"#);
}

#[test]
fn close_and_destroy() {
    let (_dir, path) = scratch();
    let mut store = Store::create(&path, CAPACITY).unwrap();
    let mut attacher = Store::attach(&path, CAPACITY).unwrap();

    attacher.close();
    attacher.close();
    assert!(matches!(attacher.get("x"), Err(StoreError::Closed)));

    store.destroy().unwrap();
    store.destroy().unwrap();
    store.close();
    assert!(matches!(store.len(), Err(StoreError::Closed)));
    assert!(!path.exists());

    let err = Store::attach(&path, CAPACITY).unwrap_err();
    assert!(matches!(err, StoreError::Attach(AttachError::NotFound(_))), "{err:?}");

    // Destroying after the creator already did is not an error either.
    attacher.destroy().unwrap();
}

#[test]
fn threads_with_separate_attachments() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 100;

    let (_dir, path) = scratch();
    let store = Store::create(&path, CAPACITY).unwrap();

    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                let store = Store::attach(&path, CAPACITY).unwrap();
                for _ in 0..ROUNDS {
                    increment(&store, "counter");
                }
            });
        }
    });

    assert_eq!(store.get("counter").unwrap(), Value::Int((THREADS * ROUNDS) as i64));
}

#[test]
fn threads_sharing_one_store() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 100;

    let store = Store::anonymous("threads", CAPACITY).unwrap();

    std::thread::scope(|scope| {
        for idx in 0..THREADS {
            let store = &store;
            scope.spawn(move || {
                for _ in 0..ROUNDS {
                    increment(store, "counter");
                }
                store.set(format!("thread-{idx}"), true).unwrap();
            });
        }
    });

    assert_eq!(store.get("counter").unwrap(), Value::Int((THREADS * ROUNDS) as i64));
    assert_eq!(store.len().unwrap(), THREADS + 1);
}
