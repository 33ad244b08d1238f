use gridhub_doc::{
    BackendError, CollectionId, Document, DocumentBackend, Filter, JsonlBackend, MemoryBackend,
    Projection, UpdateOp, UpsertOutcome,
};
use serde_json::{Value, json};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

struct TempDirGuard {
    path: PathBuf,
}

impl TempDirGuard {
    fn new(prefix: &str) -> Self {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!(
            "gridhub-doc-{prefix}-{}-{unique}",
            std::process::id()
        ));
        fs::create_dir_all(&path).expect("temp dir should be created");
        Self { path }
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

fn doc(value: Value) -> Document {
    value.as_object().cloned().expect("object literal")
}

fn exercise(backend: &dyn DocumentBackend) {
    let buses = CollectionId::new("proj", "net_bus");

    backend
        .insert_many(
            &buses,
            vec![
                doc(json!({"_id": "base:1:0", "net_id": 1, "index": 0, "var_type": "base", "vn_kv": 20.0})),
                doc(json!({"_id": "base:1:1", "net_id": 1, "index": 1, "var_type": "base", "vn_kv": 0.4})),
            ],
        )
        .expect("seed buses");

    let err = backend
        .insert(&buses, doc(json!({"_id": "base:1:0"})))
        .expect_err("duplicate id");
    assert!(err.is_duplicate_key());

    let outcome = backend
        .upsert(
            &buses,
            &Filter::eq("_id", "change:1:1:7"),
            doc(json!({"_id": "change:1:1:7", "net_id": 1, "index": 1, "var_type": "change", "variant": 7, "vn_kv": 0.69})),
        )
        .expect("upsert change");
    assert_eq!(outcome, UpsertOutcome::Inserted);

    backend
        .update_one(
            &buses,
            &Filter::eq("_id", "base:1:1"),
            &[UpdateOp::AddToSet("not_in_var".to_string(), json!(7))],
            false,
        )
        .expect("suppress base")
        .expect("base exists");

    let variant_view = Filter::or([
        Filter::and([
            Filter::eq("var_type", "base"),
            Filter::not_in("not_in_var", [7]),
        ]),
        Filter::and([
            Filter::is_in("var_type", ["change", "addition"]),
            Filter::is_in("variant", [7]),
        ]),
    ]);
    let visible = backend
        .find(&buses, &variant_view, &Projection::include(["index", "vn_kv"]))
        .expect("find");
    let rendered: Vec<Value> = visible.into_iter().map(Value::Object).collect();
    assert_eq!(
        rendered,
        vec![
            json!({"_id": "base:1:0", "index": 0, "vn_kv": 20.0}),
            json!({"_id": "change:1:1:7", "index": 1, "vn_kv": 0.69}),
        ]
    );

    assert_eq!(
        backend
            .count(&buses, &Filter::eq("var_type", "base"))
            .expect("count"),
        2
    );
    assert_eq!(
        backend
            .delete(&buses, &Filter::eq("var_type", "change"))
            .expect("delete"),
        1
    );
    assert_eq!(
        backend.list_collections("proj").expect("list"),
        vec!["net_bus".to_string()]
    );
    assert!(backend.drop_collection(&buses).expect("drop"));
    assert!(backend.list_collections("proj").expect("list").is_empty());
}

#[test]
fn memory_backend_implements_collection_semantics() {
    exercise(&MemoryBackend::new());
}

#[test]
fn jsonl_backend_implements_collection_semantics() {
    let dir = TempDirGuard::new("parity");
    let backend = JsonlBackend::open(&dir.path).expect("open");
    exercise(&backend);
}

#[test]
fn jsonl_backend_persists_across_reopen() {
    let dir = TempDirGuard::new("reopen");
    let collection = CollectionId::system("projects");
    {
        let backend = JsonlBackend::open(&dir.path).expect("open");
        backend
            .insert(&collection, doc(json!({"_id": "p1", "name": "grid"})))
            .expect("insert");
    }
    let backend = JsonlBackend::open(&dir.path).expect("reopen");
    let found = backend
        .find_one(&collection, &Filter::eq("name", "grid"))
        .expect("find")
        .expect("document persisted");
    assert_eq!(found["_id"], json!("p1"));
}

#[test]
fn jsonl_backend_rejects_unsafe_collection_names() {
    let dir = TempDirGuard::new("names");
    let backend = JsonlBackend::open(&dir.path).expect("open");
    let err = backend
        .insert(
            &CollectionId::new("proj", "../escape"),
            doc(json!({"_id": 1})),
        )
        .expect_err("path traversal");
    assert!(matches!(err, BackendError::InvalidName(_)));
}

#[test]
fn jsonl_backend_unique_ids_hold_across_threads() {
    let dir = TempDirGuard::new("threads");
    let backend = Arc::new(JsonlBackend::open(&dir.path).expect("open"));
    let collection = CollectionId::new("proj", "net_load");
    let barrier = Arc::new(Barrier::new(6));

    let workers: Vec<_> = (0..6)
        .map(|i| {
            let backend = Arc::clone(&backend);
            let barrier = Arc::clone(&barrier);
            let collection = collection.clone();
            thread::spawn(move || {
                barrier.wait();
                backend.insert(
                    &collection,
                    doc(json!({"_id": "addition:1:5", "writer": i})),
                )
            })
        })
        .collect();

    let results: Vec<Result<(), BackendError>> = workers
        .into_iter()
        .map(|w| w.join().expect("worker should not panic"))
        .collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(BackendError::is_duplicate_key)
    );
    assert_eq!(backend.count(&collection, &Filter::All).expect("count"), 1);
}
