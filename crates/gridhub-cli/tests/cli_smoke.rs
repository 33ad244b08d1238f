use serde_json::{Value, json};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
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
            "gridhub-cli-{prefix}-{}-{unique}",
            std::process::id()
        ));
        fs::create_dir_all(&path).expect("temp dir should be created");
        Self { path }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

fn run_gridhub<I, S>(root: &Path, args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let bin = env!("CARGO_BIN_EXE_gridhub");
    Command::new(bin)
        .arg("--config")
        .arg(root.join("gridhub.toml"))
        .arg("--data-dir")
        .arg(root.join("data"))
        .args(args)
        .output()
        .expect("gridhub command should execute")
}

fn assert_success(output: &Output) {
    if !output.status.success() {
        panic!(
            "command failed with status {:?}\nstdout:\n{}\nstderr:\n{}",
            output.status.code(),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );
    }
}

fn assert_failure(output: &Output) {
    if output.status.success() {
        panic!(
            "command unexpectedly succeeded\nstdout:\n{}\nstderr:\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );
    }
}

fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn parse_json_stdout(output: &Output) -> Value {
    serde_json::from_slice::<Value>(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout should be JSON: {e}\nstdout:\n{}",
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

fn run_json<I, S>(root: &Path, args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_gridhub(root, args);
    assert_success(&output);
    parse_json_stdout(&output)
}

fn write_network_file(root: &Path) -> PathBuf {
    let path = root.join("net.json");
    let network = json!({
        "net_type": "distribution",
        "parameters": {"f_hz": 50.0},
        "tables": {
            "bus": [
                {"index": 0, "name": "Feeder", "vn_kv": 20.0, "in_service": true},
                {"index": 1, "name": "Tap", "vn_kv": 20.0, "in_service": true},
                {"index": 2, "name": "House", "vn_kv": 0.4, "in_service": true}
            ]
        }
    });
    fs::write(&path, serde_json::to_vec(&network).expect("network json")).expect("write network");
    path
}

fn bus_rows(payload: &Value) -> Vec<Value> {
    payload["rows"].as_array().cloned().expect("rows array")
}

#[test]
fn project_lifecycle_with_variant_edit() {
    let tmp = TempDirGuard::new("lifecycle");
    let root = tmp.path();

    let created = run_json(root, ["--user", "alice", "project", "create", "grid", "--json"]);
    assert_eq!(created["action"], "project.create");
    assert_eq!(created["project"]["name"], "grid");

    let listed = run_json(root, ["--user", "alice", "project", "list", "--json"]);
    assert_eq!(listed["count"], 1);
    assert_eq!(listed["items"][0]["role"], "owner");

    let acquired = run_json(
        root,
        ["--user", "alice", "lock", "acquire", "grid", "--json"],
    );
    assert_eq!(acquired["state"], "acquired");
    assert_eq!(acquired["lock"]["holder"], "alice");

    let file = write_network_file(root);
    let stored = run_json(
        root,
        [
            OsStr::new("--user"),
            OsStr::new("alice"),
            OsStr::new("net"),
            OsStr::new("store"),
            OsStr::new("grid"),
            file.as_os_str(),
            OsStr::new("--name"),
            OsStr::new("feeder"),
            OsStr::new("--json"),
        ],
    );
    let net_id = stored["netId"].as_i64().expect("net id").to_string();

    let variant = run_json(
        root,
        [
            "--user", "alice", "variant", "create", "grid", net_id.as_str(), "uprate", "--json",
        ],
    );
    let variant_index = variant["variant"]["index"]
        .as_i64()
        .expect("variant index")
        .to_string();

    run_json(
        root,
        [
            "--user",
            "alice",
            "element",
            "change",
            "grid",
            net_id.as_str(),
            "bus",
            "2",
            "--variant",
            variant_index.as_str(),
            "--set",
            "vn_kv=0.69",
            "--json",
        ],
    );
    let added = run_json(
        root,
        [
            "--user",
            "alice",
            "element",
            "add",
            "grid",
            net_id.as_str(),
            "bus",
            "--variant",
            variant_index.as_str(),
            "--set",
            "name=Storage",
            "--set",
            "vn_kv=0.69",
            "--json",
        ],
    );
    assert_eq!(added["index"], 3);

    let base = run_json(
        root,
        [
            "--user", "alice", "element", "read", "grid", net_id.as_str(), "bus", "--json",
        ],
    );
    let base_rows = bus_rows(&base);
    assert_eq!(base_rows.len(), 3);
    assert_eq!(base_rows[2]["vn_kv"], 0.4);

    let in_variant = run_json(
        root,
        [
            "--user",
            "alice",
            "element",
            "read",
            "grid",
            net_id.as_str(),
            "bus",
            "--variant",
            variant_index.as_str(),
            "--json",
        ],
    );
    let variant_rows = bus_rows(&in_variant);
    assert_eq!(variant_rows.len(), 4);
    assert_eq!(variant_rows[2]["vn_kv"], 0.69);
    assert_eq!(variant_rows[3]["name"], "Storage");

    let released = run_json(
        root,
        ["--user", "alice", "lock", "release", "grid", "--json"],
    );
    assert_eq!(released["released"], true);

    let output = run_gridhub(
        root,
        [
            "--user", "alice", "element", "delete", "grid", net_id.as_str(), "bus", "1", "--variant",
            variant_index.as_str(),
        ],
    );
    assert_failure(&output);
    assert!(
        stderr_text(&output).contains("error: failed to delete element"),
        "stderr: {}",
        stderr_text(&output)
    );
}

#[test]
fn network_load_writes_the_exchange_format() {
    let tmp = TempDirGuard::new("net-load");
    let root = tmp.path();
    assert_success(&run_gridhub(root, ["project", "create", "grid"]));
    assert_success(&run_gridhub(root, ["lock", "acquire", "grid"]));

    let file = write_network_file(root);
    let stored = run_json(
        root,
        [
            OsStr::new("net"),
            OsStr::new("store"),
            OsStr::new("grid"),
            file.as_os_str(),
            OsStr::new("--name"),
            OsStr::new("feeder"),
            OsStr::new("--json"),
        ],
    );
    let net_id = stored["netId"].as_i64().expect("net id").to_string();

    let out_path = root.join("loaded.json");
    let output = run_gridhub(
        root,
        [
            OsStr::new("net"),
            OsStr::new("load"),
            OsStr::new("grid"),
            OsStr::new(&net_id),
            OsStr::new("--output"),
            out_path.as_os_str(),
        ],
    );
    assert_success(&output);
    let loaded: Value =
        serde_json::from_slice(&fs::read(&out_path).expect("read loaded")).expect("loaded json");
    assert_eq!(loaded["net_type"], "distribution");
    assert_eq!(loaded["parameters"]["f_hz"], 50.0);
    let buses = loaded["tables"]["bus"].as_array().expect("bus rows");
    assert_eq!(buses.len(), 3);
    assert_eq!(buses[0]["name"], "Feeder");

    let subnet = run_json(
        root,
        [
            "net", "subnet", "grid", net_id.as_str(), "--where", "vn_kv=0.4", "--no-results",
        ],
    );
    let buses = subnet["tables"]["bus"].as_array().expect("subnet bus rows");
    assert_eq!(buses.len(), 1);
    assert_eq!(buses[0]["name"], "House");

    let listed = run_json(root, ["net", "list", "grid", "--json"]);
    assert_eq!(listed["count"], 1);
    assert_eq!(listed["items"][0]["name"], "feeder");

    assert_success(&run_gridhub(root, ["net", "delete", "grid", net_id.as_str()]));
    let listed = run_json(root, ["net", "list", "grid", "--json"]);
    assert_eq!(listed["count"], 0);
}

#[test]
fn timeseries_write_read_and_list() {
    let tmp = TempDirGuard::new("ts");
    let root = tmp.path();
    assert_success(&run_gridhub(root, ["project", "create", "profiles"]));

    let series_path = root.join("series.json");
    fs::write(
        &series_path,
        serde_json::to_vec(&json!({
            "timestamps": [
                "2024-06-01T00:00:00Z",
                "2024-06-01T00:15:00Z",
                "2024-06-01T00:30:00Z"
            ],
            "values": [1.25, -0.5, 3.0]
        }))
        .expect("series json"),
    )
    .expect("write series");

    let written = run_json(
        root,
        [
            OsStr::new("ts"),
            OsStr::new("write"),
            OsStr::new("profiles"),
            OsStr::new("p_mw"),
            series_path.as_os_str(),
            OsStr::new("--meta"),
            OsStr::new("element_index=4"),
            OsStr::new("--compress"),
            OsStr::new("--json"),
        ],
    );
    assert_eq!(written["points"], 3);
    assert_eq!(written["compressed"], true);

    let read = run_json(
        root,
        [
            "ts",
            "read",
            "profiles",
            "p_mw",
            "--meta",
            "element_index=4",
            "--json",
        ],
    );
    assert_eq!(read["series"]["values"], json!([1.25, -0.5, 3.0]));
    assert_eq!(
        read["series"]["timestamps"][1],
        "2024-06-01T00:15:00.000Z"
    );
    assert_eq!(read["series"]["metadata"]["element_index"], 4);

    let listed = run_json(root, ["ts", "list", "profiles", "--json"]);
    assert_eq!(listed["count"], 1);
    assert!(listed["items"][0].get("timeseries_data").is_none());

    let output = run_gridhub(root, ["ts", "read", "profiles", "q_mvar"]);
    assert_failure(&output);
}

#[test]
fn project_delete_requires_confirmation() {
    let tmp = TempDirGuard::new("delete");
    let root = tmp.path();
    assert_success(&run_gridhub(root, ["project", "create", "scratch"]));

    let output = run_gridhub(root, ["project", "delete", "scratch"]);
    assert_failure(&output);
    assert!(stderr_text(&output).contains("--yes"));

    assert_success(&run_gridhub(root, ["project", "delete", "scratch", "--yes"]));
    let listed = run_json(root, ["project", "list", "--json"]);
    assert_eq!(listed["count"], 0);
}

#[test]
fn concurrent_lock_acquisition_grants_one_process() {
    let tmp = TempDirGuard::new("lock-race");
    let root = tmp.path().to_path_buf();
    assert_success(&run_gridhub(&root, ["project", "create", "shared"]));

    let workers = 4;
    let barrier = Arc::new(Barrier::new(workers));
    let handles = (0..workers)
        .map(|worker| {
            let barrier = Arc::clone(&barrier);
            let root = root.clone();
            thread::spawn(move || {
                let user = format!("worker-{worker}");
                barrier.wait();
                run_gridhub(
                    &root,
                    ["--superuser", "--user", user.as_str(), "lock", "acquire", "shared"],
                )
            })
        })
        .collect::<Vec<_>>();

    let granted = handles
        .into_iter()
        .map(|handle| handle.join().expect("worker thread should finish"))
        .filter(|output| output.status.success())
        .count();
    assert_eq!(granted, 1);

    let status = run_json(&root, ["lock", "status", "shared", "--json"]);
    assert_eq!(status["locked"], true);
    assert!(
        status["lock"]["holder"]
            .as_str()
            .expect("holder")
            .starts_with("worker-")
    );
}
