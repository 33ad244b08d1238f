use crate::cli::GlobalArgs;
use chrono::{DateTime, SecondsFormat, Utc};
use gridhub_store::{
    ErrorKind, Hub, Network, Principal, ProjectHandle, SeriesValues, StoreConfig, StoredTimeseries,
};
use gridhub_table::{INDEX_FIELD, Row, Table, encode_cell, infer_cell};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::path::PathBuf;

/// On-disk network exchange format used by `net store` / `net load`.
#[derive(Debug, Deserialize)]
struct NetworkFile {
    #[serde(default)]
    net_type: Option<String>,
    #[serde(default)]
    parameters: Map<String, Value>,
    #[serde(default)]
    tables: BTreeMap<String, Vec<Map<String, Value>>>,
}

pub fn fail(message: impl Display) -> ! {
    eprintln!("error: {message}");
    std::process::exit(1);
}

pub fn ok_or_exit<T, E: Display>(result: Result<T, E>, context: &str) -> T {
    result.unwrap_or_else(|e| fail(format!("{context}: {e}")))
}

pub fn print_json(payload: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(payload).expect("json serialization")
    );
}

pub fn open_hub_or_exit(global: &GlobalArgs) -> Hub {
    let mut config = ok_or_exit(
        StoreConfig::load_optional(&global.config),
        "failed to load config",
    );
    if let Some(data_dir) = &global.data_dir {
        config.data_dir = PathBuf::from(data_dir);
    }
    let principal = if global.superuser {
        Principal::superuser(global.user.clone())
    } else {
        Principal::user(global.user.clone())
    };
    tracing::debug!(
        data_dir = %config.data_dir.display(),
        user = %principal.user,
        superuser = principal.superuser,
        "opening hub"
    );
    ok_or_exit(Hub::open_jsonl(config, principal), "failed to open data dir")
}

/// Resolve a project by id first, then by name in the default realm.
pub fn open_project_or_exit<'h>(hub: &'h Hub, key: &str) -> ProjectHandle<'h> {
    match hub.project(key) {
        Ok(project) => project,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            ok_or_exit(hub.project_by_name(key, None), "failed to open project")
        }
        Err(e) => fail(format!("failed to open project: {e}")),
    }
}

/// Split `name=value`; the value is JSON when it parses, text otherwise.
pub fn parse_assignment_or_exit(raw: &str) -> (String, Value) {
    let Some((name, value)) = raw.split_once('=') else {
        fail(format!("expected name=value, got `{raw}`"));
    };
    let name = name.trim();
    if name.is_empty() {
        fail(format!("empty attribute name in `{raw}`"));
    }
    let value =
        serde_json::from_str::<Value>(value).unwrap_or_else(|_| Value::String(value.to_string()));
    (name.to_string(), value)
}

pub fn row_from_assignments_or_exit(assignments: &[String]) -> Row {
    assignments
        .iter()
        .map(|raw| {
            let (name, value) = parse_assignment_or_exit(raw);
            let cell = ok_or_exit(infer_cell(&name, &value), "invalid attribute value");
            (name, cell)
        })
        .collect()
}

pub fn metadata_from_assignments_or_exit(assignments: &[String]) -> Map<String, Value> {
    assignments
        .iter()
        .map(|raw| parse_assignment_or_exit(raw))
        .collect()
}

pub fn read_json_file_or_exit<T>(path: &str, label: &str) -> T
where
    T: serde::de::DeserializeOwned,
{
    let bytes = fs::read(path).unwrap_or_else(|e| {
        fail(format!("failed to read {label} at {path}: {e}"));
    });
    serde_json::from_slice::<T>(&bytes).unwrap_or_else(|e| {
        fail(format!("failed to parse {label} JSON at {path}: {e}"));
    })
}

pub fn network_from_file_or_exit(path: &str) -> Network {
    let file: NetworkFile = read_json_file_or_exit(path, "network");
    let mut network = Network::new();
    network.net_type = file.net_type;
    network.parameters = file.parameters;
    for (kind, rows) in file.tables {
        let mut table = Table::new(kind.clone());
        for (position, mut fields) in rows.into_iter().enumerate() {
            let index = match fields.remove(INDEX_FIELD) {
                Some(value) => value.as_i64().unwrap_or_else(|| {
                    fail(format!("{kind} row {position}: `index` must be an integer"))
                }),
                None => fail(format!("{kind} row {position}: missing `index`")),
            };
            let mut row = Row::new();
            for (name, value) in fields {
                let cell = ok_or_exit(infer_cell(&name, &value), &format!("{kind} row {index}"));
                row.insert(name, cell);
            }
            table.insert_row(index, row);
        }
        network.insert_table(table);
    }
    network
}

pub fn table_to_json(table: &Table) -> Vec<Value> {
    table
        .rows()
        .map(|(index, row)| {
            let mut fields = Map::new();
            fields.insert(INDEX_FIELD.to_string(), Value::from(index));
            for column in table.columns() {
                if let Some(cell) = row.get(column) {
                    fields.insert(column.clone(), encode_cell(cell));
                }
            }
            Value::Object(fields)
        })
        .collect()
}

pub fn network_to_json(network: &Network) -> Value {
    let tables: Map<String, Value> = network
        .tables
        .iter()
        .map(|(kind, table)| (kind.clone(), Value::Array(table_to_json(table))))
        .collect();
    json!({
        "net_type": network.net_type,
        "parameters": network.parameters,
        "tables": tables,
    })
}

pub fn timestamp_text(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn series_values_json(values: &SeriesValues) -> Value {
    match values {
        SeriesValues::Float(v) => json!(v),
        SeriesValues::Int(v) => json!(v),
        SeriesValues::Text(v) => json!(v),
    }
}

pub fn stored_timeseries_json(stored: &StoredTimeseries) -> Value {
    let timestamps = stored
        .series
        .timestamps
        .as_ref()
        .map(|stamps| stamps.iter().map(timestamp_text).collect::<Vec<_>>());
    json!({
        "id": stored.id,
        "data_type": stored.data_type,
        "metadata": stored.metadata,
        "compressed": stored.compressed,
        "timestamps": timestamps,
        "values": series_values_json(&stored.series.values),
    })
}

pub fn yes_no(ok: bool) -> &'static str {
    if ok { "yes" } else { "no" }
}
