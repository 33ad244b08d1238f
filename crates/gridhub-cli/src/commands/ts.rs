use crate::cli::{GlobalArgs, SeriesKindArg, TsCommands};
use crate::support::{
    fail, metadata_from_assignments_or_exit, ok_or_exit, open_hub_or_exit, open_project_or_exit,
    print_json, read_json_file_or_exit, stored_timeseries_json, yes_no,
};
use chrono::{DateTime, Utc};
use gridhub_store::{SeriesValues, Timeseries, TimeseriesQuery, TimeseriesWrite};
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Deserialize)]
struct SeriesFile {
    #[serde(default)]
    timestamps: Option<Vec<DateTime<Utc>>>,
    values: Vec<Value>,
}

pub fn run(global: &GlobalArgs, command: TsCommands) {
    match command {
        TsCommands::Write {
            project,
            data_type,
            file,
            kind,
            metadata,
            compress,
            collection,
            json,
        } => run_write(
            global,
            WriteArgs {
                project,
                data_type,
                file,
                kind,
                metadata,
                compress,
                collection,
            },
            json,
        ),
        TsCommands::Read {
            project,
            data_type,
            metadata,
            collection,
            json,
        } => run_read(global, project, data_type, metadata, collection, json),
        TsCommands::List {
            project,
            data_type,
            collection,
            json,
        } => run_list(global, project, data_type, collection, json),
    }
}

struct WriteArgs {
    project: String,
    data_type: String,
    file: String,
    kind: SeriesKindArg,
    metadata: Vec<String>,
    compress: bool,
    collection: Option<String>,
}

fn bad_value(position: usize, expected: &str) -> ! {
    fail(format!("values[{position}] is not {expected}"))
}

fn series_values_or_exit(values: Vec<Value>, kind: SeriesKindArg) -> SeriesValues {
    match kind {
        SeriesKindArg::Float => SeriesValues::Float(
            values
                .iter()
                .enumerate()
                .map(|(i, v)| match v {
                    Value::Null => f64::NAN,
                    other => other.as_f64().unwrap_or_else(|| bad_value(i, "a number")),
                })
                .collect(),
        ),
        SeriesKindArg::Int => SeriesValues::Int(
            values
                .iter()
                .enumerate()
                .map(|(i, v)| v.as_i64().unwrap_or_else(|| bad_value(i, "an integer")))
                .collect(),
        ),
        SeriesKindArg::Text => SeriesValues::Text(
            values
                .into_iter()
                .enumerate()
                .map(|(i, v)| match v {
                    Value::String(s) => s,
                    _ => bad_value(i, "a string"),
                })
                .collect(),
        ),
    }
}

fn run_write(global: &GlobalArgs, args: WriteArgs, json_output: bool) {
    let file: SeriesFile = read_json_file_or_exit(&args.file, "series");
    let values = series_values_or_exit(file.values, args.kind);
    let series = match file.timestamps {
        Some(timestamps) => Timeseries::timestamped(timestamps, values),
        None => Timeseries::array(values),
    };
    let mut write = TimeseriesWrite::new(args.data_type.clone(), series);
    write.metadata = metadata_from_assignments_or_exit(&args.metadata);
    if args.compress {
        write = write.compressed();
    }

    let hub = open_hub_or_exit(global);
    let handle = open_project_or_exit(&hub, &args.project);
    let id = ok_or_exit(
        handle.write_timeseries(args.collection.as_deref(), &write),
        "failed to write timeseries",
    );

    if json_output {
        print_json(&json!({
            "action": "ts.write",
            "project": handle.id(),
            "id": id,
            "dataType": args.data_type,
            "points": write.series.len(),
            "compressed": args.compress
        }));
    } else {
        println!(
            "gridhub ts write\n  Wrote: {} ({} points)\n  Id: {id}",
            args.data_type,
            write.series.len()
        );
    }
}

fn run_read(
    global: &GlobalArgs,
    project: String,
    data_type: String,
    metadata: Vec<String>,
    collection: Option<String>,
    json_output: bool,
) {
    let mut query = TimeseriesQuery::data_type(data_type);
    for (field, value) in metadata_from_assignments_or_exit(&metadata) {
        query = query.where_eq(field, value);
    }

    let hub = open_hub_or_exit(global);
    let handle = open_project_or_exit(&hub, &project);
    let stored = ok_or_exit(
        handle.read_timeseries(collection.as_deref(), &query),
        "failed to read timeseries",
    );
    let payload = stored_timeseries_json(&stored);

    if json_output {
        print_json(&json!({
            "action": "ts.read",
            "project": handle.id(),
            "series": payload
        }));
    } else {
        println!(
            "gridhub ts read\n  Id: {}\n  Type: {} ({})\n  Points: {}\n  Compressed: {}",
            stored.id,
            stored.data_type,
            stored.series.values.type_name(),
            stored.series.len(),
            yes_no(stored.compressed)
        );
    }
}

fn run_list(
    global: &GlobalArgs,
    project: String,
    data_type: Option<String>,
    collection: Option<String>,
    json_output: bool,
) {
    let query = match data_type {
        Some(data_type) => TimeseriesQuery::data_type(data_type),
        None => TimeseriesQuery::default(),
    };
    let hub = open_hub_or_exit(global);
    let handle = open_project_or_exit(&hub, &project);
    let documents = ok_or_exit(
        handle.timeseries_metadata(collection.as_deref(), &query),
        "failed to list timeseries",
    );

    if json_output {
        print_json(&json!({
            "action": "ts.list",
            "project": handle.id(),
            "count": documents.len(),
            "items": documents
        }));
    } else {
        println!("gridhub ts list\n  Count: {}", documents.len());
        for document in &documents {
            println!(
                "  - {} {} ({} points)",
                document.get("_id").and_then(Value::as_str).unwrap_or("?"),
                document
                    .get("data_type")
                    .and_then(Value::as_str)
                    .unwrap_or("?"),
                document
                    .get("num_timestamps")
                    .and_then(Value::as_u64)
                    .unwrap_or(0)
            );
        }
    }
}
