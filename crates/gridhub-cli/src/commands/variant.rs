use crate::cli::{GlobalArgs, VariantCommands};
use crate::support::{ok_or_exit, open_hub_or_exit, open_project_or_exit, print_json};
use gridhub_store::VariantRecord;
use serde_json::{Value, json};

pub fn run(global: &GlobalArgs, command: VariantCommands) {
    match command {
        VariantCommands::Create {
            project,
            net_id,
            name,
            description,
            json,
        } => run_create(global, project, net_id, name, description, json),
        VariantCommands::List {
            project,
            net_id,
            json,
        } => run_list(global, project, net_id, json),
    }
}

fn variant_json(record: &VariantRecord) -> Value {
    json!({
        "index": record.index,
        "netId": record.net_id,
        "name": record.name,
        "description": record.description,
        "createdAt": record.created_at
    })
}

fn run_create(
    global: &GlobalArgs,
    project: String,
    net_id: i64,
    name: String,
    description: String,
    json_output: bool,
) {
    let hub = open_hub_or_exit(global);
    let handle = open_project_or_exit(&hub, &project);
    let record = ok_or_exit(
        handle.create_variant(net_id, &name, &description),
        "failed to create variant",
    );

    if json_output {
        print_json(&json!({
            "action": "variant.create",
            "project": handle.id(),
            "variant": variant_json(&record)
        }));
    } else {
        println!(
            "gridhub variant create\n  Created: variant {} ({}) of net {net_id}",
            record.index, record.name
        );
    }
}

fn run_list(global: &GlobalArgs, project: String, net_id: i64, json_output: bool) {
    let hub = open_hub_or_exit(global);
    let handle = open_project_or_exit(&hub, &project);
    let records = ok_or_exit(handle.list_variants(net_id), "failed to list variants");

    if json_output {
        let items = records.iter().map(variant_json).collect::<Vec<_>>();
        print_json(&json!({
            "action": "variant.list",
            "project": handle.id(),
            "netId": net_id,
            "count": items.len(),
            "items": items
        }));
    } else {
        println!(
            "gridhub variant list\n  Net: {net_id}\n  Count: {}",
            records.len()
        );
        for record in &records {
            println!("  - {} {}", record.index, record.name);
        }
    }
}
