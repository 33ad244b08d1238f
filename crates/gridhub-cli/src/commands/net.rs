use crate::cli::{GlobalArgs, NetCommands};
use crate::support::{
    fail, network_from_file_or_exit, network_to_json, ok_or_exit, open_hub_or_exit,
    open_project_or_exit, parse_assignment_or_exit, print_json,
};
use gridhub_store::{
    Filter, LoadOptions, Network, StoreNetworkRequest, SubnetRequest, VariantContext,
};
use serde_json::json;
use std::fs;

pub fn run(global: &GlobalArgs, command: NetCommands) {
    match command {
        NetCommands::Store {
            project,
            file,
            name,
            net_id,
            overwrite,
            json,
        } => run_store(global, project, file, name, net_id, overwrite, json),
        NetCommands::Load {
            project,
            net_id,
            variant,
            only,
            no_results,
            output,
        } => {
            let mut options = LoadOptions::default();
            if !only.is_empty() {
                options = options.only(only);
            }
            if no_results {
                options = options.without_results();
            }
            run_load(global, project, net_id, variant, &options, output)
        }
        NetCommands::Subnet {
            project,
            net_id,
            conditions,
            variant,
            interior,
            no_results,
            output,
        } => {
            let buses = Filter::and(conditions.iter().map(|raw| {
                let (field, value) = parse_assignment_or_exit(raw);
                Filter::eq(field, value)
            }));
            let mut request = SubnetRequest::new(buses);
            if interior {
                request = request.interior_only();
            }
            if no_results {
                request = request.without_results();
            }
            run_subnet(global, project, net_id, variant, &request, output)
        }
        NetCommands::List { project, json } => run_list(global, project, json),
        NetCommands::Delete {
            project,
            net_id,
            json,
        } => run_delete(global, project, net_id, json),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_store(
    global: &GlobalArgs,
    project: String,
    file: String,
    name: String,
    net_id: Option<i64>,
    overwrite: bool,
    json_output: bool,
) {
    let network = network_from_file_or_exit(&file);
    let hub = open_hub_or_exit(global);
    let handle = open_project_or_exit(&hub, &project);

    let mut request = StoreNetworkRequest::new(name.clone());
    if let Some(net_id) = net_id {
        request = request.with_net_id(net_id);
    }
    if overwrite {
        request = request.overwrite();
    }
    let stored_id = ok_or_exit(
        handle.store_network(&network, &request),
        "failed to store network",
    );
    let kinds: Vec<&String> = network.tables.keys().collect();

    if json_output {
        print_json(&json!({
            "action": "net.store",
            "project": handle.id(),
            "netId": stored_id,
            "name": name,
            "kinds": kinds
        }));
    } else {
        println!(
            "gridhub net store\n  Stored: {name} as net {stored_id}\n  Kinds: {}",
            kinds
                .iter()
                .map(|kind| kind.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
}

fn run_load(
    global: &GlobalArgs,
    project: String,
    net_id: i64,
    variant: Option<i64>,
    options: &LoadOptions,
    output: Option<String>,
) {
    let hub = open_hub_or_exit(global);
    let handle = open_project_or_exit(&hub, &project);
    let network = ok_or_exit(
        handle.load_network_with(net_id, &VariantContext::from(variant), options),
        "failed to load network",
    );
    emit_network("gridhub net load", &network, output);
}

fn run_subnet(
    global: &GlobalArgs,
    project: String,
    net_id: i64,
    variant: Option<i64>,
    request: &SubnetRequest,
    output: Option<String>,
) {
    let hub = open_hub_or_exit(global);
    let handle = open_project_or_exit(&hub, &project);
    let network = ok_or_exit(
        handle.load_subnet(net_id, &VariantContext::from(variant), request),
        "failed to load subnet",
    );
    emit_network("gridhub net subnet", &network, output);
}

fn emit_network(heading: &str, network: &Network, output: Option<String>) {
    let payload = network_to_json(network);
    let text = serde_json::to_string_pretty(&payload).expect("json serialization");

    match output {
        Some(path) => {
            if let Err(e) = fs::write(&path, text) {
                fail(format!("failed to write {path}: {e}"));
            }
            eprintln!("{heading}\n  Wrote: {path}");
        }
        None => println!("{text}"),
    }
}

fn run_list(global: &GlobalArgs, project: String, json_output: bool) {
    let hub = open_hub_or_exit(global);
    let handle = open_project_or_exit(&hub, &project);
    let entries = ok_or_exit(handle.list_networks(), "failed to list networks");

    if json_output {
        let items = entries
            .iter()
            .map(|entry| {
                json!({
                    "netId": entry.net_id,
                    "name": entry.name,
                    "netType": entry.net_type,
                    "kinds": entry.kinds,
                    "formatVersion": entry.format_version,
                    "storedAt": entry.stored_at
                })
            })
            .collect::<Vec<_>>();
        print_json(&json!({
            "action": "net.list",
            "project": handle.id(),
            "count": items.len(),
            "items": items
        }));
    } else {
        println!(
            "gridhub net list\n  Project: {}\n  Count: {}",
            handle.id(),
            entries.len()
        );
        for entry in &entries {
            println!(
                "  - {} {} [{}]",
                entry.net_id,
                entry.name,
                entry.kinds.join(", ")
            );
        }
    }
}

fn run_delete(global: &GlobalArgs, project: String, net_id: i64, json_output: bool) {
    let hub = open_hub_or_exit(global);
    let handle = open_project_or_exit(&hub, &project);
    ok_or_exit(handle.delete_network(net_id), "failed to delete network");

    if json_output {
        print_json(&json!({
            "action": "net.delete",
            "project": handle.id(),
            "netId": net_id
        }));
    } else {
        println!("gridhub net delete\n  Deleted: net {net_id}");
    }
}
