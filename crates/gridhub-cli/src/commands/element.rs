use crate::cli::{ElementCommands, GlobalArgs};
use crate::support::{
    fail, ok_or_exit, open_hub_or_exit, open_project_or_exit, print_json,
    row_from_assignments_or_exit, table_to_json,
};
use gridhub_store::VariantContext;
use gridhub_table::encode_cell;
use serde_json::json;

pub fn run(global: &GlobalArgs, command: ElementCommands) {
    match command {
        ElementCommands::Change {
            project,
            net_id,
            kind,
            index,
            variant,
            assignments,
            json,
        } => run_change(
            global,
            Target {
                project,
                net_id,
                kind,
            },
            index,
            variant,
            assignments,
            json,
        ),
        ElementCommands::Add {
            project,
            net_id,
            kind,
            variant,
            assignments,
            json,
        } => run_add(
            global,
            Target {
                project,
                net_id,
                kind,
            },
            variant,
            assignments,
            json,
        ),
        ElementCommands::Delete {
            project,
            net_id,
            kind,
            index,
            variant,
            json,
        } => run_delete(
            global,
            Target {
                project,
                net_id,
                kind,
            },
            index,
            variant,
            json,
        ),
        ElementCommands::Read {
            project,
            net_id,
            kind,
            variant,
            json,
        } => run_read(
            global,
            Target {
                project,
                net_id,
                kind,
            },
            variant,
            json,
        ),
    }
}

struct Target {
    project: String,
    net_id: i64,
    kind: String,
}

fn run_change(
    global: &GlobalArgs,
    target: Target,
    index: i64,
    variant: i64,
    assignments: Vec<String>,
    json_output: bool,
) {
    let partial = row_from_assignments_or_exit(&assignments);
    let hub = open_hub_or_exit(global);
    let handle = open_project_or_exit(&hub, &target.project);
    ok_or_exit(
        handle.write_change(target.net_id, &target.kind, variant, index, &partial),
        "failed to write change",
    );

    if json_output {
        let attributes: serde_json::Map<String, serde_json::Value> = partial
            .iter()
            .map(|(name, cell)| (name.clone(), encode_cell(cell)))
            .collect();
        print_json(&json!({
            "action": "element.change",
            "project": handle.id(),
            "netId": target.net_id,
            "kind": target.kind,
            "index": index,
            "variant": variant,
            "attributes": attributes
        }));
    } else {
        println!(
            "gridhub element change\n  Changed: {} {index} in variant {variant} ({} attributes)",
            target.kind,
            partial.len()
        );
    }
}

fn run_add(
    global: &GlobalArgs,
    target: Target,
    variant: i64,
    assignments: Vec<String>,
    json_output: bool,
) {
    let attributes = row_from_assignments_or_exit(&assignments);
    let hub = open_hub_or_exit(global);
    let handle = open_project_or_exit(&hub, &target.project);
    let created = ok_or_exit(
        handle.create_elements(
            target.net_id,
            &target.kind,
            variant,
            std::slice::from_ref(&attributes),
        ),
        "failed to add element",
    );
    let Some(&index) = created.first() else {
        fail("no element was added");
    };

    if json_output {
        print_json(&json!({
            "action": "element.add",
            "project": handle.id(),
            "netId": target.net_id,
            "kind": target.kind,
            "variant": variant,
            "index": index
        }));
    } else {
        println!(
            "gridhub element add\n  Added: {} {index} in variant {variant}",
            target.kind
        );
    }
}

fn run_delete(global: &GlobalArgs, target: Target, index: i64, variant: i64, json_output: bool) {
    let hub = open_hub_or_exit(global);
    let handle = open_project_or_exit(&hub, &target.project);
    ok_or_exit(
        handle.delete_element(target.net_id, &target.kind, variant, index),
        "failed to delete element",
    );

    if json_output {
        print_json(&json!({
            "action": "element.delete",
            "project": handle.id(),
            "netId": target.net_id,
            "kind": target.kind,
            "variant": variant,
            "index": index
        }));
    } else {
        println!(
            "gridhub element delete\n  Deleted: {} {index} in variant {variant}",
            target.kind
        );
    }
}

fn run_read(global: &GlobalArgs, target: Target, variant: Option<i64>, json_output: bool) {
    let hub = open_hub_or_exit(global);
    let handle = open_project_or_exit(&hub, &target.project);
    let table = ok_or_exit(
        handle.read_elements(target.net_id, &target.kind, &VariantContext::from(variant)),
        "failed to read elements",
    );
    let rows = table_to_json(&table);

    if json_output {
        print_json(&json!({
            "action": "element.read",
            "project": handle.id(),
            "netId": target.net_id,
            "kind": target.kind,
            "variant": variant,
            "columns": table.columns(),
            "count": rows.len(),
            "rows": rows
        }));
    } else {
        println!(
            "gridhub element read\n  Kind: {}\n  Count: {}",
            target.kind,
            rows.len()
        );
        for row in &rows {
            println!("  - {row}");
        }
    }
}
