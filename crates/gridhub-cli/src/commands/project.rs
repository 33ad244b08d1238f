use crate::cli::{GlobalArgs, ProjectCommands};
use crate::support::{fail, ok_or_exit, open_hub_or_exit, open_project_or_exit, print_json};
use serde_json::json;

pub fn run(global: &GlobalArgs, command: ProjectCommands) {
    match command {
        ProjectCommands::Create { name, realm, json } => run_create(global, name, realm, json),
        ProjectCommands::List { json } => run_list(global, json),
        ProjectCommands::Delete { project, yes, json } => run_delete(global, project, yes, json),
    }
}

fn run_create(global: &GlobalArgs, name: String, realm: Option<String>, json_output: bool) {
    let hub = open_hub_or_exit(global);
    let project = ok_or_exit(
        hub.create_project(&name, realm.as_deref()),
        "failed to create project",
    );
    let record = project.record();

    if json_output {
        print_json(&json!({
            "action": "project.create",
            "project": {
                "id": record.id,
                "name": record.name,
                "realm": record.realm,
                "owner": global.user,
                "createdAt": record.created_at
            }
        }));
    } else {
        println!(
            "gridhub project create\n  Created: {} ({})\n  Owner: {}",
            record.name, record.id, global.user
        );
    }
}

fn run_list(global: &GlobalArgs, json_output: bool) {
    let hub = open_hub_or_exit(global);
    let records = ok_or_exit(hub.list_projects(), "failed to list projects");

    if json_output {
        let items = records
            .iter()
            .map(|record| {
                json!({
                    "id": record.id,
                    "name": record.name,
                    "realm": record.realm,
                    "role": record.role_of(&global.user),
                    "version": record.version
                })
            })
            .collect::<Vec<_>>();
        print_json(&json!({
            "action": "project.list",
            "count": items.len(),
            "items": items
        }));
    } else {
        println!("gridhub project list\n  Count: {}", records.len());
        for record in &records {
            let realm = record.realm.as_deref().unwrap_or("-");
            println!("  - {} {} [realm {realm}]", record.id, record.name);
        }
    }
}

fn run_delete(global: &GlobalArgs, project: String, yes: bool, json_output: bool) {
    if !yes {
        fail("refusing to delete a project without --yes");
    }
    let hub = open_hub_or_exit(global);
    let id = open_project_or_exit(&hub, &project).id().to_string();
    ok_or_exit(hub.delete_project(&id, true), "failed to delete project");

    if json_output {
        print_json(&json!({
            "action": "project.delete",
            "id": id
        }));
    } else {
        println!("gridhub project delete\n  Deleted: {id}");
    }
}
