use crate::cli::{GlobalArgs, LockCommands};
use crate::support::{
    fail, ok_or_exit, open_hub_or_exit, open_project_or_exit, print_json, yes_no,
};
use chrono::Utc;
use gridhub_store::{LockOutcome, LockRecord, ReleaseOutcome, RenewOutcome};
use serde_json::{Value, json};

pub fn run(global: &GlobalArgs, command: LockCommands) {
    match command {
        LockCommands::Acquire { project, ttl, json } => run_acquire(global, project, ttl, json),
        LockCommands::Release {
            project,
            force,
            json,
        } => run_release(global, project, force, json),
        LockCommands::Renew { project, ttl, json } => run_renew(global, project, ttl, json),
        LockCommands::Status { project, json } => run_status(global, project, json),
    }
}

fn record_json(record: &LockRecord) -> Value {
    json!({
        "holder": record.holder,
        "active": record.is_active(Utc::now()),
        "acquiredAt": record.acquired_at,
        "renewedAt": record.renewed_at,
        "expiresAt": record.expires_at
    })
}

fn run_acquire(global: &GlobalArgs, project: String, ttl: Option<i64>, json_output: bool) {
    let hub = open_hub_or_exit(global);
    let handle = open_project_or_exit(&hub, &project);
    let outcome = ok_or_exit(handle.acquire_lock(ttl), "failed to acquire lock");

    let (state, record) = match &outcome {
        LockOutcome::Acquired(record) => ("acquired", record),
        LockOutcome::AlreadyHeld(record) => ("already_held", record),
        LockOutcome::Denied { holder } => {
            fail(format!("project {} is locked by {holder}", handle.id()))
        }
    };

    if json_output {
        print_json(&json!({
            "action": "lock.acquire",
            "project": handle.id(),
            "state": state,
            "lock": record_json(record)
        }));
    } else {
        println!(
            "gridhub lock acquire\n  Project: {}\n  State: {state}\n  Expires: {}",
            handle.id(),
            record.expires_at.as_deref().unwrap_or("never")
        );
    }
}

fn run_release(global: &GlobalArgs, project: String, force: bool, json_output: bool) {
    let hub = open_hub_or_exit(global);
    let handle = open_project_or_exit(&hub, &project);

    let released = if force {
        ok_or_exit(handle.force_release_lock(), "failed to force-release lock")
    } else {
        match ok_or_exit(handle.release_lock(), "failed to release lock") {
            ReleaseOutcome::Released => true,
            ReleaseOutcome::Denied { holder: Some(holder) } => {
                fail(format!("project {} is locked by {holder}", handle.id()))
            }
            ReleaseOutcome::Denied { holder: None } => false,
        }
    };

    if json_output {
        print_json(&json!({
            "action": "lock.release",
            "project": handle.id(),
            "forced": force,
            "released": released
        }));
    } else if released {
        println!("gridhub lock release\n  Released: {}", handle.id());
    } else {
        println!("gridhub lock release\n  No lock held on {}", handle.id());
    }
}

fn run_renew(global: &GlobalArgs, project: String, ttl: Option<i64>, json_output: bool) {
    let hub = open_hub_or_exit(global);
    let handle = open_project_or_exit(&hub, &project);

    let record = match ok_or_exit(handle.renew_lock(ttl), "failed to renew lock") {
        RenewOutcome::Renewed(record) => record,
        RenewOutcome::Denied { holder: Some(holder) } => {
            fail(format!("project {} is locked by {holder}", handle.id()))
        }
        RenewOutcome::Denied { holder: None } => {
            fail(format!("no lock held on project {}", handle.id()))
        }
    };

    if json_output {
        print_json(&json!({
            "action": "lock.renew",
            "project": handle.id(),
            "lock": record_json(&record)
        }));
    } else {
        println!(
            "gridhub lock renew\n  Project: {}\n  Expires: {}",
            handle.id(),
            record.expires_at.as_deref().unwrap_or("never")
        );
    }
}

fn run_status(global: &GlobalArgs, project: String, json_output: bool) {
    let hub = open_hub_or_exit(global);
    let handle = open_project_or_exit(&hub, &project);
    let status = ok_or_exit(handle.lock_status(), "failed to read lock");

    if json_output {
        print_json(&json!({
            "action": "lock.status",
            "project": handle.id(),
            "locked": status.is_some(),
            "lock": status.as_ref().map(record_json)
        }));
    } else {
        match &status {
            Some(record) => println!(
                "gridhub lock status\n  Project: {}\n  Holder: {}\n  Expires: {}\n  Active: {}",
                handle.id(),
                record.holder,
                record.expires_at.as_deref().unwrap_or("never"),
                yes_no(record.is_active(Utc::now()))
            ),
            None => println!("gridhub lock status\n  Project: {}\n  Unlocked", handle.id()),
        }
    }
}
