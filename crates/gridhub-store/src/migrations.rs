//! Network format migrations.
//!
//! Each step upgrades a loaded network by one format version. Steps are pure
//! table transformations and idempotent: running one on an already migrated
//! network leaves it unchanged.

use crate::network::Network;
use gridhub_table::{CellValue, Table};

pub const NETWORK_FORMAT_VERSION: u32 = 3;

type Step = fn(&mut Network);

/// `(from_version, step)` in ascending order.
const STEPS: &[(u32, Step)] = &[(1, rename_gen_reactive_limits), (2, add_line_conductance)];

/// Apply every step from `stored_version` up to [`NETWORK_FORMAT_VERSION`].
/// Returns the number of steps applied.
pub fn migrate(network: &mut Network, stored_version: u32) -> usize {
    let mut applied = 0;
    for (from, step) in STEPS {
        if *from >= stored_version {
            step(network);
            applied += 1;
            tracing::debug!(from = *from, to = *from + 1, "applied network migration");
        }
    }
    applied
}

/// Move `from` into `to`, keeping any value already present in `to`.
fn merge_column(table: &mut Table, from: &str, to: &str) {
    if !table.has_column(from) {
        return;
    }
    if !table.has_column(to) {
        table.rename_column(from, to);
        return;
    }
    let moved: Vec<(i64, CellValue)> = table
        .rows()
        .filter(|(_, row)| row.get(to).is_none_or(CellValue::is_missing))
        .filter_map(|(index, row)| row.get(from).map(|value| (index, value.clone())))
        .collect();
    for (index, value) in moved {
        table.set(index, to, value);
    }
    table.drop_column(from);
}

/// v1 → v2: generator reactive limits were named `qmax_mvar`/`qmin_mvar`.
fn rename_gen_reactive_limits(network: &mut Network) {
    if let Some(table) = network.tables.get_mut("gen") {
        merge_column(table, "qmax_mvar", "max_q_mvar");
        merge_column(table, "qmin_mvar", "min_q_mvar");
    }
}

/// v2 → v3: lines gained a shunt conductance, zero for older data.
fn add_line_conductance(network: &mut Network) {
    let Some(table) = network.tables.get_mut("line") else {
        return;
    };
    table.add_column("g_us_per_km");
    let unset: Vec<i64> = table
        .rows()
        .filter(|(_, row)| row.get("g_us_per_km").is_none_or(CellValue::is_missing))
        .map(|(index, _)| index)
        .collect();
    for index in unset {
        table.set(index, "g_us_per_km", CellValue::Float(0.0));
    }
}
