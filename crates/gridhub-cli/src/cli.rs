use crate::observability::LogFormat;
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "gridhub",
    about = "Gridhub: project-scoped network storage with variant overlays",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Clone, Debug)]
pub struct GlobalArgs {
    /// Path to the TOML config (missing file means defaults)
    #[arg(long, global = true, default_value = "gridhub.toml")]
    pub config: String,

    /// Override the config's data directory
    #[arg(long, global = true)]
    pub data_dir: Option<String>,

    /// User the command acts as; also the lock holder name
    #[arg(long, global = true, default_value = "local")]
    pub user: String,

    /// Act as a superuser (bypasses project roles)
    #[arg(long, global = true)]
    pub superuser: bool,

    /// Log output format (filtered by RUST_LOG)
    #[arg(long, global = true, value_enum, default_value = "pretty")]
    pub log_format: LogFormat,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create, list and delete projects
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },

    /// Acquire and release the project write lock
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },

    /// Store and load whole networks
    Net {
        #[command(subcommand)]
        command: NetCommands,
    },

    /// Declare and list variants of a network
    Variant {
        #[command(subcommand)]
        command: VariantCommands,
    },

    /// Read and edit single elements
    Element {
        #[command(subcommand)]
        command: ElementCommands,
    },

    /// Write and query timeseries
    Ts {
        #[command(subcommand)]
        command: TsCommands,
    },
}

#[derive(Subcommand, Clone, Debug)]
pub enum ProjectCommands {
    /// Create a project owned by the current user
    Create {
        /// Project name (unique within its realm)
        name: String,

        /// Optional realm the name is scoped to
        #[arg(long)]
        realm: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List projects visible to the current user
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete a project and all of its data
    Delete {
        /// Project id or name
        project: String,

        /// Confirm the deletion
        #[arg(long)]
        yes: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Clone, Debug)]
pub enum LockCommands {
    /// Take the project lock for the current user
    Acquire {
        /// Project id or name
        project: String,

        /// Lock lifetime in seconds (defaults to the configured TTL)
        #[arg(long)]
        ttl: Option<i64>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Give the lock back
    Release {
        /// Project id or name
        project: String,

        /// Clear the lock whoever holds it (owners only)
        #[arg(long)]
        force: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Extend the lock held by the current user
    Renew {
        /// Project id or name
        project: String,

        /// New lifetime in seconds
        #[arg(long)]
        ttl: Option<i64>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the current lock holder
    Status {
        /// Project id or name
        project: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Clone, Debug)]
pub enum NetCommands {
    /// Store a network read from a JSON file
    Store {
        /// Project id or name
        project: String,

        /// Network JSON file (`net_type`, `parameters`, `tables`)
        file: String,

        /// Network name
        #[arg(long)]
        name: String,

        /// Explicit network id
        #[arg(long)]
        net_id: Option<i64>,

        /// Replace an existing network with the same name or id
        #[arg(long)]
        overwrite: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Load a network, optionally as seen by one variant
    Load {
        /// Project id or name
        project: String,

        /// Network id
        net_id: i64,

        /// Variant index to resolve against
        #[arg(long)]
        variant: Option<i64>,

        /// Load only this kind (repeatable)
        #[arg(long = "only")]
        only: Vec<String>,

        /// Skip `res_*` result tables
        #[arg(long)]
        no_results: bool,

        /// Write the network JSON here instead of stdout
        #[arg(long)]
        output: Option<String>,
    },

    /// Load the buses matching every `--where` with their attached elements
    Subnet {
        /// Project id or name
        project: String,

        /// Network id
        net_id: i64,

        /// Bus attribute equality `name=value` (value parsed as JSON, else text)
        #[arg(long = "where", required = true)]
        conditions: Vec<String>,

        /// Variant index to resolve against
        #[arg(long)]
        variant: Option<i64>,

        /// Leave out branches reaching buses outside the selection
        #[arg(long)]
        interior: bool,

        /// Skip `res_*` result tables
        #[arg(long)]
        no_results: bool,

        /// Write the network JSON here instead of stdout
        #[arg(long)]
        output: Option<String>,
    },

    /// List stored networks
    List {
        /// Project id or name
        project: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete a network with its elements and variants
    Delete {
        /// Project id or name
        project: String,

        /// Network id
        net_id: i64,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Clone, Debug)]
pub enum VariantCommands {
    /// Declare a new variant of a network
    Create {
        /// Project id or name
        project: String,

        /// Network id
        net_id: i64,

        /// Variant name
        name: String,

        /// Variant description
        #[arg(long, default_value = "")]
        description: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the variants of a network
    List {
        /// Project id or name
        project: String,

        /// Network id
        net_id: i64,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Clone, Debug)]
pub enum ElementCommands {
    /// Record a change of an element in a variant
    Change {
        /// Project id or name
        project: String,

        /// Network id
        net_id: i64,

        /// Element kind (e.g. `bus`, `line`)
        kind: String,

        /// Element index
        index: i64,

        /// Variant index
        #[arg(long)]
        variant: i64,

        /// Attribute assignment `name=value` (value parsed as JSON, else text)
        #[arg(long = "set", required = true)]
        assignments: Vec<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Add a new element to a variant
    Add {
        /// Project id or name
        project: String,

        /// Network id
        net_id: i64,

        /// Element kind
        kind: String,

        /// Variant index
        #[arg(long)]
        variant: i64,

        /// Attribute assignment `name=value`
        #[arg(long = "set")]
        assignments: Vec<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete an element in a variant
    Delete {
        /// Project id or name
        project: String,

        /// Network id
        net_id: i64,

        /// Element kind
        kind: String,

        /// Element index
        index: i64,

        /// Variant index
        #[arg(long)]
        variant: i64,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Read all elements of one kind
    Read {
        /// Project id or name
        project: String,

        /// Network id
        net_id: i64,

        /// Element kind
        kind: String,

        /// Variant index to resolve against
        #[arg(long)]
        variant: Option<i64>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum SeriesKindArg {
    #[value(name = "float")]
    Float,
    #[value(name = "int")]
    Int,
    #[value(name = "text")]
    Text,
}

#[derive(Subcommand, Clone, Debug)]
pub enum TsCommands {
    /// Write one series from a JSON file (`values`, optional `timestamps`)
    Write {
        /// Project id or name
        project: String,

        /// Data type of the series (e.g. `p_mw`)
        data_type: String,

        /// Series JSON file
        file: String,

        /// Value type of the series
        #[arg(long, value_enum, default_value = "float")]
        kind: SeriesKindArg,

        /// Metadata entry `key=value`
        #[arg(long = "meta")]
        metadata: Vec<String>,

        /// Store the values as a compressed payload
        #[arg(long)]
        compress: bool,

        /// Timeseries collection (defaults to the configured one)
        #[arg(long)]
        collection: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Read exactly one series
    Read {
        /// Project id or name
        project: String,

        /// Data type of the series
        data_type: String,

        /// Metadata equality `key=value`
        #[arg(long = "meta")]
        metadata: Vec<String>,

        /// Timeseries collection
        #[arg(long)]
        collection: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List series metadata without their data
    List {
        /// Project id or name
        project: String,

        /// Restrict to one data type
        #[arg(long)]
        data_type: Option<String>,

        /// Timeseries collection
        #[arg(long)]
        collection: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}
