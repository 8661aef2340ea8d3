use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use wellsync_core::{ConflictResolution, OperationKind, Priority};

#[derive(Parser)]
#[command(name = "wellsync")]
#[command(about = "Offline-first cache and sync engine operator tool")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to the local state database
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// CLI profile name holding remote settings
    #[arg(long, global = true, value_name = "NAME")]
    pub profile: Option<String>,

    /// Treat the remote store as unreachable
    #[arg(long, global = true)]
    pub offline: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply a write: directly when online, queued in the log otherwise
    Write {
        /// Target table
        table: String,
        /// Operation kind
        #[arg(value_enum)]
        kind: KindArg,
        /// Row as JSON (a bare id is enough for delete)
        payload: String,
        /// Cache priority for the optimistic row
        #[arg(long, value_enum, default_value_t = PriorityArg::Medium)]
        priority: PriorityArg,
    },
    /// Record an operation in the log without touching the remote
    Record {
        /// Target table
        table: String,
        /// Operation kind
        #[arg(value_enum)]
        kind: KindArg,
        /// Row as JSON (a bare id is enough for delete)
        payload: String,
    },
    /// List operations waiting to be replayed
    Pending {
        /// Only show operations for this table
        #[arg(long)]
        table: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Replay pending operations against the remote store
    Drain {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove operations that were already synced
    Prune,
    /// Inspect and manage the read cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Run one sync cycle
    Sync {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the periodic coordinator in the foreground until interrupted
    Watch {
        /// Override the sync interval in milliseconds
        #[arg(long, value_name = "MS")]
        interval_ms: Option<u64>,
    },
    /// Show sync health
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show or change configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Print cached rows of a table
    Get {
        table: String,
        /// Include expired rows
        #[arg(long)]
        include_stale: bool,
        /// Output entries with freshness as JSON
        #[arg(long)]
        json: bool,
    },
    /// Replace a table's cached rows with a JSON array
    Put {
        table: String,
        /// JSON array of rows
        rows: String,
        #[arg(long, value_enum, default_value_t = PriorityArg::Medium)]
        priority: PriorityArg,
        /// Time-to-live in milliseconds (cache default when omitted)
        #[arg(long, value_name = "MS")]
        ttl_ms: Option<u64>,
    },
    /// Read rows through the cache, fetching from the remote when needed
    Fetch {
        table: String,
        /// Only these row ids
        #[arg(long, value_delimiter = ',')]
        ids: Vec<String>,
        #[arg(long, value_enum, default_value_t = PriorityArg::Medium)]
        priority: PriorityArg,
        #[arg(long, value_name = "MS")]
        ttl_ms: Option<u64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove expired entries
    Evict,
    /// Show cache statistics
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Drop every cached entry
    Clear,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the sync configuration
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Update the sync configuration
    Set {
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long, value_name = "MS")]
        interval_ms: Option<u64>,
        #[arg(long)]
        priority_sync: Option<bool>,
        #[arg(long, value_enum)]
        conflict_resolution: Option<ConflictArg>,
    },
    /// Initialize or update a remote profile
    Init {
        /// Profile name to initialize
        #[arg(long, value_name = "NAME")]
        profile: Option<String>,
        /// Backend project URL
        #[arg(long, value_name = "URL")]
        rest_url: Option<String>,
        /// Public API key
        #[arg(long, value_name = "KEY")]
        api_key: Option<String>,
        /// Optional user access token
        #[arg(long, value_name = "TOKEN")]
        access_token: Option<String>,
        /// Column holding row ids
        #[arg(long, value_name = "COLUMN")]
        id_column: Option<String>,
        /// Keep current active profile instead of activating this one
        #[arg(long)]
        no_activate: bool,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KindArg {
    Insert,
    Update,
    Delete,
}

impl From<KindArg> for OperationKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Insert => Self::Insert,
            KindArg::Update => Self::Update,
            KindArg::Delete => Self::Delete,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum PriorityArg {
    High,
    Medium,
    Low,
}

impl From<PriorityArg> for Priority {
    fn from(value: PriorityArg) -> Self {
        match value {
            PriorityArg::High => Self::High,
            PriorityArg::Medium => Self::Medium,
            PriorityArg::Low => Self::Low,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ConflictArg {
    ClientWins,
    ServerWins,
    Merge,
}

impl From<ConflictArg> for ConflictResolution {
    fn from(value: ConflictArg) -> Self {
        match value {
            ConflictArg::ClientWins => Self::ClientWins,
            ConflictArg::ServerWins => Self::ServerWins,
            ConflictArg::Merge => Self::Merge,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
