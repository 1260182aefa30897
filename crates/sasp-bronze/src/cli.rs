//! Command-line interface definition

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// SASP bronze ingestion - archive raw API payloads into Postgres
#[derive(Parser, Debug)]
#[command(name = "sasp-bronze")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Endpoints file (YAML)
    #[arg(long, env = "SASP_ENDPOINTS_FILE", global = true)]
    pub endpoints: Option<PathBuf>,

    /// Concurrent fetch workers
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Maximum requests in flight
    #[arg(long, global = true)]
    pub max_concurrent: Option<usize>,

    /// Maximum requests per minute
    #[arg(long, global = true)]
    pub rate_limit: Option<usize>,

    /// Payloads per database commit
    #[arg(long, global = true)]
    pub batch_size: Option<usize>,

    /// Keep everything in memory; no database is touched
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ingest every identifier in an inclusive range
    Range {
        #[command(flatten)]
        target: FamilyArgs,

        /// First identifier
        #[arg(long)]
        start: i64,

        /// Last identifier (inclusive)
        #[arg(long)]
        end: i64,

        /// Skip identifiers already archived for this family
        #[arg(long)]
        skip_archived: bool,
    },

    /// Ingest an explicit list of identifiers
    Ids {
        #[command(flatten)]
        target: FamilyArgs,

        /// Comma-separated identifiers
        #[arg(long, value_delimiter = ',', required_unless_present = "from_family", conflicts_with = "from_family")]
        ids: Vec<i64>,

        /// Take identifiers from the archived listing payloads of another family
        #[arg(long)]
        from_family: Option<String>,

        /// Skip identifiers already archived for this family
        #[arg(long)]
        skip_archived: bool,
    },

    /// Ingest a paginated listing
    Pages {
        /// Resource family
        #[arg(short, long)]
        family: String,

        /// Any page URL of the listing (defaults to the configured one)
        #[arg(long)]
        url: Option<String>,

        /// Page ceiling when the listing reports no page count
        #[arg(long)]
        max_pages: Option<u32>,

        /// Request every page up to the ceiling
        #[arg(long)]
        force_full_pages: bool,
    },

    /// Fetch every configured example URL once
    Endpoints {
        /// Only this family
        #[arg(short, long)]
        family: Option<String>,
    },

    /// Show resource health records
    Health {
        /// Only this family
        #[arg(short, long)]
        family: Option<String>,

        /// Only permanently unavailable targets
        #[arg(long)]
        permanent_only: bool,

        /// Maximum records to show
        #[arg(short, long, default_value = "200")]
        limit: i64,
    },

    /// Apply database migrations
    Migrate,
}

#[derive(Args, Debug)]
pub struct FamilyArgs {
    /// Resource family
    #[arg(short, long)]
    pub family: String,

    /// URL template with one `{}` placeholder (defaults to the configured one)
    #[arg(short, long)]
    pub template: Option<String>,
}
