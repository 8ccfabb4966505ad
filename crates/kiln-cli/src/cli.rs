use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "kiln",
    about = "kiln: cached, content-addressed analysis of file collections",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// More output; repeat for debug logging.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Configuration file (default: <root>/kiln.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the number of workers.
    #[arg(short = 'j', long, global = true)]
    pub workers: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Import files or directories
    Import(ImportArgs),
    /// Compute a module's results for OIDs or collections
    Run(RunArgs),
    /// Print a module's results, computing them if needed
    Show(ShowArgs),
    /// Create, list and edit collections
    Collection(CollectionArgs),
    /// Attach tags to OIDs
    Tag(TagArgs),
    /// Delete artifacts
    Drop(DropArgs),
    /// List modules or show one module's documentation
    Modules(ModulesArgs),
    /// Get or set configuration
    Config(ConfigArgs),
    /// Start the HTTP server
    Serve(ServeArgs),
}

#[derive(Args)]
pub struct ImportArgs {
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
    /// Also create a collection with this name over the imported files.
    #[arg(short, long)]
    pub collection: Option<String>,
    #[arg(long, default_value = "")]
    pub notes: String,
}

/// Targets are OID hex strings or collection names.
#[derive(Args)]
pub struct RunArgs {
    pub module: String,
    #[arg(required = true)]
    pub targets: Vec<String>,
    /// Module option as `name=value`; repeatable.
    #[arg(short = 'o', long = "opt")]
    pub opts: Vec<String>,
    /// Recompute even when cached.
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Args)]
pub struct ShowArgs {
    pub module: String,
    #[arg(required = true)]
    pub targets: Vec<String>,
    #[arg(short = 'o', long = "opt")]
    pub opts: Vec<String>,
    /// Print one field of the result.
    #[arg(long)]
    pub field: Option<String>,
    /// Read under a reader lock.
    #[arg(long)]
    pub lock: bool,
}

#[derive(Args)]
pub struct CollectionArgs {
    #[command(subcommand)]
    pub action: Option<CollectionAction>,
}

#[derive(Subcommand)]
pub enum CollectionAction {
    /// List collections
    List,
    /// Create a collection
    Create {
        name: String,
        #[arg(required = true)]
        oids: Vec<String>,
        #[arg(long, default_value = "")]
        notes: String,
    },
    /// Delete a collection
    Delete { name: String },
    /// Rename a collection
    Rename { old: String, new: String },
    /// Remove members from a collection
    Prune {
        name: String,
        #[arg(required = true)]
        oids: Vec<String>,
    },
    /// List a collection's members
    Members { name: String },
}

#[derive(Args)]
pub struct TagArgs {
    #[command(subcommand)]
    pub action: TagAction,
}

#[derive(Subcommand)]
pub enum TagAction {
    /// Set a tag; the value is parsed as JSON, falling back to a string
    Set { oid: String, tag: String, value: String },
    /// Show an OID's tags
    Get { oid: String },
    /// Remove a tag
    Remove { oid: String, tag: String },
    /// List OIDs carrying a tag
    Find { tag: String },
}

#[derive(Args)]
pub struct DropArgs {
    #[command(subcommand)]
    pub action: DropAction,
}

#[derive(Subcommand)]
pub enum DropAction {
    /// Remove an OID everywhere, including from collections
    Oid { oid: String },
    /// Delete every artifact of a module
    Module { module: String },
    /// Delete one artifact
    Artifact {
        module: String,
        oid: String,
        #[arg(short = 'o', long = "opt")]
        opts: Vec<String>,
    },
}

#[derive(Args)]
pub struct ModulesArgs {
    /// Show this module's documentation.
    pub name: Option<String>,
    /// Only modules of this kind.
    #[arg(long)]
    pub kind: Option<String>,
}

#[derive(Args)]
pub struct ConfigArgs {
    pub key: Option<String>,
    pub value: Option<String>,
}

#[derive(Args)]
pub struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:7341")]
    pub bind: String,
    /// Refuse DELETE requests.
    #[arg(long)]
    pub no_flush: bool,
}
