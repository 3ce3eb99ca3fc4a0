use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "regstore",
    about = "Inspect and maintain an S3-backed package registry",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Host config file containing a `[store.s3-storage]` table
    #[arg(short, long, global = true, default_value = "regstore.toml")]
    pub config: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// List, add, or forget package names in the registry index
    Packages(PackagesArgs),
    /// Read or replace the registry secret
    Secret(SecretArgs),
    /// Read, write, or delete a package metadata document
    Meta(MetaArgs),
    /// Upload, download, or delete package tarballs
    Tarball(TarballArgs),
    /// Delete every stored object of a package and forget it
    Purge(PurgeArgs),
}

#[derive(Args)]
pub struct PackagesArgs {
    #[command(subcommand)]
    pub action: Option<PackagesAction>,
}

#[derive(Subcommand)]
pub enum PackagesAction {
    /// Show every known package (default)
    List,
    Add { name: String },
    Remove { name: String },
}

#[derive(Args)]
pub struct SecretArgs {
    #[command(subcommand)]
    pub action: SecretAction,
}

#[derive(Subcommand)]
pub enum SecretAction {
    Get,
    Set { value: String },
    /// Store a fresh random secret
    Generate {
        #[arg(long, default_value = "32")]
        bytes: usize,
    },
}

#[derive(Args)]
pub struct MetaArgs {
    #[command(subcommand)]
    pub action: MetaAction,
}

#[derive(Subcommand)]
pub enum MetaAction {
    Get {
        package: String,
    },
    /// Store a JSON document read from a file, or `-` for stdin
    Put {
        package: String,
        source: String,
        /// Refuse to overwrite an existing document
        #[arg(long)]
        create: bool,
    },
    Rm {
        package: String,
    },
}

#[derive(Args)]
pub struct TarballArgs {
    #[command(subcommand)]
    pub action: TarballAction,
}

#[derive(Subcommand)]
pub enum TarballAction {
    /// Upload a local file; fails if the tarball already exists
    Put {
        package: String,
        file: PathBuf,
        /// Stored file name; defaults to the local file name
        #[arg(long)]
        name: Option<String>,
    },
    Get {
        package: String,
        name: String,
        /// Write here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    Rm {
        package: String,
        name: String,
    },
    /// Print a pre-signed URL
    Url {
        package: String,
        name: String,
        /// Sign for upload instead of download
        #[arg(long)]
        put: bool,
    },
}

#[derive(Args)]
pub struct PurgeArgs {
    pub package: String,
    /// Leave the package listed in the index
    #[arg(long)]
    pub keep_index: bool,
}
