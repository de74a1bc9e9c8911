use clap::{Parser, Subcommand};

/// Seamless - content-addressed transformation cache
///
/// Computes transformations once and looks their results up by checksum
/// afterwards. Results and buffers persist in the cache directory and,
/// when configured, in a database and on buffer servers.
#[derive(Parser, Debug)]
#[command(name = "seamless")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Content-addressed transformation cache", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonConfigArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Configuration overrides shared by all commands
#[derive(Parser, Debug, Clone, Default)]
pub struct CommonConfigArgs {
    /// Config file path
    #[arg(short = 'c', long, global = true, env = "SEAMLESS_CONFIG")]
    pub config: Option<String>,

    /// Cache directory for buffers and results
    #[arg(long, global = true, env = "SEAMLESS_CACHE_DIR")]
    pub cache_dir: Option<String>,

    /// Database service URL
    #[arg(long, global = true, env = "SEAMLESS_DATABASE")]
    pub database: Option<String>,

    /// Buffer server URL(s), comma-separated; the first one is also written to
    #[arg(long, global = true, env = "SEAMLESS_BUFFER_SERVER", value_delimiter = ',')]
    pub buffer_server: Option<Vec<String>>,

    /// Read-only buffer folder(s), comma-separated
    #[arg(long, global = true, env = "SEAMLESS_BUFFER_FOLDER", value_delimiter = ',')]
    pub buffer_folder: Option<Vec<String>>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the checksum of a file
    Checksum(ChecksumArgs),

    /// Run a transformation dict and print its result checksum
    Run(RunArgs),

    /// Obtain a buffer, recomputing it if needed, and write it to stdout
    Fingertip(ChecksumTarget),

    /// Show the status of a transformation
    Status(ChecksumTarget),

    /// Forget the result of a transformation
    Undo(ChecksumTarget),

    /// Forget the recorded exception of a transformation
    ClearException(ChecksumTarget),
}

#[derive(Parser, Debug)]
pub struct ChecksumArgs {
    /// File to hash
    pub file: String,
}

#[derive(Parser, Debug)]
pub struct ChecksumTarget {
    /// Checksum, as 64 hex characters
    pub checksum: String,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Transformation dict (JSON file)
    pub transformation: String,

    /// Run even if the result is known, to regenerate its buffer
    #[arg(long)]
    pub fingertip: bool,

    /// Keep the result buffer in memory only
    #[arg(long)]
    pub scratch: bool,

    /// Print the result value instead of its checksum
    #[arg(long)]
    pub value: bool,
}
