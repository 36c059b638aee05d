//! Command Line Interface (CLI) arguments.

use crate::chunks::ChunkPolicy;
use crate::kmeans::KMeansParams;

use byte_unit::Byte;
use clap::Parser;

/// Hyperstack command line interface
#[derive(Clone, Debug, Parser)]
pub struct CommandLineArgs {
    /// The IP address on which the server should listen
    #[arg(long, default_value = "0.0.0.0", env = "HYPERSTACK_HOST")]
    pub host: String,
    /// The port to which the server should bind
    #[arg(long, default_value_t = 8080, env = "HYPERSTACK_PORT")]
    pub port: u16,
    /// Flag indicating whether HTTPS should be used
    #[arg(long, default_value_t = false, env = "HYPERSTACK_HTTPS")]
    pub https: bool,
    /// Path to the certificate file to be used for HTTPS encryption
    #[arg(
        long,
        default_value = "~/.config/hyperstack/certs/cert.pem",
        env = "HYPERSTACK_CERT_FILE"
    )]
    pub cert_file: String,
    /// Path to the key file to be used for HTTPS encryption
    #[arg(
        long,
        default_value = "~/.config/hyperstack/certs/key.pem",
        env = "HYPERSTACK_KEY_FILE"
    )]
    pub key_file: String,
    /// Maximum time in seconds to wait for operations to complete upon receiving `ctrl+c` signal.
    #[arg(long, default_value_t = 60, env = "HYPERSTACK_SHUTDOWN_TIMEOUT")]
    pub graceful_shutdown_timeout: u64,
    /// Whether to enable sending traces to Jaeger.
    #[arg(long, default_value_t = false, env = "HYPERSTACK_ENABLE_JAEGER")]
    pub enable_jaeger: bool,
    /// Whether to use Rayon for execution of CPU-bound tasks.
    #[arg(long, default_value_t = false, env = "HYPERSTACK_USE_RAYON")]
    pub use_rayon: bool,
    /// Number of threads in the Rayon pool. Defaults to the number of CPUs.
    #[arg(long, env = "HYPERSTACK_THREAD_LIMIT")]
    pub thread_limit: Option<usize>,
    /// Directory holding uploaded images and derived outputs
    #[arg(long, default_value = "data", env = "HYPERSTACK_DATA_DIR")]
    pub data_dir: String,
    /// Path to the metadata database
    #[arg(long, default_value = "data/image_data.db", env = "HYPERSTACK_DB_PATH")]
    pub db_path: String,
    /// Target in-memory size of a chunk, e.g. "128 MiB"
    #[arg(long, default_value = "128 MiB", env = "HYPERSTACK_CHUNK_SIZE")]
    pub chunk_size: String,
    /// Whether to reduce chunks in parallel on the Rayon pool
    #[arg(long, default_value_t = false, env = "HYPERSTACK_PARALLEL_CHUNKS")]
    pub parallel_chunks: bool,
    /// Maximum size of an uploaded file, e.g. "8 GiB"
    #[arg(long, default_value = "8 GiB", env = "HYPERSTACK_MAX_UPLOAD_SIZE")]
    pub max_upload_size: String,
    /// Number of k-means restarts
    #[arg(long, default_value_t = 10, env = "HYPERSTACK_KMEANS_RESTARTS")]
    pub kmeans_restarts: usize,
    /// Maximum number of iterations of each k-means run
    #[arg(long, default_value_t = 100, env = "HYPERSTACK_KMEANS_MAX_ITERATIONS")]
    pub kmeans_max_iterations: usize,
    /// K-means convergence threshold on centre movement
    #[arg(long, default_value_t = 0.2, env = "HYPERSTACK_KMEANS_EPSILON")]
    pub kmeans_epsilon: f64,
    /// Seed for k-means initialisation. Random if unset.
    #[arg(long, env = "HYPERSTACK_KMEANS_SEED")]
    pub kmeans_seed: Option<u64>,
}

/// Parse a human readable size such as "128 MiB" into bytes.
fn parse_size(size: &str) -> usize {
    let bytes = Byte::parse_str(size, /* ignore case */ true)
        .expect("Invalid size")
        .as_u64();
    usize::try_from(bytes).expect("Size does not fit in memory")
}

impl CommandLineArgs {
    /// Returns the chunking policy.
    pub fn chunk_policy(&self) -> ChunkPolicy {
        ChunkPolicy {
            target_bytes: parse_size(&self.chunk_size),
            parallel: self.parallel_chunks,
        }
    }

    /// Returns the maximum upload size in bytes.
    pub fn max_upload_bytes(&self) -> usize {
        parse_size(&self.max_upload_size)
    }

    /// Returns the k-means parameters.
    pub fn kmeans_params(&self) -> KMeansParams {
        KMeansParams {
            restarts: self.kmeans_restarts,
            max_iterations: self.kmeans_max_iterations,
            epsilon: self.kmeans_epsilon,
            seed: self.kmeans_seed,
        }
    }
}

/// Returns parsed command line arguments.
///
/// Size arguments are checked here so that invalid values fail at start-up.
pub fn parse() -> CommandLineArgs {
    let args = CommandLineArgs::parse();
    args.chunk_policy();
    args.max_upload_bytes();
    args
}
