use crate::cli::CommandLineArgs;
use crate::error::ProcessingError;
use crate::store::MetadataStore;

use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Shared application state passed to each request handler.
pub struct AppState {
    /// Command line arguments.
    pub args: CommandLineArgs,

    /// Metadata store.
    pub store: MetadataStore,
}

impl AppState {
    /// Create and return an [AppState].
    ///
    /// Creates the data directory and opens the metadata store.
    pub fn new(args: &CommandLineArgs) -> Result<Self, ProcessingError> {
        std::fs::create_dir_all(&args.data_dir)?;
        let store = MetadataStore::open(Path::new(&args.db_path))?;
        Ok(Self {
            args: args.clone(),
            store,
        })
    }

    /// Create an [AppState] with an existing store.
    pub fn with_store(args: &CommandLineArgs, store: MetadataStore) -> Self {
        Self {
            args: args.clone(),
            store,
        }
    }

    /// Directory holding uploaded images and derived outputs.
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.args.data_dir)
    }
}

/// AppState wrapped in an Atomic Reference Count (Arc) to allow multiple references.
pub type SharedAppState = Arc<AppState>;
