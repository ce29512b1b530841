use std::path::PathBuf;
use std::sync::Arc;

use kiln_resource::ResourceTypeRegistry;
use kiln_resource_compiler::CompilerRegistry;

use crate::record_store::CompiledResourceDb;
use crate::server::ResourceServer;
use crate::server_context::ResourceServerContext;
use crate::Error;

/// Options and flags used by [`ResourceServer`].
///
/// Call [`ResourceServerOptions::new`] with the configured data roots and the
/// compiler worker executable, chain option setters, then [`create`] the
/// server with the startup-populated registries.
///
/// [`create`]: Self::create
pub struct ResourceServerOptions {
    source_data_path: PathBuf,
    compiled_data_path: PathBuf,
    compiler_worker_path: PathBuf,
    record_db_path: Option<PathBuf>,
    worker_count: usize,
}

impl ResourceServerOptions {
    /// Workers spawned when [`Self::worker_count`] is not called.
    pub const DEFAULT_WORKER_COUNT: usize = 4;

    /// Creates options with the mandatory paths.
    pub fn new(
        source_data_path: impl Into<PathBuf>,
        compiled_data_path: impl Into<PathBuf>,
        compiler_worker_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source_data_path: source_data_path.into(),
            compiled_data_path: compiled_data_path.into(),
            compiler_worker_path: compiler_worker_path.into(),
            record_db_path: None,
            worker_count: Self::DEFAULT_WORKER_COUNT,
        }
    }

    /// Sets the size of the worker pool. Clamped to at least one.
    #[must_use]
    pub fn worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Overrides the record database location. Defaults to
    /// `compiled-resources.db3` under the compiled data root.
    #[must_use]
    pub fn record_db_path(mut self, record_db_path: impl Into<PathBuf>) -> Self {
        self.record_db_path = Some(record_db_path.into());
        self
    }

    /// Creates the server: validates the context, opens the record store and
    /// spawns the worker pool.
    pub async fn create(
        self,
        type_registry: Arc<ResourceTypeRegistry>,
        compiler_registry: Arc<CompilerRegistry>,
    ) -> Result<ResourceServer, Error> {
        let context = Arc::new(ResourceServerContext::new(
            self.source_data_path,
            self.compiled_data_path,
            self.compiler_worker_path,
            type_registry,
            compiler_registry,
        )?);

        tokio::fs::create_dir_all(context.compiled_data_path())
            .await
            .map_err(|e| {
                Error::DestinationUnavailable(context.compiled_data_path().to_path_buf(), e)
            })?;

        let db_path = self
            .record_db_path
            .unwrap_or_else(|| context.compiled_data_path().join("compiled-resources.db3"));
        let db = Arc::new(CompiledResourceDb::open(&db_path).await?);

        Ok(ResourceServer::start(context, db, self.worker_count))
    }
}
