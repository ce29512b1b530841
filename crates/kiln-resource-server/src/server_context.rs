use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kiln_resource::ResourceTypeRegistry;
use kiln_resource_compiler::CompilerRegistry;

use crate::Error;

/// Immutable wiring shared by every worker of the server.
///
/// Holds the configured data roots, the compiler worker executable location
/// and the startup-populated registries. Nothing here mutates after
/// construction except the exit flag, which only ever goes `false -> true`.
pub struct ResourceServerContext {
    source_data_path: PathBuf,
    compiled_data_path: PathBuf,
    compiler_worker_path: PathBuf,
    type_registry: Arc<ResourceTypeRegistry>,
    compiler_registry: Arc<CompilerRegistry>,
    is_exiting: AtomicBool,
}

impl ResourceServerContext {
    /// Creates a validated context.
    pub fn new(
        source_data_path: impl Into<PathBuf>,
        compiled_data_path: impl Into<PathBuf>,
        compiler_worker_path: impl Into<PathBuf>,
        type_registry: Arc<ResourceTypeRegistry>,
        compiler_registry: Arc<CompilerRegistry>,
    ) -> Result<Self, Error> {
        let source_data_path = source_data_path.into();
        let compiled_data_path = compiled_data_path.into();

        if !source_data_path.is_absolute() {
            return Err(Error::InvalidContext("source data path must be absolute"));
        }
        if !compiled_data_path.is_absolute() {
            return Err(Error::InvalidContext("compiled data path must be absolute"));
        }
        if compiler_registry.is_empty() {
            return Err(Error::InvalidContext("compiler registry is empty"));
        }
        if type_registry.is_empty() {
            return Err(Error::InvalidContext("type registry is empty"));
        }

        Ok(Self {
            source_data_path,
            compiled_data_path,
            compiler_worker_path: compiler_worker_path.into(),
            type_registry,
            compiler_registry,
            is_exiting: AtomicBool::new(false),
        })
    }

    /// Root of the source data directory.
    pub fn source_data_path(&self) -> &Path {
        &self.source_data_path
    }

    /// Root of the compiled output directory.
    pub fn compiled_data_path(&self) -> &Path {
        &self.compiled_data_path
    }

    /// Location of the compiler worker executable.
    pub fn compiler_worker_path(&self) -> &Path {
        &self.compiler_worker_path
    }

    /// The resource type registry.
    pub fn type_registry(&self) -> &ResourceTypeRegistry {
        &self.type_registry
    }

    /// The compiler registry.
    pub fn compiler_registry(&self) -> &CompilerRegistry {
        &self.compiler_registry
    }

    /// Whether the server is shutting down. Workers refuse new work once set.
    pub fn is_exiting(&self) -> bool {
        self.is_exiting.load(Ordering::Acquire)
    }

    /// Signals shutdown. Monotone: there is no way back.
    pub fn begin_exit(&self) {
        self.is_exiting.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kiln_resource::{ResourceType, ResourceTypeRegistryOptions};
    use kiln_resource_compiler::{CompilerDescriptor, CompilerRegistryOptions};

    use super::ResourceServerContext;
    use crate::Error;

    fn registries() -> (
        Arc<kiln_resource::ResourceTypeRegistry>,
        Arc<kiln_resource_compiler::CompilerRegistry>,
    ) {
        let types = ResourceTypeRegistryOptions::new()
            .add_type(ResourceType::new(b"anim"), "Animation Clip")
            .create();
        let compilers = CompilerRegistryOptions::new()
            .add_compiler(CompilerDescriptor::new(
                "animation",
                3,
                ResourceType::new(b"anim"),
            ))
            .create()
            .unwrap();
        (Arc::new(types), Arc::new(compilers))
    }

    #[test]
    fn exit_flag_is_monotone() {
        let (types, compilers) = registries();
        let context =
            ResourceServerContext::new("/data/raw", "/data/compiled", "/tools/worker", types, compilers)
                .unwrap();

        assert!(!context.is_exiting());
        context.begin_exit();
        assert!(context.is_exiting());
    }

    #[test]
    fn relative_roots_are_rejected() {
        let (types, compilers) = registries();
        let result = ResourceServerContext::new(
            "relative/raw",
            "/data/compiled",
            "/tools/worker",
            types,
            compilers,
        );
        assert!(matches!(result, Err(Error::InvalidContext(_))));
    }
}
