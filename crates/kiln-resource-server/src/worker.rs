use std::sync::Arc;
use std::time::SystemTime;

use kiln_resource_compiler::compiler_cmd::{
    CompileExitStatus, CompilerCmdError, CompilerCompileCmd,
};
use tracing::{info, warn};

use crate::dependency_tree::CompileDependencyTree;
use crate::record_store::{CompiledRecord, CompiledResourceDb};
use crate::request::{CompilationRequest, CompilationStatus, RequestOrigin};
use crate::server_context::ResourceServerContext;
use crate::Error;

/// A pool member that owns one request at a time and may spawn a compiler
/// worker process.
///
/// Processing has two phases. The up-to-date check validates the request,
/// builds the compile dependency tree and short-circuits when the persisted
/// record still matches the current inputs. The compile phase launches the
/// external compiler, maps its exit code onto the request status and, on
/// success, upserts the compiled record - without that write a subsequent
/// request would recompile unnecessarily.
pub struct ResourceServerWorker {
    context: Arc<ResourceServerContext>,
    db: Arc<CompiledResourceDb>,
}

impl ResourceServerWorker {
    /// Creates a worker over the shared context and record store.
    pub fn new(context: Arc<ResourceServerContext>, db: Arc<CompiledResourceDb>) -> Self {
        Self { context, db }
    }

    /// Processes `request` to a terminal status.
    pub async fn process(&self, request: &mut CompilationRequest) {
        debug_assert!(request.status == CompilationStatus::Pending);

        self.perform_up_to_date_check(request).await;

        if !request.is_complete() {
            self.compile(request).await;
        }
    }

    /// The check phase. Short-circuits to `Failed` on the first problem, to
    /// `SucceededUpToDate` when no compile pass is needed, and leaves the
    /// request `Pending` otherwise.
    async fn perform_up_to_date_check(&self, request: &mut CompilationRequest) {
        request.transition(CompilationStatus::UpToDateCheck);

        // Check compiler.
        let compiler = self
            .context
            .compiler_registry()
            .find_compiler(request.resource_id.kind());
        let compiler = match compiler {
            Some(compiler) => compiler,
            None => {
                let error = Error::NoCompiler(request.resource_id.kind());
                self.fail(request, error);
                return;
            }
        };

        // File validity check.
        let source_exists = tokio::fs::metadata(&request.source_path).await.is_ok();
        if compiler.input_file_required && !source_exists {
            let error = Error::MissingInput(request.source_path.clone());
            self.fail(request, error);
            return;
        }

        // Try create target dir.
        if let Some(parent) = request.destination_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                let error = Error::DestinationUnavailable(parent.to_path_buf(), e);
                self.fail(request, error);
                return;
            }
        }

        // Check that the target file is not read-only.
        if let Ok(metadata) = tokio::fs::metadata(&request.destination_path).await {
            if metadata.permissions().readonly() {
                let error = Error::DestinationReadOnly(request.destination_path.clone());
                self.fail(request, error);
                return;
            }
        }

        // Check compile dependencies and whether this resource needs
        // compilation.
        request.timing.up_to_date_check_started = Some(SystemTime::now());
        match CompileDependencyTree::build(&self.context, &self.db, &request.resource_id).await {
            Ok(tree) => {
                let root = tree.root();
                request.compiler_version = root.compiler_version;
                request.file_timestamp = root.timestamp;
                request.source_timestamp_hash = root.combined_hash;
                request.transition(if tree.is_up_to_date() {
                    CompilationStatus::SucceededUpToDate
                } else {
                    CompilationStatus::Pending
                });
            }
            Err(e) => self.fail(request, e),
        }
        request.timing.up_to_date_check_finished = Some(SystemTime::now());

        // Force compilation.
        if request.has_succeeded() && request.requires_forced_recompilation() {
            request.status = CompilationStatus::Pending;
        }
    }

    /// The compile phase: spawn the compiler worker, wait, fold its combined
    /// output into the request log and map the exit code onto a status.
    async fn compile(&self, request: &mut CompilationRequest) {
        debug_assert!(!request.compiler_args.is_empty());
        request.transition(CompilationStatus::Compiling);

        let command = CompilerCompileCmd::new(
            self.context.compiler_worker_path(),
            &request.compiler_args,
            request.origin == RequestOrigin::Package,
        );

        request.timing.compile_started = Some(SystemTime::now());
        let output = command.execute().await;
        request.timing.compile_finished = Some(SystemTime::now());

        let output = match output {
            Ok(output) => output,
            Err(CompilerCmdError::StartFailed(e)) => {
                self.fail(request, Error::SubprocessStartFailed(e));
                return;
            }
            Err(CompilerCmdError::JoinFailed(e)) => {
                self.fail(request, Error::SubprocessJoinFailed(e));
                return;
            }
        };

        if !output.log.is_empty() {
            request.append_log(&output.log);
        }

        let status = match output.status {
            CompileExitStatus::Success => CompilationStatus::Succeeded,
            CompileExitStatus::SuccessWithWarnings => CompilationStatus::SucceededWithWarnings,
            CompileExitStatus::Failed { exit_code } => {
                self.fail(request, Error::CompilerFailed(exit_code));
                return;
            }
        };

        // The record write happens before the request turns terminal; a
        // store failure downgrades to a log line and the next run recompiles.
        self.write_record(request).await;
        request.transition(status);
        info!(
            "compiled '{}' ({:?})",
            request.resource_id, status
        );
    }

    /// Surfaces `error` on the request: one explanatory log line and a
    /// failed status. Nothing here is fatal to the server.
    fn fail(&self, request: &mut CompilationRequest, error: Error) {
        warn!(
            "request {} for '{}' failed: {}",
            request.id, request.resource_id, error
        );
        request.append_log(error.to_string());
        request.transition(CompilationStatus::Failed);
    }

    async fn write_record(&self, request: &mut CompilationRequest) {
        let record = CompiledRecord {
            resource_id: request.resource_id.clone(),
            compiler_version: request.compiler_version,
            file_timestamp: request.file_timestamp,
            source_timestamp_hash: request.source_timestamp_hash,
        };
        if let Err(e) = self.db.put(&record).await {
            warn!(
                "failed to persist compiled record for '{}': {}",
                request.resource_id, e
            );
            request.append_log(format!("Warning: failed to persist compiled record: {}", e));
        }
    }
}
