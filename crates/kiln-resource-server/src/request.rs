use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use kiln_resource::ResourceId;

use crate::server_context::ResourceServerContext;

/// Identifier of a compilation request, unique within a server run.
pub type RequestId = u64;

/// Where a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrigin {
    /// Explicitly requested by a connected client.
    UserRequested,
    /// Issued by the packaging process; the worker adds the packaging flag.
    Package,
    /// Issued by the server itself.
    Internal,
}

/// Lifecycle state of a request.
///
/// Transitions are monotone toward a terminal state:
/// `Pending -> UpToDateCheck -> { SucceededUpToDate | Compiling | Failed }`,
/// `Compiling -> { Succeeded | SucceededWithWarnings | Failed }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilationStatus {
    /// Queued, not yet picked up or waiting to enter the compile phase.
    Pending,
    /// The worker is deciding whether a compile pass is needed.
    UpToDateCheck,
    /// The compiler worker process is running.
    Compiling,
    /// Nothing to do - the persisted record matches the current inputs.
    SucceededUpToDate,
    /// Compiled cleanly.
    Succeeded,
    /// Compiled, but the compiler reported warnings.
    SucceededWithWarnings,
    /// Did not produce a usable artifact; the log explains why.
    Failed,
}

impl CompilationStatus {
    /// Whether this is a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::SucceededUpToDate | Self::Succeeded | Self::SucceededWithWarnings | Self::Failed
        )
    }

    /// Whether this is a terminal success state.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Self::SucceededUpToDate | Self::Succeeded | Self::SucceededWithWarnings
        )
    }
}

/// Wall-clock timing of the two request phases.
///
/// Fields are monotone non-decreasing in declaration order.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestTiming {
    /// Up-to-date check entry.
    pub up_to_date_check_started: Option<SystemTime>,
    /// Up-to-date check exit.
    pub up_to_date_check_finished: Option<SystemTime>,
    /// Compiler subprocess spawn.
    pub compile_started: Option<SystemTime>,
    /// Compiler subprocess teardown.
    pub compile_finished: Option<SystemTime>,
}

impl RequestTiming {
    /// Duration of the up-to-date check, once finished.
    pub fn up_to_date_check_duration(&self) -> Option<Duration> {
        duration_between(self.up_to_date_check_started, self.up_to_date_check_finished)
    }

    /// Duration of the compile phase, once finished.
    pub fn compile_duration(&self) -> Option<Duration> {
        duration_between(self.compile_started, self.compile_finished)
    }
}

fn duration_between(started: Option<SystemTime>, finished: Option<SystemTime>) -> Option<Duration> {
    match (started, finished) {
        (Some(started), Some(finished)) => finished.duration_since(started).ok(),
        _ => None,
    }
}

/// The unit of client-visible work: one resource to bring up to date.
///
/// A request is owned by exactly one worker while it is in flight. Once a
/// terminal status is reached the request is immutable except for reading.
#[derive(Debug, Clone)]
pub struct CompilationRequest {
    /// Request id, unique within a server run.
    pub id: RequestId,
    /// Where the request came from.
    pub origin: RequestOrigin,
    /// The resource to compile.
    pub resource_id: ResourceId,
    /// Location of the source descriptor.
    pub source_path: PathBuf,
    /// Location of the compiled artifact.
    pub destination_path: PathBuf,
    /// Argument string handed to the compiler worker process. Populated by
    /// the server before dispatch; non-empty by the time a compile starts.
    pub compiler_args: String,
    /// Lifecycle state.
    pub status: CompilationStatus,
    /// Accumulated diagnostics. On failure, contains at least one line
    /// explaining why.
    pub log: String,
    /// Phase timing.
    pub timing: RequestTiming,
    /// Compiler version copied from the dependency tree root.
    pub compiler_version: i32,
    /// Source timestamp copied from the dependency tree root.
    pub file_timestamp: u64,
    /// Combined hash copied from the dependency tree root.
    pub source_timestamp_hash: u64,

    force_recompile: bool,
}

impl CompilationRequest {
    pub(crate) fn new(
        id: RequestId,
        resource_id: ResourceId,
        origin: RequestOrigin,
        context: &ResourceServerContext,
    ) -> Self {
        let source_path = resource_id.source_file_path(context.source_data_path());
        let destination_path = resource_id.target_file_path(context.compiled_data_path());
        let compiler_args = resource_id.to_string();
        Self {
            id,
            origin,
            resource_id,
            source_path,
            destination_path,
            compiler_args,
            status: CompilationStatus::Pending,
            log: String::new(),
            timing: RequestTiming::default(),
            compiler_version: -1,
            file_timestamp: 0,
            source_timestamp_hash: 0,
            force_recompile: false,
        }
    }

    /// Whether the request reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the request reached a terminal success state.
    pub fn has_succeeded(&self) -> bool {
        self.status.is_success()
    }

    /// Whether the request failed.
    pub fn has_failed(&self) -> bool {
        self.status == CompilationStatus::Failed
    }

    /// Whether a compile pass must run even if the resource is up to date.
    pub fn requires_forced_recompilation(&self) -> bool {
        self.force_recompile
    }

    pub(crate) fn set_forced(&mut self) {
        self.force_recompile = true;
    }

    /// Appends one line of diagnostics.
    pub(crate) fn append_log(&mut self, line: impl AsRef<str>) {
        self.log.push_str(line.as_ref());
        if !self.log.ends_with('\n') {
            self.log.push('\n');
        }
    }

    pub(crate) fn transition(&mut self, status: CompilationStatus) {
        debug_assert!(
            !self.status.is_terminal(),
            "request {} already terminal", self.id
        );
        self.status = status;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    use kiln_resource::{ResourceId, ResourceType, ResourceTypeRegistryOptions};
    use kiln_resource_compiler::{CompilerDescriptor, CompilerRegistryOptions};

    use super::{CompilationRequest, CompilationStatus, RequestOrigin, RequestTiming};
    use crate::server_context::ResourceServerContext;

    fn test_context() -> ResourceServerContext {
        let types = Arc::new(
            ResourceTypeRegistryOptions::new()
                .add_type(ResourceType::new(b"anim"), "Animation Clip")
                .create(),
        );
        let compilers = Arc::new(
            CompilerRegistryOptions::new()
                .add_compiler(CompilerDescriptor::new(
                    "animation",
                    3,
                    ResourceType::new(b"anim"),
                ))
                .create()
                .unwrap(),
        );
        ResourceServerContext::new("/data/raw", "/data/compiled", "/tools/worker", types, compilers)
            .unwrap()
    }

    #[test]
    fn new_request_is_pending_with_populated_paths() {
        let context = test_context();
        let id = ResourceId::parse("chars/hero/run.anim").unwrap();
        let request = CompilationRequest::new(7, id, RequestOrigin::UserRequested, &context);

        assert_eq!(request.status, CompilationStatus::Pending);
        assert!(!request.is_complete());
        assert_eq!(request.compiler_args, "chars/hero/run.anim");
        assert!(request.source_path.starts_with("/data/raw"));
        assert!(request.destination_path.starts_with("/data/compiled"));
    }

    #[test]
    fn status_classification() {
        assert!(CompilationStatus::SucceededUpToDate.is_success());
        assert!(CompilationStatus::SucceededWithWarnings.is_success());
        assert!(CompilationStatus::Failed.is_terminal());
        assert!(!CompilationStatus::Failed.is_success());
        assert!(!CompilationStatus::Compiling.is_terminal());
        assert!(!CompilationStatus::UpToDateCheck.is_terminal());
    }

    #[test]
    fn timing_durations() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let timing = RequestTiming {
            up_to_date_check_started: Some(start),
            up_to_date_check_finished: Some(start + Duration::from_millis(5)),
            compile_started: Some(start + Duration::from_millis(5)),
            compile_finished: Some(start + Duration::from_millis(125)),
        };
        assert_eq!(
            timing.up_to_date_check_duration(),
            Some(Duration::from_millis(5))
        );
        assert_eq!(timing.compile_duration(), Some(Duration::from_millis(120)));

        let unfinished = RequestTiming {
            up_to_date_check_started: Some(start),
            ..RequestTiming::default()
        };
        assert_eq!(unfinished.up_to_date_check_duration(), None);
    }

    #[test]
    fn log_accumulates_lines() {
        let context = test_context();
        let id = ResourceId::parse("chars/hero/run.anim").unwrap();
        let mut request = CompilationRequest::new(1, id, RequestOrigin::Internal, &context);

        request.append_log("Error: first");
        request.append_log("Error: second\n");
        assert_eq!(request.log, "Error: first\nError: second\n");
    }
}
