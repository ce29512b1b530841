use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kiln_resource::{ResourceId, ResourceType, ResourceTypeRegistryOptions};
use kiln_resource_compiler::{CompilerDescriptor, CompilerRegistryOptions};
use tokio::sync::broadcast;

use crate::descriptor::ResourceDescriptor;
use crate::request::{CompilationRequest, CompilationStatus, RequestId, RequestOrigin};
use crate::server::{ResourceServer, ResourceServerEvent};
use crate::{Error, ResourceServerOptions};

const ANIM: ResourceType = ResourceType::new(b"anim");
const TEX: ResourceType = ResourceType::new(b"tex");
const GEN: ResourceType = ResourceType::new(b"gen");

async fn start_server(work_dir: &Path, anim_version: i32, worker_path: &Path) -> ResourceServer {
    std::fs::create_dir_all(work_dir.join("raw")).unwrap();

    let types = Arc::new(
        ResourceTypeRegistryOptions::new()
            .add_type(ANIM, "Animation Clip")
            .add_type(TEX, "Texture")
            .add_type(GEN, "Generated Data")
            .create(),
    );
    let compilers = Arc::new(
        CompilerRegistryOptions::new()
            .add_compiler(CompilerDescriptor::new("animation", anim_version, ANIM))
            .add_compiler(CompilerDescriptor::new("texture", 1, TEX))
            .add_compiler(CompilerDescriptor::new("generated", 1, GEN).without_input_file())
            .create()
            .unwrap(),
    );

    ResourceServerOptions::new(work_dir.join("raw"), work_dir.join("compiled"), worker_path)
        .worker_count(2)
        .record_db_path(work_dir.join("records.db3"))
        .create(types, compilers)
        .await
        .unwrap()
}

fn write_source(server: &ResourceServer, id: &ResourceId, descriptor: &ResourceDescriptor) {
    let path = id.source_file_path(server.context().source_data_path());
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, descriptor.to_json()).unwrap();
}

async fn wait_for(
    events: &mut broadcast::Receiver<ResourceServerEvent>,
    request_id: RequestId,
) -> Arc<CompilationRequest> {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match events.recv().await {
                Ok(ResourceServerEvent::RequestCompleted { request })
                    if request.id == request_id =>
                {
                    return request;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("request did not complete in time")
}

#[cfg(unix)]
struct FakeWorker {
    path: std::path::PathBuf,
    invocations: std::path::PathBuf,
}

#[cfg(unix)]
impl FakeWorker {
    /// Writes a stand-in compiler worker script. It records each invocation,
    /// writes the compiled artifact for the requested logical path under the
    /// output root, then runs `behavior` (extra output and the exit code).
    fn new(work_dir: &Path, behavior: &str) -> Self {
        use std::os::unix::fs::PermissionsExt;

        let invocations = work_dir.join("invocations.log");
        let output_root = work_dir.join("compiled");
        let script = format!(
            "#!/bin/sh\n\
             echo \"$2\" >> \"{invocations}\"\n\
             out=\"{output}/$2\"\n\
             mkdir -p \"$(dirname \"$out\")\"\n\
             echo compiled > \"$out\"\n\
             {behavior}\n",
            invocations = invocations.display(),
            output = output_root.display(),
            behavior = behavior,
        );
        let path = work_dir.join("worker.sh");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self { path, invocations }
    }

    fn invocation_count(&self) -> usize {
        std::fs::read_to_string(&self.invocations)
            .map(|log| log.lines().count())
            .unwrap_or(0)
    }
}

#[cfg(unix)]
mod with_subprocess {
    use super::*;

    #[tokio::test]
    async fn first_compile_succeeds_and_stores_record() {
        let work_dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(work_dir.path(), "exit 0");
        let server = start_server(work_dir.path(), 3, &worker.path).await;

        let id = ResourceId::parse("chars/hero/run.anim").unwrap();
        write_source(&server, &id, &ResourceDescriptor::new());

        let mut events = server.subscribe();
        let request_id = server.submit(id.clone(), RequestOrigin::UserRequested).await.unwrap();
        let request = wait_for(&mut events, request_id).await;

        assert_eq!(request.status, CompilationStatus::Succeeded);
        assert!(id.target_file_path(server.context().compiled_data_path()).exists());

        let record = server.record_db().get(&id).await.unwrap().unwrap();
        assert_eq!(record.compiler_version, 3);
        assert_ne!(record.file_timestamp, 0);
        // no dependencies: the combined hash is the source timestamp
        assert_eq!(record.source_timestamp_hash, record.file_timestamp);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn second_request_is_up_to_date_and_spawns_nothing() {
        let work_dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(work_dir.path(), "exit 0");
        let server = start_server(work_dir.path(), 3, &worker.path).await;

        let id = ResourceId::parse("chars/hero/run.anim").unwrap();
        write_source(&server, &id, &ResourceDescriptor::new());

        let mut events = server.subscribe();
        let first = server.submit(id.clone(), RequestOrigin::UserRequested).await.unwrap();
        wait_for(&mut events, first).await;
        let record_before = server.record_db().get(&id).await.unwrap().unwrap();

        let second = server.submit(id.clone(), RequestOrigin::UserRequested).await.unwrap();
        let request = wait_for(&mut events, second).await;

        assert_eq!(request.status, CompilationStatus::SucceededUpToDate);
        assert_eq!(worker.invocation_count(), 1);
        let record_after = server.record_db().get(&id).await.unwrap().unwrap();
        assert_eq!(record_before, record_after);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn warning_exit_code_succeeds_with_warnings() {
        let work_dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(work_dir.path(), "echo warning: downsampled; exit 1");
        let server = start_server(work_dir.path(), 3, &worker.path).await;

        let id = ResourceId::parse("tex/logo.tex").unwrap();
        write_source(&server, &id, &ResourceDescriptor::new());

        let mut events = server.subscribe();
        let request_id = server.submit(id.clone(), RequestOrigin::UserRequested).await.unwrap();
        let request = wait_for(&mut events, request_id).await;

        assert_eq!(request.status, CompilationStatus::SucceededWithWarnings);
        assert!(request.log.contains("warning: downsampled"));
        assert!(server.record_db().get(&id).await.unwrap().is_some());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn failure_exit_code_fails_without_record() {
        let work_dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(work_dir.path(), "echo error: bad input 1>&2; exit 3");
        let server = start_server(work_dir.path(), 3, &worker.path).await;

        let id = ResourceId::parse("chars/hero/run.anim").unwrap();
        write_source(&server, &id, &ResourceDescriptor::new());

        let mut events = server.subscribe();
        let request_id = server.submit(id.clone(), RequestOrigin::UserRequested).await.unwrap();
        let request = wait_for(&mut events, request_id).await;

        assert_eq!(request.status, CompilationStatus::Failed);
        assert!(request.log.contains("error: bad input"));
        assert!(request.log.contains("exited with code"));
        assert!(server.record_db().get(&id).await.unwrap().is_none());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn missing_worker_binary_fails_to_start() {
        let work_dir = tempfile::tempdir().unwrap();
        let server = start_server(work_dir.path(), 3, &work_dir.path().join("no-worker")).await;

        let id = ResourceId::parse("chars/hero/run.anim").unwrap();
        write_source(&server, &id, &ResourceDescriptor::new());

        let mut events = server.subscribe();
        let request_id = server.submit(id, RequestOrigin::UserRequested).await.unwrap();
        let request = wait_for(&mut events, request_id).await;

        assert_eq!(request.status, CompilationStatus::Failed);
        assert!(request.log.contains("Resource compiler failed to start"));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn forced_recompilation_demotes_up_to_date() {
        let work_dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(work_dir.path(), "exit 0");
        let server = start_server(work_dir.path(), 3, &worker.path).await;

        let id = ResourceId::parse("chars/hero/run.anim").unwrap();
        write_source(&server, &id, &ResourceDescriptor::new());

        let mut events = server.subscribe();
        let first = server.submit(id.clone(), RequestOrigin::UserRequested).await.unwrap();
        wait_for(&mut events, first).await;

        let forced = server.submit_forced(id, RequestOrigin::UserRequested).await.unwrap();
        let request = wait_for(&mut events, forced).await;

        assert_eq!(request.status, CompilationStatus::Succeeded);
        assert_eq!(worker.invocation_count(), 2);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn package_origin_adds_package_flag() {
        let work_dir = tempfile::tempdir().unwrap();
        // the script echoes its third argument so the log captures the flag
        let worker = FakeWorker::new(work_dir.path(), "echo \"flag:$3\"; exit 0");
        let server = start_server(work_dir.path(), 3, &worker.path).await;

        let id = ResourceId::parse("chars/hero/run.anim").unwrap();
        write_source(&server, &id, &ResourceDescriptor::new());

        let mut events = server.subscribe();
        let request_id = server.submit(id, RequestOrigin::Package).await.unwrap();
        let request = wait_for(&mut events, request_id).await;

        assert!(request.has_succeeded());
        assert!(request.log.contains("flag:-package"));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn generated_resource_compiles_without_source() {
        let work_dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(work_dir.path(), "exit 0");
        let server = start_server(work_dir.path(), 3, &worker.path).await;

        let id = ResourceId::parse("gen/lighting.gen").unwrap();

        let mut events = server.subscribe();
        let request_id = server.submit(id.clone(), RequestOrigin::Internal).await.unwrap();
        let request = wait_for(&mut events, request_id).await;

        assert_eq!(request.status, CompilationStatus::Succeeded);
        let record = server.record_db().get(&id).await.unwrap().unwrap();
        assert_eq!(record.file_timestamp, 0);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn timing_fields_are_ordered() {
        let work_dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(work_dir.path(), "exit 0");
        let server = start_server(work_dir.path(), 3, &worker.path).await;

        let id = ResourceId::parse("chars/hero/run.anim").unwrap();
        write_source(&server, &id, &ResourceDescriptor::new());

        let mut events = server.subscribe();
        let request_id = server.submit(id, RequestOrigin::UserRequested).await.unwrap();
        let request = wait_for(&mut events, request_id).await;

        let timing = &request.timing;
        let check_started = timing.up_to_date_check_started.unwrap();
        let check_finished = timing.up_to_date_check_finished.unwrap();
        let compile_started = timing.compile_started.unwrap();
        let compile_finished = timing.compile_finished.unwrap();
        assert!(check_started <= check_finished);
        assert!(check_finished <= compile_started);
        assert!(compile_started <= compile_finished);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn compiler_version_bump_forces_recompile() {
        let work_dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(work_dir.path(), "exit 0");
        let id = ResourceId::parse("chars/hero/run.anim").unwrap();

        {
            let server = start_server(work_dir.path(), 3, &worker.path).await;
            write_source(&server, &id, &ResourceDescriptor::new());
            let mut events = server.subscribe();
            let request_id = server.submit(id.clone(), RequestOrigin::UserRequested).await.unwrap();
            wait_for(&mut events, request_id).await;
            server.shutdown().await;
        }

        let server = start_server(work_dir.path(), 4, &worker.path).await;
        let mut events = server.subscribe();
        let request_id = server.submit(id.clone(), RequestOrigin::UserRequested).await.unwrap();
        let request = wait_for(&mut events, request_id).await;

        assert_eq!(request.status, CompilationStatus::Succeeded);
        assert_eq!(worker.invocation_count(), 2);
        let record = server.record_db().get(&id).await.unwrap().unwrap();
        assert_eq!(record.compiler_version, 4);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_submissions_coalesce() {
        let work_dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(work_dir.path(), "sleep 1; exit 0");
        let server = start_server(work_dir.path(), 3, &worker.path).await;

        let id = ResourceId::parse("chars/hero/run.anim").unwrap();
        write_source(&server, &id, &ResourceDescriptor::new());

        let mut events = server.subscribe();
        let first = server.submit(id.clone(), RequestOrigin::UserRequested).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = server.submit(id.clone(), RequestOrigin::UserRequested).await.unwrap();
        assert_eq!(first, second);

        let request = wait_for(&mut events, first).await;
        assert!(request.has_succeeded());
        assert_eq!(worker.invocation_count(), 1);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn distinct_resources_compile_concurrently() {
        let work_dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(work_dir.path(), "exit 0");
        let server = start_server(work_dir.path(), 3, &worker.path).await;

        let mut events = server.subscribe();
        let mut request_ids = vec![];
        for i in 0..8 {
            let id = ResourceId::parse(format!("chars/batch/clip_{}.anim", i)).unwrap();
            write_source(&server, &id, &ResourceDescriptor::new());
            request_ids.push(server.submit(id, RequestOrigin::Internal).await.unwrap());
        }

        for request_id in request_ids {
            let request = wait_for(&mut events, request_id).await;
            assert_eq!(request.status, CompilationStatus::Succeeded);
        }
        assert_eq!(worker.invocation_count(), 8);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_work() {
        let work_dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(work_dir.path(), "sleep 1; exit 0");
        let server = start_server(work_dir.path(), 3, &worker.path).await;

        let id = ResourceId::parse("chars/hero/run.anim").unwrap();
        write_source(&server, &id, &ResourceDescriptor::new());

        let target = id.target_file_path(server.context().compiled_data_path());
        server.submit(id, RequestOrigin::UserRequested).await.unwrap();
        // give a worker time to pick the request up before shutting down
        tokio::time::sleep(Duration::from_millis(200)).await;
        server.shutdown().await;

        assert!(target.exists());
        assert_eq!(worker.invocation_count(), 1);
    }
}

#[tokio::test]
async fn unknown_type_fails_without_filesystem_writes() {
    let work_dir = tempfile::tempdir().unwrap();
    let server = start_server(work_dir.path(), 3, &work_dir.path().join("no-worker")).await;

    let id = ResourceId::parse("foo/data.blob").unwrap();
    let mut events = server.subscribe();
    let request_id = server.submit(id.clone(), RequestOrigin::UserRequested).await.unwrap();
    let request = wait_for(&mut events, request_id).await;

    assert_eq!(request.status, CompilationStatus::Failed);
    assert!(request.log.contains("No compiler found"));
    assert!(!id
        .target_file_path(server.context().compiled_data_path())
        .parent()
        .unwrap()
        .exists());

    server.shutdown().await;
}

#[tokio::test]
async fn missing_required_input_fails() {
    let work_dir = tempfile::tempdir().unwrap();
    let server = start_server(work_dir.path(), 3, &work_dir.path().join("no-worker")).await;

    let id = ResourceId::parse("chars/hero/never_authored.anim").unwrap();
    let mut events = server.subscribe();
    let request_id = server.submit(id, RequestOrigin::UserRequested).await.unwrap();
    let request = wait_for(&mut events, request_id).await;

    assert_eq!(request.status, CompilationStatus::Failed);
    assert!(request.log.contains("Source file"));

    server.shutdown().await;
}

#[tokio::test]
async fn read_only_destination_fails() {
    let work_dir = tempfile::tempdir().unwrap();
    let server = start_server(work_dir.path(), 3, &work_dir.path().join("no-worker")).await;

    let id = ResourceId::parse("chars/hero/run.anim").unwrap();
    write_source(&server, &id, &ResourceDescriptor::new());

    let target = id.target_file_path(server.context().compiled_data_path());
    std::fs::create_dir_all(target.parent().unwrap()).unwrap();
    std::fs::write(&target, "stale artifact").unwrap();
    let mut permissions = std::fs::metadata(&target).unwrap().permissions();
    permissions.set_readonly(true);
    std::fs::set_permissions(&target, permissions).unwrap();

    let mut events = server.subscribe();
    let request_id = server.submit(id, RequestOrigin::UserRequested).await.unwrap();
    let request = wait_for(&mut events, request_id).await;

    assert_eq!(request.status, CompilationStatus::Failed);
    assert!(request.log.contains("read-only"));

    let mut permissions = std::fs::metadata(&target).unwrap().permissions();
    permissions.set_readonly(false);
    std::fs::set_permissions(&target, permissions).unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn exiting_server_refuses_submissions() {
    let work_dir = tempfile::tempdir().unwrap();
    let server = start_server(work_dir.path(), 3, &work_dir.path().join("no-worker")).await;

    server.context().begin_exit();
    let id = ResourceId::parse("chars/hero/run.anim").unwrap();
    let result = server.submit(id, RequestOrigin::UserRequested).await;
    assert!(matches!(result, Err(Error::Exiting)));

    server.shutdown().await;
}

#[tokio::test]
async fn queued_event_is_published() {
    let work_dir = tempfile::tempdir().unwrap();
    let server = start_server(work_dir.path(), 3, &work_dir.path().join("no-worker")).await;

    let id = ResourceId::parse("chars/hero/run.anim").unwrap();
    let mut events = server.subscribe();
    let request_id = server.submit(id.clone(), RequestOrigin::UserRequested).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        ResourceServerEvent::RequestQueued {
            request_id: queued_id,
            resource_id,
        } => {
            assert_eq!(queued_id, request_id);
            assert_eq!(resource_id, id);
        }
        other => panic!("expected RequestQueued, got {:?}", other),
    }

    server.shutdown().await;
}
