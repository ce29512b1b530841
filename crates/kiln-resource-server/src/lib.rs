//! Resource compilation server of the asset tools pipeline.
//!
//! The server turns source asset descriptors into engine-ready compiled
//! artifacts on demand. It guarantees freshness with respect to both direct
//! inputs and transitive compile dependencies, avoids redundant work across
//! concurrent clients and surfaces structured diagnostics per request.
//!
//! # Processing a request
//!
//! A [`CompilationRequest`] enters the server queue and is picked up by one
//! of a fixed pool of workers. The worker:
//!
//! 1. Builds a [`CompileDependencyTree`](dependency_tree::CompileDependencyTree)
//!    for the requested resource and decides up-to-date-ness against the
//!    persisted [`CompiledRecord`]s.
//! 2. If stale, launches the external compiler worker process and maps its
//!    exit code onto the request status.
//! 3. On success, upserts the resource's [`CompiledRecord`] so the next
//!    request short-circuits, and notifies subscribers through the event bus.
//!
//! The record store is the only mutable state shared between workers; a
//! request is owned by exactly one worker while it is being processed.
//!
//! # Example Usage
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use kiln_resource::{ResourceId, ResourceType, ResourceTypeRegistryOptions};
//! # use kiln_resource_compiler::{CompilerDescriptor, CompilerRegistryOptions};
//! # use kiln_resource_server::{RequestOrigin, ResourceServerOptions};
//! # tokio_test::block_on(async {
//! let types = Arc::new(
//!     ResourceTypeRegistryOptions::new()
//!         .add_type(ResourceType::new(b"anim"), "Animation Clip")
//!         .create(),
//! );
//! let compilers = Arc::new(
//!     CompilerRegistryOptions::new()
//!         .add_compiler(CompilerDescriptor::new("animation", 3, ResourceType::new(b"anim")))
//!         .create()
//!         .unwrap(),
//! );
//!
//! let server = ResourceServerOptions::new("/data/raw", "/data/compiled", "/tools/worker")
//!     .worker_count(4)
//!     .create(types, compilers)
//!     .await
//!     .unwrap();
//!
//! let id = ResourceId::parse("chars/hero/run.anim").unwrap();
//! let mut events = server.subscribe();
//! server.submit(id, RequestOrigin::UserRequested).await.unwrap();
//! let completed = events.recv().await;
//! # })
//! ```

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]
#![warn(missing_docs)]

use std::io;
use std::path::PathBuf;

use kiln_resource::ResourceType;
use thiserror::Error;

pub mod dependency_tree;

mod descriptor;
mod options;
mod record_store;
mod request;
mod server;
mod server_context;
mod worker;

pub use descriptor::ResourceDescriptor;
pub use options::ResourceServerOptions;
pub use record_store::{CompiledRecord, CompiledResourceDb};
pub use request::{
    CompilationRequest, CompilationStatus, RequestId, RequestOrigin, RequestTiming,
};
pub use server::{ResourceServer, ResourceServerEvent};
pub use server_context::ResourceServerContext;
pub use worker::ResourceServerWorker;

/// Resource server error.
///
/// Every kind surfaces on the originating request as a failed status with an
/// explanatory log line; none of them are fatal to the server itself.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed resource id.
    #[error("Invalid resource: {0}")]
    InvalidResource(#[from] kiln_resource::InvalidResourcePath),
    /// No compiler is registered for the resource type.
    #[error("No compiler found for resource type '{0}'")]
    NoCompiler(ResourceType),
    /// The compiler requires a source file and it does not exist.
    #[error("Source file '{0}' does not exist")]
    MissingInput(PathBuf),
    /// The target file exists and cannot be written.
    #[error("Destination file '{0}' is read-only")]
    DestinationReadOnly(PathBuf),
    /// The target directory cannot be created.
    #[error("Destination path '{0}' is unavailable: {1}")]
    DestinationUnavailable(PathBuf, #[source] io::Error),
    /// A resource descriptor file is unreadable or corrupt.
    #[error("Failed to read resource descriptor '{0}': {1}")]
    DescriptorReadFailed(PathBuf, String),
    /// A cycle was detected while building the dependency tree.
    #[error("Circular dependency detected: {0}")]
    CircularDependency(String),
    /// Record store I/O failure.
    #[error("Record store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),
    /// The compiler worker process could not be spawned.
    #[error("Resource compiler failed to start: {0}")]
    SubprocessStartFailed(#[source] io::Error),
    /// The compiler worker process could not be waited on.
    #[error("Resource compiler failed to complete: {0}")]
    SubprocessJoinFailed(#[source] io::Error),
    /// The compiler worker exited with a failure code.
    #[error("Resource compiler exited with code {0:?}")]
    CompilerFailed(Option<i32>),
    /// The server is shutting down and refuses new requests.
    #[error("Resource server is exiting")]
    Exiting,
    /// The server context failed validation.
    #[error("Invalid server context: {0}")]
    InvalidContext(&'static str),
}
