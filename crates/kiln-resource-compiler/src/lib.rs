//! Compiler plugin registry and launcher of the asset tools pipeline.
//!
//! Resource compilation itself happens out of process: each compiler is a
//! black box reached through the compiler worker executable. This crate owns
//! what the server needs to know about them:
//!
//! * [`CompilerDescriptor`] - the metadata a compiler plugin declares
//!   (version, produced resource types, whether it reads an input file).
//! * [`CompilerRegistry`] - the startup-populated map from resource type to
//!   its compiler, read-only at runtime.
//! * [`compiler_cmd`] - helpers that build and execute the worker subprocess
//!   invocation and fold its exit code and combined output into a result.

// crate-specific lint exceptions:
#![warn(missing_docs)]

use kiln_resource::ResourceType;
use thiserror::Error;

pub mod compiler_cmd;

mod compiler_api;
mod compiler_registry;

pub use compiler_api::CompilerDescriptor;
pub use compiler_registry::{CompilerRegistry, CompilerRegistryOptions};

/// Compiler registration error.
#[derive(Error, Debug)]
pub enum Error {
    /// Two compilers claimed the same produced resource type.
    #[error(
        "compiler '{new_compiler}' produces type '{kind}' already claimed by '{existing_compiler}'"
    )]
    DuplicateProducedType {
        /// The contested type tag.
        kind: ResourceType,
        /// Name of the compiler registered first.
        existing_compiler: String,
        /// Name of the compiler whose registration was rejected.
        new_compiler: String,
    },
    /// A compiler declared no produced types.
    #[error("compiler '{0}' declares no produced types")]
    NoProducedTypes(String),
}
