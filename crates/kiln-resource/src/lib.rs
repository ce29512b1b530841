//! Resource identity module of the asset tools pipeline.
//!
//! Every asset the pipeline touches is identified by a [`ResourceId`] - a pair
//! of a logical [`ResourcePath`] (rooted at the source data directory) and a
//! [`ResourceType`] tag derived from the path's extension. Identity is
//! case-insensitive but the spelling used by the author is preserved for
//! display.
//!
//! The module is pure: converting an id to its source or compiled file
//! location never touches the filesystem.
//!
//! [`ResourceTypeRegistry`] carries the per-type policies the rest of the
//! pipeline consults - most notably whether a type participates in compile
//! dependency checking.

// crate-specific lint exceptions:
#![warn(missing_docs)]

mod hash;
mod resource_id;
mod resource_type;
mod type_registry;

pub use hash::DefaultHash;
pub use resource_id::{header_id, InvalidResourcePath, ResourceId, ResourcePath};
pub use resource_type::ResourceType;
pub use type_registry::{ResourceTypeInfo, ResourceTypeRegistry, ResourceTypeRegistryOptions};
