use kiln_resource::ResourceType;
use serde::{Deserialize, Serialize};

/// Defines resource compiler properties.
///
/// Declared by each compiler plugin at startup; read-only after registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerDescriptor {
    /// Compiler name, for diagnostics.
    pub name: String,
    /// Version of the compiler's code and data format. Bumping it
    /// invalidates every record previously written for its produced types.
    pub version: i32,
    /// Whether the compiler reads the source file of the requested resource.
    /// Generated resources have no source and set this to `false`.
    pub input_file_required: bool,
    /// The resource types this compiler produces.
    pub produced_types: Vec<ResourceType>,
}

impl CompilerDescriptor {
    /// Creates a descriptor producing a single resource type.
    pub fn new(name: &str, version: i32, produced_type: ResourceType) -> Self {
        Self {
            name: name.to_owned(),
            version,
            input_file_required: true,
            produced_types: vec![produced_type],
        }
    }

    /// Marks the compiler as not requiring a source file.
    #[must_use]
    pub fn without_input_file(mut self) -> Self {
        self.input_file_required = false;
        self
    }

    /// Adds another produced resource type.
    #[must_use]
    pub fn with_produced_type(mut self, kind: ResourceType) -> Self {
        self.produced_types.push(kind);
        self
    }
}
