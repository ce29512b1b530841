use std::path::Path;

use kiln_resource::ResourceId;
use serde::{Deserialize, Serialize};

use crate::Error;

/// The on-disk source file of a resource.
///
/// Descriptors are json text documents authored by the tools. The resolver
/// depends on a single field: the list of compile dependencies the resource
/// declares. Everything else the document carries belongs to the compiler
/// that consumes it and is preserved untouched.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Resources this resource reads at compile time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    compile_dependencies: Vec<ResourceId>,

    /// Compiler-specific content, opaque to the server.
    #[serde(flatten)]
    content: serde_json::Map<String, serde_json::Value>,
}

impl ResourceDescriptor {
    /// Creates an empty descriptor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a descriptor declaring `dependencies`.
    pub fn with_dependencies(dependencies: Vec<ResourceId>) -> Self {
        Self {
            compile_dependencies: dependencies,
            content: serde_json::Map::default(),
        }
    }

    /// The compile dependencies the descriptor declares.
    pub fn compile_dependencies(&self) -> &[ResourceId] {
        &self.compile_dependencies
    }

    /// Reads and decodes the descriptor at `path`.
    pub async fn read_from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::DescriptorReadFailed(path.to_path_buf(), e.to_string()))?;
        serde_json::from_str(&text)
            .map_err(|e| Error::DescriptorReadFailed(path.to_path_buf(), e.to_string()))
    }

    /// Encodes the descriptor as json text.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use kiln_resource::ResourceId;

    use super::ResourceDescriptor;
    use crate::Error;

    #[test]
    fn dependencies_round_trip() {
        let descriptor = ResourceDescriptor::with_dependencies(vec![
            ResourceId::parse("skel/hero.skel").unwrap(),
            ResourceId::parse("anim/source/run.fbx").unwrap(),
        ]);

        let decoded: ResourceDescriptor = serde_json::from_str(&descriptor.to_json()).unwrap();
        assert_eq!(decoded.compile_dependencies().len(), 2);
        assert_eq!(
            decoded.compile_dependencies()[0],
            ResourceId::parse("skel/hero.skel").unwrap()
        );
    }

    #[test]
    fn unknown_fields_are_preserved() {
        let text = r#"{
            "compile_dependencies": ["skel/hero.skel"],
            "sample_rate": 30,
            "root_motion": { "enabled": true }
        }"#;

        let descriptor: ResourceDescriptor = serde_json::from_str(text).unwrap();
        assert_eq!(descriptor.compile_dependencies().len(), 1);
        let encoded = descriptor.to_json();
        assert!(encoded.contains("sample_rate"));
        assert!(encoded.contains("root_motion"));
    }

    #[test]
    fn missing_dependency_list_means_no_dependencies() {
        let descriptor: ResourceDescriptor = serde_json::from_str("{}").unwrap();
        assert!(descriptor.compile_dependencies().is_empty());
    }

    #[tokio::test]
    async fn unreadable_file_fails() {
        let result = ResourceDescriptor::read_from_file("/nonexistent/run.anim").await;
        assert!(matches!(result, Err(Error::DescriptorReadFailed(_, _))));
    }

    #[tokio::test]
    async fn corrupt_file_fails() {
        let work_dir = tempfile::tempdir().unwrap();
        let path = work_dir.path().join("run.anim");
        std::fs::write(&path, "not json {").unwrap();

        let result = ResourceDescriptor::read_from_file(&path).await;
        assert!(matches!(result, Err(Error::DescriptorReadFailed(_, _))));
    }
}
