use std::collections::HashMap;

use crate::ResourceType;

/// Per-type metadata consulted by the pipeline.
#[derive(Debug, Clone)]
pub struct ResourceTypeInfo {
    /// Human readable name of the type.
    pub name: String,
    /// Whether the dependency resolver recurses into descriptors of this
    /// type. Aggregate types (e.g. a world map) opt out and are treated as
    /// opaque.
    pub checks_compile_dependencies: bool,
}

/// Options and flags used to build a [`ResourceTypeRegistry`].
#[derive(Default)]
pub struct ResourceTypeRegistryOptions {
    types: HashMap<ResourceType, ResourceTypeInfo>,
}

impl ResourceTypeRegistryOptions {
    /// Creates an empty set of options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a type that participates in dependency checking.
    pub fn add_type(self, kind: ResourceType, name: &str) -> Self {
        self.add(kind, name, true)
    }

    /// Registers an aggregate type the resolver treats as opaque.
    pub fn add_opaque_type(self, kind: ResourceType, name: &str) -> Self {
        self.add(kind, name, false)
    }

    fn add(mut self, kind: ResourceType, name: &str, checks_compile_dependencies: bool) -> Self {
        self.types.insert(
            kind,
            ResourceTypeInfo {
                name: name.to_owned(),
                checks_compile_dependencies,
            },
        );
        self
    }

    /// Creates the registry. Immutable from here on.
    pub fn create(self) -> ResourceTypeRegistry {
        ResourceTypeRegistry { types: self.types }
    }
}

/// Process-wide table of known resource types.
///
/// Populated at startup, read-only afterwards.
#[derive(Debug)]
pub struct ResourceTypeRegistry {
    types: HashMap<ResourceType, ResourceTypeInfo>,
}

impl ResourceTypeRegistry {
    /// Returns the metadata registered for `kind`.
    pub fn get(&self, kind: ResourceType) -> Option<&ResourceTypeInfo> {
        self.types.get(&kind)
    }

    /// Whether `kind` was registered.
    pub fn has_type(&self, kind: ResourceType) -> bool {
        self.types.contains_key(&kind)
    }

    /// Whether the resolver should read descriptors of `kind` for compile
    /// dependencies. Unregistered types default to checking.
    pub fn checks_compile_dependencies(&self, kind: ResourceType) -> bool {
        self.types
            .get(&kind)
            .map_or(true, |info| info.checks_compile_dependencies)
    }

    /// True if no types were registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::ResourceTypeRegistryOptions;
    use crate::ResourceType;

    #[test]
    fn opaque_types_skip_dependency_checking() {
        let registry = ResourceTypeRegistryOptions::new()
            .add_type(ResourceType::new(b"anim"), "Animation Clip")
            .add_opaque_type(ResourceType::new(b"map"), "World Map")
            .create();

        assert!(registry.checks_compile_dependencies(ResourceType::new(b"anim")));
        assert!(!registry.checks_compile_dependencies(ResourceType::new(b"map")));
        // unknown types default to checking
        assert!(registry.checks_compile_dependencies(ResourceType::new(b"tex")));
    }

    #[test]
    fn lookup() {
        let registry = ResourceTypeRegistryOptions::new()
            .add_type(ResourceType::new(b"skel"), "Skeleton")
            .create();

        assert!(registry.has_type(ResourceType::new(b"skel")));
        assert!(!registry.has_type(ResourceType::new(b"mesh")));
        assert_eq!(
            registry.get(ResourceType::new(b"skel")).unwrap().name,
            "Skeleton"
        );
    }
}
