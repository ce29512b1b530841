use std::collections::HashMap;
use std::fmt;

use kiln_resource::ResourceType;

use crate::{CompilerDescriptor, Error};

/// Options and flags used to configure how a compiler registry is created.
#[derive(Default)]
pub struct CompilerRegistryOptions {
    compilers: Vec<CompilerDescriptor>,
}

impl CompilerRegistryOptions {
    /// Creates an empty set of options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a compiler.
    pub fn add_compiler(mut self, descriptor: CompilerDescriptor) -> Self {
        self.compilers.push(descriptor);
        self
    }

    /// Creates a new compiler registry based on specified options.
    ///
    /// Registration of a produced type already claimed by another compiler is
    /// rejected - resource types have exactly one compiler.
    pub fn create(self) -> Result<CompilerRegistry, Error> {
        let mut by_type = HashMap::new();
        for (index, compiler) in self.compilers.iter().enumerate() {
            if compiler.produced_types.is_empty() {
                return Err(Error::NoProducedTypes(compiler.name.clone()));
            }
            for &kind in &compiler.produced_types {
                if let Some(existing) = by_type.insert(kind, index) {
                    return Err(Error::DuplicateProducedType {
                        kind,
                        existing_compiler: self.compilers[existing].name.clone(),
                        new_compiler: compiler.name.clone(),
                    });
                }
            }
        }

        Ok(CompilerRegistry {
            compilers: self.compilers,
            by_type,
        })
    }
}

/// A registry of resource compilers, keyed by produced resource type.
///
/// Populated at startup, read-only at runtime.
pub struct CompilerRegistry {
    compilers: Vec<CompilerDescriptor>,
    by_type: HashMap<ResourceType, usize>,
}

impl fmt::Debug for CompilerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilerRegistry")
            .field("compilers", &self.compilers)
            .finish()
    }
}

impl CompilerRegistry {
    /// Returns the compiler registered for `kind`.
    pub fn find_compiler(&self, kind: ResourceType) -> Option<&CompilerDescriptor> {
        self.by_type.get(&kind).map(|&index| &self.compilers[index])
    }

    /// Whether a compiler is registered for `kind`.
    pub fn has_compiler(&self, kind: ResourceType) -> bool {
        self.by_type.contains_key(&kind)
    }

    /// The version of the compiler registered for `kind`.
    ///
    /// Panics if no compiler is registered - callers check
    /// [`Self::has_compiler`] first.
    pub fn version_of(&self, kind: ResourceType) -> i32 {
        self.find_compiler(kind)
            .unwrap_or_else(|| panic!("no compiler registered for resource type '{}'", kind))
            .version
    }

    /// All registered compilers.
    pub fn compilers(&self) -> &[CompilerDescriptor] {
        &self.compilers
    }

    /// True if no compilers were registered.
    pub fn is_empty(&self) -> bool {
        self.compilers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use kiln_resource::ResourceType;

    use super::CompilerRegistryOptions;
    use crate::{CompilerDescriptor, Error};

    const ANIM: ResourceType = ResourceType::new(b"anim");
    const SKEL: ResourceType = ResourceType::new(b"skel");

    #[test]
    fn lookup_by_produced_type() {
        let registry = CompilerRegistryOptions::new()
            .add_compiler(CompilerDescriptor::new("animation", 3, ANIM))
            .add_compiler(CompilerDescriptor::new("skeleton", 1, SKEL))
            .create()
            .unwrap();

        assert!(registry.has_compiler(ANIM));
        assert_eq!(registry.version_of(ANIM), 3);
        assert_eq!(registry.find_compiler(SKEL).unwrap().name, "skeleton");
        assert!(!registry.has_compiler(ResourceType::new(b"mesh")));
    }

    #[test]
    fn duplicate_produced_type_is_rejected() {
        let result = CompilerRegistryOptions::new()
            .add_compiler(CompilerDescriptor::new("animation", 3, ANIM))
            .add_compiler(CompilerDescriptor::new("legacy-animation", 2, ANIM))
            .create();

        match result {
            Err(Error::DuplicateProducedType {
                kind,
                existing_compiler,
                new_compiler,
            }) => {
                assert_eq!(kind, ANIM);
                assert_eq!(existing_compiler, "animation");
                assert_eq!(new_compiler, "legacy-animation");
            }
            _ => panic!("duplicate registration must be rejected"),
        }
    }

    #[test]
    fn empty_produced_types_is_rejected() {
        let descriptor = CompilerDescriptor {
            name: "broken".to_owned(),
            version: 1,
            input_file_required: true,
            produced_types: vec![],
        };
        assert!(matches!(
            CompilerRegistryOptions::new()
                .add_compiler(descriptor)
                .create(),
            Err(Error::NoProducedTypes(_))
        ));
    }

    #[test]
    #[should_panic(expected = "no compiler registered")]
    fn version_of_unknown_type_panics() {
        let registry = CompilerRegistryOptions::new()
            .add_compiler(CompilerDescriptor::new("animation", 3, ANIM))
            .create()
            .unwrap();
        registry.version_of(ResourceType::new(b"mesh"));
    }
}
