//! Compile dependency resolution.
//!
//! For every request the server builds a [`CompileDependencyTree`] rooted at
//! the requested resource: each node captures the on-disk state of one
//! resource (source and target existence, source timestamp, last compiled
//! record) and owns the nodes of its declared compile dependencies. The tree
//! then answers the only question that matters - is the root up to date, or
//! does it need a compile pass?
//!
//! Dependency data is a DAG in principle, but a flat unique set prevents
//! re-walking shared subtrees, so every resource appears in the tree at most
//! once. Trees are built and destroyed entirely within one worker and are
//! never shared.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_recursion::async_recursion;
use kiln_resource::ResourceId;
use petgraph::dot::{Config, Dot};
use petgraph::Graph;
use tracing::warn;

use crate::descriptor::ResourceDescriptor;
use crate::record_store::{CompiledRecord, CompiledResourceDb};
use crate::server_context::ResourceServerContext;
use crate::Error;

/// A node of a compile dependency tree.
///
/// Owns its dependency nodes exclusively; nodes are never shared between
/// trees.
#[derive(Debug)]
pub struct CompileDependencyNode {
    /// The resource this node describes.
    pub resource_id: ResourceId,
    /// Location of the source descriptor file.
    pub source_path: PathBuf,
    /// Location of the compiled artifact. Empty for non-compilable resources.
    pub target_path: PathBuf,
    /// Whether the source file exists.
    pub source_exists: bool,
    /// Whether the compiled artifact exists.
    pub target_exists: bool,
    /// Source file modification time; 0 if the file is missing.
    pub timestamp: u64,
    /// Version of the registered compiler; -1 if the type has none.
    pub compiler_version: i32,
    /// The persisted record of the last successful compile, if any.
    pub record: Option<CompiledRecord>,
    /// Combined hash over this node's timestamp and all transitive
    /// dependencies. Unsigned wrap-around is fine - the value is compared
    /// for equality, never ordered.
    pub combined_hash: u64,
    /// Owned dependency nodes.
    pub dependencies: Vec<CompileDependencyNode>,
}

impl CompileDependencyNode {
    fn new(resource_id: ResourceId) -> Self {
        Self {
            resource_id,
            source_path: PathBuf::new(),
            target_path: PathBuf::new(),
            source_exists: false,
            target_exists: false,
            timestamp: 0,
            compiler_version: -1,
            record: None,
            combined_hash: 0,
            dependencies: Vec::new(),
        }
    }

    /// Whether a compiler is registered for this node's resource type.
    pub fn is_compilable(&self) -> bool {
        self.compiler_version >= 0
    }

    /// Decides freshness of this node and, recursively, of every dependency.
    ///
    /// A missing source makes the node stale rather than an error; whether
    /// that fails the request is decided later, at the worker layer.
    pub fn is_up_to_date(&self) -> bool {
        if !self.source_exists {
            return false;
        }

        if self.is_compilable() {
            if !self.target_exists {
                return false;
            }
            let record = match &self.record {
                Some(record) => record,
                None => return false,
            };
            if record.compiler_version != self.compiler_version {
                return false;
            }
            if record.source_timestamp_hash != self.combined_hash {
                return false;
            }
        }

        self.dependencies.iter().all(Self::is_up_to_date)
    }

    fn compute_combined_hash(&mut self) {
        self.combined_hash = self.timestamp;
        for dependency in &self.dependencies {
            self.combined_hash = self.combined_hash.wrapping_add(dependency.combined_hash);
        }
    }
}

/// The rooted tree of a resource and its transitive compile-time inputs,
/// built on demand from the current filesystem, registry and record state.
#[derive(Debug)]
pub struct CompileDependencyTree {
    root: CompileDependencyNode,
}

impl CompileDependencyTree {
    /// Builds the tree rooted at `resource_id`.
    ///
    /// Fails with [`Error::CircularDependency`] on cyclic descriptors and
    /// with [`Error::DescriptorReadFailed`] when a descriptor of an existing
    /// source cannot be decoded. A missing source never fails the build.
    pub async fn build(
        context: &ResourceServerContext,
        db: &CompiledResourceDb,
        resource_id: &ResourceId,
    ) -> Result<Self, Error> {
        let mut builder = TreeBuilder {
            context,
            db,
            unique_dependencies: Vec::new(),
            ancestors: Vec::new(),
        };

        let mut root = CompileDependencyNode::new(resource_id.clone());
        builder.fill_node(&mut root).await?;
        Ok(Self { root })
    }

    /// The root node.
    pub fn root(&self) -> &CompileDependencyNode {
        &self.root
    }

    /// Whether the whole tree is up to date.
    pub fn is_up_to_date(&self) -> bool {
        self.root.is_up_to_date()
    }

    /// Combined hash of the root.
    pub fn combined_hash(&self) -> u64 {
        self.root.combined_hash
    }

    /// Source timestamp of the root.
    pub fn root_timestamp(&self) -> u64 {
        self.root.timestamp
    }

    /// Renders the tree in Graphviz DOT format, for tooling.
    pub fn to_dot(&self) -> String {
        fn add(graph: &mut Graph<String, ()>, node: &CompileDependencyNode) -> petgraph::prelude::NodeIndex {
            let index = graph.add_node(node.resource_id.to_string());
            for dependency in &node.dependencies {
                let child = add(graph, dependency);
                graph.add_edge(index, child, ());
            }
            index
        }

        let mut graph = Graph::new();
        add(&mut graph, &self.root);
        format!("{:?}", Dot::with_config(&graph, &[Config::EdgeNoLabel]))
    }
}

struct TreeBuilder<'a> {
    context: &'a ResourceServerContext,
    db: &'a CompiledResourceDb,
    /// Every dependency already placed in the tree, for de-duplication.
    unique_dependencies: Vec<ResourceId>,
    /// Ids on the path from the root to the node currently being filled.
    /// Walking it is the cycle check; it stands in for a parent back-pointer.
    ancestors: Vec<ResourceId>,
}

impl TreeBuilder<'_> {
    #[async_recursion]
    async fn fill_node(&mut self, node: &mut CompileDependencyNode) -> Result<(), Error> {
        // Basic resource info.
        node.source_path = node
            .resource_id
            .source_file_path(self.context.source_data_path());
        let (source_exists, timestamp) = file_timestamp(&node.source_path).await;
        node.source_exists = source_exists;
        node.timestamp = timestamp;

        // Compilable resources additionally carry a target, a compiler
        // version and the persisted record.
        let compiler = self
            .context
            .compiler_registry()
            .find_compiler(node.resource_id.kind());
        if let Some(compiler) = compiler {
            node.compiler_version = compiler.version;
            node.target_path = node
                .resource_id
                .target_file_path(self.context.compiled_data_path());
            node.target_exists = tokio::fs::metadata(&node.target_path).await.is_ok();

            // A store failure degrades to "record unknown", which forces a
            // recompile - correct, just wasteful.
            node.record = match self.db.get(&node.resource_id).await {
                Ok(record) => record,
                Err(e) => {
                    warn!(
                        "record lookup failed for '{}', treating as absent: {}",
                        node.resource_id, e
                    );
                    None
                }
            };
        }

        // Generate dependencies. Aggregate types are opaque and never
        // recursed into; a missing source is stale, not an error.
        let checks_dependencies = self
            .context
            .type_registry()
            .checks_compile_dependencies(node.resource_id.kind());
        if node.is_compilable() && checks_dependencies && node.source_exists {
            let descriptor = ResourceDescriptor::read_from_file(&node.source_path).await?;

            self.ancestors.push(node.resource_id.clone());
            for dependency_id in descriptor.compile_dependencies() {
                // Skip resources already in the tree.
                if self.unique_dependencies.contains(dependency_id) {
                    continue;
                }

                if self.ancestors.contains(dependency_id) {
                    let error = Error::CircularDependency(self.cycle_chain(dependency_id));
                    self.ancestors.pop();
                    return Err(error);
                }

                let mut child = CompileDependencyNode::new(dependency_id.clone());
                if let Err(e) = self.fill_node(&mut child).await {
                    self.ancestors.pop();
                    return Err(e);
                }
                node.dependencies.push(child);
                self.unique_dependencies.push(dependency_id.clone());
            }
            self.ancestors.pop();
        }

        node.compute_combined_hash();
        Ok(())
    }

    fn cycle_chain(&self, dependency_id: &ResourceId) -> String {
        let start = self
            .ancestors
            .iter()
            .position(|id| id == dependency_id)
            .unwrap_or(0);
        let mut chain = self.ancestors[start..]
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        chain.push(dependency_id.to_string());
        chain.join(" -> ")
    }
}

/// Existence and modification time of a file; `(false, 0)` when missing.
async fn file_timestamp(path: &Path) -> (bool, u64) {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => {
            #[allow(clippy::cast_possible_truncation)]
            let timestamp = metadata
                .modified()
                .ok()
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |elapsed| elapsed.as_nanos() as u64);
            (true, timestamp)
        }
        Err(_) => (false, 0),
    }
}

#[cfg(test)]
mod tests {
    use kiln_resource::ResourceId;

    use super::CompileDependencyNode;
    use crate::record_store::CompiledRecord;

    fn leaf(path: &str, timestamp: u64) -> CompileDependencyNode {
        let mut node = CompileDependencyNode::new(ResourceId::parse(path).unwrap());
        node.source_exists = true;
        node.timestamp = timestamp;
        node.compute_combined_hash();
        node
    }

    fn record_for(node: &CompileDependencyNode) -> CompiledRecord {
        CompiledRecord {
            resource_id: node.resource_id.clone(),
            compiler_version: node.compiler_version,
            file_timestamp: node.timestamp,
            source_timestamp_hash: node.combined_hash,
        }
    }

    #[test]
    fn combined_hash_adds_dependency_hashes() {
        let mut root = leaf("chars/hero/run.anim", 1000);
        root.dependencies.push(leaf("skel/hero.skel", 500));
        root.compute_combined_hash();
        assert_eq!(root.combined_hash, 1500);

        // touching the dependency changes the root hash
        root.dependencies[0].timestamp = 700;
        root.dependencies[0].compute_combined_hash();
        root.compute_combined_hash();
        assert_eq!(root.combined_hash, 1700);
    }

    #[test]
    fn combined_hash_wraps() {
        let mut root = leaf("a.anim", u64::MAX);
        root.dependencies.push(leaf("b.skel", 2));
        root.compute_combined_hash();
        assert_eq!(root.combined_hash, 1);
    }

    #[test]
    fn missing_source_is_stale() {
        let mut node = leaf("chars/hero/run.anim", 1000);
        node.source_exists = false;
        assert!(!node.is_up_to_date());
    }

    #[test]
    fn raw_input_without_compiler_tracks_source_only() {
        // no compiler registered: compiler_version stays -1 and the node is
        // up to date as long as its source exists.
        let node = leaf("anim/source/run.fbx", 1234);
        assert!(!node.is_compilable());
        assert!(node.is_up_to_date());
        assert_eq!(node.combined_hash, 1234);
    }

    #[test]
    fn compilable_node_freshness_rules() {
        let mut node = leaf("chars/hero/run.anim", 1000);
        node.compiler_version = 3;
        node.target_exists = true;
        node.record = Some(record_for(&node));
        assert!(node.is_up_to_date());

        // no target
        node.target_exists = false;
        assert!(!node.is_up_to_date());
        node.target_exists = true;

        // no record
        let record = node.record.take();
        assert!(!node.is_up_to_date());
        node.record = record;

        // compiler version bump invalidates the record
        node.compiler_version = 4;
        assert!(!node.is_up_to_date());
        node.compiler_version = 3;

        // stale combined hash
        node.timestamp = 2000;
        node.compute_combined_hash();
        assert!(!node.is_up_to_date());
    }

    #[test]
    fn stale_dependency_invalidates_root() {
        let mut dependency = leaf("skel/hero.skel", 500);
        dependency.compiler_version = 1;
        dependency.target_exists = true;
        dependency.record = Some(record_for(&dependency));

        let mut root = leaf("chars/hero/run.anim", 1000);
        root.compiler_version = 3;
        root.target_exists = true;
        root.dependencies.push(dependency);
        root.compute_combined_hash();
        root.record = Some(record_for(&root));
        assert!(root.is_up_to_date());

        // dependency loses its target; the root's own record still matches
        // but the tree is stale
        root.dependencies[0].target_exists = false;
        assert!(!root.is_up_to_date());
    }
}
