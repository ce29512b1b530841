use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::{DefaultHash, ResourceType};

/// Separator between a path and its variation discriminator.
const VARIATION_SEPARATOR: char = '|';

/// Stand-in for the variation separator in derived file system paths.
const VARIATION_FILE_SEPARATOR: char = '~';

/// Error returned when a logical resource path fails to parse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidResourcePath {
    /// The path string is empty.
    #[error("resource path is empty")]
    Empty,
    /// The path starts with a separator.
    #[error("resource path '{0}' must be relative")]
    Rooted(String),
    /// The path contains an empty, `.` or `..` component.
    #[error("resource path '{0}' contains an invalid component")]
    InvalidComponent(String),
    /// The path contains a character that is not legal in a logical path.
    #[error("resource path '{0}' contains an illegal character")]
    IllegalCharacter(String),
    /// The variation discriminator is malformed.
    #[error("resource path '{0}' has a malformed variation")]
    InvalidVariation(String),
    /// The path's extension is missing or is not a valid type tag.
    #[error("resource path '{0}' has no valid resource type tag")]
    InvalidTypeTag(String),
}

/// Logical path of a resource, rooted at the source data directory.
///
/// Uses `/` as separator regardless of platform. Identity (equality, hashing,
/// ordering) is case-insensitive; the spelling is preserved verbatim for
/// display. An optional variation discriminator can trail the final
/// component, separated by `|` - it is part of the identity but otherwise
/// opaque.
#[derive(Clone)]
pub struct ResourcePath(String);

impl ResourcePath {
    /// Parses a logical path, normalizing `\` separators to `/`.
    pub fn new(path: impl AsRef<str>) -> Result<Self, InvalidResourcePath> {
        let path = path.as_ref();
        if path.is_empty() {
            return Err(InvalidResourcePath::Empty);
        }

        let normalized = path.replace('\\', "/");
        if normalized.starts_with('/') {
            return Err(InvalidResourcePath::Rooted(path.to_owned()));
        }
        // `~` is reserved: it stands in for the variation separator in
        // derived file names, so a literal occurrence could alias another
        // resource's file.
        if normalized.chars().any(|c| {
            c.is_ascii_control() || matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '~')
        }) {
            return Err(InvalidResourcePath::IllegalCharacter(path.to_owned()));
        }
        for component in normalized.split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return Err(InvalidResourcePath::InvalidComponent(path.to_owned()));
            }
        }

        // At most one variation separator, in the last component, with
        // non-empty text on both sides.
        if let Some(separator) = normalized.find(VARIATION_SEPARATOR) {
            let (stem, variation) = normalized.split_at(separator);
            let variation = &variation[1..];
            if stem.is_empty()
                || variation.is_empty()
                || stem.ends_with('/')
                || variation.contains('/')
                || variation.contains(VARIATION_SEPARATOR)
            {
                return Err(InvalidResourcePath::InvalidVariation(path.to_owned()));
            }
        }

        Ok(Self(normalized))
    }

    /// The normalized path string, spelling preserved.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The variation discriminator, if the path carries one.
    pub fn variation(&self) -> Option<&str> {
        self.0
            .rfind(VARIATION_SEPARATOR)
            .map(|separator| &self.0[separator + 1..])
    }

    /// The path without its variation discriminator.
    pub fn without_variation(&self) -> &str {
        match self.0.rfind(VARIATION_SEPARATOR) {
            Some(separator) => &self.0[..separator],
            None => &self.0,
        }
    }

    /// The extension of the final component, excluding the variation.
    pub fn extension(&self) -> Option<&str> {
        let stem = self.without_variation();
        let file_name = stem.rsplit('/').next().unwrap_or(stem);
        file_name
            .rfind('.')
            .filter(|dot| *dot != 0)
            .map(|dot| &file_name[dot + 1..])
    }

    /// Derives the file system location of this path under `root`.
    ///
    /// Pure - the filesystem is not consulted. A variation folds into the
    /// file stem (`walk.anim|crouch` becomes `walk~crouch.anim`), since the
    /// separator is not portable in file names. The fold character is
    /// rejected in logical paths, so distinct ids never share a file.
    pub fn file_path(&self, root: impl AsRef<Path>) -> PathBuf {
        let mut file_path = root.as_ref().to_path_buf();
        let stem = self.without_variation();
        let mut components = stem.split('/').peekable();
        while let Some(component) = components.next() {
            if components.peek().is_some() {
                file_path.push(component);
            } else {
                file_path.push(self.file_name_of(component));
            }
        }
        file_path
    }

    fn file_name_of(&self, component: &str) -> String {
        match self.variation() {
            None => component.to_owned(),
            Some(variation) => match component.rfind('.') {
                Some(dot) => format!(
                    "{}{}{}{}",
                    &component[..dot],
                    VARIATION_FILE_SEPARATOR,
                    variation,
                    &component[dot..]
                ),
                None => format!("{}{}{}", component, VARIATION_FILE_SEPARATOR, variation),
            },
        }
    }
}

impl PartialEq for ResourcePath {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for ResourcePath {}

impl Hash for ResourcePath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for byte in self.0.bytes() {
            state.write_u8(byte.to_ascii_lowercase());
        }
        state.write_u8(0xff);
    }
}

impl PartialOrd for ResourcePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourcePath {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.0.bytes().map(|b| b.to_ascii_lowercase());
        let rhs = other.0.bytes().map(|b| b.to_ascii_lowercase());
        lhs.cmp(rhs)
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ResourcePath {
    type Err = InvalidResourcePath;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Identity of a resource: a logical path plus a type tag.
///
/// Two resources with identical paths but different type tags are distinct
/// entities. [`ResourceId::parse`] derives the tag from the path's extension;
/// [`ResourceId::from_parts`] allows pairing a path with an explicit tag.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    path: ResourcePath,
    kind: ResourceType,
}

impl ResourceId {
    /// Parses a logical path string into an id, deriving the type tag from
    /// the extension.
    pub fn parse(path: impl AsRef<str>) -> Result<Self, InvalidResourcePath> {
        let path = ResourcePath::new(path)?;
        let kind = path
            .extension()
            .map(|extension| extension.to_ascii_lowercase())
            .and_then(|extension| ResourceType::from_str(&extension).ok())
            .ok_or_else(|| InvalidResourcePath::InvalidTypeTag(path.as_str().to_owned()))?;
        Ok(Self { path, kind })
    }

    /// Pairs a path with an explicit type tag.
    pub fn from_parts(path: ResourcePath, kind: ResourceType) -> Self {
        Self { path, kind }
    }

    /// The logical path.
    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// The type tag.
    pub fn kind(&self) -> ResourceType {
        self.kind
    }

    /// Location of the source descriptor file under `source_root`.
    pub fn source_file_path(&self, source_root: impl AsRef<Path>) -> PathBuf {
        self.path.file_path(source_root)
    }

    /// Location of the compiled artifact under `output_root`.
    ///
    /// The logical path is preserved verbatim - no case rewriting.
    pub fn target_file_path(&self, output_root: impl AsRef<Path>) -> PathBuf {
        self.path.file_path(output_root)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path.as_str())
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("({}, {})", self.path, self.kind))
    }
}

impl FromStr for ResourceId {
    type Err = InvalidResourcePath;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ResourceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.path.as_str())
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let path = String::deserialize(deserializer)?;
        Self::parse(&path).map_err(serde::de::Error::custom)
    }
}

/// Hashes a file system path after folding it to lower case.
///
/// Agreement with path equality is guaranteed: two paths that compare equal
/// case-insensitively produce the same id.
pub fn header_id(path: impl AsRef<str>) -> u64 {
    path.as_ref().to_ascii_lowercase().default_hash()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{header_id, InvalidResourcePath, ResourceId, ResourcePath};
    use crate::{DefaultHash, ResourceType};

    #[test]
    fn parse_derives_type_from_extension() {
        let id = ResourceId::parse("chars/hero/run.anim").unwrap();
        assert_eq!(id.kind(), ResourceType::new(b"anim"));
        assert_eq!(id.to_string(), "chars/hero/run.anim");
    }

    #[test]
    fn identity_is_case_insensitive() {
        let lower = ResourceId::parse("chars/hero/run.anim").unwrap();
        let upper = ResourceId::parse("Chars/Hero/Run.ANIM").unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower.default_hash(), upper.default_hash());
        // display preserves the author's spelling
        assert_eq!(upper.to_string(), "Chars/Hero/Run.ANIM");
    }

    #[test]
    fn same_path_different_tag_is_distinct() {
        let path = ResourcePath::new("chars/hero/run.anim").unwrap();
        let anim = ResourceId::from_parts(path.clone(), ResourceType::new(b"anim"));
        let bin = ResourceId::from_parts(path, ResourceType::new(b"bin"));
        assert_ne!(anim, bin);
    }

    #[test]
    fn mixed_separators_normalize() {
        let id = ResourceId::parse(r"chars\hero\run.anim").unwrap();
        assert_eq!(id.to_string(), "chars/hero/run.anim");
    }

    #[test]
    fn invalid_paths_are_rejected() {
        assert_eq!(ResourceId::parse(""), Err(InvalidResourcePath::Empty));
        assert!(matches!(
            ResourceId::parse("/rooted/run.anim"),
            Err(InvalidResourcePath::Rooted(_))
        ));
        assert!(matches!(
            ResourceId::parse("chars//run.anim"),
            Err(InvalidResourcePath::InvalidComponent(_))
        ));
        assert!(matches!(
            ResourceId::parse("chars/../run.anim"),
            Err(InvalidResourcePath::InvalidComponent(_))
        ));
        assert!(matches!(
            ResourceId::parse("chars/run"),
            Err(InvalidResourcePath::InvalidTypeTag(_))
        ));
        assert!(matches!(
            ResourceId::parse("chars/he:ro.anim"),
            Err(InvalidResourcePath::IllegalCharacter(_))
        ));
    }

    #[test]
    fn variation_is_extracted_and_opaque() {
        let id = ResourceId::parse("chars/hero/walk.anim|crouch").unwrap();
        assert_eq!(id.path().variation(), Some("crouch"));
        assert_eq!(id.kind(), ResourceType::new(b"anim"));

        let plain = ResourceId::parse("chars/hero/walk.anim").unwrap();
        assert_ne!(id, plain);
    }

    #[test]
    fn malformed_variation_is_rejected() {
        assert!(ResourceId::parse("chars/walk.anim|").is_err());
        assert!(ResourceId::parse("chars/walk.anim|a|b").is_err());
    }

    #[test]
    fn file_path_derivation_is_pure_join() {
        let id = ResourceId::parse("chars/Hero/Run.anim").unwrap();
        assert_eq!(
            id.source_file_path("/data/raw"),
            Path::new("/data/raw/chars/Hero/Run.anim")
        );
        assert_eq!(
            id.target_file_path("/data/compiled"),
            Path::new("/data/compiled/chars/Hero/Run.anim")
        );
    }

    #[test]
    fn variation_folds_into_file_stem() {
        let id = ResourceId::parse("chars/hero/walk.anim|crouch").unwrap();
        assert_eq!(
            id.target_file_path("/out"),
            Path::new("/out/chars/hero/walk~crouch.anim")
        );
    }

    #[test]
    fn variation_fold_cannot_collide_with_literal_path() {
        let variation = ResourceId::parse("chars/hero/walk.anim|crouch").unwrap();
        assert_eq!(
            variation.target_file_path("/out"),
            Path::new("/out/chars/hero/walk~crouch.anim")
        );

        // the fold character is reserved, so the literal spelling of the
        // folded name cannot name a second resource with the same file
        assert!(matches!(
            ResourceId::parse("chars/hero/walk~crouch.anim"),
            Err(InvalidResourcePath::IllegalCharacter(_))
        ));
    }

    #[test]
    fn header_id_folds_case() {
        assert_eq!(header_id("C:/Code/Engine.h"), header_id("c:/code/engine.h"));
        assert_ne!(header_id("a.h"), header_id("b.h"));
    }
}
