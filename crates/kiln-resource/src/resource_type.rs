use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Type tag of a resource.
///
/// A four-character code identifying the kind of a resource (e.g. `anim`,
/// `skel`, `tex`). Tags shorter than four characters are space-padded; the
/// padding is invisible in the textual form.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceType(u32);

impl ResourceType {
    /// Creates a type tag from up to four bytes.
    ///
    /// Meant for compile-time constants: `ResourceType::new(b"anim")`.
    /// Panics if `tag` is empty or longer than four bytes.
    pub const fn new(tag: &[u8]) -> Self {
        assert!(!tag.is_empty() && tag.len() <= 4);
        let mut raw = 0u32;
        let mut i = 0;
        while i < 4 {
            let byte = if i < tag.len() { tag[i] } else { b' ' };
            raw = (raw << 8) | byte as u32;
            i += 1;
        }
        Self(raw)
    }

    /// Reconstructs a type tag from its raw representation.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw four-byte representation, as persisted by the record store.
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    fn write_chars(self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.to_be_bytes() {
            if byte == b' ' {
                break;
            }
            f.write_fmt(format_args!("{}", byte as char))?;
        }
        Ok(())
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_chars(f)
    }
}

impl fmt::Debug for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_chars(f)
    }
}

impl FromStr for ResourceType {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 4 {
            return Err("type tag must be 1 to 4 characters");
        }
        if !s.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err("type tag must be ascii alphanumeric");
        }
        Ok(Self::new(s.as_bytes()))
    }
}

impl Serialize for ResourceType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_u32(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for ResourceType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        if deserializer.is_human_readable() {
            let tag = String::deserialize(deserializer)?;
            Self::from_str(&tag).map_err(D::Error::custom)
        } else {
            let raw = u32::deserialize(deserializer)?;
            Ok(Self::from_raw(raw))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::ResourceType;

    #[test]
    fn tag_round_trip() {
        let anim = ResourceType::new(b"anim");
        assert_eq!(anim.to_string(), "anim");
        assert_eq!(ResourceType::from_str("anim").unwrap(), anim);
        assert_eq!(ResourceType::from_raw(anim.as_raw()), anim);
    }

    #[test]
    fn short_tags_are_padded() {
        let tex = ResourceType::new(b"tex");
        assert_eq!(tex.to_string(), "tex");
        assert_ne!(tex, ResourceType::new(b"texd"));
    }

    #[test]
    fn invalid_tags_fail_to_parse() {
        assert!(ResourceType::from_str("").is_err());
        assert!(ResourceType::from_str("meshes").is_err());
        assert!(ResourceType::from_str("a/b").is_err());
    }
}
