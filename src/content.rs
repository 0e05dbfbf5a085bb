//! Immutable content handles
//!
//! A [`Content`] is a byte sequence plus an optional declared content type.
//! Clones share the same allocation and the same lazily computed digest, so a
//! handle can be passed to every stage of a request (and across threads)
//! without copying.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;

/// Declared media type of a piece of content
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Json,
    Yaml,
    Protobuf,
    Graphql,
    Xml,
    Other(String),
}

impl ContentType {
    pub fn from_mime(mime: &str) -> Self {
        let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match essence.as_str() {
            "application/json" | "application/vnd.schemaregistry.v1+json" => ContentType::Json,
            "application/x-yaml" | "application/yaml" | "text/yaml" => ContentType::Yaml,
            "application/x-protobuf" | "application/x-protobuffer" => ContentType::Protobuf,
            "application/graphql" => ContentType::Graphql,
            "application/xml" | "text/xml" => ContentType::Xml,
            _ => ContentType::Other(essence),
        }
    }

    pub fn as_mime(&self) -> &str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Yaml => "application/x-yaml",
            ContentType::Protobuf => "application/x-protobuf",
            ContentType::Graphql => "application/graphql",
            ContentType::Xml => "application/xml",
            ContentType::Other(mime) => mime,
        }
    }
}

struct ContentInner {
    bytes: Vec<u8>,
    content_type: Option<ContentType>,
    digest: OnceLock<Checksum>,
}

/// Immutable byte content with a memoized SHA-256 digest
#[derive(Clone)]
pub struct Content {
    inner: Arc<ContentInner>,
}

impl Content {
    /// Wrap raw bytes
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            inner: Arc::new(ContentInner {
                bytes: bytes.into(),
                content_type: None,
                digest: OnceLock::new(),
            }),
        }
    }

    /// Wrap a UTF-8 string
    pub fn from_string(content: impl Into<String>) -> Self {
        Self::from_bytes(content.into().into_bytes())
    }

    /// Copy of this content carrying a declared content type
    pub fn with_content_type(self, content_type: ContentType) -> Self {
        let digest = OnceLock::new();
        if let Some(known) = self.inner.digest.get() {
            let _ = digest.set(known.clone());
        }
        Self {
            inner: Arc::new(ContentInner {
                bytes: self.inner.bytes.clone(),
                content_type: Some(content_type),
                digest,
            }),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.inner.bytes
    }

    /// UTF-8 view, `None` when the bytes are not valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.inner.bytes).ok()
    }

    /// UTF-8 view with a leading byte-order mark removed
    pub fn text(&self) -> Option<&str> {
        self.as_str().map(|s| s.strip_prefix('\u{feff}').unwrap_or(s))
    }

    pub fn content_type(&self) -> Option<&ContentType> {
        self.inner.content_type.as_ref()
    }

    /// SHA-256 of the raw bytes, computed on first access
    pub fn digest(&self) -> &Checksum {
        self.inner
            .digest
            .get_or_init(|| Checksum::from_bytes(&self.inner.bytes))
    }

    pub fn len(&self) -> usize {
        self.inner.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.bytes.is_empty()
    }
}

impl PartialEq for Content {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.bytes == other.inner.bytes
    }
}

impl Eq for Content {}

impl Hash for Content {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.bytes.hash(state);
    }
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preview: String = String::from_utf8_lossy(&self.inner.bytes)
            .chars()
            .take(64)
            .collect();
        f.debug_struct("Content")
            .field("len", &self.len())
            .field("content_type", &self.inner.content_type)
            .field("preview", &preview)
            .finish()
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Self::from_string(s)
    }
}

impl From<Vec<u8>> for Content {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_bytes(bytes)
    }
}

/// Normalized form of some content, used only for digests and deduplication.
///
/// Never served back to clients in place of the original bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalContent(Content);

impl CanonicalContent {
    pub(crate) fn new(content: Content) -> Self {
        Self(content)
    }

    pub fn bytes(&self) -> &[u8] {
        self.0.bytes()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_str()
    }

    /// Digest of the canonical bytes
    pub fn digest(&self) -> &Checksum {
        self.0.digest()
    }

    pub fn as_content(&self) -> &Content {
        &self.0
    }

    pub fn into_content(self) -> Content {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_bytes_are_interchangeable() {
        let a = Content::from_string("{\"a\":1}");
        let b = Content::from_bytes(b"{\"a\":1}".to_vec());
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_digest_is_shared_between_clones() {
        let a = Content::from_string("hello");
        let b = a.clone();
        let first = a.digest() as *const Checksum;
        let second = b.digest() as *const Checksum;
        assert_eq!(first, second);
    }

    #[test]
    fn test_content_type_does_not_affect_equality() {
        let a = Content::from_string("x").with_content_type(ContentType::Json);
        let b = Content::from_string("x");
        assert_eq!(a, b);
        assert_eq!(a.content_type(), Some(&ContentType::Json));
    }

    #[test]
    fn test_invalid_utf8_has_no_string_view() {
        let c = Content::from_bytes(vec![0xff, 0xfe, 0x00]);
        assert!(c.as_str().is_none());
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn test_bom_is_stripped_from_text_view() {
        let c = Content::from_string("\u{feff}{}");
        assert_eq!(c.text(), Some("{}"));
    }

    #[test]
    fn test_mime_parsing() {
        assert_eq!(ContentType::from_mime("application/json; charset=utf-8"), ContentType::Json);
        assert_eq!(ContentType::from_mime("text/xml"), ContentType::Xml);
        assert_eq!(
            ContentType::from_mime("application/x-thing"),
            ContentType::Other("application/x-thing".to_string())
        );
    }
}
