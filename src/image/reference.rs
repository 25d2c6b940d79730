use std::fmt;

pub const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";
const OFFICIAL_NAMESPACE: &str = "library";

/// A fully qualified image reference.
///
/// Exactly one of `tag` / `digest` is set after parsing, unless the input
/// carried both (`name:tag@digest`), in which case both are kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a possibly-shorthand reference, filling in registry, the
    /// `library/` namespace and the `latest` tag the way Docker Hub does.
    ///
    /// - `hello` → `docker.io/library/hello:latest`
    /// - `hello/world` → `docker.io/hello/world:latest`
    /// - `quay.io/hello/world:0.1.23` → `quay.io/hello/world:0.1.23`
    pub fn parse(reference: &str) -> Self {
        let reference = reference.trim();

        let (registry, remainder) = match reference.split_once('/') {
            Some((head, rest)) if looks_like_registry(head) => (head.to_string(), rest),
            _ => (DEFAULT_REGISTRY.to_string(), reference),
        };

        let (name_and_tag, digest) = match remainder.split_once('@') {
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (remainder, None),
        };

        let (name, tag) = match name_and_tag.split_once(':') {
            Some((name, tag)) => (name, Some(tag.to_string())),
            None => (name_and_tag, None),
        };

        let repository = if registry == DEFAULT_REGISTRY && !name.contains('/') {
            format!("{OFFICIAL_NAMESPACE}/{name}")
        } else {
            name.to_string()
        };

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Self {
            registry,
            repository,
            tag,
            digest,
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Canonical string form of `reference`. Idempotent.
pub fn normalize(reference: &str) -> String {
    ImageReference::parse(reference).to_string()
}

/// A leading path segment names a registry host when it carries a domain
/// dot or a port.
fn looks_like_registry(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':')
}
