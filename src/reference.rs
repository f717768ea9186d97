//! OCI image reference parsing.
//!
//! References look like `registry/repository[:tag][@digest]`. Unqualified
//! references are normalized against a configurable default registry, and
//! `latest` is assumed when neither a tag nor a digest is given. A parsed
//! [`ImageReference`] is immutable.

use std::fmt;

use crate::constants::{IMAGE_REF_VALID_CHARS, MAX_IMAGE_REF_LEN};
use crate::error::{Error, Result};

/// A parsed, normalized OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// Parses a reference, qualifying it with `default_registry` when the
    /// reference does not name a registry.
    ///
    /// ## Errors
    ///
    /// [`Error::InvalidImageReference`] for empty, overlong, or malformed
    /// references, or references containing characters outside the allowlist.
    pub fn parse(reference: &str, default_registry: &str) -> Result<Self> {
        if reference.is_empty() {
            return Err(invalid(reference, "empty reference"));
        }
        if reference.len() > MAX_IMAGE_REF_LEN {
            return Err(invalid(
                reference,
                &format!("exceeds {} bytes", MAX_IMAGE_REF_LEN),
            ));
        }
        if !reference.chars().all(|c| IMAGE_REF_VALID_CHARS.contains(c)) {
            return Err(invalid(reference, "contains invalid characters"));
        }

        // Digest first; it may contain ':' which would confuse tag parsing.
        let (name, digest) = match reference.split_once('@') {
            Some((n, d)) => {
                if !d.starts_with("sha256:") || d.len() != "sha256:".len() + 64 {
                    return Err(invalid(reference, "malformed digest"));
                }
                (n, Some(d.to_string()))
            }
            None => (reference, None),
        };

        // A leading component with a '.', ':' or equal to "localhost" is a
        // registry host; anything else belongs to the repository.
        let (registry, rest) = match name.split_once('/') {
            Some((host, rest))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (host.to_string(), rest)
            }
            _ => (default_registry.to_string(), name),
        };

        // The tag, if any, follows the last ':' of the last path component.
        let (repository, tag) = match rest.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => {
                if tag.is_empty() {
                    return Err(invalid(reference, "empty tag"));
                }
                (repo.to_string(), Some(tag.to_string()))
            }
            _ => (rest.to_string(), None),
        };

        if repository.is_empty() {
            return Err(invalid(reference, "empty repository"));
        }

        let tag = match (&tag, &digest) {
            (None, None) => Some("latest".to_string()),
            _ => tag,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Registry host (always populated after normalization).
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path within the registry.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Tag, if the reference carries one.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Content digest, if the reference pins one.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Returns a copy of this reference pinned to the supplied digest.
    pub fn with_digest(&self, digest: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: self.tag.clone(),
            digest: Some(digest.to_string()),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

fn invalid(reference: &str, reason: &str) -> Error {
    Error::InvalidImageReference {
        reference: reference.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_bare_name_gets_default_registry_and_tag() {
        let r = ImageReference::parse("fn", "example.com").unwrap();
        assert_eq!(r.registry(), "example.com");
        assert_eq!(r.repository(), "fn");
        assert_eq!(r.tag(), Some("latest"));
        assert_eq!(r.to_string(), "example.com/fn:latest");
    }

    #[test]
    fn test_qualified_reference_keeps_registry() {
        let r = ImageReference::parse("example.com/fn:v1", "other.io").unwrap();
        assert_eq!(r.registry(), "example.com");
        assert_eq!(r.repository(), "fn");
        assert_eq!(r.tag(), Some("v1"));
    }

    #[test]
    fn test_registry_with_port() {
        let r = ImageReference::parse("localhost:5000/team/fn:v2", "other.io").unwrap();
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.repository(), "team/fn");
        assert_eq!(r.tag(), Some("v2"));
    }

    #[test]
    fn test_digest_reference() {
        let raw = format!("example.com/fn@{}", DIGEST);
        let r = ImageReference::parse(&raw, "other.io").unwrap();
        assert_eq!(r.digest(), Some(DIGEST));
        assert_eq!(r.tag(), None);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(ImageReference::parse("", "example.com").is_err());
        assert!(ImageReference::parse("fn image", "example.com").is_err());
        assert!(ImageReference::parse("fn@sha256:short", "example.com").is_err());
        assert!(ImageReference::parse("fn:", "example.com").is_err());
        let long = "a".repeat(600);
        assert!(ImageReference::parse(&long, "example.com").is_err());
    }

    #[test]
    fn test_with_digest_pins() {
        let r = ImageReference::parse("example.com/fn:v1", "other.io").unwrap();
        let pinned = r.with_digest(DIGEST);
        assert_eq!(pinned.digest(), Some(DIGEST));
        assert_eq!(pinned.tag(), Some("v1"));
    }
}
