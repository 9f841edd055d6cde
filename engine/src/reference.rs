//! Image reference parsing.
//!
//! Parses references like `ghcr.io/org/app:v1.2` into structured components.
//! A parsed reference is immutable for the rest of the run.

use regmirror_core::error::{MirrorError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when neither tag nor digest is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry hostname, possibly with port (e.g. "ghcr.io", "reg.local:5000")
    pub registry: String,
    /// Repository path (e.g. "library/nginx", "org/app")
    pub repository: String,
    /// Tag (e.g. "latest", "v1.2")
    pub tag: Option<String>,
    /// Digest (e.g. "sha256:ab12...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supported forms:
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `nginx:1.25` → docker.io/library/nginx:1.25
    /// - `org/app` → docker.io/org/app:latest
    /// - `ghcr.io/org/app:tag`
    /// - `reg.local:5000/app:tag`
    /// - `ghcr.io/org/app@sha256:...`
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(invalid(reference, "empty reference"));
        }

        let (without_digest, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                validate_digest(digest).map_err(|m| invalid(reference, &m))?;
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A colon after the last slash separates the tag; a colon before it
        // belongs to a registry port. The first component is a registry only
        // when followed by `/`, so a lone `host:port` is a name and tag.
        let (name, tag) = match without_digest.rsplit_once(':') {
            Some((head, candidate)) if !candidate.contains('/') => {
                if candidate.is_empty() {
                    return Err(invalid(reference, "empty tag"));
                }
                if head.is_empty() {
                    return Err(invalid(reference, "missing repository"));
                }
                (head, Some(candidate.to_string()))
            }
            _ => (without_digest, None),
        };

        let (registry, repository) = split_registry(name, reference)?;

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Tag or "latest" when only a digest was given.
    pub fn tag_or_default(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    /// The manifest reference to request from the registry: digest when
    /// present, tag otherwise.
    pub fn manifest_ref(&self) -> &str {
        self.digest.as_deref().unwrap_or_else(|| self.tag_or_default())
    }

    /// Full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

fn invalid(reference: &str, message: &str) -> MirrorError {
    MirrorError::InvalidReference {
        reference: reference.to_string(),
        message: message.to_string(),
    }
}

/// Split `name` into registry and repository, defaulting the registry when the
/// first component does not look like a hostname.
fn split_registry(name: &str, original: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(invalid(original, "missing repository"));
            }
            return Ok((first.to_string(), rest.to_string()));
        }
    }

    if name.is_empty() {
        return Err(invalid(original, "missing repository"));
    }

    // Bare names on Docker Hub live under library/
    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    Ok((DEFAULT_REGISTRY.to_string(), repository))
}

fn validate_digest(digest: &str) -> std::result::Result<(), String> {
    let Some((algorithm, hex)) = digest.split_once(':') else {
        return Err(format!("invalid digest '{}': expected algorithm:hex", digest));
    };
    if algorithm != "sha256" {
        return Err(format!("unsupported digest algorithm '{}'", algorithm));
    }
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("invalid sha256 digest '{}'", digest));
    }
    Ok(())
}
