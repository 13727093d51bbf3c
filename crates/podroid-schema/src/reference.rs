use crate::{Digest, SchemaError};
use std::fmt;

/// Registry host used when a reference names none.
pub const DEFAULT_REGISTRY: &str = "docker.io";
/// API endpoint that actually serves `docker.io` repositories.
pub const DOCKER_HUB_ENDPOINT: &str = "registry-1.docker.io";
pub const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Tag(String),
    Digest(Digest),
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Tag(tag) => f.write_str(tag),
            Selector::Digest(digest) => write!(f, "{digest}"),
        }
    }
}

/// A parsed `[registry/]repository[:tag|@digest]` image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub selector: Selector,
}

impl ImageReference {
    pub fn parse(input: &str) -> Result<Self, SchemaError> {
        let input = input.trim();
        let invalid = |reason: &str| SchemaError::InvalidReference {
            reference: input.to_owned(),
            reason: reason.to_owned(),
        };

        if input.is_empty() {
            return Err(invalid("reference is empty"));
        }
        if input.chars().any(char::is_whitespace) {
            return Err(invalid("reference contains whitespace"));
        }

        let (name, selector) = if let Some((name, digest)) = input.split_once('@') {
            (name, Selector::Digest(Digest::parse(digest)?))
        } else {
            let last_slash = input.rfind('/').map_or(0, |i| i + 1);
            match input[last_slash..].rfind(':') {
                Some(i) => {
                    let split = last_slash + i;
                    let tag = &input[split + 1..];
                    if !valid_tag(tag) {
                        return Err(invalid("tag must match [A-Za-z0-9_][A-Za-z0-9_.-]{0,127}"));
                    }
                    (&input[..split], Selector::Tag(tag.to_owned()))
                }
                None => (input, Selector::Tag(DEFAULT_TAG.to_owned())),
            }
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_owned(), rest.to_owned())
            }
            _ => (DEFAULT_REGISTRY.to_owned(), name.to_owned()),
        };

        let registry = if registry == "index.docker.io" {
            DEFAULT_REGISTRY.to_owned()
        } else {
            registry
        };

        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };

        if !valid_repository(&repository) {
            return Err(invalid(
                "repository must be lowercase path components of [a-z0-9._-]",
            ));
        }

        Ok(Self {
            registry,
            repository,
            selector,
        })
    }

    /// Host that serves the registry API for this reference.
    pub fn endpoint_host(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY {
            DOCKER_HUB_ENDPOINT
        } else {
            &self.registry
        }
    }

    /// The `<tag-or-digest>` path segment of a manifest request.
    pub fn reference(&self) -> String {
        self.selector.to_string()
    }

    #[must_use]
    pub fn with_digest(&self, digest: Digest) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            selector: Selector::Digest(digest),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.selector {
            Selector::Tag(tag) => write!(f, "{}/{}:{tag}", self.registry, self.repository),
            Selector::Digest(d) => write!(f, "{}/{}@{d}", self.registry, self.repository),
        }
    }
}

fn valid_tag(tag: &str) -> bool {
    let mut bytes = tag.bytes();
    let first_ok = bytes
        .next()
        .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_');
    first_ok
        && tag.len() <= 128
        && bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-')
}

fn valid_repository(repo: &str) -> bool {
    !repo.is_empty()
        && repo.split('/').all(|component| {
            !component.is_empty()
                && component.bytes().all(|b| {
                    b.is_ascii_lowercase()
                        || b.is_ascii_digit()
                        || b == b'.'
                        || b == b'_'
                        || b == b'-'
                })
        })
}
