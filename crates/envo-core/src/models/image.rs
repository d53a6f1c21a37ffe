use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{OrchestratorError, Result};

// [registry[:port]/]path[:tag][@algo:digest], path components lowercase.
static REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?P<registry>[a-zA-Z0-9.-]+(?::\d+)?)/)?(?P<path>[a-z0-9]+(?:[._-]+[a-z0-9]+)*(?:/[a-z0-9]+(?:[._-]+[a-z0-9]+)*)*)(?::(?P<tag>[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}))?(?:@(?P<digest>[a-z0-9]+:[a-fA-F0-9]{32,}))?$",
    )
    .unwrap()
});

/// A parsed image reference such as `docker.io/library/postgres:16`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub registry: Option<String>,
    pub path: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse a reference; malformed references are `ImageInvalid`.
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = |reason: &str| OrchestratorError::ImageInvalid {
            image: reference.to_string(),
            reason: reason.to_string(),
        };

        if reference.trim().is_empty() {
            return Err(invalid("reference is empty"));
        }

        let caps = REFERENCE_RE
            .captures(reference)
            .ok_or_else(|| invalid("invalid reference format"))?;

        // A first component without a dot, colon or "localhost" is part of the path.
        let (registry, path) = match caps.name("registry").map(|m| m.as_str()) {
            Some(r) if r.contains('.') || r.contains(':') || r == "localhost" => {
                (Some(r.to_string()), caps["path"].to_string())
            }
            Some(r) => {
                if r.chars().any(|c| c.is_ascii_uppercase()) {
                    return Err(invalid("repository name must be lowercase"));
                }
                (None, format!("{r}/{}", &caps["path"]))
            }
            None => (None, caps["path"].to_string()),
        };

        Ok(Self {
            registry,
            path,
            tag: caps.name("tag").map(|m| m.as_str().to_string()),
            digest: caps.name("digest").map(|m| m.as_str().to_string()),
        })
    }

    /// Tag to pull when none is given and no digest pins the image.
    pub fn tag_or_latest(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{registry}/")?;
        }
        f.write_str(&self.path)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}
