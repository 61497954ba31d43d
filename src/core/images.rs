//! Image naming helpers and the set of images followed after deploy.

use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};

/// Rewrite an image name into the default repository.
///
/// `gcr.io` style repositories support nesting, so the name is appended as
/// is. Elsewhere the name is flattened into a single path component.
pub fn apply_default_repo(default_repo: Option<&str>, image: &str) -> String {
    let Some(repo) = default_repo.map(|r| r.trim_end_matches('/')).filter(|r| !r.is_empty())
    else {
        return image.to_string();
    };

    if image == repo || image.starts_with(&format!("{}/", repo)) {
        return image.to_string();
    }

    if repo.starts_with("gcr.io/") || repo.contains(".gcr.io/") {
        return format!("{}/{}", repo, image);
    }

    let flattened: String = image
        .chars()
        .map(|c| if c == '/' || c == '.' { '_' } else { c })
        .collect();
    format!("{}/{}", repo, flattened)
}

/// Registry host of an image reference, when it names one
pub fn registry_of(image: &str) -> Option<&str> {
    let (first, _) = image.split_once('/')?;
    if first.contains('.') || first.contains(':') || first == "localhost" {
        Some(first)
    } else {
        None
    }
}

/// Split `repo:tag` (ignoring a digest suffix) into repository and tag
pub fn split_tag(reference: &str) -> (&str, Option<&str>) {
    let reference = reference.split('@').next().unwrap_or(reference);
    let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[name_start..].rfind(':') {
        Some(i) => {
            let at = name_start + i;
            (&reference[..at], Some(&reference[at + 1..]))
        }
        None => (reference, None),
    }
}

/// Images whose logs and ports are followed after a deploy
#[derive(Debug, Default)]
pub struct ImageSelector {
    images: RwLock<BTreeSet<String>>,
}

impl ImageSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add image references, returning whether any were new
    pub fn add<I, S>(&self, images: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = self.images.write().unwrap_or_else(PoisonError::into_inner);
        let mut added = false;
        for image in images {
            added |= set.insert(image.into());
        }
        added
    }

    pub fn contains(&self, image: &str) -> bool {
        self.images
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(image)
    }

    /// Snapshot of the followed images
    pub fn images(&self) -> Vec<String> {
        self.images
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_default_repo() {
        assert_eq!(apply_default_repo(None, "app"), "app");
        assert_eq!(apply_default_repo(Some(""), "app"), "app");
        assert_eq!(apply_default_repo(Some("repo/a/b"), "img"), "repo/a/b/img");
        assert_eq!(
            apply_default_repo(Some("registry.io/team"), "registry.io/team/app"),
            "registry.io/team/app"
        );
        assert_eq!(
            apply_default_repo(Some("registry.io/team"), "docker.io/library/app"),
            "registry.io/team/docker_io_library_app"
        );
        assert_eq!(
            apply_default_repo(Some("gcr.io/project"), "team/app"),
            "gcr.io/project/team/app"
        );
    }

    #[test]
    fn test_split_tag() {
        assert_eq!(split_tag("repo/app:v1"), ("repo/app", Some("v1")));
        assert_eq!(split_tag("localhost:5000/app"), ("localhost:5000/app", None));
        assert_eq!(
            split_tag("localhost:5000/app:v2@sha256:abc"),
            ("localhost:5000/app", Some("v2"))
        );
    }

    #[test]
    fn test_registry_of() {
        assert_eq!(registry_of("gcr.io/project/app"), Some("gcr.io"));
        assert_eq!(registry_of("localhost:5000/app"), Some("localhost:5000"));
        assert_eq!(registry_of("team/app"), None);
        assert_eq!(registry_of("app"), None);
    }

    #[test]
    fn test_selector_deduplicates() {
        let selector = ImageSelector::new();
        assert!(selector.add(["app:1", "base:1"]));
        assert!(!selector.add(["app:1"]));
        assert_eq!(selector.images(), vec!["app:1".to_string(), "base:1".to_string()]);
        assert!(selector.contains("base:1"));
    }
}
