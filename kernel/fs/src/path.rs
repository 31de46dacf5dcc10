//! Path parsing utilities.
//!
//! Paths are absolute, `/`-separated, with bounded total and component
//! lengths. Empty components collapse, `.` is identity, and `..` climbs
//! toward the root (which is its own parent).

/// Maximum accepted path length in bytes.
pub const MAX_PATH: usize = 4096;

/// Maximum length of a single component.
pub const MAX_NAME: usize = 255;

/// Returns `true` if the path starts with `/`.
#[must_use]
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Splits a path into its components, dropping empty segments.
///
/// `.` and `..` are yielded as-is; the tree walk interprets them.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Splits a path into `(parent, leaf)` for creation.
///
/// `"/a/b/c"` becomes `("/a/b", "c")` and `"/c"` becomes `("/", "c")`.
/// Returns `None` for the root itself or a path with no leaf.
#[must_use]
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let split_at = trimmed.rfind('/')?;
    let leaf = &trimmed[split_at + 1..];
    if leaf.is_empty() {
        return None;
    }
    let parent = if split_at == 0 { "/" } else { &trimmed[..split_at] };
    Some((parent, leaf))
}

/// Validates overall and per-component bounds.
#[must_use]
pub fn is_within_bounds(path: &str) -> bool {
    path.len() <= MAX_PATH && components(path).all(|c| c.len() <= MAX_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_skip_empty_segments() {
        let parts: Vec<_> = components("//usr///bin/ls/").collect();
        assert_eq!(parts, ["usr", "bin", "ls"]);
    }

    #[test]
    fn root_has_no_components() {
        assert_eq!(components("/").count(), 0);
    }

    #[test]
    fn absolute_check() {
        assert!(is_absolute("/etc"));
        assert!(!is_absolute("etc"));
        assert!(!is_absolute(""));
    }

    #[test]
    fn split_parent_basic() {
        assert_eq!(split_parent("/a/b/c"), Some(("/a/b", "c")));
        assert_eq!(split_parent("/c"), Some(("/", "c")));
        assert_eq!(split_parent("/a/b/"), Some(("/a", "b")));
    }

    #[test]
    fn split_parent_of_root_is_none() {
        assert_eq!(split_parent("/"), None);
        assert_eq!(split_parent("//"), None);
        assert_eq!(split_parent(""), None);
    }

    #[test]
    fn bounds_checking() {
        assert!(is_within_bounds("/ok/path"));
        let long_name = alloc::format!("/{}", "x".repeat(MAX_NAME + 1));
        assert!(!is_within_bounds(&long_name));
    }
}
