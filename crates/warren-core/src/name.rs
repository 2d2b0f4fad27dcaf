//! Hierarchical container names and namespace-relative resolution.
//!
//! Names form a tree: the root container is `"/"`, children are
//! `parent/child`. Components are limited to `[A-Za-z0-9_@:.-]`; `self`
//! and `.` are reserved. A client only sees the part of the tree under its
//! own namespace prefix; [`resolve_name`] and [`compose_name`] translate
//! between the client's view and absolute names. Both operate on `/`
//! separated components, so a namespace never leaks access to a sibling
//! that merely shares a string prefix.

use crate::error::{Error, ErrorKind, Result};

/// Absolute name of the root container.
pub const ROOT_CONTAINER: &str = "/";
/// Reserved alias for the client's own container.
pub const SELF_CONTAINER: &str = "self";
/// Reserved alias for the parent of the client's namespace.
pub const DOT_CONTAINER: &str = ".";
/// Prefix for absolute names escaping the namespace-relative scheme.
pub const ROOT_NAMESPACE: &str = "/warren/";

/// Validates a container name against length and character rules.
///
/// `max_name` bounds the whole path, `max_component` a single component.
///
/// # Errors
///
/// Returns `InvalidValue` describing the first violation.
pub fn valid_name(name: &str, max_name: usize, max_component: usize) -> Result<()> {
    if name.is_empty() {
        return Err(Error::new(ErrorKind::InvalidValue, "container name is empty"));
    }
    if name.len() > max_name {
        return Err(Error::new(ErrorKind::InvalidValue, "container name too long"));
    }
    if name.starts_with('/') {
        if name == ROOT_CONTAINER {
            return Ok(());
        }
        return Err(Error::new(
            ErrorKind::InvalidValue,
            "container name starts with '/'",
        ));
    }

    for component in name.split('/') {
        if component.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                "double or trailing '/' in container name",
            ));
        }
        if component.len() > max_component {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("container name component too long: '{component}'"),
            ));
        }
        if component == SELF_CONTAINER {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                "container name 'self' is reserved",
            ));
        }
        if component == DOT_CONTAINER {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                "container name '.' is reserved",
            ));
        }
        for ch in component.chars() {
            if !ch.is_ascii_alphanumeric() && !matches!(ch, '_' | '-' | '@' | ':' | '.') {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("forbidden character '{ch}' in container name"),
                ));
            }
        }
    }

    Ok(())
}

/// Returns the parent name; the root is its own logical parent.
#[must_use]
pub fn parent_name(name: &str) -> String {
    match name.rfind('/') {
        Some(0) | None => ROOT_CONTAINER.to_string(),
        Some(sep) => name[..sep].to_string(),
    }
}

/// Returns the last path component.
#[must_use]
pub fn first_name(name: &str) -> &str {
    match name.rfind('/') {
        Some(sep) => &name[sep + 1..],
        None => name,
    }
}

/// Depth of the name: the root is 0, its children 1.
#[must_use]
pub fn level(name: &str) -> usize {
    if name == ROOT_CONTAINER {
        0
    } else {
        name.split('/').count()
    }
}

/// True if `name` equals `ancestor` or lies underneath it.
///
/// Matching is by whole components: `a` is not under `ab`.
#[must_use]
pub fn is_under(name: &str, ancestor: &str) -> bool {
    if ancestor == ROOT_CONTAINER || name == ancestor {
        return true;
    }
    name.strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Joins a namespace prefix and a relative name into an absolute name.
fn join_ns(ns: &str, relative: &str) -> String {
    if ns.is_empty() {
        relative.to_string()
    } else {
        format!("{ns}/{relative}")
    }
}

/// Resolves a request-supplied name into an absolute container name.
///
/// `ns` is the client's namespace prefix (absolute, no trailing slash,
/// empty for the root namespace) and `client_name` the absolute name of the
/// client's own container.
///
/// # Errors
///
/// Returns `Permission` when an absolute `/warren/...` name escapes `ns`.
pub fn resolve_name(relative: &str, ns: &str, client_name: &str) -> Result<String> {
    if relative == ROOT_CONTAINER {
        return Ok(ROOT_CONTAINER.to_string());
    }
    if relative == SELF_CONTAINER {
        return Ok(client_name.to_string());
    }
    if relative == DOT_CONTAINER {
        if ns.is_empty() {
            return Ok(ROOT_CONTAINER.to_string());
        }
        return Ok(parent_name(ns));
    }
    if let Some(rest) = relative.strip_prefix("self/") {
        if client_name == ROOT_CONTAINER {
            return Ok(rest.to_string());
        }
        return Ok(format!("{client_name}/{rest}"));
    }
    if let Some(rest) = relative.strip_prefix(ROOT_NAMESPACE) {
        if !is_under(rest, if ns.is_empty() { ROOT_CONTAINER } else { ns }) {
            return Err(Error::new(
                ErrorKind::Permission,
                "absolute container name out of current namespace",
            ));
        }
        return Ok(rest.to_string());
    }
    Ok(join_ns(ns, relative))
}

/// Expresses an absolute name in the client's namespace.
///
/// # Errors
///
/// Returns `Permission` when the container is not reachable from `ns`.
pub fn compose_name(name: &str, ns: &str) -> Result<String> {
    if name == ROOT_CONTAINER {
        return Ok(ROOT_CONTAINER.to_string());
    }
    if ns.is_empty() {
        return Ok(name.to_string());
    }
    if name == ns {
        return Ok(SELF_CONTAINER.to_string());
    }
    match name.strip_prefix(ns) {
        Some(rest) if rest.starts_with('/') => Ok(rest[1..].to_string()),
        _ => Err(Error::new(
            ErrorKind::Permission,
            format!("cannot access container {name} from namespace {ns}/"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAME_MAX: usize = 200;
    const COMPONENT_MAX: usize = 128;

    fn check(name: &str) -> Result<()> {
        valid_name(name, NAME_MAX, COMPONENT_MAX)
    }

    #[test]
    fn accepts_reasonable_names() {
        for name in ["a", "a/b", "web-frontend", "a_b.c:d@e", "a/b/c/d"] {
            assert!(check(name).is_ok(), "{name} should be valid");
        }
        assert!(check(ROOT_CONTAINER).is_ok());
    }

    #[test]
    fn rejects_bad_names() {
        for name in ["", "/a", "a//b", "a/", "self", "a/self/b", ".", "a/.", "a b", "a\tb"] {
            assert!(check(name).is_err(), "{name} should be invalid");
        }
    }

    #[test]
    fn rejects_long_components() {
        let long = "x".repeat(COMPONENT_MAX + 1);
        assert!(check(&long).is_err());
        assert!(check(&"x".repeat(COMPONENT_MAX)).is_ok());
    }

    #[test]
    fn parent_and_leaf() {
        assert_eq!(parent_name("a"), "/");
        assert_eq!(parent_name("a/b/c"), "a/b");
        assert_eq!(first_name("a/b/c"), "c");
        assert_eq!(first_name("a"), "a");
        assert_eq!(level("/"), 0);
        assert_eq!(level("a"), 1);
        assert_eq!(level("a/b/c"), 3);
    }

    #[test]
    fn is_under_splits_components() {
        assert!(is_under("a/b", "a"));
        assert!(is_under("a", "a"));
        assert!(is_under("a/b", "/"));
        assert!(!is_under("ab", "a"));
        assert!(!is_under("a", "a/b"));
    }

    #[test]
    fn resolve_relative_names() {
        assert_eq!(resolve_name("x", "ns", "ns").unwrap(), "ns/x");
        assert_eq!(resolve_name("x", "", "/").unwrap(), "x");
        assert_eq!(resolve_name("/", "ns", "ns").unwrap(), "/");
        assert_eq!(resolve_name("self", "ns", "ns/sub").unwrap(), "ns/sub");
        assert_eq!(resolve_name("self/y", "ns", "ns/sub").unwrap(), "ns/sub/y");
        assert_eq!(resolve_name(".", "a/b", "a/b").unwrap(), "a");
        assert_eq!(resolve_name(".", "", "/").unwrap(), "/");
    }

    #[test]
    fn resolve_absolute_names() {
        assert_eq!(resolve_name("/warren/ns/x", "ns", "ns").unwrap(), "ns/x");
        assert_eq!(resolve_name("/warren/a/b", "", "/").unwrap(), "a/b");
        // An absolute name must stay inside the namespace, and prefix
        // matching is component-wise.
        assert!(resolve_name("/warren/other", "ns", "ns").is_err());
        assert!(resolve_name("/warren/nsx/y", "ns", "ns").is_err());
    }

    #[test]
    fn compose_names() {
        assert_eq!(compose_name("ns/x", "ns").unwrap(), "x");
        assert_eq!(compose_name("/", "ns").unwrap(), "/");
        assert_eq!(compose_name("ns", "ns").unwrap(), "self");
        assert_eq!(compose_name("a/b", "").unwrap(), "a/b");
        assert!(compose_name("other/x", "ns").is_err());
        assert!(compose_name("nsx", "ns").is_err());
    }
}
