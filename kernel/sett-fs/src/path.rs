//! Path handling for the VFS.

/// Whether `path` is absolute.
#[must_use]
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Iterates the non-empty components of a path. Repeated, leading, and
/// trailing slashes collapse.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Splits a path into its parent directory and final component.
///
/// Returns `None` for the root or an empty path.
#[must_use]
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    let cut = trimmed.rfind('/')?;
    let name = &trimmed[cut + 1..];
    if name.is_empty() {
        return None;
    }
    let parent = if cut == 0 { "/" } else { &trimmed[..cut] };
    Some((parent, name))
}

/// Picks the longest mount point that prefixes `path`.
///
/// A mount matches when the path equals it or continues it at a `/`
/// boundary; `/` matches everything.
pub fn longest_prefix_match<'a>(
    path: &str,
    mounts: impl Iterator<Item = &'a str>,
) -> Option<&'a str> {
    let mut best: Option<&str> = None;
    for mount in mounts {
        let matches = mount == "/"
            || path == mount
            || (path.starts_with(mount) && path.as_bytes().get(mount.len()) == Some(&b'/'));
        if matches && best.is_none_or(|b| mount.len() > b.len()) {
            best = Some(mount);
        }
    }
    best
}

/// Removes the mount-point prefix from `path`.
#[must_use]
pub fn strip_mount_prefix<'a>(path: &'a str, mount: &str) -> &'a str {
    if mount == "/" {
        path.strip_prefix('/').unwrap_or(path)
    } else {
        path[mount.len()..].trim_start_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_iteration() {
        let parts: Vec<_> = components("/usr//bin/ls/").collect();
        assert_eq!(parts, ["usr", "bin", "ls"]);
        assert_eq!(components("/").count(), 0);
    }

    #[test]
    fn parent_splitting() {
        assert_eq!(split_parent("/etc/motd"), Some(("/etc", "motd")));
        assert_eq!(split_parent("/motd"), Some(("/", "motd")));
        assert_eq!(split_parent("/a/b/c/"), Some(("/a/b", "c")));
        assert_eq!(split_parent("/"), None);
    }

    #[test]
    fn longest_prefix_prefers_deepest_mount() {
        let mounts = ["/", "/dev", "/dev/block"];
        assert_eq!(
            longest_prefix_match("/dev/block/0", mounts.iter().copied()),
            Some("/dev/block")
        );
        assert_eq!(
            longest_prefix_match("/dev/null", mounts.iter().copied()),
            Some("/dev")
        );
        assert_eq!(
            longest_prefix_match("/device", mounts.iter().copied()),
            Some("/")
        );
    }

    #[test]
    fn mount_prefix_stripping() {
        assert_eq!(strip_mount_prefix("/etc/motd", "/"), "etc/motd");
        assert_eq!(strip_mount_prefix("/dev/null", "/dev"), "null");
        assert_eq!(strip_mount_prefix("/dev", "/dev"), "");
    }
}
