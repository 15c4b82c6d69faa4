/// Split a path into (parent directory path, leaf name).
///
/// `""` denotes the mount root, so root-level entries come back with an
/// empty parent. One trailing slash is stripped before splitting and a
/// leading slash marks a root-level entry.
pub fn split_path(path: &str) -> (&str, &str) {
    let p = path.strip_suffix('/').unwrap_or(path);
    match p.rfind('/') {
        Some(idx) if idx > 0 => (&p[..idx], &p[idx + 1..]),
        Some(_) => ("", &p[1..]),
        None => ("", p),
    }
}

/// Inverse of `split_path` for the root-relative form used throughout.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("a/b/c.txt"), ("a/b", "c.txt"));
        assert_eq!(split_path("a/b"), ("a", "b"));
        assert_eq!(split_path("a"), ("", "a"));
        assert_eq!(split_path("a/"), ("", "a"));
        assert_eq!(split_path("/a"), ("", "a"));
        assert_eq!(split_path("/a/b"), ("/a", "b"));
        assert_eq!(split_path(""), ("", ""));
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "a"), "a");
        assert_eq!(join_path("a", "b"), "a/b");
        assert_eq!(join_path("a/b", "c"), "a/b/c");
    }

    #[test]
    fn test_split_join_round_trip() {
        for path in ["a", "a/b", "deep/nested/leaf.bin"] {
            let (dir, name) = split_path(path);
            assert_eq!(join_path(dir, name), path);
        }
    }
}
