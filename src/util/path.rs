use percent_encoding::percent_decode_str;

/// The blacklist entry that stands for "the whole sync folder".
pub const ROOT_SENTINEL: &str = "/";

/// Compute the prefix that listing results carry in front of a folder's
/// relative paths: the (decoded) path component of the remote base URL,
/// always ending in `/`.
///
/// Plain paths that are not URLs are used as they are.
pub fn base_prefix(remote_base_url: &str) -> String {
    let path = match url::Url::parse(remote_base_url) {
        Ok(url) => percent_decode_str(url.path()).decode_utf8_lossy().into_owned(),
        Err(_) => remote_base_url.to_string(),
    };

    if path.ends_with('/') {
        path
    } else {
        format!("{path}/")
    }
}

/// Strip the base prefix from a listed path.
///
/// Returns an empty string for the folder itself and for entries that do not
/// live under the prefix at all; callers drop those.
pub fn relative_to_base<'a>(full: &'a str, prefix: &str) -> &'a str {
    full.strip_prefix(prefix).unwrap_or("")
}

/// Last non-empty `/`-separated segment of a path.
///
/// `"docs/reports/"` → `"reports"`
pub fn leaf_name(path: &str) -> &str {
    path.rsplit('/').find(|s| !s.is_empty()).unwrap_or("")
}

/// Join a folder's remote base URL with a relative path, yielding the URL of
/// that directory (trailing `/` included).
pub fn join_remote(remote_base_url: &str, relative: &str) -> String {
    let base = remote_base_url.trim_end_matches('/');
    let rel = relative.trim_start_matches('/');
    if rel.is_empty() || rel.ends_with('/') {
        format!("{base}/{rel}")
    } else {
        format!("{base}/{rel}/")
    }
}

/// Comparison key of a blacklist entry: `a/b` and `a/b/` name the same
/// folder. The `/` sentinel keeps its form.
pub fn folder_key(entry: &str) -> &str {
    match entry.trim_end_matches('/') {
        "" => entry,
        trimmed => trimmed,
    }
}

/// Whether a blacklist entry lies at or beneath `path`.
///
/// The root path (empty string) covers every entry.
pub fn is_beneath(entry: &str, path: &str) -> bool {
    entry.starts_with(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_prefix_from_url() {
        assert_eq!(
            base_prefix("https://cloud.example.org/remote.php/webdav/Documents"),
            "/remote.php/webdav/Documents/"
        );
    }

    #[test]
    fn test_base_prefix_decodes_escapes() {
        assert_eq!(
            base_prefix("https://cloud.example.org/dav/My%20Files/"),
            "/dav/My Files/"
        );
    }

    #[test]
    fn test_base_prefix_plain_path() {
        assert_eq!(base_prefix("base"), "base/");
    }

    #[test]
    fn test_relative_to_base() {
        assert_eq!(relative_to_base("base/X", "base/"), "X");
        assert_eq!(relative_to_base("base/Y/Z", "base/"), "Y/Z");
        assert_eq!(relative_to_base("base/", "base/"), "");
        assert_eq!(relative_to_base("elsewhere/X", "base/"), "");
    }

    #[test]
    fn test_leaf_name() {
        assert_eq!(leaf_name("docs/reports/"), "reports");
        assert_eq!(leaf_name("Y/Z"), "Z");
        assert_eq!(leaf_name("X"), "X");
        assert_eq!(leaf_name(""), "");
    }

    #[test]
    fn test_join_remote() {
        assert_eq!(
            join_remote("https://h/dav/docs", "a/b/"),
            "https://h/dav/docs/a/b/"
        );
        assert_eq!(join_remote("https://h/dav/docs/", ""), "https://h/dav/docs/");
        assert_eq!(join_remote("https://h/dav/docs", "a"), "https://h/dav/docs/a/");
    }

    #[test]
    fn test_folder_key() {
        assert_eq!(folder_key("a/b/"), "a/b");
        assert_eq!(folder_key("a/b"), "a/b");
        assert_eq!(folder_key("/"), "/");
        assert_eq!(folder_key(""), "");
    }

    #[test]
    fn test_is_beneath() {
        assert!(is_beneath("a/b/", "a/"));
        assert!(is_beneath("a/", "a/"));
        assert!(!is_beneath("b/", "a/"));
        assert!(is_beneath("anything/", ""));
    }
}
