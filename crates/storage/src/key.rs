//! Mapping between logical keys and physical object names

/// Key prefix joined to every logical key
///
/// The prefix is stored without leading or trailing slashes. Physical names
/// are `prefix + "/" + key`; keys handed back to callers have it removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPrefix {
    prefix: String,
}

impl KeyPrefix {
    /// Create a prefix from configuration; `None` or "/" means no prefix
    pub fn new(prefix: Option<&str>) -> Self {
        Self {
            prefix: prefix.unwrap_or_default().trim_matches('/').to_string(),
        }
    }

    /// Whether no prefix is configured
    pub fn is_empty(&self) -> bool {
        self.prefix.is_empty()
    }

    /// Physical object name for a logical key
    pub fn join(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    /// Logical key for a physical object name
    ///
    /// Names outside the prefix are returned unchanged.
    pub fn strip<'a>(&self, physical: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            return physical;
        }
        physical
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(physical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_with_prefix() {
        let keys = KeyPrefix::new(Some("/tenant-a/"));
        assert_eq!(keys.join("model.bin"), "tenant-a/model.bin");
        assert_eq!(keys.join("a/b/c"), "tenant-a/a/b/c");
        assert_eq!(keys.join(""), "tenant-a/");
    }

    #[test]
    fn test_join_without_prefix() {
        let keys = KeyPrefix::new(None);
        assert!(keys.is_empty());
        assert_eq!(keys.join("model.bin"), "model.bin");

        let keys = KeyPrefix::new(Some("/"));
        assert!(keys.is_empty());
    }

    #[test]
    fn test_strip_inverts_join() {
        let keys = KeyPrefix::new(Some("tenant-a"));
        for key in ["file", "path/to/file", "trailing/"] {
            assert_eq!(keys.strip(&keys.join(key)), key);
        }
    }

    #[test]
    fn test_strip_leaves_foreign_names() {
        let keys = KeyPrefix::new(Some("tenant"));
        assert_eq!(keys.strip("tenant-b/file"), "tenant-b/file");
        assert_eq!(keys.strip("other/file"), "other/file");
    }
}
