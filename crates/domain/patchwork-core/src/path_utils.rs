pub struct PatchPath;

impl PatchPath {
    /// Standardize directory separators to forward slashes.
    /// This is the wire format for manifest paths and staging layout.
    pub fn normalize(path: &str) -> String {
        path.replace('\\', "/")
    }

    /// Key used for identity comparisons. Archive member names are case-insensitive.
    pub fn canonicalize(path: &str) -> String {
        Self::normalize(path).to_lowercase()
    }

    /// Member names inside an MPQ use backslashes.
    pub fn to_member(path: &str) -> String {
        Self::normalize(path).replace('/', "\\")
    }

    /// Reject absolute paths and parent traversal coming from a remote manifest.
    pub fn verify_safe(rel_path: &str) -> bool {
        let normalized = Self::normalize(rel_path);
        if normalized.is_empty() || normalized.starts_with('/') {
            return false;
        }
        // Drive letters (`C:`) are absolute on Windows even after normalization.
        if normalized.len() > 1 && normalized.as_bytes()[1] == b':' {
            return false;
        }
        !normalized.split('/').any(|seg| seg == "..")
    }
}

#[cfg(test)]
mod tests {
    use super::PatchPath;

    #[test]
    fn member_names_use_backslashes() {
        assert_eq!(
            PatchPath::to_member("Interface/FrameXML/UIParent.lua"),
            "Interface\\FrameXML\\UIParent.lua"
        );
    }

    #[test]
    fn traversal_and_absolute_paths_are_unsafe() {
        assert!(PatchPath::verify_safe("Interface/a.lua"));
        assert!(PatchPath::verify_safe("Data\\patch-3.mpq"));
        assert!(!PatchPath::verify_safe("../etc/passwd"));
        assert!(!PatchPath::verify_safe("Interface\\..\\..\\x"));
        assert!(!PatchPath::verify_safe("/etc/passwd"));
        assert!(!PatchPath::verify_safe("C:\\Windows\\x.dll"));
        assert!(!PatchPath::verify_safe(""));
    }

    #[test]
    fn canonical_form_folds_case_and_separators() {
        assert_eq!(
            PatchPath::canonicalize("Interface\\AddOns\\Foo.TOC"),
            PatchPath::canonicalize("interface/addons/foo.toc")
        );
    }
}
