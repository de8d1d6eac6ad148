use camino::Utf8Path;
use std::borrow::Cow;

/// How paths are spelled on the archive tool's command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathStyle {
    #[default]
    Native,
    /// The tool is a Windows binary running under Wine.
    Wine,
}

impl PathStyle {
    /// `Wine` when the template's program is `wine` or `wine64`.
    pub fn for_template(template: &str) -> Self {
        let under_wine = template
            .split_whitespace()
            .next()
            .and_then(|program| Utf8Path::new(program.trim_matches('"')).file_name())
            .is_some_and(|name| name == "wine" || name == "wine64");
        if under_wine {
            Self::Wine
        } else {
            Self::Native
        }
    }

    pub fn to_tool_path<'a>(&self, path: &'a Utf8Path) -> Cow<'a, str> {
        match self {
            Self::Native => Cow::Borrowed(path.as_str()),
            Self::Wine => Cow::Owned(wine_path(path.as_str())),
        }
    }
}

fn wine_path(path_str: &str) -> String {
    if !path_str.starts_with('/') {
        return path_str.replace('/', "\\");
    }

    // Paths inside a prefix map onto its C: drive, e.g.
    // `~/.wine/drive_c/Games/out` -> `C:\Games\out`.
    const DRIVE_C_SEGMENT: &str = "/drive_c";
    if let Some(idx) = path_str.rfind(DRIVE_C_SEGMENT) {
        let after = &path_str[idx + DRIVE_C_SEGMENT.len()..];
        if after.is_empty() || after.starts_with('/') {
            let after = after.strip_prefix('/').unwrap_or(after);
            return format!("C:\\{}", after.replace('/', "\\"));
        }
    }

    // Wine exposes the host root as Z:
    format!("Z:{}", path_str.replace('/', "\\"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_paths_map_to_c_drive() {
        let p = Utf8Path::new("/home/user/.wine/drive_c/Games/TWoW/Data/patch-8.mpq");
        assert_eq!(
            PathStyle::Wine.to_tool_path(p),
            r"C:\Games\TWoW\Data\patch-8.mpq"
        );
    }

    #[test]
    fn host_paths_map_to_z_drive() {
        let p = Utf8Path::new("/srv/patchwork/output/patch-9.mpq");
        assert_eq!(
            PathStyle::Wine.to_tool_path(p),
            r"Z:\srv\patchwork\output\patch-9.mpq"
        );
        assert_eq!(PathStyle::Native.to_tool_path(p), p.as_str());
    }
}
