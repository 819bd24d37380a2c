use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Path filter applied before a change reaches the pending set.
///
/// A path is ignored when any component equals one of `names`, its
/// extension is in `extensions`, its file name ends with one of `suffixes`,
/// or it lies under one of `paths`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreRules {
    /// File or directory names matched against every path component.
    pub names: Vec<String>,
    /// Extensions without the leading dot, compared case-insensitively.
    pub extensions: Vec<String>,
    /// File name suffixes such as editor backup markers.
    pub suffixes: Vec<String>,
    /// Subtrees to skip. Relative entries match anywhere in the path.
    pub paths: Vec<PathBuf>,
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self {
            names: [".git", ".hg", ".svn", "node_modules", "target", ".idea", "__pycache__"]
                .into_iter()
                .map(String::from)
                .collect(),
            extensions: ["swp", "swo", "swx", "tmp"]
                .into_iter()
                .map(String::from)
                .collect(),
            suffixes: vec!["~".to_string(), ".crswap".to_string()],
            paths: Vec::new(),
        }
    }
}

impl IgnoreRules {
    /// Rules that ignore nothing.
    pub fn none() -> Self {
        Self {
            names: Vec::new(),
            extensions: Vec::new(),
            suffixes: Vec::new(),
            paths: Vec::new(),
        }
    }

    /// Builds rules from short patterns:
    ///
    /// * `*.ext` ignores an extension
    /// * `*tail` ignores a file name suffix
    /// * anything containing a separator ignores that subtree
    /// * a bare name ignores any component with that name
    pub fn from_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Self::none();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            if let Some(ext) = pattern.strip_prefix("*.") {
                rules.extensions.push(ext.to_ascii_lowercase());
            } else if let Some(tail) = pattern.strip_prefix('*') {
                rules.suffixes.push(tail.to_string());
            } else if pattern.contains(['/', '\\']) {
                rules
                    .paths
                    .push(PathBuf::from(pattern.trim_end_matches(['/', '\\'])));
            } else {
                rules.names.push(pattern.to_string());
            }
        }
        rules
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        let components: Vec<&OsStr> = path
            .components()
            .filter_map(|component| match component {
                Component::Normal(segment) => Some(segment),
                _ => None,
            })
            .collect();

        if components
            .iter()
            .any(|segment| self.names.iter().any(|name| OsStr::new(name) == *segment))
        {
            return true;
        }

        if let Some(ext) = path.extension().and_then(OsStr::to_str)
            && self
                .extensions
                .iter()
                .any(|ignored| ignored.eq_ignore_ascii_case(ext))
        {
            return true;
        }

        if let Some(name) = path.file_name().and_then(OsStr::to_str)
            && self.suffixes.iter().any(|suffix| name.ends_with(suffix.as_str()))
        {
            return true;
        }

        self.paths.iter().any(|prefix| {
            if prefix.is_absolute() {
                path.starts_with(prefix)
            } else {
                contains_run(&components, prefix)
            }
        })
    }
}

/// Whether `prefix`'s components appear consecutively in `components`.
fn contains_run(components: &[&OsStr], prefix: &Path) -> bool {
    let needle: Vec<&OsStr> = prefix
        .components()
        .filter_map(|component| match component {
            Component::Normal(segment) => Some(segment),
            _ => None,
        })
        .collect();
    !needle.is_empty()
        && components
            .windows(needle.len())
            .any(|window| window == needle.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_skip_vcs_and_editor_noise() {
        let rules = IgnoreRules::default();
        assert!(rules.is_ignored(Path::new("/repo/.git/index")));
        assert!(rules.is_ignored(Path::new("/repo/web/node_modules/x/index.js")));
        assert!(rules.is_ignored(Path::new("/repo/src/.main.rs.swp")));
        assert!(rules.is_ignored(Path::new("/repo/src/main.rs~")));
        assert!(!rules.is_ignored(Path::new("/repo/src/main.rs")));
        assert!(!rules.is_ignored(Path::new("/repo/targets.md")));
    }

    #[test]
    fn patterns_map_to_rule_kinds() {
        let rules = IgnoreRules::from_patterns(["*.LOG", "*.bak", "build", "docs/generated/", ""]);
        assert_eq!(rules.extensions, vec!["log", "bak"]);
        assert_eq!(rules.names, vec!["build"]);
        assert_eq!(rules.paths, vec![PathBuf::from("docs/generated")]);
        assert!(rules.suffixes.is_empty());

        assert!(rules.is_ignored(Path::new("/p/server.log")));
        assert!(rules.is_ignored(Path::new("/p/build/out.o")));
        assert!(rules.is_ignored(Path::new("/p/docs/generated/api.md")));
        assert!(!rules.is_ignored(Path::new("/p/docs/guide.md")));
        assert!(!rules.is_ignored(Path::new("/p/.git/HEAD")), "defaults replaced");
    }

    #[test]
    fn absolute_paths_match_as_prefix_only() {
        let rules = IgnoreRules::from_patterns(["/srv/cache"]);
        assert!(rules.is_ignored(Path::new("/srv/cache/blob")));
        assert!(!rules.is_ignored(Path::new("/home/srv/cache/blob")));
    }
}
