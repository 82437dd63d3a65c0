use std::path::Path;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use thiserror::Error;

use super::paths;

pub const IGNORE_FILE_NAME: &str = ".skysyncignore";
pub const CACHE_DIR_NAME: &str = ".skysync.cache";
pub const PARTIAL_SUFFIX: &str = ".partial";

const SYSTEM_NAMES: &[&str] = &[".ds_store", "desktop.ini", "thumbs.db", "icon\r", ".directory"];
const SYSTEM_PREFIXES: &[&str] = &["~$", ".~", "._"];

#[derive(Debug, Error)]
pub enum IgnoreError {
    #[error("invalid ignore pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        source: globset::Error,
    },
    #[error("failed to read ignore file: {0}")]
    Io(#[from] std::io::Error),
}

/// Decides which paths never take part in syncing.
///
/// Selective-sync exclusions and system names apply in both directions. Rules
/// from the local ignore file only affect local collection.
#[derive(Debug, Clone)]
pub struct IgnorePatterns {
    excluded: Vec<String>,
    rules: GlobSet,
    dir_rules: GlobSet,
}

impl Default for IgnorePatterns {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl IgnorePatterns {
    pub fn new(excluded: &[String]) -> Self {
        Self {
            excluded: excluded.iter().map(|path| paths::normalize(path)).collect(),
            rules: GlobSet::empty(),
            dir_rules: GlobSet::empty(),
        }
    }

    /// Reads `.skysyncignore` from the sync root if it exists.
    pub fn load(root: &Path, excluded: &[String]) -> Result<Self, IgnoreError> {
        let ignore_file = root.join(IGNORE_FILE_NAME);
        let rules = match std::fs::read_to_string(&ignore_file) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };
        Self::from_rules(excluded, &rules)
    }

    /// Compiles gitignore-like rules: `#` comments, `/`-anchored patterns,
    /// trailing `/` for directories only. Negation is not supported.
    pub fn from_rules(excluded: &[String], text: &str) -> Result<Self, IgnoreError> {
        let mut rules = GlobSetBuilder::new();
        let mut dir_rules = GlobSetBuilder::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('!') {
                tracing::warn!(pattern = line, "negated ignore patterns are not supported");
                continue;
            }

            let dir_only = line.ends_with('/');
            let pattern = line.trim_end_matches('/');
            let anchored = pattern.starts_with('/') || pattern.contains('/');
            let base = if anchored {
                pattern.trim_start_matches('/').to_string()
            } else {
                format!("**/{pattern}")
            };

            rules.add(compile(&format!("{base}/**"))?);
            if dir_only {
                dir_rules.add(compile(&base)?);
            } else {
                rules.add(compile(&base)?);
            }
        }

        let build = |builder: GlobSetBuilder| {
            builder.build().map_err(|source| IgnoreError::Pattern {
                pattern: String::from("<set>"),
                source,
            })
        };

        Ok(Self {
            excluded: excluded.iter().map(|path| paths::normalize(path)).collect(),
            rules: build(rules)?,
            dir_rules: build(dir_rules)?,
        })
    }

    pub fn excluded(&self) -> &[String] {
        &self.excluded
    }

    /// Selective-sync exclusion: the path or one of its ancestors is excluded.
    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded
            .iter()
            .any(|excluded| paths::is_equal_or_child(path, excluded))
    }

    /// System files, partial downloads and the private cache directory.
    pub fn is_always_excluded(path: &str) -> bool {
        path.split('/')
            .filter(|part| !part.is_empty())
            .any(is_system_name)
    }

    pub fn matches_rules(&self, path: &str, is_dir: bool) -> bool {
        let relative = path.trim_start_matches('/');
        if relative.is_empty() {
            return false;
        }
        self.rules.is_match(relative) || (is_dir && self.dir_rules.is_match(relative))
    }

    pub fn should_skip_local(&self, path: &str, is_dir: bool) -> bool {
        Self::is_always_excluded(path) || self.is_excluded(path) || self.matches_rules(path, is_dir)
    }

    pub fn should_skip_remote(&self, path: &str) -> bool {
        Self::is_always_excluded(path) || self.is_excluded(path)
    }
}

fn compile(pattern: &str) -> Result<globset::Glob, IgnoreError> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .case_insensitive(true)
        .build()
        .map_err(|source| IgnoreError::Pattern {
            pattern: pattern.to_string(),
            source,
        })
}

fn is_system_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower == CACHE_DIR_NAME
        || lower == IGNORE_FILE_NAME
        || lower.ends_with(PARTIAL_SUFFIX)
        || SYSTEM_NAMES.contains(&lower.as_str())
        || SYSTEM_PREFIXES.iter().any(|prefix| lower.starts_with(prefix))
}
