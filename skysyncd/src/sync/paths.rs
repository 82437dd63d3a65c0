use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("sync path is empty")]
    Empty,
    #[error("sync path contains unsupported component")]
    UnsupportedComponent,
}

/// Maps a sync path ("/Docs/A.txt") under the local sync root.
pub fn local_path_for(root: &Path, path: &str) -> Result<PathBuf, PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = root.to_path_buf();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir => continue,
            Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

/// Inverse of [`local_path_for`]. Returns `None` for paths outside `root`.
pub fn sync_path_for(root: &Path, local: &Path) -> Option<String> {
    let relative = local.strip_prefix(root).ok()?;
    let sync = PathBuf::from("/").join(relative);
    Some(sync.to_string_lossy().replace('\\', "/"))
}

/// Case-folded form of a sync path, used as the index key.
pub fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    trimmed.to_lowercase()
}

pub fn parent_path(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    let (parent, _) = trimmed.rsplit_once('/')?;
    if parent.is_empty() {
        if trimmed.len() > 1 {
            Some("/".to_string())
        } else {
            None
        }
    } else {
        Some(parent.to_string())
    }
}

pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit_once('/').map_or(trimmed, |(_, name)| name)
}

pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" || parent.is_empty() {
        format!("/{name}")
    } else {
        format!("{}/{name}", parent.trim_end_matches('/'))
    }
}

/// Number of components below the root: "/" is 0, "/a" is 1, "/a/b" is 2.
pub fn depth(path: &str) -> usize {
    path.split('/').filter(|part| !part.is_empty()).count()
}

/// True when `path` equals `ancestor` or lies below it. Compares case-folded.
pub fn is_equal_or_child(path: &str, ancestor: &str) -> bool {
    let path = normalize(path);
    let ancestor = normalize(ancestor);
    if ancestor == "/" {
        return true;
    }
    path == ancestor || path.starts_with(&format!("{ancestor}/"))
}

pub fn is_child(path: &str, ancestor: &str) -> bool {
    is_equal_or_child(path, ancestor) && normalize(path) != normalize(ancestor)
}

/// Re-roots `path`, which lies at or below `from`, under `to`. Works by
/// component, so `from` may be spelled in any casing.
pub fn rebase(path: &str, from: &str, to: &str) -> String {
    let mut out = to.trim_end_matches('/').to_string();
    for part in path.split('/').filter(|part| !part.is_empty()).skip(depth(from)) {
        out.push('/');
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}
