use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
#[error("path {path:?} escapes the boot directory")]
pub struct PathTraversal {
    pub path: String,
}

/// Join `child` onto `base` and normalize the result without consulting
/// the filesystem.
///
/// `base` may be relative, in which case it is resolved against the
/// current working directory first. The joined path is normalized
/// textually (`.` and `..` components are collapsed, separators are
/// squashed) and returned only if it still lies strictly below `base`.
/// Symbolic links are not followed here; callers apply their own "is a
/// regular file" checks after the guard.
pub fn normalize(base: impl AsRef<Path>, child: impl AsRef<Path>) -> Result<PathBuf, PathTraversal> {
    let child = child.as_ref();
    let traversal = || PathTraversal {
        path: child.to_string_lossy().into_owned(),
    };

    let base = lexical_clean(&absolute(base.as_ref()).ok_or_else(&traversal)?);
    let joined = lexical_clean(&base.join(child));

    // Equality means the child resolved to the base itself, which is not
    // a servable path either.
    if joined.starts_with(&base) && joined != base {
        Ok(joined)
    } else {
        Err(traversal())
    }
}

fn absolute(path: &Path) -> Option<PathBuf> {
    if path.is_absolute() {
        Some(path.to_path_buf())
    } else {
        std::env::current_dir().ok().map(|cwd| cwd.join(path))
    }
}

/// Collapse `.` and `..` components textually. `..` at the root stays at
/// the root, matching how classic path normalization treats `/..`.
fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}
