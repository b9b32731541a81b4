use std::io::Write;
use std::path::{Path, PathBuf};

/// Result of linking a file into place.
#[derive(Debug, PartialEq, Eq)]
pub enum LinkOutcome {
    Created,
    /// The destination already pointed to the requested source.
    Existing,
    /// The destination exists and points somewhere else.
    Conflict(PathBuf),
}

/// Creates `dest` as a symlink to `src`. Linking twice to the same source is a no-op.
pub fn symlink_idempotent(src: &Path, dest: &Path) -> crate::Result<LinkOutcome> {
    match std::fs::read_link(dest) {
        Ok(target) => {
            if target == src {
                Ok(LinkOutcome::Existing)
            } else {
                Ok(LinkOutcome::Conflict(target))
            }
        }
        Err(_) if dest.exists() => Ok(LinkOutcome::Conflict(dest.to_path_buf())),
        Err(_) => {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::os::unix::fs::symlink(src, dest)?;
            Ok(LinkOutcome::Created)
        }
    }
}

/// Writes the whole content into a temporary file and moves it over `path`.
pub fn write_atomic(path: &Path, content: &[u8]) -> crate::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(content)?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Removes a file or a symlink. Missing files are ignored.
pub fn remove_if_exists(path: &Path) -> crate::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub fn is_empty_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.len() == 0)
        .unwrap_or(false)
}

pub fn make_executable(path: &Path) -> crate::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o740))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{LinkOutcome, remove_if_exists, symlink_idempotent, write_atomic};

    #[test]
    fn test_symlink_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("out_WFK");
        let other = dir.path().join("out_DEN");
        std::fs::write(&src, "wfk").unwrap();
        std::fs::write(&other, "den").unwrap();
        let dest = dir.path().join("indata/in_WFK");

        assert_eq!(
            symlink_idempotent(&src, &dest).unwrap(),
            LinkOutcome::Created
        );
        assert_eq!(
            symlink_idempotent(&src, &dest).unwrap(),
            LinkOutcome::Existing
        );
        assert_eq!(
            symlink_idempotent(&other, &dest).unwrap(),
            LinkOutcome::Conflict(src)
        );
    }

    #[test]
    fn test_write_atomic_and_remove() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("autoparal.json");
        write_atomic(&path, b"{}").unwrap();
        write_atomic(&path, b"[]").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[]");
        assert!(remove_if_exists(&path).unwrap());
        assert!(!remove_if_exists(&path).unwrap());
    }
}
