use std::{
    fs::{self, File},
    io,
    path::Path,
};

use anyhow::{bail, Context, Error};

// Linux errno for a rename across filesystem boundaries.
const EXDEV: i32 = 18;

/// Creates all directories in a path if they don't exist
pub fn create_dirs(path: impl AsRef<Path>) -> Result<(), Error> {
    fs::create_dir_all(path.as_ref()).context(format!(
        "Failed to create path: {}",
        path.as_ref().display()
    ))
}

/// Writes contents to a file atomically: the data lands in a temporary file in
/// the same directory which is synced and then renamed over the destination.
pub fn atomic_write_file(path: impl AsRef<Path>, contents: &[u8]) -> Result<(), Error> {
    use io::Write;

    let path = path.as_ref();
    let parent = path
        .parent()
        .with_context(|| format!("Path '{}' has no parent directory", path.display()))?;
    create_dirs(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .context("Failed to create temporary file")?;
    tmp.write_all(contents)
        .with_context(|| format!("Failed to write contents for '{}'", path.display()))?;
    tmp.as_file().sync_all().context("Failed to sync file")?;
    tmp.persist(path)
        .with_context(|| format!("Failed to persist '{}'", path.display()))?;
    Ok(())
}

/// Copies a file atomically, like [`atomic_write_file`] but streaming from an
/// existing source file.
pub fn atomic_copy_file(source: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<(), Error> {
    let source = source.as_ref();
    let dest = dest.as_ref();
    let parent = dest
        .parent()
        .with_context(|| format!("Path '{}' has no parent directory", dest.display()))?;
    create_dirs(parent)?;

    let mut reader = File::open(source)
        .with_context(|| format!("Failed to open source file '{}'", source.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .context("Failed to create temporary file")?;
    io::copy(&mut reader, &mut tmp).with_context(|| {
        format!(
            "Failed to copy '{}' to '{}'",
            source.display(),
            dest.display()
        )
    })?;
    tmp.as_file().sync_all().context("Failed to sync file")?;
    tmp.persist(dest)
        .with_context(|| format!("Failed to persist '{}'", dest.display()))?;
    Ok(())
}

/// Recursively copies a directory tree. Symlinks are recreated, other special
/// files are rejected.
pub fn copy_tree(source: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<(), Error> {
    let source = source.as_ref();
    let dest = dest.as_ref();
    create_dirs(dest)?;

    for entry in fs::read_dir(source).with_context(|| {
        format!("Failed to read contents of directory '{}'", source.display())
    })? {
        let entry = entry.context("Failed to read entry")?;
        let entry_dest = dest.join(entry.file_name());
        let file_type = entry.file_type().context("Failed to read entry type")?;
        if file_type.is_dir() {
            copy_tree(entry.path(), &entry_dest)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).with_context(|| {
                format!("Failed to read symlink '{}'", entry.path().display())
            })?;
            std::os::unix::fs::symlink(&link, &entry_dest).with_context(|| {
                format!("Failed to create symlink '{}'", entry_dest.display())
            })?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &entry_dest).with_context(|| {
                format!(
                    "Failed to copy '{}' to '{}'",
                    entry.path().display(),
                    entry_dest.display()
                )
            })?;
        } else {
            bail!(
                "Cannot copy special file '{}'",
                entry.path().display()
            );
        }
    }
    Ok(())
}

/// Moves a file or directory tree, falling back to copy-and-remove when the
/// destination is on a different filesystem.
pub fn move_tree(source: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<(), Error> {
    let source = source.as_ref();
    let dest = dest.as_ref();
    if let Some(parent) = dest.parent() {
        create_dirs(parent)?;
    }

    match fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(EXDEV) => {
            if source.is_dir() {
                copy_tree(source, dest)?;
                fs::remove_dir_all(source)
            } else {
                fs::copy(source, dest).map(|_| ())?;
                fs::remove_file(source)
            }
            .with_context(|| format!("Failed to remove '{}' after copy", source.display()))
        }
        Err(e) => Err(e).with_context(|| {
            format!(
                "Failed to move '{}' to '{}'",
                source.display(),
                dest.display()
            )
        }),
    }
}

/// Removes a path of any kind, ignoring a path that does not exist.
pub fn remove_path(path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    let metadata = match path.symlink_metadata() {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read metadata of '{}'", path.display()))
        }
    };
    if metadata.is_dir() {
        fs::remove_dir_all(path)
            .with_context(|| format!("Failed to remove directory: {}", path.display()))
    } else {
        fs::remove_file(path)
            .with_context(|| format!("Failed to remove file: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    #[test]
    fn test_atomic_write_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("some/nested/file.txt");
        atomic_write_file(&path, b"payload").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"payload");

        // Overwrites existing contents
        atomic_write_file(&path, b"other").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"other");
    }

    #[test]
    fn test_atomic_copy_file() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source.img");
        fs::write(&source, b"image data").unwrap();

        let dest = dir.path().join("out/copy.img");
        atomic_copy_file(&source, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"image data");
    }

    #[test]
    fn test_copy_tree() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("src");
        fs::create_dir_all(source.join("nested")).unwrap();
        fs::write(source.join("top"), b"top").unwrap();
        fs::write(source.join("nested/inner"), b"inner").unwrap();
        std::os::unix::fs::symlink("top", source.join("link")).unwrap();

        let dest = dir.path().join("dst");
        copy_tree(&source, &dest).unwrap();

        assert_eq!(fs::read(dest.join("top")).unwrap(), b"top");
        assert_eq!(fs::read(dest.join("nested/inner")).unwrap(), b"inner");
        assert_eq!(
            fs::read_link(dest.join("link")).unwrap(),
            Path::new("top")
        );
    }

    #[test]
    fn test_move_tree() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("src");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("file"), b"data").unwrap();

        let dest = dir.path().join("moved/away");
        move_tree(&source, &dest).unwrap();
        assert!(!source.exists());
        assert_eq!(fs::read(dest.join("file")).unwrap(), b"data");
    }

    #[test]
    fn test_remove_path() {
        let dir = tempdir().unwrap();

        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();
        remove_path(&file).unwrap();
        assert!(!file.exists());

        let tree = dir.path().join("tree");
        fs::create_dir_all(tree.join("sub")).unwrap();
        remove_path(&tree).unwrap();
        assert!(!tree.exists());

        // Missing paths are fine
        remove_path(dir.path().join("not-there")).unwrap();
    }
}
