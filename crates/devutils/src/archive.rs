use std::{fs::File, path::Path};

use anyhow::{Context, Error};

use crate::files::create_dirs;

/// Extracts a tar archive into the given directory.
pub fn unpack_tar(archive: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<(), Error> {
    let archive = archive.as_ref();
    let dest = dest.as_ref();
    create_dirs(dest)?;

    let file = File::open(archive)
        .with_context(|| format!("Failed to open archive '{}'", archive.display()))?;
    tar::Archive::new(file)
        .unpack(dest)
        .with_context(|| format!("Failed to unpack '{}'", archive.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use tempfile::tempdir;

    #[test]
    fn test_unpack_tar() {
        let dir = tempdir().unwrap();

        // Build a small archive with one directory and one file
        let archive_path = dir.path().join("content.tar");
        let mut builder = tar::Builder::new(File::create(&archive_path).unwrap());
        let payload: &[u8] = b"hello from the archive";
        let mut header = tar::Header::new_gnu();
        header.set_size(payload.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "sub/file.txt", payload)
            .unwrap();
        builder.finish().unwrap();
        drop(builder);

        let dest = dir.path().join("out");
        unpack_tar(&archive_path, &dest).unwrap();
        assert_eq!(fs::read(dest.join("sub/file.txt")).unwrap(), payload);
    }
}
