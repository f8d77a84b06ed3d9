use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

use anyhow::{Context, Error};

/// Reads exactly `size` bytes from a device (or device-backing file) starting
/// at `offset`.
pub fn read_region(device: impl AsRef<Path>, offset: u64, size: u64) -> Result<Vec<u8>, Error> {
    let device = device.as_ref();
    let mut file = File::open(device)
        .with_context(|| format!("Failed to open device '{}'", device.display()))?;
    file.seek(SeekFrom::Start(offset))
        .with_context(|| format!("Failed to seek to offset {offset}"))?;

    let mut buf = vec![0; size as usize];
    file.read_exact(&mut buf).with_context(|| {
        format!(
            "Failed to read {size} bytes at offset {offset} of '{}'",
            device.display()
        )
    })?;
    Ok(buf)
}

/// Writes the contents of a source file into the device region starting at
/// `offset`, padding with zeros up to `size` when the source is shorter. The
/// data is synced to stable storage before returning.
pub fn write_region_from(
    device: impl AsRef<Path>,
    offset: u64,
    size: u64,
    source: impl AsRef<Path>,
) -> Result<(), Error> {
    let source = source.as_ref();
    let reader = File::open(source)
        .with_context(|| format!("Failed to open source image '{}'", source.display()))?;
    let source_size = reader
        .metadata()
        .with_context(|| format!("Failed to read metadata of '{}'", source.display()))?
        .len();
    // Source bytes followed by zeros, exactly `size` bytes in total
    let padded = reader.chain(io::repeat(0)).take(size);
    write_region_reader(device.as_ref(), offset, padded, size.min(source_size))
}

/// Writes a buffer into the device region starting at `offset` and syncs.
pub fn write_region(device: impl AsRef<Path>, offset: u64, data: &[u8]) -> Result<(), Error> {
    write_region_reader(device.as_ref(), offset, data, data.len() as u64)
}

fn write_region_reader(
    device: &Path,
    offset: u64,
    mut reader: impl Read,
    expected_min: u64,
) -> Result<(), Error> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(device)
        .with_context(|| format!("Failed to open device '{}' for writing", device.display()))?;
    file.seek(SeekFrom::Start(offset))
        .with_context(|| format!("Failed to seek to offset {offset}"))?;

    let written = io::copy(&mut reader, &mut file).with_context(|| {
        format!(
            "Failed to write region at offset {offset} of '{}'",
            device.display()
        )
    })?;
    anyhow::ensure!(
        written >= expected_min,
        "Short write to '{}': {written} bytes written, at least {expected_min} expected",
        device.display()
    );

    file.flush().context("Failed to flush device")?;
    file.sync_all()
        .with_context(|| format!("Failed to sync device '{}'", device.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use tempfile::tempdir;

    fn fake_device(dir: &Path, size: usize) -> std::path::PathBuf {
        let device = dir.join("device");
        fs::write(&device, vec![0xa5; size]).unwrap();
        device
    }

    #[test]
    fn test_read_region() {
        let dir = tempdir().unwrap();
        let device = fake_device(dir.path(), 1024);

        assert_eq!(read_region(&device, 0, 4).unwrap(), vec![0xa5; 4]);
        assert_eq!(read_region(&device, 1000, 24).unwrap(), vec![0xa5; 24]);

        // Reading past the end fails
        assert!(read_region(&device, 1000, 25).is_err());
    }

    #[test]
    fn test_write_region_from_pads_with_zeros() {
        let dir = tempdir().unwrap();
        let device = fake_device(dir.path(), 1024);
        let image = dir.path().join("image");
        fs::write(&image, b"abcd").unwrap();

        write_region_from(&device, 512, 8, &image).unwrap();

        let contents = fs::read(&device).unwrap();
        assert_eq!(&contents[512..516], b"abcd");
        assert_eq!(&contents[516..520], &[0, 0, 0, 0]);
        // Surroundings untouched
        assert_eq!(contents[511], 0xa5);
        assert_eq!(contents[520], 0xa5);
    }

    #[test]
    fn test_write_region_roundtrip() {
        let dir = tempdir().unwrap();
        let device = fake_device(dir.path(), 1024);

        let saved = read_region(&device, 100, 16).unwrap();
        write_region(&device, 100, &[0xff; 16]).unwrap();
        assert_eq!(read_region(&device, 100, 16).unwrap(), vec![0xff; 16]);

        write_region(&device, 100, &saved).unwrap();
        assert_eq!(read_region(&device, 100, 16).unwrap(), vec![0xa5; 16]);
    }
}
