use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};

const PROC_MOUNTS: &str = "/proc/self/mounts";

/// One entry of the kernel mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: PathBuf,
    pub target: PathBuf,
    pub fstype: String,
}

/// Returns the mount point of the given block device, if it is mounted.
///
/// When a device is mounted multiple times the first entry wins, matching the
/// kernel's reporting order.
pub fn mount_point_of(device: impl AsRef<Path>) -> Result<Option<PathBuf>, Error> {
    let table = fs::read_to_string(PROC_MOUNTS)
        .with_context(|| format!("Failed to read '{PROC_MOUNTS}'"))?;
    Ok(parse(&table)
        .into_iter()
        .find(|entry| entry.source == device.as_ref())
        .map(|entry| entry.target))
}

/// Parses the contents of a /proc mounts table.
pub fn parse(table: &str) -> Vec<MountEntry> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_ascii_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next()?;
            Some(MountEntry {
                source: PathBuf::from(unescape(source)),
                target: PathBuf::from(unescape(target)),
                fstype: fstype.to_owned(),
            })
        })
        .collect()
}

// The kernel escapes whitespace and backslashes in mount paths as three-digit
// octal sequences.
fn unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let mut code = 0u32;
        let mut digits = 0;
        while digits < 3 {
            match chars.peek().and_then(|d| d.to_digit(8)) {
                Some(d) => {
                    code = code * 8 + d;
                    chars.next();
                    digits += 1;
                }
                None => break,
            }
        }
        match (digits, char::from_u32(code)) {
            (3, Some(decoded)) => out.push(decoded),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_parse() {
        let table = indoc! {r"
            /dev/sda2 / ext4 rw,relatime 0 0
            /dev/sda1 /boot/efi vfat rw,relatime,fmask=0077 0 0
            tmpfs /tmp tmpfs rw,nosuid,nodev 0 0
        "};
        let entries = parse(table);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].source, Path::new("/dev/sda2"));
        assert_eq!(entries[0].target, Path::new("/"));
        assert_eq!(entries[0].fstype, "ext4");
        assert_eq!(entries[1].target, Path::new("/boot/efi"));
    }

    #[test]
    fn test_parse_escaped_paths() {
        let entries = parse(r"/dev/sdb1 /run/media/usb\040drive vfat rw 0 0");
        assert_eq!(entries[0].target, Path::new("/run/media/usb drive"));
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape(r"plain"), "plain");
        assert_eq!(unescape(r"with\040space"), "with space");
        assert_eq!(unescape(r"back\134slash"), r"back\slash");
        // Incomplete escapes are passed through
        assert_eq!(unescape(r"dangling\04"), r"dangling\04");
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        let entries = parse("only-two fields\n/dev/sda1 /boot ext4 rw 0 0\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fstype, "ext4");
    }
}
