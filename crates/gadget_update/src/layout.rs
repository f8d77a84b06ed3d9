//! Resolves a declarative volume description into concrete byte offsets.

use std::{collections::BTreeMap, fs, io, ops::Deref, path::Path};

use gadget_api::{
    gadget::{Volume, VolumeContent, VolumeStructure, MBR_BOOTSTRAP_SIZE},
    ByteSize, Offset,
};

/// Structures without an explicit offset are kept out of the reserved boot
/// area at the start of the volume.
pub const NON_MBR_START_OFFSET: Offset = Offset(1 << 20);

/// A volume with every structure resolved to a concrete position, sorted by
/// start offset.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionedVolume<'a> {
    pub volume: &'a Volume,
    pub structures: Vec<PositionedStructure<'a>>,
    /// End of the last structure.
    pub size: ByteSize,
}

/// A structure with a resolved start offset and, for bare structures, fully
/// positioned content.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionedStructure<'a> {
    pub structure: &'a VolumeStructure,
    /// Concrete position of the structure within the volume.
    pub start_offset: Offset,
    /// Declaration position within the volume description.
    pub index: usize,
    /// Resolved raw content; empty for filesystem structures.
    pub content: Vec<PositionedContent<'a>>,
    /// Absolute location the structure's offset-write points at, if any.
    pub positioned_offset_write: Option<Offset>,
}

impl Deref for PositionedStructure<'_> {
    type Target = VolumeStructure;

    fn deref(&self) -> &VolumeStructure {
        self.structure
    }
}

impl PositionedStructure<'_> {
    /// First byte past the structure.
    pub fn end(&self) -> Offset {
        self.start_offset + self.size
    }
}

/// A raw content item with its absolute position within the volume and its
/// resolved size.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionedContent<'a> {
    /// Image file name in the gadget root directory.
    pub image: &'a str,
    /// Concrete position within the volume.
    pub start_offset: Offset,
    /// Declared size, or the image file size when not declared.
    pub size: ByteSize,
    /// Declaration position within the structure's content list.
    pub index: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("cannot position structure #{index} ({name:?}): {kind}")]
pub struct LayoutError {
    pub index: usize,
    pub name: String,
    pub kind: LayoutErrorKind,
}

#[derive(Debug, thiserror::Error)]
pub enum LayoutErrorKind {
    #[error("content {image:?}: {source}")]
    ContentIo {
        image: String,
        source: io::Error,
    },

    #[error("content {image:?}: declared size {declared} is smaller than the image size {actual}")]
    ContentUndersized {
        image: String,
        declared: ByteSize,
        actual: ByteSize,
    },

    #[error("content {image:?}: size {size} at offset {offset} does not fit in a structure of size {structure_size}")]
    ContentOverflow {
        image: String,
        size: ByteSize,
        offset: Offset,
        structure_size: ByteSize,
    },

    #[error("content {content:?}: bare structure carries non-image content")]
    ContentShape { content: String },

    #[error("offset {offset} is lower than the minimum allowed offset {minimum}")]
    OffsetBelowMinimum { offset: Offset, minimum: Offset },

    #[error("overlaps with structure #{other_index} ({other_name:?})")]
    Overlap {
        other_index: usize,
        other_name: String,
    },

    #[error("mbr structure size {size} exceeds the bootstrap area of 446 bytes")]
    MbrOversized { size: ByteSize },

    #[error("mbr structure must start at offset 0")]
    MbrNotAtStart,

    #[error("offset-write references unknown structure {target:?}")]
    UnknownOffsetWriteTarget { target: String },
}

/// Lays out a volume: every structure receives a concrete start offset and
/// every raw content item an absolute image offset and a resolved size. Image
/// sizes are read from the gadget root directory.
///
/// Positioning is deterministic: the same description and gadget root always
/// produce the same layout.
pub fn position_volume<'a>(
    gadget_root: &Path,
    volume: &'a Volume,
) -> Result<PositionedVolume<'a>, LayoutError> {
    let mut structures = Vec::with_capacity(volume.structure.len());
    // The minimum offset for the next structure, advanced past the end of
    // every structure positioned so far.
    let mut cursor = Offset::ZERO;

    for (index, structure) in volume.structure.iter().enumerate() {
        let err = |kind| LayoutError {
            index,
            name: structure.name.clone(),
            kind,
        };

        let start_offset = match structure.offset {
            Some(offset) if offset < cursor => {
                return Err(err(LayoutErrorKind::OffsetBelowMinimum {
                    offset,
                    minimum: cursor,
                }))
            }
            Some(offset) => offset,
            None if structure.is_mbr() => Offset::ZERO,
            // The first megabyte is reserved for the boot area
            None if cursor < NON_MBR_START_OFFSET => NON_MBR_START_OFFSET,
            None => cursor,
        };

        if structure.is_mbr() {
            if start_offset != Offset::ZERO {
                return Err(err(LayoutErrorKind::MbrNotAtStart));
            }
            if structure.size > MBR_BOOTSTRAP_SIZE {
                return Err(err(LayoutErrorKind::MbrOversized {
                    size: structure.size,
                }));
            }
        }

        let content = if structure.is_bare() {
            position_content(gadget_root, structure, start_offset).map_err(err)?
        } else {
            Vec::new()
        };

        cursor = start_offset + structure.size;
        structures.push(PositionedStructure {
            structure,
            start_offset,
            index,
            content,
            positioned_offset_write: None,
        });
    }

    resolve_offset_writes(&mut structures)?;

    // Declaration order already matches, sorting hardens the invariant
    structures.sort_by_key(|ps| ps.start_offset);
    for pair in structures.windows(2) {
        let (previous, current) = (&pair[0], &pair[1]);
        if previous.end() > current.start_offset {
            return Err(LayoutError {
                index: current.index,
                name: current.name.clone(),
                kind: LayoutErrorKind::Overlap {
                    other_index: previous.index,
                    other_name: previous.name.clone(),
                },
            });
        }
    }

    let size = structures
        .last()
        .map(|ps| ByteSize(ps.end().bytes()))
        .unwrap_or_default();

    Ok(PositionedVolume {
        volume,
        structures,
        size,
    })
}

fn position_content<'a>(
    gadget_root: &Path,
    structure: &'a VolumeStructure,
    start_offset: Offset,
) -> Result<Vec<PositionedContent<'a>>, LayoutErrorKind> {
    let mut positioned = Vec::with_capacity(structure.content.len());
    // Offset of the next content item, relative to the structure start
    let mut content_cursor = Offset::ZERO;

    for (index, entry) in structure.content.iter().enumerate() {
        let VolumeContent::RawImage {
            image,
            offset,
            size,
            ..
        } = entry
        else {
            return Err(LayoutErrorKind::ContentShape {
                content: entry.describe().to_owned(),
            });
        };

        let image_size = fs::metadata(gadget_root.join(image))
            .map_err(|source| LayoutErrorKind::ContentIo {
                image: image.clone(),
                source,
            })?
            .len();
        let image_size = ByteSize(image_size);

        let resolved_size = match size {
            Some(declared) if *declared < image_size => {
                return Err(LayoutErrorKind::ContentUndersized {
                    image: image.clone(),
                    declared: *declared,
                    actual: image_size,
                })
            }
            Some(declared) => *declared,
            None => image_size,
        };

        let relative_offset = offset.unwrap_or(content_cursor);
        let content_end = relative_offset + resolved_size;
        if content_end.bytes() > structure.size.bytes() {
            return Err(LayoutErrorKind::ContentOverflow {
                image: image.clone(),
                size: resolved_size,
                offset: relative_offset,
                structure_size: structure.size,
            });
        }

        content_cursor = content_end;
        positioned.push(PositionedContent {
            image,
            start_offset: start_offset + relative_offset,
            size: resolved_size,
            index,
        });
    }

    Ok(positioned)
}

// Offset-write targets may reference structures declared later, so resolution
// runs after every structure has a start offset.
fn resolve_offset_writes(structures: &mut [PositionedStructure<'_>]) -> Result<(), LayoutError> {
    let offsets_by_name: BTreeMap<String, Offset> = structures
        .iter()
        .filter(|ps| !ps.name.is_empty())
        .map(|ps| (ps.name.clone(), ps.start_offset))
        .collect();

    let resolve = |ps: &PositionedStructure<'_>,
                   relative_to: &str,
                   offset: Offset|
     -> Result<Offset, LayoutError> {
        if relative_to.is_empty() {
            return Ok(offset);
        }
        match offsets_by_name.get(relative_to) {
            Some(base) => Ok(*base + offset),
            None => Err(LayoutError {
                index: ps.index,
                name: ps.name.clone(),
                kind: LayoutErrorKind::UnknownOffsetWriteTarget {
                    target: relative_to.to_owned(),
                },
            }),
        }
    };

    for i in 0..structures.len() {
        let ps = &structures[i];
        let mut positioned = None;
        if let Some(offset_write) = &ps.structure.offset_write {
            positioned = Some(resolve(ps, &offset_write.relative_to, offset_write.offset)?);
        }
        // Content-level offset-writes are only validated here; writing them is
        // an install-time concern
        for entry in &ps.structure.content {
            if let VolumeContent::RawImage {
                offset_write: Some(offset_write),
                ..
            } = entry
            {
                resolve(ps, &offset_write.relative_to, offset_write.offset)?;
            }
        }
        structures[i].positioned_offset_write = positioned;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use gadget_api::gadget::RelativeOffset;

    fn make_sized_file(dir: &Path, name: &str, size: u64) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let file = fs::File::create(&path).unwrap();
        file.set_len(size).unwrap();
        path
    }

    fn bare_structure(name: &str, size: ByteSize) -> VolumeStructure {
        VolumeStructure {
            name: name.to_owned(),
            structure_type: "bare".to_owned(),
            size,
            ..Default::default()
        }
    }

    fn volume(structures: Vec<VolumeStructure>) -> Volume {
        Volume {
            bootloader: "grub".to_owned(),
            schema: "gpt".to_owned(),
            structure: structures,
            ..Default::default()
        }
    }

    #[test]
    fn test_first_structure_starts_at_one_mib() {
        let dir = tempfile::tempdir().unwrap();
        let vol = volume(vec![bare_structure("first", ByteSize::mib(5))]);

        let positioned = position_volume(dir.path(), &vol).unwrap();
        assert_eq!(positioned.structures.len(), 1);
        assert_eq!(positioned.structures[0].start_offset, Offset::from(ByteSize::mib(1)));
        assert_eq!(positioned.structures[0].index, 0);
        assert_eq!(positioned.size, ByteSize::mib(6));
    }

    #[test]
    fn test_mbr_structure_pinned_to_offset_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut mbr = bare_structure("mbr", ByteSize(440));
        mbr.role = "mbr".to_owned();
        let vol = volume(vec![mbr, bare_structure("first", ByteSize::mib(5))]);

        let positioned = position_volume(dir.path(), &vol).unwrap();
        assert_eq!(positioned.structures[0].start_offset, Offset::ZERO);
        // The structure after the mbr still avoids the reserved boot area
        assert_eq!(
            positioned.structures[1].start_offset,
            Offset::from(ByteSize::mib(1))
        );
    }

    #[test]
    fn test_mbr_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut mbr = bare_structure("mbr", ByteSize(512));
        mbr.role = "mbr".to_owned();
        let vol = volume(vec![mbr]);

        let err = position_volume(dir.path(), &vol).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"cannot position structure #0 ("mbr"): mbr structure size 512 exceeds the bootstrap area of 446 bytes"#
        );
    }

    #[test]
    fn test_structures_are_stacked() {
        let dir = tempfile::tempdir().unwrap();
        let vol = volume(vec![
            bare_structure("first", ByteSize::mib(5)),
            bare_structure("second", ByteSize::mib(10)),
            bare_structure("third", ByteSize::mib(5)),
        ]);

        let positioned = position_volume(dir.path(), &vol).unwrap();
        let offsets: Vec<_> = positioned
            .structures
            .iter()
            .map(|ps| ps.start_offset.bytes() >> 20)
            .collect();
        assert_eq!(offsets, vec![1, 6, 16]);
        assert_eq!(positioned.size, ByteSize::mib(21));
    }

    #[test]
    fn test_explicit_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mut second = bare_structure("second", ByteSize::mib(1));
        second.offset = Some(Offset::from(ByteSize::mib(10)));
        let vol = volume(vec![bare_structure("first", ByteSize::mib(5)), second]);

        let positioned = position_volume(dir.path(), &vol).unwrap();
        assert_eq!(
            positioned.structures[1].start_offset,
            Offset::from(ByteSize::mib(10))
        );
    }

    #[test]
    fn test_explicit_offset_below_minimum() {
        let dir = tempfile::tempdir().unwrap();
        let mut second = bare_structure("second", ByteSize::mib(1));
        second.offset = Some(Offset::from(ByteSize::mib(2)));
        let vol = volume(vec![bare_structure("first", ByteSize::mib(5)), second]);

        let err = position_volume(dir.path(), &vol).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"cannot position structure #1 ("second"): offset 2097152 is lower than the minimum allowed offset 6291456"#
        );
    }

    #[test]
    fn test_content_positioning() {
        let dir = tempfile::tempdir().unwrap();
        make_sized_file(dir.path(), "one.img", 1024);
        make_sized_file(dir.path(), "two.img", 2048);

        let mut structure = bare_structure("first", ByteSize::mib(5));
        structure.content = vec![
            VolumeContent::RawImage {
                image: "one.img".to_owned(),
                offset: None,
                offset_write: None,
                size: Some(ByteSize::kib(4)),
            },
            VolumeContent::RawImage {
                image: "two.img".to_owned(),
                offset: None,
                offset_write: None,
                size: None,
            },
        ];
        let vol = volume(vec![structure]);

        let positioned = position_volume(dir.path(), &vol).unwrap();
        let content = &positioned.structures[0].content;
        assert_eq!(content.len(), 2);

        let base = ByteSize::mib(1).bytes();
        assert_eq!(content[0].image, "one.img");
        assert_eq!(content[0].start_offset, Offset(base));
        assert_eq!(content[0].size, ByteSize::kib(4));

        // Second item follows the declared size of the first
        assert_eq!(content[1].image, "two.img");
        assert_eq!(content[1].start_offset, Offset(base + 4096));
        assert_eq!(content[1].size, ByteSize(2048));
    }

    #[test]
    fn test_content_explicit_offset() {
        let dir = tempfile::tempdir().unwrap();
        make_sized_file(dir.path(), "one.img", 128);

        let mut structure = bare_structure("first", ByteSize::mib(5));
        structure.content = vec![VolumeContent::RawImage {
            image: "one.img".to_owned(),
            offset: Some(Offset::from(ByteSize::kib(16))),
            offset_write: None,
            size: None,
        }];
        let vol = volume(vec![structure]);

        let positioned = position_volume(dir.path(), &vol).unwrap();
        assert_eq!(
            positioned.structures[0].content[0].start_offset,
            Offset(ByteSize::mib(1).bytes() + ByteSize::kib(16).bytes())
        );
    }

    #[test]
    fn test_content_missing_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut structure = bare_structure("foo", ByteSize::mib(5));
        structure.content = vec![VolumeContent::RawImage {
            image: "first.img".to_owned(),
            offset: None,
            offset_write: None,
            size: None,
        }];
        let vol = volume(vec![structure]);

        let err = position_volume(dir.path(), &vol).unwrap_err();
        let message = err.to_string();
        assert!(
            message.starts_with(r#"cannot position structure #0 ("foo"): content "first.img": "#),
            "unexpected message: {message}"
        );
    }

    #[test]
    fn test_content_undersized_declaration() {
        let dir = tempfile::tempdir().unwrap();
        make_sized_file(dir.path(), "one.img", 2048);

        let mut structure = bare_structure("foo", ByteSize::mib(5));
        structure.content = vec![VolumeContent::RawImage {
            image: "one.img".to_owned(),
            offset: None,
            offset_write: None,
            size: Some(ByteSize(1024)),
        }];
        let vol = volume(vec![structure]);

        let err = position_volume(dir.path(), &vol).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"cannot position structure #0 ("foo"): content "one.img": declared size 1024 is smaller than the image size 2048"#
        );
    }

    #[test]
    fn test_content_overflow() {
        let dir = tempfile::tempdir().unwrap();
        make_sized_file(dir.path(), "one.img", 2048);

        let mut structure = bare_structure("foo", ByteSize::kib(1));
        structure.content = vec![VolumeContent::RawImage {
            image: "one.img".to_owned(),
            offset: None,
            offset_write: None,
            size: None,
        }];
        let vol = volume(vec![structure]);

        let err = position_volume(dir.path(), &vol).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"cannot position structure #0 ("foo"): content "one.img": size 2048 at offset 0 does not fit in a structure of size 1024"#
        );
    }

    #[test]
    fn test_offset_write_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let mut mbr = bare_structure("mbr", ByteSize(440));
        mbr.role = "mbr".to_owned();
        let mut boot = bare_structure("boot", ByteSize::mib(1));
        boot.offset_write = Some(RelativeOffset {
            relative_to: "mbr".to_owned(),
            offset: Offset(92),
        });
        let vol = volume(vec![mbr, boot]);

        let positioned = position_volume(dir.path(), &vol).unwrap();
        assert_eq!(positioned.structures[0].positioned_offset_write, None);
        assert_eq!(
            positioned.structures[1].positioned_offset_write,
            Some(Offset(92))
        );
    }

    #[test]
    fn test_offset_write_unknown_target() {
        let dir = tempfile::tempdir().unwrap();
        let mut boot = bare_structure("boot", ByteSize::mib(1));
        boot.offset_write = Some(RelativeOffset {
            relative_to: "missing".to_owned(),
            offset: Offset(92),
        });
        let vol = volume(vec![boot]);

        let err = position_volume(dir.path(), &vol).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"cannot position structure #0 ("boot"): offset-write references unknown structure "missing""#
        );
    }

    #[test]
    fn test_positioning_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        make_sized_file(dir.path(), "one.img", 1024);

        let mut structure = bare_structure("first", ByteSize::mib(5));
        structure.content = vec![VolumeContent::RawImage {
            image: "one.img".to_owned(),
            offset: None,
            offset_write: None,
            size: None,
        }];
        let vol = volume(vec![structure, bare_structure("second", ByteSize::mib(1))]);

        let first = position_volume(dir.path(), &vol).unwrap();
        let second = position_volume(dir.path(), &vol).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_structures_sorted_and_non_overlapping() {
        let dir = tempfile::tempdir().unwrap();
        let vol = volume(vec![
            bare_structure("a", ByteSize::mib(2)),
            bare_structure("b", ByteSize::mib(3)),
            bare_structure("c", ByteSize::mib(1)),
        ]);

        let positioned = position_volume(dir.path(), &vol).unwrap();
        for pair in positioned.structures.windows(2) {
            assert!(pair[0].start_offset < pair[1].start_offset);
            assert!(pair[0].end() <= pair[1].start_offset);
        }
    }
}
