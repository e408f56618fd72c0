//! On-media pool metadata: superblock and extent table.
//!
//! The whole metadata region ([`META_BLOCKS`] blocks at LBA 0) is encoded
//! and rewritten as one unit. All integers are little-endian. Readers accept
//! any `version_minor` and any extent record at least [`EXTENT_RECORD_LEN`]
//! bytes long, skipping trailing attribute bytes they do not know about; a
//! higher `version_major` is rejected outright.

use core::fmt;
use vblk_core::{IoError, IoErrorKind};

/// Identifies a formatted pool; first bytes of block 0.
pub const POOL_MAGIC: [u8; 8] = *b"VBLKLVOL";
/// Highest on-media major version this build can read.
pub const VERSION_MAJOR: u16 = 1;
/// Minor version written by this build.
pub const VERSION_MINOR: u16 = 0;
/// Blocks reserved at the start of the base device for metadata.
pub const META_BLOCKS: u64 = 64;
/// Bytes of a current-version extent record (base LBA + block count).
pub const EXTENT_RECORD_LEN: u16 = 16;
/// Volume flag: the volume is a snapshot and rejects writes.
pub const FLAG_READ_ONLY: u32 = 1 << 0;

/// Errors surfaced while decoding pool metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetaError {
    /// Block 0 does not start with `VBLKLVOL`.
    InvalidMagic,
    /// On-media major version is newer than this build understands.
    IncompatibleVersion { supported: u16, actual: u16 },
    /// Region ended inside a field.
    Truncated,
    /// Field value failed validation.
    InvalidValue(&'static str),
    /// Encoded table does not fit the metadata region.
    RegionOverflow { needed: usize, region: usize },
}

impl fmt::Display for MetaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaError::InvalidMagic => write!(f, "pool magic mismatch"),
            MetaError::IncompatibleVersion { supported, actual } => {
                write!(f, "pool metadata version {actual}, supported up to {supported}")
            }
            MetaError::Truncated => write!(f, "pool metadata truncated"),
            MetaError::InvalidValue(field) => write!(f, "invalid field value: {field}"),
            MetaError::RegionOverflow { needed, region } => {
                write!(f, "metadata needs {needed} bytes, region holds {region}")
            }
        }
    }
}

impl From<MetaError> for IoError {
    fn from(err: MetaError) -> Self {
        let kind = match err {
            MetaError::IncompatibleVersion { .. } => IoErrorKind::IncompatibleVersion,
            _ => IoErrorKind::Io,
        };
        IoError::with_message(kind, err.to_string())
    }
}

pub type Result<T> = core::result::Result<T, MetaError>;

/// One contiguous run of base-device blocks owned by a volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    /// First base-device LBA of the run.
    pub start: u64,
    pub blocks: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeRecord {
    pub name: String,
    /// [`FLAG_READ_ONLY`] and future per-volume flags; unknown bits are
    /// preserved as read.
    pub flags: u32,
    /// Extents in volume-LBA order; a volume's size is their sum.
    pub extents: Vec<Extent>,
}

impl VolumeRecord {
    pub fn blocks(&self) -> u64 {
        self.extents.iter().map(|e| e.blocks).sum()
    }

    pub fn read_only(&self) -> bool {
        self.flags & FLAG_READ_ONLY != 0
    }
}

/// In-memory image of the metadata region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolMeta {
    pub pool_id: [u8; 16],
    /// Minor version as read from media; writes always stamp
    /// [`VERSION_MINOR`].
    pub version_minor: u16,
    /// Base-device capacity recorded at format time.
    pub total_blocks: u64,
    pub volumes: Vec<VolumeRecord>,
}

impl PoolMeta {
    pub fn new(pool_id: [u8; 16], total_blocks: u64) -> Self {
        Self {
            pool_id,
            version_minor: VERSION_MINOR,
            total_blocks,
            volumes: Vec::new(),
        }
    }

    /// Blocks available to volumes (capacity minus the metadata region).
    pub fn data_blocks(&self) -> u64 {
        self.total_blocks.saturating_sub(META_BLOCKS)
    }

    /// Serialize into a zero-padded buffer of exactly `region_len` bytes.
    pub fn encode(&self, region_len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(region_len);
        buf.extend_from_slice(&POOL_MAGIC);
        buf.extend_from_slice(&VERSION_MAJOR.to_le_bytes());
        buf.extend_from_slice(&VERSION_MINOR.to_le_bytes());
        buf.extend_from_slice(&self.pool_id);
        buf.extend_from_slice(&self.total_blocks.to_le_bytes());
        let volume_count = u32::try_from(self.volumes.len())
            .map_err(|_| MetaError::InvalidValue("too many volumes"))?;
        buf.extend_from_slice(&volume_count.to_le_bytes());

        for volume in &self.volumes {
            let name_len = u16::try_from(volume.name.len())
                .map_err(|_| MetaError::InvalidValue("volume name too long"))?;
            buf.extend_from_slice(&name_len.to_le_bytes());
            buf.extend_from_slice(volume.name.as_bytes());
            buf.extend_from_slice(&volume.flags.to_le_bytes());
            let extent_count = u32::try_from(volume.extents.len())
                .map_err(|_| MetaError::InvalidValue("too many extents"))?;
            buf.extend_from_slice(&extent_count.to_le_bytes());
            for extent in &volume.extents {
                buf.extend_from_slice(&EXTENT_RECORD_LEN.to_le_bytes());
                buf.extend_from_slice(&extent.start.to_le_bytes());
                buf.extend_from_slice(&extent.blocks.to_le_bytes());
            }
        }

        if buf.len() > region_len {
            return Err(MetaError::RegionOverflow {
                needed: buf.len(),
                region: region_len,
            });
        }
        buf.resize(region_len, 0);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        if reader.take(8)? != POOL_MAGIC {
            return Err(MetaError::InvalidMagic);
        }
        let version_major = reader.u16()?;
        if version_major > VERSION_MAJOR {
            return Err(MetaError::IncompatibleVersion {
                supported: VERSION_MAJOR,
                actual: version_major,
            });
        }
        let version_minor = reader.u16()?;
        let mut pool_id = [0u8; 16];
        pool_id.copy_from_slice(reader.take(16)?);
        let total_blocks = reader.u64()?;
        let volume_count = reader.u32()?;

        let mut volumes = Vec::with_capacity(volume_count as usize);
        for _ in 0..volume_count {
            let name_len = reader.u16()? as usize;
            let name = core::str::from_utf8(reader.take(name_len)?)
                .map_err(|_| MetaError::InvalidValue("volume name is not utf-8"))?
                .to_string();
            let flags = reader.u32()?;
            let extent_count = reader.u32()?;
            let mut extents = Vec::with_capacity(extent_count as usize);
            for _ in 0..extent_count {
                let record_len = reader.u16()?;
                if record_len < EXTENT_RECORD_LEN {
                    return Err(MetaError::InvalidValue("extent record too short"));
                }
                let start = reader.u64()?;
                let blocks = reader.u64()?;
                // Unknown trailing attributes from a newer minor version.
                reader.take((record_len - EXTENT_RECORD_LEN) as usize)?;
                extents.push(Extent { start, blocks });
            }
            volumes.push(VolumeRecord {
                name,
                flags,
                extents,
            });
        }

        Ok(Self {
            pool_id,
            version_minor,
            total_blocks,
            volumes,
        })
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(MetaError::Truncated)?;
        if end > self.buf.len() {
            return Err(MetaError::Truncated);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut fixed = [0u8; 8];
        fixed.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(fixed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PoolMeta {
        let mut meta = PoolMeta::new([7u8; 16], 10_000);
        meta.volumes.push(VolumeRecord {
            name: "alpha".into(),
            flags: 0,
            extents: vec![Extent {
                start: META_BLOCKS,
                blocks: 2000,
            }],
        });
        meta.volumes.push(VolumeRecord {
            name: "beta".into(),
            flags: FLAG_READ_ONLY,
            extents: vec![
                Extent {
                    start: META_BLOCKS + 2000,
                    blocks: 1000,
                },
                Extent {
                    start: META_BLOCKS + 4000,
                    blocks: 2000,
                },
            ],
        });
        meta
    }

    #[test]
    fn round_trip() {
        let meta = sample();
        let bytes = meta.encode(32 * 1024).unwrap();
        assert_eq!(bytes.len(), 32 * 1024);
        let decoded = PoolMeta::decode(&bytes).unwrap();
        assert_eq!(decoded, meta);
        assert!(!decoded.volumes[0].read_only());
        assert!(decoded.volumes[1].read_only());
    }

    #[test]
    fn magic_guard() {
        let mut bytes = sample().encode(4096).unwrap();
        bytes[0] = b'X';
        assert_eq!(PoolMeta::decode(&bytes), Err(MetaError::InvalidMagic));
    }

    #[test]
    fn newer_major_rejected() {
        let mut bytes = sample().encode(4096).unwrap();
        bytes[8..10].copy_from_slice(&(VERSION_MAJOR + 1).to_le_bytes());
        let err = PoolMeta::decode(&bytes).unwrap_err();
        assert!(matches!(err, MetaError::IncompatibleVersion { .. }));
        assert_eq!(
            IoError::from(err).kind(),
            IoErrorKind::IncompatibleVersion
        );
    }

    #[test]
    fn newer_minor_and_unknown_extent_attrs_read_fine() {
        // Hand-build a region with a bumped minor and an extent record that
        // carries 8 trailing attribute bytes.
        let mut buf = Vec::new();
        buf.extend_from_slice(&POOL_MAGIC);
        buf.extend_from_slice(&VERSION_MAJOR.to_le_bytes());
        buf.extend_from_slice(&(VERSION_MINOR + 3).to_le_bytes());
        buf.extend_from_slice(&[1u8; 16]);
        buf.extend_from_slice(&512u64.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&2u16.to_le_bytes());
        buf.extend_from_slice(b"v0");
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&(EXTENT_RECORD_LEN + 8).to_le_bytes());
        buf.extend_from_slice(&64u64.to_le_bytes());
        buf.extend_from_slice(&100u64.to_le_bytes());
        buf.extend_from_slice(&[0xEE; 8]);

        let meta = PoolMeta::decode(&buf).unwrap();
        assert_eq!(meta.version_minor, VERSION_MINOR + 3);
        assert_eq!(meta.volumes.len(), 1);
        assert_eq!(
            meta.volumes[0].extents,
            vec![Extent {
                start: 64,
                blocks: 100
            }]
        );
    }

    #[test]
    fn short_extent_record_rejected() {
        let mut bytes = sample().encode(4096).unwrap();
        let meta = sample();
        // Locate the first extent record's length prefix: header, then
        // name length, name, flags, extent count.
        let offset = 40 + 2 + meta.volumes[0].name.len() + 4 + 4;
        bytes[offset..offset + 2].copy_from_slice(&8u16.to_le_bytes());
        assert_eq!(
            PoolMeta::decode(&bytes),
            Err(MetaError::InvalidValue("extent record too short"))
        );
    }

    #[test]
    fn truncated_region() {
        let bytes = sample().encode(4096).unwrap();
        assert_eq!(PoolMeta::decode(&bytes[..20]), Err(MetaError::Truncated));
    }

    #[test]
    fn overflow_reported() {
        let meta = sample();
        assert!(matches!(
            meta.encode(16),
            Err(MetaError::RegionOverflow { .. })
        ));
    }
}
