use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod error;
pub mod traits;
pub use error::IoError;

pub const SECTOR_SIZE: usize = 512;
pub const PAGE_SIZE: usize = 4096;
/// Sectors per buffer page.
pub const PAGE_SECTORS: u32 = (PAGE_SIZE / SECTOR_SIZE) as u32;

/// Number of pages needed to hold `sectors` worth of data.
pub fn pages_for_sectors(sectors: u32) -> usize {
    sectors.div_ceil(PAGE_SECTORS) as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u16);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cache{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheSetId(pub Uuid);

impl CacheSetId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CacheSetId {
    fn default() -> Self {
        Self::new()
    }
}

/// Position of a key in the extent index, ordered by inode then offset.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct KeyPos {
    pub inode: u64,
    pub offset: u64,
}

impl KeyPos {
    pub const ZERO: KeyPos = KeyPos {
        inode: 0,
        offset: 0,
    };
    pub const MAX: KeyPos = KeyPos {
        inode: u64::MAX,
        offset: u64::MAX,
    };

    pub fn new(inode: u64, offset: u64) -> Self {
        Self { inode, offset }
    }

    /// The smallest position strictly greater than `self`, saturating at `MAX`.
    pub fn successor(&self) -> KeyPos {
        if self.offset < u64::MAX {
            KeyPos::new(self.inode, self.offset + 1)
        } else if self.inode < u64::MAX {
            KeyPos::new(self.inode + 1, 0)
        } else {
            KeyPos::MAX
        }
    }
}

impl fmt::Display for KeyPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.inode, self.offset)
    }
}

/// Physical location of extent data on a cache device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pointer {
    pub device: DeviceId,
    pub bucket: u64,
    /// Sector offset within the bucket.
    pub offset: u32,
    /// Bucket generation at the time the pointer was written.
    pub gen: u8,
}

impl Pointer {
    pub fn new(device: DeviceId, bucket: u64, offset: u32, gen: u8) -> Self {
        Self {
            device,
            bucket,
            offset,
            gen,
        }
    }
}

/// Index entry mapping a logical range onto cache-device pointers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentKey {
    pub inode: u64,
    pub offset: u64,
    pub size: u32,
    pub ptrs: Vec<Pointer>,
    /// Data not yet written back to the backing device.
    #[serde(default)]
    pub dirty: bool,
    #[serde(default)]
    pub csum: bool,
}

impl ExtentKey {
    pub fn new(inode: u64, offset: u64, size: u32, ptr: Pointer) -> Self {
        Self {
            inode,
            offset,
            size,
            ptrs: vec![ptr],
            dirty: false,
            csum: false,
        }
    }

    pub fn with_dirty(mut self, dirty: bool) -> Self {
        self.dirty = dirty;
        self
    }

    pub fn with_csum(mut self, csum: bool) -> Self {
        self.csum = csum;
        self
    }

    pub fn pos(&self) -> KeyPos {
        KeyPos::new(self.inode, self.offset)
    }

    pub fn bytes(&self) -> usize {
        self.size as usize * SECTOR_SIZE
    }
}

impl fmt::Display for ExtentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.pos(), self.size)?;
        for ptr in &self.ptrs {
            write!(
                f,
                " {}:{}:{} gen {}",
                ptr.device, ptr.bucket, ptr.offset, ptr.gen
            )?;
        }
        if self.dirty {
            f.write_str(" dirty")?;
        }
        Ok(())
    }
}

/// Residency of live data inside a reclaimable bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Residency {
    Clean,
    Dirty,
}

/// Classification assigned to a bucket by the full collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GcMark {
    Free,
    Reclaimable(Residency),
    Metadata,
}

impl GcMark {
    pub fn to_raw(self) -> u8 {
        match self {
            GcMark::Free => 0,
            GcMark::Reclaimable(Residency::Clean) => 1,
            GcMark::Reclaimable(Residency::Dirty) => 2,
            GcMark::Metadata => 3,
        }
    }

    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => GcMark::Reclaimable(Residency::Clean),
            2 => GcMark::Reclaimable(Residency::Dirty),
            3 => GcMark::Metadata,
            _ => GcMark::Free,
        }
    }
}

/// I/O scheduling class attached to submitted requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoPriority {
    Normal,
    Background,
    Idle,
}

/// Free list a write allocates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reserve {
    None,
    MovingGc,
}
