//! Boot-partition contract and the post-update boot record.
//!
//! The update procedure writes a [`BootRecord`] immediately before switching
//! the boot partition. The next startup reads it once through
//! [`classify_boot`], which also erases it, so a confirmation is reported at
//! most once per update.

use core::fmt;

/// Identity of a firmware slot as numbered by the partition manager.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PartitionId(pub u8);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ota_{}", self.0)
    }
}

/// Why the processor last came out of reset.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResetReason {
    PowerOn,
    /// Restart requested by firmware.
    Software,
    Panic,
    Watchdog,
    Brownout,
    DeepSleep,
    External,
    Unknown,
}

impl ResetReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            ResetReason::PowerOn => "power-on",
            ResetReason::Software => "software",
            ResetReason::Panic => "panic",
            ResetReason::Watchdog => "watchdog",
            ResetReason::Brownout => "brownout",
            ResetReason::DeepSleep => "deep-sleep",
            ResetReason::External => "external",
            ResetReason::Unknown => "unknown",
        }
    }
}

/// Failure reported by the boot-partition manager.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootError {
    /// No inactive slot is available to receive an image.
    NoUpdatePartition,
    /// The slot does not hold a bootable image.
    InvalidImage,
    /// Writing the boot selection failed.
    WriteFailed,
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::NoUpdatePartition => f.write_str("no update partition available"),
            BootError::InvalidImage => f.write_str("partition image is not bootable"),
            BootError::WriteFailed => f.write_str("boot selection write failed"),
        }
    }
}

/// Boot-partition manager.
pub trait BootPartitions {
    /// Slot the current firmware was booted from.
    fn running_partition(&self) -> PartitionId;

    /// Slot the next update should be written to.
    fn next_update_partition(&self) -> Option<PartitionId>;

    /// Designates `partition` as the next boot target. This is the one
    /// irrecoverable step of an update.
    fn set_boot_partition(&mut self, partition: PartitionId) -> Result<(), BootError>;

    fn reset_reason(&self) -> ResetReason;
}

/// Failure reported by the persistent key-value store.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StoreError {
    /// Storage has not been initialised or is locked.
    Unavailable,
    /// Read or write failed at the flash layer.
    Io,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable => f.write_str("store unavailable"),
            StoreError::Io => f.write_str("store i/o failure"),
        }
    }
}

/// Persistent key-value store holding small integer records.
pub trait KeyValueStore {
    fn get(&mut self, key: &str) -> Result<Option<u32>, StoreError>;

    fn set(&mut self, key: &str, value: u32) -> Result<(), StoreError>;

    /// Removes `key`; erasing a missing key is not an error.
    fn erase(&mut self, key: &str) -> Result<(), StoreError>;

    /// Flushes pending writes to flash.
    fn commit(&mut self) -> Result<(), StoreError>;
}

/// Store key holding the encoded [`BootRecord`].
pub const BOOT_RECORD_KEY: &str = "boot_record";

const RECORD_MAGIC: u32 = 0xB0;

/// Marker written just before the boot partition is switched.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BootRecord {
    /// Slot that was running when the update started.
    pub previous: PartitionId,
    /// Slot the update designated as the next boot target.
    pub target: PartitionId,
}

impl BootRecord {
    pub const fn new(previous: PartitionId, target: PartitionId) -> Self {
        Self { previous, target }
    }

    /// Packs the record as `magic:8 | reserved:8 | previous:8 | target:8`.
    pub const fn encode(self) -> u32 {
        (RECORD_MAGIC << 24) | ((self.previous.0 as u32) << 8) | self.target.0 as u32
    }

    /// Unpacks a stored value, rejecting anything without the record magic.
    pub const fn decode(raw: u32) -> Option<Self> {
        if raw >> 24 != RECORD_MAGIC {
            return None;
        }
        Some(Self {
            previous: PartitionId(((raw >> 8) & 0xFF) as u8),
            target: PartitionId((raw & 0xFF) as u8),
        })
    }

    /// Writes and commits the record.
    pub fn store<S>(self, store: &mut S) -> Result<(), StoreError>
    where
        S: KeyValueStore + ?Sized,
    {
        store.set(BOOT_RECORD_KEY, self.encode())?;
        store.commit()
    }

    /// Reads the record, treating unrecognised values as absent.
    pub fn load<S>(store: &mut S) -> Result<Option<Self>, StoreError>
    where
        S: KeyValueStore + ?Sized,
    {
        Ok(store.get(BOOT_RECORD_KEY)?.and_then(Self::decode))
    }

    /// Erases and commits.
    pub fn clear<S>(store: &mut S) -> Result<(), StoreError>
    where
        S: KeyValueStore + ?Sized,
    {
        store.erase(BOOT_RECORD_KEY)?;
        store.commit()
    }
}

/// What kind of startup this is, as far as updates are concerned.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootKind {
    /// No update was pending.
    Normal,
    /// The device restarted itself into a freshly written slot.
    PostUpdate {
        previous: PartitionId,
        running: PartitionId,
    },
    /// An update was recorded but the device came back on the old slot
    /// (rollback or unrelated reset).
    UpdateNotApplied {
        expected: PartitionId,
        running: PartitionId,
    },
}

impl BootKind {
    pub const fn is_post_update(self) -> bool {
        matches!(self, BootKind::PostUpdate { .. })
    }
}

/// Reads and consumes the boot record, classifying this startup.
pub fn classify_boot<S, B>(store: &mut S, partitions: &B) -> Result<BootKind, StoreError>
where
    S: KeyValueStore + ?Sized,
    B: BootPartitions + ?Sized,
{
    let Some(record) = BootRecord::load(store)? else {
        return Ok(BootKind::Normal);
    };
    BootRecord::clear(store)?;

    let running = partitions.running_partition();
    if partitions.reset_reason() == ResetReason::Software && running != record.previous {
        Ok(BootKind::PostUpdate {
            previous: record.previous,
            running,
        })
    } else {
        Ok(BootKind::UpdateNotApplied {
            expected: record.target,
            running,
        })
    }
}
