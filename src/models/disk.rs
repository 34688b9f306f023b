//! Disk model

use serde::{Deserialize, Serialize};

/// SCSI unit number taken by the controller itself
pub const SCSI_CONTROLLER_UNIT: i32 = 7;

/// Highest unit number on a single SCSI controller
pub const MAX_SCSI_UNIT: i32 = 15;

/// Largest virtual disk the platform accepts (62 TB)
pub const MAX_DISK_SIZE_GB: u64 = 62 * 1024;

/// Provisioning type of a virtual disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskType {
    Thin,
    #[default]
    EagerZeroed,
    Lazy,
}

impl DiskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskType::Thin => "thin",
            DiskType::EagerZeroed => "eager_zeroed",
            DiskType::Lazy => "lazy",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "thin" => Ok(DiskType::Thin),
            "eager_zeroed" => Ok(DiskType::EagerZeroed),
            "lazy" => Ok(DiskType::Lazy),
            other => Err(crate::Error::Config(format!("unknown disk type '{}'", other))),
        }
    }

    pub fn is_thin(&self) -> bool {
        *self == DiskType::Thin
    }

    pub fn is_eager_scrub(&self) -> bool {
        *self == DiskType::EagerZeroed
    }

    pub(crate) fn from_backing(thin: bool, eager_scrub: bool) -> Self {
        match (thin, eager_scrub) {
            (true, _) => DiskType::Thin,
            (false, true) => DiskType::EagerZeroed,
            (false, false) => DiskType::Lazy,
        }
    }
}

impl std::fmt::Display for DiskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a disk's contents come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskSource {
    /// Inherited from the clone template, size included
    Template,
    /// New empty disk
    Explicit { size_gb: u64 },
}

/// A declared virtual disk. Position in the disk list picks its unit number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    pub source: DiskSource,
    #[serde(default, rename = "type")]
    pub disk_type: DiskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore: Option<String>,
}

impl DiskSpec {
    pub fn from_template() -> Self {
        Self {
            source: DiskSource::Template,
            disk_type: DiskType::default(),
            iops: None,
            datastore: None,
        }
    }

    pub fn sized(size_gb: u64) -> Self {
        Self {
            source: DiskSource::Explicit { size_gb },
            disk_type: DiskType::default(),
            iops: None,
            datastore: None,
        }
    }

    pub fn disk_type(mut self, disk_type: DiskType) -> Self {
        self.disk_type = disk_type;
        self
    }

    pub fn iops(mut self, iops: u32) -> Self {
        self.iops = Some(iops);
        self
    }

    pub fn datastore(mut self, datastore: impl Into<String>) -> Self {
        self.datastore = Some(datastore.into());
        self
    }

    pub fn is_template(&self) -> bool {
        matches!(self.source, DiskSource::Template)
    }

    pub fn size_gb(&self) -> Option<u64> {
        match self.source {
            DiskSource::Template => None,
            DiskSource::Explicit { size_gb } => Some(size_gb),
        }
    }
}

/// Next free SCSI unit number after `after`, skipping the controller slot
pub fn next_unit_number(after: Option<i32>) -> crate::Result<i32> {
    let mut unit = after.map(|u| u + 1).unwrap_or(0);
    if unit == SCSI_CONTROLLER_UNIT {
        unit += 1;
    }
    if unit > MAX_SCSI_UNIT {
        return Err(crate::Error::Config(format!(
            "no free SCSI unit after {}",
            after.unwrap_or_default()
        )));
    }
    Ok(unit)
}

pub(crate) fn gb_to_kb(size_gb: u64) -> crate::Result<u64> {
    size_gb
        .checked_mul(1024 * 1024)
        .ok_or_else(|| crate::Error::Config(format!("disk size {}GB is out of range", size_gb)))
}

pub(crate) fn kb_to_gb(size_kb: u64) -> u64 {
    size_kb / (1024 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_unit_number_skips_controller() {
        assert_eq!(next_unit_number(None).unwrap(), 0);
        assert_eq!(next_unit_number(Some(0)).unwrap(), 1);
        assert_eq!(next_unit_number(Some(6)).unwrap(), 8);
        assert!(next_unit_number(Some(15)).is_err());
    }

    #[test]
    fn test_disk_type_roundtrip() {
        for ty in [DiskType::Thin, DiskType::EagerZeroed, DiskType::Lazy] {
            assert_eq!(DiskType::parse(ty.as_str()).unwrap(), ty);
            assert_eq!(DiskType::from_backing(ty.is_thin(), ty.is_eager_scrub()), ty);
        }
        assert!(DiskType::parse("sparse").is_err());
    }

    #[test]
    fn test_disk_builder() {
        let disk = DiskSpec::sized(30).disk_type(DiskType::Thin).iops(500);
        assert_eq!(disk.size_gb(), Some(30));
        assert!(!disk.is_template());
        assert_eq!(disk.iops, Some(500));
        assert!(DiskSpec::from_template().is_template());
        assert_eq!(kb_to_gb(gb_to_kb(30).unwrap()), 30);
    }

    #[test]
    fn test_gb_to_kb_overflow() {
        assert_eq!(gb_to_kb(MAX_DISK_SIZE_GB).unwrap(), MAX_DISK_SIZE_GB * 1024 * 1024);
        assert!(matches!(gb_to_kb(1 << 50), Err(crate::Error::Config(_))));
    }
}
