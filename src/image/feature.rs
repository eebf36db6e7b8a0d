//! Feature table.
//!
//! Features are GUID-tagged extension records stored between the header and the
//! descriptor stream. Two builtin records persist: the overview (entry counts and total
//! content bytes) and the filter family. Filter callbacks themselves never hit the disk;
//! they are configuration, matched against the stored family at open time.

use alloc::vec::Vec;

use bytemuck::{bytes_of, pod_read_unaligned, Pod, Zeroable};

use crate::device::StreamDevice;
use crate::errors::{CanFail, IOResult, VafsError};
use crate::filter::FilterFamily;

/// 16-byte identifier of a feature record.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(transparent)]
pub struct FeatureGuid(pub [u8; 16]);

impl FeatureGuid {
    /// Builtin overview feature.
    pub const OVERVIEW: Self = Self([
        0x76, 0x61, 0x66, 0x73, 0x6F, 0x76, 0x76, 0x77, 0x4D, 0x52, 0x44, 0x31, 0x00, 0x00, 0x00,
        0x01,
    ]);

    /// Builtin filter-family feature.
    pub const FILTER: Self = Self([
        0x76, 0x61, 0x66, 0x73, 0x66, 0x6C, 0x74, 0x72, 0x4D, 0x52, 0x44, 0x31, 0x00, 0x00, 0x00,
        0x02,
    ]);
}

impl core::fmt::Display for FeatureGuid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for byte in self.0 {
            f.write_fmt(format_args!("{byte:02x}"))?;
        }

        Ok(())
    }
}

/// Fixed prefix of an on-disk feature record: the GUID and the total record length,
/// payload included.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
struct FeatureRecordHead {
    guid: FeatureGuid,
    length: u32,
}

impl FeatureRecordHead {
    const SIZE: usize = core::mem::size_of::<Self>();
}

/// One feature record: a GUID plus an opaque payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Feature {
    pub guid: FeatureGuid,
    pub payload: Vec<u8>,
}

/// Payload of the builtin overview feature.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Overview {
    /// Number of regular files reachable from the root.
    pub files: u32,

    /// Number of directories reachable from the root, the root excluded.
    pub directories: u32,

    /// Number of symlinks reachable from the root.
    pub symlinks: u32,

    pub reserved: u32,

    /// Sum of all file content lengths, before any filter ran.
    pub total_uncompressed_bytes: u64,
}

impl Overview {
    /// Packages these totals as a feature record.
    pub fn to_feature(&self) -> Feature {
        Feature {
            guid: FeatureGuid::OVERVIEW,
            payload: bytes_of(self).to_vec(),
        }
    }

    /// Parses an overview payload back out of a feature record.
    ///
    /// # Errors
    ///
    /// [`VafsError::InvalidArgument`] if the record is not an overview;
    /// [`VafsError::IoIntegrity`] if the payload has the wrong size.
    pub fn from_feature(feature: &Feature) -> IOResult<Self> {
        if feature.guid != FeatureGuid::OVERVIEW {
            return Err(VafsError::InvalidArgument);
        }

        if feature.payload.len() != core::mem::size_of::<Self>() {
            return Err(VafsError::IoIntegrity);
        }

        Ok(pod_read_unaligned(&feature.payload))
    }
}

/// Packages a filter family as a feature record.
pub(crate) fn filter_feature(family: FilterFamily) -> Feature {
    Feature {
        guid: FeatureGuid::FILTER,
        payload: family.0.to_le_bytes().to_vec(),
    }
}

/// Extracts the filter family out of a filter feature record.
pub(crate) fn filter_family_of(feature: &Feature) -> IOResult<FilterFamily> {
    if feature.guid != FeatureGuid::FILTER {
        return Err(VafsError::InvalidArgument);
    }

    let raw: [u8; 4] = feature
        .payload
        .as_slice()
        .try_into()
        .map_err(|_| VafsError::IoIntegrity)?;

    Ok(FilterFamily(u32::from_le_bytes(raw)))
}

/// The ordered set of features attached to an image.
#[derive(Default)]
pub struct FeatureTable {
    features: Vec<Feature>,
}

impl FeatureTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `feature`, rejecting duplicate GUIDs.
    pub fn add(&mut self, feature: Feature) -> CanFail {
        if self.query(feature.guid).is_some() {
            return Err(VafsError::AlreadyExists);
        }

        self.features.push(feature);
        Ok(())
    }

    /// Returns the feature tagged `guid`, if installed.
    pub fn query(&self, guid: FeatureGuid) -> Option<&Feature> {
        self.features.iter().find(|feature| feature.guid == guid)
    }

    /// Replaces the payload of an installed feature in place.
    pub(crate) fn update(&mut self, feature: Feature) -> CanFail {
        let slot = self
            .features
            .iter_mut()
            .find(|existing| existing.guid == feature.guid)
            .ok_or(VafsError::NoSuchEntry)?;

        *slot = feature;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.features.len()
    }

    /// Total serialized size of the table in bytes.
    pub fn serialized_len(&self) -> usize {
        self.features
            .iter()
            .map(|feature| FeatureRecordHead::SIZE + feature.payload.len())
            .sum()
    }

    /// Writes every record to `device` at its current position.
    pub(crate) fn write_to(&self, device: &mut dyn StreamDevice) -> CanFail {
        for feature in &self.features {
            let head = FeatureRecordHead {
                guid: feature.guid,
                length: u32::try_from(FeatureRecordHead::SIZE + feature.payload.len())
                    .map_err(|_| VafsError::InvalidArgument)?,
            };

            device.write_all(bytes_of(&head))?;
            device.write_all(&feature.payload)?;
        }

        Ok(())
    }

    /// Reads `count` records from `device` at its current position, refusing to read
    /// past `limit`.
    pub(crate) fn read_from(
        device: &mut dyn StreamDevice,
        count: usize,
        limit: usize,
    ) -> IOResult<Self> {
        let mut table = Self::new();
        let mut consumed = 0usize;

        for _ in 0..count {
            let mut raw_head = [0u8; FeatureRecordHead::SIZE];
            device
                .read_exact(&mut raw_head)
                .map_err(|_| VafsError::IoIntegrity)?;

            let head: FeatureRecordHead = pod_read_unaligned(&raw_head);
            let total = head.length as usize;

            if total < FeatureRecordHead::SIZE || consumed + total > limit {
                log::error!(target: "vafs", "feature record {} overruns the feature table", head.guid);
                return Err(VafsError::IoIntegrity);
            }

            let payload_len = total - FeatureRecordHead::SIZE;
            let mut payload = Vec::new();
            payload.try_reserve_exact(payload_len)?;
            payload.resize(payload_len, 0);
            device
                .read_exact(&mut payload)
                .map_err(|_| VafsError::IoIntegrity)?;

            table.add(Feature {
                guid: head.guid,
                payload,
            })?;
            consumed += total;
        }

        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    use crate::device::{DeviceSeek, MemoryDevice};

    #[test]
    fn overview_round_trips_as_a_feature() {
        let overview = Overview {
            files: 3,
            directories: 1,
            symlinks: 2,
            reserved: 0,
            total_uncompressed_bytes: 123_456,
        };

        let parsed = Overview::from_feature(&overview.to_feature()).unwrap();
        assert_eq!(parsed, overview);
    }

    #[test]
    fn duplicate_guid_is_rejected() {
        let mut table = FeatureTable::new();

        table.add(filter_feature(FilterFamily(1))).unwrap();
        assert_eq!(
            table.add(filter_feature(FilterFamily(2))),
            Err(VafsError::AlreadyExists)
        );
    }

    #[test]
    fn table_round_trips_through_a_device() {
        let mut table = FeatureTable::new();
        table.add(Overview::default().to_feature()).unwrap();
        table.add(filter_feature(FilterFamily(7))).unwrap();

        let mut device = MemoryDevice::writable();
        table.write_to(&mut device).unwrap();

        let bytes = device.into_inner();
        assert_eq!(bytes.len(), table.serialized_len());

        let mut reopened: Box<dyn StreamDevice> = Box::new(MemoryDevice::read_only(bytes));
        reopened.seek(DeviceSeek::Start(0)).unwrap();

        let parsed = FeatureTable::read_from(reopened.as_mut(), 2, table.serialized_len()).unwrap();

        assert_eq!(parsed.count(), 2);
        assert_eq!(
            filter_family_of(parsed.query(FeatureGuid::FILTER).unwrap()).unwrap(),
            FilterFamily(7)
        );
        assert_eq!(
            Overview::from_feature(parsed.query(FeatureGuid::OVERVIEW).unwrap()).unwrap(),
            Overview::default()
        );
    }
}
