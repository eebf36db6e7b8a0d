//! Image header structures.
//!
//! The header is the first thing in an image and the last thing written: a creation that
//! dies half-way leaves the zeroed placeholder behind, which no reader accepts.

use bytemuck::{Pod, Zeroable};

use crate::block::StreamPosition;
use crate::errors::{IOResult, VafsError};

/// Magic signature of an image header: `"MRD1"`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(transparent)]
pub struct ImageMagic(u32);

impl ImageMagic {
    pub const VALUE: Self = Self(0x3144_524D);

    pub fn is_valid(self) -> bool {
        self == Self::VALUE
    }
}

/// On-disk format revision.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(transparent)]
pub struct ImageVersion(u32);

impl ImageVersion {
    pub const CURRENT: Self = Self(0x0001_0000);

    pub fn is_supported(self) -> bool {
        self == Self::CURRENT
    }
}

/// Machine architecture an image was assembled for.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum Architecture {
    #[default]
    Unknown = 0,
    X86 = 1,
    X64 = 2,
    Arm = 3,
    Arm64 = 4,
    Riscv32 = 5,
    Riscv64 = 6,
    All = 7,
}

impl Architecture {
    /// Decodes the raw header field; unrecognized values map to `Unknown`.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::X86,
            2 => Self::X64,
            3 => Self::Arm,
            4 => Self::Arm64,
            5 => Self::Riscv32,
            6 => Self::Riscv64,
            7 => Self::All,
            _ => Self::Unknown,
        }
    }

    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

impl core::str::FromStr for Architecture {
    type Err = VafsError;

    /// Parses both the canonical names and the spellings archiver front-ends use.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "x86" | "i386" => Ok(Self::X86),
            "x64" | "amd64" => Ok(Self::X64),
            "arm" => Ok(Self::Arm),
            "arm64" => Ok(Self::Arm64),
            "riscv32" | "rv32" => Ok(Self::Riscv32),
            "riscv64" | "rv64" => Ok(Self::Riscv64),
            "all" => Ok(Self::All),
            _ => Err(VafsError::InvalidArgument),
        }
    }
}

impl core::fmt::Display for Architecture {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::X86 => "x86",
            Self::X64 => "x64",
            Self::Arm => "arm",
            Self::Arm64 => "arm64",
            Self::Riscv32 => "riscv32",
            Self::Riscv64 => "riscv64",
            Self::All => "all",
        };

        f.write_str(name)
    }
}

/// Fixed header at offset zero of every image.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct ImageHeader {
    /// Image signature, [`ImageMagic::VALUE`].
    pub magic: ImageMagic,

    /// Format revision, [`ImageVersion::CURRENT`].
    pub version: ImageVersion,

    /// Raw [`Architecture`] value.
    pub architecture: u32,

    /// Number of records in the feature table that follows the header.
    pub feature_count: u16,

    pub reserved: u16,

    /// Reserved for future flags.
    pub attributes: u32,

    /// Absolute offset of the descriptor stream header.
    pub descriptor_block_offset: u32,

    /// Absolute offset of the data stream header.
    pub data_block_offset: u32,

    /// Position of the root directory's body in the descriptor stream.
    pub root_descriptor: StreamPosition,
}

impl ImageHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Validates a header read from a device of `device_len` bytes.
    ///
    /// # Errors
    ///
    /// [`VafsError::IoIntegrity`] on a bad magic, an unsupported version, or stream
    /// offsets that do not carve two ordered regions out of the device.
    pub fn validate(&self, device_len: u64) -> IOResult<()> {
        if !self.magic.is_valid() {
            log::error!(target: "vafs", "bad image magic {:#010x}", self.magic.0);
            return Err(VafsError::IoIntegrity);
        }

        if !self.version.is_supported() {
            log::error!(target: "vafs", "unsupported image version {:#010x}", self.version.0);
            return Err(VafsError::IoIntegrity);
        }

        let descriptors = u64::from(self.descriptor_block_offset);
        let data = u64::from(self.data_block_offset);

        if descriptors < Self::SIZE as u64 || descriptors >= data || data >= device_len {
            log::error!(
                target: "vafs",
                "stream offsets out of range: descriptors at {descriptors}, data at {data}, device is {device_len} bytes"
            );
            return Err(VafsError::IoIntegrity);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_36_bytes() {
        assert_eq!(ImageHeader::SIZE, 36);
    }

    #[test]
    fn image_magic_spells_mrd1() {
        assert_eq!(&ImageMagic::VALUE.0.to_le_bytes(), b"MRD1");
    }

    #[test]
    fn architecture_round_trips_through_raw_and_names() {
        for arch in [
            Architecture::Unknown,
            Architecture::X86,
            Architecture::X64,
            Architecture::Arm,
            Architecture::Arm64,
            Architecture::Riscv32,
            Architecture::Riscv64,
            Architecture::All,
        ] {
            assert_eq!(Architecture::from_raw(arch.as_raw()), arch);
        }

        assert_eq!(Architecture::from_raw(0xFFFF), Architecture::Unknown);
        assert_eq!("amd64".parse::<Architecture>().unwrap(), Architecture::X64);
        assert_eq!("rv64".parse::<Architecture>().unwrap(), Architecture::Riscv64);
        assert_eq!(
            "sparc".parse::<Architecture>(),
            Err(VafsError::InvalidArgument)
        );
    }

    #[test]
    fn validation_rejects_overlapping_streams() {
        let header = ImageHeader {
            magic: ImageMagic::VALUE,
            version: ImageVersion::CURRENT,
            architecture: Architecture::X64.as_raw(),
            feature_count: 0,
            reserved: 0,
            attributes: 0,
            descriptor_block_offset: 36,
            data_block_offset: 100,
            root_descriptor: StreamPosition::default(),
        };

        assert!(header.validate(4096).is_ok());

        let mut bad = header;
        bad.data_block_offset = 36;
        assert_eq!(bad.validate(4096), Err(VafsError::IoIntegrity));

        let mut bad = header;
        bad.magic = ImageMagic(1);
        assert_eq!(bad.validate(4096), Err(VafsError::IoIntegrity));

        assert_eq!(header.validate(50), Err(VafsError::IoIntegrity));
    }
}
