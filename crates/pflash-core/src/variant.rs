//! Supported hardware generations.
//!
//! Each variant carries its configuration as data ([`VariantProfile`]);
//! behavior that differs between generations goes through [`FlashTarget`].

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

use crate::diff::DiffExtractor;
use crate::fallback::init_packet::{legacy_init_packet, secure_init_packet};
use crate::hex::{AddressWindow, Flavor, HexRecord, HexVersion, MemoryImage, UniversalHexRegionFilter};

/// BLE services a device may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Service {
    /// Legacy (nRF51) DFU control.
    DfuControl,
    /// Secure (nRF52) DFU.
    SecureDfu,
    /// Partial flashing characteristic.
    PartialFlashing,
}

/// Per-generation configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantProfile {
    pub name: &'static str,
    pub compatible_hex: &'static [HexVersion],
    pub required_services: &'static [Service],
    pub optional_services: &'static [Service],
    /// Universal block flavor holding this generation's image.
    pub flavor: Flavor,
    /// Window used to narrow the image before diffing.
    pub filter_window: AddressWindow,
    pub page_size: u32,
    /// Window of the full-image binary.
    pub full_image_window: AddressWindow,
    /// Where the diff marker may sit.
    pub marker_addresses: &'static [u32],
    /// Gaps in the full image are padded instead of dropped.
    pub pad_full_image: bool,
}

pub static V1V2_PROFILE: VariantProfile = VariantProfile {
    name: "Calliope mini V1/V2",
    compatible_hex: &[HexVersion::Universal, HexVersion::V2],
    required_services: &[Service::DfuControl],
    optional_services: &[Service::PartialFlashing],
    flavor: Flavor::Nrf51,
    filter_window: AddressWindow::new(0x18000, 0x3C000),
    page_size: 0x400,
    full_image_window: AddressWindow::new(0x18000, 0x3C000),
    marker_addresses: &[0x1F000],
    pad_full_image: false,
};

pub static V3_PROFILE: VariantProfile = VariantProfile {
    name: "Calliope mini V3",
    compatible_hex: &[HexVersion::Universal, HexVersion::V3],
    required_services: &[Service::SecureDfu],
    optional_services: &[Service::PartialFlashing],
    flavor: Flavor::Nrf52,
    filter_window: AddressWindow::new(0x1C000, 0x77000),
    page_size: 0x1000,
    full_image_window: AddressWindow::new(0x1C000, 0x73000),
    marker_addresses: &[0x47000, 0x77000],
    pad_full_image: true,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareVariant {
    V1V2,
    V3,
}

impl HardwareVariant {
    pub const ALL: [HardwareVariant; 2] = [HardwareVariant::V1V2, HardwareVariant::V3];
}

impl fmt::Display for HardwareVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.profile().name)
    }
}

impl std::str::FromStr for HardwareVariant {
    type Err = VariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "v1" | "v2" | "v1v2" => Ok(Self::V1V2),
            "v3" => Ok(Self::V3),
            other => Err(VariantError::UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VariantError {
    #[error("Unknown hardware variant: {0}")]
    UnknownVariant(String),

    #[error("{variant} has no firmware data in 0x{min:X}..0x{max:X}")]
    EmptyImage {
        variant: &'static str,
        min: u32,
        max: u32,
    },
}

/// Complete image and init packet for the full-update collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwarePackage {
    pub bin: Vec<u8>,
    pub init_packet: Vec<u8>,
}

/// Capabilities that depend on the hardware generation.
pub trait FlashTarget {
    fn profile(&self) -> &'static VariantProfile;

    /// Whether a file with these signatures can be flashed.
    fn accepts(&self, versions: &BTreeSet<HexVersion>) -> bool {
        self.profile()
            .compatible_hex
            .iter()
            .any(|v| versions.contains(v))
    }

    /// Whether the device exposes everything partial flashing needs.
    fn supports_partial_flashing(&self, discovered: &[Service]) -> bool {
        discovered.contains(&Service::PartialFlashing)
    }

    fn region_filter(&self) -> UniversalHexRegionFilter {
        let profile = self.profile();
        UniversalHexRegionFilter::new(profile.filter_window).with_flavor(profile.flavor)
    }

    fn diff_extractor(&self) -> DiffExtractor {
        DiffExtractor::new().with_marker_addresses(self.profile().marker_addresses)
    }

    /// Memory image of this generation's firmware.
    fn memory_image(&self, records: &[HexRecord]) -> MemoryImage {
        let profile = self.profile();
        MemoryImage::from_records(records, |r| {
            r.flavor.is_none_or(|f| f == profile.flavor)
        })
        .clip(profile.full_image_window)
    }

    /// Binary plus init packet for the full update.
    fn full_image(&self, records: &[HexRecord]) -> Result<FirmwarePackage, VariantError>;
}

impl FlashTarget for HardwareVariant {
    fn profile(&self) -> &'static VariantProfile {
        match self {
            HardwareVariant::V1V2 => &V1V2_PROFILE,
            HardwareVariant::V3 => &V3_PROFILE,
        }
    }

    fn full_image(&self, records: &[HexRecord]) -> Result<FirmwarePackage, VariantError> {
        let profile = self.profile();
        let image = self.memory_image(records);
        if image.is_empty() {
            return Err(VariantError::EmptyImage {
                variant: profile.name,
                min: profile.full_image_window.min,
                max: profile.full_image_window.max,
            });
        }

        let bin = if profile.pad_full_image {
            image.to_padded_bin(0xFF)
        } else {
            image.to_concatenated_bin()
        };
        let init_packet = match self {
            HardwareVariant::V1V2 => legacy_init_packet(&bin),
            HardwareVariant::V3 => secure_init_packet(&bin),
        };
        Ok(FirmwarePackage { bin, init_packet })
    }
}
