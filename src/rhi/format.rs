// Pixel formats
//
// The numeric values are a persisted contract (serialized assets store them),
// so variants must never be reordered.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::fmt;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Format {
    // R
    R8Unorm = 0,
    R8Uint = 1,
    R16Unorm = 2,
    R16Uint = 3,
    R16Float = 4,
    R32Uint = 5,
    R32Float = 6,
    // RG
    R8G8Unorm = 7,
    R16G16Float = 8,
    R32G32Float = 9,
    // RGB
    R11G11B10Float = 10,
    R32G32B32Float = 11,
    // RGBA
    R8G8B8A8Unorm = 12,
    R10G10B10A2Unorm = 13,
    R16G16B16A16Unorm = 14,
    R16G16B16A16Snorm = 15,
    R16G16B16A16Float = 16,
    R32G32B32A32Float = 17,
    // Depth
    D16Unorm = 18,
    D32Float = 19,
    D32FloatS8X24Uint = 20,
    // Compressed
    Bc7 = 21,
    Astc = 22,
    // Surface
    B8R8G8A8Unorm = 23,
    // End
    Undefined = 24,
}

impl Format {
    /// Every format, in numeric order
    pub const ALL: [Format; 25] = [
        Format::R8Unorm,
        Format::R8Uint,
        Format::R16Unorm,
        Format::R16Uint,
        Format::R16Float,
        Format::R32Uint,
        Format::R32Float,
        Format::R8G8Unorm,
        Format::R16G16Float,
        Format::R32G32Float,
        Format::R11G11B10Float,
        Format::R32G32B32Float,
        Format::R8G8B8A8Unorm,
        Format::R10G10B10A2Unorm,
        Format::R16G16B16A16Unorm,
        Format::R16G16B16A16Snorm,
        Format::R16G16B16A16Float,
        Format::R32G32B32A32Float,
        Format::D16Unorm,
        Format::D32Float,
        Format::D32FloatS8X24Uint,
        Format::Bc7,
        Format::Astc,
        Format::B8R8G8A8Unorm,
        Format::Undefined,
    ];

    /// Bits stored per channel
    ///
    /// # Panics
    /// Packed, depth and compressed formats have no uniform channel width.
    pub fn bits_per_channel(self) -> u32 {
        match self {
            Format::R8Unorm => 8,
            Format::R8Uint => 8,
            Format::R16Unorm => 16,
            Format::R16Uint => 16,
            Format::R16Float => 16,
            Format::R32Uint => 32,
            Format::R32Float => 32,
            Format::R8G8Unorm => 8,
            Format::R16G16Float => 16,
            Format::R32G32Float => 32,
            Format::R32G32B32Float => 32,
            Format::R8G8B8A8Unorm => 8,
            Format::R16G16B16A16Unorm => 16,
            Format::R16G16B16A16Snorm => 16,
            Format::R16G16B16A16Float => 16,
            Format::R32G32B32A32Float => 32,
            _ => panic!("Unsupported format: {}", self.as_str()),
        }
    }

    /// Number of channels
    ///
    /// # Panics
    /// Compressed and undefined formats have no channel count.
    pub fn channel_count(self) -> u32 {
        match self {
            Format::R8Unorm => 1,
            Format::R8Uint => 1,
            Format::R16Unorm => 1,
            Format::R16Uint => 1,
            Format::R16Float => 1,
            Format::R32Uint => 1,
            Format::R32Float => 1,
            Format::R8G8Unorm => 2,
            Format::R16G16Float => 2,
            Format::R32G32Float => 2,
            Format::R11G11B10Float => 3,
            Format::R32G32B32Float => 3,
            Format::R8G8B8A8Unorm => 4,
            Format::R10G10B10A2Unorm => 4,
            Format::R16G16B16A16Unorm => 4,
            Format::R16G16B16A16Snorm => 4,
            Format::R16G16B16A16Float => 4,
            Format::R32G32B32A32Float => 4,
            Format::D32Float => 1,
            _ => panic!("Unsupported format: {}", self.as_str()),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Format::R8Unorm => "R8_Unorm",
            Format::R8Uint => "R8_Uint",
            Format::R16Unorm => "R16_Unorm",
            Format::R16Uint => "R16_Uint",
            Format::R16Float => "R16_Float",
            Format::R32Uint => "R32_Uint",
            Format::R32Float => "R32_Float",
            Format::R8G8Unorm => "R8G8_Unorm",
            Format::R16G16Float => "R16G16_Float",
            Format::R32G32Float => "R32G32_Float",
            Format::R11G11B10Float => "R11G11B10_Float",
            Format::R32G32B32Float => "R32G32B32_Float",
            Format::R8G8B8A8Unorm => "R8G8B8A8_Unorm",
            Format::R10G10B10A2Unorm => "R10G10B10A2_Unorm",
            Format::R16G16B16A16Unorm => "R16G16B16A16_Unorm",
            Format::R16G16B16A16Snorm => "R16G16B16A16_Snorm",
            Format::R16G16B16A16Float => "R16G16B16A16_Float",
            Format::R32G32B32A32Float => "R32G32B32A32_Float",
            Format::D16Unorm => "D16_Unorm",
            Format::D32Float => "D32_Float",
            Format::D32FloatS8X24Uint => "D32_Float_S8X24_Uint",
            Format::Bc7 => "BC7",
            Format::Astc => "ASTC",
            Format::B8R8G8A8Unorm => "B8R8G8A8_Unorm",
            Format::Undefined => "Undefined",
        }
    }

    pub const fn is_depth(self) -> bool {
        matches!(self, Format::D16Unorm | Format::D32Float | Format::D32FloatS8X24Uint)
    }

    pub const fn has_stencil(self) -> bool {
        matches!(self, Format::D32FloatS8X24Uint)
    }
}

impl From<Format> for u32 {
    fn from(format: Format) -> Self {
        format as u32
    }
}

impl TryFrom<u32> for Format {
    type Error = anyhow::Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Format::ALL
            .get(value as usize)
            .copied()
            .ok_or_else(|| anyhow!("Unknown format value {}", value))
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn numeric_values_follow_declaration_order() {
        for (i, format) in Format::ALL.iter().enumerate() {
            assert_eq!(u32::from(*format), i as u32);
            assert_eq!(Format::try_from(i as u32).unwrap(), *format);
        }
        assert!(Format::try_from(Format::ALL.len() as u32).is_err());
    }

    #[test]
    fn names_are_unique_and_stable() {
        let names: HashSet<_> = Format::ALL.iter().map(|f| f.as_str()).collect();
        assert_eq!(names.len(), Format::ALL.len());
        assert_eq!(Format::R8G8B8A8Unorm.as_str(), Format::R8G8B8A8Unorm.as_str());
        assert_eq!(Format::D32FloatS8X24Uint.to_string(), "D32_Float_S8X24_Uint");
    }

    #[test]
    fn lookups_cover_uncompressed_color_formats() {
        assert_eq!(Format::R8G8B8A8Unorm.bits_per_channel(), 8);
        assert_eq!(Format::R8G8B8A8Unorm.channel_count(), 4);
        assert_eq!(Format::R32G32Float.bits_per_channel(), 32);
        assert_eq!(Format::R32G32Float.channel_count(), 2);
        assert_eq!(Format::R11G11B10Float.channel_count(), 3);
        assert_eq!(Format::D32Float.channel_count(), 1);
    }

    #[test]
    #[should_panic(expected = "Unsupported format")]
    fn bits_per_channel_rejects_compressed() {
        Format::Bc7.bits_per_channel();
    }

    #[test]
    #[should_panic(expected = "Unsupported format")]
    fn channel_count_rejects_undefined() {
        Format::Undefined.channel_count();
    }

    #[test]
    fn serializes_as_numeric_value() {
        #[derive(Serialize, Deserialize)]
        struct Asset {
            format: Format,
        }

        let text = toml::to_string(&Asset { format: Format::R16G16Float }).unwrap();
        assert_eq!(text.trim(), "format = 8");

        let asset: Asset = toml::from_str("format = 19").unwrap();
        assert_eq!(asset.format, Format::D32Float);
        assert!(toml::from_str::<Asset>("format = 99").is_err());
    }
}
