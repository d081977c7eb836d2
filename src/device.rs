//! MachXO part definitions, looked up by IDCODE
use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::protocol::Region;

/// Device family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Family {
    pub name: String,
    pub description: String,
    pub variants: Vec<Chip>,
}

/// Represents one MachXO part
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chip {
    /// Part name, without package and speed grade
    pub name: String,
    #[serde(deserialize_with = "parse_hex_u32")]
    pub device_id: u32,
    /// Pages of configuration flash
    pub config_pages: u32,
    /// Pages of user flash memory
    #[serde(default)]
    pub ufm_pages: u32,
}

impl ::std::fmt::Display for Chip {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(f, "{}(0x{:08x})", self.name, self.device_id)
    }
}

impl Chip {
    pub const fn pages(&self, region: Region) -> u32 {
        match region {
            Region::Config => self.config_pages,
            Region::Ufm => self.ufm_pages,
        }
    }

    pub const fn config_size(&self) -> u32 {
        self.config_pages * crate::constants::PAGE_SIZE as u32
    }

    pub const fn ufm_size(&self) -> u32 {
        self.ufm_pages * crate::constants::PAGE_SIZE as u32
    }
}

pub struct ChipDB {
    families: Vec<Family>,
}

impl ChipDB {
    pub fn load() -> Result<Self> {
        Ok(ChipDB {
            families: vec![serde_yaml::from_str(include_str!(
                "../devices/MachXO2.yaml"
            ))?],
        })
    }

    pub fn find_chip(device_id: u32) -> Result<Chip> {
        let db = ChipDB::load()?;

        db.families
            .iter()
            .flat_map(|f| f.variants.iter().map(move |c| (f, c)))
            .find(|(_, c)| c.device_id == device_id)
            .map(|(f, c)| {
                log::debug!("Find chip family: {}", f.name);
                c.clone()
            })
            .ok_or_else(|| anyhow::format_err!("Device ID 0x{:08x} not found", device_id))
    }
}

fn parse_hex_u32<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(digits) => u32::from_str_radix(digits, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| serde::de::Error::custom(format!("error while parsing {:?}: {}", s, e)))
}
