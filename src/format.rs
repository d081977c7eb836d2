//! Bitstream file formats
use std::str;
use std::{borrow::Cow, path::Path};

use anyhow::Result;

use crate::constants::PAGE_SIZE;

/// Upper bound for a decoded image, far above the largest configuration flash.
const MAX_IMAGE_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum BitstreamFormat {
    /// ASCII hex digits, fed to the device as a stream
    PlainHex,
    IntelHex,
    /// JEDEC fuse map (.jed)
    Jedec,
    Binary,
}

/// A bitstream ready to be programmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bitstream {
    /// Raw hex text, decoded page by page while programming.
    HexStream(Vec<u8>),
    /// Decoded configuration flash contents, starting at page 0.
    Image(Vec<u8>),
}

impl Bitstream {
    /// Length of the underlying data in bytes.
    pub fn len(&self) -> usize {
        match self {
            Bitstream::HexStream(raw) | Bitstream::Image(raw) => raw.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn read_bitstream_from_file<P: AsRef<Path>>(
    path: P,
    format: Option<BitstreamFormat>,
) -> Result<Bitstream> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;
    anyhow::ensure!(!raw.is_empty(), "{} is empty", p.display());

    let format = format.unwrap_or_else(|| guess_format(p, &raw));
    log::info!("Read {} as {:?} format", p.display(), format);
    match format {
        BitstreamFormat::PlainHex => Ok(Bitstream::HexStream(raw)),
        BitstreamFormat::IntelHex => Ok(Bitstream::Image(read_ihex(str::from_utf8(&raw)?)?)),
        BitstreamFormat::Jedec => Ok(Bitstream::Image(read_jedec(&String::from_utf8_lossy(&raw))?)),
        BitstreamFormat::Binary => Ok(Bitstream::Image(raw)),
    }
}

pub fn guess_format(path: &Path, raw: &[u8]) -> BitstreamFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ext == "jed" {
        return BitstreamFormat::Jedec;
    }
    if ["bin", "bit"].contains(&&*ext) {
        return BitstreamFormat::Binary;
    }

    // JEDEC files open with STX
    if raw.first() == Some(&0x02) {
        BitstreamFormat::Jedec
    } else if raw.first() == Some(&b':')
        && raw
            .iter()
            .all(|&c| c.is_ascii_hexdigit() || c == b':' || c == b'\n' || c == b'\r')
    {
        BitstreamFormat::IntelHex
    } else if raw.iter().all(|&c| c.is_ascii_hexdigit() || c.is_ascii_whitespace()) {
        BitstreamFormat::PlainHex
    } else {
        BitstreamFormat::Binary
    }
}

/// Extract the configuration fuse rows following the `L0` field.
///
/// Every row holds 128 fuses, one page, most significant bit first.
pub fn read_jedec(data: &str) -> Result<Vec<u8>> {
    let mut lines = data.lines().map(str::trim);

    let mut found = false;
    for line in lines.by_ref() {
        if let Some(addr) = line.strip_prefix('L') {
            let addr = addr.trim_end_matches('*').trim();
            if addr.parse::<u32>().is_ok_and(|a| a == 0) {
                found = true;
                break;
            }
            log::debug!("skipping JEDEC field L{}", addr);
        }
    }
    anyhow::ensure!(found, "no configuration fuse data (L0) found");

    let mut image = Vec::new();
    let mut terminated = false;
    for line in lines {
        let (row, last) = match line.strip_suffix('*') {
            Some(row) => (row, true),
            None => (line, false),
        };
        if row.len() == PAGE_SIZE * 8 {
            image.extend(parse_fuse_row(row)?);
        } else if !row.is_empty() {
            anyhow::bail!("bad page data format: {:?}", line);
        }
        if last {
            terminated = true;
            break;
        }
    }
    anyhow::ensure!(terminated, "fuse data not terminated by '*'");
    log::debug!("JEDEC: {} configuration pages", image.len() / PAGE_SIZE);
    Ok(image)
}

fn parse_fuse_row(row: &str) -> Result<Vec<u8>> {
    row.as_bytes()
        .chunks(8)
        .map(|bits| {
            bits.iter().try_fold(0u8, |acc, &b| match b {
                b'0' => Ok(acc << 1),
                b'1' => Ok((acc << 1) | 1),
                _ => Err(anyhow::format_err!("invalid fuse character {:?}", b as char)),
            })
        })
        .collect()
}

pub fn read_ihex(data: &str) -> Result<Vec<u8>> {
    use ihex::Record;

    let mut base_address = 0;

    let mut records = vec![];
    for record in ihex::Reader::new(data) {
        let record = record?;
        use Record::*;
        match record {
            Data { offset, value } => {
                let offset = base_address + offset as u32;

                records.push((offset, value.into()));
            }
            EndOfFile => (),
            ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            StartSegmentAddress { .. } => (),
            ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            StartLinearAddress(_) => (),
        };
    }
    merge_sections(records)
}

/// Lay sections out in one image starting at the lowest address, gaps as 0xff.
fn merge_sections(mut sections: Vec<(u32, Cow<[u8]>)>) -> Result<Vec<u8>> {
    sections.sort(); // order by start address

    let (Some(first), Some(last)) = (sections.first(), sections.last()) else {
        anyhow::bail!("no data records");
    };
    let start_address = first.0 as u64;
    let end_address = sections
        .iter()
        .map(|(addr, sect)| *addr as u64 + sect.len() as u64)
        .max()
        .unwrap_or(last.0 as u64);

    let total_size = end_address - start_address;
    anyhow::ensure!(
        total_size <= MAX_IMAGE_SIZE,
        "image spans 0x{:x}..0x{:x}, more than {} bytes",
        start_address,
        end_address,
        MAX_IMAGE_SIZE
    );

    // erased flash reads back as ones
    let mut binary = vec![0xffu8; total_size as usize];
    for (addr, sect) in sections {
        let sect_start = (addr as u64 - start_address) as usize;
        let sect_end = sect_start + sect.len();
        binary[sect_start..sect_end].copy_from_slice(&sect);
    }
    Ok(binary)
}
