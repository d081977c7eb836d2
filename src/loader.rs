//! Page programming from ASCII hex streams and decoded images.
//!
//! A hex stream is a sequence of hex digits. Any other character is a record
//! separator: it drops the bytes collected for the current record that did not
//! yet fill a page. Every 16 decoded bytes are programmed as one page.

use std::{
    fmt,
    io::{BufReader, Read},
};

use anyhow::Result;

use crate::{
    Transport,
    constants::PAGE_SIZE,
    machxo::MachXO,
    protocol::PageBuffer,
};

/// How records relate to pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum RecordLayout {
    /// Pages are cut every 16 bytes, a record may hold many pages.
    #[default]
    Continuous,
    /// Each record is exactly one page, as in one-page-per-line exports.
    /// Bytes beyond the first page of a record are dropped.
    PagePerRecord,
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub layout: RecordLayout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnomalyKind {
    /// A record ended on an unpaired hex digit, the digit was dropped.
    OddDigit,
    /// A record held more than one page (page-per-record layout only).
    Overflow,
    /// A separator cut a record short, `bytes` were dropped.
    PartialRecord { bytes: usize },
}

/// A malformation found in the stream. Loading carries on past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Anomaly {
    /// Byte offset in the stream where it was detected
    pub offset: u64,
    pub kind: AnomalyKind,
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            AnomalyKind::OddDigit => {
                write!(f, "uneven number of hex digits at offset {}", self.offset)
            }
            AnomalyKind::Overflow => {
                write!(f, "too many hex digits in record at offset {}", self.offset)
            }
            AnomalyKind::PartialRecord { bytes } => {
                write!(f, "{} bytes dropped by separator at offset {}", bytes, self.offset)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub pages_written: u32,
    /// Bytes after the last full page, never sent
    pub leftover_bytes: usize,
    pub anomalies: Vec<Anomaly>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.leftover_bytes == 0 && self.anomalies.is_empty()
    }
}

/// Assembles pages from hex characters.
struct HexLoader {
    page: PageBuffer,
    layout: RecordLayout,
    count: usize,
    nibble: Option<u8>,
    /// Record already produced its page (page-per-record)
    record_full: bool,
    overflowed: bool,
    offset: u64,
    report: LoadReport,
}

impl HexLoader {
    fn new(layout: RecordLayout) -> Self {
        HexLoader {
            page: PageBuffer::new(),
            layout,
            count: 0,
            nibble: None,
            record_full: false,
            overflowed: false,
            offset: 0,
            report: LoadReport::default(),
        }
    }

    fn feed<F>(&mut self, c: u8, flush: &mut F) -> Result<()>
    where
        F: FnMut(&PageBuffer) -> Result<()>,
    {
        match (c as char).to_digit(16) {
            None => self.end_record(),
            Some(lo) => match self.nibble.take() {
                None => self.nibble = Some(lo as u8),
                Some(hi) => self.push_byte((hi << 4) | lo as u8, flush)?,
            },
        }
        self.offset += 1;
        Ok(())
    }

    fn push_byte<F>(&mut self, byte: u8, flush: &mut F) -> Result<()>
    where
        F: FnMut(&PageBuffer) -> Result<()>,
    {
        if self.record_full {
            if !self.overflowed {
                self.overflowed = true;
                self.anomaly(AnomalyKind::Overflow);
            }
            return Ok(());
        }

        self.page.payload_mut()[self.count] = byte;
        self.count += 1;
        if self.count == PAGE_SIZE {
            flush(&self.page)?;
            self.report.pages_written += 1;
            self.count = 0;
            self.record_full = self.layout == RecordLayout::PagePerRecord;
        }
        Ok(())
    }

    fn end_record(&mut self) {
        if self.nibble.take().is_some() {
            self.anomaly(AnomalyKind::OddDigit);
        }
        if self.count > 0 {
            self.anomaly(AnomalyKind::PartialRecord { bytes: self.count });
            self.count = 0;
        }
        self.record_full = false;
        self.overflowed = false;
    }

    fn anomaly(&mut self, kind: AnomalyKind) {
        self.report.anomalies.push(Anomaly {
            offset: self.offset,
            kind,
        });
    }

    fn finish(mut self) -> LoadReport {
        if self.nibble.take().is_some() {
            self.anomaly(AnomalyKind::OddDigit);
        }
        self.report.leftover_bytes = self.count;
        self.report
    }
}

fn run_stream<R, F>(reader: R, layout: RecordLayout, mut flush: F) -> Result<LoadReport>
where
    R: Read,
    F: FnMut(&PageBuffer) -> Result<()>,
{
    let mut loader = HexLoader::new(layout);
    for c in BufReader::new(reader).bytes() {
        loader.feed(c?, &mut flush)?;
    }
    Ok(loader.finish())
}

/// Decode a hex stream into the page image it would program.
pub fn decode_hex_stream<R: Read>(
    reader: R,
    layout: RecordLayout,
) -> Result<(Vec<u8>, LoadReport)> {
    let mut image = Vec::new();
    let report = run_stream(reader, layout, |page| {
        image.extend_from_slice(page.payload());
        Ok(())
    })?;
    Ok((image, report))
}

impl<T: Transport + ?Sized> MachXO<'_, T> {
    /// Program configuration flash from a hex stream.
    ///
    /// Resets the configuration address pointer first. Stream malformations
    /// end up in the report; only bus and ordering failures are errors.
    pub fn load_hex<R: Read>(&mut self, reader: R, options: &LoadOptions) -> Result<LoadReport> {
        self.reset_config_address()?;
        let report = run_stream(reader, options.layout, |page| self.program_page(page))?;

        for anomaly in &report.anomalies {
            log::warn!("{}", anomaly);
        }
        log::info!("{} pages written", report.pages_written);
        if report.leftover_bytes > 0 {
            log::warn!("{} bytes left over", report.leftover_bytes);
        }
        Ok(report)
    }

    /// Program configuration flash from a decoded image, one page per 16 bytes.
    pub fn program_image(&mut self, image: &[u8]) -> Result<LoadReport> {
        self.program_image_with(image, |_| ())
    }

    /// Like [`Self::program_image`], calling `progress` with the number of
    /// bytes written after every page.
    pub fn program_image_with<F>(&mut self, image: &[u8], mut progress: F) -> Result<LoadReport>
    where
        F: FnMut(u64),
    {
        self.reset_config_address()?;

        let mut page = PageBuffer::new();
        let mut report = LoadReport::default();
        let chunks = image.chunks_exact(PAGE_SIZE);
        report.leftover_bytes = chunks.remainder().len();
        for chunk in chunks {
            page.payload_mut().copy_from_slice(chunk);
            self.program_page(&page)?;
            report.pages_written += 1;
            progress(report.pages_written as u64 * PAGE_SIZE as u64);
        }

        log::info!("{} pages written", report.pages_written);
        if report.leftover_bytes > 0 {
            log::warn!("{} bytes left over, image is not page aligned", report.leftover_bytes);
        }
        Ok(report)
    }

    /// Read configuration flash back from page 0 and compare with `image`.
    ///
    /// A trailing partial page is not compared since it is never programmed.
    pub fn verify_image(&mut self, image: &[u8]) -> Result<()> {
        self.reset_config_address()?;
        for (i, expected) in image.chunks_exact(PAGE_SIZE).enumerate() {
            let actual = self.read_flash()?;
            anyhow::ensure!(
                actual[..] == *expected,
                "verify failed at page {}: expected {}, read {}",
                i,
                hex::encode(expected),
                hex::encode(actual)
            );
        }
        log::info!("{} pages verified", image.len() / PAGE_SIZE);
        Ok(())
    }
}
