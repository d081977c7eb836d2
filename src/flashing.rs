//! Configuration session logic.

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};

use crate::{
    Transport,
    constants::PAGE_SIZE,
    format::Bitstream,
    loader::{LoadOptions, LoadReport, RecordLayout, decode_hex_stream},
    machxo::{MachXO, WaitOptions},
    protocol::{EraseFlags, Region},
};

/// Configuration mode entered before touching flash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum ConfigMode {
    /// User design stops while programming.
    #[default]
    Offline,
    /// User design keeps running until refresh.
    Transparent,
}

#[derive(Debug, Clone)]
pub struct FlashOptions {
    pub mode: ConfigMode,
    pub layout: RecordLayout,
    pub verify: bool,
    /// Boot the new configuration when done
    pub refresh: bool,
}

impl Default for FlashOptions {
    fn default() -> Self {
        FlashOptions {
            mode: ConfigMode::Offline,
            layout: RecordLayout::Continuous,
            verify: true,
            refresh: true,
        }
    }
}

pub struct Flashing<'a, T: Transport + ?Sized> {
    device: MachXO<'a, T>,
    wait: WaitOptions,
    device_id: u32,
    progress: bool,
}

impl<'a, T: Transport + ?Sized> Flashing<'a, T> {
    pub fn new(transport: &'a mut T, wait: WaitOptions) -> Result<Self> {
        let mut device = MachXO::new(transport);
        let device_id = device.identify()?;
        anyhow::ensure!(
            device_id != 0 && device_id != 0xffff_ffff,
            "no device responding (ID 0x{:08x})",
            device_id
        );

        Ok(Flashing {
            device,
            wait,
            device_id,
            progress: false,
        })
    }

    /// Draw progress bars on the terminal while programming.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn device(&mut self) -> &mut MachXO<'a, T> {
        &mut self.device
    }

    pub fn dump_info(&mut self) -> Result<()> {
        match self.device.chip() {
            Some(chip) => log::info!(
                "Chip: {} (Config: {} pages/{}KiB, UFM: {} pages/{}KiB)",
                chip,
                chip.config_pages,
                chip.config_size() / 1024,
                chip.ufm_pages,
                chip.ufm_size() / 1024
            ),
            None => log::info!("Chip: unknown (ID 0x{:08x})", self.device_id),
        }
        log::info!("Bus: {}", self.device.bus_kind());
        log::info!("User code: 0x{:08x}", self.device.read_user_code()?);
        log::info!("Status: {}", self.device.read_status()?);
        log::info!("Feature row: {}", hex::encode(self.device.read_feature_row()?));
        log::info!("Feature bits: {}", hex::encode(self.device.read_feature_bits()?));
        log::info!("OTP fuses: 0x{:02x}", self.device.read_otp_fuses()?);
        Ok(())
    }

    fn enter_config(&mut self, mode: ConfigMode) -> Result<()> {
        match mode {
            ConfigMode::Offline => self.device.enable_config_offline()?,
            ConfigMode::Transparent => self.device.enable_config_transparent()?,
        }
        self.device.wait_busy_with(&self.wait)?;
        Ok(())
    }

    pub fn erase(&mut self, flags: EraseFlags, mode: ConfigMode) -> Result<()> {
        self.enter_config(mode)?;
        self.device.erase(flags)?;
        let polls = self.device.wait_busy_with(&self.wait)?;
        log::info!("Erased {:?} ({} busy polls)", flags, polls);
        Ok(())
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len);
        if let Ok(style) = ProgressStyle::with_template(
            "[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
        ) {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar
    }

    /// Erase configuration flash, program `bitstream`, optionally verify and
    /// boot it.
    pub fn flash(&mut self, bitstream: &Bitstream, options: &FlashOptions) -> Result<LoadReport> {
        anyhow::ensure!(!bitstream.is_empty(), "empty bitstream");
        let pages = match bitstream {
            Bitstream::HexStream(raw) => {
                let (_, report) = decode_hex_stream(&raw[..], options.layout)?;
                report.pages_written
            }
            Bitstream::Image(image) => (image.len() / PAGE_SIZE) as u32,
        };
        anyhow::ensure!(pages > 0, "bitstream holds no complete page");
        if let Some(chip) = self.device.chip() {
            anyhow::ensure!(
                pages <= chip.config_pages,
                "bitstream has {} pages, {} only has {}",
                pages,
                chip.name,
                chip.config_pages
            );
        }

        self.erase(EraseFlags::CONFIG_FLASH, options.mode)?;

        let bar = self.progress_bar(bitstream.len() as u64);
        let report = match bitstream {
            Bitstream::HexStream(raw) => {
                let load = LoadOptions {
                    layout: options.layout,
                };
                self.device.load_hex(bar.wrap_read(&raw[..]), &load)?
            }
            Bitstream::Image(image) => self
                .device
                .program_image_with(image, |written| bar.set_position(written))?,
        };
        bar.finish_and_clear();

        if options.verify {
            self.verify_programmed(bitstream, options.layout)?;
        }

        self.device.program_done()?;
        self.device.wait_busy_with(&self.wait)?;
        let status = self.device.read_status()?;
        log::info!("Status: {}", status);
        anyhow::ensure!(!status.fail(), "programming failed: {}", status.config_error());

        if options.refresh {
            self.refresh()?;
        }
        Ok(report)
    }

    fn verify_programmed(&mut self, bitstream: &Bitstream, layout: RecordLayout) -> Result<()> {
        match bitstream {
            Bitstream::HexStream(raw) => {
                let (image, _) = decode_hex_stream(&raw[..], layout)?;
                self.device.verify_image(&image)
            }
            Bitstream::Image(image) => self.device.verify_image(image),
        }
    }

    /// Compare configuration flash with `bitstream` without programming.
    pub fn verify(
        &mut self,
        bitstream: &Bitstream,
        layout: RecordLayout,
        mode: ConfigMode,
    ) -> Result<()> {
        self.enter_config(mode)?;
        self.verify_programmed(bitstream, layout)
    }

    /// Read `pages` pages of `region` starting at `start`.
    ///
    /// The range must fit the 16-bit page address, and the part when it is known.
    pub fn read(&mut self, region: Region, start: u32, pages: u32) -> Result<Vec<u8>> {
        let end = start
            .checked_add(pages)
            .filter(|&end| end <= 0x1_0000)
            .ok_or_else(|| {
                anyhow::format_err!("pages {}+{} out of address range", start, pages)
            })?;
        if let Some(chip) = self.device.chip() {
            anyhow::ensure!(
                end <= chip.pages(region),
                "pages {}..{} out of range, {} has {} {} pages",
                start,
                end,
                chip.name,
                chip.pages(region),
                region
            );
        }
        let len = (pages as usize)
            .checked_mul(PAGE_SIZE)
            .ok_or_else(|| anyhow::format_err!("{} pages do not fit in memory", pages))?;

        self.enter_config(ConfigMode::Transparent)?;
        if start == 0 {
            self.device.reset_address(region)?;
        } else {
            self.device.set_address(region, start)?;
        }

        let mut data = Vec::with_capacity(len);
        for _ in 0..pages {
            data.extend_from_slice(&self.device.read_page(region)?);
        }
        Ok(data)
    }

    pub fn refresh(&mut self) -> Result<()> {
        self.device.refresh()?;
        self.device.wait_busy_with(&self.wait)?;
        let status = self.device.read_status()?;
        log::info!("Device refreshed, status: {}", status);
        if !status.done() {
            log::warn!("DONE not set after refresh: {}", status.config_error());
        }
        Ok(())
    }
}
