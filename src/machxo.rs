//! Command sequencing for the MachXO configuration port.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::sleep,
    time::{Duration, Instant},
};

use anyhow::Result;

use crate::{
    Chip, Command, Transport,
    protocol::{EraseFlags, PageBuffer, Region, Response, StatusRegister},
    transport::BusKind,
};

/// Where the device is in a configuration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    AddressReset,
    Erasing,
    Programming,
    Finalizing,
    Activated,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Bounds for [`MachXO::wait_busy_with`]. The default waits forever.
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    /// Give up once the device has been busy for this long.
    pub timeout: Option<Duration>,
    /// Sleep between two polls. Polls back to back when unset.
    pub poll_interval: Option<Duration>,
    /// Give up as soon as this flag is set.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl WaitOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        WaitOptions {
            timeout: Some(timeout),
            ..Default::default()
        }
    }
}

/// Driver for one MachXO2/3 device.
///
/// Borrows the transport for the lifetime of the session, so only one
/// command sequence can be in flight.
pub struct MachXO<'a, T: Transport + ?Sized> {
    transport: &'a mut T,
    chip: Option<Chip>,
    phase: Phase,
    /// Address pointer positioned in this session
    pointer: Option<Region>,
    /// Erase issued, no ready poll seen since
    erase_pending: bool,
}

impl<'a, T: Transport + ?Sized> MachXO<'a, T> {
    pub fn new(transport: &'a mut T) -> Self {
        MachXO {
            transport,
            chip: None,
            phase: Phase::Idle,
            pointer: None,
            erase_pending: false,
        }
    }

    /// Read the device ID and look the part up in the chip database.
    ///
    /// Unknown parts are not an error, page range checks are skipped for them.
    pub fn identify(&mut self) -> Result<u32> {
        let device_id = self.read_device_id()?;
        self.chip = match crate::device::ChipDB::find_chip(device_id) {
            Ok(chip) => {
                log::debug!("found chip: {}", chip);
                Some(chip)
            }
            Err(e) => {
                log::warn!("{}", e);
                None
            }
        };
        Ok(device_id)
    }

    pub fn set_chip(&mut self, chip: Chip) {
        self.chip = Some(chip);
    }

    pub fn chip(&self) -> Option<&Chip> {
        self.chip.as_ref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn bus_kind(&self) -> BusKind {
        self.transport.bus_kind()
    }

    fn transfer(&mut self, cmd: Command) -> Result<Response> {
        self.transport.transfer(cmd)
    }

    fn read_array<const N: usize>(&mut self, cmd: Command) -> Result<[u8; N]> {
        let resp = self.transfer(cmd)?;
        let buf = resp.payload().try_into().map_err(|_| {
            anyhow::format_err!(
                "expected {} response bytes, got {}",
                N,
                resp.payload().len()
            )
        })?;
        Ok(buf)
    }

    pub fn read_device_id(&mut self) -> Result<u32> {
        self.transfer(Command::ReadDeviceId)?.word()
    }

    pub fn read_user_code(&mut self) -> Result<u32> {
        self.transfer(Command::ReadUserCode)?.word()
    }

    pub fn read_status(&mut self) -> Result<StatusRegister> {
        Ok(StatusRegister(self.transfer(Command::ReadStatus)?.word()?))
    }

    pub fn read_feature_bits(&mut self) -> Result<[u8; 2]> {
        self.read_array(Command::ReadFeatureBits)
    }

    pub fn read_feature_row(&mut self) -> Result<[u8; 8]> {
        self.read_array(Command::ReadFeatureRow)
    }

    pub fn read_otp_fuses(&mut self) -> Result<u8> {
        let [fuses] = self.read_array(Command::ReadOtpFuses)?;
        Ok(fuses)
    }

    /// Read the configuration flash page at the pointer, advancing it.
    pub fn read_flash(&mut self) -> Result<[u8; 16]> {
        self.read_page(Region::Config)
    }

    /// Read the UFM page at the pointer, advancing it.
    pub fn read_ufm(&mut self) -> Result<[u8; 16]> {
        self.read_page(Region::Ufm)
    }

    pub fn read_page(&mut self, region: Region) -> Result<[u8; 16]> {
        self.ensure_pointer(region)?;
        self.read_array(Command::read_page(region))
    }

    pub fn erase_ufm(&mut self) -> Result<()> {
        self.transfer(Command::EraseUfm)?;
        self.start_erase();
        log::debug!("UFM erase started");
        Ok(())
    }

    /// Start erasing `flags`. Completion is not awaited, call
    /// [`Self::wait_busy`] before touching the erased regions.
    pub fn erase(&mut self, flags: EraseFlags) -> Result<()> {
        anyhow::ensure!(!flags.is_empty(), "nothing to erase");
        self.transfer(Command::erase(flags))?;
        self.start_erase();
        log::debug!("erase started: {:?}", flags);
        Ok(())
    }

    fn start_erase(&mut self) {
        self.erase_pending = true;
        self.pointer = None;
        self.phase = Phase::Erasing;
    }

    pub fn enable_config_transparent(&mut self) -> Result<()> {
        self.transfer(Command::EnableConfigTransparent)?;
        log::debug!("transparent configuration mode enabled");
        Ok(())
    }

    pub fn enable_config_offline(&mut self) -> Result<()> {
        self.transfer(Command::EnableConfigOffline)?;
        log::debug!("offline configuration mode enabled");
        Ok(())
    }

    pub fn reset_config_address(&mut self) -> Result<()> {
        self.reset_address(Region::Config)
    }

    pub fn reset_ufm_address(&mut self) -> Result<()> {
        self.reset_address(Region::Ufm)
    }

    pub fn reset_address(&mut self, region: Region) -> Result<()> {
        self.ensure_not_erasing()?;
        self.transfer(Command::reset_address(region))?;
        self.pointer = Some(region);
        self.phase = Phase::AddressReset;
        Ok(())
    }

    pub fn set_config_address(&mut self, page: u32) -> Result<()> {
        self.set_address(Region::Config, page)
    }

    pub fn set_ufm_address(&mut self, page: u32) -> Result<()> {
        self.set_address(Region::Ufm, page)
    }

    /// Position the `region` pointer at `page`.
    ///
    /// Fails for pages that do not fit the 16-bit operand, and for pages past
    /// the end of the region when the part is known.
    pub fn set_address(&mut self, region: Region, page: u32) -> Result<()> {
        let Ok(raw_page) = u16::try_from(page) else {
            anyhow::bail!("page {} of {} does not fit the 16-bit address", page, region);
        };
        if let Some(chip) = &self.chip {
            anyhow::ensure!(
                page < chip.pages(region),
                "page {} out of range, {} has {} {} pages",
                page,
                chip.name,
                chip.pages(region),
                region
            );
        }
        self.ensure_not_erasing()?;
        let cmd = Command::SetAddress {
            region,
            page: raw_page,
        };
        self.transfer(cmd)?;
        self.pointer = Some(region);
        self.phase = Phase::AddressReset;
        Ok(())
    }

    /// Send a complete page frame; the device advances its pointer.
    pub fn program_page(&mut self, page: &PageBuffer) -> Result<()> {
        self.ensure_not_erasing()?;
        self.ensure_pointer(Region::Config)?;
        self.transfer(Command::ProgramPage(*page))?;
        self.phase = Phase::Programming;
        Ok(())
    }

    pub fn program_done(&mut self) -> Result<()> {
        self.ensure_not_erasing()?;
        self.transfer(Command::ProgramDone)?;
        self.phase = Phase::Finalizing;
        log::debug!("program done");
        Ok(())
    }

    /// Reload the configuration from flash, leaving configuration mode.
    pub fn refresh(&mut self) -> Result<()> {
        self.transfer(Command::Refresh)?;
        self.pointer = None;
        self.phase = Phase::Activated;
        log::debug!("refresh issued");
        Ok(())
    }

    pub fn wakeup(&mut self) -> Result<()> {
        self.transfer(Command::Wakeup)?;
        Ok(())
    }

    /// Poll the busy flag once.
    pub fn is_busy(&mut self) -> Result<bool> {
        let busy = self.transfer(Command::CheckBusy)?.is_busy();
        if !busy && self.erase_pending {
            self.erase_pending = false;
            log::debug!("erase complete");
        }
        Ok(busy)
    }

    /// Poll until the device is ready, returns how many polls saw it busy.
    ///
    /// Blocks for as long as the device stays busy.
    pub fn wait_busy(&mut self) -> Result<u32> {
        self.wait_busy_with(&WaitOptions::default())
    }

    pub fn wait_busy_with(&mut self, options: &WaitOptions) -> Result<u32> {
        let start = Instant::now();
        let mut polls = 0u32;
        while self.is_busy()? {
            polls = polls.saturating_add(1);
            log::trace!("busy poll #{}", polls);
            if let Some(cancel) = &options.cancel {
                if cancel.load(Ordering::Relaxed) {
                    anyhow::bail!("busy wait cancelled after {} polls", polls);
                }
            }
            if let Some(timeout) = options.timeout {
                if start.elapsed() >= timeout {
                    anyhow::bail!(
                        "device still busy after {:?} ({} polls)",
                        start.elapsed(),
                        polls
                    );
                }
            }
            if let Some(interval) = options.poll_interval {
                sleep(interval);
            }
        }
        if polls > 0 {
            log::debug!("device ready after {} polls in {:?}", polls, start.elapsed());
        }
        Ok(polls)
    }

    fn ensure_not_erasing(&self) -> Result<()> {
        anyhow::ensure!(
            !self.erase_pending,
            "erase in progress, wait for the busy flag to clear first"
        );
        Ok(())
    }

    fn ensure_pointer(&self, region: Region) -> Result<()> {
        anyhow::ensure!(
            self.pointer == Some(region),
            "{} address pointer not set in this session",
            region
        );
        Ok(())
    }
}
