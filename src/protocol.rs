//! The underlying command protocol of the MachXO configuration port

use std::fmt;

use anyhow::Result;
use bitfield::bitfield;
use scroll::{BE, Pread};

use crate::constants::{PAGE_FRAME_SIZE, PAGE_SIZE, UFM_ADDRESS_FLAG, commands};

bitflags::bitflags! {
    /// Memory regions cleared by [`Command::Erase`].
    ///
    /// The values sit at bits 16..19, the position they take in the 24-bit
    /// operand of the erase instruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EraseFlags: u32 {
        const SRAM = 1 << 16;
        const FEATURE_ROW = 1 << 17;
        const CONFIG_FLASH = 1 << 18;
        const UFM = 1 << 19;
    }
}

impl EraseFlags {
    /// The single operand byte carried by the erase frame.
    pub const fn operand(self) -> u8 {
        ((self.bits() >> 16) & 0x0f) as u8
    }
}

/// Which address pointer a command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    /// Configuration flash
    Config,
    /// User flash memory
    Ufm,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Config => write!(f, "configuration flash"),
            Region::Ufm => write!(f, "UFM"),
        }
    }
}

/// A program-page frame: `0x70 00 00 01` followed by one page of payload.
///
/// The buffer is meant to be reused, the payload region is overwritten page
/// after page while the prefix stays untouched.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageBuffer {
    frame: [u8; PAGE_FRAME_SIZE],
}

impl PageBuffer {
    pub const fn new() -> Self {
        let mut frame = [0u8; PAGE_FRAME_SIZE];
        frame[0] = commands::PROGRAM_PAGE;
        // page count, always one page per frame
        frame[3] = 0x01;
        PageBuffer { frame }
    }

    pub fn from_payload(data: &[u8; PAGE_SIZE]) -> Self {
        let mut page = Self::new();
        page.payload_mut().copy_from_slice(data);
        page
    }

    pub fn payload(&self) -> &[u8] {
        &self.frame[4..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.frame[4..]
    }

    /// The complete frame as sent on the bus.
    pub fn as_bytes(&self) -> &[u8; PAGE_FRAME_SIZE] {
        &self.frame
    }
}

impl Default for PageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageBuffer[{}]", hex::encode(self.payload()))
    }
}

/// MachXO configuration command
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    /// IDCODE_PUB, returns the 32-bit device ID.
    ReadDeviceId,
    /// USERCODE, returns the 32-bit user code.
    ReadUserCode,
    /// LSC_READ_STATUS, returns the 32-bit status register.
    ReadStatus,
    /// LSC_READ_FEABITS, returns 2 bytes.
    ReadFeatureBits,
    /// LSC_READ_FEATURE, returns the 8 byte feature row.
    ReadFeatureRow,
    /// LSC_READ_UFS, returns the one-time-programmable fuse byte.
    ReadOtpFuses,
    /// LSC_READ_INCR_NV, one page from configuration flash at the pointer.
    ReadFlash,
    /// LSC_READ_UFM, one page from UFM at the pointer.
    ReadUfm,
    /// LSC_ERASE_UFM
    EraseUfm,
    /// ISC_ERASE
    Erase { flags: EraseFlags },
    /// ISC_ENABLE_X, configuration mode that keeps the user design running.
    EnableConfigTransparent,
    /// ISC_ENABLE, configuration mode that halts the user design.
    EnableConfigOffline,
    /// LSC_CHECK_BUSY, returns one byte, bit 7 set while busy.
    CheckBusy,
    /// LSC_INIT_ADDRESS
    ResetConfigAddress,
    /// LSC_INIT_ADDR_UFM
    ResetUfmAddress,
    /// LSC_WRITE_ADDRESS
    SetAddress { region: Region, page: u16 },
    /// LSC_PROG_INCR_NV
    ProgramPage(PageBuffer),
    /// ISC_PROGRAM_DONE
    ProgramDone,
    /// LSC_REFRESH, reload the configuration from flash.
    Refresh,
    /// Dummy frame to bring the port out of its idle state.
    Wakeup,
}

impl Command {
    pub fn erase(flags: EraseFlags) -> Self {
        Command::Erase { flags }
    }

    pub fn set_config_address(page: u16) -> Self {
        Command::SetAddress {
            region: Region::Config,
            page,
        }
    }

    pub fn set_ufm_address(page: u16) -> Self {
        Command::SetAddress {
            region: Region::Ufm,
            page,
        }
    }

    pub fn reset_address(region: Region) -> Self {
        match region {
            Region::Config => Command::ResetConfigAddress,
            Region::Ufm => Command::ResetUfmAddress,
        }
    }

    pub fn read_page(region: Region) -> Self {
        match region {
            Region::Config => Command::ReadFlash,
            Region::Ufm => Command::ReadUfm,
        }
    }

    /// Number of bytes the device returns for this command.
    pub const fn response_len(&self) -> usize {
        match self {
            Command::ReadDeviceId | Command::ReadUserCode | Command::ReadStatus => 4,
            Command::ReadFeatureBits => 2,
            Command::ReadFeatureRow => 8,
            Command::ReadOtpFuses | Command::CheckBusy => 1,
            Command::ReadFlash | Command::ReadUfm => PAGE_SIZE,
            _ => 0,
        }
    }

    pub fn into_raw(self) -> Vec<u8> {
        use commands::*;

        match self {
            Command::ReadDeviceId => [READ_DEVICE_ID, 0, 0, 0].to_vec(),
            Command::ReadUserCode => [READ_USER_CODE, 0, 0, 0].to_vec(),
            Command::ReadStatus => [READ_STATUS, 0, 0, 0].to_vec(),
            Command::ReadFeatureBits => [READ_FEATURE_BITS, 0, 0, 0].to_vec(),
            Command::ReadFeatureRow => [READ_FEATURE_ROW, 0, 0, 0].to_vec(),
            Command::ReadOtpFuses => [READ_OTP_FUSES, 0, 0, 0].to_vec(),
            Command::ReadFlash => [READ_FLASH, 0, 0, 0x01].to_vec(),
            Command::ReadUfm => [READ_UFM, 0, 0, 0x01].to_vec(),
            Command::EraseUfm => [ERASE_UFM, 0, 0, 0].to_vec(),
            Command::Erase { flags } => [ERASE, flags.operand(), 0, 0].to_vec(),
            Command::EnableConfigTransparent => [ENABLE_CONFIG_TRANSPARENT, 0x08, 0].to_vec(),
            Command::EnableConfigOffline => [ENABLE_CONFIG_OFFLINE, 0x08, 0].to_vec(),
            Command::CheckBusy => [CHECK_BUSY, 0, 0, 0].to_vec(),
            Command::ResetConfigAddress => [RESET_CONFIG_ADDRESS, 0, 0, 0].to_vec(),
            Command::ResetUfmAddress => [RESET_UFM_ADDRESS, 0, 0, 0].to_vec(),
            Command::SetAddress { region, page } => {
                // CMD, 3 x reserved, TARGET, reserved, PAGE(BE)
                let mut buf = [SET_ADDRESS, 0, 0, 0, 0, 0, 0, 0];
                if region == Region::Ufm {
                    buf[4] = UFM_ADDRESS_FLAG;
                }
                buf[6..].copy_from_slice(&page.to_be_bytes());
                buf.to_vec()
            }
            Command::ProgramPage(page) => page.as_bytes().to_vec(),
            Command::ProgramDone => [PROGRAM_DONE, 0, 0, 0].to_vec(),
            Command::Refresh => [REFRESH, 0, 0].to_vec(),
            Command::Wakeup => [WAKEUP; 4].to_vec(),
        }
    }
}

/// Raw bytes returned for a read-type command.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Response(Vec<u8>);

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Response[{}]", hex::encode(&self.0))
    }
}

impl Response {
    pub(crate) fn from_raw(raw: Vec<u8>) -> Self {
        Response(raw)
    }

    pub fn payload(&self) -> &[u8] {
        &self.0
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.0
    }

    /// Big-endian word at the start of the payload.
    pub fn word(&self) -> Result<u32> {
        Ok(self.0.pread_with::<u32>(0, BE)?)
    }

    /// Busy bit of a [`Command::CheckBusy`] response.
    pub fn is_busy(&self) -> bool {
        self.0
            .first()
            .is_some_and(|&b| b & crate::constants::BUSY_FLAG != 0)
    }
}

bitfield! {
    /// The 32-bit status register returned by [`Command::ReadStatus`].
    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StatusRegister(u32);
    impl Debug;
    pub done, _: 8;
    pub config_enabled, _: 9;
    pub busy, _: 12;
    pub fail, _: 13;
    pub u8, config_check, _: 25, 23;
}

impl StatusRegister {
    pub fn config_error(&self) -> ConfigError {
        ConfigError::from(self.config_check())
    }
}

impl fmt::Display for StatusRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:08x} (done: {}, config enabled: {}, busy: {}, fail: {}, check: {})",
            self.0,
            self.done(),
            self.config_enabled(),
            self.busy(),
            self.fail(),
            self.config_error()
        )
    }
}

/// Result of the last bitstream check, status register bits 23..25.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigError {
    None,
    Id,
    Command,
    Crc,
    Preamble,
    Abort,
    Overflow,
    SdmEof,
}

impl From<u8> for ConfigError {
    fn from(code: u8) -> Self {
        match code & 0x07 {
            0 => ConfigError::None,
            1 => ConfigError::Id,
            2 => ConfigError::Command,
            3 => ConfigError::Crc,
            4 => ConfigError::Preamble,
            5 => ConfigError::Abort,
            6 => ConfigError::Overflow,
            _ => ConfigError::SdmEof,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfigError::None => "no error",
            ConfigError::Id => "ID error",
            ConfigError::Command => "CMD error",
            ConfigError::Crc => "CRC error",
            ConfigError::Preamble => "preamble error",
            ConfigError::Abort => "abort error",
            ConfigError::Overflow => "overflow error",
            ConfigError::SdmEof => "SDM EOF",
        };
        f.write_str(s)
    }
}
