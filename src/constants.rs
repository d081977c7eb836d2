/// Default 7-bit I2C address of the configuration port.
pub const DEFAULT_I2C_ADDR: u8 = 0x40;

/// Payload bytes per configuration/UFM page.
pub const PAGE_SIZE: usize = 16;

/// Program-page frame: 4 byte prefix + one page of payload.
pub const PAGE_FRAME_SIZE: usize = 4 + PAGE_SIZE;

/// Busy flag in the 1-byte busy-poll response.
pub const BUSY_FLAG: u8 = 0x80;

/// Flag byte in the set-address frame selecting user flash memory.
pub const UFM_ADDRESS_FLAG: u8 = 0x40;

pub mod commands {
    pub const READ_DEVICE_ID: u8 = 0xe0;
    pub const READ_USER_CODE: u8 = 0xc0;
    pub const READ_STATUS: u8 = 0x3c;
    pub const READ_FEATURE_BITS: u8 = 0xfb;
    pub const READ_FEATURE_ROW: u8 = 0xe7;
    pub const READ_OTP_FUSES: u8 = 0xfa;
    pub const READ_FLASH: u8 = 0x73;
    pub const READ_UFM: u8 = 0xca;
    pub const ERASE_UFM: u8 = 0xcb;
    pub const ERASE: u8 = 0x0e;
    pub const ENABLE_CONFIG_TRANSPARENT: u8 = 0x74;
    pub const ENABLE_CONFIG_OFFLINE: u8 = 0xc6;
    pub const CHECK_BUSY: u8 = 0xf0;
    pub const RESET_CONFIG_ADDRESS: u8 = 0x46;
    pub const RESET_UFM_ADDRESS: u8 = 0x47;
    pub const SET_ADDRESS: u8 = 0xb4;
    pub const PROGRAM_PAGE: u8 = 0x70;
    pub const PROGRAM_DONE: u8 = 0x5e;
    pub const REFRESH: u8 = 0x79;
    pub const WAKEUP: u8 = 0xff;
}
