#![allow(dead_code)]

use std::collections::VecDeque;

use anyhow::Result;
use machxo::{
    Region, Transport,
    constants::{PAGE_SIZE, UFM_ADDRESS_FLAG, commands::*},
    transport::BusKind,
};

/// LCMXO2-1200HC
pub const MXO2_1200HC: u32 = 0x012b_a043;

/// Simulated MachXO configuration port recording every frame it receives.
pub struct MockTransport {
    pub frames: Vec<Vec<u8>>,
    pub device_id: u32,
    pub user_code: u32,
    pub status: u32,
    /// Answers of upcoming busy polls, ready once drained
    pub busy: VecDeque<bool>,
    pub busy_forever: bool,
    /// Busy polls queued by every erase frame
    pub erase_busy_polls: usize,
    /// Accept program frames without storing them
    pub ignore_programs: bool,
    pub config: Vec<[u8; PAGE_SIZE]>,
    pub ufm: Vec<[u8; PAGE_SIZE]>,
    pointer: Option<(Region, usize)>,
}

impl MockTransport {
    pub fn new(device_id: u32) -> Self {
        MockTransport {
            frames: vec![],
            device_id,
            user_code: 0x1234_5678,
            // DONE
            status: 0x0000_0100,
            busy: VecDeque::new(),
            busy_forever: false,
            erase_busy_polls: 0,
            ignore_programs: false,
            config: vec![],
            ufm: vec![],
            pointer: None,
        }
    }

    pub fn script_busy(&mut self, polls: usize) {
        self.busy.extend(std::iter::repeat_n(true, polls));
    }

    pub fn opcodes(&self) -> Vec<u8> {
        self.frames.iter().map(|f| f[0]).collect()
    }

    pub fn count(&self, opcode: u8) -> usize {
        self.frames.iter().filter(|f| f[0] == opcode).count()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    fn region_mut(&mut self, region: Region) -> &mut Vec<[u8; PAGE_SIZE]> {
        match region {
            Region::Config => &mut self.config,
            Region::Ufm => &mut self.ufm,
        }
    }

    fn read_page(&mut self, region: Region, read: &mut [u8]) {
        let (_, page) = self.pointer.get_or_insert((region, 0));
        let idx = *page;
        *page += 1;
        let data = self
            .region_mut(region)
            .get(idx)
            .copied()
            .unwrap_or([0xff; PAGE_SIZE]);
        fill(read, &data);
    }
}

fn fill(read: &mut [u8], data: &[u8]) {
    let n = read.len().min(data.len());
    read[..n].copy_from_slice(&data[..n]);
}

impl Transport for MockTransport {
    fn bus_kind(&self) -> BusKind {
        BusKind::Addressed
    }

    fn transfer_raw(&mut self, write: &[u8], read: &mut [u8]) -> Result<()> {
        self.frames.push(write.to_vec());
        read.fill(0);

        match write[0] {
            READ_DEVICE_ID => fill(read, &self.device_id.to_be_bytes()),
            READ_USER_CODE => fill(read, &self.user_code.to_be_bytes()),
            READ_STATUS => fill(read, &self.status.to_be_bytes()),
            READ_OTP_FUSES => fill(read, &[0xf0]),
            CHECK_BUSY => {
                let busy = self.busy_forever || self.busy.pop_front().unwrap_or(false);
                read[0] = if busy { 0x80 } else { 0x00 };
            }
            ERASE => {
                if write[1] & 0x04 != 0 {
                    self.config.clear();
                }
                if write[1] & 0x08 != 0 {
                    self.ufm.clear();
                }
                self.script_busy(self.erase_busy_polls);
            }
            ERASE_UFM => {
                self.ufm.clear();
                self.script_busy(self.erase_busy_polls);
            }
            RESET_CONFIG_ADDRESS => self.pointer = Some((Region::Config, 0)),
            RESET_UFM_ADDRESS => self.pointer = Some((Region::Ufm, 0)),
            SET_ADDRESS => {
                let region = if write[4] & UFM_ADDRESS_FLAG != 0 {
                    Region::Ufm
                } else {
                    Region::Config
                };
                let page = u16::from_be_bytes([write[6], write[7]]) as usize;
                self.pointer = Some((region, page));
            }
            PROGRAM_PAGE => {
                anyhow::ensure!(write.len() == 4 + PAGE_SIZE, "bad program frame");
                let (_, page) = self.pointer.get_or_insert((Region::Config, 0));
                let idx = *page;
                *page += 1;
                if !self.ignore_programs {
                    let mut data = [0u8; PAGE_SIZE];
                    data.copy_from_slice(&write[4..]);
                    if self.config.len() <= idx {
                        self.config.resize(idx + 1, [0xff; PAGE_SIZE]);
                    }
                    self.config[idx] = data;
                }
            }
            READ_FLASH => self.read_page(Region::Config, read),
            READ_UFM => self.read_page(Region::Ufm, read),
            _ => (),
        }
        Ok(())
    }
}
