mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use common::{MXO2_1200HC, MockTransport};
use machxo::{
    EraseFlags, MachXO, PageBuffer, Phase, Region, WaitOptions,
    constants::commands::*,
};

#[test]
fn wait_busy_ready_at_first_poll() {
    let mut mock = MockTransport::new(MXO2_1200HC);
    let polls = MachXO::new(&mut mock).wait_busy().unwrap();
    assert_eq!(polls, 0);
    assert_eq!(mock.opcodes(), [CHECK_BUSY]);
}

#[test]
fn wait_busy_counts_busy_polls() {
    let mut mock = MockTransport::new(MXO2_1200HC);
    mock.script_busy(3);
    let polls = MachXO::new(&mut mock).wait_busy().unwrap();
    assert_eq!(polls, 3);
    assert_eq!(mock.count(CHECK_BUSY), 4);
    assert!(mock.frames.iter().all(|f| f == &[CHECK_BUSY, 0, 0, 0]));
}

#[test]
fn wait_busy_times_out() {
    let mut mock = MockTransport::new(MXO2_1200HC);
    mock.busy_forever = true;
    let options = WaitOptions {
        timeout: Some(Duration::from_millis(20)),
        poll_interval: Some(Duration::from_millis(1)),
        cancel: None,
    };
    let err = MachXO::new(&mut mock).wait_busy_with(&options).unwrap_err();
    assert!(err.to_string().contains("still busy"));
    assert!(mock.count(CHECK_BUSY) > 1);
}

#[test]
fn wait_busy_cancelled() {
    let mut mock = MockTransport::new(MXO2_1200HC);
    mock.busy_forever = true;
    let cancel = Arc::new(AtomicBool::new(false));
    cancel.store(true, Ordering::Relaxed);
    let options = WaitOptions {
        cancel: Some(cancel),
        ..Default::default()
    };
    let err = MachXO::new(&mut mock).wait_busy_with(&options).unwrap_err();
    assert!(err.to_string().contains("cancelled"));
    assert_eq!(mock.count(CHECK_BUSY), 1);
}

#[test]
fn is_busy_follows_bit_7() {
    let mut mock = MockTransport::new(MXO2_1200HC);
    mock.script_busy(1);
    let mut dev = MachXO::new(&mut mock);
    assert!(dev.is_busy().unwrap());
    assert!(!dev.is_busy().unwrap());
}

#[test]
fn identify_known_part() {
    let mut mock = MockTransport::new(MXO2_1200HC);
    let mut dev = MachXO::new(&mut mock);
    assert_eq!(dev.identify().unwrap(), MXO2_1200HC);
    assert_eq!(dev.chip().map(|c| c.name.as_str()), Some("LCMXO2-1200HC"));
    assert_eq!(dev.phase(), Phase::Idle);
}

#[test]
fn identify_unknown_part() {
    let mut mock = MockTransport::new(0x1234_5678);
    let mut dev = MachXO::new(&mut mock);
    assert_eq!(dev.identify().unwrap(), 0x1234_5678);
    assert!(dev.chip().is_none());
}

#[test]
fn read_registers() {
    let mut mock = MockTransport::new(MXO2_1200HC);
    mock.status = (1 << 8) | (1 << 13) | (3 << 23);
    let mut dev = MachXO::new(&mut mock);

    assert_eq!(dev.read_user_code().unwrap(), 0x1234_5678);
    assert_eq!(dev.read_otp_fuses().unwrap(), 0xf0);
    assert_eq!(dev.read_feature_row().unwrap(), [0; 8]);
    assert_eq!(dev.read_feature_bits().unwrap(), [0; 2]);

    let status = dev.read_status().unwrap();
    assert!(status.done());
    assert!(status.fail());
    assert!(!status.busy());
    assert_eq!(status.config_check(), 3);
}

#[test]
fn program_without_pointer_fails() {
    let mut mock = MockTransport::new(MXO2_1200HC);
    let mut dev = MachXO::new(&mut mock);
    assert!(dev.program_page(&PageBuffer::new()).is_err());
    assert!(dev.read_flash().is_err());
    assert_eq!(mock.count(PROGRAM_PAGE), 0);
    assert_eq!(mock.count(READ_FLASH), 0);
}

#[test]
fn ufm_pointer_does_not_cover_config() {
    let mut mock = MockTransport::new(MXO2_1200HC);
    let mut dev = MachXO::new(&mut mock);
    dev.reset_ufm_address().unwrap();
    assert!(dev.read_ufm().is_ok());
    assert!(dev.program_page(&PageBuffer::new()).is_err());
    assert!(dev.read_flash().is_err());
}

#[test]
fn erase_pending_blocks_programming() {
    let mut mock = MockTransport::new(MXO2_1200HC);
    mock.erase_busy_polls = 2;
    let mut dev = MachXO::new(&mut mock);

    dev.reset_config_address().unwrap();
    dev.erase(EraseFlags::CONFIG_FLASH).unwrap();
    assert_eq!(dev.phase(), Phase::Erasing);

    // pointer is invalidated and cannot be repositioned yet
    assert!(dev.program_page(&PageBuffer::new()).is_err());
    assert!(dev.reset_config_address().is_err());
    assert!(dev.set_config_address(1).is_err());
    assert!(dev.program_done().is_err());

    assert_eq!(dev.wait_busy().unwrap(), 2);
    dev.reset_config_address().unwrap();
    dev.program_page(&PageBuffer::new()).unwrap();
    assert_eq!(dev.phase(), Phase::Programming);
}

#[test]
fn empty_erase_is_rejected() {
    let mut mock = MockTransport::new(MXO2_1200HC);
    assert!(MachXO::new(&mut mock).erase(EraseFlags::empty()).is_err());
    assert!(mock.frames.is_empty());
}

#[test]
fn erase_frame_operand() {
    let mut mock = MockTransport::new(MXO2_1200HC);
    MachXO::new(&mut mock)
        .erase(EraseFlags::CONFIG_FLASH | EraseFlags::UFM)
        .unwrap();
    assert_eq!(mock.frames, [vec![ERASE, 0x0c, 0, 0]]);
}

#[test]
fn set_address_beyond_16_bits() {
    let mut mock = MockTransport::new(0x1234_5678);
    let mut dev = MachXO::new(&mut mock);
    dev.identify().unwrap();
    assert!(dev.set_config_address(0x1_0000).is_err());
    assert!(dev.set_ufm_address(70_000).is_err());
    // unknown part, no page count to check against
    dev.set_config_address(0xffff).unwrap();
    assert_eq!(mock.frames.last().unwrap(), &[SET_ADDRESS, 0, 0, 0, 0, 0, 0xff, 0xff]);
    assert_eq!(mock.count(SET_ADDRESS), 1);
}

#[test]
fn set_address_beyond_part() {
    let mut mock = MockTransport::new(MXO2_1200HC);
    let mut dev = MachXO::new(&mut mock);
    dev.identify().unwrap();

    assert!(dev.set_config_address(2175).is_err());
    assert!(dev.set_ufm_address(511).is_err());
    dev.set_config_address(2174).unwrap();
    dev.set_ufm_address(510).unwrap();

    assert_eq!(mock.count(SET_ADDRESS), 2);
    assert_eq!(mock.frames[1], [SET_ADDRESS, 0, 0, 0, 0x00, 0, 0x08, 0x7e]);
    assert_eq!(mock.frames[2], [SET_ADDRESS, 0, 0, 0, 0x40, 0, 0x01, 0xfe]);
}

#[test]
fn program_advances_simulated_pointer() {
    let mut mock = MockTransport::new(MXO2_1200HC);
    let mut dev = MachXO::new(&mut mock);
    dev.set_config_address(4).unwrap();
    dev.program_page(&PageBuffer::from_payload(&[0xa5; 16])).unwrap();
    dev.program_page(&PageBuffer::from_payload(&[0x5a; 16])).unwrap();
    dev.program_done().unwrap();
    assert_eq!(dev.phase(), Phase::Finalizing);

    dev.set_config_address(5).unwrap();
    assert_eq!(dev.read_flash().unwrap(), [0x5a; 16]);

    assert_eq!(mock.config.len(), 6);
    assert_eq!(mock.config[4], [0xa5; 16]);
}

#[test]
fn refresh_invalidates_pointer() {
    let mut mock = MockTransport::new(MXO2_1200HC);
    let mut dev = MachXO::new(&mut mock);
    dev.enable_config_transparent().unwrap();
    dev.reset_config_address().unwrap();
    dev.refresh().unwrap();
    assert_eq!(dev.phase(), Phase::Activated);
    assert!(dev.read_flash().is_err());
    assert_eq!(
        mock.opcodes(),
        [ENABLE_CONFIG_TRANSPARENT, RESET_CONFIG_ADDRESS, REFRESH]
    );
}

#[test]
fn read_ufm_from_page() {
    let mut mock = MockTransport::new(MXO2_1200HC);
    mock.ufm = vec![[0x00; 16], [0x11; 16], [0x22; 16]];
    let mut dev = MachXO::new(&mut mock);
    dev.set_address(Region::Ufm, 1).unwrap();
    assert_eq!(dev.read_page(Region::Ufm).unwrap(), [0x11; 16]);
    assert_eq!(dev.read_ufm().unwrap(), [0x22; 16]);
    assert_eq!(mock.frames[1], [READ_UFM, 0, 0, 0x01]);
}

#[test]
fn wakeup_frame() {
    let mut mock = MockTransport::new(MXO2_1200HC);
    MachXO::new(&mut mock).wakeup().unwrap();
    assert_eq!(mock.frames, [vec![0xff; 4]]);
}
