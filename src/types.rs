// Part of ethercat-rs. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

use derive_new::new;
use std::{convert::TryFrom, io};
use thiserror::Error;

pub use ethercat_types::{DomainIdx, Idx, Offset, PdoEntryIdx, SlavePos, SubIdx};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Permission denied")]
    PermissionDenied,
    #[error("Out of memory: cannot map {0} bytes of process data")]
    OutOfMemory(usize),
    #[error("Interrupted, try again")]
    Interrupted,
    #[error("Master is busy")]
    Busy,
    #[error("Master is not activated")]
    NotActivated,
    #[error("Process data is not mapped")]
    NotMapped,
    #[error("Process data was already handed out in this activation")]
    AlreadyMapped,
    #[error("Invalid domain index {0}")]
    DomainIdx(usize),
    #[error("Invalid slave configuration index {0}")]
    ConfigIdx(SlaveConfigIdx),
    #[error("No slave at ring position {0}")]
    NoSlave(u16),
    #[error("Slave {0}-{1} is already configured with another identity")]
    ConfigConflict(u16, u16),
    #[error("Sync signal index {0} is too large")]
    SyncIdxTooLarge(usize),
    #[error("External buffer of domain {0} is smaller than its {1} bytes of process data")]
    BufferTooSmall(usize, usize),
    #[error("Invalid AL state 0x{0:X}")]
    InvalidAlState(u8),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// The errno an ioctl-style caller would see for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::PermissionDenied => libc::EPERM,
            Error::OutOfMemory(_) => libc::ENOMEM,
            Error::Interrupted => libc::EINTR,
            Error::Busy | Error::AlreadyMapped => libc::EBUSY,
            Error::NotActivated | Error::NotMapped => libc::ENXIO,
            Error::DomainIdx(_) | Error::ConfigIdx(_) | Error::NoSlave(_) => libc::ENOENT,
            Error::ConfigConflict(..) => libc::EEXIST,
            Error::SyncIdxTooLarge(_) | Error::BufferTooSmall(..) | Error::InvalidAlState(_) => {
                libc::EINVAL
            }
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Interruptions are the only errors a caller should simply retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Interrupted)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = match e {
            Error::PermissionDenied => io::ErrorKind::PermissionDenied,
            Error::Interrupted => io::ErrorKind::Interrupted,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
pub type MasterIdx = u32;
pub type SlaveConfigIdx = u32;

/// Application-layer state of a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum AlState {
    Init = 1,
    Preop = 2,
    Boot = 3,
    Safeop = 4,
    Op = 8,
}

impl Default for AlState {
    fn default() -> Self {
        AlState::Init
    }
}

impl TryFrom<u8> for AlState {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            1 => AlState::Init,
            2 => AlState::Preop,
            3 => AlState::Boot,
            4 => AlState::Safeop,
            8 => AlState::Op,
            x => return Err(Error::InvalidAlState(x)),
        })
    }
}

/// An EtherCAT slave identification, consisting of vendor ID and product code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, new)]
pub struct SlaveId {
    pub vendor_id: u32,
    pub product_code: u32,
}

/// An EtherCAT slave, which is specified either by absolute position in the
/// ring or by offset from a given alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveAddr {
    ByPos(u16),
    ByAlias(u16, u16),
}

impl SlaveAddr {
    pub(crate) fn as_pair(self) -> (u16, u16) {
        match self {
            SlaveAddr::ByPos(x) => (0, x),
            SlaveAddr::ByAlias(x, y) => (x, y),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterAccess {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone)]
pub struct MasterInfo {
    pub index: MasterIdx,
    pub slave_count: u32,
    pub link_up: bool,
    pub scan_busy: bool,
    pub active: bool,
    pub app_time: u64,
    pub ref_clock: Option<SlavePos>,
}

#[derive(Debug, Clone)]
pub struct MasterState {
    pub slaves_responding: u32,
    /// Bitwise OR of the current AL states of all slaves.
    pub al_states: u8,
    pub link_up: bool,
}

#[derive(Debug, Clone)]
pub struct ConfigInfo {
    pub alias: u16,
    pub position: u16,
    pub id: SlaveId,
    pub slave_position: Option<SlavePos>,
    pub dc_assign_activate: u16,
    pub dc_sync: [SyncSignal; 2],
    pub allow_overlapping_pdos: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SlaveConfigState {
    pub online: bool,
    pub operational: bool,
    pub al_state: AlState,
}

/// Cycle and shift time of one DC sync signal, in nanoseconds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, new)]
pub struct SyncSignal {
    pub cycle_time: u32,
    pub shift_time: i32,
}

/// Distributed clock parameters of a slave configuration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DcConfig {
    pub assign_activate: u16,
    pub sync: [SyncSignal; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    Output,
    Input,
}

/// Process data watchdog: the divider sets the base interval in 40 ns
/// units, `intervals` the number of base intervals until it expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, new)]
pub struct Watchdog {
    pub divider: u16,
    pub intervals: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DomainDataPlacement {
    pub offset: usize,
    pub size: usize,
}

/// Result of mapping the process data: the base address of the region and the
/// number of bytes newly mapped by this call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemorySetup {
    pub address: usize,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainState {
    pub working_counter: u32,
    pub wc_state: WcState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcState {
    Zero = 0,
    Incomplete,
    Complete,
}

impl WcState {
    pub(crate) fn new(working_counter: u32, expected: u32) -> Self {
        if working_counter == 0 {
            WcState::Zero
        } else if working_counter >= expected {
            WcState::Complete
        } else {
            WcState::Incomplete
        }
    }
}

#[test]
fn test_al_state_codes() {
    assert_eq!(AlState::try_from(8).unwrap(), AlState::Op);
    assert_eq!(AlState::try_from(2).unwrap(), AlState::Preop);
    let e = AlState::try_from(0x11).unwrap_err();
    assert_eq!(e.to_string(), "Invalid AL state 0x11");
    assert!(AlState::Preop < AlState::Safeop);
}

#[test]
fn test_errno_mapping() {
    assert_eq!(Error::PermissionDenied.errno(), libc::EPERM);
    assert_eq!(Error::OutOfMemory(12).errno(), libc::ENOMEM);
    assert_eq!(Error::Interrupted.errno(), libc::EINTR);
    assert!(Error::Interrupted.is_retryable());
    assert!(!Error::Busy.is_retryable());
    let io_err = io::Error::from(Error::PermissionDenied);
    assert_eq!(io_err.kind(), io::ErrorKind::PermissionDenied);
}

#[test]
fn test_wc_state() {
    assert_eq!(WcState::new(0, 3), WcState::Zero);
    assert_eq!(WcState::new(1, 3), WcState::Incomplete);
    assert_eq!(WcState::new(3, 3), WcState::Complete);
}
