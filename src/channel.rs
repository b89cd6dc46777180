// Part of ethercat-rs. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! The control channel.
//!
//! Applications reach a [`Master`] through a [`Handle`] opened on the
//! channel. Each [`Request`] is checked against the handle's capabilities,
//! then executed under the master's serialization guard. Waiting for the
//! guard can be interrupted through the handle's [`Signal`].

use crate::{
    master::Master,
    memory::ProcessDataView,
    slave::Slave,
    sync::{Guard, InterruptibleMutex, Signal},
    types::*,
};
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone)]
pub enum Request {
    MasterInfo,
    MasterState,
    SlaveInfo(SlavePos),
    Rescan,
    RequestState {
        slave: SlavePos,
        state: AlState,
    },
    CreateDomain,
    ConfigureSlave {
        addr: SlaveAddr,
        id: SlaveId,
    },
    ConfigDc {
        config: SlaveConfigIdx,
        assign_activate: u16,
        signals: Vec<SyncSignal>,
    },
    ConfigOverlappingPdos {
        config: SlaveConfigIdx,
        allow: bool,
    },
    ConfigWatchdog {
        config: SlaveConfigIdx,
        watchdog: Watchdog,
    },
    ConfigState(SlaveConfigIdx),
    RegisterPdoEntry {
        config: SlaveConfigIdx,
        domain: DomainIdx,
        entry: PdoEntryIdx,
        bit_len: u8,
        direction: SyncDirection,
    },
    DomainExternalMemory {
        domain: DomainIdx,
        buffer: Box<[u8]>,
    },
    SetupDomainMemory,
    MapProcessData,
    Activate,
    DeactivateSlaves,
    Deactivate,
    SelectReferenceClock(Option<SlaveConfigIdx>),
    ApplicationTime(u64),
}

#[derive(Debug)]
pub enum Response {
    Done,
    Info(MasterInfo),
    State(MasterState),
    Slave(Box<Slave>),
    Domain(DomainIdx),
    Config(SlaveConfigIdx),
    ConfigState(SlaveConfigState),
    Offset(Offset),
    Memory(MemorySetup),
    ProcessData(ProcessDataView),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capability {
    None,
    Writable,
    Attached,
    AttachedWritable,
}

impl Request {
    fn capability(&self) -> Capability {
        match self {
            Request::MasterInfo | Request::MasterState | Request::SlaveInfo(_) => Capability::None,
            Request::Rescan | Request::RequestState { .. } => Capability::Writable,
            Request::ConfigState(_) | Request::SetupDomainMemory | Request::MapProcessData => {
                Capability::Attached
            }
            _ => Capability::AttachedWritable,
        }
    }

    /// Teardown requests cannot fail and therefore cannot be interrupted.
    fn is_teardown(&self) -> bool {
        matches!(self, Request::DeactivateSlaves | Request::Deactivate)
    }
}

pub struct ControlChannel {
    master: InterruptibleMutex<Master>,
    reserved: AtomicBool,
}

impl ControlChannel {
    pub fn new(master: Master) -> Self {
        Self {
            master: InterruptibleMutex::new(master),
            reserved: AtomicBool::new(false),
        }
    }

    pub fn open(&self, access: MasterAccess) -> Handle<'_> {
        Handle {
            channel: self,
            access,
            attached: false,
            signal: Signal::new(),
        }
    }

    /// Locks the master, e.g. to run its state machine.
    pub fn lock(&self) -> Guard<'_, Master> {
        self.master.lock()
    }

    pub fn try_lock(&self) -> Option<Guard<'_, Master>> {
        self.master.try_lock()
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved.load(Ordering::SeqCst)
    }
}

/// An application's access to the master through the control channel.
///
/// A writable handle that has reserved the master owns its application
/// configuration; dropping it releases the master again.
pub struct Handle<'c> {
    channel: &'c ControlChannel,
    access: MasterAccess,
    attached: bool,
    signal: Signal,
}

impl Handle<'_> {
    pub fn access(&self) -> MasterAccess {
        self.access
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// The signal that interrupts this handle's wait for the master.
    pub fn signal(&self) -> Signal {
        self.signal.clone()
    }

    /// Reserves the master for this handle.
    pub fn reserve(&mut self) -> Result<()> {
        if self.access != MasterAccess::ReadWrite {
            return Err(Error::PermissionDenied);
        }
        if self.attached {
            return Ok(());
        }
        self.channel
            .reserved
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::Busy)?;
        self.attached = true;
        debug!("Master reserved");
        Ok(())
    }

    fn check(&self, capability: Capability) -> Result<()> {
        let writable = self.access == MasterAccess::ReadWrite;
        let allowed = match capability {
            Capability::None => true,
            Capability::Writable => writable,
            Capability::Attached => self.attached,
            Capability::AttachedWritable => self.attached && writable,
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::PermissionDenied)
        }
    }

    pub fn execute(&mut self, request: Request) -> Result<Response> {
        self.check(request.capability())?;
        let mut master = if request.is_teardown() {
            self.channel.master.lock()
        } else {
            self.channel.master.lock_interruptible(&self.signal)?
        };
        dispatch(&mut master, request)
    }
}

impl Drop for Handle<'_> {
    fn drop(&mut self) {
        if self.attached {
            self.channel.master.lock().release();
            self.channel.reserved.store(false, Ordering::SeqCst);
        }
    }
}

fn dispatch(master: &mut Master, request: Request) -> Result<Response> {
    Ok(match request {
        Request::MasterInfo => Response::Info(master.info()),
        Request::MasterState => Response::State(master.state()),
        Request::SlaveInfo(position) => Response::Slave(Box::new(master.slave(position)?.clone())),
        Request::Rescan => {
            master.rescan();
            Response::Done
        }
        Request::RequestState { slave, state } => {
            master.request_state(slave, state)?;
            Response::Done
        }
        Request::CreateDomain => Response::Domain(master.create_domain()?),
        Request::ConfigureSlave { addr, id } => Response::Config(master.configure_slave(addr, id)?),
        Request::ConfigDc {
            config,
            assign_activate,
            signals,
        } => {
            master.config_dc(config, assign_activate, &signals)?;
            Response::Done
        }
        Request::ConfigOverlappingPdos { config, allow } => {
            master.config_overlapping_pdos(config, allow)?;
            Response::Done
        }
        Request::ConfigWatchdog { config, watchdog } => {
            master.config_watchdog(config, watchdog)?;
            Response::Done
        }
        Request::ConfigState(config) => Response::ConfigState(master.config_state(config)?),
        Request::RegisterPdoEntry {
            config,
            domain,
            entry,
            bit_len,
            direction,
        } => Response::Offset(master.register_pdo_entry(config, domain, entry, bit_len, direction)?),
        Request::DomainExternalMemory { domain, buffer } => {
            master.domain_external_memory(domain, buffer)?;
            Response::Done
        }
        Request::SetupDomainMemory => Response::Memory(master.setup_domain_memory()?),
        Request::MapProcessData => Response::ProcessData(master.take_process_data()?),
        Request::Activate => Response::Memory(master.activate()?),
        Request::DeactivateSlaves => {
            master.deactivate_slaves();
            Response::Done
        }
        Request::Deactivate => {
            master.deactivate();
            Response::Done
        }
        Request::SelectReferenceClock(config) => {
            master.select_reference_clock(config);
            Response::Done
        }
        Request::ApplicationTime(time) => {
            master.application_time(time);
            Response::Done
        }
    })
}

#[test]
fn test_capabilities() {
    let channel = ControlChannel::new(Master::new(0));
    let mut reader = channel.open(MasterAccess::ReadOnly);
    assert!(matches!(reader.execute(Request::MasterInfo), Ok(Response::Info(_))));
    assert!(matches!(reader.reserve(), Err(Error::PermissionDenied)));
    assert!(matches!(reader.execute(Request::Rescan), Err(Error::PermissionDenied)));
    assert!(matches!(
        reader.execute(Request::SetupDomainMemory),
        Err(Error::PermissionDenied)
    ));

    let mut writer = channel.open(MasterAccess::ReadWrite);
    assert!(matches!(writer.execute(Request::CreateDomain), Err(Error::PermissionDenied)));
    writer.reserve().unwrap();
    assert!(matches!(writer.execute(Request::CreateDomain), Ok(Response::Domain(_))));
    assert_eq!(channel.lock().domains().len(), 1);
}

#[test]
fn test_single_reservation() {
    let channel = ControlChannel::new(Master::new(0));
    let mut first = channel.open(MasterAccess::ReadWrite);
    let mut second = channel.open(MasterAccess::ReadWrite);
    first.reserve().unwrap();
    assert!(first.is_attached());
    assert!(matches!(second.reserve(), Err(Error::Busy)));

    first.execute(Request::CreateDomain).unwrap();
    drop(first);
    assert!(!channel.is_reserved());
    assert!(channel.lock().domains().is_empty());
    second.reserve().unwrap();
}

#[test]
fn test_interrupted_request_has_no_effect() {
    let channel = ControlChannel::new(Master::new(0));
    let mut handle = channel.open(MasterAccess::ReadWrite);
    handle.reserve().unwrap();
    let signal = handle.signal();

    let guard = channel.lock();
    signal.raise();
    let err = handle.execute(Request::CreateDomain).unwrap_err();
    assert!(err.is_retryable());
    drop(guard);

    assert!(channel.lock().domains().is_empty());
    assert!(matches!(handle.execute(Request::CreateDomain), Ok(Response::Domain(_))));
}
