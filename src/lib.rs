// Part of ethercat-rs. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! The control core of an EtherCAT master, modelled after the IgH/Etherlab
//! master.
//!
//! The crate keeps the master's state machine, the distributed clock
//! engine, the process data memory and a control channel through which a
//! non-realtime application configures and activates the bus. Frames are
//! exchanged by an implementation of the [`Bus`] trait.
//!
//! The entry point is [`Master`], usually wrapped in a [`ControlChannel`]
//! and accessed through [`Handle`]s.

mod bus;
mod channel;
mod config;
mod dc;
mod domain;
mod fsm;
mod master;
mod memory;
mod slave;
mod sync;
mod types;

pub use self::{
    bus::Bus,
    channel::{ControlChannel, Handle, Request, Response},
    config::SlaveConfig,
    dc::{correct_system_time_offset, SYSTEM_TIME_TOLERANCE_NS},
    domain::Domain,
    fsm::FsmState,
    master::{Master, MasterBuilder},
    memory::ProcessDataView,
    slave::{Slave, SlavePort, SlavePortLink, SlavePortType, Tunnel, MAX_PORTS},
    sync::{Guard, InterruptibleMutex, Signal},
    types::*,
};
