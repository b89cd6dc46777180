// Part of ethercat-rs. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

use crate::{slave::Slave, types::*};
use std::io;

/// Access to the EtherCAT segment the master drives.
///
/// Frame transport, mailbox protocols and register layouts live behind this
/// trait; the master core only needs the results.
pub trait Bus {
    /// Scans the bus and returns the slaves in ring order, with identity,
    /// DC capabilities, port link states and latched port receive times.
    fn scan(&mut self) -> io::Result<Vec<Slave>>;

    /// Drives a slave towards `state` and returns the state it reached.
    fn request_state(&mut self, position: SlavePos, state: AlState) -> io::Result<AlState>;

    /// Reads the current DC system time of a slave, in nanoseconds.
    fn system_time(&mut self, position: SlavePos) -> io::Result<u64>;

    /// Writes the DC system time offset and transmission delay of a slave.
    fn write_dc_params(&mut self, position: SlavePos, offset: u64, delay: u32) -> io::Result<()>;
}
