// Part of ethercat-rs. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Application-declared slave configurations and their attachment to the
//! slaves found by a bus scan.

use crate::{slave::Slave, types::*};
use log::{debug, warn};

/// Binding of one logical device (alias + position) to a live slave.
#[derive(Debug, Clone)]
pub struct SlaveConfig {
    pub(crate) idx: SlaveConfigIdx,
    pub alias: u16,
    pub position: u16,
    pub id: SlaveId,
    pub dc: DcConfig,
    pub allow_overlapping_pdos: bool,
    pub watchdog: Option<Watchdog>,
    pub(crate) slave: Option<SlavePos>,
}

impl SlaveConfig {
    pub(crate) fn new(idx: SlaveConfigIdx, addr: SlaveAddr, id: SlaveId) -> Self {
        let (alias, position) = addr.as_pair();
        Self {
            idx,
            alias,
            position,
            id,
            dc: DcConfig::default(),
            allow_overlapping_pdos: false,
            watchdog: None,
            slave: None,
        }
    }

    pub const fn index(&self) -> SlaveConfigIdx {
        self.idx
    }

    /// The slave this configuration is currently attached to.
    pub fn slave(&self) -> Option<SlavePos> {
        self.slave
    }

    pub(crate) fn set_dc_sync(&mut self, sync_idx: usize, signal: SyncSignal) -> Result<()> {
        let slot = self
            .dc
            .sync
            .get_mut(sync_idx)
            .ok_or(Error::SyncIdxTooLarge(sync_idx))?;
        *slot = signal;
        Ok(())
    }

    /// Whether the configuration carries DC sync parameters.
    pub fn uses_dc(&self) -> bool {
        self.dc.assign_activate != 0
    }

    pub(crate) fn clear_dc(&mut self) {
        self.dc = DcConfig::default();
    }

    pub fn info(&self) -> ConfigInfo {
        ConfigInfo {
            alias: self.alias,
            position: self.position,
            id: self.id,
            slave_position: self.slave,
            dc_assign_activate: self.dc.assign_activate,
            dc_sync: self.dc.sync,
            allow_overlapping_pdos: self.allow_overlapping_pdos,
        }
    }

    /// Ring position addressed by alias and position, if such a slave exists.
    fn find_slave(&self, slaves: &[Slave]) -> Option<usize> {
        let position = usize::from(self.position);
        if self.alias == 0 {
            return if position < slaves.len() {
                Some(position)
            } else {
                None
            };
        }
        let base = slaves.iter().position(|s| s.alias == self.alias)?;
        let target = base + position;
        if target < slaves.len() {
            Some(target)
        } else {
            None
        }
    }

    /// Tries to attach the configuration to its slave; returns whether it is
    /// attached afterwards.
    pub(crate) fn attach(&mut self, slaves: &mut [Slave]) -> bool {
        if self.slave.is_some() {
            return true;
        }
        let pos = match self.find_slave(slaves) {
            Some(pos) => pos,
            None => {
                debug!(
                    "Failed to find slave for configuration {}:{}",
                    self.alias, self.position
                );
                return false;
            }
        };
        let slave = &mut slaves[pos];
        if let Some(other) = slave.config {
            warn!(
                "Failed to attach configuration {}:{}: slave {} already has configuration {}",
                self.alias, self.position, slave.ring_pos, other
            );
            return false;
        }
        if slave.id != self.id {
            warn!(
                "Slave {} has an invalid type 0x{:08X}/0x{:08X} for configuration {}:{} (expected 0x{:08X}/0x{:08X})",
                slave.ring_pos,
                slave.id.vendor_id,
                slave.id.product_code,
                self.alias,
                self.position,
                self.id.vendor_id,
                self.id.product_code
            );
            return false;
        }
        slave.config = Some(self.idx);
        slave.request_state(AlState::Preop);
        self.slave = Some(slave.position());
        debug!(
            "Attached slave {} to configuration {}:{}",
            slave.ring_pos, self.alias, self.position
        );
        true
    }

    pub(crate) fn detach(&mut self, slaves: &mut [Slave]) {
        if let Some(pos) = self.slave.take() {
            if let Some(slave) = slaves.get_mut(crate::slave::index(pos)) {
                slave.config = None;
            }
        }
    }
}

#[cfg(test)]
fn ring() -> Vec<Slave> {
    vec![
        Slave::new(0, SlaveId::new(2, 0x044c_2c52)),
        Slave::new(1, SlaveId::new(2, 0x03ec_3052)).with_alias(7),
        Slave::new(2, SlaveId::new(2, 0x07d4_3052)),
    ]
}

#[test]
fn test_attach_by_position() {
    let mut slaves = ring();
    let mut sc = SlaveConfig::new(0, SlaveAddr::ByPos(2), SlaveId::new(2, 0x07d4_3052));
    assert!(sc.attach(&mut slaves));
    assert_eq!(sc.slave(), Some(SlavePos::from(2)));
    assert_eq!(slaves[2].config(), Some(0));
    sc.detach(&mut slaves);
    assert_eq!(sc.slave(), None);
    assert_eq!(slaves[2].config(), None);
}

#[test]
fn test_attach_by_alias() {
    let mut slaves = ring();
    let mut sc = SlaveConfig::new(3, SlaveAddr::ByAlias(7, 1), SlaveId::new(2, 0x07d4_3052));
    assert!(sc.attach(&mut slaves));
    assert_eq!(sc.slave(), Some(SlavePos::from(2)));

    let mut beyond = SlaveConfig::new(4, SlaveAddr::ByAlias(7, 2), SlaveId::default());
    assert!(!beyond.attach(&mut slaves));
}

#[test]
fn test_attach_refuses_wrong_identity_and_duplicates() {
    let mut slaves = ring();
    let mut wrong = SlaveConfig::new(0, SlaveAddr::ByPos(0), SlaveId::new(2, 1));
    assert!(!wrong.attach(&mut slaves));
    assert_eq!(slaves[0].config(), None);

    let mut first = SlaveConfig::new(1, SlaveAddr::ByPos(1), SlaveId::new(2, 0x03ec_3052));
    let mut second = SlaveConfig::new(2, SlaveAddr::ByAlias(7, 0), SlaveId::new(2, 0x03ec_3052));
    assert!(first.attach(&mut slaves));
    assert!(!second.attach(&mut slaves));
    assert_eq!(slaves[1].config(), Some(1));
}

#[test]
fn test_dc_sync_index() {
    let mut sc = SlaveConfig::new(0, SlaveAddr::ByPos(0), SlaveId::default());
    assert!(sc.set_dc_sync(1, SyncSignal::new(1_000_000, 4400)).is_ok());
    assert!(matches!(
        sc.set_dc_sync(2, SyncSignal::default()),
        Err(Error::SyncIdxTooLarge(2))
    ));
    sc.dc.assign_activate = 0x0300;
    assert!(sc.uses_dc());
    sc.clear_dc();
    assert!(!sc.uses_dc());
    assert_eq!(sc.info().dc_sync[1], SyncSignal::default());
}
