// Part of ethercat-rs. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

use crate::{
    bus::Bus,
    config::SlaveConfig,
    dc::{self, DcTopology, SYSTEM_TIME_TOLERANCE_NS},
    domain::Domain,
    fsm::{Fsm, FsmState},
    memory::{self, Binding, ProcessData, ProcessDataView},
    slave::{index, Slave},
    types::*,
};
use log::{debug, info, warn};
use std::time::Duration;

#[derive(Default)]
pub struct MasterBuilder {
    index: Option<MasterIdx>,
    dc_time_tolerance: Option<Duration>,
}

impl MasterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(mut self, index: MasterIdx) -> Self {
        self.index = Some(index);
        self
    }

    /// Deviation between application time and slave system time that is
    /// tolerated before a new system time offset is written.
    pub fn dc_time_tolerance(mut self, tolerance: Duration) -> Self {
        self.dc_time_tolerance = Some(tolerance);
        self
    }

    pub fn build(self) -> Master {
        let tolerance = self
            .dc_time_tolerance
            .map(|t| t.as_nanos() as u64)
            .unwrap_or(SYSTEM_TIME_TOLERANCE_NS);
        Master {
            index: self.index.unwrap_or(0),
            dc_time_tolerance_ns: tolerance,
            slaves: vec![],
            domains: vec![],
            configs: vec![],
            dc_ref_config: None,
            dc: DcTopology::default(),
            active: false,
            deactivated: false,
            app_time: 0,
            link_up: false,
            memory: None,
            fsm: Fsm::default(),
            dc_offsets_pending: false,
        }
    }
}

/// An EtherCAT master.
///
/// Owns the slave registry, the application configuration (domains and
/// slave configurations) and the process data. All operations expect to be
/// serialized by the caller; see [`ControlChannel`](crate::ControlChannel).
pub struct Master {
    index: MasterIdx,
    dc_time_tolerance_ns: u64,
    slaves: Vec<Slave>,
    domains: Vec<Domain>,
    configs: Vec<SlaveConfig>,
    dc_ref_config: Option<SlaveConfigIdx>,
    dc: DcTopology,
    active: bool,
    deactivated: bool,
    app_time: u64,
    link_up: bool,
    memory: Option<Binding>,
    fsm: Fsm,
    dc_offsets_pending: bool,
}

impl Master {
    pub fn new(index: MasterIdx) -> Self {
        MasterBuilder::new().index(index).build()
    }

    pub const fn index(&self) -> MasterIdx {
        self.index
    }

    pub const fn is_active(&self) -> bool {
        self.active
    }

    pub fn fsm_state(&self) -> FsmState {
        self.fsm.state()
    }

    pub fn dc_time_tolerance(&self) -> Duration {
        Duration::from_nanos(self.dc_time_tolerance_ns)
    }

    pub fn create_domain(&mut self) -> Result<DomainIdx> {
        if self.memory.is_some() {
            warn!(
                "Master {}: cannot create a domain after process data is mapped",
                self.index
            );
            return Err(Error::Busy);
        }
        let idx = DomainIdx::from(self.domains.len());
        self.domains.push(Domain::new(idx));
        debug!("Master {}: created domain {}", self.index, self.domains.len() - 1);
        Ok(idx)
    }

    pub fn domain(&self, idx: DomainIdx) -> Result<&Domain> {
        self.domains
            .get(usize::from(idx))
            .ok_or_else(|| Error::DomainIdx(usize::from(idx)))
    }

    pub fn domains(&self) -> &[Domain] {
        &self.domains
    }

    /// Lets a domain keep its process data in `buffer` instead of the shared
    /// mapping. The buffer must be large enough once all entries are
    /// registered; this is checked when the memory is set up.
    pub fn domain_external_memory(&mut self, domain: DomainIdx, buffer: Box<[u8]>) -> Result<()> {
        if self.memory.is_some() {
            warn!(
                "Master {}: cannot bind external memory after process data is set up",
                self.index
            );
            return Err(Error::Busy);
        }
        let d = self
            .domains
            .get_mut(usize::from(domain))
            .ok_or_else(|| Error::DomainIdx(usize::from(domain)))?;
        let data = ProcessData::external(buffer);
        debug!(
            "Master {}: domain {} uses {} external bytes at 0x{:x}",
            self.index,
            usize::from(domain),
            data.size(),
            data.address()
        );
        d.bind_external(data);
        Ok(())
    }

    /// Declares a slave configuration, or returns the existing one for the
    /// same address and identity.
    pub fn configure_slave(&mut self, addr: SlaveAddr, id: SlaveId) -> Result<SlaveConfigIdx> {
        let (alias, position) = addr.as_pair();
        if let Some(sc) = self
            .configs
            .iter()
            .find(|sc| sc.alias == alias && sc.position == position)
        {
            if sc.id != id {
                warn!(
                    "Master {}: slave {}-{} is already configured as 0x{:08X}/0x{:08X}",
                    self.index, alias, position, sc.id.vendor_id, sc.id.product_code
                );
                return Err(Error::ConfigConflict(alias, position));
            }
            return Ok(sc.index());
        }
        let idx = self.configs.len() as SlaveConfigIdx;
        let mut sc = SlaveConfig::new(idx, addr, id);
        sc.attach(&mut self.slaves);
        self.configs.push(sc);
        if self.dc_ref_config == Some(idx) {
            // the selected reference clock only now has a slave
            self.compute_dc();
        }
        Ok(idx)
    }

    fn config_mut(&mut self, idx: SlaveConfigIdx) -> Result<&mut SlaveConfig> {
        self.configs
            .get_mut(idx as usize)
            .ok_or(Error::ConfigIdx(idx))
    }

    pub fn config(&self, idx: SlaveConfigIdx) -> Result<&SlaveConfig> {
        self.configs.get(idx as usize).ok_or(Error::ConfigIdx(idx))
    }

    pub fn config_info(&self, idx: SlaveConfigIdx) -> Result<ConfigInfo> {
        self.config(idx).map(SlaveConfig::info)
    }

    pub fn config_state(&self, idx: SlaveConfigIdx) -> Result<SlaveConfigState> {
        let sc = self.config(idx)?;
        Ok(match sc.slave() {
            Some(pos) => {
                let slave = &self.slaves[index(pos)];
                SlaveConfigState {
                    online: true,
                    operational: slave.current_state == AlState::Op && !slave.force_config,
                    al_state: slave.current_state,
                }
            }
            None => SlaveConfigState {
                online: false,
                operational: false,
                al_state: AlState::Init,
            },
        })
    }

    /// Sets the DC assign/activate word and the sync signals of a
    /// configuration, starting with SYNC0.
    pub fn config_dc(
        &mut self,
        config: SlaveConfigIdx,
        assign_activate: u16,
        signals: &[SyncSignal],
    ) -> Result<()> {
        let sc = self.config_mut(config)?;
        let mut updated = sc.clone();
        for (i, signal) in signals.iter().enumerate() {
            updated.set_dc_sync(i, *signal)?;
        }
        updated.dc.assign_activate = assign_activate;
        *sc = updated;
        Ok(())
    }

    pub fn config_overlapping_pdos(&mut self, config: SlaveConfigIdx, allow: bool) -> Result<()> {
        self.config_mut(config)?.allow_overlapping_pdos = allow;
        Ok(())
    }

    pub fn config_watchdog(&mut self, config: SlaveConfigIdx, watchdog: Watchdog) -> Result<()> {
        self.config_mut(config)?.watchdog = Some(watchdog);
        Ok(())
    }

    pub fn register_pdo_entry(
        &mut self,
        config: SlaveConfigIdx,
        domain: DomainIdx,
        entry: PdoEntryIdx,
        bit_len: u8,
        direction: SyncDirection,
    ) -> Result<Offset> {
        let overlapping = self.config(config)?.allow_overlapping_pdos;
        if self.memory.is_some() {
            return Err(Error::Busy);
        }
        let index = self.index;
        let d = self
            .domains
            .get_mut(usize::from(domain))
            .ok_or_else(|| Error::DomainIdx(usize::from(domain)))?;
        let offset = d.register_pdo_entry(config, overlapping, bit_len, direction)?;
        debug!(
            "Master {}: entry {:04X}:{:02X} of config {} placed at {}.{} in domain {}",
            index,
            u16::from(entry.idx),
            u8::from(entry.sub_idx),
            config,
            offset.byte,
            offset.bit,
            usize::from(domain)
        );
        Ok(offset)
    }

    /// Selects the configuration whose slave shall be the DC reference
    /// clock, or returns to automatic selection with `None`.
    ///
    /// The DC topology is recomputed right away; a selection that cannot be
    /// honoured is reported and automatic selection is used instead.
    pub fn select_reference_clock(&mut self, config: Option<SlaveConfigIdx>) {
        self.dc_ref_config = config;
        self.attach_configs();
        self.compute_dc();
    }

    pub fn reference_clock(&self) -> Option<SlavePos> {
        self.dc.reference
    }

    /// DC slaves in the order they are reached from the reference clock.
    pub fn dc_order(&self) -> &[SlavePos] {
        &self.dc.order
    }

    /// Maps the process data of all domains.
    ///
    /// Reports size 0 if the memory is already set up or there is nothing to
    /// map.
    pub fn setup_domain_memory(&mut self) -> Result<MemorySetup> {
        let setup = memory::setup(&mut self.domains, &mut self.memory)?;
        if setup.size > 0 {
            info!(
                "Master {}: {} bytes of process data for {} domains",
                self.index,
                setup.size,
                self.domains.len()
            );
        }
        Ok(setup)
    }

    pub fn activate(&mut self) -> Result<MemorySetup> {
        if self.active {
            debug!("Master {}: already active", self.index);
            return Ok(MemorySetup {
                address: self.memory.as_ref().map_or(0, Binding::address),
                size: 0,
            });
        }
        // nothing else is touched if the memory cannot be set up
        let setup = self.setup_domain_memory()?;
        let resume_scan = matches!(self.fsm.state(), FsmState::Idle | FsmState::Scanning);

        self.fsm.enter(FsmState::DomainSetup);
        let mut logical_base_address = 0u32;
        for domain in &mut self.domains {
            domain.finish(logical_base_address);
            logical_base_address = logical_base_address.wrapping_add(domain.size() as u32);
        }

        self.fsm.enter(FsmState::Configuring);
        self.attach_configs();
        self.fsm.enter(FsmState::DcCalc);
        self.compute_dc();

        for slave in &mut self.slaves {
            if slave.config.is_some() {
                slave.request_state(AlState::Op);
            }
        }
        self.active = true;
        self.deactivated = false;
        info!("Master {}: activated", self.index);
        self.rest(resume_scan);
        Ok(setup)
    }

    /// Brings the slaves to PREOP ahead of deactivation while the master is
    /// still active.
    pub fn deactivate_slaves(&mut self) {
        if !self.active {
            warn!("Master {}: not active, not deactivating slaves", self.index);
            return;
        }
        for sc in &mut self.configs {
            if sc.uses_dc() {
                sc.clear_dc();
            }
        }
        self.hold_slaves_in_preop();
        self.app_time = 0;
        if self.fsm.state() == FsmState::Active {
            self.fsm.enter(FsmState::DeactivatingSlaves);
        }
    }

    pub fn deactivate(&mut self) {
        if !self.active {
            warn!("Master {}: deactivate called on inactive master", self.index);
            return;
        }
        self.clear_config();
        self.hold_slaves_in_preop();
        self.app_time = 0;
        self.compute_dc();
        self.active = false;
        self.deactivated = true;
        if matches!(
            self.fsm.state(),
            FsmState::Active | FsmState::DeactivatingSlaves
        ) {
            self.fsm.enter(FsmState::Inactive);
        }
        info!("Master {}: deactivated", self.index);
    }

    /// Gives up the application's ownership of the master.
    pub fn release(&mut self) {
        if self.active {
            self.deactivate();
        } else {
            self.clear_config();
        }
        debug!("Master {}: released", self.index);
    }

    fn clear_config(&mut self) {
        for sc in &mut self.configs {
            sc.detach(&mut self.slaves);
        }
        self.configs.clear();
        self.domains.clear();
        self.dc_ref_config = None;
        self.memory = None;
    }

    fn hold_slaves_in_preop(&mut self) {
        for slave in &mut self.slaves {
            // tunnels keep running for the network behind them
            let state = if slave.has_open_tunnel() {
                AlState::Op
            } else {
                AlState::Preop
            };
            slave.request_state(state);
            slave.force_config = true;
        }
    }

    /// Hands out the process data for the cyclic task, once per mapping.
    ///
    /// A mapping set up ahead of activation is the one activation uses, so
    /// a view taken before `activate` is the only one for that epoch.
    pub fn take_process_data(&mut self) -> Result<ProcessDataView> {
        let binding = match &mut self.memory {
            Some(binding) => binding,
            None => return Err(Error::NotActivated),
        };
        if binding.shared.is_none() && !self.domains.iter().any(Domain::is_external) {
            return Err(Error::NotMapped);
        }
        if binding.view_issued {
            return Err(Error::AlreadyMapped);
        }
        binding.view_issued = true;
        Ok(ProcessDataView::new(binding.shared.clone(), &self.domains))
    }

    pub fn application_time(&mut self, app_time: u64) {
        self.app_time = app_time;
    }

    pub fn request_state(&mut self, position: SlavePos, state: AlState) -> Result<()> {
        let slave = self
            .slaves
            .get_mut(index(position))
            .ok_or_else(|| Error::NoSlave(u16::from(position)))?;
        slave.request_state(state);
        Ok(())
    }

    pub fn rescan(&mut self) {
        info!("Master {}: rescan requested", self.index);
        self.fsm.enter(FsmState::Scanning);
    }

    pub fn slave(&self, position: SlavePos) -> Result<&Slave> {
        self.slaves
            .get(index(position))
            .ok_or_else(|| Error::NoSlave(u16::from(position)))
    }

    pub fn slaves(&self) -> &[Slave] {
        &self.slaves
    }

    pub fn info(&self) -> MasterInfo {
        MasterInfo {
            index: self.index,
            slave_count: self.slaves.len() as u32,
            link_up: self.link_up,
            scan_busy: matches!(
                self.fsm.state(),
                FsmState::Idle | FsmState::Scanning | FsmState::Configuring | FsmState::DcCalc
            ),
            active: self.active,
            app_time: self.app_time,
            ref_clock: self.dc.reference,
        }
    }

    pub fn state(&self) -> MasterState {
        MasterState {
            slaves_responding: self.slaves.len() as u32,
            al_states: self
                .slaves
                .iter()
                .fold(0, |states, s| states | s.current_state as u8),
            link_up: self.link_up,
        }
    }

    /// Runs one step of the master state machine against the bus.
    pub fn fsm_exec<B: Bus + ?Sized>(&mut self, bus: &mut B) {
        match self.fsm.state() {
            FsmState::Idle => self.fsm.enter(FsmState::Scanning),
            FsmState::Scanning => self.scan(bus),
            FsmState::Configuring | FsmState::DomainSetup => {
                self.fsm.enter(FsmState::Configuring);
                self.attach_configs();
                self.fsm.enter(FsmState::DcCalc);
            }
            FsmState::DcCalc => {
                self.compute_dc();
                self.write_dc_offsets(bus);
                self.rest(false);
            }
            FsmState::Ready | FsmState::Active | FsmState::Inactive => {
                self.configure_slaves(bus);
                self.write_dc_offsets(bus);
            }
            FsmState::DeactivatingSlaves => {
                self.configure_slaves(bus);
                self.fsm.enter(FsmState::Active);
            }
        }
    }

    fn rest(&mut self, resume_scan: bool) {
        let next = if resume_scan {
            FsmState::Scanning
        } else if self.active {
            FsmState::Active
        } else if self.deactivated {
            FsmState::Inactive
        } else {
            FsmState::Ready
        };
        self.fsm.enter(next);
    }

    fn scan<B: Bus + ?Sized>(&mut self, bus: &mut B) {
        let mut slaves = match bus.scan() {
            Ok(slaves) => slaves,
            Err(e) => {
                if self.link_up {
                    warn!("Master {}: bus scan failed: {}", self.index, e);
                }
                self.link_up = false;
                return;
            }
        };
        for sc in &mut self.configs {
            sc.detach(&mut self.slaves);
        }
        for (i, slave) in slaves.iter_mut().enumerate() {
            slave.ring_pos = i as u16;
            slave.config = None;
        }
        self.slaves = slaves;
        self.dc = DcTopology::default();
        self.link_up = true;
        info!("Master {}: found {} slaves", self.index, self.slaves.len());
        self.fsm.enter(FsmState::Configuring);
    }

    fn attach_configs(&mut self) {
        for sc in &mut self.configs {
            let fresh = sc.slave().is_none();
            if sc.attach(&mut self.slaves) && fresh && self.active {
                if let Some(pos) = sc.slave() {
                    self.slaves[index(pos)].request_state(AlState::Op);
                }
            }
        }
    }

    fn compute_dc(&mut self) {
        self.dc = dc::synchronize(&mut self.slaves, &self.configs, self.dc_ref_config);
        self.dc_offsets_pending = true;
    }

    fn configure_slaves<B: Bus + ?Sized>(&mut self, bus: &mut B) {
        for slave in &mut self.slaves {
            if slave.error_flag || (!slave.force_config && slave.current_state == slave.requested_state)
            {
                continue;
            }
            let position = slave.position();
            if slave.force_config {
                match bus.request_state(position, AlState::Init) {
                    Ok(state) => slave.current_state = state,
                    Err(e) => {
                        warn!("Slave {}: failed to reset to INIT: {}", slave.ring_pos, e);
                        continue;
                    }
                }
            }
            match bus.request_state(position, slave.requested_state) {
                Ok(state) => {
                    debug!(
                        "Slave {}: {:?} (requested {:?})",
                        slave.ring_pos, state, slave.requested_state
                    );
                    slave.current_state = state;
                    slave.force_config = false;
                    if state != slave.requested_state {
                        warn!(
                            "Slave {}: refused to enter {:?}, staying in {:?}",
                            slave.ring_pos, slave.requested_state, state
                        );
                        slave.error_flag = true;
                    }
                }
                Err(e) => warn!(
                    "Slave {}: failed to request {:?}: {}",
                    slave.ring_pos, slave.requested_state, e
                ),
            }
        }
    }

    /// Commits system time offsets and transmission delays of the DC slaves.
    /// Waits for the application to supply a time first.
    fn write_dc_offsets<B: Bus + ?Sized>(&mut self, bus: &mut B) {
        if !self.dc_offsets_pending || self.app_time == 0 {
            return;
        }
        let mut failed = false;
        for pos in &self.dc.order {
            let slave = &mut self.slaves[index(*pos)];
            let system_time = match bus.system_time(*pos) {
                Ok(time) => time,
                Err(e) => {
                    warn!("Slave {}: failed to read system time: {}", slave.ring_pos, e);
                    failed = true;
                    continue;
                }
            };
            let offset = match dc::correct_system_time_offset(
                slave.dc_system_time_offset,
                self.app_time,
                system_time,
                self.dc_time_tolerance_ns,
            ) {
                Some(offset) => {
                    debug!(
                        "Slave {}: system time offset {} -> {}",
                        slave.ring_pos, slave.dc_system_time_offset, offset
                    );
                    offset
                }
                None => slave.dc_system_time_offset,
            };
            match bus.write_dc_params(*pos, offset, slave.transmission_delay) {
                Ok(()) => slave.dc_system_time_offset = offset,
                Err(e) => {
                    warn!("Slave {}: failed to write DC parameters: {}", slave.ring_pos, e);
                    failed = true;
                }
            }
        }
        self.dc_offsets_pending = failed;
    }
}

#[cfg(test)]
impl Master {
    fn with_slaves(slaves: Vec<Slave>) -> Self {
        let mut master = Master::new(0);
        master.slaves = slaves;
        master.link_up = true;
        master.fsm.enter(FsmState::Scanning);
        master.fsm.enter(FsmState::Configuring);
        master.fsm.enter(FsmState::DcCalc);
        master.fsm.enter(FsmState::Ready);
        master
    }
}

#[cfg(test)]
const EL1008: SlaveId = SlaveId {
    vendor_id: 2,
    product_code: 0x03f0_3052,
};

#[cfg(test)]
fn entry(idx: u16) -> PdoEntryIdx {
    PdoEntryIdx {
        idx: Idx::from(idx),
        sub_idx: SubIdx::from(1),
    }
}

#[test]
fn test_builder() {
    let master = MasterBuilder::new()
        .index(2)
        .dc_time_tolerance(Duration::from_micros(100))
        .build();
    assert_eq!(master.index(), 2);
    assert_eq!(master.dc_time_tolerance(), Duration::from_micros(100));
    assert_eq!(Master::new(0).dc_time_tolerance(), Duration::from_micros(10));
    assert_eq!(master.fsm_state(), FsmState::Idle);
}

#[test]
fn test_configure_slave_twice() {
    let mut master = Master::with_slaves(vec![Slave::new(0, EL1008)]);
    let a = master.configure_slave(SlaveAddr::ByPos(0), EL1008).unwrap();
    let b = master.configure_slave(SlaveAddr::ByPos(0), EL1008).unwrap();
    assert_eq!(a, b);
    assert_eq!(master.config_info(a).unwrap().slave_position, Some(SlavePos::from(0)));
    assert!(matches!(
        master.configure_slave(SlaveAddr::ByPos(0), SlaveId::new(2, 1)),
        Err(Error::ConfigConflict(0, 0))
    ));
    assert!(master.config_state(a).unwrap().online);
    assert!(matches!(master.config_state(7), Err(Error::ConfigIdx(7))));
}

#[test]
fn test_config_dc() {
    let mut master = Master::new(0);
    let sc = master.configure_slave(SlaveAddr::ByPos(3), EL1008).unwrap();
    master
        .config_dc(sc, 0x0300, &[SyncSignal::new(1_000_000, 0)])
        .unwrap();
    let info = master.config_info(sc).unwrap();
    assert_eq!(info.dc_assign_activate, 0x0300);
    assert_eq!(info.dc_sync[0].cycle_time, 1_000_000);
    assert!(matches!(
        master.config_dc(sc, 0, &[SyncSignal::default(); 3]),
        Err(Error::SyncIdxTooLarge(2))
    ));
    assert_eq!(master.config_info(sc).unwrap().dc_assign_activate, 0x0300);

    master.config_watchdog(sc, Watchdog::new(2498, 1000)).unwrap();
    master.config_overlapping_pdos(sc, true).unwrap();
    let config = master.config(sc).unwrap();
    assert_eq!(config.watchdog, Some(Watchdog::new(2498, 1000)));
    assert!(config.allow_overlapping_pdos);
}

#[test]
fn test_memory_before_activation() {
    let mut master = Master::with_slaves(vec![Slave::new(0, EL1008)]);
    let domain = master.create_domain().unwrap();
    let sc = master.configure_slave(SlaveAddr::ByPos(0), EL1008).unwrap();
    master
        .register_pdo_entry(sc, domain, entry(0x6000), 8, SyncDirection::Input)
        .unwrap();

    let first = master.setup_domain_memory().unwrap();
    assert_eq!(first.size, 1);
    assert!(matches!(master.create_domain(), Err(Error::Busy)));
    assert!(matches!(
        master.register_pdo_entry(sc, domain, entry(0x6010), 8, SyncDirection::Input),
        Err(Error::Busy)
    ));

    let activated = master.activate().unwrap();
    assert_eq!(activated, MemorySetup { address: first.address, size: 0 });
    assert!(master.is_active());
    assert_eq!(master.fsm_state(), FsmState::Active);
    assert_eq!(master.slaves()[0].requested_state, AlState::Op);
    assert_eq!(master.domain(domain).unwrap().logical_base_address(), Some(0));

    let again = master.activate().unwrap();
    assert_eq!(again.size, 0);
    assert_eq!(again.address, first.address);
}

#[test]
fn test_process_data_once_per_activation() {
    let mut master = Master::new(0);
    assert!(matches!(master.take_process_data(), Err(Error::NotActivated)));
    let domain = master.create_domain().unwrap();
    let sc = master.configure_slave(SlaveAddr::ByPos(0), EL1008).unwrap();
    master
        .register_pdo_entry(sc, domain, entry(0x7000), 16, SyncDirection::Output)
        .unwrap();
    master.activate().unwrap();
    let mut view = master.take_process_data().unwrap();
    assert_eq!(view.domain_data(domain).unwrap().len(), 2);
    assert!(matches!(master.take_process_data(), Err(Error::AlreadyMapped)));

    master.deactivate();
    // the view keeps the old epoch's bytes alive
    view.data()[0] = 1;
    assert!(matches!(master.take_process_data(), Err(Error::NotActivated)));
    assert!(master.domains().is_empty());
}

#[test]
fn test_deactivate_when_inactive() {
    let mut master = Master::with_slaves(vec![Slave::new(0, EL1008)]);
    master.slaves[0].requested_state = AlState::Safeop;
    master.deactivate_slaves();
    master.deactivate();
    assert_eq!(master.slaves()[0].requested_state, AlState::Safeop);
    assert!(!master.slaves()[0].force_config);
    assert_eq!(master.fsm_state(), FsmState::Ready);
}

#[test]
fn test_request_state() {
    let mut master = Master::with_slaves(vec![Slave::new(0, EL1008)]);
    master.request_state(SlavePos::from(0), AlState::Safeop).unwrap();
    assert_eq!(master.slave(SlavePos::from(0)).unwrap().requested_state, AlState::Safeop);
    assert!(matches!(
        master.request_state(SlavePos::from(4), AlState::Op),
        Err(Error::NoSlave(4))
    ));
    assert_eq!(master.state().slaves_responding, 1);
    assert_eq!(master.state().al_states, AlState::Init as u8);
}

#[test]
fn test_view_taken_before_activation_is_the_only_one() {
    let mut master = Master::with_slaves(vec![Slave::new(0, EL1008)]);
    let domain = master.create_domain().unwrap();
    let sc = master.configure_slave(SlaveAddr::ByPos(0), EL1008).unwrap();
    master
        .register_pdo_entry(sc, domain, entry(0x7000), 8, SyncDirection::Output)
        .unwrap();
    let setup = master.setup_domain_memory().unwrap();
    let view = master.take_process_data().unwrap();
    assert_eq!(view.address(), setup.address);

    master.activate().unwrap();
    assert!(matches!(master.take_process_data(), Err(Error::AlreadyMapped)));

    master.deactivate();
    let domain = master.create_domain().unwrap();
    let sc = master.configure_slave(SlaveAddr::ByPos(0), EL1008).unwrap();
    master
        .register_pdo_entry(sc, domain, entry(0x7000), 8, SyncDirection::Output)
        .unwrap();
    master.activate().unwrap();
    assert!(master.take_process_data().is_ok());
}

#[test]
fn test_failed_memory_setup_leaves_master_untouched() {
    let mut master = Master::with_slaves(vec![Slave::new(0, EL1008)]);
    let domain = master.create_domain().unwrap();
    let sc = master.configure_slave(SlaveAddr::ByPos(0), EL1008).unwrap();
    master
        .register_pdo_entry(sc, domain, entry(0x6000), 32, SyncDirection::Input)
        .unwrap();
    master
        .domain_external_memory(domain, vec![0; 2].into_boxed_slice())
        .unwrap();
    master.dc_offsets_pending = false;

    assert!(matches!(master.activate(), Err(Error::BufferTooSmall(0, 4))));
    assert!(master.memory.is_none());
    assert!(!master.is_active());
    assert!(!master.dc_offsets_pending);
    assert_eq!(master.fsm_state(), FsmState::Ready);
    assert_eq!(master.slaves()[0].requested_state, AlState::Preop);
    assert_eq!(master.domain(domain).unwrap().logical_base_address(), None);

    // the configuration can still be fixed up
    master
        .domain_external_memory(domain, vec![0; 4].into_boxed_slice())
        .unwrap();
    assert_eq!(master.activate().unwrap(), MemorySetup::default());
    assert!(master.is_active());
}

#[test]
fn test_external_domain_memory() {
    let mut master = Master::with_slaves(vec![Slave::new(0, EL1008), Slave::new(1, EL1008)]);
    let shared = master.create_domain().unwrap();
    let own = master.create_domain().unwrap();
    let a = master.configure_slave(SlaveAddr::ByPos(0), EL1008).unwrap();
    let b = master.configure_slave(SlaveAddr::ByPos(1), EL1008).unwrap();
    master
        .register_pdo_entry(a, shared, entry(0x6000), 16, SyncDirection::Input)
        .unwrap();
    master
        .register_pdo_entry(b, own, entry(0x7000), 8, SyncDirection::Output)
        .unwrap();
    assert!(matches!(
        master.domain_external_memory(DomainIdx::from(5), vec![0; 1].into_boxed_slice()),
        Err(Error::DomainIdx(5))
    ));
    master
        .domain_external_memory(own, vec![0; 1].into_boxed_slice())
        .unwrap();

    let setup = master.activate().unwrap();
    assert_eq!(setup.size, 2);
    assert_eq!(master.domain(own).unwrap().offset(), None);
    assert_eq!(master.domain(own).unwrap().logical_base_address(), Some(2));
    assert!(matches!(
        master.domain_external_memory(own, vec![0; 1].into_boxed_slice()),
        Err(Error::Busy)
    ));

    let mut view = master.take_process_data().unwrap();
    view.domain_data(own).unwrap()[0] = 0xFF;
    assert_eq!(&view.data()[..], &[0u8, 0][..]);
    assert_eq!(view.domain_data(shared).unwrap().len(), 2);
    assert_eq!(view.domain_state(own, 2).unwrap().wc_state, WcState::Complete);
}

#[test]
fn test_external_domains_only() {
    let mut master = Master::with_slaves(vec![Slave::new(0, EL1008)]);
    let domain = master.create_domain().unwrap();
    let sc = master.configure_slave(SlaveAddr::ByPos(0), EL1008).unwrap();
    master
        .register_pdo_entry(sc, domain, entry(0x6000), 8, SyncDirection::Input)
        .unwrap();
    master
        .domain_external_memory(domain, vec![0; 1].into_boxed_slice())
        .unwrap();
    assert_eq!(master.activate().unwrap(), MemorySetup::default());
    let mut view = master.take_process_data().unwrap();
    assert_eq!(view.address(), 0);
    assert_eq!(view.domain_data(domain).unwrap().len(), 1);
}
