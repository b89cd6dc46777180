// Part of ethercat-rs. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

mod common;

use common::*;
use ethercat_core::*;
use std::time::Duration;

#[test]
fn three_dc_slaves_follow_the_reference_clock() {
    let mut bus = SimBus::line(3);
    let (mut master, configs) = configured(&mut bus);

    master.activate().unwrap();
    assert_eq!(master.reference_clock(), Some(SlavePos::from(0)));
    assert_eq!(delays(&master), vec![0, 100, 200]);

    master.select_reference_clock(Some(configs[2]));
    assert_eq!(master.reference_clock(), Some(SlavePos::from(2)));
    assert_eq!(delays(&master), vec![200, 100, 0]);
    assert_eq!(
        master.dc_order(),
        &[SlavePos::from(2), SlavePos::from(1), SlavePos::from(0)][..]
    );
    assert_eq!(master.info().ref_clock, Some(SlavePos::from(2)));
}

#[test]
fn reference_declared_before_scan_is_honoured() {
    init_logging();
    let mut bus = SimBus::line(3);
    let mut master = Master::new(0);
    let sc = master
        .configure_slave(SlaveAddr::ByPos(1), EK1100)
        .unwrap();
    master.select_reference_clock(Some(sc));
    assert_eq!(master.reference_clock(), None);

    run_until(&mut master, &mut bus, FsmState::Ready);
    assert_eq!(master.config(sc).unwrap().slave(), Some(SlavePos::from(1)));
    assert_eq!(master.reference_clock(), Some(SlavePos::from(1)));
    assert_eq!(delays(&master), vec![100, 0, 100]);
}

#[test]
fn reference_selected_before_its_configuration_exists() {
    let mut bus = SimBus::line(3);
    init_logging();
    let mut master = Master::new(0);
    run_until(&mut master, &mut bus, FsmState::Ready);

    master.select_reference_clock(Some(0));
    assert_eq!(master.reference_clock(), Some(SlavePos::from(0)));

    let sc = master
        .configure_slave(SlaveAddr::ByPos(2), EK1100)
        .unwrap();
    assert_eq!(sc, 0);
    assert_eq!(master.reference_clock(), Some(SlavePos::from(2)));
}

#[test]
fn invalid_reference_falls_back_to_first_dc_slave() {
    let mut bus = SimBus::line(3);
    bus.slaves[0].base_dc_supported = false;
    bus.slaves[0].has_dc_system_time = false;
    bus.slaves[1].has_dc_system_time = false;
    let (mut master, configs) = configured(&mut bus);

    master.select_reference_clock(Some(configs[1]));
    assert_eq!(master.reference_clock(), Some(SlavePos::from(2)));

    master.select_reference_clock(Some(42));
    assert_eq!(master.reference_clock(), Some(SlavePos::from(2)));

    master.select_reference_clock(None);
    assert_eq!(master.reference_clock(), Some(SlavePos::from(2)));
}

#[test]
fn bus_without_dc_stays_unsynchronized() {
    let mut bus = SimBus::new(vec![Slave::new(0, EK1100), Slave::new(1, EK1100)]);
    let (mut master, _) = configured(&mut bus);
    master.activate().unwrap();
    assert_eq!(master.reference_clock(), None);
    assert!(master.dc_order().is_empty());
    run_until(&mut master, &mut bus, FsmState::Active);
    master.fsm_exec(&mut bus);
    assert_eq!(bus.states, vec![AlState::Op, AlState::Op]);
}

#[test]
fn activation_brings_configured_slaves_to_op() {
    let mut bus = SimBus::line(3);
    let (mut master, configs) = configured(&mut bus);
    assert!(!master.config_state(configs[0]).unwrap().operational);

    master.activate().unwrap();
    assert_eq!(master.fsm_state(), FsmState::Active);
    master.fsm_exec(&mut bus);
    assert_eq!(bus.states, vec![AlState::Op; 3]);
    let state = master.config_state(configs[0]).unwrap();
    assert!(state.online && state.operational);
    assert_eq!(master.state().al_states, AlState::Op as u8);
}

#[test]
fn deactivate_slaves_keeps_tunnels_in_op() {
    let mut bus = SimBus::line(3);
    bus.slaves[1].tunnel = Tunnel::Open;
    let (mut master, configs) = configured(&mut bus);
    master
        .config_dc(configs[0], 0x0300, &[SyncSignal::new(1_000_000, 0)])
        .unwrap();
    master.activate().unwrap();
    master.application_time(1_000);
    master.fsm_exec(&mut bus);

    master.deactivate_slaves();
    assert_eq!(master.fsm_state(), FsmState::DeactivatingSlaves);
    assert_eq!(master.info().app_time, 0);
    assert_eq!(master.config_info(configs[0]).unwrap().dc_assign_activate, 0);
    let requested: Vec<_> = master.slaves().iter().map(|s| s.requested_state).collect();
    assert_eq!(requested, vec![AlState::Preop, AlState::Op, AlState::Preop]);
    assert!(master.slaves().iter().all(|s| s.force_config));

    master.fsm_exec(&mut bus);
    assert_eq!(master.fsm_state(), FsmState::Active);
    assert_eq!(bus.states, vec![AlState::Preop, AlState::Op, AlState::Preop]);
    assert!(master.slaves().iter().all(|s| !s.force_config));
    assert!(master.is_active());
}

#[test]
fn deactivate_slaves_on_inactive_master_changes_nothing() {
    let mut bus = SimBus::line(2);
    let (mut master, _) = configured(&mut bus);
    let before: Vec<_> = master
        .slaves()
        .iter()
        .map(|s| (s.requested_state, s.force_config))
        .collect();
    master.deactivate_slaves();
    let after: Vec<_> = master
        .slaves()
        .iter()
        .map(|s| (s.requested_state, s.force_config))
        .collect();
    assert_eq!(before, after);
    assert_eq!(master.fsm_state(), FsmState::Ready);
}

#[test]
fn deactivate_and_reactivate() {
    let mut bus = SimBus::line(2);
    let (mut master, configs) = configured(&mut bus);
    let domain = master.create_domain().unwrap();
    let entry = PdoEntryIdx {
        idx: Idx::from(0x6000),
        sub_idx: SubIdx::from(1),
    };
    master
        .register_pdo_entry(configs[1], domain, entry, 16, SyncDirection::Input)
        .unwrap();
    master.select_reference_clock(Some(configs[1]));
    let first = master.activate().unwrap();
    assert_eq!(first.size, 2);
    master.fsm_exec(&mut bus);

    master.deactivate();
    assert!(!master.is_active());
    assert_eq!(master.fsm_state(), FsmState::Inactive);
    assert!(master.domains().is_empty());
    assert!(matches!(master.config(configs[0]), Err(Error::ConfigIdx(_))));
    assert_eq!(master.reference_clock(), Some(SlavePos::from(0)));
    assert!(master.slaves().iter().all(|s| s.config().is_none()));

    master.fsm_exec(&mut bus);
    assert_eq!(bus.states, vec![AlState::Preop; 2]);

    // a second deactivation is only reported
    master.deactivate();
    assert_eq!(master.fsm_state(), FsmState::Inactive);

    let sc = master.configure_slave(SlaveAddr::ByPos(0), EK1100).unwrap();
    assert_eq!(sc, 0);
    assert_eq!(master.activate().unwrap(), MemorySetup::default());
    assert_eq!(master.fsm_state(), FsmState::Active);
    master.fsm_exec(&mut bus);
    assert_eq!(bus.states, vec![AlState::Op, AlState::Preop]);
}

#[test]
fn system_time_offsets_respect_the_tolerance() {
    let mut bus = SimBus::line(1);
    let (mut master, _) = configured(&mut bus);
    let app_time = 1_000_000_000;
    master.application_time(app_time);

    // exactly at the tolerance: nothing to correct
    bus.local_time = app_time - 10_000;
    master.fsm_exec(&mut bus);
    assert_eq!(master.slaves()[0].dc_system_time_offset, 0);
    assert_eq!(bus.dc_writes, vec![(SlavePos::from(0), 0, 0)]);

    // no new measurement until the DC is recomputed
    master.fsm_exec(&mut bus);
    assert_eq!(bus.dc_writes.len(), 1);

    bus.local_time = app_time - 10_001;
    master.select_reference_clock(None);
    master.fsm_exec(&mut bus);
    assert_eq!(master.slaves()[0].dc_system_time_offset, 10_001);
    assert_eq!(bus.offsets[0], 10_001);

    // the committed offset brings the slave in line
    master.select_reference_clock(None);
    master.fsm_exec(&mut bus);
    assert_eq!(master.slaves()[0].dc_system_time_offset, 10_001);
}

#[test]
fn tolerance_is_configurable() {
    init_logging();
    let mut bus = SimBus::line(1);
    let mut master = MasterBuilder::new()
        .dc_time_tolerance(Duration::from_micros(50))
        .build();
    run_until(&mut master, &mut bus, FsmState::Ready);
    master.application_time(1_000_000);
    bus.local_time = 1_000_000 - 40_000;
    master.fsm_exec(&mut bus);
    assert_eq!(master.slaves()[0].dc_system_time_offset, 0);
}

#[test]
fn offsets_wait_for_application_time() {
    let mut bus = SimBus::line(2);
    let (mut master, _) = configured(&mut bus);
    master.fsm_exec(&mut bus);
    assert!(bus.dc_writes.is_empty());
    master.application_time(5_000_000);
    bus.local_time = 0;
    master.fsm_exec(&mut bus);
    assert_eq!(
        bus.dc_writes,
        vec![
            (SlavePos::from(0), 5_000_000, 0),
            (SlavePos::from(1), 5_000_000, 100),
        ]
    );
}

#[test]
fn rescan_replaces_the_registry() {
    let mut bus = SimBus::line(2);
    let (mut master, configs) = configured(&mut bus);
    master.activate().unwrap();
    run_until(&mut master, &mut bus, FsmState::Active);

    bus.slaves.push(Slave::new(2, EK1100));
    bus.states.push(AlState::Init);
    bus.offsets.push(0);
    master.rescan();
    assert!(master.info().scan_busy);
    run_until(&mut master, &mut bus, FsmState::Active);
    assert_eq!(master.info().slave_count, 3);
    assert_eq!(master.config(configs[1]).unwrap().slave(), Some(SlavePos::from(1)));
    assert_eq!(master.slaves()[1].requested_state, AlState::Op);
    assert_eq!(master.slaves()[2].requested_state, AlState::Preop);

    master.fsm_exec(&mut bus);
    assert_eq!(bus.states, vec![AlState::Op, AlState::Op, AlState::Preop]);
}

#[test]
fn scan_failure_takes_the_link_down() {
    let mut bus = SimBus::line(1);
    let (mut master, _) = configured(&mut bus);
    assert!(master.info().link_up);
    bus.link_down = true;
    master.rescan();
    master.fsm_exec(&mut bus);
    assert_eq!(master.fsm_state(), FsmState::Scanning);
    assert!(!master.info().link_up);

    bus.link_down = false;
    run_until(&mut master, &mut bus, FsmState::Ready);
    assert!(master.info().link_up);
}

#[test]
fn activation_during_scan_resumes_the_scan() {
    init_logging();
    let mut bus = SimBus::line(2);
    let mut master = Master::new(0);
    master.configure_slave(SlaveAddr::ByPos(1), EK1100).unwrap();
    master.activate().unwrap();
    assert!(master.is_active());
    assert_eq!(master.fsm_state(), FsmState::Scanning);

    run_until(&mut master, &mut bus, FsmState::Active);
    assert_eq!(master.slaves()[1].requested_state, AlState::Op);
    master.fsm_exec(&mut bus);
    assert_eq!(bus.states, vec![AlState::Preop, AlState::Op]);
}

#[test]
fn long_line_is_synchronized() {
    init_logging();
    let n = 20_000;
    let mut bus = SimBus::line(n);
    let mut master = Master::new(0);
    run_until(&mut master, &mut bus, FsmState::Ready);
    assert_eq!(master.info().slave_count, n as u32);
    assert_eq!(master.dc_order().len(), n);
    assert_eq!(master.slaves()[n - 1].transmission_delay, 100 * (n as u32 - 1));
}
