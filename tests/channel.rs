// Part of ethercat-rs. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

mod common;

use common::*;
use ethercat_core::*;
use std::{thread, time::Duration};

fn scanned_channel(bus: &mut SimBus) -> ControlChannel {
    init_logging();
    let mut master = Master::new(0);
    run_until(&mut master, bus, FsmState::Ready);
    ControlChannel::new(master)
}

fn entry(idx: u16) -> PdoEntryIdx {
    PdoEntryIdx {
        idx: Idx::from(idx),
        sub_idx: SubIdx::from(1),
    }
}

#[test]
fn setup_domain_memory_is_idempotent() {
    let mut bus = SimBus::line(2);
    let channel = scanned_channel(&mut bus);
    let mut handle = channel.open(MasterAccess::ReadWrite);
    handle.reserve().unwrap();

    let domain = match handle.execute(Request::CreateDomain).unwrap() {
        Response::Domain(idx) => idx,
        r => panic!("unexpected response {:?}", r),
    };
    let config = match handle
        .execute(Request::ConfigureSlave {
            addr: SlaveAddr::ByPos(0),
            id: EK1100,
        })
        .unwrap()
    {
        Response::Config(idx) => idx,
        r => panic!("unexpected response {:?}", r),
    };
    for (i, direction) in [SyncDirection::Output, SyncDirection::Input].iter().enumerate() {
        handle
            .execute(Request::RegisterPdoEntry {
                config,
                domain,
                entry: entry(0x7000 + i as u16),
                bit_len: 32,
                direction: *direction,
            })
            .unwrap();
    }

    let first = match handle.execute(Request::SetupDomainMemory).unwrap() {
        Response::Memory(setup) => setup,
        r => panic!("unexpected response {:?}", r),
    };
    assert_eq!(first.size, 8);
    let second = match handle.execute(Request::SetupDomainMemory).unwrap() {
        Response::Memory(setup) => setup,
        r => panic!("unexpected response {:?}", r),
    };
    assert_eq!(second, MemorySetup { address: first.address, size: 0 });

    match handle.execute(Request::Activate).unwrap() {
        Response::Memory(setup) => assert_eq!(setup.address, first.address),
        r => panic!("unexpected response {:?}", r),
    }
}

#[test]
fn empty_configuration_maps_nothing() {
    let mut bus = SimBus::line(1);
    let channel = scanned_channel(&mut bus);
    let mut handle = channel.open(MasterAccess::ReadWrite);
    handle.reserve().unwrap();
    handle.execute(Request::CreateDomain).unwrap();
    assert!(matches!(
        handle.execute(Request::SetupDomainMemory),
        Ok(Response::Memory(MemorySetup { size: 0, .. }))
    ));
}

#[test]
fn read_only_handle_cannot_mutate() {
    let mut bus = SimBus::line(2);
    let channel = scanned_channel(&mut bus);
    let mut handle = channel.open(MasterAccess::ReadOnly);

    let requests = vec![
        Request::Rescan,
        Request::RequestState {
            slave: SlavePos::from(0),
            state: AlState::Op,
        },
        Request::CreateDomain,
        Request::ConfigureSlave {
            addr: SlaveAddr::ByPos(0),
            id: EK1100,
        },
        Request::Activate,
        Request::DeactivateSlaves,
        Request::Deactivate,
        Request::SelectReferenceClock(None),
        Request::ApplicationTime(1),
        Request::SetupDomainMemory,
    ];
    for request in requests {
        assert!(matches!(handle.execute(request), Err(Error::PermissionDenied)));
    }

    let master = channel.lock();
    assert_eq!(master.fsm_state(), FsmState::Ready);
    assert!(!master.is_active());
    assert!(master.domains().is_empty());
    assert!(master.config(0).is_err());
    assert_eq!(master.info().app_time, 0);
    assert!(master
        .slaves()
        .iter()
        .all(|s| s.requested_state == AlState::Preop));
}

#[test]
fn queries_need_no_reservation() {
    let mut bus = SimBus::line(2);
    let channel = scanned_channel(&mut bus);
    let mut handle = channel.open(MasterAccess::ReadOnly);
    match handle.execute(Request::MasterInfo).unwrap() {
        Response::Info(info) => {
            assert_eq!(info.slave_count, 2);
            assert!(info.link_up);
            assert!(!info.active);
            assert_eq!(info.ref_clock, Some(SlavePos::from(0)));
        }
        r => panic!("unexpected response {:?}", r),
    }
    match handle.execute(Request::SlaveInfo(SlavePos::from(1))).unwrap() {
        Response::Slave(slave) => assert_eq!(slave.transmission_delay, 100),
        r => panic!("unexpected response {:?}", r),
    }
    assert!(matches!(
        handle.execute(Request::SlaveInfo(SlavePos::from(5))),
        Err(Error::NoSlave(5))
    ));
}

#[test]
fn cyclic_task_uses_the_view_without_the_guard() {
    let mut bus = SimBus::line(1);
    let channel = scanned_channel(&mut bus);
    let mut handle = channel.open(MasterAccess::ReadWrite);
    handle.reserve().unwrap();
    handle.execute(Request::CreateDomain).unwrap();
    handle
        .execute(Request::ConfigureSlave {
            addr: SlaveAddr::ByPos(0),
            id: EK1100,
        })
        .unwrap();
    let domain = DomainIdx::from(0);
    handle
        .execute(Request::RegisterPdoEntry {
            config: 0,
            domain,
            entry: entry(0x6000),
            bit_len: 8,
            direction: SyncDirection::Input,
        })
        .unwrap();
    handle.execute(Request::Activate).unwrap();
    let mut view = match handle.execute(Request::MapProcessData).unwrap() {
        Response::ProcessData(view) => view,
        r => panic!("unexpected response {:?}", r),
    };
    assert!(matches!(
        handle.execute(Request::MapProcessData),
        Err(Error::AlreadyMapped)
    ));

    let guard = channel.lock();
    view.domain_data(domain).unwrap()[0] = 0x5A;
    assert_eq!(view.domain_state(domain, 1).unwrap().wc_state, WcState::Complete);
    drop(guard);
    assert_eq!(&view.data()[..], &[0x5Au8][..]);
}

#[test]
fn waiting_request_can_be_interrupted() {
    let mut bus = SimBus::line(1);
    let channel = scanned_channel(&mut bus);
    let mut handle = channel.open(MasterAccess::ReadWrite);
    handle.reserve().unwrap();
    let signal = handle.signal();

    // the driver thread holds the master while a request waits for it
    let guard = channel.lock();
    let result = thread::scope(|s| {
        let waiter = s.spawn(|| handle.execute(Request::Activate).map(|_| ()));
        thread::sleep(Duration::from_millis(20));
        signal.raise();
        waiter.join().unwrap()
    });
    drop(guard);

    match result {
        Err(e) => assert!(matches!(e, Error::Interrupted)),
        Ok(()) => panic!("request was not interrupted"),
    }
    assert!(!channel.lock().is_active());

    handle.execute(Request::Activate).unwrap();
    assert!(channel.lock().is_active());
}

#[test]
fn dropping_the_handle_releases_the_master() {
    let mut bus = SimBus::line(2);
    let channel = scanned_channel(&mut bus);
    {
        let mut handle = channel.open(MasterAccess::ReadWrite);
        handle.reserve().unwrap();
        handle
            .execute(Request::ConfigureSlave {
                addr: SlaveAddr::ByPos(1),
                id: EK1100,
            })
            .unwrap();
        handle.execute(Request::Activate).unwrap();
        assert!(channel.is_reserved());
    }
    assert!(!channel.is_reserved());
    let mut master = channel.lock();
    assert!(!master.is_active());
    assert_eq!(master.fsm_state(), FsmState::Inactive);
    master.fsm_exec(&mut bus);
    assert_eq!(bus.states, vec![AlState::Preop; 2]);
}

#[test]
fn process_data_mapped_before_activation_is_handed_out_once() {
    let mut bus = SimBus::line(1);
    let channel = scanned_channel(&mut bus);
    let mut handle = channel.open(MasterAccess::ReadWrite);
    handle.reserve().unwrap();
    handle.execute(Request::CreateDomain).unwrap();
    handle
        .execute(Request::ConfigureSlave {
            addr: SlaveAddr::ByPos(0),
            id: EK1100,
        })
        .unwrap();
    handle
        .execute(Request::RegisterPdoEntry {
            config: 0,
            domain: DomainIdx::from(0),
            entry: entry(0x7000),
            bit_len: 8,
            direction: SyncDirection::Output,
        })
        .unwrap();
    handle.execute(Request::SetupDomainMemory).unwrap();
    let view = match handle.execute(Request::MapProcessData).unwrap() {
        Response::ProcessData(view) => view,
        r => panic!("unexpected response {:?}", r),
    };
    handle.execute(Request::Activate).unwrap();
    assert!(matches!(
        handle.execute(Request::MapProcessData),
        Err(Error::AlreadyMapped)
    ));
    assert_ne!(view.address(), 0);
}

#[test]
fn external_domain_memory_through_the_channel() {
    let mut bus = SimBus::line(1);
    let channel = scanned_channel(&mut bus);
    let mut handle = channel.open(MasterAccess::ReadWrite);
    handle.reserve().unwrap();
    let domain = match handle.execute(Request::CreateDomain).unwrap() {
        Response::Domain(idx) => idx,
        r => panic!("unexpected response {:?}", r),
    };
    handle
        .execute(Request::ConfigureSlave {
            addr: SlaveAddr::ByPos(0),
            id: EK1100,
        })
        .unwrap();
    handle
        .execute(Request::RegisterPdoEntry {
            config: 0,
            domain,
            entry: entry(0x6000),
            bit_len: 16,
            direction: SyncDirection::Input,
        })
        .unwrap();
    handle
        .execute(Request::DomainExternalMemory {
            domain,
            buffer: vec![0; 2].into_boxed_slice(),
        })
        .unwrap();
    assert!(matches!(
        handle.execute(Request::Activate),
        Ok(Response::Memory(MemorySetup { size: 0, .. }))
    ));
    let mut view = match handle.execute(Request::MapProcessData).unwrap() {
        Response::ProcessData(view) => view,
        r => panic!("unexpected response {:?}", r),
    };
    view.domain_data(domain).unwrap().copy_from_slice(&[1, 2]);
    let address = channel.lock().domain(domain).unwrap().external_address();
    assert!(address.is_some());
}
