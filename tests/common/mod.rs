// Part of ethercat-rs. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

#![allow(dead_code)]

use ethercat_core::*;
use std::io;

pub const EK1100: SlaveId = SlaveId {
    vendor_id: 2,
    product_code: 0x044c_2c52,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A bus whose slaves follow every state request and whose clocks run in
/// lockstep with `local_time`.
pub struct SimBus {
    pub slaves: Vec<Slave>,
    pub states: Vec<AlState>,
    pub offsets: Vec<u64>,
    pub local_time: u64,
    pub dc_writes: Vec<(SlavePos, u64, u32)>,
    pub link_down: bool,
}

impl SimBus {
    pub fn new(slaves: Vec<Slave>) -> Self {
        let n = slaves.len();
        Self {
            slaves,
            states: vec![AlState::Init; n],
            offsets: vec![0; n],
            local_time: 0,
            dc_writes: vec![],
            link_down: false,
        }
    }

    /// A line of DC slaves with 100 ns between neighbours.
    pub fn line(n: usize) -> Self {
        let n32 = n as u32;
        let slaves = (0..n32)
            .map(|i| {
                let mut slave = Slave::new(i as u16, EK1100)
                    .with_dc(true)
                    .with_port(0, SlavePort::open(SlavePortType::EBus, 100 * i));
                if i + 1 < n32 {
                    slave = slave.with_port(
                        1,
                        SlavePort::open(SlavePortType::EBus, 100 * (2 * n32 - 2 - i)),
                    );
                }
                slave
            })
            .collect();
        Self::new(slaves)
    }

    fn slot(&self, position: SlavePos) -> io::Result<usize> {
        let i = usize::from(u16::from(position));
        if i < self.slaves.len() && !self.link_down {
            Ok(i)
        } else {
            Err(io::Error::new(io::ErrorKind::NotFound, "no such slave"))
        }
    }
}

impl Bus for SimBus {
    fn scan(&mut self) -> io::Result<Vec<Slave>> {
        if self.link_down {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "link down"));
        }
        Ok(self.slaves.clone())
    }

    fn request_state(&mut self, position: SlavePos, state: AlState) -> io::Result<AlState> {
        let i = self.slot(position)?;
        self.states[i] = state;
        Ok(state)
    }

    fn system_time(&mut self, position: SlavePos) -> io::Result<u64> {
        let i = self.slot(position)?;
        Ok(self.local_time.wrapping_add(self.offsets[i]))
    }

    fn write_dc_params(&mut self, position: SlavePos, offset: u64, delay: u32) -> io::Result<()> {
        let i = self.slot(position)?;
        self.offsets[i] = offset;
        self.dc_writes.push((position, offset, delay));
        Ok(())
    }
}

/// Steps the state machine until it rests in `state`.
pub fn run_until(master: &mut Master, bus: &mut SimBus, state: FsmState) {
    for _ in 0..16 {
        if master.fsm_state() == state {
            return;
        }
        master.fsm_exec(bus);
    }
    panic!("master stuck in {:?}, expected {:?}", master.fsm_state(), state);
}

/// A scanned master in READY with one configuration per slave.
pub fn configured(bus: &mut SimBus) -> (Master, Vec<SlaveConfigIdx>) {
    init_logging();
    let mut master = Master::new(0);
    run_until(&mut master, bus, FsmState::Ready);
    let configs = (0..bus.slaves.len())
        .map(|i| {
            let id = bus.slaves[i].id;
            master.configure_slave(SlaveAddr::ByPos(i as u16), id).unwrap()
        })
        .collect();
    (master, configs)
}

pub fn delays(master: &Master) -> Vec<u32> {
    master.slaves().iter().map(|s| s.transmission_delay).collect()
}
