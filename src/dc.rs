// Part of ethercat-rs. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Distributed clocks: reference clock selection, bus topology and
//! transmission delays.

use crate::{
    config::SlaveConfig,
    slave::{index, Slave, DOWNSTREAM_PORTS, MAX_PORTS},
    types::*,
};
use log::{debug, info, warn};

/// Default deviation between application time and a slave's system time
/// above which a new system time offset is written, in nanoseconds.
pub const SYSTEM_TIME_TOLERANCE_NS: u64 = 10_000;

/// Outcome of a DC computation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DcTopology {
    pub reference: Option<SlavePos>,
    /// DC slaves in the order the walk from the reference reached them.
    pub order: Vec<SlavePos>,
}

/// Picks the reference clock.
///
/// An application-selected configuration wins if its slave can act as
/// reference; otherwise the first DC-capable slave in ring order is used.
pub(crate) fn find_reference_clock(
    slaves: &[Slave],
    configs: &[SlaveConfig],
    selected: Option<SlaveConfigIdx>,
) -> Option<usize> {
    if let Some(idx) = selected {
        match configs.iter().find(|sc| sc.index() == idx) {
            None => warn!("DC reference clock config {} does not exist", idx),
            Some(sc) => match sc.slave() {
                None => warn!(
                    "DC reference clock config ({}-{}) has no slave attached",
                    sc.alias, sc.position
                ),
                Some(pos) => {
                    let slave = &slaves[index(pos)];
                    if slave.is_dc_capable() {
                        return Some(index(pos));
                    }
                    warn!(
                        "DC reference clock config ({}-{}) slave {} cannot act as reference clock",
                        sc.alias, sc.position, slave.ring_pos
                    );
                }
            },
        }
    }
    slaves.iter().position(Slave::is_dc_capable)
}

/// Assigns the neighbour of every open port by walking the ring in port
/// processing order. Fails with the position at which the walk ran out of
/// slaves.
pub(crate) fn calc_topology(slaves: &mut [Slave]) -> std::result::Result<(), usize> {
    for slave in slaves.iter_mut() {
        for port in slave.ports.iter_mut() {
            port.next_slave = None;
        }
    }
    if slaves.is_empty() {
        return Ok(());
    }
    // depth first; each frame is a slave and the next downstream port to visit
    let mut position = 0;
    let mut stack = vec![(0usize, 0usize)];
    while let Some(&(current, k)) = stack.last() {
        let port = match DOWNSTREAM_PORTS.get(k) {
            Some(port) => *port,
            None => {
                stack.pop();
                continue;
            }
        };
        if let Some(top) = stack.last_mut() {
            top.1 = k + 1;
        }
        if !slaves[current].ports[port].is_open() {
            continue;
        }
        position += 1;
        if position >= slaves.len() {
            return Err(current);
        }
        slaves[current].ports[port].next_slave = Some(SlavePos::from(position as u16));
        slaves[position].ports[0].next_slave = Some(SlavePos::from(current as u16));
        stack.push((position, 0));
    }
    Ok(())
}

/// First slave with DC support in the subtree starting at `start`.
fn find_next_dc(slaves: &[Slave], start: usize) -> Option<usize> {
    if slaves[start].base_dc_supported {
        return Some(start);
    }
    let mut stack = vec![(start, 0usize)];
    while let Some(&(current, k)) = stack.last() {
        let port = match DOWNSTREAM_PORTS.get(k) {
            Some(port) => *port,
            None => {
                stack.pop();
                continue;
            }
        };
        if let Some(top) = stack.last_mut() {
            top.1 = k + 1;
        }
        if let Some(next) = slaves[current].ports[port].next_slave {
            let next = index(next);
            if slaves[next].base_dc_supported {
                return Some(next);
            }
            stack.push((next, 0));
        }
    }
    None
}

fn calc_port_delays(slaves: &mut [Slave]) {
    for current in 0..slaves.len() {
        if !slaves[current].base_dc_supported {
            continue;
        }
        for port in 1..MAX_PORTS {
            let next = match slaves[current].ports[port].next_slave {
                Some(next) => index(next),
                None => continue,
            };
            let next_dc = match find_next_dc(slaves, next) {
                Some(dc) => dc,
                None => continue,
            };
            let slave = &slaves[current];
            let rtt = slave.ports[port]
                .receive_time
                .wrapping_sub(slave.ports[slave.previous_port(port)].receive_time);
            let delay = rtt.saturating_sub(slaves[next_dc].rtt_sum()) / 2;
            slaves[current].ports[port].delay_to_next_dc = delay;
            slaves[next_dc].ports[0].delay_to_next_dc = delay;
        }
    }
}

/// Walks the DC slaves below `start`, assigning the accumulated delay to
/// each. The frame also travels back through every upstream port, so
/// `delay` ends up past the return leg of `start`.
fn walk_delays(
    slaves: &mut [Slave],
    start: usize,
    delay: &mut u32,
    visited: &mut [bool],
    order: &mut Vec<SlavePos>,
) {
    visited[start] = true;
    slaves[start].transmission_delay = *delay;
    order.push(SlavePos::from(start as u16));
    let mut stack = vec![(start, 0usize)];
    while let Some(&(current, k)) = stack.last() {
        let port = match DOWNSTREAM_PORTS.get(k) {
            Some(port) => *port,
            None => {
                *delay = delay.wrapping_add(slaves[current].ports[0].delay_to_next_dc);
                stack.pop();
                continue;
            }
        };
        if let Some(top) = stack.last_mut() {
            top.1 = k + 1;
        }
        let next_dc = match slaves[current].ports[port].next_slave {
            Some(next) => find_next_dc(slaves, index(next)),
            None => None,
        };
        if let Some(next_dc) = next_dc {
            if !visited[next_dc] {
                *delay = delay.wrapping_add(slaves[current].ports[port].delay_to_next_dc);
                visited[next_dc] = true;
                slaves[next_dc].transmission_delay = *delay;
                order.push(SlavePos::from(next_dc as u16));
                stack.push((next_dc, 0));
            }
        }
    }
}

/// Nearest upstream DC slave of `child` and its port leading towards it.
fn upstream_dc(slaves: &[Slave], child: usize) -> Option<(usize, usize)> {
    let mut current = child;
    loop {
        let up = index(slaves[current].ports[0].next_slave?);
        let towards = SlavePos::from(current as u16);
        let port = (1..MAX_PORTS).find(|p| slaves[up].ports[*p].next_slave == Some(towards))?;
        if slaves[up].base_dc_supported {
            return Some((up, port));
        }
        current = up;
    }
}

/// Computes the transmission delay of every DC slave relative to the
/// reference and returns the order in which the slaves were reached.
pub(crate) fn calc_transmission_delays(slaves: &mut [Slave], reference: usize) -> Vec<SlavePos> {
    let mut visited = vec![false; slaves.len()];
    let mut order = Vec::with_capacity(slaves.len());

    let mut delay = 0;
    walk_delays(slaves, reference, &mut delay, &mut visited, &mut order);

    // slaves before the reference are reached through their DC ancestors
    let mut child = reference;
    let mut base = 0u32;
    while let Some((parent, port)) = upstream_dc(slaves, child) {
        if visited[parent] {
            break;
        }
        base = base.wrapping_add(slaves[parent].ports[port].delay_to_next_dc);
        let mut delay = base;
        walk_delays(slaves, parent, &mut delay, &mut visited, &mut order);
        child = parent;
    }
    order
}

/// Selects the reference clock and recomputes topology and delays.
pub(crate) fn synchronize(
    slaves: &mut [Slave],
    configs: &[SlaveConfig],
    selected: Option<SlaveConfigIdx>,
) -> DcTopology {
    for slave in slaves.iter_mut() {
        slave.transmission_delay = 0;
        for port in slave.ports.iter_mut() {
            port.delay_to_next_dc = 0;
        }
    }
    let reference = match find_reference_clock(slaves, configs, selected) {
        Some(reference) => reference,
        None => {
            if !slaves.is_empty() {
                info!("No DC-capable slave found, bus stays unsynchronized");
            }
            return DcTopology::default();
        }
    };
    debug!("Using slave {} as DC reference clock", reference);

    if let Err(position) = calc_topology(slaves) {
        warn!(
            "Failed to calculate bus topology: open port at slave {} leads beyond the last slave",
            position
        );
        return DcTopology {
            reference: Some(SlavePos::from(reference as u16)),
            order: vec![],
        };
    }
    calc_port_delays(slaves);
    let order = calc_transmission_delays(slaves, reference);
    for pos in &order {
        let slave = &slaves[index(*pos)];
        debug!(
            "Slave {}: transmission delay {} ns",
            slave.ring_pos, slave.transmission_delay
        );
    }
    DcTopology {
        reference: Some(SlavePos::from(reference as u16)),
        order,
    }
}

/// Returns the new system time offset for a slave whose system time deviates
/// from the application time by more than `tolerance_ns`, or `None` to keep
/// `current_offset`.
pub fn correct_system_time_offset(
    current_offset: u64,
    app_time: u64,
    system_time: u64,
    tolerance_ns: u64,
) -> Option<u64> {
    let diff = app_time.wrapping_sub(system_time) as i64;
    if diff.unsigned_abs() > tolerance_ns {
        Some(current_offset.wrapping_add(diff as u64))
    } else {
        None
    }
}

#[cfg(test)]
use crate::slave::{SlavePort, SlavePortType};

/// A line of slaves with 100 ns per hop; the last slave closes the ring.
#[cfg(test)]
fn line(dc: &[bool]) -> Vec<Slave> {
    let n = dc.len() as u32;
    dc.iter()
        .enumerate()
        .map(|(i, has_dc)| {
            let i = i as u32;
            let mut slave = Slave::new(i as u16, SlaveId::default())
                .with_port(0, SlavePort::open(SlavePortType::EBus, 100 * i));
            if i + 1 < n {
                slave = slave.with_port(1, SlavePort::open(SlavePortType::EBus, 100 * (2 * n - 2 - i)));
            }
            if *has_dc {
                slave = slave.with_dc(true);
            }
            slave
        })
        .collect()
}

#[cfg(test)]
fn delays(slaves: &[Slave]) -> Vec<u32> {
    slaves.iter().map(|s| s.transmission_delay).collect()
}

#[test]
fn test_line_delays() {
    let mut slaves = line(&[true, true, true]);
    let topo = synchronize(&mut slaves, &[], None);
    assert_eq!(topo.reference, Some(SlavePos::from(0)));
    assert_eq!(delays(&slaves), vec![0, 100, 200]);
    assert_eq!(slaves[1].ports[0].next_slave, Some(SlavePos::from(0)));
    assert_eq!(slaves[1].ports[1].next_slave, Some(SlavePos::from(2)));
}

#[test]
fn test_delays_relative_to_later_reference() {
    let mut slaves = line(&[true, true, true]);
    let mut sc = SlaveConfig::new(0, SlaveAddr::ByPos(2), SlaveId::default());
    assert!(sc.attach(&mut slaves));
    let topo = synchronize(&mut slaves, &[sc], Some(0));
    assert_eq!(topo.reference, Some(SlavePos::from(2)));
    assert_eq!(delays(&slaves), vec![200, 100, 0]);
    assert_eq!(
        topo.order,
        vec![SlavePos::from(2), SlavePos::from(1), SlavePos::from(0)]
    );
}

#[test]
fn test_non_dc_slave_in_between() {
    let mut slaves = line(&[true, false, true]);
    synchronize(&mut slaves, &[], None);
    assert_eq!(delays(&slaves), vec![0, 0, 200]);
}

#[test]
fn test_branch_delays_include_return_path() {
    let mut slaves = vec![
        Slave::new(0, SlaveId::default())
            .with_dc(true)
            .with_port(3, SlavePort::open(SlavePortType::EBus, 200))
            .with_port(1, SlavePort::open(SlavePortType::EBus, 400)),
        Slave::new(1, SlaveId::default())
            .with_dc(true)
            .with_port(0, SlavePort::open(SlavePortType::EBus, 100)),
        Slave::new(2, SlaveId::default())
            .with_dc(true)
            .with_port(0, SlavePort::open(SlavePortType::EBus, 300)),
    ];
    synchronize(&mut slaves, &[], None);
    assert_eq!(slaves[0].ports[3].next_slave, Some(SlavePos::from(1)));
    assert_eq!(slaves[0].ports[1].next_slave, Some(SlavePos::from(2)));
    assert_eq!(delays(&slaves), vec![0, 100, 300]);
}

#[test]
fn test_fallback_to_first_dc_slave() {
    let mut slaves = line(&[false, true, true]);
    slaves[1].has_dc_system_time = false;

    // selected slave without system time
    let mut sc = SlaveConfig::new(0, SlaveAddr::ByPos(1), SlaveId::default());
    assert!(sc.attach(&mut slaves));
    assert_eq!(find_reference_clock(&slaves, &[sc.clone()], Some(0)), Some(2));

    // selected configuration without slave
    let orphan = SlaveConfig::new(1, SlaveAddr::ByPos(9), SlaveId::default());
    assert_eq!(find_reference_clock(&slaves, &[orphan], Some(1)), Some(2));

    // unknown configuration index
    assert_eq!(find_reference_clock(&slaves, &[sc], Some(7)), Some(2));
}

#[test]
fn test_no_dc_slave() {
    let mut slaves = line(&[false, false]);
    let topo = synchronize(&mut slaves, &[], None);
    assert_eq!(topo, DcTopology::default());
}

#[test]
fn test_inconsistent_topology() {
    let mut slaves = line(&[true, true]);
    slaves[1].ports[1] = SlavePort::open(SlavePortType::EBus, 500);
    assert_eq!(calc_topology(&mut slaves), Err(1));
    let topo = synchronize(&mut slaves, &[], None);
    assert_eq!(topo.reference, Some(SlavePos::from(0)));
    assert!(topo.order.is_empty());
    assert_eq!(delays(&slaves), vec![0, 0]);
}

#[test]
fn test_long_line() {
    let n = 20_000;
    let mut slaves = line(&vec![true; n]);
    let topo = synchronize(&mut slaves, &[], None);
    assert_eq!(topo.order.len(), n);
    assert_eq!(slaves[n - 1].transmission_delay, 100 * (n as u32 - 1));

    // a long stretch without DC between two DC slaves
    let mut dc = vec![false; n];
    dc[0] = true;
    dc[n - 1] = true;
    let mut slaves = line(&dc);
    let topo = synchronize(&mut slaves, &[], None);
    assert_eq!(topo.order, vec![SlavePos::from(0), SlavePos::from(n as u16 - 1)]);
    assert_eq!(slaves[n - 1].transmission_delay, 100 * (n as u32 - 1));
}

#[test]
fn test_offset_tolerance() {
    let app_time = 1_000_000_000;
    let tol = SYSTEM_TIME_TOLERANCE_NS;
    assert_eq!(correct_system_time_offset(5, app_time, app_time - 10_000, tol), None);
    assert_eq!(correct_system_time_offset(5, app_time, app_time + 10_000, tol), None);
    assert_eq!(
        correct_system_time_offset(5, app_time, app_time - 10_001, tol),
        Some(10_006)
    );
    assert_eq!(
        correct_system_time_offset(20_000, app_time, app_time + 10_001, tol),
        Some(9_999)
    );
}
