// Part of ethercat-rs. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! The slave registry: one record per device discovered by a bus scan.

use crate::types::*;
use derive_new::new;

/// Number of physical ports of an EtherCAT slave controller.
pub const MAX_PORTS: usize = 4;

/// Port processing order of a slave controller is 0 -> 3 -> 1 -> 2 -> 0.
const NEXT_PORT: [usize; MAX_PORTS] = [3, 2, 0, 1];
const PREV_PORT: [usize; MAX_PORTS] = [2, 3, 1, 0];

/// The ports behind port 0, in processing order.
pub(crate) const DOWNSTREAM_PORTS: [usize; MAX_PORTS - 1] = [3, 1, 2];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlavePortType {
    NotImplemented,
    NotConfigured,
    EBus,
    MII,
}

impl Default for SlavePortType {
    fn default() -> Self {
        SlavePortType::NotImplemented
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, new)]
pub struct SlavePortLink {
    pub link_up: bool,
    pub loop_closed: bool,
    pub signal_detected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlavePort {
    pub desc: SlavePortType,
    pub link: SlavePortLink,
    /// Local time the scan frame passed this port, latched by the slave.
    pub receive_time: u32,
    /// Slave connected to this port; on port 0 this is the upstream neighbour.
    pub next_slave: Option<SlavePos>,
    pub delay_to_next_dc: u32,
}

impl Default for SlavePort {
    fn default() -> Self {
        SlavePort::closed()
    }
}

impl SlavePort {
    /// A port with a link to another device.
    pub fn open(desc: SlavePortType, receive_time: u32) -> Self {
        Self {
            desc,
            link: SlavePortLink::new(true, false, true),
            receive_time,
            next_slave: None,
            delay_to_next_dc: 0,
        }
    }

    /// A port without link; frames are looped back internally.
    pub fn closed() -> Self {
        Self {
            desc: SlavePortType::NotImplemented,
            link: SlavePortLink::new(false, true, false),
            receive_time: 0,
            next_slave: None,
            delay_to_next_dc: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.link.loop_closed
    }
}

/// State of an Ethernet-over-EtherCAT tunnel provided by a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tunnel {
    None,
    Closed,
    Open,
}

impl Default for Tunnel {
    fn default() -> Self {
        Tunnel::None
    }
}

#[derive(Debug, Clone)]
pub struct Slave {
    pub ring_pos: u16,
    pub alias: u16,
    pub id: SlaveId,
    pub name: String,
    pub ports: [SlavePort; MAX_PORTS],
    pub base_dc_supported: bool,
    pub has_dc_system_time: bool,
    pub current_state: AlState,
    pub requested_state: AlState,
    /// Set when the slave must be configured from scratch on the next
    /// configuration pass, even if it already reports the requested state.
    pub force_config: bool,
    pub error_flag: bool,
    pub transmission_delay: u32,
    pub dc_system_time_offset: u64,
    pub tunnel: Tunnel,
    pub(crate) config: Option<SlaveConfigIdx>,
}

impl Slave {
    pub fn new(ring_pos: u16, id: SlaveId) -> Self {
        let mut ports = [SlavePort::closed(); MAX_PORTS];
        ports[0] = SlavePort::open(SlavePortType::EBus, 0);
        Self {
            ring_pos,
            alias: 0,
            id,
            name: String::new(),
            ports,
            base_dc_supported: false,
            has_dc_system_time: false,
            current_state: AlState::Init,
            requested_state: AlState::Preop,
            force_config: false,
            error_flag: false,
            transmission_delay: 0,
            dc_system_time_offset: 0,
            tunnel: Tunnel::None,
            config: None,
        }
    }

    pub fn with_alias(mut self, alias: u16) -> Self {
        self.alias = alias;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_owned();
        self
    }

    pub fn with_dc(mut self, has_system_time: bool) -> Self {
        self.base_dc_supported = true;
        self.has_dc_system_time = has_system_time;
        self
    }

    pub fn with_port(mut self, index: usize, port: SlavePort) -> Self {
        self.ports[index] = port;
        self
    }

    pub fn with_tunnel(mut self, tunnel: Tunnel) -> Self {
        self.tunnel = tunnel;
        self
    }

    pub fn position(&self) -> SlavePos {
        SlavePos::from(self.ring_pos)
    }

    /// Whether the slave can serve as DC reference clock.
    pub fn is_dc_capable(&self) -> bool {
        self.base_dc_supported && self.has_dc_system_time
    }

    pub fn config(&self) -> Option<SlaveConfigIdx> {
        self.config
    }

    pub fn has_open_tunnel(&self) -> bool {
        self.tunnel == Tunnel::Open
    }

    pub fn request_state(&mut self, state: AlState) {
        self.requested_state = state;
        self.error_flag = false;
    }

    /// Next open port after `port` in processing order; 0 when the walk is
    /// back at the upstream port.
    pub(crate) fn next_port(&self, mut port: usize) -> usize {
        for _ in 0..MAX_PORTS {
            port = NEXT_PORT[port];
            if self.ports[port].is_open() {
                return port;
            }
        }
        0
    }

    pub(crate) fn previous_port(&self, mut port: usize) -> usize {
        for _ in 0..MAX_PORTS {
            port = PREV_PORT[port];
            if self.ports[port].is_open() {
                return port;
            }
        }
        0
    }

    /// Sum of the round trip times measured between consecutive open ports.
    pub(crate) fn rtt_sum(&self) -> u32 {
        let mut sum = 0u32;
        let mut port = self.next_port(0);
        while port != 0 {
            let prev = self.previous_port(port);
            sum = sum.wrapping_add(
                self.ports[port]
                    .receive_time
                    .wrapping_sub(self.ports[prev].receive_time),
            );
            port = self.next_port(port);
        }
        sum
    }
}

/// Registry index of a ring position.
pub(crate) fn index(pos: SlavePos) -> usize {
    usize::from(u16::from(pos))
}

#[test]
fn test_port_order() {
    let slave = Slave::new(0, SlaveId::default())
        .with_port(1, SlavePort::open(SlavePortType::EBus, 100))
        .with_port(3, SlavePort::open(SlavePortType::EBus, 40));
    assert_eq!(slave.next_port(0), 3);
    assert_eq!(slave.next_port(3), 1);
    assert_eq!(slave.next_port(1), 0);
    assert_eq!(slave.previous_port(1), 3);
    assert_eq!(slave.previous_port(3), 0);
    // 40 from port 0 to 3, 60 from port 3 to 1
    assert_eq!(slave.rtt_sum(), 100);
}

#[test]
fn test_rtt_sum_wraps() {
    let slave = Slave::new(0, SlaveId::default())
        .with_port(0, SlavePort::open(SlavePortType::EBus, u32::MAX - 9))
        .with_port(1, SlavePort::open(SlavePortType::EBus, 10));
    assert_eq!(slave.rtt_sum(), 20);
}

#[test]
fn test_end_of_line() {
    let slave = Slave::new(4, SlaveId::default()).with_dc(true);
    assert_eq!(slave.next_port(0), 0);
    assert_eq!(slave.rtt_sum(), 0);
    assert!(slave.is_dc_capable());
    assert_eq!(slave.position(), SlavePos::from(4));
}
