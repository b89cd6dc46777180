// Part of ethercat-rs. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! States of the master state machine.

use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    /// Nothing scanned yet.
    Idle,
    /// Waiting for the bus scan result.
    Scanning,
    /// Attaching slave configurations to the scanned slaves.
    Configuring,
    /// Mapping the process data of all domains.
    DomainSetup,
    /// Selecting the reference clock and computing delays and offsets.
    DcCalc,
    /// Configured, waiting for activation.
    Ready,
    Active,
    /// Bringing the slaves to PREOP ahead of deactivation.
    DeactivatingSlaves,
    /// Deactivated; slaves are held in PREOP.
    Inactive,
}

impl FsmState {
    /// Whether a transition from `self` to `next` is part of the machine.
    pub fn can_enter(self, next: FsmState) -> bool {
        use FsmState::*;
        match (self, next) {
            (_, Scanning) => true,
            (Idle | Scanning | Configuring | DcCalc | Ready | Inactive, DomainSetup) => true,
            (Scanning | DomainSetup, Configuring) => true,
            (Configuring, DcCalc) => true,
            (DcCalc, Ready | Active | Inactive) => true,
            (Active, DeactivatingSlaves) | (DeactivatingSlaves, Active) => true,
            (Active | DeactivatingSlaves, Inactive) => true,
            _ => false,
        }
    }

    /// States in which slave state requests are carried out.
    pub fn is_operational(self) -> bool {
        matches!(
            self,
            FsmState::Ready | FsmState::Active | FsmState::DeactivatingSlaves | FsmState::Inactive
        )
    }
}

impl Default for FsmState {
    fn default() -> Self {
        FsmState::Idle
    }
}

#[derive(Debug, Default)]
pub(crate) struct Fsm {
    state: FsmState,
}

impl Fsm {
    pub fn state(&self) -> FsmState {
        self.state
    }

    pub fn enter(&mut self, next: FsmState) {
        if self.state == next {
            return;
        }
        debug_assert!(
            self.state.can_enter(next),
            "invalid transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!("Master state {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

#[test]
fn test_transitions() {
    use FsmState::*;
    assert!(Scanning.can_enter(Configuring));
    assert!(Configuring.can_enter(DcCalc));
    assert!(DcCalc.can_enter(Active));
    assert!(Active.can_enter(DeactivatingSlaves));
    assert!(DeactivatingSlaves.can_enter(Active));
    assert!(Active.can_enter(Inactive));
    assert!(!Scanning.can_enter(DcCalc));
    assert!(!Ready.can_enter(Active));
    assert!(!Inactive.can_enter(DeactivatingSlaves));
    assert!(Ready.can_enter(DomainSetup));
    assert!(DomainSetup.can_enter(Configuring));
    assert!(!Active.can_enter(DomainSetup));
}

#[test]
fn test_enter() {
    let mut fsm = Fsm::default();
    assert_eq!(fsm.state(), FsmState::Idle);
    fsm.enter(FsmState::Scanning);
    fsm.enter(FsmState::Configuring);
    fsm.enter(FsmState::DcCalc);
    fsm.enter(FsmState::Ready);
    assert_eq!(fsm.state(), FsmState::Ready);
    assert!(fsm.state().is_operational());
}
