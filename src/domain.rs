// Part of ethercat-rs. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Process data domains.
//!
//! A domain collects the PDO entries registered by slave configurations into
//! one contiguous image. Entries of one configuration are packed into an
//! FMMU region; with overlapping PDOs enabled, the inputs and outputs of a
//! configuration share the same bytes.
//!
//! A domain either gets a slice of the shared process data mapping or keeps
//! its image in a buffer supplied by the application.

use crate::{memory::ProcessData, types::*};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct FmmuRegion {
    config: SlaveConfigIdx,
    start: usize,
    output_bits: usize,
    input_bits: usize,
    overlapping: bool,
}

impl FmmuRegion {
    fn size(&self) -> usize {
        let bits = if self.overlapping {
            self.output_bits.max(self.input_bits)
        } else {
            self.output_bits + self.input_bits
        };
        (bits + 7) / 8
    }

    fn cursor(&self, direction: SyncDirection) -> usize {
        match (self.overlapping, direction) {
            (true, SyncDirection::Output) => self.output_bits,
            (true, SyncDirection::Input) => self.input_bits,
            (false, _) => self.output_bits + self.input_bits,
        }
    }

    fn working_counter(&self) -> u32 {
        let mut wc = 0;
        if self.output_bits > 0 {
            wc += 2;
        }
        if self.input_bits > 0 {
            wc += 1;
        }
        wc
    }
}

#[derive(Debug, Clone)]
pub struct Domain {
    idx: DomainIdx,
    regions: Vec<FmmuRegion>,
    data_size: usize,
    /// Offset into the shared process data, once the memory is set up.
    pub(crate) offset: Option<usize>,
    external: Option<Arc<ProcessData>>,
    logical_base_address: Option<u32>,
}

impl Domain {
    pub(crate) fn new(idx: DomainIdx) -> Self {
        Self {
            idx,
            regions: vec![],
            data_size: 0,
            offset: None,
            external: None,
            logical_base_address: None,
        }
    }

    pub fn index(&self) -> DomainIdx {
        self.idx
    }

    pub fn size(&self) -> usize {
        self.data_size
    }

    pub fn offset(&self) -> Option<usize> {
        self.offset
    }

    pub fn is_external(&self) -> bool {
        self.external.is_some()
    }

    /// Address of the application-supplied buffer, if any.
    pub fn external_address(&self) -> Option<usize> {
        self.external.as_ref().map(|data| data.address())
    }

    pub(crate) fn external(&self) -> Option<&Arc<ProcessData>> {
        self.external.as_ref()
    }

    pub(crate) fn bind_external(&mut self, data: Arc<ProcessData>) {
        self.external = Some(data);
    }

    pub fn logical_base_address(&self) -> Option<u32> {
        self.logical_base_address
    }

    pub fn expected_working_counter(&self) -> u32 {
        self.regions.iter().map(FmmuRegion::working_counter).sum()
    }

    pub fn state(&self, working_counter: u32) -> DomainState {
        DomainState {
            working_counter,
            wc_state: WcState::new(working_counter, self.expected_working_counter()),
        }
    }

    /// Where the image lives in its backing memory, once that is known.
    pub(crate) fn placement(&self) -> Option<DomainDataPlacement> {
        let offset = if self.external.is_some() {
            0
        } else {
            self.offset?
        };
        Some(DomainDataPlacement {
            offset,
            size: self.data_size,
        })
    }

    /// Places a PDO entry of `bit_len` bits and returns its position in the
    /// domain image. Fails once the image is bound to memory.
    pub(crate) fn register_pdo_entry(
        &mut self,
        config: SlaveConfigIdx,
        overlapping: bool,
        bit_len: u8,
        direction: SyncDirection,
    ) -> Result<Offset> {
        if self.offset.is_some() {
            return Err(Error::Busy);
        }
        let reuse = matches!(self.regions.last(), Some(r) if r.config == config);
        if !reuse {
            self.regions.push(FmmuRegion {
                config,
                start: self.data_size,
                output_bits: 0,
                input_bits: 0,
                overlapping,
            });
        }
        let last = self.regions.len() - 1;
        let region = &mut self.regions[last];
        let bit_pos = region.cursor(direction);
        match direction {
            SyncDirection::Output => region.output_bits += usize::from(bit_len),
            SyncDirection::Input => region.input_bits += usize::from(bit_len),
        }
        let offset = Offset {
            byte: region.start + bit_pos / 8,
            bit: (bit_pos % 8) as u32,
        };
        self.data_size = region.start + region.size();
        Ok(offset)
    }

    pub(crate) fn finish(&mut self, logical_base_address: u32) {
        self.logical_base_address = Some(logical_base_address);
    }
}

#[test]
fn test_register_entries() {
    let mut domain = Domain::new(DomainIdx::from(0));
    let o = domain.register_pdo_entry(0, false, 16, SyncDirection::Output).unwrap();
    assert_eq!((o.byte, o.bit), (0, 0));
    let o = domain.register_pdo_entry(0, false, 1, SyncDirection::Input).unwrap();
    assert_eq!((o.byte, o.bit), (2, 0));
    let o = domain.register_pdo_entry(0, false, 1, SyncDirection::Input).unwrap();
    assert_eq!((o.byte, o.bit), (2, 1));
    assert_eq!(domain.size(), 3);

    let o = domain.register_pdo_entry(1, false, 32, SyncDirection::Input).unwrap();
    assert_eq!((o.byte, o.bit), (3, 0));
    assert_eq!(domain.size(), 7);
    assert_eq!(domain.expected_working_counter(), 3 + 1);
}

#[test]
fn test_overlapping_entries_share_bytes() {
    let mut domain = Domain::new(DomainIdx::from(0));
    let out = domain.register_pdo_entry(5, true, 32, SyncDirection::Output).unwrap();
    let inp = domain.register_pdo_entry(5, true, 16, SyncDirection::Input).unwrap();
    assert_eq!(out.byte, 0);
    assert_eq!(inp.byte, 0);
    assert_eq!(domain.size(), 4);
    let inp = domain.register_pdo_entry(5, true, 32, SyncDirection::Input).unwrap();
    assert_eq!(inp.byte, 2);
    assert_eq!(domain.size(), 6);
}

#[test]
fn test_bound_domain_is_fixed() {
    let mut domain = Domain::new(DomainIdx::from(1));
    domain.register_pdo_entry(0, false, 8, SyncDirection::Output).unwrap();
    domain.offset = Some(0);
    assert!(matches!(
        domain.register_pdo_entry(0, false, 8, SyncDirection::Output),
        Err(Error::Busy)
    ));
    assert_eq!(domain.placement(), Some(DomainDataPlacement { offset: 0, size: 1 }));
    assert_eq!(domain.state(0).wc_state, WcState::Zero);
    assert_eq!(domain.state(2).wc_state, WcState::Complete);
}

#[test]
fn test_external_domain_placement() {
    let mut domain = Domain::new(DomainIdx::from(0));
    domain.register_pdo_entry(0, false, 16, SyncDirection::Input).unwrap();
    assert_eq!(domain.placement(), None);
    let buffer = ProcessData::external(vec![0; 8].into_boxed_slice());
    let address = buffer.address();
    domain.bind_external(buffer);
    assert!(domain.is_external());
    assert_eq!(domain.external_address(), Some(address));
    assert_eq!(domain.placement(), Some(DomainDataPlacement { offset: 0, size: 2 }));
}
