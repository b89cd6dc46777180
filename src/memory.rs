// Part of ethercat-rs. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Shared process data memory.
//!
//! All domains without an external buffer live in one anonymous mapping,
//! sliced in domain registration order. The mapping is owned by the master;
//! the cyclic task gets a [`ProcessDataView`] holding a second reference, so
//! the bytes stay valid until both the master has dropped the mapping and
//! the view is gone.

use crate::{domain::Domain, types::*};
use log::{debug, warn};
use std::{fmt, slice, sync::Arc};

enum Storage {
    Mapped(memmap::MmapMut),
    External(Box<[u8]>),
}

/// A block of process data bytes, addressed through its base pointer only.
pub(crate) struct ProcessData {
    storage: Storage,
    base: *mut u8,
    size: usize,
}

// The bytes are only written through the single ProcessDataView handed out
// per mapping; the master itself never dereferences the base pointer.
unsafe impl Send for ProcessData {}
unsafe impl Sync for ProcessData {}

impl ProcessData {
    pub(crate) fn allocate(size: usize) -> Result<Arc<Self>> {
        let mut map = memmap::MmapMut::map_anon(size).map_err(|e| {
            warn!("Failed to map {} bytes of process data: {}", size, e);
            Error::OutOfMemory(size)
        })?;
        // Fault the first page in before the first cycle touches it.
        map[0] = 0;
        let base = map.as_mut_ptr();
        Ok(Arc::new(Self {
            storage: Storage::Mapped(map),
            base,
            size,
        }))
    }

    pub(crate) fn external(mut buffer: Box<[u8]>) -> Arc<Self> {
        let base = buffer.as_mut_ptr();
        let size = buffer.len();
        Arc::new(Self {
            storage: Storage::External(buffer),
            base,
            size,
        })
    }

    pub(crate) fn address(&self) -> usize {
        self.base as usize
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// # Safety
    ///
    /// The caller must be the only one accessing these bytes for the
    /// lifetime of the returned slice.
    unsafe fn bytes(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.size);
        slice::from_raw_parts_mut(self.base.add(offset), len)
    }
}

impl fmt::Debug for ProcessData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.storage {
            Storage::Mapped(_) => "mapped",
            Storage::External(_) => "external",
        };
        f.debug_struct("ProcessData")
            .field("address", &format_args!("0x{:x}", self.address()))
            .field("size", &self.size)
            .field("kind", &format_args!("{}", kind))
            .finish()
    }
}

/// Process data of all domains, once it is set up.
#[derive(Debug, Default)]
pub(crate) struct Binding {
    /// The mapping shared by all domains without an external buffer.
    pub shared: Option<Arc<ProcessData>>,
    /// Whether a view has been handed out for this mapping.
    pub view_issued: bool,
}

impl Binding {
    pub fn address(&self) -> usize {
        self.shared.as_ref().map_or(0, |data| data.address())
    }
}

/// Sum of the image sizes of all domains that use the shared mapping.
pub(crate) fn total_size(domains: &[Domain]) -> usize {
    domains
        .iter()
        .filter(|d| !d.is_external())
        .map(Domain::size)
        .sum()
}

/// Maps the process data for all domains unless it is already mapped.
///
/// A repeated call leaves the mapping alone and reports size 0 with the
/// existing address; an empty configuration maps nothing and reports 0 too.
/// On failure no domain is bound and `memory` stays untouched.
pub(crate) fn setup(domains: &mut [Domain], memory: &mut Option<Binding>) -> Result<MemorySetup> {
    if let Some(binding) = memory {
        debug!("Process data already set up at 0x{:x}", binding.address());
        return Ok(MemorySetup {
            address: binding.address(),
            size: 0,
        });
    }
    for domain in domains.iter() {
        if let Some(buffer) = domain.external() {
            if buffer.size() < domain.size() {
                warn!(
                    "External buffer of domain {} holds {} bytes, {} needed",
                    usize::from(domain.index()),
                    buffer.size(),
                    domain.size()
                );
                return Err(Error::BufferTooSmall(
                    usize::from(domain.index()),
                    domain.size(),
                ));
            }
        }
    }
    let size = total_size(domains);
    let shared = if size > 0 {
        Some(ProcessData::allocate(size)?)
    } else {
        None
    };
    let mut offset = 0;
    for domain in domains.iter_mut().filter(|d| !d.is_external()) {
        domain.offset = Some(offset);
        offset += domain.size();
    }
    let address = shared.as_ref().map_or(0, |data| data.address());
    if size > 0 {
        debug!("Mapped {} bytes of process data at 0x{:x}", size, address);
    }
    *memory = Some(Binding {
        shared,
        view_issued: false,
    });
    Ok(MemorySetup { address, size })
}

struct DomainView {
    idx: DomainIdx,
    data: Arc<ProcessData>,
    placement: DomainDataPlacement,
    expected_wc: u32,
}

/// Lock-free access to the process data for the cyclic task.
pub struct ProcessDataView {
    shared: Option<Arc<ProcessData>>,
    domains: Vec<DomainView>,
}

impl ProcessDataView {
    pub(crate) fn new(shared: Option<Arc<ProcessData>>, domains: &[Domain]) -> Self {
        let domains = domains
            .iter()
            .filter_map(|d| {
                let placement = d.placement()?;
                let data = match d.external() {
                    Some(buffer) => buffer.clone(),
                    None => shared.clone()?,
                };
                Some(DomainView {
                    idx: d.index(),
                    data,
                    placement,
                    expected_wc: d.expected_working_counter(),
                })
            })
            .collect();
        Self { shared, domains }
    }

    /// Address of the shared mapping, 0 if every domain has its own buffer.
    pub fn address(&self) -> usize {
        self.shared.as_ref().map_or(0, |data| data.address())
    }

    pub fn size(&self) -> usize {
        self.shared.as_ref().map_or(0, |data| data.size())
    }

    fn lookup(&self, idx: DomainIdx) -> Result<&DomainView> {
        self.domains
            .iter()
            .find(|d| d.idx == idx)
            .ok_or_else(|| Error::DomainIdx(usize::from(idx)))
    }

    /// The whole shared process data image.
    pub fn data(&mut self) -> &mut [u8] {
        match &self.shared {
            // SAFETY: the view is unique per mapping and borrowed mutably.
            Some(data) => unsafe { data.bytes(0, data.size()) },
            None => &mut [],
        }
    }

    /// The image of one domain, in the shared mapping or its own buffer.
    pub fn domain_data(&mut self, idx: DomainIdx) -> Result<&mut [u8]> {
        let d = self.lookup(idx)?;
        // SAFETY: as in `data`; domain images do not overlap.
        Ok(unsafe { d.data.bytes(d.placement.offset, d.placement.size) })
    }

    /// Evaluates the working counter reported for a domain's last exchange.
    pub fn domain_state(&self, idx: DomainIdx, working_counter: u32) -> Result<DomainState> {
        let d = self.lookup(idx)?;
        Ok(DomainState {
            working_counter,
            wc_state: WcState::new(working_counter, d.expected_wc),
        })
    }
}

impl fmt::Debug for ProcessDataView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessDataView")
            .field("address", &format_args!("0x{:x}", self.address()))
            .field("size", &self.size())
            .field("domains", &self.domains.len())
            .finish()
    }
}

#[cfg(test)]
fn domains(sizes: &[u8]) -> Vec<Domain> {
    sizes
        .iter()
        .enumerate()
        .map(|(i, bits)| {
            let mut d = Domain::new(DomainIdx::from(i));
            if *bits > 0 {
                d.register_pdo_entry(i as u32, false, *bits, SyncDirection::Input)
                    .unwrap();
            }
            d
        })
        .collect()
}

#[test]
fn test_setup_is_idempotent() {
    let mut ds = domains(&[16, 8, 32]);
    let mut memory = None;
    let first = setup(&mut ds, &mut memory).unwrap();
    assert_eq!(first.size, 7);
    assert_ne!(first.address, 0);
    let offsets: Vec<_> = ds.iter().map(|d| d.offset()).collect();
    assert_eq!(offsets, vec![Some(0), Some(2), Some(3)]);

    let second = setup(&mut ds, &mut memory).unwrap();
    assert_eq!(second.size, 0);
    assert_eq!(second.address, first.address);
}

#[test]
fn test_setup_empty() {
    let mut ds = domains(&[0, 0]);
    let mut memory = None;
    assert_eq!(setup(&mut ds, &mut memory).unwrap(), MemorySetup::default());
    assert!(memory.unwrap().shared.is_none());
}

#[test]
fn test_allocation_failure() {
    assert!(matches!(
        ProcessData::allocate(usize::MAX),
        Err(Error::OutOfMemory(usize::MAX))
    ));
}

#[test]
fn test_view_slices_domains() {
    let mut ds = domains(&[16, 8]);
    let mut memory = None;
    setup(&mut ds, &mut memory).unwrap();
    let shared = memory.and_then(|m| m.shared);
    let mut view = ProcessDataView::new(shared, &ds);
    view.domain_data(DomainIdx::from(1)).unwrap()[0] = 0xA5;
    assert_eq!(&view.data()[..], &[0u8, 0, 0xA5][..]);
    assert_eq!(view.domain_data(DomainIdx::from(0)).unwrap().len(), 2);
    assert!(matches!(
        view.domain_data(DomainIdx::from(9)),
        Err(Error::DomainIdx(9))
    ));
    let state = view.domain_state(DomainIdx::from(0), 1).unwrap();
    assert_eq!(state.wc_state, WcState::Complete);
}

#[test]
fn test_external_domain_is_not_mapped() {
    let mut ds = domains(&[16, 8, 32]);
    ds[1].bind_external(ProcessData::external(vec![0; 4].into_boxed_slice()));
    let mut memory = None;
    let setup = setup(&mut ds, &mut memory).unwrap();
    assert_eq!(setup.size, 6);
    let offsets: Vec<_> = ds.iter().map(|d| d.offset()).collect();
    assert_eq!(offsets, vec![Some(0), None, Some(2)]);

    let mut view = ProcessDataView::new(memory.and_then(|m| m.shared), &ds);
    view.domain_data(DomainIdx::from(1)).unwrap()[0] = 0x11;
    assert_eq!(view.domain_data(DomainIdx::from(1)).unwrap().len(), 1);
    assert!(view.data().iter().all(|b| *b == 0));
    assert_eq!(view.domain_data(DomainIdx::from(2)).unwrap().len(), 4);
}

#[test]
fn test_external_buffer_too_small() {
    let mut ds = domains(&[16, 32]);
    ds[1].bind_external(ProcessData::external(vec![0; 2].into_boxed_slice()));
    let mut memory = None;
    assert!(matches!(
        setup(&mut ds, &mut memory),
        Err(Error::BufferTooSmall(1, 4))
    ));
    assert!(memory.is_none());
    assert!(ds.iter().all(|d| d.offset().is_none()));
}
