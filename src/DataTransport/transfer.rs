//! Transfers: ordered bundles of primitive copy requests.
//!
//! A [`Transfer`] is built once as a template and re-run for every hand-off
//! it covers. Requests run strictly one after another: request `n + 1` is
//! posted only after request `n` reports complete.

use crate::error::{Result, TransportError};
use crate::Core::endpoint::Endpoint;
use crate::Core::xfer::XferRequest;
use crate::DataTransport::Buffer::{InputRef, OutputRef};
use crate::DataTransport::Structs::Buffer_Structs::{BufferMetaData, PartShape};
use std::collections::HashMap;
use std::sync::Arc;

/// Upper bound on primitive requests in one transfer.
pub const MAX_REQUESTS_PER_TRANSFER: usize = 4;

pub type TransferId = usize;

/// Metadata fields overridden for one hand-off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetaPatch {
    pub n_parts_per_whole: Option<u32>,
    pub parts_sequence: Option<u32>,
    pub end_of_whole: Option<bool>,
    pub shape: Option<PartShape>,
    pub zero_copy: Option<bool>,
}

impl MetaPatch {
    pub fn apply(&self, meta: &mut BufferMetaData) {
        if let Some(v) = self.n_parts_per_whole {
            meta.n_parts_per_whole = v;
        }
        if let Some(v) = self.parts_sequence {
            meta.parts_sequence = v;
        }
        if let Some(v) = self.end_of_whole {
            meta.end_of_whole = v as u8;
        }
        if let Some(v) = self.shape {
            meta.shape = v;
        }
        if let Some(v) = self.zero_copy {
            meta.zero_copy = v as u8;
        }
    }
}

/// Metadata staged for a transfer right before its requests run.
///
/// The output buffer's header at `source` is copied to `staging`, patched,
/// and the transfer's MetaData copy reads from `staging`.
#[derive(Debug, Clone)]
pub struct PresetMeta {
    pub endpoint: Arc<Endpoint>,
    pub source: u64,
    pub staging: u64,
    pub patch: MetaPatch,
}

impl PresetMeta {
    fn apply(&self) -> Result<()> {
        let mut meta: BufferMetaData = self.endpoint.read(self.source)?;
        self.patch.apply(&mut meta);
        self.endpoint.write(self.staging, &meta)
    }
}

/// A zero-copy attachment made when the transfer starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZeroCopyPair {
    pub output: OutputRef,
    pub input: InputRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferState {
    Idle,
    Running(usize),
    Complete,
}

pub struct Transfer {
    requests: Vec<Box<dyn XferRequest>>,
    presets: Vec<PresetMeta>,
    zero_copy: Vec<ZeroCopyPair>,
    gated: Vec<TransferId>,
    state: TransferState,
}

impl Default for Transfer {
    fn default() -> Self {
        Self::new()
    }
}

impl Transfer {
    pub fn new() -> Self {
        Self {
            requests: Vec::new(),
            presets: Vec::new(),
            zero_copy: Vec::new(),
            gated: Vec::new(),
            state: TransferState::Idle,
        }
    }

    pub fn add_request(&mut self, request: Box<dyn XferRequest>) -> Result<()> {
        if self.requests.len() >= MAX_REQUESTS_PER_TRANSFER {
            return Err(TransportError::CapacityExceeded {
                what: "requests per transfer",
                limit: MAX_REQUESTS_PER_TRANSFER,
            });
        }
        self.requests.push(request);
        Ok(())
    }

    pub fn add_preset(&mut self, preset: PresetMeta) {
        self.presets.push(preset);
    }

    pub fn add_zero_copy(&mut self, pair: ZeroCopyPair) {
        self.zero_copy.push(pair);
    }

    pub fn zero_copy_pairs(&self) -> &[ZeroCopyPair] {
        &self.zero_copy
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, TransferState::Running(_))
    }

    /// Apply presets and post the first request.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(TransportError::state("transfer template is already running"));
        }
        for request in &mut self.requests {
            request.reset();
        }
        self.gated.clear();
        for preset in &self.presets {
            preset.apply()?;
        }
        match self.requests.first_mut() {
            Some(first) => {
                first.post()?;
                self.state = TransferState::Running(0);
            }
            None => self.state = TransferState::Complete,
        }
        Ok(())
    }

    /// Advance the request sequence. True once every request completed;
    /// gated successors are checked by the arena.
    fn progress_requests(&mut self) -> Result<bool> {
        loop {
            match self.state {
                TransferState::Idle | TransferState::Complete => return Ok(true),
                TransferState::Running(index) => {
                    if !self.requests[index].is_complete()? {
                        return Ok(false);
                    }
                    let next = index + 1;
                    if next < self.requests.len() {
                        self.requests[next].post()?;
                        self.state = TransferState::Running(next);
                    } else {
                        self.state = TransferState::Complete;
                    }
                }
            }
        }
    }

    /// Forward an offset change to every request.
    pub fn retarget(&mut self, new: &[u64], old: &[u64]) -> Result<usize> {
        let mut changed = 0;
        for request in &mut self.requests {
            changed += request.modify(new, old)?;
        }
        Ok(changed)
    }
}

/// Index of a gated successor: piece sequence, input port, input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GateKey {
    pub sequence: usize,
    pub port: usize,
    pub buffer: usize,
}

/// Owner of every transfer template of one controller.
pub struct TransferArena {
    slots: Vec<Transfer>,
    gates: HashMap<GateKey, TransferId>,
    limit: usize,
}

impl TransferArena {
    pub fn new(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            gates: HashMap::new(),
            limit,
        }
    }

    pub fn insert(&mut self, transfer: Transfer) -> Result<TransferId> {
        if self.slots.len() >= self.limit {
            return Err(TransportError::CapacityExceeded {
                what: "transfer templates",
                limit: self.limit,
            });
        }
        self.slots.push(transfer);
        Ok(self.slots.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, id: TransferId) -> Result<&Transfer> {
        let count = self.slots.len();
        self.slots.get(id).ok_or(TransportError::UnknownPort {
            what: "transfer",
            index: id,
            count,
        })
    }

    fn get_mut(&mut self, id: TransferId) -> Result<&mut Transfer> {
        let count = self.slots.len();
        self.slots.get_mut(id).ok_or(TransportError::UnknownPort {
            what: "transfer",
            index: id,
            count,
        })
    }

    pub fn start(&mut self, id: TransferId) -> Result<()> {
        self.get_mut(id)?.start()
    }

    /// Start `successor` as a gated follow-up of `primary`.
    pub fn chain(&mut self, primary: TransferId, key: GateKey, successor: TransferId) -> Result<()> {
        if primary == successor {
            return Err(TransportError::state("a transfer cannot gate itself"));
        }
        if let Some(existing) = self.gates.get(&key) {
            return Err(TransportError::state(format!(
                "gate {:?} already held by transfer {}",
                key, existing
            )));
        }
        self.get(primary)?;
        self.start(successor)?;
        self.gates.insert(key, successor);
        self.get_mut(primary)?.gated.push(successor);
        Ok(())
    }

    pub fn gate(&self, key: &GateKey) -> Option<TransferId> {
        self.gates.get(key).copied()
    }

    /// Pending gated successors of `id`.
    pub fn pending_gated(&self, id: TransferId) -> usize {
        self.slots.get(id).map(|t| t.gated.len()).unwrap_or(0)
    }

    /// Advance `id` and its gated successors. True once the transfer and
    /// every successor it still waits on are complete; finished successors
    /// leave the pending set.
    pub fn progress(&mut self, id: TransferId) -> Result<bool> {
        let own = self.get_mut(id)?.progress_requests()?;
        let gated = std::mem::take(&mut self.get_mut(id)?.gated);
        let mut pending = Vec::with_capacity(gated.len());
        for successor in gated {
            if self.progress(successor)? {
                self.gates.retain(|_, v| *v != successor);
            } else {
                pending.push(successor);
            }
        }
        let transfer = self.get_mut(id)?;
        transfer.gated = pending;
        Ok(own && transfer.gated.is_empty())
    }

    /// Re-target every template.
    pub fn retarget_all(&mut self, new: &[u64], old: &[u64]) -> Result<usize> {
        let mut changed = 0;
        for transfer in &mut self.slots {
            changed += transfer.retarget(new, old)?;
        }
        Ok(changed)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transfer> {
        self.slots.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Core::endpoint::EndpointDescriptor;
    use crate::Core::xfer::{MemcpyXferFactory, XferFactory, XferKind};

    fn endpoint(address: &str, mailbox: u16) -> Arc<Endpoint> {
        let d = EndpointDescriptor::parse(&format!("dmxp-heap:{};1048576.{}.1024", address, mailbox))
            .unwrap();
        Endpoint::create(d).unwrap()
    }

    fn copy_transfer(ep: &Arc<Endpoint>, latency: u32, src: u64, dst: u64) -> Transfer {
        let services = MemcpyXferFactory::with_latency(latency).services(ep, ep).unwrap();
        let mut t = Transfer::new();
        let mut req = services.create_request();
        req.copy(src, dst, 8, XferKind::Data).unwrap();
        t.add_request(req).unwrap();
        t
    }

    #[test]
    fn complete_waits_for_gated_successors() {
        let ep = endpoint("transfer-gated", 921);
        let a = ep.alloc(128).unwrap();
        let b = ep.alloc(128).unwrap();
        let mut arena = TransferArena::new(8);
        let primary = arena.insert(copy_transfer(&ep, 0, a, b)).unwrap();
        let successor = arena.insert(copy_transfer(&ep, 3, a, b)).unwrap();

        arena.start(primary).unwrap();
        let key = GateKey { sequence: 1, port: 0, buffer: 1 };
        arena.chain(primary, key, successor).unwrap();
        assert_eq!(arena.gate(&key), Some(successor));
        assert!(arena.chain(primary, key, successor).is_err());

        assert!(!arena.progress(primary).unwrap());
        assert!(!arena.progress(primary).unwrap());
        assert!(arena.progress(primary).unwrap());
        assert_eq!(arena.pending_gated(primary), 0);
        assert_eq!(arena.gate(&key), None);
    }

    #[test]
    fn request_bound_is_enforced() {
        let ep = endpoint("transfer-bound", 922);
        let services = MemcpyXferFactory::new().services(&ep, &ep).unwrap();
        let mut t = Transfer::new();
        for _ in 0..MAX_REQUESTS_PER_TRANSFER {
            t.add_request(services.create_request()).unwrap();
        }
        assert!(matches!(
            t.add_request(services.create_request()),
            Err(TransportError::CapacityExceeded { .. })
        ));

        let mut arena = TransferArena::new(1);
        arena.insert(Transfer::new()).unwrap();
        assert!(arena.insert(Transfer::new()).is_err());
    }
}
