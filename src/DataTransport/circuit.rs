//! Circuits: one output PortSet feeding zero or more input PortSets.
//!
//! A circuit is `Open` while its ports are still being defined and
//! `Closed` once every port has a location. It becomes ready when every
//! port finished its definition; at that point one controller is bound to
//! each (output, input) PortSet pair and the data path is live. Until
//! then data-path calls are no-ops.

use crate::error::{Result, TransportError};
use crate::Core::endpoint::Endpoint;
use crate::Core::xfer::XferFactory;
use crate::DataTransport::builder::PortSetDescriptor;
use crate::DataTransport::controller::{Controller, ControllerKey, ControllerSettings, Issue};
use crate::DataTransport::port::{ExternalState, Role};
use crate::DataTransport::port_set::PortSet;
use crate::DataTransport::Buffer::{InputRef, OutputRef, ZeroCopyLink};
use crate::DataTransport::Structs::Buffer_Structs::{BufferMetaData, FLAG_EMPTY};
use crate::DataTransport::Structs::Mailbox_Structs::{BufferOffsetsWire, PortOffsetsWire};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Ports are still being defined.
    Open,
    /// Every port has a location.
    Closed,
}

/// Outcome of [`Circuit::produce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProduceStatus {
    /// The circuit is not ready; nothing happened.
    Ignored,
    /// Every input PortSet accepted the buffer.
    Issued {
        /// Further pieces that start as their destinations free up.
        gated_remaining: usize,
    },
    /// At least one input PortSet queued the buffer.
    Queued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueuedBuffer {
    buffer: usize,
    broadcast: bool,
}

/// A full input buffer of one circuit re-sent through an output port of
/// another circuit without copying its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZeroCopyForward {
    pub source_circuit: u32,
    pub source: InputRef,
    /// Endpoint offset of the source buffer's data.
    pub data_offset: u64,
    pub metadata: BufferMetaData,
    /// Output port of the target circuit.
    pub port: usize,
}

pub struct Circuit {
    id: u32,
    state: CircuitState,
    ready: bool,
    ref_count: usize,
    endpoint: Arc<Endpoint>,
    factory: Arc<dyn XferFactory>,
    settings: ControllerSettings,
    output: PortSet,
    inputs: Vec<PortSet>,
    controllers: Vec<Controller>,
    /// FIFO per (output port, input PortSet).
    queues: Vec<Vec<VecDeque<QueuedBuffer>>>,
    forward_queue: VecDeque<ZeroCopyForward>,
    forwarded: HashMap<OutputRef, ZeroCopyForward>,
    drained: Vec<ZeroCopyForward>,
    /// (output port, input port) pairs a remote producer has announced.
    updates: HashSet<(usize, usize)>,
}

impl Circuit {
    fn with_sets(
        id: u32,
        state: CircuitState,
        endpoint: &Arc<Endpoint>,
        factory: Arc<dyn XferFactory>,
        settings: ControllerSettings,
        output: PortSet,
        inputs: Vec<PortSet>,
    ) -> Self {
        let queues = (0..output.ports.len())
            .map(|_| (0..inputs.len()).map(|_| VecDeque::new()).collect())
            .collect();
        Self {
            id,
            state,
            ready: false,
            ref_count: 1,
            endpoint: endpoint.clone(),
            factory,
            settings,
            output,
            inputs,
            controllers: Vec::new(),
            queues,
            forward_queue: VecDeque::new(),
            forwarded: HashMap::new(),
            drained: Vec::new(),
            updates: HashSet::new(),
        }
    }

    /// A circuit whose output and inputs all live on `endpoint`.
    pub fn local(
        id: u32,
        endpoint: &Arc<Endpoint>,
        factory: Arc<dyn XferFactory>,
        settings: ControllerSettings,
        output: &PortSetDescriptor,
        inputs: &[PortSetDescriptor],
    ) -> Result<Self> {
        let output_set = PortSet::local_output(endpoint, output)?;
        let producers = output_set.ports.len();
        let mut input_sets = Vec::with_capacity(inputs.len());
        for descriptor in inputs {
            let mut set = PortSet::local_input(endpoint, descriptor, producers)?;
            if set.role == Role::ActiveMessage {
                for port in &mut set.ports {
                    port.allocate_shadow_state(endpoint, producers)?;
                    let layout = port.shadow_state.as_ref().map(|s| s.layout);
                    if let Some(layout) = layout {
                        for r in 0..producers {
                            let targets = (0..set.buffer_count).map(|k| layout.word(k, r)).collect();
                            port.set_empty_targets(endpoint.clone(), r, targets);
                        }
                    }
                }
            }
            input_sets.push(set);
        }
        tracing::debug!(circuit = id, inputs = inputs.len(), "created local circuit");
        Ok(Self::with_sets(
            id,
            CircuitState::Closed,
            endpoint,
            factory,
            settings,
            output_set,
            input_sets,
        ))
    }

    /// Producer side of a circuit whose inputs live on a remote endpoint.
    pub fn outbound(
        id: u32,
        endpoint: &Arc<Endpoint>,
        factory: Arc<dyn XferFactory>,
        settings: ControllerSettings,
        output: &PortSetDescriptor,
    ) -> Result<Self> {
        let output_set = PortSet::local_output(endpoint, output)?;
        Ok(Self::with_sets(
            id,
            CircuitState::Open,
            endpoint,
            factory,
            settings,
            output_set,
            Vec::new(),
        ))
    }

    /// Consumer side of a circuit opened by a remote producer.
    pub fn inbound(
        id: u32,
        endpoint: &Arc<Endpoint>,
        factory: Arc<dyn XferFactory>,
        settings: ControllerSettings,
        remote_output: &PortSetDescriptor,
        input: &PortSetDescriptor,
    ) -> Result<Self> {
        let output_set = PortSet::placeholder(remote_output, true, 1);
        let mut input_set = PortSet::local_input(endpoint, input, output_set.ports.len())?;
        input_set.set_external(ExternalState::WaitingForUpdate);
        Ok(Self::with_sets(
            id,
            CircuitState::Open,
            endpoint,
            factory,
            settings,
            output_set,
            vec![input_set],
        ))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn output(&self) -> &PortSet {
        &self.output
    }

    pub fn inputs(&self) -> &[PortSet] {
        &self.inputs
    }

    pub fn input_set(&self, set: usize) -> Result<&PortSet> {
        let count = self.inputs.len();
        self.inputs.get(set).ok_or(TransportError::UnknownPort {
            what: "input port set",
            index: set,
            count,
        })
    }

    pub fn controller(&self, set: usize) -> Result<&Controller> {
        let count = self.controllers.len();
        self.controllers.get(set).ok_or(TransportError::UnknownPort {
            what: "controller",
            index: set,
            count,
        })
    }

    /// Buffers waiting in the (output port, input PortSet) queue.
    pub fn queued(&self, port: usize, set: usize) -> usize {
        self.queues
            .get(port)
            .and_then(|q| q.get(set))
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    fn is_functional(&self) -> bool {
        self.state == CircuitState::Closed && self.ready
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// True once every port is ready. The first time this holds the
    /// controllers are selected, built and bound.
    pub fn ready(&mut self) -> Result<bool> {
        if self.ready {
            return Ok(true);
        }
        if self.state != CircuitState::Closed
            || self.inputs.is_empty()
            || !self.output.is_ready()
            || !self.inputs.iter().all(PortSet::is_ready)
        {
            return Ok(false);
        }

        let mut controllers = Vec::with_capacity(self.inputs.len());
        for (set, input) in self.inputs.iter().enumerate() {
            let key = ControllerKey::for_sets(&self.output, input);
            let mut controller = Controller::select(key, set, self.settings)?;
            if controller.kind().is_afc() && self.inputs.len() > 1 {
                return Err(TransportError::config(
                    "a flow-controlled output cannot feed more than one input port set",
                ));
            }
            controller.init(&self.output, input, self.factory.as_ref())?;
            controllers.push(controller);
        }
        for input in &mut self.inputs {
            input.bind_controller()?;
        }
        self.controllers = controllers;
        self.ready = true;
        tracing::debug!(
            circuit = self.id,
            kinds = ?self.controllers.iter().map(Controller::kind).collect::<Vec<_>>(),
            "circuit ready"
        );
        Ok(true)
    }

    /// Mark the circuit Closed; every port must have a location.
    pub fn close(&mut self) -> Result<()> {
        if !self.output.is_located() || !self.inputs.iter().all(PortSet::is_located) {
            return Err(TransportError::state(format!(
                "circuit {:#010x} still has ports without a location",
                self.id
            )));
        }
        self.state = CircuitState::Closed;
        Ok(())
    }

    /// Back to Open. Controllers, queues and in-flight work are dropped and
    /// data-path calls become no-ops until the circuit is closed again.
    pub fn reset(&mut self) {
        self.state = CircuitState::Open;
        self.ready = false;
        self.controllers.clear();
        for per_port in &mut self.queues {
            for queue in per_port.iter_mut() {
                queue.clear();
            }
        }
        self.forward_queue.clear();
        for (out, forward) in self.forwarded.drain() {
            if let Some(buffer) = self
                .output
                .ports
                .get_mut(out.port)
                .and_then(|p| p.buffers.get_mut(out.buffer))
            {
                buffer.alias = None;
            }
            self.drained.push(forward);
        }
        for port in &mut self.output.ports {
            let local = if port.shadow { None } else { port.location().ok().cloned() };
            for (index, buffer) in port.buffers.iter_mut().enumerate() {
                buffer.pending = 0;
                buffer.dependents.clear();
                // Dropped hand-offs never finish; their buffers are free again
                if let Some(endpoint) = &local {
                    if let Err(e) = buffer.mark_empty(endpoint, 0) {
                        tracing::warn!(circuit = self.id, buffer = index, error = %e, "output buffer not released on reset");
                    }
                }
            }
        }
        for set in &mut self.inputs {
            set.unbind();
            for port in &mut set.ports {
                port.cursor = 0;
                for buffer in &mut port.buffers {
                    buffer.detach();
                }
            }
        }
        tracing::debug!(circuit = self.id, "circuit reset");
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub fn attach(&mut self) -> usize {
        self.ref_count += 1;
        self.ref_count
    }

    /// Drop one reference; returns how many remain.
    pub fn release(&mut self) -> usize {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }

    // ---------------------------------------------------------------------
    // Producer side
    // ---------------------------------------------------------------------

    fn local_output_port(&self, port: usize) -> Result<&crate::DataTransport::port::Port> {
        let p = self.output.port(port)?;
        if p.shadow {
            return Err(TransportError::state(
                "producer operations need a local output port",
            ));
        }
        Ok(p)
    }

    fn is_queued(&self, port: usize, buffer: usize) -> bool {
        self.queues
            .get(port)
            .map(|sets| sets.iter().any(|q| q.iter().any(|e| e.buffer == buffer)))
            .unwrap_or(false)
    }

    /// An output buffer is empty when its state word reads Empty, no
    /// hand-off is outstanding, it is not queued and no input buffer still
    /// aliases its memory.
    fn output_buffer_is_empty(&mut self, port: usize, buffer: usize) -> Result<bool> {
        let queued = self.is_queued(port, buffer);
        let inputs = &self.inputs;
        let p = self.output.port_mut(port)?;
        let endpoint = p.location()?.clone();
        let b = p.buffer_mut(buffer)?;
        if queued || b.pending > 0 {
            return Ok(false);
        }
        if b.state_word(&endpoint, 0)?.load(Ordering::Acquire) != FLAG_EMPTY {
            return Ok(false);
        }
        let me = OutputRef { port, buffer };
        b.dependents.retain(|d| {
            inputs
                .get(d.set)
                .and_then(|s| s.ports.get(d.port))
                .and_then(|p| p.buffers.get(d.buffer))
                .map(|ib| ib.link == ZeroCopyLink::AttachedTo(me))
                .unwrap_or(false)
        });
        Ok(b.dependents.is_empty())
    }

    /// The ring slot of `port` if it may be filled now.
    pub fn get_next_empty_output_buffer(&mut self, port: usize) -> Result<Option<usize>> {
        if !self.is_functional() {
            return Ok(None);
        }
        let ob = self.local_output_port(port)?.cursor;
        if self.forwarded.contains_key(&OutputRef { port, buffer: ob }) {
            return Ok(None);
        }
        Ok(self.output_buffer_is_empty(port, ob)?.then_some(ob))
    }

    pub fn output_buffer_mut(&mut self, port: usize, buffer: usize) -> Result<&mut [u8]> {
        let p = self.local_output_port(port)?;
        let b = p.buffer(buffer)?;
        let endpoint = p.location()?;
        unsafe { endpoint.map_tx(b.data_offset(), b.length) }
    }

    pub fn output_metadata_mut(&mut self, port: usize, buffer: usize) -> Result<&mut BufferMetaData> {
        let p = self.local_output_port(port)?;
        let offset = p.buffer(buffer)?.offsets.metadata;
        let ptr = p
            .location()?
            .map(offset, std::mem::size_of::<BufferMetaData>())?;
        Ok(unsafe { &mut *(ptr as *mut BufferMetaData) })
    }

    /// Hand off output buffer `buffer` of `port` to every input PortSet.
    pub fn produce(&mut self, port: usize, buffer: usize, broadcast: bool) -> Result<ProduceStatus> {
        if !self.is_functional() {
            tracing::trace!(circuit = self.id, port, buffer, "produce ignored, circuit not ready");
            return Ok(ProduceStatus::Ignored);
        }
        self.local_output_port(port)?.buffer(buffer)?;
        if self.is_queued(port, buffer) {
            return Err(TransportError::DuplicateQueuedBuffer {
                port: port as u32,
                buffer: buffer as u32,
            });
        }
        if !self.output_buffer_is_empty(port, buffer)? {
            return Err(TransportError::state(format!(
                "output buffer {} of port {} is still in use",
                buffer, port
            )));
        }
        // Every set is checked before the buffer is stamped, so a failing
        // set leaves the buffer untouched
        let mut free = Vec::with_capacity(self.inputs.len());
        for set in 0..self.inputs.len() {
            free.push(
                self.queues[port][set].is_empty()
                    && self.controllers[set].can_produce(&self.output, &self.inputs[set], port, broadcast)?,
            );
        }
        // A broadcast goes out to all sets together or waits on all of them
        if broadcast && free.contains(&false) {
            free.iter_mut().for_each(|f| *f = false);
        }
        self.stamp(port, buffer, broadcast)?;

        let mut gated = 0;
        let mut issued = 0;
        let mut queued = false;
        for (set, free) in free.into_iter().enumerate() {
            if free {
                match self.issue(set, port, buffer, broadcast) {
                    Ok(n) => gated += n,
                    Err(e) if issued == 0 && !queued => {
                        self.unstamp(port, buffer)?;
                        return Err(e);
                    }
                    Err(e) => {
                        self.output.port_mut(port)?.advance(buffer);
                        return Err(e);
                    }
                }
                issued += 1;
            } else {
                self.queues[port][set].push_back(QueuedBuffer { buffer, broadcast });
                queued = true;
            }
        }
        self.output.port_mut(port)?.advance(buffer);

        tracing::trace!(circuit = self.id, port, buffer, broadcast, queued, gated, "produced");
        Ok(if queued {
            ProduceStatus::Queued
        } else {
            ProduceStatus::Issued {
                gated_remaining: gated,
            }
        })
    }

    /// Hand off to every port of every input PortSet.
    pub fn broadcast(&mut self, port: usize, buffer: usize) -> Result<ProduceStatus> {
        self.produce(port, buffer, true)
    }

    /// Copy `payload` into the next empty buffer of `port` and produce it.
    /// `None` when no buffer is free.
    pub fn send(&mut self, port: usize, payload: &[u8], broadcast: bool) -> Result<Option<ProduceStatus>> {
        let Some(buffer) = self.get_next_empty_output_buffer(port)? else {
            return Ok(None);
        };
        let data = self.output_buffer_mut(port, buffer)?;
        if payload.len() > data.len() {
            return Err(TransportError::OutOfBounds {
                offset: 0,
                len: payload.len(),
                size: data.len(),
            });
        }
        data[..payload.len()].copy_from_slice(payload);
        self.output_metadata_mut(port, buffer)?.length = payload.len() as u32;
        self.produce(port, buffer, broadcast).map(Some)
    }

    /// Fill the per-hand-off metadata fields and raise the Full flag.
    fn stamp(&mut self, port: usize, buffer: usize, broadcast: bool) -> Result<()> {
        let p = self.output.port_mut(port)?;
        let sequence = p.next_sequence;
        p.next_sequence += 1;
        let endpoint = p.location()?.clone();
        let b = p.buffer(buffer)?;

        let mut meta = b.read_metadata(&endpoint)?;
        meta.sequence = sequence;
        meta.timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        meta.src_rank = port as u32;
        meta.state_offset = b.state_offset(0);
        meta.broadcast = broadcast as u8;
        meta.n_parts_per_whole = 1;
        meta.parts_sequence = 0;
        meta.end_of_whole = 0;
        meta.zero_copy = 0;
        endpoint.write(b.offsets.metadata, &meta)?;
        b.mark_full(&endpoint, 0)
    }

    /// Undo [`stamp`](Self::stamp) for a buffer no set accepted.
    fn unstamp(&mut self, port: usize, buffer: usize) -> Result<()> {
        let p = self.output.port_mut(port)?;
        p.next_sequence = p.next_sequence.saturating_sub(1);
        let endpoint = p.location()?.clone();
        p.buffer(buffer)?.mark_empty(&endpoint, 0)
    }

    fn issue(&mut self, set: usize, port: usize, buffer: usize, broadcast: bool) -> Result<usize> {
        let outcome =
            self.controllers[set].produce(&mut self.output, &mut self.inputs[set], port, buffer, broadcast)?;
        match outcome {
            Issue::Pushed { gated } => {
                self.output.port_mut(port)?.buffer_mut(buffer)?.pending += 1;
                Ok(gated)
            }
            Issue::Marked => Ok(0),
        }
    }

    fn finish_hand_off(&mut self, out: OutputRef) -> Result<()> {
        let queued = self.is_queued(out.port, out.buffer);
        let p = self.output.port_mut(out.port)?;
        let endpoint = p.location()?.clone();
        let b = p.buffer_mut(out.buffer)?;
        b.pending = b.pending.saturating_sub(1);
        if b.pending == 0 && !queued {
            b.mark_empty(&endpoint, 0)?;
        }
        Ok(())
    }

    pub fn have_output_barrier_token(&self, port: usize) -> Result<bool> {
        if !self.is_functional() {
            return Ok(false);
        }
        self.controller(0)?.have_output_barrier_token(&self.output, port)
    }

    // ---------------------------------------------------------------------
    // Consumer side
    // ---------------------------------------------------------------------

    pub fn get_next_full_input_buffer(&self, set: usize, port: usize) -> Result<Option<usize>> {
        if !self.is_functional() {
            return Ok(None);
        }
        self.controller(set)?
            .get_next_full_input_buffer(self.input_set(set)?, port)
    }

    pub fn has_full_input_buffer(&self, set: usize, port: usize) -> Result<bool> {
        Ok(self.get_next_full_input_buffer(set, port)?.is_some())
    }

    pub fn input_metadata(&self, set: usize, port: usize, buffer: usize) -> Result<BufferMetaData> {
        let p = self.input_set(set)?.port(port)?;
        p.buffer(buffer)?.read_metadata(p.location()?)
    }

    /// Payload of a full input buffer.
    pub fn input_buffer(&self, set: usize, port: usize, buffer: usize) -> Result<&[u8]> {
        let p = self.input_set(set)?.port(port)?;
        let endpoint = p.location()?;
        let b = p.buffer(buffer)?;
        let range = b.read_metadata(endpoint)?.payload_range();
        if range.end > b.length {
            return Err(TransportError::OutOfBounds {
                offset: b.data_offset(),
                len: range.end,
                size: b.length,
            });
        }
        unsafe { endpoint.map_rx(b.data_offset() + range.start as u64, range.len()) }
    }

    pub fn consume(&mut self, set: usize, port: usize, buffer: usize) -> Result<()> {
        if !self.is_functional() {
            return Ok(());
        }
        let count = self.controllers.len();
        let controller = self
            .controllers
            .get_mut(set)
            .ok_or(TransportError::UnknownPort {
                what: "input port set",
                index: set,
                count,
            })?;
        controller.consume(&mut self.inputs[set], port, buffer)
    }

    /// Copy out and consume the next full buffer of an input port.
    pub fn take(&mut self, set: usize, port: usize) -> Result<Option<(BufferMetaData, Vec<u8>)>> {
        let Some(buffer) = self.get_next_full_input_buffer(set, port)? else {
            return Ok(None);
        };
        let meta = self.input_metadata(set, port, buffer)?;
        let data = self.input_buffer(set, port, buffer)?.to_vec();
        self.consume(set, port, buffer)?;
        Ok(Some((meta, data)))
    }

    // ---------------------------------------------------------------------
    // Housekeeping
    // ---------------------------------------------------------------------

    /// Progress in-flight transfers, release finished output buffers and
    /// start queued ones in FIFO order.
    pub fn check_queued_transfers(&mut self) -> Result<()> {
        if !self.is_functional() {
            return Ok(());
        }
        for set in 0..self.controllers.len() {
            let finished = self.controllers[set].poll(&mut self.output, &mut self.inputs[set])?;
            for out in finished {
                self.finish_hand_off(out)?;
            }
        }

        for port in 0..self.queues.len() {
            loop {
                let mut started = false;
                for set in 0..self.inputs.len() {
                    while let Some(front) = self.queues[port][set].front().copied() {
                        if front.broadcast
                            || !self.controllers[set].can_produce(&self.output, &self.inputs[set], port, false)?
                        {
                            break;
                        }
                        self.queues[port][set].pop_front();
                        self.issue(set, port, front.buffer, false)?;
                        started = true;
                        tracing::trace!(circuit = self.id, port, set, buffer = front.buffer, "dequeued");
                    }
                }
                if self.start_queued_broadcast(port)? {
                    started = true;
                }
                if !started {
                    break;
                }
            }
        }

        self.service_forwards()
    }

    /// Start the broadcast at the head of every queue of `port` once it
    /// heads all of them and every set can take it.
    fn start_queued_broadcast(&mut self, port: usize) -> Result<bool> {
        let Some(front) = self.queues[port].first().and_then(|q| q.front()).copied() else {
            return Ok(false);
        };
        if !front.broadcast || self.queues[port].iter().any(|q| q.front() != Some(&front)) {
            return Ok(false);
        }
        for set in 0..self.inputs.len() {
            if !self.controllers[set].can_produce(&self.output, &self.inputs[set], port, true)? {
                return Ok(false);
            }
        }
        for set in 0..self.inputs.len() {
            self.queues[port][set].pop_front();
            self.issue(set, port, front.buffer, true)?;
        }
        tracing::trace!(circuit = self.id, port, buffer = front.buffer, "queued broadcast started");
        Ok(true)
    }

    /// Queue a zero-copy forward onto output `forward.port`.
    pub(crate) fn queue_forward(&mut self, forward: ZeroCopyForward) -> Result<()> {
        if !self.is_functional() {
            return Err(TransportError::state(format!(
                "circuit {:#010x} is not ready",
                self.id
            )));
        }
        let port = self.local_output_port(forward.port)?;
        if forward.metadata.length as usize > port.buffer(0)?.length {
            return Err(TransportError::state("forwarded payload exceeds the output buffer"));
        }
        let whole = self.controllers.iter().all(|c| {
            !c.kind().is_afc() && c.plan().map(|p| p.transfer_count() == 1).unwrap_or(false)
        });
        if !whole {
            return Err(TransportError::state(
                "zero-copy forwarding needs whole-buffer push hand-offs",
            ));
        }
        self.forward_queue.push_back(forward);
        Ok(())
    }

    /// Forwards whose output buffer drained; the source buffer may be
    /// consumed now.
    pub(crate) fn take_drained(&mut self) -> Vec<ZeroCopyForward> {
        std::mem::take(&mut self.drained)
    }

    fn service_forwards(&mut self) -> Result<()> {
        let active: Vec<OutputRef> = self.forwarded.keys().copied().collect();
        for out in active {
            if self.output_buffer_is_empty(out.port, out.buffer)? {
                self.restore_forwarded(out)?;
            }
        }

        while let Some(forward) = self.forward_queue.front().copied() {
            let ob = self.output.port(forward.port)?.cursor;
            let out = OutputRef {
                port: forward.port,
                buffer: ob,
            };
            if self.forwarded.contains_key(&out) || !self.output_buffer_is_empty(forward.port, ob)? {
                break;
            }
            self.forward_queue.pop_front();

            let own = self.output.port(forward.port)?.buffer(ob)?.offsets.data;
            for controller in &mut self.controllers {
                controller.retarget(forward.data_offset, own)?;
            }
            let p = self.output.port_mut(forward.port)?;
            let endpoint = p.location()?.clone();
            let b = p.buffer_mut(ob)?;
            b.alias = Some(forward.data_offset);
            endpoint.write(b.offsets.metadata, &forward.metadata)?;
            self.forwarded.insert(out, forward);

            tracing::trace!(
                circuit = self.id,
                source_circuit = forward.source_circuit,
                port = forward.port,
                buffer = ob,
                "zero-copy forward started"
            );
            self.produce(forward.port, ob, false)?;
        }
        Ok(())
    }

    fn restore_forwarded(&mut self, out: OutputRef) -> Result<()> {
        let Some(forward) = self.forwarded.remove(&out) else {
            return Ok(());
        };
        let own = self.output.port(out.port)?.buffer(out.buffer)?.offsets.data;
        for controller in &mut self.controllers {
            controller.retarget(own, forward.data_offset)?;
        }
        self.output.port_mut(out.port)?.buffer_mut(out.buffer)?.alias = None;
        self.drained.push(forward);
        Ok(())
    }

    /// Data offset of an input buffer for forwarding.
    pub(crate) fn input_data_offset(&self, set: usize, port: usize, buffer: usize) -> Result<u64> {
        Ok(self.input_set(set)?.port(port)?.buffer(buffer)?.data_offset())
    }

    // ---------------------------------------------------------------------
    // Remote definition
    // ---------------------------------------------------------------------

    /// Producer side: add the shadow of a remote input PortSet.
    pub(crate) fn add_shadow_input(
        &mut self,
        descriptor: &PortSetDescriptor,
        location: &Arc<Endpoint>,
    ) -> Result<usize> {
        let producers = self.output.ports.len();
        let mut set = PortSet::placeholder(descriptor, false, producers);
        for port in &mut set.ports {
            port.set_location(location.clone());
            if set.role == Role::ActiveMessage {
                port.allocate_shadow_state(&self.endpoint, producers)?;
            }
        }
        self.inputs.push(set);
        for per_port in &mut self.queues {
            per_port.push(VecDeque::new());
        }
        Ok(self.inputs.len() - 1)
    }

    pub(crate) fn set_input_offsets(
        &mut self,
        set: usize,
        port: usize,
        control_offset: u64,
        offsets: &[BufferOffsetsWire],
    ) -> Result<()> {
        let count = self.inputs.len();
        self.inputs
            .get_mut(set)
            .ok_or(TransportError::UnknownPort {
                what: "input port set",
                index: set,
                count,
            })?
            .port_mut(port)?
            .set_remote_offsets(control_offset, offsets)
    }

    /// Producer side: offsets of the shadow state words producer `r` owns
    /// for input port `port`, one per buffer.
    pub(crate) fn shadow_state_offsets(&self, port: usize, producer: usize) -> Result<Vec<u64>> {
        let p = self.input_set(0)?.port(port)?;
        let shadow = p.shadow_state.as_ref().ok_or_else(|| {
            TransportError::state(format!("input port {} has no shadow state", port))
        })?;
        if producer >= shadow.layout.producers {
            return Err(TransportError::UnknownPort {
                what: "producer",
                index: producer,
                count: shadow.layout.producers,
            });
        }
        Ok((0..shadow.layout.buffer_count)
            .map(|k| shadow.layout.word(k, producer))
            .collect())
    }

    pub(crate) fn set_input_external(&mut self, set: usize, state: ExternalState) -> Result<()> {
        let count = self.inputs.len();
        self.inputs
            .get_mut(set)
            .ok_or(TransportError::UnknownPort {
                what: "input port set",
                index: set,
                count,
            })?
            .set_external(state);
        Ok(())
    }

    pub(crate) fn output_offsets(&self, port: usize) -> Result<(PortOffsetsWire, Vec<BufferOffsetsWire>)> {
        Ok(self.local_output_port(port)?.offsets_wire())
    }

    pub(crate) fn input_offsets(&self, port: usize) -> Result<(PortOffsetsWire, Vec<BufferOffsetsWire>)> {
        let p = self.input_set(0)?.port(port)?;
        if p.shadow {
            return Err(TransportError::state("input port is a shadow"));
        }
        Ok(p.offsets_wire())
    }

    /// Consumer side: the remote producer announced output port `port` for
    /// input port `input`. True once every pair has been announced and the
    /// circuit closed.
    pub(crate) fn apply_update(
        &mut self,
        port: usize,
        input: usize,
        location: &Arc<Endpoint>,
        control_offset: u64,
    ) -> Result<bool> {
        let n_in = self.input_set(0)?.ports.len();
        if input >= n_in {
            return Err(TransportError::UnknownPort {
                what: "input port",
                index: input,
                count: n_in,
            });
        }
        let p = self.output.port_mut(port)?;
        p.set_location(location.clone());
        p.control_offset = control_offset;
        self.updates.insert((port, input));

        if self.state == CircuitState::Open && self.updates.len() == self.output.ports.len() * n_in {
            self.close()?;
            self.output.set_external(ExternalState::WaitingForShadowBuffer);
            for set in &mut self.inputs {
                set.set_external(ExternalState::WaitingForShadowBuffer);
            }
            tracing::debug!(circuit = self.id, "remote producer fully announced");
            return Ok(true);
        }
        Ok(false)
    }

    pub(crate) fn set_output_offsets(
        &mut self,
        port: usize,
        control_offset: u64,
        offsets: &[BufferOffsetsWire],
    ) -> Result<()> {
        self.output
            .port_mut(port)?
            .set_remote_offsets(control_offset, offsets)
    }

    pub(crate) fn set_empty_targets(
        &mut self,
        port: usize,
        producer: usize,
        endpoint: &Arc<Endpoint>,
        targets: Vec<u64>,
    ) -> Result<()> {
        let count = self.inputs.len();
        self.inputs
            .first_mut()
            .ok_or(TransportError::UnknownPort {
                what: "input port set",
                index: 0,
                count,
            })?
            .port_mut(port)?
            .set_empty_targets(endpoint.clone(), producer, targets);
        Ok(())
    }

    /// Consumer side: every offset is known.
    pub(crate) fn complete_definition(&mut self) {
        self.output.set_external(ExternalState::DefinitionComplete);
        for set in &mut self.inputs {
            set.set_external(ExternalState::DefinitionComplete);
        }
    }
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::Debug::StructDebug::debug_circuit(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DataTransport::builder::TransportConfig;
    use crate::DataTransport::controller::ControllerKind;
    use crate::DataTransport::transport::Transport;

    fn transport(address: &str, mailbox: u16, latency: u32) -> Transport {
        let config = TransportConfig::builder()
            .with_address(address)
            .with_mailbox(mailbox, 1024)
            .with_size(4 * 1024 * 1024)
            .with_zero_copy(false)
            .with_xfer_latency(latency)
            .build()
            .unwrap();
        Transport::new(config).unwrap()
    }

    #[test]
    fn failing_input_set_leaves_the_buffer_unproduced() {
        let t = transport("circuit-unit-rollback", 951, 0);
        let one = PortSetDescriptor::new().with_ports(1).with_buffers(2, 64);
        let id = t
            .create_local_circuit(&one, &[one.clone(), one.clone()])
            .unwrap();
        let handle = t.circuit(id).unwrap();
        let mut c = handle.lock();

        // Set 1 gets a controller that refuses every producer operation
        let key = ControllerKey {
            shadow: true,
            output_role: Role::ActiveFlowControl,
            ..*c.controllers[1].key()
        };
        let refusing = Controller::select(key, 1, c.settings).unwrap();
        c.controllers[1] = refusing;
        assert_eq!(c.controllers[1].kind(), ControllerKind::Pattern1AfcShadow);

        for broadcast in [false, true] {
            let ob = c.get_next_empty_output_buffer(0).unwrap();
            assert_eq!(ob, Some(0));
            assert!(c.produce(0, 0, broadcast).is_err());

            assert_eq!(c.output.port(0).unwrap().next_sequence, 0);
            assert_eq!(c.output.port(0).unwrap().cursor, 0);
            assert_eq!(c.controllers[0].in_flight(), 0);
            assert_eq!(c.queued(0, 0) + c.queued(0, 1), 0);
        }
    }

    #[test]
    fn consume_with_release_in_flight_changes_nothing() {
        let t = transport("circuit-unit-release", 952, 3);
        let one = PortSetDescriptor::new().with_ports(1).with_buffers(2, 64);
        let id = t.create_local_circuit(&one, &[one.clone()]).unwrap();
        let handle = t.circuit(id).unwrap();
        let mut c = handle.lock();

        c.send(0, b"a", false).unwrap().unwrap();
        let mut rounds = 0;
        while c.take(0, 0).unwrap().is_none() {
            c.check_queued_transfers().unwrap();
            rounds += 1;
            assert!(rounds < 20, "hand-off never completed");
        }

        // The release of buffer 0 is still polling; fill the slot behind its back
        let port = &c.inputs[0].ports[0];
        let endpoint = port.location().unwrap().clone();
        port.buffers[0].mark_full(&endpoint, 0).unwrap();

        assert!(matches!(
            c.consume(0, 0, 0),
            Err(TransportError::InvalidState { .. })
        ));
        let port = &c.inputs[0].ports[0];
        assert!(port.buffers[0].is_full(&endpoint).unwrap());
        assert_eq!(port.cursor, 1);
    }
}
