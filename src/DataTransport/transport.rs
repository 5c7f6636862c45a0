//! The transport: one local endpoint, its circuits and the setup state
//! machines that bootstrap circuits with remote endpoints.

use crate::error::{Result, TransportError};
use crate::Core::endpoint::{registry, Endpoint};
use crate::Core::xfer::{MemcpyXferFactory, XferFactory};
use crate::DataTransport::builder::{PortSetDescriptor, TransportConfig};
use crate::DataTransport::circuit::{Circuit, CircuitState, ZeroCopyForward};
use crate::DataTransport::controller::ControllerSettings;
use crate::DataTransport::mailbox::{self, MailboxClient, PendingRequest};
use crate::DataTransport::port::{ExternalState, Role};
use crate::DataTransport::Buffer::InputRef;
use crate::DataTransport::Structs::Buffer_Structs::BufferMetaData;
use crate::DataTransport::Structs::Mailbox_Structs::{
    as_bytes, encode_name, from_bytes, BufferOffsetsWire, ConnectionReply, ContainerRequest,
    PortOffsetsWire, RequestBody, RequestNewConnection, RequestPortOffsets, RequestType,
    RequestUpdateCircuit,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared handle to a circuit.
pub type CircuitHandle = Arc<Mutex<Circuit>>;

enum OutboundStep {
    Connect { pending: Option<PendingRequest> },
    InputOffsets { set: usize, port: usize, pending: Option<PendingRequest> },
    Updates { set: usize, index: usize, pending: Option<PendingRequest> },
    Done,
}

/// Producer side bootstrap of one circuit.
struct OutboundSetup {
    peer: Arc<Endpoint>,
    step: OutboundStep,
}

enum InboundStep {
    AwaitUpdates,
    OutputOffsets { port: usize, pending: Option<PendingRequest> },
    ShadowState { index: usize, pending: Option<PendingRequest> },
    Done,
}

/// Consumer side bootstrap of a circuit opened by a peer.
struct InboundSetup {
    peer: Arc<Endpoint>,
    step: InboundStep,
}

enum Setup {
    Outbound(OutboundSetup),
    Inbound(InboundSetup),
}

pub struct Transport {
    config: TransportConfig,
    endpoint: Arc<Endpoint>,
    factory: Arc<dyn XferFactory>,
    client: MailboxClient,
    circuits: Mutex<HashMap<u32, CircuitHandle>>,
    setups: Mutex<HashMap<u32, Setup>>,
    failures: Mutex<HashMap<u32, TransportError>>,
    accepted: Mutex<Vec<u32>>,
    next_circuit: AtomicU32,
}

impl Transport {
    /// Create the local endpoint and a transport over it, using the
    /// in-process copy engine.
    pub fn new(config: TransportConfig) -> Result<Self> {
        let factory = Arc::new(MemcpyXferFactory::with_latency(config.xfer_latency));
        Self::with_factory(config, factory)
    }

    /// Like [`new`](Self::new) with a caller supplied copy engine.
    pub fn with_factory(config: TransportConfig, factory: Arc<dyn XferFactory>) -> Result<Self> {
        let endpoint = Endpoint::create(config.endpoint.clone())?;
        tracing::info!(endpoint = endpoint.name(), "transport started");
        Ok(Self {
            client: MailboxClient::new(endpoint.clone()),
            config,
            endpoint,
            factory,
            circuits: Mutex::new(HashMap::new()),
            setups: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            accepted: Mutex::new(Vec::new()),
            next_circuit: AtomicU32::new(1),
        })
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn settings(&self) -> ControllerSettings {
        ControllerSettings {
            zero_copy: self.config.zero_copy,
            max_templates: self.config.max_templates,
        }
    }

    fn allocate_id(&self) -> Result<u32> {
        let counter = self.next_circuit.fetch_add(1, Ordering::Relaxed);
        if counter > 0xffff {
            return Err(TransportError::CapacityExceeded {
                what: "circuit ids",
                limit: 0xffff,
            });
        }
        Ok((self.endpoint.mailbox_id() as u32) << 16 | counter)
    }

    /// A circuit whose producers and consumers share this endpoint. It is
    /// ready on return.
    pub fn create_local_circuit(
        &self,
        output: &PortSetDescriptor,
        inputs: &[PortSetDescriptor],
    ) -> Result<u32> {
        let id = self.allocate_id()?;
        let mut circuit = Circuit::local(
            id,
            &self.endpoint,
            self.factory.clone(),
            self.settings(),
            output,
            inputs,
        )?;
        circuit.ready()?;
        self.circuits.lock().insert(id, Arc::new(Mutex::new(circuit)));
        Ok(id)
    }

    /// Open a circuit from a local output PortSet to the endpoint named
    /// `peer`. Setup proceeds in [`dispatch`](Self::dispatch).
    pub fn connect(&self, peer: &str, output: &PortSetDescriptor) -> Result<u32> {
        let peer = registry::resolve(peer)?;
        let id = self.allocate_id()?;
        let circuit = Circuit::outbound(id, &self.endpoint, self.factory.clone(), self.settings(), output)?;
        self.circuits.lock().insert(id, Arc::new(Mutex::new(circuit)));
        self.setups.lock().insert(
            id,
            Setup::Outbound(OutboundSetup {
                peer: peer.clone(),
                step: OutboundStep::Connect { pending: None },
            }),
        );
        tracing::debug!(circuit = id, peer = peer.name(), "connecting");
        Ok(id)
    }

    pub fn circuit(&self, id: u32) -> Result<CircuitHandle> {
        self.circuits
            .lock()
            .get(&id)
            .cloned()
            .ok_or(TransportError::UnknownCircuit { id })
    }

    pub fn circuit_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.circuits.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Circuits opened by remote producers, oldest first.
    pub fn accepted_circuits(&self) -> Vec<u32> {
        self.accepted.lock().clone()
    }

    /// Take another reference to a circuit.
    pub fn attach_circuit(&self, id: u32) -> Result<CircuitHandle> {
        let handle = self.circuit(id)?;
        handle.lock().attach();
        Ok(handle)
    }

    /// Drop one reference; the circuit and its buffers go away at zero.
    pub fn release_circuit(&self, id: u32) -> Result<()> {
        let handle = self.circuit(id)?;
        let remaining = handle.lock().release();
        if remaining == 0 {
            self.circuits.lock().remove(&id);
            self.setups.lock().remove(&id);
            self.accepted.lock().retain(|c| *c != id);
            tracing::debug!(circuit = id, "circuit released");
        }
        Ok(())
    }

    /// One round of housekeeping: serve the inbox, advance setups, ready
    /// circuits and progress their transfers.
    pub fn dispatch(&self) -> Result<()> {
        mailbox::serve(&self.endpoint, |requester, request| {
            self.handle_request(requester, request)
        })?;
        self.advance_setups();

        let handles: Vec<(u32, CircuitHandle)> = self
            .circuits
            .lock()
            .iter()
            .map(|(id, h)| (*id, h.clone()))
            .collect();

        let mut drained = Vec::new();
        for (id, handle) in handles {
            let mut circuit = handle.lock();
            if !circuit.is_ready() {
                if let Err(e) = circuit.ready() {
                    tracing::warn!(circuit = id, error = %e, "circuit cannot become ready");
                    self.failures.lock().entry(id).or_insert(e);
                    continue;
                }
            }
            if let Err(e) = circuit.check_queued_transfers() {
                tracing::warn!(circuit = id, error = %e, "circuit transfers failed");
                self.failures.lock().entry(id).or_insert(e);
            }
            drained.extend(circuit.take_drained());
        }

        for forward in drained {
            self.finish_forward(forward);
        }
        Ok(())
    }

    /// Dispatch until circuit `id` is ready or `timeout` expires.
    pub fn wait_ready(&self, id: u32, timeout: Duration) -> Result<CircuitHandle> {
        let start = Instant::now();
        loop {
            self.dispatch()?;
            if let Some(e) = self.failures.lock().remove(&id) {
                return Err(e);
            }
            let handle = self.circuit(id)?;
            if handle.lock().is_ready() {
                return Ok(handle);
            }
            if start.elapsed() >= timeout {
                return Err(TransportError::Timeout {
                    what: format!("circuit {:#010x} to become ready", id),
                });
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    /// Send a full input buffer of one circuit out of an output port of
    /// another co-located circuit without copying. The input buffer is
    /// consumed once the output buffer drains; it must not be consumed by
    /// the caller in the meantime.
    pub fn forward_zero_copy(
        &self,
        source_circuit: u32,
        source: InputRef,
        target_circuit: u32,
        target_port: usize,
    ) -> Result<()> {
        if source_circuit == target_circuit {
            return Err(TransportError::state("cannot forward within one circuit"));
        }
        let src = self.circuit(source_circuit)?;
        let dst = self.circuit(target_circuit)?;
        let (s, mut d) = if source_circuit < target_circuit {
            let s = src.lock();
            let d = dst.lock();
            (s, d)
        } else {
            let d = dst.lock();
            let s = src.lock();
            (s, d)
        };

        let in_port = s.input_set(source.set)?.port(source.port)?;
        let in_endpoint = in_port.location()?;
        if !in_port.buffer(source.buffer)?.is_full(in_endpoint)? {
            return Err(TransportError::state("forwarded input buffer is not full"));
        }
        let out_endpoint = d.output().port(target_port)?.location()?;
        if !in_endpoint.same_memory(out_endpoint) {
            return Err(TransportError::state(
                "zero-copy forwarding needs co-located ports",
            ));
        }

        let forward = ZeroCopyForward {
            source_circuit,
            source,
            data_offset: s.input_data_offset(source.set, source.port, source.buffer)?,
            metadata: s.input_metadata(source.set, source.port, source.buffer)?,
            port: target_port,
        };
        d.queue_forward(forward)?;
        tracing::debug!(
            source_circuit,
            target_circuit,
            port = target_port,
            "zero-copy forward queued"
        );
        Ok(())
    }

    fn finish_forward(&self, forward: ZeroCopyForward) {
        let result = self.circuit(forward.source_circuit).and_then(|handle| {
            handle
                .lock()
                .consume(forward.source.set, forward.source.port, forward.source.buffer)
        });
        if let Err(e) = result {
            tracing::warn!(
                circuit = forward.source_circuit,
                error = %e,
                "could not release forwarded input buffer"
            );
        }
    }

    // ---------------------------------------------------------------------
    // Responder
    // ---------------------------------------------------------------------

    fn handle_request(&self, requester: &Arc<Endpoint>, request: &ContainerRequest) -> Result<Vec<u8>> {
        let id = request.header.circuit_id;
        match request.request_type()? {
            RequestType::ReqNewConnection => self.accept_connection(requester, id, request),
            RequestType::ReqInputOffsets => {
                let port = unsafe { request.body.offsets.port_id } as usize;
                let offsets = self.circuit(id)?.lock().input_offsets(port)?;
                Ok(encode_offsets(offsets))
            }
            RequestType::ReqOutputControlOffset => {
                let port = unsafe { request.body.offsets.port_id } as usize;
                let offsets = self.circuit(id)?.lock().output_offsets(port)?;
                Ok(encode_offsets(offsets))
            }
            RequestType::ReqShadowRstateOffset => {
                let body = unsafe { request.body.offsets };
                let words = self
                    .circuit(id)?
                    .lock()
                    .shadow_state_offsets(body.port_id as usize, body.producer_rank as usize)?;
                Ok(words.iter().flat_map(|w| w.to_le_bytes()).collect())
            }
            RequestType::ReqUpdateCircuit => {
                let body = unsafe { request.body.update };
                let handle = self.circuit(id)?;
                let mut circuit = handle.lock();
                let expected = circuit.output().ports.len() * circuit.input_set(0)?.ports.len();
                if body.t_port_count as usize != expected {
                    return Err(TransportError::MalformedRequest {
                        message: format!(
                            "update announces {} port pairs, circuit has {}",
                            body.t_port_count, expected
                        ),
                    });
                }
                let closed = circuit.apply_update(
                    body.sender_output_port_id as usize,
                    body.receiver_port_id as usize,
                    requester,
                    body.sender_output_control_offset,
                )?;
                Ok((closed as u32).to_le_bytes().to_vec())
            }
            RequestType::NoRequest => Err(TransportError::MalformedRequest {
                message: "empty request".into(),
            }),
        }
    }

    fn accept_connection(
        &self,
        requester: &Arc<Endpoint>,
        id: u32,
        request: &ContainerRequest,
    ) -> Result<Vec<u8>> {
        let body = unsafe { request.body.connection };
        if body.send != 1 {
            return Err(TransportError::MalformedRequest {
                message: "only producers may open a connection".into(),
            });
        }
        if body.protocol_size as usize != size_of::<BufferMetaData>() {
            return Err(TransportError::MalformedRequest {
                message: format!(
                    "peer metadata header is {} bytes, expected {}",
                    body.protocol_size,
                    size_of::<BufferMetaData>()
                ),
            });
        }
        if self.circuits.lock().contains_key(&id) {
            return Err(TransportError::state(format!("circuit {:#010x} already exists", id)));
        }

        let remote_output = PortSetDescriptor::decode(
            body.output_port_count,
            body.output_buffer_count,
            body.buffer_size,
            body.output_descriptor,
            body.block_size,
        )?;
        let input = &self.config.default_input;
        let circuit = Circuit::inbound(
            id,
            &self.endpoint,
            self.factory.clone(),
            self.settings(),
            &remote_output,
            input,
        )?;
        self.circuits.lock().insert(id, Arc::new(Mutex::new(circuit)));
        self.setups.lock().insert(
            id,
            Setup::Inbound(InboundSetup {
                peer: requester.clone(),
                step: InboundStep::AwaitUpdates,
            }),
        );
        self.accepted.lock().push(id);
        tracing::debug!(circuit = id, peer = requester.name(), "accepted connection");

        let (packed, block) = input.encode()?;
        let reply = ConnectionReply {
            circuit_id: id,
            input_port_count: input.port_count as u32,
            input_buffer_count: input.buffer_count as u32,
            buffer_size: input.buffer_size as u32,
            input_descriptor: packed,
            block_size: block,
        };
        Ok(as_bytes(&reply).to_vec())
    }

    // ---------------------------------------------------------------------
    // Requester
    // ---------------------------------------------------------------------

    fn advance_setups(&self) {
        let mut setups = self.setups.lock();
        let mut finished = Vec::new();
        for (id, setup) in setups.iter_mut() {
            let result = match setup {
                Setup::Outbound(s) => self.advance_outbound(*id, s),
                Setup::Inbound(s) => self.advance_inbound(*id, s),
            };
            match result {
                Ok(true) => finished.push(*id),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(circuit = *id, error = %e, "circuit setup failed");
                    self.failures.lock().insert(*id, e);
                    finished.push(*id);
                }
            }
        }
        for id in finished {
            setups.remove(&id);
        }
    }

    /// Post the request if nothing is pending, otherwise poll for its reply.
    fn exchange<F>(
        &self,
        pending: &mut Option<PendingRequest>,
        peer: &Arc<Endpoint>,
        reply_size: usize,
        build: F,
    ) -> Result<Option<Vec<u8>>>
    where
        F: FnOnce() -> Result<ContainerRequest>,
    {
        match pending {
            None => {
                *pending = self.client.post(peer, build()?, reply_size)?;
                Ok(None)
            }
            Some(request) => {
                let reply = self.client.poll(request)?;
                if reply.is_some() {
                    *pending = None;
                }
                Ok(reply)
            }
        }
    }

    fn offsets_request(
        &self,
        kind: RequestType,
        circuit: u32,
        port: usize,
        producer: usize,
    ) -> Result<ContainerRequest> {
        Ok(ContainerRequest::new(
            kind,
            circuit,
            RequestBody {
                offsets: RequestPortOffsets {
                    port_id: port as u32,
                    producer_rank: producer as u32,
                    requester: encode_name(self.endpoint.name())?,
                },
            },
        ))
    }

    fn advance_outbound(&self, id: u32, setup: &mut OutboundSetup) -> Result<bool> {
        let handle = self.circuit(id)?;
        loop {
            match &mut setup.step {
                OutboundStep::Connect { pending } => {
                    let reply = self.exchange(pending, &setup.peer, size_of::<ConnectionReply>(), || {
                        let circuit = handle.lock();
                        let output = circuit.output().descriptor();
                        let (packed, block) = output.encode()?;
                        Ok(ContainerRequest::new(
                            RequestType::ReqNewConnection,
                            id,
                            RequestBody {
                                connection: RequestNewConnection {
                                    buffer_size: output.buffer_size as u32,
                                    send: 1,
                                    protocol_size: size_of::<BufferMetaData>() as u32,
                                    output_end_point: encode_name(self.endpoint.name())?,
                                    output_port_count: output.port_count as u32,
                                    output_buffer_count: output.buffer_count as u32,
                                    output_descriptor: packed,
                                    block_size: block,
                                    _pad: 0,
                                },
                            },
                        ))
                    })?;
                    let Some(reply) = reply else {
                        return Ok(false);
                    };
                    let reply: ConnectionReply = from_bytes(&reply)?;
                    let input = PortSetDescriptor::decode(
                        reply.input_port_count,
                        reply.input_buffer_count,
                        reply.buffer_size,
                        reply.input_descriptor,
                        reply.block_size,
                    )?;
                    let set = handle.lock().add_shadow_input(&input, &setup.peer)?;
                    tracing::debug!(circuit = id, ports = input.port_count, "peer accepted connection");
                    setup.step = OutboundStep::InputOffsets {
                        set,
                        port: 0,
                        pending: None,
                    };
                }
                OutboundStep::InputOffsets { set, port, pending } => {
                    let (set, p) = (*set, *port);
                    let (ports, buffers) = {
                        let circuit = handle.lock();
                        let input = circuit.input_set(set)?;
                        (input.ports.len(), input.buffer_count)
                    };
                    if p >= ports {
                        handle.lock().close()?;
                        setup.step = OutboundStep::Updates {
                            set,
                            index: 0,
                            pending: None,
                        };
                        continue;
                    }
                    let reply = self.exchange(pending, &setup.peer, offsets_size(buffers), || {
                        self.offsets_request(RequestType::ReqInputOffsets, id, p, 0)
                    })?;
                    let Some(reply) = reply else {
                        return Ok(false);
                    };
                    let (header, entries) = decode_offsets(&reply)?;
                    handle
                        .lock()
                        .set_input_offsets(set, p, header.control_offset, &entries)?;
                    setup.step = OutboundStep::InputOffsets {
                        set,
                        port: p + 1,
                        pending: None,
                    };
                }
                OutboundStep::Updates { set, index, pending } => {
                    let (set, i) = (*set, *index);
                    let (n_out, n_in) = {
                        let circuit = handle.lock();
                        (circuit.output().ports.len(), circuit.input_set(set)?.ports.len())
                    };
                    if i >= n_out * n_in {
                        handle
                            .lock()
                            .set_input_external(set, ExternalState::DefinitionComplete)?;
                        setup.step = OutboundStep::Done;
                        continue;
                    }
                    let (r, p) = (i / n_in, i % n_in);
                    let reply = self.exchange(pending, &setup.peer, size_of::<u32>(), || {
                        let control = handle.lock().output().port(r)?.control_offset;
                        Ok(ContainerRequest::new(
                            RequestType::ReqUpdateCircuit,
                            id,
                            RequestBody {
                                update: RequestUpdateCircuit {
                                    sender_circuit_id: id,
                                    receiver_port_id: p as u32,
                                    t_port_count: (n_out * n_in) as u32,
                                    sender_port_id: r as u32,
                                    sender_output_port_id: r as u32,
                                    _pad: 0,
                                    sender_output_control_offset: control,
                                    output_end_point: encode_name(self.endpoint.name())?,
                                },
                            },
                        ))
                    })?;
                    if reply.is_none() {
                        return Ok(false);
                    }
                    setup.step = OutboundStep::Updates {
                        set,
                        index: i + 1,
                        pending: None,
                    };
                }
                OutboundStep::Done => {
                    tracing::debug!(circuit = id, "producer side defined");
                    return Ok(true);
                }
            }
        }
    }

    fn advance_inbound(&self, id: u32, setup: &mut InboundSetup) -> Result<bool> {
        let handle = self.circuit(id)?;
        loop {
            match &mut setup.step {
                InboundStep::AwaitUpdates => {
                    if handle.lock().state() != CircuitState::Closed {
                        return Ok(false);
                    }
                    setup.step = InboundStep::OutputOffsets {
                        port: 0,
                        pending: None,
                    };
                }
                InboundStep::OutputOffsets { port, pending } => {
                    let r = *port;
                    let (n_out, buffers) = {
                        let circuit = handle.lock();
                        (circuit.output().ports.len(), circuit.output().buffer_count)
                    };
                    if r >= n_out {
                        setup.step = InboundStep::ShadowState {
                            index: 0,
                            pending: None,
                        };
                        continue;
                    }
                    let reply = self.exchange(pending, &setup.peer, offsets_size(buffers), || {
                        self.offsets_request(RequestType::ReqOutputControlOffset, id, r, r)
                    })?;
                    let Some(reply) = reply else {
                        return Ok(false);
                    };
                    let (header, entries) = decode_offsets(&reply)?;
                    handle
                        .lock()
                        .set_output_offsets(r, header.control_offset, &entries)?;
                    setup.step = InboundStep::OutputOffsets {
                        port: r + 1,
                        pending: None,
                    };
                }
                InboundStep::ShadowState { index, pending } => {
                    let i = *index;
                    let (n_out, n_in, buffers, role) = {
                        let circuit = handle.lock();
                        let input = circuit.input_set(0)?;
                        (
                            circuit.output().ports.len(),
                            input.ports.len(),
                            input.buffer_count,
                            input.role,
                        )
                    };
                    // Only active-message consumers flag Empty back to the producer
                    if role != Role::ActiveMessage || i >= n_out * n_in {
                        handle.lock().complete_definition();
                        setup.step = InboundStep::Done;
                        continue;
                    }
                    let (p, r) = (i / n_out, i % n_out);
                    let reply = self.exchange(pending, &setup.peer, buffers * size_of::<u64>(), || {
                        self.offsets_request(RequestType::ReqShadowRstateOffset, id, p, r)
                    })?;
                    let Some(reply) = reply else {
                        return Ok(false);
                    };
                    let targets = reply
                        .chunks_exact(size_of::<u64>())
                        .map(|c| {
                            let mut word = [0u8; 8];
                            word.copy_from_slice(c);
                            u64::from_le_bytes(word)
                        })
                        .collect();
                    handle.lock().set_empty_targets(p, r, &setup.peer, targets)?;
                    setup.step = InboundStep::ShadowState {
                        index: i + 1,
                        pending: None,
                    };
                }
                InboundStep::Done => {
                    tracing::debug!(circuit = id, "consumer side defined");
                    return Ok(true);
                }
            }
        }
    }
}

fn offsets_size(buffers: usize) -> usize {
    size_of::<PortOffsetsWire>() + buffers * size_of::<BufferOffsetsWire>()
}

fn encode_offsets((header, entries): (PortOffsetsWire, Vec<BufferOffsetsWire>)) -> Vec<u8> {
    let mut out = as_bytes(&header).to_vec();
    for entry in &entries {
        out.extend_from_slice(as_bytes(entry));
    }
    out
}

fn decode_offsets(bytes: &[u8]) -> Result<(PortOffsetsWire, Vec<BufferOffsetsWire>)> {
    let header: PortOffsetsWire = from_bytes(bytes)?;
    let mut entries = Vec::with_capacity(header.count as usize);
    let mut at = size_of::<PortOffsetsWire>();
    for _ in 0..header.count {
        let rest = bytes.get(at..).ok_or_else(|| TransportError::MalformedRequest {
            message: "offsets reply truncated".into(),
        })?;
        entries.push(from_bytes(rest)?);
        at += size_of::<BufferOffsetsWire>();
    }
    Ok((header, entries))
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("endpoint", &self.endpoint.name())
            .field("circuits", &self.circuit_ids())
            .field("setups", &self.setups.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_survive_wire_encoding() {
        let header = PortOffsetsWire {
            count: 2,
            _pad: 0,
            control_offset: 4096,
        };
        let entries = vec![
            BufferOffsetsWire {
                data: 1,
                metadata: 2,
                state: 3,
            },
            BufferOffsetsWire {
                data: 4,
                metadata: 5,
                state: 6,
            },
        ];
        let bytes = encode_offsets((header, entries.clone()));
        assert_eq!(bytes.len(), offsets_size(2));
        let (h, e) = decode_offsets(&bytes).unwrap();
        assert_eq!(h, header);
        assert_eq!(e, entries);
        assert!(decode_offsets(&bytes[..bytes.len() - 8]).is_err());
    }
}
