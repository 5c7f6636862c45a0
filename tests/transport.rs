// Two transports in one process bootstrapping circuits over their
// mailboxes, pumped by hand and from threads.
// Run with: cargo test --test transport -- --nocapture

use dmxp_transport::Core::{
    Endpoint, MemcpyXferFactory, XferFactory, XferKind, XferRequest, XferServices, XferStatus,
};
use dmxp_transport::DataTransport::{
    CircuitHandle, ControllerKind, DistributionType, PortSetDescriptor, Transport, TransportConfig,
};
use dmxp_transport::TransportError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn transport(address: &str, mailbox: u16, input: PortSetDescriptor) -> Transport {
    let config = TransportConfig::builder()
        .with_address(address)
        .with_mailbox(mailbox, 64)
        .with_size(4 * 1024 * 1024)
        .with_default_input(input)
        .with_poll_interval(Duration::from_micros(100))
        .build()
        .unwrap();
    Transport::new(config).unwrap()
}

fn ports(count: usize, buffers: usize, size: usize) -> PortSetDescriptor {
    PortSetDescriptor::new()
        .with_ports(count)
        .with_buffers(buffers, size)
}

/// Pump both sides until circuit `id` is ready on each of them.
fn establish(producer: &Transport, consumer: &Transport, id: u32) -> (CircuitHandle, CircuitHandle) {
    for _ in 0..1000 {
        let ours = match producer.wait_ready(id, Duration::ZERO) {
            Ok(handle) => Some(handle),
            Err(TransportError::Timeout { .. }) => None,
            Err(e) => panic!("producer side failed: {e}"),
        };
        consumer.dispatch().unwrap();
        let theirs = consumer
            .accepted_circuits()
            .contains(&id)
            .then(|| consumer.circuit(id).unwrap())
            .filter(|h| h.lock().is_ready());
        if let (Some(ours), Some(theirs)) = (ours, theirs) {
            return (ours, theirs);
        }
    }
    panic!("circuit {id:#010x} never became ready");
}

#[test]
fn test_mailbox_bootstrap() {
    let producer = transport("transport-boot-a", 1, ports(1, 2, 64));
    let consumer = transport("transport-boot-b", 2, ports(2, 3, 128));

    let id = producer.connect(consumer.endpoint().name(), &ports(2, 2, 128)).unwrap();
    assert_eq!(id >> 16, 1, "circuit ids carry the creator's mailbox");
    let (ours, theirs) = establish(&producer, &consumer, id);
    assert_eq!(consumer.accepted_circuits(), vec![id]);

    let ours = ours.lock();
    assert_eq!(ours.inputs().len(), 1);
    assert_eq!(ours.input_set(0).unwrap().ports.len(), 2);
    assert_eq!(ours.input_set(0).unwrap().buffer_count, 3);
    assert_eq!(ours.controller(0).unwrap().kind(), ControllerKind::Pattern1);

    let theirs = theirs.lock();
    assert_eq!(theirs.output().ports.len(), 2);
    assert!(theirs.output().is_shadow());
    assert_eq!(theirs.controller(0).unwrap().kind(), ControllerKind::Pattern1);
}

#[test]
fn test_messages_cross_endpoints() {
    let producer = transport("transport-send-a", 3, ports(1, 2, 64));
    let consumer = transport("transport-send-b", 4, ports(1, 2, 256));
    let id = producer.connect(consumer.endpoint().name(), &ports(1, 2, 256)).unwrap();
    let (ours, theirs) = establish(&producer, &consumer, id);

    let mut received = Vec::new();
    let mut sent = 0;
    for _ in 0..2000 {
        if sent < 10 && ours.lock().send(0, format!("msg-{sent}").as_bytes(), false).unwrap().is_some() {
            sent += 1;
        }
        producer.dispatch().unwrap();
        consumer.dispatch().unwrap();
        if let Some((meta, data)) = theirs.lock().take(0, 0).unwrap() {
            assert_eq!(meta.sequence, received.len() as u64);
            received.push(String::from_utf8(data).unwrap());
        }
        if received.len() == 10 {
            break;
        }
    }
    let expected: Vec<String> = (0..10).map(|i| format!("msg-{i}")).collect();
    assert_eq!(received, expected);
}

#[test]
fn test_threaded_pipeline() {
    const MESSAGES: usize = 500;
    let producer = Arc::new(transport("transport-thread-a", 5, ports(1, 2, 64)));
    let consumer = Arc::new(transport("transport-thread-b", 6, ports(2, 4, 64)));
    let deadline = Instant::now() + Duration::from_secs(30);

    let reader = {
        let consumer = Arc::clone(&consumer);
        thread::spawn(move || {
            let id = loop {
                consumer.dispatch().unwrap();
                if let Some(id) = consumer.accepted_circuits().first().copied() {
                    break id;
                }
                assert!(Instant::now() < deadline, "no connection arrived");
                thread::yield_now();
            };
            let circuit = consumer.wait_ready(id, Duration::from_secs(10)).unwrap();
            let mut seen = vec![false; MESSAGES];
            let mut count = 0;
            while count < MESSAGES {
                assert!(Instant::now() < deadline, "only {count} messages arrived");
                consumer.dispatch().unwrap();
                for port in 0..2 {
                    if let Some((_, data)) = circuit.lock().take(0, port).unwrap() {
                        let n: usize = String::from_utf8(data).unwrap().parse().unwrap();
                        assert!(!seen[n], "message {n} arrived twice");
                        seen[n] = true;
                        count += 1;
                    }
                }
            }
            count
        })
    };

    let id = producer.connect(consumer.endpoint().name(), &ports(1, 4, 64)).unwrap();
    let circuit = producer.wait_ready(id, Duration::from_secs(10)).unwrap();
    let mut sent = 0;
    while sent < MESSAGES {
        assert!(Instant::now() < deadline, "stuck after {sent} messages");
        producer.dispatch().unwrap();
        if circuit.lock().send(0, sent.to_string().as_bytes(), false).unwrap().is_some() {
            sent += 1;
        }
    }
    while !reader.is_finished() {
        assert!(Instant::now() < deadline, "reader never finished");
        producer.dispatch().unwrap();
        thread::yield_now();
    }
    assert_eq!(reader.join().unwrap(), MESSAGES);
}

#[test]
fn test_unsupported_pairing_is_reported() {
    let sequential = ports(1, 2, 64).with_distribution(DistributionType::Sequential);
    let producer = transport("transport-bad-a", 7, ports(1, 2, 64));
    let consumer = transport("transport-bad-b", 8, sequential);
    let id = producer.connect(consumer.endpoint().name(), &ports(1, 2, 64)).unwrap();

    let mut outcome = None;
    for _ in 0..1000 {
        match producer.wait_ready(id, Duration::ZERO) {
            Err(TransportError::Timeout { .. }) => consumer.dispatch().unwrap(),
            other => {
                outcome = Some(other);
                break;
            }
        }
    }
    assert!(matches!(
        outcome,
        Some(Err(TransportError::UnsupportedController { .. }))
    ));
}

#[test]
fn test_connect_to_unknown_endpoint() {
    let producer = transport("transport-lonely", 9, ports(1, 2, 64));
    assert!(producer
        .connect("dmxp-heap:transport-nobody;1048576.10.64", &ports(1, 2, 64))
        .is_err());
    assert!(producer.circuit_ids().is_empty());
}

/// Copy engine whose requests never complete once `offline` was set at the
/// time they were created.
struct FlakyFactory {
    inner: MemcpyXferFactory,
    offline: Arc<AtomicBool>,
}

struct FlakyServices {
    inner: Arc<dyn XferServices>,
    offline: bool,
}

struct FlakyRequest {
    inner: Box<dyn XferRequest>,
    offline: bool,
}

impl XferFactory for FlakyFactory {
    fn services(
        &self,
        src: &Arc<Endpoint>,
        dst: &Arc<Endpoint>,
    ) -> dmxp_transport::Result<Arc<dyn XferServices>> {
        Ok(Arc::new(FlakyServices {
            inner: self.inner.services(src, dst)?,
            offline: self.offline.load(Ordering::SeqCst),
        }))
    }
}

impl XferServices for FlakyServices {
    fn source(&self) -> &Arc<Endpoint> {
        self.inner.source()
    }

    fn destination(&self) -> &Arc<Endpoint> {
        self.inner.destination()
    }

    fn create_request(&self) -> Box<dyn XferRequest> {
        Box::new(FlakyRequest {
            inner: self.inner.create_request(),
            offline: self.offline,
        })
    }
}

impl XferRequest for FlakyRequest {
    fn copy(&mut self, src: u64, dst: u64, len: usize, kind: XferKind) -> dmxp_transport::Result<()> {
        self.inner.copy(src, dst, len, kind)
    }

    fn post(&mut self) -> dmxp_transport::Result<()> {
        if self.offline {
            return Ok(());
        }
        self.inner.post()
    }

    fn status(&mut self) -> dmxp_transport::Result<XferStatus> {
        if self.offline {
            return Err(std::io::Error::other("copy engine offline").into());
        }
        self.inner.status()
    }

    fn modify(&mut self, new: &[u64], old: &[u64]) -> dmxp_transport::Result<usize> {
        self.inner.modify(new, old)
    }

    fn reset(&mut self) {
        self.inner.reset()
    }

    fn op_count(&self) -> usize {
        self.inner.op_count()
    }
}

#[test]
fn test_failing_circuit_does_not_stall_dispatch() {
    let offline = Arc::new(AtomicBool::new(false));
    let config = TransportConfig::builder()
        .with_address("transport-flaky")
        .with_mailbox(11, 64)
        .with_size(4 * 1024 * 1024)
        .build()
        .unwrap();
    let factory = FlakyFactory {
        inner: MemcpyXferFactory::new(),
        offline: Arc::clone(&offline),
    };
    let t = Transport::with_factory(config, Arc::new(factory)).unwrap();

    let healthy = t.create_local_circuit(&ports(1, 2, 64), &[ports(1, 2, 64)]).unwrap();
    offline.store(true, Ordering::SeqCst);
    let broken = t.create_local_circuit(&ports(1, 2, 64), &[ports(1, 2, 64)]).unwrap();

    t.circuit(broken).unwrap().lock().send(0, b"lost", false).unwrap();
    t.circuit(healthy).unwrap().lock().send(0, b"kept", false).unwrap();
    for _ in 0..3 {
        t.dispatch().unwrap();
    }

    let (_, data) = t
        .circuit(healthy)
        .unwrap()
        .lock()
        .take(0, 0)
        .unwrap()
        .expect("the healthy circuit kept moving");
    assert_eq!(data, b"kept");
    assert!(matches!(
        t.wait_ready(broken, Duration::ZERO),
        Err(TransportError::Io(_))
    ));
}
