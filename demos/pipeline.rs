// In demos/pipeline.rs
//
// Two endpoints in one process: a producer opens a circuit to a consumer
// over the mailbox protocol and streams "number:sha256" messages through it.
// The consumer recomputes every hash. Ctrl+C stops both sides.
use dmxp_transport::DataTransport::{PortSetDescriptor, Transport, TransportConfig};
use sha2::{Digest, Sha256};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const PRODUCER: &str = "dmxp-heap:pipeline-producer;16777216.1.16";
const CONSUMER: &str = "dmxp-heap:pipeline-consumer;16777216.2.16";

fn hash_of(i: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("message_{}", i).as_bytes());
    format!("{:x}", hasher.finalize())
}

fn main() -> dmxp_transport::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    let num_messages: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(1000);

    let keep_alive = Arc::new(AtomicBool::new(true));
    let keep_alive_for_handler = Arc::clone(&keep_alive);

    // Handle Ctrl+C to stop both sides
    ctrlc::set_handler(move || {
        keep_alive_for_handler.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl+C handler");

    let ports = PortSetDescriptor::new().with_ports(2).with_buffers(4, 256);
    let consumer = Arc::new(Transport::new(
        TransportConfig::builder()
            .with_endpoint(CONSUMER)?
            .with_default_input(ports.clone())
            .build()?,
    )?);
    let producer = Transport::new(TransportConfig::builder().with_endpoint(PRODUCER)?.build()?)?;

    let consumer_thread = {
        let consumer = Arc::clone(&consumer);
        let keep_alive = Arc::clone(&keep_alive);
        std::thread::spawn(move || -> dmxp_transport::Result<usize> {
            let id = loop {
                consumer.dispatch()?;
                if let Some(id) = consumer.accepted_circuits().first().copied() {
                    break id;
                }
                if !keep_alive.load(Ordering::SeqCst) {
                    return Ok(0);
                }
                std::thread::sleep(Duration::from_millis(1));
            };
            let circuit = consumer.wait_ready(id, Duration::from_secs(5))?;
            println!("Consumer: circuit {:#010x} ready", id);

            let mut received = 0;
            let mut port = 0;
            while received < num_messages && keep_alive.load(Ordering::SeqCst) {
                consumer.dispatch()?;
                let mut c = circuit.lock();
                let Some((meta, data)) = c.take(0, port)? else {
                    drop(c);
                    port = (port + 1) % 2;
                    std::thread::sleep(Duration::from_micros(10));
                    continue;
                };
                let message = String::from_utf8_lossy(&data);
                match message.split_once(':') {
                    Some((n, hash)) if n.parse().map(hash_of).ok().as_deref() == Some(hash) => {}
                    _ => eprintln!("Consumer: bad message {} from rank {}", message, meta.src_rank),
                }
                received += 1;
                if received % 100 == 0 {
                    println!("--- Received {} messages ---", received);
                }
            }
            Ok(received)
        })
    };

    let id = producer.connect(CONSUMER, &ports)?;
    let circuit = loop {
        match producer.wait_ready(id, Duration::from_millis(10)) {
            Ok(circuit) => break circuit,
            Err(dmxp_transport::TransportError::Timeout { .. }) if keep_alive.load(Ordering::SeqCst) => {}
            Err(e) => return Err(e),
        }
    };
    println!("Producer: circuit {:#010x} ready", id);

    let start = Instant::now();
    let mut sent = 0;
    while sent < num_messages && keep_alive.load(Ordering::SeqCst) {
        producer.dispatch()?;
        let message = format!("{}:{}", sent, hash_of(sent));
        let mut c = circuit.lock();
        if c.send(sent % 2, message.as_bytes(), false)?.is_some() {
            sent += 1;
        } else {
            drop(c);
            std::thread::sleep(Duration::from_micros(10));
        }
    }

    // Keep progressing hand-offs until the consumer is done
    while !consumer_thread.is_finished() {
        producer.dispatch()?;
        std::thread::sleep(Duration::from_micros(50));
    }
    let received = consumer_thread
        .join()
        .map_err(|_| dmxp_transport::TransportError::InvalidState {
            message: "consumer thread panicked".into(),
        })??;

    println!(
        "Sent {} and received {} messages in {:.2?}",
        sent,
        received,
        start.elapsed()
    );
    Ok(())
}
