// In demos/fanout.rs
//
// One local circuit, one output port, two consumers:
//   set 0 - two ports receiving whole buffers round robin (Pattern 1)
//   set 1 - four ports each receiving a 64 byte block of every whole (Pattern 4)
// Every fifth buffer is broadcast instead. Set 1 reassembles the wholes
// from their blocks and both sets check the payload hash.
use dmxp_transport::DataTransport::Structs::BufferMetaData;
use dmxp_transport::DataTransport::{DataPartition, PortSetDescriptor, Transport, TransportConfig};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

const WHOLE: usize = 256;

fn payload(i: u64) -> Vec<u8> {
    let digest = Sha256::digest(i.to_le_bytes());
    digest.iter().copied().cycle().take(WHOLE).collect()
}

#[derive(Default)]
struct Reassembly {
    data: Vec<u8>,
    parts: u32,
}

fn main() -> dmxp_transport::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    let wholes: u64 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(200);

    let keep_alive = Arc::new(AtomicBool::new(true));
    let keep_alive_for_handler = Arc::clone(&keep_alive);
    ctrlc::set_handler(move || {
        keep_alive_for_handler.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl+C handler");

    let transport = Transport::new(
        TransportConfig::builder()
            .with_address("fanout")
            .with_mailbox(1, 4)
            .with_size(8 * 1024 * 1024)
            .build()?,
    )?;
    let output = PortSetDescriptor::new().with_ports(1).with_buffers(4, WHOLE);
    let wholes_set = PortSetDescriptor::new().with_ports(2).with_buffers(2, WHOLE);
    let blocks_set = PortSetDescriptor::new()
        .with_ports(4)
        .with_buffers(2, WHOLE)
        .with_partition(DataPartition::block(64));
    let id = transport.create_local_circuit(&output, &[wholes_set, blocks_set])?;
    let handle = transport.circuit(id)?;
    let mut circuit = handle.lock();
    for set in 0..2 {
        println!("Set {}: {:?}", set, circuit.controller(set)?.kind());
    }

    let start = Instant::now();
    let mut sent = 0u64;
    let mut whole_count = 0u64;
    let mut rebuilt = 0u64;
    let mut broadcast_copies = 0u64;
    let mut pending: HashMap<u64, Reassembly> = HashMap::new();
    let check = |meta: &BufferMetaData, data: &[u8]| {
        if data != payload(meta.sequence).as_slice() {
            eprintln!("Hash mismatch for buffer {}", meta.sequence);
        }
    };

    while (rebuilt + whole_count < 2 * wholes || sent < wholes) && keep_alive.load(Ordering::SeqCst) {
        circuit.check_queued_transfers()?;

        if sent < wholes {
            let broadcast = sent % 5 == 4;
            if circuit.send(0, &payload(sent), broadcast)?.is_some() {
                sent += 1;
            }
        }

        for port in 0..2 {
            if let Some((meta, data)) = circuit.take(0, port)? {
                check(&meta, &data);
                if meta.broadcast == 0 || port == 0 {
                    whole_count += 1;
                }
            }
        }

        for port in 0..4 {
            let Some((meta, data)) = circuit.take(1, port)? else {
                continue;
            };
            if meta.n_parts_per_whole <= 1 {
                // Broadcast copies arrive whole on every port
                check(&meta, &data);
                broadcast_copies += 1;
                if port == 0 {
                    rebuilt += 1;
                }
                continue;
            }
            let entry = pending.entry(meta.sequence).or_default();
            if entry.data.is_empty() {
                entry.data = vec![0; meta.shape.whole_length as usize];
            }
            let at = meta.shape.offset as usize;
            entry.data[at..at + data.len()].copy_from_slice(&data);
            entry.parts += 1;
            if entry.parts == meta.n_parts_per_whole {
                if let Some(done) = pending.remove(&meta.sequence) {
                    check(&meta, &done.data);
                    rebuilt += 1;
                }
            }
        }
    }

    println!(
        "Sent {} wholes: {} received whole, {} rebuilt from blocks ({} broadcast copies) in {:.2?}",
        sent,
        whole_count,
        rebuilt,
        broadcast_copies,
        start.elapsed()
    );
    Ok(())
}
