// Allocation tracking for the circuit data path
//
// Run dhat test:
//   cargo test --test allocation_test track_allocations_with_dhat -- --nocapture
//
// Run memory-stats test:
//   cargo test --test allocation_test track_allocations_with_memory_stats -- --nocapture
//
// Tests using dhat are marked #[serial_test::serial]: dhat only allows one
// profiler at a time.

use dmxp_transport::DataTransport::{PortSetDescriptor, Transport, TransportConfig};

#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

fn local_transport(address: &str, mailbox: u16) -> (Transport, u32) {
    let config = TransportConfig::builder()
        .with_address(address)
        .with_mailbox(mailbox, 16)
        .with_size(4 * 1024 * 1024)
        .with_zero_copy(false)
        .build()
        .unwrap();
    let transport = Transport::new(config).unwrap();
    let ports = PortSetDescriptor::new().with_ports(1).with_buffers(4, 1024);
    let id = transport
        .create_local_circuit(&ports, &[ports.clone().with_ports(2)])
        .unwrap();
    (transport, id)
}

/// One produce, completion and consume without copying the payload out.
fn cycle(transport: &Transport, id: u32, i: usize, payload: &[u8]) {
    let handle = transport.circuit(id).unwrap();
    let mut c = handle.lock();
    let ob = c.get_next_empty_output_buffer(0).unwrap().expect("output buffer free");
    c.output_buffer_mut(0, ob).unwrap()[..payload.len()].copy_from_slice(payload);
    c.output_metadata_mut(0, ob).unwrap().length = payload.len() as u32;
    c.produce(0, ob, false).unwrap();
    c.check_queued_transfers().unwrap();

    let port = i % 2;
    let ib = c.get_next_full_input_buffer(0, port).unwrap().expect("input buffer full");
    assert_eq!(c.input_buffer(0, port, ib).unwrap().len(), payload.len());
    c.consume(0, port, ib).unwrap();
}

#[test]
#[serial_test::serial]
fn track_allocations_with_dhat() {
    let _profiler = dhat::Profiler::builder().testing().build();

    let (transport, id) = local_transport("alloc-dhat", 1);
    let payload = vec![1u8; 100];

    // Warm up so every map and queue reaches its working capacity
    for i in 0..16 {
        cycle(&transport, id, i, &payload);
    }
    let before = dhat::HeapStats::get();

    for i in 16..1016 {
        cycle(&transport, id, i, &payload);
    }
    let after = dhat::HeapStats::get();

    println!(
        "After 1000 produce/consume cycles: {} blocks allocated, {} bytes live (was {})",
        after.total_blocks - before.total_blocks,
        after.curr_bytes,
        before.curr_bytes
    );
    dhat::assert!(after.curr_bytes <= before.curr_bytes, "the data path must not retain memory");
}

#[test]
#[serial_test::serial]
fn track_allocations_with_memory_stats() {
    use memory_stats::memory_stats;

    let before = memory_stats();
    println!("Memory before: {:?}", before);

    let (transport, id) = local_transport("alloc-stats", 2);
    let payload = vec![2u8; 512];
    for i in 0..1000 {
        cycle(&transport, id, i, &payload);
    }

    let after = memory_stats();
    println!("Memory after: {:?}", after);

    if let (Some(b), Some(a)) = (before, after) {
        println!(
            "Memory delta: {} bytes",
            a.physical_mem as i64 - b.physical_mem as i64
        );
    }
    println!(
        "Endpoint heap in use: {} bytes",
        transport.endpoint().used_memory()
    );
}
