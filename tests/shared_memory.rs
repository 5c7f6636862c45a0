// Shared memory backend tests for Linux
// Run with: cargo test --test shared_memory -- --nocapture

#[cfg(target_os = "linux")]
mod linux_tests {
    use dmxp_transport::Core::endpoint::registry;
    use dmxp_transport::Core::{
        attach_shared_memory, create_shared_memory, Endpoint, EndpointDescriptor, EndpointProtocol,
        RawHandle,
    };
    use dmxp_transport::DataTransport::{PortSetDescriptor, Transport, TransportConfig};
    use dmxp_transport::TransportError;
    use std::time::Duration;

    fn cleanup(name: &str) {
        let _ = std::fs::remove_file(format!("/dev/shm/{}", name));
    }

    #[test]
    fn test_create_and_attach_region() {
        let name = "dmxp-test-region";
        let size = 8192;
        let shm = create_shared_memory(size, name).unwrap();
        assert_eq!(shm.size(), size);
        assert!(!shm.as_ptr().is_null());
        match shm.raw_handle() {
            RawHandle::Fd(fd) => assert!(fd > 0, "File descriptor should be positive"),
            RawHandle::None => panic!("a /dev/shm region has a descriptor"),
        }

        let attached = attach_shared_memory(name, size).unwrap();
        unsafe {
            let ours = std::slice::from_raw_parts_mut(shm.as_ptr(), size);
            let theirs = std::slice::from_raw_parts_mut(attached.as_ptr(), size);
            for i in 0..size {
                ours[i] = (i % 251) as u8;
            }
            for i in 0..size {
                assert_eq!(theirs[i], (i % 251) as u8, "writes must be visible through both maps");
            }
            theirs[100] = 0xAA;
            assert_eq!(ours[100], 0xAA);
        }
        cleanup(name);
    }

    #[test]
    fn test_region_is_zero_initialized() {
        let name = "dmxp-test-zero";
        let size = 1024;
        let shm = create_shared_memory(size, name).unwrap();
        unsafe {
            let slice = std::slice::from_raw_parts(shm.as_ptr(), size);
            assert!(slice.iter().all(|&b| b == 0), "Mmap'd memory should be zero-initialized");
        }
        cleanup(name);
    }

    #[test]
    fn test_attach_errors() {
        let err = attach_shared_memory("dmxp-test-missing", 4096).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);

        let name = "dmxp-test-small";
        let _shm = create_shared_memory(4096, name).unwrap();
        let err = attach_shared_memory(name, 8192).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        cleanup(name);
    }

    #[test]
    fn test_attached_endpoint_shares_the_heap() {
        let text = "dmxp-shm:dmxp-test-endpoint;1048576.41.64";
        let descriptor = EndpointDescriptor::parse(text).unwrap();
        let owner = Endpoint::create(descriptor.clone()).unwrap();
        let offset = owner.alloc(256).unwrap();
        owner.write(offset, &0xfeed_beef_u64).unwrap();

        let attached = Endpoint::attach(descriptor).unwrap();
        assert!(attached.is_initialized());
        assert_eq!(attached.layout_version(), owner.layout_version());
        assert_eq!(attached.heap_start(), owner.heap_start());
        assert_eq!(owner.allocation_count(), 1);
        assert!(registry::local_endpoints().contains(&text.to_string()));
        assert!(owner.is_owner());
        assert!(!attached.is_owner());
        assert_eq!(attached.name(), text);
        assert_eq!(attached.read::<u64>(offset).unwrap(), 0xfeed_beef);
        assert!(matches!(
            attached.alloc(16),
            Err(TransportError::InvalidState { .. })
        ));

        let wrong_mailbox = EndpointDescriptor::parse("dmxp-shm:dmxp-test-endpoint;1048576.42.64").unwrap();
        assert!(matches!(
            Endpoint::attach(wrong_mailbox),
            Err(TransportError::InvalidEndpoint { .. })
        ));
        let heap = EndpointDescriptor::parse("dmxp-heap:dmxp-test-endpoint;1048576.41.64").unwrap();
        assert!(matches!(
            Endpoint::attach(heap),
            Err(TransportError::InvalidEndpoint { .. })
        ));
        cleanup("dmxp-test-endpoint");
    }

    #[test]
    fn test_transport_over_shm_endpoints() {
        let config = |address: &str, mailbox: u16| {
            TransportConfig::builder()
                .with_protocol(EndpointProtocol::Shm)
                .with_address(address)
                .with_mailbox(mailbox, 64)
                .with_size(2 * 1024 * 1024)
                .build()
                .unwrap()
        };
        let producer = Transport::new(config("dmxp-test-shm-a", 43)).unwrap();
        let consumer = Transport::new(config("dmxp-test-shm-b", 44)).unwrap();
        assert!(producer.endpoint().name().starts_with("dmxp-shm:"));

        let output = PortSetDescriptor::new().with_ports(1).with_buffers(2, 512);
        let id = producer.connect(consumer.endpoint().name(), &output).unwrap();

        let mut received = None;
        for _ in 0..2000 {
            let ready = match producer.wait_ready(id, Duration::ZERO) {
                Ok(handle) => Some(handle),
                Err(TransportError::Timeout { .. }) => None,
                Err(e) => panic!("setup failed: {e}"),
            };
            consumer.dispatch().unwrap();
            if let Some(handle) = ready {
                handle.lock().send(0, b"over /dev/shm", false).unwrap();
            }
            if let Ok(theirs) = consumer.circuit(id) {
                if let Some((_, data)) = theirs.lock().take(0, 0).unwrap() {
                    received = Some(data);
                    break;
                }
            }
        }
        assert_eq!(received.as_deref(), Some(&b"over /dev/shm"[..]));

        drop(producer);
        drop(consumer);
        cleanup("dmxp-test-shm-a");
        cleanup("dmxp-test-shm-b");
    }
}

#[cfg(not(target_os = "linux"))]
mod non_linux_tests {
    use dmxp_transport::Core::{attach_shared_memory, create_shared_memory};

    #[test]
    fn test_unsupported_platform() {
        let result = create_shared_memory(4096, "test");
        assert!(result.is_err());

        if let Err(err) = result {
            assert_eq!(err.kind(), std::io::ErrorKind::Unsupported);
        }
    }

    #[test]
    fn test_attach_unsupported_platform() {
        let result = attach_shared_memory("test", 4096);
        assert!(result.is_err());

        if let Err(err) = result {
            assert_eq!(err.kind(), std::io::ErrorKind::Unsupported);
        }
    }
}
