// C API tests: the same calls a C host makes, through raw pointers.
// Run with: cargo test --test ffi -- --nocapture

use dmxp_transport::ffi::*;
use std::ffi::CString;
use std::ptr;

fn open(descriptor: &str) -> *mut TransportHandle {
    let name = CString::new(descriptor).unwrap();
    let handle = unsafe { dmxp_transport_new(name.as_ptr()) };
    assert!(!handle.is_null(), "failed to open {descriptor}");
    handle
}

fn local_circuit(handle: *mut TransportHandle, buffers: u32) -> u32 {
    let mut id = 0u32;
    let rc = unsafe { dmxp_circuit_new_local(handle, 1, 1, buffers, 256, &mut id) };
    assert_eq!(rc, DMXP_SUCCESS);
    id
}

fn receive(handle: *mut TransportHandle, id: u32, capacity: usize) -> (i32, Vec<u8>) {
    let mut buf = vec![0u8; capacity];
    let mut len = buf.len();
    let rc = unsafe { dmxp_circuit_receive(handle, id, 0, buf.as_mut_ptr(), &mut len) };
    buf.truncate(len.min(capacity));
    (rc, buf)
}

#[test]
fn test_send_and_receive() {
    let handle = open("dmxp-heap:ffi-roundtrip;1048576.1.16");
    let id = local_circuit(handle, 2);

    let (rc, _) = receive(handle, id, 64);
    assert_eq!(rc, DMXP_ERROR_EMPTY);

    let payload = b"hello from C";
    let rc = unsafe { dmxp_circuit_send(handle, id, 0, payload.as_ptr(), payload.len()) };
    assert_eq!(rc, DMXP_SUCCESS);

    let (rc, data) = receive(handle, id, 64);
    assert_eq!(rc, DMXP_SUCCESS);
    assert_eq!(data, payload);

    let (rc, _) = receive(handle, id, 64);
    assert_eq!(rc, DMXP_ERROR_EMPTY);

    assert_eq!(unsafe { dmxp_transport_dispatch(handle) }, DMXP_SUCCESS);
    assert_eq!(unsafe { dmxp_circuit_release(handle, id) }, DMXP_SUCCESS);
    assert_eq!(unsafe { dmxp_circuit_release(handle, id) }, DMXP_ERROR_UNKNOWN_CIRCUIT);
    unsafe { dmxp_transport_free(handle) };
}

#[test]
fn test_small_receive_buffer_keeps_message() {
    let handle = open("dmxp-heap:ffi-small;1048576.2.16");
    let id = local_circuit(handle, 2);

    let payload = [7u8; 100];
    let rc = unsafe { dmxp_circuit_send(handle, id, 0, payload.as_ptr(), payload.len()) };
    assert_eq!(rc, DMXP_SUCCESS);

    let mut small = [0u8; 10];
    let mut len = small.len();
    let rc = unsafe { dmxp_circuit_receive(handle, id, 0, small.as_mut_ptr(), &mut len) };
    assert_eq!(rc, DMXP_ERROR_INVALID_ARG);
    assert_eq!(len, 100);

    let (rc, data) = receive(handle, id, 128);
    assert_eq!(rc, DMXP_SUCCESS);
    assert_eq!(data, payload);
    unsafe { dmxp_transport_free(handle) };
}

#[test]
fn test_busy_until_consumed() {
    // Zero-copy is on by default: an output buffer stays busy while the
    // input buffer reading it is full
    let handle = open("dmxp-heap:ffi-busy;1048576.3.16");
    let id = local_circuit(handle, 2);

    for msg in [b"one", b"two"] {
        let rc = unsafe { dmxp_circuit_send(handle, id, 0, msg.as_ptr(), msg.len()) };
        assert_eq!(rc, DMXP_SUCCESS);
    }
    let rc = unsafe { dmxp_circuit_send(handle, id, 0, b"three".as_ptr(), 5) };
    assert_eq!(rc, DMXP_ERROR_BUSY);

    let (rc, data) = receive(handle, id, 16);
    assert_eq!(rc, DMXP_SUCCESS);
    assert_eq!(data, b"one");

    let rc = unsafe { dmxp_circuit_send(handle, id, 0, b"three".as_ptr(), 5) };
    assert_eq!(rc, DMXP_SUCCESS);
    for expected in [&b"two"[..], &b"three"[..]] {
        let (rc, data) = receive(handle, id, 16);
        assert_eq!(rc, DMXP_SUCCESS);
        assert_eq!(data, expected);
    }
    unsafe { dmxp_transport_free(handle) };
}

#[test]
fn test_invalid_arguments() {
    assert!(unsafe { dmxp_transport_new(ptr::null()) }.is_null());
    let bad = CString::new("not-an-endpoint").unwrap();
    assert!(unsafe { dmxp_transport_new(bad.as_ptr()) }.is_null());

    assert_eq!(unsafe { dmxp_transport_dispatch(ptr::null_mut()) }, DMXP_ERROR_NULL_POINTER);
    let handle = open("dmxp-heap:ffi-invalid;1048576.4.16");
    let mut id = 0u32;
    let rc = unsafe { dmxp_circuit_new_local(handle, 0, 1, 2, 64, &mut id) };
    assert_eq!(rc, DMXP_ERROR_INVALID_ARG);
    let rc = unsafe { dmxp_circuit_send(handle, 42, 0, b"x".as_ptr(), 1) };
    assert_eq!(rc, DMXP_ERROR_UNKNOWN_CIRCUIT);

    let id = local_circuit(handle, 2);
    let rc = unsafe { dmxp_circuit_send(handle, id, 0, [0u8; 300].as_ptr(), 300) };
    assert_eq!(rc, DMXP_ERROR_INVALID_ARG);
    unsafe { dmxp_transport_free(handle) };
}
