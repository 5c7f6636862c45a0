use crate::error::TransportError;
use crate::DataTransport::builder::{PortSetDescriptor, TransportConfig};
use crate::DataTransport::circuit::ProduceStatus;
use crate::DataTransport::transport::Transport;
use std::ffi::{c_char, CStr};
use std::ptr;

// Error codes
pub const DMXP_SUCCESS: i32 = 0;
pub const DMXP_ERROR_NULL_POINTER: i32 = -1;
pub const DMXP_ERROR_INVALID_ARG: i32 = -2;
pub const DMXP_ERROR_ALLOCATION_FAILED: i32 = -3;
pub const DMXP_ERROR_BUSY: i32 = -4;
pub const DMXP_ERROR_EMPTY: i32 = -5;
pub const DMXP_ERROR_INTERNAL: i32 = -6;
pub const DMXP_ERROR_UNKNOWN_CIRCUIT: i32 = -7;
pub const DMXP_ERROR_UNSUPPORTED: i32 = -8;

/// Handle to a transport instance (opaque pointer)
pub struct TransportHandle {
    inner: Transport,
}

fn status(error: &TransportError) -> i32 {
    match error {
        TransportError::UnknownCircuit { .. } => DMXP_ERROR_UNKNOWN_CIRCUIT,
        TransportError::UnsupportedController { .. } => DMXP_ERROR_UNSUPPORTED,
        TransportError::OutOfMemory { .. } | TransportError::CapacityExceeded { .. } => {
            DMXP_ERROR_ALLOCATION_FAILED
        }
        TransportError::InvalidConfig { .. }
        | TransportError::InvalidEndpoint { .. }
        | TransportError::InvalidPartition { .. }
        | TransportError::UnknownPort { .. }
        | TransportError::OutOfBounds { .. } => DMXP_ERROR_INVALID_ARG,
        _ => DMXP_ERROR_INTERNAL,
    }
}

// -----------------------------------------------------------------------------
// Transport API
// -----------------------------------------------------------------------------

/// Create a transport on a new endpoint.
///
/// # Arguments
/// * `endpoint` - NUL-terminated endpoint descriptor, e.g.
///   `dmxp-heap:node0;16777216.1.16`.
///
/// # Returns
/// * Pointer to `TransportHandle`, or NULL on failure.
///
/// # Safety
/// `endpoint` must be NULL or point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn dmxp_transport_new(endpoint: *const c_char) -> *mut TransportHandle {
    if endpoint.is_null() {
        return ptr::null_mut();
    }
    let Ok(text) = CStr::from_ptr(endpoint).to_str() else {
        tracing::error!("FFI: endpoint descriptor is not UTF-8");
        return ptr::null_mut();
    };

    let config = TransportConfig::builder()
        .with_endpoint(text)
        .and_then(|b| b.build());
    match config.and_then(Transport::new) {
        Ok(transport) => Box::into_raw(Box::new(TransportHandle { inner: transport })),
        Err(e) => {
            tracing::error!(error = %e, "FFI: failed to create transport");
            ptr::null_mut()
        }
    }
}

/// Serve the mailbox and progress every circuit once.
///
/// # Safety
/// `handle` must be NULL or a pointer returned by `dmxp_transport_new`.
#[no_mangle]
pub unsafe extern "C" fn dmxp_transport_dispatch(handle: *mut TransportHandle) -> i32 {
    if handle.is_null() {
        return DMXP_ERROR_NULL_POINTER;
    }
    match (*handle).inner.dispatch() {
        Ok(()) => DMXP_SUCCESS,
        Err(e) => status(&e),
    }
}

/// Free a transport handle and every circuit it owns.
///
/// # Safety
/// `handle` must be NULL or a pointer returned by `dmxp_transport_new`
/// that has not been freed.
#[no_mangle]
pub unsafe extern "C" fn dmxp_transport_free(handle: *mut TransportHandle) {
    if !handle.is_null() {
        let _ = Box::from_raw(handle); // Dropped automatically
    }
}

// -----------------------------------------------------------------------------
// Circuit API
// -----------------------------------------------------------------------------

/// Create a local circuit: `ports` output ports feeding one input PortSet of
/// `input_ports` ports, both with `buffers` buffers of `buffer_size` bytes.
///
/// # Returns
/// * 0 on success with the circuit id in `out_id`, negative error code
///   otherwise.
///
/// # Safety
/// `handle` must come from `dmxp_transport_new`; `out_id` must be NULL or
/// writable.
#[no_mangle]
pub unsafe extern "C" fn dmxp_circuit_new_local(
    handle: *mut TransportHandle,
    ports: u32,
    input_ports: u32,
    buffers: u32,
    buffer_size: u32,
    out_id: *mut u32,
) -> i32 {
    if handle.is_null() || out_id.is_null() {
        return DMXP_ERROR_NULL_POINTER;
    }
    let output = PortSetDescriptor::new()
        .with_ports(ports as usize)
        .with_buffers(buffers as usize, buffer_size as usize);
    let input = PortSetDescriptor::new()
        .with_ports(input_ports as usize)
        .with_buffers(buffers as usize, buffer_size as usize);

    match (*handle).inner.create_local_circuit(&output, &[input]) {
        Ok(id) => {
            *out_id = id;
            DMXP_SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "FFI: failed to create circuit");
            status(&e)
        }
    }
}

/// Copy `len` bytes into the next empty buffer of output `port` and hand it
/// off.
///
/// # Returns
/// * 0 on success.
/// * DMXP_ERROR_BUSY if no output buffer is empty or the hand-off queued.
///
/// # Safety
/// `handle` must come from `dmxp_transport_new`; `data` must point to `len`
/// readable bytes.
#[no_mangle]
pub unsafe extern "C" fn dmxp_circuit_send(
    handle: *mut TransportHandle,
    circuit_id: u32,
    port: u32,
    data: *const u8,
    len: usize,
) -> i32 {
    if handle.is_null() || data.is_null() {
        return DMXP_ERROR_NULL_POINTER;
    }
    let slice = std::slice::from_raw_parts(data, len);
    let circuit = match (*handle).inner.circuit(circuit_id) {
        Ok(c) => c,
        Err(e) => return status(&e),
    };
    let mut circuit = circuit.lock();
    let sent = circuit
        .check_queued_transfers()
        .and_then(|_| circuit.send(port as usize, slice, false));
    match sent {
        Ok(Some(ProduceStatus::Issued { .. })) => DMXP_SUCCESS,
        Ok(Some(ProduceStatus::Queued)) | Ok(None) => DMXP_ERROR_BUSY,
        Ok(Some(ProduceStatus::Ignored)) => DMXP_ERROR_INTERNAL,
        Err(e) => status(&e),
    }
}

/// Receive the next full buffer of input `port`.
///
/// # Arguments
/// * `out_buf` - Buffer to write the payload into.
/// * `out_len` - Input: size of buf, Output: size of payload received.
///
/// # Returns
/// * 0 on success.
/// * DMXP_ERROR_EMPTY if nothing has arrived.
/// * DMXP_ERROR_INVALID_ARG if the buffer is too small; the payload stays
///   queued and `out_len` holds its size.
///
/// # Safety
/// `handle` must come from `dmxp_transport_new`; `out_len` must be
/// writable and `out_buf` must hold `*out_len` bytes.
#[no_mangle]
pub unsafe extern "C" fn dmxp_circuit_receive(
    handle: *mut TransportHandle,
    circuit_id: u32,
    port: u32,
    out_buf: *mut u8,
    out_len: *mut usize,
) -> i32 {
    if handle.is_null() || out_len.is_null() {
        return DMXP_ERROR_NULL_POINTER;
    }
    let max_len = *out_len;
    let circuit = match (*handle).inner.circuit(circuit_id) {
        Ok(c) => c,
        Err(e) => return status(&e),
    };
    let mut circuit = circuit.lock();
    let port = port as usize;

    let next = circuit
        .check_queued_transfers()
        .and_then(|_| circuit.get_next_full_input_buffer(0, port));
    let buffer = match next {
        Ok(Some(b)) => b,
        Ok(None) => return DMXP_ERROR_EMPTY,
        Err(e) => return status(&e),
    };

    let copied = match circuit.input_buffer(0, port, buffer) {
        Ok(data) => {
            *out_len = data.len();
            if data.len() > max_len {
                return DMXP_ERROR_INVALID_ARG; // Buffer too small
            }
            if !data.is_empty() {
                if out_buf.is_null() {
                    return DMXP_ERROR_NULL_POINTER;
                }
                ptr::copy_nonoverlapping(data.as_ptr(), out_buf, data.len());
            }
            DMXP_SUCCESS
        }
        Err(e) => status(&e),
    };
    if copied != DMXP_SUCCESS {
        return copied;
    }
    match circuit.consume(0, port, buffer) {
        Ok(()) => DMXP_SUCCESS,
        Err(e) => status(&e),
    }
}

/// Drop one reference to a circuit.
///
/// # Safety
/// `handle` must come from `dmxp_transport_new`.
#[no_mangle]
pub unsafe extern "C" fn dmxp_circuit_release(handle: *mut TransportHandle, circuit_id: u32) -> i32 {
    if handle.is_null() {
        return DMXP_ERROR_NULL_POINTER;
    }
    match (*handle).inner.release_circuit(circuit_id) {
        Ok(()) => DMXP_SUCCESS,
        Err(e) => status(&e),
    }
}
