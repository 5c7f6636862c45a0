// Mailbox wire structures
// Every struct here is copied byte-for-byte between endpoints; field order
// and padding are part of the protocol.

use crate::error::{Result, TransportError};

/// Bytes reserved for an endpoint name in wire structs (NUL padded).
pub const END_POINT_NAME_LEN: usize = 128;

/// Request type word; zero means the slot is free.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RequestType {
    NoRequest = 0,
    ReqShadowRstateOffset = 1,
    ReqInputOffsets = 2,
    ReqOutputControlOffset = 3,
    ReqNewConnection = 4,
    ReqUpdateCircuit = 5,
}

impl RequestType {
    pub fn from_wire(value: u32) -> Result<Self> {
        Ok(match value {
            0 => RequestType::NoRequest,
            1 => RequestType::ReqShadowRstateOffset,
            2 => RequestType::ReqInputOffsets,
            3 => RequestType::ReqOutputControlOffset,
            4 => RequestType::ReqNewConnection,
            5 => RequestType::ReqUpdateCircuit,
            other => {
                return Err(TransportError::MalformedRequest {
                    message: format!("unknown request type {}", other),
                })
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            RequestType::NoRequest => "NoRequest",
            RequestType::ReqShadowRstateOffset => "ReqShadowRstateOffset",
            RequestType::ReqInputOffsets => "ReqInputOffsets",
            RequestType::ReqOutputControlOffset => "ReqOutputControlOffset",
            RequestType::ReqNewConnection => "ReqNewConnection",
            RequestType::ReqUpdateCircuit => "ReqUpdateCircuit",
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestHeader {
    pub request_type: u32,
    pub pad: u32,
    pub circuit_id: u32,
}

/// Final setup step: the producer tells a consumer port where its output
/// control block lives.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct RequestUpdateCircuit {
    pub sender_circuit_id: u32,
    pub receiver_port_id: u32,
    /// Number of updates the receiver must collect before closing.
    pub t_port_count: u32,
    pub sender_port_id: u32,
    pub sender_output_port_id: u32,
    pub _pad: u32,
    pub sender_output_control_offset: u64,
    pub output_end_point: [u8; END_POINT_NAME_LEN],
}

/// Opens a circuit on the receiving endpoint.
///
/// The trailing fields describe the requester's output PortSet so the
/// receiver can select its controller.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct RequestNewConnection {
    pub buffer_size: u32,
    /// 1 when the requester is the producing side.
    pub send: u32,
    /// Metadata header size the requester was built with.
    pub protocol_size: u32,
    pub output_end_point: [u8; END_POINT_NAME_LEN],
    pub output_port_count: u32,
    pub output_buffer_count: u32,
    /// Packed distribution, partition, role and flag-is-meta bytes.
    pub output_descriptor: u32,
    pub block_size: u32,
    pub _pad: u32,
}

/// Asks for the buffer offsets of one port.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct RequestPortOffsets {
    pub port_id: u32,
    pub producer_rank: u32,
    pub requester: [u8; END_POINT_NAME_LEN],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union RequestBody {
    pub update: RequestUpdateCircuit,
    pub connection: RequestNewConnection,
    pub offsets: RequestPortOffsets,
    pub raw: [u64; 20],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct ContainerRequest {
    pub header: RequestHeader,
    pub body: RequestBody,
}

/// One mailbox slot.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct MailBox {
    pub request: ContainerRequest,
    pub error_code: i32,
    pub return_mailbox_id: u32,
    /// Where the responder writes reply data, in the requester's endpoint.
    pub return_offset: u64,
    pub return_size: u32,
    pub _pad: u32,
}

/// Reply to `ReqNewConnection`: the receiver's input PortSet geometry.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionReply {
    pub circuit_id: u32,
    pub input_port_count: u32,
    pub input_buffer_count: u32,
    pub buffer_size: u32,
    pub input_descriptor: u32,
    pub block_size: u32,
}

/// Reply header for the offset requests, followed by `count` entries.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PortOffsetsWire {
    pub count: u32,
    pub _pad: u32,
    pub control_offset: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferOffsetsWire {
    pub data: u64,
    pub metadata: u64,
    pub state: u64,
}

impl Default for RequestBody {
    fn default() -> Self {
        RequestBody { raw: [0; 20] }
    }
}

impl Default for ContainerRequest {
    fn default() -> Self {
        ContainerRequest {
            header: RequestHeader::default(),
            body: RequestBody::default(),
        }
    }
}

impl Default for MailBox {
    fn default() -> Self {
        MailBox {
            request: ContainerRequest::default(),
            error_code: 0,
            return_mailbox_id: 0,
            return_offset: 0,
            return_size: 0,
            _pad: 0,
        }
    }
}

impl ContainerRequest {
    pub fn new(request_type: RequestType, circuit_id: u32, body: RequestBody) -> Self {
        ContainerRequest {
            header: RequestHeader {
                request_type: request_type as u32,
                pad: 0,
                circuit_id,
            },
            body,
        }
    }

    pub fn request_type(&self) -> Result<RequestType> {
        RequestType::from_wire(self.header.request_type)
    }
}

/// Copy `name` into a NUL padded wire field.
pub fn encode_name(name: &str) -> Result<[u8; END_POINT_NAME_LEN]> {
    if name.len() >= END_POINT_NAME_LEN {
        return Err(TransportError::MalformedRequest {
            message: format!("endpoint name '{}' too long", name),
        });
    }
    let mut out = [0u8; END_POINT_NAME_LEN];
    out[..name.len()].copy_from_slice(name.as_bytes());
    Ok(out)
}

pub fn decode_name(field: &[u8; END_POINT_NAME_LEN]) -> Result<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(END_POINT_NAME_LEN);
    std::str::from_utf8(&field[..end])
        .map(str::to_string)
        .map_err(|_| TransportError::MalformedRequest {
            message: "endpoint name is not UTF-8".into(),
        })
}

/// View a `#[repr(C)]` wire value as bytes.
pub fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
    }
}

/// Read a `#[repr(C)]` wire value from the front of `bytes`.
pub fn from_bytes<T: Copy>(bytes: &[u8]) -> Result<T> {
    if bytes.len() < std::mem::size_of::<T>() {
        return Err(TransportError::MalformedRequest {
            message: format!(
                "reply of {} bytes shorter than {}",
                bytes.len(),
                std::mem::size_of::<T>()
            ),
        });
    }
    Ok(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_wire_field() {
        let field = encode_name("dmxp-heap:a;4096.1.4").unwrap();
        assert_eq!(decode_name(&field).unwrap(), "dmxp-heap:a;4096.1.4");
        assert!(encode_name(&"x".repeat(END_POINT_NAME_LEN)).is_err());
    }

    #[test]
    fn unknown_request_types_are_malformed() {
        assert_eq!(RequestType::from_wire(5).unwrap(), RequestType::ReqUpdateCircuit);
        assert!(matches!(
            RequestType::from_wire(77),
            Err(TransportError::MalformedRequest { .. })
        ));
    }
}
