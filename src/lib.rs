// Module naming follows project convention (DataTransport = circuits, ports and
// the controllers that move buffers between them)
#[allow(non_snake_case)]
pub mod Core {
    pub mod SharedMemory;
    pub use SharedMemory::{
        attach_shared_memory, create_heap_memory, create_shared_memory, RawHandle,
        SharedMemoryBackend,
    };
    pub mod endpoint;
    pub use endpoint::{Endpoint, EndpointDescriptor, EndpointProtocol};
    pub mod xfer;
    pub use xfer::{MemcpyXferFactory, XferFactory, XferKind, XferRequest, XferServices, XferStatus};
}

#[allow(non_snake_case)]
pub mod DataTransport {
    #[allow(clippy::module_inception)]
    pub mod Buffer {
        pub mod Buffer;
        pub mod Buffer_impl;
        pub mod layout;
        pub use self::Buffer::{BufferOffsets, Direction, InputRef, OutputRef, ZeroCopyLink}; // re-export for stable path
    }
    pub mod Structs {
        pub mod Buffer_Structs;
        pub mod Mailbox_Structs;
        pub use Buffer_Structs::{BufferMetaData, PartShape, FLAG_EMPTY, FLAG_FULL}; // re-export for stable path
    }
    pub mod builder;
    pub mod circuit;
    pub mod controller;
    pub mod distribution;
    pub mod mailbox;
    pub mod port;
    pub mod port_set;
    pub mod transfer;
    pub mod transport;

    pub use builder::{PortSetDescriptor, TransportConfig, TransportConfigBuilder};
    pub use circuit::{Circuit, CircuitState, ProduceStatus};
    pub use controller::{ControllerKey, ControllerKind};
    pub use distribution::{DataDistribution, DataPartition, DistributionType, PartitionType};
    pub use port::Role;
    pub use transport::{CircuitHandle, Transport};
}

#[allow(non_snake_case)]
pub mod Debug {
    pub mod StructDebug;
}

pub mod error;
pub mod ffi;

pub use error::{Result, TransportError};
