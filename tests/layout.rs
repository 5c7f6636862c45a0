// Layout conformance tests for ABI stability across endpoints.
// These tests assert sizes, alignments, and field offsets for the
// metadata header, the port control blocks and the mailbox wire structs.
// They also print the observed values to aid debugging when a mismatch
// occurs on a given platform.
use dmxp_transport::DataTransport::Structs::Buffer_Structs::{
    BufferMetaData, InputPortControl, OutputPortControl, PartShape,
};
use dmxp_transport::DataTransport::Structs::Mailbox_Structs::{
    BufferOffsetsWire, ConnectionReply, ContainerRequest, MailBox, PortOffsetsWire, RequestBody,
    RequestNewConnection, RequestPortOffsets, RequestUpdateCircuit, END_POINT_NAME_LEN,
};
use memoffset::offset_of;
use std::mem::{align_of, size_of};

#[test]
fn test_buffer_metadata_layout() {
    let size = size_of::<BufferMetaData>();
    let align = align_of::<BufferMetaData>();
    let off_length = offset_of!(BufferMetaData, length);
    let off_n_parts = offset_of!(BufferMetaData, n_parts_per_whole);
    let off_eos = offset_of!(BufferMetaData, end_of_stream);
    let off_shape = offset_of!(BufferMetaData, shape);

    println!(
        "BufferMetaData => size: {size}, align: {align}, offsets: [length:{off_length}, n_parts_per_whole:{off_n_parts}, end_of_stream:{off_eos}, shape:{off_shape}]"
    );

    // The header size is announced as protocol_size during connection setup
    assert_eq!(size, 80);
    assert_eq!(align, align_of::<u64>());
    assert_eq!(offset_of!(BufferMetaData, sequence), 0);
    assert_eq!(offset_of!(BufferMetaData, timestamp), 8);
    assert_eq!(offset_of!(BufferMetaData, state_offset), 16);
    assert_eq!(off_length, 24);
    assert_eq!(offset_of!(BufferMetaData, op_code), 28);
    assert_eq!(offset_of!(BufferMetaData, user_tag), 32);
    assert_eq!(offset_of!(BufferMetaData, src_rank), 36);
    assert_eq!(offset_of!(BufferMetaData, src_temporal_id), 40);
    assert_eq!(off_n_parts, 44);
    assert_eq!(offset_of!(BufferMetaData, parts_sequence), 48);
    assert_eq!(off_eos, 52);
    assert_eq!(offset_of!(BufferMetaData, broadcast), 55);
    assert_eq!(offset_of!(BufferMetaData, end_of_whole), 57);
    assert_eq!(offset_of!(BufferMetaData, zero_copy), 58);
    assert_eq!(off_shape, 60);
    assert_eq!(size_of::<PartShape>(), 16);
}

#[test]
fn test_port_control_layout() {
    assert_eq!(size_of::<OutputPortControl>(), 16);
    assert_eq!(offset_of!(OutputPortControl, sequential_token), 0);
    assert_eq!(offset_of!(OutputPortControl, next_token), 4);
    assert_eq!(offset_of!(OutputPortControl, full_flag), 8);
    assert_eq!(offset_of!(OutputPortControl, empty_flag), 12);

    assert_eq!(size_of::<InputPortControl>(), 8);
    assert_eq!(offset_of!(InputPortControl, empty_flag), 0);
    assert_eq!(offset_of!(InputPortControl, full_flag), 4);
}

#[test]
fn test_mailbox_layout() {
    let body = size_of::<RequestBody>();
    let request = size_of::<ContainerRequest>();
    let mailbox = size_of::<MailBox>();
    println!("RequestBody => {body}, ContainerRequest => {request}, MailBox => {mailbox}");

    assert_eq!(END_POINT_NAME_LEN, 128);
    assert_eq!(size_of::<RequestNewConnection>(), 160);
    assert_eq!(size_of::<RequestUpdateCircuit>(), 160);
    assert_eq!(size_of::<RequestPortOffsets>(), 136);
    assert_eq!(body, 160);

    assert_eq!(offset_of!(RequestNewConnection, output_end_point), 12);
    assert_eq!(offset_of!(RequestNewConnection, output_port_count), 140);
    assert_eq!(offset_of!(RequestUpdateCircuit, sender_output_control_offset), 24);
    assert_eq!(offset_of!(RequestUpdateCircuit, output_end_point), 32);

    assert_eq!(offset_of!(ContainerRequest, body), 16);
    assert_eq!(request, 176);
    assert_eq!(offset_of!(MailBox, error_code), 176);
    assert_eq!(offset_of!(MailBox, return_offset), 184);
    assert_eq!(mailbox, 200);
}

#[test]
fn test_reply_layout() {
    assert_eq!(size_of::<ConnectionReply>(), 24);
    assert_eq!(size_of::<PortOffsetsWire>(), 16);
    assert_eq!(offset_of!(PortOffsetsWire, control_offset), 8);
    assert_eq!(size_of::<BufferOffsetsWire>(), 24);
}
