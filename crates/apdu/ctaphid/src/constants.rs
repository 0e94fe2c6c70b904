//! CTAPHID wire constants

/// Size of one HID report
pub const HID_PACKET_SIZE: usize = 64;

/// Header of an initialization packet: channel (4), command (1), length (2)
pub const INIT_HEADER_SIZE: usize = 7;

/// Header of a continuation packet: channel (4), sequence (1)
pub const CONT_HEADER_SIZE: usize = 5;

/// Payload bytes carried by an initialization packet
pub const INIT_PACKET_CAPACITY: usize = HID_PACKET_SIZE - INIT_HEADER_SIZE;

/// Payload bytes carried by a continuation packet
pub const CONT_PACKET_CAPACITY: usize = HID_PACKET_SIZE - CONT_HEADER_SIZE;

/// Highest number of continuation packets in one message
pub const MAX_CONT_PACKETS: usize = 128;

/// Largest payload one message can carry (7609 bytes)
pub const MAX_PAYLOAD: usize = INIT_PACKET_CAPACITY + MAX_CONT_PACKETS * CONT_PACKET_CAPACITY;

/// Channel used until a private one is negotiated
pub const BROADCAST_CHANNEL: u32 = 0xFFFF_FFFF;

/// Bit marking an initialization packet
pub const TYPE_INIT: u8 = 0x80;

/// Echo data through the device
pub const CTAPHID_PING: u8 = TYPE_INIT | 0x01;
/// Send a U2F/APDU message
pub const CTAPHID_MSG: u8 = TYPE_INIT | 0x03;
/// Lock the channel
pub const CTAPHID_LOCK: u8 = TYPE_INIT | 0x04;
/// Allocate a channel
pub const CTAPHID_INIT: u8 = TYPE_INIT | 0x06;
/// Ask the device to identify itself visually
pub const CTAPHID_WINK: u8 = TYPE_INIT | 0x08;
/// Send a CTAP2 CBOR message
pub const CTAPHID_CBOR: u8 = TYPE_INIT | 0x10;
/// Keepalive while the device is busy
pub const CTAPHID_KEEPALIVE: u8 = TYPE_INIT | 0x3B;
/// Error response
pub const CTAPHID_ERROR: u8 = TYPE_INIT | 0x3F;

/// Length of the INIT nonce
pub const INIT_NONCE_SIZE: usize = 8;

/// Length of an INIT response payload
pub const INIT_RESPONSE_SIZE: usize = 17;

/// Capability flag: device implements WINK
pub const CAPABILITY_WINK: u8 = 0x01;
/// Capability flag: device implements CBOR
pub const CAPABILITY_CBOR: u8 = 0x04;
/// Capability flag: device does not implement MSG
pub const CAPABILITY_NMSG: u8 = 0x08;

/// Keepalive status: still processing
pub const KEEPALIVE_PROCESSING: u8 = 1;
/// Keepalive status: waiting for user presence
pub const KEEPALIVE_UP_NEEDED: u8 = 2;
