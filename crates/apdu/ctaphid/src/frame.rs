//! CTAPHID message framing
//!
//! A message is split into one initialization packet followed by as many
//! continuation packets as needed:
//!
//! ```text
//! init:         | channel (4) | cmd | len_hi | len_lo | payload (57)  |
//! continuation: | channel (4) | seq |       payload (59)             |
//! ```
//!
//! A frame is the concatenation of all packets of one message, so its length
//! is always a multiple of [`HID_PACKET_SIZE`].

use bytes::{BufMut, Bytes, BytesMut};
use derive_more::Display;

use crate::{
    constants::{
        BROADCAST_CHANNEL, CONT_HEADER_SIZE, CONT_PACKET_CAPACITY, CTAPHID_ERROR,
        CTAPHID_KEEPALIVE, HID_PACKET_SIZE, INIT_HEADER_SIZE, INIT_PACKET_CAPACITY,
        KEEPALIVE_PROCESSING, KEEPALIVE_UP_NEEDED, MAX_PAYLOAD, TYPE_INIT,
    },
    error::CtapHidError,
};

/// Status carried by a keepalive frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum KeepaliveStatus {
    /// The authenticator is still processing
    #[display("processing")]
    Processing,
    /// The authenticator waits for user presence
    #[display("user presence needed")]
    UserPresenceNeeded,
    /// Unknown keepalive status
    #[display("unknown")]
    Unknown,
}

/// Header of an initialization packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitHeader {
    /// Channel the packet belongs to
    pub channel_id: u32,
    /// Command byte, with the initialization bit set
    pub command: u8,
    /// Length of the whole message payload
    pub payload_len: usize,
}

impl InitHeader {
    /// Parse the header at the start of a packet or frame
    pub fn parse(packet: &[u8]) -> Result<Self, CtapHidError> {
        if packet.len() < INIT_HEADER_SIZE {
            return Err(CtapHidError::BadFrameLength {
                actual: packet.len(),
                expected: HID_PACKET_SIZE,
            });
        }

        Ok(Self {
            channel_id: u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]),
            command: packet[4],
            payload_len: u16::from_be_bytes([packet[5], packet[6]]) as usize,
        })
    }
}

/// Number of packets needed for a payload of `len` bytes
pub const fn packet_count(len: usize) -> Result<usize, CtapHidError> {
    if len > MAX_PAYLOAD {
        return Err(CtapHidError::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD,
        });
    }

    let after_first = len.saturating_sub(INIT_PACKET_CAPACITY);
    Ok(1 + after_first.div_ceil(CONT_PACKET_CAPACITY))
}

/// Wrap a payload into a frame for the given channel and command
pub fn wrap_frame(channel_id: u32, command: u8, payload: &[u8]) -> Result<Bytes, CtapHidError> {
    if command & TYPE_INIT == 0 {
        return Err(CtapHidError::InvalidCommand(command));
    }

    let packets = packet_count(payload.len())?;
    let mut frame = BytesMut::zeroed(packets * HID_PACKET_SIZE);

    let first = payload.len().min(INIT_PACKET_CAPACITY);
    {
        let mut packet = &mut frame[..HID_PACKET_SIZE];
        packet.put_u32(channel_id);
        packet.put_u8(command);
        packet.put_u16(payload.len() as u16);
        packet.put_slice(&payload[..first]);
    }

    for (seq, chunk) in payload[first..].chunks(CONT_PACKET_CAPACITY).enumerate() {
        let sequence = seq as u8;
        if sequence & TYPE_INIT != 0 {
            return Err(CtapHidError::InvalidSequence(sequence));
        }

        let start = (seq + 1) * HID_PACKET_SIZE;
        let mut packet = &mut frame[start..start + HID_PACKET_SIZE];
        packet.put_u32(channel_id);
        packet.put_u8(sequence);
        packet.put_slice(chunk);
    }

    Ok(frame.freeze())
}

/// Number of packets announced by an initialization packet on our channel
///
/// Packets from other channels fail with [`CtapHidError::ChangedChannel`]
/// unless we are still on the broadcast channel.
pub fn expected_packets(expected_channel: u32, packet: &[u8]) -> Result<usize, CtapHidError> {
    let header = InitHeader::parse(packet)?;
    check_channel(expected_channel, header.channel_id)?;
    packet_count(header.payload_len)
}

/// Interpret a frame as a keepalive, if it is one
pub fn keepalive_status(frame: &[u8]) -> Option<KeepaliveStatus> {
    let header = InitHeader::parse(frame).ok()?;
    if header.command != CTAPHID_KEEPALIVE {
        return None;
    }
    if header.payload_len != 1 {
        return Some(KeepaliveStatus::Unknown);
    }

    Some(match frame.get(INIT_HEADER_SIZE) {
        Some(&KEEPALIVE_PROCESSING) => KeepaliveStatus::Processing,
        Some(&KEEPALIVE_UP_NEEDED) => KeepaliveStatus::UserPresenceNeeded,
        _ => KeepaliveStatus::Unknown,
    })
}

/// Unwrap a frame into its payload, validating every header
pub fn unwrap_frame(
    expected_channel: u32,
    expected_command: u8,
    frame: &[u8],
) -> Result<Bytes, CtapHidError> {
    let header = InitHeader::parse(frame)?;

    if header.command != expected_command {
        if header.command == CTAPHID_ERROR {
            let code = frame.get(INIT_HEADER_SIZE).copied().unwrap_or_default();
            return Err(CtapHidError::Device(code));
        }
        return Err(CtapHidError::CommandMismatch {
            expected: expected_command,
            actual: header.command,
        });
    }
    check_channel(expected_channel, header.channel_id)?;

    // Less or more data than claimed is an error
    let expected_len = packet_count(header.payload_len)? * HID_PACKET_SIZE;
    if frame.len() != expected_len {
        return Err(CtapHidError::BadFrameLength {
            actual: frame.len(),
            expected: expected_len,
        });
    }

    let mut payload = BytesMut::with_capacity(header.payload_len);
    let first = header.payload_len.min(INIT_PACKET_CAPACITY);
    payload.put_slice(&frame[INIT_HEADER_SIZE..INIT_HEADER_SIZE + first]);

    for (seq, packet) in frame[HID_PACKET_SIZE..].chunks(HID_PACKET_SIZE).enumerate() {
        check_continuation(header.channel_id, seq, packet)?;
        let take = (header.payload_len - payload.len()).min(CONT_PACKET_CAPACITY);
        payload.put_slice(&packet[CONT_HEADER_SIZE..CONT_HEADER_SIZE + take]);
    }

    Ok(payload.freeze())
}

/// Validate the continuation packet with sequence number `seq` of a message
pub fn check_continuation(channel_id: u32, seq: usize, packet: &[u8]) -> Result<(), CtapHidError> {
    if packet.len() < CONT_HEADER_SIZE {
        return Err(CtapHidError::BadFrameLength {
            actual: packet.len(),
            expected: HID_PACKET_SIZE,
        });
    }

    let actual = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]);
    if actual != channel_id {
        return Err(CtapHidError::ChangedChannel {
            expected: channel_id,
            actual,
        });
    }

    let sequence = packet[4];
    if sequence as usize != seq {
        return Err(CtapHidError::SequenceMismatch {
            expected: seq as u8,
            actual: sequence,
        });
    }
    Ok(())
}

const fn check_channel(expected: u32, actual: u32) -> Result<(), CtapHidError> {
    if expected != BROADCAST_CHANNEL && actual != expected {
        return Err(CtapHidError::ChangedChannel { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{CTAPHID_MSG, CTAPHID_PING};
    use hex::decode;

    const CHANNEL_ID: u32 = 12_345_678;

    fn short_message() -> Vec<u8> {
        decode("1a2b3d4f5a6b7c").unwrap()
    }

    #[test]
    fn test_packet_count() {
        for (len, packets) in [
            (0, 1),
            (5, 1),
            (57, 1),
            (58, 2),
            (115, 2),
            (116, 2),
            (117, 3),
            (175, 3),
            (176, 4),
            (MAX_PAYLOAD, 129),
        ] {
            assert_eq!(packet_count(len).unwrap(), packets, "payload length {len}");
        }
    }

    #[test]
    fn test_wrap_unwrap_short() {
        let message = short_message();
        let frame = wrap_frame(CHANNEL_ID, CTAPHID_PING, &message).unwrap();
        assert_eq!(frame[4], CTAPHID_PING);
        assert_eq!(frame.len(), HID_PACKET_SIZE);
        assert_eq!(unwrap_frame(CHANNEL_ID, CTAPHID_PING, &frame).unwrap(), message);
    }

    #[test]
    fn test_wrap_unwrap_every_length() {
        for len in 0..=MAX_PAYLOAD {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let frame = wrap_frame(CHANNEL_ID, CTAPHID_MSG, &payload).unwrap();
            assert_eq!(frame.len() % HID_PACKET_SIZE, 0);
            assert_eq!(unwrap_frame(CHANNEL_ID, CTAPHID_MSG, &frame).unwrap(), payload);
        }
    }

    #[test]
    fn test_wrap_rejects_oversized_payload() {
        let err = wrap_frame(CHANNEL_ID, CTAPHID_PING, &vec![0; MAX_PAYLOAD + 1]).unwrap_err();
        assert!(matches!(err, CtapHidError::PayloadTooLarge { .. }));
    }

    #[test]
    fn test_wrap_rejects_command_without_init_bit() {
        let err = wrap_frame(CHANNEL_ID, 0x03, &short_message()).unwrap_err();
        assert_eq!(err, CtapHidError::InvalidCommand(0x03));
    }

    #[test]
    fn test_unwrap_bad_channel_and_command() {
        let frame = wrap_frame(CHANNEL_ID, CTAPHID_PING, &short_message()).unwrap();
        assert!(matches!(
            unwrap_frame(CHANNEL_ID + 1, CTAPHID_PING, &frame),
            Err(CtapHidError::ChangedChannel { .. })
        ));
        assert!(matches!(
            unwrap_frame(CHANNEL_ID, CTAPHID_MSG, &frame),
            Err(CtapHidError::CommandMismatch { .. })
        ));
        // The broadcast channel accepts any channel
        assert!(unwrap_frame(BROADCAST_CHANNEL, CTAPHID_PING, &frame).is_ok());
    }

    #[test]
    fn test_unwrap_truncated_trailing_and_missing_packet() {
        let long: Vec<u8> = short_message().repeat(128);
        let frame = wrap_frame(CHANNEL_ID, CTAPHID_PING, &long).unwrap();

        let missing = &frame[..frame.len() - HID_PACKET_SIZE];
        assert!(matches!(
            unwrap_frame(CHANNEL_ID, CTAPHID_PING, missing),
            Err(CtapHidError::BadFrameLength { .. })
        ));

        let truncated = &frame[..frame.len() - 1];
        assert!(unwrap_frame(CHANNEL_ID, CTAPHID_PING, truncated).is_err());

        let mut trailing = frame.to_vec();
        trailing.push(0x50);
        assert!(unwrap_frame(CHANNEL_ID, CTAPHID_PING, &trailing).is_err());

        assert!(unwrap_frame(CHANNEL_ID, CTAPHID_PING, &[]).is_err());
    }

    #[test]
    fn test_unwrap_incorrect_length_field() {
        let mut frame = wrap_frame(CHANNEL_ID, CTAPHID_PING, &vec![0; 57]).unwrap().to_vec();
        frame[6] += 1;
        assert!(matches!(
            unwrap_frame(CHANNEL_ID, CTAPHID_PING, &frame),
            Err(CtapHidError::BadFrameLength { .. })
        ));
    }

    #[test]
    fn test_unwrap_out_of_sequence() {
        let mut frame = wrap_frame(CHANNEL_ID, CTAPHID_MSG, &[0xAB; 200]).unwrap().to_vec();
        frame[2 * HID_PACKET_SIZE + 4] = 5;
        assert_eq!(
            unwrap_frame(CHANNEL_ID, CTAPHID_MSG, &frame),
            Err(CtapHidError::SequenceMismatch {
                expected: 1,
                actual: 5
            })
        );
    }

    #[test]
    fn test_unwrap_continuation_on_other_channel() {
        let mut frame = wrap_frame(CHANNEL_ID, CTAPHID_MSG, &[0xAB; 100]).unwrap().to_vec();
        frame[HID_PACKET_SIZE] ^= 0xFF;
        assert!(matches!(
            unwrap_frame(CHANNEL_ID, CTAPHID_MSG, &frame),
            Err(CtapHidError::ChangedChannel { .. })
        ));
    }

    #[test]
    fn test_error_frame_surfaces_device_code() {
        let frame = wrap_frame(CHANNEL_ID, CTAPHID_ERROR, &[0x06]).unwrap();
        assert_eq!(
            unwrap_frame(CHANNEL_ID, CTAPHID_MSG, &frame),
            Err(CtapHidError::Device(0x06))
        );
    }

    #[test]
    fn test_keepalive_status() {
        let processing = wrap_frame(CHANNEL_ID, CTAPHID_KEEPALIVE, &[1]).unwrap();
        let up_needed = wrap_frame(CHANNEL_ID, CTAPHID_KEEPALIVE, &[2]).unwrap();
        let odd = wrap_frame(CHANNEL_ID, CTAPHID_KEEPALIVE, &[2, 2]).unwrap();
        let msg = wrap_frame(CHANNEL_ID, CTAPHID_MSG, &[2]).unwrap();

        assert_eq!(keepalive_status(&processing), Some(KeepaliveStatus::Processing));
        assert_eq!(
            keepalive_status(&up_needed),
            Some(KeepaliveStatus::UserPresenceNeeded)
        );
        assert_eq!(keepalive_status(&odd), Some(KeepaliveStatus::Unknown));
        assert_eq!(keepalive_status(&msg), None);
    }

    #[test]
    fn test_expected_packets_from_init_header() {
        let frame = wrap_frame(CHANNEL_ID, CTAPHID_MSG, &[0; 200]).unwrap();
        assert_eq!(expected_packets(CHANNEL_ID, &frame[..HID_PACKET_SIZE]).unwrap(), 4);
        assert!(matches!(
            expected_packets(CHANNEL_ID + 1, &frame[..HID_PACKET_SIZE]),
            Err(CtapHidError::ChangedChannel { .. })
        ));
    }
}
