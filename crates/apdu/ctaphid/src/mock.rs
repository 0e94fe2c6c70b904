//! Simulated CTAPHID authenticator for tests
//!
//! Reassembles written frames, answers INIT on the broadcast channel and hands
//! every other message to a configurable handler. Responses can be preceded by
//! unrelated INIT answers, frames for other channels or keepalives.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::{
    constants::{
        BROADCAST_CHANNEL, CAPABILITY_CBOR, CAPABILITY_WINK, CTAPHID_ERROR, CTAPHID_INIT,
        CTAPHID_KEEPALIVE, CTAPHID_PING, CTAPHID_WINK, HID_PACKET_SIZE, INIT_NONCE_SIZE,
        KEEPALIVE_PROCESSING, KEEPALIVE_UP_NEEDED,
    },
    error::CtapHidError,
    frame::{self, InitHeader},
    link::{HidLink, LinkRequest, Packet},
};

/// CTAPHID error code for an invalid channel
const ERR_INVALID_CHANNEL: u8 = 0x0B;

/// CTAPHID error code for a malformed message
const ERR_INVALID_PAR: u8 = 0x02;

type Handler = Box<dyn Fn(u8, &[u8]) -> Vec<u8> + Send + Sync>;

#[derive(Default)]
struct DeviceState {
    incoming: Vec<u8>,
    outgoing: VecDeque<Packet>,
    init_garbage: Vec<Vec<u8>>,
    corrupt_nonce: bool,
    keepalives: usize,
    foreign_frames: usize,
    stray_continuation: bool,
    stalled: bool,
    handler: Option<Handler>,
}

struct Shared {
    channel_id: u32,
    state: Mutex<DeviceState>,
    readable: Condvar,
    open_requests: AtomicUsize,
    present: AtomicBool,
    closed: AtomicBool,
}

/// A HID link backed by an in-memory authenticator
pub struct SimulatedDevice {
    shared: Arc<Shared>,
}

impl fmt::Debug for SimulatedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedDevice")
            .field("channel_id", &format_args!("{:#010x}", self.shared.channel_id))
            .field("open_requests", &self.open_requests())
            .finish_non_exhaustive()
    }
}

impl SimulatedDevice {
    /// Create a device that allocates `channel_id` and echoes every message
    pub fn new(channel_id: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                channel_id,
                state: Mutex::new(DeviceState::default()),
                readable: Condvar::new(),
                open_requests: AtomicUsize::new(0),
                present: AtomicBool::new(true),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Answer MSG and CBOR messages with `handler(command, payload)`
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(u8, &[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.shared.state.lock().handler = Some(Box::new(handler));
    }

    /// Answer the next INIT with an extra response carrying `nonce` first
    pub fn queue_init_garbage(&self, nonce: Vec<u8>) {
        self.shared.state.lock().init_garbage.push(nonce);
    }

    /// Echo a damaged nonce in INIT responses
    pub fn set_corrupt_nonce(&self, corrupt: bool) {
        self.shared.state.lock().corrupt_nonce = corrupt;
    }

    /// Send `count` keepalives before every response
    pub fn set_keepalives(&self, count: usize) {
        self.shared.state.lock().keepalives = count;
    }

    /// Send `count` frames on another channel before every response
    pub fn set_foreign_frames(&self, count: usize) {
        self.shared.state.lock().foreign_frames = count;
    }

    /// Slip a continuation packet of another channel into multi-packet replies
    pub fn set_stray_continuation(&self, stray: bool) {
        self.shared.state.lock().stray_continuation = stray;
    }

    /// Packets written by the device but not read yet
    pub fn queued_packets(&self) -> usize {
        self.shared.state.lock().outgoing.len()
    }

    /// Swallow writes without ever answering
    pub fn set_stalled(&self, stalled: bool) {
        self.shared.state.lock().stalled = stalled;
    }

    /// Simulate plugging or unplugging the device
    pub fn set_present(&self, present: bool) {
        self.shared.present.store(present, Ordering::Release);
    }

    /// Requests currently held open by the host
    pub fn open_requests(&self) -> usize {
        self.shared.open_requests.load(Ordering::Acquire)
    }

    /// Whether the host closed the interface
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl HidLink for SimulatedDevice {
    fn open_request(&self) -> Result<Box<dyn LinkRequest>, CtapHidError> {
        if !self.is_device_present() {
            return Err(CtapHidError::link("device detached"));
        }
        self.shared.open_requests.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(SimulatedRequest {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn is_device_present(&self) -> bool {
        self.shared.present.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

struct SimulatedRequest {
    shared: Arc<Shared>,
}

impl Drop for SimulatedRequest {
    fn drop(&mut self) {
        self.shared.open_requests.fetch_sub(1, Ordering::AcqRel);
    }
}

impl LinkRequest for SimulatedRequest {
    fn write_packet(&mut self, packet: &Packet) -> Result<(), CtapHidError> {
        let mut state = self.shared.state.lock();
        if state.stalled {
            return Ok(());
        }

        state.incoming.extend_from_slice(packet);
        let header = InitHeader::parse(&state.incoming)?;
        let complete = frame::packet_count(header.payload_len)? * HID_PACKET_SIZE;
        if state.incoming.len() >= complete {
            let request = std::mem::take(&mut state.incoming);
            let channel_id = self.shared.channel_id;
            respond(&mut state, channel_id, header, &request)?;
            self.shared.readable.notify_all();
        }
        Ok(())
    }

    fn read_packet(&mut self, poll: Duration) -> Result<Option<Packet>, CtapHidError> {
        let mut state = self.shared.state.lock();
        if state.outgoing.is_empty() {
            self.shared.readable.wait_for(&mut state, poll);
        }
        Ok(state.outgoing.pop_front())
    }
}

fn respond(
    state: &mut DeviceState,
    channel_id: u32,
    header: InitHeader,
    request: &[u8],
) -> Result<(), CtapHidError> {
    let payload = match frame::unwrap_frame(header.channel_id, header.command, request) {
        Ok(payload) => payload,
        Err(_) => return push_frame(state, header.channel_id, CTAPHID_ERROR, &[ERR_INVALID_PAR]),
    };

    if header.command == CTAPHID_INIT {
        for nonce in std::mem::take(&mut state.init_garbage) {
            push_frame(state, BROADCAST_CHANNEL, CTAPHID_INIT, &init_payload(&nonce, channel_id))?;
        }
        let mut nonce = payload[..INIT_NONCE_SIZE.min(payload.len())].to_vec();
        if state.corrupt_nonce {
            nonce.iter_mut().for_each(|b| *b = !*b);
        }
        return push_frame(state, BROADCAST_CHANNEL, CTAPHID_INIT, &init_payload(&nonce, channel_id));
    }

    if header.channel_id != channel_id {
        return push_frame(state, header.channel_id, CTAPHID_ERROR, &[ERR_INVALID_CHANNEL]);
    }

    for _ in 0..state.foreign_frames {
        push_frame(state, channel_id.wrapping_add(1), header.command, b"not for you")?;
    }
    for i in 0..state.keepalives {
        let status = if i % 2 == 0 { KEEPALIVE_PROCESSING } else { KEEPALIVE_UP_NEEDED };
        push_frame(state, channel_id, CTAPHID_KEEPALIVE, &[status])?;
    }

    let reply = match (header.command, &state.handler) {
        (CTAPHID_PING, _) => payload.to_vec(),
        (CTAPHID_WINK, _) => Vec::new(),
        (command, Some(handler)) => handler(command, &payload),
        (_, None) => payload.to_vec(),
    };

    let start = state.outgoing.len();
    push_frame(state, channel_id, header.command, &reply)?;
    if state.stray_continuation && state.outgoing.len() - start > 1 {
        let mut stray: Packet = [0; HID_PACKET_SIZE];
        stray[..4].copy_from_slice(&channel_id.wrapping_add(1).to_be_bytes());
        state.outgoing.insert(start + 1, stray);
    }
    Ok(())
}

fn init_payload(nonce: &[u8], channel_id: u32) -> Vec<u8> {
    let mut payload = nonce.to_vec();
    payload.extend_from_slice(&channel_id.to_be_bytes());
    // protocol 2, device version 7.1.3
    payload.extend_from_slice(&[0x02, 0x07, 0x01, 0x03, CAPABILITY_WINK | CAPABILITY_CBOR]);
    payload
}

fn push_frame(
    state: &mut DeviceState,
    channel_id: u32,
    command: u8,
    payload: &[u8],
) -> Result<(), CtapHidError> {
    let frame = frame::wrap_frame(channel_id, command, payload)?;
    for chunk in frame.chunks(HID_PACKET_SIZE) {
        let mut packet: Packet = [0; HID_PACKET_SIZE];
        packet.copy_from_slice(chunk);
        state.outgoing.push_back(packet);
    }
    Ok(())
}
