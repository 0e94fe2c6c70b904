//! Reader watcher that turns inserted cards into transports
//!
//! A background thread polls the reader list. Every newly inserted card gets
//! an unconnected [`PcscTransport`] handed to the discovery sink, which owns
//! connecting it. The transport is released when its card leaves the reader.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use hwkey_apdu_core::{SharedTransport, Transport};
use parking_lot::Mutex;
use pcsc::{Context, ReaderState, Scope, State};
use tracing::{debug, info, trace, warn};

use crate::{config::PcscConfig, error::PcscError, reader::PcscReader, transport::PcscTransport};

/// Callback receiving every transport the watcher discovers
pub type DiscoverySink = Arc<dyn Fn(SharedTransport) + Send + Sync>;

/// Card presence change in one reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardEvent {
    /// A card appeared, or a different card replaced the previous one
    Inserted {
        /// Reader name
        reader: String,
        /// Answer To Reset of the new card
        atr: Vec<u8>,
    },
    /// The card left the reader
    Removed {
        /// Reader name
        reader: String,
    },
}

/// Compare a reader snapshot with the known cards and update them
///
/// Readers that disappeared entirely count as removals.
pub fn diff_readers(known: &mut HashMap<String, Vec<u8>>, readers: &[PcscReader]) -> Vec<CardEvent> {
    let mut events = Vec::new();

    for reader in readers {
        match (reader.atr(), known.get(reader.name())) {
            (Some(atr), Some(previous)) if previous.as_slice() == atr => {}
            (Some(atr), _) => {
                known.insert(reader.name().to_string(), atr.to_vec());
                events.push(CardEvent::Inserted {
                    reader: reader.name().to_string(),
                    atr: atr.to_vec(),
                });
            }
            (None, Some(_)) => {
                known.remove(reader.name());
                events.push(CardEvent::Removed {
                    reader: reader.name().to_string(),
                });
            }
            (None, None) => {}
        }
    }

    let gone: Vec<String> = known
        .keys()
        .filter(|name| !readers.iter().any(|r| r.name() == name.as_str()))
        .cloned()
        .collect();
    for reader in gone {
        known.remove(&reader);
        events.push(CardEvent::Removed { reader });
    }

    events
}

/// Drop released transports and forget the cards they belonged to
///
/// Returns how many cards were forgotten. Those are reported as inserted again
/// by the next poll.
fn forget_released<T>(
    known: &mut HashMap<String, Vec<u8>>,
    transports: &mut HashMap<String, T>,
    is_released: impl Fn(&T) -> bool,
) -> usize {
    transports.retain(|_, transport| !is_released(transport));
    let before = known.len();
    known.retain(|reader, _| transports.contains_key(reader));
    before - known.len()
}

#[derive(Default)]
struct WatchState {
    known: HashMap<String, Vec<u8>>,
    transports: HashMap<String, Arc<PcscTransport>>,
}

/// Background watcher over all PC/SC readers
pub struct PcscWatcher {
    running: Arc<AtomicBool>,
    state: Arc<Mutex<WatchState>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for PcscWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscWatcher")
            .field("running", &self.running.load(Ordering::Acquire))
            .field("readers", &self.state.lock().known.len())
            .finish()
    }
}

impl PcscWatcher {
    /// Establish a PC/SC context and start watching
    pub fn start(config: PcscConfig, sink: DiscoverySink) -> Result<Self, PcscError> {
        let context = Context::establish(Scope::User)?;
        let running = Arc::new(AtomicBool::new(true));
        let state = Arc::new(Mutex::new(WatchState::default()));

        let handle = {
            let running = Arc::clone(&running);
            let state = Arc::clone(&state);
            thread::Builder::new()
                .name("pcsc-watcher".into())
                .spawn(move || watch(&context, config, &running, &state, &sink))
                .map_err(|e| PcscError::Watcher(e.to_string()))?
        };

        info!("PC/SC reader watcher started");
        Ok(Self {
            running,
            state,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Forget cards whose transport was released so they are offered again
    ///
    /// Returns true when a card will be rediscovered by the next poll.
    pub fn rescan(&self) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        let mut state = self.state.lock();
        let WatchState { known, transports } = &mut *state;
        let forgotten = forget_released(known, transports, |transport| transport.is_released());
        debug!(forgotten, readers = known.len(), "Rescanning PC/SC readers");
        forgotten > 0
    }

    /// Stop the watcher and wait for its thread
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.lock().take()
            && handle.join().is_err()
        {
            warn!("PC/SC watcher thread panicked");
        }
    }
}

impl Drop for PcscWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch(
    context: &Context,
    config: PcscConfig,
    running: &AtomicBool,
    state: &Mutex<WatchState>,
    sink: &DiscoverySink,
) {
    while running.load(Ordering::Acquire) {
        match snapshot(context, config) {
            Ok(readers) => {
                let events = diff_readers(&mut state.lock().known, &readers);
                for event in events {
                    handle_event(context, config, state, sink, event);
                }
            }
            Err(e) => trace!(error = %e, "Failed to poll PC/SC readers"),
        }
        thread::sleep(config.poll_interval);
    }

    for (_, transport) in state.lock().transports.drain() {
        transport.release();
    }
    debug!("PC/SC reader watcher stopped");
}

fn snapshot(context: &Context, config: PcscConfig) -> Result<Vec<PcscReader>, PcscError> {
    let names = match context.list_readers_owned() {
        Ok(names) => names,
        Err(pcsc::Error::NoReadersAvailable) => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut states: Vec<ReaderState> = names
        .into_iter()
        .map(|name| ReaderState::new(name, State::UNAWARE))
        .collect();
    if states.is_empty() {
        return Ok(Vec::new());
    }

    match context.get_status_change(Some(config.poll_interval), &mut states) {
        Ok(()) | Err(pcsc::Error::Timeout) => {}
        Err(e) => return Err(e.into()),
    }

    Ok(states.iter().map(PcscReader::from_reader_state).collect())
}

fn handle_event(
    context: &Context,
    config: PcscConfig,
    state: &Mutex<WatchState>,
    sink: &DiscoverySink,
    event: CardEvent,
) {
    match event {
        CardEvent::Inserted { reader, atr } => {
            debug!(reader = %reader, atr = %hex::encode(&atr), "Card inserted");
            let transport = Arc::new(PcscTransport::new(context.clone(), reader.clone(), config));
            if let Some(previous) = state.lock().transports.insert(reader, Arc::clone(&transport)) {
                previous.release();
            }
            let transport: SharedTransport = transport;
            sink(transport);
        }
        CardEvent::Removed { reader } => {
            debug!(reader = %reader, "Card removed");
            if let Some(transport) = state.lock().transports.remove(&reader) {
                transport.release();
            }
        }
    }
}
