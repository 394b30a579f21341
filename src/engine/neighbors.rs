use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};

use crate::engine::peer::message::Message;
use crate::engine::pieces::PieceSet;
use crate::error::PieceIndexError;

/// Sending side of a connection's outbound queue.
pub type Outbox = mpsc::UnboundedSender<Message>;

/// Whether we told a peer we want something from them.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Interest {
    /// Nothing sent yet.
    #[default]
    Unknown,
    Yes,
    No,
}

/// Everything we know about one remote roster member.
#[derive(Debug)]
pub struct PeerRecord {
    pub id: u32,
    pub remote_pieces: PieceSet,
    pub interested_in_me: bool,
    pub am_interested: Interest,
    pub connected: bool,
    /// Pieces received from this peer since the last preferred-neighbor round.
    pub round_download_count: u32,
    pub has_complete_file: bool,
    /// Weak so the connection task alone decides when its socket closes.
    handle: Option<mpsc::WeakUnboundedSender<Message>>,
}

impl PeerRecord {
    fn new(id: u32, num_pieces: usize) -> PeerRecord {
        PeerRecord {
            id,
            remote_pieces: PieceSet::empty(num_pieces),
            interested_in_me: false,
            am_interested: Interest::Unknown,
            connected: false,
            round_download_count: 0,
            has_complete_file: false,
            handle: None,
        }
    }

    /// Queues `message` on this peer's connection. False if it isn't connected.
    pub fn send(&self, message: Message) -> bool {
        match self.handle.as_ref().and_then(|h| h.upgrade()) {
            Some(tx) if self.connected => tx.send(message).is_ok(),
            _ => false,
        }
    }
}

/// Resolves once `shutdown` flips to true, right away if it already has.
pub async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|done| *done).await;
}

/// Where the local download stands after storing a piece.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LocalProgress {
    pub count: usize,
    pub complete: bool,
}

fn update_interest(record: &mut PeerRecord, interested: bool) {
    let wanted = if interested { Interest::Yes } else { Interest::No };

    if record.am_interested != wanted {
        record.am_interested = wanted;
        record.send(if interested { Message::Interested } else { Message::NotInterested });
    }
}

/// State behind the neighbor table lock. Holding the guard gives a
/// consistent view of every record, the local pieces and the choke sets.
#[derive(Debug)]
pub struct NeighborState {
    local_id: u32,
    /// Roster order, local peer included.
    roster: Vec<u32>,
    pub local_pieces: PieceSet,
    /// Keyed by id so iteration order is fixed for the whole run.
    pub records: BTreeMap<u32, PeerRecord>,
    pub preferred: BTreeSet<u32>,
    pub optimistic: Option<u32>,
    complete: BTreeSet<u32>,
}

impl NeighborState {
    pub fn record(&self, id: u32) -> Option<&PeerRecord> {
        self.records.get(&id)
    }

    pub fn record_mut(&mut self, id: u32) -> Option<&mut PeerRecord> {
        self.records.get_mut(&id)
    }

    pub fn send(&self, id: u32, message: Message) -> bool {
        self.records.get(&id).map(|r| r.send(message)).unwrap_or(false)
    }

    /// Connected peers that want pieces from us.
    pub fn interested_candidates(&self) -> Vec<&PeerRecord> {
        self.records
            .values()
            .filter(|r| r.connected && r.interested_in_me)
            .collect()
    }

    pub fn is_complete(&self, id: u32) -> bool {
        self.complete.contains(&id)
    }

    pub fn is_swarm_complete(&self) -> bool {
        self.roster.iter().all(|id| self.is_complete(*id))
    }

    /// Adds `id` to the complete set. Returns true if that finished the swarm.
    fn mark_complete(&mut self, id: u32) -> bool {
        if let Some(record) = self.records.get_mut(&id) {
            record.has_complete_file = true;
        }

        self.complete.insert(id) && self.is_swarm_complete()
    }
}

/// Process-wide neighbor bookkeeping, shared by every connection task and
/// both choke scheduler tasks.
#[derive(Clone)]
pub struct NeighborTable {
    state: Arc<Mutex<NeighborState>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl NeighborTable {
    pub fn new(local_id: u32, roster: Vec<u32>, local_pieces: PieceSet) -> NeighborTable {
        let num_pieces = local_pieces.size();
        let local_complete = local_pieces.has_all();

        let records = roster
            .iter()
            .filter(|id| **id != local_id)
            .map(|id| (*id, PeerRecord::new(*id, num_pieces)))
            .collect()
        ;

        let mut state = NeighborState {
            local_id,
            roster,
            local_pieces,
            records,
            preferred: BTreeSet::new(),
            optimistic: None,
            complete: BTreeSet::new(),
        };

        if local_complete {
            state.mark_complete(local_id);
        }

        let (shutdown_tx, _) = watch::channel(false);

        NeighborTable {
            state: Arc::new(Mutex::new(state)),
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// Locks the whole table. Don't hold the guard across an await.
    pub fn lock(&self) -> MutexGuard<'_, NeighborState> {
        self.state.lock()
    }

    pub fn local_id(&self) -> u32 {
        self.lock().local_id
    }

    pub fn num_pieces(&self) -> usize {
        self.lock().local_pieces.size()
    }

    pub fn local_pieces(&self) -> PieceSet {
        self.lock().local_pieces.clone()
    }

    /// Roster ids nobody has claimed yet, which an inbound handshake may use.
    pub fn unconnected_ids(&self) -> HashSet<u32> {
        self.lock()
            .records
            .values()
            .filter(|r| !r.connected)
            .map(|r| r.id)
            .collect()
    }

    /// Binds `id` to a connection and queues our BITFIELD as its first frame.
    /// False if the id is unknown or taken.
    ///
    /// Both happen under the lock, so every piece we get later is announced
    /// to this peer by a HAVE.
    pub fn register_connection(&self, id: u32, outbox: &Outbox) -> bool {
        let mut state = self.lock();
        let bitfield = state.local_pieces.to_bytes();

        match state.record_mut(id) {
            Some(record) if !record.connected => {
                record.connected = true;
                record.handle = Some(outbox.downgrade());
                record.send(Message::Bitfield { bitfield })
            }
            _ => false,
        }
    }

    pub fn disconnect(&self, id: u32) {
        let mut state = self.lock();

        if let Some(record) = state.record_mut(id) {
            record.connected = false;
            record.handle = None;
            record.interested_in_me = false;
        }

        state.preferred.remove(&id);
        if state.optimistic == Some(id) {
            state.optimistic = None;
        }
    }

    pub fn set_interested_in_me(&self, id: u32, interested: bool) {
        if let Some(record) = self.lock().record_mut(id) {
            record.interested_in_me = interested;
        }
    }

    /// Replaces a peer's piece set wholesale. Returns whether they're complete.
    pub fn update_remote_pieces(&self, id: u32, pieces: PieceSet) -> bool {
        let mut state = self.lock();
        let complete = pieces.has_all();

        if let Some(record) = state.record_mut(id) {
            record.remote_pieces = pieces;
        }

        if complete {
            self.complete_locked(&mut state, id);
        }

        complete
    }

    /// Marks one of a peer's pieces. Returns whether they're now complete.
    pub fn mark_remote_piece(&self, id: u32, piece: usize) -> Result<bool, PieceIndexError> {
        let mut state = self.lock();

        let complete = match state.record_mut(id) {
            Some(record) => {
                record.remote_pieces.mark_received(piece)?;
                record.remote_pieces.has_all()
            }
            None => false,
        };

        if complete {
            self.complete_locked(&mut state, id);
        }

        Ok(complete)
    }

    /// Recomputes whether we want anything from `id` and tells them if that
    /// changed. Returns whether we're interested.
    pub fn refresh_interest(&self, id: u32) -> bool {
        let mut state = self.lock();
        let NeighborState { local_pieces, records, .. } = &mut *state;

        let Some(record) = records.get_mut(&id) else {
            return false;
        };

        let interested = local_pieces.has_interesting_pieces(&record.remote_pieces);
        update_interest(record, interested);

        interested
    }

    /// Stores a piece we just downloaded from `from`: marks it, credits the
    /// sender, announces it with HAVE to every connected peer and sends
    /// NOT_INTERESTED to peers that have nothing left for us.
    ///
    /// If another connection stored the same piece first, the sender is
    /// only credited and `None` comes back.
    pub fn record_local_piece(&self, from: u32, piece: usize) -> Result<Option<LocalProgress>, PieceIndexError> {
        let mut state = self.lock();
        let local_id = state.local_id;

        if state.local_pieces.has(piece) {
            if let Some(record) = state.record_mut(from) {
                record.round_download_count += 1;
            }

            return Ok(None);
        }

        state.local_pieces.mark_received(piece)?;

        let NeighborState { local_pieces, records, .. } = &mut *state;
        let count = local_pieces.count();
        let complete = local_pieces.has_all();

        for record in records.values_mut() {
            if record.id == from {
                record.round_download_count += 1;
            }

            record.send(Message::Have { piece: piece as u32 });

            if record.am_interested == Interest::Yes && !local_pieces.has_interesting_pieces(&record.remote_pieces) {
                update_interest(record, false);
            }
        }

        if complete {
            self.complete_locked(&mut state, local_id);
        }

        Ok(Some(LocalProgress { count, complete }))
    }

    pub fn increment_download(&self, id: u32) {
        if let Some(record) = self.lock().record_mut(id) {
            record.round_download_count += 1;
        }
    }

    pub fn is_swarm_complete(&self) -> bool {
        self.lock().is_swarm_complete()
    }

    #[cfg(test)]
    pub fn send(&self, id: u32, message: Message) -> bool {
        self.lock().send(id, message)
    }

    /// Fires once every roster member is complete, or on `shutdown()`.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    fn complete_locked(&self, state: &mut NeighborState, id: u32) {
        if state.mark_complete(id) {
            tracing::info!("every roster member holds the complete file");
            self.shutdown();
        }
    }
}
