pub mod connection;
pub mod message;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;

use tokio::sync::{mpsc, watch};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::time;

use crate::engine::events::{Event, EventLog};
use crate::engine::neighbors::{self, NeighborTable};
use crate::engine::pieces::PieceSet;
use crate::engine::transfer::{PieceLayout, PieceStore};
use crate::error::{PayloadError, PeerError};

use connection::PeerConnection;
use message::Message;

/// How long a closing connection may spend flushing queued frames.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Which side opened the TCP connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// We dialed a roster entry, so only that id may answer.
    Outbound { expected: u32 },
    /// Someone dialed us; any roster id that isn't connected yet may claim it.
    Inbound,
}

/// Shared services every connection task gets a handle to.
#[derive(Clone)]
pub struct SwarmContext {
    pub table: NeighborTable,
    pub store: Arc<dyn PieceStore>,
    pub events: Arc<dyn EventLog>,
    pub handshake_timeout: Duration,
}

impl SwarmContext {
    /// Largest frame a well-behaved peer can send: a full PIECE or our BITFIELD.
    /// Saturates at `u32::MAX`, the most a length prefix can carry.
    fn max_frame_len(&self) -> u32 {
        max_frame_len(self.store.layout())
    }
}

fn max_frame_len(layout: PieceLayout) -> u32 {
    let piece = layout.piece_size.saturating_add(5);
    let bitfield = layout.num_pieces().div_ceil(8) as u64 + 1;

    u32::try_from(piece.max(bitfield)).unwrap_or(u32::MAX)
}

/// Drives one connection from handshake to close. Errors end this connection
/// only; they are logged here and never returned to the caller.
pub async fn run_connection<S>(stream: S, direction: Direction, context: SwarmContext)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    match SwarmPeer::handshake(stream, direction, context).await {
        Ok(peer) => peer.run().await,
        Err(e) => tracing::debug!("handshake failed ({direction:?}): {e}"),
    }
}

/// A connection that got past the handshake.
struct SwarmPeer<R> {
    peer_id: u32,
    connection: PeerConnection<R>,
    outbox: mpsc::UnboundedSender<Message>,
    writer: tokio::task::JoinHandle<()>,
    context: SwarmContext,
    shutdown: watch::Receiver<bool>,
    rng: StdRng,
}

impl<S> SwarmPeer<ReadHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Sends our handshake, then waits for theirs and checks it against the
    /// ids this connection may stand for.
    async fn handshake(stream: S, direction: Direction, context: SwarmContext) -> Result<Self, PeerError> {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut connection = PeerConnection::new(reader, context.max_frame_len());
        let table = &context.table;

        writer.write_all(&message::encode_handshake(table.local_id())).await?;

        let handshake = time::timeout(context.handshake_timeout, connection.get_handshake())
            .await
            .map_err(|_| PeerError::HandshakeTimeout)??
        ;

        let expected: HashSet<u32> = match direction {
            Direction::Outbound { expected } => [expected].into(),
            Direction::Inbound => table.unconnected_ids(),
        };

        let peer_id = message::validate_handshake(&handshake, &expected)?;

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        if !table.register_connection(peer_id, &outbox) {
            return Err(PeerError::AlreadyConnected(peer_id));
        }

        let writer = connection::spawn_writer(writer, outbox_rx, peer_id);

        context.events.record(match direction {
            Direction::Outbound { .. } => Event::ConnectionMade { to: peer_id },
            Direction::Inbound => Event::ConnectedFrom { from: peer_id },
        });

        Ok(SwarmPeer {
            peer_id,
            connection,
            outbox,
            writer,
            shutdown: table.subscribe_shutdown(),
            context,
            rng: StdRng::from_entropy(),
        })
    }
}

impl<R: AsyncRead + Unpin + Send> SwarmPeer<R> {
    /// Receive loop. Our BITFIELD is already queued, and every message kind
    /// is accepted from here on.
    async fn run(mut self) {
        loop {
            if self.context.table.is_swarm_complete() {
                break;
            }

            let frame = tokio::select! {
                frame = self.connection.get_message() => frame,
                _ = neighbors::shutdown_signalled(&mut self.shutdown) => break,
            };

            let frame = match frame {
                Ok(frame) => frame,
                Err(PeerError::ConnectionClosed) => {
                    tracing::info!("peer {} closed the connection", self.peer_id);
                    break;
                }
                Err(e) => {
                    tracing::warn!("dropping peer {}: {e}", self.peer_id);
                    break;
                }
            };

            let message = match Message::try_from(frame) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!("ignoring message from peer {}: {e}", self.peer_id);
                    continue;
                }
            };

            tracing::trace!("received {message} from peer {}", self.peer_id);

            if let Err(e) = self.handle_message(message).await {
                tracing::warn!("ignoring message from peer {}: {e}", self.peer_id);
            }
        }

        self.close().await;
    }

    async fn handle_message(&mut self, message: Message) -> Result<(), PayloadError> {
        let peer_id = self.peer_id;
        let table = &self.context.table;
        let events = &self.context.events;

        match message {
            // We keep no request state, so a choke only means the pending
            // REQUEST may never be answered.
            Message::Choke => events.record(Event::ChokedBy { peer: peer_id }),
            Message::Unchoke => {
                events.record(Event::UnchokedBy { peer: peer_id });
                self.request_piece();
            }
            Message::Interested => {
                table.set_interested_in_me(peer_id, true);
                events.record(Event::ReceivedInterested { from: peer_id });
            }
            Message::NotInterested => {
                table.set_interested_in_me(peer_id, false);
                events.record(Event::ReceivedNotInterested { from: peer_id });
            }
            Message::Have { piece } => {
                let index = self.check_index(piece)?;
                events.record(Event::ReceivedHave { from: peer_id, piece });

                table
                    .mark_remote_piece(peer_id, index)
                    .map_err(|_| PayloadError::IndexOutOfRange { index: piece, pieces: table.num_pieces() })?;
                table.refresh_interest(peer_id);
            }
            Message::Bitfield { bitfield } => {
                let pieces = PieceSet::from_bytes(&bitfield, table.num_pieces());

                table.update_remote_pieces(peer_id, pieces);
                table.refresh_interest(peer_id);
            }
            Message::Request { piece } => {
                let index = self.check_index(piece)?;

                if !table.lock().local_pieces.has(index) {
                    return Err(PayloadError::PieceNotHeld(piece));
                }

                match self.context.store.read_piece(index).await {
                    Ok(data) => {
                        if self.outbox.send(Message::Piece { piece, data }).is_err() {
                            tracing::debug!("peer {peer_id} went away before piece {piece} was queued");
                        }
                    }
                    Err(e) => tracing::warn!("failed to read piece {piece} for peer {peer_id}: {e}"),
                }
            }
            Message::Piece { piece, data } => {
                let index = self.check_index(piece)?;
                let expected = self.context.store.layout().piece_len(index);

                if data.len() != expected {
                    return Err(PayloadError::BadPieceLength { index: piece, expected, actual: data.len() });
                }

                self.store_piece(index, &data).await;
            }
        }

        Ok(())
    }

    async fn store_piece(&mut self, index: usize, data: &[u8]) {
        let peer_id = self.peer_id;
        let table = &self.context.table;

        if table.lock().local_pieces.has(index) {
            // Already stored from someone else. Still counts as their upload.
            table.increment_download(peer_id);
        }
        else {
            if let Err(e) = self.context.store.write_piece(index, data).await {
                tracing::warn!("failed to write piece {index} from peer {peer_id}: {e}");
                return;
            }

            // Another connection may have stored it while we were writing.
            if let Ok(Some(progress)) = table.record_local_piece(peer_id, index) {
                self.context.events.record(Event::DownloadedPiece {
                    from: peer_id,
                    piece: index as u32,
                    count: progress.count,
                });

                if progress.complete {
                    self.context.events.record(Event::DownloadComplete);
                    return;
                }
            }
        }

        if table.refresh_interest(peer_id) {
            self.request_piece();
        }
    }

    /// Asks this peer for a random piece they have and we don't, if any.
    fn request_piece(&mut self) {
        let state = self.context.table.lock();

        let Some(record) = state.record(self.peer_id) else {
            return;
        };

        if let Some(piece) = state.local_pieces.random_remaining_piece(&record.remote_pieces, &mut self.rng) {
            record.send(Message::Request { piece: piece as u32 });
        }
    }

    fn check_index(&self, piece: u32) -> Result<usize, PayloadError> {
        let pieces = self.context.table.num_pieces();

        if (piece as usize) < pieces {
            Ok(piece as usize)
        }
        else {
            Err(PayloadError::IndexOutOfRange { index: piece, pieces })
        }
    }

    /// Marks the peer disconnected and lets the writer flush what's queued.
    async fn close(self) {
        self.context.table.disconnect(self.peer_id);

        drop(self.outbox);
        drop(self.connection);

        let mut writer = self.writer;
        if time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
            tracing::debug!("peer {} stopped reading, dropping unsent frames", self.peer_id);
            writer.abort();
        }

        tracing::debug!("connection to peer {} closed", self.peer_id);
    }
}
