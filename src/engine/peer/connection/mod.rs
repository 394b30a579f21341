pub mod tcp;

use bytes::Bytes;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::engine::peer::message::{self, Frame, Message, HANDSHAKE_LEN};
use crate::error::PeerError;

/// Read side of a peer connection. Writes go through `spawn_writer` so a
/// slow peer can never stall our reads.
pub struct PeerConnection<R> {
    reader: R,
    max_frame_len: u32,
}

impl<R: AsyncRead + Unpin> PeerConnection<R> {
    pub fn new(reader: R, max_frame_len: u32) -> PeerConnection<R> {
        PeerConnection { reader, max_frame_len }
    }

    pub async fn get_handshake(&mut self) -> Result<[u8; HANDSHAKE_LEN], PeerError> {
        let mut handshake = [0; HANDSHAKE_LEN];

        match self.reader.read_exact(&mut handshake).await {
            Ok(_) => Ok(handshake),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(PeerError::InvalidHandshake),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_message(&mut self) -> Result<Frame, PeerError> {
        message::decode_message(&mut self.reader, self.max_frame_len).await
    }
}

/// Drains `outbox_rx` into `writer` until every sender is gone, then shuts
/// the write side down. Whatever was queued before that still goes out.
pub fn spawn_writer<W>(mut writer: W, mut outbox_rx: mpsc::UnboundedReceiver<Message>, peer_id: u32) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(message) = outbox_rx.recv().await {
            let buf: Bytes = (&message).into();

            if let Err(e) = writer.write_all(&buf).await {
                tracing::debug!("failed to send {message} to peer {peer_id}: {e}");
                return;
            }

            tracing::trace!("sent {message} to peer {peer_id}");
        }

        let _ = writer.shutdown().await;
    })
}
