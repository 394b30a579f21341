use std::fmt::Display;

/// Target used for protocol events, so they can be routed to the peer log file.
pub const EVENTS_TARGET: &str = "swarm::events";

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// We dialed `to` and the handshake went through.
    ConnectionMade { to: u32 },
    /// `from` dialed us and the handshake went through.
    ConnectedFrom { from: u32 },

    PreferredNeighbors { peers: Vec<u32> },
    OptimisticNeighbor { peer: u32 },
    ChokeSent { peer: u32 },
    UnchokeSent { peer: u32 },

    ChokedBy { peer: u32 },
    UnchokedBy { peer: u32 },
    ReceivedHave { from: u32, piece: u32 },
    ReceivedInterested { from: u32 },
    ReceivedNotInterested { from: u32 },

    DownloadedPiece { from: u32, piece: u32, count: usize },
    DownloadComplete,
    /// Every roster member, us included, holds the whole file.
    SwarmComplete,
}

/// Sink for protocol events. Called from connection and scheduler tasks.
pub trait EventLog: Send + Sync {
    fn record(&self, event: Event);
}

/// Renders events as one line each on the `swarm::events` tracing target.
pub struct TracingEventLog {
    local_id: u32,
}

impl TracingEventLog {
    pub fn new(local_id: u32) -> TracingEventLog {
        TracingEventLog { local_id }
    }

    pub fn describe(&self, event: &Event) -> String {
        let me = self.local_id;

        match event {
            Event::ConnectionMade { to } => format!("Peer {me} makes a connection to Peer {to}."),
            Event::ConnectedFrom { from } => format!("Peer {me} is connected from Peer {from}."),
            Event::PreferredNeighbors { peers } => format!("Peer {me} has the preferred neighbors {}.", join(peers)),
            Event::OptimisticNeighbor { peer } => format!("Peer {me} has the optimistically unchoked neighbor {peer}."),
            Event::ChokeSent { peer } => format!("Peer {me} chokes {peer}."),
            Event::UnchokeSent { peer } => format!("Peer {me} unchokes {peer}."),
            Event::ChokedBy { peer } => format!("Peer {me} is choked by {peer}."),
            Event::UnchokedBy { peer } => format!("Peer {me} is unchoked by {peer}."),
            Event::ReceivedHave { from, piece } => {
                format!("Peer {me} received the 'have' message from {from} for the piece {piece}.")
            }
            Event::ReceivedInterested { from } => format!("Peer {me} received the 'interested' message from {from}."),
            Event::ReceivedNotInterested { from } => {
                format!("Peer {me} received the 'not interested' message from {from}.")
            }
            Event::DownloadedPiece { from, piece, count } => format!(
                "Peer {me} has downloaded the piece {piece} from {from}. Now the number of pieces it has is {count}."
            ),
            Event::DownloadComplete => format!("Peer {me} has downloaded the complete file."),
            Event::SwarmComplete => format!("Peer {me} sees every peer holding the complete file."),
        }
    }
}

impl EventLog for TracingEventLog {
    fn record(&self, event: Event) {
        tracing::info!(target: EVENTS_TARGET, "{}", self.describe(&event));
    }
}

fn join<T: Display>(items: &[T]) -> String {
    items.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(" ")
}
