pub mod choking;
pub mod events;
pub mod neighbors;
pub mod peer;
pub mod pieces;
pub mod transfer;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytesize::ByteSize;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use choking::{ChokeConfig, ChokeScheduler};
use events::{Event, EventLog, TracingEventLog};
use neighbors::NeighborTable;
use peer::{Direction, SwarmContext};
use peer::connection::tcp;
use pieces::PieceSet;
use transfer::{FilePieceStore, PieceLayout};

use crate::config::{CommonConfig, PeerInfo, Roster};
use crate::error::EngineError;

/// Knobs that come from the command line rather than the config files.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub work_dir: PathBuf,
    pub handshake_timeout: Duration,
    pub connect_retries: u32,
}

pub struct Engine {
    local: PeerInfo,
    dial_targets: Vec<PeerInfo>,
    listener: TcpListener,
    context: SwarmContext,
    choke_config: ChokeConfig,
    connect_retries: u32,
}

impl Engine {
    /// Opens the backing file and binds the listening socket. Nothing is
    /// dialed or accepted until `run`.
    pub async fn init(local_id: u32, common: &CommonConfig, roster: &Roster, options: EngineOptions) -> Result<Engine, EngineError> {
        let local = roster.entry(local_id)?.clone();
        let layout = PieceLayout::new(common.file_size, common.piece_size);

        let path = options
            .work_dir
            .join(format!("peer_{local_id}"))
            .join(&common.file_name)
        ;

        let store = FilePieceStore::open(&path, layout, local.has_file).await?;
        tracing::debug!("backing file at {:?}", store.path());

        let local_pieces = if local.has_file {
            PieceSet::full(layout.num_pieces())
        }
        else {
            PieceSet::empty(layout.num_pieces())
        };

        let listener = TcpListener::bind(("0.0.0.0", local.port))
            .await
            .map_err(|source| EngineError::Bind { port: local.port, source })?
        ;

        let table = NeighborTable::new(local_id, roster.ids(), local_pieces);
        let events: Arc<dyn EventLog> = Arc::new(TracingEventLog::new(local_id));

        let context = SwarmContext {
            table,
            store: Arc::new(store),
            events,
            handshake_timeout: options.handshake_timeout,
        };

        let choke_config = ChokeConfig {
            num_preferred: common.num_preferred_neighbors,
            unchoking_interval: common.unchoking_interval,
            optimistic_unchoking_interval: common.optimistic_unchoking_interval,
        };

        tracing::info!(
            "peer {local_id}: sharing {} as {} pieces of {}, dialing {} peers and expecting {} more",
            ByteSize::b(common.file_size),
            common.num_pieces(),
            ByteSize::b(common.piece_size),
            roster.dial_targets(local_id).len(),
            roster.expected_inbound(local_id),
        );

        Ok(Engine {
            local,
            dial_targets: roster.dial_targets(local_id).to_vec(),
            listener,
            context,
            choke_config,
            connect_retries: options.connect_retries,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the swarm until every roster member holds the whole file or
    /// the process is interrupted. Returns whether the swarm completed.
    pub async fn run(self) -> bool {
        let table = self.context.table.clone();

        match self.local_addr() {
            Ok(addr) => tracing::info!("peer {} listening on {addr}", self.local.id),
            Err(e) => tracing::warn!("listening socket has no local address: {e}"),
        }

        if table.is_swarm_complete() {
            table.shutdown();
        }

        let mut tasks: Vec<JoinHandle<()>> = ChokeScheduler::new(table.clone(), self.context.events.clone(), self.choke_config).spawn();

        for target in self.dial_targets.iter() {
            tasks.push(self.dial(target.clone()));
        }

        self.accept_loop(&mut tasks).await;

        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("swarm task failed: {e}");
            }
        }

        let complete = table.is_swarm_complete();

        if complete {
            self.context.events.record(Event::SwarmComplete);
        }
        else {
            let pieces = table.local_pieces();
            tracing::info!(
                "peer {} stopped before the swarm completed, holding {} of {} pieces",
                self.local.id,
                pieces.count(),
                pieces.size(),
            );
        }

        complete
    }

    fn dial(&self, target: PeerInfo) -> JoinHandle<()> {
        let context = self.context.clone();
        let retries = self.connect_retries;

        tokio::spawn(async move {
            let mut shutdown = context.table.subscribe_shutdown();

            let stream = tokio::select! {
                stream = tcp::connect(&target.host, target.port, retries) => stream,
                _ = neighbors::shutdown_signalled(&mut shutdown) => return,
            };

            match stream {
                Ok(stream) => peer::run_connection(stream, Direction::Outbound { expected: target.id }, context).await,
                Err(e) => tracing::warn!("couldn't reach peer {} at {}:{}: {e}", target.id, target.host, target.port),
            }
        })
    }

    /// Accepts inbound connections until shutdown. Ctrl-C triggers shutdown.
    async fn accept_loop(&self, tasks: &mut Vec<JoinHandle<()>>) {
        let mut shutdown = self.context.table.subscribe_shutdown();
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tracing::debug!("inbound connection from {addr}");

                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!("failed to set TCP_NODELAY for {addr}: {e}");
                        }

                        let context = self.context.clone();
                        tasks.push(tokio::spawn(peer::run_connection(stream, Direction::Inbound, context)));
                    }
                    Err(e) => tracing::warn!("accept failed: {e}"),
                },
                _ = &mut ctrl_c => {
                    tracing::info!("interrupted, shutting down");
                    self.context.table.shutdown();
                    break;
                }
                _ = neighbors::shutdown_signalled(&mut shutdown) => break,
            }
        }
    }
}
