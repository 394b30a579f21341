use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use tokio::task::JoinHandle;
use tokio::time;

use crate::engine::events::{Event, EventLog};
use crate::engine::neighbors::{self, NeighborState, NeighborTable};
use crate::engine::peer::message::Message;

#[derive(Clone, Copy, Debug)]
pub struct ChokeConfig {
    pub num_preferred: usize,
    pub unchoking_interval: Duration,
    pub optimistic_unchoking_interval: Duration,
}

/// Outcome of one preferred-neighbor round.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PreferredRound {
    pub preferred: Vec<u32>,
    pub unchoked: Vec<u32>,
    pub choked: Vec<u32>,
}

/// Outcome of one optimistic-unchoke round.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OptimisticRound {
    pub peer: u32,
    pub choked: Option<u32>,
}

/// Picks this round's preferred neighbors, sends the CHOKE/UNCHOKE frames
/// the change calls for and resets the per-round download counters.
///
/// While we're still downloading, the peers that sent us the most pieces
/// win (ties go to the lower id). Once we're a seeder, the pick is random.
pub fn select_preferred<R: Rng + ?Sized>(state: &mut NeighborState, count: usize, rng: &mut R) -> PreferredRound {
    let mut candidates: Vec<(u32, u32)> = state
        .interested_candidates()
        .iter()
        .map(|r| (r.id, r.round_download_count))
        .collect()
    ;

    if state.local_pieces.has_all() {
        candidates.shuffle(rng);
    }
    else {
        // Stable, and candidates come out of the table in id order.
        candidates.sort_by(|(_, a), (_, b)| b.cmp(a));
    }

    let preferred: Vec<u32> = candidates.into_iter().take(count).map(|(id, _)| id).collect();

    for record in state.records.values_mut() {
        record.round_download_count = 0;
    }

    let unchoked: Vec<u32> = preferred
        .iter()
        .copied()
        .filter(|id| !state.preferred.contains(id) && state.optimistic != Some(*id))
        .collect()
    ;

    let choked: Vec<u32> = state
        .preferred
        .iter()
        .copied()
        .filter(|id| !preferred.contains(id))
        .collect()
    ;

    for id in unchoked.iter() {
        state.send(*id, Message::Unchoke);
    }

    for id in choked.iter() {
        state.send(*id, Message::Choke);
    }

    state.preferred = preferred.iter().copied().collect();

    PreferredRound { preferred, unchoked, choked }
}

/// Unchokes one random interested peer that isn't already unchoked, and
/// chokes the previous optimistic pick unless it has since become preferred.
/// Returns `None` when nobody qualifies; nothing changes in that case.
pub fn select_optimistic<R: Rng + ?Sized>(state: &mut NeighborState, rng: &mut R) -> Option<OptimisticRound> {
    let candidates: Vec<u32> = state
        .interested_candidates()
        .iter()
        .map(|r| r.id)
        .filter(|id| !state.preferred.contains(id) && state.optimistic != Some(*id))
        .collect()
    ;

    let peer = *candidates.choose(rng)?;

    let choked = state.optimistic.filter(|old| !state.preferred.contains(old));
    if let Some(old) = choked {
        state.send(old, Message::Choke);
    }

    state.send(peer, Message::Unchoke);
    state.optimistic = Some(peer);

    Some(OptimisticRound { peer, choked })
}

/// Runs the two periodic choking tasks until the swarm completes.
pub struct ChokeScheduler {
    table: NeighborTable,
    events: Arc<dyn EventLog>,
    config: ChokeConfig,
}

impl ChokeScheduler {
    pub fn new(table: NeighborTable, events: Arc<dyn EventLog>, config: ChokeConfig) -> ChokeScheduler {
        ChokeScheduler { table, events, config }
    }

    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let scheduler = Arc::new(self);
        let preferred = scheduler.clone();

        vec![
            tokio::spawn(async move { preferred.run_preferred(StdRng::from_entropy()).await }),
            tokio::spawn(async move { scheduler.run_optimistic(StdRng::from_entropy()).await }),
        ]
    }

    pub async fn run_preferred(&self, mut rng: StdRng) {
        while self.sleep(self.config.unchoking_interval).await {
            let round = select_preferred(&mut self.table.lock(), self.config.num_preferred, &mut rng);

            for peer in round.unchoked.iter() {
                self.events.record(Event::UnchokeSent { peer: *peer });
            }

            for peer in round.choked.iter() {
                self.events.record(Event::ChokeSent { peer: *peer });
            }

            if !round.preferred.is_empty() {
                self.events.record(Event::PreferredNeighbors { peers: round.preferred });
            }
        }

        tracing::debug!("preferred neighbor task finished");
    }

    pub async fn run_optimistic(&self, mut rng: StdRng) {
        while self.sleep(self.config.optimistic_unchoking_interval).await {
            let Some(round) = select_optimistic(&mut self.table.lock(), &mut rng) else {
                continue;
            };

            if let Some(old) = round.choked {
                self.events.record(Event::ChokeSent { peer: old });
            }

            self.events.record(Event::UnchokeSent { peer: round.peer });
            self.events.record(Event::OptimisticNeighbor { peer: round.peer });
        }

        tracing::debug!("optimistic unchoke task finished");
    }

    /// Sleeps for one interval. False once the task should stop.
    async fn sleep(&self, interval: Duration) -> bool {
        let mut shutdown = self.table.subscribe_shutdown();

        tokio::select! {
            _ = time::sleep(interval) => !self.table.is_swarm_complete() && !*shutdown.borrow(),
            _ = neighbors::shutdown_signalled(&mut shutdown) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tokio::sync::mpsc;

    use super::*;
    use crate::engine::events::testing::RecordingEventLog;
    use crate::engine::neighbors::Outbox;
    use crate::engine::pieces::PieceSet;

    type Inbox = mpsc::UnboundedReceiver<Message>;

    /// Local peer 1 plus connected remotes; returns each remote's inbox.
    fn swarm(local: PieceSet, remotes: &[u32]) -> (NeighborTable, Vec<(Outbox, Inbox)>) {
        let mut roster = vec![1];
        roster.extend_from_slice(remotes);

        let table = NeighborTable::new(1, roster, local);
        let mut links = Vec::new();

        for id in remotes {
            let (tx, mut rx) = mpsc::unbounded_channel();
            assert!(table.register_connection(*id, &tx));
            assert!(matches!(rx.try_recv(), Ok(Message::Bitfield { .. })));
            links.push((tx, rx));
        }

        (table, links)
    }

    fn interested(table: &NeighborTable, id: u32, count: u32) {
        table.set_interested_in_me(id, true);
        table.lock().record_mut(id).unwrap().round_download_count = count;
    }

    fn drain(rx: &mut Inbox) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn top_downloader_replaces_previous_preferred() {
        let (table, mut links) = swarm(PieceSet::empty(4), &[2, 3]);
        let mut rng = StdRng::seed_from_u64(1);

        interested(&table, 2, 5);
        interested(&table, 3, 3);
        table.lock().preferred.insert(3);

        let round = select_preferred(&mut table.lock(), 1, &mut rng);

        assert_eq!(round, PreferredRound { preferred: vec![2], unchoked: vec![2], choked: vec![3] });
        assert_eq!(drain(&mut links[0].1), vec![Message::Unchoke]);
        assert_eq!(drain(&mut links[1].1), vec![Message::Choke]);

        let state = table.lock();
        assert_eq!(state.preferred.iter().copied().collect::<Vec<_>>(), vec![2]);
        assert!(state.records.values().all(|r| r.round_download_count == 0));
    }

    #[test]
    fn unchanged_pool_keeps_the_same_selection() {
        let (table, mut links) = swarm(PieceSet::empty(4), &[2, 3, 4]);
        let mut rng = StdRng::seed_from_u64(2);

        for (id, count) in [(2, 1), (3, 4), (4, 4)] {
            interested(&table, id, count);
        }

        let first = select_preferred(&mut table.lock(), 2, &mut rng);
        for (_, rx) in links.iter_mut() {
            drain(rx);
        }

        for (id, count) in [(2, 1), (3, 4), (4, 4)] {
            interested(&table, id, count);
        }

        let second = select_preferred(&mut table.lock(), 2, &mut rng);

        assert_eq!(first.preferred, second.preferred);
        assert!(second.unchoked.is_empty());
        assert!(second.choked.is_empty());
        assert!(links.iter_mut().all(|(_, rx)| drain(rx).is_empty()));
    }

    #[test]
    fn uninterested_or_disconnected_peers_are_never_preferred() {
        let (table, _links) = swarm(PieceSet::empty(4), &[2, 3, 4]);
        let mut rng = StdRng::seed_from_u64(3);

        interested(&table, 2, 0);
        interested(&table, 3, 9);
        table.lock().record_mut(4).unwrap().round_download_count = 20;
        table.disconnect(3);

        let round = select_preferred(&mut table.lock(), 3, &mut rng);
        assert_eq!(round.preferred, vec![2]);
    }

    #[test]
    fn optimistic_neighbor_is_not_unchoked_twice() {
        let (table, mut links) = swarm(PieceSet::empty(4), &[2, 3]);
        let mut rng = StdRng::seed_from_u64(4);

        interested(&table, 2, 1);
        table.lock().optimistic = Some(2);

        let round = select_preferred(&mut table.lock(), 1, &mut rng);

        assert_eq!(round.preferred, vec![2]);
        assert!(round.unchoked.is_empty());
        assert!(drain(&mut links[0].1).is_empty());
    }

    #[test]
    fn seeder_picks_randomly_among_interested_peers() {
        let (table, _links) = swarm(PieceSet::full(4), &[2, 3, 4, 5]);
        let mut rng = StdRng::seed_from_u64(5);
        let mut seen = HashSet::new();

        for _ in 0..100 {
            for id in [2, 3, 4] {
                interested(&table, id, 0);
            }
            interested(&table, 5, 100);

            let round = select_preferred(&mut table.lock(), 2, &mut rng);
            assert_eq!(round.preferred.len(), 2);
            seen.extend(round.preferred);
        }

        assert_eq!(seen, HashSet::from([2, 3, 4, 5]));
    }

    #[test]
    fn empty_optimistic_pool_changes_nothing() {
        let (table, mut links) = swarm(PieceSet::empty(4), &[2, 3]);
        let mut rng = StdRng::seed_from_u64(6);

        interested(&table, 2, 0);
        interested(&table, 3, 0);
        {
            let mut state = table.lock();
            state.preferred.extend([2, 3]);
        }

        assert_eq!(select_optimistic(&mut table.lock(), &mut rng), None);
        assert_eq!(table.lock().optimistic, None);
        assert!(links.iter_mut().all(|(_, rx)| drain(rx).is_empty()));
    }

    #[test]
    fn optimistic_round_rotates_the_pick() {
        let (table, mut links) = swarm(PieceSet::empty(4), &[2, 3, 4]);
        let mut rng = StdRng::seed_from_u64(7);

        interested(&table, 3, 0);
        interested(&table, 4, 0);
        table.lock().optimistic = Some(4);

        let round = select_optimistic(&mut table.lock(), &mut rng).unwrap();

        assert_eq!(round, OptimisticRound { peer: 3, choked: Some(4) });
        assert_eq!(table.lock().optimistic, Some(3));
        assert_eq!(drain(&mut links[1].1), vec![Message::Unchoke]);
        assert_eq!(drain(&mut links[2].1), vec![Message::Choke]);
        assert!(drain(&mut links[0].1).is_empty());
    }

    #[test]
    fn previous_optimistic_that_became_preferred_stays_unchoked() {
        let (table, mut links) = swarm(PieceSet::empty(4), &[2, 3]);
        let mut rng = StdRng::seed_from_u64(8);

        interested(&table, 2, 0);
        interested(&table, 3, 0);
        {
            let mut state = table.lock();
            state.optimistic = Some(2);
            state.preferred.insert(2);
        }

        let round = select_optimistic(&mut table.lock(), &mut rng).unwrap();

        assert_eq!(round, OptimisticRound { peer: 3, choked: None });
        assert!(drain(&mut links[0].1).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_run_per_interval_and_stop_on_completion() {
        let (table, mut links) = swarm(PieceSet::empty(4), &[2, 3]);
        let events = Arc::new(RecordingEventLog::default());
        let config = ChokeConfig {
            num_preferred: 1,
            unchoking_interval: Duration::from_secs(5),
            optimistic_unchoking_interval: Duration::from_secs(15),
        };

        interested(&table, 2, 3);
        interested(&table, 3, 1);

        let handles = ChokeScheduler::new(table.clone(), events.clone(), config).spawn();

        time::sleep(Duration::from_secs(6)).await;
        assert!(events.contains(&Event::PreferredNeighbors { peers: vec![2] }));
        assert_eq!(drain(&mut links[0].1), vec![Message::Unchoke]);

        time::sleep(Duration::from_secs(10)).await;
        assert!(events.contains(&Event::OptimisticNeighbor { peer: 3 }));
        assert_eq!(drain(&mut links[1].1), vec![Message::Unchoke]);

        table.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
