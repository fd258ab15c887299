//! # Choke Scheduler
//!
//! Serving-side admission control. At most `max_unchoked` peers may
//! request chunks at once; every update interval the peers are
//! re-ranked by their byte contribution over a rolling window, the top
//! `N−1` stay unchoked, and one slot goes to a random "optimistic"
//! pick so new peers get a chance to prove themselves.
//!
//! Super-seed mode (we are the only source of a digest) caps each peer
//! at a handful of distinct chunks before re-choking; chunks that other
//! peers already report holding burn the allowance twice as fast, which
//! biases the spread toward rare chunks.

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::identity::NodeId;
use crate::time::now_timestamp_millis;

/// Contribution accounting window.
const ROLLING_WINDOW_MS: i64 = 60_000;

/// What the serving loop should do with a chunk grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantDecision {
    /// Serve the chunk.
    Allow,
    /// Serve the chunk, then send `choke` (super-seed allowance spent).
    AllowThenChoke,
    /// Refuse: the peer is choked.
    Refuse,
}

#[derive(Default)]
struct PeerState {
    unchoked: bool,
    /// (timestamp, bytes) samples of what the peer has sent us
    contribution: VecDeque<(i64, u64)>,
    bytes_served: u64,
    /// Super-seed: distinct allowance units consumed per digest
    seed_spent: HashMap<String, u64>,
    seed_chunks: HashMap<String, HashSet<u64>>,
}

impl PeerState {
    fn contribution_in_window(&mut self) -> u64 {
        let cutoff = now_timestamp_millis() - ROLLING_WINDOW_MS;
        while matches!(self.contribution.front(), Some((ts, _)) if *ts < cutoff) {
            self.contribution.pop_front();
        }
        self.contribution.iter().map(|(_, b)| b).sum()
    }
}

#[derive(Default)]
struct ChokerState {
    peers: HashMap<NodeId, PeerState>,
    /// Digests we are currently super-seeding
    super_seed: HashSet<String>,
    /// `have` reports: (digest, chunk) → distinct holders heard from
    spread: HashMap<(String, u64), u64>,
}

/// The scheduler. One per node, shared by every serving loop.
pub struct Choker {
    max_unchoked: usize,
    seed_allowance: u64,
    state: Mutex<ChokerState>,
}

impl Choker {
    pub fn new(max_unchoked: usize, seed_allowance: u64) -> Self {
        Self {
            max_unchoked: max_unchoked.max(1),
            seed_allowance: seed_allowance.max(1),
            state: Mutex::new(ChokerState::default()),
        }
    }

    /// A peer connected. It is unchoked immediately if a slot is free;
    /// otherwise it waits for an optimistic pick.
    ///
    /// Returns whether the peer starts unchoked.
    pub fn register_peer(&self, peer: NodeId) -> bool {
        let mut state = self.state.lock();
        let unchoked_now = state.peers.values().filter(|p| p.unchoked).count();
        let entry = state.peers.entry(peer).or_default();
        if !entry.unchoked && unchoked_now < self.max_unchoked {
            entry.unchoked = true;
        }
        entry.unchoked
    }

    pub fn remove_peer(&self, peer: &NodeId) {
        self.state.lock().peers.remove(peer);
    }

    pub fn is_unchoked(&self, peer: &NodeId) -> bool {
        self.state
            .lock()
            .peers
            .get(peer)
            .map_or(false, |p| p.unchoked)
    }

    /// Bytes `peer` uploaded to us (fed by our download side).
    pub fn record_contribution(&self, peer: NodeId, bytes: u64) {
        let mut state = self.state.lock();
        let entry = state.peers.entry(peer).or_default();
        entry.contribution.push_back((now_timestamp_millis(), bytes));
    }

    /// Bytes we served to `peer`.
    pub fn record_served(&self, peer: NodeId, bytes: u64) {
        let mut state = self.state.lock();
        let entry = state.peers.entry(peer).or_default();
        entry.bytes_served += bytes;
    }

    /// A peer told us it now holds a chunk.
    pub fn note_have(&self, digest: &str, chunk: u64) {
        *self
            .state
            .lock()
            .spread
            .entry((digest.to_string(), chunk))
            .or_insert(0) += 1;
    }

    /// Mark/unmark a digest as super-seeded.
    pub fn set_super_seed(&self, digest: &str, on: bool) {
        let mut state = self.state.lock();
        if on {
            state.super_seed.insert(digest.to_string());
        } else {
            state.super_seed.remove(digest);
            for peer in state.peers.values_mut() {
                peer.seed_spent.remove(digest);
                peer.seed_chunks.remove(digest);
            }
        }
    }

    pub fn is_super_seeding(&self, digest: &str) -> bool {
        self.state.lock().super_seed.contains(digest)
    }

    /// Decide a chunk request from `peer`.
    pub fn grant(&self, peer: NodeId, digest: &str, chunk: u64) -> GrantDecision {
        let mut state = self.state.lock();
        let spread = state
            .spread
            .get(&(digest.to_string(), chunk))
            .copied()
            .unwrap_or(0);
        let super_seeding = state.super_seed.contains(digest);
        let allowance = self.seed_allowance;

        let Some(entry) = state.peers.get_mut(&peer) else {
            return GrantDecision::Refuse;
        };
        if !entry.unchoked {
            return GrantDecision::Refuse;
        }
        if !super_seeding {
            return GrantDecision::Allow;
        }

        // Super-seed: distinct chunks only; widely-held chunks cost
        // double, steering requests toward rare ones.
        let chunks = entry.seed_chunks.entry(digest.to_string()).or_default();
        if !chunks.insert(chunk) {
            return GrantDecision::Allow;
        }
        let cost = if spread > 0 { 2 } else { 1 };
        let spent = entry.seed_spent.entry(digest.to_string()).or_insert(0);
        *spent += cost;
        if *spent >= allowance {
            entry.unchoked = false;
            entry.seed_spent.remove(digest);
            entry.seed_chunks.remove(digest);
            GrantDecision::AllowThenChoke
        } else {
            GrantDecision::Allow
        }
    }

    /// Re-rank peers: top `N−1` contributors stay unchoked, one random
    /// optimistic slot from the rest. Returns `(peer, unchoke)` pairs
    /// for every peer whose state changed; the caller sends the frames.
    pub fn rebalance(&self) -> Vec<(NodeId, bool)> {
        let mut state = self.state.lock();
        if state.peers.is_empty() {
            return vec![];
        }

        let mut ranked: Vec<(NodeId, u64)> = state
            .peers
            .iter_mut()
            .map(|(id, p)| (*id, p.contribution_in_window()))
            .collect();
        // Shuffle first so ties rotate between update ticks.
        ranked.shuffle(&mut rand::thread_rng());
        ranked.sort_by(|a, b| b.1.cmp(&a.1));

        let regular_slots = self.max_unchoked.saturating_sub(1);
        let mut next_unchoked: HashSet<NodeId> =
            ranked.iter().take(regular_slots).map(|(id, _)| *id).collect();

        // Optimistic slot: a random peer outside the regulars.
        let outsiders: Vec<NodeId> = ranked
            .iter()
            .map(|(id, _)| *id)
            .filter(|id| !next_unchoked.contains(id))
            .collect();
        if let Some(lucky) = outsiders.choose(&mut rand::thread_rng()) {
            next_unchoked.insert(*lucky);
        }

        let mut changes = Vec::new();
        for (id, peer) in state.peers.iter_mut() {
            let should = next_unchoked.contains(id);
            if peer.unchoked != should {
                peer.unchoked = should;
                if should {
                    // A fresh unchoke grants a fresh super-seed allowance.
                    peer.seed_spent.clear();
                    peer.seed_chunks.clear();
                }
                changes.push((*id, should));
            }
        }
        changes
    }

    /// Peers currently unchoked (introspection).
    pub fn unchoked_peers(&self) -> Vec<NodeId> {
        self.state
            .lock()
            .peers
            .iter()
            .filter(|(_, p)| p.unchoked)
            .map(|(id, _)| *id)
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
