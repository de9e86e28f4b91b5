//! Mesh graph, Dijkstra next-hop computation, and advertisement merging.

use receptor_wire::EdgeUpdate;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Cost a direct edge is raised to when its connection drops.
pub const DEFAULT_DEAD_COST: u32 = 100;

/// How long a dead edge may linger before the expiry sweep removes it.
pub const DEFAULT_EXPIRY_INTERVAL: Duration = Duration::from_secs(60);

/// Unordered node pair identifying one edge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeKey {
    a: String,
    b: String,
}

impl EdgeKey {
    /// Key for the edge between `x` and `y`, in either order.
    pub fn new(x: &str, y: &str) -> Self {
        if x <= y {
            Self {
                a: x.to_string(),
                b: y.to_string(),
            }
        } else {
            Self {
                a: y.to_string(),
                b: x.to_string(),
            }
        }
    }

    /// True when the edge touches `node`.
    pub fn touches(&self, node: &str) -> bool {
        self.a == node || self.b == node
    }

    /// Lexicographically first endpoint.
    pub fn a(&self) -> &str {
        &self.a
    }

    /// Lexicographically second endpoint.
    pub fn b(&self) -> &str {
        &self.b
    }
}

#[derive(Debug, Clone)]
struct EdgeState {
    cost: u32,
    /// Set when the edge was marked dead; cleared on any cost upsert
    dead_since: Option<Instant>,
}

/// The local node's view of the mesh.
///
/// Edges live in ordered maps so recomputation relaxes them in a stable
/// order; combined with the FIFO counter in the priority queue this makes
/// next-hop selection deterministic under cost ties.
pub struct MeshGraph {
    local: String,
    edges: BTreeMap<EdgeKey, EdgeState>,
    neighbors: BTreeMap<String, BTreeSet<String>>,
    /// destination -> (first hop, path cost), rebuilt wholesale on every
    /// recompute
    table: HashMap<String, (String, u32)>,
    dead_cost: u32,
    expiry_interval: Duration,
}

impl MeshGraph {
    /// Empty graph for `local` with default dead-cost and expiry settings.
    pub fn new(local: impl Into<String>) -> Self {
        Self::with_thresholds(local, DEFAULT_DEAD_COST, DEFAULT_EXPIRY_INTERVAL)
    }

    /// Empty graph with explicit dead-cost and expiry settings.
    pub fn with_thresholds(
        local: impl Into<String>,
        dead_cost: u32,
        expiry_interval: Duration,
    ) -> Self {
        Self {
            local: local.into(),
            edges: BTreeMap::new(),
            neighbors: BTreeMap::new(),
            table: HashMap::new(),
            dead_cost,
            expiry_interval,
        }
    }

    /// The local node id.
    pub fn local(&self) -> &str {
        &self.local
    }

    /// The dead-edge cost threshold.
    pub fn dead_cost(&self) -> u32 {
        self.dead_cost
    }

    /// Every node appearing in the edge set, excluding the local node.
    pub fn known_nodes(&self) -> Vec<String> {
        self.neighbors
            .keys()
            .filter(|n| **n != self.local)
            .cloned()
            .collect()
    }

    /// Direct neighbors of `node`.
    pub fn neighbors(&self, node: &str) -> BTreeSet<String> {
        self.neighbors.get(node).cloned().unwrap_or_default()
    }

    /// First hop toward `dest`, `None` when unreachable.
    pub fn next_hop(&self, dest: &str) -> Option<&str> {
        if dest == self.local {
            return Some(&self.local);
        }
        self.table.get(dest).map(|(hop, _)| hop.as_str())
    }

    /// The full destination -> (first hop, path cost) table.
    pub fn routing_table(&self) -> &HashMap<String, (String, u32)> {
        &self.table
    }

    /// Every live edge as an advertisement triple.
    pub fn edges_snapshot(&self) -> Vec<EdgeUpdate> {
        self.edges
            .iter()
            .map(|(key, state)| (key.a.clone(), key.b.clone(), Some(state.cost)))
            .collect()
    }

    /// Upsert or delete a batch of edges; cost `None` deletes. The routing
    /// table is recomputed once at the end of the batch. Returns true when
    /// anything actually changed.
    pub fn add_or_update_edges(&mut self, updates: &[EdgeUpdate]) -> bool {
        let mut changed = false;
        for (a, b, cost) in updates {
            if a == b {
                continue;
            }
            changed |= self.apply_edge(a, b, *cost);
        }
        if changed {
            self.recompute();
        }
        changed
    }

    /// Merge a ROUTE advertisement received from a peer.
    ///
    /// Edges incident to the local node are authoritative here and never
    /// updated from remote state; for the rest, a cheaper locally-held cost
    /// wins, otherwise the advertised cost is taken. Returns true when the
    /// merge changed anything, in which case the caller re-advertises.
    pub fn apply_advert(&mut self, from: &str, edges: &[EdgeUpdate]) -> bool {
        let mut changed = false;
        for (a, b, cost) in edges {
            if a == b {
                continue;
            }
            if *a == self.local || *b == self.local {
                continue;
            }
            let key = EdgeKey::new(a, b);
            match cost {
                None => changed |= self.apply_edge(a, b, None),
                Some(cost) => match self.edges.get(&key) {
                    // A cheaper or identical locally-held cost wins.
                    Some(state) if state.cost <= *cost => {}
                    _ => changed |= self.apply_edge(a, b, Some(*cost)),
                },
            }
        }
        if changed {
            debug!(from, "advertisement changed the edge set");
            self.recompute();
        }
        changed
    }

    /// Delete every edge touching `node` and the node itself.
    pub fn remove_node(&mut self, node: &str) {
        let doomed: Vec<EdgeKey> = self
            .edges
            .keys()
            .filter(|key| key.touches(node))
            .cloned()
            .collect();
        if doomed.is_empty() {
            return;
        }
        for key in doomed {
            self.drop_edge(&key);
        }
        self.recompute();
    }

    /// Mark the direct edge to `peer` dead: raise its cost to the dead
    /// threshold and start its expiry clock.
    pub fn mark_dead(&mut self, peer: &str) {
        let key = EdgeKey::new(&self.local, peer);
        let Some(state) = self.edges.get_mut(&key) else {
            return;
        };
        if state.dead_since.is_some() {
            return;
        }
        info!(peer, cost = self.dead_cost, "marking direct edge dead");
        state.cost = self.dead_cost;
        state.dead_since = Some(Instant::now());
        self.recompute();
    }

    /// Remove edges dead for longer than the expiry interval, pruning nodes
    /// left with no edges. Returns the removed edges as deletion updates so
    /// they can be advertised.
    pub fn sweep_expired(&mut self) -> Vec<EdgeUpdate> {
        let now = Instant::now();
        let doomed: Vec<EdgeKey> = self
            .edges
            .iter()
            .filter(|(_, state)| {
                state
                    .dead_since
                    .is_some_and(|since| now.duration_since(since) >= self.expiry_interval)
            })
            .map(|(key, _)| key.clone())
            .collect();
        if doomed.is_empty() {
            return Vec::new();
        }

        let mut removed = Vec::with_capacity(doomed.len());
        for key in doomed {
            info!(edge = ?key, "expiring dead edge");
            self.drop_edge(&key);
            removed.push((key.a, key.b, None));
        }
        self.recompute();
        removed
    }

    fn apply_edge(&mut self, a: &str, b: &str, cost: Option<u32>) -> bool {
        let key = EdgeKey::new(a, b);
        match cost {
            Some(cost) => match self.edges.get_mut(&key) {
                Some(state) if state.cost == cost && state.dead_since.is_none() => false,
                Some(state) => {
                    state.cost = cost;
                    state.dead_since = None;
                    true
                }
                None => {
                    self.edges.insert(
                        key,
                        EdgeState {
                            cost,
                            dead_since: None,
                        },
                    );
                    self.link(a, b);
                    true
                }
            },
            None => {
                if self.edges.contains_key(&key) {
                    self.drop_edge(&key);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn link(&mut self, a: &str, b: &str) {
        self.neighbors
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string());
        self.neighbors
            .entry(b.to_string())
            .or_default()
            .insert(a.to_string());
    }

    fn drop_edge(&mut self, key: &EdgeKey) {
        self.edges.remove(key);
        for (x, y) in [(&key.a, &key.b), (&key.b, &key.a)] {
            if let Some(set) = self.neighbors.get_mut(x) {
                set.remove(y);
                if set.is_empty() {
                    self.neighbors.remove(x);
                }
            }
        }
    }

    /// Dijkstra from the local node. Heap entries carry an insertion counter
    /// so equal-cost candidates pop in FIFO order.
    fn recompute(&mut self) {
        self.table.clear();

        let mut dist: HashMap<&str, u32> = HashMap::new();
        let mut prev: HashMap<&str, &str> = HashMap::new();
        let mut heap: BinaryHeap<Reverse<(u32, u64, &str)>> = BinaryHeap::new();
        let mut seq: u64 = 0;

        dist.insert(&self.local, 0);
        heap.push(Reverse((0, seq, self.local.as_str())));

        while let Some(Reverse((cost, _, node))) = heap.pop() {
            if cost > dist.get(node).copied().unwrap_or(u32::MAX) {
                continue;
            }
            let Some(neighbors) = self.neighbors.get(node) else {
                continue;
            };
            for next in neighbors {
                let key = EdgeKey::new(node, next);
                let Some(edge) = self.edges.get(&key) else {
                    continue;
                };
                let candidate = cost.saturating_add(edge.cost);
                if candidate < dist.get(next.as_str()).copied().unwrap_or(u32::MAX) {
                    dist.insert(next, candidate);
                    prev.insert(next, node);
                    seq += 1;
                    heap.push(Reverse((candidate, seq, next.as_str())));
                }
            }
        }

        // First hop per destination: walk the predecessor chain back to the
        // node whose predecessor is the local node.
        for (dest, cost) in &dist {
            if *dest == self.local {
                continue;
            }
            let mut hop = *dest;
            while let Some(p) = prev.get(hop) {
                if *p == self.local {
                    break;
                }
                hop = p;
            }
            self.table
                .insert((*dest).to_string(), (hop.to_string(), *cost));
        }

        debug!(
            routes = self.table.len(),
            edges = self.edges.len(),
            "routing table recomputed"
        );
    }
}
