//! Link-state mesh graph and routing table.
//!
//! The graph holds the undirected weighted edge set learned from direct
//! connections and ROUTE advertisements, and keeps a next-hop table
//! recomputed with Dijkstra whenever the edge set changes. Lost links are
//! first marked dead (cost raised to a threshold) and only removed after an
//! expiry interval without reconnection, so short outages do not churn
//! routes across the mesh.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod graph;

pub use graph::{EdgeKey, MeshGraph, DEFAULT_DEAD_COST, DEFAULT_EXPIRY_INTERVAL};
