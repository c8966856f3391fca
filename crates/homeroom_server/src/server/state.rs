#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

/// Shared gateway membership state.
///
/// Tracks which communities each live connection has joined, plus a global
/// refcount per community so the metrics layer can see room occupancy. Joins
/// are connection-scoped and never removed individually; they fall away when
/// the connection closes.
#[derive(Debug, Default)]
pub struct GlobalState {
	joined_by_conn: HashMap<u64, HashSet<String>>,

	community_refcounts: HashMap<String, u64>,
}

impl GlobalState {
	/// Returns a snapshot of joined communities for the given connection id.
	pub fn communities_for_conn(&self, conn_id: u64) -> HashSet<String> {
		self.joined_by_conn.get(&conn_id).cloned().unwrap_or_default()
	}

	/// Returns the current global occupancy snapshot `(community -> refcount)`.
	#[allow(dead_code)]
	pub fn community_refcounts_snapshot(&self) -> HashMap<String, u64> {
		self.community_refcounts.clone()
	}

	/// Records a join; returns `true` when this connection was not already in
	/// the community.
	pub fn join_community(&mut self, conn_id: u64, community_id: &str) -> bool {
		let joined = self.joined_by_conn.entry(conn_id).or_default();
		if !joined.insert(community_id.to_string()) {
			return false;
		}

		*self.community_refcounts.entry(community_id.to_string()).or_insert(0) += 1;
		true
	}

	/// Removes state for a connection and decrements refcounts. Returns the
	/// communities whose occupancy dropped to zero.
	pub fn remove_conn(&mut self, conn_id: u64) -> Vec<String> {
		let Some(prev) = self.joined_by_conn.remove(&conn_id) else {
			return Vec::new();
		};

		let mut emptied = Vec::new();

		for community in prev {
			match self.community_refcounts.get_mut(&community) {
				Some(rc) => {
					if *rc <= 1 {
						self.community_refcounts.remove(&community);
						emptied.push(community);
					} else {
						*rc -= 1;
					}
				}
				None => {}
			}
		}

		emptied
	}
}
