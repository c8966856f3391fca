#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use homeroom_domain::CommunityId;
use homeroom_protocol::pb;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Per-community hub that fans committed events out to joined connections.
///
/// One hub instance is shared by every connection; publish after commit,
/// never before.
#[derive(Debug, Clone)]
pub struct RoomHub {
	inner: Arc<Mutex<Inner>>,
	cfg: RoomHubConfig,
}

/// Configuration for `RoomHub`.
#[derive(Debug, Clone)]
pub struct RoomHubConfig {
	/// Maximum number of queued items per subscriber.
	pub subscriber_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for RoomHubConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

/// Items emitted on a subscriber stream.
#[derive(Debug, Clone)]
pub enum RoomHubItem {
	Event(Box<pb::EventEnvelope>),

	/// Indicates the subscriber is lagging and items were dropped.
	Lagged {
		dropped: u64,
	},
}

impl RoomHub {
	pub fn new(cfg: RoomHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Subscribe to a community's broadcast feed.
	pub async fn subscribe_community(&self, community: CommunityId) -> mpsc::Receiver<RoomHubItem> {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity);

		let mut inner = self.inner.lock().await;
		let entry = inner.communities.entry(community.clone()).or_default();

		prune_closed_subscribers(entry);

		entry.subscribers.push(tx);
		entry.pending_lag_by_subscriber.push(0);

		if self.cfg.debug_logs {
			debug!(community = %community, subs = entry.subscribers.len(), "room hub: subscribed");
		}

		rx
	}

	/// Drop closed subscribers for a community, removing it when empty.
	#[allow(dead_code)]
	pub async fn prune_community(&self, community: &CommunityId) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.communities.get_mut(community) {
			prune_closed_subscribers(entry);

			if entry.subscribers.is_empty() {
				inner.communities.remove(community);
			}
		}
	}

	/// Publish a committed event to everyone joined to `community`.
	pub async fn publish_event(&self, community: &CommunityId, env: pb::EventEnvelope) {
		self.publish_item(community, RoomHubItem::Event(Box::new(env))).await;
	}

	pub(crate) async fn publish_item(&self, community: &CommunityId, item: RoomHubItem) {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.communities.get_mut(community) else {
			return;
		};

		prune_closed_subscribers(entry);

		if entry.subscribers.is_empty() {
			inner.communities.remove(community);
			return;
		}

		let mut dropped_total: u64 = 0;

		for (idx, sub) in entry.subscribers.iter_mut().enumerate() {
			match sub.try_send(item.clone()) {
				Ok(()) => {
					if let Some(pending) = entry.pending_lag_by_subscriber.get_mut(idx)
						&& *pending > 0 && sub.try_send(RoomHubItem::Lagged { dropped: *pending }).is_ok()
					{
						*pending = 0;
					}
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped_total += 1;

					if let Some(pending) = entry.pending_lag_by_subscriber.get_mut(idx) {
						*pending = pending.saturating_add(1);
					}
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		prune_closed_subscribers(entry);

		if entry.subscribers.is_empty() {
			inner.communities.remove(community);
		}

		if self.cfg.debug_logs && dropped_total > 0 {
			debug!(
				community = %community,
				dropped = dropped_total,
				"room hub: dropped due to full subscriber queues"
			);
		}
	}

	/// Get a snapshot of subscriber counts per community.
	#[allow(dead_code)]
	pub async fn community_subscriber_counts(&self) -> HashMap<CommunityId, usize> {
		let inner = self.inner.lock().await;
		inner
			.communities
			.iter()
			.map(|(k, v)| (k.clone(), v.subscribers.iter().filter(|s| !s.is_closed()).count()))
			.collect()
	}
}

#[derive(Debug, Default)]
struct Inner {
	communities: HashMap<CommunityId, CommunityEntry>,
}

#[derive(Debug, Default)]
struct CommunityEntry {
	subscribers: Vec<mpsc::Sender<RoomHubItem>>,

	/// Pending lag markers per subscriber.
	pending_lag_by_subscriber: Vec<u64>,
}

fn prune_closed_subscribers(entry: &mut CommunityEntry) {
	if entry.subscribers.len() != entry.pending_lag_by_subscriber.len() {
		entry.pending_lag_by_subscriber.resize(entry.subscribers.len(), 0);
	}

	let mut new_subs = Vec::with_capacity(entry.subscribers.len());
	let mut new_lag = Vec::with_capacity(entry.subscribers.len());

	for (idx, s) in entry.subscribers.drain(..).enumerate() {
		if !s.is_closed() {
			new_subs.push(s);
			new_lag.push(*entry.pending_lag_by_subscriber.get(idx).unwrap_or(&0));
		}
	}

	entry.subscribers = new_subs;
	entry.pending_lag_by_subscriber = new_lag;
}
