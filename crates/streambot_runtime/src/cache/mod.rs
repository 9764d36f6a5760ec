#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use streambot_domain::{BOT_EVENT_ID_PREFIX, BotEvent, ChannelId, ChatMessage, ChatRoles, EventMeta, EventPayload};
use streambot_platform::unix_ms_now;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::config::bot::CacheConfig;

pub const BOT_DISPLAY_NAME: &str = "Bot";
pub const BOT_COLOR: &str = "#69ff00";

/// What observers of the cache see.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheSnapshot {
	/// Oldest first.
	pub events: Vec<BotEvent>,
	/// Set while any cached chat message comes from another channel.
	pub show_source_channel: bool,
}

struct Entry {
	event: BotEvent,
	inserted_at: Instant,
}

/// Insertion-ordered, bounded, TTL-limited event store.
struct CacheState {
	entries: VecDeque<Entry>,
	ttl: Duration,
	capacity: usize,
}

impl CacheState {
	fn new(settings: &CacheConfig) -> Self {
		Self {
			entries: VecDeque::new(),
			ttl: Duration::from_secs(settings.message_lifetime_secs),
			capacity: settings.max_messages,
		}
	}

	fn caching(&self) -> bool {
		!self.ttl.is_zero()
	}

	/// Returns true when the visible contents changed.
	fn insert(&mut self, event: BotEvent, now: Instant) -> bool {
		match &event.payload {
			EventPayload::MessageDeleted { target_id } => return self.remove(target_id),
			EventPayload::System { .. } | EventPayload::Join | EventPayload::Part => return false,
			_ => {}
		}
		if !self.caching() {
			let changed = !self.entries.is_empty();
			self.entries.clear();
			return changed;
		}

		if let Some(existing) = self.entries.iter_mut().find(|e| e.event.id() == event.id()) {
			existing.event = event;
			existing.inserted_at = now;
		} else {
			self.entries.push_back(Entry { event, inserted_at: now });
		}
		self.enforce_capacity();
		true
	}

	fn remove(&mut self, id: &str) -> bool {
		let before = self.entries.len();
		self.entries.retain(|e| e.event.id() != id);
		self.entries.len() != before
	}

	fn enforce_capacity(&mut self) -> bool {
		let mut changed = false;
		while self.entries.len() > self.capacity {
			self.entries.pop_front();
			changed = true;
		}
		changed
	}

	fn apply_settings(&mut self, settings: &CacheConfig) -> bool {
		self.ttl = Duration::from_secs(settings.message_lifetime_secs);
		self.capacity = settings.max_messages;
		if !self.caching() {
			let changed = !self.entries.is_empty();
			self.entries.clear();
			return changed;
		}
		self.enforce_capacity()
	}

	/// Expiry is always measured from the original insertion time.
	fn next_expiry(&self) -> Option<Instant> {
		if !self.caching() {
			return None;
		}
		self.entries.iter().map(|e| e.inserted_at + self.ttl).min()
	}

	fn evict_expired(&mut self, now: Instant) -> bool {
		if !self.caching() {
			return false;
		}
		let ttl = self.ttl;
		let before = self.entries.len();
		self.entries.retain(|e| e.inserted_at + ttl > now);
		self.entries.len() != before
	}

	fn snapshot(&self, home: Option<&ChannelId>) -> CacheSnapshot {
		let show_source_channel = home.is_some_and(|home| {
			self.entries.iter().any(|e| {
				e.event
					.chat()
					.and_then(|c| c.source_channel_id.as_ref())
					.is_some_and(|source| source != home)
			})
		});
		CacheSnapshot {
			events: self.entries.iter().map(|e| e.event.clone()).collect(),
			show_source_channel,
		}
	}
}

struct Inner {
	state: Mutex<CacheState>,
	tx: watch::Sender<CacheSnapshot>,
	wake: Notify,
	home: Option<ChannelId>,
}

impl Inner {
	fn mutate(&self, f: impl FnOnce(&mut CacheState) -> bool) {
		let mut state = self.state.lock();
		if f(&mut state) {
			self.tx.send_replace(state.snapshot(self.home.as_ref()));
		}
		drop(state);
		self.wake.notify_one();
	}
}

/// Recent events for display. One sweeper task owns every expiry; dropping the
/// cache stops it.
pub struct EventCache {
	inner: Arc<Inner>,
	sweeper: JoinHandle<()>,
}

impl EventCache {
	/// Must be called inside a tokio runtime.
	pub fn new(settings: &CacheConfig, home: Option<ChannelId>) -> Self {
		let (tx, _) = watch::channel(CacheSnapshot::default());
		let inner = Arc::new(Inner {
			state: Mutex::new(CacheState::new(settings)),
			tx,
			wake: Notify::new(),
			home,
		});
		let sweeper = tokio::spawn(sweep(inner.clone()));
		Self { inner, sweeper }
	}

	pub fn insert(&self, event: BotEvent) {
		self.inner.mutate(|state| state.insert(event, Instant::now()));
	}

	/// Caches a message the bot sent so it shows next to chat.
	pub fn insert_bot_reply(&self, text: &str) {
		let event = BotEvent::new(
			EventMeta {
				id: format!("{BOT_EVENT_ID_PREFIX}{}", uuid::Uuid::new_v4()),
				timestamp_ms: unix_ms_now(),
				user_id: None,
				user_name: Some(BOT_DISPLAY_NAME.to_string()),
				channel_id: self.inner.home.clone(),
			},
			EventPayload::Chat(ChatMessage {
				text: text.to_string(),
				color: BOT_COLOR.to_string(),
				roles: ChatRoles::default(),
				emotes: Vec::new(),
				source_channel_id: None,
				user_login: None,
			}),
		);
		self.insert(event);
	}

	/// Outstanding entries keep their insertion time under the new TTL.
	pub fn update_settings(&self, settings: &CacheConfig) {
		debug!(
			ttl_secs = settings.message_lifetime_secs,
			capacity = settings.max_messages,
			"event cache settings updated"
		);
		self.inner.mutate(|state| state.apply_settings(settings));
	}

	/// The receiver starts with the current snapshot.
	pub fn subscribe(&self) -> watch::Receiver<CacheSnapshot> {
		self.inner.tx.subscribe()
	}

	#[cfg(test)]
	pub(crate) fn snapshot(&self) -> CacheSnapshot {
		self.inner.tx.borrow().clone()
	}

	#[cfg(test)]
	pub(crate) fn len(&self) -> usize {
		self.inner.state.lock().entries.len()
	}
}

impl Drop for EventCache {
	fn drop(&mut self) {
		self.sweeper.abort();
	}
}

async fn sweep(inner: Arc<Inner>) {
	loop {
		let next = inner.state.lock().next_expiry();
		match next {
			Some(at) => {
				tokio::select! {
					_ = tokio::time::sleep_until(at) => {
						let now = Instant::now();
						let mut state = inner.state.lock();
						if state.evict_expired(now) {
							inner.tx.send_replace(state.snapshot(inner.home.as_ref()));
						}
					}
					_ = inner.wake.notified() => {}
				}
			}
			None => inner.wake.notified().await,
		}
	}
}
