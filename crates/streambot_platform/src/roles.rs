#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use streambot_domain::ChatRoles;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{ChannelApi, UserRoles};

pub const DEFAULT_ROLES_TTL: Duration = Duration::from_secs(300);

/// Short-lived cache of each user's moderator/VIP status.
pub struct RolesCache {
	ttl: Duration,
	entries: parking_lot::Mutex<HashMap<String, (UserRoles, Instant)>>,
}

impl Default for RolesCache {
	fn default() -> Self {
		Self::new(DEFAULT_ROLES_TTL)
	}
}

impl RolesCache {
	pub fn new(ttl: Duration) -> Self {
		Self {
			ttl,
			entries: parking_lot::Mutex::new(HashMap::new()),
		}
	}

	pub fn cached(&self, user_id: &str) -> Option<UserRoles> {
		let entries = self.entries.lock();
		entries
			.get(user_id)
			.filter(|(_, at)| at.elapsed() < self.ttl)
			.map(|(roles, _)| *roles)
	}

	/// Cached roles, falling back to the API on a miss or expiry.
	pub async fn roles(&self, api: &dyn ChannelApi, user_id: &str) -> anyhow::Result<UserRoles> {
		if let Some(roles) = self.cached(user_id) {
			return Ok(roles);
		}
		let roles = api.user_roles(user_id).await?;
		self.insert(user_id, roles);
		Ok(roles)
	}

	/// Record roles from the badges on a user's latest chat message.
	pub fn observe(&self, user_id: &str, badges: &ChatRoles) {
		self.insert(
			user_id,
			UserRoles {
				moderator: badges.moderator,
				vip: badges.vip,
			},
		);
	}

	pub fn insert(&self, user_id: &str, roles: UserRoles) {
		self.entries.lock().insert(user_id.to_string(), (roles, Instant::now()));
	}

	pub fn invalidate(&self, user_id: &str) {
		self.entries.lock().remove(user_id);
	}

	pub fn clear(&self) {
		self.entries.lock().clear();
	}
}

/// Target state for a role update; `None` leaves that role alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleChange {
	pub moderator: Option<bool>,
	pub vip: Option<bool>,
}

/// Apply `change` to a user. Moderator and VIP are exclusive on Twitch, so granting
/// one removes the other first.
pub async fn update_roles(api: &dyn ChannelApi, cache: &RolesCache, user_id: &str, change: RoleChange) -> anyhow::Result<()> {
	let current = cache.roles(api, user_id).await?;
	let result = apply_change(api, user_id, current, change).await;
	cache.invalidate(user_id);
	result
}

async fn apply_change(api: &dyn ChannelApi, user_id: &str, current: UserRoles, change: RoleChange) -> anyhow::Result<()> {
	match change.moderator {
		Some(true) if !current.moderator => {
			if current.vip {
				api.remove_vip(user_id).await?;
			}
			api.add_moderator(user_id).await?;
			info!(user_id, "granted moderator");
		}
		Some(false) if current.moderator => {
			api.remove_moderator(user_id).await?;
			info!(user_id, "removed moderator");
		}
		_ => {}
	}

	let is_moderator = change.moderator.unwrap_or(current.moderator);
	let is_vip = current.vip && change.moderator != Some(true);

	match change.vip {
		Some(true) if !is_vip => {
			if is_moderator {
				api.remove_moderator(user_id).await?;
			}
			api.add_vip(user_id).await?;
			info!(user_id, "granted vip");
		}
		Some(false) if is_vip => {
			api.remove_vip(user_id).await?;
			info!(user_id, "removed vip");
		}
		_ => debug!(user_id, ?change, "vip unchanged"),
	}
	Ok(())
}
