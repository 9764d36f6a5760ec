#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use streambot_domain::Action;
use streambot_platform::ChannelApi;
use streambot_platform::roles::RolesCache;
use tracing::debug;

pub const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait::async_trait]
pub trait ActionExecutor: Send + Sync {
	async fn execute(&self, action: &Action) -> anyhow::Result<()>;
}

/// Executes actions against the channel API, one call per action.
pub struct ChannelActionExecutor {
	api: Arc<dyn ChannelApi>,
	roles: Option<Arc<RolesCache>>,
	timeout: Duration,
}

impl ChannelActionExecutor {
	pub fn new(api: Arc<dyn ChannelApi>) -> Self {
		Self {
			api,
			roles: None,
			timeout: DEFAULT_EXECUTE_TIMEOUT,
		}
	}

	/// Invalidate cached roles after role changes.
	pub fn with_roles_cache(mut self, roles: Arc<RolesCache>) -> Self {
		self.roles = Some(roles);
		self
	}

	async fn dispatch(&self, action: &Action) -> anyhow::Result<()> {
		let api = self.api.as_ref();
		match action {
			Action::SendMessage { text, .. } => api.send_message(text).await,
			Action::Timeout {
				user_id,
				duration_secs,
				reason,
			} => {
				let reason = (!reason.is_empty()).then_some(reason.as_str());
				api.timeout_user(user_id, *duration_secs, reason).await
			}
			Action::DeleteMessage { message_id } => api.delete_message(message_id).await,
			Action::AddVip { user_id } => api.add_vip(user_id).await,
			Action::RemoveVip { user_id } => api.remove_vip(user_id).await,
			Action::AddModerator { user_id } => api.add_moderator(user_id).await,
			Action::RemoveModerator { user_id } => api.remove_moderator(user_id).await,
			Action::Shoutout { user_id } => api.shoutout(user_id).await,
		}
	}
}

fn role_target(action: &Action) -> Option<&str> {
	match action {
		Action::AddVip { user_id }
		| Action::RemoveVip { user_id }
		| Action::AddModerator { user_id }
		| Action::RemoveModerator { user_id } => Some(user_id),
		_ => None,
	}
}

#[async_trait::async_trait]
impl ActionExecutor for ChannelActionExecutor {
	async fn execute(&self, action: &Action) -> anyhow::Result<()> {
		let kind = action.kind();
		let result = match tokio::time::timeout(self.timeout, self.dispatch(action)).await {
			Ok(result) => result,
			Err(_) => Err(anyhow!("{kind} timed out after {}s", self.timeout.as_secs())),
		};

		if let (Some(roles), Some(user_id)) = (&self.roles, role_target(action)) {
			roles.invalidate(user_id);
		}

		let outcome = if result.is_ok() { "ok" } else { "error" };
		metrics::counter!("streambot_actions_total", "kind" => kind.as_str(), "outcome" => outcome).increment(1);
		debug!(%kind, outcome, "action executed");
		result
	}
}
