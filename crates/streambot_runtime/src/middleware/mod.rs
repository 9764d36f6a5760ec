#![forbid(unsafe_code)]

pub mod gacha;
pub mod greeting;
pub mod lottery;
pub mod roulette;
pub mod timers;
pub mod triggers;

use std::sync::Arc;

use streambot_domain::{BotEvent, ChannelId};
use streambot_platform::ChannelApi;
use streambot_platform::roles::RolesCache;

use crate::config::BotConfig;
use crate::gacha::PityStore;
use crate::lottery::LotteryStore;
use crate::pipeline::{ActionExecutor, Pipeline};
use crate::scheduler::ScheduledActionStore;

/// Handles shared by the processors.
#[derive(Clone)]
pub struct Services {
	pub api: Arc<dyn ChannelApi>,
	pub executor: Arc<dyn ActionExecutor>,
	pub roles: Arc<RolesCache>,
	pub scheduled: Arc<dyn ScheduledActionStore>,
	pub pity: Arc<dyn PityStore>,
	pub lottery: Arc<dyn LotteryStore>,
	pub home_channel: Option<ChannelId>,
}

/// The production chain. Order matters: an accepting processor hides the
/// event from everything after it.
pub fn build_pipeline(cfg: &BotConfig, services: Services) -> Pipeline {
	Pipeline::new(services.executor.clone())
		.with(timers::TimersMiddleware::new(cfg.timers.clone()))
		.with(roulette::RouletteMiddleware::new(
			cfg.roulette.clone(),
			services.api.clone(),
			services.roles.clone(),
			services.scheduled.clone(),
		))
		.with(lottery::LotteryMiddleware::new(
			cfg.lottery.clone(),
			services.lottery.clone(),
			services.home_channel.clone(),
		))
		.with(greeting::GreetingMiddleware::new(cfg.greeting.clone()))
		.with(gacha::GachaMiddleware::new(cfg.gacha.clone(), services.pity.clone()))
		.with(triggers::TriggersMiddleware::new(
			cfg.triggers.clone(),
			services.api,
			services.scheduled,
		))
}

/// Best human-readable name for the event's author.
pub(crate) fn display_name(event: &BotEvent) -> String {
	if let Some(name) = event.meta.user_name.as_deref().filter(|n| !n.is_empty()) {
		return name.to_string();
	}
	let login = event
		.chat()
		.and_then(|c| c.user_login.as_deref())
		.or_else(|| event.redemption().and_then(|r| r.user_login.as_deref()));
	if let Some(login) = login.filter(|l| !l.is_empty()) {
		return login.to_string();
	}
	event.meta.user_id.clone().unwrap_or_else(|| "unknown".to_string())
}

fn fill(template: &str, open: &str, close: &str, vars: &[(&str, &str)]) -> String {
	let mut out = String::with_capacity(template.len());
	let mut rest = template;
	while let Some(start) = rest.find(open) {
		let after = &rest[start + open.len()..];
		let Some(end) = after.find(close) else {
			break;
		};
		let key = &after[..end];
		out.push_str(&rest[..start]);
		match vars.iter().find(|(k, _)| *k == key) {
			Some((_, value)) => out.push_str(value),
			None => out.push_str(&rest[start..start + open.len() + end + close.len()]),
		}
		rest = &after[end + close.len()..];
	}
	out.push_str(rest);
	out
}

/// Expands `${key}` placeholders. Unknown keys stay as written.
pub(crate) fn fill_dollar(template: &str, vars: &[(&str, &str)]) -> String {
	fill(template, "${", "}", vars)
}

/// Expands `{{key}}` placeholders. Unknown keys stay as written.
pub(crate) fn fill_braces(template: &str, vars: &[(&str, &str)]) -> String {
	fill(template, "{{", "}}", vars)
}

#[cfg(test)]
mod tests {
	use streambot_domain::{EventMeta, EventPayload};

	use super::*;
	use crate::gacha::InMemoryPityStore;
	use crate::lottery::InMemoryLotteryStore;
	use crate::scheduler::InMemoryScheduledActionStore;
	use crate::test_support::{FakeApi, HOME_CHANNEL, RecordingExecutor, chat};

	#[test]
	fn dollar_placeholders() {
		assert_eq!(
			fill_dollar("${user} got ${item}!", &[("user", "Alice"), ("item", "Sword")]),
			"Alice got Sword!"
		);
		assert_eq!(fill_dollar("${missing} and ${user}", &[("user", "A")]), "${missing} and A");
		assert_eq!(fill_dollar("${args[0]}", &[("args[0]", "x")]), "x");
		assert_eq!(fill_dollar("broken ${user", &[("user", "A")]), "broken ${user");
		assert_eq!(fill_dollar("${user}${user}", &[("user", "ъ")]), "ъъ");
	}

	#[test]
	fn brace_placeholders() {
		assert_eq!(
			fill_braces("Пиши {{trigger}} за {{subject}}", &[("trigger", "+"), ("subject", "приз")]),
			"Пиши + за приз"
		);
		assert_eq!(fill_braces("{{timer}} {{other}}", &[("timer", "60")]), "60 {{other}}");
		assert_eq!(fill_braces("${user}", &[("user", "A")]), "${user}");
	}

	#[test]
	fn display_name_falls_back() {
		let mut event = chat("1", "42", "Alice", "hi");
		assert_eq!(display_name(&event), "Alice");
		event.meta.user_name = None;
		assert_eq!(display_name(&event), "alice");
		if let EventPayload::Chat(c) = &mut event.payload {
			c.user_login = None;
		}
		assert_eq!(display_name(&event), "42");

		let anonymous = BotEvent::new(
			EventMeta {
				id: "f".into(),
				timestamp_ms: 0,
				user_id: None,
				user_name: None,
				channel_id: None,
			},
			EventPayload::Follow,
		);
		assert_eq!(display_name(&anonymous), "unknown");
	}

	#[test]
	fn pipeline_order_is_fixed() {
		let services = Services {
			api: Arc::new(FakeApi::default()),
			executor: Arc::new(RecordingExecutor::default()),
			roles: Arc::new(RolesCache::default()),
			scheduled: Arc::new(InMemoryScheduledActionStore::default()),
			pity: Arc::new(InMemoryPityStore::default()),
			lottery: Arc::new(InMemoryLotteryStore::default()),
			home_channel: ChannelId::new(HOME_CHANNEL).ok(),
		};
		let pipeline = build_pipeline(&BotConfig::default(), services);
		assert_eq!(
			pipeline.names(),
			vec!["timers", "roulette", "lottery", "greeting", "gacha", "triggers"]
		);
	}
}
