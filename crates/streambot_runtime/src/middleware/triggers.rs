#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::{Captures, Regex, RegexBuilder};
use serde_json::{Map, Value};
use streambot_domain::{Action, ActionKind, BotEvent, EventPayload, Raid, Redemption};
use streambot_platform::{ChannelApi, unix_ms_now};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{display_name, fill_dollar};
use crate::config::BotConfig;
use crate::config::bot::{
	ActionTarget, CooldownScope, RoleFilter, SenderRole, TextMatch, TextMatchKind, TriggerAction, TriggerCondition,
	TriggerEventType, TriggerRule, TriggersConfig,
};
use crate::pipeline::{Middleware, MiddlewareOutput};
use crate::scheduler::{NewScheduledAction, NewTriggerExecution, ScheduledActionStore};

const DEFAULT_TIMEOUT_SECS: u32 = 60;
const DEFAULT_TIMEOUT_REASON: &str = "Trigger action";

static MENTION: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"@(\w+)").ok());
static ARG_PLACEHOLDER: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\$\{args\[(\d+)\]\}").ok());

#[derive(Debug, Clone)]
struct Person {
	id: String,
	name: String,
	display: String,
}

impl Person {
	fn shown(&self) -> &str {
		if self.display.is_empty() { &self.name } else { &self.display }
	}
}

/// What a rule sees of one event.
struct TriggerContext<'a> {
	event: &'a BotEvent,
	event_type: TriggerEventType,
	sender: Person,
	roles: HashSet<SenderRole>,
	args: Vec<String>,
	input: String,
	reward: Option<&'a Redemption>,
	raid: Option<&'a Raid>,
}

/// Words of `text`, without a leading `!command`.
fn parse_args(text: &str) -> Vec<String> {
	let mut words = text.split_whitespace().peekable();
	if words.peek().is_some_and(|w| w.starts_with('!')) {
		words.next();
	}
	words.map(str::to_string).collect()
}

fn build_context(event: &BotEvent) -> Option<TriggerContext<'_>> {
	let user_id = event.meta.user_id.clone().unwrap_or_default();
	let user_name = event.meta.user_name.clone().unwrap_or_default();
	let (event_type, sender, roles, input, reward, raid) = match &event.payload {
		EventPayload::Chat(chat) => {
			let mut roles = HashSet::new();
			if chat.roles.broadcaster {
				roles.insert(SenderRole::Broadcaster);
			}
			if chat.roles.moderator {
				roles.insert(SenderRole::Mod);
			}
			if chat.roles.vip {
				roles.insert(SenderRole::Vip);
			}
			let event_type = if chat.text.starts_with('!') {
				TriggerEventType::Command
			} else {
				TriggerEventType::Message
			};
			let sender = Person {
				id: user_id,
				name: chat.user_login.clone().unwrap_or_else(|| display_name(event)),
				display: user_name,
			};
			(event_type, sender, roles, chat.text.clone(), None, None)
		}
		EventPayload::Redemption(r) => {
			let sender = Person {
				id: user_id,
				name: r.user_login.clone().unwrap_or_else(|| user_name.clone()),
				display: user_name,
			};
			let input = r.user_input.clone().unwrap_or_default();
			(TriggerEventType::Redemption, sender, HashSet::new(), input, Some(r), None)
		}
		EventPayload::Follow => {
			let sender = Person {
				id: user_id,
				name: user_name.clone(),
				display: user_name,
			};
			(TriggerEventType::Follow, sender, HashSet::new(), String::new(), None, None)
		}
		EventPayload::Raid(raid) => {
			let sender = Person {
				id: raid.from_id.clone(),
				name: raid.from_login.clone(),
				display: raid.from_name.clone(),
			};
			(TriggerEventType::Raid, sender, HashSet::new(), String::new(), None, Some(raid))
		}
		_ => return None,
	};
	Some(TriggerContext {
		event,
		event_type,
		sender,
		roles,
		args: parse_args(&input),
		input,
		reward,
		raid,
	})
}

fn matches_text(m: &TextMatch, regex: Option<&Regex>, input: &str) -> bool {
	let (text, pattern) = if m.case_sensitive {
		(input.to_string(), m.value.clone())
	} else {
		(input.to_lowercase(), m.value.to_lowercase())
	};
	match m.kind {
		TextMatchKind::Exact => text.trim() == pattern,
		TextMatchKind::Starts => text.trim().starts_with(&pattern),
		TextMatchKind::Contains => text.contains(&pattern),
		TextMatchKind::Regex => regex.is_some_and(|re| re.is_match(input)),
	}
}

fn matches_roles(filter: &RoleFilter, roles: &HashSet<SenderRole>) -> bool {
	if !filter.include.is_empty() && !filter.include.iter().any(|r| roles.contains(r)) {
		return false;
	}
	!filter.exclude.iter().any(|r| roles.contains(r))
}

fn matches_condition(condition: &TriggerCondition, regex: Option<&Regex>, ctx: &TriggerContext<'_>) -> bool {
	if condition.event_type != ctx.event_type {
		return false;
	}
	let is_text = matches!(ctx.event_type, TriggerEventType::Message | TriggerEventType::Command);
	if let Some(text_match) = &condition.text_match
		&& is_text
		&& !matches_text(text_match, regex, &ctx.input)
	{
		return false;
	}
	if let (Some(reward_id), Some(reward)) = (&condition.reward_id, ctx.reward)
		&& &reward.reward_id != reward_id
	{
		return false;
	}
	condition
		.user_roles
		.as_ref()
		.is_none_or(|filter| matches_roles(filter, &ctx.roles))
}

/// Login named by the first `@mention`, else by `args[index]`.
fn extract_username(args: &[String], index: usize) -> Option<String> {
	if let Some(re) = MENTION.as_ref()
		&& let Some(caps) = args.iter().find_map(|a| re.captures(a))
	{
		return Some(caps[1].to_lowercase());
	}
	let arg = args.get(index)?;
	let login = arg.strip_prefix('@').unwrap_or(arg).to_lowercase();
	(!login.is_empty()).then_some(login)
}

fn interpolate(template: &str, ctx: &TriggerContext<'_>, target: Option<&Person>) -> String {
	let expanded = match ARG_PLACEHOLDER.as_ref() {
		Some(re) => re
			.replace_all(template, |caps: &Captures<'_>| {
				caps[1]
					.parse::<usize>()
					.ok()
					.and_then(|i| ctx.args.get(i))
					.cloned()
					.unwrap_or_default()
			})
			.into_owned(),
		None => template.to_string(),
	};

	let mut vars: Vec<(&str, String)> = vec![("user", ctx.sender.shown().to_string())];
	if let Some(target) = target {
		vars.push(("target", target.shown().to_string()));
	}
	if let Some(reward) = ctx.reward {
		vars.push(("reward", reward.reward_title.clone()));
		vars.push(("reward_cost", reward.reward_cost.to_string()));
	}
	if let Some(raid) = ctx.raid {
		vars.push(("raider", raid.from_name.clone()));
		vars.push(("viewers", raid.viewers.to_string()));
	}
	let vars: Vec<(&str, &str)> = vars.iter().map(|(k, v)| (*k, v.as_str())).collect();
	fill_dollar(&expanded, &vars)
}

struct CompiledRule {
	rule: TriggerRule,
	regex: Option<Regex>,
}

fn compile(cfg: &TriggersConfig) -> Vec<CompiledRule> {
	cfg.rules
		.iter()
		.map(|rule| {
			let regex = rule
				.condition
				.text_match
				.as_ref()
				.filter(|m| m.kind == TextMatchKind::Regex)
				.and_then(|m| {
					RegexBuilder::new(&m.value)
						.case_insensitive(!m.case_sensitive)
						.build()
						.map_err(|e| warn!(rule = %rule.id, error = %e, "invalid trigger regex"))
						.ok()
				});
			CompiledRule {
				rule: rule.clone(),
				regex,
			}
		})
		.collect()
}

/// Configurable rules: the first matching rule off cooldown runs its actions.
pub struct TriggersMiddleware {
	enabled: bool,
	rules: Vec<CompiledRule>,
	api: Arc<dyn ChannelApi>,
	scheduled: Arc<dyn ScheduledActionStore>,
	cooldowns: HashMap<String, Instant>,
}

impl TriggersMiddleware {
	pub fn new(cfg: TriggersConfig, api: Arc<dyn ChannelApi>, scheduled: Arc<dyn ScheduledActionStore>) -> Self {
		Self {
			enabled: cfg.enabled,
			rules: compile(&cfg),
			api,
			scheduled,
			cooldowns: HashMap::new(),
		}
	}

	fn cooldown_key(rule: &TriggerRule, ctx: &TriggerContext<'_>) -> String {
		match rule.cooldown_scope {
			CooldownScope::Global => rule.id.clone(),
			CooldownScope::PerUser => format!("{}:{}", rule.id, ctx.sender.id),
		}
	}

	fn on_cooldown(&self, rule: &TriggerRule, ctx: &TriggerContext<'_>, now: Instant) -> bool {
		if rule.cooldown == 0 {
			return false;
		}
		self.cooldowns
			.get(&Self::cooldown_key(rule, ctx))
			.is_some_and(|last| now.duration_since(*last) < Duration::from_secs(rule.cooldown))
	}

	async fn resolve(&self, action: &TriggerAction, ctx: &TriggerContext<'_>) -> Option<Person> {
		match action.target {
			ActionTarget::Sender => Some(ctx.sender.clone()),
			ActionTarget::ArgUser => {
				let login = extract_username(&ctx.args, action.arg_index)?;
				match self.api.user_by_login(&login).await {
					Ok(Some(user)) => Some(Person {
						id: user.id,
						display: user.display_name.unwrap_or_default(),
						name: user.login,
					}),
					Ok(None) => {
						debug!(login = %login, "trigger target not found");
						None
					}
					Err(e) => {
						warn!(login = %login, error = %e, "trigger target lookup failed");
						None
					}
				}
			}
		}
	}

	fn immediate(action: &TriggerAction, ctx: &TriggerContext<'_>, target: &Person, resolved: Option<&Person>) -> Action {
		let user_id = target.id.clone();
		match action.kind {
			ActionKind::SendMessage => Action::send(interpolate(
				action.params.message.as_deref().unwrap_or_default(),
				ctx,
				resolved,
			)),
			ActionKind::Timeout => Action::Timeout {
				user_id,
				duration_secs: action.params.duration.unwrap_or(DEFAULT_TIMEOUT_SECS),
				reason: action
					.params
					.reason
					.clone()
					.unwrap_or_else(|| DEFAULT_TIMEOUT_REASON.to_string()),
			},
			ActionKind::DeleteMessage => Action::DeleteMessage {
				message_id: ctx.event.id().to_string(),
			},
			ActionKind::AddVip => Action::AddVip { user_id },
			ActionKind::RemoveVip => Action::RemoveVip { user_id },
			ActionKind::AddModerator => Action::AddModerator { user_id },
			ActionKind::RemoveModerator => Action::RemoveModerator { user_id },
			ActionKind::Shoutout => Action::Shoutout { user_id },
		}
	}

	fn scheduled_params(action: &TriggerAction, ctx: &TriggerContext<'_>, resolved: Option<&Person>) -> Value {
		let mut params = Map::new();
		if let Some(message) = &action.params.message {
			params.insert("message".into(), Value::from(interpolate(message, ctx, resolved)));
		}
		if let Some(duration) = action.params.duration {
			params.insert("duration".into(), Value::from(duration));
		}
		if let Some(reason) = &action.params.reason {
			params.insert("reason".into(), Value::from(reason.clone()));
		}
		if action.kind == ActionKind::DeleteMessage {
			params.insert("message_id".into(), Value::from(ctx.event.id()));
		}
		Value::Object(params)
	}

	async fn execute(&self, rule: &TriggerRule, ctx: &TriggerContext<'_>) -> anyhow::Result<Vec<Action>> {
		let primary = match rule.actions.first() {
			Some(action) => self.resolve(action, ctx).await,
			None => None,
		};
		let execution_id = self
			.scheduled
			.record_execution(NewTriggerExecution {
				trigger_id: rule.id.clone(),
				trigger_name: rule.name.clone(),
				event_type: ctx.event_type.as_str().to_string(),
				event_id: Some(ctx.event.id().to_string()),
				source_user_id: ctx.sender.id.clone(),
				source_user_name: ctx.sender.name.clone(),
				target_user_id: primary.as_ref().map(|p| p.id.clone()),
				target_user_name: primary.as_ref().map(|p| p.name.clone()),
				args: ctx.args.clone(),
				input: ctx.input.clone(),
			})
			.await?;

		let mut primary = Some(primary);
		let mut actions = Vec::new();
		for action in &rule.actions {
			let resolved = match primary.take() {
				Some(first) => first,
				None => self.resolve(action, ctx).await,
			};
			if resolved.is_none() && action.target == ActionTarget::ArgUser {
				debug!(rule = %rule.id, kind = %action.kind, "no target user, action skipped");
				continue;
			}
			let target = resolved.clone().unwrap_or_else(|| ctx.sender.clone());

			let Some(delay) = action.delay.filter(|d| d.value > 0) else {
				actions.push(Self::immediate(action, ctx, &target, resolved.as_ref()));
				continue;
			};

			let execute_at_ms = unix_ms_now().saturating_add(delay.as_millis());
			if matches!(action.kind, ActionKind::RemoveVip | ActionKind::RemoveModerator)
				&& let Some(existing) = self
					.scheduled
					.pending_remove_for_user(&target.id, action.kind.as_str())
					.await?
			{
				self.scheduled.extend(existing.id, execute_at_ms).await?;
				info!(rule = %rule.id, kind = %action.kind, user = %target.name, execute_at_ms, "scheduled removal extended");
				continue;
			}
			self.scheduled
				.schedule(NewScheduledAction {
					execution_id: Some(execution_id),
					action_type: action.kind.as_str().to_string(),
					params: Self::scheduled_params(action, ctx, resolved.as_ref()),
					target_user_id: target.id.clone(),
					target_user_name: Some(target.name.clone()),
					execute_at_ms,
				})
				.await?;
			info!(rule = %rule.id, kind = %action.kind, user = %target.name, execute_at_ms, "trigger action scheduled");
		}
		info!(rule = %rule.id, sender = %ctx.sender.name, "trigger executed");
		Ok(actions)
	}
}

#[async_trait::async_trait]
impl Middleware for TriggersMiddleware {
	fn name(&self) -> &'static str {
		"triggers"
	}

	async fn process(&mut self, event: &BotEvent) -> anyhow::Result<MiddlewareOutput> {
		if !self.enabled || self.rules.is_empty() || event.is_bot_authored() {
			return Ok(MiddlewareOutput::pass());
		}
		let Some(ctx) = build_context(event) else {
			return Ok(MiddlewareOutput::pass());
		};

		let now = Instant::now();
		for compiled in &self.rules {
			let rule = &compiled.rule;
			if !rule.enabled
				|| !matches_condition(&rule.condition, compiled.regex.as_ref(), &ctx)
				|| self.on_cooldown(rule, &ctx, now)
			{
				continue;
			}
			match self.execute(rule, &ctx).await {
				Ok(actions) => {
					let accepted = rule.stop_propagation;
					if rule.cooldown > 0 {
						let key = Self::cooldown_key(rule, &ctx);
						self.cooldowns.insert(key, now);
					}
					return Ok(MiddlewareOutput::actions(actions, accepted));
				}
				Err(e) => warn!(rule = %rule.id, error = %e, "trigger failed"),
			}
		}
		Ok(MiddlewareOutput::pass())
	}

	fn update_config(&mut self, cfg: &BotConfig) {
		self.enabled = cfg.triggers.enabled;
		self.rules = compile(&cfg.triggers);
		debug!(rules = self.rules.len(), enabled = self.enabled, "trigger rules reloaded");
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::Ordering;

	use streambot_domain::ChatRoles;

	use super::*;
	use crate::config::bot::{Delay, DelayUnit, TriggerActionParams};
	use crate::scheduler::InMemoryScheduledActionStore;
	use crate::scheduler::store::ScheduledStatus;
	use crate::test_support::{FakeApi, chat, chat_with_roles, raid, redemption, sent};

	fn rule(id: &str, condition: TriggerCondition, actions: Vec<TriggerAction>) -> TriggerRule {
		TriggerRule {
			id: id.into(),
			name: format!("rule {id}"),
			enabled: true,
			condition,
			actions,
			cooldown: 0,
			cooldown_scope: CooldownScope::Global,
			stop_propagation: false,
		}
	}

	fn on(event_type: TriggerEventType) -> TriggerCondition {
		TriggerCondition {
			event_type,
			text_match: None,
			reward_id: None,
			user_roles: None,
		}
	}

	fn text(event_type: TriggerEventType, kind: TextMatchKind, value: &str) -> TriggerCondition {
		TriggerCondition {
			text_match: Some(TextMatch {
				kind,
				value: value.into(),
				case_sensitive: false,
			}),
			..on(event_type)
		}
	}

	fn act(kind: ActionKind) -> TriggerAction {
		TriggerAction {
			kind,
			target: ActionTarget::Sender,
			arg_index: 0,
			params: TriggerActionParams::default(),
			delay: None,
		}
	}

	fn say(message: &str) -> TriggerAction {
		TriggerAction {
			params: TriggerActionParams {
				message: Some(message.into()),
				..TriggerActionParams::default()
			},
			..act(ActionKind::SendMessage)
		}
	}

	struct Fixture {
		middleware: TriggersMiddleware,
		store: Arc<InMemoryScheduledActionStore>,
		api: Arc<FakeApi>,
	}

	fn fixture(rules: Vec<TriggerRule>, api: FakeApi) -> Fixture {
		let store = Arc::new(InMemoryScheduledActionStore::default());
		let api = Arc::new(api);
		let cfg = TriggersConfig { enabled: true, rules };
		Fixture {
			middleware: TriggersMiddleware::new(cfg, api.clone(), store.clone()),
			store,
			api,
		}
	}

	#[tokio::test]
	async fn command_rule_replies_and_records_execution() {
		let mut r = rule("hi", text(TriggerEventType::Command, TextMatchKind::Starts, "!Hug"), vec![say(
			"${user} hugs ${args[0]}${args[5]}",
		)]);
		r.stop_propagation = true;
		let mut f = fixture(vec![r], FakeApi::default());

		let out = f.middleware.process(&chat("e1", "42", "Alice", "!hug everyone")).await.unwrap();
		assert!(out.accepted);
		assert_eq!(sent(&out.actions), vec!["Alice hugs everyone"]);

		let executions = f.store.executions().await;
		assert_eq!(executions.len(), 1);
		assert_eq!(executions[0].trigger_id, "hi");
		assert_eq!(executions[0].event_type, "command");
		assert_eq!(executions[0].args, vec!["everyone"]);
		assert_eq!(executions[0].target_user_id.as_deref(), Some("42"));

		let out = f.middleware.process(&chat("e2", "42", "Alice", "hug")).await.unwrap();
		assert!(out.actions.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn cooldown_scopes() {
		let mut global = rule("g", text(TriggerEventType::Message, TextMatchKind::Exact, "ping"), vec![say("pong")]);
		global.cooldown = 10;
		let mut per_user = rule("p", text(TriggerEventType::Message, TextMatchKind::Exact, "ding"), vec![say("dong")]);
		per_user.cooldown = 10;
		per_user.cooldown_scope = CooldownScope::PerUser;
		let mut f = fixture(vec![global, per_user], FakeApi::default());
		let replies = |out: MiddlewareOutput| sent(&out.actions).len();

		assert_eq!(replies(f.middleware.process(&chat("1", "a", "A", "PING")).await.unwrap()), 1);
		assert_eq!(replies(f.middleware.process(&chat("2", "b", "B", "ping")).await.unwrap()), 0);
		assert_eq!(replies(f.middleware.process(&chat("3", "a", "A", "ding")).await.unwrap()), 1);
		assert_eq!(replies(f.middleware.process(&chat("4", "b", "B", "ding")).await.unwrap()), 1);
		assert_eq!(replies(f.middleware.process(&chat("5", "a", "A", "ding")).await.unwrap()), 0);

		tokio::time::advance(Duration::from_secs(10)).await;
		assert_eq!(replies(f.middleware.process(&chat("6", "b", "B", "ping")).await.unwrap()), 1);
	}

	#[tokio::test]
	async fn arg_user_is_resolved_or_skipped() {
		let mut vip = act(ActionKind::AddVip);
		vip.target = ActionTarget::ArgUser;
		let mut announce = say("${user} made ${target} a vip");
		announce.target = ActionTarget::ArgUser;
		let r = rule("vip", text(TriggerEventType::Command, TextMatchKind::Starts, "!vip"), vec![
			vip,
			announce,
			say("done"),
		]);
		let mut f = fixture(vec![r], FakeApi::default().with_user("7", "bob"));

		let out = f.middleware.process(&chat("1", "a", "Alice", "!vip please @Bob")).await.unwrap();
		assert_eq!(out.actions[0], Action::AddVip { user_id: "7".into() });
		assert_eq!(sent(&out.actions), vec!["Alice made BOB a vip", "done"]);

		let out = f.middleware.process(&chat("2", "a", "Alice", "!vip nobody")).await.unwrap();
		assert_eq!(sent(&out.actions), vec!["done"]);
		assert_eq!(out.actions.len(), 1);
	}

	#[tokio::test]
	async fn first_action_target_is_looked_up_once() {
		let mut vip = act(ActionKind::AddVip);
		vip.target = ActionTarget::ArgUser;
		let mut shoutout = act(ActionKind::Shoutout);
		shoutout.target = ActionTarget::ArgUser;
		let r = rule("vip", text(TriggerEventType::Command, TextMatchKind::Starts, "!vip"), vec![vip, shoutout]);
		let mut f = fixture(vec![r], FakeApi::default().with_user("7", "bob"));

		let out = f.middleware.process(&chat("1", "a", "Alice", "!vip @bob")).await.unwrap();
		assert_eq!(out.actions, vec![Action::AddVip { user_id: "7".into() }, Action::Shoutout {
			user_id: "7".into()
		}]);
		assert_eq!(f.api.user_lookups.load(Ordering::Relaxed), 2);
	}

	#[test]
	fn username_extraction() {
		let args = |s: &str| parse_args(s);
		assert_eq!(extract_username(&args("!cmd a @Bob c"), 0).as_deref(), Some("bob"));
		assert_eq!(extract_username(&args("!cmd first Second"), 1).as_deref(), Some("second"));
		assert_eq!(extract_username(&args("!cmd first"), 3), None);
		assert_eq!(extract_username(&[], 0), None);
	}

	#[tokio::test]
	async fn delayed_removal_is_extended_not_duplicated() {
		let mut remove = act(ActionKind::RemoveVip);
		remove.delay = Some(Delay {
			value: 1,
			unit: DelayUnit::Hours,
		});
		let r = rule("reward_vip", on(TriggerEventType::Redemption), vec![act(ActionKind::AddVip), remove]);
		let mut f = fixture(vec![r], FakeApi::default());

		let out = f.middleware.process(&redemption("1", "9", "Viewer", "vip", None)).await.unwrap();
		assert_eq!(out.actions, vec![Action::AddVip { user_id: "9".into() }]);
		let first = f.store.history(10, 0).await.unwrap();
		assert_eq!(first.len(), 1);
		assert_eq!(first[0].action_type, "remove_vip");
		assert_eq!(first[0].status, ScheduledStatus::Pending);
		assert!(first[0].execution_id.is_some());

		tokio::time::sleep(Duration::from_millis(5)).await;
		f.middleware.process(&redemption("2", "9", "Viewer", "vip", None)).await.unwrap();
		let second = f.store.history(10, 0).await.unwrap();
		assert_eq!(second.len(), 1);
		assert!(second[0].execute_at_ms >= first[0].execute_at_ms);
	}

	#[tokio::test]
	async fn delayed_message_is_interpolated_when_scheduled() {
		let mut later = say("thanks ${user} for ${reward} (${reward_cost})");
		later.delay = Some(Delay {
			value: 30,
			unit: DelayUnit::Seconds,
		});
		let mut f = fixture(vec![rule("thanks", on(TriggerEventType::Redemption), vec![later])], FakeApi::default());
		let out = f.middleware.process(&redemption("1", "9", "Viewer", "r1", Some("hi"))).await.unwrap();
		assert!(out.actions.is_empty());
		let rows = f.store.history(10, 0).await.unwrap();
		assert_eq!(rows[0].params["message"], "thanks Viewer for Reward r1 (500)");
	}

	#[tokio::test]
	async fn reward_and_role_conditions() {
		let reward_only = TriggerCondition {
			reward_id: Some("r2".into()),
			..on(TriggerEventType::Redemption)
		};
		let mods_only = TriggerCondition {
			user_roles: Some(RoleFilter {
				include: vec![SenderRole::Mod, SenderRole::Broadcaster],
				exclude: vec![SenderRole::Vip],
			}),
			..text(TriggerEventType::Command, TextMatchKind::Exact, "!clear")
		};
		let mut f = fixture(
			vec![
				rule("reward", reward_only, vec![say("${args[0]} via ${reward}")]),
				rule("mods", mods_only, vec![say("cleared")]),
			],
			FakeApi::default(),
		);

		assert!(f.middleware.process(&redemption("1", "u", "U", "r1", None)).await.unwrap().actions.is_empty());
		let out = f.middleware.process(&redemption("2", "u", "U", "r2", Some("word up"))).await.unwrap();
		assert_eq!(sent(&out.actions), vec!["word via Reward r2"]);

		let moderator = ChatRoles {
			moderator: true,
			..ChatRoles::default()
		};
		let moderator_vip = ChatRoles { vip: true, ..moderator };
		assert!(f.middleware.process(&chat("3", "u", "U", "!clear")).await.unwrap().actions.is_empty());
		assert!(
			f.middleware
				.process(&chat_with_roles("4", "u", "U", "!clear", moderator_vip))
				.await
				.unwrap()
				.actions
				.is_empty()
		);
		let out = f.middleware.process(&chat_with_roles("5", "u", "U", "!clear", moderator)).await.unwrap();
		assert_eq!(sent(&out.actions), vec!["cleared"]);
	}

	#[tokio::test]
	async fn raid_timeout_and_delete_actions() {
		let mut f = fixture(
			vec![
				rule("raid", on(TriggerEventType::Raid), vec![
					say("${raider} brought ${viewers}"),
					act(ActionKind::Shoutout),
				]),
				rule("bad", text(TriggerEventType::Message, TextMatchKind::Contains, "spam"), vec![
					act(ActionKind::DeleteMessage),
					act(ActionKind::Timeout),
				]),
			],
			FakeApi::default(),
		);

		let out = f.middleware.process(&raid("r", "55", "Raider", 12)).await.unwrap();
		assert_eq!(out.actions, vec![
			Action::send("Raider brought 12"),
			Action::Shoutout { user_id: "55".into() }
		]);

		let out = f.middleware.process(&chat("m1", "u", "U", "buy SPAM now")).await.unwrap();
		assert_eq!(out.actions, vec![
			Action::DeleteMessage {
				message_id: "m1".into()
			},
			Action::Timeout {
				user_id: "u".into(),
				duration_secs: 60,
				reason: "Trigger action".into(),
			},
		]);
	}

	#[tokio::test]
	async fn regex_rules_and_invalid_patterns() {
		let mut f = fixture(
			vec![
				rule("broken", text(TriggerEventType::Message, TextMatchKind::Regex, "(unclosed"), vec![say("never")]),
				rule("digits", text(TriggerEventType::Message, TextMatchKind::Regex, r"^CODE-\d+$"), vec![say("ok")]),
			],
			FakeApi::default(),
		);
		assert_eq!(sent(&f.middleware.process(&chat("1", "u", "U", "code-42")).await.unwrap().actions), vec!["ok"]);
		assert!(f.middleware.process(&chat("2", "u", "U", "(unclosed")).await.unwrap().actions.is_empty());
	}

	#[tokio::test]
	async fn disabled_rules_and_reload() {
		let mut f = fixture(vec![rule("x", on(TriggerEventType::Follow), vec![say("thanks")])], FakeApi::default());
		let mut cfg = BotConfig::default();
		cfg.triggers.enabled = false;
		f.middleware.update_config(&cfg);
		let follow = BotEvent::new(crate::test_support::meta("f", "u", "U"), EventPayload::Follow);
		assert!(f.middleware.process(&follow).await.unwrap().actions.is_empty());

		cfg.triggers = TriggersConfig {
			enabled: true,
			rules: vec![rule("x", on(TriggerEventType::Follow), vec![say("thanks ${user}")])],
		};
		f.middleware.update_config(&cfg);
		assert_eq!(sent(&f.middleware.process(&follow).await.unwrap().actions), vec!["thanks U"]);
	}
}
