#![forbid(unsafe_code)]

use serde::Deserialize;
use streambot_domain::ActionKind;

/// Versioned bot configuration. Replaced as a whole between events.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotConfig {
	pub version: u32,
	pub greeting: GreetingConfig,
	pub roulette: RouletteConfig,
	pub gacha: GachaConfig,
	pub lottery: LotteryConfig,
	pub triggers: TriggersConfig,
	pub timers: TimersConfig,
	pub cache: CacheConfig,
}

impl Default for BotConfig {
	fn default() -> Self {
		Self {
			version: 1,
			greeting: GreetingConfig::default(),
			roulette: RouletteConfig::default(),
			gacha: GachaConfig::default(),
			lottery: LotteryConfig::default(),
			triggers: TriggersConfig::default(),
			timers: TimersConfig::default(),
			cache: CacheConfig::default(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GreetingConfig {
	pub enabled: bool,
	pub reply: String,
}

impl Default for GreetingConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			reply: "Привет... чем могу помочь?".to_string(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouletteConfig {
	pub enabled: bool,
	pub commands: Vec<String>,
	pub mute_duration_ms: u64,
	pub cooldown_ms: u64,
	/// Probability of a mute. Values above 1 are read as a percentage.
	pub chance: f64,
	pub survival_messages: Vec<String>,
	pub death_messages: Vec<String>,
	pub cooldown_messages: Vec<String>,
	pub protected_messages: Vec<String>,
	/// Logins that can never be muted.
	pub protected_users: Vec<String>,
	pub allow_to_mute_moderators: bool,
}

impl RouletteConfig {
	pub fn chance_fraction(&self) -> f64 {
		let chance = if self.chance > 1.0 { self.chance / 100.0 } else { self.chance };
		if chance.is_nan() { 0.0 } else { chance.clamp(0.0, 1.0) }
	}
}

impl Default for RouletteConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			commands: vec!["!roulette".to_string(), "!рулетка".to_string()],
			mute_duration_ms: 120_000,
			cooldown_ms: 30_000,
			chance: 0.18,
			survival_messages: vec![
				"@${user} still alive! 🎲".to_string(),
				"@${user} Не пробил!".to_string(),
				"@${user} Need one more pull; Just one more!".to_string(),
			],
			death_messages: vec![
				"@${user} Победил и хранится в темном прохладном месте. 🔇".to_string(),
				"@${user} *А разве Макаровым играют в рулетку?* 🔇".to_string(),
			],
			cooldown_messages: vec![
				"@${user}, Привет... Чем могу помочь?".to_string(),
				"@${user}, Привет... Чем могу [PEKO]?".to_string(),
				"@${user}, от факапа до факапа 30 секунд. ⏳".to_string(),
				"WAAAAAAAAGH!!!!11!".to_string(),
			],
			protected_messages: vec![
				"@${user}, ты же не думаешь, что ты, что сидит за экраном, и ты здесь, в Сети - это одно и то же?"
					.to_string(),
			],
			protected_users: Vec::new(),
			allow_to_mute_moderators: false,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "u8")]
pub enum Rarity {
	Three = 3,
	Four = 4,
	Five = 5,
}

impl Rarity {
	pub fn stars(self) -> usize {
		self as usize
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Rarity::Three => "3",
			Rarity::Four => "4",
			Rarity::Five => "5",
		}
	}
}

impl TryFrom<u8> for Rarity {
	type Error = String;

	fn try_from(v: u8) -> Result<Self, Self::Error> {
		match v {
			3 => Ok(Rarity::Three),
			4 => Ok(Rarity::Four),
			5 => Ok(Rarity::Five),
			other => Err(format!("rarity must be 3, 4 or 5 (got {other})")),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GachaItem {
	pub id: String,
	pub name: String,
	pub rarity: Rarity,
	#[serde(default)]
	pub is_limited: bool,
	#[serde(default)]
	pub banner_id: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BannerMessages {
	pub single_pull: String,
	pub multi_pull_intro: String,
	pub won_50_50: String,
	pub lost_50_50: String,
	pub capturing_radiance: String,
	pub soft_pity: String,
	pub error: String,
}

impl Default for BannerMessages {
	fn default() -> Self {
		Self {
			single_pull: "@${user}, you got: ${item} ${stars}".to_string(),
			multi_pull_intro: "@${user} pulls ${count}x and gets: ".to_string(),
			won_50_50: " ✅ (50/50 Won!)".to_string(),
			lost_50_50: " ❌ (50/50 Lost)".to_string(),
			capturing_radiance: " 💫 (Capturing Radiance!)".to_string(),
			soft_pity: " 🔥 (Pull #${pull_number})".to_string(),
			error: "@${user}, error during pull: ${error}".to_string(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BannerConfig {
	pub id: u32,
	pub name: String,
	pub featured_five_star_id: Option<String>,
	pub featured_four_star_ids: Vec<String>,
	pub hard_pity_five_star: u32,
	pub hard_pity_four_star: u32,
	pub soft_pity_start: u32,
	pub base_rate_five_star: f64,
	pub base_rate_four_star: f64,
	pub featured_rate_four_star: f64,
	pub has_capturing_radiance: bool,
	pub messages: BannerMessages,
}

impl Default for BannerConfig {
	fn default() -> Self {
		Self {
			id: 0,
			name: "Banner 1".to_string(),
			featured_five_star_id: None,
			featured_four_star_ids: Vec::new(),
			hard_pity_five_star: 90,
			hard_pity_four_star: 10,
			soft_pity_start: 74,
			base_rate_five_star: 0.006,
			base_rate_four_star: 0.051,
			featured_rate_four_star: 0.5,
			has_capturing_radiance: false,
			messages: BannerMessages::default(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct GachaTrigger {
	pub reward_id: String,
	#[serde(default = "default_pull_amount")]
	pub amount: u32,
	#[serde(default)]
	pub banner_id: u32,
}

fn default_pull_amount() -> u32 {
	1
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GachaConfig {
	pub enabled: bool,
	pub banners: Vec<BannerConfig>,
	pub items: Vec<GachaItem>,
	pub triggers: Vec<GachaTrigger>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupKind {
	Time,
	Count,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WarmupTrigger {
	#[serde(default)]
	pub id: String,
	#[serde(rename = "type")]
	pub kind: WarmupKind,
	/// Seconds since start for `time`, participant count for `count`.
	pub value: u64,
	pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LotteryMessages {
	pub start: String,
	pub warmup: Vec<WarmupTrigger>,
	pub winner: String,
	pub no_participants: String,
	pub already_used: String,
	pub already_running: String,
	pub cooldown: String,
	pub cancelled: String,
	pub subject_required: String,
	pub subject_blacklisted: String,
}

impl Default for LotteryMessages {
	fn default() -> Self {
		Self {
			start: "Розыгрыш {{subject}} начат! Пиши {{trigger}} чтобы участвовать! Осталось {{timer}} сек.".to_string(),
			warmup: Vec::new(),
			winner: "Победитель: {{winner}}! Поздравляем с {{subject}}!".to_string(),
			no_participants: "Никто не захотел участвовать в розыгрыше {{subject}}".to_string(),
			already_used: "{{subject}} уже разыгрывался ранее!".to_string(),
			already_running: "Розыгрыш уже идёт! Пиши {{trigger}} чтобы участвовать.".to_string(),
			cooldown: "Подожди ещё {{cooldown}} сек перед следующим розыгрышем.".to_string(),
			cancelled: "Розыгрыш {{subject}} отменён.".to_string(),
			subject_required: "Укажите предмет розыгрыша! Пример: {{command}} приз".to_string(),
			subject_blacklisted: "{{subject}} в чёрном списке!".to_string(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LotteryConfig {
	pub enabled: bool,
	pub command: String,
	pub cancel_command: String,
	pub command_cooldown_sec: u64,
	pub entry_trigger: String,
	pub allow_chat_entry: bool,
	pub channel_point_reward_ids: Vec<String>,
	pub timer_duration_sec: u64,
	pub enforce_unique_subject: bool,
	pub subject_blacklist: Vec<String>,
	pub messages: LotteryMessages,
}

impl Default for LotteryConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			command: "!розыгрыш".to_string(),
			cancel_command: "!отмена".to_string(),
			command_cooldown_sec: 60,
			entry_trigger: "+".to_string(),
			allow_chat_entry: true,
			channel_point_reward_ids: Vec::new(),
			timer_duration_sec: 60,
			enforce_unique_subject: false,
			subject_blacklist: Vec::new(),
			messages: LotteryMessages::default(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEventType {
	Message,
	Command,
	Redemption,
	Follow,
	Raid,
}

impl TriggerEventType {
	pub fn as_str(self) -> &'static str {
		match self {
			TriggerEventType::Message => "message",
			TriggerEventType::Command => "command",
			TriggerEventType::Redemption => "redemption",
			TriggerEventType::Follow => "follow",
			TriggerEventType::Raid => "raid",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextMatchKind {
	Exact,
	Starts,
	Contains,
	Regex,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextMatch {
	#[serde(rename = "type")]
	pub kind: TextMatchKind,
	pub value: String,
	#[serde(default)]
	pub case_sensitive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
	Broadcaster,
	Mod,
	Vip,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RoleFilter {
	pub include: Vec<SenderRole>,
	pub exclude: Vec<SenderRole>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerCondition {
	pub event_type: TriggerEventType,
	#[serde(default)]
	pub text_match: Option<TextMatch>,
	#[serde(default)]
	pub reward_id: Option<String>,
	#[serde(default)]
	pub user_roles: Option<RoleFilter>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTarget {
	#[default]
	Sender,
	ArgUser,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TriggerActionParams {
	pub message: Option<String>,
	pub duration: Option<u32>,
	pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
	Seconds,
	Minutes,
	Hours,
	Days,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Delay {
	pub value: u64,
	pub unit: DelayUnit,
}

impl Delay {
	pub fn as_millis(&self) -> i64 {
		let unit_ms: u64 = match self.unit {
			DelayUnit::Seconds => 1_000,
			DelayUnit::Minutes => 60_000,
			DelayUnit::Hours => 3_600_000,
			DelayUnit::Days => 86_400_000,
		};
		i64::try_from(self.value.saturating_mul(unit_ms)).unwrap_or(i64::MAX)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerAction {
	#[serde(rename = "type")]
	pub kind: ActionKind,
	#[serde(default)]
	pub target: ActionTarget,
	#[serde(default)]
	pub arg_index: usize,
	#[serde(default)]
	pub params: TriggerActionParams,
	#[serde(default)]
	pub delay: Option<Delay>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownScope {
	#[default]
	Global,
	PerUser,
}

fn default_true() -> bool {
	true
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerRule {
	pub id: String,
	#[serde(default)]
	pub name: String,
	#[serde(default = "default_true")]
	pub enabled: bool,
	pub condition: TriggerCondition,
	#[serde(default)]
	pub actions: Vec<TriggerAction>,
	/// Seconds; 0 disables the cooldown.
	#[serde(default)]
	pub cooldown: u64,
	#[serde(default)]
	pub cooldown_scope: CooldownScope,
	#[serde(default)]
	pub stop_propagation: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TriggersConfig {
	pub enabled: bool,
	pub rules: Vec<TriggerRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimerConfig {
	pub id: String,
	#[serde(default)]
	pub name: String,
	#[serde(default = "default_true")]
	pub enabled: bool,
	pub message: String,
	#[serde(default)]
	pub min_messages: u32,
	#[serde(default)]
	pub min_interval_sec: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimersConfig {
	pub enabled: bool,
	pub timers: Vec<TimerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
	/// Seconds an event stays visible; 0 disables caching.
	pub message_lifetime_secs: u64,
	pub max_messages: usize,
}

impl Default for CacheConfig {
	fn default() -> Self {
		Self {
			message_lifetime_secs: 60,
			max_messages: 6,
		}
	}
}
