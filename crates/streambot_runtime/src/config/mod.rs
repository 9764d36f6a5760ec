#![forbid(unsafe_code)]

pub mod bot;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use streambot_platform::SecretString;
use tracing::info;

pub use bot::BotConfig;

/// Default config path: `~/.streambot/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".streambot").join("config.toml"))
}

/// Load the config from TOML and env overrides. A missing file yields defaults.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<StreambotConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = StreambotConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg);
	Ok(cfg)
}

/// Re-read only the bot section, for live reloads.
pub fn load_bot_config_from_path(path: &Path) -> anyhow::Result<BotConfig> {
	Ok(read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default()
		.bot)
}

#[derive(Debug, Clone, Default)]
pub struct StreambotConfig {
	pub twitch: TwitchSettings,
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
	pub bot: BotConfig,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Database URL (sqlite: or postgres:). `None` keeps every store in memory.
	pub database_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TwitchSettings {
	pub client_id: Option<String>,
	pub client_secret: Option<SecretString>,
	pub user_access_token: Option<SecretString>,
	pub refresh_token: Option<SecretString>,

	/// Login the bot chats as; defaults to the token user.
	pub bot_login: Option<String>,
	/// Channel to join; defaults to the token user.
	pub channel_login: Option<String>,
	pub channel_id: Option<String>,
	pub bot_user_id: Option<String>,

	pub irc_ws_url: Option<String>,
	pub eventsub_ws_url: Option<String>,
	pub helix_base_url: Option<String>,

	pub health_check_interval: Duration,
	pub chat_inactivity: Duration,
	pub eventsub_inactivity: Duration,
	pub reconnect_delay: Duration,
}

impl Default for TwitchSettings {
	fn default() -> Self {
		Self {
			client_id: None,
			client_secret: None,
			user_access_token: None,
			refresh_token: None,
			bot_login: None,
			channel_login: None,
			channel_id: None,
			bot_user_id: None,
			irc_ws_url: None,
			eventsub_ws_url: None,
			helix_base_url: None,
			health_check_interval: Duration::from_secs(60),
			chat_inactivity: Duration::from_secs(300),
			eventsub_inactivity: Duration::from_secs(360),
			reconnect_delay: Duration::from_millis(300),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	bot: BotConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	client_id: Option<String>,
	client_secret: Option<String>,
	user_access_token: Option<String>,
	refresh_token: Option<String>,
	bot_login: Option<String>,
	channel_login: Option<String>,
	channel_id: Option<String>,
	bot_user_id: Option<String>,
	irc_ws_url: Option<String>,
	eventsub_ws_url: Option<String>,
	helix_base_url: Option<String>,

	health_check_secs: Option<u64>,
	chat_inactivity_secs: Option<u64>,
	eventsub_inactivity_secs: Option<u64>,
	reconnect_delay_ms: Option<u64>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl StreambotConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = TwitchSettings::default();
		let twitch = TwitchSettings {
			client_id: non_empty(file.twitch.client_id),
			client_secret: non_empty(file.twitch.client_secret).map(SecretString::new),
			user_access_token: non_empty(file.twitch.user_access_token).map(SecretString::new),
			refresh_token: non_empty(file.twitch.refresh_token).map(SecretString::new),
			bot_login: non_empty(file.twitch.bot_login).map(|s| s.to_lowercase()),
			channel_login: non_empty(file.twitch.channel_login).map(|s| s.trim_start_matches('#').to_lowercase()),
			channel_id: non_empty(file.twitch.channel_id),
			bot_user_id: non_empty(file.twitch.bot_user_id),
			irc_ws_url: non_empty(file.twitch.irc_ws_url),
			eventsub_ws_url: non_empty(file.twitch.eventsub_ws_url),
			helix_base_url: non_empty(file.twitch.helix_base_url),
			health_check_interval: file
				.twitch
				.health_check_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(defaults.health_check_interval),
			chat_inactivity: file
				.twitch
				.chat_inactivity_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(defaults.chat_inactivity),
			eventsub_inactivity: file
				.twitch
				.eventsub_inactivity_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(defaults.eventsub_inactivity),
			reconnect_delay: file
				.twitch
				.reconnect_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.reconnect_delay),
		};

		Self {
			twitch,
			server: ServerSettings {
				metrics_bind: non_empty(file.server.metrics_bind),
			},
			persistence: PersistenceSettings {
				database_url: non_empty(file.persistence.database_url),
			},
			bot: file.bot,
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn env_string(key: &str) -> Option<String> {
	std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn apply_env_overrides(cfg: &mut StreambotConfig) {
	apply_overrides_from(cfg, env_string);
}

fn apply_overrides_from(cfg: &mut StreambotConfig, get: impl Fn(&str) -> Option<String>) {
	if let Some(v) = get("STREAMBOT_TWITCH_CLIENT_ID") {
		cfg.twitch.client_id = Some(v);
		info!("twitch config: client_id overridden by env");
	}

	if let Some(v) = get("STREAMBOT_TWITCH_CLIENT_SECRET") {
		cfg.twitch.client_secret = Some(SecretString::new(v));
		info!("twitch config: client_secret overridden by env");
	}

	if let Some(v) = get("STREAMBOT_TWITCH_USER_ACCESS_TOKEN") {
		cfg.twitch.user_access_token = Some(SecretString::new(v));
		info!("twitch config: user_access_token overridden by env");
	}

	if let Some(v) = get("STREAMBOT_TWITCH_REFRESH_TOKEN") {
		cfg.twitch.refresh_token = Some(SecretString::new(v));
		info!("twitch config: refresh_token overridden by env");
	}

	if let Some(v) = get("STREAMBOT_TWITCH_CHANNEL") {
		cfg.twitch.channel_login = Some(v.trim_start_matches('#').to_lowercase());
		info!("twitch config: channel_login overridden by env");
	}

	if let Some(v) = get("STREAMBOT_TWITCH_BOT_LOGIN") {
		cfg.twitch.bot_login = Some(v.to_lowercase());
		info!("twitch config: bot_login overridden by env");
	}

	if let Some(v) = get("STREAMBOT_TWITCH_IRC_WS_URL") {
		cfg.twitch.irc_ws_url = Some(v);
		info!("twitch config: irc_ws_url overridden by env");
	}

	if let Some(v) = get("STREAMBOT_TWITCH_EVENTSUB_WS_URL") {
		cfg.twitch.eventsub_ws_url = Some(v);
		info!("twitch config: eventsub_ws_url overridden by env");
	}

	if let Some(v) = get("STREAMBOT_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = get("STREAMBOT_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = get("STREAMBOT_ROULETTE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.bot.roulette.enabled = enabled;
		info!(enabled, "bot config: roulette.enabled overridden by env");
	}

	if let Some(v) = get("STREAMBOT_GACHA_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.bot.gacha.enabled = enabled;
		info!(enabled, "bot config: gacha.enabled overridden by env");
	}
}
