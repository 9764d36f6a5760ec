#![forbid(unsafe_code)]

mod cache;
mod config;
mod dispatcher;
mod gacha;
mod lottery;
mod middleware;
mod pipeline;
mod scheduler;
mod storage;
#[cfg(test)]
mod test_support;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use streambot_domain::{BotEvent, ChannelId};
use streambot_platform::ChannelApi;
use streambot_platform::roles::RolesCache;
use streambot_platform::twitch::TwitchChannelApi;
use streambot_platform::twitch::auth::{RefreshingTokenProvider, TokenProvider};
use streambot_platform::twitch::eventsub::{EventSubConfig, EventSubConnection, HelixSubscriber, default_subscriptions};
use streambot_platform::twitch::helix::{DEFAULT_HELIX_BASE_URL, HelixClient, validate_user_token};
use streambot_platform::twitch::irc::{ChatConfig, ChatConnection};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use url::Url;

use crate::cache::{CacheSnapshot, EventCache};
use crate::config::{BotConfig, StreambotConfig, TwitchSettings, load_bot_config_from_path, load_config_from_path};
use crate::dispatcher::Dispatcher;
use crate::gacha::{InMemoryPityStore, PityStore, SqlPityStore};
use crate::lottery::{InMemoryLotteryStore, LotteryStore, SqlLotteryStore};
use crate::middleware::{Services, build_pipeline};
use crate::pipeline::{ActionExecutor, ChannelActionExecutor};
use crate::scheduler::{ActionScheduler, InMemoryScheduledActionStore, ScheduledActionStore, SqlScheduledActionStore};
use crate::storage::Database;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: streambot [--config <path>]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.streambot/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG")
		.unwrap_or_else(|_| "info,streambot_runtime=debug,streambot_platform=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("streambot");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

struct Stores {
	scheduled: Arc<dyn ScheduledActionStore>,
	pity: Arc<dyn PityStore>,
	lottery: Arc<dyn LotteryStore>,
}

async fn open_stores(database_url: Option<&str>) -> anyhow::Result<Stores> {
	let Some(url) = database_url else {
		warn!("no database_url configured; state is kept in memory only");
		return Ok(Stores {
			scheduled: Arc::new(InMemoryScheduledActionStore::default()),
			pity: Arc::new(InMemoryPityStore::default()),
			lottery: Arc::new(InMemoryLotteryStore::default()),
		});
	};

	let db = Database::connect(url).await?;
	info!(backend = db.backend_name(), "persistence enabled");
	Ok(Stores {
		scheduled: Arc::new(SqlScheduledActionStore::new(db.clone())),
		pity: Arc::new(SqlPityStore::new(db.clone())),
		lottery: Arc::new(SqlLotteryStore::new(db)),
	})
}

/// Running Twitch managers plus the API the executor talks to.
struct TwitchSession {
	chat: ChatConnection,
	eventsub: Option<EventSubConnection>,
	api: Arc<dyn ChannelApi>,
	home_channel: Option<ChannelId>,
}

impl TwitchSession {
	async fn stop(&self) {
		let stop_eventsub = async {
			if let Some(eventsub) = self.eventsub.as_ref() {
				eventsub.stop().await;
			}
		};
		futures::join!(self.chat.stop(), stop_eventsub);
	}
}

async fn connect_twitch(settings: &TwitchSettings, events_tx: mpsc::Sender<BotEvent>) -> anyhow::Result<TwitchSession> {
	let access_token = settings
		.user_access_token
		.clone()
		.context("twitch.user_access_token is required")?;

	let client_id = match settings.client_id.clone() {
		Some(id) => id,
		None => {
			validate_user_token(access_token.expose())
				.await
				.context("validate token to discover client_id")?
				.client_id
		}
	};

	let provider = Arc::new(RefreshingTokenProvider::new(
		client_id.clone(),
		settings.client_secret.clone(),
		access_token,
		settings.refresh_token.clone(),
	));
	let validation = provider.validate().await.context("validate twitch token")?;
	info!(login = %validation.login, user_id = %validation.user_id, expires_in = validation.expires_in, "twitch token validated");
	let tokens: Arc<dyn TokenProvider> = provider;

	let base_url = Url::parse(settings.helix_base_url.as_deref().unwrap_or(DEFAULT_HELIX_BASE_URL))
		.context("parse helix base url")?;
	let helix = HelixClient::new(base_url, client_id, Arc::clone(&tokens))?;

	let bot_login = settings.bot_login.clone().unwrap_or_else(|| validation.login.clone());
	let bot_user_id = settings.bot_user_id.clone().unwrap_or_else(|| validation.user_id.clone());
	let channel_login = settings.channel_login.clone().unwrap_or_else(|| validation.login.clone());
	let channel_id = match settings.channel_id.clone() {
		Some(id) => Some(id),
		None if channel_login == validation.login => Some(validation.user_id.clone()),
		None => match helix.get_user_by_login(&channel_login).await {
			Ok(Some(user)) => Some(user.id),
			Ok(None) => {
				warn!(channel = %channel_login, "channel not found; running without eventsub");
				None
			}
			Err(e) => {
				warn!(error = %e, channel = %channel_login, "channel lookup failed; running without eventsub");
				None
			}
		},
	};

	let mut chat_cfg = ChatConfig::new(bot_login, channel_login.clone());
	if let Some(url) = settings.irc_ws_url.clone() {
		chat_cfg.ws_url = url;
	}
	chat_cfg.health_check_interval = settings.health_check_interval;
	chat_cfg.inactivity_threshold = settings.chat_inactivity;
	chat_cfg.reconnect_delay = settings.reconnect_delay;
	let chat = ChatConnection::new(chat_cfg, Arc::clone(&tokens), events_tx.clone());
	chat.start()?;
	info!(channel = %channel_login, "chat manager started");

	let broadcaster_id = channel_id.clone().unwrap_or_else(|| validation.user_id.clone());
	let api: Arc<dyn ChannelApi> = Arc::new(TwitchChannelApi::new(helix.clone(), broadcaster_id, Some(chat.clone())));

	let eventsub = match channel_id.as_deref() {
		Some(id) => {
			let mut es_cfg = EventSubConfig {
				health_check_interval: settings.health_check_interval,
				inactivity_threshold: settings.eventsub_inactivity,
				..EventSubConfig::default()
			};
			if let Some(url) = settings.eventsub_ws_url.clone() {
				es_cfg.ws_url = url;
			}
			let subscriber = Arc::new(HelixSubscriber::new(helix, default_subscriptions(id, &bot_user_id)));
			let eventsub = EventSubConnection::create(es_cfg, subscriber, events_tx)?;
			eventsub.start()?;
			info!(broadcaster_id = %id, "eventsub manager started");
			Some(eventsub)
		}
		None => None,
	};

	Ok(TwitchSession {
		chat,
		eventsub,
		api,
		home_channel: channel_id.and_then(|id| ChannelId::new(id).ok()),
	})
}

/// Re-reads the bot section on SIGHUP and publishes it to the dispatcher.
#[cfg(unix)]
fn spawn_config_reloader(
	path: PathBuf,
	config_tx: watch::Sender<Arc<BotConfig>>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
	use tokio::signal::unix::{SignalKind, signal};

	let mut hangup = signal(SignalKind::hangup()).context("install SIGHUP handler")?;
	Ok(tokio::spawn(async move {
		while hangup.recv().await.is_some() {
			match reload_bot_config(&path) {
				Ok(cfg) => {
					if config_tx.send(cfg).is_err() {
						break;
					}
				}
				Err(e) => warn!(error = %e, "config reload failed; keeping current config"),
			}
		}
	}))
}

#[cfg(not(unix))]
fn spawn_config_reloader(
	_path: PathBuf,
	_config_tx: watch::Sender<Arc<BotConfig>>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
	Ok(tokio::spawn(async {}))
}

fn reload_bot_config(path: &Path) -> anyhow::Result<Arc<BotConfig>> {
	let cfg = load_bot_config_from_path(path)?;
	info!(path = %path.display(), version = cfg.version, "bot config reloaded");
	Ok(Arc::new(cfg))
}

/// Publishes the cached event count until the cache is dropped.
async fn report_cache_size(mut snapshots: watch::Receiver<CacheSnapshot>) {
	loop {
		let cached = snapshots.borrow_and_update().events.len();
		metrics::gauge!("streambot_cached_events").set(cached as f64);
		if snapshots.changed().await.is_err() {
			break;
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let StreambotConfig {
		twitch,
		server,
		persistence,
		bot,
	} = load_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "config loaded");
	init_metrics(server.metrics_bind.as_deref());

	let stores = open_stores(persistence.database_url.as_deref()).await?;

	let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
	let session = connect_twitch(&twitch, events_tx).await?;

	let roles = Arc::new(RolesCache::default());
	let executor: Arc<dyn ActionExecutor> =
		Arc::new(ChannelActionExecutor::new(Arc::clone(&session.api)).with_roles_cache(Arc::clone(&roles)));

	let scheduler = ActionScheduler::new(Arc::clone(&stores.scheduled), Arc::clone(&executor));
	scheduler.start();

	let cache = Arc::new(EventCache::new(&bot.cache, session.home_channel.clone()));
	let pipeline = build_pipeline(
		&bot,
		Services {
			api: Arc::clone(&session.api),
			executor,
			roles: Arc::clone(&roles),
			scheduled: stores.scheduled,
			pity: stores.pity,
			lottery: stores.lottery,
			home_channel: session.home_channel.clone(),
		},
	);
	info!(middleware = ?pipeline.names(), "pipeline ready");

	let (config_tx, config_rx) = watch::channel(Arc::new(bot));
	let reloader = spawn_config_reloader(config_path, config_tx)?;

	let cache_gauge = tokio::spawn(report_cache_size(cache.subscribe()));
	let (shutdown_tx, shutdown_rx) = oneshot::channel();
	let dispatcher = tokio::spawn(Dispatcher::new(pipeline, roles, cache).run(events_rx, config_rx, shutdown_rx));

	tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
	info!("shutdown requested");

	session.stop().await;
	scheduler.stop();
	reloader.abort();
	cache_gauge.abort();
	let _ = shutdown_tx.send(());
	if let Err(e) = dispatcher.await {
		warn!(error = %e, "dispatcher task failed");
	}

	info!("streambot stopped");
	Ok(())
}
