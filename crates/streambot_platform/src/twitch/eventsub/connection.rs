#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use streambot_domain::BotEvent;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::guard::{EventSubGuard, EventSubGuardError};
use super::subscriptions::EventSubSubscriber;
use super::{MessageDedup, normalize_notification, parse_revocation, parse_session, peek};
use crate::twitch::{TwitchWs, WsConnector, default_ws_connector};
use crate::{ConnectionError, ConnectionState};

pub const DEFAULT_EVENTSUB_WS_URL: &str = "wss://eventsub.wss.twitch.tv/ws";
const MIGRATION_BUFFER_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventSubConfig {
	pub ws_url: String,
	pub health_check_interval: Duration,
	pub inactivity_threshold: Duration,
	pub restart_delay: Duration,
	pub error_restart_delay: Duration,
	pub dedup_window: Duration,
	pub ws_connector: Option<WsConnector>,
}

impl Default for EventSubConfig {
	fn default() -> Self {
		Self {
			ws_url: DEFAULT_EVENTSUB_WS_URL.to_string(),
			health_check_interval: Duration::from_secs(60),
			inactivity_threshold: Duration::from_secs(360),
			restart_delay: Duration::from_secs(1),
			error_restart_delay: Duration::from_secs(5),
			dedup_window: Duration::from_secs(300),
			ws_connector: None,
		}
	}
}

enum Control {
	Restart,
	Stop,
}

enum SessionEnd {
	Stopped,
	Restart,
	Closed(String),
}

struct Running {
	control_tx: mpsc::UnboundedSender<Control>,
	task: JoinHandle<()>,
}

struct Shared {
	_guard: EventSubGuard,
	cfg: EventSubConfig,
	subscriber: Arc<dyn EventSubSubscriber>,
	events_tx: mpsc::Sender<BotEvent>,
	state_tx: watch::Sender<ConnectionState>,
	session_tx: watch::Sender<Option<String>>,
	stopping: AtomicBool,
	epoch: AtomicU64,
	running: parking_lot::Mutex<Option<Running>>,
}

/// EventSub WebSocket connection manager. Owns the process's [`EventSubGuard`].
#[derive(Clone)]
pub struct EventSubConnection {
	shared: Arc<Shared>,
}

struct MigrationState {
	reconnect_url: Option<String>,
	ws2: Option<TwitchWs>,
	buffered: VecDeque<String>,
}

/// Per-connection ingest state that outlives a single socket.
struct Ingest {
	dedup: MessageDedup,
	last_ts: i64,
}

impl EventSubConnection {
	/// Acquire the process-wide guard and build the manager.
	pub fn create(
		cfg: EventSubConfig,
		subscriber: Arc<dyn EventSubSubscriber>,
		events_tx: mpsc::Sender<BotEvent>,
	) -> Result<Self, EventSubGuardError> {
		let guard = EventSubGuard::acquire()?;
		Ok(Self::with_guard(guard, cfg, subscriber, events_tx))
	}

	pub fn with_guard(
		guard: EventSubGuard,
		cfg: EventSubConfig,
		subscriber: Arc<dyn EventSubSubscriber>,
		events_tx: mpsc::Sender<BotEvent>,
	) -> Self {
		let (state_tx, _) = watch::channel(ConnectionState::Idle);
		let (session_tx, _) = watch::channel(None);
		Self {
			shared: Arc::new(Shared {
				_guard: guard,
				cfg,
				subscriber,
				events_tx,
				state_tx,
				session_tx,
				stopping: AtomicBool::new(false),
				epoch: AtomicU64::new(0),
				running: parking_lot::Mutex::new(None),
			}),
		}
	}

	pub fn state(&self) -> ConnectionState {
		*self.shared.state_tx.borrow()
	}

	pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
		self.shared.state_tx.subscribe()
	}

	/// Session id from the most recent welcome.
	pub fn session_id(&self) -> Option<String> {
		self.shared.session_tx.borrow().clone()
	}

	pub fn subscribe_session(&self) -> watch::Receiver<Option<String>> {
		self.shared.session_tx.subscribe()
	}

	pub fn epoch(&self) -> u64 {
		self.shared.epoch.load(Ordering::SeqCst)
	}

	/// Start the connection loop. No-op while connecting or open.
	pub fn start(&self) -> Result<(), ConnectionError> {
		if self.shared.stopping.load(Ordering::SeqCst) {
			return Err(ConnectionError::Stopping);
		}

		let mut running = self.shared.running.lock();
		if let Some(r) = running.as_ref()
			&& !r.task.is_finished()
		{
			debug!(state = %self.state(), "eventsub start ignored; already running");
			return Ok(());
		}

		let (control_tx, control_rx) = mpsc::unbounded_channel();
		self.shared.state_tx.send_replace(ConnectionState::Connecting);
		let shared = self.shared.clone();
		let task = tokio::spawn(async move { supervise(shared, control_rx).await });
		*running = Some(Running { control_tx, task });
		Ok(())
	}

	/// Stop without reconnecting and wait for the socket to close.
	pub async fn stop(&self) {
		self.shared.stopping.store(true, Ordering::SeqCst);
		let running = self.shared.running.lock().take();
		if let Some(running) = running {
			self.shared.state_tx.send_replace(ConnectionState::Closing);
			let _ = running.control_tx.send(Control::Stop);
			if let Err(e) = running.task.await {
				warn!(error = %e, "eventsub connection task failed");
			}
		}
		self.shared.state_tx.send_replace(ConnectionState::Idle);
		self.shared.session_tx.send_replace(None);
		self.shared.stopping.store(false, Ordering::SeqCst);
		info!("eventsub connection stopped");
	}

	/// Tear down the session and start a fresh one after the restart delay.
	pub fn restart(&self) {
		if let Some(r) = self.shared.running.lock().as_ref() {
			let _ = r.control_tx.send(Control::Restart);
		}
	}
}

async fn supervise(shared: Arc<Shared>, mut control_rx: mpsc::UnboundedReceiver<Control>) {
	let mut delay = Duration::ZERO;
	let mut ingest = Ingest {
		dedup: MessageDedup::new(shared.cfg.dedup_window),
		last_ts: 0,
	};

	loop {
		if shared.stopping.load(Ordering::SeqCst) {
			break;
		}

		if !delay.is_zero() {
			let wait = sleep(delay);
			tokio::pin!(wait);
			let stopped = loop {
				tokio::select! {
					_ = &mut wait => break false,
					ctrl = control_rx.recv() => match ctrl {
						None | Some(Control::Stop) => break true,
						Some(Control::Restart) => debug!("restart request coalesced"),
					},
				}
			};
			if stopped {
				break;
			}
		}

		let epoch = shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
		shared.state_tx.send_replace(ConnectionState::Connecting);

		let end = match run_session(&shared, epoch, &mut control_rx, &mut ingest).await {
			Ok(end) => end,
			Err(e) => SessionEnd::Closed(format!("{e:#}")),
		};
		shared.session_tx.send_replace(None);

		match end {
			SessionEnd::Stopped => break,
			SessionEnd::Restart => {
				metrics::counter!("streambot_reconnects_total", "connection" => "eventsub").increment(1);
				info!(epoch, "eventsub restarting");
				shared.state_tx.send_replace(ConnectionState::Closing);
				delay = shared.cfg.restart_delay;
			}
			SessionEnd::Closed(reason) => {
				metrics::counter!("streambot_reconnects_total", "connection" => "eventsub").increment(1);
				warn!(epoch, %reason, "eventsub socket closed; restarting");
				shared.state_tx.send_replace(ConnectionState::Errored);
				delay = shared.cfg.error_restart_delay;
			}
		}
	}

	shared.state_tx.send_replace(ConnectionState::Idle);
}

fn drain_restarts(control_rx: &mut mpsc::UnboundedReceiver<Control>) -> SessionEnd {
	while let Ok(ctrl) = control_rx.try_recv() {
		if matches!(ctrl, Control::Stop) {
			return SessionEnd::Stopped;
		}
	}
	SessionEnd::Restart
}

async fn connect(shared: &Shared, url: &str) -> anyhow::Result<TwitchWs> {
	let url = Url::parse(url).with_context(|| format!("invalid eventsub ws url: {url}"))?;
	let connector = shared.cfg.ws_connector.clone().unwrap_or_else(default_ws_connector);
	connector(url).await
}

/// Wait for `session_welcome`, answering pings. Returns `(session_id, keepalive_secs)`.
async fn read_until_welcome(ws: &mut TwitchWs) -> anyhow::Result<(String, Option<u64>)> {
	loop {
		let Some(msg) = ws.next().await else {
			anyhow::bail!("ws closed before welcome");
		};
		match msg.context("ws read")? {
			Message::Text(t) => {
				if peek(t.as_str())?.message_type == "session_welcome" {
					let session = parse_session(t.as_str())?;
					return Ok((session.id, session.keepalive_timeout_seconds));
				}
			}
			Message::Ping(p) => {
				let _ = ws.send(Message::Pong(p)).await;
			}
			Message::Close(c) => {
				anyhow::bail!("ws closed before welcome: close={c:?}");
			}
			_ => {}
		}
	}
}

/// Handle one frame from the live session. Returns a reconnect URL for `session_reconnect`.
async fn handle_text(shared: &Shared, epoch: u64, ingest: &mut Ingest, raw: &str) -> anyhow::Result<Option<String>> {
	let peeked = match peek(raw) {
		Ok(p) => p,
		Err(e) => {
			warn!(epoch, error = %e, "unparseable eventsub frame");
			return Ok(None);
		}
	};

	if let Some(id) = peeked.message_id.as_deref()
		&& !ingest.dedup.insert(id)
	{
		debug!(epoch, message_id = id, "duplicate eventsub frame dropped");
		return Ok(None);
	}

	match peeked.message_type.as_str() {
		"session_keepalive" => debug!(epoch, "eventsub keepalive"),
		"session_welcome" => debug!(epoch, "unexpected welcome on live session"),
		"session_reconnect" => {
			let session = parse_session(raw)?;
			return Ok(session.reconnect_url);
		}
		"notification" => match normalize_notification(raw) {
			Ok(Some(mut event)) => {
				ingest.last_ts = ingest.last_ts.max(event.meta.timestamp_ms);
				event.meta.timestamp_ms = ingest.last_ts;
				metrics::counter!("streambot_ingested_events_total", "connection" => "eventsub").increment(1);
				shared.events_tx.send(event).await.context("event receiver dropped")?;
			}
			Ok(None) => debug!(epoch, subscription_type = ?peeked.subscription_type, "unhandled notification"),
			Err(e) => warn!(epoch, error = %format!("{e:#}"), "failed to normalize notification"),
		},
		"revocation" => match parse_revocation(raw) {
			Ok(sub) => warn!(epoch, subscription_type = %sub.r#type, status = ?sub.status, "eventsub subscription revoked"),
			Err(e) => warn!(epoch, error = %e, "eventsub revocation"),
		},
		other => info!(epoch, message_type = other, "unknown eventsub message type"),
	}
	Ok(None)
}

async fn run_session(
	shared: &Shared,
	epoch: u64,
	control_rx: &mut mpsc::UnboundedReceiver<Control>,
	ingest: &mut Ingest,
) -> anyhow::Result<SessionEnd> {
	let cfg = &shared.cfg;

	let connecting = async {
		let mut ws = connect(shared, &cfg.ws_url).await?;
		let welcome = read_until_welcome(&mut ws).await?;
		Ok::<_, anyhow::Error>((ws, welcome))
	};
	tokio::pin!(connecting);

	let (mut ws, (mut session_id, keepalive)) = loop {
		tokio::select! {
			res = &mut connecting => break res?,
			ctrl = control_rx.recv() => match ctrl {
				None | Some(Control::Stop) => return Ok(SessionEnd::Stopped),
				Some(Control::Restart) => debug!(epoch, "restart ignored; already connecting"),
			},
		}
	};

	info!(epoch, %session_id, keepalive_secs = ?keepalive, "eventsub welcome");
	shared.session_tx.send_replace(Some(session_id.clone()));
	shared.state_tx.send_replace(ConnectionState::Open);

	if let Err(e) = shared.subscriber.subscribe_all(&session_id).await {
		warn!(epoch, error = %format!("{e:#}"), "eventsub subscription setup failed");
	}

	let mut last_activity = Instant::now();
	let mut health = interval_at(Instant::now() + cfg.health_check_interval, cfg.health_check_interval);
	let mut migrating: Option<MigrationState> = None;

	loop {
		let mig_should_connect = migrating
			.as_ref()
			.is_some_and(|m| m.reconnect_url.is_some() && m.ws2.is_none());
		let mig_is_connected = migrating.as_ref().is_some_and(|m| m.ws2.is_some());

		tokio::select! {
			ctrl = control_rx.recv() => match ctrl {
				None | Some(Control::Stop) => {
					let _ = ws.close(None).await;
					return Ok(SessionEnd::Stopped);
				}
				Some(Control::Restart) => {
					let _ = ws.close(None).await;
					return Ok(drain_restarts(control_rx));
				}
			},

			msg = ws.next() => {
				let Some(msg) = msg else {
					return Ok(SessionEnd::Closed("eventsub ws ended".to_string()));
				};
				match msg.context("eventsub ws read")? {
					Message::Text(t) => {
						last_activity = Instant::now();
						if let Some(url) = handle_text(shared, epoch, ingest, t.as_str()).await?
							&& migrating.is_none()
						{
							info!(epoch, "session_reconnect received; migrating");
							migrating = Some(MigrationState {
								reconnect_url: Some(url),
								ws2: None,
								buffered: VecDeque::new(),
							});
						}
					}
					Message::Ping(p) => {
						last_activity = Instant::now();
						let _ = ws.send(Message::Pong(p)).await;
					}
					Message::Pong(_) => {
						last_activity = Instant::now();
					}
					Message::Close(frame) => {
						if migrating.as_ref().is_some_and(|m| m.ws2.is_some()) {
							debug!(epoch, "old socket closed during migration");
							continue;
						}
						return Ok(SessionEnd::Closed(format!("eventsub ws closed: {frame:?}")));
					}
					_ => {}
				}
			}

			_ = sleep(Duration::from_millis(0)), if mig_should_connect => {
				let Some(url) = migrating.as_mut().and_then(|m| m.reconnect_url.take()) else {
					continue;
				};
				match connect(shared, &url).await {
					Ok(new_ws) => {
						debug!(epoch, "migration: connected to reconnect_url; waiting for welcome");
						if let Some(m) = &mut migrating {
							m.ws2 = Some(new_ws);
						}
					}
					Err(e) => {
						let _ = ws.close(None).await;
						return Ok(SessionEnd::Closed(format!("migration connect failed: {e:#}")));
					}
				}
			}

			msg2 = async {
				if let Some(m) = &mut migrating
					&& let Some(ws2) = &mut m.ws2
				{
					return ws2.next().await;
				}
				None
			}, if mig_is_connected => {
				let Some(Ok(msg2)) = msg2 else {
					warn!(epoch, "migration: secondary socket failed; continuing on primary");
					migrating = None;
					continue;
				};
				let Some(m) = &mut migrating else {
					continue;
				};
				match msg2 {
					Message::Text(t) => {
						let raw = t.as_str();
						let ty = peek(raw).map(|p| p.message_type).unwrap_or_default();
						if ty == "session_welcome" {
							let session = parse_session(raw)?;
							session_id = session.id;
							let _ = ws.close(None).await;
							if let Some(new_primary) = m.ws2.take() {
								ws = new_primary;
							}
							last_activity = Instant::now();
							let buffered = std::mem::take(&mut m.buffered);
							migrating = None;

							shared.session_tx.send_replace(Some(session_id.clone()));
							info!(epoch, %session_id, "migration complete; subscriptions carried over");

							for raw in buffered {
								handle_text(shared, epoch, ingest, &raw).await?;
							}
						} else if ty == "notification" {
							if m.buffered.len() >= MIGRATION_BUFFER_CAPACITY {
								m.buffered.pop_front();
							}
							m.buffered.push_back(raw.to_string());
						}
					}
					Message::Ping(p) => {
						if let Some(ws2) = &mut m.ws2 {
							let _ = ws2.send(Message::Pong(p)).await;
						}
					}
					Message::Close(frame) => {
						warn!(epoch, ?frame, "migration: secondary closed; continuing on primary");
						migrating = None;
					}
					_ => {}
				}
			}

			_ = health.tick() => {
				if migrating.is_none() && last_activity.elapsed() > cfg.inactivity_threshold {
					warn!(epoch, idle_secs = last_activity.elapsed().as_secs(), "eventsub inactive; restarting");
					let _ = ws.close(None).await;
					return Ok(SessionEnd::Restart);
				}
			}
		}
	}
}
