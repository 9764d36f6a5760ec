#![forbid(unsafe_code)]

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

use super::parser;
use crate::twitch::auth::TokenProvider;
use crate::twitch::{TwitchWs, WsConnector, default_ws_connector};
use crate::{ConnectionError, ConnectionState, unix_ms_now};

pub const DEFAULT_IRC_WS_URL: &str = "wss://irc-ws.chat.twitch.tv:443";
const MAX_MESSAGE_BYTES: usize = 500;

#[derive(Clone)]
pub struct ChatConfig {
	pub ws_url: String,
	pub login: String,
	pub channel: String,
	pub health_check_interval: Duration,
	pub inactivity_threshold: Duration,
	/// Delay before a requested reconnect.
	pub reconnect_delay: Duration,
	/// Delay after the socket failed or closed on its own.
	pub error_reconnect_delay: Duration,
	pub ws_connector: Option<WsConnector>,
}

impl ChatConfig {
	pub fn new(login: impl Into<String>, channel: impl Into<String>) -> Self {
		Self {
			ws_url: DEFAULT_IRC_WS_URL.to_string(),
			login: login.into(),
			channel: channel.into(),
			health_check_interval: Duration::from_secs(60),
			inactivity_threshold: Duration::from_secs(300),
			reconnect_delay: Duration::from_millis(300),
			error_reconnect_delay: Duration::from_secs(5),
			ws_connector: None,
		}
	}
}

enum Control {
	Send(String),
	Reconnect { refresh_token: bool },
	Stop,
}

enum SessionEnd {
	Stopped,
	Reconnect { refresh_token: bool },
	Closed(String),
}

struct Running {
	control_tx: mpsc::UnboundedSender<Control>,
	task: JoinHandle<()>,
}

struct Shared {
	cfg: ChatConfig,
	tokens: Arc<dyn TokenProvider>,
	events_tx: mpsc::Sender<BotEvent>,
	state_tx: watch::Sender<ConnectionState>,
	stopping: AtomicBool,
	epoch: AtomicU64,
	running: parking_lot::Mutex<Option<Running>>,
}

/// Chat (IRC over WebSocket) connection manager.
#[derive(Clone)]
pub struct ChatConnection {
	shared: Arc<Shared>,
}

/// Build a `PRIVMSG` line: newlines collapse to one space, text capped at 500 bytes.
pub fn format_privmsg(channel: &str, text: &str) -> Option<String> {
	let mut flat = String::with_capacity(text.len());
	let mut in_break = false;
	for c in text.chars() {
		if c == '\r' || c == '\n' {
			if !in_break {
				flat.push(' ');
			}
			in_break = true;
		} else {
			flat.push(c);
			in_break = false;
		}
	}

	let mut end = flat.len().min(MAX_MESSAGE_BYTES);
	while !flat.is_char_boundary(end) {
		end -= 1;
	}
	flat.truncate(end);

	if flat.trim().is_empty() {
		return None;
	}
	Some(format!("PRIVMSG #{} :{}", channel.trim_start_matches('#').to_lowercase(), flat))
}

impl ChatConnection {
	pub fn new(cfg: ChatConfig, tokens: Arc<dyn TokenProvider>, events_tx: mpsc::Sender<BotEvent>) -> Self {
		let (state_tx, _) = watch::channel(ConnectionState::Idle);
		Self {
			shared: Arc::new(Shared {
				cfg,
				tokens,
				events_tx,
				state_tx,
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

	/// Socket generation; bumps on every connect attempt.
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
			debug!(state = %self.state(), "chat start ignored; already running");
			return Ok(());
		}

		let (control_tx, control_rx) = mpsc::unbounded_channel();
		self.shared.state_tx.send_replace(ConnectionState::Connecting);
		let shared = self.shared.clone();
		let task = tokio::spawn(async move { supervise(shared, control_rx).await });
		*running = Some(Running { control_tx, task });
		Ok(())
	}

	/// Stop and wait for the socket to close. The loop never reconnects after this.
	pub async fn stop(&self) {
		self.shared.stopping.store(true, Ordering::SeqCst);
		let running = self.shared.running.lock().take();
		if let Some(running) = running {
			self.shared.state_tx.send_replace(ConnectionState::Closing);
			let _ = running.control_tx.send(Control::Stop);
			if let Err(e) = running.task.await {
				warn!(error = %e, "chat connection task failed");
			}
		}
		self.shared.state_tx.send_replace(ConnectionState::Idle);
		self.shared.stopping.store(false, Ordering::SeqCst);
		info!("chat connection stopped");
	}

	/// Request a reconnect. Requests arriving while one is pending coalesce.
	pub fn reconnect(&self) {
		self.control(Control::Reconnect { refresh_token: false });
	}

	/// Send a chat message to the joined channel.
	pub fn send_message(&self, text: &str) -> anyhow::Result<()> {
		if self.state() != ConnectionState::Open {
			anyhow::bail!("chat connection not open (state={})", self.state());
		}
		let Some(line) = format_privmsg(&self.shared.cfg.channel, text) else {
			debug!("dropping empty chat message");
			return Ok(());
		};
		let running = self.shared.running.lock();
		let tx = running.as_ref().map(|r| r.control_tx.clone()).context("chat connection not running")?;
		tx.send(Control::Send(line))
			.map_err(|_| anyhow::anyhow!("chat connection loop ended"))
	}

	fn control(&self, msg: Control) {
		if let Some(r) = self.shared.running.lock().as_ref() {
			let _ = r.control_tx.send(msg);
		}
	}
}

async fn supervise(shared: Arc<Shared>, mut control_rx: mpsc::UnboundedReceiver<Control>) {
	let mut delay = Duration::ZERO;
	let mut refresh_token = false;

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
						Some(Control::Reconnect { refresh_token: r }) => refresh_token |= r,
						Some(Control::Send(_)) => debug!("dropping outbound chat line while reconnecting"),
					},
				}
			};
			if stopped {
				break;
			}
		}

		if refresh_token {
			refresh_token = false;
			if let Err(e) = shared.tokens.force_refresh().await {
				warn!(error = %e, "chat token refresh failed; reconnecting with current token");
			}
		}

		let epoch = shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
		shared.state_tx.send_replace(ConnectionState::Connecting);

		let end = match run_session(&shared, epoch, &mut control_rx).await {
			Ok(end) => end,
			Err(e) => SessionEnd::Closed(format!("{e:#}")),
		};

		match end {
			SessionEnd::Stopped => break,
			SessionEnd::Reconnect { refresh_token: r } => {
				metrics::counter!("streambot_reconnects_total", "connection" => "chat").increment(1);
				info!(epoch, refresh_token = r, "chat reconnecting");
				shared.state_tx.send_replace(ConnectionState::Closing);
				refresh_token = r;
				delay = shared.cfg.reconnect_delay;
			}
			SessionEnd::Closed(reason) => {
				metrics::counter!("streambot_reconnects_total", "connection" => "chat").increment(1);
				warn!(epoch, %reason, "chat socket closed; reconnecting");
				shared.state_tx.send_replace(ConnectionState::Errored);
				delay = shared.cfg.error_reconnect_delay;
			}
		}
	}

	shared.state_tx.send_replace(ConnectionState::Idle);
}

/// Discard queued reconnect requests so they collapse into the one in flight.
/// Outbound lines queued behind them are dropped with the old socket.
fn drain_reconnects(control_rx: &mut mpsc::UnboundedReceiver<Control>, mut refresh_token: bool) -> SessionEnd {
	let mut dropped_sends = 0usize;
	while let Ok(ctrl) = control_rx.try_recv() {
		match ctrl {
			Control::Stop => return SessionEnd::Stopped,
			Control::Send(_) => dropped_sends += 1,
			Control::Reconnect { refresh_token: r } => refresh_token |= r,
		}
	}
	if dropped_sends > 0 {
		debug!(dropped_sends, "dropping outbound chat lines queued behind a reconnect");
	}
	SessionEnd::Reconnect { refresh_token }
}

async fn connect(shared: &Shared) -> anyhow::Result<TwitchWs> {
	let url = Url::parse(&shared.cfg.ws_url).with_context(|| format!("invalid chat ws url: {}", shared.cfg.ws_url))?;
	let connector = shared.cfg.ws_connector.clone().unwrap_or_else(default_ws_connector);
	connector(url).await
}

async fn run_session(
	shared: &Shared,
	epoch: u64,
	control_rx: &mut mpsc::UnboundedReceiver<Control>,
) -> anyhow::Result<SessionEnd> {
	let connecting = async {
		let token = shared.tokens.access_token().await.context("chat access token")?;
		let ws = connect(shared).await?;
		Ok::<_, anyhow::Error>((token, ws))
	};
	tokio::pin!(connecting);

	let (token, mut ws) = loop {
		tokio::select! {
			res = &mut connecting => break res?,
			ctrl = control_rx.recv() => match ctrl {
				None | Some(Control::Stop) => return Ok(SessionEnd::Stopped),
				Some(Control::Reconnect { .. }) => debug!(epoch, "reconnect request ignored; already connecting"),
				Some(Control::Send(_)) => debug!(epoch, "dropping outbound chat line while connecting"),
			},
		}
	};

	let cfg = &shared.cfg;
	let channel = cfg.channel.trim_start_matches('#').to_lowercase();
	for line in [
		"CAP REQ :twitch.tv/tags twitch.tv/commands twitch.tv/membership".to_string(),
		format!("PASS oauth:{}", token.expose()),
		format!("NICK {}", cfg.login.to_lowercase()),
		format!("JOIN #{channel}"),
	] {
		ws.send(Message::Text(line.into())).await.context("chat handshake send")?;
	}

	shared.state_tx.send_replace(ConnectionState::Open);
	info!(epoch, %channel, "chat connected");

	let mut last_activity = Instant::now();
	let mut last_ts = 0i64;
	let mut health = interval_at(Instant::now() + cfg.health_check_interval, cfg.health_check_interval);

	loop {
		tokio::select! {
			ctrl = control_rx.recv() => match ctrl {
				None | Some(Control::Stop) => {
					let _ = ws.close(None).await;
					return Ok(SessionEnd::Stopped);
				}
				Some(Control::Send(line)) => {
					ws.send(Message::Text(line.into())).await.context("chat send")?;
				}
				Some(Control::Reconnect { refresh_token }) => {
					let _ = ws.close(None).await;
					return Ok(drain_reconnects(control_rx, refresh_token));
				}
			},

			msg = ws.next() => {
				let Some(msg) = msg else {
					return Ok(SessionEnd::Closed("chat ws ended".to_string()));
				};
				match msg.context("chat ws read")? {
					Message::Text(t) => {
						last_activity = Instant::now();
						for raw in t.as_str().split("\r\n") {
							if raw.trim().is_empty() {
								continue;
							}

							if let Some(rest) = raw.strip_prefix("PING") {
								let arg = rest.trim();
								let arg = if arg.is_empty() { ":tmi.twitch.tv" } else { arg };
								ws.send(Message::Text(format!("PONG {arg}").into())).await.context("chat pong")?;
								continue;
							}

							let Some(line) = parser::parse_line(raw) else {
								continue;
							};

							if parser::is_auth_failure(&line) {
								warn!(epoch, line = raw, "chat authentication failed");
								let _ = ws.close(None).await;
								return Ok(drain_reconnects(control_rx, true));
							}

							last_ts = last_ts.max(unix_ms_now());
							let event = parser::line_to_event(&line, last_ts);
							metrics::counter!("streambot_ingested_events_total", "connection" => "chat").increment(1);
							if shared.events_tx.send(event).await.is_err() {
								let _ = ws.close(None).await;
								return Ok(SessionEnd::Stopped);
							}

							if line.command == "RECONNECT" {
								info!(epoch, "server requested chat reconnect");
								let _ = ws.close(None).await;
								return Ok(SessionEnd::Reconnect { refresh_token: false });
							}
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
						return Ok(SessionEnd::Closed(format!("chat ws closed: {frame:?}")));
					}
					_ => {}
				}
			}

			_ = health.tick() => {
				if last_activity.elapsed() > cfg.inactivity_threshold {
					warn!(epoch, idle_secs = last_activity.elapsed().as_secs(), "chat inactive; reconnecting");
					let _ = ws.close(None).await;
					return Ok(SessionEnd::Reconnect { refresh_token: false });
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn queued_reconnects_collapse_and_keep_the_refresh_flag() {
		let (tx, mut rx) = mpsc::unbounded_channel();
		for ctrl in [
			Control::Send("PRIVMSG #c :a".to_string()),
			Control::Reconnect { refresh_token: true },
			Control::Reconnect { refresh_token: false },
		] {
			assert!(tx.send(ctrl).is_ok());
		}
		assert!(matches!(
			drain_reconnects(&mut rx, false),
			SessionEnd::Reconnect { refresh_token: true }
		));
		assert!(rx.try_recv().is_err());

		for ctrl in [Control::Reconnect { refresh_token: false }, Control::Stop] {
			assert!(tx.send(ctrl).is_ok());
		}
		assert!(matches!(drain_reconnects(&mut rx, false), SessionEnd::Stopped));
	}
}
