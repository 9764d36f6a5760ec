#![forbid(unsafe_code)]

use std::collections::HashMap;

use streambot_domain::{BotEvent, ChannelId, ChatMessage, ChatRoles, EmotePosition, EventMeta, EventPayload};

pub const DEFAULT_COLOR: &str = "#FFFFFF";

/// Tag value: `key=value` or a bare `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagValue {
	Text(String),
	Flag,
}

/// One raw protocol line split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcLine {
	pub tags: HashMap<String, TagValue>,
	pub prefix: Option<String>,
	pub command: String,
	pub params: Vec<String>,
}

impl IrcLine {
	/// Non-empty text value of a tag.
	pub fn tag(&self, key: &str) -> Option<&str> {
		match self.tags.get(key) {
			Some(TagValue::Text(v)) if !v.is_empty() => Some(v.as_str()),
			_ => None,
		}
	}

	/// Nick part of `nick!user@host`, or the whole prefix.
	pub fn prefix_nick(&self) -> Option<&str> {
		let prefix = self.prefix.as_deref()?;
		let nick = prefix.split_once('!').map_or(prefix, |(nick, _)| nick);
		(!nick.is_empty()).then_some(nick)
	}

	pub fn trailing(&self) -> Option<&str> {
		self.params.last().map(String::as_str)
	}
}

fn unescape_tag_value(raw: &str) -> String {
	let mut out = String::with_capacity(raw.len());
	let mut chars = raw.chars();
	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		match chars.next() {
			Some('s') => out.push(' '),
			Some(':') => out.push(';'),
			Some('\\') => out.push('\\'),
			Some('r') => out.push('\r'),
			Some('n') => out.push('\n'),
			Some(other) => out.push(other),
			None => {}
		}
	}
	out
}

/// A server `NOTICE` rejecting the login. Chat text never matches.
pub fn is_auth_failure(line: &IrcLine) -> bool {
	if line.command != "NOTICE" {
		return false;
	}
	let text = line.trailing().unwrap_or_default().to_ascii_lowercase();
	text.contains("authentication failed") || text.contains("improperly formatted auth")
}

/// Split a raw line into tags, prefix, command and params. `None` for blank lines.
pub fn parse_line(raw: &str) -> Option<IrcLine> {
	let mut line = raw.trim();
	let mut tags = HashMap::new();

	if let Some(rest) = line.strip_prefix('@') {
		let (tag_part, rest) = rest.split_once(' ').unwrap_or((rest, ""));
		for tag in tag_part.split(';').filter(|t| !t.is_empty()) {
			match tag.split_once('=') {
				Some((k, v)) => tags.insert(k.to_string(), TagValue::Text(unescape_tag_value(v))),
				None => tags.insert(tag.to_string(), TagValue::Flag),
			};
		}
		line = rest.trim_start();
	}

	let mut prefix = None;
	if let Some(rest) = line.strip_prefix(':') {
		let (p, rest) = rest.split_once(' ').unwrap_or((rest, ""));
		prefix = Some(p.to_string());
		line = rest.trim_start();
	}

	if line.is_empty() {
		return None;
	}

	let (command, mut rest) = line.split_once(' ').unwrap_or((line, ""));
	let mut params = Vec::new();
	rest = rest.trim_start();
	while !rest.is_empty() {
		if let Some(trailing) = rest.strip_prefix(':') {
			params.push(trailing.to_string());
			break;
		}
		match rest.split_once(' ') {
			Some((param, tail)) => {
				params.push(param.to_string());
				rest = tail.trim_start();
			}
			None => {
				params.push(rest.to_string());
				break;
			}
		}
	}

	Some(IrcLine {
		tags,
		prefix,
		command: command.to_string(),
		params,
	})
}

/// Map a comma separated `badges` tag to role flags. Unknown badges are ignored.
pub fn roles_from_badges(badges: &str) -> ChatRoles {
	let mut roles = ChatRoles::default();
	for badge in badges.split(',') {
		let id = badge.split_once('/').map_or(badge, |(id, _)| id);
		match id {
			"moderator" => roles.moderator = true,
			"vip" => roles.vip = true,
			"broadcaster" => roles.broadcaster = true,
			"staff" => roles.staff = true,
			"admin" => roles.admin = true,
			"global_mod" => roles.global_mod = true,
			_ => {}
		}
	}
	roles
}

fn is_stripped(c: char) -> bool {
	matches!(c, '\u{200B}'..='\u{200D}' | '\u{FEFF}' | '\u{00A0}') || c.is_ascii_control()
}

/// Strip zero-width and control code points, then trim.
///
/// Returns the cleaned text and, for every input char, its index in the output (if kept).
pub fn sanitize_text(text: &str) -> (String, Vec<Option<usize>>) {
	let mut kept: Vec<char> = Vec::with_capacity(text.len());
	let mut index_map: Vec<Option<usize>> = Vec::with_capacity(text.len());
	for c in text.chars() {
		if is_stripped(c) {
			index_map.push(None);
		} else {
			index_map.push(Some(kept.len()));
			kept.push(c);
		}
	}

	let lead = kept.iter().take_while(|c| c.is_whitespace()).count();
	let trail = kept.iter().rev().take_while(|c| c.is_whitespace()).count();
	let end = kept.len().saturating_sub(trail).max(lead);
	let cleaned: String = kept[lead..end].iter().collect();

	for slot in index_map.iter_mut() {
		*slot = slot.and_then(|i| (i >= lead && i < end).then(|| i - lead));
	}
	(cleaned, index_map)
}

/// Parse `id:0-4,6-10/id2:12-15` against the original text, remapped through `index_map`.
pub fn parse_emotes(tag: &str, index_map: &[Option<usize>]) -> Vec<EmotePosition> {
	let mut out = Vec::new();
	for entry in tag.split('/').filter(|e| !e.is_empty()) {
		let Some((id, ranges)) = entry.split_once(':') else {
			continue;
		};
		for range in ranges.split(',') {
			let Some((s, e)) = range.split_once('-') else {
				continue;
			};
			let (Ok(s), Ok(e)) = (s.parse::<usize>(), e.parse::<usize>()) else {
				continue;
			};
			if s > e {
				continue;
			}
			let mapped_start = index_map.get(s).copied().flatten();
			let mapped_end = index_map.get(e).copied().flatten();
			if let (Some(start), Some(end)) = (mapped_start, mapped_end) {
				out.push(EmotePosition {
					id: id.to_string(),
					start,
					end,
				});
			}
		}
	}
	out.sort_by_key(|e| e.start);
	out.dedup_by_key(|e| e.start);
	out
}

fn channel_tag(line: &IrcLine, key: &str) -> Option<ChannelId> {
	line.tag(key).and_then(|v| ChannelId::new(v).ok())
}

/// Convert a parsed line into a domain event.
///
/// `PRIVMSG` is chat, `JOIN`/`PART` membership, `CLEARMSG` a deletion; everything else is a system event.
pub fn line_to_event(line: &IrcLine, timestamp_ms: i64) -> BotEvent {
	let nick = line.prefix_nick().map(str::to_string);
	let user_name = line
		.tag("display-name")
		.or_else(|| line.tag("login"))
		.map(str::to_string)
		.or_else(|| nick.clone())
		.unwrap_or_else(|| "unknown".to_string());

	let id = match line.command.as_str() {
		"PRIVMSG" => line.tag("id").map(str::to_string),
		_ => None,
	}
	.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

	let meta = EventMeta {
		id,
		timestamp_ms,
		user_id: line.tag("user-id").map(str::to_string),
		user_name: Some(user_name),
		channel_id: channel_tag(line, "room-id"),
	};

	let payload = match line.command.as_str() {
		"PRIVMSG" => {
			let raw_text = if line.params.len() >= 2 {
				line.params[1].as_str()
			} else {
				line.trailing().unwrap_or_default()
			};
			let (text, index_map) = sanitize_text(raw_text);
			EventPayload::Chat(ChatMessage {
				text,
				color: line.tag("color").unwrap_or(DEFAULT_COLOR).to_string(),
				roles: roles_from_badges(line.tag("badges").unwrap_or_default()),
				emotes: line.tag("emotes").map(|t| parse_emotes(t, &index_map)).unwrap_or_default(),
				source_channel_id: channel_tag(line, "source-room-id"),
				user_login: nick,
			})
		}
		"JOIN" => EventPayload::Join,
		"PART" => EventPayload::Part,
		"CLEARMSG" => match line.tag("target-msg-id") {
			Some(target) => EventPayload::MessageDeleted {
				target_id: target.to_string(),
			},
			None => EventPayload::System {
				text: line.trailing().unwrap_or_default().to_string(),
			},
		},
		_ => EventPayload::System {
			text: line.trailing().unwrap_or_default().to_string(),
		},
	};

	BotEvent::new(meta, payload)
}

/// Parse a raw line straight to an event. `None` for blank lines.
pub fn parse_event(raw: &str, timestamp_ms: i64) -> Option<BotEvent> {
	parse_line(raw).map(|line| line_to_event(&line, timestamp_ms))
}
