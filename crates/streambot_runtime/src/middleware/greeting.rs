#![forbid(unsafe_code)]

use std::sync::LazyLock;

use regex::Regex;
use streambot_domain::{Action, BotEvent};

use crate::config::BotConfig;
use crate::config::bot::GreetingConfig;
use crate::pipeline::{Middleware, MiddlewareOutput};

static FIRST_WORD_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
	[
		r"(?iu)^((здравствуй|здравствуйте|здорово|здарова|даров|дарова)[\p{P}\s]*|^здр[\p{P}\s]*)",
		r"(?iu)^(прив(ет|етик|етикос|етищ|етос)?)[\p{P}\s]*$",
		r"(?iu)^хай(ка|ушки|чик)?[\p{P}\s]*",
		r"(?i)^hello\b",
		r"(?i)^hi\b",
		r"(?i)^hey\b",
	]
	.iter()
	.filter_map(|p| Regex::new(p).ok())
	.collect()
});

static PHRASE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
	[
		r"(?iu)^добрый\s+(день|вечер|утро)",
		r"(?iu)^доброго\s+(времени|дня|вечера|утра)",
	]
	.iter()
	.filter_map(|p| Regex::new(p).ok())
	.collect()
});

/// True if the message opens with a greeting.
pub fn is_greeting(text: &str) -> bool {
	let text = text.trim();
	let Some(first) = text.split_whitespace().next() else {
		return false;
	};
	FIRST_WORD_PATTERNS.iter().any(|re| re.is_match(first)) || PHRASE_PATTERNS.iter().any(|re| re.is_match(text))
}

/// Replies to chat greetings.
pub struct GreetingMiddleware {
	cfg: GreetingConfig,
}

impl GreetingMiddleware {
	pub fn new(cfg: GreetingConfig) -> Self {
		Self { cfg }
	}
}

#[async_trait::async_trait]
impl Middleware for GreetingMiddleware {
	fn name(&self) -> &'static str {
		"greeting"
	}

	async fn process(&mut self, event: &BotEvent) -> anyhow::Result<MiddlewareOutput> {
		if !self.cfg.enabled || event.is_bot_authored() {
			return Ok(MiddlewareOutput::pass());
		}
		let Some(chat) = event.chat() else {
			return Ok(MiddlewareOutput::pass());
		};
		if !is_greeting(&chat.text) {
			return Ok(MiddlewareOutput::pass());
		}
		Ok(MiddlewareOutput::accept(vec![Action::send(self.cfg.reply.clone())]))
	}

	fn update_config(&mut self, cfg: &BotConfig) {
		self.cfg = cfg.greeting.clone();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_support::{chat, redemption, sent};

	#[test]
	fn recognizes_greetings() {
		for text in [
			"привет",
			"Привет!",
			"приветик)",
			"здравствуйте все",
			"Здарова, бро",
			"здр",
			"хайушки",
			"hello there",
			"Hi",
			"hey!",
			"добрый вечер",
			"Доброго времени суток",
		] {
			assert!(is_greeting(text), "{text}");
		}
	}

	#[test]
	fn ignores_non_greetings() {
		for text in ["", "+", "приветствую закон", "history", "whey", "добрые люди", "!roulette"] {
			assert!(!is_greeting(text), "{text}");
		}
	}

	#[tokio::test]
	async fn greeting_is_answered_and_accepted() {
		let mut m = GreetingMiddleware::new(GreetingConfig::default());
		let out = m.process(&chat("1", "u", "User", "привет")).await.unwrap();
		assert!(out.accepted);
		assert_eq!(sent(&out.actions), vec![GreetingConfig::default().reply]);

		let out = m.process(&redemption("2", "u", "User", "r", Some("привет"))).await.unwrap();
		assert!(!out.accepted);
	}

	#[tokio::test]
	async fn disabled_and_bot_messages_pass() {
		let mut cfg = BotConfig::default();
		cfg.greeting.enabled = false;
		let mut m = GreetingMiddleware::new(GreetingConfig::default());
		m.update_config(&cfg);
		assert!(!m.process(&chat("1", "u", "User", "hi")).await.unwrap().accepted);

		let mut m = GreetingMiddleware::new(GreetingConfig::default());
		let out = m.process(&chat("bot_1", "b", "Bot", "hi")).await.unwrap();
		assert!(!out.accepted);
		assert!(out.actions.is_empty());
	}
}
