#![forbid(unsafe_code)]

use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use streambot_domain::{Action, BotEvent};
use tracing::{debug, warn};

use super::{display_name, fill_dollar};
use crate::config::BotConfig;
use crate::config::bot::{BannerConfig, BannerMessages, GachaConfig, Rarity};
use crate::gacha::{self, GachaError, PityStore, PullResult};
use crate::pipeline::{Middleware, MiddlewareOutput};

/// Names listed per 4★ group before it collapses into a count.
const FOUR_STAR_LIST_LIMIT: usize = 3;

/// Channel-point redemptions that trigger pulls on a banner.
pub struct GachaMiddleware {
	cfg: GachaConfig,
	store: Arc<dyn PityStore>,
	rng: StdRng,
}

impl GachaMiddleware {
	pub fn new(cfg: GachaConfig, store: Arc<dyn PityStore>) -> Self {
		Self {
			cfg,
			store,
			rng: StdRng::from_os_rng(),
		}
	}

	pub fn with_rng(mut self, rng: StdRng) -> Self {
		self.rng = rng;
		self
	}

	fn banner(&self, banner_id: u32) -> Result<BannerConfig, GachaError> {
		if self.cfg.banners.is_empty() && banner_id == 0 {
			return Ok(BannerConfig::default());
		}
		self.cfg
			.banners
			.iter()
			.find(|b| b.id == banner_id)
			.cloned()
			.ok_or(GachaError::UnknownBanner(banner_id))
	}

	async fn pull_many(&mut self, user_id: &str, user_name: &str, banner: &BannerConfig, amount: u32) -> anyhow::Result<Vec<PullResult>> {
		let mut pity = self
			.store
			.get(user_id, banner.id)
			.await?
			.map(|row| row.pity)
			.unwrap_or_default();

		let mut results = Vec::with_capacity(amount as usize);
		for _ in 0..amount.max(1) {
			results.push(gacha::pull(banner, &self.cfg.items, &mut pity, &mut self.rng)?);
		}
		self.store.save(user_id, user_name, banner.id, pity).await?;
		Ok(results)
	}
}

fn stars(rarity: Rarity) -> String {
	"⭐".repeat(rarity.stars())
}

fn fifty_fifty_suffix(result: &PullResult, messages: &BannerMessages) -> String {
	if result.item.rarity != Rarity::Five || !result.was_50_50 {
		return String::new();
	}
	if result.was_capturing_radiance {
		messages.capturing_radiance.clone()
	} else if result.won_50_50 == Some(true) {
		messages.won_50_50.clone()
	} else {
		messages.lost_50_50.clone()
	}
}

fn single_pull_message(user: &str, result: &PullResult, messages: &BannerMessages) -> String {
	let pull_number = result.pull_number.to_string();
	let star_text = stars(result.item.rarity);
	let vars = [
		("user", user),
		("item", result.item.name.as_str()),
		("stars", star_text.as_str()),
		("rarity", result.item.rarity.as_str()),
		("pull_number", pull_number.as_str()),
	];
	let mut text = fill_dollar(&messages.single_pull, &vars);
	text.push_str(&fifty_fifty_suffix(result, messages));
	if result.was_soft_pity {
		text.push_str(&fill_dollar(&messages.soft_pity, &vars));
	}
	text
}

fn five_star_mark(result: &PullResult) -> &'static str {
	match (result.was_capturing_radiance, result.won_50_50) {
		(true, _) => "💫",
		(false, Some(true)) => "✅",
		(false, Some(false)) => "❌",
		(false, None) => "",
	}
}

/// `⭐⭐⭐⭐⭐ a✅ | ⭐⭐⭐⭐ x5 (b, c, d...) | ⭐⭐⭐ x4`
pub fn multi_pull_summary(results: &[PullResult]) -> String {
	let mut parts = Vec::new();

	let fives: Vec<String> = results
		.iter()
		.filter(|r| r.item.rarity == Rarity::Five)
		.map(|r| format!("{}{}", r.item.name, five_star_mark(r)))
		.collect();
	if !fives.is_empty() {
		parts.push(format!("{} {}", stars(Rarity::Five), fives.join(", ")));
	}

	let fours: Vec<&str> = results
		.iter()
		.filter(|r| r.item.rarity == Rarity::Four)
		.map(|r| r.item.name.as_str())
		.collect();
	if fours.len() > FOUR_STAR_LIST_LIMIT {
		parts.push(format!(
			"{} x{} ({}...)",
			stars(Rarity::Four),
			fours.len(),
			fours[..FOUR_STAR_LIST_LIMIT].join(", ")
		));
	} else if !fours.is_empty() {
		parts.push(format!("{} {}", stars(Rarity::Four), fours.join(", ")));
	}

	let threes = results.iter().filter(|r| r.item.rarity == Rarity::Three).count();
	if threes > 0 {
		parts.push(format!("{} x{threes}", stars(Rarity::Three)));
	}

	parts.join(" | ")
}

#[async_trait::async_trait]
impl Middleware for GachaMiddleware {
	fn name(&self) -> &'static str {
		"gacha"
	}

	async fn process(&mut self, event: &BotEvent) -> anyhow::Result<MiddlewareOutput> {
		if !self.cfg.enabled {
			return Ok(MiddlewareOutput::pass());
		}
		let Some(redemption) = event.redemption() else {
			return Ok(MiddlewareOutput::pass());
		};
		let Some(trigger) = self.cfg.triggers.iter().find(|t| t.reward_id == redemption.reward_id).cloned() else {
			return Ok(MiddlewareOutput::pass());
		};
		let Some(user_id) = event.meta.user_id.clone() else {
			return Ok(MiddlewareOutput::pass());
		};
		let user = display_name(event);

		let banner = match self.banner(trigger.banner_id) {
			Ok(banner) => banner,
			Err(e) => {
				warn!(banner_id = trigger.banner_id, error = %e, "gacha trigger references an unknown banner");
				let error = e.to_string();
				let text = fill_dollar(
					&BannerMessages::default().error,
					&[("user", user.as_str()), ("error", error.as_str())],
				);
				return Ok(MiddlewareOutput::accept(vec![Action::send(text)]));
			}
		};

		let text = match self.pull_many(&user_id, &user, &banner, trigger.amount).await {
			Ok(results) if results.len() == 1 => single_pull_message(&user, &results[0], &banner.messages),
			Ok(results) => {
				let count = results.len().to_string();
				let mut text = fill_dollar(
					&banner.messages.multi_pull_intro,
					&[("user", user.as_str()), ("count", count.as_str())],
				);
				text.push_str(&multi_pull_summary(&results));
				text
			}
			Err(e) => {
				warn!(user_id = %user_id, banner_id = banner.id, error = %e, "gacha pull failed");
				let error = format!("{e:#}");
				fill_dollar(&banner.messages.error, &[("user", user.as_str()), ("error", error.as_str())])
			}
		};
		debug!(user_id = %user_id, banner_id = banner.id, amount = trigger.amount, "gacha redemption handled");
		Ok(MiddlewareOutput::accept(vec![Action::send(text)]))
	}

	fn update_config(&mut self, cfg: &BotConfig) {
		self.cfg = cfg.gacha.clone();
	}
}
