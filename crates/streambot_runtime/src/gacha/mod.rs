#![forbid(unsafe_code)]

pub mod store;

use rand::Rng;
use rand::seq::IndexedRandom;

use crate::config::bot::{BannerConfig, GachaItem, Rarity};

pub use store::{InMemoryPityStore, PityRecord, PityStore, SqlPityStore};

/// Probability of a capturing radiance on a lost 50/50.
pub const CAPTURING_RADIANCE_CHANCE: f64 = 0.05;

/// Consecutive off-banner 4★ results after which the next 4★ is featured.
const FOUR_STAR_RATE_UP_MISSES: u32 = 2;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum GachaError {
	#[error("featured item {0} not found")]
	NoFeaturedItem(String),
	#[error("no {rarity}★ items configured for banner {banner}")]
	NoItemsForRarity { banner: u32, rarity: u8 },
	#[error("unknown banner {0}")]
	UnknownBanner(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PullResult {
	pub item: GachaItem,
	/// Pulls since the previous 5★, counting this one.
	pub pull_number: u32,
	/// Forced by hard pity.
	pub was_guaranteed: bool,
	pub was_soft_pity: bool,
	pub was_50_50: bool,
	pub won_50_50: Option<bool>,
	pub was_capturing_radiance: bool,
}

/// Probability of a 5★ on the pull after `pulls_since_top` pulls.
pub fn five_star_rate(banner: &BannerConfig, pulls_since_top: u32) -> f64 {
	let base = banner.base_rate_five_star;
	let rate = if pulls_since_top < banner.soft_pity_start {
		base
	} else {
		let steps = f64::from(pulls_since_top - banner.soft_pity_start);
		let additional = 0.06 * steps + 0.06 * steps * steps * 0.1;
		(base + additional).min(1.0)
	};
	clamp_probability(rate)
}

fn clamp_probability(p: f64) -> f64 {
	if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) }
}

/// One pull on `banner`. Updates `pity` in place; the caller persists it.
pub fn pull<R: Rng>(
	banner: &BannerConfig,
	items: &[GachaItem],
	pity: &mut PityRecord,
	rng: &mut R,
) -> Result<PullResult, GachaError> {
	pity.pulls_since_top += 1;
	pity.pulls_since_second += 1;
	let pull_number = pity.pulls_since_top;

	let (rarity, was_guaranteed, was_soft_pity) = if pity.pulls_since_top >= banner.hard_pity_five_star {
		(Rarity::Five, true, false)
	} else if pity.pulls_since_second >= banner.hard_pity_four_star {
		(Rarity::Four, true, false)
	} else {
		let five = five_star_rate(banner, pity.pulls_since_top);
		let four = clamp_probability(banner.base_rate_four_star);
		let roll: f64 = rng.random();
		if roll < five {
			(Rarity::Five, false, pity.pulls_since_top >= banner.soft_pity_start)
		} else if roll < five + four {
			(Rarity::Four, false, false)
		} else {
			(Rarity::Three, false, false)
		}
	};

	let resolved = match rarity {
		Rarity::Five => {
			let top = resolve_five_star(banner, items, pity, rng)?;
			pity.pulls_since_top = 0;
			pity.pulls_since_second = 0;
			pity.second_rate_up_misses = 0;
			pity.guaranteed_top = top.was_50_50 && top.won == Some(false) && !top.radiance;
			top
		}
		Rarity::Four => {
			let (item, featured) = resolve_four_star(banner, items, pity, rng)?;
			pity.pulls_since_second = 0;
			pity.second_rate_up_misses = if featured { 0 } else { pity.second_rate_up_misses + 1 };
			Resolved::plain(item)
		}
		Rarity::Three => {
			let item = banner_items(banner, items, Rarity::Three)
				.choose(rng)
				.map(|item| (*item).clone())
				.ok_or(GachaError::NoItemsForRarity {
					banner: banner.id,
					rarity: 3,
				})?;
			Resolved::plain(item)
		}
	};

	let result = PullResult {
		item: resolved.item,
		pull_number,
		was_guaranteed,
		was_soft_pity,
		was_50_50: resolved.was_50_50,
		won_50_50: resolved.won,
		was_capturing_radiance: resolved.radiance,
	};
	metrics::counter!("streambot_gacha_pulls_total", "rarity" => result.item.rarity.as_str()).increment(1);
	Ok(result)
}

/// Resolved item plus the 50/50 bookkeeping, which only 5★ results carry.
struct Resolved {
	item: GachaItem,
	was_50_50: bool,
	won: Option<bool>,
	radiance: bool,
}

impl Resolved {
	fn plain(item: GachaItem) -> Self {
		Self {
			item,
			was_50_50: false,
			won: None,
			radiance: false,
		}
	}
}

fn banner_items<'a>(banner: &BannerConfig, items: &'a [GachaItem], rarity: Rarity) -> Vec<&'a GachaItem> {
	items
		.iter()
		.filter(|item| item.banner_id == banner.id && item.rarity == rarity)
		.collect()
}

fn standard_items<'a>(banner: &BannerConfig, items: &'a [GachaItem], rarity: Rarity, exclude: &[&str]) -> Vec<&'a GachaItem> {
	banner_items(banner, items, rarity)
		.into_iter()
		.filter(|item| !item.is_limited && !exclude.contains(&item.id.as_str()))
		.collect()
}

fn resolve_five_star<R: Rng>(
	banner: &BannerConfig,
	items: &[GachaItem],
	pity: &PityRecord,
	rng: &mut R,
) -> Result<Resolved, GachaError> {
	let Some(featured_id) = banner.featured_five_star_id.as_deref() else {
		let item = standard_items(banner, items, Rarity::Five, &[])
			.choose(rng)
			.map(|item| (*item).clone())
			.ok_or(GachaError::NoItemsForRarity {
				banner: banner.id,
				rarity: 5,
			})?;
		return Ok(Resolved::plain(item));
	};

	let featured = items
		.iter()
		.find(|item| item.id == featured_id)
		.cloned()
		.ok_or_else(|| GachaError::NoFeaturedItem(featured_id.to_string()))?;

	if pity.guaranteed_top {
		return Ok(Resolved::plain(featured));
	}

	if rng.random::<f64>() < 0.5 {
		return Ok(Resolved {
			item: featured,
			was_50_50: true,
			won: Some(true),
			radiance: false,
		});
	}

	if banner.has_capturing_radiance && rng.random::<f64>() < CAPTURING_RADIANCE_CHANCE {
		return Ok(Resolved {
			item: featured,
			was_50_50: true,
			won: Some(true),
			radiance: true,
		});
	}

	let item = standard_items(banner, items, Rarity::Five, &[featured_id])
		.choose(rng)
		.map(|item| (*item).clone())
		.unwrap_or(featured);
	Ok(Resolved {
		item,
		was_50_50: true,
		won: Some(false),
		radiance: false,
	})
}

fn resolve_four_star<R: Rng>(
	banner: &BannerConfig,
	items: &[GachaItem],
	pity: &PityRecord,
	rng: &mut R,
) -> Result<(GachaItem, bool), GachaError> {
	let featured: Vec<&GachaItem> = banner
		.featured_four_star_ids
		.iter()
		.filter_map(|id| items.iter().find(|item| &item.id == id && item.rarity == Rarity::Four))
		.collect();
	let featured_ids: Vec<&str> = featured.iter().map(|item| item.id.as_str()).collect();

	let pick_featured = !featured.is_empty()
		&& (pity.second_rate_up_misses >= FOUR_STAR_RATE_UP_MISSES
			|| rng.random::<f64>() < clamp_probability(banner.featured_rate_four_star));
	if pick_featured && let Some(item) = featured.choose(rng) {
		return Ok(((*item).clone(), true));
	}

	if let Some(item) = standard_items(banner, items, Rarity::Four, &featured_ids).choose(rng) {
		return Ok(((*item).clone(), false));
	}

	featured
		.choose(rng)
		.map(|item| ((*item).clone(), true))
		.ok_or(GachaError::NoItemsForRarity {
			banner: banner.id,
			rarity: 4,
		})
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;
	use rand::SeedableRng;
	use rand::rngs::StdRng;

	use super::*;

	fn item(id: &str, rarity: Rarity, limited: bool) -> GachaItem {
		GachaItem {
			id: id.to_string(),
			name: id.to_uppercase(),
			rarity,
			is_limited: limited,
			banner_id: 0,
		}
	}

	fn catalog() -> Vec<GachaItem> {
		vec![
			item("limited", Rarity::Five, true),
			item("std5a", Rarity::Five, false),
			item("std5b", Rarity::Five, false),
			item("feat4", Rarity::Four, true),
			item("std4", Rarity::Four, false),
			item("sword", Rarity::Three, false),
		]
	}

	fn banner() -> BannerConfig {
		BannerConfig {
			featured_five_star_id: Some("limited".to_string()),
			featured_four_star_ids: vec!["feat4".to_string()],
			..BannerConfig::default()
		}
	}

	/// Rng that replays a fixed sequence of raw values.
	struct Script(Vec<u64>, usize);

	impl rand::RngCore for Script {
		fn next_u32(&mut self) -> u32 {
			self.next_u64() as u32
		}
		fn next_u64(&mut self) -> u64 {
			let v = self.0[self.1 % self.0.len()];
			self.1 += 1;
			v
		}
		fn fill_bytes(&mut self, dst: &mut [u8]) {
			for chunk in dst.chunks_mut(8) {
				let bytes = self.next_u64().to_le_bytes();
				chunk.copy_from_slice(&bytes[..chunk.len()]);
			}
		}
	}

	#[test]
	fn soft_pity_rate_follows_the_quadratic_curve() {
		let b = banner();
		assert_eq!(five_star_rate(&b, 10), 0.006);
		assert_eq!(five_star_rate(&b, 74), 0.006);
		let expected = 0.006 + 0.06 * 5.0 + 0.06 * 25.0 * 0.1;
		assert!((five_star_rate(&b, 79) - expected).abs() < 1e-12);
		assert_eq!(five_star_rate(&b, 89), 1.0);
	}

	#[test]
	fn hard_pity_forces_a_five_star() {
		let b = banner();
		let items = catalog();
		let mut pity = PityRecord {
			pulls_since_top: 89,
			..PityRecord::default()
		};
		// high raw values map to rolls near 1.0, which would otherwise produce a 3★
		let mut rng = Script(vec![u64::MAX], 0);
		let res = pull(&b, &items, &mut pity, &mut rng).unwrap();
		assert_eq!(res.item.rarity, Rarity::Five);
		assert!(res.was_guaranteed);
		assert_eq!(res.pull_number, 90);
		assert_eq!(pity, PityRecord { guaranteed_top: true, ..PityRecord::default() });
	}

	#[test]
	fn lost_fifty_fifty_guarantees_the_next_five_star() {
		let b = banner();
		let items = catalog();
		let mut pity = PityRecord {
			pulls_since_top: 89,
			..PityRecord::default()
		};
		let mut rng = Script(vec![u64::MAX], 0);
		let first = pull(&b, &items, &mut pity, &mut rng).unwrap();
		assert_eq!(first.won_50_50, Some(false));
		assert_ne!(first.item.id, "limited");
		assert!(pity.guaranteed_top);

		pity.pulls_since_top = 89;
		let second = pull(&b, &items, &mut pity, &mut rng).unwrap();
		assert_eq!(second.item.id, "limited");
		assert!(!second.was_50_50);
		assert!(!pity.guaranteed_top);
	}

	#[test]
	fn won_fifty_fifty_awards_featured() {
		let b = banner();
		let items = catalog();
		let mut pity = PityRecord {
			pulls_since_top: 89,
			..PityRecord::default()
		};
		let mut rng = Script(vec![0], 0);
		let res = pull(&b, &items, &mut pity, &mut rng).unwrap();
		assert_eq!(res.item.id, "limited");
		assert_eq!(res.won_50_50, Some(true));
		assert!(!pity.guaranteed_top);
	}

	#[test]
	fn banner_without_featured_skips_the_fifty_fifty() {
		let b = BannerConfig::default();
		let items = catalog();
		let mut pity = PityRecord {
			pulls_since_top: 89,
			..PityRecord::default()
		};
		let res = pull(&b, &items, &mut pity, &mut StdRng::seed_from_u64(7)).unwrap();
		assert!(res.item.id.starts_with("std5"));
		assert!(!res.was_50_50);
		assert_eq!(res.won_50_50, None);
	}

	#[test]
	fn missing_featured_item_is_an_error() {
		let mut b = banner();
		b.featured_five_star_id = Some("ghost".to_string());
		let mut pity = PityRecord {
			pulls_since_top: 89,
			..PityRecord::default()
		};
		let err = pull(&b, &catalog(), &mut pity, &mut StdRng::seed_from_u64(1)).unwrap_err();
		assert_eq!(err, GachaError::NoFeaturedItem("ghost".to_string()));
	}

	#[test]
	fn four_star_misses_force_featured() {
		let b = banner();
		let items = catalog();
		let mut pity = PityRecord {
			pulls_since_second: 9,
			second_rate_up_misses: 2,
			..PityRecord::default()
		};
		let mut rng = Script(vec![u64::MAX], 0);
		let res = pull(&b, &items, &mut pity, &mut rng).unwrap();
		assert_eq!(res.item.id, "feat4");
		assert_eq!(pity.second_rate_up_misses, 0);
		assert_eq!(pity.pulls_since_second, 0);
		assert_eq!(pity.pulls_since_top, 1);
	}

	#[test]
	fn off_banner_four_star_counts_a_miss() {
		let b = banner();
		let items = catalog();
		let mut pity = PityRecord {
			pulls_since_second: 9,
			..PityRecord::default()
		};
		let mut rng = Script(vec![u64::MAX], 0);
		let res = pull(&b, &items, &mut pity, &mut rng).unwrap();
		assert_eq!(res.item.id, "std4");
		assert_eq!(pity.second_rate_up_misses, 1);
	}

	#[test]
	fn empty_three_star_pool_is_an_error() {
		let b = banner();
		let items: Vec<GachaItem> = catalog().into_iter().filter(|i| i.rarity != Rarity::Three).collect();
		let mut rng = Script(vec![u64::MAX], 0);
		let err = pull(&b, &items, &mut PityRecord::default(), &mut rng).unwrap_err();
		assert_eq!(err, GachaError::NoItemsForRarity { banner: 0, rarity: 3 });
	}

	proptest! {
		#[test]
		fn never_more_than_hard_pity_pulls_without_a_five_star(seed in any::<u64>(), pulls in 1usize..400) {
			let b = banner();
			let items = catalog();
			let mut rng = StdRng::seed_from_u64(seed);
			let mut pity = PityRecord::default();
			let mut since_top = 0u32;
			for _ in 0..pulls {
				let res = pull(&b, &items, &mut pity, &mut rng).unwrap();
				since_top += 1;
				prop_assert!(since_top <= b.hard_pity_five_star);
				prop_assert!(pity.pulls_since_second < b.hard_pity_four_star);
				if res.item.rarity == Rarity::Five {
					since_top = 0;
				}
			}
		}

		#[test]
		fn terminates_when_base_rate_exceeds_one(seed in any::<u64>()) {
			let mut b = banner();
			b.base_rate_five_star = 3.0;
			let mut pity = PityRecord::default();
			let res = pull(&b, &catalog(), &mut pity, &mut StdRng::seed_from_u64(seed)).unwrap();
			prop_assert_eq!(res.item.rarity, Rarity::Five);
		}
	}
}
