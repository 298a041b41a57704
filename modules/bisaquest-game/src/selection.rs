//! Round selection for drag-to-zone challenges.
//!
//! A round shows at most `round_size` items. Every zone present in the round
//! gets at least one item that belongs to it, so each round is solvable.

use std::collections::{BTreeMap, HashSet};

use rand::seq::{IndexedRandom, SliceRandom};
use rand::Rng;

use bisaquest_common::ChallengeItem;
pub use bisaquest_common::DEFAULT_ROUND_SIZE;

/// Pick a solvable round from `pool` and return it in random display order.
///
/// One uniformly chosen item per zone, padded with uniformly chosen leftovers
/// up to `round_size`. When there are more zones than slots, a random subset of
/// zones is represented. Items are deduplicated by `item_id` first, so the
/// result never repeats an item and has `min(round_size, unique items)` entries.
pub fn select_round_items<R: Rng + ?Sized>(
    pool: &[ChallengeItem],
    round_size: usize,
    rng: &mut R,
) -> Vec<ChallengeItem> {
    let mut seen = HashSet::new();
    let unique: Vec<&ChallengeItem> = pool.iter().filter(|i| seen.insert(i.item_id)).collect();

    if unique.len() <= round_size {
        let mut items: Vec<ChallengeItem> = unique.into_iter().cloned().collect();
        items.shuffle(rng);
        return items;
    }

    // BTreeMap keeps zone order stable so a seeded rng gives a stable round.
    let mut zones: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (idx, item) in unique.iter().enumerate() {
        zones.entry(item.correct_zone.as_str()).or_default().push(idx);
    }

    let mut groups: Vec<Vec<usize>> = zones.into_values().collect();
    if groups.len() > round_size {
        groups.shuffle(rng);
        groups.truncate(round_size);
    }

    let mut chosen: Vec<usize> = groups
        .iter()
        .filter_map(|group| group.choose(rng).copied())
        .collect();

    if chosen.len() < round_size {
        let mut filler: Vec<usize> = (0..unique.len()).filter(|idx| !chosen.contains(idx)).collect();
        filler.shuffle(rng);
        filler.truncate(round_size - chosen.len());
        chosen.extend(filler);
    }

    chosen.shuffle(rng);
    chosen.into_iter().map(|idx| unique[idx].clone()).collect()
}

/// The full pool in authored order: by round, then display order.
pub fn ordered_pool(mut items: Vec<ChallengeItem>) -> Vec<ChallengeItem> {
    items.sort_by_key(|item| (item.round_number, item.display_order));
    items
}
