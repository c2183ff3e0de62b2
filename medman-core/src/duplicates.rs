//! Perceptual-hash duplicate clustering.
//!
//! Items sharing a hash form exact groups. Every remaining item is compared
//! against every other one (quadratic in the number of unique hashes) and
//! pairs within the distance threshold are merged transitively.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Threshold used when callers do not supply one.
pub const DEFAULT_MAX_HAMMING_DISTANCE: u32 = 10;

/// Upper bound, in percent of hash bits, for the `high` tier.
pub const HIGH_SIMILARITY_PERCENT: f64 = 10.0;

/// Upper bound, in percent of hash bits, for the `medium` tier. Groups
/// further apart than this are dropped from reports altogether.
pub const MEDIUM_SIMILARITY_PERCENT: f64 = 25.0;

/// An item and its perceptual hash (hex).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashedItem {
    pub id: String,
    #[serde(alias = "visual_hash")]
    pub hash: String,
}

impl HashedItem {
    pub fn new(id: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hash: hash.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityTier {
    Exact,
    High,
    Medium,
}

impl SimilarityTier {
    /// Tier for `distance` differing bits out of `total_bits`, or `None` when
    /// the pair is too far apart to report.
    pub fn classify(distance: u32, total_bits: u32) -> Option<Self> {
        if distance == 0 {
            return Some(SimilarityTier::Exact);
        }
        if total_bits == 0 {
            return None;
        }
        let percent = f64::from(distance) / f64::from(total_bits) * 100.0;
        if percent <= HIGH_SIMILARITY_PERCENT {
            Some(SimilarityTier::High)
        } else if percent <= MEDIUM_SIMILARITY_PERCENT {
            Some(SimilarityTier::Medium)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    /// The shared hash for exact groups, `similar_<seed hash>` otherwise.
    pub hash: String,
    pub items: Vec<String>,
    pub similarity_tier: SimilarityTier,
    /// Largest distance between the seed and any member.
    pub hamming_distance: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateStats {
    pub group_count: usize,
    pub total_duplicate_items: usize,
    pub exact_groups: usize,
    pub high_groups: usize,
    pub medium_groups: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DuplicateReport {
    pub groups: Vec<DuplicateGroup>,
    pub stats: DuplicateStats,
}

impl DuplicateReport {
    fn push(&mut self, group: DuplicateGroup) {
        self.stats.group_count += 1;
        self.stats.total_duplicate_items += group.items.len();
        match group.similarity_tier {
            SimilarityTier::Exact => self.stats.exact_groups += 1,
            SimilarityTier::High => self.stats.high_groups += 1,
            SimilarityTier::Medium => self.stats.medium_groups += 1,
        }
        self.groups.push(group);
    }
}

/// A candidate close to a target hash.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimilarMatch {
    pub id: String,
    pub hamming_distance: u32,
    /// `1 - distance / total_bits`.
    pub similarity_score: f64,
}

/// Number of differing bits between two hex hashes.
///
/// Returns `-1` when the hashes have different lengths or either contains a
/// non-hex character; such pairs are incomparable and never match.
pub fn hamming_distance(a: &str, b: &str) -> i32 {
    if a.len() != b.len() {
        return -1;
    }
    let mut distance = 0;
    for (x, y) in a.chars().zip(b.chars()) {
        match (x.to_digit(16), y.to_digit(16)) {
            (Some(x), Some(y)) => distance += (x ^ y).count_ones() as i32,
            _ => return -1,
        }
    }
    distance
}

fn within(a: &str, b: &str, max_distance: u32) -> Option<u32> {
    u32::try_from(hamming_distance(a, b))
        .ok()
        .filter(|distance| *distance <= max_distance)
}

fn total_bits(hash: &str) -> u32 {
    (hash.len() as u32).saturating_mul(4)
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            self.parent[node] = self.parent[self.parent[node]];
            node = self.parent[node];
        }
        node
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Keep the earliest index as root so it stays the seed.
            let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[child] = root;
        }
    }
}

/// Group `items` into exact and similarity clusters.
///
/// Every item lands in at most one group. Items without a hash are ignored.
pub fn cluster(items: &[HashedItem], max_distance: u32) -> DuplicateReport {
    let mut report = DuplicateReport::default();

    // Exact partition, in first-seen order.
    let mut order: Vec<String> = Vec::new();
    let mut by_hash: HashMap<String, Vec<&HashedItem>> = HashMap::new();
    for item in items {
        let key = item.hash.trim().to_ascii_lowercase();
        if key.is_empty() {
            continue;
        }
        let members = by_hash.entry(key.clone()).or_default();
        if members.is_empty() {
            order.push(key);
        }
        members.push(item);
    }

    let mut singles: Vec<(&str, &HashedItem)> = Vec::new();
    for key in &order {
        let members = &by_hash[key];
        if members.len() > 1 {
            report.push(DuplicateGroup {
                hash: key.clone(),
                items: members.iter().map(|item| item.id.clone()).collect(),
                similarity_tier: SimilarityTier::Exact,
                hamming_distance: 0,
            });
        } else {
            singles.push((key.as_str(), members[0]));
        }
    }

    let mut sets = DisjointSet::new(singles.len());
    for i in 0..singles.len() {
        for j in (i + 1)..singles.len() {
            if within(singles[i].0, singles[j].0, max_distance).is_some() {
                sets.union(i, j);
            }
        }
    }

    let mut components: Vec<Vec<usize>> = Vec::new();
    let mut slot_for_root: HashMap<usize, usize> = HashMap::new();
    for index in 0..singles.len() {
        let root = sets.find(index);
        let slot = *slot_for_root.entry(root).or_insert_with(|| {
            components.push(Vec::new());
            components.len() - 1
        });
        components[slot].push(index);
    }

    for members in components.into_iter().filter(|m| m.len() > 1) {
        let seed = singles[members[0]].0;
        let distance = members
            .iter()
            .skip(1)
            .filter_map(|index| {
                u32::try_from(hamming_distance(seed, singles[*index].0)).ok()
            })
            .max()
            .unwrap_or(0);
        let Some(tier) = SimilarityTier::classify(distance, total_bits(seed))
        else {
            continue;
        };
        report.push(DuplicateGroup {
            hash: format!("similar_{seed}"),
            items: members
                .iter()
                .map(|index| singles[*index].1.id.clone())
                .collect(),
            similarity_tier: tier,
            hamming_distance: distance,
        });
    }

    // Exact groups first, then larger groups, then closer matches.
    report.groups.sort_by_key(|group| {
        (
            group.similarity_tier != SimilarityTier::Exact,
            std::cmp::Reverse(group.items.len()),
            group.hamming_distance,
        )
    });
    report
}

/// Every candidate within `max_distance` of `target`, closest first. The
/// target itself is skipped by id.
pub fn find_similar(
    target: &HashedItem,
    candidates: &[HashedItem],
    max_distance: u32,
) -> Vec<SimilarMatch> {
    let bits = total_bits(&target.hash);
    let mut matches: Vec<SimilarMatch> = candidates
        .iter()
        .filter(|candidate| candidate.id != target.id)
        .filter_map(|candidate| {
            within(&target.hash, &candidate.hash, max_distance).map(|distance| {
                let similarity_score = if bits == 0 {
                    1.0
                } else {
                    1.0 - f64::from(distance) / f64::from(bits)
                };
                SimilarMatch {
                    id: candidate.id.clone(),
                    hamming_distance: distance,
                    similarity_score,
                }
            })
        })
        .collect();
    matches.sort_by(|a, b| {
        a.hamming_distance
            .cmp(&b.hamming_distance)
            .then_with(|| a.id.cmp(&b.id))
    });
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(hashes: &[&str]) -> Vec<HashedItem> {
        hashes
            .iter()
            .enumerate()
            .map(|(i, hash)| HashedItem::new(format!("m{i}"), *hash))
            .collect()
    }

    #[test]
    fn hamming_distance_properties() {
        assert_eq!(hamming_distance("00", "ff"), 8);
        assert_eq!(hamming_distance("a1b2", "a1b2"), 0);
        assert_eq!(
            hamming_distance("1234", "abcd"),
            hamming_distance("abcd", "1234")
        );
        assert_eq!(hamming_distance("abc", "abcd"), -1);
        assert_eq!(hamming_distance("zz", "00"), -1);
        assert_eq!(hamming_distance("AB", "ab"), 0);
    }

    #[test]
    fn exact_and_high_groups_are_disjoint() {
        let report = cluster(&items(&["aaaa", "aaaa", "1234", "1235"]), 1);

        assert_eq!(report.groups.len(), 2);
        let exact = &report.groups[0];
        assert_eq!(exact.similarity_tier, SimilarityTier::Exact);
        assert_eq!(exact.items, vec!["m0", "m1"]);
        assert_eq!(exact.hamming_distance, 0);

        let similar = &report.groups[1];
        assert_eq!(similar.similarity_tier, SimilarityTier::High);
        assert_eq!(similar.hash, "similar_1234");
        assert_eq!(similar.items, vec!["m2", "m3"]);
        assert_eq!(similar.hamming_distance, 1);

        assert_eq!(
            report.stats,
            DuplicateStats {
                group_count: 2,
                total_duplicate_items: 4,
                exact_groups: 1,
                high_groups: 1,
                medium_groups: 0,
            }
        );
    }

    #[test]
    fn exact_members_never_join_similarity_groups() {
        // "1235" is one bit from "1234" but already sits in an exact group.
        let report = cluster(&items(&["1234", "1235", "1235"]), 4);
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.groups[0].items, vec!["m1", "m2"]);
    }

    #[test]
    fn similarity_merges_transitively() {
        // 0000 -> 0001 -> 0003 chain; 0000 and 0003 are two bits apart.
        let report = cluster(&items(&["0000", "0001", "0003", "ffff"]), 1);
        assert_eq!(report.groups.len(), 1);
        let group = &report.groups[0];
        assert_eq!(group.items, vec!["m0", "m1", "m2"]);
        assert_eq!(group.hamming_distance, 2);
        assert_eq!(group.similarity_tier, SimilarityTier::Medium);
    }

    #[test]
    fn groups_are_ordered_exact_then_size_then_distance() {
        let report = cluster(
            &items(&[
                "ff00", "ff01", "ff03", // m0..m2, distance 2
                "00f0", "00f1", // m3..m4, pair
                "0f00", "0f01", "0f02", // m5..m7, distance 1
                "aaaa", "aaaa", // m8..m9, exact
            ]),
            1,
        );

        let order: Vec<(&str, usize, u32)> = report
            .groups
            .iter()
            .map(|group| (group.items[0].as_str(), group.items.len(), group.hamming_distance))
            .collect();
        assert_eq!(
            order,
            vec![("m8", 2, 0), ("m5", 3, 1), ("m0", 3, 2), ("m3", 2, 1)]
        );
    }

    #[test]
    fn groups_beyond_medium_cutoff_are_dropped() {
        // 5 of 16 bits differ: 31%.
        let report = cluster(&items(&["0000", "001f"]), 8);
        assert!(report.groups.is_empty());
        assert_eq!(report.stats, DuplicateStats::default());
    }

    #[test]
    fn mismatched_lengths_never_match() {
        let report = cluster(&items(&["abcd", "abcde", "abc"]), 64);
        assert!(report.groups.is_empty());
    }

    #[test]
    fn tier_boundaries() {
        assert_eq!(SimilarityTier::classify(0, 64), Some(SimilarityTier::Exact));
        assert_eq!(SimilarityTier::classify(6, 64), Some(SimilarityTier::High));
        assert_eq!(SimilarityTier::classify(7, 64), Some(SimilarityTier::Medium));
        assert_eq!(SimilarityTier::classify(16, 64), Some(SimilarityTier::Medium));
        assert_eq!(SimilarityTier::classify(17, 64), None);
    }

    #[test]
    fn find_similar_scores_and_sorts() {
        let target = HashedItem::new("t", "00");
        let candidates = vec![
            HashedItem::new("t", "00"),
            HashedItem::new("far", "ff"),
            HashedItem::new("two", "03"),
            HashedItem::new("one", "01"),
            HashedItem::new("short", "0"),
        ];
        let matches = find_similar(&target, &candidates, 2);
        let ids: Vec<_> = matches.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["one", "two"]);
        assert_eq!(matches[0].similarity_score, 1.0 - 1.0 / 8.0);
    }
}
