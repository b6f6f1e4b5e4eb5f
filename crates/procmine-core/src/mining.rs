// Sequential pattern mining
//
// PrefixSpan-style depth-first expansion over case label sequences.
// Contiguous by default; with contiguous = false up to two intermediate
// labels may be skipped per expansion step. Output ordering is fully
// deterministic: support descending, length ascending, labels lexicographic.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use uuid::Uuid;

/// A case reduced to its step activity labels
#[derive(Debug, Clone)]
pub struct CaseSequence {
    pub case_id: Uuid,
    pub labels: Vec<String>,
    /// Step duration at each label position
    pub durations: Vec<f64>,
}

/// Mining parameters
#[derive(Debug, Clone, Copy)]
pub struct MiningConfig {
    /// Minimum fraction of cases a pattern must appear in
    pub min_support: f64,
    pub min_length: usize,
    pub max_length: usize,
    /// When false, up to 2 intermediate labels may be skipped per step
    pub contiguous: bool,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            min_support: 0.1,
            min_length: 2,
            max_length: 10,
            contiguous: true,
        }
    }
}

impl MiningConfig {
    /// Labels skippable between consecutive pattern positions
    fn max_skip(&self) -> usize {
        if self.contiguous {
            0
        } else {
            2
        }
    }
}

/// A frequent ordered pattern
#[derive(Debug, Clone, Serialize)]
pub struct MinedPattern {
    pub labels: Vec<String>,
    /// Indices into the input case list, ascending and distinct
    pub case_indices: Vec<usize>,
    /// Fraction of cases containing the pattern
    pub support: f64,
    /// Mean duration of the earliest embedding per supporting case
    pub avg_duration: f64,
}

/// Mine frequent patterns from case sequences.
///
/// Deterministic: identical inputs produce an identical ordered list.
pub fn mine_patterns(cases: &[CaseSequence], config: &MiningConfig) -> Vec<MinedPattern> {
    if cases.is_empty() {
        return Vec::new();
    }
    let min_cases = min_case_count(config.min_support, cases.len());
    let max_skip = config.max_skip();

    // Seed projections: every occurrence of every label
    let mut seeds: BTreeMap<&str, Vec<(usize, Vec<usize>)>> = BTreeMap::new();
    for (case_idx, case) in cases.iter().enumerate() {
        let mut positions: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (pos, label) in case.labels.iter().enumerate() {
            positions.entry(label.as_str()).or_default().push(pos);
        }
        for (label, pos) in positions {
            seeds.entry(label).or_default().push((case_idx, pos));
        }
    }

    let mut found = Vec::new();
    for (label, projections) in seeds {
        if projections.len() < min_cases {
            continue;
        }
        expand(
            cases,
            config,
            min_cases,
            max_skip,
            &mut vec![label.to_string()],
            &projections,
            &mut found,
        );
    }

    for pattern in &mut found {
        pattern.avg_duration = average_embedding_duration(cases, &pattern.labels, &pattern.case_indices, max_skip);
    }

    found.sort_by(|a, b| {
        b.support
            .partial_cmp(&a.support)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.labels.len().cmp(&b.labels.len()))
            .then_with(|| a.labels.cmp(&b.labels))
    });
    found
}

/// Minimum number of distinct cases implied by a support fraction
pub fn min_case_count(min_support: f64, total: usize) -> usize {
    ((min_support * total as f64).ceil() as usize).max(1)
}

fn expand(
    cases: &[CaseSequence],
    config: &MiningConfig,
    min_cases: usize,
    max_skip: usize,
    prefix: &mut Vec<String>,
    projections: &[(usize, Vec<usize>)],
    found: &mut Vec<MinedPattern>,
) {
    if prefix.len() >= config.min_length {
        found.push(MinedPattern {
            labels: prefix.clone(),
            case_indices: projections.iter().map(|(i, _)| *i).collect(),
            support: projections.len() as f64 / cases.len() as f64,
            avg_duration: 0.0,
        });
    }
    if prefix.len() >= config.max_length {
        return;
    }

    // Candidate next labels within the allowed window of any end position
    let mut extensions: BTreeMap<String, Vec<(usize, Vec<usize>)>> = BTreeMap::new();
    for (case_idx, ends) in projections {
        let labels = &cases[*case_idx].labels;
        let mut next: BTreeMap<&str, BTreeSet<usize>> = BTreeMap::new();
        for &end in ends {
            let from = end + 1;
            let to = (end + 1 + max_skip).min(labels.len().saturating_sub(1));
            for pos in from..=to {
                next.entry(labels[pos].as_str()).or_default().insert(pos);
            }
        }
        for (label, positions) in next {
            extensions
                .entry(label.to_string())
                .or_default()
                .push((*case_idx, positions.into_iter().collect()));
        }
    }

    for (label, next_projections) in extensions {
        if next_projections.len() < min_cases {
            continue;
        }
        prefix.push(label);
        expand(cases, config, min_cases, max_skip, prefix, &next_projections, found);
        prefix.pop();
    }
}

/// Earliest embedding of a pattern in one label sequence, if any
pub fn earliest_embedding(labels: &[String], pattern: &[String], max_skip: usize) -> Option<Vec<usize>> {
    if pattern.is_empty() {
        return None;
    }
    for start in 0..labels.len() {
        if labels[start] == pattern[0] {
            if let Some(full) = complete_embedding(labels, pattern, vec![start], max_skip) {
                return Some(full);
            }
        }
    }
    None
}

fn complete_embedding(
    labels: &[String],
    pattern: &[String],
    chain: Vec<usize>,
    max_skip: usize,
) -> Option<Vec<usize>> {
    if chain.len() == pattern.len() {
        return Some(chain);
    }
    let end = *chain.last().expect("chain is non-empty");
    let want = &pattern[chain.len()];
    let from = end + 1;
    let to = (end + 1 + max_skip).min(labels.len().saturating_sub(1));
    for pos in from..=to {
        if &labels[pos] == want {
            let mut extended = chain.clone();
            extended.push(pos);
            if let Some(full) = complete_embedding(labels, pattern, extended, max_skip) {
                return Some(full);
            }
        }
    }
    None
}

fn average_embedding_duration(
    cases: &[CaseSequence],
    pattern: &[String],
    case_indices: &[usize],
    max_skip: usize,
) -> f64 {
    if case_indices.is_empty() {
        return 0.0;
    }
    let mut total = 0.0;
    let mut counted = 0usize;
    for &idx in case_indices {
        let case = &cases[idx];
        if let Some(positions) = earliest_embedding(&case.labels, pattern, max_skip) {
            total += positions.iter().map(|&p| case.durations[p]).sum::<f64>();
            counted += 1;
        }
    }
    if counted == 0 {
        0.0
    } else {
        total / counted as f64
    }
}

/// Keep patterns observed in at least `min_cases` distinct cases that are
/// not strict subsequences of an equal-coverage longer pattern.
pub fn identify_variants(patterns: &[MinedPattern], min_cases: usize) -> Vec<MinedPattern> {
    let mut variants: Vec<MinedPattern> = Vec::new();
    for (i, p) in patterns.iter().enumerate() {
        if p.case_indices.len() < min_cases {
            continue;
        }
        let absorbed = patterns.iter().enumerate().any(|(j, q)| {
            i != j
                && q.labels.len() > p.labels.len()
                && is_subsequence(&p.labels, &q.labels)
                && p.case_indices == q.case_indices
        });
        if !absorbed {
            variants.push(p.clone());
        }
    }
    variants
}

/// Plain (gap-unbounded) subsequence test
pub fn is_subsequence(needle: &[String], haystack: &[String]) -> bool {
    let mut it = haystack.iter();
    needle.iter().all(|n| it.any(|h| h == n))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(labels: &[&str]) -> CaseSequence {
        CaseSequence {
            case_id: Uuid::now_v7(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            durations: vec![10.0; labels.len()],
        }
    }

    fn scenario_cases() -> Vec<CaseSequence> {
        // 8 x [A,B,C], 3 x [A,B], 1 x [X,Y]
        let mut cases = Vec::new();
        for _ in 0..8 {
            cases.push(seq(&["A", "B", "C"]));
        }
        for _ in 0..3 {
            cases.push(seq(&["A", "B"]));
        }
        cases.push(seq(&["X", "Y"]));
        cases
    }

    #[test]
    fn test_mining_scenario_order_and_support() {
        let cases = scenario_cases();
        let config = MiningConfig {
            min_support: 0.5,
            ..Default::default()
        };
        let patterns = mine_patterns(&cases, &config);
        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[0].labels, vec!["A", "B"]);
        assert!((patterns[0].support - 11.0 / 12.0).abs() < 1e-9);
        assert_eq!(patterns[1].labels, vec!["A", "B", "C"]);
        assert!((patterns[1].support - 8.0 / 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_mining_is_deterministic() {
        let cases = scenario_cases();
        let config = MiningConfig {
            min_support: 0.1,
            ..Default::default()
        };
        let a = mine_patterns(&cases, &config);
        let b = mine_patterns(&cases, &config);
        let render = |ps: &[MinedPattern]| {
            ps.iter()
                .map(|p| (p.labels.clone(), p.case_indices.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(render(&a), render(&b));
    }

    #[test]
    fn test_support_counts_distinct_cases() {
        // Repeats inside one case count once
        let cases = vec![seq(&["A", "B", "A", "B"]), seq(&["A", "B"])];
        let config = MiningConfig {
            min_support: 1.0,
            ..Default::default()
        };
        let patterns = mine_patterns(&cases, &config);
        let ab = patterns.iter().find(|p| p.labels == ["A", "B"]).unwrap();
        assert_eq!(ab.case_indices, vec![0, 1]);
        assert!((ab.support - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_contiguous_requires_adjacency() {
        let cases = vec![seq(&["A", "X", "B"]), seq(&["A", "B"])];
        let contiguous = MiningConfig {
            min_support: 1.0,
            ..Default::default()
        };
        assert!(mine_patterns(&cases, &contiguous).is_empty());

        let gapped = MiningConfig {
            min_support: 1.0,
            contiguous: false,
            ..Default::default()
        };
        let patterns = mine_patterns(&cases, &gapped);
        assert!(patterns.iter().any(|p| p.labels == ["A", "B"]));
    }

    #[test]
    fn test_max_length_bounds_expansion() {
        let cases = vec![seq(&["A", "B", "C", "D"]), seq(&["A", "B", "C", "D"])];
        let config = MiningConfig {
            min_support: 1.0,
            max_length: 3,
            ..Default::default()
        };
        let patterns = mine_patterns(&cases, &config);
        assert!(patterns.iter().all(|p| p.labels.len() <= 3));
    }

    #[test]
    fn test_avg_duration_sums_matched_steps() {
        let cases = vec![seq(&["A", "B"])];
        let config = MiningConfig {
            min_support: 1.0,
            ..Default::default()
        };
        let patterns = mine_patterns(&cases, &config);
        assert!((patterns[0].avg_duration - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_variant_absorbed_by_equal_coverage_superpattern() {
        let cases: Vec<CaseSequence> = (0..4).map(|_| seq(&["A", "B", "C"])).collect();
        let config = MiningConfig {
            min_support: 1.0,
            ..Default::default()
        };
        let patterns = mine_patterns(&cases, &config);
        let variants = identify_variants(&patterns, 3);
        // [A,B], [B,C] and [A,B,C] all cover all four cases; only the
        // longest survives
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].labels, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_variant_kept_when_coverage_differs() {
        let cases = scenario_cases();
        let config = MiningConfig {
            min_support: 0.5,
            ..Default::default()
        };
        let patterns = mine_patterns(&cases, &config);
        let variants = identify_variants(&patterns, 3);
        assert_eq!(variants.len(), 2);
    }

    #[test]
    fn test_earliest_embedding_with_gap() {
        let labels: Vec<String> = ["A", "B", "Z", "C"].iter().map(|s| s.to_string()).collect();
        let pattern: Vec<String> = ["A", "B", "C"].iter().map(|s| s.to_string()).collect();
        assert_eq!(earliest_embedding(&labels, &pattern, 1), Some(vec![0, 1, 3]));
        assert_eq!(earliest_embedding(&labels, &pattern, 0), None);
    }

    #[test]
    fn test_embedding_backtracks_over_repeated_labels() {
        let labels: Vec<String> = ["A", "B", "B", "X", "C"].iter().map(|s| s.to_string()).collect();
        let pattern: Vec<String> = ["A", "B", "C"].iter().map(|s| s.to_string()).collect();
        assert_eq!(earliest_embedding(&labels, &pattern, 1), Some(vec![0, 2, 4]));
    }
}
