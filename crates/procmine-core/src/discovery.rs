// Workflow discovery
//
// Clusters variants by normalised Levenshtein similarity over their label
// sequences (single-link agglomerative) and derives each cluster's
// canonical pattern by folding pairwise LCS over its members.

use crate::mining::MinedPattern;

/// Default similarity threshold for clustering
pub const DEFAULT_SIMILARITY: f64 = 0.8;

/// A candidate workflow produced from one variant cluster
#[derive(Debug, Clone)]
pub struct DiscoveredWorkflow {
    /// Generated name, `process-<cluster-index>`
    pub name: String,
    /// Canonical label sequence
    pub pattern: Vec<String>,
    /// Indices into the variant list, highest support first
    pub variant_indices: Vec<usize>,
    /// Sum of member supports, used for cluster ordering
    pub total_support: f64,
}

/// Levenshtein distance over label sequences, normalised to a 0..1
/// similarity (1 = identical)
pub fn normalized_levenshtein(a: &[String], b: &[String]) -> f64 {
    let max = a.len().max(b.len());
    if max == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max as f64
}

fn levenshtein(a: &[String], b: &[String]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, la) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, lb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(la != lb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

/// Longest common subsequence of two label sequences
pub fn lcs(a: &[String], b: &[String]) -> Vec<String> {
    let mut table = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            table[i][j] = if a[i] == b[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }
    let mut out = Vec::with_capacity(table[0][0]);
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] == b[j] {
            out.push(a[i].clone());
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    out
}

/// Single-link agglomerative clustering: variants whose similarity meets
/// the threshold share a cluster, transitively.
pub fn cluster_variants(variants: &[MinedPattern], threshold: f64) -> Vec<Vec<usize>> {
    let mut parent: Vec<usize> = (0..variants.len()).collect();

    fn find(parent: &mut Vec<usize>, x: usize) -> usize {
        if parent[x] != x {
            let root = find(parent, parent[x]);
            parent[x] = root;
        }
        parent[x]
    }

    for i in 0..variants.len() {
        for j in (i + 1)..variants.len() {
            if normalized_levenshtein(&variants[i].labels, &variants[j].labels) >= threshold {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj.max(ri)] = rj.min(ri);
                }
            }
        }
    }

    let mut clusters: std::collections::BTreeMap<usize, Vec<usize>> = std::collections::BTreeMap::new();
    for i in 0..variants.len() {
        let root = find(&mut parent, i);
        clusters.entry(root).or_default().push(i);
    }
    clusters.into_values().collect()
}

/// Canonical pattern of a cluster: fold pairwise LCS over members ordered
/// by support descending (tie: lexicographic); fall back to the
/// highest-support member when the fold collapses below two labels.
pub fn canonical_pattern(variants: &[MinedPattern], member_indices: &[usize]) -> Vec<String> {
    let mut ordered: Vec<usize> = member_indices.to_vec();
    ordered.sort_by(|&a, &b| {
        variants[b]
            .support
            .partial_cmp(&variants[a].support)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| variants[a].labels.cmp(&variants[b].labels))
    });

    let head = &variants[ordered[0]].labels;
    let mut canonical = head.clone();
    for &idx in &ordered[1..] {
        canonical = lcs(&canonical, &variants[idx].labels);
        if canonical.len() < 2 {
            return head.clone();
        }
    }
    canonical
}

/// Cluster variants and emit named candidate workflows.
///
/// Clusters are ordered by total support descending, tie-broken
/// lexicographically on the canonical pattern, then on the sorted member
/// label sequences; indices feed the generated `process-<i>` names.
pub fn discover_workflows(variants: &[MinedPattern], threshold: f64) -> Vec<DiscoveredWorkflow> {
    let mut out: Vec<DiscoveredWorkflow> = cluster_variants(variants, threshold)
        .into_iter()
        .map(|mut members| {
            members.sort_by(|&a, &b| {
                variants[b]
                    .support
                    .partial_cmp(&variants[a].support)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| variants[a].labels.cmp(&variants[b].labels))
            });
            let pattern = canonical_pattern(variants, &members);
            let total_support = members.iter().map(|&i| variants[i].support).sum();
            DiscoveredWorkflow {
                name: String::new(),
                pattern,
                variant_indices: members,
                total_support,
            }
        })
        .collect();

    let member_labels = |workflow: &DiscoveredWorkflow| -> Vec<Vec<String>> {
        let mut labels: Vec<Vec<String>> = workflow
            .variant_indices
            .iter()
            .map(|&i| variants[i].labels.clone())
            .collect();
        labels.sort();
        labels
    };
    out.sort_by(|a, b| {
        b.total_support
            .partial_cmp(&a.total_support)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.pattern.cmp(&b.pattern))
            .then_with(|| member_labels(a).cmp(&member_labels(b)))
            .then_with(|| a.variant_indices.cmp(&b.variant_indices))
    });
    for (index, workflow) in out.iter_mut().enumerate() {
        workflow.name = format!("process-{index}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(labels: &[&str], support: f64) -> MinedPattern {
        MinedPattern {
            labels: labels.iter().map(|s| s.to_string()).collect(),
            case_indices: vec![],
            support,
            avg_duration: 0.0,
        }
    }

    #[test]
    fn test_levenshtein_similarity() {
        let a: Vec<String> = ["A", "B", "C"].iter().map(|s| s.to_string()).collect();
        let b: Vec<String> = ["A", "B", "D"].iter().map(|s| s.to_string()).collect();
        assert!((normalized_levenshtein(&a, &a) - 1.0).abs() < 1e-9);
        assert!((normalized_levenshtein(&a, &b) - 2.0 / 3.0).abs() < 1e-9);
        assert!((normalized_levenshtein(&a, &[]) - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_lcs() {
        let a: Vec<String> = ["A", "B", "Z", "C"].iter().map(|s| s.to_string()).collect();
        let b: Vec<String> = ["A", "Y", "B", "C"].iter().map(|s| s.to_string()).collect();
        assert_eq!(lcs(&a, &b), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_single_link_is_transitive() {
        // A-B-C-D ~ A-B-C-E ~ A-B-X-E chain into one cluster even though
        // the ends are only 0.5 similar
        let variants = vec![
            variant(&["A", "B", "C", "D"], 0.5),
            variant(&["A", "B", "C", "E"], 0.4),
            variant(&["A", "B", "X", "E"], 0.3),
            variant(&["Q", "R"], 0.2),
        ];
        let clusters = cluster_variants(&variants, 0.75);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0], vec![0, 1, 2]);
        assert_eq!(clusters[1], vec![3]);
    }

    #[test]
    fn test_canonical_pattern_folds_lcs() {
        let variants = vec![
            variant(&["A", "B", "C", "D"], 0.6),
            variant(&["A", "B", "C", "E"], 0.4),
        ];
        assert_eq!(canonical_pattern(&variants, &[0, 1]), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_canonical_falls_back_to_top_member() {
        let variants = vec![
            variant(&["A", "B"], 0.6),
            variant(&["X", "Y"], 0.4),
        ];
        // LCS is empty; the highest-support member wins
        assert_eq!(canonical_pattern(&variants, &[0, 1]), vec!["A", "B"]);
    }

    #[test]
    fn test_discover_names_by_descending_support() {
        let variants = vec![
            variant(&["Q", "R"], 1.0),
            variant(&["A", "B", "C", "D"], 0.5),
            variant(&["A", "B", "C", "E"], 0.4),
        ];
        let workflows = discover_workflows(&variants, 0.75);
        assert_eq!(workflows.len(), 2);
        assert_eq!(workflows[0].name, "process-0");
        assert_eq!(workflows[0].pattern, vec!["Q", "R"]);
        assert_eq!(workflows[1].name, "process-1");
        assert_eq!(workflows[1].pattern, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_tied_clusters_order_by_member_labels_then_indices() {
        // An above-1.0 threshold keeps every variant in its own cluster, so
        // equal supports force the content tie-breaks to decide the order
        let variants = vec![
            variant(&["X", "Y"], 0.5),
            variant(&["A", "B"], 0.5),
            variant(&["A", "B"], 0.5),
        ];
        let workflows = discover_workflows(&variants, 1.5);
        assert_eq!(workflows.len(), 3);
        assert_eq!(workflows[0].pattern, vec!["A", "B"]);
        assert_eq!(workflows[0].variant_indices, vec![1]);
        assert_eq!(workflows[0].name, "process-0");
        assert_eq!(workflows[1].variant_indices, vec![2]);
        assert_eq!(workflows[2].pattern, vec!["X", "Y"]);
    }

    #[test]
    fn test_discovery_is_deterministic() {
        let variants = vec![
            variant(&["A", "B", "C"], 0.5),
            variant(&["A", "B", "D"], 0.5),
            variant(&["A", "B", "E"], 0.5),
        ];
        let a = discover_workflows(&variants, 0.6);
        let b = discover_workflows(&variants, 0.6);
        let render = |ws: &[DiscoveredWorkflow]| {
            ws.iter()
                .map(|w| (w.name.clone(), w.pattern.clone(), w.variant_indices.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(render(&a), render(&b));
    }
}
