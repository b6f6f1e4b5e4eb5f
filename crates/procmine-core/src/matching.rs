// Workflow matching
//
// Scans a case's step labels with a saved pattern, tolerating up to
// `max_gap` unmatched labels between consecutive matched positions.
// Overlapping matches are resolved by greedy earliest selection, keeping
// only matches disjoint on step instances.

use crate::workflow::PatternDef;

/// One match of a pattern against a case's step sequence.
///
/// `span` covers matched and intervening steps; `matched` holds only the
/// positions bound to pattern steps.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternMatch {
    pub span: Vec<usize>,
    pub matched: Vec<usize>,
}

/// Find all disjoint matches of `pattern` in `labels`, earliest first
pub fn match_case(labels: &[String], pattern: &PatternDef) -> Vec<PatternMatch> {
    let mut out = Vec::new();
    let mut cursor = 0usize;
    while cursor < labels.len() {
        match earliest_match_from(labels, pattern, cursor) {
            Some(m) => {
                cursor = m.span.last().map(|&p| p + 1).unwrap_or(labels.len());
                out.push(m);
            }
            None => break,
        }
    }
    out
}

fn earliest_match_from(labels: &[String], pattern: &PatternDef, from: usize) -> Option<PatternMatch> {
    for start in from..labels.len() {
        if let Some(matched) = try_match_at(labels, pattern, start) {
            let first = *matched.first()?;
            let last = *matched.last()?;
            return Some(PatternMatch {
                span: (first..=last).collect(),
                matched,
            });
        }
    }
    None
}

/// Try to bind the pattern with its first required-or-taken step at `start`
fn try_match_at(labels: &[String], pattern: &PatternDef, start: usize) -> Option<Vec<usize>> {
    bind(labels, &pattern.steps, pattern.max_gap, 0, start, &mut Vec::new())
}

fn bind(
    labels: &[String],
    steps: &[crate::workflow::PatternStep],
    max_gap: usize,
    step_idx: usize,
    min_pos: usize,
    taken: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    if step_idx == steps.len() {
        return if taken.is_empty() { None } else { Some(taken.clone()) };
    }
    let step = &steps[step_idx];

    // Window for this step: anchored at min_pos for the first binding,
    // otherwise up to max_gap labels past the previous one
    let window_end = if taken.is_empty() {
        min_pos
    } else {
        (min_pos + max_gap).min(labels.len().saturating_sub(1))
    };

    for pos in min_pos..=window_end {
        if pos >= labels.len() {
            break;
        }
        if labels[pos] == step.label {
            taken.push(pos);
            if let Some(full) = bind(labels, steps, max_gap, step_idx + 1, pos + 1, taken) {
                return Some(full);
            }
            taken.pop();
        }
    }

    // An optional step may be skipped without consuming the gap allowance
    if step.optional {
        return bind(labels, steps, max_gap, step_idx + 1, min_pos, taken);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::PatternStep;

    fn labels(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn pattern(parts: &[&str], max_gap: usize) -> PatternDef {
        PatternDef::from_labels(labels(parts).to_vec(), max_gap)
    }

    #[test]
    fn test_gap_within_tolerance_matches_full_span() {
        // [A,B,Z,C] with max_gap 1: one occurrence spanning all four steps
        let matches = match_case(&labels(&["A", "B", "Z", "C"]), &pattern(&["A", "B", "C"], 1));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].matched, vec![0, 1, 3]);
        assert_eq!(matches[0].span, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_gap_beyond_tolerance_rejects() {
        let matches = match_case(&labels(&["A", "B", "Z", "Z", "C"]), &pattern(&["A", "B", "C"], 1));
        assert!(matches.is_empty());
    }

    #[test]
    fn test_exact_match() {
        let matches = match_case(&labels(&["A", "B", "C"]), &pattern(&["A", "B", "C"], 0));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].span, vec![0, 1, 2]);
    }

    #[test]
    fn test_greedy_disjoint_selection() {
        let matches = match_case(&labels(&["A", "B", "A", "B"]), &pattern(&["A", "B"], 0));
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].matched, vec![0, 1]);
        assert_eq!(matches[1].matched, vec![2, 3]);
    }

    #[test]
    fn test_overlapping_candidates_keep_earliest() {
        // Second A could start a match, but it lies inside the first span
        let matches = match_case(&labels(&["A", "A", "B"]), &pattern(&["A", "B"], 1));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].matched, vec![0, 2]);
    }

    #[test]
    fn test_optional_step_may_be_absent() {
        let def = PatternDef {
            steps: vec![
                PatternStep { label: "A".into(), optional: false },
                PatternStep { label: "B".into(), optional: true },
                PatternStep { label: "C".into(), optional: false },
            ],
            max_gap: 0,
        };
        assert_eq!(match_case(&labels(&["A", "C"]), &def).len(), 1);
        let with_b = match_case(&labels(&["A", "B", "C"]), &def);
        assert_eq!(with_b[0].matched, vec![0, 1, 2]);
    }

    #[test]
    fn test_no_match_on_missing_label() {
        assert!(match_case(&labels(&["A", "B"]), &pattern(&["A", "B", "C"], 2)).is_empty());
    }
}
