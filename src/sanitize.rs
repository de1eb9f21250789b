//! Span-based text sanitization.
//!
//! Replacements are applied to the original text in reverse span order so
//! earlier offsets stay valid, operating on code points (the same offsets
//! detectors report). Overlapping requests are resolved before application:
//! overlapping spans collapse to their union and the first replacement text
//! wins (callers order by severity).

use crate::detect::Span;

/// A single pending substitution.
#[derive(Debug, Clone)]
pub struct Replacement {
    pub span: Span,
    pub text: String,
}

impl Replacement {
    pub fn new(span: Span, text: impl Into<String>) -> Self {
        Self {
            span,
            text: text.into(),
        }
    }
}

/// Collapse overlapping replacements into union spans.
///
/// Input order is significance order: when two requests overlap, the earlier
/// one keeps its replacement text and absorbs the other's span.
pub fn merge_replacements(requests: Vec<Replacement>) -> Vec<Replacement> {
    let mut merged: Vec<Replacement> = Vec::with_capacity(requests.len());
    for request in requests {
        if let Some(existing) = merged
            .iter_mut()
            .find(|r| r.span.overlaps(&request.span))
        {
            existing.span = existing.span.union(&request.span);
        } else {
            merged.push(request);
        }
    }
    merged
}

/// Apply non-overlapping replacements in reverse span order.
///
/// Spans index code points. Out-of-range spans are clamped; empty spans are
/// skipped.
pub fn apply_replacements(text: &str, replacements: &[Replacement]) -> String {
    if replacements.is_empty() {
        return text.to_string();
    }

    let chars: Vec<char> = text.chars().collect();
    let mut ordered: Vec<&Replacement> = replacements.iter().collect();
    ordered.sort_by_key(|r| std::cmp::Reverse(r.span.start));

    let mut out: Vec<char> = chars;
    let mut last_applied_start = usize::MAX;
    for replacement in ordered {
        let start = replacement.span.start.min(out.len());
        let end = replacement.span.end.min(out.len());
        if end <= start || end > last_applied_start.min(out.len()) {
            continue;
        }
        out.splice(start..end, replacement.text.chars());
        last_applied_start = start;
    }

    out.into_iter().collect()
}

/// Convenience: merge then apply.
pub fn sanitize(text: &str, requests: Vec<Replacement>) -> String {
    apply_replacements(text, &merge_replacements(requests))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_replacement() {
        let text = "my email is alice@example.com ok";
        let result = sanitize(
            text,
            vec![Replacement::new(Span::new(12, 29), "‹EMAIL_1›")],
        );
        assert_eq!(result, "my email is ‹EMAIL_1› ok");
    }

    #[test]
    fn test_reverse_order_keeps_offsets_valid() {
        let text = "a@x.com and b@y.com";
        let result = sanitize(
            text,
            vec![
                Replacement::new(Span::new(0, 7), "‹EMAIL_1›"),
                Replacement::new(Span::new(12, 19), "‹EMAIL_2›"),
            ],
        );
        assert_eq!(result, "‹EMAIL_1› and ‹EMAIL_2›");
    }

    #[test]
    fn test_overlapping_spans_merge_to_union() {
        let text = "0123456789";
        let merged = merge_replacements(vec![
            Replacement::new(Span::new(2, 6), "[A]"),
            Replacement::new(Span::new(4, 8), "[B]"),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].span, Span::new(2, 8));
        assert_eq!(merged[0].text, "[A]");
        assert_eq!(apply_replacements(text, &merged), "01[A]89");
    }

    #[test]
    fn test_multibyte_offsets() {
        let text = "café: a@x.com!";
        let result = sanitize(text, vec![Replacement::new(Span::new(6, 13), "‹EMAIL_1›")]);
        assert_eq!(result, "café: ‹EMAIL_1›!");
    }

    #[test]
    fn test_empty_and_out_of_range_spans_skipped() {
        let text = "short";
        let result = sanitize(
            text,
            vec![
                Replacement::new(Span::new(3, 3), "[X]"),
                Replacement::new(Span::new(10, 20), "[Y]"),
            ],
        );
        assert_eq!(result, "short");
    }

    #[test]
    fn test_no_replacements_is_identity() {
        assert_eq!(sanitize("unchanged", vec![]), "unchanged");
    }
}
