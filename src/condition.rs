//! Condition algebra and output selection
//!
//! Pure predicates live here ([`matches`], [`compare`]); the async entry
//! points resolve variables through the pass [`Context`] first.


use crate::context::{Context, ContextError};
use crate::flow::{Comparison, Condition, Output, PatternSet, State};

/// Whether `condition` holds for the resolved `value`
///
/// Value-consuming comparisons are false when the value is absent or the
/// condition carries no literals. `notEquals` is the exception for an absent
/// value: nothing equals it.
pub fn matches(condition: &Condition, value: Option<&str>) -> bool {
    matches_with(condition, value, &PatternSet::default())
}

/// [`matches`], reusing the compiled patterns of a validated flow
pub fn matches_with(condition: &Condition, value: Option<&str>, patterns: &PatternSet) -> bool {
    match condition.comparison {
        Comparison::Exists => value.is_some_and(|v| !v.is_empty()),
        Comparison::NotExists => value.is_none_or(str::is_empty),
        Comparison::NotEquals => {
            !condition.values.is_empty()
                && value.is_none_or(|v| condition.values.iter().all(|literal| literal != v))
        }
        comparison => value.is_some_and(|v| {
            condition
                .values
                .iter()
                .any(|literal| compare(comparison, v, literal, patterns))
        }),
    }
}

/// Apply a value-consuming comparison to one literal
pub fn compare(comparison: Comparison, value: &str, literal: &str, patterns: &PatternSet) -> bool {
    match comparison {
        Comparison::Equals => value == literal,
        Comparison::NotEquals => value != literal,
        Comparison::Contains => value.contains(literal),
        Comparison::StartsWith => value.starts_with(literal),
        Comparison::EndsWith => value.ends_with(literal),
        Comparison::Matches => patterns.is_match(literal, value),
        Comparison::ApproximateTo => is_approximate(value, literal),
        Comparison::Exists => !value.is_empty(),
        Comparison::NotExists => value.is_empty(),
    }
}

/// Case-insensitive closeness: edit distance within a quarter of the
/// literal's length, rounded up
pub fn is_approximate(value: &str, literal: &str) -> bool {
    let value = value.to_lowercase();
    let literal = literal.to_lowercase();
    let threshold = literal.chars().count().div_ceil(4);
    edit_distance(&value, &literal) <= threshold
}

/// Levenshtein distance over chars
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            current[j + 1] = (previous[j + 1] + 1)
                .min(current[j] + 1)
                .min(previous[j] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

/// Resolve and test one condition
pub async fn evaluate(condition: &Condition, ctx: &Context<'_>) -> Result<bool, ContextError> {
    let value = ctx
        .resolve(&condition.source, condition.variable.as_deref())
        .await?;
    Ok(matches_with(condition, value.as_deref(), ctx.flow().patterns()))
}

/// Short-circuit AND over `conditions`; an empty list holds
pub async fn evaluate_all(
    conditions: &[Condition],
    ctx: &Context<'_>,
) -> Result<bool, ContextError> {
    for condition in conditions {
        if !evaluate(condition, ctx).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// The lowest `(order, index)` output whose conditions all hold
pub async fn choose_output<'s>(
    state: &'s State,
    ctx: &Context<'_>,
) -> Result<Option<&'s Output>, ContextError> {
    let mut candidates: Vec<&Output> = state.outputs.iter().collect();
    // Stable, so declaration order breaks ties
    candidates.sort_by_key(|output| output.order);

    for output in candidates {
        if evaluate_all(&output.conditions, ctx).await? {
            tracing::debug!(
                state_id = %state.id,
                target = %output.state_id,
                order = output.order,
                "Output matched"
            );
            return Ok(Some(output));
        }
    }
    Ok(None)
}
