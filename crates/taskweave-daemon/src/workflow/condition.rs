//! Condition expressions for `condition` steps.
//!
//! Three forms only:
//!
//! - `<lhs> == <rhs>`
//! - `<lhs> != <rhs>`
//! - `<value>`: true when non-empty and not `false`
//!
//! Each side is template-resolved, trimmed, and stripped of one layer of
//! matching single or double quotes.

use super::template::TemplateContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Equal,
    NotEqual,
}

/// Evaluate `expr` against the current run state.
pub fn evaluate(expr: &str, ctx: &TemplateContext) -> bool {
    match split_comparison(expr) {
        Some((lhs, op, rhs)) => {
            let lhs = operand(lhs, ctx);
            let rhs = operand(rhs, ctx);
            match op {
                Comparison::Equal => lhs == rhs,
                Comparison::NotEqual => lhs != rhs,
            }
        }
        None => is_truthy(&ctx.resolve(expr)),
    }
}

pub fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty() && value != "false"
}

/// Split on the first `==` or `!=`, whichever appears first.
fn split_comparison(expr: &str) -> Option<(&str, Comparison, &str)> {
    let eq = expr.find("==").map(|i| (i, Comparison::Equal));
    let ne = expr.find("!=").map(|i| (i, Comparison::NotEqual));
    let (at, op) = match (eq, ne) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (Some(found), None) | (None, Some(found)) => found,
        (None, None) => return None,
    };
    Some((&expr[..at], op, &expr[at + 2..]))
}

fn operand(raw: &str, ctx: &TemplateContext) -> String {
    let resolved = ctx.resolve(raw.trim());
    strip_quotes(resolved.trim()).to_string()
}

fn strip_quotes(value: &str) -> &str {
    for quote in ['\'', '"'] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}
