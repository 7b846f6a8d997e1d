//! Display-name collision resolution
//!
//! Two sessions never share a display name. A newcomer whose requested name
//! is taken gets a numbered variant: `Alice` becomes `Alice(2)`, a taken
//! `Alice(2)` becomes `Alice(3)`, and so on. Each new candidate is checked
//! against every other session again, so chains of collisions resolve to the
//! first free number along the way.

/// Splits a trailing `(k)` counter off a name
///
/// Only positive integers count as a suffix; `Bob(x)` and `Bob(0)` are plain
/// names.
pub fn split_suffix(name: &str) -> (&str, Option<u32>) {
    let Some(stripped) = name.strip_suffix(')') else {
        return (name, None);
    };
    let Some(open) = stripped.rfind('(') else {
        return (name, None);
    };

    let digits = &stripped[open + 1..];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return (name, None);
    }

    match digits.parse::<u32>() {
        Ok(k) if k > 0 => (&stripped[..open], Some(k)),
        _ => (name, None),
    }
}

/// The candidate that follows a colliding name
///
/// Always differs from `name`. A counter that cannot be incremented is
/// treated as part of the base name and gets a fresh `(2)`.
pub fn next_candidate(name: &str) -> String {
    match split_suffix(name) {
        (base, Some(k)) => match k.checked_add(1) {
            Some(next) => format!("{}({})", base, next),
            None => format!("{}(2)", name),
        },
        (_, None) => format!("{}(2)", name),
    }
}

/// Picks a display name for a new session that no other session is using
///
/// `others` yields the display names of every other live session.
pub fn resolve_display_name<'a, I>(requested: &str, others: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let others: Vec<&str> = others.into_iter().collect();
    let mut candidate = requested.to_string();

    while others.iter().any(|other| *other == candidate) {
        candidate = next_candidate(&candidate);
    }

    candidate
}
