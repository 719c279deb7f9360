//! Namespaced tool names
//!
//! In aggregate mode a tool is exposed as `sanitize(app):sanitize(capability)`.
//! Sanitization is lossy, so two apps whose names sanitize identically
//! collide; decoding then picks the first match in app order.

use crate::model::{App, Capability};

/// Maximum token length accepted by strict tool-name validators
pub const MAX_NAME_LEN: usize = 64;

/// Separator between the app and capability halves
pub const SEPARATOR: char = ':';

fn allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '+' | '-')
}

/// Make a name safe for tool-calling APIs.
///
/// Disallowed characters become `_`, a leading non-letter gets a `_`
/// prefix, and the result is capped at 64 characters.
#[must_use]
pub fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if allowed(c) { c } else { '_' })
        .collect();
    if !out
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
    {
        out.insert(0, '_');
    }
    out.chars().take(MAX_NAME_LEN).collect()
}

/// Namespaced tool name for an app capability.
#[must_use]
pub fn encode(app: &str, capability: &str) -> String {
    format!("{}{SEPARATOR}{}", sanitize(app), sanitize(capability))
}

/// Resolve a tool name against apps and their capabilities.
///
/// Without a separator the raw capability name is searched across all apps.
/// With one, the first-separator split is matched against sanitized names;
/// if that finds nothing (an app name containing `:`), the full encoded
/// form is compared.
#[must_use]
pub fn decode<'a>(
    token: &str,
    apps: &'a [(App, Vec<Capability>)],
) -> Option<(&'a App, &'a Capability)> {
    let Some((app_part, cap_part)) = token.split_once(SEPARATOR) else {
        return apps.iter().find_map(|(app, caps)| {
            caps.iter().find(|c| c.name == token).map(|c| (app, c))
        });
    };

    apps.iter()
        .filter(|(app, _)| sanitize(&app.name) == app_part)
        .find_map(|(app, caps)| {
            caps.iter()
                .find(|c| sanitize(&c.name) == cap_part)
                .map(|c| (app, c))
        })
        .or_else(|| {
            apps.iter().find_map(|(app, caps)| {
                caps.iter()
                    .find(|c| encode(&app.name, &c.name) == token)
                    .map(|c| (app, c))
            })
        })
}
