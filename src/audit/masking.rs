//! Sensitive-data masking for logged bodies.

use regex::Regex;

use crate::config::MaskingConfig;
use crate::{Error, Result};

/// Marker appended to truncated bodies
pub const TRUNCATION_MARKER: &str = "...[truncated]";

/// Text scanned past the truncation point so a match straddling the cut is still masked
const MASK_WINDOW_MARGIN: usize = 256;

const CARD_PATTERN: &str = r"\b(?:\d[ -]?){12,18}\d\b";
const EMAIL_PATTERN: &str = r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}";
const PHONE_PATTERN: &str = r"(?:\+\d{1,3}[\s.-]?)?(?:\(\d{3}\)|\b\d{3})[\s.-]?\d{3}[\s.-]?\d{4}\b";

/// Compiled masking rules
#[derive(Debug, Clone)]
pub struct Masker {
    rules: Vec<(Regex, &'static str)>,
}

impl Masker {
    /// Compile the enabled rules. Invalid custom patterns are a config error.
    pub fn new(config: &MaskingConfig) -> Result<Self> {
        let mut rules = Vec::new();
        // Cards before phones so long digit runs are not half-masked as phones
        let builtin = [
            (config.credit_cards, CARD_PATTERN, "[CARD]"),
            (config.emails, EMAIL_PATTERN, "[EMAIL]"),
            (config.phone_numbers, PHONE_PATTERN, "[PHONE]"),
        ];
        for (enabled, pattern, replacement) in builtin {
            if enabled {
                let re = Regex::new(pattern)
                    .map_err(|e| Error::Internal(format!("builtin mask pattern: {e}")))?;
                rules.push((re, replacement));
            }
        }
        for pattern in &config.custom_patterns {
            let re = Regex::new(pattern).map_err(|e| {
                Error::Config(format!("Invalid masking pattern '{pattern}': {e}"))
            })?;
            rules.push((re, "[REDACTED]"));
        }
        Ok(Self { rules })
    }

    /// Masker that leaves text untouched.
    #[must_use]
    pub fn disabled() -> Self {
        Self { rules: Vec::new() }
    }

    /// Apply every rule in order.
    #[must_use]
    pub fn mask(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (re, replacement) in &self.rules {
            if re.is_match(&out) {
                out = re.replace_all(&out, *replacement).into_owned();
            }
        }
        out
    }

    /// Mask and truncate to `max_bytes`, scanning only a bounded prefix of
    /// `text` so oversized bodies cost no more than small ones.
    #[must_use]
    pub fn mask_truncated(&self, text: &str, max_bytes: usize) -> String {
        let window = prefix(text, max_bytes.saturating_add(MASK_WINDOW_MARGIN));
        let masked = self.mask(window);
        if window.len() < text.len() && masked.len() <= max_bytes {
            return format!("{masked}{TRUNCATION_MARKER}");
        }
        truncate(&masked, max_bytes)
    }
}

/// Longest prefix of `text` within `max_bytes` that ends on a char boundary.
fn prefix(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Cut `text` to at most `max_bytes` on a char boundary, appending the marker.
#[must_use]
pub fn truncate(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    format!("{}{TRUNCATION_MARKER}", prefix(text, max_bytes))
}
