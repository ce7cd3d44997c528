use super::Locale;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

const MAX_LOCATION_CHARS: usize = 120;

lazy_static! {
    static ref URL_START: Regex = Regex::new(r"(?i)https?://").unwrap();
    static ref FIELD_LABEL: Regex = Regex::new(r"\b\p{L}[\p{L}'-]*\s?:(?:\s|$)").unwrap();
}

/// Anchor phrases that introduce a location, per locale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationAnchors {
    #[serde(default = "default_french_anchors")]
    pub fr: Vec<String>,
    #[serde(default = "default_english_anchors")]
    pub en: Vec<String>,
}

impl Default for LocationAnchors {
    fn default() -> Self {
        Self {
            fr: default_french_anchors(),
            en: default_english_anchors(),
        }
    }
}

fn default_french_anchors() -> Vec<String> {
    ["adresse", "lieu", "centre de visa", "à l'"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_english_anchors() -> Vec<String> {
    [
        "address",
        "location",
        "venue",
        "visa application centre",
        "visa application center",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl LocationAnchors {
    fn for_locale(&self, locale: Locale) -> &[String] {
        match locale {
            Locale::French => &self.fr,
            Locale::English => &self.en,
        }
    }
}

pub struct LocationExtractor {
    anchors: Vec<Regex>,
    any_anchor: Option<Regex>,
}

impl LocationExtractor {
    pub fn new(anchors: &LocationAnchors, locales: &[Locale]) -> Self {
        let patterns: Vec<String> = locales
            .iter()
            .flat_map(|locale| anchors.for_locale(*locale))
            .map(|phrase| phrase.trim())
            .filter(|phrase| !phrase.is_empty())
            .map(anchor_pattern)
            .collect();

        let any_anchor = if patterns.is_empty() {
            None
        } else {
            Regex::new(&format!("(?i)(?:{})", patterns.join("|"))).ok()
        };

        Self {
            anchors: patterns
                .iter()
                .filter_map(|p| Regex::new(&format!("(?i){p}")).ok())
                .collect(),
            any_anchor,
        }
    }

    /// Text following the highest-priority anchor that yields a non-empty window.
    pub fn extract(&self, text: &str) -> Option<String> {
        for anchor in &self.anchors {
            for found in anchor.find_iter(text) {
                if let Some(location) = self.window_after(&text[found.end()..]) {
                    return Some(location);
                }
            }
        }
        None
    }

    fn window_after(&self, rest: &str) -> Option<String> {
        let rest = rest.trim_start_matches(|c: char| c == ':' || c == '-' || c.is_whitespace());

        let mut end = rest.len();
        if let Some(idx) = rest.find('\n') {
            end = end.min(idx);
        }
        if let Some(m) = URL_START.find(rest) {
            end = end.min(m.start());
        }
        if let Some(m) = FIELD_LABEL.find(rest) {
            end = end.min(m.start());
        }
        // An anchor phrase opening the window is part of the location itself.
        if let Some(m) = self
            .any_anchor
            .as_ref()
            .and_then(|re| re.find_iter(rest).find(|m| m.start() > 0))
        {
            end = end.min(m.start());
        }
        if let Some((idx, _)) = rest.char_indices().nth(MAX_LOCATION_CHARS) {
            end = end.min(idx);
        }

        let window = rest[..end]
            .trim()
            .trim_end_matches(|c: char| (c.is_ascii_punctuation() && c != ')') || c.is_whitespace())
            .trim();

        if window.is_empty() {
            None
        } else {
            Some(window.to_string())
        }
    }
}

fn anchor_pattern(phrase: &str) -> String {
    let escaped = regex::escape(phrase);
    let trailing = if phrase.chars().last().is_some_and(char::is_alphanumeric) {
        r"\b"
    } else {
        ""
    };
    format!(r"\b{escaped}{trailing}")
}
