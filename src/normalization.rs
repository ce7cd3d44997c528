use crate::message::MessageBody;
use regex::Regex;

/// Visible text of a message plus the entity-decoded source it came from.
///
/// The source is kept because link targets live in `href` attributes that
/// do not survive tag stripping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedBody {
    pub text: String,
    pub decoded_source: String,
    pub was_html: bool,
}

pub struct BodyNormalizer {
    html_entity_regex: Regex,
    html_marker_regex: Regex,
    hidden_block_regex: Regex,
    block_tag_regex: Regex,
    tag_regex: Regex,
    zero_width_chars: Vec<char>,
}

impl BodyNormalizer {
    pub fn new() -> Self {
        Self {
            html_entity_regex: Regex::new(r"&(?:#(\d+)|#[xX]([0-9A-Fa-f]+)|([a-zA-Z][a-zA-Z0-9]*));")
                .unwrap(),
            html_marker_regex: Regex::new(
                r"(?i)<\s*(?:html|body|div|p|br|table|td|span|a\s|font|center)\b",
            )
            .unwrap(),
            hidden_block_regex: Regex::new(
                r"(?is)<script\b.*?</script\s*>|<style\b.*?</style\s*>|<head\b.*?</head\s*>|<!--.*?-->",
            )
            .unwrap(),
            block_tag_regex: Regex::new(
                r"(?i)<\s*/?\s*(?:br|p|div|tr|li|ul|ol|h[1-6]|table|hr|blockquote)\b[^>]*>",
            )
            .unwrap(),
            tag_regex: Regex::new(r"(?s)<[^>]*>").unwrap(),
            zero_width_chars: vec!['\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}', '\u{2060}'],
        }
    }

    /// Normalize the best available part of a message body.
    ///
    /// HTML wins over plain text; the provider snippet is the last resort.
    pub fn normalize_body(&self, body: &MessageBody, snippet: &str) -> NormalizedBody {
        let (source, declared_html) = match (&body.html, &body.text) {
            (Some(html), _) if !html.trim().is_empty() => (html.as_str(), true),
            (_, Some(text)) if !text.trim().is_empty() => (text.as_str(), false),
            _ => (snippet, false),
        };

        let was_html = declared_html || self.looks_like_html(source);
        let repaired = repair_mojibake(source);
        let decoded_source = self.decode_html_entities(&repaired);

        let visible = if was_html {
            self.html_to_text(&repaired)
        } else {
            decoded_source.clone()
        };

        NormalizedBody {
            text: clean_text(&visible, &self.zero_width_chars),
            decoded_source,
            was_html,
        }
    }

    /// Normalize a single line of text such as a subject.
    pub fn normalize_line(&self, text: &str) -> String {
        let decoded = self.decode_html_entities(&repair_mojibake(text));
        clean_text(&decoded, &self.zero_width_chars)
            .lines()
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn looks_like_html(&self, text: &str) -> bool {
        self.html_marker_regex.is_match(text)
    }

    fn html_to_text(&self, html: &str) -> String {
        let without_hidden = self.hidden_block_regex.replace_all(html, " ");
        let with_breaks = self.block_tag_regex.replace_all(&without_hidden, "\n");
        let stripped = self.tag_regex.replace_all(&with_breaks, "");
        self.decode_html_entities(&stripped)
    }

    fn decode_html_entities(&self, text: &str) -> String {
        if !text.contains('&') {
            return text.to_string();
        }

        self.html_entity_regex
            .replace_all(text, |caps: &regex::Captures| {
                let decoded = if let Some(decimal) = caps.get(1) {
                    decimal.as_str().parse::<u32>().ok().and_then(char::from_u32)
                } else if let Some(hex) = caps.get(2) {
                    u32::from_str_radix(hex.as_str(), 16)
                        .ok()
                        .and_then(char::from_u32)
                } else {
                    caps.get(3).and_then(|named| named_entity(named.as_str()))
                };
                match decoded {
                    Some(ch) => ch.to_string(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}

impl Default for BodyNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

fn named_entity(name: &str) -> Option<char> {
    let ch = match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{00A0}',
        "eacute" => 'é',
        "Eacute" => 'É',
        "egrave" => 'è',
        "Egrave" => 'È',
        "ecirc" => 'ê',
        "euml" => 'ë',
        "agrave" => 'à',
        "Agrave" => 'À',
        "acirc" => 'â',
        "auml" => 'ä',
        "ccedil" => 'ç',
        "Ccedil" => 'Ç',
        "icirc" => 'î',
        "iuml" => 'ï',
        "ocirc" => 'ô',
        "ouml" => 'ö',
        "ugrave" => 'ù',
        "ucirc" => 'û',
        "uuml" => 'ü',
        "oelig" => 'œ',
        "rsquo" => '\u{2019}',
        "lsquo" => '\u{2018}',
        "rdquo" => '\u{201D}',
        "ldquo" => '\u{201C}',
        "laquo" => '«',
        "raquo" => '»',
        "hellip" => '…',
        "ndash" => '–',
        "mdash" => '—',
        "euro" => '€',
        _ => return None,
    };
    Some(ch)
}

/// Undo UTF-8 bytes that were decoded as Latin-1 somewhere upstream
/// (`confirmÃ©` back to `confirmé`). Text that does not round-trip is
/// returned unchanged.
fn repair_mojibake(text: &str) -> String {
    if !text.contains(['Ã', 'Â']) {
        return text.to_string();
    }
    let mut bytes = Vec::with_capacity(text.len());
    for ch in text.chars() {
        let code = ch as u32;
        if code > 0xFF {
            return text.to_string();
        }
        bytes.push(code as u8);
    }
    String::from_utf8(bytes).unwrap_or_else(|_| text.to_string())
}

fn clean_text(text: &str, zero_width_chars: &[char]) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");

    let mut filtered = String::with_capacity(unified.len());
    for ch in unified.chars() {
        if zero_width_chars.contains(&ch)
            || matches!(ch, '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}')
        {
            continue;
        }
        match ch {
            '\u{00A0}' | '\u{202F}' | '\u{2007}' | '\t' => filtered.push(' '),
            '\u{2019}' | '\u{2018}' | '\u{02BC}' => filtered.push('\''),
            _ => filtered.push(ch),
        }
    }

    let mut lines: Vec<String> = Vec::new();
    let mut previous_blank = true;
    for line in filtered.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            if !previous_blank {
                lines.push(String::new());
            }
            previous_blank = true;
        } else {
            lines.push(collapsed);
            previous_blank = false;
        }
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_reduced_to_visible_text() {
        let normalizer = BodyNormalizer::new();
        let html = "<html><head><title>x</title><style>p{color:red}</style></head>\
                    <body><p>Votre rendez-vous est confirm&eacute;</p>\
                    <script>var a = 1;</script><div>Date&nbsp;: 14 mars 2025</div></body></html>";

        let normalized = normalizer.normalize_body(&MessageBody::html(html), "");

        assert!(normalized.was_html);
        assert_eq!(
            normalized.text,
            "Votre rendez-vous est confirmé\n\nDate : 14 mars 2025"
        );
    }

    #[test]
    fn test_href_survives_in_decoded_source() {
        let normalizer = BodyNormalizer::new();
        let html = r#"<p><a href="https://tlscontact.com/confirm?a=1&amp;b=2">Confirmer</a></p>"#;

        let normalized = normalizer.normalize_body(&MessageBody::html(html), "");

        assert_eq!(normalized.text, "Confirmer");
        assert!(normalized
            .decoded_source
            .contains("https://tlscontact.com/confirm?a=1&b=2"));
    }

    #[test]
    fn test_whitespace_and_artifacts() {
        let normalizer = BodyNormalizer::new();
        let text = "Bonjour,\r\n\r\n\r\n\tRendez\u{200B}-vous   à\u{00A0}l\u{2019}Ambassade  \r\n\r\n";

        let normalized = normalizer.normalize_body(&MessageBody::plain(text), "");

        assert!(!normalized.was_html);
        assert_eq!(normalized.text, "Bonjour,\n\nRendez-vous à l'Ambassade");
    }

    #[test]
    fn test_mojibake_repair() {
        let normalizer = BodyNormalizer::new();
        assert_eq!(normalizer.normalize_line("Rendez-vous confirmÃ©"), "Rendez-vous confirmé");
        // Genuine accented text is left alone.
        assert_eq!(normalizer.normalize_line("Ã  bientôt"), "Ã bientôt");
    }

    #[test]
    fn test_plain_text_with_markup_is_treated_as_html() {
        let normalizer = BodyNormalizer::new();
        let normalized =
            normalizer.normalize_body(&MessageBody::plain("<div>Bonjour</div><br>Merci"), "");
        assert!(normalized.was_html);
        assert_eq!(normalized.text, "Bonjour\n\nMerci");
    }

    #[test]
    fn test_snippet_fallback() {
        let normalizer = BodyNormalizer::new();
        let normalized = normalizer.normalize_body(&MessageBody::default(), "Short preview");
        assert_eq!(normalized.text, "Short preview");
    }
}
