pub mod dates;
pub mod links;
pub mod location;
pub mod rules;

use crate::config::ParserConfig;
use crate::domain_utils::DomainUtils;
use crate::message::{MessageId, RawMessage};
use crate::normalization::BodyNormalizer;
use chrono::{NaiveDate, NaiveTime};
use dates::DateExtractor;
use links::LinkSelector;
use location::LocationExtractor;
use log::debug;
use rules::{Classification, Evidence, RulePipeline, Signals};
use serde::{Deserialize, Serialize};

const EXCERPT_CHARS: usize = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Locale {
    #[serde(rename = "fr")]
    French,
    #[serde(rename = "en")]
    English,
}

/// Field order of `NN/NN/YYYY` dates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericDateOrder {
    #[default]
    DayFirst,
    MonthFirst,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentDate {
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
    /// Language of the recognizer that matched.
    pub locale: Locale,
    /// Matched source text.
    pub raw: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    Confirmed,
    LowConfidence,
}

/// Message details carried along for the alert text only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceContext {
    pub sender: String,
    pub subject: String,
    pub labels: Vec<String>,
    pub excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentRecord {
    pub date: Option<AppointmentDate>,
    pub location: Option<String>,
    pub link: Option<String>,
    pub message_id: MessageId,
    pub confidence: Confidence,
    pub context: SourceContext,
}

impl AppointmentRecord {
    /// A record needs at least a date or a link.
    pub fn new(
        message_id: MessageId,
        signals: Signals,
        confidence: Confidence,
        context: SourceContext,
    ) -> Option<Self> {
        if signals.date.is_none() && signals.link.is_none() {
            return None;
        }
        Some(Self {
            date: signals.date,
            location: signals.location,
            link: signals.link,
            message_id,
            confidence,
            context,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NotAnAppointment {
    #[error("sender is not on the allow-list")]
    SenderNotAllowed,
    #[error("no appointment date or link found")]
    NoAppointmentSignal,
    #[error("low-confidence match suppressed by configuration")]
    LowConfidenceSuppressed,
}

/// Turns a raw message into an appointment record.
///
/// Parsing is deterministic: relative dates are resolved against the
/// message's received timestamp and nothing here reads the clock or
/// touches the network.
pub struct AppointmentParser {
    normalizer: BodyNormalizer,
    dates: DateExtractor,
    locations: LocationExtractor,
    links: LinkSelector,
    pipeline: RulePipeline,
}

impl AppointmentParser {
    pub fn new(config: &ParserConfig) -> Self {
        Self {
            normalizer: BodyNormalizer::new(),
            dates: DateExtractor::new(&config.locales, config.numeric_date_order),
            locations: LocationExtractor::new(&config.location_anchors, &config.locales),
            links: LinkSelector::new(&config.link_hosts, &config.ignored_link_patterns),
            pipeline: RulePipeline::standard(&config.sender_domains, config.emit_low_confidence),
        }
    }

    pub fn parse(&self, message: &RawMessage) -> Result<AppointmentRecord, NotAnAppointment> {
        let sender_domain = DomainUtils::sender_domain(&message.sender);
        let sender_only = Evidence {
            sender_domain: sender_domain.as_deref(),
            signals: None,
        };
        if let Some((classification, rule)) = self.pipeline.classify(&sender_only) {
            debug!("{}: decided by {} before body analysis", message.id, rule);
            return Err(rejection(classification));
        }

        let body = self.normalizer.normalize_body(&message.body, &message.snippet);
        let subject = self.normalizer.normalize_line(&message.subject);
        let searched = format!("{}\n{}", subject, body.text);

        let signals = Signals {
            date: self.dates.extract(&searched, message.received_at.date_naive()),
            location: self.locations.extract(&searched),
            link: self.links.select(&[&body.decoded_source, &body.text]),
        };

        let evidence = Evidence {
            sender_domain: sender_domain.as_deref(),
            signals: Some(&signals),
        };
        let (classification, rule) = self
            .pipeline
            .classify(&evidence)
            .unwrap_or((
                Classification::NotAnAppointment(NotAnAppointment::NoAppointmentSignal),
                "fallthrough",
            ));
        debug!(
            "{}: {:?} by {} (date: {}, link: {})",
            message.id,
            classification,
            rule,
            signals.date.is_some(),
            signals.link.is_some()
        );

        let confidence = match classification {
            Classification::Confirmed => Confidence::Confirmed,
            Classification::LowConfidence => Confidence::LowConfidence,
            Classification::NotAnAppointment(reason) => return Err(reason),
        };

        let context = SourceContext {
            sender: message.sender.clone(),
            subject,
            labels: message.labels.clone(),
            excerpt: body.text.chars().take(EXCERPT_CHARS).collect(),
        };

        AppointmentRecord::new(message.id.clone(), signals, confidence, context)
            .ok_or(NotAnAppointment::NoAppointmentSignal)
    }
}

fn rejection(classification: Classification) -> NotAnAppointment {
    match classification {
        Classification::NotAnAppointment(reason) => reason,
        _ => NotAnAppointment::NoAppointmentSignal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBody;
    use chrono::{TimeZone, Utc};

    fn message(sender: &str, subject: &str, body: MessageBody) -> RawMessage {
        RawMessage {
            id: MessageId::new("msg-1"),
            sender: sender.to_string(),
            subject: subject.to_string(),
            body,
            received_at: Utc.with_ymd_and_hms(2025, 2, 20, 9, 0, 0).unwrap(),
            labels: vec!["INBOX".to_string()],
            snippet: String::new(),
        }
    }

    fn parser() -> AppointmentParser {
        AppointmentParser::new(&ParserConfig::default())
    }

    #[test]
    fn test_french_confirmation() {
        let msg = message(
            "TLScontact <noreply@tlscontact.com>",
            "Confirmation",
            MessageBody::plain(
                "Votre rendez-vous est confirmé pour le 14 mars 2025 à l'Ambassade, lien: https://tlscontact.com/confirm/abc",
            ),
        );

        let record = parser().parse(&msg).unwrap();

        let date = record.date.unwrap();
        assert_eq!(date.date, NaiveDate::from_ymd_opt(2025, 3, 14).unwrap());
        assert_eq!(date.locale, Locale::French);
        assert!(record.location.unwrap().contains("Ambassade"));
        assert_eq!(record.link.as_deref(), Some("https://tlscontact.com/confirm/abc"));
        assert_eq!(record.confidence, Confidence::Confirmed);
        assert_eq!(record.message_id, MessageId::new("msg-1"));
    }

    #[test]
    fn test_sender_outside_allow_list() {
        let msg = message(
            "Phisher <noreply@tlscontact.com.evil.example>",
            "Rendez-vous confirmé",
            MessageBody::plain("le 14 mars 2025, https://tlscontact.com/confirm/abc"),
        );
        assert_eq!(parser().parse(&msg), Err(NotAnAppointment::SenderNotAllowed));

        let no_address = message("TLScontact", "x", MessageBody::plain("14 mars 2025"));
        assert_eq!(parser().parse(&no_address), Err(NotAnAppointment::SenderNotAllowed));
    }

    #[test]
    fn test_no_date_and_no_link() {
        let msg = message(
            "noreply@tlscontact.com",
            "Newsletter",
            MessageBody::plain("Merci d'utiliser nos services."),
        );
        assert_eq!(parser().parse(&msg), Err(NotAnAppointment::NoAppointmentSignal));
    }

    #[test]
    fn test_date_only_is_low_confidence_or_suppressed() {
        let msg = message(
            "noreply@fr.tlscontact.com",
            "Rappel",
            MessageBody::plain("Rappel : rendez-vous le 03/04/2025 à 09h15."),
        );

        let record = parser().parse(&msg).unwrap();
        assert_eq!(record.confidence, Confidence::LowConfidence);
        let date = record.date.unwrap();
        assert_eq!(date.date, NaiveDate::from_ymd_opt(2025, 4, 3).unwrap());
        assert_eq!(date.time, NaiveTime::from_hms_opt(9, 15, 0));

        let strict = AppointmentParser::new(&ParserConfig {
            emit_low_confidence: false,
            ..ParserConfig::default()
        });
        assert_eq!(strict.parse(&msg), Err(NotAnAppointment::LowConfidenceSuppressed));
    }

    #[test]
    fn test_html_body_with_href_link() {
        let html = r#"<html><body><p>Your appointment is on <b>March 14, 2025</b> at 10:30 AM.</p>
            <p>Location: TLScontact London, 66 Wilson Street</p>
            <p><a href="https://visas-fr.tlscontact.com/appointment?id=9&amp;lang=en">Manage</a></p>
            <p><a href="https://tlscontact.com/unsubscribe">Unsubscribe</a></p></body></html>"#;
        let msg = message("TLScontact <info@tlscontact.com>", "Appointment", MessageBody::html(html));

        let record = parser().parse(&msg).unwrap();

        assert_eq!(record.confidence, Confidence::Confirmed);
        let date = record.date.unwrap();
        assert_eq!(date.locale, Locale::English);
        assert_eq!(date.time, NaiveTime::from_hms_opt(10, 30, 0));
        assert_eq!(
            record.link.as_deref(),
            Some("https://visas-fr.tlscontact.com/appointment?id=9&lang=en")
        );
        assert_eq!(
            record.location.as_deref(),
            Some("TLScontact London, 66 Wilson Street")
        );
        assert!(!record.context.excerpt.contains('<'));
    }

    #[test]
    fn test_year_resolution_uses_received_date() {
        let mut msg = message(
            "noreply@tlscontact.com",
            "RDV",
            MessageBody::plain("Votre rendez-vous : 14 mars, https://tlscontact.com/r/1"),
        );
        msg.received_at = Utc.with_ymd_and_hms(2025, 11, 2, 8, 0, 0).unwrap();

        let record = parser().parse(&msg).unwrap();
        assert_eq!(record.date.unwrap().date, NaiveDate::from_ymd_opt(2026, 3, 14).unwrap());
    }

    #[test]
    fn test_parse_is_deterministic() {
        let msg = message(
            "noreply@tlscontact.com",
            "RDV demain",
            MessageBody::plain("Rendez-vous demain à 10h"),
        );
        let first = parser().parse(&msg);
        let second = parser().parse(&msg);
        assert_eq!(first, second);
        assert_eq!(
            first.unwrap().date.unwrap().date,
            NaiveDate::from_ymd_opt(2025, 2, 21).unwrap()
        );
    }

    #[test]
    fn test_record_requires_date_or_link() {
        let context = SourceContext {
            sender: String::new(),
            subject: String::new(),
            labels: Vec::new(),
            excerpt: String::new(),
        };
        assert!(AppointmentRecord::new(
            MessageId::new("x"),
            Signals::default(),
            Confidence::LowConfidence,
            context
        )
        .is_none());
    }

    fn fixture(name: &str, content: &str) -> RawMessage {
        crate::mail::directory::parse_fixture(name, content, Utc::now())
    }

    #[test]
    fn test_sample_fixtures() {
        let parser = parser();

        let french = parser
            .parse(&fixture("1", include_str!("../../fixtures/sample_tls_email_1.txt")))
            .unwrap();
        assert_eq!(french.confidence, Confidence::Confirmed);
        assert_eq!(
            french.date.unwrap().date,
            NaiveDate::from_ymd_opt(2026, 1, 15).unwrap()
        );
        assert!(french.location.unwrap().contains("12 rue de la Paix"));
        assert_eq!(
            french.link.as_deref(),
            Some("https://visas-fr.tlscontact.com/appointment/confirm?ref=TLS-88412")
        );

        let english = parser
            .parse(&fixture("2", include_str!("../../fixtures/sample_tls_email_2.txt")))
            .unwrap();
        assert_eq!(
            english.date.unwrap().date,
            NaiveDate::from_ymd_opt(2026, 1, 22).unwrap()
        );
        assert!(english.link.unwrap().starts_with("https://uk.tlscontact.com/"));

        let html = parser
            .parse(&fixture("3", include_str!("../../fixtures/sample_tls_attachment.txt")))
            .unwrap();
        assert_eq!(
            html.date.unwrap().date,
            NaiveDate::from_ymd_opt(2026, 1, 25).unwrap()
        );
        assert_eq!(html.link.as_deref(), Some("https://tlsvisa.com/confirm/7Q2X"));
        assert_eq!(html.context.labels, vec!["SPAM"]);

        assert!(parser
            .parse(&fixture("4", include_str!("../../fixtures/sample_tls_email_3.txt")))
            .is_err());
        assert_eq!(
            parser.parse(&fixture(
                "5",
                include_str!("../../fixtures/newsletter_other_sender.txt")
            )),
            Err(NotAnAppointment::SenderNotAllowed)
        );
    }
}
