use super::{AppointmentDate, NotAnAppointment};
use crate::domain_utils::DomainUtils;

/// Outcome of the classification pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    NotAnAppointment(NotAnAppointment),
    LowConfidence,
    Confirmed,
}

/// Structured signals extracted from the normalized message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signals {
    pub date: Option<AppointmentDate>,
    pub location: Option<String>,
    pub link: Option<String>,
}

/// What the rules get to look at. `signals` is `None` until the body has
/// been normalized and searched, which only happens once the sender-level
/// rules have let the message through.
#[derive(Debug, Clone, Copy)]
pub struct Evidence<'a> {
    pub sender_domain: Option<&'a str>,
    pub signals: Option<&'a Signals>,
}

pub trait ClassificationRule: Send + Sync {
    /// `None` passes the message on to the next rule.
    fn evaluate(&self, evidence: &Evidence) -> Option<Classification>;
    fn name(&self) -> &str;
}

pub struct SenderAllowList {
    domains: Vec<String>,
}

impl SenderAllowList {
    pub fn new(domains: &[String]) -> Self {
        Self {
            domains: domains.to_vec(),
        }
    }
}

impl ClassificationRule for SenderAllowList {
    fn evaluate(&self, evidence: &Evidence) -> Option<Classification> {
        let allowed = evidence
            .sender_domain
            .is_some_and(|domain| DomainUtils::matches_domain_list(domain, &self.domains));
        if allowed {
            None
        } else {
            Some(Classification::NotAnAppointment(NotAnAppointment::SenderNotAllowed))
        }
    }

    fn name(&self) -> &str {
        "sender_allow_list"
    }
}

pub struct SignalRequired;

impl ClassificationRule for SignalRequired {
    fn evaluate(&self, evidence: &Evidence) -> Option<Classification> {
        let signals = evidence.signals?;
        if signals.date.is_none() && signals.link.is_none() {
            Some(Classification::NotAnAppointment(NotAnAppointment::NoAppointmentSignal))
        } else {
            None
        }
    }

    fn name(&self) -> &str {
        "signal_required"
    }
}

pub struct DateAndLink;

impl ClassificationRule for DateAndLink {
    fn evaluate(&self, evidence: &Evidence) -> Option<Classification> {
        let signals = evidence.signals?;
        (signals.date.is_some() && signals.link.is_some()).then_some(Classification::Confirmed)
    }

    fn name(&self) -> &str {
        "date_and_link"
    }
}

/// Exactly one of date or link.
pub struct SingleSignal {
    emit_low_confidence: bool,
}

impl SingleSignal {
    pub fn new(emit_low_confidence: bool) -> Self {
        Self { emit_low_confidence }
    }
}

impl ClassificationRule for SingleSignal {
    fn evaluate(&self, evidence: &Evidence) -> Option<Classification> {
        evidence.signals?;
        if self.emit_low_confidence {
            Some(Classification::LowConfidence)
        } else {
            Some(Classification::NotAnAppointment(
                NotAnAppointment::LowConfidenceSuppressed,
            ))
        }
    }

    fn name(&self) -> &str {
        "single_signal"
    }
}

pub struct RulePipeline {
    rules: Vec<Box<dyn ClassificationRule>>,
}

impl RulePipeline {
    pub fn new(rules: Vec<Box<dyn ClassificationRule>>) -> Self {
        Self { rules }
    }

    pub fn standard(sender_domains: &[String], emit_low_confidence: bool) -> Self {
        Self::new(vec![
            Box::new(SenderAllowList::new(sender_domains)),
            Box::new(SignalRequired),
            Box::new(DateAndLink),
            Box::new(SingleSignal::new(emit_low_confidence)),
        ])
    }

    /// First decision in rule order, with the name of the rule that made it.
    pub fn classify(&self, evidence: &Evidence) -> Option<(Classification, &str)> {
        self.rules
            .iter()
            .find_map(|rule| rule.evaluate(evidence).map(|c| (c, rule.name())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Locale;
    use chrono::NaiveDate;

    fn date() -> AppointmentDate {
        AppointmentDate {
            date: NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
            time: None,
            locale: Locale::French,
            raw: "14 mars 2025".to_string(),
        }
    }

    fn pipeline(emit_low_confidence: bool) -> RulePipeline {
        RulePipeline::standard(&["tlscontact.com".to_string()], emit_low_confidence)
    }

    #[test]
    fn test_sender_rule_decides_without_signals() {
        let evidence = Evidence {
            sender_domain: Some("example.com"),
            signals: None,
        };
        let pipeline = pipeline(true);
        let (classification, rule) = pipeline.classify(&evidence).unwrap();
        assert_eq!(
            classification,
            Classification::NotAnAppointment(NotAnAppointment::SenderNotAllowed)
        );
        assert_eq!(rule, "sender_allow_list");
    }

    #[test]
    fn test_allowed_sender_is_undecided_until_signals_exist() {
        let evidence = Evidence {
            sender_domain: Some("mail.tlscontact.com"),
            signals: None,
        };
        assert!(pipeline(true).classify(&evidence).is_none());
    }

    #[test]
    fn test_signal_combinations() {
        let cases = [
            (Some(date()), Some("https://tlscontact.com/x".to_string()), true, Classification::Confirmed),
            (Some(date()), None, true, Classification::LowConfidence),
            (None, Some("https://tlscontact.com/x".to_string()), true, Classification::LowConfidence),
            (
                Some(date()),
                None,
                false,
                Classification::NotAnAppointment(NotAnAppointment::LowConfidenceSuppressed),
            ),
            (
                None,
                None,
                true,
                Classification::NotAnAppointment(NotAnAppointment::NoAppointmentSignal),
            ),
        ];

        for (date, link, emit, expected) in cases {
            let signals = Signals {
                date,
                location: None,
                link,
            };
            let evidence = Evidence {
                sender_domain: Some("tlscontact.com"),
                signals: Some(&signals),
            };
            let (classification, _) = pipeline(emit).classify(&evidence).unwrap();
            assert_eq!(classification, expected);
        }
    }
}
