//! Telegram HTML rendering of appointment alerts.

use crate::parser::{AppointmentDate, AppointmentRecord, Confidence, Locale};
use chrono::{Datelike, Weekday};

const CONFIRMED_HEADER: &str = "🚨 <b>RENDEZ-VOUS CONFIRMÉ / APPOINTMENT CONFIRMED</b>";
const UPDATE_HEADER: &str = "🔔 <b>TLScontact update</b>";

/// Escape text for Telegram's HTML parse mode.
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

pub fn render_alert(record: &AppointmentRecord) -> String {
    let mut lines = Vec::new();

    let labels = &record.context.labels;
    if labels.iter().any(|l| l.eq_ignore_ascii_case("SPAM")) {
        lines.push("⚠️ <b>Found in spam:</b>".to_string());
    } else if labels.iter().any(|l| l.eq_ignore_ascii_case("TRASH")) {
        lines.push("🗑️ <b>Found in trash:</b>".to_string());
    }

    lines.push(
        match record.confidence {
            Confidence::Confirmed => CONFIRMED_HEADER,
            Confidence::LowConfidence => UPDATE_HEADER,
        }
        .to_string(),
    );
    lines.push(String::new());

    match &record.date {
        Some(date) => lines.push(format!(
            "📅 <b>Date:</b> {} (<i>{}</i>)",
            escape_html(&render_date(date)),
            escape_html(&date.raw)
        )),
        None => lines.push("📅 <b>Date:</b> not detected".to_string()),
    }
    if let Some(location) = &record.location {
        lines.push(format!("📍 <b>Location:</b> {}", escape_html(location)));
    }
    lines.push(format!("👤 <b>From:</b> {}", escape_html(&record.context.sender)));
    lines.push(format!("📋 <b>Subject:</b> {}", escape_html(&record.context.subject)));
    if let Some(link) = &record.link {
        lines.push(format!("🔗 <a href=\"{}\">Open portal</a>", escape_html(link)));
    }

    let excerpt = record.context.excerpt.trim();
    if !excerpt.is_empty() {
        lines.push(String::new());
        lines.push(format!("<i>{}</i>", escape_html(excerpt)));
    }

    lines.push(String::new());
    lines.push(format!("<code>ID: {}</code>", escape_html(record.message_id.as_str())));

    lines.join("\n")
}

/// Long-form date in the locale that matched it.
pub fn render_date(date: &AppointmentDate) -> String {
    let day = date.date.day();
    let year = date.date.year();
    let month0 = date.date.month0() as usize;
    let weekday = date.date.weekday();

    let (rendered, joiner) = match date.locale {
        Locale::French => (
            format!(
                "{} {} {} {}",
                french_weekday(weekday),
                if day == 1 { "1er".to_string() } else { day.to_string() },
                FRENCH_MONTHS[month0],
                year
            ),
            "à",
        ),
        Locale::English => (
            format!(
                "{} {} {} {}",
                english_weekday(weekday),
                day,
                ENGLISH_MONTHS[month0],
                year
            ),
            "at",
        ),
    };

    match date.time {
        Some(time) => format!("{rendered} {joiner} {}", time.format("%H:%M")),
        None => rendered,
    }
}

const FRENCH_MONTHS: [&str; 12] = [
    "janvier",
    "février",
    "mars",
    "avril",
    "mai",
    "juin",
    "juillet",
    "août",
    "septembre",
    "octobre",
    "novembre",
    "décembre",
];

const ENGLISH_MONTHS: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

fn french_weekday(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "lundi",
        Weekday::Tue => "mardi",
        Weekday::Wed => "mercredi",
        Weekday::Thu => "jeudi",
        Weekday::Fri => "vendredi",
        Weekday::Sat => "samedi",
        Weekday::Sun => "dimanche",
    }
}

fn english_weekday(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageId;
    use crate::parser::SourceContext;
    use chrono::{NaiveDate, NaiveTime};

    fn record(date: Option<AppointmentDate>, labels: &[&str]) -> AppointmentRecord {
        AppointmentRecord {
            date,
            location: Some("Ambassade <Paris>".to_string()),
            link: Some("https://tlscontact.com/confirm?a=1&b=2".to_string()),
            message_id: MessageId::new("18c2f"),
            confidence: Confidence::Confirmed,
            context: SourceContext {
                sender: "TLScontact <noreply@tlscontact.com>".to_string(),
                subject: "Confirmation".to_string(),
                labels: labels.iter().map(|s| s.to_string()).collect(),
                excerpt: "Votre rendez-vous est confirmé".to_string(),
            },
        }
    }

    fn march_14(locale: Locale, time: Option<NaiveTime>) -> AppointmentDate {
        AppointmentDate {
            date: NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
            time,
            locale,
            raw: "14 mars 2025".to_string(),
        }
    }

    #[test]
    fn test_render_date_by_locale() {
        let ten_thirty = NaiveTime::from_hms_opt(10, 30, 0);
        assert_eq!(
            render_date(&march_14(Locale::French, ten_thirty)),
            "vendredi 14 mars 2025 à 10:30"
        );
        assert_eq!(
            render_date(&march_14(Locale::English, ten_thirty)),
            "Friday 14 March 2025 at 10:30"
        );
        assert_eq!(render_date(&march_14(Locale::French, None)), "vendredi 14 mars 2025");
    }

    #[test]
    fn test_alert_escapes_interpolated_text() {
        let html = render_alert(&record(Some(march_14(Locale::French, None)), &["INBOX"]));

        assert!(html.starts_with(CONFIRMED_HEADER));
        assert!(html.contains("📍 <b>Location:</b> Ambassade &lt;Paris&gt;"));
        assert!(html.contains("👤 <b>From:</b> TLScontact &lt;noreply@tlscontact.com&gt;"));
        assert!(html.contains(r#"<a href="https://tlscontact.com/confirm?a=1&amp;b=2">Open portal</a>"#));
        assert!(html.ends_with("<code>ID: 18c2f</code>"));
    }

    #[test]
    fn test_spam_prefix_and_missing_date() {
        let mut low = record(None, &["SPAM"]);
        low.confidence = Confidence::LowConfidence;

        let html = render_alert(&low);

        assert!(html.starts_with("⚠️ <b>Found in spam:</b>\n🔔 <b>TLScontact update</b>"));
        assert!(html.contains("📅 <b>Date:</b> not detected"));
    }

    #[test]
    fn test_trash_prefix() {
        let html = render_alert(&record(None, &["TRASH"]));
        assert!(html.starts_with("🗑️ <b>Found in trash:</b>"));
    }
}
