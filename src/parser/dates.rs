//! Locale-aware date recognition.
//!
//! Every recognizer reports candidates with their byte offsets in the
//! searched text; the earliest candidate wins, the longer one on a tie.
//! Missing years, relative words and weekday expressions are resolved
//! against the date the message was received, never the current clock.

use super::{AppointmentDate, Locale, NumericDateOrder};
use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Weekday};
use lazy_static::lazy_static;
use regex::{Captures, Regex};

const FR_MONTHS: &str = "janvier|février|fevrier|mars|avril|mai|juin|juillet|août|aout|septembre|octobre|novembre|décembre|decembre|janv|févr|fevr|avr|juil|sept|oct|nov|déc|dec";
const FR_WEEKDAYS: &str = "lundi|mardi|mercredi|jeudi|vendredi|samedi|dimanche";
const EN_MONTHS: &str = "january|february|march|april|may|june|july|august|september|october|november|december|jan|feb|mar|apr|jun|jul|aug|sept|sep|oct|nov|dec";
const EN_WEEKDAYS: &str = "monday|tuesday|wednesday|thursday|friday|saturday|sunday|mon|tues|tue|wed|thurs|thur|thu|fri|sat|sun";

/// Longest gap between a date and the time of day that belongs to it.
const TIME_LOOKAHEAD_CHARS: usize = 24;

lazy_static! {
    static ref NUMERIC_DATE: Regex =
        Regex::new(r"\b(\d{1,2})([/.\-])(\d{1,2})([/.\-])(\d{4}|\d{2})\b").unwrap();
    static ref ISO_DATE: Regex = Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})(?:T|\b)").unwrap();
    static ref FR_DATE: Regex = Regex::new(&format!(
        r"(?i)\b(?:(?:{FR_WEEKDAYS})\s+)?(?P<day>[0-3]?\d)(?:er)?\s+(?P<month>{FR_MONTHS})\b\.?(?:\s+(?P<year>\d{{4}})\b)?"
    ))
    .unwrap();
    static ref FR_RELATIVE: Regex = Regex::new(&format!(
        r"(?i)\b(?:(?P<word>aujourd'hui|après-demain|apres-demain|demain)|(?P<weekday>{FR_WEEKDAYS})\s+prochain)\b"
    ))
    .unwrap();
    static ref EN_DAY_MONTH: Regex = Regex::new(&format!(
        r"(?i)\b(?:(?:{EN_WEEKDAYS})\.?,?\s+)?(?:the\s+)?(?P<day>[0-3]?\d)(?:st|nd|rd|th)?(?:\s+of)?\s+(?P<month>{EN_MONTHS})\b\.?(?:,?\s+(?P<year>\d{{4}})\b)?"
    ))
    .unwrap();
    static ref EN_MONTH_DAY: Regex = Regex::new(&format!(
        r"(?i)\b(?:(?:{EN_WEEKDAYS})\.?,?\s+)?(?P<month>{EN_MONTHS})\b\.?\s+(?P<day>[0-3]?\d)(?:st|nd|rd|th)?\b(?:,?\s+(?P<year>\d{{4}})\b)?"
    ))
    .unwrap();
    static ref EN_RELATIVE: Regex = Regex::new(&format!(
        r"(?i)\b(?:(?P<word>today|tomorrow)|next\s+(?P<weekday>{EN_WEEKDAYS}))\b"
    ))
    .unwrap();
    static ref TIME_OF_DAY: Regex = Regex::new(
        r"(?i)^[\s,]*(?:(?:à|a|at|@|from|de|dès|des|-|–)\s*)?(?:(?P<h1>[01]?\d|2[0-3])\s*[h:]\s*(?P<m1>[0-5]\d)?(?:\s*(?P<ap1>am|pm))?|(?P<h2>1[0-2]|0?[1-9])\s*(?P<ap2>am|pm))\b"
    )
    .unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateCandidate {
    pub start: usize,
    pub end: usize,
    pub date: AppointmentDate,
}

pub struct DateExtractor {
    locales: Vec<Locale>,
    numeric_order: NumericDateOrder,
}

impl DateExtractor {
    pub fn new(locales: &[Locale], numeric_order: NumericDateOrder) -> Self {
        Self {
            locales: locales.to_vec(),
            numeric_order,
        }
    }

    /// Locale attached to locale-neutral (numeric) matches.
    fn default_locale(&self) -> Locale {
        self.locales.first().copied().unwrap_or(Locale::French)
    }

    /// First recognized date in document order.
    pub fn extract(&self, text: &str, received: NaiveDate) -> Option<AppointmentDate> {
        self.candidates(text, received)
            .into_iter()
            .next()
            .map(|candidate| candidate.date)
    }

    /// All valid candidates, ordered by position then by descending length.
    pub fn candidates(&self, text: &str, received: NaiveDate) -> Vec<DateCandidate> {
        let mut found = Vec::new();

        self.collect_numeric(text, &mut found);
        for locale in &self.locales {
            match locale {
                Locale::French => {
                    self.collect_textual(&FR_DATE, Locale::French, text, received, &mut found);
                    self.collect_relative(&FR_RELATIVE, Locale::French, text, received, &mut found);
                }
                Locale::English => {
                    self.collect_textual(&EN_DAY_MONTH, Locale::English, text, received, &mut found);
                    self.collect_textual(&EN_MONTH_DAY, Locale::English, text, received, &mut found);
                    self.collect_relative(&EN_RELATIVE, Locale::English, text, received, &mut found);
                }
            }
        }

        let lowest_year = received.year() - 1;
        let highest_year = received.year() + 2;
        found.retain(|c| (lowest_year..=highest_year).contains(&c.date.date.year()));

        // Stable sort keeps recognizer order for identical spans.
        found.sort_by(|a, b| a.start.cmp(&b.start).then((b.end - b.start).cmp(&(a.end - a.start))));
        found
    }

    fn collect_numeric(&self, text: &str, found: &mut Vec<DateCandidate>) {
        for caps in NUMERIC_DATE.captures_iter(text) {
            if caps[2] != caps[4] {
                continue;
            }
            let first: u32 = caps[1].parse().unwrap_or(0);
            let second: u32 = caps[3].parse().unwrap_or(0);
            let (day, month) = match self.numeric_order {
                NumericDateOrder::DayFirst => (first, second),
                NumericDateOrder::MonthFirst => (second, first),
            };
            let year = expand_year(&caps[5]);
            if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                self.push(found, &caps, date, self.default_locale(), text);
            }
        }

        for caps in ISO_DATE.captures_iter(text) {
            let year: i32 = caps[1].parse().unwrap_or(0);
            let month: u32 = caps[2].parse().unwrap_or(0);
            let day: u32 = caps[3].parse().unwrap_or(0);
            if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                self.push(found, &caps, date, self.default_locale(), text);
            }
        }
    }

    fn collect_textual(
        &self,
        pattern: &Regex,
        locale: Locale,
        text: &str,
        received: NaiveDate,
        found: &mut Vec<DateCandidate>,
    ) {
        for caps in pattern.captures_iter(text) {
            let Some(month) = month_number(&caps["month"], locale) else {
                continue;
            };
            let Ok(day) = caps["day"].parse::<u32>() else {
                continue;
            };
            let date = match caps.name("year") {
                Some(year) => year
                    .as_str()
                    .parse::<i32>()
                    .ok()
                    .and_then(|y| NaiveDate::from_ymd_opt(y, month, day)),
                None => next_occurrence(month, day, received),
            };
            if let Some(date) = date {
                self.push(found, &caps, date, locale, text);
            }
        }
    }

    fn collect_relative(
        &self,
        pattern: &Regex,
        locale: Locale,
        text: &str,
        received: NaiveDate,
        found: &mut Vec<DateCandidate>,
    ) {
        for caps in pattern.captures_iter(text) {
            let date = if let Some(word) = caps.name("word") {
                let offset = match word.as_str().to_lowercase().as_str() {
                    "aujourd'hui" | "today" => 0,
                    "demain" | "tomorrow" => 1,
                    _ => 2,
                };
                received + Duration::days(offset)
            } else if let Some(weekday) = caps.name("weekday").and_then(|w| weekday_of(w.as_str())) {
                next_weekday(received, weekday)
            } else {
                continue;
            };
            self.push(found, &caps, date, locale, text);
        }
    }

    fn push(
        &self,
        found: &mut Vec<DateCandidate>,
        caps: &Captures,
        date: NaiveDate,
        locale: Locale,
        text: &str,
    ) {
        let Some(whole) = caps.get(0) else {
            return;
        };
        let (time, end) = match time_after(text, whole.end()) {
            Some((time, time_end)) => (Some(time), time_end),
            None => (None, whole.end()),
        };
        found.push(DateCandidate {
            start: whole.start(),
            end,
            date: AppointmentDate {
                date,
                time,
                locale,
                raw: text[whole.start()..end].trim().to_string(),
            },
        });
    }
}

fn expand_year(raw: &str) -> i32 {
    let year: i32 = raw.parse().unwrap_or(0);
    if raw.len() == 2 {
        2000 + year
    } else {
        year
    }
}

fn month_number(name: &str, locale: Locale) -> Option<u32> {
    let lower = name.to_lowercase();
    let month = match locale {
        Locale::French => match lower.as_str() {
            "janvier" | "janv" => 1,
            "février" | "fevrier" | "févr" | "fevr" => 2,
            "mars" => 3,
            "avril" | "avr" => 4,
            "mai" => 5,
            "juin" => 6,
            "juillet" | "juil" => 7,
            "août" | "aout" => 8,
            "septembre" | "sept" => 9,
            "octobre" | "oct" => 10,
            "novembre" | "nov" => 11,
            "décembre" | "decembre" | "déc" | "dec" => 12,
            _ => return None,
        },
        Locale::English => match lower.as_str() {
            "january" | "jan" => 1,
            "february" | "feb" => 2,
            "march" | "mar" => 3,
            "april" | "apr" => 4,
            "may" => 5,
            "june" | "jun" => 6,
            "july" | "jul" => 7,
            "august" | "aug" => 8,
            "september" | "sept" | "sep" => 9,
            "october" | "oct" => 10,
            "november" | "nov" => 11,
            "december" | "dec" => 12,
            _ => return None,
        },
    };
    Some(month)
}

fn weekday_of(name: &str) -> Option<Weekday> {
    let weekday = match name.to_lowercase().as_str() {
        "lundi" | "monday" | "mon" => Weekday::Mon,
        "mardi" | "tuesday" | "tues" | "tue" => Weekday::Tue,
        "mercredi" | "wednesday" | "wed" => Weekday::Wed,
        "jeudi" | "thursday" | "thurs" | "thur" | "thu" => Weekday::Thu,
        "vendredi" | "friday" | "fri" => Weekday::Fri,
        "samedi" | "saturday" | "sat" => Weekday::Sat,
        "dimanche" | "sunday" | "sun" => Weekday::Sun,
        _ => return None,
    };
    Some(weekday)
}

/// First `month`/`day` on or after `received`.
fn next_occurrence(month: u32, day: u32, received: NaiveDate) -> Option<NaiveDate> {
    let this_year = NaiveDate::from_ymd_opt(received.year(), month, day);
    match this_year {
        Some(date) if date >= received => Some(date),
        _ => NaiveDate::from_ymd_opt(received.year() + 1, month, day),
    }
}

/// First `weekday` strictly after `received`.
fn next_weekday(received: NaiveDate, weekday: Weekday) -> NaiveDate {
    let current = received.weekday().num_days_from_monday() as i64;
    let target = weekday.num_days_from_monday() as i64;
    let mut delta = (target - current).rem_euclid(7);
    if delta == 0 {
        delta = 7;
    }
    received + Duration::days(delta)
}

/// Time of day directly following a date, with the byte offset where it ends.
fn time_after(text: &str, from: usize) -> Option<(NaiveTime, usize)> {
    let rest = &text[from..];
    let window_end = rest
        .char_indices()
        .nth(TIME_LOOKAHEAD_CHARS)
        .map_or(rest.len(), |(idx, _)| idx);
    let window = &rest[..window_end];

    let caps = TIME_OF_DAY.captures(window)?;
    let (hour, minute, meridiem) = if let Some(h) = caps.name("h1") {
        (
            h.as_str().parse::<u32>().ok()?,
            caps.name("m1").map_or(Some(0), |m| m.as_str().parse().ok())?,
            caps.name("ap1"),
        )
    } else {
        (caps.name("h2")?.as_str().parse::<u32>().ok()?, 0, caps.name("ap2"))
    };

    let hour = match meridiem.map(|m| m.as_str().to_lowercase()) {
        Some(m) if m == "pm" && hour < 12 => hour + 12,
        Some(m) if m == "am" && hour == 12 => 0,
        Some(_) if hour > 12 => return None,
        _ => hour,
    };

    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
    Some((time, from + caps.get(0)?.end()))
}
