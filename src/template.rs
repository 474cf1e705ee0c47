//! Destination mailbox name resolution
//!
//! A move target is either a literal mailbox name or, when timestamp
//! substitution is enabled, a template whose `%`-delimited segments are
//! Joda-style date patterns rendered from the message's received time:
//! `Archive/%yyyy%/%MM%` becomes `Archive/2024/03`.
//!
//! Segments at even positions are literal, segments at odd positions are
//! patterns. A template with an odd number of `%` leaves the last pattern
//! unterminated; that trailing segment is kept literally, including its `%`.

use chrono::{DateTime, Datelike, FixedOffset, Timelike};

use crate::config::MoveAction;

/// Delimiter around pattern segments
const DELIMITER: char = '%';

/// Resolve the destination mailbox for a message received at `received`
pub fn resolve(action: &MoveAction, received: &DateTime<FixedOffset>) -> String {
    if !action.timestamp {
        return action.template.clone();
    }
    render_template(&action.template, received)
}

/// Expand every `%pattern%` segment of `template`
pub fn render_template(template: &str, at: &DateTime<FixedOffset>) -> String {
    let segments: Vec<&str> = template.split(DELIMITER).collect();
    let unterminated = segments.len() % 2 == 0;
    let last = segments.len() - 1;

    let mut out = String::with_capacity(template.len());
    for (i, segment) in segments.iter().enumerate() {
        if i % 2 == 0 {
            out.push_str(segment);
        } else if unterminated && i == last {
            out.push(DELIMITER);
            out.push_str(segment);
        } else {
            out.push_str(&render_pattern(segment, at));
        }
    }
    out
}

/// Render a Joda-style date pattern
///
/// Letters are pattern fields whose repetition count selects the width or
/// text form; text inside single quotes is literal (`''` is a quote).
/// Letters without a meaning are copied as-is.
pub fn render_pattern(pattern: &str, at: &DateTime<FixedOffset>) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if ch == '\'' {
            i += 1;
            if chars.get(i) == Some(&'\'') {
                out.push('\'');
                i += 1;
                continue;
            }
            while i < chars.len() {
                if chars[i] == '\'' {
                    if chars.get(i + 1) == Some(&'\'') {
                        out.push('\'');
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                out.push(chars[i]);
                i += 1;
            }
        } else if ch.is_ascii_alphabetic() {
            let start = i;
            while i < chars.len() && chars[i] == ch {
                i += 1;
            }
            render_field(&mut out, ch, i - start, at);
        } else {
            out.push(ch);
            i += 1;
        }
    }
    out
}

fn render_field(out: &mut String, letter: char, count: usize, at: &DateTime<FixedOffset>) {
    match letter {
        'G' => out.push_str(if at.year() > 0 { "AD" } else { "BC" }),
        'C' => pad(out, i64::from(at.year() / 100), count),
        'y' | 'Y' => year(out, i64::from(at.year()), count),
        'x' => year(out, i64::from(at.iso_week().year()), count),
        'w' => pad(out, i64::from(at.iso_week().week()), count),
        'e' => pad(out, i64::from(at.weekday().number_from_monday()), count),
        'E' if count >= 4 => out.push_str(&at.format("%A").to_string()),
        'E' => out.push_str(&at.format("%a").to_string()),
        'D' => pad(out, i64::from(at.ordinal()), count),
        'M' if count >= 4 => out.push_str(&at.format("%B").to_string()),
        'M' if count == 3 => out.push_str(&at.format("%b").to_string()),
        'M' => pad(out, i64::from(at.month()), count),
        'd' => pad(out, i64::from(at.day()), count),
        'a' => out.push_str(if at.hour() < 12 { "AM" } else { "PM" }),
        'K' => pad(out, i64::from(at.hour() % 12), count),
        'h' => pad(out, i64::from(at.hour12().1), count),
        'H' => pad(out, i64::from(at.hour()), count),
        'k' => {
            let hour = if at.hour() == 0 { 24 } else { at.hour() };
            pad(out, i64::from(hour), count)
        }
        'm' => pad(out, i64::from(at.minute()), count),
        's' => pad(out, i64::from(at.second()), count),
        'S' => fraction(out, at.nanosecond() % 1_000_000_000, count),
        'Z' if count == 1 => out.push_str(&at.format("%z").to_string()),
        'Z' => out.push_str(&at.format("%:z").to_string()),
        _ => out.extend(std::iter::repeat_n(letter, count)),
    }
}

/// Joda renders `yy` as the two-digit year and every other width as the full
/// year padded to the width.
fn year(out: &mut String, value: i64, count: usize) {
    if count == 2 {
        pad(out, value.rem_euclid(100), 2);
    } else {
        pad(out, value, count);
    }
}

fn pad(out: &mut String, value: i64, width: usize) {
    if value < 0 {
        out.push('-');
    }
    out.push_str(&format!("{:0width$}", value.unsigned_abs()));
}

fn fraction(out: &mut String, nanos: u32, count: usize) {
    let digits = format!("{nanos:09}");
    if count <= digits.len() {
        out.push_str(&digits[..count]);
    } else {
        out.push_str(&digits);
        out.extend(std::iter::repeat_n('0', count - digits.len()));
    }
}
