//! Schedule expression evaluator.
//!
//! Three expression forms:
//! - standard 5-field cron (`minute hour day-of-month month day-of-week`),
//! - `@every <duration>` (e.g. `@every 90s`, `@every 1h30m`),
//! - an RFC3339 instant for one-shot schedules.
//!
//! All evaluation is in UTC.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

use visor_domain::error::{Error, Result};

/// A parsed schedule expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    Cron(String),
    Every(Duration),
    At(DateTime<Utc>),
}

/// Parse a schedule expression string.
pub fn parse_expression(s: &str) -> Result<Expression> {
    let trimmed = s.trim();
    if let Some(rest) = trimmed.strip_prefix("@every") {
        let duration = parse_duration(rest.trim())?;
        if duration <= Duration::zero() {
            return Err(Error::Config(format!("@every duration must be positive: {s}")));
        }
        return Ok(Expression::Every(duration));
    }
    if let Ok(instant) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(Expression::At(instant.with_timezone(&Utc)));
    }
    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    if fields.len() == 5 && fields.iter().all(|f| field_is_valid(f)) {
        return Ok(Expression::Cron(trimmed.to_string()));
    }
    Err(Error::Config(format!("invalid schedule expression: {s}")))
}

/// Compute the next fire time after `after`.
///
/// For `@every`, the cadence anchors on `last_run` when present, else on
/// `after`. A one-shot instant fires once: `None` after any run, or when
/// the instant itself has been consumed.
pub fn next_fire(
    expr: &Expression,
    after: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match expr {
        Expression::Cron(cron) => cron_next(cron, &after),
        Expression::Every(duration) => {
            let anchor = last_run.unwrap_or(after);
            Some(anchor + *duration)
        }
        Expression::At(instant) => {
            if last_run.is_some() {
                None
            } else {
                Some(*instant)
            }
        }
    }
}

/// Parse compound durations: `90s`, `5m`, `2h`, `1d`, `1h30m`.
fn parse_duration(s: &str) -> Result<Duration> {
    if s.is_empty() {
        return Err(Error::Config("@every requires a duration".into()));
    }
    let mut total = Duration::zero();
    let mut digits = String::new();
    for ch in s.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let value: i64 = digits
            .parse()
            .map_err(|_| Error::Config(format!("invalid duration: {s}")))?;
        digits.clear();
        total = total
            + match ch {
                's' => Duration::seconds(value),
                'm' => Duration::minutes(value),
                'h' => Duration::hours(value),
                'd' => Duration::days(value),
                other => {
                    return Err(Error::Config(format!(
                        "invalid duration unit '{other}' in: {s}"
                    )))
                }
            };
    }
    if !digits.is_empty() {
        return Err(Error::Config(format!("duration missing unit: {s}")));
    }
    Ok(total)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cron matching
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse a cron field and check if a value matches.
fn cron_field_matches(field: &str, value: u32) -> bool {
    if field == "*" {
        return true;
    }
    if let Some(step) = field.strip_prefix("*/") {
        if let Ok(n) = step.parse::<u32>() {
            return n > 0 && value % n == 0;
        }
    }
    for part in field.split(',') {
        if let Some((start_s, end_s)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start_s.parse::<u32>(), end_s.parse::<u32>()) {
                if value >= start && value <= end {
                    return true;
                }
            }
        } else if let Ok(n) = part.parse::<u32>() {
            if value == n {
                return true;
            }
        }
    }
    false
}

/// Field syntax check, used at parse time so bad expressions fail fast.
fn field_is_valid(field: &str) -> bool {
    if field == "*" {
        return true;
    }
    if let Some(step) = field.strip_prefix("*/") {
        return step.parse::<u32>().map(|n| n > 0).unwrap_or(false);
    }
    field.split(',').all(|part| {
        if let Some((start, end)) = part.split_once('-') {
            start.parse::<u32>().is_ok() && end.parse::<u32>().is_ok()
        } else {
            part.parse::<u32>().is_ok()
        }
    })
}

/// Check if a UTC datetime matches a 5-field cron expression.
pub fn cron_matches(cron: &str, dt: &DateTime<Utc>) -> bool {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    cron_field_matches(fields[0], dt.minute())
        && cron_field_matches(fields[1], dt.hour())
        && cron_field_matches(fields[2], dt.day())
        && cron_field_matches(fields[3], dt.month())
        && cron_field_matches(fields[4], dt.weekday().num_days_from_sunday())
}

/// Next occurrence strictly after `after`, scanning by whole minutes for
/// at most one year.
pub fn cron_next(cron: &str, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next_min_secs = 60 - (after.second() as i64);
    let mut candidate = *after + Duration::seconds(next_min_secs);
    candidate = candidate.with_second(0).unwrap_or(candidate);
    candidate = candidate.with_nanosecond(0).unwrap_or(candidate);

    let max_checks = 366 * 24 * 60;
    for _ in 0..max_checks {
        if cron_matches(cron, &candidate) {
            return Some(candidate);
        }
        candidate += Duration::minutes(1);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, h, m, 0).unwrap()
    }

    #[test]
    fn parse_cron_expression() {
        assert_eq!(
            parse_expression("*/5 * * * *").unwrap(),
            Expression::Cron("*/5 * * * *".into())
        );
        assert!(parse_expression("* * * *").is_err());
        assert!(parse_expression("banana hour * * *").is_err());
    }

    #[test]
    fn parse_every_expression() {
        assert_eq!(
            parse_expression("@every 5m").unwrap(),
            Expression::Every(Duration::minutes(5))
        );
        assert_eq!(
            parse_expression("@every 1h30m").unwrap(),
            Expression::Every(Duration::minutes(90))
        );
        assert_eq!(
            parse_expression("@every 90s").unwrap(),
            Expression::Every(Duration::seconds(90))
        );
        assert!(parse_expression("@every").is_err());
        assert!(parse_expression("@every 5").is_err());
        assert!(parse_expression("@every 5x").is_err());
    }

    #[test]
    fn parse_rfc3339_instant() {
        let e = parse_expression("2024-06-15T11:00:00Z").unwrap();
        assert_eq!(e, Expression::At(at(11, 0)));
        let offset = parse_expression("2024-06-15T13:00:00+02:00").unwrap();
        assert_eq!(offset, Expression::At(at(11, 0)));
    }

    #[test]
    fn cron_every_5_minutes() {
        assert!(cron_matches("*/5 * * * *", &at(10, 0)));
        assert!(!cron_matches("*/5 * * * *", &at(10, 3)));
    }

    #[test]
    fn cron_specific_time() {
        let dt = Utc.with_ymd_and_hms(2024, 6, 15, 9, 30, 0).unwrap();
        assert!(cron_matches("30 9 * * *", &dt));
        assert!(!cron_matches("30 10 * * *", &dt));
    }

    #[test]
    fn cron_range_and_list() {
        assert!(cron_matches("0 9-17 * * *", &at(10, 0)));
        assert!(!cron_matches("0 9-17 * * *", &at(20, 0)));
        assert!(cron_matches("0,15,30,45 * * * *", &at(10, 15)));
        assert!(!cron_matches("0,15,30,45 * * * *", &at(10, 20)));
    }

    #[test]
    fn cron_weekday_field() {
        // 2024-06-15 is a Saturday (6).
        assert!(cron_matches("0 0 * * 6", &Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap()));
        assert!(!cron_matches("0 0 * * 1", &Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap()));
    }

    #[test]
    fn cron_next_finds_occurrence() {
        let next = cron_next("30 * * * *", &at(10, 0)).unwrap();
        assert_eq!(next, at(10, 30));
        // Strictly after: asking at 10:30 yields 11:30.
        let next = cron_next("30 * * * *", &at(10, 30)).unwrap();
        assert_eq!(next, at(11, 30));
    }

    #[test]
    fn next_fire_every_anchors_on_last_run() {
        let e = Expression::Every(Duration::minutes(10));
        assert_eq!(next_fire(&e, at(10, 0), None), Some(at(10, 10)));
        assert_eq!(next_fire(&e, at(10, 0), Some(at(9, 55))), Some(at(10, 5)));
    }

    #[test]
    fn next_fire_one_shot() {
        let e = Expression::At(at(11, 0));
        assert_eq!(next_fire(&e, at(10, 0), None), Some(at(11, 0)));
        // Consumed after any run.
        assert_eq!(next_fire(&e, at(11, 5), Some(at(11, 0))), None);
    }

    #[test]
    fn next_fire_cron() {
        let e = Expression::Cron("0 12 * * *".into());
        assert_eq!(next_fire(&e, at(10, 0), None), Some(at(12, 0)));
    }
}
