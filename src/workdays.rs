use chrono::{Datelike, NaiveDate, Weekday};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkdayError {
    #[error("month must be between 1 and 12, got {0}")]
    InvalidMonth(u32),
    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("invalid month key '{0}', expected YYYY-MM")]
    InvalidMonthKey(String),
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, WorkdayError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| WorkdayError::InvalidDate(raw.to_string()))
}

/// Parses `YYYY-MM` into (year, 1-indexed month).
pub fn parse_month_key(raw: &str) -> Result<(i32, u32), WorkdayError> {
    let t = raw.trim();
    let bad = || WorkdayError::InvalidMonthKey(raw.to_string());
    let (y, m) = t.split_once('-').ok_or_else(bad)?;
    let year = y.parse::<i32>().map_err(|_| bad())?;
    let month = m.parse::<u32>().map_err(|_| bad())?;
    if !(1..=12).contains(&month) {
        return Err(WorkdayError::InvalidMonth(month));
    }
    Ok((year, month))
}

pub fn month_bounds(year: i32, month: u32) -> Result<(NaiveDate, NaiveDate), WorkdayError> {
    let first =
        NaiveDate::from_ymd_opt(year, month, 1).ok_or(WorkdayError::InvalidMonth(month))?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or(WorkdayError::InvalidMonth(month))?;
    let last = next.pred_opt().ok_or(WorkdayError::InvalidMonth(month))?;
    Ok((first, last))
}

fn is_weekend(d: NaiveDate) -> bool {
    matches!(d.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Counts the working days of a month.
///
/// Mon–Fri count unless listed in `holidays`. Saturdays and Sundays count only when
/// one of `attendance_dates` falls on them.
pub fn count_workdays<I>(
    year: i32,
    month: u32,
    holidays: &HashSet<NaiveDate>,
    attendance_dates: I,
) -> Result<u32, WorkdayError>
where
    I: IntoIterator<Item = NaiveDate>,
{
    let (first, last) = month_bounds(year, month)?;
    let recorded_weekends: HashSet<NaiveDate> = attendance_dates
        .into_iter()
        .filter(|d| *d >= first && *d <= last && is_weekend(*d))
        .collect();

    let mut count = 0u32;
    let mut day = first;
    loop {
        let counts = if is_weekend(day) {
            recorded_weekends.contains(&day)
        } else {
            !holidays.contains(&day)
        };
        if counts {
            count += 1;
        }
        if day == last {
            break;
        }
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).expect("valid date")
    }

    #[test]
    fn february_2024_has_21_weekdays() {
        let n = count_workdays(2024, 2, &HashSet::new(), Vec::new()).expect("count");
        assert_eq!(n, 21);
    }

    #[test]
    fn weekend_attendance_adds_exactly_one() {
        let base = count_workdays(2024, 2, &HashSet::new(), Vec::new()).expect("count");
        // 2024-02-03 is a Saturday.
        let with_saturday =
            count_workdays(2024, 2, &HashSet::new(), vec![d(2024, 2, 3), d(2024, 2, 3)])
                .expect("count");
        assert_eq!(with_saturday, base + 1);
    }

    #[test]
    fn weekday_attendance_does_not_double_count() {
        let base = count_workdays(2024, 2, &HashSet::new(), Vec::new()).expect("count");
        let n = count_workdays(2024, 2, &HashSet::new(), vec![d(2024, 2, 5)]).expect("count");
        assert_eq!(n, base);
    }

    #[test]
    fn holidays_remove_weekdays_only() {
        let holidays: HashSet<NaiveDate> = [d(2024, 2, 8), d(2024, 2, 10)].into_iter().collect();
        let n = count_workdays(2024, 2, &holidays, vec![d(2024, 2, 10)]).expect("count");
        // Thursday the 8th is dropped; Saturday the 10th counts through attendance.
        assert_eq!(n, 21);
    }

    #[test]
    fn attendance_outside_month_is_ignored() {
        let n = count_workdays(2024, 2, &HashSet::new(), vec![d(2024, 3, 2)]).expect("count");
        assert_eq!(n, 21);
    }

    #[test]
    fn december_rolls_into_next_year() {
        // December 2023: 1st is a Friday, 31 days.
        let n = count_workdays(2023, 12, &HashSet::new(), Vec::new()).expect("count");
        assert_eq!(n, 21);
    }

    #[test]
    fn invalid_month_is_rejected() {
        assert_eq!(
            count_workdays(2024, 13, &HashSet::new(), Vec::new()),
            Err(WorkdayError::InvalidMonth(13))
        );
        assert!(parse_month_key("2024-00").is_err());
        assert!(parse_month_key("2024/02").is_err());
        assert_eq!(parse_month_key("2024-02"), Ok((2024, 2)));
    }
}
