use std::str::FromStr;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// When a periodic handler fires. Evaluated once per minute by the
/// scheduler tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", content = "data")]
pub enum PeriodicSchedule {
    /// A cron string of the format
    /// second   minute   hour   day-of-month   month   day-of-week   year
    Cron(String),
}

impl PeriodicSchedule {
    pub fn next_run(&self) -> Result<Option<DateTime<Utc>>, Error> {
        match self {
            Self::Cron(c) => {
                let schedule = cron::Schedule::from_str(c.as_str())?;
                Ok(schedule.upcoming(Utc).next())
            }
        }
    }

    /// Whether the schedule fires during the minute containing `now`.
    /// Sub-minute precision is ignored; the tick only asks on minute
    /// boundaries.
    pub fn matches(&self, now: DateTime<Utc>) -> Result<bool, Error> {
        let minute = now
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);
        match self {
            Self::Cron(c) => {
                let schedule = cron::Schedule::from_str(c.as_str())?;
                Ok(schedule.includes(minute))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Duration, TimeZone};

    fn cron_for_date(date: &DateTime<Utc>) -> PeriodicSchedule {
        let cron = format!(
            "0 {} {} {} {} * *",
            date.minute(),
            date.hour(),
            date.day(),
            date.month()
        );

        PeriodicSchedule::Cron(cron)
    }

    #[test]
    fn matches_only_its_minute() {
        let at = Utc.ymd(2037, 3, 14).and_hms(9, 26, 0);
        let schedule = cron_for_date(&at);

        assert!(schedule.matches(at).unwrap());
        // Sub-minute offsets still match.
        assert!(schedule.matches(at + Duration::seconds(30)).unwrap());
        assert!(!schedule.matches(at + Duration::minutes(1)).unwrap());
        assert!(!schedule.matches(at - Duration::minutes(1)).unwrap());
    }

    #[test]
    fn next_run_is_in_the_future() {
        let schedule = PeriodicSchedule::Cron("0 * * * * * *".to_string());
        let next = schedule.next_run().unwrap().unwrap();
        assert!(next > Utc::now());
    }

    #[test]
    fn invalid_expression_is_rejected() {
        let schedule = PeriodicSchedule::Cron("not a cron line".to_string());
        assert!(schedule.matches(Utc::now()).is_err());
    }
}
