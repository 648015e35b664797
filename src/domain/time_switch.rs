//! Time switch - routes calls by wall-clock rules

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// One rule of a time switch. A rule matches when the local weekday is in
/// `days` and the local time falls inside [start, end). Overnight windows
/// (end < start) wrap past midnight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeRule {
    /// Stable id referenced by flow edges as `match_<rule_id>`
    pub id: String,
    pub label: String,
    /// 0 = Monday .. 6 = Sunday
    pub days: Vec<u8>,
    /// "HH:MM" inclusive start
    pub start: String,
    /// "HH:MM" exclusive end
    pub end: String,
}

impl TimeRule {
    fn parse_hhmm(s: &str) -> Option<NaiveTime> {
        let (h, m) = s.split_once(':')?;
        NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)
    }

    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        let weekday = match at.weekday() {
            Weekday::Mon => 0u8,
            Weekday::Tue => 1,
            Weekday::Wed => 2,
            Weekday::Thu => 3,
            Weekday::Fri => 4,
            Weekday::Sat => 5,
            Weekday::Sun => 6,
        };
        if !self.days.contains(&weekday) {
            return false;
        }
        let (start, end) = match (Self::parse_hhmm(&self.start), Self::parse_hhmm(&self.end)) {
            (Some(s), Some(e)) => (s, e),
            _ => return false,
        };
        let now = match NaiveTime::from_hms_opt(at.hour(), at.minute(), 0) {
            Some(t) => t,
            None => return false,
        };
        if start <= end {
            now >= start && now < end
        } else {
            // overnight window, e.g. 22:00-06:00
            now >= start || now < end
        }
    }
}

/// Time switch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSwitch {
    pub id: i64,
    pub name: String,
    /// Rules evaluated in order; first match wins
    pub rules: Vec<TimeRule>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TimeSwitch {
    /// Id of the first matching rule, if any.
    pub fn first_match(&self, at: DateTime<Utc>) -> Option<&str> {
        self.rules
            .iter()
            .find(|r| r.matches(at))
            .map(|r| r.id.as_str())
    }
}

/// Repository for time switches
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait TimeSwitchRepository: Send + Sync {
    async fn create(&self, switch: &TimeSwitch) -> crate::Result<TimeSwitch>;

    async fn update(&self, switch: &TimeSwitch) -> crate::Result<()>;

    async fn delete(&self, id: i64) -> crate::Result<()>;

    async fn get(&self, id: i64) -> crate::Result<Option<TimeSwitch>>;

    async fn list(&self) -> crate::Result<Vec<TimeSwitch>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn business_hours() -> TimeRule {
        TimeRule {
            id: "bh".into(),
            label: "Business hours".into(),
            days: vec![0, 1, 2, 3, 4],
            start: "09:00".into(),
            end: "17:00".into(),
        }
    }

    #[test]
    fn test_rule_matches_weekday_window() {
        let rule = business_hours();
        // Monday 2026-01-05 10:30
        let inside = Utc.with_ymd_and_hms(2026, 1, 5, 10, 30, 0).unwrap();
        assert!(rule.matches(inside));
        // Monday 08:59 - before window
        let before = Utc.with_ymd_and_hms(2026, 1, 5, 8, 59, 0).unwrap();
        assert!(!rule.matches(before));
        // Saturday 10:30 - wrong day
        let weekend = Utc.with_ymd_and_hms(2026, 1, 10, 10, 30, 0).unwrap();
        assert!(!rule.matches(weekend));
        // 17:00 is exclusive
        let boundary = Utc.with_ymd_and_hms(2026, 1, 5, 17, 0, 0).unwrap();
        assert!(!rule.matches(boundary));
    }

    #[test]
    fn test_overnight_window() {
        let rule = TimeRule {
            id: "night".into(),
            label: "After hours".into(),
            days: vec![0, 1, 2, 3, 4, 5, 6],
            start: "22:00".into(),
            end: "06:00".into(),
        };
        let late = Utc.with_ymd_and_hms(2026, 1, 5, 23, 15, 0).unwrap();
        assert!(rule.matches(late));
        let early = Utc.with_ymd_and_hms(2026, 1, 5, 5, 0, 0).unwrap();
        assert!(rule.matches(early));
        let midday = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();
        assert!(!rule.matches(midday));
    }

    #[test]
    fn test_first_match_order() {
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap();
        let switch = TimeSwitch {
            id: 1,
            name: "routing".into(),
            rules: vec![
                business_hours(),
                TimeRule {
                    id: "all".into(),
                    label: "Any time".into(),
                    days: vec![0, 1, 2, 3, 4, 5, 6],
                    start: "00:00".into(),
                    end: "23:59".into(),
                },
            ],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(switch.first_match(now), Some("bh"));
    }
}
