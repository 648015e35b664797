//! Call Detail Record (CDR) - one row per call attempt

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Call direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
    Internal,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Inbound => "inbound",
            CallDirection::Outbound => "outbound",
            CallDirection::Internal => "internal",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(CallDirection::Inbound),
            "outbound" => Some(CallDirection::Outbound),
            "internal" => Some(CallDirection::Internal),
            _ => None,
        }
    }
}

/// Final disposition of a call attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Answered,
    NoAnswer,
    Busy,
    Failed,
    Cancelled,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Answered => "answered",
            Disposition::NoAnswer => "no_answer",
            Disposition::Busy => "busy",
            Disposition::Failed => "failed",
            Disposition::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "answered" => Some(Disposition::Answered),
            "no_answer" => Some(Disposition::NoAnswer),
            "busy" => Some(Disposition::Busy),
            "failed" => Some(Disposition::Failed),
            "cancelled" => Some(Disposition::Cancelled),
            _ => None,
        }
    }
}

/// Call Detail Record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: i64,
    /// SIP Call-ID
    pub call_id: String,
    pub direction: CallDirection,
    pub caller_id_name: Option<String>,
    pub caller_id_number: String,
    /// Dialled string (DID, extension number, or group label)
    pub callee: String,
    pub trunk_id: Option<i64>,
    pub start_time: DateTime<Utc>,
    pub answer_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// end - start, seconds
    pub duration_secs: Option<i64>,
    /// end - answer when answered, else 0
    pub billable_secs: Option<i64>,
    pub disposition: Disposition,
    pub hangup_cause: Option<String>,
    pub recording_file: Option<String>,
    /// Node ids visited through the flow, in order
    pub flow_path: Vec<String>,
}

impl CallRecord {
    pub fn new(
        call_id: String,
        direction: CallDirection,
        caller_id_name: Option<String>,
        caller_id_number: String,
        callee: String,
        trunk_id: Option<i64>,
    ) -> Self {
        Self {
            id: 0,
            call_id,
            direction,
            caller_id_name,
            caller_id_number,
            callee,
            trunk_id,
            start_time: Utc::now(),
            answer_time: None,
            end_time: None,
            duration_secs: None,
            billable_secs: None,
            disposition: Disposition::Failed,
            hangup_cause: None,
            recording_file: None,
            flow_path: Vec::new(),
        }
    }

    pub fn mark_answered(&mut self) {
        if self.answer_time.is_none() {
            self.answer_time = Some(Utc::now());
        }
    }

    /// Close the record. Timestamps are clamped so that
    /// start <= answer <= end always holds.
    pub fn mark_ended(&mut self, disposition: Disposition, cause: Option<String>) {
        let now = Utc::now().max(self.start_time);
        if let Some(answer) = self.answer_time {
            if answer < self.start_time {
                self.answer_time = Some(self.start_time);
            }
        }
        let end = match self.answer_time {
            Some(answer) => now.max(answer),
            None => now,
        };
        self.end_time = Some(end);
        self.duration_secs = Some((end - self.start_time).num_seconds());
        self.billable_secs = Some(match self.answer_time {
            Some(answer) if disposition == Disposition::Answered => (end - answer).num_seconds(),
            _ => 0,
        });
        self.disposition = disposition;
        self.hangup_cause = cause;
    }

    pub fn push_flow_node(&mut self, node_id: &str) {
        self.flow_path.push(node_id.to_string());
    }
}

/// Query filters for CDR listings
#[derive(Debug, Clone, Default)]
pub struct CdrFilters {
    pub direction: Option<CallDirection>,
    pub disposition: Option<Disposition>,
    pub start_from: Option<DateTime<Utc>>,
    pub start_to: Option<DateTime<Utc>>,
}

/// Repository for CDRs
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait CdrRepository: Send + Sync {
    async fn create(&self, record: &CallRecord) -> crate::Result<CallRecord>;

    async fn get_by_call_id(&self, call_id: &str) -> crate::Result<Option<CallRecord>>;

    async fn list(
        &self,
        filters: CdrFilters,
        limit: i64,
        offset: i64,
    ) -> crate::Result<Vec<CallRecord>>;

    async fn count_by_direction(&self, direction: CallDirection) -> crate::Result<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> CallRecord {
        CallRecord::new(
            "abc@skylark".into(),
            CallDirection::Inbound,
            None,
            "0400000000".into(),
            "5551000".into(),
            Some(1),
        )
    }

    #[test]
    fn test_answered_lifecycle() {
        let mut cdr = record();
        cdr.mark_answered();
        cdr.mark_ended(Disposition::Answered, None);

        let start = cdr.start_time;
        let answer = cdr.answer_time.unwrap();
        let end = cdr.end_time.unwrap();
        assert!(start <= answer && answer <= end);
        assert_eq!(cdr.duration_secs, Some((end - start).num_seconds()));
        assert_eq!(cdr.billable_secs, Some((end - answer).num_seconds()));
        assert_eq!(cdr.disposition, Disposition::Answered);
    }

    #[test]
    fn test_unanswered_has_zero_billable() {
        let mut cdr = record();
        cdr.mark_ended(Disposition::NoAnswer, Some("no_answer".into()));
        assert!(cdr.answer_time.is_none());
        assert_eq!(cdr.billable_secs, Some(0));
        assert_eq!(cdr.disposition, Disposition::NoAnswer);
    }

    #[test]
    fn test_flow_path_accumulates() {
        let mut cdr = record();
        cdr.push_flow_node("n1");
        cdr.push_flow_node("n2");
        cdr.push_flow_node("n3");
        assert_eq!(cdr.flow_path, vec!["n1", "n2", "n3"]);
    }

    #[test]
    fn test_disposition_strings() {
        assert_eq!(Disposition::NoAnswer.as_str(), "no_answer");
        assert_eq!(Disposition::from_str("busy"), Some(Disposition::Busy));
        assert_eq!(Disposition::from_str("rejected"), None);
    }
}
