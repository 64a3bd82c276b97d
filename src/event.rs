use anyhow::{bail, Context, Result};
use chrono::{NaiveDateTime, Utc};
use serde::Deserialize;

/// The two raw event streams the pipeline ingests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TestPaper,
    Question,
}

impl EventKind {
    /// Returns the queue-message `event_type` value this kind accepts.
    pub fn event_type(self) -> &'static str {
        match self {
            Self::TestPaper => "TEST_PAPER_GENERATED",
            Self::Question => "QUESTION_ASKED",
        }
    }

    /// Returns the raw-event table this kind is persisted to.
    pub fn raw_table(self) -> &'static str {
        match self {
            Self::TestPaper => "test_papers",
            Self::Question => "questions_asked",
        }
    }

    /// Returns the rollup table raw rows of this kind are folded into.
    pub fn rollup_table(self) -> &'static str {
        match self {
            Self::TestPaper => "test_papers_monthly",
            Self::Question => "questions_weekly",
        }
    }

    /// Short name used in logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TestPaper => "test_paper",
            Self::Question => "question",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded event ready for persistence.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Idempotency key. Globally unique; duplicate delivery of the same
    /// key must not create a second row.
    pub event_id: String,
    pub user_id: String,
    pub profile_id: String,
    pub class_name: String,
    pub subject: String,
    /// Opaque event payload, stored as serialized JSON.
    pub data: String,
    /// When the event happened (UTC, producer-reported).
    pub event_time: NaiveDateTime,
}

/// Wire format of a queue message body.
#[derive(Debug, Deserialize)]
struct QueueEventBody {
    #[serde(default)]
    event_id: String,
    #[serde(default)]
    event_type: String,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    profile_id: String,
    #[serde(default)]
    class_name: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    timestamp: String,
}

/// Outcome of decoding a single queue message body.
#[derive(Debug)]
pub enum Decoded {
    /// A well-formed event of the expected kind.
    Event(NewEvent),
    /// A well-formed message whose `event_type` this consumer does not
    /// handle. Acknowledged and ignored.
    Ignored(String),
}

/// Decodes a queue message body into an event of the expected kind.
///
/// Returns an error for malformed bodies (invalid JSON, missing
/// idempotency key); those are dropped by the consumer since redelivery
/// cannot fix them. An unknown `event_type` is not an error.
pub fn decode(body: &str, expected: EventKind) -> Result<Decoded> {
    let ev: QueueEventBody = serde_json::from_str(body).context("parsing message body")?;

    if ev.event_type != expected.event_type() {
        return Ok(Decoded::Ignored(ev.event_type));
    }

    if ev.event_id.is_empty() {
        bail!("message has no event_id");
    }

    Ok(Decoded::Event(NewEvent {
        event_id: ev.event_id,
        user_id: ev.user_id,
        profile_id: ev.profile_id,
        class_name: ev.class_name,
        subject: ev.subject,
        data: ev.data.to_string(),
        event_time: parse_timestamp(&ev.timestamp),
    }))
}

/// Parses a producer timestamp, falling back to ingestion time when the
/// field is absent or unparseable (matching upstream producers that omit
/// it).
fn parse_timestamp(raw: &str) -> NaiveDateTime {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return dt.naive_utc();
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return dt;
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return dt;
    }
    Utc::now().naive_utc()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(event_type: &str, event_id: &str) -> String {
        format!(
            r#"{{"event_id":"{event_id}","event_type":"{event_type}",
                "user_id":"u1","profile_id":"p1","class_name":"10",
                "subject":"Math","data":{{"difficulty":"easy"}},
                "timestamp":"2026-08-01T10:30:00Z"}}"#
        )
    }

    #[test]
    fn test_decode_test_paper_event() {
        let decoded =
            decode(&body("TEST_PAPER_GENERATED", "evt-1"), EventKind::TestPaper).expect("decodes");

        match decoded {
            Decoded::Event(ev) => {
                assert_eq!(ev.event_id, "evt-1");
                assert_eq!(ev.class_name, "10");
                assert_eq!(ev.subject, "Math");
                assert_eq!(
                    ev.event_time,
                    NaiveDateTime::parse_from_str("2026-08-01 10:30:00", "%Y-%m-%d %H:%M:%S")
                        .expect("valid")
                );
                assert!(ev.data.contains("difficulty"));
            }
            Decoded::Ignored(t) => panic!("unexpected ignore of {t}"),
        }
    }

    #[test]
    fn test_decode_unknown_event_type_is_ignored() {
        let decoded = decode(&body("SOMETHING_ELSE", "evt-2"), EventKind::Question)
            .expect("well-formed body");
        assert!(matches!(decoded, Decoded::Ignored(t) if t == "SOMETHING_ELSE"));
    }

    #[test]
    fn test_decode_wrong_kind_for_queue_is_ignored() {
        // A test-paper event arriving on the question consumer is ignored,
        // not persisted into the wrong table.
        let decoded = decode(&body("TEST_PAPER_GENERATED", "evt-3"), EventKind::Question)
            .expect("well-formed body");
        assert!(matches!(decoded, Decoded::Ignored(_)));
    }

    #[test]
    fn test_decode_rejects_invalid_json() {
        assert!(decode("not json {", EventKind::TestPaper).is_err());
    }

    #[test]
    fn test_decode_rejects_missing_event_id() {
        let raw = r#"{"event_type":"QUESTION_ASKED","user_id":"u1"}"#;
        assert!(decode(raw, EventKind::Question).is_err());
    }

    #[test]
    fn test_parse_timestamp_fallback() {
        let before = Utc::now().naive_utc();
        let parsed = parse_timestamp("garbage");
        let after = Utc::now().naive_utc();
        assert!(parsed >= before && parsed <= after);
    }

    #[test]
    fn test_parse_timestamp_naive_formats() {
        let parsed = parse_timestamp("2026-08-01 10:30:00");
        assert_eq!(
            parsed,
            NaiveDateTime::parse_from_str("2026-08-01 10:30:00", "%Y-%m-%d %H:%M:%S")
                .expect("valid")
        );
    }
}
