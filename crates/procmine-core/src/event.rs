// Watcher event types
//
// Events are produced by watchers (active window, browser, OCR) and are
// read-only to the engine. An event is identified by (bucket_id, id);
// ids are per-bucket integers assigned by the ingest path.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Maximum length of a title-derived activity label
const TITLE_LABEL_MAX: usize = 64;

/// A single watcher event.
///
/// `duration` is foreground time in seconds, per the watcher convention;
/// an event's wall-clock end is `timestamp + duration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct WatchedEvent {
    pub bucket_id: String,
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub duration: f64,
    /// Arbitrary watcher payload; notable keys: app, title, url, ocr_text, screenshot
    pub data: serde_json::Value,
}

impl WatchedEvent {
    /// Wall-clock end of the event
    pub fn end(&self) -> DateTime<Utc> {
        self.timestamp + Duration::milliseconds((self.duration * 1000.0) as i64)
    }

    /// Reference to this event
    pub fn event_ref(&self) -> EventRef {
        EventRef {
            bucket_id: self.bucket_id.clone(),
            event_id: self.id,
        }
    }

    /// Text of one data field, empty string when missing or non-textual
    pub fn field_text(&self, field: &str) -> &str {
        self.data.get(field).and_then(|v| v.as_str()).unwrap_or("")
    }

    /// Activity label used for step synthesis and pattern mining.
    ///
    /// Precedence: `app`, else the host of `url`, else `title` truncated to
    /// 64 chars, else "unknown".
    pub fn activity_label(&self) -> String {
        let app = self.field_text("app");
        if !app.is_empty() {
            return app.to_string();
        }
        let raw_url = self.field_text("url");
        if !raw_url.is_empty() {
            if let Ok(parsed) = url::Url::parse(raw_url) {
                if let Some(host) = parsed.host_str() {
                    return host.to_string();
                }
            }
        }
        let title = self.field_text("title");
        if !title.is_empty() {
            return truncate_chars(title, TITLE_LABEL_MAX);
        }
        "unknown".to_string()
    }
}

/// Identity of an event within its bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EventRef {
    pub bucket_id: String,
    pub event_id: i64,
}

/// An interval during which the user was away from keyboard.
///
/// Supplied by an AFK-style watcher bucket; intervals of 60 s or more force
/// case boundaries during sessionisation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AfkInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl AfkInterval {
    /// Interval length in seconds
    pub fn seconds(&self) -> f64 {
        (self.end - self.start).num_milliseconds() as f64 / 1000.0
    }
}

/// Sort events the way store reads return them: timestamp ascending with a
/// stable tie-break on (bucket, id)
pub fn sort_events(events: &mut [WatchedEvent]) {
    events.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.bucket_id.cmp(&b.bucket_id))
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event_with(data: serde_json::Value) -> WatchedEvent {
        WatchedEvent {
            bucket_id: "win".to_string(),
            id: 1,
            timestamp: Utc::now(),
            duration: 5.0,
            data,
        }
    }

    #[test]
    fn test_label_prefers_app() {
        let e = event_with(json!({"app": "erp.exe", "url": "https://shop.example/orders", "title": "Orders"}));
        assert_eq!(e.activity_label(), "erp.exe");
    }

    #[test]
    fn test_label_falls_back_to_url_host() {
        let e = event_with(json!({"url": "https://shop.example/orders/42", "title": "Order 42"}));
        assert_eq!(e.activity_label(), "shop.example");
    }

    #[test]
    fn test_label_falls_back_to_truncated_title() {
        let long = "x".repeat(100);
        let e = event_with(json!({ "title": long }));
        assert_eq!(e.activity_label().chars().count(), 64);
    }

    #[test]
    fn test_label_unknown_when_empty() {
        let e = event_with(json!({}));
        assert_eq!(e.activity_label(), "unknown");
    }

    #[test]
    fn test_end_adds_duration() {
        let e = event_with(json!({}));
        assert_eq!((e.end() - e.timestamp).num_seconds(), 5);
    }

    #[test]
    fn test_sort_ties_on_bucket_then_id() {
        let ts = Utc::now();
        let mut events = vec![
            WatchedEvent { bucket_id: "win".into(), id: 2, timestamp: ts, duration: 0.0, data: json!({}) },
            WatchedEvent { bucket_id: "win".into(), id: 1, timestamp: ts, duration: 0.0, data: json!({}) },
        ];
        sort_events(&mut events);
        assert_eq!(events[0].id, 1);
    }
}
