//! Google Calendar tools.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};

use super::google::{required_str, segment, GoogleApi};
use crate::error::{AgentError, Result};
use crate::invoker::ToolContext;
use crate::tool::{Tool, ToolRegistry};

const PRIMARY: &str = "primary";
const MAX_LIST_RESULTS: u64 = 100;

/// A user-supplied event boundary.
#[derive(Debug, Clone, PartialEq)]
enum EventTime {
    Instant(DateTime<Utc>),
    /// Wall-clock time interpreted in the event's time zone.
    Local(NaiveDateTime),
    AllDay(NaiveDate),
}

impl EventTime {
    fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
            return Ok(EventTime::Instant(instant.with_timezone(&Utc)));
        }
        for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
            if let Ok(local) = NaiveDateTime::parse_from_str(raw, format) {
                return Ok(EventTime::Local(local));
            }
        }
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map(EventTime::AllDay)
            .map_err(|_| AgentError::Protocol(format!("unrecognized date/time `{raw}`")))
    }

    /// Default end: one hour later, or the next day for all-day events.
    fn default_end(&self) -> Self {
        match self {
            EventTime::Instant(t) => EventTime::Instant(*t + ChronoDuration::hours(1)),
            EventTime::Local(t) => EventTime::Local(*t + ChronoDuration::hours(1)),
            EventTime::AllDay(d) => EventTime::AllDay(*d + ChronoDuration::days(1)),
        }
    }

    fn to_json(&self, time_zone: &str) -> Value {
        match self {
            EventTime::Instant(t) => json!({
                "dateTime": t.to_rfc3339_opts(SecondsFormat::Secs, true),
                "timeZone": time_zone,
            }),
            EventTime::Local(t) => json!({
                "dateTime": t.format("%Y-%m-%dT%H:%M:%S").to_string(),
                "timeZone": time_zone,
            }),
            EventTime::AllDay(d) => json!({ "date": d.format("%Y-%m-%d").to_string() }),
        }
    }
}

fn calendar_id(input: &Value) -> &str {
    input["calendar_id"]
        .as_str()
        .filter(|id| !id.is_empty())
        .unwrap_or(PRIMARY)
}

fn summarize_event(event: &Value) -> Value {
    let when = |key: &str| {
        event[key]["dateTime"]
            .as_str()
            .or_else(|| event[key]["date"].as_str())
            .map(String::from)
    };
    let attendees: Vec<&str> = event["attendees"]
        .as_array()
        .map(|list| list.iter().filter_map(|a| a["email"].as_str()).collect())
        .unwrap_or_default();
    json!({
        "id": event["id"],
        "summary": event["summary"],
        "start": when("start"),
        "end": when("end"),
        "location": event["location"],
        "html_link": event["htmlLink"],
        "attendees": attendees,
    })
}

pub struct ListCalendarsTool {
    api: GoogleApi,
}

#[async_trait]
impl Tool for ListCalendarsTool {
    fn name(&self) -> &str {
        "list_calendars"
    }

    fn description(&self) -> &str {
        "List the calendars the account can see."
    }

    async fn call(&self, ctx: &ToolContext<'_>, _input: Value) -> Result<Value> {
        let listing = self.api.get(ctx, "/users/me/calendarList", &[]).await?;
        let calendars: Vec<Value> = listing["items"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c["id"],
                            "summary": c["summary"],
                            "primary": c["primary"].as_bool().unwrap_or(false),
                            "access_role": c["accessRole"],
                            "time_zone": c["timeZone"],
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(json!({ "success": true, "count": calendars.len(), "calendars": calendars }))
    }
}

pub struct ListEventsTool {
    api: GoogleApi,
}

#[async_trait]
impl Tool for ListEventsTool {
    fn name(&self) -> &str {
        "list_events"
    }

    fn description(&self) -> &str {
        "List upcoming events, optionally within a time window or matching a search term."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "calendar_id": {"type": "string", "description": "Calendar ID (default: primary)"},
                "max_results": {"type": "integer", "description": "Maximum events to return (default: 10)"},
                "time_min": {"type": "string", "description": "RFC 3339 lower bound (default: now)"},
                "time_max": {"type": "string", "description": "RFC 3339 upper bound"},
                "query": {"type": "string", "description": "Free-text search"}
            }
        }))
    }

    async fn call(&self, ctx: &ToolContext<'_>, input: Value) -> Result<Value> {
        let calendar = calendar_id(&input);
        let max_results = input["max_results"]
            .as_u64()
            .unwrap_or(10)
            .clamp(1, MAX_LIST_RESULTS);
        let time_min = input["time_min"]
            .as_str()
            .map(String::from)
            .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));

        let mut params = vec![
            ("maxResults", max_results.to_string()),
            ("singleEvents", "true".to_string()),
            ("orderBy", "startTime".to_string()),
            ("timeMin", time_min),
        ];
        if let Some(time_max) = input["time_max"].as_str() {
            params.push(("timeMax", time_max.to_string()));
        }
        if let Some(query) = input["query"].as_str().filter(|q| !q.is_empty()) {
            params.push(("q", query.to_string()));
        }

        let listing = self
            .api
            .get(ctx, &format!("/calendars/{}/events", segment(calendar)), &params)
            .await?;
        let events: Vec<Value> = listing["items"]
            .as_array()
            .map(|items| items.iter().map(summarize_event).collect())
            .unwrap_or_default();

        Ok(json!({
            "success": true,
            "calendar_id": calendar,
            "count": events.len(),
            "events": events,
        }))
    }
}

pub struct CreateEventTool {
    api: GoogleApi,
}

#[async_trait]
impl Tool for CreateEventTool {
    fn name(&self) -> &str {
        "create_event"
    }

    fn description(&self) -> &str {
        "Create a calendar event. Times accept RFC 3339, local `YYYY-MM-DDTHH:MM` or all-day `YYYY-MM-DD`."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "summary": {"type": "string", "description": "Event title"},
                "start": {"type": "string", "description": "Start time"},
                "end": {"type": "string", "description": "End time (default: one hour after start)"},
                "time_zone": {"type": "string", "description": "IANA time zone (default: UTC)"},
                "description": {"type": "string"},
                "location": {"type": "string"},
                "attendees": {"type": "array", "items": {"type": "string"}},
                "calendar_id": {"type": "string"}
            },
            "required": ["summary", "start"]
        }))
    }

    async fn call(&self, ctx: &ToolContext<'_>, input: Value) -> Result<Value> {
        let event = build_event(&input)?;
        let calendar = calendar_id(&input);
        let created = self
            .api
            .post(ctx, &format!("/calendars/{}/events", segment(calendar)), &event)
            .await?;
        tracing::info!(session_id = ctx.session_id, calendar, "event created");

        let mut summary = summarize_event(&created);
        summary["success"] = json!(true);
        Ok(summary)
    }
}

fn build_event(input: &Value) -> Result<Value> {
    let summary = required_str(input, "summary")?;
    let start = EventTime::parse(required_str(input, "start")?)?;
    let end = match input["end"].as_str().filter(|e| !e.is_empty()) {
        Some(raw) => EventTime::parse(raw)?,
        None => start.default_end(),
    };
    if std::mem::discriminant(&start) != std::mem::discriminant(&end) {
        return Err(AgentError::Protocol(
            "start and end must use the same time format".into(),
        ));
    }
    let time_zone = input["time_zone"].as_str().unwrap_or("UTC");

    let mut event = Map::new();
    event.insert("summary".into(), json!(summary));
    event.insert("start".into(), start.to_json(time_zone));
    event.insert("end".into(), end.to_json(time_zone));
    for key in ["description", "location"] {
        if let Some(value) = input[key].as_str() {
            event.insert(key.into(), json!(value));
        }
    }
    if let Some(attendees) = input["attendees"].as_array() {
        let list: Vec<Value> = attendees
            .iter()
            .filter_map(Value::as_str)
            .map(|email| json!({ "email": email }))
            .collect();
        event.insert("attendees".into(), Value::Array(list));
    }
    Ok(Value::Object(event))
}

pub struct DeleteEventTool {
    api: GoogleApi,
}

#[async_trait]
impl Tool for DeleteEventTool {
    fn name(&self) -> &str {
        "delete_event"
    }

    fn description(&self) -> &str {
        "Delete a calendar event by id."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "event_id": {"type": "string"},
                "calendar_id": {"type": "string"}
            },
            "required": ["event_id"]
        }))
    }

    async fn call(&self, ctx: &ToolContext<'_>, input: Value) -> Result<Value> {
        let event_id = required_str(&input, "event_id")?;
        let calendar = calendar_id(&input);
        self.api
            .delete(
                ctx,
                &format!("/calendars/{}/events/{}", segment(calendar), segment(event_id)),
            )
            .await?;
        Ok(json!({ "success": true, "event_id": event_id, "message": "Event deleted" }))
    }
}

/// Needs no account access.
pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "get_current_time"
    }

    fn description(&self) -> &str {
        "Current date and time in UTC."
    }

    fn requires_credentials(&self) -> bool {
        false
    }

    async fn call(&self, _ctx: &ToolContext<'_>, _input: Value) -> Result<Value> {
        let now = Utc::now();
        Ok(json!({
            "success": true,
            "utc": now.to_rfc3339_opts(SecondsFormat::Secs, true),
            "date": now.format("%Y-%m-%d").to_string(),
            "weekday": now.format("%A").to_string(),
            "unix": now.timestamp(),
        }))
    }
}

pub fn register_calendar_tools(registry: &mut ToolRegistry, api: GoogleApi) {
    registry.register(ListCalendarsTool { api: api.clone() });
    registry.register(ListEventsTool { api: api.clone() });
    registry.register(CreateEventTool { api: api.clone() });
    registry.register(DeleteEventTool { api });
    registry.register(CurrentTimeTool);
}
