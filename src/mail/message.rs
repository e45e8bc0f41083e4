//! Mail message decoding
//!
//! The mail tool answers `tools/call` with MCP text content. Search results
//! are blank-line separated blocks of `Key: value` headers; a single message
//! is either a JSON object, a header block followed by a body, or just the
//! body text.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Decoded mail message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// Text of the first content item of a tool result
///
/// Some tool versions serialize the text as an object keyed `"0"`, `"1"`, ...
/// holding single characters; that shape is reassembled into a string.
pub fn extract_text(result: &Value) -> Option<String> {
    let text = result.get("content")?.as_array()?.first()?.get("text")?;
    match text {
        Value::String(text) => Some(text.clone()),
        Value::Object(_) => join_indexed_chars(text),
        _ => None,
    }
}

fn join_indexed_chars(value: &Value) -> Option<String> {
    let object = value.as_object()?;
    let mut text = String::new();
    let mut index = 0usize;
    while let Some(part) = object.get(&index.to_string()) {
        text.push_str(part.as_str()?);
        index += 1;
    }
    if index == 0 {
        return None;
    }
    debug!("Reassembled {} indexed characters into text content", index);
    Some(text)
}

/// Parse the text of a search result into messages
///
/// Blocks without an `ID:` line are skipped.
pub fn parse_search_text(text: &str) -> Vec<MailMessage> {
    text.split("\n\n")
        .filter_map(|block| {
            let mut message = MailMessage::default();
            for line in block.lines() {
                apply_header(&mut message, line);
            }
            (!message.id.is_empty()).then_some(message)
        })
        .collect()
}

/// Parse the text of a single message
///
/// `fallback_id` is used when the text carries no id of its own.
pub fn parse_message_text(text: &str, fallback_id: &str) -> MailMessage {
    if let Some(message) = parse_json_message(text) {
        return message;
    }

    let mut message = MailMessage::default();
    let lines: Vec<&str> = text.lines().collect();
    let mut body_start = None;

    for (index, line) in lines.iter().enumerate() {
        if let Some(body) = line.strip_prefix("Body:") {
            let mut rest = vec![body.trim_start()];
            rest.extend(&lines[index + 1..]);
            message.body = Some(rest.join("\n").trim().to_string());
            break;
        }
        if line.is_empty() && index > 0 {
            body_start = Some(index + 1);
            break;
        }
        apply_header(&mut message, line);
    }

    if message.body.is_none()
        && let Some(start) = body_start
    {
        message.body = Some(lines[start..].join("\n"));
    }

    if message.id.is_empty() && message.subject.is_none() {
        // Unstructured: the whole text is the body
        return MailMessage {
            id: fallback_id.to_string(),
            subject: Some("Email Content".to_string()),
            body: Some(text.to_string()),
            ..MailMessage::default()
        };
    }

    if message.id.is_empty() {
        message.id = fallback_id.to_string();
    }
    message
}

fn apply_header(message: &mut MailMessage, line: &str) {
    let Some((key, value)) = line.split_once(':') else {
        return;
    };
    let value = value.trim().to_string();
    match key.trim() {
        "ID" | "Message ID" => message.id = value,
        "Thread ID" => message.thread_id = Some(value),
        "Subject" => message.subject = Some(value),
        "From" => message.from = Some(value),
        "To" => message.to = Some(value),
        "Date" => message.date = Some(value),
        "Snippet" => message.snippet = Some(value),
        _ => {}
    }
}

fn parse_json_message(text: &str) -> Option<MailMessage> {
    let value: Value = serde_json::from_str(text.trim()).ok()?;
    let object = value.as_object()?;
    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| object.get(*name).and_then(Value::as_str))
            .map(str::to_string)
    };

    let id = field(&["id", "messageId", "message_id", "emailId", "email_id"]);
    let subject = field(&["subject"]);
    let from = field(&["from"]);
    if id.is_none() && subject.is_none() && from.is_none() {
        return None;
    }

    Some(MailMessage {
        id: id.unwrap_or_default(),
        thread_id: field(&["threadId", "thread_id"]),
        subject,
        from,
        to: field(&["to"]),
        date: field(&["date"]),
        body: field(&["body", "content", "snippet"]),
        snippet: field(&["snippet"]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_text() {
        let result = json!({"content": [{"type": "text", "text": "hello"}]});
        assert_eq!(extract_text(&result).as_deref(), Some("hello"));

        let indexed = json!({"content": [{"type": "text", "text": {"0": "h", "1": "i"}}]});
        assert_eq!(extract_text(&indexed).as_deref(), Some("hi"));

        assert_eq!(extract_text(&json!({"content": []})), None);
        assert_eq!(extract_text(&json!("plain")), None);
    }

    #[test]
    fn test_parse_search_blocks() {
        let text = "Found 2 messages\n\nID: a1\nSubject: Standup notes\nFrom: bob@example.com\nDate: Mon, 1 Jan\n\nID: b2\nSubject: Retro";
        let messages = parse_search_text(text);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "a1");
        assert_eq!(messages[0].from.as_deref(), Some("bob@example.com"));
        assert_eq!(messages[1].subject.as_deref(), Some("Retro"));
    }

    #[test]
    fn test_parse_message_headers_and_body() {
        let text = "ID: m1\nSubject: Meeting transcript\nFrom: alice@example.com\n\nLine one\nLine two";
        let message = parse_message_text(text, "fallback");
        assert_eq!(message.id, "m1");
        assert_eq!(message.subject.as_deref(), Some("Meeting transcript"));
        assert_eq!(message.body.as_deref(), Some("Line one\nLine two"));
    }

    #[test]
    fn test_parse_message_body_prefix() {
        let text = "Subject: Notes\nBody: first\nsecond";
        let message = parse_message_text(text, "m9");
        assert_eq!(message.id, "m9");
        assert_eq!(message.body.as_deref(), Some("first\nsecond"));
    }

    #[test]
    fn test_parse_message_json() {
        let text = r#"{"message_id": "x7", "subject": "Hi", "content": "Body text"}"#;
        let message = parse_message_text(text, "fallback");
        assert_eq!(message.id, "x7");
        assert_eq!(message.body.as_deref(), Some("Body text"));
    }

    #[test]
    fn test_parse_unstructured_message() {
        let message = parse_message_text("just a body", "m2");
        assert_eq!(message.id, "m2");
        assert_eq!(message.subject.as_deref(), Some("Email Content"));
        assert_eq!(message.body.as_deref(), Some("just a body"));
    }
}
