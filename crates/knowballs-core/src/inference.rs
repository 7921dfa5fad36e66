use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const FALLBACK_ANSWER: &str = "Sorry, I couldn't generate an answer for your query.";
pub const UNKNOWN_TOOL: &str = "unknown";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContentItem {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LessonData {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combined_markdown: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    pub answer: String,
    pub tool_used: String,
    pub data: LessonData,
    /// False when the upstream sent no usable answer and the fallback text is shown.
    pub answered: bool,
}

impl QueryOutcome {
    pub fn decode(payload: &Value) -> Self {
        let answer = payload
            .get("answer")
            .and_then(Value::as_str)
            .filter(|answer| !answer.is_empty());
        let tool_used = payload
            .get("tool_used")
            .and_then(Value::as_str)
            .filter(|tool| !tool.is_empty())
            .unwrap_or(UNKNOWN_TOOL);
        let data = payload
            .get("tool_result")
            .and_then(|result| result.get("data"))
            .map(decode_lesson)
            .unwrap_or_default();

        Self {
            answer: answer.unwrap_or(FALLBACK_ANSWER).to_owned(),
            tool_used: tool_used.to_owned(),
            data,
            answered: answer.is_some(),
        }
    }
}

fn decode_lesson(data: &Value) -> LessonData {
    let content = data
        .get("content")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(decode_content_item).collect())
        .unwrap_or_default();
    let combined_markdown = data
        .get("combined_markdown")
        .and_then(Value::as_str)
        .map(str::to_owned);

    LessonData {
        content,
        combined_markdown,
    }
}

fn decode_content_item(item: &Value) -> Option<ContentItem> {
    item.as_object()?;
    let text = |key: &str| item.get(key).and_then(Value::as_str).map(str::to_owned);
    Some(ContentItem {
        kind: text("type").unwrap_or_default(),
        content: text("content").unwrap_or_default(),
        link: text("link"),
        definition: text("definition"),
    })
}
