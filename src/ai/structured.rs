use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use crate::ai::prompts::FORMAT_REMINDER;
use crate::ai::{ChatMessage, LlmClient, LlmRequest};
use crate::analysis::types::AnalysisError;

/// Ask for a JSON reply and decode it, with a single repair round-trip.
///
/// When the first reply does not decode, it is echoed back as the assistant
/// turn followed by a format reminder. A second failure is `MalformedResponse`.
pub async fn complete_structured<T: DeserializeOwned>(
    llm: &dyn LlmClient,
    request: LlmRequest,
    cancel: &CancellationToken,
) -> Result<T, AnalysisError> {
    let first = llm.complete(&request, cancel).await?;
    if let Some(parsed) = parse_json(&first) {
        return Ok(parsed);
    }

    warn!(reply = %preview(&first), "LLM reply was not valid JSON, requesting repair");

    let mut repair = request;
    repair.messages.push(ChatMessage::assistant(first));
    repair.messages.push(ChatMessage::user(FORMAT_REMINDER));

    let second = llm.complete(&repair, cancel).await?;
    parse_json(&second).ok_or_else(|| AnalysisError::MalformedResponse(preview(&second)))
}

/// Plain JSON, fenced JSON, or the outermost `{...}` embedded in prose
pub fn parse_json<T: DeserializeOwned>(text: &str) -> Option<T> {
    if let Ok(parsed) = serde_json::from_str(text.trim()) {
        return Some(parsed);
    }

    if let Some(inner) = strip_markdown_code_fence(text) {
        if let Ok(parsed) = serde_json::from_str(inner) {
            return Some(parsed);
        }
    }

    extract_outer_json_object(text).and_then(|json| serde_json::from_str(json).ok())
}

fn strip_markdown_code_fence(s: &str) -> Option<&str> {
    let after_open = s.trim().strip_prefix("```")?;
    let newline_idx = after_open.find('\n')?;
    let after_header = &after_open[(newline_idx + 1)..];
    let close_idx = after_header.rfind("```")?;
    Some(after_header[..close_idx].trim())
}

fn extract_outer_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&s[start..=end])
}

fn preview(s: &str) -> String {
    match s.char_indices().nth(200) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
