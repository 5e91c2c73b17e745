//! Stream event types
//!
//! `Content` and `ContentFinal` carry the cumulative text for the channel,
//! while `Reasoning` carries only the newest delta. Processing must keep that
//! asymmetry intact.

use serde::{Deserialize, Serialize};

/// A single web search hit forwarded by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSearchResult {
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// Events that can be streamed for one assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    /// Cumulative answer text so far
    #[serde(rename = "content")]
    Content { text: String },

    /// Cumulative answer text, sent once the backend considers it final
    #[serde(rename = "content_final")]
    ContentFinal { text: String },

    /// Reasoning delta
    #[serde(rename = "reasoning")]
    Reasoning { text: String },

    /// Backend pipeline stage ("searching", "generating", ...)
    #[serde(rename = "status_update")]
    StatusUpdate { stage: String },

    /// Web search results received
    #[serde(rename = "web_search_results")]
    WebSearchResults { results: Vec<WebSearchResult> },

    /// Error
    #[serde(rename = "error")]
    Error { message: String },

    /// Finish
    #[serde(rename = "finish", alias = "stream_end")]
    Finish,

    /// Tool call chunk, payload left opaque
    #[serde(rename = "tool_calls_chunk", alias = "tool_call")]
    ToolCall {
        #[serde(default)]
        data: serde_json::Value,
    },

    /// Output kind announced by the backend ("text", "image")
    #[serde(rename = "output_type")]
    OutputType { kind: String },

    /// Legacy alias of `Content`
    #[serde(rename = "text")]
    Text { text: String },
}

impl StreamEvent {
    /// Short tag used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Content { .. } => "content",
            StreamEvent::ContentFinal { .. } => "content_final",
            StreamEvent::Reasoning { .. } => "reasoning",
            StreamEvent::StatusUpdate { .. } => "status_update",
            StreamEvent::WebSearchResults { .. } => "web_search_results",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Finish => "finish",
            StreamEvent::ToolCall { .. } => "tool_calls_chunk",
            StreamEvent::OutputType { .. } => "output_type",
            StreamEvent::Text { .. } => "text",
        }
    }

    /// Whether the event ends the stream for its message
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Finish | StreamEvent::Error { .. })
    }
}

/// Result of feeding one event through a processor
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessedEventResult {
    /// Accumulated answer text changed
    ContentUpdated { text: String },
    /// Accumulated reasoning changed
    ReasoningUpdated { text: String },
    /// Reasoning phase is over
    ReasoningComplete,
    StatusUpdate { stage: String },
    WebSearchResults { results: Vec<WebSearchResult> },
    Error { message: String },
    /// Processor was cancelled, event dropped
    Cancelled,
    NoChange,
}

impl ProcessedEventResult {
    pub fn is_change(&self) -> bool {
        !matches!(
            self,
            ProcessedEventResult::NoChange | ProcessedEventResult::Cancelled
        )
    }
}
