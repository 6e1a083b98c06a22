//! Timeline item types.
//!
//! History entries form a closed sum type so serialization and rendering can
//! match exhaustively: tool results, user interactions, and free text. New
//! variants are added here, not through an open trait.

use serde::{Deserialize, Serialize};

/// What one history entry records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineItemValue {
    /// A tool invocation's result
    ToolResult {
        /// The tool call this result answers
        call_id: String,
        /// Tool name
        tool: String,
        /// Result content
        content: String,
    },
    /// Something the user said or decided
    UserInteraction {
        /// Interaction content
        content: String,
    },
    /// Free-form text (agent notes, system remarks)
    FreeText {
        /// The text
        content: String,
    },
}

impl TimelineItemValue {
    /// A tool result entry.
    pub fn tool_result(call_id: &str, tool: &str, content: &str) -> Self {
        Self::ToolResult {
            call_id: call_id.to_string(),
            tool: tool.to_string(),
            content: content.to_string(),
        }
    }

    /// A user interaction entry.
    pub fn user_interaction(content: &str) -> Self {
        Self::UserInteraction {
            content: content.to_string(),
        }
    }

    /// A free text entry.
    pub fn free_text(content: &str) -> Self {
        Self::FreeText {
            content: content.to_string(),
        }
    }

    /// Render the entry for prompts and dumps.
    pub fn render(&self) -> String {
        match self {
            Self::ToolResult { call_id, tool, content } => {
                format!("[tool {} #{}] {}", tool, call_id, content)
            }
            Self::UserInteraction { content } => format!("[user] {}", content),
            Self::FreeText { content } => content.clone(),
        }
    }

    /// The raw content, without rendering decoration.
    pub fn content(&self) -> &str {
        match self {
            Self::ToolResult { content, .. } => content,
            Self::UserInteraction { content } => content,
            Self::FreeText { content } => content,
        }
    }
}

/// One history entry: a value plus compaction bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineItem {
    /// Stable numeric id, monotonic within the owning timeline
    pub id: u64,
    /// What happened
    pub value: TimelineItemValue,
    /// Soft-delete flag; a deleted item is skipped by rendering
    #[serde(default)]
    pub deleted: bool,
    /// AI-produced summary, substituted for the content once present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shrink_result: Option<String>,
}

impl TimelineItem {
    /// Wrap a value under `id`.
    pub fn new(id: u64, value: TimelineItemValue) -> Self {
        Self {
            id,
            value,
            deleted: false,
            shrink_result: None,
        }
    }

    /// Whether this item has been shrunk.
    pub fn is_shrunk(&self) -> bool {
        self.shrink_result.is_some()
    }

    /// Record the latest summary (earlier ones are overwritten, not kept).
    pub fn set_summary(&mut self, summary: &str) {
        self.shrink_result = Some(summary.to_string());
    }

    /// Render for dumps: the summary once shrunk, else the raw rendering.
    pub fn render(&self) -> String {
        match &self.shrink_result {
            Some(summary) => format!("[summarized #{}] {}", self.id, summary),
            None => self.value.render(),
        }
    }

    /// Size of the raw rendering in bytes.
    pub fn rendered_len(&self) -> usize {
        self.value.render().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_variants() {
        let tool = TimelineItemValue::tool_result("call_1", "shell", "ok");
        assert_eq!(tool.render(), "[tool shell #call_1] ok");

        let user = TimelineItemValue::user_interaction("approve it");
        assert_eq!(user.render(), "[user] approve it");

        let text = TimelineItemValue::free_text("note to self");
        assert_eq!(text.render(), "note to self");
    }

    #[test]
    fn test_content_accessor() {
        assert_eq!(
            TimelineItemValue::tool_result("c", "t", "body").content(),
            "body"
        );
        assert_eq!(TimelineItemValue::free_text("x").content(), "x");
    }

    #[test]
    fn test_item_summary_substitution() {
        let mut item = TimelineItem::new(4, TimelineItemValue::free_text("a very long story"));
        assert!(!item.is_shrunk());
        assert_eq!(item.render(), "a very long story");

        item.set_summary("story, shortened");
        assert!(item.is_shrunk());
        assert_eq!(item.render(), "[summarized #4] story, shortened");

        // Latest summary wins
        item.set_summary("even shorter");
        assert_eq!(item.render(), "[summarized #4] even shorter");
    }

    #[test]
    fn test_serde_tagged_roundtrip() {
        let item = TimelineItem::new(1, TimelineItemValue::tool_result("c1", "web", "<html>"));
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains(r#""type":"tool_result""#));
        let parsed: TimelineItem = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.value, item.value);
        assert!(!parsed.deleted);
    }

    #[test]
    fn test_serde_skips_absent_summary() {
        let item = TimelineItem::new(1, TimelineItemValue::free_text("x"));
        let json = serde_json::to_string(&item).unwrap();
        assert!(!json.contains("shrink_result"));
    }
}
