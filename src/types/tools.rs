//! Tool listing and invocation

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::base::{Content, Cursor, EmbeddedResource, MediaContent, Meta, Paginated, ResourceLink, TextContent};

/// A tool the server exposes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: ToolSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<ToolSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<ToolAnnotations>,
    #[serde(default, rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

/// JSON Schema describing tool input or output.
///
/// Carried as metadata only; arguments are never validated against it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    #[serde(rename = "type", default = "object_type")]
    pub schema_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

fn object_type() -> String {
    "object".to_string()
}

impl Default for ToolSchema {
    fn default() -> Self {
        Self {
            schema_type: object_type(),
            properties: None,
            required: Vec::new(),
        }
    }
}

/// Behavioural hints; untrusted unless the server is
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolAnnotations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only_hint: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destructive_hint: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotent_hint: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_world_hint: Option<bool>,
}

/// `tools/list` result
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Cursor>,
    #[serde(default, rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl Paginated for ListToolsResult {
    type Item = Tool;

    fn next_cursor(&self) -> Option<&str> {
        self.next_cursor.as_deref()
    }

    fn into_items(self) -> Vec<Tool> {
        self.tools
    }
}

/// `tools/call` parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
    #[serde(default, rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

/// `tools/call` result
///
/// A tool that ran but failed reports `is_error = true` with a description in
/// `content`; that is not a transport error.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl CallToolResult {
    pub fn text_contents(&self) -> Vec<&TextContent> {
        self.content
            .iter()
            .filter_map(|block| match block {
                Content::Text(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Just the strings of the text blocks, in order
    pub fn text_strings(&self) -> Vec<&str> {
        self.content.iter().filter_map(Content::as_text).collect()
    }

    pub fn images(&self) -> Vec<&MediaContent> {
        self.content
            .iter()
            .filter_map(|block| match block {
                Content::Image(image) => Some(image),
                _ => None,
            })
            .collect()
    }

    pub fn audio(&self) -> Vec<&MediaContent> {
        self.content
            .iter()
            .filter_map(|block| match block {
                Content::Audio(audio) => Some(audio),
                _ => None,
            })
            .collect()
    }

    pub fn resource_links(&self) -> Vec<&ResourceLink> {
        self.content
            .iter()
            .filter_map(|block| match block {
                Content::ResourceLink(link) => Some(link),
                _ => None,
            })
            .collect()
    }

    pub fn embedded_resources(&self) -> Vec<&EmbeddedResource> {
        self.content
            .iter()
            .filter_map(|block| match block {
                Content::Resource(resource) => Some(resource),
                _ => None,
            })
            .collect()
    }
}
