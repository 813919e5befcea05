//! MCP payload types
//!
//! The shapes the capability client sends or decodes, plus the payloads of
//! server-initiated requests and notifications. Field names
//! follow the wire (camelCase) through serde attributes; unknown fields are
//! ignored so newer servers stay readable.

pub mod base;
pub mod client_features;
pub mod prompts;
pub mod resources;
pub mod tools;

pub use base::{
    Annotations, ClientCapabilities, Content, Cursor, EmbeddedResource, Implementation,
    InitializeParams, InitializeResult, MediaContent, Meta, PaginatedParams, Paginated,
    ResourceLink, Role, ServerCapabilities, TextContent, LATEST_PROTOCOL_VERSION,
};
pub use client_features::{
    BooleanSchema, CompleteRequest, CompleteResult, Completion, CompletionArgument,
    CompletionContext, CompletionReference, CreateMessageRequest, CreateMessageResult,
    ElicitAction, ElicitRequest, ElicitRequestSchema, ElicitResult, EnumSchema, IncludeContext,
    ListRootsResult, LoggingLevel, LoggingMessageNotification, ModelHint, ModelPreferences,
    NumberSchema, PrimitiveSchema, Root, RootsListChangedNotification, SamplingMessage,
    SetLevelRequest, StringFormat, StringOrEnum, StringSchema,
};
pub use prompts::{GetPromptParams, GetPromptResult, ListPromptsResult, Prompt, PromptArgument, PromptMessage};
pub use resources::{
    ListResourceTemplatesResult, ListResourcesResult, ReadResourceResult, Resource,
    ResourceContents, ResourceTemplate, ResourceUriParams,
};
pub use tools::{CallToolParams, CallToolResult, ListToolsResult, Tool, ToolAnnotations, ToolSchema};
