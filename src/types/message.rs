//! Messages exchanged between clients
//!
//! Two channels exist per logical database: the long-lived write
//! replication topic carrying [`WriteMessage`], and the short-lived init
//! coordination topic carrying [`InitMessage`]. Both are serialized to
//! JSON before publishing.

use serde::{Deserialize, Serialize};

use super::ScalarValue;
use crate::utils::now_millis;

/// One replicated write statement
///
/// Fields are private so a message cannot be altered after construction;
/// followers execute exactly the text and parameters the leader ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteMessage {
    origin: String,
    sql_text: String,
    bound_params: Vec<ScalarValue>,
    operation_tag: String,
    emitted_at_millis: i64,
}

impl WriteMessage {
    /// Build a message stamped with the current time
    pub fn new(
        origin: impl Into<String>,
        sql_text: impl Into<String>,
        bound_params: Vec<ScalarValue>,
        operation_tag: impl Into<String>,
    ) -> Self {
        Self {
            origin: origin.into(),
            sql_text: sql_text.into(),
            bound_params,
            operation_tag: operation_tag.into(),
            emitted_at_millis: now_millis(),
        }
    }

    /// Client id of the leader that executed the statement
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn sql_text(&self) -> &str {
        &self.sql_text
    }

    pub fn bound_params(&self) -> &[ScalarValue] {
        &self.bound_params
    }

    /// Observability label, never used for correctness
    pub fn operation_tag(&self) -> &str {
        &self.operation_tag
    }

    pub fn emitted_at_millis(&self) -> i64 {
        self.emitted_at_millis
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Derive an observability tag from the leading keyword of a statement
///
/// `"  insert into notes ..."` becomes `"insert"`; an empty statement
/// becomes `"write"`.
pub fn operation_tag_for(sql: &str) -> String {
    sql.split_whitespace()
        .next()
        .map(|word| word.trim_matches(|c: char| !c.is_ascii_alphanumeric()))
        .filter(|word| !word.is_empty())
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| "write".to_string())
}

/// Phase of the store-creation handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitKind {
    InitRequest,
    InitInProgress,
    InitComplete,
}

/// Init coordination message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitMessage {
    #[serde(rename = "type")]
    pub kind: InitKind,
    pub client_id: String,
    pub store: String,
}

impl InitMessage {
    pub fn new(kind: InitKind, client_id: &str, store: &str) -> Self {
        Self {
            kind,
            client_id: client_id.to_string(),
            store: store.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
