// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tool error taxonomy.
//!
//! Workers encode every tool failure as a [`ToolError`] carried inside a
//! `call.failed` event; errors never cross the worker boundary as panics
//! or transport failures.

use serde::{Deserialize, Serialize};

/// Classified failure cause reported by a tool executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    Connection,
    Timeout,
    RateLimit,
    ServerError,
    Auth,
    NotFound,
    ClientError,
    Schema,
    Parse,
    DbDeadlock,
    DbConnection,
    DbTimeout,
    DbConstraint,
    Cancelled,
    Internal,
}

crate::simple_display! {
    ToolErrorKind {
        Connection => "connection",
        Timeout => "timeout",
        RateLimit => "rate_limit",
        ServerError => "server_error",
        Auth => "auth",
        NotFound => "not_found",
        ClientError => "client_error",
        Schema => "schema",
        Parse => "parse",
        DbDeadlock => "db_deadlock",
        DbConnection => "db_connection",
        DbTimeout => "db_timeout",
        DbConstraint => "db_constraint",
        Cancelled => "cancelled",
        Internal => "internal",
    }
}

impl ToolErrorKind {
    /// Default retryability for this kind, before code-level refinement.
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            ToolErrorKind::Connection
                | ToolErrorKind::Timeout
                | ToolErrorKind::RateLimit
                | ToolErrorKind::ServerError
                | ToolErrorKind::DbDeadlock
                | ToolErrorKind::DbConnection
                | ToolErrorKind::DbTimeout
        )
    }
}

/// A tool failure as reported to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
    /// Worker-computed retry hint derived from kind + protocol code.
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pg_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_type: Option<String>,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
            code: None,
            http_status: None,
            pg_code: None,
            retry_after_ms: None,
            exception_type: None,
        }
    }

    /// Build an HTTP failure, refining retryability from the status code.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            401 | 403 => ToolErrorKind::Auth,
            404 => ToolErrorKind::NotFound,
            408 => ToolErrorKind::Timeout,
            429 => ToolErrorKind::RateLimit,
            s if s >= 500 => ToolErrorKind::ServerError,
            _ => ToolErrorKind::ClientError,
        };
        let mut err = Self::new(kind, message);
        err.http_status = Some(status);
        err
    }

    /// Build a non-retryable schema error (unknown tool kind, bad config).
    pub fn schema(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Schema, message)
    }

    /// Build a cancellation marker. Never retryable.
    pub fn cancelled() -> Self {
        Self::new(ToolErrorKind::Cancelled, "cancelled")
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
#[path = "tool_error_tests.rs"]
mod tests;
