use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One entry of a GraphQL response's `errors` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphqlError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<serde_json::Value>,
}

impl GraphqlError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
            extensions: None,
        }
    }
}

impl std::fmt::Display for GraphqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// The full `errors` array of one operation result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphqlErrorList(pub Vec<GraphqlError>);

impl GraphqlErrorList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for GraphqlErrorList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for err in &self.0 {
            if !first {
                f.write_str("; ")?;
            }
            f.write_str(&err.message)?;
            first = false;
        }
        Ok(())
    }
}

impl From<Vec<GraphqlError>> for GraphqlErrorList {
    fn from(value: Vec<GraphqlError>) -> Self {
        Self(value)
    }
}

/// Raised when an operation's result carries `errors`.
#[derive(Debug, Clone, Error)]
#[error("graphql operation failed: {errors}")]
pub struct GraphqlException {
    pub errors: GraphqlErrorList,
}

impl GraphqlException {
    pub fn new(errors: impl Into<GraphqlErrorList>) -> Self {
        Self {
            errors: errors.into(),
        }
    }
}
