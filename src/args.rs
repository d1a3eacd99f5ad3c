//! Call arguments and the prompt/api partition rule.
//!
//! Every backend operation takes a single bag of keyword-style arguments.
//! A key written entirely in upper case (`QUERY`, `SOURCE_TEXT`) is a *prompt
//! argument*: template content destined for the user-facing message. Every
//! other key (`temperature`, `max_tokens`, `messages`) is an *api argument*
//! forwarded verbatim to the backend.
//!
//! # Example
//! ```
//! use llmux::args::QueryArgs;
//!
//! let args = QueryArgs::new()
//!     .with("QUERY", "Summarize this document")
//!     .with("temperature", 0.1);
//!
//! let (prompt, api) = args.partition();
//! assert!(prompt.contains_key("QUERY"));
//! assert!(api.contains_key("temperature"));
//! ```

use serde_json::{Map, Value};

use crate::error::{LlmError, Result};

/// One side of a partitioned argument set.
pub type ArgMap = Map<String, Value>;

/// Keyword-style arguments for a single backend call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryArgs(ArgMap);

/// A key is a prompt argument iff uppercasing it is a no-op.
///
/// Digits and underscores are case-neutral, so `"SECTION_2"` is a prompt key
/// while `"call_limit"` and `"Query"` are api keys.
pub fn is_prompt_key(key: &str) -> bool {
    key == key.to_uppercase()
}

impl QueryArgs {
    /// Create an empty argument set.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Create from an existing map.
    pub fn from_map(map: ArgMap) -> Self {
        Self(map)
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert a key, replacing any existing value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Remove and return a key.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the underlying map.
    pub fn as_map(&self) -> &ArgMap {
        &self.0
    }

    /// Consume into the underlying map.
    pub fn into_map(self) -> ArgMap {
        self.0
    }

    /// Split into `(prompt_args, api_args)` by the upper-case-key rule.
    ///
    /// Computed fresh per call; the partition is disjoint by construction.
    pub fn partition(&self) -> (ArgMap, ArgMap) {
        let mut prompt = Map::new();
        let mut api = Map::new();
        for (key, value) in &self.0 {
            if is_prompt_key(key) {
                prompt.insert(key.clone(), value.clone());
            } else {
                api.insert(key.clone(), value.clone());
            }
        }
        (prompt, api)
    }
}

impl From<ArgMap> for QueryArgs {
    fn from(map: ArgMap) -> Self {
        Self(map)
    }
}

/// Merge a prompt/api pair back into one argument set, api entries applied
/// after prompt entries.
///
/// The standard partition is disjoint, so a key present in both maps can only
/// come from a hook that constructed its own maps; that ambiguity is rejected
/// rather than resolved by precedence.
pub fn merge_args(prompt_args: ArgMap, api_args: ArgMap) -> Result<QueryArgs> {
    let mut merged = prompt_args;
    for (key, value) in api_args {
        if merged.contains_key(&key) {
            return Err(LlmError::InvalidRequest(format!(
                "argument '{}' present as both prompt and api argument",
                key
            )));
        }
        merged.insert(key, value);
    }
    Ok(QueryArgs(merged))
}
