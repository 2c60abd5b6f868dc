//! Per-message failures reported by a batch handler.

use std::collections::HashMap;
use std::fmt;

use crate::error::SharedError;

/// Failures for individual messages of a batch, keyed by message id.
///
/// Return this (converted into `anyhow::Error`) from a batch handler to fail
/// only some messages: ids present in the map receive their error, every
/// other message in the batch succeeds.
///
/// ```ignore
/// let mut failures = BatchError::new();
/// failures.insert(&msg.id, anyhow!("invalid payload"));
/// return Err(failures.into());
/// ```
#[derive(Debug, Default)]
pub struct BatchError {
    errors: HashMap<String, anyhow::Error>,
}

impl BatchError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the failure of one message.
    pub fn insert(&mut self, message_id: impl Into<String>, err: anyhow::Error) {
        self.errors.insert(message_id.into(), err);
    }

    /// Builder form of [`BatchError::insert`].
    pub fn with(mut self, message_id: impl Into<String>, err: anyhow::Error) -> Self {
        self.insert(message_id, err);
        self
    }

    pub fn get(&self, message_id: &str) -> Option<&anyhow::Error> {
        self.errors.get(message_id)
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub(crate) fn into_shared(self) -> HashMap<String, SharedError> {
        self.errors
            .into_iter()
            .map(|(id, err)| (id, SharedError::new(err)))
            .collect()
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<_> = self.errors.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        let parts: Vec<String> = entries
            .into_iter()
            .map(|(id, err)| format!("{err} for message '{id}'"))
            .collect();
        f.write_str(&parts.join(", "))
    }
}

impl std::error::Error for BatchError {}

impl<K: Into<String>> FromIterator<(K, anyhow::Error)> for BatchError {
    fn from_iter<T: IntoIterator<Item = (K, anyhow::Error)>>(iter: T) -> Self {
        Self {
            errors: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_error_string() {
        let err = BatchError::new().with("1", anyhow!("error 1"));
        assert_eq!(err.to_string(), "error 1 for message '1'");
    }

    #[test]
    fn test_error_string_is_sorted() {
        let err: BatchError = vec![("b", anyhow!("late")), ("a", anyhow!("early"))]
            .into_iter()
            .collect();
        assert_eq!(err.to_string(), "early for message 'a', late for message 'b'");
        assert_eq!(err.len(), 2);
    }

    #[test]
    fn test_survives_anyhow_round_trip() {
        let err: anyhow::Error = BatchError::new().with("7", anyhow!("bad")).into();
        let batch = err.downcast::<BatchError>().unwrap();
        assert_eq!(batch.get("7").unwrap().to_string(), "bad");
        assert!(batch.get("8").is_none());
    }
}
