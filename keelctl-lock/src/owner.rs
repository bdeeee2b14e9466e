//! Process owner identity and lease values.

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;

/// Identifies one running process. Every lease value starts with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerId(String);

impl OwnerId {
    /// `<hostname>:<pid>:<random>`, computed once per lock instance.
    pub fn generate() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        Self(format!("{host}:{}:{}", std::process::id(), random_suffix(8)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fresh lease value: `<owner>:<timestamp_ms>:<random>`.
    pub fn lease_value(&self) -> String {
        format!(
            "{}:{}:{}",
            self.0,
            Utc::now().timestamp_millis(),
            random_suffix(12)
        )
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
