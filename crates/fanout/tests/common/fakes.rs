#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::json;

use fanout::completion::ContentPart;
use fanout::{Completion, CompletionClient, CompletionError, CompletionRequest};

/// Completion client keyed on the unit text:
/// - text containing `FAIL` always fails with a 500
/// - text containing `FLAKY` fails on its first call only
/// - anything else is answered with `summary of <text>`
#[derive(Default)]
pub struct FakeCompletionClient {
    calls: AtomicUsize,
    seen: Mutex<HashMap<String, usize>>,
    delay: Mutex<Duration>,
}

impl FakeCompletionClient {
    pub fn with_delay(delay: Duration) -> Self {
        let client = Self::default();
        *client.delay.lock().unwrap() = delay;
        client
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of calls made with exactly `text`.
    pub fn calls_for(&self, text: &str) -> usize {
        self.seen.lock().unwrap().get(text).copied().unwrap_or(0)
    }
}

impl CompletionClient for FakeCompletionClient {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = request
            .parts
            .iter()
            .find_map(|p| match p {
                ContentPart::Text(t) => Some(t.clone()),
                _ => None,
            })
            .unwrap_or_default();

        let seen = {
            let mut seen = self.seen.lock().unwrap();
            let count = seen.entry(text.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        if text.contains("FAIL") || (text.contains("FLAKY") && seen == 1) {
            return Err(CompletionError::Status {
                status: 500,
                body: "upstream exploded".to_string(),
            });
        }

        Ok(Completion {
            provider: "fake".to_string(),
            model: request.model.clone(),
            text: format!("summary of {}", text),
            tokens_used: 7,
            raw: json!({ "choices": [] }),
        })
    }
}
