use std::collections::VecDeque;

pub const HISTORY_CAPACITY: usize = 10;
const LAST_MESSAGE_CHARS: usize = 500;
const SUMMARY_ENTRIES: usize = 5;
const SUMMARY_CHARS: usize = 100;

/// Most recent inbound messages, newest first.
#[derive(Debug, Clone)]
pub struct MessageHistory {
    entries: VecDeque<String>,
    capacity: usize,
}

impl Default for MessageHistory {
    fn default() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }
}

impl MessageHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, message: &str) {
        self.entries.push_front(message.to_string());
        self.entries.truncate(self.capacity);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn last_message(&self) -> Option<&str> {
        self.entries
            .front()
            .map(|msg| truncate_chars(msg, LAST_MESSAGE_CHARS))
    }

    /// Debug log view: `[1] <first 100 chars>...` for the five newest.
    pub fn summary(&self) -> String {
        self.entries
            .iter()
            .take(SUMMARY_ENTRIES)
            .enumerate()
            .map(|(i, msg)| format!("[{}] {}...", i + 1, truncate_chars(msg, SUMMARY_CHARS)))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
