//! A small diagnostics log shared between the service and its clients.
//!
//! This is an internal implementation, not visible to the public API.

#[cfg(feature = "logging")]
use crate::log::debug;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::SystemTime,
};

/// How many records the shared buffer retains before dropping the oldest.
const MAX_LOG_RECORDS: usize = 512;

pub(crate) fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

struct LogRecord {
    timestamp_ms: u64,
    tag: String,
    message: String,
}

/// A named logger over a ring buffer shared with its sub-components.
///
/// Every record is also mirrored to the `log` facade. The buffer backs the
/// plain-text state dump and keeps the most recent records only.
#[derive(Clone)]
pub(crate) struct SharedLog {
    tag: String,
    records: Arc<Mutex<VecDeque<LogRecord>>>,
}

impl SharedLog {
    pub(crate) fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            records: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Returns a logger writing into the same buffer under a nested tag.
    pub(crate) fn for_sub_component(&self, name: &str) -> Self {
        Self {
            tag: format!("{}.{}", self.tag, name),
            records: self.records.clone(),
        }
    }

    pub(crate) fn log(&self, message: impl Into<String>) {
        let message = message.into();
        debug!("[{}] {}", self.tag, message);
        let Ok(mut records) = self.records.lock() else {
            return;
        };
        if records.len() >= MAX_LOG_RECORDS {
            records.pop_front();
        }
        records.push_back(LogRecord {
            timestamp_ms: current_time_millis(),
            tag: self.tag.clone(),
            message,
        });
    }

    /// Renders the buffered records, most recent first.
    pub(crate) fn dump(&self) -> String {
        let Ok(records) = self.records.lock() else {
            return String::new();
        };
        let mut out = String::new();
        for record in records.iter().rev() {
            out.push_str(&format!(
                "{} [{}] {}\n",
                record.timestamp_ms, record.tag, record.message
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::SharedLog;
    use test_log::test;

    #[test]
    fn test_sub_component_shares_buffer() {
        let root = SharedLog::new("serviceDiscovery");
        let sub = root.for_sub_component("Client1000-1");
        root.log("first");
        sub.log("second");

        let dump = root.dump();
        let first_pos = dump.find("first").unwrap();
        let second_pos = dump.find("second").unwrap();
        // Reverse chronological: the later record comes first.
        assert!(second_pos < first_pos);
        assert!(dump.contains("[serviceDiscovery.Client1000-1] second"));
    }

    #[test]
    fn test_buffer_is_bounded() {
        let log = SharedLog::new("bounded");
        for i in 0..1000 {
            log.log(format!("record {}", i));
        }
        let dump = log.dump();
        assert!(!dump.contains("record 0\n"));
        assert!(dump.contains("record 999"));
    }
}
