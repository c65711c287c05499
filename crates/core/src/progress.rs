use serde::{Deserialize, Serialize};

/// Run-level counters. Owned by the controller; sinks only ever see copies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub total: u64,
    pub done: u64,
    pub errors: u64,
    pub queued: u64,
    pub current: Option<String>,
}

impl Progress {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            queued: total,
            ..Self::default()
        }
    }

    pub fn finished(&self) -> u64 {
        self.done + self.errors
    }
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: &Progress);

    /// Byte progress of one file, as an integer percentage.
    fn on_file_progress(&self, _file_name: &str, _percent: u8) {}
}

/// Integer percentage of `sent` over `total`, rounded. Empty payloads are complete.
pub fn percent(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let sent = sent.min(total) as f64;
    ((sent / total as f64) * 100.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_rounds_and_saturates() {
        assert_eq!(percent(0, 200), 0);
        assert_eq!(percent(1, 200), 1);
        assert_eq!(percent(199, 200), 100);
        assert_eq!(percent(500, 200), 100);
        assert_eq!(percent(0, 0), 100);
    }

    #[test]
    fn new_progress_starts_fully_queued() {
        let p = Progress::new(5);
        assert_eq!(p.queued, 5);
        assert_eq!(p.finished(), 0);
        assert!(p.current.is_none());
    }
}
