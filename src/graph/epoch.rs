use std::collections::VecDeque;
use std::sync::RwLock;

use uuid::Uuid;

use crate::error::Result;
use crate::sync::{read, write};
use crate::types::Timestamp;

/// How many finished epochs the history keeps.
pub const EPOCH_HISTORY_RETENTION: usize = 1000;

/// The replication epoch commits currently belong to, plus the history of
/// finished epochs as `(epoch_id, last_committed_timestamp)` pairs.
#[derive(Debug)]
pub struct ReplicationEpoch {
    current: RwLock<String>,
    history: RwLock<VecDeque<(String, Timestamp)>>,
}

impl Default for ReplicationEpoch {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationEpoch {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Uuid::new_v4().to_string()),
            history: RwLock::new(VecDeque::new()),
        }
    }

    pub fn id(&self) -> Result<String> {
        Ok(read(&self.current)?.clone())
    }

    /// Closes the current epoch at `last_commit_timestamp` and opens a new one.
    /// Returns the new epoch id.
    pub fn start_new_epoch(&self, last_commit_timestamp: Timestamp) -> Result<String> {
        let new_id = Uuid::new_v4().to_string();
        let old_id = std::mem::replace(&mut *write(&self.current)?, new_id.clone());
        let mut history = write(&self.history)?;
        history.push_back((old_id, last_commit_timestamp));
        while history.len() > EPOCH_HISTORY_RETENTION {
            history.pop_front();
        }
        Ok(new_id)
    }

    pub fn history(&self) -> Result<Vec<(String, Timestamp)>> {
        Ok(read(&self.history)?.iter().cloned().collect())
    }

    pub(crate) fn restore(&self, id: String, history: Vec<(String, Timestamp)>) -> Result<()> {
        *write(&self.current)? = id;
        *write(&self.history)? = history.into_iter().collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_append_only_and_bounded() {
        let epoch = ReplicationEpoch::new();
        let first = epoch.id().unwrap();
        let second = epoch.start_new_epoch(7).unwrap();
        assert_ne!(first, second);
        assert_eq!(epoch.history().unwrap(), vec![(first, 7)]);

        for ts in 0..EPOCH_HISTORY_RETENTION as u64 + 5 {
            epoch.start_new_epoch(ts).unwrap();
        }
        let history = epoch.history().unwrap();
        assert_eq!(history.len(), EPOCH_HISTORY_RETENTION);
        assert!(history.windows(2).all(|w| w[0].1 <= w[1].1));
    }
}
