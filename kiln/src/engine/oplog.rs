use crate::document::{Document, Value};
use crate::driver::{OperationType, ResumeToken, UpdateDescription};
use crate::errors::{ErrorKind, KilnError, KilnResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// One change, before it is assigned a position in the log.
#[derive(Debug, Clone)]
pub(crate) struct Change {
    pub ns: String,
    pub operation: OperationType,
    pub document_key: Option<Value>,
    /// Set for inserts and replaces. Updates look the document up when read.
    pub full_document: Option<Arc<Document>>,
    pub update_description: Option<UpdateDescription>,
}

impl Change {
    /// A change that affects the whole namespace rather than a document.
    pub fn namespace(ns: &str, operation: OperationType) -> Self {
        Change {
            ns: ns.to_string(),
            operation,
            document_key: None,
            full_document: None,
            update_description: None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct OplogEntry {
    pub seq: u64,
    pub change: Change,
}

impl OplogEntry {
    pub fn token(&self) -> ResumeToken {
        encode_token(self.seq)
    }

    /// Returns whether a feed on the namespace sees this entry. Dropping the
    /// database is reported to the feeds of all of its namespaces.
    pub fn watched_by(&self, ns: &str, db: &str) -> bool {
        match self.change.operation {
            OperationType::DropDatabase => self.change.ns == db,
            _ => self.change.ns == ns,
        }
    }
}

pub(crate) fn encode_token(seq: u64) -> ResumeToken {
    ResumeToken::from_bytes(seq.to_be_bytes().to_vec())
}

pub(crate) fn decode_token(token: &ResumeToken) -> KilnResult<u64> {
    let bytes: [u8; 8] = token.as_bytes().try_into().map_err(|_| {
        KilnError::new(
            &format!("malformed resume token {:?}", token),
            ErrorKind::InvalidOperation,
        )
    })?;
    Ok(u64::from_be_bytes(bytes))
}

/// The result of polling the log.
pub(crate) enum Poll {
    /// The next entry after the polled position.
    Entry(Arc<OplogEntry>),
    /// Nothing new arrived before the wait elapsed. Carries the position the
    /// log was scanned up to.
    Idle(u64),
}

struct OplogState {
    entries: VecDeque<Arc<OplogEntry>>,
    last_seq: u64,
    /// Entries up to and including this position have been evicted.
    evicted: u64,
    closed: bool,
}

/// A bounded, ordered log of committed changes.
///
/// Positions are sequence numbers starting at 1; position 0 is the start of
/// the log. Once the log holds more than its capacity the oldest entries are
/// evicted and feeds positioned behind them fail with `HistoryLost`.
pub(crate) struct Oplog {
    capacity: usize,
    state: Mutex<OplogState>,
    signal: Condvar,
}

impl Oplog {
    pub fn new(capacity: usize) -> Self {
        Oplog {
            capacity: capacity.max(1),
            state: Mutex::new(OplogState {
                entries: VecDeque::new(),
                last_seq: 0,
                evicted: 0,
                closed: false,
            }),
            signal: Condvar::new(),
        }
    }

    /// Appends changes in order and wakes up waiting feeds.
    pub fn append(&self, changes: Vec<Change>) {
        if changes.is_empty() {
            return;
        }

        let mut state = self.state.lock();
        for change in changes {
            state.last_seq += 1;
            let entry = Arc::new(OplogEntry {
                seq: state.last_seq,
                change,
            });
            state.entries.push_back(entry);
        }

        while state.entries.len() > self.capacity {
            if let Some(evicted) = state.entries.pop_front() {
                state.evicted = evicted.seq;
            }
        }
        drop(state);
        self.signal.notify_all();
    }

    /// The position of the last appended entry.
    pub fn position(&self) -> u64 {
        self.state.lock().last_seq
    }

    /// Checks that a feed can continue after the position.
    pub fn check_position(&self, after: u64) -> KilnResult<()> {
        let state = self.state.lock();
        Self::check(&state, after)
    }

    fn check(state: &OplogState, after: u64) -> KilnResult<()> {
        if after > state.last_seq {
            return Err(KilnError::new(
                "resume token does not belong to this change feed",
                ErrorKind::HistoryLost,
            ));
        }
        if after < state.evicted {
            return Err(KilnError::new(
                "resume point is no longer in the change feed",
                ErrorKind::HistoryLost,
            ));
        }
        Ok(())
    }

    /// Returns the first entry after the position that the namespace watches,
    /// waiting up to `wait` for one to arrive.
    pub fn poll(&self, after: u64, ns: &str, db: &str, wait: Duration) -> KilnResult<Poll> {
        let mut state = self.state.lock();
        let mut waited = false;
        loop {
            if state.closed {
                return Err(KilnError::new("engine has been closed", ErrorKind::ConnectionError));
            }
            Self::check(&state, after)?;

            let start = state.entries.partition_point(|entry| entry.seq <= after);
            let found = state
                .entries
                .iter()
                .skip(start)
                .find(|entry| entry.watched_by(ns, db))
                .cloned();
            if let Some(entry) = found {
                return Ok(Poll::Entry(entry));
            }

            if waited {
                return Ok(Poll::Idle(state.last_seq));
            }
            self.signal.wait_for(&mut state, wait);
            waited = true;
        }
    }

    /// Wakes up all feeds and fails their next poll.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.signal.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(ns: &str, operation: OperationType) -> Change {
        Change::namespace(ns, operation)
    }

    #[test]
    fn test_tokens_round_trip() {
        assert_eq!(decode_token(&encode_token(42)).unwrap(), 42);
        assert!(decode_token(&ResumeToken::from_bytes(vec![1, 2])).is_err());
    }

    #[test]
    fn test_polls_entries_of_namespace() {
        let oplog = Oplog::new(16);
        oplog.append(vec![
            change("db.a", OperationType::Insert),
            change("db.b", OperationType::Insert),
            change("db.a", OperationType::Delete),
        ]);

        let first = match oplog.poll(0, "db.a", "db", Duration::from_millis(1)).unwrap() {
            Poll::Entry(entry) => entry,
            Poll::Idle(_) => panic!("expected entry"),
        };
        assert_eq!(first.seq, 1);

        let second = match oplog.poll(first.seq, "db.a", "db", Duration::from_millis(1)).unwrap() {
            Poll::Entry(entry) => entry,
            Poll::Idle(_) => panic!("expected entry"),
        };
        assert_eq!(second.seq, 3);
        assert_eq!(second.change.operation, OperationType::Delete);

        match oplog.poll(3, "db.a", "db", Duration::from_millis(1)).unwrap() {
            Poll::Idle(position) => assert_eq!(position, 3),
            Poll::Entry(_) => panic!("expected idle"),
        }
    }

    #[test]
    fn test_drop_database_reaches_all_namespaces() {
        let oplog = Oplog::new(16);
        oplog.append(vec![change("db", OperationType::DropDatabase)]);
        match oplog.poll(0, "db.a", "db", Duration::from_millis(1)).unwrap() {
            Poll::Entry(entry) => assert_eq!(entry.change.operation, OperationType::DropDatabase),
            Poll::Idle(_) => panic!("expected entry"),
        }
        match oplog.poll(0, "other.a", "other", Duration::from_millis(1)).unwrap() {
            Poll::Idle(_) => {}
            Poll::Entry(_) => panic!("expected idle"),
        }
    }

    #[test]
    fn test_evicted_history_is_lost() {
        let oplog = Oplog::new(2);
        oplog.append(vec![
            change("db.a", OperationType::Insert),
            change("db.a", OperationType::Insert),
            change("db.a", OperationType::Insert),
        ]);
        assert_eq!(oplog.position(), 3);
        assert!(oplog.check_position(1).is_ok());
        let err = oplog.check_position(0).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::HistoryLost);
        assert_eq!(oplog.check_position(9).unwrap_err().kind(), &ErrorKind::HistoryLost);
    }

    #[test]
    fn test_closed_log_fails_polls() {
        let oplog = Oplog::new(2);
        oplog.close();
        let err = oplog.poll(0, "db.a", "db", Duration::from_millis(1)).err().unwrap();
        assert_eq!(err.kind(), &ErrorKind::ConnectionError);
    }
}
