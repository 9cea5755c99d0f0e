use crate::api::{RaftEntry, RaftEntryId, RaftEvent, ReaderMode};
use crate::commitlog::{Index, Log};
use crate::replica::cluster::Member;
use crate::replica::event_bus::EventPublisher;
use crate::replica::local_state::Term;
use crate::replica::write_ahead_log::log_entry::{EntryPayload, RaftLogEntry};
use std::io;

/// RaftLog is the raft-specific log facade.
///
/// Note: A log entry has 3 states (not modeled directly in code):
/// 1. Persisted - written to disk, not yet replicated to majority
/// 2. Committed - written to disk, replicated to majority
/// 3. Applied - a committed entry that has been published to commit listeners
///
/// A log entry's state has no global truth. Each replica will have their own local view of what
/// state the log entry is in.
///
/// A prefix of the log may be replaced by a snapshot. The snapshot boundary is the (term, index)
/// of the last entry covered by the snapshot, and is treated as a virtual entry when matching
/// logs and computing commits.
pub(crate) struct RaftLog<L>
where
    L: Log<RaftLogEntry>,
{
    // Application's info/debug log.
    logger: slog::Logger,

    // This is the log that we're replicating.
    log: L,
    // Metadata about the highest log entry that we've locally written. It must be updated atomically.
    latest_entry_metadata: Option<(Term, Index)>,
    // Metadata about the last entry covered by the latest snapshot.
    snapshot_boundary: Option<(Term, Index)>,

    // Committed entries are published here, in index order.
    event_publisher: EventPublisher,
    // Index of highest log entry known to be committed. None if nothing is committed.
    commit_index: Option<Index>,
    // Index of highest log entry published to commit listeners. None if nothing is applied.
    last_applied_index: Option<Index>,
}

impl<L> RaftLog<L>
where
    L: Log<RaftLogEntry>,
{
    /// Rebuilds in-memory metadata from whatever `log` already holds. Everything covered by the
    /// snapshot is considered committed and applied.
    pub(crate) fn new(
        logger: slog::Logger,
        log: L,
        snapshot_boundary: Option<(Term, Index)>,
        event_publisher: EventPublisher,
    ) -> Result<Self, io::Error> {
        let first_index = log.first_index();
        let next_index = log.next_index();

        // Every index before the first retained one must be covered by the snapshot.
        if let Some(last_compacted) = first_index.checked_minus(1) {
            match snapshot_boundary {
                Some((_, snapshot_index)) if snapshot_index >= last_compacted => {}
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "log starts at {:?} but no snapshot covers the entries before it",
                            first_index
                        ),
                    ))
                }
            }
        }

        let latest_in_log = match next_index.checked_minus(1) {
            Some(last_index) if last_index >= first_index => match log.read(last_index)? {
                Some(entry) => Some((entry.term, last_index)),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("log is missing its last entry at {:?}", last_index),
                    ))
                }
            },
            _ => None,
        };

        let latest_entry_metadata = match (latest_in_log, snapshot_boundary) {
            (Some(in_log), Some(boundary)) if boundary.1 > in_log.1 => Some(boundary),
            (Some(in_log), _) => Some(in_log),
            (None, boundary) => boundary,
        };

        let snapshot_index = snapshot_boundary.map(|(_, index)| index);
        if latest_entry_metadata.is_some() {
            slog::info!(
                logger,
                "Recovered log. Latest entry: {:?}, snapshot boundary: {:?}",
                latest_entry_metadata,
                snapshot_boundary
            );
        }

        Ok(RaftLog {
            logger,
            log,
            latest_entry_metadata,
            snapshot_boundary,
            event_publisher,
            commit_index: snapshot_index,
            last_applied_index: snapshot_index,
        })
    }

    pub(crate) fn latest_entry(&self) -> Option<(Term, Index)> {
        self.latest_entry_metadata
    }

    pub(crate) fn latest_index(&self) -> Option<Index> {
        self.latest_entry_metadata.map(|(_, index)| index)
    }

    pub(crate) fn next_index(&self) -> Index {
        self.latest_index()
            .map(|index| index.plus(1))
            .unwrap_or_else(Index::start_index)
    }

    pub(crate) fn snapshot_boundary(&self) -> Option<(Term, Index)> {
        self.snapshot_boundary
    }

    pub(crate) fn first_retained_index(&self) -> Index {
        self.log.first_index()
    }

    /// Term of the entry at `index`, including the snapshot boundary. `None` if the index is
    /// compacted away or not yet written.
    pub(crate) fn term_at(&self, index: Index) -> Result<Option<Term>, io::Error> {
        if let Some((snapshot_term, snapshot_index)) = self.snapshot_boundary {
            if index == snapshot_index {
                return Ok(Some(snapshot_term));
            }
            if index < snapshot_index && index < self.log.first_index() {
                return Ok(None);
            }
        }

        Ok(self.log.read(index)?.map(|entry| entry.term))
    }

    /// Reads up to `max` consecutive entries starting at `from`. Stops early at the end of the log.
    pub(crate) fn entries(&self, from: Index, max: usize) -> Result<Vec<RaftLogEntry>, io::Error> {
        let mut entries = Vec::new();
        let mut index = from;
        while entries.len() < max {
            match self.log.read(index)? {
                Some(entry) => entries.push(entry),
                None => break,
            }
            index = index.plus(1);
        }

        Ok(entries)
    }

    pub(crate) fn append(&mut self, entry: RaftLogEntry) -> Result<Index, io::Error> {
        let appended_term = entry.term;
        let appended_index = self.log.append(entry)?;
        // Only update state after log action completes.
        self.latest_entry_metadata = Some((appended_term, appended_index));

        Ok(appended_index)
    }

    /// Remove anything starting at `index` and later. Committed entries are never removed.
    pub(crate) fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        if matches!(self.commit_index, Some(ci) if ci >= index) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "refusing to truncate at {:?}, entries up to {:?} are committed",
                    index, self.commit_index
                ),
            ));
        }

        let new_latest_entry_metadata = match index.checked_minus(1) {
            None => None,
            Some(new_latest_index) => self
                .term_at(new_latest_index)?
                .map(|term| (term, new_latest_index)),
        };

        self.log.truncate(index)?;

        self.latest_entry_metadata = new_latest_entry_metadata;
        Ok(())
    }

    pub(crate) fn commit_index(&self) -> Option<Index> {
        self.commit_index
    }

    pub(crate) fn last_applied_index(&self) -> Option<Index> {
        self.last_applied_index
    }

    /// Leader path. Returns true if the commit index moved forward.
    pub(crate) fn ratchet_fwd_commit_index_if_valid(
        &mut self,
        tentative_new_commit_index: Index,
        current_term: Term,
    ) -> Result<bool, io::Error> {
        if matches!(self.commit_index, Some(ci) if ci >= tentative_new_commit_index) {
            return Ok(false);
        }

        // > If there exists an N such that N > commitIndex, a majority
        // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
        // > set commitIndex = N (§5.3, §5.4).
        if self.term_at(tentative_new_commit_index)? != Some(current_term) {
            return Ok(false);
        }

        Ok(self.ratchet_fwd_commit_index(tentative_new_commit_index))
    }

    /// Follower path. Never moves backwards, and never past our own log. Returns true if the
    /// commit index moved forward.
    pub(crate) fn ratchet_fwd_commit_index(&mut self, new_commit_index: Index) -> bool {
        let latest_locally_written_index = match self.latest_index() {
            Some(index) => index,
            None => {
                slog::warn!(
                    self.logger,
                    "Can't ratchet commit index to {:?} with an empty log",
                    new_commit_index
                );
                return false;
            }
        };
        let new_commit_index = std::cmp::min(new_commit_index, latest_locally_written_index);

        if matches!(self.commit_index, Some(ci) if ci >= new_commit_index) {
            return false;
        }

        self.commit_index.replace(new_commit_index);
        true
    }

    /// apply_all_committed_entries publishes all committed but unapplied entries in order, and
    /// returns the highest applied index if anything was applied.
    pub(crate) fn apply_all_committed_entries(&mut self) -> Result<Option<Index>, io::Error> {
        let commit_index = match self.commit_index {
            Some(ci) => ci,
            None => return Ok(None),
        };

        let mut applied_any = false;
        let mut next_index = self
            .last_applied_index
            .map(|i| i.plus(1))
            .unwrap_or_else(Index::start_index);

        // This may be a long running loop, and starve the Replica event loop from handling
        // another event. Only a follower catching up on a large backlog should see that.
        while next_index <= commit_index {
            let entry = match self.log.read(next_index)? {
                Some(entry) => entry,
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("committed entry {:?} is missing from the log", next_index),
                    ))
                }
            };

            self.event_publisher
                .publish(RaftEvent::Commit(to_raft_entry(next_index, entry)));
            self.last_applied_index.replace(next_index);
            applied_any = true;
            next_index = next_index.plus(1);
        }

        if applied_any {
            Ok(self.last_applied_index)
        } else {
            Ok(None)
        }
    }

    /// Discards everything up to and including `index`, which must already be applied. The
    /// caller must have durably stored a snapshot covering it first.
    pub(crate) fn compact(&mut self, index: Index) -> Result<(), io::Error> {
        if !matches!(self.last_applied_index, Some(applied) if applied >= index) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "can't compact to {:?}, only applied up to {:?}",
                    index, self.last_applied_index
                ),
            ));
        }

        let term = match self.term_at(index)? {
            Some(term) => term,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no entry at compaction index {:?}", index),
                ))
            }
        };

        self.log.compact(index)?;
        self.snapshot_boundary = Some((term, index));
        slog::info!(self.logger, "Compacted log up to {:?}", index);

        Ok(())
    }

    /// Adopts an installed snapshot. If our log already holds the snapshot's last entry, the
    /// suffix after it is kept. Otherwise the whole log is discarded. Returns whether the suffix
    /// was kept.
    pub(crate) fn install_snapshot_boundary(&mut self, term: Term, index: Index) -> Result<bool, io::Error> {
        let keep_suffix = matches!(self.term_at(index)?, Some(existing) if existing == term)
            && matches!(self.latest_index(), Some(latest) if latest >= index);

        if keep_suffix {
            self.log.compact(index)?;
        } else {
            let first_index = self.log.first_index();
            self.log.truncate(first_index)?;
            self.log.compact(index)?;
            self.latest_entry_metadata = Some((term, index));
        }

        self.snapshot_boundary = Some((term, index));
        if !matches!(self.commit_index, Some(ci) if ci >= index) {
            self.commit_index = Some(index);
        }
        if !matches!(self.last_applied_index, Some(applied) if applied >= index) {
            self.last_applied_index = Some(index);
        }

        slog::info!(
            self.logger,
            "Installed snapshot boundary ({:?}, {:?}). Kept log suffix: {}",
            term,
            index,
            keep_suffix
        );
        Ok(keep_suffix)
    }

    /// Configuration entries still present in the retained log, in index order.
    pub(crate) fn configuration_entries(&self) -> Result<Vec<(Index, Vec<Member>)>, io::Error> {
        let mut configurations = Vec::new();
        let mut index = self.log.first_index();
        while index < self.log.next_index() {
            if let Some(entry) = self.log.read(index)? {
                if let EntryPayload::Configuration(members) = entry.payload {
                    configurations.push((index, members));
                }
            }
            index = index.plus(1);
        }

        Ok(configurations)
    }

    /// Entries from `from` up to the commit index or the end of the log, depending on `mode`.
    /// Reads below the first retained index start at the first retained index.
    pub(crate) fn reader(&self, from: Index, mode: ReaderMode) -> Result<Vec<RaftEntry>, io::Error> {
        let upper = match mode {
            ReaderMode::Commits => self.commit_index,
            ReaderMode::All => self.latest_index(),
        };
        let upper = match upper {
            Some(upper) => upper,
            None => return Ok(Vec::new()),
        };

        let mut index = std::cmp::max(from, self.log.first_index());
        let mut entries = Vec::new();
        while index <= upper {
            match self.log.read(index)? {
                Some(entry) => entries.push(to_raft_entry(index, entry)),
                None => break,
            }
            index = index.plus(1);
        }

        Ok(entries)
    }
}

fn to_raft_entry(index: Index, entry: RaftLogEntry) -> RaftEntry {
    RaftEntry {
        entry_id: RaftEntryId {
            term: entry.term,
            index,
        },
        payload: entry.payload.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{RaftEntryPayload, RaftEventKind};
    use crate::commitlog::InMemoryLog;
    use crate::replica::event_bus;
    use bytes::Bytes;

    fn new_log() -> (RaftLog<InMemoryLog<RaftLogEntry>>, event_bus::EventDispatcher) {
        let (publisher, dispatcher) = event_bus::new(slog::Logger::root(slog::Discard, slog::o!()));
        let log = RaftLog::new(
            slog::Logger::root(slog::Discard, slog::o!()),
            InMemoryLog::create().unwrap(),
            None,
            publisher,
        )
        .unwrap();

        (log, dispatcher)
    }

    fn app(term: u64, data: &'static str) -> RaftLogEntry {
        RaftLogEntry::application(Term::new(term), Bytes::from_static(data.as_bytes()))
    }

    #[test]
    fn append_and_truncate_track_latest_entry() {
        let (mut log, _dispatcher) = new_log();
        assert_eq!(log.latest_entry(), None);
        assert_eq!(log.next_index(), Index::start_index());

        log.append(app(1, "a")).unwrap();
        log.append(app(1, "b")).unwrap();
        log.append(app(2, "c")).unwrap();
        assert_eq!(log.latest_entry(), Some((Term::new(2), Index::new(3))));

        log.truncate(Index::new(3)).unwrap();
        assert_eq!(log.latest_entry(), Some((Term::new(1), Index::new(2))));

        log.truncate(Index::new(1)).unwrap();
        assert_eq!(log.latest_entry(), None);
    }

    #[test]
    fn commit_requires_current_term_and_never_truncates_committed() {
        let (mut log, _dispatcher) = new_log();
        log.append(app(1, "a")).unwrap();
        log.append(app(2, "b")).unwrap();

        // Entry 1 is from a previous term, so it can't be committed by counting replicas.
        assert!(!log
            .ratchet_fwd_commit_index_if_valid(Index::new(1), Term::new(2))
            .unwrap());
        assert_eq!(log.commit_index(), None);

        assert!(log
            .ratchet_fwd_commit_index_if_valid(Index::new(2), Term::new(2))
            .unwrap());
        assert_eq!(log.commit_index(), Some(Index::new(2)));

        // Never backwards.
        assert!(!log.ratchet_fwd_commit_index(Index::new(1)));
        assert_eq!(log.commit_index(), Some(Index::new(2)));

        let err = log.truncate(Index::new(2)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn follower_commit_is_capped_by_local_log() {
        let (mut log, _dispatcher) = new_log();
        assert!(!log.ratchet_fwd_commit_index(Index::new(5)));

        log.append(app(1, "a")).unwrap();
        assert!(log.ratchet_fwd_commit_index(Index::new(5)));
        assert_eq!(log.commit_index(), Some(Index::new(1)));
    }

    #[tokio::test]
    async fn applies_committed_entries_in_order() {
        let (mut log, dispatcher) = new_log();
        let publisher = log.event_publisher.clone();
        tokio::spawn(dispatcher.run());
        let mut commits = publisher.subscribe(Some(RaftEventKind::Commit));

        log.append(RaftLogEntry::initialize(Term::new(1))).unwrap();
        log.append(app(1, "a")).unwrap();
        log.append(app(1, "b")).unwrap();
        log.ratchet_fwd_commit_index(Index::new(2));

        assert_eq!(log.apply_all_committed_entries().unwrap(), Some(Index::new(2)));
        assert_eq!(log.apply_all_committed_entries().unwrap(), None);

        let first = commits.recv().await.unwrap();
        let second = commits.recv().await.unwrap();
        match (first, second) {
            (RaftEvent::Commit(first), RaftEvent::Commit(second)) => {
                assert_eq!(first.entry_id.index(), 1);
                assert_eq!(first.payload, RaftEntryPayload::Initialize);
                assert_eq!(second.entry_id.index(), 2);
                assert_eq!(second.payload, RaftEntryPayload::Application(Bytes::from_static(b"a")));
            }
            other => panic!("Unexpected events {:?}", other),
        }
    }

    #[test]
    fn compaction_keeps_boundary_as_virtual_entry() {
        let (mut log, _dispatcher) = new_log();
        for _ in 0..5 {
            log.append(app(3, "x")).unwrap();
        }
        log.ratchet_fwd_commit_index(Index::new(4));

        // Not applied yet.
        assert!(log.compact(Index::new(3)).is_err());

        log.apply_all_committed_entries().unwrap();
        log.compact(Index::new(3)).unwrap();

        assert_eq!(log.snapshot_boundary(), Some((Term::new(3), Index::new(3))));
        assert_eq!(log.first_retained_index(), Index::new(4));
        assert_eq!(log.term_at(Index::new(3)).unwrap(), Some(Term::new(3)));
        assert_eq!(log.term_at(Index::new(2)).unwrap(), None);
        assert_eq!(log.latest_entry(), Some((Term::new(3), Index::new(5))));

        let all = log.reader(Index::start_index(), ReaderMode::All).unwrap();
        assert_eq!(all.len(), 2);
        let committed = log.reader(Index::start_index(), ReaderMode::Commits).unwrap();
        assert_eq!(committed.len(), 1);
    }

    #[test]
    fn install_snapshot_discards_conflicting_log() {
        let (mut log, _dispatcher) = new_log();
        log.append(app(1, "a")).unwrap();
        log.append(app(1, "b")).unwrap();

        assert!(!log.install_snapshot_boundary(Term::new(4), Index::new(10)).unwrap());

        assert_eq!(log.latest_entry(), Some((Term::new(4), Index::new(10))));
        assert_eq!(log.commit_index(), Some(Index::new(10)));
        assert_eq!(log.last_applied_index(), Some(Index::new(10)));
        assert_eq!(log.next_index(), Index::new(11));
        assert_eq!(log.term_at(Index::new(1)).unwrap(), None);
    }

    #[test]
    fn install_snapshot_keeps_matching_suffix() {
        let (mut log, _dispatcher) = new_log();
        for _ in 0..4 {
            log.append(app(2, "a")).unwrap();
        }

        assert!(log.install_snapshot_boundary(Term::new(2), Index::new(2)).unwrap());

        assert_eq!(log.latest_entry(), Some((Term::new(2), Index::new(4))));
        assert_eq!(log.first_retained_index(), Index::new(3));
        assert_eq!(log.commit_index(), Some(Index::new(2)));
    }

    #[test]
    fn recovers_from_non_empty_log() {
        let mut inner: InMemoryLog<RaftLogEntry> = InMemoryLog::create().unwrap();
        inner.append(app(1, "a")).unwrap();
        inner.append(app(2, "b")).unwrap();
        inner.compact(Index::new(1)).unwrap();

        let (publisher, _dispatcher) = event_bus::new(slog::Logger::root(slog::Discard, slog::o!()));
        let logger = slog::Logger::root(slog::Discard, slog::o!());

        // Compacted prefix with no snapshot is corrupt.
        let missing_snapshot = RaftLog::new(logger.clone(), inner, None, publisher.clone());
        assert_eq!(missing_snapshot.err().unwrap().kind(), io::ErrorKind::InvalidData);

        let mut inner: InMemoryLog<RaftLogEntry> = InMemoryLog::create().unwrap();
        inner.append(app(1, "a")).unwrap();
        inner.append(app(2, "b")).unwrap();
        inner.compact(Index::new(1)).unwrap();
        let log = RaftLog::new(logger, inner, Some((Term::new(1), Index::new(1))), publisher).unwrap();

        assert_eq!(log.latest_entry(), Some((Term::new(2), Index::new(2))));
        assert_eq!(log.commit_index(), Some(Index::new(1)));
        assert_eq!(log.last_applied_index(), Some(Index::new(1)));
    }
}
