use crate::replica::cluster::ReplicaId;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Term(u64);

impl Term {
    pub fn new(term: u64) -> Self {
        Term(term)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn incr(&mut self) {
        self.0 += 1;
    }

    pub(crate) fn next(&self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// PersistentLocalState is used whenever raft requires that something is persisted to a
/// durable store to guarantee safety. Not everything that uses disk has to go through this, only
/// algorithm-correctness-critical ones: the current term and the vote cast in it.
///
/// Store methods should be implemented atomically via a CAS like operation. Similar to most CAS
/// method signatures, the CAS store methods will return true if we have mutated state. An `Err`
/// means the store can no longer be trusted, and the replica stops participating.
pub trait PersistentLocalState {
    /// Set current term to `new_term` atomically, iff it is larger than current term.
    ///
    /// CAS: Return true if we successfully mutated state.
    fn store_term_if_increased(&mut self, new_term: Term) -> io::Result<bool>;

    /// Store our vote for the latest term iff the latest term (internal state) is the same term as
    /// the one provided, and we have not stored a vote for the latest term.
    ///
    /// CAS: Return true if we successfully mutated state.
    fn store_vote_for_term_if_unvoted(&mut self, expected_current_term: Term, vote: ReplicaId) -> io::Result<bool>;

    /// Return the new term. Used when transitioning to candidate.
    fn increment_term_and_vote_for_self(&mut self) -> io::Result<Term>;

    fn current_term(&self) -> Term;
    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>);
}

/// In-memory term/vote state. A restart forgets votes, so only use it where a restarted node
/// also comes back with fresh storage.
pub struct VolatileLocalState {
    current_term: Term,
    voted_for_this_term: Option<Arc<ReplicaId>>,
    my_replica_id: Arc<ReplicaId>,
}

impl VolatileLocalState {
    pub fn new(my_replica_id: ReplicaId) -> Self {
        VolatileLocalState {
            current_term: Term::new(0),
            voted_for_this_term: None,
            my_replica_id: Arc::new(my_replica_id),
        }
    }
}

impl PersistentLocalState for VolatileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> io::Result<bool> {
        if new_term <= self.current_term {
            Ok(false)
        } else {
            self.current_term = new_term;
            self.voted_for_this_term = None;
            Ok(true)
        }
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: ReplicaId) -> io::Result<bool> {
        if expected_term == self.current_term && self.voted_for_this_term.is_none() {
            self.voted_for_this_term.replace(Arc::new(vote));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn increment_term_and_vote_for_self(&mut self) -> io::Result<Term> {
        self.current_term.incr();
        self.voted_for_this_term.replace(self.my_replica_id.clone());

        Ok(self.current_term)
    }

    fn current_term(&self) -> Term {
        self.current_term
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>) {
        (self.current_term, self.voted_for_this_term.clone())
    }
}

/// File-backed term/vote state. Every mutation is written to a temp file, synced, then renamed
/// over the previous state before the in-memory copy changes.
///
/// File format is a single line: `{term} {voted_for}`, where `voted_for` may be empty.
pub struct FileLocalState {
    path: PathBuf,
    memory: VolatileLocalState,
}

impl FileLocalState {
    pub fn open<P: AsRef<Path>>(path: P, my_replica_id: ReplicaId) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut memory = VolatileLocalState::new(my_replica_id);

        match fs::read_to_string(&path) {
            Ok(contents) => {
                let (term, voted_for) = Self::parse(&contents)?;
                memory.current_term = term;
                memory.voted_for_this_term = voted_for.map(Arc::new);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        Ok(FileLocalState { path, memory })
    }

    fn parse(contents: &str) -> io::Result<(Term, Option<ReplicaId>)> {
        let line = contents.trim_end_matches('\n');
        let (term, vote) = match line.find(' ') {
            Some(split) => (&line[..split], &line[split + 1..]),
            None => (line, ""),
        };
        let term = term
            .parse::<u64>()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("bad term: {}", e)))?;
        let vote = if vote.is_empty() {
            None
        } else {
            Some(ReplicaId::new(vote))
        };

        Ok((Term::new(term), vote))
    }

    fn persist(&self, term: Term, voted_for: Option<&ReplicaId>) -> io::Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            let vote = voted_for.map(|v| v.as_str()).unwrap_or("");
            writeln!(file, "{} {}", term.as_u64(), vote)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)
    }
}

impl PersistentLocalState for FileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> io::Result<bool> {
        if new_term <= self.memory.current_term {
            return Ok(false);
        }
        self.persist(new_term, None)?;
        self.memory.store_term_if_increased(new_term)
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: ReplicaId) -> io::Result<bool> {
        if expected_term != self.memory.current_term || self.memory.voted_for_this_term.is_some() {
            return Ok(false);
        }
        self.persist(expected_term, Some(&vote))?;
        self.memory.store_vote_for_term_if_unvoted(expected_term, vote)
    }

    fn increment_term_and_vote_for_self(&mut self) -> io::Result<Term> {
        let new_term = self.memory.current_term.next();
        self.persist(new_term, Some(&self.memory.my_replica_id))?;
        self.memory.increment_term_and_vote_for_self()
    }

    fn current_term(&self) -> Term {
        self.memory.current_term()
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>) {
        self.memory.voted_for_current_term()
    }
}

impl fmt::Debug for FileLocalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileLocalState({:?})", self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("logstream-raft-{}-{}.state", name, std::process::id()))
    }

    #[test]
    fn volatile_cas_semantics() {
        let me = ReplicaId::new("me");
        let mut state = VolatileLocalState::new(me.clone());

        assert!(!state.store_term_if_increased(Term::new(0)).unwrap());
        assert!(state.store_term_if_increased(Term::new(3)).unwrap());
        assert!(!state.store_vote_for_term_if_unvoted(Term::new(2), ReplicaId::new("a")).unwrap());
        assert!(state.store_vote_for_term_if_unvoted(Term::new(3), ReplicaId::new("a")).unwrap());
        assert!(!state.store_vote_for_term_if_unvoted(Term::new(3), ReplicaId::new("b")).unwrap());

        let term = state.increment_term_and_vote_for_self().unwrap();
        assert_eq!(term, Term::new(4));
        let (term, vote) = state.voted_for_current_term();
        assert_eq!(term, Term::new(4));
        assert_eq!(vote.as_deref(), Some(&me));
    }

    #[test]
    fn file_state_survives_reopen() {
        let path = temp_path("reopen");
        let me = ReplicaId::new("me");
        {
            let mut state = FileLocalState::open(&path, me.clone()).unwrap();
            assert_eq!(state.current_term(), Term::new(0));
            assert!(state.store_term_if_increased(Term::new(7)).unwrap());
            assert!(state
                .store_vote_for_term_if_unvoted(Term::new(7), ReplicaId::new("peer-2"))
                .unwrap());
        }

        let mut reopened = FileLocalState::open(&path, me.clone()).unwrap();
        let (term, vote) = reopened.voted_for_current_term();
        assert_eq!(term, Term::new(7));
        assert_eq!(vote.as_deref(), Some(&ReplicaId::new("peer-2")));

        // Already voted this term, even after a restart.
        assert!(!reopened
            .store_vote_for_term_if_unvoted(Term::new(7), ReplicaId::new("peer-3"))
            .unwrap());
        assert_eq!(reopened.increment_term_and_vote_for_self().unwrap(), Term::new(8));

        let reopened = FileLocalState::open(&path, me.clone()).unwrap();
        let (term, vote) = reopened.voted_for_current_term();
        assert_eq!(term, Term::new(8));
        assert_eq!(vote.as_deref(), Some(&me));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn file_state_rejects_garbage() {
        let path = temp_path("garbage");
        fs::write(&path, "not-a-term x").unwrap();

        let err = FileLocalState::open(&path, ReplicaId::new("me")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let _ = fs::remove_file(&path);
    }
}
