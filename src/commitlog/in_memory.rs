use crate::commitlog::{Entry, Index, Log};
use std::collections::VecDeque;
use std::io;
use std::marker::PhantomData;

// Durability is out of scope for this log; it models the storage contract in RAM. Entries are
// still round-tripped through their byte representation to exercise the codec.
pub struct InMemoryLog<E: Entry> {
    log: VecDeque<Vec<u8>>,
    // Index of `log[0]`.
    first_index: Index,
    _pd: PhantomData<E>,
}

impl<E: Entry> InMemoryLog<E> {
    pub fn create() -> Result<Self, io::Error> {
        Ok(InMemoryLog {
            log: VecDeque::new(),
            first_index: Index::start_index(),
            _pd: PhantomData::default(),
        })
    }

    fn offset(&self, index: Index) -> Option<usize> {
        if index < self.first_index {
            return None;
        }
        let offset = (index.as_u64() - self.first_index.as_u64()) as usize;
        if offset < self.log.len() {
            Some(offset)
        } else {
            None
        }
    }
}

impl<E: Entry> Log<E> for InMemoryLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        let index = self.next_index();
        self.log.push_back(entry.into());

        Ok(index)
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        match self.offset(index) {
            Some(offset) => E::try_from(self.log[offset].clone()).map(Some),
            None => Ok(None),
        }
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        if index <= self.first_index {
            self.log.clear();
        } else if let Some(offset) = self.offset(index) {
            self.log.truncate(offset);
        }

        Ok(())
    }

    fn compact(&mut self, index: Index) -> Result<(), io::Error> {
        if index < self.first_index {
            return Ok(());
        }

        match self.offset(index) {
            Some(offset) => {
                self.log.drain(..=offset);
            }
            None => self.log.clear(),
        }
        self.first_index = index.plus(1);

        Ok(())
    }

    fn first_index(&self) -> Index {
        self.first_index
    }

    fn next_index(&self) -> Index {
        self.first_index.plus(self.log.len() as u64)
    }
}
