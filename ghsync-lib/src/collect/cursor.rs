use crate::Result;
use crate::store::{FromRow, RowQuery, SqliteStore};
use std::collections::VecDeque;

/// Lazy, forward-only iterator over the rows of a query.
///
/// Rows are fetched in batches of `batch_size`; the store lock is held only while a batch is
/// read, never between calls to `next`. The query is validated when the cursor is created.
/// After an error or the last row, the cursor yields `None` forever.
#[derive(Debug)]
pub struct RowCursor<T> {
    store: SqliteStore,
    query: RowQuery,
    batch_size: u32,
    offset: u64,
    buffered: VecDeque<T>,
    exhausted: bool,
}

impl<T: FromRow> RowCursor<T> {
    pub fn new(store: SqliteStore, query: RowQuery, batch_size: u32) -> Result<Self> {
        store.validate_query(&query)?;

        Ok(Self {
            store,
            query,
            batch_size: batch_size.max(1),
            offset: 0,
            buffered: VecDeque::new(),
            exhausted: false,
        })
    }
}

impl<T: FromRow> Iterator for RowCursor<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(row) = self.buffered.pop_front() {
            return Some(Ok(row));
        }

        if self.exhausted {
            return None;
        }

        match self.store.fetch_batch::<T>(&self.query, self.offset, self.batch_size) {
            Ok(batch) => {
                let fetched = batch.len();
                if fetched < self.batch_size as usize {
                    self.exhausted = true;
                }

                self.offset += fetched as u64;
                self.buffered.extend(batch);
                self.buffered.pop_front().map(Ok)
            }
            Err(e) => {
                self.exhausted = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewRawRecord, PayloadEncoding, WriteMode};
    use rusqlite::Row;

    #[derive(Debug, PartialEq)]
    struct Key(String);

    impl FromRow for Key {
        fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
            Ok(Self(row.get("dedup_key")?))
        }
    }

    fn seeded(count: usize) -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        for i in 0..count {
            let key = format!("{i:03}");
            let record = NewRawRecord {
                raw_table: "t",
                params: "p",
                payload: b"{}",
                encoding: PayloadEncoding::Json,
                source_url: "u",
                input: None,
                dedup_key: &key,
            };
            store.insert_raw(&record, WriteMode::Replace).unwrap();
        }
        store
    }

    fn query() -> RowQuery {
        RowQuery::new("SELECT dedup_key FROM raw_records WHERE raw_table = ? ORDER BY dedup_key").bind("t".to_string())
    }

    #[test]
    fn yields_every_row_across_batches_in_order() {
        let store = seeded(7);
        let keys: Vec<Key> = RowCursor::new(store, query(), 3).unwrap().map(Result::unwrap).collect();

        assert_eq!(keys.len(), 7);
        assert_eq!(keys[0], Key("000".into()));
        assert_eq!(keys[6], Key("006".into()));
    }

    #[test]
    fn exact_multiple_of_batch_size_terminates() {
        let store = seeded(6);
        let cursor: RowCursor<Key> = RowCursor::new(store, query(), 3).unwrap();
        assert_eq!(cursor.count(), 6);
    }

    #[test]
    fn empty_result_yields_nothing() {
        let store = seeded(0);
        let mut cursor: RowCursor<Key> = RowCursor::new(store, query(), 3).unwrap();
        assert!(cursor.next().is_none());
        assert!(cursor.next().is_none());
    }

    #[test]
    fn invalid_query_fails_at_construction() {
        let store = seeded(1);
        let result: Result<RowCursor<Key>> = RowCursor::new(store, RowQuery::new("SELECT * FROM nope ORDER BY 1"), 3);
        assert!(result.is_err());
    }

    #[test]
    fn row_conversion_error_is_yielded_once() {
        let store = seeded(2);
        let query = RowQuery::new("SELECT id FROM raw_records ORDER BY id");
        let mut cursor: RowCursor<Key> = RowCursor::new(store, query, 3).unwrap();

        assert!(cursor.next().unwrap().is_err());
        assert!(cursor.next().is_none());
    }
}
