// Event Merge Algebra
//
// Folds successive mutations of one logical row into their net effect.
// Every (pending, incoming) kind pair is an explicit transition; pairs
// that cannot happen in a well-ordered log are reported, never applied.

pub mod map;

use std::collections::HashMap;

use crate::log::{EventKind, RawEvent};
use crate::row::key::row_key;
use crate::row::{decode_row, Column, ColumnDecoder, Image, RowError};
use crate::schema::TableInfo;

pub use map::{EventMap, KeyConflict};

/// A row mutation being compacted.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedEvent {
    pub schema: String,
    pub table: String,
    pub kind: EventKind,
    /// Identity of the row before the mutation.
    pub old_key: String,
    /// Identity after the mutation; equal to `old_key` unless an Update
    /// changed key columns.
    pub new_key: String,
    pub columns: Vec<Column>,
    pub deleted: bool,
}

/// Outcome of folding an incoming event into the pending one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// No pending event; the incoming one is stored as is.
    Added,
    /// The incoming event was folded into the pending one.
    Folded,
    /// The pending event was overwritten by the incoming one.
    Replaced,
    /// The two cancel out; nothing remains for the row.
    Removed,
    /// Impossible kind pair; the pending event is unchanged.
    Invalid,
}

impl MergedEvent {
    /// Decode a raw event and derive both of its keys.
    pub fn from_raw(
        raw: &RawEvent,
        decoder: &dyn ColumnDecoder,
        info: &TableInfo,
    ) -> Result<Self, RowError> {
        let columns = decode_row(decoder, &raw.columns)?;
        let old_key = row_key(&columns, info, Image::Pre)?;
        let new_key = match raw.kind {
            EventKind::Update => row_key(&columns, info, Image::Post)?,
            EventKind::Insert | EventKind::Delete => old_key.clone(),
        };

        Ok(Self {
            schema: raw.schema.clone(),
            table: raw.table.clone(),
            kind: raw.kind,
            old_key,
            new_key,
            columns,
            deleted: false,
        })
    }

    /// Key this event is stored under while pending.
    pub fn map_key(&self) -> &str {
        match self.kind {
            EventKind::Delete => &self.old_key,
            EventKind::Insert | EventKind::Update => &self.new_key,
        }
    }

    /// Fold `incoming`, a later mutation of the same row, into `self`.
    ///
    /// On [`Transition::Invalid`] `self` is left untouched and `incoming`
    /// is dropped.
    pub fn merge(&mut self, incoming: MergedEvent) -> Transition {
        use EventKind::*;

        match (self.kind, incoming.kind) {
            (Insert, Update) => {
                self.columns = incoming
                    .columns
                    .iter()
                    .map(|c| c.settled(Image::Post))
                    .collect();
                self.old_key = incoming.new_key.clone();
                self.new_key = incoming.new_key;
                Transition::Folded
            }

            (Insert, Delete) => {
                self.deleted = true;
                Transition::Removed
            }

            (Update, Update) => {
                let pre: HashMap<&str, &Column> =
                    self.columns.iter().map(|c| (c.name.as_str(), c)).collect();
                let columns = incoming
                    .columns
                    .iter()
                    .map(|c| Column {
                        name: c.name.clone(),
                        tp: c.tp,
                        value: pre
                            .get(c.name.as_str())
                            .map_or(&c.value, |p| &p.value)
                            .clone(),
                        changed_value: Some(c.image(Image::Post).clone()),
                    })
                    .collect();
                self.columns = columns;
                self.new_key = incoming.new_key;
                Transition::Folded
            }

            // The row is deleted under the identity it had before the window.
            (Update, Delete) if self.old_key != self.new_key => {
                *self = MergedEvent {
                    kind: Delete,
                    new_key: self.old_key.clone(),
                    columns: self.columns.iter().map(|c| c.settled(Image::Pre)).collect(),
                    ..incoming
                };
                self.old_key = self.new_key.clone();
                Transition::Replaced
            }

            (Update, Delete) | (Delete, Insert) => {
                *self = incoming;
                Transition::Replaced
            }

            (Insert, Insert) | (Update, Insert) | (Delete, Update) | (Delete, Delete) => {
                Transition::Invalid
            }
        }
    }

    /// Encode the columns back into a raw event for output.
    pub fn to_raw(&self, decoder: &dyn ColumnDecoder) -> Result<RawEvent, RowError> {
        let columns = self
            .columns
            .iter()
            .map(|c| decoder.encode(c))
            .collect::<Result<_, _>>()?;
        Ok(RawEvent {
            schema: self.schema.clone(),
            table: self.table.clone(),
            kind: self.kind,
            columns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{MysqlType, Value};

    fn column(name: &str, value: i64, changed: Option<i64>) -> Column {
        Column {
            name: name.into(),
            tp: MysqlType::Long,
            value: Value::Int(value),
            changed_value: changed.map(Value::Int),
        }
    }

    fn event(kind: EventKind, old_key: &str, new_key: &str, columns: Vec<Column>) -> MergedEvent {
        MergedEvent {
            schema: "s".into(),
            table: "t".into(),
            kind,
            old_key: old_key.into(),
            new_key: new_key.into(),
            columns,
            deleted: false,
        }
    }

    #[test]
    fn insert_then_update_keeps_insert_with_post_image() {
        let mut pending = event(EventKind::Insert, "2|", "2|", vec![column("a", 2, None), column("b", 0, None)]);
        let update = event(
            EventKind::Update,
            "2|",
            "9|",
            vec![column("a", 2, Some(9)), column("b", 0, Some(1))],
        );

        assert_eq!(pending.merge(update), Transition::Folded);
        assert_eq!(pending.kind, EventKind::Insert);
        assert_eq!(pending.map_key(), "9|");
        assert_eq!(pending.old_key, "9|");
        assert_eq!(pending.columns, vec![column("a", 9, None), column("b", 1, None)]);
    }

    #[test]
    fn update_then_update_keeps_first_pre_image() {
        let mut pending = event(EventKind::Update, "1|", "1|", vec![column("a", 1, Some(1)), column("b", 0, Some(5))]);
        let second = event(EventKind::Update, "1|", "3|", vec![column("a", 1, Some(3)), column("b", 5, Some(7))]);

        assert_eq!(pending.merge(second), Transition::Folded);
        assert_eq!(pending.old_key, "1|");
        assert_eq!(pending.new_key, "3|");
        assert_eq!(pending.columns, vec![column("a", 1, Some(3)), column("b", 0, Some(7))]);
    }

    #[test]
    fn insert_then_delete_cancels() {
        let mut pending = event(EventKind::Insert, "1|", "1|", vec![column("a", 1, None)]);
        let delete = event(EventKind::Delete, "1|", "1|", vec![column("a", 1, None)]);
        assert_eq!(pending.merge(delete), Transition::Removed);
        assert!(pending.deleted);
    }

    #[test]
    fn delete_replaces_update_under_original_identity() {
        let mut same_key = event(EventKind::Update, "1|", "1|", vec![column("a", 1, Some(1)), column("b", 0, Some(5))]);
        let delete = event(EventKind::Delete, "1|", "1|", vec![column("a", 1, None), column("b", 5, None)]);
        assert_eq!(same_key.merge(delete.clone()), Transition::Replaced);
        assert_eq!(same_key, delete);

        let mut rekeyed = event(EventKind::Update, "1|", "4|", vec![column("a", 1, Some(4)), column("b", 0, Some(5))]);
        let delete = event(EventKind::Delete, "4|", "4|", vec![column("a", 4, None), column("b", 5, None)]);
        assert_eq!(rekeyed.merge(delete), Transition::Replaced);
        assert_eq!(rekeyed.kind, EventKind::Delete);
        assert_eq!(rekeyed.map_key(), "1|");
        assert_eq!(rekeyed.new_key, "1|");
        assert_eq!(rekeyed.columns, vec![column("a", 1, None), column("b", 0, None)]);
    }

    #[test]
    fn insert_replaces_pending_delete() {
        let mut pending = event(EventKind::Delete, "1|", "1|", vec![column("a", 1, None), column("b", 0, None)]);
        let insert = event(EventKind::Insert, "1|", "1|", vec![column("a", 1, None), column("b", 8, None)]);
        assert_eq!(pending.merge(insert.clone()), Transition::Replaced);
        assert_eq!(pending, insert);
    }

    #[test]
    fn impossible_pairs_leave_pending_untouched() {
        let cases = [
            (EventKind::Insert, EventKind::Insert),
            (EventKind::Update, EventKind::Insert),
            (EventKind::Delete, EventKind::Update),
            (EventKind::Delete, EventKind::Delete),
        ];
        for (pending_kind, incoming_kind) in cases {
            let original = event(pending_kind, "1|", "1|", vec![column("a", 1, None)]);
            let mut pending = original.clone();
            let incoming = event(incoming_kind, "1|", "1|", vec![column("a", 2, None)]);
            assert_eq!(pending.merge(incoming), Transition::Invalid, "{pending_kind:?} + {incoming_kind:?}");
            assert_eq!(pending, original);
        }
    }

    #[test]
    fn from_raw_derives_pre_and_post_keys() {
        use crate::row::JsonColumnDecoder;
        use crate::schema::IndexInfo;

        let info = TableInfo {
            columns: vec!["a".into(), "b".into()],
            primary_key: Some(IndexInfo {
                name: "PRIMARY".into(),
                columns: vec!["a".into()],
            }),
            unique_keys: vec![],
        };
        let raw = RawEvent {
            schema: "s".into(),
            table: "t".into(),
            kind: EventKind::Update,
            columns: vec![
                JsonColumnDecoder.encode(&column("a", 2, Some(9))).unwrap(),
                JsonColumnDecoder.encode(&column("b", 0, Some(1))).unwrap(),
            ],
        };

        let merged = MergedEvent::from_raw(&raw, &JsonColumnDecoder, &info).unwrap();
        assert_eq!((merged.old_key.as_str(), merged.new_key.as_str()), ("2|", "9|"));
        assert_eq!(merged.to_raw(&JsonColumnDecoder).unwrap(), raw);
    }
}
