//! Owned measurements with bounded undo/redo history.

use crate::{Measurement, MeasurementId};
use std::collections::VecDeque;

/// Records kept per history stack.
pub const MAX_HISTORY: usize = 50;

/// Point tolerance used to recognise the same measurement.
pub const MATCH_TOLERANCE_MM: f64 = 1e-3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistoryOp {
    Add,
    Remove,
    Modify,
}

/// One undoable step. `snapshot` is the measurement after `Add`, before
/// `Remove`, and before `Modify`.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryRecord {
    pub op: HistoryOp,
    pub snapshot: Measurement,
    /// Position in the store when the step was taken.
    pub index: usize,
}

/// Insertion-ordered measurements, selection and history.
#[derive(Clone, Debug)]
pub struct MeasurementStore {
    items: Vec<Measurement>,
    selected: Option<MeasurementId>,
    next_id: u64,
    undo: VecDeque<HistoryRecord>,
    redo: VecDeque<HistoryRecord>,
    recording: bool,
}

impl Default for MeasurementStore {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            selected: None,
            next_id: 1,
            undo: VecDeque::new(),
            redo: VecDeque::new(),
            recording: true,
        }
    }
}

impl MeasurementStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[Measurement] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: MeasurementId) -> Option<&Measurement> {
        self.items.iter().find(|m| m.id == id)
    }

    fn position(&self, id: MeasurementId) -> Option<usize> {
        self.items.iter().position(|m| m.id == id)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn set_recording(&mut self, on: bool) {
        self.recording = on;
    }

    fn record(&mut self, op: HistoryOp, snapshot: Measurement, index: usize) {
        if !self.recording {
            return;
        }
        if self.undo.len() == MAX_HISTORY {
            self.undo.pop_front();
        }
        self.undo.push_back(HistoryRecord {
            op,
            snapshot,
            index,
        });
        self.redo.clear();
    }

    /// Append `m`, assigning a fresh id.
    pub fn add(&mut self, mut m: Measurement) -> MeasurementId {
        let id = MeasurementId(self.next_id);
        self.next_id += 1;
        m.id = id;
        m.selected = false;
        self.record(HistoryOp::Add, m.clone(), self.items.len());
        log::debug!("store: add {} {id}", m.kind);
        self.items.push(m);
        id
    }

    pub fn remove(&mut self, id: MeasurementId) -> Option<Measurement> {
        let index = self.position(id)?;
        let mut m = self.items.remove(index);
        m.selected = false;
        if self.selected == Some(id) {
            self.selected = None;
        }
        self.record(HistoryOp::Remove, m.clone(), index);
        log::debug!("store: remove {} {id}", m.kind);
        Some(m)
    }

    /// Replace the measurement with `m.id`, keeping its position.
    pub fn modify(&mut self, m: Measurement) -> Option<Measurement> {
        let index = self.position(m.id)?;
        let old = std::mem::replace(&mut self.items[index], m);
        self.record(HistoryOp::Modify, old.clone(), index);
        Some(old)
    }

    /// Remove everything; each removal is undone individually.
    pub fn clear(&mut self) {
        while let Some(last) = self.items.last() {
            let id = last.id;
            self.remove(id);
        }
        self.selected = None;
    }

    pub fn selected(&self) -> Option<MeasurementId> {
        self.selected
    }

    pub fn select(&mut self, id: Option<MeasurementId>) {
        self.selected = id.filter(|id| self.position(*id).is_some());
        for m in &mut self.items {
            m.selected = Some(m.id) == self.selected;
        }
    }

    pub fn delete_selected(&mut self) -> Option<Measurement> {
        let id = self.selected?;
        self.remove(id)
    }

    /// First measurement of the same kind whose points all lie within
    /// [`MATCH_TOLERANCE_MM`] of `m`'s.
    pub fn find_matching(&self, m: &Measurement) -> Option<MeasurementId> {
        self.items
            .iter()
            .find(|other| other.matches(m, MATCH_TOLERANCE_MM))
            .map(|other| other.id)
    }

    fn insert_at(&mut self, index: usize, m: Measurement) {
        let index = index.min(self.items.len());
        self.items.insert(index, m);
    }

    /// Revert the most recent step.
    pub fn undo(&mut self) -> bool {
        let Some(mut rec) = self.undo.pop_back() else {
            return false;
        };
        let was = std::mem::replace(&mut self.recording, false);
        let applied = match rec.op {
            HistoryOp::Add => self
                .find_record_target(&rec.snapshot)
                .map(|id| self.remove(id))
                .is_some(),
            HistoryOp::Remove => {
                self.insert_at(rec.index, rec.snapshot.clone());
                true
            }
            HistoryOp::Modify => self.swap_in(&mut rec),
        };
        self.recording = was;
        log::debug!("store: undo {:?} {}", rec.op, rec.snapshot.id);
        if applied {
            push_bounded(&mut self.redo, rec);
        }
        applied
    }

    /// Re-apply the most recently undone step.
    pub fn redo(&mut self) -> bool {
        let Some(mut rec) = self.redo.pop_back() else {
            return false;
        };
        let was = std::mem::replace(&mut self.recording, false);
        let applied = match rec.op {
            HistoryOp::Add => {
                self.insert_at(rec.index, rec.snapshot.clone());
                true
            }
            HistoryOp::Remove => self
                .find_record_target(&rec.snapshot)
                .map(|id| self.remove(id))
                .is_some(),
            HistoryOp::Modify => self.swap_in(&mut rec),
        };
        self.recording = was;
        log::debug!("store: redo {:?} {}", rec.op, rec.snapshot.id);
        if applied {
            push_bounded(&mut self.undo, rec);
        }
        applied
    }

    /// Exchange the stored measurement with the record's snapshot, so the
    /// same record serves both directions.
    fn swap_in(&mut self, rec: &mut HistoryRecord) -> bool {
        let Some(index) = self.position(rec.snapshot.id) else {
            return false;
        };
        std::mem::swap(&mut self.items[index], &mut rec.snapshot);
        true
    }

    fn find_record_target(&self, snapshot: &Measurement) -> Option<MeasurementId> {
        self.position(snapshot.id)
            .map(|_| snapshot.id)
            .or_else(|| self.find_matching(snapshot))
    }
}

fn push_bounded(stack: &mut VecDeque<HistoryRecord>, rec: HistoryRecord) {
    if stack.len() == MAX_HISTORY {
        stack.pop_front();
    }
    stack.push_back(rec);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Evaluation, MeasurementKind};
    use nalgebra::{Point2, Point3};

    fn length(x: f64) -> Measurement {
        Measurement::new(
            MeasurementKind::Length,
            vec![Point3::new(0.0, 0.0, 500.0), Point3::new(x, 0.0, 500.0)],
            vec![Point2::new(0.0, 0.0), Point2::new(1.0, 0.0)],
            Evaluation {
                value: x,
                text: format!("{x:.2} mm"),
                abnormal: false,
            },
        )
    }

    #[test]
    fn undo_redo_add_and_remove() {
        let mut s = MeasurementStore::new();
        let a = s.add(length(10.0));
        let b = s.add(length(20.0));
        s.remove(a);
        assert_eq!(s.len(), 1);
        assert!(s.undo());
        assert_eq!(s.items()[0].id, a);
        assert!(s.undo());
        assert_eq!(s.len(), 1);
        assert!(s.redo());
        assert_eq!(s.items().iter().map(|m| m.id).collect::<Vec<_>>(), vec![a, b]);
        assert!(s.redo());
        assert_eq!(s.items()[0].id, b);
        assert!(!s.redo());
    }

    #[test]
    fn new_operation_clears_redo() {
        let mut s = MeasurementStore::new();
        s.add(length(1.0));
        s.undo();
        assert!(s.can_redo());
        s.add(length(2.0));
        assert!(!s.can_redo());
    }

    #[test]
    fn history_is_bounded() {
        let mut s = MeasurementStore::new();
        for i in 0..60 {
            s.add(length(i as f64));
        }
        assert_eq!(s.undo_len(), MAX_HISTORY);
        while s.undo() {}
        assert_eq!(s.len(), 10);
    }

    #[test]
    fn clear_is_undone_one_by_one() {
        let mut s = MeasurementStore::new();
        for i in 1..=3 {
            s.add(length(i as f64));
        }
        let before = s.items().to_vec();
        s.clear();
        assert!(s.is_empty());
        for n in 1..=3 {
            assert!(s.undo());
            assert_eq!(s.len(), n);
        }
        assert_eq!(s.items(), &before[..]);
    }

    #[test]
    fn modify_round_trips() {
        let mut s = MeasurementStore::new();
        let id = s.add(length(5.0));
        let mut changed = s.get(id).cloned().unwrap();
        changed.visible = false;
        s.modify(changed);
        assert!(!s.get(id).unwrap().visible);
        s.undo();
        assert!(s.get(id).unwrap().visible);
        s.redo();
        assert!(!s.get(id).unwrap().visible);
    }

    #[test]
    fn selection_and_delete() {
        let mut s = MeasurementStore::new();
        let a = s.add(length(5.0));
        s.select(Some(a));
        assert!(s.get(a).unwrap().selected);
        s.select(Some(MeasurementId(99)));
        assert_eq!(s.selected(), None);
        s.select(Some(a));
        assert!(s.delete_selected().is_some());
        assert!(s.is_empty());
        assert_eq!(s.find_matching(&length(5.0)), None);
        s.undo();
        assert_eq!(s.find_matching(&length(5.0005)), Some(a));
    }
}
