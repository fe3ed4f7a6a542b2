//! Page mode and per-kind pick accumulation.

use crate::{MeasureError, MeasurementKind};
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

/// What clicks on the image currently mean.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    #[default]
    View,
    Add,
    Edit,
    Delete,
}

/// `{mode, active kind}` of the measurement page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateManager {
    mode: Mode,
    active: Option<MeasurementKind>,
}

impl StateManager {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn active_kind(&self) -> Option<MeasurementKind> {
        self.active
    }

    /// `View -> Add(kind)`; also switches kind while already adding.
    pub fn begin_add(&mut self, kind: MeasurementKind) {
        self.mode = Mode::Add;
        self.active = Some(kind);
    }

    /// `Add -> View` after completion or cancel.
    pub fn end_add(&mut self) {
        if self.mode == Mode::Add {
            self.mode = Mode::View;
        }
        self.active = None;
    }

    pub fn set_mode(&mut self, mode: Mode) {
        if mode != Mode::Add {
            self.active = None;
        }
        self.mode = mode;
    }
}

/// One resolved click.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pick {
    /// Click position in display pixels.
    pub display: Point2<f64>,
    /// Depth-map pixel the point was resolved at.
    pub pixel: Point2<f64>,
    /// Resolved point, millimetres, Y-up.
    pub point_mm: Point3<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateParams {
    /// Distance to the first pick under which a polygon is considered
    /// closed. Strict comparison.
    pub close_tolerance_mm: f64,
}

impl Default for StateParams {
    fn default() -> Self {
        Self {
            close_tolerance_mm: 5.0,
        }
    }
}

/// Result of feeding a pick to the state machine.
#[derive(Clone, Debug, PartialEq)]
pub enum PickOutcome {
    /// More picks needed.
    Pending,
    /// Polyline returned near its start; the caller may offer to finish.
    SuggestClose,
    /// Both missing-area segments are picked; the caller must supply the
    /// intersection through [`MeasurementStateMachine::insert_intersection`]
    /// or reject the last pick.
    SegmentsReady([Pick; 4]),
    /// The measurement is complete; the machine is back to idle.
    Ready(MeasurementKind, Vec<Pick>),
}

#[derive(Clone, Debug, Default, PartialEq)]
enum PickState {
    #[default]
    Idle,
    AcceptingPicks {
        kind: MeasurementKind,
        picks: Vec<Pick>,
        /// Missing-area intersection has been inserted at index 4.
        has_intersection: bool,
    },
}

/// `Idle -> AcceptingPicks(kind) -> Idle`, at most one measurement in
/// progress.
#[derive(Clone, Debug, Default)]
pub struct MeasurementStateMachine {
    params: StateParams,
    state: PickState,
}

impl MeasurementStateMachine {
    pub fn new(params: StateParams) -> Self {
        Self {
            params,
            state: PickState::Idle,
        }
    }

    pub fn params(&self) -> &StateParams {
        &self.params
    }

    pub fn is_idle(&self) -> bool {
        self.state == PickState::Idle
    }

    pub fn active_kind(&self) -> Option<MeasurementKind> {
        match &self.state {
            PickState::Idle => None,
            PickState::AcceptingPicks { kind, .. } => Some(*kind),
        }
    }

    pub fn picks(&self) -> &[Pick] {
        match &self.state {
            PickState::Idle => &[],
            PickState::AcceptingPicks { picks, .. } => picks,
        }
    }

    /// Start a measurement, dropping any pending picks.
    pub fn begin(&mut self, kind: MeasurementKind) {
        log::debug!("begin {kind} measurement");
        self.state = PickState::AcceptingPicks {
            kind,
            picks: Vec::new(),
            has_intersection: false,
        };
    }

    pub fn cancel(&mut self) {
        if let PickState::AcceptingPicks { kind, picks, .. } = &self.state {
            log::debug!("cancel {kind} measurement with {} picks", picks.len());
        }
        self.state = PickState::Idle;
    }

    /// Drop every pick but keep accepting the same kind.
    pub fn reset_picks(&mut self) {
        if let Some(kind) = self.active_kind() {
            self.begin(kind);
        }
    }

    /// Remove the most recent pick.
    pub fn pop_pick(&mut self) -> Option<Pick> {
        match &mut self.state {
            PickState::Idle => None,
            PickState::AcceptingPicks { picks, .. } => picks.pop(),
        }
    }

    pub fn add_pick(&mut self, pick: Pick) -> Result<PickOutcome, MeasureError> {
        let close_tol = self.params.close_tolerance_mm;
        let PickState::AcceptingPicks {
            kind,
            picks,
            has_intersection,
        } = &mut self.state
        else {
            return Err(MeasureError::NotMeasuring);
        };
        let kind = *kind;
        let near_first = |picks: &[Pick], p: &Pick| {
            picks
                .first()
                .is_some_and(|f| (p.point_mm - f.point_mm).norm() < close_tol)
        };

        match kind {
            MeasurementKind::Area => {
                if picks.len() >= 3 && near_first(picks, &pick) {
                    log::debug!("area closed on pick #{}", picks.len());
                    return Ok(self.complete());
                }
                picks.push(pick);
                Ok(PickOutcome::Pending)
            }
            MeasurementKind::Polyline => {
                let suggest = picks.len() >= 2 && near_first(picks, &pick);
                picks.push(pick);
                Ok(if suggest {
                    PickOutcome::SuggestClose
                } else {
                    PickOutcome::Pending
                })
            }
            MeasurementKind::MissingArea => {
                picks.push(pick);
                if picks.len() == 4 && !*has_intersection {
                    Ok(PickOutcome::SegmentsReady([picks[0], picks[1], picks[2], picks[3]]))
                } else {
                    Ok(PickOutcome::Pending)
                }
            }
            _ => {
                picks.push(pick);
                if Some(picks.len()) == kind.fixed_picks() {
                    Ok(self.complete())
                } else {
                    Ok(PickOutcome::Pending)
                }
            }
        }
    }

    /// Append the missing-area intersection after the two segments.
    pub fn insert_intersection(&mut self, pick: Pick) -> Result<(), MeasureError> {
        match &mut self.state {
            PickState::AcceptingPicks {
                kind: MeasurementKind::MissingArea,
                picks,
                has_intersection,
            } if picks.len() == 4 && !*has_intersection => {
                picks.push(pick);
                *has_intersection = true;
                Ok(())
            }
            PickState::Idle => Err(MeasureError::NotMeasuring),
            PickState::AcceptingPicks { kind, picks, .. } => Err(MeasureError::PointCount {
                kind: *kind,
                expected: 4,
                got: picks.len(),
            }),
        }
    }

    /// Explicit finish for open-ended kinds.
    pub fn finish(&mut self) -> Result<PickOutcome, MeasureError> {
        let PickState::AcceptingPicks {
            kind,
            picks,
            has_intersection,
        } = &self.state
        else {
            return Err(MeasureError::NotMeasuring);
        };
        let required = kind.min_picks();
        let enough = picks.len() >= required
            && (*kind != MeasurementKind::MissingArea || *has_intersection)
            && kind.fixed_picks().is_none();
        if !enough {
            return Err(MeasureError::PointCount {
                kind: *kind,
                expected: required,
                got: picks.len(),
            });
        }
        Ok(self.complete())
    }

    fn complete(&mut self) -> PickOutcome {
        match std::mem::take(&mut self.state) {
            PickState::AcceptingPicks { kind, picks, .. } => PickOutcome::Ready(kind, picks),
            PickState::Idle => PickOutcome::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pick(x: f64, y: f64) -> Pick {
        Pick {
            display: Point2::new(x, y),
            pixel: Point2::new(x, y),
            point_mm: Point3::new(x, y, 500.0),
        }
    }

    #[test]
    fn length_completes_on_second_pick() {
        let mut sm = MeasurementStateMachine::default();
        assert!(matches!(sm.add_pick(pick(0.0, 0.0)), Err(MeasureError::NotMeasuring)));
        sm.begin(MeasurementKind::Length);
        assert_eq!(sm.add_pick(pick(0.0, 0.0)).unwrap(), PickOutcome::Pending);
        let out = sm.add_pick(pick(1.0, 0.0)).unwrap();
        assert!(matches!(out, PickOutcome::Ready(MeasurementKind::Length, ref p) if p.len() == 2));
        assert!(sm.is_idle());
    }

    #[test]
    fn area_closes_strictly_inside_tolerance() {
        let mut sm = MeasurementStateMachine::default();
        sm.begin(MeasurementKind::Area);
        for p in [pick(0.0, 0.0), pick(100.0, 0.0), pick(100.0, 100.0)] {
            sm.add_pick(p).unwrap();
        }
        assert_eq!(sm.add_pick(pick(5.0, 0.0)).unwrap(), PickOutcome::Pending);
        sm.pop_pick();
        let out = sm.add_pick(pick(4.999, 0.0)).unwrap();
        assert!(matches!(out, PickOutcome::Ready(_, ref p) if p.len() == 3));
    }

    #[test]
    fn polyline_suggests_but_never_completes() {
        let mut sm = MeasurementStateMachine::default();
        sm.begin(MeasurementKind::Polyline);
        sm.add_pick(pick(0.0, 0.0)).unwrap();
        sm.add_pick(pick(50.0, 0.0)).unwrap();
        assert_eq!(sm.add_pick(pick(1.0, 1.0)).unwrap(), PickOutcome::SuggestClose);
        assert_eq!(sm.picks().len(), 3);
        assert!(matches!(sm.finish().unwrap(), PickOutcome::Ready(_, ref p) if p.len() == 3));
    }

    #[test]
    fn missing_area_needs_intersection_and_two_vertices() {
        let mut sm = MeasurementStateMachine::default();
        sm.begin(MeasurementKind::MissingArea);
        for p in [pick(0.0, 0.0), pick(100.0, 0.0), pick(50.0, -50.0)] {
            assert_eq!(sm.add_pick(p).unwrap(), PickOutcome::Pending);
        }
        assert!(matches!(sm.add_pick(pick(50.0, 50.0)).unwrap(), PickOutcome::SegmentsReady(_)));
        sm.insert_intersection(pick(50.0, 0.0)).unwrap();
        sm.add_pick(pick(100.0, 100.0)).unwrap();
        assert!(matches!(sm.finish(), Err(MeasureError::PointCount { expected: 7, got: 6, .. })));
        sm.add_pick(pick(0.0, 100.0)).unwrap();
        assert!(matches!(sm.finish().unwrap(), PickOutcome::Ready(_, ref p) if p.len() == 7));
    }

    #[test]
    fn reset_keeps_kind_and_cancel_goes_idle() {
        let mut sm = MeasurementStateMachine::default();
        sm.begin(MeasurementKind::Depth);
        sm.add_pick(pick(0.0, 0.0)).unwrap();
        sm.reset_picks();
        assert_eq!(sm.active_kind(), Some(MeasurementKind::Depth));
        assert!(sm.picks().is_empty());
        sm.cancel();
        assert!(sm.is_idle());
        assert!(matches!(sm.finish(), Err(MeasureError::NotMeasuring)));
    }

    #[test]
    fn state_manager_transitions() {
        let mut s = StateManager::default();
        s.begin_add(MeasurementKind::Area);
        assert_eq!(s.mode(), Mode::Add);
        s.end_add();
        assert_eq!(s.mode(), Mode::View);
        assert_eq!(s.active_kind(), None);
    }
}
