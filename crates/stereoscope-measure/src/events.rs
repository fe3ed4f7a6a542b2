//! Typed events into the measurement service and notifications out of it.

use crate::{Measurement, MeasurementId, MeasurementKind};
use image::RgbImage;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use stereoscope_core::{ImageSize, ViewTransform};
use stereoscope_depth::InverseDepthMap;

/// A synchronised raw stereo pair.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameBundle {
    pub left: RgbImage,
    pub right: RgbImage,
    /// Capture timestamps `[left, right]`, milliseconds.
    pub timestamps_ms: [u64; 2],
}

/// Capture side of the camera pair.
pub trait StereoFrameSource {
    /// Block until both cameras delivered a matching frame or `timeout_ms`
    /// elapsed.
    fn sync_frames(&mut self, timeout_ms: u64) -> Option<FrameBundle>;
}

#[derive(Clone, Debug)]
pub enum Event {
    FrameArrived(Box<FrameBundle>),
    InferenceCompleted { seq: u64, map: InverseDepthMap },
    Tick { now_ms: u64 },
    BeginMeasurement(MeasurementKind),
    /// Click in display pixels.
    Click { x: f64, y: f64 },
    Finish,
    Cancel,
    Undo,
    Redo,
    DeleteSelected,
    Select(Option<MeasurementId>),
    SetViewTransform(ViewTransform),
    SetDisplaySize(ImageSize),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    MeasurementCompleted(Box<Measurement>),
    Toast { message: String, duration_ms: u64 },
    /// Overlay and scene need a redraw.
    UpdateUi,
}

/// FIFO of events. A new frame drops a frame still waiting in the queue and
/// joins at the back, so events queued before it keep their turn.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        if let Event::FrameArrived(_) = event {
            let before = self.events.len();
            self.events.retain(|e| !matches!(e, Event::FrameArrived(_)));
            if self.events.len() < before {
                log::debug!("dropping unprocessed frame");
            }
        }
        self.events.push_back(event);
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Single-slot hand-over from a capture thread; the newest frame wins.
#[derive(Debug, Default)]
pub struct FrameMailbox {
    slot: Mutex<Option<FrameBundle>>,
}

impl FrameMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<FrameBundle>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store `frame`; returns `true` when an unread frame was displaced.
    pub fn post(&self, frame: FrameBundle) -> bool {
        self.lock().replace(frame).is_some()
    }

    pub fn take(&self) -> Option<FrameBundle> {
        self.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn frame(ts: u64) -> FrameBundle {
        FrameBundle {
            left: RgbImage::new(2, 2),
            right: RgbImage::new(2, 2),
            timestamps_ms: [ts, ts],
        }
    }

    #[test]
    fn newer_frame_drops_pending_and_queues_after_earlier_clicks() {
        let mut q = EventQueue::new();
        q.push(Event::FrameArrived(Box::new(frame(1))));
        q.push(Event::Click { x: 1.0, y: 2.0 });
        q.push(Event::FrameArrived(Box::new(frame(2))));
        q.push(Event::Undo);
        assert_eq!(q.len(), 3);
        assert!(matches!(q.pop(), Some(Event::Click { .. })));
        match q.pop() {
            Some(Event::FrameArrived(f)) => assert_eq!(f.timestamps_ms[0], 2),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(q.pop(), Some(Event::Undo)));
        assert!(q.is_empty());
    }

    #[test]
    fn mailbox_keeps_newest_across_threads() {
        let mailbox = Arc::new(FrameMailbox::new());
        let producer = {
            let mailbox = Arc::clone(&mailbox);
            std::thread::spawn(move || {
                for ts in 0..10 {
                    mailbox.post(frame(ts));
                }
            })
        };
        producer.join().unwrap();
        assert_eq!(mailbox.take().map(|f| f.timestamps_ms[0]), Some(9));
        assert!(mailbox.take().is_none());
    }
}
