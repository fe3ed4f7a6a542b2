//! Asynchronous depth-inference requests.

use image::{imageops, RgbImage};
use stereoscope_core::ImageSize;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
    #[error("inference service unavailable")]
    Unavailable,
    #[error("inference request rejected: {0}")]
    Rejected(String),
}

/// An external monocular depth engine.
///
/// Results are delivered out of band, tagged with the sequence number
/// passed to [`InferenceService::submit`].
pub trait InferenceService {
    /// Input resolution the engine expects.
    fn input_size(&self) -> ImageSize;
    fn submit(&mut self, seq: u64, image: &RgbImage) -> Result<(), InferenceError>;
    fn cancel(&mut self, seq: u64);
}

/// Outcome of [`InferenceTracker::complete`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// The newest request answered.
    Accepted,
    /// Superseded, timed out or unknown; drop the payload.
    Stale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Pending {
    seq: u64,
    submitted_ms: u64,
}

/// Sequence numbering, supersession and timeout of inference requests.
#[derive(Clone, Debug)]
pub struct InferenceTracker {
    next_seq: u64,
    pending: Option<Pending>,
    timeout_ms: u64,
}

impl Default for InferenceTracker {
    fn default() -> Self {
        Self::new(2_000)
    }
}

impl InferenceTracker {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            next_seq: 1,
            pending: None,
            timeout_ms,
        }
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn pending_seq(&self) -> Option<u64> {
        self.pending.map(|p| p.seq)
    }

    /// Submit `image`, resized to the engine's input size, cancelling any
    /// request still in flight.
    pub fn submit<S: InferenceService + ?Sized>(
        &mut self,
        service: &mut S,
        image: &RgbImage,
        now_ms: u64,
    ) -> Result<u64, InferenceError> {
        if let Some(prev) = self.pending.take() {
            log::debug!("cancelling superseded inference #{}", prev.seq);
            service.cancel(prev.seq);
        }
        let seq = self.next_seq;
        self.next_seq += 1;

        let input = service.input_size();
        if input.is_empty() || input == ImageSize::of(image) {
            service.submit(seq, image)?;
        } else {
            let resized = imageops::resize(
                image,
                input.width,
                input.height,
                imageops::FilterType::Triangle,
            );
            service.submit(seq, &resized)?;
        }
        self.pending = Some(Pending {
            seq,
            submitted_ms: now_ms,
        });
        Ok(seq)
    }

    /// Match a completion against the request in flight.
    pub fn complete(&mut self, seq: u64) -> Completion {
        match self.pending {
            Some(p) if p.seq == seq => {
                self.pending = None;
                Completion::Accepted
            }
            _ => {
                log::debug!("dropping stale inference result #{seq}");
                Completion::Stale
            }
        }
    }

    /// Give up on the request in flight once it is older than the timeout.
    /// Returns the abandoned sequence number.
    pub fn poll_timeout<S: InferenceService + ?Sized>(
        &mut self,
        service: &mut S,
        now_ms: u64,
    ) -> Option<u64> {
        let p = self.pending?;
        if now_ms.saturating_sub(p.submitted_ms) < self.timeout_ms {
            return None;
        }
        log::warn!("inference #{} timed out after {} ms", p.seq, self.timeout_ms);
        service.cancel(p.seq);
        self.pending = None;
        Some(p.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        submitted: Vec<(u64, ImageSize)>,
        cancelled: Vec<u64>,
    }

    impl InferenceService for Recorder {
        fn input_size(&self) -> ImageSize {
            ImageSize::new(8, 6)
        }
        fn submit(&mut self, seq: u64, image: &RgbImage) -> Result<(), InferenceError> {
            self.submitted.push((seq, ImageSize::of(image)));
            Ok(())
        }
        fn cancel(&mut self, seq: u64) {
            self.cancelled.push(seq);
        }
    }

    #[test]
    fn newer_request_supersedes_older() {
        let mut svc = Recorder::default();
        let mut t = InferenceTracker::default();
        let img = RgbImage::new(16, 12);
        let a = t.submit(&mut svc, &img, 0).unwrap();
        let b = t.submit(&mut svc, &img, 10).unwrap();
        assert!(b > a);
        assert_eq!(svc.cancelled, vec![a]);
        assert_eq!(svc.submitted[0].1, ImageSize::new(8, 6));
        assert_eq!(t.complete(a), Completion::Stale);
        assert_eq!(t.complete(b), Completion::Accepted);
        assert_eq!(t.complete(b), Completion::Stale);
    }

    #[test]
    fn timeout_abandons_request() {
        let mut svc = Recorder::default();
        let mut t = InferenceTracker::new(100);
        let seq = t.submit(&mut svc, &RgbImage::new(8, 6), 1_000).unwrap();
        assert_eq!(t.poll_timeout(&mut svc, 1_099), None);
        assert_eq!(t.poll_timeout(&mut svc, 1_100), Some(seq));
        assert_eq!(t.pending_seq(), None);
        assert_eq!(t.complete(seq), Completion::Stale);
    }
}
