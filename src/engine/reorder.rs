use std::collections::BTreeMap;

use crate::detect::FrameDetections;

/// Why a frame was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDrop {
    /// At or below the last released frame.
    Stale { frame_number: u64, last_released: u64 },
    /// Same frame number already waiting.
    Duplicate { frame_number: u64 },
}

/// Bounded out-of-order tolerance.
///
/// Holds up to `depth` frames and releases the lowest-numbered frame once
/// more than `depth` are waiting. Released frame numbers are strictly
/// increasing.
#[derive(Debug)]
pub struct ReorderBuffer {
    pending: BTreeMap<u64, FrameDetections>,
    depth: usize,
    last_released: Option<u64>,
}

impl ReorderBuffer {
    pub fn new(depth: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            depth,
            last_released: None,
        }
    }

    pub fn admit(&mut self, frame: FrameDetections) -> Result<(), FrameDrop> {
        let frame_number = frame.frame_number;
        if let Some(last_released) = self.last_released {
            if frame_number <= last_released {
                return Err(FrameDrop::Stale {
                    frame_number,
                    last_released,
                });
            }
        }
        if self.pending.contains_key(&frame_number) {
            return Err(FrameDrop::Duplicate { frame_number });
        }
        self.pending.insert(frame_number, frame);
        Ok(())
    }

    /// Next frame due for processing, if the buffer is over depth.
    pub fn pop_ready(&mut self) -> Option<FrameDetections> {
        if self.pending.len() > self.depth {
            self.pop_lowest()
        } else {
            None
        }
    }

    /// Release everything still waiting, lowest first.
    pub fn drain(&mut self) -> Vec<FrameDetections> {
        let mut out = Vec::with_capacity(self.pending.len());
        while let Some(frame) = self.pop_lowest() {
            out.push(frame);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn last_released(&self) -> Option<u64> {
        self.last_released
    }

    /// Drop waiting frames without releasing them.
    pub fn clear(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }

    fn pop_lowest(&mut self) -> Option<FrameDetections> {
        let (frame_number, frame) = self.pending.pop_first()?;
        self.last_released = Some(frame_number);
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u64) -> FrameDetections {
        FrameDetections::new("v", n, n as f64 / 30.0)
    }

    fn feed(buf: &mut ReorderBuffer, numbers: &[u64]) -> Vec<u64> {
        let mut released = Vec::new();
        for &n in numbers {
            let _ = buf.admit(frame(n));
            while let Some(f) = buf.pop_ready() {
                released.push(f.frame_number);
            }
        }
        released
    }

    #[test]
    fn out_of_order_within_depth_is_sorted() {
        let mut buf = ReorderBuffer::new(2);
        let mut released = feed(&mut buf, &[2, 1, 4, 3, 5]);
        released.extend(buf.drain().into_iter().map(|f| f.frame_number));
        assert_eq!(released, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn frames_behind_the_release_point_are_stale() {
        let mut buf = ReorderBuffer::new(1);
        assert_eq!(feed(&mut buf, &[5, 6]), vec![5]);
        assert_eq!(
            buf.admit(frame(4)),
            Err(FrameDrop::Stale {
                frame_number: 4,
                last_released: 5
            })
        );
        assert_eq!(buf.admit(frame(6)), Err(FrameDrop::Duplicate { frame_number: 6 }));
    }

    #[test]
    fn zero_depth_releases_immediately() {
        let mut buf = ReorderBuffer::new(0);
        assert_eq!(feed(&mut buf, &[3, 7, 9]), vec![3, 7, 9]);
        assert!(buf.is_empty());
    }
}
