mod adapter;
mod result;

pub use adapter::{AdaptedFrame, DetectionAdapter, RawDetection, RawFrameDetections, Rejection};
pub use result::{Detection, FrameDetections, ObjectClass};
