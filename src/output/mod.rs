mod frame_dump;

pub use frame_dump::PngFrameDump;

use crate::error::DumpError;
use crate::segmentation::Mask;
use crate::source::FrameId;

/// Trait for per-frame prediction destinations
///
/// Shared across sequence workers, so writes take `&self`.
pub trait PredictionSink: Sync {
    /// Persist the original-resolution prediction of one frame
    fn write_prediction(&self, frame: &FrameId, prediction: &Mask) -> Result<(), DumpError>;
}
