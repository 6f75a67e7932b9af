pub mod input;
pub mod meter;
pub mod output;
pub mod queue;

pub use input::{AudioInput, AudioInputFactory, CpalInputFactory, FrameHandler};
pub use meter::VolumeMeter;
pub use output::{AudioOutput, AudioOutputFactory, CpalOutputFactory};
pub use queue::{AudioChunk, PlaybackQueue};
