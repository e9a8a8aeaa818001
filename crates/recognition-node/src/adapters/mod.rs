//! Production implementations of the collaborator seams.

pub mod frame_source;
pub mod inference;
pub mod registry;

pub use frame_source::{CameraSources, FfmpegFrameSource};
pub use inference::{decode_frame_base64, encode_jpeg_base64, HttpInferenceClient};
pub use registry::{PgCameraRegistry, StaticCameraRegistry};
