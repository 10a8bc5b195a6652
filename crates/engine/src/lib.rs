pub mod cache;
pub mod capability;
pub mod codec;
pub mod config;
pub mod error;
pub mod media;
pub mod policy;
pub mod probe;
pub mod vfs;

pub use cache::{EntryState, TranscodeCache, TranscodeKey};
pub use capability::{
    Decision, MediaCapabilities, OpenRequest, RequestingApp, RequiredAction, TargetProfile,
};
pub use codec::{CodecService, FfmpegCodec};
pub use config::EngineConfig;
pub use error::TranscodeError;
pub use media::{MediaId, MediaStore, VideoCodec};
pub use policy::{AdminState, CompatOverride, PolicyEngine};
pub use vfs::{HandleState, MediaVfs, ReadHandle};
