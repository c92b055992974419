pub mod volume_cache;

pub use volume_cache::{CacheHandle, VolumeCache};
