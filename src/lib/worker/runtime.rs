use std::sync::Arc;

use crate::lib::cache::VolumeCache;
use crate::lib::config::WorkerConfig;
use crate::lib::features::FeatureRegistry;
use crate::lib::gc::GarbageCollector;
use crate::lib::queue::Queue;
use crate::lib::tasks::docker::ContainerRuntime;
use crate::lib::worker::secrets::SecretDecryptor;
use crate::lib::worker::stats::DiskProbe;

/// Services shared by the listener and every task it runs.
pub struct Runtime {
    pub config: WorkerConfig,
    pub queue: Arc<dyn Queue>,
    pub docker: Arc<dyn ContainerRuntime>,
    pub volume_cache: Arc<VolumeCache>,
    pub gc: Arc<GarbageCollector>,
    pub decryptor: Arc<dyn SecretDecryptor>,
    pub disk: Arc<dyn DiskProbe>,
    pub features: FeatureRegistry,
}

impl Runtime {
    pub fn worker_id(&self) -> &str {
        &self.config.identity.worker_id
    }
}

#[cfg(test)]
pub mod test_support {
    use std::path::Path;

    use super::*;
    use crate::lib::testing::{FakeDocker, FakeQueue};
    use crate::lib::worker::secrets::NoPrivateKey;
    use crate::lib::worker::stats::FixedDiskProbe;

    pub const PLENTY_OF_DISK: u64 = 1 << 50;

    pub struct Harness {
        pub runtime: Arc<Runtime>,
        pub queue: Arc<FakeQueue>,
        pub docker: Arc<FakeDocker>,
    }

    pub fn harness(
        config: WorkerConfig,
        docker: FakeDocker,
        features: FeatureRegistry,
        cache_dir: &Path,
        free_disk: u64,
    ) -> Harness {
        let queue = Arc::new(FakeQueue::new());
        let docker = Arc::new(docker);
        let disk: Arc<dyn DiskProbe> = Arc::new(FixedDiskProbe(free_disk));
        let volume_cache = Arc::new(VolumeCache::new(cache_dir));
        let gc = Arc::new(GarbageCollector::new(
            &config.garbage_collection,
            docker.clone(),
            disk.clone(),
            config.capacity_management.diskspace_threshold,
        ));
        gc.add_manager(volume_cache.clone());

        let runtime = Arc::new(Runtime {
            config,
            queue: queue.clone(),
            docker: docker.clone(),
            volume_cache,
            gc,
            decryptor: Arc::new(NoPrivateKey),
            disk,
            features,
        });
        Harness {
            runtime,
            queue,
            docker,
        }
    }
}
