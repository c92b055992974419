//! Named, host-backed cache directories mounted into task containers.
//!
//! Each cache name owns any number of instances under `<root>/<name>/<id>`.
//! An instance is handed to one holder at a time; released instances stay on
//! disk and are reused by the next `get` until they are purged or cleared.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Instant,
};

use crate::lib::error::CacheError;
use crate::lib::gc::GcManager;

const KEY_SEPARATOR: &str = "::";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHandle {
    pub key: String,
    pub path: PathBuf,
}

#[derive(Debug)]
struct CacheInstance {
    path: PathBuf,
    refs: u32,
    purged: bool,
    last_used: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub key: String,
    pub refs: u32,
    pub purged: bool,
}

pub struct VolumeCache {
    root: PathBuf,
    caches: Mutex<HashMap<String, HashMap<String, CacheInstance>>>,
}

impl VolumeCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            caches: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Register instances left on disk by a previous process as idle.
    pub fn load_existing(&self) -> Result<usize, CacheError> {
        if !self.root.exists() {
            return Ok(0);
        }
        let mut caches = self.caches.lock().unwrap_or_else(|e| e.into_inner());
        let mut loaded = 0;
        for cache_dir in std::fs::read_dir(&self.root)? {
            let cache_dir = cache_dir?;
            if !cache_dir.file_type()?.is_dir() {
                continue;
            }
            let name = cache_dir.file_name().to_string_lossy().into_owned();
            let group = caches.entry(name.clone()).or_default();
            for instance in std::fs::read_dir(cache_dir.path())? {
                let instance = instance?;
                if !instance.file_type()?.is_dir() {
                    continue;
                }
                let id = instance.file_name().to_string_lossy().into_owned();
                group.insert(
                    make_key(&name, &id),
                    CacheInstance {
                        path: instance.path(),
                        refs: 0,
                        purged: false,
                        last_used: Instant::now(),
                    },
                );
                loaded += 1;
            }
        }
        tracing::info!(loaded, root = %self.root.display(), "loaded existing cache instances");
        Ok(loaded)
    }

    /// Check out an instance of `name`, creating one when none is idle.
    ///
    /// Callers must have checked the task's `cache-access:<name>` scope.
    pub fn get(&self, name: &str) -> Result<CacheHandle, CacheError> {
        validate_name(name)?;
        let mut caches = self.caches.lock().unwrap_or_else(|e| e.into_inner());
        let group = caches.entry(name.to_string()).or_default();

        let idle = group
            .iter_mut()
            .filter(|(_, inst)| inst.refs == 0 && !inst.purged)
            .max_by_key(|(_, inst)| inst.last_used);
        if let Some((key, instance)) = idle {
            instance.refs += 1;
            instance.last_used = Instant::now();
            tracing::debug!(cache = name, key = %key, "reusing cache instance");
            return Ok(CacheHandle {
                key: key.clone(),
                path: instance.path.clone(),
            });
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let path = self.root.join(name).join(&id);
        std::fs::create_dir_all(&path)?;
        let key = make_key(name, &id);
        group.insert(
            key.clone(),
            CacheInstance {
                path: path.clone(),
                refs: 1,
                purged: false,
                last_used: Instant::now(),
            },
        );
        tracing::info!(cache = name, key = %key, path = %path.display(), "created cache instance");
        Ok(CacheHandle { key, path })
    }

    /// Give back one reference taken by `get`.
    pub fn release(&self, key: &str) -> Result<(), CacheError> {
        let name = name_from_key(key).ok_or_else(|| CacheError::UnknownKey(key.to_string()))?;
        let mut caches = self.caches.lock().unwrap_or_else(|e| e.into_inner());
        let group = caches
            .get_mut(name)
            .ok_or_else(|| CacheError::UnknownKey(key.to_string()))?;
        let instance = group
            .get_mut(key)
            .ok_or_else(|| CacheError::UnknownKey(key.to_string()))?;

        if instance.refs == 0 {
            return Err(CacheError::OverRelease(key.to_string()));
        }
        instance.refs -= 1;
        instance.last_used = Instant::now();

        if instance.refs == 0 && instance.purged {
            let path = instance.path.clone();
            if remove_instances(group, vec![(key.to_string(), path)]) == 1 {
                tracing::info!(key, "removed purged cache instance on release");
            }
        } else {
            tracing::debug!(key, refs = instance.refs, "released cache instance");
        }
        Ok(())
    }

    /// Invalidate every instance of `name` and return how many were deleted.
    /// Idle instances go now, busy ones when their last holder releases them.
    pub fn purge(&self, name: &str) -> usize {
        let mut caches = self.caches.lock().unwrap_or_else(|e| e.into_inner());
        let Some(group) = caches.get_mut(name) else {
            tracing::debug!(cache = name, "purge for unknown cache");
            return 0;
        };

        let mut idle = Vec::new();
        for (key, instance) in group.iter_mut() {
            instance.purged = true;
            if instance.refs == 0 {
                idle.push((key.clone(), instance.path.clone()));
            }
        }
        let removed = remove_instances(group, idle);
        tracing::info!(
            cache = name,
            removed,
            remaining = group.len(),
            "purged cache"
        );
        removed
    }

    /// Delete all idle instances. Used when the host runs short of disk.
    pub fn clear_idle(&self) -> usize {
        let mut caches = self.caches.lock().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for group in caches.values_mut() {
            let idle: Vec<(String, PathBuf)> = group
                .iter()
                .filter(|(_, inst)| inst.refs == 0)
                .map(|(key, inst)| (key.clone(), inst.path.clone()))
                .collect();
            removed += remove_instances(group, idle);
        }
        caches.retain(|_, group| !group.is_empty());
        removed
    }

    pub fn instances(&self, name: &str) -> Vec<InstanceInfo> {
        let caches = self.caches.lock().unwrap_or_else(|e| e.into_inner());
        caches
            .get(name)
            .map(|group| {
                group
                    .iter()
                    .map(|(key, inst)| InstanceInfo {
                        key: key.clone(),
                        refs: inst.refs,
                        purged: inst.purged,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl GcManager for VolumeCache {
    fn name(&self) -> &'static str {
        "volume-cache"
    }

    fn container_removed(&self, container_id: &str, cache_keys: &[String]) {
        for key in cache_keys {
            if let Err(e) = self.release(key) {
                tracing::error!(
                    alert = true,
                    container_id,
                    key = %key,
                    error = %e,
                    "failed to release cache after container removal"
                );
            }
        }
    }

    fn clear(&self, disk_pressure: bool) {
        if !disk_pressure {
            return;
        }
        let removed = self.clear_idle();
        tracing::info!(removed, "cleared idle cache instances");
    }
}

fn make_key(name: &str, id: &str) -> String {
    format!("{name}{KEY_SEPARATOR}{id}")
}

fn name_from_key(key: &str) -> Option<&str> {
    key.split_once(KEY_SEPARATOR).map(|(name, _)| name)
}

fn validate_name(name: &str) -> Result<(), CacheError> {
    if name.is_empty() || name.contains('/') || name.contains(KEY_SEPARATOR) || name.starts_with('.')
    {
        return Err(CacheError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Delete each instance directory and forget the ones that are gone. An
/// instance whose directory could not be removed stays recorded so a later
/// purge or clear retries it.
fn remove_instances(
    group: &mut HashMap<String, CacheInstance>,
    instances: Vec<(String, PathBuf)>,
) -> usize {
    let mut removed = 0;
    for (key, path) in instances {
        match remove_dir(&path) {
            Ok(()) => {
                group.remove(&key);
                removed += 1;
            }
            Err(e) => {
                tracing::error!(alert = true, key = %key, path = %path.display(), error = %e, "failed to remove cache instance");
            }
        }
    }
    removed
}

fn remove_dir(path: &Path) -> Result<(), CacheError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (tempfile::TempDir, VolumeCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = VolumeCache::new(dir.path().join("caches"));
        (dir, cache)
    }

    #[test]
    fn get_creates_unique_directory() {
        let (_dir, cache) = cache();
        let a = cache.get("x").unwrap();
        let b = cache.get("x").unwrap();
        assert_ne!(a.key, b.key);
        assert!(a.path.is_dir());
        assert!(b.path.is_dir());
        assert!(a.path.starts_with(cache.root().join("x")));
    }

    #[test]
    fn second_release_is_an_error() {
        let (_dir, cache) = cache();
        let handle = cache.get("x").unwrap();
        cache.release(&handle.key).unwrap();
        assert!(matches!(
            cache.release(&handle.key),
            Err(CacheError::OverRelease(_))
        ));
        assert_eq!(cache.instances("x")[0].refs, 0);
        // Released instances persist until purged or cleared.
        assert!(handle.path.is_dir());
    }

    #[test]
    fn released_instance_is_reused() {
        let (_dir, cache) = cache();
        let first = cache.get("x").unwrap();
        std::fs::write(first.path.join("state"), b"warm").unwrap();
        cache.release(&first.key).unwrap();

        let second = cache.get("x").unwrap();
        assert_eq!(first, second);
        assert!(second.path.join("state").exists());
    }

    #[test]
    fn purge_defers_removal_while_in_use() {
        let (_dir, cache) = cache();
        let busy = cache.get("x").unwrap();
        let idle = cache.get("x").unwrap();
        cache.release(&idle.key).unwrap();

        assert_eq!(cache.purge("x"), 1);
        assert!(!idle.path.exists());
        assert!(busy.path.is_dir());

        // A purged instance is never handed out again.
        let fresh = cache.get("x").unwrap();
        assert_ne!(fresh.key, busy.key);

        cache.release(&busy.key).unwrap();
        assert!(!busy.path.exists());
        assert_eq!(cache.instances("x").len(), 1);
    }

    #[test]
    fn failed_removal_keeps_the_instance_for_a_retry() {
        let (_dir, cache) = cache();
        let stuck = cache.get("x").unwrap();
        let other = cache.get("x").unwrap();
        cache.release(&stuck.key).unwrap();
        cache.release(&other.key).unwrap();
        // A plain file where the directory was cannot be removed as one.
        std::fs::remove_dir(&stuck.path).unwrap();
        std::fs::write(&stuck.path, b"in the way").unwrap();

        assert_eq!(cache.purge("x"), 1);
        assert!(!other.path.exists());
        assert!(stuck.path.exists());
        let left = cache.instances("x");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].key, stuck.key);
        assert!(left[0].purged);

        std::fs::remove_file(&stuck.path).unwrap();
        std::fs::create_dir(&stuck.path).unwrap();
        assert_eq!(cache.clear_idle(), 1);
        assert!(cache.instances("x").is_empty());
    }

    #[test]
    fn unknown_and_malformed_keys_are_rejected() {
        let (_dir, cache) = cache();
        assert!(matches!(cache.release("nokey"), Err(CacheError::UnknownKey(_))));
        assert!(matches!(cache.release("x::missing"), Err(CacheError::UnknownKey(_))));
        assert!(matches!(cache.get("../etc"), Err(CacheError::InvalidName(_))));
    }

    #[test]
    fn clear_removes_only_idle_instances() {
        let (_dir, cache) = cache();
        let busy = cache.get("a").unwrap();
        let idle = cache.get("b").unwrap();
        cache.release(&idle.key).unwrap();

        cache.clear(true);
        assert!(busy.path.is_dir());
        assert!(!idle.path.exists());
        assert!(cache.instances("b").is_empty());
    }

    #[test]
    fn gc_removal_releases_each_key_once() {
        let (_dir, cache) = cache();
        let a = cache.get("a").unwrap();
        let b = cache.get("b").unwrap();
        cache.container_removed("c1", &[a.key.clone(), b.key.clone()]);
        assert_eq!(cache.instances("a")[0].refs, 0);
        assert_eq!(cache.instances("b")[0].refs, 0);
    }

    #[test]
    fn existing_instances_are_loaded_as_idle() {
        let (dir, cache) = cache();
        let handle = cache.get("x").unwrap();
        drop(cache);

        let reloaded = VolumeCache::new(dir.path().join("caches"));
        assert_eq!(reloaded.load_existing().unwrap(), 1);
        let again = reloaded.get("x").unwrap();
        assert_eq!(again, handle);
    }
}
