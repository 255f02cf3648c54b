use std::{collections::HashMap, path::PathBuf, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;

use crate::{
    api::{EntityRef, Error, Time},
    Comment,
};

/// Persistent string key-value store, surviving app restarts
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> anyhow::Result<()>;
    async fn remove(&self, key: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore(parking_lot::Mutex<HashMap<String, String>>);

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.0.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> anyhow::Result<()> {
        self.0.lock().insert(String::from(key), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.0.lock().remove(key);
        Ok(())
    }
}

/// One file per key in a directory
#[derive(Clone, Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub async fn open(dir: impl Into<PathBuf>) -> anyhow::Result<FileStore> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating cache directory {dir:?}"))?;
        Ok(FileStore { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name = key
            .chars()
            .map(|c| match c.is_ascii_alphanumeric() || c == '-' {
                true => c,
                false => '_',
            })
            .collect::<String>();
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {path:?}")),
        }
    }

    async fn set(&self, key: &str, value: String) -> anyhow::Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value)
            .await
            .with_context(|| format!("writing {tmp:?}"))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("moving {tmp:?} to {path:?}"))
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {path:?}")),
        }
    }
}

/// Last known comment tree of an entity
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CacheEntry {
    pub tree: Vec<Comment>,
    pub fetched_at: Time,
}

impl CacheEntry {
    pub fn encode(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| Error::Unknown(format!("serializing cache entry: {e}")))
    }

    pub fn decode(entity: &EntityRef, s: &str) -> Result<CacheEntry, Error> {
        let entry: CacheEntry =
            serde_json::from_str(s).map_err(|e| Error::CacheCorrupt(e.to_string()))?;
        if let Some(c) = entry.tree.iter().find(|c| c.entity != *entity) {
            return Err(Error::CacheCorrupt(format!(
                "entry for {entity} holds comment {} of {}",
                c.id, c.entity
            )));
        }
        Ok(entry)
    }
}

pub fn cache_key(entity: &EntityRef) -> String {
    format!(
        "komento/v1/comments/{}/{}",
        entity.entity_type, entity.entity_id
    )
}

/// Comment trees persisted per entity.
///
/// Never fails: store errors are logged and reads degrade to cache misses.
#[derive(Clone)]
pub struct CommentCache {
    store: Arc<dyn KvStore>,
}

impl CommentCache {
    pub fn new(store: Arc<dyn KvStore>) -> CommentCache {
        CommentCache { store }
    }

    pub async fn read(&self, entity: &EntityRef) -> Option<CacheEntry> {
        let key = cache_key(entity);
        let raw = match self.store.get(&key).await {
            Ok(raw) => raw?,
            Err(err) => {
                tracing::warn!(?err, %entity, "failed reading comment cache");
                return None;
            }
        };
        match CacheEntry::decode(entity, &raw) {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::warn!(%err, %entity, "dropping corrupt comment cache entry");
                if let Err(err) = self.store.remove(&key).await {
                    tracing::warn!(?err, %entity, "failed removing corrupt comment cache entry");
                }
                None
            }
        }
    }

    pub async fn write(&self, entity: &EntityRef, tree: &[Comment], fetched_at: Time) {
        let entry = CacheEntry {
            tree: tree.to_vec(),
            fetched_at,
        };
        let encoded = match entry.encode() {
            Ok(e) => e,
            Err(err) => {
                tracing::error!(%err, %entity, "failed encoding comment cache entry");
                return;
            }
        };
        if let Err(err) = self.store.set(&cache_key(entity), encoded).await {
            tracing::warn!(?err, %entity, "failed writing comment cache");
        }
    }

    pub async fn invalidate(&self, entity: &EntityRef) {
        if let Err(err) = self.store.remove(&cache_key(entity)).await {
            tracing::warn!(?err, %entity, "failed invalidating comment cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{EntityId, Uuid};

    fn stub_entry() -> CacheEntry {
        let mut parent = Comment::stub(1, None, 0);
        parent.children.push(Comment::stub(2, Some(1), 1));
        CacheEntry {
            tree: vec![parent],
            fetched_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn write_then_read() {
        let cache = CommentCache::new(Arc::new(MemoryStore::new()));
        let entity = EntityRef::post(EntityId::stub());
        let entry = stub_entry();
        assert_eq!(cache.read(&entity).await, None);
        cache.write(&entity, &entry.tree, entry.fetched_at).await;
        assert_eq!(cache.read(&entity).await, Some(entry));
        cache.invalidate(&entity).await;
        assert_eq!(cache.read(&entity).await, None);
    }

    #[tokio::test]
    async fn corrupt_entry_is_a_miss_and_gets_removed() {
        let store = Arc::new(MemoryStore::new());
        let cache = CommentCache::new(store.clone());
        let entity = EntityRef::post(EntityId::stub());
        store
            .set(&cache_key(&entity), String::from("{not json"))
            .await
            .unwrap();
        assert_eq!(cache.read(&entity).await, None);
        assert_eq!(store.get(&cache_key(&entity)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn entry_of_another_entity_is_corrupt() {
        let store = Arc::new(MemoryStore::new());
        let cache = CommentCache::new(store.clone());
        let other = EntityRef::reel(EntityId(Uuid::new_v4()));
        let entry = stub_entry();
        store
            .set(&cache_key(&other), entry.encode().unwrap())
            .await
            .unwrap();
        assert_eq!(cache.read(&other).await, None);
    }

    #[tokio::test]
    async fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().expect("creating tempdir");
        let entity = EntityRef::post(EntityId::stub());
        let entry = stub_entry();
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            CommentCache::new(Arc::new(store))
                .write(&entity, &entry.tree, entry.fetched_at)
                .await;
        }
        let store = FileStore::open(dir.path()).await.unwrap();
        let cache = CommentCache::new(Arc::new(store.clone()));
        assert_eq!(cache.read(&entity).await, Some(entry));
        store.remove(&cache_key(&entity)).await.unwrap();
        store.remove(&cache_key(&entity)).await.unwrap();
        assert_eq!(cache.read(&entity).await, None);
    }
}
