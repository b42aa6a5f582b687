// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The database registry.
//!
//! One meta store per provider records every database ever opened through
//! it: name, last-open time, format version. Cross-database GC and mutation
//! recovery enumerate siblings through this registry — the analog of
//! listing an origin's IndexedDB databases.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use undertow_kv::StoreProvider;

use crate::{ReplicaError, ReplicaResult};

/// On-disk format version of everything under a database's keyspace.
///
/// Bumped when the chunk, commit, or record encodings change; newer
/// databases are never collected or reopened by older code.
pub const FORMAT_VERSION: u32 = 1;

const META_STORE: &str = "undertow-dbs";
const DBS_KEY: &str = "dbs";

/// One registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbRecord {
    /// Store name of the database.
    pub name: String,
    /// Last time any replica opened it, wall-clock milliseconds.
    #[serde(rename = "lastOpenedTimestampMS")]
    pub last_opened_timestamp_ms: u64,
    /// Format version the database was written with.
    pub format_version: u32,
    /// Application schema version it was opened with; mutation recovery
    /// replays against this.
    pub schema_version: String,
}

/// Registry of databases known to one provider.
#[derive(Clone)]
pub struct DbRegistry {
    provider: Arc<dyn StoreProvider>,
}

impl DbRegistry {
    /// Opens the registry over `provider`.
    pub fn new(provider: Arc<dyn StoreProvider>) -> Self {
        Self { provider }
    }

    /// Upserts `name`, stamping the open time and current format version.
    pub async fn register(
        &self,
        name: &str,
        now_ms: u64,
        schema_version: &str,
    ) -> ReplicaResult<()> {
        let store = self.provider.open(META_STORE).await?;
        let mut wt = store.write().await?;
        let mut records = decode(wt.get(DBS_KEY).await?)?;
        records.insert(
            name.to_owned(),
            DbRecord {
                name: name.to_owned(),
                last_opened_timestamp_ms: now_ms,
                format_version: FORMAT_VERSION,
                schema_version: schema_version.to_owned(),
            },
        );
        wt.put(DBS_KEY, encode(&records)?).await?;
        wt.commit().await?;
        Ok(())
    }

    /// Returns the stable per-provider profile ID, creating it on first
    /// use.
    pub async fn profile_id(&self) -> ReplicaResult<String> {
        const PROFILE_KEY: &str = "profile";
        let store = self.provider.open(META_STORE).await?;
        {
            let rt = store.read().await?;
            if let Some(bytes) = rt.get(PROFILE_KEY).await? {
                return Ok(String::from_utf8_lossy(&bytes).into_owned());
            }
        }
        let mut wt = store.write().await?;
        if let Some(bytes) = wt.get(PROFILE_KEY).await? {
            return Ok(String::from_utf8_lossy(&bytes).into_owned());
        }
        let fresh = format!("p{}", hex::encode(rand::random::<[u8; 8]>()));
        wt.put(PROFILE_KEY, Bytes::from(fresh.clone().into_bytes()))
            .await?;
        wt.commit().await?;
        Ok(fresh)
    }

    /// All known databases, keyed by name.
    pub async fn all(&self) -> ReplicaResult<BTreeMap<String, DbRecord>> {
        let store = self.provider.open(META_STORE).await?;
        let rt = store.read().await?;
        decode(rt.get(DBS_KEY).await?)
    }

    /// Forgets `name` (the store itself is dropped separately).
    pub async fn remove(&self, name: &str) -> ReplicaResult<()> {
        let store = self.provider.open(META_STORE).await?;
        let mut wt = store.write().await?;
        let mut records = decode(wt.get(DBS_KEY).await?)?;
        if records.remove(name).is_some() {
            wt.put(DBS_KEY, encode(&records)?).await?;
            wt.commit().await?;
        }
        Ok(())
    }
}

fn encode(records: &BTreeMap<String, DbRecord>) -> ReplicaResult<Bytes> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(records, &mut out)
        .map_err(|e| ReplicaError::BadRecord(format!("db registry encode: {e}")))?;
    Ok(Bytes::from(out))
}

fn decode(bytes: Option<Bytes>) -> ReplicaResult<BTreeMap<String, DbRecord>> {
    match bytes {
        None => Ok(BTreeMap::new()),
        Some(bytes) => ciborium::de::from_reader(bytes.as_ref())
            .map_err(|e| ReplicaError::BadRecord(format!("db registry decode: {e}"))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use undertow_kv::StoreRegistry;

    #[tokio::test]
    async fn register_list_remove() {
        let provider = Arc::new(StoreRegistry::new());
        let registry = DbRegistry::new(provider);

        registry.register("app-1", 100, "s1").await.unwrap();
        registry.register("app-2", 200, "s1").await.unwrap();
        // Re-registering bumps the open time.
        registry.register("app-1", 300, "s2").await.unwrap();

        let all = registry.all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["app-1"].last_opened_timestamp_ms, 300);
        assert_eq!(all["app-2"].format_version, FORMAT_VERSION);

        registry.remove("app-1").await.unwrap();
        assert_eq!(registry.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn profile_id_is_stable_per_provider() {
        let provider = Arc::new(StoreRegistry::new());
        let registry = DbRegistry::new(Arc::clone(&provider) as Arc<dyn StoreProvider>);
        let first = registry.profile_id().await.unwrap();
        let second = DbRegistry::new(provider).profile_id().await.unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with('p'));
    }
}
