use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use redis::AsyncCommands;
use serde_json::Value;

use super::{assign_persistence_id, matches_filter, Collection, ProcessStore, PERSISTENCE_ID};

/// Redis-backed collection: one hash per collection, documents JSON-encoded
/// under their persistence id.
pub struct RedisCollection {
    client: redis::Client,
    hash_key: String,
}

impl RedisCollection {
    pub fn new(client: redis::Client, name: &str) -> Self {
        Self {
            client,
            hash_key: format!("flyt:collection:{}", name),
        }
    }

    async fn scan(&self) -> Result<Vec<Value>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: std::collections::HashMap<String, String> = conn.hgetall(&self.hash_key).await?;
        let mut docs = Vec::with_capacity(raw.len());
        for (_, json) in raw {
            docs.push(serde_json::from_str(&json)?);
        }
        Ok(docs)
    }

    async fn write(&self, id: &str, doc: &Value) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn
            .hset(&self.hash_key, id, serde_json::to_string(doc)?)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Collection for RedisCollection {
    async fn insert(&self, mut doc: Value) -> Result<Value> {
        let id = assign_persistence_id(&mut doc)?;
        self.write(&id, &doc).await?;
        Ok(doc)
    }

    async fn update(&self, filter: Value, doc: Value) -> Result<()> {
        // Direct write when the filter already names the persistence id.
        if let Some(id) = filter.get(PERSISTENCE_ID).and_then(|v| v.as_str()) {
            return self.write(id, &doc).await;
        }
        for existing in self.scan().await? {
            if matches_filter(&existing, &filter) {
                if let Some(id) = existing.get(PERSISTENCE_ID).and_then(|v| v.as_str()) {
                    return self.write(id, &doc).await;
                }
            }
        }
        Err(anyhow::anyhow!("no document matches update filter {}", filter))
    }

    async fn find_one(&self, filter: Value) -> Result<Option<Value>> {
        if let Some(id) = filter.get(PERSISTENCE_ID).and_then(|v| v.as_str()) {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let json: Option<String> = conn.hget(&self.hash_key, id).await?;
            return match json {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            };
        }
        Ok(self
            .scan()
            .await?
            .into_iter()
            .find(|doc| matches_filter(doc, &filter)))
    }

    async fn find(&self, filter: Value) -> Result<Vec<Value>> {
        Ok(self
            .scan()
            .await?
            .into_iter()
            .filter(|doc| matches_filter(doc, &filter))
            .collect())
    }
}

/// Both engine collections on one Redis client.
pub fn redis_store(url: &str) -> Result<ProcessStore> {
    let client = redis::Client::open(url)?;
    Ok(ProcessStore::new(
        Arc::new(RedisCollection::new(client.clone(), "definitions")),
        Arc::new(RedisCollection::new(client, "instances")),
    ))
}
