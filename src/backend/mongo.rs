//! MongoDB backend.
//!
//! One document per key:
//!
//! ```text
//! { _id: <physical key>, value: <Binary | Int64>, expire_at: <unix secs, 0 = never>,
//!   members: [<string>...] }            // tag index documents only
//! ```
//!
//! Counters are stored as `Int64` so `$inc` works on them; every other value
//! is `Binary`. Tag sets use `$addToSet`. Expiry is enforced on read, and
//! [`MongoBackend::purge_expired`] sweeps stale documents in bulk.

use std::any::Any;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{doc, Binary, Bson, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::ReturnDocument;
use mongodb::{Client, Collection};
use serde_json::json;
use tracing::{debug, info};

use super::{CacheBackend, Capabilities, Expiry};
use crate::clock::{is_expired, system_clock, SharedClock};
use crate::codec::{decode_counter, encode_counter};
use crate::error::{Error, Result};

const DUPLICATE_KEY: i32 = 11000;

/// MongoDB collection used as a cache
pub struct MongoBackend {
    client: Client,
    collection: Collection<Document>,
    clock: SharedClock,
}

impl MongoBackend {
    /// Connect and select `database.collection`
    pub async fn connect(uri: &str, database: &str, collection: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        client
            .database(database)
            .run_command(doc! { "ping": 1 })
            .await?;
        info!(database, collection, "Connected to MongoDB");
        Ok(Self::with_collection(
            client.clone(),
            client.database(database).collection(collection),
            system_clock(),
        ))
    }

    fn with_collection(client: Client, collection: Collection<Document>, clock: SharedClock) -> Self {
        Self {
            client,
            collection,
            clock,
        }
    }

    /// Underlying collection, for queries the cache contract does not cover
    pub fn collection(&self) -> &Collection<Document> {
        &self.collection
    }

    /// Delete every expired document, returning how many went
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = self
            .collection
            .delete_many(expired_filter(None, self.clock.now()))
            .await?;
        debug!(purged = result.deleted_count, "Purged expired documents");
        Ok(result.deleted_count)
    }

    async fn purge_if_expired(&self, key: &str) -> Result<()> {
        self.collection
            .delete_one(expired_filter(Some(key), self.clock.now()))
            .await?;
        Ok(())
    }

    async fn load_live(&self, key: &str) -> Result<Option<Document>> {
        let Some(document) = self.collection.find_one(doc! { "_id": key }).await? else {
            return Ok(None);
        };
        if is_expired(expire_at_of(&document), self.clock.now()) {
            self.purge_if_expired(key).await?;
            return Ok(None);
        }
        Ok(Some(document))
    }
}

/// `value` field for a payload: counters as Int64, everything else Binary
fn value_bson(value: &[u8]) -> Bson {
    match decode_counter(value) {
        Some(n) if value.first().is_some_and(|b| *b == b'-' || b.is_ascii_digit()) => {
            Bson::Int64(n)
        }
        _ => Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes: value.to_vec(),
        }),
    }
}

fn value_bytes(document: &Document) -> Option<Vec<u8>> {
    match document.get("value")? {
        Bson::Binary(binary) => Some(binary.bytes.clone()),
        Bson::Int64(n) => Some(encode_counter(*n)),
        Bson::Int32(n) => Some(encode_counter(*n as i64)),
        _ => None,
    }
}

fn counter_of(document: &Document) -> Option<i64> {
    match document.get("value")? {
        Bson::Int64(n) => Some(*n),
        Bson::Int32(n) => Some(*n as i64),
        _ => None,
    }
}

fn expire_at_of(document: &Document) -> u64 {
    match document.get("expire_at") {
        Some(Bson::Int64(n)) => (*n).max(0) as u64,
        Some(Bson::Int32(n)) => (*n).max(0) as u64,
        _ => 0,
    }
}

fn live_filter(key: &str, now: u64) -> Document {
    doc! {
        "_id": key,
        "$or": [ { "expire_at": 0_i64 }, { "expire_at": { "$gt": now as i64 } } ],
    }
}

fn expired_filter(key: Option<&str>, now: u64) -> Document {
    let mut filter = doc! { "expire_at": { "$gt": 0_i64, "$lte": now as i64 } };
    if let Some(key) = key {
        filter.insert("_id", key);
    }
    filter
}

fn regex_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    out.push('^');
    for c in prefix.chars() {
        if "\\^$.|?*+()[]{}".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    matches!(
        error.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(e)) if e.code == DUPLICATE_KEY
    )
}

#[async_trait]
impl CacheBackend for MongoBackend {
    fn name(&self) -> &'static str {
        "mongodb"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_expiry: false,
            native_increment: true,
            native_sets: true,
            enumeration: true,
        }
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.load_live(key).await?.as_ref().and_then(value_bytes))
    }

    async fn write(&self, key: &str, value: &[u8], expiry: Expiry) -> Result<bool> {
        if expiry == Expiry::Keep {
            // an expired document must not lend its expiry to the new value
            self.purge_if_expired(key).await?;
            self.collection
                .update_one(
                    doc! { "_id": key },
                    doc! {
                        "$set": { "value": value_bson(value) },
                        "$setOnInsert": { "expire_at": 0_i64 },
                    },
                )
                .upsert(true)
                .await?;
            return Ok(true);
        }
        let document = doc! {
            "_id": key,
            "value": value_bson(value),
            "expire_at": expiry.resolve(self.clock.as_ref(), 0) as i64,
        };
        self.collection
            .replace_one(doc! { "_id": key }, document)
            .upsert(true)
            .await?;
        Ok(true)
    }

    async fn create_if_absent(&self, key: &str, value: &[u8], expiry: Expiry) -> Result<bool> {
        self.purge_if_expired(key).await?;
        let document = doc! {
            "_id": key,
            "value": value_bson(value),
            "expire_at": expiry.resolve(self.clock.as_ref(), 0) as i64,
        };
        match self.collection.insert_one(document).await {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.load_live(key).await?.is_some())
    }

    async fn touch(&self, key: &str, expiry: Expiry) -> Result<bool> {
        let now = self.clock.now();
        let expire_at = match expiry {
            Expiry::Keep => return self.contains(key).await,
            other => other.resolve(self.clock.as_ref(), 0) as i64,
        };
        let result = self
            .collection
            .update_one(live_filter(key, now), doc! { "$set": { "expire_at": expire_at } })
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self
            .collection
            .find_one_and_delete(doc! { "_id": key })
            .await?;
        Ok(removed.is_some_and(|d| !is_expired(expire_at_of(&d), self.clock.now())))
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut filter = live_filter(key, self.clock.now());
        filter.insert("value", value_bson(expected));
        let result = self.collection.delete_one(filter).await?;
        Ok(result.deleted_count > 0)
    }

    async fn increment(
        &self,
        key: &str,
        delta: i64,
        expiry: Expiry,
        create: bool,
    ) -> Result<Option<i64>> {
        self.purge_if_expired(key).await?;

        let mut update = doc! { "$inc": { "value": delta } };
        match expiry {
            Expiry::Keep => {
                update.insert("$setOnInsert", doc! { "expire_at": 0_i64 });
            }
            other => {
                update.insert("$set", doc! { "expire_at": other.resolve(self.clock.as_ref(), 0) as i64 });
            }
        }
        let updated = self
            .collection
            .find_one_and_update(doc! { "_id": key }, update)
            .upsert(create)
            .return_document(ReturnDocument::After)
            .await?;
        match updated {
            Some(document) => counter_of(&document).map(Some).ok_or_else(|| {
                Error::backend("mongodb", format!("value at '{}' is not a counter", key))
            }),
            None => Ok(None),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let result = self
            .collection
            .update_one(
                doc! { "_id": key },
                doc! {
                    "$addToSet": { "members": member },
                    "$setOnInsert": { "expire_at": 0_i64 },
                },
            )
            .upsert(true)
            .await?;
        Ok(result.modified_count > 0 || result.upserted_id.is_some())
    }

    async fn set_members(&self, key: &str) -> Result<Option<Vec<String>>> {
        let Some(document) = self.load_live(key).await? else {
            return Ok(None);
        };
        let mut members: Vec<String> = document
            .get_array("members")
            .map(|items| {
                items
                    .iter()
                    .filter_map(|m| m.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        members.sort();
        Ok(Some(members))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let now = self.clock.now();
        let live = doc! { "$or": [ { "expire_at": 0_i64 }, { "expire_at": { "$gt": now as i64 } } ] };
        let documents: Vec<Document> = self
            .collection
            .find(live)
            .projection(doc! { "_id": 1 })
            .await?
            .try_collect()
            .await?;
        let mut keys: Vec<String> = documents
            .iter()
            .filter_map(|d| d.get_str("_id").ok().map(str::to_string))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn flush(&self, prefixes: &[String]) -> Result<bool> {
        if prefixes.is_empty() {
            let result = self.collection.delete_many(doc! {}).await?;
            info!(deleted = result.deleted_count, "Flushed MongoDB cache collection");
            return Ok(true);
        }
        let mut deleted = 0;
        for prefix in prefixes {
            let result = self
                .collection
                .delete_many(doc! { "_id": { "$regex": regex_escape(prefix) } })
                .await?;
            deleted += result.deleted_count;
        }
        info!(deleted, "Flushed MongoDB key prefixes");
        Ok(true)
    }

    async fn status(&self) -> Result<serde_json::Value> {
        let documents = self.collection.count_documents(doc! {}).await?;
        let expired = self
            .collection
            .count_documents(expired_filter(None, self.clock.now()))
            .await?;
        Ok(json!({
            "database": self.collection.namespace().db,
            "collection": self.collection.name(),
            "documents": documents,
            "expired": expired,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.client.clone().shutdown().await;
        Ok(())
    }

    async fn read_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let documents: Vec<Document> = self
            .collection
            .find(doc! { "_id": { "$in": keys } })
            .await?
            .try_collect()
            .await?;
        let mut found: std::collections::HashMap<String, Vec<u8>> = documents
            .iter()
            .filter(|d| !is_expired(expire_at_of(d), now))
            .filter_map(|d| Some((d.get_str("_id").ok()?.to_string(), value_bytes(d)?)))
            .collect();
        Ok(keys.iter().map(|k| found.remove(k)).collect())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_stored_as_int64() {
        assert_eq!(value_bson(b"42"), Bson::Int64(42));
        assert_eq!(value_bson(b"-3"), Bson::Int64(-3));
        assert!(matches!(value_bson(b"\x01abc"), Bson::Binary(_)));
        assert!(matches!(value_bson(b"\"5\""), Bson::Binary(_)));
    }

    #[test]
    fn test_value_bytes_roundtrip() {
        let d = doc! { "value": value_bson(b"17") };
        assert_eq!(value_bytes(&d), Some(b"17".to_vec()));
        let d = doc! { "value": value_bson(b"{\"a\":1}") };
        assert_eq!(value_bytes(&d), Some(b"{\"a\":1}".to_vec()));
    }

    #[test]
    fn test_regex_escape() {
        assert_eq!(regex_escape("app:"), "^app:");
        assert_eq!(regex_escape("a.b*"), "^a\\.b\\*");
        assert_eq!(regex_escape("__tag__:"), "^__tag__:");
    }

    #[tokio::test]
    #[ignore = "needs a running MongoDB server (MONGODB_URI)"]
    async fn test_native_primitives() {
        let uri = std::env::var("MONGODB_URI")
            .unwrap_or_else(|_| "mongodb://127.0.0.1:27017".to_string());
        let b = MongoBackend::connect(&uri, "tagcache_test", "cache").await.unwrap();
        b.flush(&[]).await.unwrap();

        assert!(b.create_if_absent("k", b"v", Expiry::In(60)).await.unwrap());
        assert!(!b.create_if_absent("k", b"w", Expiry::In(60)).await.unwrap());
        assert_eq!(b.read("k").await.unwrap(), Some(b"v".to_vec()));

        assert_eq!(b.increment("n", 5, Expiry::Keep, true).await.unwrap(), Some(5));
        assert_eq!(b.increment("n", -2, Expiry::Keep, true).await.unwrap(), Some(3));
        assert_eq!(b.increment("none", 1, Expiry::Keep, false).await.unwrap(), None);

        assert!(b.set_add("__tag__:t", "k").await.unwrap());
        assert!(!b.set_add("__tag__:t", "k").await.unwrap());
        assert_eq!(b.set_members("__tag__:t").await.unwrap(), Some(vec!["k".to_string()]));

        b.flush(&[]).await.unwrap();
        b.close().await.unwrap();
    }
}
