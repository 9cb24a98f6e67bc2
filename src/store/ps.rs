//! The Payload Store (PS) adapter: MongoDB-backed storage for job and
//! topic-message payloads (spec.md §2, §3). Grounded in
//! `examples/original_source/zaku/mongo_helpers.py`'s `RobustMongo` class —
//! same duplicate-key-on-insert-becomes-replace behaviour, same retry shape
//! (now shared via [`crate::store::retry::with_backoff`] instead of each
//! method rolling its own loop).
//!
//! Every payload is stored as `{_id, payload: Binary, created_at}`; `_id` is
//! always the broker-minted job/message UUID string, so unlike the original
//! there's no ObjectId/string dual lookup to carry (SPEC_FULL.md, Open
//! Questions).

use anyhow::{Context, Result};
use mongodb::bson::{doc, Binary, Bson};
use mongodb::options::ClientOptions;
use mongodb::Client;

use crate::config::MongoTarget;
use crate::errors::StoreError;
use crate::store::retry::with_backoff;
use crate::store::PayloadStore;

const BINARY_SUBTYPE: mongodb::bson::spec::BinarySubtype =
    mongodb::bson::spec::BinarySubtype::Generic;

fn classify(err: mongodb::error::Error) -> StoreError {
    use mongodb::error::ErrorKind;
    match *err.kind {
        ErrorKind::Write(mongodb::error::WriteFailure::WriteError(ref we))
            if we.code == 11000 =>
        {
            // Duplicate key: not a failure from the caller's point of view,
            // `store` catches this one specifically and retries as a replace.
            StoreError::Transient(err.to_string())
        }
        ErrorKind::Authentication { .. } => StoreError::Fatal(err.to_string()),
        ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } => {
            StoreError::Transient(err.to_string())
        }
        _ => StoreError::Transient(err.to_string()),
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;
    matches!(
        *err.kind,
        ErrorKind::Write(mongodb::error::WriteFailure::WriteError(ref we)) if we.code == 11000
    )
}

pub struct MongoPayloads {
    client: Client,
    database: String,
}

impl MongoPayloads {
    pub async fn connect(target: &MongoTarget) -> Result<Self> {
        let options = ClientOptions::parse(target.connection_string())
            .await
            .context("parsing mongo connection string")?;
        let client = Client::with_options(options).context("building mongo client")?;
        Ok(MongoPayloads {
            client,
            database: target.database().to_string(),
        })
    }

    fn collection(&self, name: &str) -> mongodb::Collection<mongodb::bson::Document> {
        self.client.database(&self.database).collection(name)
    }
}

#[async_trait::async_trait]
impl PayloadStore for MongoPayloads {
    async fn store(&self, collection: &str, id: &str, payload: &[u8]) -> Result<(), StoreError> {
        let coll = self.collection(collection);
        let bin = Binary {
            subtype: BINARY_SUBTYPE,
            bytes: payload.to_vec(),
        };

        with_backoff(|| {
            let coll = coll.clone();
            let bin = bin.clone();
            async move {
                let doc = doc! {
                    "_id": id,
                    "payload": Bson::Binary(bin.clone()),
                    "created_at": crate::store::mi::now_secs(),
                };
                match coll.insert_one(doc, None).await {
                    Ok(_) => Ok(()),
                    Err(err) if is_duplicate_key(&err) => coll
                        .replace_one(
                            doc! { "_id": id },
                            doc! {
                                "_id": id,
                                "payload": Bson::Binary(bin),
                                "created_at": crate::store::mi::now_secs(),
                            },
                            None,
                        )
                        .await
                        .map(|_| ())
                        .map_err(classify),
                    Err(err) => Err(classify(err)),
                }
            }
        })
        .await
    }

    async fn fetch(&self, collection: &str, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let coll = self.collection(collection);
        with_backoff(|| {
            let coll = coll.clone();
            async move {
                let found = coll
                    .find_one(doc! { "_id": id }, None)
                    .await
                    .map_err(classify)?;
                Ok(found.and_then(|d| match d.get("payload") {
                    Some(Bson::Binary(b)) => Some(b.bytes.clone()),
                    _ => None,
                }))
            }
        })
        .await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let coll = self.collection(collection);
        with_backoff(|| {
            let coll = coll.clone();
            async move {
                let result = coll
                    .delete_one(doc! { "_id": id }, None)
                    .await
                    .map_err(classify)?;
                Ok(result.deleted_count > 0)
            }
        })
        .await
    }

    async fn bulk_delete(&self, collection: &str, ids: &[String]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let coll = self.collection(collection);
        with_backoff(|| {
            let coll = coll.clone();
            let ids = ids.to_vec();
            async move {
                let result = coll
                    .delete_many(doc! { "_id": { "$in": ids } }, None)
                    .await
                    .map_err(classify)?;
                Ok(result.deleted_count)
            }
        })
        .await
    }

    async fn health_check(&self) -> bool {
        self.client
            .database(&self.database)
            .run_command(doc! { "ping": 1 }, None)
            .await
            .is_ok()
    }
}
