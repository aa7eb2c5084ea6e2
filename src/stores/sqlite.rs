//! SQLite-backed vector index using the sqlite-vec extension.

use std::mem::transmute;
use std::os::raw::c_char;
use std::path::Path;
use std::sync::Once;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_rusqlite::{Connection, OptionalExtension, ffi};

use super::{ChunkRecord, DocumentMeta, DocumentStatus, IndexError, VectorIndex};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    filename TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL,
    sequence_index INTEGER NOT NULL,
    text TEXT NOT NULL,
    language_hint TEXT,
    embedding TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id);";

const CHUNK_COLUMNS: &str = "id, document_id, sequence_index, text, language_hint, embedding";

/// Durable [`VectorIndex`] on a single SQLite file.
///
/// Embeddings are stored as JSON float arrays and compared with
/// `vec_distance_cosine` from sqlite-vec. Similarity search scans the
/// chunk table, which is adequate at the corpus sizes this serves.
#[derive(Clone)]
pub struct SqliteVectorIndex {
    conn: Connection,
}

impl SqliteVectorIndex {
    /// Opens (or creates) the index database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        register_sqlite_vec()?;
        let conn = Connection::open(path)
            .await
            .map_err(|err| IndexError::Storage(err.to_string()))?;
        Self::initialize(conn).await
    }

    /// Opens an in-memory database. Useful in tests.
    pub async fn open_in_memory() -> Result<Self, IndexError> {
        register_sqlite_vec()?;
        let conn = Connection::open_in_memory()
            .await
            .map_err(|err| IndexError::Storage(err.to_string()))?;
        Self::initialize(conn).await
    }

    async fn initialize(conn: Connection) -> Result<Self, IndexError> {
        conn.call(|conn| {
            conn.query_row("select vec_version()", [], |row| row.get::<_, String>(0))
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
            conn.execute_batch(SCHEMA)
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
            Ok(())
        })
        .await
        .map_err(|err| IndexError::Storage(err.to_string()))?;
        Ok(Self { conn })
    }
}

/// Registers sqlite-vec as an auto extension for every new connection.
///
/// sqlite-vec exposes a C entry point with a narrower signature than
/// `sqlite3_auto_extension` expects, hence the transmute. Registration
/// happens once per process.
fn register_sqlite_vec() -> Result<(), IndexError> {
    use std::sync::Mutex;

    static INIT: Once = Once::new();
    static INIT_RESULT: Mutex<Option<Result<(), String>>> = Mutex::new(None);

    INIT.call_once(|| {
        let result = unsafe {
            type SqliteExtensionInit = unsafe extern "C" fn(
                *mut ffi::sqlite3,
                *mut *mut c_char,
                *const ffi::sqlite3_api_routines,
            ) -> i32;

            let init: unsafe extern "C" fn() = sqlite_vec::sqlite3_vec_init;
            let init_fn: SqliteExtensionInit =
                transmute::<unsafe extern "C" fn(), SqliteExtensionInit>(init);
            let rc = ffi::sqlite3_auto_extension(Some(init_fn));
            if rc != 0 {
                Err(format!(
                    "failed to register sqlite-vec extension (code {rc})"
                ))
            } else {
                Ok(())
            }
        };
        if let Ok(mut slot) = INIT_RESULT.lock() {
            *slot = Some(result);
        }
    });

    match INIT_RESULT.lock() {
        Ok(slot) => match slot.clone() {
            Some(Ok(())) => Ok(()),
            Some(Err(msg)) => Err(IndexError::Storage(msg)),
            None => Err(IndexError::Storage(
                "sqlite-vec registration state missing".to_string(),
            )),
        },
        Err(_) => Err(IndexError::Storage(
            "sqlite-vec registration mutex poisoned".to_string(),
        )),
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<(), IndexError> {
        if chunks.is_empty() {
            return Ok(());
        }
        let mut rows = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let embedding = chunk.embedding.as_ref().ok_or_else(|| {
                IndexError::Storage(format!("chunk {} has no embedding", chunk.id))
            })?;
            let embedding_json = serde_json::to_string(embedding)
                .map_err(|err| IndexError::Storage(err.to_string()))?;
            rows.push((chunk, embedding_json));
        }
        self.conn
            .call(move |conn| {
                let tx = conn.transaction().map_err(tokio_rusqlite::Error::Rusqlite)?;
                for (chunk, embedding_json) in rows {
                    tx.execute(
                        "INSERT OR REPLACE INTO chunks
                         (id, document_id, sequence_index, text, language_hint, embedding)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        (
                            &chunk.id,
                            &chunk.document_id,
                            chunk.sequence_index as i64,
                            &chunk.text,
                            &chunk.language_hint,
                            &embedding_json,
                        ),
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                }
                tx.commit().map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(|err| IndexError::Storage(err.to_string()))
    }

    async fn delete_document_chunks(&self, document_id: &str) -> Result<usize, IndexError> {
        let document_id = document_id.to_string();
        self.conn
            .call(move |conn| {
                let deleted = conn
                    .execute("DELETE FROM chunks WHERE document_id = ?1", [&document_id])
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(deleted)
            })
            .await
            .map_err(|err| IndexError::Storage(err.to_string()))
    }

    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        document_filter: Option<&str>,
    ) -> Result<Vec<(ChunkRecord, f32)>, IndexError> {
        let embedding_json = serde_json::to_string(query_embedding)
            .map_err(|err| IndexError::Storage(err.to_string()))?;
        let document_filter = document_filter.map(str::to_string);
        self.conn
            .call(move |conn| {
                // An empty ?2 means no document scope.
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {CHUNK_COLUMNS}, \
                         vec_distance_cosine(vec_f32(embedding), vec_f32(?1)) AS distance \
                         FROM chunks \
                         WHERE (?2 = '' OR document_id = ?2) \
                         ORDER BY distance ASC \
                         LIMIT {top_k}"
                    ))
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let params = (&embedding_json, document_filter.unwrap_or_default());
                let rows = stmt
                    .query_map(params, |row| {
                        let embedding_json: String = row.get(5)?;
                        let chunk = ChunkRecord {
                            id: row.get(0)?,
                            document_id: row.get(1)?,
                            sequence_index: row.get::<_, i64>(2)? as usize,
                            text: row.get(3)?,
                            language_hint: row.get(4)?,
                            embedding: serde_json::from_str(&embedding_json).ok(),
                        };
                        let distance: f32 = row.get(6)?;
                        Ok((chunk, 1.0 - distance))
                    })
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let mut results = Vec::new();
                for row in rows {
                    results.push(row.map_err(tokio_rusqlite::Error::Rusqlite)?);
                }
                Ok(results)
            })
            .await
            .map_err(|err| IndexError::Storage(err.to_string()))
    }

    async fn chunk_by_id(&self, chunk_id: &str) -> Result<Option<ChunkRecord>, IndexError> {
        let chunk_id = chunk_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id = ?1"))
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let result = stmt
                    .query_row([&chunk_id], |row| {
                        let embedding_json: String = row.get(5)?;
                        Ok(ChunkRecord {
                            id: row.get(0)?,
                            document_id: row.get(1)?,
                            sequence_index: row.get::<_, i64>(2)? as usize,
                            text: row.get(3)?,
                            language_hint: row.get(4)?,
                            embedding: serde_json::from_str(&embedding_json).ok(),
                        })
                    })
                    .optional()
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(result)
            })
            .await
            .map_err(|err| IndexError::Storage(err.to_string()))
    }

    async fn count(&self) -> Result<usize, IndexError> {
        self.conn
            .call(|conn| {
                let count: i64 = conn
                    .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(count as usize)
            })
            .await
            .map_err(|err| IndexError::Storage(err.to_string()))
    }

    async fn upsert_document(&self, meta: DocumentMeta) -> Result<(), IndexError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO documents (id, filename, status, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    (
                        &meta.id,
                        &meta.filename,
                        meta.status.as_str(),
                        meta.created_at.to_rfc3339(),
                    ),
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(|err| IndexError::Storage(err.to_string()))
    }

    async fn set_document_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
    ) -> Result<(), IndexError> {
        let id_for_query = document_id.to_string();
        let updated = self
            .conn
            .call(move |conn| {
                let updated = conn
                    .execute(
                        "UPDATE documents SET status = ?1 WHERE id = ?2",
                        (status.as_str(), &id_for_query),
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(updated)
            })
            .await
            .map_err(|err| IndexError::Storage(err.to_string()))?;
        if updated == 0 {
            return Err(IndexError::UnknownDocument {
                document_id: document_id.to_string(),
            });
        }
        Ok(())
    }

    async fn document(&self, document_id: &str) -> Result<Option<DocumentMeta>, IndexError> {
        let document_id = document_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, filename, status, created_at FROM documents WHERE id = ?1",
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let result = stmt
                    .query_row([&document_id], |row| {
                        let status_raw: String = row.get(2)?;
                        let created_raw: String = row.get(3)?;
                        Ok(DocumentMeta {
                            id: row.get(0)?,
                            filename: row.get(1)?,
                            status: DocumentStatus::parse(&status_raw)
                                .unwrap_or(DocumentStatus::Failed),
                            created_at: created_raw
                                .parse::<DateTime<Utc>>()
                                .unwrap_or_else(|_| Utc::now()),
                        })
                    })
                    .optional()
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(result)
            })
            .await
            .map_err(|err| IndexError::Storage(err.to_string()))
    }

    async fn list_documents(&self) -> Result<Vec<DocumentMeta>, IndexError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, filename, status, created_at FROM documents
                         ORDER BY created_at DESC, id ASC",
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let rows = stmt
                    .query_map([], |row| {
                        let status_raw: String = row.get(2)?;
                        let created_raw: String = row.get(3)?;
                        Ok(DocumentMeta {
                            id: row.get(0)?,
                            filename: row.get(1)?,
                            status: DocumentStatus::parse(&status_raw)
                                .unwrap_or(DocumentStatus::Failed),
                            created_at: created_raw
                                .parse::<DateTime<Utc>>()
                                .unwrap_or_else(|_| Utc::now()),
                        })
                    })
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let mut docs = Vec::new();
                for row in rows {
                    docs.push(row.map_err(tokio_rusqlite::Error::Rusqlite)?);
                }
                Ok(docs)
            })
            .await
            .map_err(|err| IndexError::Storage(err.to_string()))
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), IndexError> {
        let document_id = document_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction().map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.execute("DELETE FROM chunks WHERE document_id = ?1", [&document_id])
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.execute("DELETE FROM documents WHERE id = ?1", [&document_id])
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.commit().map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(|err| IndexError::Storage(err.to_string()))
    }
}
