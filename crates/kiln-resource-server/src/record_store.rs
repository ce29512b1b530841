use std::path::Path;

use kiln_resource::{ResourceId, ResourcePath, ResourceType};
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::info;

use crate::Error;

/// A 64-bit value persisted through the record store.
///
/// Sqlite integers are signed; the raw bits round-trip through `i64`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct StoredHash(u64);

impl StoredHash {
    pub(crate) fn get(self) -> u64 {
        self.0
    }

    #[allow(clippy::cast_possible_wrap)]
    pub(crate) fn into_i64(self) -> i64 {
        self.0 as i64
    }

    #[allow(clippy::cast_sign_loss)]
    pub(crate) fn from_i64(value: i64) -> Self {
        Self(value as u64)
    }
}

impl From<u64> for StoredHash {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Evidence that a resource was successfully compiled, with the inputs it was
/// compiled against.
///
/// Present in the store if and only if the resource compiled successfully at
/// least once. `(path, type)` is unique in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRecord {
    /// The compiled resource.
    pub resource_id: ResourceId,
    /// Version reported by the compiler plugin at the time of the compile.
    pub compiler_version: i32,
    /// Source file timestamp at the time of the compile.
    pub file_timestamp: u64,
    /// Combined hash over the resource and its transitive compile
    /// dependencies at the time of the compile.
    pub source_timestamp_hash: u64,
}

/// Durable table of last-successful-compile records.
///
/// Backed by an embedded sqlite database with a single `CompiledResources`
/// table keyed by `(ResourcePath, ResourceType)`. All operations may be
/// invoked from multiple tasks concurrently; a row is written atomically and
/// durably before [`CompiledResourceDb::put`] returns.
#[derive(Debug)]
pub struct CompiledResourceDb {
    pool: SqlitePool,
}

impl CompiledResourceDb {
    /// Opens the database at `db_path`, creating the file and schema if
    /// absent.
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, Error> {
        let uri = Self::database_uri(db_path.as_ref());

        if !sqlx::Sqlite::database_exists(&uri).await? {
            sqlx::Sqlite::create_database(&uri).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(&uri)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS CompiledResources (
                ResourcePath TEXT UNIQUE,
                ResourceType INTEGER,
                CompilerVersion INTEGER,
                FileTimestamp INTEGER,
                SourceTimestampHash INTEGER,
                PRIMARY KEY ( ResourcePath, ResourceType ) );",
        )
        .execute(&pool)
        .await?;

        info!("compiled resource database opened: {}", uri);
        Ok(Self { pool })
    }

    /// Drops all records at `db_path` and closes the database.
    pub async fn clean(db_path: impl AsRef<Path>) -> Result<(), Error> {
        let db = Self::open(db_path).await?;
        sqlx::query("DROP TABLE IF EXISTS CompiledResources;")
            .execute(&db.pool)
            .await?;
        db.close().await;
        Ok(())
    }

    /// Returns the record for `resource_id`, or `None` if the resource was
    /// never successfully compiled.
    pub async fn get(&self, resource_id: &ResourceId) -> Result<Option<CompiledRecord>, Error> {
        let row: Option<(String, i64, i64, i64, i64)> = sqlx::query_as(
            "SELECT ResourcePath, ResourceType, CompilerVersion, FileTimestamp, SourceTimestampHash
                FROM CompiledResources
                WHERE ResourcePath = ? AND ResourceType = ?",
        )
        .bind(Self::path_key(resource_id))
        .bind(i64::from(resource_id.kind().as_raw()))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(path, kind, compiler_version, file_timestamp, source_timestamp_hash)| {
            let path = ResourcePath::new(&path)?;
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let kind = ResourceType::from_raw(kind as u32);
            #[allow(clippy::cast_possible_truncation)]
            let compiler_version = compiler_version as i32;
            Ok(CompiledRecord {
                resource_id: ResourceId::from_parts(path, kind),
                compiler_version,
                file_timestamp: StoredHash::from_i64(file_timestamp).get(),
                source_timestamp_hash: StoredHash::from_i64(source_timestamp_hash).get(),
            })
        })
        .transpose()
        .map_err(Error::InvalidResource)
    }

    /// Upserts `record`, replacing any previous record with the same key.
    pub async fn put(&self, record: &CompiledRecord) -> Result<(), Error> {
        sqlx::query(
            "INSERT OR REPLACE INTO CompiledResources
                ( ResourcePath, ResourceType, CompilerVersion, FileTimestamp, SourceTimestampHash )
                VALUES ( ?, ?, ?, ?, ? );",
        )
        .bind(Self::path_key(&record.resource_id))
        .bind(i64::from(record.resource_id.kind().as_raw()))
        .bind(i64::from(record.compiler_version))
        .bind(StoredHash::from(record.file_timestamp).into_i64())
        .bind(StoredHash::from(record.source_timestamp_hash).into_i64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Closes the database. Idempotent.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// The canonical database key: identity is case-insensitive, so the path
    /// is folded to lower case.
    fn path_key(resource_id: &ResourceId) -> String {
        resource_id.path().as_str().to_ascii_lowercase()
    }

    fn database_uri(db_path: &Path) -> String {
        format!(
            "sqlite://{}",
            db_path.to_string_lossy().replace('\\', "/")
        )
    }
}

#[cfg(test)]
mod tests {
    use kiln_resource::ResourceId;

    use super::{CompiledRecord, CompiledResourceDb, StoredHash};

    fn test_record(path: &str, compiler_version: i32) -> CompiledRecord {
        CompiledRecord {
            resource_id: ResourceId::parse(path).unwrap(),
            compiler_version,
            file_timestamp: 1000,
            source_timestamp_hash: 1500,
        }
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let work_dir = tempfile::tempdir().unwrap();
        let db = CompiledResourceDb::open(work_dir.path().join("records.db3"))
            .await
            .unwrap();

        let record = test_record("chars/hero/run.anim", 3);
        db.put(&record).await.unwrap();

        let read_back = db.get(&record.resource_id).await.unwrap().unwrap();
        assert_eq!(read_back, record);
        db.close().await;
    }

    #[tokio::test]
    async fn missing_row_is_none() {
        let work_dir = tempfile::tempdir().unwrap();
        let db = CompiledResourceDb::open(work_dir.path().join("records.db3"))
            .await
            .unwrap();

        let id = ResourceId::parse("never/compiled.anim").unwrap();
        assert!(db.get(&id).await.unwrap().is_none());
        db.close().await;
    }

    #[tokio::test]
    async fn put_replaces_on_key_collision() {
        let work_dir = tempfile::tempdir().unwrap();
        let db = CompiledResourceDb::open(work_dir.path().join("records.db3"))
            .await
            .unwrap();

        db.put(&test_record("chars/hero/run.anim", 3)).await.unwrap();
        let mut updated = test_record("chars/hero/run.anim", 4);
        updated.source_timestamp_hash = 1700;
        db.put(&updated).await.unwrap();

        let read_back = db.get(&updated.resource_id).await.unwrap().unwrap();
        assert_eq!(read_back.compiler_version, 4);
        assert_eq!(read_back.source_timestamp_hash, 1700);
        db.close().await;
    }

    #[tokio::test]
    async fn lookup_is_case_insensitive() {
        let work_dir = tempfile::tempdir().unwrap();
        let db = CompiledResourceDb::open(work_dir.path().join("records.db3"))
            .await
            .unwrap();

        db.put(&test_record("Chars/Hero/Run.ANIM", 3)).await.unwrap();
        let lower = ResourceId::parse("chars/hero/run.anim").unwrap();
        assert!(db.get(&lower).await.unwrap().is_some());
        db.close().await;
    }

    #[tokio::test]
    async fn reopen_preserves_records() {
        let work_dir = tempfile::tempdir().unwrap();
        let db_path = work_dir.path().join("records.db3");
        let record = test_record("chars/hero/run.anim", 3);
        {
            let db = CompiledResourceDb::open(&db_path).await.unwrap();
            db.put(&record).await.unwrap();
            db.close().await;
        }

        let db = CompiledResourceDb::open(&db_path).await.unwrap();
        assert_eq!(db.get(&record.resource_id).await.unwrap(), Some(record));
        db.close().await;
    }

    #[tokio::test]
    async fn clean_drops_all_records() {
        let work_dir = tempfile::tempdir().unwrap();
        let db_path = work_dir.path().join("records.db3");
        {
            let db = CompiledResourceDb::open(&db_path).await.unwrap();
            db.put(&test_record("chars/hero/run.anim", 3)).await.unwrap();
            db.close().await;
        }

        CompiledResourceDb::clean(&db_path).await.unwrap();

        let db = CompiledResourceDb::open(&db_path).await.unwrap();
        let id = ResourceId::parse("chars/hero/run.anim").unwrap();
        assert!(db.get(&id).await.unwrap().is_none());
        db.close().await;
    }

    #[tokio::test]
    async fn concurrent_puts_are_not_lost() {
        let work_dir = tempfile::tempdir().unwrap();
        let db = std::sync::Arc::new(
            CompiledResourceDb::open(work_dir.path().join("records.db3"))
                .await
                .unwrap(),
        );

        let mut tasks = vec![];
        for i in 0..16 {
            let db = db.clone();
            tasks.push(tokio::spawn(async move {
                let record = CompiledRecord {
                    resource_id: ResourceId::parse(format!("res/{}.anim", i)).unwrap(),
                    compiler_version: 1,
                    file_timestamp: i,
                    source_timestamp_hash: i,
                };
                db.put(&record).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        for i in 0..16u64 {
            let id = ResourceId::parse(format!("res/{}.anim", i)).unwrap();
            let record = db.get(&id).await.unwrap().unwrap();
            assert_eq!(record.file_timestamp, i);
        }
        db.close().await;
    }

    #[test]
    fn stored_hash_survives_sign_wrap() {
        let big = u64::MAX - 17;
        let stored = StoredHash::from(big);
        assert_eq!(StoredHash::from_i64(stored.into_i64()).get(), big);
    }
}
