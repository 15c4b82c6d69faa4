use async_trait::async_trait;
use colfs_lib::{join_path, FsError, FsResult, MountConfig};
use log::info;
use scylla::frame::value::Counter;
use scylla::prepared_statement::PreparedStatement;
use scylla::statement::Consistency;
use scylla::{Session, SessionBuilder};

use crate::session::{DbSession, EntryRow};

const SEL_ENTRY: &str = "SELECT hash, metadata FROM filesystem WHERE cust_id = ? AND environment = ? AND directory = ? AND name = ?";
const INS_ENTRY: &str = "INSERT INTO filesystem (cust_id, environment, directory, name, hash, metadata) VALUES (?, ?, ?, ?, ?, ?)";
const UPD_ENTRY: &str = "UPDATE filesystem SET hash = ?, metadata = ? WHERE cust_id = ? AND environment = ? AND directory = ? AND name = ?";
const UPD_META: &str = "UPDATE filesystem SET metadata = ? WHERE cust_id = ? AND environment = ? AND directory = ? AND name = ?";
const DEL_ENTRY: &str = "DELETE FROM filesystem WHERE cust_id = ? AND environment = ? AND directory = ? AND name = ?";
const SEL_DIR: &str = "SELECT name, hash, metadata FROM filesystem WHERE cust_id = ? AND environment = ? AND directory = ?";
const CNT_ENTRIES: &str = "SELECT count(1) FROM filesystem WHERE cust_id = ? AND environment = ? ALLOW FILTERING";
const SEL_CHUNK: &str = "SELECT location FROM filedata WHERE hash = ? LIMIT 1";
const INS_CHUNK: &str = "INSERT INTO filedata (hash, location, data) VALUES (?, ?, ?)";
const SEL_CHUNKS: &str = "SELECT location, data FROM filedata WHERE hash = ?";
const UPD_REFS: &str = "UPDATE fileref SET refs = refs + ? WHERE hash = ?";
const SEL_REFS: &str = "SELECT refs FROM fileref WHERE hash = ?";

fn db_err(context: &str, err: impl std::fmt::Display) -> FsError {
    FsError::DbError(format!("{}: {}", context, err))
}

fn parse_consistency(level: &str) -> FsResult<Consistency> {
    let parsed = match level.to_ascii_lowercase().as_str() {
        "any" => Consistency::Any,
        "one" => Consistency::One,
        "two" => Consistency::Two,
        "three" => Consistency::Three,
        "quorum" => Consistency::Quorum,
        "all" => Consistency::All,
        "local_quorum" | "localquorum" => Consistency::LocalQuorum,
        "each_quorum" | "eachquorum" => Consistency::EachQuorum,
        "local_one" | "localone" => Consistency::LocalOne,
        other => {
            return Err(FsError::InvalidParam(format!(
                "unknown consistency level: {}",
                other
            )))
        }
    };
    Ok(parsed)
}

async fn prepare(session: &Session, cql: &str, consistency: Consistency) -> FsResult<PreparedStatement> {
    let mut stmt = session
        .prepare(cql)
        .await
        .map_err(|e| db_err("prepare failed", e))?;
    stmt.set_consistency(consistency);
    Ok(stmt)
}

/// CQL-backed session: one prepared statement per query, all bound to the
/// consistency level from the mount configuration. The (owner, environment)
/// scope is baked in at connect time.
pub struct CqlSession {
    session: Session,
    owner_id: i32,
    environment: String,
    sel_entry: PreparedStatement,
    ins_entry: PreparedStatement,
    upd_entry: PreparedStatement,
    upd_meta: PreparedStatement,
    del_entry: PreparedStatement,
    sel_dir: PreparedStatement,
    cnt_entries: PreparedStatement,
    sel_chunk: PreparedStatement,
    ins_chunk: PreparedStatement,
    sel_chunks: PreparedStatement,
    upd_refs: PreparedStatement,
    sel_refs: PreparedStatement,
}

impl CqlSession {
    pub async fn connect(config: &MountConfig) -> FsResult<Self> {
        let mut builder = SessionBuilder::new();
        for node in config.server.split(',') {
            builder = builder.known_node(node.trim());
        }
        let session = builder
            .use_keyspace(&config.keyspace, false)
            .build()
            .await
            .map_err(|e| db_err("cluster connect failed", e))?;
        let consistency = parse_consistency(&config.consistency)?;
        info!(
            "connected to {} keyspace {} as {}:{}",
            config.server, config.keyspace, config.owner_id, config.environment
        );
        Ok(Self {
            owner_id: config.owner_id,
            environment: config.environment.clone(),
            sel_entry: prepare(&session, SEL_ENTRY, consistency).await?,
            ins_entry: prepare(&session, INS_ENTRY, consistency).await?,
            upd_entry: prepare(&session, UPD_ENTRY, consistency).await?,
            upd_meta: prepare(&session, UPD_META, consistency).await?,
            del_entry: prepare(&session, DEL_ENTRY, consistency).await?,
            sel_dir: prepare(&session, SEL_DIR, consistency).await?,
            cnt_entries: prepare(&session, CNT_ENTRIES, consistency).await?,
            sel_chunk: prepare(&session, SEL_CHUNK, consistency).await?,
            ins_chunk: prepare(&session, INS_CHUNK, consistency).await?,
            sel_chunks: prepare(&session, SEL_CHUNKS, consistency).await?,
            upd_refs: prepare(&session, UPD_REFS, consistency).await?,
            sel_refs: prepare(&session, SEL_REFS, consistency).await?,
            session,
        })
    }
}

#[async_trait]
impl DbSession for CqlSession {
    async fn get_entry(&self, dir: &str, name: &str) -> FsResult<EntryRow> {
        let result = self
            .session
            .execute(&self.sel_entry, (self.owner_id, self.environment.as_str(), dir, name))
            .await
            .map_err(|e| db_err("select entry failed", e))?;
        let row = result
            .maybe_first_row_typed::<(Option<Vec<u8>>, Option<Vec<u8>>)>()
            .map_err(|e| db_err("select entry decode failed", e))?;
        match row {
            Some((hash, metadata)) => Ok(EntryRow {
                name: name.to_string(),
                hash: hash.unwrap_or_default(),
                metadata: metadata.unwrap_or_default(),
            }),
            None => Err(FsError::NotFound(join_path(dir, name))),
        }
    }

    async fn insert_entry(&self, dir: &str, name: &str, hash: &[u8], metadata: &[u8]) -> FsResult<()> {
        self.session
            .execute(
                &self.ins_entry,
                (self.owner_id, self.environment.as_str(), dir, name, hash, metadata),
            )
            .await
            .map_err(|e| db_err("insert entry failed", e))?;
        Ok(())
    }

    async fn update_entry(&self, dir: &str, name: &str, hash: &[u8], metadata: &[u8]) -> FsResult<()> {
        self.session
            .execute(
                &self.upd_entry,
                (hash, metadata, self.owner_id, self.environment.as_str(), dir, name),
            )
            .await
            .map_err(|e| db_err("update entry failed", e))?;
        Ok(())
    }

    async fn update_metadata(&self, dir: &str, name: &str, metadata: &[u8]) -> FsResult<()> {
        self.session
            .execute(
                &self.upd_meta,
                (metadata, self.owner_id, self.environment.as_str(), dir, name),
            )
            .await
            .map_err(|e| db_err("update metadata failed", e))?;
        Ok(())
    }

    async fn delete_entry(&self, dir: &str, name: &str) -> FsResult<()> {
        self.session
            .execute(&self.del_entry, (self.owner_id, self.environment.as_str(), dir, name))
            .await
            .map_err(|e| db_err("delete entry failed", e))?;
        Ok(())
    }

    async fn list_dir(&self, dir: &str) -> FsResult<Vec<EntryRow>> {
        let result = self
            .session
            .execute(&self.sel_dir, (self.owner_id, self.environment.as_str(), dir))
            .await
            .map_err(|e| db_err("list directory failed", e))?;
        let rows = result
            .rows_typed::<(String, Option<Vec<u8>>, Option<Vec<u8>>)>()
            .map_err(|e| db_err("list directory decode failed", e))?;
        let mut entries = Vec::new();
        for row in rows {
            let (name, hash, metadata) = row.map_err(|e| db_err("list directory row failed", e))?;
            entries.push(EntryRow {
                name,
                hash: hash.unwrap_or_default(),
                metadata: metadata.unwrap_or_default(),
            });
        }
        Ok(entries)
    }

    async fn entry_count(&self) -> FsResult<u64> {
        let result = self
            .session
            .execute(&self.cnt_entries, (self.owner_id, self.environment.as_str()))
            .await
            .map_err(|e| db_err("count entries failed", e))?;
        let (count,) = result
            .first_row_typed::<(i64,)>()
            .map_err(|e| db_err("count entries decode failed", e))?;
        Ok(count.max(0) as u64)
    }

    async fn chunk_exists(&self, hash: &[u8]) -> FsResult<bool> {
        let result = self
            .session
            .execute(&self.sel_chunk, (hash,))
            .await
            .map_err(|e| db_err("probe chunk failed", e))?;
        let row = result
            .maybe_first_row_typed::<(i32,)>()
            .map_err(|e| db_err("probe chunk decode failed", e))?;
        Ok(row.is_some())
    }

    async fn insert_chunk(&self, hash: &[u8], location: i32, data: &[u8]) -> FsResult<()> {
        self.session
            .execute(&self.ins_chunk, (hash, location, data))
            .await
            .map_err(|e| db_err("insert chunk failed", e))?;
        Ok(())
    }

    async fn read_chunks(&self, hash: &[u8]) -> FsResult<Vec<(i32, Vec<u8>)>> {
        let result = self
            .session
            .execute(&self.sel_chunks, (hash,))
            .await
            .map_err(|e| db_err("read chunks failed", e))?;
        let rows = result
            .rows_typed::<(i32, Vec<u8>)>()
            .map_err(|e| db_err("read chunks decode failed", e))?;
        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row.map_err(|e| db_err("read chunk row failed", e))?);
        }
        Ok(chunks)
    }

    async fn adjust_refs(&self, hash: &[u8], delta: i64) -> FsResult<()> {
        self.session
            .execute(&self.upd_refs, (Counter(delta), hash))
            .await
            .map_err(|e| db_err("counter update failed", e))?;
        Ok(())
    }

    async fn read_refs(&self, hash: &[u8]) -> FsResult<i64> {
        let result = self
            .session
            .execute(&self.sel_refs, (hash,))
            .await
            .map_err(|e| db_err("read counter failed", e))?;
        let row = result
            .maybe_first_row_typed::<(Counter,)>()
            .map_err(|e| db_err("read counter decode failed", e))?;
        Ok(row.map(|(refs,)| refs.0).unwrap_or(0))
    }
}
