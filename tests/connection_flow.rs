//! End-to-end connection scenarios over an in-memory duplex transport.
//!
//! Each test drives a real [`Connection`] worker from the client side of a
//! `tokio::io::duplex` pair, with in-memory fixtures standing in for the
//! WAL source, schema cache, migration translator, auth verifier and
//! snapshot data source.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use satellite_replication::auth::{AuthError, AuthVerifier, ClientIdentity};
use satellite_replication::error::{ErrorCode, StartReplicationErrorCode, SubsErrorCode};
use satellite_replication::lsn::Lsn;
use satellite_replication::protocol::framing::{read_frame, write_frame, Frame};
use satellite_replication::protocol::messages::{
    RpcResult, SatAuthHeaderPair, SatAuthReq, SatAuthResp, SatInStartReplicationReq,
    SatInStartReplicationResp, SatOpBegin, SatOpCommit, SatOpLog, SatOpRow, SatOpUpdate,
    SatRelation, SatRpcRequest, SatRpcResponse, SatShapeReq, SatSubsReq, SatSubsResp,
    SatTransOp, SatUnsubsReq,
};
use satellite_replication::relation::{Column, Relation, RelationIdentity};
use satellite_replication::server::{Connection, ServerDeps};
use satellite_replication::source::{
    MigrationTranslator, SchemaCache, SchemaVersion, SnapshotItem, SubscriptionDataSource,
    TranslatedDdl, WalError, WalSource,
};
use satellite_replication::txn::{
    origin_tag, Change, Migration, MigrationStmt, MigrationStmtKind, RowMap, TableColumnDef,
    TableDef, Transaction,
};
use satellite_replication::{ConnectionConfig, SatError};
use tracing::info;

// ============================================================================
// Test Infrastructure
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

const T1: u64 = 1686009600000000;
const T2: u64 = 1686009600500000;

fn lsn(byte: u8) -> Lsn {
    Lsn::from_slice(&[byte])
}

fn entries_relation() -> Arc<Relation> {
    Arc::new(Relation {
        schema: "public".into(),
        table: "entries".into(),
        columns: vec![
            Column {
                name: "id".into(),
                pg_type: "text".into(),
                nullable: false,
                part_of_identity: true,
            },
            Column {
                name: "content".into(),
                pg_type: "text".into(),
                nullable: false,
                part_of_identity: false,
            },
            Column {
                name: "content_b".into(),
                pg_type: "text".into(),
                nullable: true,
                part_of_identity: false,
            },
        ],
        primary_keys: vec!["id".into()],
    })
}

fn entries_row(id: &str, content: &str, content_b: &str) -> RowMap {
    let mut row = RowMap::new();
    row.insert("id".into(), Some(id.into()));
    row.insert("content".into(), Some(content.into()));
    row.insert("content_b".into(), Some(content_b.into()));
    row
}

/// WAL fixture: positions are single bytes compared numerically. The test
/// pushes transactions through the sender captured at subscribe time.
struct TestWal {
    sender: Mutex<Option<mpsc::Sender<Transaction>>>,
    /// Resume positions accepted by `subscribe`; everything else is behind
    /// the window.
    valid_resume: Vec<Lsn>,
}

impl TestWal {
    fn new() -> Arc<Self> {
        Arc::new(TestWal {
            sender: Mutex::new(None),
            valid_resume: Vec::new(),
        })
    }

    async fn push(&self, txn: Transaction) {
        let sender = self
            .sender
            .lock()
            .unwrap()
            .clone()
            .expect("wal not subscribed");
        sender.send(txn).await.expect("wal receiver gone");
    }

    /// True once a connection holds the stream.
    fn subscribed(&self) -> bool {
        self.sender.lock().unwrap().is_some()
    }
}

#[async_trait]
impl WalSource for TestWal {
    fn parse_position(&self, raw: &[u8]) -> std::result::Result<Lsn, SatError> {
        if raw.is_empty() {
            return Err(SatError::Frame("empty position".into()));
        }
        Ok(Lsn::from_slice(raw))
    }

    fn serialize_position(&self, lsn: &Lsn) -> Bytes {
        lsn.to_bytes()
    }

    fn compare(&self, a: &Lsn, b: &Lsn) -> Ordering {
        a.as_bytes().cmp(b.as_bytes())
    }

    fn head(&self) -> Lsn {
        Lsn::from_slice(&[0])
    }

    async fn subscribe(
        &self,
        from: Option<Lsn>,
    ) -> std::result::Result<mpsc::Receiver<Transaction>, WalError> {
        if let Some(from) = from {
            if !self.valid_resume.contains(&from) {
                return Err(WalError::BehindWindow);
            }
        }
        let (tx, rx) = mpsc::channel(64);
        *self.sender.lock().unwrap() = Some(tx);
        Ok(rx)
    }
}

struct TestSchema {
    relations: HashMap<RelationIdentity, (u32, Arc<Relation>)>,
    known_versions: Vec<String>,
}

impl TestSchema {
    fn new() -> Arc<Self> {
        let entries = entries_relation();
        let mut relations = HashMap::new();
        relations.insert(entries.identity(), (17, entries));
        Arc::new(TestSchema {
            relations,
            known_versions: vec!["20230504114018".into()],
        })
    }
}

#[async_trait]
impl SchemaCache for TestSchema {
    fn ready(&self, _origin: &str) -> bool {
        true
    }

    fn relation(&self, identity: &RelationIdentity) -> Option<Arc<Relation>> {
        self.relations.get(identity).map(|(_, r)| Arc::clone(r))
    }

    fn relation_oid(&self, identity: &RelationIdentity) -> Option<u32> {
        self.relations.get(identity).map(|(oid, _)| *oid)
    }

    fn electrified_tables(&self) -> Vec<RelationIdentity> {
        self.relations.keys().cloned().collect()
    }

    fn referenced_tables(&self, _identity: &RelationIdentity) -> Vec<RelationIdentity> {
        Vec::new()
    }

    async fn load(&self, _origin: &str, version: &str) -> Option<SchemaVersion> {
        self.known_versions
            .iter()
            .any(|v| v == version)
            .then(|| SchemaVersion {
                version: version.to_string(),
                relations: self.relations.values().map(|(_, r)| Arc::clone(r)).collect(),
            })
    }
}

struct TestTranslator;

impl MigrationTranslator for TestTranslator {
    fn translate(
        &self,
        version: &str,
        ddl_sql: &str,
    ) -> std::result::Result<TranslatedDdl, SatError> {
        Ok(TranslatedDdl {
            op: Some(Migration {
                version: version.to_string(),
                stmts: vec![MigrationStmt {
                    kind: MigrationStmtKind::CreateTable,
                    sql: ddl_sql.to_string(),
                }],
                table: Some(TableDef {
                    name: "mtable1".into(),
                    columns: vec![TableColumnDef {
                        name: "id".into(),
                        pg_type: "text".into(),
                    }],
                    fks: vec![],
                    pks: vec!["id".into()],
                }),
            }),
            new_relations: vec![],
        })
    }
}

struct TestAuth;

#[async_trait]
impl AuthVerifier for TestAuth {
    async fn verify(
        &self,
        client_id: &str,
        token: &str,
        _headers: &[SatAuthHeaderPair],
    ) -> std::result::Result<ClientIdentity, AuthError> {
        if token == "t" {
            Ok(ClientIdentity {
                client_id: client_id.to_string(),
                subject: "user-1".into(),
            })
        } else {
            Err(AuthError::InvalidCredentials("bad token".into()))
        }
    }
}

struct TestSnapshots {
    lsn: Lsn,
    items: Mutex<Vec<SnapshotItem>>,
}

impl TestSnapshots {
    fn with_entries_rows(lsn: Lsn, rows: Vec<RowMap>) -> Arc<Self> {
        Arc::new(TestSnapshots {
            lsn,
            items: Mutex::new(vec![
                SnapshotItem::ShapeBegin {
                    request_id: "r1".into(),
                    uuid: "00000000-0000-0000-0000-000000000001".into(),
                },
                SnapshotItem::Rows {
                    relation: RelationIdentity::new("public", "entries"),
                    rows,
                },
                SnapshotItem::ShapeEnd,
            ]),
        })
    }
}

#[async_trait]
impl SubscriptionDataSource for TestSnapshots {
    async fn snapshot(
        &self,
        _subscription_id: &str,
        _shapes: &[SatShapeReq],
    ) -> std::result::Result<(Lsn, mpsc::Receiver<SnapshotItem>), SatError> {
        let items = std::mem::take(&mut *self.items.lock().unwrap());
        let (tx, rx) = mpsc::channel(items.len().max(1));
        for item in items {
            tx.try_send(item).expect("snapshot channel sized to items");
        }
        Ok((self.lsn.clone(), rx))
    }
}

struct Fixture {
    wal: Arc<TestWal>,
    deps: ServerDeps,
}

fn fixture() -> Fixture {
    let wal = TestWal::new();
    fixture_with(
        Arc::clone(&wal),
        TestSnapshots::with_entries_rows(lsn(0x0A), vec![entries_row("u1", "hello", "")]),
    )
}

fn fixture_with(wal: Arc<TestWal>, snapshots: Arc<TestSnapshots>) -> Fixture {
    let deps = ServerDeps {
        wal: wal.clone() as Arc<dyn WalSource>,
        schema: TestSchema::new(),
        translator: Arc::new(TestTranslator),
        auth: Arc::new(TestAuth),
        snapshots,
    };
    Fixture { wal, deps }
}

/// Client half of the duplex pair, speaking the real wire format.
struct TestClient {
    rd: ReadHalf<DuplexStream>,
    wr: WriteHalf<DuplexStream>,
    next_id: u32,
}

impl TestClient {
    fn new(io: DuplexStream) -> Self {
        let (rd, wr) = tokio::io::split(io);
        TestClient { rd, wr, next_id: 0 }
    }

    async fn send(&mut self, frame: Frame) -> Result<()> {
        write_frame(&mut self.wr, &frame)
            .await
            .context("client write")
    }

    async fn rpc(&mut self, method: &str, message: Bytes) -> Result<u32> {
        self.next_id += 1;
        let id = self.next_id;
        self.send(Frame::RpcRequest(SatRpcRequest {
            method: method.into(),
            request_id: id,
            message,
        }))
        .await?;
        Ok(id)
    }

    async fn recv(&mut self) -> Result<Frame> {
        let frame = tokio::time::timeout(Duration::from_secs(2), read_frame(&mut self.rd))
            .await
            .context("timed out waiting for a frame")??;
        Ok(frame)
    }

    async fn recv_response(&mut self, method: &str, id: u32) -> Result<SatRpcResponse> {
        match self.recv().await? {
            Frame::RpcResponse(resp) => {
                assert_eq!(resp.method, method);
                assert_eq!(resp.request_id, id);
                Ok(resp)
            }
            other => bail!("expected rpc response, got {other:?}"),
        }
    }

    /// Asserts no frame arrives within a short window.
    async fn expect_silence(&mut self) -> Result<()> {
        let res =
            tokio::time::timeout(Duration::from_millis(100), read_frame(&mut self.rd)).await;
        if let Ok(frame) = res {
            bail!("expected silence, got {frame:?}");
        }
        Ok(())
    }

    async fn authenticate(&mut self) -> Result<SatAuthResp> {
        let req = SatAuthReq {
            id: "c1".into(),
            token: "t".into(),
            headers: vec![],
        };
        let id = self.rpc("authenticate", req.encode_to_bytes()).await?;
        let resp = self.recv_response("authenticate", id).await?;
        match resp.result {
            RpcResult::Ok(payload) => Ok(SatAuthResp::decode(payload)?),
            RpcResult::Err(err) => bail!("authentication rejected: {}", err.code),
        }
    }

    /// Starts replication and consumes the server's own `startReplication`
    /// call toward us, acking it like a real client.
    async fn start_replication(&mut self, req: SatInStartReplicationReq) -> Result<()> {
        let id = self.rpc("startReplication", req.encode_to_bytes()).await?;
        let resp = self.recv_response("startReplication", id).await?;
        let RpcResult::Ok(payload) = resp.result else {
            bail!("startReplication rpc-level error");
        };
        let resp = SatInStartReplicationResp::decode(payload)?;
        if let Some(err) = resp.err {
            bail!("startReplication failed: {}", err.code.as_str());
        }

        match self.recv().await? {
            Frame::RpcRequest(call) => {
                assert_eq!(call.method, "startReplication");
                self.send(Frame::RpcResponse(SatRpcResponse::ok(
                    "startReplication",
                    call.request_id,
                    SatInStartReplicationResp::default().encode_to_bytes(),
                )))
                .await
            }
            other => bail!("expected server startReplication call, got {other:?}"),
        }
    }
}

fn spawn_connection(
    fix: &Fixture,
) -> (
    TestClient,
    mpsc::Receiver<Transaction>,
    tokio::task::JoinHandle<std::result::Result<(), SatError>>,
) {
    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let (conn, events) = Connection::new(ConnectionConfig::default(), fix.deps.clone());
    let handle = tokio::spawn(async move { conn.run_on_stream(server_io, "electric.0.8").await });
    (TestClient::new(client_io), events, handle)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn s1_fresh_connection_auth_start_insert() -> Result<()> {
    init_tracing();
    let fix = fixture();
    let (mut client, _events, _handle) = spawn_connection(&fix);

    let auth = client.authenticate().await?;
    assert_eq!(auth.id, "electric-server");

    client
        .start_replication(SatInStartReplicationReq::default())
        .await?;
    assert!(fix.wal.subscribed());

    let txn = Transaction {
        commit_timestamp: T1,
        trans_id: "551".into(),
        lsn: lsn(0x0A),
        origin: None,
        is_migration: false,
        changes: vec![Change::Insert {
            relation: RelationIdentity::new("public", "entries"),
            new: entries_row("u1", "hello", ""),
            tags: vec![origin_tag("pg", T1)],
        }],
    };
    fix.wal.push(txn).await;

    // relation advertisement precedes the op-log frame
    let relation = match client.recv().await? {
        Frame::Relation(rel) => rel,
        other => bail!("expected relation frame, got {other:?}"),
    };
    assert_eq!(relation.relation_id, 17);
    assert_eq!(relation.schema_name, "public");
    assert_eq!(relation.table_name, "entries");

    let oplog = match client.recv().await? {
        Frame::OpLog(oplog) => oplog,
        other => bail!("expected oplog frame, got {other:?}"),
    };
    assert_eq!(oplog.ops.len(), 3);
    let SatTransOp::Begin(begin) = &oplog.ops[0] else {
        bail!("expected begin");
    };
    assert_eq!(begin.commit_timestamp, T1);
    assert_eq!(&begin.lsn[..], &[0x0A]);
    assert_eq!(begin.origin.as_deref(), Some("postgres_1"));
    let SatTransOp::Insert(insert) = &oplog.ops[1] else {
        bail!("expected insert");
    };
    assert_eq!(insert.relation_id, 17);
    assert_eq!(insert.tags, vec![origin_tag("pg", T1)]);
    let row = insert.row_data.as_ref().unwrap();
    let by_col: HashMap<&str, &Bytes> = relation
        .columns
        .iter()
        .map(|c| c.name.as_str())
        .zip(row.values.iter())
        .collect();
    assert_eq!(&by_col["id"][..], b"u1");
    assert_eq!(&by_col["content"][..], b"hello");
    assert_eq!(&by_col["content_b"][..], b"");
    // empty string, not null
    assert_eq!(row.nulls_bitmask[0], 0);
    assert!(matches!(oplog.ops[2], SatTransOp::Commit(_)));

    info!("s1 complete");
    Ok(())
}

#[tokio::test]
async fn s2_resume_with_unknown_lsn_is_behind_window() -> Result<()> {
    init_tracing();
    let fix = fixture();
    let (mut client, _events, _handle) = spawn_connection(&fix);
    client.authenticate().await?;

    // the subscription id must exist before the position is even probed
    let req = SatInStartReplicationReq {
        lsn: Bytes::from_static(&[0xDE, 0xAD, 0xBE, 0xEF]),
        subscription_ids: vec![],
        schema_version: Some("20230504114018".into()),
    };
    let id = client.rpc("startReplication", req.encode_to_bytes()).await?;
    let resp = client.recv_response("startReplication", id).await?;
    let RpcResult::Ok(payload) = resp.result else {
        bail!("expected response payload");
    };
    let resp = SatInStartReplicationResp::decode(payload)?;
    assert_eq!(
        resp.err.unwrap().code,
        StartReplicationErrorCode::BehindWindow
    );

    // no op-log frames follow a rejected start
    client.expect_silence().await?;
    Ok(())
}

#[tokio::test]
async fn s2b_unknown_subscription_id_on_resume() -> Result<()> {
    init_tracing();
    let fix = fixture();
    let (mut client, _events, _handle) = spawn_connection(&fix);
    client.authenticate().await?;

    let req = SatInStartReplicationReq {
        lsn: Bytes::new(),
        subscription_ids: vec!["sub1".into()],
        schema_version: None,
    };
    let id = client.rpc("startReplication", req.encode_to_bytes()).await?;
    let resp = client.recv_response("startReplication", id).await?;
    let RpcResult::Ok(payload) = resp.result else {
        bail!("expected response payload");
    };
    let resp = SatInStartReplicationResp::decode(payload)?;
    assert_eq!(
        resp.err.unwrap().code,
        StartReplicationErrorCode::SubscriptionNotFound
    );
    Ok(())
}

#[tokio::test]
async fn s3_subscribe_snapshot_and_duplicate_id() -> Result<()> {
    init_tracing();
    let fix = fixture();
    let (mut client, _events, _handle) = spawn_connection(&fix);
    client.authenticate().await?;
    client
        .start_replication(SatInStartReplicationReq::default())
        .await?;

    let subs = SatSubsReq {
        subscription_id: "s".into(),
        shape_requests: vec![SatShapeReq::whole_table("r1", "entries")],
    };
    let id = client.rpc("subscribe", subs.encode_to_bytes()).await?;
    let resp = client.recv_response("subscribe", id).await?;
    let RpcResult::Ok(payload) = resp.result else {
        bail!("expected subscribe ack");
    };
    let ack = SatSubsResp::decode(payload)?;
    assert_eq!(ack.subscription_id, "s");
    assert!(ack.err.is_none());

    // the snapshot bracket follows the ack
    match client.recv().await? {
        Frame::SubsDataBegin(begin) => {
            assert_eq!(begin.subscription_id, "s");
            assert_eq!(&begin.lsn[..], &[0x0A]);
        }
        other => bail!("expected SubsDataBegin, got {other:?}"),
    }
    match client.recv().await? {
        Frame::ShapeDataBegin(begin) => assert_eq!(begin.request_id, "r1"),
        other => bail!("expected ShapeDataBegin, got {other:?}"),
    }
    // first use of entries on this connection: advertisement, then rows
    assert!(matches!(client.recv().await?, Frame::Relation(_)));
    match client.recv().await? {
        Frame::OpLog(oplog) => {
            assert_eq!(oplog.ops.len(), 1);
            // snapshot rows are bare inserts without Begin/Commit framing
            assert!(matches!(oplog.ops[0], SatTransOp::Insert(_)));
        }
        other => bail!("expected snapshot rows, got {other:?}"),
    }
    assert!(matches!(client.recv().await?, Frame::ShapeDataEnd(_)));
    assert!(matches!(client.recv().await?, Frame::SubsDataEnd(_)));

    // duplicate subscription id is a typed error
    let id = client
        .rpc(
            "subscribe",
            SatSubsReq {
                subscription_id: "s".into(),
                shape_requests: vec![SatShapeReq::whole_table("r1", "entries")],
            }
            .encode_to_bytes(),
        )
        .await?;
    let resp = client.recv_response("subscribe", id).await?;
    let RpcResult::Ok(payload) = resp.result else {
        bail!("expected subscribe response payload");
    };
    let dup = SatSubsResp::decode(payload)?;
    assert_eq!(
        dup.err.unwrap().code,
        SubsErrorCode::SubscriptionIdAlreadyExists
    );
    Ok(())
}

#[tokio::test]
async fn s4_update_echo_carries_pg_winner() -> Result<()> {
    init_tracing();
    let fix = fixture();
    let (mut client, mut events, _handle) = spawn_connection(&fix);
    client.authenticate().await?;
    client
        .start_replication(SatInStartReplicationReq::default())
        .await?;

    // the client pushes its own update under a client-chosen relation id
    let relation = entries_relation();
    client
        .send(Frame::Relation(SatRelation::from_relation(1, &relation)))
        .await?;
    let new_row = SatOpRow {
        nulls_bitmask: Bytes::from_static(&[0x00]),
        values: vec![
            Bytes::from_static(b"0"),
            Bytes::from_static(b"updated"),
            Bytes::from_static(b""),
        ],
    };
    client
        .send(Frame::OpLog(SatOpLog {
            ops: vec![
                SatTransOp::Begin(SatOpBegin {
                    commit_timestamp: T2,
                    trans_id: "9".into(),
                    lsn: Bytes::from_static(&[0x01]),
                    origin: Some(String::new()),
                    is_migration: false,
                }),
                SatTransOp::Update(SatOpUpdate {
                    relation_id: 1,
                    row_data: Some(new_row),
                    old_row_data: None,
                    tags: vec![origin_tag("c1", T2)],
                }),
                SatTransOp::Commit(SatOpCommit {
                    commit_timestamp: T2,
                    trans_id: "9".into(),
                    lsn: Bytes::from_static(&[0x01]),
                }),
            ],
        }))
        .await?;

    // the assembled client transaction surfaces to the embedder
    let inbound = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .context("no inbound transaction")?
        .context("events channel closed")?;
    assert_eq!(inbound.commit_timestamp, T2);
    match &inbound.changes[0] {
        Change::Update { new, old, .. } => {
            assert_eq!(new["content"], Some("updated".into()));
            assert!(old.is_none());
        }
        other => bail!("expected update, got {other:?}"),
    }

    // PostgreSQL applies it, its conflict policy keeps the existing value,
    // and the logical stream re-broadcasts the PG-side winner at T2.
    let echo = Transaction {
        commit_timestamp: T2,
        trans_id: "552".into(),
        lsn: lsn(0x0B),
        origin: None,
        is_migration: false,
        changes: vec![Change::Update {
            relation: RelationIdentity::new("public", "entries"),
            old: None,
            new: entries_row("0", "sentinel", ""),
            tags: vec![origin_tag("pg", T2)],
        }],
    };
    fix.wal.push(echo).await;

    assert!(matches!(client.recv().await?, Frame::Relation(_)));
    let oplog = match client.recv().await? {
        Frame::OpLog(oplog) => oplog,
        other => bail!("expected oplog, got {other:?}"),
    };
    let SatTransOp::Begin(begin) = &oplog.ops[0] else {
        bail!("expected begin");
    };
    assert_eq!(begin.commit_timestamp, T2);
    let SatTransOp::Update(update) = &oplog.ops[1] else {
        bail!("expected update");
    };
    // values follow the advertised column order: id, content, content_b
    let row = update.row_data.as_ref().unwrap();
    let values: Vec<&[u8]> = row.values.iter().map(|v| &v[..]).collect();
    assert_eq!(values, vec![&b"0"[..], &b"sentinel"[..], &b""[..]]);
    Ok(())
}

#[tokio::test]
async fn s5_migration_interleaved_in_stream() -> Result<()> {
    init_tracing();
    let fix = fixture();
    let (mut client, _events, _handle) = spawn_connection(&fix);
    client.authenticate().await?;
    client
        .start_replication(SatInStartReplicationReq::default())
        .await?;

    let ddl = Transaction {
        commit_timestamp: T1,
        trans_id: "600".into(),
        lsn: lsn(0x10),
        origin: None,
        is_migration: true,
        changes: vec![Change::Ddl {
            version: "20230504114018".into(),
            sql: "CREATE TABLE \"mtable1\" (id TEXT PRIMARY KEY)".into(),
        }],
    };
    fix.wal.push(ddl).await;

    let oplog = match client.recv().await? {
        Frame::OpLog(oplog) => oplog,
        other => bail!("expected oplog, got {other:?}"),
    };
    assert_eq!(oplog.ops.len(), 3);
    let SatTransOp::Begin(begin) = &oplog.ops[0] else {
        bail!("expected begin");
    };
    assert!(begin.is_migration);
    let SatTransOp::Migrate(migrate) = &oplog.ops[1] else {
        bail!("expected migrate op");
    };
    assert_eq!(migrate.version, "20230504114018");
    assert_eq!(migrate.stmts.len(), 1);
    assert!(migrate.stmts[0].sql.starts_with("CREATE TABLE \"mtable1\""));
    assert_eq!(migrate.table.as_ref().unwrap().name, "mtable1");
    assert!(matches!(oplog.ops[2], SatTransOp::Commit(_)));
    Ok(())
}

// ============================================================================
// State machine and lifecycle
// ============================================================================

#[tokio::test]
async fn rpcs_before_authentication_are_rejected() -> Result<()> {
    init_tracing();
    let fix = fixture();
    let (mut client, _events, _handle) = spawn_connection(&fix);

    let id = client
        .rpc(
            "startReplication",
            SatInStartReplicationReq::default().encode_to_bytes(),
        )
        .await?;
    let resp = client.recv_response("startReplication", id).await?;
    match resp.result {
        RpcResult::Err(err) => assert_eq!(err.code, ErrorCode::AuthRequired),
        other => bail!("expected AUTH_REQUIRED, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn failed_authentication_closes_the_connection() -> Result<()> {
    init_tracing();
    let fix = fixture();
    let (mut client, _events, handle) = spawn_connection(&fix);

    let req = SatAuthReq {
        id: "c1".into(),
        token: "wrong".into(),
        headers: vec![],
    };
    let id = client.rpc("authenticate", req.encode_to_bytes()).await?;
    let resp = client.recv_response("authenticate", id).await?;
    match resp.result {
        RpcResult::Err(err) => assert_eq!(err.code, ErrorCode::AuthFailed),
        other => bail!("expected AUTH_FAILED, got {other:?}"),
    }

    let outcome = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .context("connection did not close")??;
    assert!(outcome.is_ok());
    Ok(())
}

#[tokio::test]
async fn subprotocol_mismatch_closes_immediately() -> Result<()> {
    init_tracing();
    let fix = fixture();
    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let (conn, _events) = Connection::new(ConnectionConfig::default(), fix.deps.clone());
    let handle = tokio::spawn(async move { conn.run_on_stream(server_io, "electric.0.7").await });

    let mut client = TestClient::new(client_io);
    match client.recv().await? {
        Frame::ErrorResp(err) => assert_eq!(err.code, ErrorCode::ProtoVsnMismatch),
        other => bail!("expected ErrorResp, got {other:?}"),
    }
    let outcome = tokio::time::timeout(Duration::from_secs(2), handle).await??;
    assert!(matches!(outcome, Err(SatError::SubprotocolMismatch(_))));
    Ok(())
}

#[tokio::test]
async fn stop_replication_halts_emission() -> Result<()> {
    init_tracing();
    let fix = fixture();
    let (mut client, _events, _handle) = spawn_connection(&fix);
    client.authenticate().await?;
    client
        .start_replication(SatInStartReplicationReq::default())
        .await?;

    let id = client.rpc("stopReplication", Bytes::new()).await?;
    let resp = client.recv_response("stopReplication", id).await?;
    assert!(matches!(resp.result, RpcResult::Ok(_)));

    // the wal stream was dropped with the cursor; nothing flows anymore
    client.expect_silence().await?;

    // back in Authenticated, replication can start again
    client
        .start_replication(SatInStartReplicationReq::default())
        .await?;
    Ok(())
}

#[tokio::test]
async fn unsubscribe_is_idempotent_over_rpc() -> Result<()> {
    init_tracing();
    let fix = fixture();
    let (mut client, _events, _handle) = spawn_connection(&fix);
    client.authenticate().await?;
    client
        .start_replication(SatInStartReplicationReq::default())
        .await?;

    let req = SatUnsubsReq {
        subscription_ids: vec!["never-created".into()],
    };
    for _ in 0..2 {
        let id = client.rpc("unsubscribe", req.encode_to_bytes()).await?;
        let resp = client.recv_response("unsubscribe", id).await?;
        assert!(matches!(resp.result, RpcResult::Ok(_)));
    }
    Ok(())
}

#[tokio::test]
async fn commit_without_begin_is_fatal() -> Result<()> {
    init_tracing();
    let fix = fixture();
    let (mut client, _events, handle) = spawn_connection(&fix);
    client.authenticate().await?;
    client
        .start_replication(SatInStartReplicationReq::default())
        .await?;

    client
        .send(Frame::OpLog(SatOpLog {
            ops: vec![SatTransOp::Commit(SatOpCommit {
                commit_timestamp: T1,
                trans_id: "1".into(),
                lsn: Bytes::from_static(&[1]),
            })],
        }))
        .await?;

    // the server reports the violation before closing
    match client.recv().await? {
        Frame::ErrorResp(err) => assert_eq!(err.code, ErrorCode::Internal),
        other => bail!("expected ErrorResp, got {other:?}"),
    }
    let outcome = tokio::time::timeout(Duration::from_secs(2), handle).await??;
    assert!(matches!(outcome, Err(SatError::Protocol(_))));
    Ok(())
}

#[tokio::test]
async fn dropped_subscription_rows_do_not_leak() -> Result<()> {
    init_tracing();
    let fix = fixture();
    let (mut client, _events, _handle) = spawn_connection(&fix);
    client.authenticate().await?;
    client
        .start_replication(SatInStartReplicationReq::default())
        .await?;

    // subscribe and drain the snapshot bracket
    let id = client
        .rpc(
            "subscribe",
            SatSubsReq {
                subscription_id: "s".into(),
                shape_requests: vec![SatShapeReq::whole_table("r1", "entries")],
            }
            .encode_to_bytes(),
        )
        .await?;
    client.recv_response("subscribe", id).await?;
    loop {
        if matches!(client.recv().await?, Frame::SubsDataEnd(_)) {
            break;
        }
    }

    // drop the subscription, then commit a row into its table
    let id = client
        .rpc(
            "unsubscribe",
            SatUnsubsReq {
                subscription_ids: vec!["s".into()],
            }
            .encode_to_bytes(),
        )
        .await?;
    client.recv_response("unsubscribe", id).await?;

    fix.wal
        .push(Transaction {
            commit_timestamp: T2,
            trans_id: "700".into(),
            lsn: lsn(0x20),
            origin: None,
            is_migration: false,
            changes: vec![Change::Insert {
                relation: RelationIdentity::new("public", "entries"),
                new: entries_row("u9", "late", ""),
                tags: vec![],
            }],
        })
        .await;

    client.expect_silence().await?;
    Ok(())
}
