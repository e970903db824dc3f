//! The per-peer connection state machine.
//!
//! States: `Connected -> Authenticated -> Replicating -> Closed`, with the
//! replication state carrying an orthogonal snapshot sub-mode (an open
//! `SubsDataBegin`/`SubsDataEnd` bracket). The worker owns every piece of
//! per-connection state - relation registries, assembler, subscriptions,
//! cursor, RPC correlation - and is the only writer to the transport, so
//! frames leave in a single total order.
//!
//! Fatal errors send a best-effort `SatErrorResp` and tear the connection
//! down; request-scoped errors answer the originating RPC and leave the
//! connection open.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::auth::AuthVerifier;
use crate::config::ConnectionConfig;
use crate::error::{ErrorCode, Result, SatError};
use crate::lsn::Lsn;
use crate::protocol::framing::{read_frame, write_frame, Frame};
use crate::protocol::messages::{
    SatAuthReq, SatAuthResp, SatErrorResp, SatInStartReplicationReq, SatInStartReplicationResp,
    SatInStopReplicationResp, SatOpLog, SatRelation, SatReplicationError, SatRpcRequest,
    SatRpcResponse, SatSubsReq, SatSubsResp, SatUnsubsReq, SatUnsubsResp,
};
use crate::protocol::oplog::{serialize_transaction, TransactionAssembler};
use crate::relation::RelationRegistry;
use crate::rpc::RpcMultiplexer;
use crate::source::{
    MigrationTranslator, SchemaCache, SnapshotItem, SubscriptionDataSource, WalError, WalSource,
};
use crate::subscription::{DeliveryOutcome, DeliveryQueue, SnapshotDelivery, SubscriptionStore};
use crate::cursor::{validate_start, ReplicationCursor};
use crate::error::StartReplicationErrorCode;
use crate::txn::Transaction;

/// The external collaborators a connection consumes.
#[derive(Clone)]
pub struct ServerDeps {
    pub wal: Arc<dyn WalSource>,
    pub schema: Arc<dyn SchemaCache>,
    pub translator: Arc<dyn MigrationTranslator>,
    pub auth: Arc<dyn AuthVerifier>,
    pub snapshots: Arc<dyn SubscriptionDataSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Connected,
    Authenticated,
    Replicating,
    Closed,
}

/// A single client connection.
///
/// Create with [`Connection::new`], then drive it with
/// [`Connection::run_on_stream`]; client-originated transactions surface on
/// the returned events receiver.
pub struct Connection {
    cfg: ConnectionConfig,
    deps: ServerDeps,
    events: mpsc::Sender<Transaction>,

    state: ConnState,
    rpc: RpcMultiplexer,
    out_registry: RelationRegistry,
    assembler: TransactionAssembler,
    subscriptions: SubscriptionStore,
    cursor: ReplicationCursor,
    /// Subscriptions whose live changes flow on this connection.
    resumed: HashSet<String>,
    /// Latches once the client has ever held a subscription; before that,
    /// every electrified table is broadcast.
    saw_subscriptions: bool,

    wal_rx: Option<mpsc::Receiver<Transaction>>,
    delivery: Option<SnapshotDelivery>,
    delivery_rx: Option<mpsc::Receiver<SnapshotItem>>,
    delivery_queue: DeliveryQueue,
}

impl Connection {
    pub fn new(cfg: ConnectionConfig, deps: ServerDeps) -> (Self, mpsc::Receiver<Transaction>) {
        Self::with_subscriptions(cfg, deps, SubscriptionStore::new())
    }

    /// Seeds the connection with a client's previously known subscriptions,
    /// reconciled on reconnect.
    pub fn with_subscriptions(
        cfg: ConnectionConfig,
        deps: ServerDeps,
        subscriptions: SubscriptionStore,
    ) -> (Self, mpsc::Receiver<Transaction>) {
        let (events, events_rx) = mpsc::channel(cfg.buffer_events);
        let saw_subscriptions = !subscriptions.is_empty();
        (
            Connection {
                cfg,
                deps,
                events,
                state: ConnState::Connected,
                rpc: RpcMultiplexer::new(),
                out_registry: RelationRegistry::new(),
                assembler: TransactionAssembler::new(),
                subscriptions,
                cursor: ReplicationCursor::new(),
                resumed: HashSet::new(),
                saw_subscriptions,
                wal_rx: None,
                delivery: None,
                delivery_rx: None,
                delivery_queue: DeliveryQueue::new(),
            },
            events_rx,
        )
    }

    /// Runs the connection to completion over `stream`.
    ///
    /// `subprotocol` is the transport-negotiated string
    /// (`electric.<major>.<minor>`); a mismatch closes immediately.
    pub async fn run_on_stream<S>(mut self, stream: S, subprotocol: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (rd, mut wr) = tokio::io::split(stream);

        if !self.cfg.version.matches(subprotocol) {
            let resp = SatErrorResp::new(
                ErrorCode::ProtoVsnMismatch,
                format!("server speaks {}", self.cfg.version),
            );
            let _ = write_frame(&mut wr, &Frame::ErrorResp(resp)).await;
            return Err(SatError::SubprotocolMismatch(format!(
                "peer offered {subprotocol:?}, server speaks {}",
                self.cfg.version
            )));
        }

        let (frame_tx, mut frame_rx) = mpsc::channel(self.cfg.buffer_frames);
        let reader = tokio::spawn(read_loop(rd, frame_tx));

        let result = self.run_loop(&mut frame_rx, &mut wr).await;

        reader.abort();
        self.rpc.fail_all();
        self.state = ConnState::Closed;

        if let Err(err) = &result {
            if err.is_fatal() && !err.is_io() {
                let resp = SatErrorResp::new(ErrorCode::Internal, err.to_string());
                let _ = write_frame(&mut wr, &Frame::ErrorResp(resp)).await;
            }
        }
        result
    }

    async fn run_loop<W: AsyncWrite + Unpin>(
        &mut self,
        frame_rx: &mut mpsc::Receiver<Result<Frame>>,
        wr: &mut W,
    ) -> Result<()> {
        loop {
            tokio::select! {
                frame = frame_rx.recv() => {
                    match frame {
                        Some(Ok(frame)) => {
                            if !self.handle_frame(frame, wr).await? {
                                return Ok(());
                            }
                        }
                        Some(Err(err)) => return Err(err),
                        // peer hung up
                        None => return Ok(()),
                    }
                }
                txn = recv_opt(&mut self.wal_rx) => {
                    match txn {
                        Some(txn) => self.emit_transaction(txn, wr).await?,
                        None => {
                            let resp = SatErrorResp::new(
                                ErrorCode::ReplicationFailed,
                                "wal source terminated",
                            );
                            let _ = write_frame(wr, &Frame::ErrorResp(resp)).await;
                            return Err(SatError::Internal(
                                "wal source terminated while replicating".into(),
                            ));
                        }
                    }
                }
                item = recv_opt(&mut self.delivery_rx) => {
                    self.step_delivery(item, wr).await?;
                }
            }
        }
    }

    /// Dispatches one inbound frame. Returns `false` for a clean close.
    async fn handle_frame<W: AsyncWrite + Unpin>(
        &mut self,
        frame: Frame,
        wr: &mut W,
    ) -> Result<bool> {
        match frame {
            Frame::RpcRequest(req) => {
                self.dispatch_rpc(req, wr).await?;
                Ok(self.state != ConnState::Closed)
            }
            Frame::RpcResponse(resp) => {
                self.rpc.complete(resp);
                Ok(true)
            }
            Frame::Relation(rel) => {
                self.handle_inbound_relation(&rel)?;
                Ok(true)
            }
            Frame::OpLog(oplog) => {
                self.handle_inbound_oplog(oplog).await?;
                Ok(true)
            }
            Frame::ErrorResp(err) => {
                tracing::warn!(code = %err.code, message = %err.message, "peer reported a fatal error");
                Ok(false)
            }
            // The snapshot bracket flows server to client only.
            Frame::SubsDataBegin(_)
            | Frame::SubsDataEnd(_)
            | Frame::ShapeDataBegin(_)
            | Frame::ShapeDataEnd(_)
            | Frame::SubsDataError(_) => Err(SatError::Protocol(
                "subscription data frames are not accepted from clients".into(),
            )),
        }
    }

    fn handle_inbound_relation(&mut self, rel: &SatRelation) -> Result<()> {
        if self.state == ConnState::Connected {
            return Err(SatError::Protocol(
                "relation advertisement before authentication".into(),
            ));
        }
        self.assembler.handle_relation(rel)
    }

    async fn handle_inbound_oplog(&mut self, oplog: SatOpLog) -> Result<()> {
        if self.state == ConnState::Connected {
            return Err(SatError::Protocol("op-log before authentication".into()));
        }
        for txn in self.assembler.handle_oplog(oplog)? {
            // Teacher-style fire and forget: a departed consumer is not an
            // error for the protocol engine.
            let _ = self.events.send(txn).await;
        }
        Ok(())
    }

    async fn dispatch_rpc<W: AsyncWrite + Unpin>(
        &mut self,
        req: SatRpcRequest,
        wr: &mut W,
    ) -> Result<()> {
        let method = req.method.clone();
        let request_id = req.request_id;

        if self.rpc.begin_inbound(&method, request_id).is_err() {
            let resp = SatRpcResponse::error(
                method.clone(),
                request_id,
                SatErrorResp::new(ErrorCode::InvalidRequest, "duplicate request id"),
            );
            return write_frame(wr, &Frame::RpcResponse(resp)).await;
        }

        let result = self.fulfill_rpc(&req, wr).await;
        self.rpc.end_inbound(&method, request_id);
        result
    }

    async fn fulfill_rpc<W: AsyncWrite + Unpin>(
        &mut self,
        req: &SatRpcRequest,
        wr: &mut W,
    ) -> Result<()> {
        if self.state == ConnState::Connected && req.method != "authenticate" {
            return self
                .respond_error(req, ErrorCode::AuthRequired, "authenticate first", wr)
                .await;
        }

        match req.method.as_str() {
            "authenticate" => self.rpc_authenticate(req, wr).await,
            "startReplication" => self.rpc_start_replication(req, wr).await,
            "stopReplication" => self.rpc_stop_replication(req, wr).await,
            "subscribe" => self.rpc_subscribe(req, wr).await,
            "unsubscribe" => self.rpc_unsubscribe(req, wr).await,
            other => {
                tracing::debug!(method = other, "unrecognized rpc method");
                self.respond_error(req, ErrorCode::InvalidRequest, "unknown method", wr)
                    .await
            }
        }
    }

    async fn respond_error<W: AsyncWrite + Unpin>(
        &mut self,
        req: &SatRpcRequest,
        code: ErrorCode,
        message: &str,
        wr: &mut W,
    ) -> Result<()> {
        let resp = SatRpcResponse::error(
            req.method.clone(),
            req.request_id,
            SatErrorResp::new(code, message),
        );
        write_frame(wr, &Frame::RpcResponse(resp)).await
    }

    async fn respond_ok<W: AsyncWrite + Unpin>(
        &mut self,
        req: &SatRpcRequest,
        message: bytes::Bytes,
        wr: &mut W,
    ) -> Result<()> {
        let resp = SatRpcResponse::ok(req.method.clone(), req.request_id, message);
        write_frame(wr, &Frame::RpcResponse(resp)).await
    }

    async fn rpc_authenticate<W: AsyncWrite + Unpin>(
        &mut self,
        req: &SatRpcRequest,
        wr: &mut W,
    ) -> Result<()> {
        if self.state != ConnState::Connected {
            return self
                .respond_error(req, ErrorCode::InvalidRequest, "already authenticated", wr)
                .await;
        }
        let auth_req = SatAuthReq::decode(req.message.clone())?;
        match self
            .deps
            .auth
            .verify(&auth_req.id, &auth_req.token, &auth_req.headers)
            .await
        {
            Ok(identity) => {
                tracing::debug!(client_id = %identity.client_id, "client authenticated");
                self.state = ConnState::Authenticated;
                let resp = SatAuthResp {
                    id: self.cfg.server_id.clone(),
                };
                self.respond_ok(req, resp.encode_to_bytes(), wr).await
            }
            Err(err) => {
                self.respond_error(req, ErrorCode::AuthFailed, &err.to_string(), wr)
                    .await?;
                self.state = ConnState::Closed;
                Ok(())
            }
        }
    }

    async fn rpc_start_replication<W: AsyncWrite + Unpin>(
        &mut self,
        req: &SatRpcRequest,
        wr: &mut W,
    ) -> Result<()> {
        if self.state != ConnState::Authenticated {
            return self
                .respond_error(req, ErrorCode::InvalidRequest, "already replicating", wr)
                .await;
        }
        let start_req = SatInStartReplicationReq::decode(req.message.clone())?;
        let plan = match validate_start(
            &start_req,
            self.deps.wal.as_ref(),
            self.deps.schema.as_ref(),
            &self.cfg.origin,
            &self.subscriptions,
        )
        .await
        {
            Ok(plan) => plan,
            Err(err) => return self.respond_start_error(req, err, wr).await,
        };

        let wal_rx = match self.deps.wal.subscribe(plan.resume_from.clone()).await {
            Ok(rx) => rx,
            Err(WalError::BehindWindow) => {
                let err = SatReplicationError::new(
                    StartReplicationErrorCode::BehindWindow,
                    "position is older than the retention window",
                );
                return self.respond_start_error(req, err, wr).await;
            }
            Err(WalError::InvalidPosition) => {
                let err = SatReplicationError::new(
                    StartReplicationErrorCode::InvalidPosition,
                    "position is ahead of the stream",
                );
                return self.respond_start_error(req, err, wr).await;
            }
        };

        self.cursor
            .resume(plan.resume_from, plan.schema_version.clone());
        self.resumed = plan.resumed_subscriptions;
        self.wal_rx = Some(wal_rx);
        self.state = ConnState::Replicating;
        tracing::debug!(
            position = %self.cursor.position().unwrap_or(&Lsn::EMPTY),
            subscriptions = self.resumed.len(),
            "replication started"
        );

        self.respond_ok(
            req,
            SatInStartReplicationResp::default().encode_to_bytes(),
            wr,
        )
        .await?;

        // Ask the peer to start pushing its own writes.
        let (call, _completion) = self.rpc.start_call(
            "startReplication",
            SatInStartReplicationReq::default().encode_to_bytes(),
        )?;
        write_frame(wr, &Frame::RpcRequest(call)).await
    }

    async fn respond_start_error<W: AsyncWrite + Unpin>(
        &mut self,
        req: &SatRpcRequest,
        err: SatReplicationError,
        wr: &mut W,
    ) -> Result<()> {
        let resp = SatInStartReplicationResp { err: Some(err) };
        self.respond_ok(req, resp.encode_to_bytes(), wr).await
    }

    async fn rpc_stop_replication<W: AsyncWrite + Unpin>(
        &mut self,
        req: &SatRpcRequest,
        wr: &mut W,
    ) -> Result<()> {
        if self.state != ConnState::Replicating {
            return self
                .respond_error(req, ErrorCode::InvalidRequest, "not replicating", wr)
                .await;
        }
        self.wal_rx = None;
        // An open bracket cannot be finished once emission stops.
        if let Some(delivery) = self.delivery.take() {
            self.subscriptions.mark_cancelled(&delivery.subscription_id);
        }
        self.delivery_rx = None;
        self.delivery_queue = DeliveryQueue::new();
        self.state = ConnState::Authenticated;
        tracing::debug!("replication stopped");
        self.respond_ok(req, SatInStopReplicationResp.encode_to_bytes(), wr)
            .await
    }

    async fn rpc_subscribe<W: AsyncWrite + Unpin>(
        &mut self,
        req: &SatRpcRequest,
        wr: &mut W,
    ) -> Result<()> {
        if self.state != ConnState::Replicating {
            return self
                .respond_error(req, ErrorCode::InvalidRequest, "not replicating", wr)
                .await;
        }
        let subs_req = SatSubsReq::decode(req.message.clone())?;
        let resp = match self.subscriptions.insert(
            &subs_req.subscription_id,
            subs_req.shape_requests.clone(),
            self.deps.schema.as_ref(),
        ) {
            Ok(()) => SatSubsResp {
                subscription_id: subs_req.subscription_id.clone(),
                err: None,
            },
            Err(err) => SatSubsResp {
                subscription_id: subs_req.subscription_id.clone(),
                err: Some(err),
            },
        };
        let accepted = resp.err.is_none();
        self.respond_ok(req, resp.encode_to_bytes(), wr).await?;

        if accepted {
            self.saw_subscriptions = true;
            self.resumed.insert(subs_req.subscription_id.clone());
            self.delivery_queue.push(subs_req.subscription_id);
            if self.delivery.is_none() {
                self.start_next_delivery(wr).await?;
            }
        }
        Ok(())
    }

    async fn rpc_unsubscribe<W: AsyncWrite + Unpin>(
        &mut self,
        req: &SatRpcRequest,
        wr: &mut W,
    ) -> Result<()> {
        let unsubs = SatUnsubsReq::decode(req.message.clone())?;
        self.subscriptions.remove(&unsubs.subscription_ids);
        self.delivery_queue.discard(&unsubs.subscription_ids);
        for id in &unsubs.subscription_ids {
            self.resumed.remove(id);
        }
        self.respond_ok(req, SatUnsubsResp.encode_to_bytes(), wr)
            .await
    }

    /// Serializes one WAL transaction, filtered to the client's live
    /// subscriptions, and writes its frames.
    async fn emit_transaction<W: AsyncWrite + Unpin>(
        &mut self,
        mut txn: Transaction,
        wr: &mut W,
    ) -> Result<()> {
        self.cursor.advance(self.deps.wal.as_ref(), txn.lsn.clone())?;

        // A client that has never held a subscription receives every
        // electrified table. Once it has, only resumed-or-activated ones
        // flow, so tables of dropped subscriptions never leak back in.
        if self.saw_subscriptions {
            let live = self.subscriptions.live_tables(&self.resumed);
            txn.changes.retain(|change| match change.relation() {
                Some(identity) => live.contains(&identity.table),
                // schema changes always flow
                None => true,
            });
        }

        let frames = serialize_transaction(
            &txn,
            &self.cfg.origin,
            &mut self.out_registry,
            self.deps.schema.as_ref(),
            self.deps.translator.as_ref(),
        )?;
        for frame in &frames {
            write_frame(wr, frame).await?;
        }
        Ok(())
    }

    /// Feeds one snapshot item through the open delivery.
    async fn step_delivery<W: AsyncWrite + Unpin>(
        &mut self,
        item: Option<SnapshotItem>,
        wr: &mut W,
    ) -> Result<()> {
        let Some(delivery) = self.delivery.as_mut() else {
            return Ok(());
        };
        let step = delivery.handle_item(
            item,
            &mut self.out_registry,
            self.deps.schema.as_ref(),
        )?;
        for frame in &step.frames {
            write_frame(wr, frame).await?;
        }
        if let Some(outcome) = step.outcome {
            let id = self.delivery.take().map(|d| d.subscription_id);
            self.delivery_rx = None;
            if let Some(id) = id {
                match outcome {
                    DeliveryOutcome::Completed => {
                        tracing::debug!(subscription = %id, "snapshot delivered");
                        self.subscriptions.mark_active(&id);
                    }
                    DeliveryOutcome::Failed => {
                        tracing::warn!(subscription = %id, "snapshot delivery failed");
                        self.subscriptions.mark_cancelled(&id);
                    }
                }
            }
            self.start_next_delivery(wr).await?;
        }
        Ok(())
    }

    /// Opens the next queued snapshot, skipping ids unsubscribed meanwhile.
    async fn start_next_delivery<W: AsyncWrite + Unpin>(&mut self, wr: &mut W) -> Result<()> {
        while let Some(id) = self.delivery_queue.pop() {
            let Some(sub) = self.subscriptions.get(&id) else {
                continue;
            };
            let shapes = sub.shapes.clone();
            match self.deps.snapshots.snapshot(&id, &shapes).await {
                Ok((lsn, rx)) => {
                    self.subscriptions.mark_delivering(&id, lsn.clone());
                    let delivery = SnapshotDelivery::new(id, lsn);
                    write_frame(wr, &delivery.begin_frame()).await?;
                    self.delivery = Some(delivery);
                    self.delivery_rx = Some(rx);
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(subscription = %id, error = %err, "could not open snapshot");
                    self.subscriptions.mark_cancelled(&id);
                }
            }
        }
        Ok(())
    }
}

/// Receives on an optional channel; an absent channel never yields.
async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Reads frames off the transport until it fails or closes.
async fn read_loop<R: AsyncRead + Unpin>(mut rd: R, tx: mpsc::Sender<Result<Frame>>) {
    loop {
        match read_frame(&mut rd).await {
            Ok(frame) => {
                if tx.send(Ok(frame)).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        }
    }
}
