//! Bidirectional RPC correlation over the frame stream.
//!
//! Either peer may initiate a call. One [`RpcMultiplexer`] per connection
//! owns both directions: outstanding outbound calls keyed by
//! `(method, request_id)` and completed through one-shot channels, plus
//! in-flight inbound request bookkeeping. Non-RPC frames never touch this
//! layer.
//!
//! Request ids are allocated from a monotonic per-sender counter, so an id
//! can never collide with a still-outstanding request on the same method.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::{Result, SatError};
use crate::protocol::messages::{RpcResult, SatErrorResp, SatRpcRequest, SatRpcResponse};

/// Methods this side fulfills when the peer calls them (server role).
pub const SERVER_METHODS: &[&str] = &[
    "authenticate",
    "startReplication",
    "stopReplication",
    "subscribe",
    "unsubscribe",
];

/// Methods the client fulfills, callable from the server.
pub const CLIENT_METHODS: &[&str] = &["startReplication", "stopReplication"];

/// How an outbound call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcOutcome {
    Ok(Bytes),
    Err(SatErrorResp),
    /// The connection closed before a response arrived.
    Closed,
}

/// A pending outbound call's completion handle.
pub type RpcCompletion = oneshot::Receiver<RpcOutcome>;

#[derive(Debug, Default)]
pub struct RpcMultiplexer {
    next_request_id: u32,
    outstanding: HashMap<(String, u32), oneshot::Sender<RpcOutcome>>,
    inbound: HashSet<(String, u32)>,
}

impl RpcMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next request id. Starts at 1; 0 never appears on the
    /// wire.
    pub fn next_request_id(&mut self) -> u32 {
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
        self.next_request_id
    }

    /// Builds an outbound call envelope and registers its completion.
    pub fn start_call(
        &mut self,
        method: &str,
        message: Bytes,
    ) -> Result<(SatRpcRequest, RpcCompletion)> {
        let request_id = self.next_request_id();
        let completion = self.register_call(method, request_id)?;
        Ok((
            SatRpcRequest {
                method: method.to_string(),
                request_id,
                message,
            },
            completion,
        ))
    }

    /// Registers an outstanding call under `(method, request_id)`.
    /// A duplicate key before the response arrives is an error.
    pub fn register_call(&mut self, method: &str, request_id: u32) -> Result<RpcCompletion> {
        let key = (method.to_string(), request_id);
        if self.outstanding.contains_key(&key) {
            return Err(SatError::Rpc(format!(
                "duplicate outstanding request: {method}#{request_id}"
            )));
        }
        let (tx, rx) = oneshot::channel();
        self.outstanding.insert(key, tx);
        Ok(rx)
    }

    /// Routes a response to its pending call. Responses whose
    /// `(method, request_id)` are unknown are dropped and logged; a late
    /// response after a caller-side timeout lands here.
    pub fn complete(&mut self, resp: SatRpcResponse) {
        let key = (resp.method.clone(), resp.request_id);
        match self.outstanding.remove(&key) {
            Some(tx) => {
                let outcome = match resp.result {
                    RpcResult::Ok(message) => RpcOutcome::Ok(message),
                    RpcResult::Err(err) => RpcOutcome::Err(err),
                };
                // The caller may have given up; dropping the outcome is fine.
                let _ = tx.send(outcome);
            }
            None => {
                tracing::warn!(
                    method = %resp.method,
                    request_id = resp.request_id,
                    "dropping rpc response with no pending call"
                );
            }
        }
    }

    /// Marks an inbound request as in flight. A duplicate
    /// `(method, request_id)` before its response is sent is an error the
    /// dispatcher answers with `INVALID_REQUEST`.
    pub fn begin_inbound(&mut self, method: &str, request_id: u32) -> Result<()> {
        if !self.inbound.insert((method.to_string(), request_id)) {
            return Err(SatError::Rpc(format!(
                "duplicate inbound request: {method}#{request_id}"
            )));
        }
        Ok(())
    }

    /// Clears inbound bookkeeping once the response has been emitted.
    pub fn end_inbound(&mut self, method: &str, request_id: u32) {
        self.inbound.remove(&(method.to_string(), request_id));
    }

    /// Fails every pending call; used when the transport goes away.
    pub fn fail_all(&mut self) {
        for (_, tx) in self.outstanding.drain() {
            let _ = tx.send(RpcOutcome::Closed);
        }
        self.inbound.clear();
    }

    pub fn outstanding_calls(&self) -> usize {
        self.outstanding.len()
    }
}

/// Awaits a call's completion with a caller-side timeout. The receiver is
/// not notified on timeout; its response, if it ever arrives, is dropped
/// by [`RpcMultiplexer::complete`].
pub async fn await_response(completion: RpcCompletion, timeout: Duration) -> Result<RpcOutcome> {
    match tokio::time::timeout(timeout, completion).await {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(_)) => Ok(RpcOutcome::Closed),
        Err(_) => Err(SatError::Timeout),
    }
}
