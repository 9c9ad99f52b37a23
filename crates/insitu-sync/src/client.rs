//! Analysis-side client of the parameter server.
//!
//! One client owns one TCP connection and issues strictly sequential
//! request/reply exchanges. Every reply is checked against the request:
//! reply type must be the request type plus ten and the frame must match.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use insitu_detect::{AnomalyMetrics, FunctionModel};
use insitu_stats::RunningStats;
use insitu_types::{FunctionId, ProgramId, RankId};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use crate::payload::{
    self, AnomalyMetricsReport, AnomalyStatsQuery, AnomalyStatsReport, CombinedReply,
    CombinedReport, Command, CounterStatsQuery, CounterStatsReport, ErrorReply,
    FunctionIndexReply, FunctionIndexRequest, RankAnomalyStats, ServerStatus,
};
use crate::protocol::{self, Message, MessageKind, MessageType, DEFAULT_MAX_BODY};

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Program id sent with every report
    #[serde(default)]
    pub pid: ProgramId,

    /// Rank id; also the message source
    #[serde(default)]
    pub rank: RankId,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum accepted reply body size
    #[serde(default = "default_max_body")]
    pub max_body_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pid: 0,
            rank: 0,
            timeout_secs: default_timeout(),
            max_body_bytes: default_max_body(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_max_body() -> usize {
    DEFAULT_MAX_BODY
}

/// Destination id of the parameter server.
const SERVER_ID: i32 = 0;

pub struct PsClient {
    stream: TcpStream,
    peer: SocketAddr,
    config: ClientConfig,
    timeout: Duration,
    frame: i32,
}

impl PsClient {
    pub async fn connect(addr: SocketAddr, config: ClientConfig) -> SyncResult<Self> {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SyncError::Timeout(timeout))??;
        stream.set_nodelay(true)?;
        info!(%addr, pid = config.pid, rank = config.rank, "connected to parameter server");
        Ok(Self {
            stream,
            peer: addr,
            config,
            timeout,
            frame: 0,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn source(&self) -> i32 {
        i32::try_from(self.config.rank).unwrap_or(i32::MAX)
    }

    /// Send one request and wait for its reply body.
    pub async fn request(
        &mut self,
        kind: MessageKind,
        msg_type: MessageType,
        body: Vec<u8>,
    ) -> SyncResult<Bytes> {
        let expected = msg_type.reply().ok_or_else(|| {
            SyncError::Protocol(format!("type {} is not a request", msg_type.as_i32()))
        })?;
        self.frame = self.frame.wrapping_add(1);
        let request = Message::new(self.source(), SERVER_ID, msg_type, kind, self.frame, body);

        let reply = tokio::time::timeout(self.timeout, self.exchange(&request))
            .await
            .map_err(|_| SyncError::Timeout(self.timeout))??;

        if reply.header.msg_type == MessageType::RepError.as_i32() {
            let err: ErrorReply = payload::decode(&reply.body)?;
            return Err(SyncError::Remote(err.error));
        }
        if reply.header.msg_type != expected.as_i32() {
            return Err(SyncError::UnexpectedReply {
                expected: expected.as_i32(),
                found: reply.header.msg_type,
            });
        }
        if reply.header.frame != request.header.frame {
            return Err(SyncError::Protocol(format!(
                "reply frame {} does not match request frame {}",
                reply.header.frame, request.header.frame
            )));
        }
        debug!(kind = ?kind, msg_type = ?msg_type, bytes = reply.body.len(), "reply received");
        Ok(reply.body)
    }

    async fn exchange(&mut self, request: &Message) -> SyncResult<Message> {
        protocol::write_message(&mut self.stream, request).await?;
        protocol::read_message(&mut self.stream, self.config.max_body_bytes)
            .await?
            .ok_or(SyncError::Disconnected)
    }

    pub async fn echo(&mut self, body: &[u8]) -> SyncResult<Bytes> {
        self.request(MessageKind::Default, MessageType::ReqEcho, body.to_vec())
            .await
    }

    /// Merge a local delta into the global model; returns the global
    /// statistics of the functions in the delta.
    pub async fn update_params(&mut self, delta: &FunctionModel) -> SyncResult<FunctionModel> {
        let body = payload::encode(delta)?;
        let reply = self
            .request(MessageKind::Parameters, MessageType::ReqAdd, body)
            .await?;
        payload::decode(&reply)
    }

    pub async fn get_params(&mut self) -> SyncResult<FunctionModel> {
        let reply = self
            .request(MessageKind::Parameters, MessageType::ReqGet, Vec::new())
            .await?;
        payload::decode(&reply)
    }

    pub async fn update_counter_stats(
        &mut self,
        step: u64,
        counters: BTreeMap<String, RunningStats>,
    ) -> SyncResult<BTreeMap<String, RunningStats>> {
        let report = CounterStatsReport {
            pid: self.config.pid,
            rid: self.config.rank,
            step,
            counters,
        };
        let reply = self
            .request(
                MessageKind::CounterStats,
                MessageType::ReqAdd,
                payload::encode(&report)?,
            )
            .await?;
        payload::decode(&reply)
    }

    /// Global counter statistics; an empty `names` asks for all.
    pub async fn get_counter_stats(
        &mut self,
        names: &[String],
    ) -> SyncResult<BTreeMap<String, RunningStats>> {
        let query = CounterStatsQuery {
            pid: self.config.pid,
            names: names.to_vec(),
        };
        let reply = self
            .request(
                MessageKind::CounterStats,
                MessageType::ReqGet,
                payload::encode(&query)?,
            )
            .await?;
        payload::decode(&reply)
    }

    pub async fn update_anomaly_stats(
        &mut self,
        report: &AnomalyStatsReport,
    ) -> SyncResult<RankAnomalyStats> {
        let reply = self
            .request(
                MessageKind::AnomalyStats,
                MessageType::ReqAdd,
                payload::encode(report)?,
            )
            .await?;
        payload::decode(&reply)
    }

    pub async fn get_anomaly_stats(&mut self) -> SyncResult<RankAnomalyStats> {
        let query = AnomalyStatsQuery {
            pid: self.config.pid,
            rid: self.config.rank,
        };
        let reply = self
            .request(
                MessageKind::AnomalyStats,
                MessageType::ReqGet,
                payload::encode(&query)?,
            )
            .await?;
        payload::decode(&reply)
    }

    /// Merge per-function metrics keyed by global index.
    pub async fn update_anomaly_metrics(
        &mut self,
        metrics: &AnomalyMetrics,
    ) -> SyncResult<AnomalyMetrics> {
        let report = AnomalyMetricsReport {
            pid: self.config.pid,
            rid: self.config.rank,
            metrics: metrics.clone(),
        };
        let reply = self
            .request(
                MessageKind::AnomalyMetrics,
                MessageType::ReqAdd,
                payload::encode(&report)?,
            )
            .await?;
        payload::decode(&reply)
    }

    pub async fn update_combined(&mut self, report: &CombinedReport) -> SyncResult<CombinedReply> {
        let reply = self
            .request(
                MessageKind::AdPsCombinedStats,
                MessageType::ReqAdd,
                payload::encode(report)?,
            )
            .await?;
        payload::decode(&reply)
    }

    /// Translate local function ids to global indices, registering names
    /// the server has not seen.
    pub async fn lookup_function_indices(
        &mut self,
        functions: &BTreeMap<FunctionId, String>,
    ) -> SyncResult<BTreeMap<FunctionId, u64>> {
        let request = FunctionIndexRequest {
            pid: self.config.pid,
            functions: functions.clone(),
        };
        let reply = self
            .request(
                MessageKind::FunctionIndex,
                MessageType::ReqGet,
                payload::encode(&request)?,
            )
            .await?;
        let reply: FunctionIndexReply = payload::decode(&reply)?;
        Ok(reply.indices)
    }

    pub async fn command(&mut self, command: Command) -> SyncResult<ServerStatus> {
        let reply = self
            .request(MessageKind::Cmd, MessageType::ReqCmd, payload::encode(&command)?)
            .await?;
        payload::decode(&reply)
    }

    pub async fn status(&mut self) -> SyncResult<ServerStatus> {
        self.command(Command::Status).await
    }

    pub async fn clear(&mut self) -> SyncResult<ServerStatus> {
        self.command(Command::Clear).await
    }

    /// Ask the server to stop. Consumes the client.
    pub async fn send_quit(mut self) -> SyncResult<()> {
        self.request(MessageKind::Default, MessageType::ReqQuit, Vec::new())
            .await?;
        info!(peer = %self.peer, "quit acknowledged");
        Ok(())
    }
}
