//! Shared server state and request dispatch.
//!
//! A handler maps one request body to one reply body. Handlers run on the
//! work-queue threads and may run concurrently; every store they touch
//! guards itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use insitu_detect::FunctionModel;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::global::{GlobalAnomalyStats, GlobalCounterStats};
use crate::index::GlobalFunctionIndexMap;
use crate::params::ParameterStore;
use crate::payload::{
    self, AnomalyMetricsReport, AnomalyStatsQuery, AnomalyStatsReport, CombinedReply,
    CombinedReport, Command, CounterStatsQuery, CounterStatsReport, ErrorReply,
    FunctionIndexReply, FunctionIndexRequest, ServerStatus,
};
use crate::persist::ModelDocument;
use crate::protocol::{Message, MessageKind, MessageType};

/// Everything the parameter server shares between handlers.
#[derive(Debug)]
pub struct PsState {
    pub params: ParameterStore,
    pub counters: GlobalCounterStats,
    pub anomalies: GlobalAnomalyStats,
    pub functions: GlobalFunctionIndexMap,
    started: DateTime<Utc>,
    requests: AtomicU64,
}

impl Default for PsState {
    fn default() -> Self {
        Self {
            params: ParameterStore::new(),
            counters: GlobalCounterStats::new(),
            anomalies: GlobalAnomalyStats::new(),
            functions: GlobalFunctionIndexMap::new(),
            started: Utc::now(),
            requests: AtomicU64::new(0),
        }
    }
}

impl PsState {
    pub fn new() -> Self {
        Self::default()
    }

    /// State seeded from a persisted model document.
    pub fn from_document(doc: ModelDocument) -> SyncResult<Self> {
        let state = Self::new();
        state.params.assign(doc.alg_params)?;
        state.functions.restore(&doc.func_index_map)?;
        Ok(state)
    }

    pub fn to_document(&self) -> SyncResult<ModelDocument> {
        Ok(ModelDocument {
            func_index_map: self.functions.snapshot()?,
            alg_params: self.params.snapshot()?,
        })
    }

    pub fn requests_served(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> SyncResult<ServerStatus> {
        Ok(ServerStatus {
            functions: self.params.len()?,
            function_indices: self.functions.len()?,
            counters: self.counters.len()?,
            ranks: self.anomalies.rank_count()?,
            requests: self.requests_served(),
            uptime_secs: (Utc::now() - self.started).num_seconds(),
        })
    }

    pub fn clear(&self) -> SyncResult<()> {
        self.params.clear()?;
        self.counters.clear()?;
        self.anomalies.clear()?;
        self.functions.clear()
    }
}

/// A request handler: request body in, reply body out.
pub type Handler = Arc<dyn Fn(&PsState, &[u8]) -> SyncResult<Vec<u8>> + Send + Sync>;

/// Handlers keyed by `(kind, request type)`.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<(MessageKind, MessageType), Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: MessageKind, msg_type: MessageType, handler: F)
    where
        F: Fn(&PsState, &[u8]) -> SyncResult<Vec<u8>> + Send + Sync + 'static,
    {
        self.handlers.insert((kind, msg_type), Arc::new(handler));
    }

    pub fn contains(&self, kind: MessageKind, msg_type: MessageType) -> bool {
        self.handlers.contains_key(&(kind, msg_type))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// The parameter server's standard handlers.
    pub fn standard() -> Self {
        use MessageKind as K;
        use MessageType as T;

        let mut table = Self::new();

        table.register(K::Default, T::ReqEcho, |_, body| Ok(body.to_vec()));
        table.register(K::Parameters, T::ReqEcho, |_, body| Ok(body.to_vec()));

        table.register(K::Parameters, T::ReqAdd, |s, body| s.params.update(body));
        table.register(K::Parameters, T::ReqGet, |s, _| s.params.get_all());

        table.register(K::CounterStats, T::ReqAdd, |s, body| {
            let report: CounterStatsReport = payload::decode(body)?;
            payload::encode(&s.counters.add(&report)?)
        });
        table.register(K::CounterStats, T::ReqGet, |s, body| {
            let query: CounterStatsQuery = payload::decode(body)?;
            payload::encode(&s.counters.query(query.pid, &query.names)?)
        });

        table.register(K::AnomalyStats, T::ReqAdd, |s, body| {
            let report: AnomalyStatsReport = payload::decode(body)?;
            payload::encode(&s.anomalies.add_step(&report)?)
        });
        table.register(K::AnomalyStats, T::ReqGet, |s, body| {
            let query: AnomalyStatsQuery = payload::decode(body)?;
            payload::encode(&s.anomalies.rank(query.pid, query.rid)?.unwrap_or_default())
        });

        table.register(K::AnomalyMetrics, T::ReqAdd, |s, body| {
            let report: AnomalyMetricsReport = payload::decode(body)?;
            payload::encode(&s.anomalies.add_metrics(report.pid, &report.metrics)?)
        });

        table.register(K::AdPsCombinedStats, T::ReqAdd, |s, body| {
            let report: CombinedReport = payload::decode(body)?;
            let reply = CombinedReply {
                anomaly: s.anomalies.add_step(&report.anomaly)?,
                counters: s.counters.add(&report.counters)?,
                metrics: s.anomalies.add_metrics(report.anomaly.pid, &report.metrics)?,
            };
            payload::encode(&reply)
        });

        table.register(K::FunctionIndex, T::ReqGet, |s, body| {
            let request: FunctionIndexRequest = payload::decode(body)?;
            let indices = s.functions.translate(request.pid, &request.functions)?;
            payload::encode(&FunctionIndexReply { indices })
        });

        table.register(K::Cmd, T::ReqCmd, |s, body| {
            let command: Command = payload::decode(body)?;
            match command {
                Command::Clear => {
                    s.clear()?;
                    debug!("global state cleared");
                    payload::encode(&s.status()?)
                }
                Command::Status => payload::encode(&s.status()?),
            }
        });

        table
    }

    /// Run the handler for `request` and build the reply message. Failures
    /// become a `RepError` reply; the caller keeps the connection open.
    pub fn dispatch(&self, state: &PsState, request: &Message) -> Message {
        state.requests.fetch_add(1, Ordering::Relaxed);
        match self.try_dispatch(state, request) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    kind = request.header.kind,
                    msg_type = request.header.msg_type,
                    src = request.header.src,
                    error = %e,
                    "request rejected"
                );
                error_reply(request, &e)
            }
        }
    }

    fn try_dispatch(&self, state: &PsState, request: &Message) -> SyncResult<Message> {
        let msg_type = request.message_type()?;
        let kind = request.message_kind()?;
        let reply_type = msg_type.reply().ok_or_else(|| {
            SyncError::Protocol(format!("type {} is not a request", request.header.msg_type))
        })?;
        let handler = self
            .handlers
            .get(&(kind, msg_type))
            .ok_or(SyncError::NoHandler {
                kind: request.header.kind,
                msg_type: request.header.msg_type,
            })?;
        let body = handler(state, &request.body)?;
        Ok(request.reply(reply_type, body))
    }
}

/// `RepError` reply carrying the error text.
pub fn error_reply(request: &Message, error: &SyncError) -> Message {
    let body = payload::encode(&ErrorReply {
        error: error.to_string(),
    })
    .unwrap_or_default();
    request.reply(MessageType::RepError, body)
}

/// Decode a `Parameters` reply body.
pub fn decode_model(body: &[u8]) -> SyncResult<FunctionModel> {
    payload::decode(body)
}
