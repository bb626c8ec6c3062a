// # Wire Protocol
//
// Request/response types exchanged between the client router and the proxy
// servers, plus the length-prefixed bincode framing used on the TCP stream.
//
// Every request carries the client's current cluster-health snapshot so
// servers can react to topology changes opportunistically on the request
// path, without any dedicated gossip channel.

use crate::error::{ErrorDetail, ProxyError, Result, SqlErrorKind};
use crate::xa::xid::XidKey;
use bytes::BytesMut;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

/// Maximum frame payload (16MB) - prevents memory exhaustion from oversized
/// or corrupt length prefixes.
pub const MAX_FRAME_SIZE: usize = 16_777_216;

/// Maximum SQL statement length (1MB) accepted by a server.
pub const MAX_SQL_LENGTH: usize = 1_048_576;

/// A SQL parameter or column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl std::fmt::Display for SqlValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Bool(v) => write!(f, "{}", v),
            SqlValue::Int(v) => write!(f, "{}", v),
            SqlValue::Float(v) => write!(f, "{}", v),
            SqlValue::Text(v) => write!(f, "{}", v),
            SqlValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

/// Result of a statement execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    pub rows_affected: u64,
}

/// Everything a server needs to allocate (or reuse) a pool and open a
/// session for this client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDetails {
    pub url: String,
    pub user: String,
    pub password: String,
    pub client_uuid: Uuid,
    pub is_xa: bool,
    pub properties: HashMap<String, String>,
    /// Full cluster endpoint list as `host:port` strings. Non-empty means
    /// pool sizes are divided across the cluster.
    pub server_endpoints: Vec<String>,
    pub cluster_health: String,
}

/// Identity of one logical session, echoed on every subsequent request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_uuid: Uuid,
    pub client_uuid: Uuid,
    pub conn_hash: String,
    pub is_xa: bool,
    /// The `host:port` of the server that created the session. Always
    /// populated by the server with its own advertised address.
    pub target_server: String,
}

/// Wire form of an XA branch identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XidProto {
    pub format_id: i32,
    pub gtrid: Vec<u8>,
    pub bqual: Vec<u8>,
}

impl From<&XidKey> for XidProto {
    fn from(xid: &XidKey) -> Self {
        Self {
            format_id: xid.format_id(),
            gtrid: xid.gtrid().to_vec(),
            bqual: xid.bqual().to_vec(),
        }
    }
}

impl From<&XidProto> for XidKey {
    fn from(proto: &XidProto) -> Self {
        XidKey::new(proto.format_id, proto.gtrid.clone(), proto.bqual.clone())
    }
}

/// One XA verb against one branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XaRequest {
    pub session: SessionInfo,
    pub xid: XidProto,
    pub flags: i32,
    pub cluster_health: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XaResponse {
    pub session: SessionInfo,
    pub success: bool,
    pub message: String,
}

/// Client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Connect(ConnectionDetails),
    Execute {
        session: SessionInfo,
        sql: String,
        params: Vec<SqlValue>,
        cluster_health: String,
    },
    XaStart(XaRequest),
    XaEnd(XaRequest),
    XaPrepare(XaRequest),
    XaCommit(XaRequest),
    XaRollback(XaRequest),
    XaForget(XaRequest),
    XaRecover(XaRequest),
    TerminateSession {
        session: SessionInfo,
        cluster_health: String,
    },
    Ping,
}

impl Request {
    /// The cluster-health snapshot riding on this request, if any.
    pub fn cluster_health(&self) -> Option<&str> {
        match self {
            Request::Connect(details) => Some(&details.cluster_health),
            Request::Execute { cluster_health, .. } => Some(cluster_health),
            Request::XaStart(req)
            | Request::XaEnd(req)
            | Request::XaPrepare(req)
            | Request::XaCommit(req)
            | Request::XaRollback(req)
            | Request::XaForget(req)
            | Request::XaRecover(req) => Some(&req.cluster_health),
            Request::TerminateSession { cluster_health, .. } => Some(cluster_health),
            Request::Ping => None,
        }
    }

    /// The connection hash this request concerns, if it is session-scoped.
    pub fn conn_hash(&self) -> Option<&str> {
        match self {
            Request::Connect(_) | Request::Ping => None,
            Request::Execute { session, .. } | Request::TerminateSession { session, .. } => {
                Some(&session.conn_hash)
            }
            Request::XaStart(req)
            | Request::XaEnd(req)
            | Request::XaPrepare(req)
            | Request::XaCommit(req)
            | Request::XaRollback(req)
            | Request::XaForget(req)
            | Request::XaRecover(req) => Some(&req.session.conn_hash),
        }
    }
}

/// Server response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Connected(SessionInfo),
    Executed(QueryResult),
    Xa(XaResponse),
    Recovered(Vec<XidProto>),
    Terminated,
    Pong { active_sessions: u32 },
    Error(ErrorDetail),
}

impl From<&ProxyError> for ErrorDetail {
    fn from(error: &ProxyError) -> Self {
        match error {
            ProxyError::Sql(detail) => detail.clone(),
            ProxyError::XaProtocol { code, message } => ErrorDetail::new(
                "XAE00",
                *code,
                message.clone(),
                SqlErrorKind::XaException,
            ),
            ProxyError::PoolExhausted { .. } => ErrorDetail::new(
                "53300",
                0,
                error.to_string(),
                SqlErrorKind::SqlException,
            ),
            other => ErrorDetail::new("HY000", 0, other.to_string(), SqlErrorKind::SqlException),
        }
    }
}

impl ErrorDetail {
    /// Rebuilds the typed error on the client side.
    pub fn into_proxy_error(self) -> ProxyError {
        match self.error_type {
            SqlErrorKind::XaException => ProxyError::XaProtocol {
                code: self.vendor_code,
                message: self.reason,
            },
            _ => ProxyError::Sql(self),
        }
    }
}

/// Writes one length-prefixed bincode frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let payload = bincode::serde::encode_to_vec(message, bincode::config::standard())?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProxyError::Serialization(format!(
            "frame too large: {} bytes (max: {})",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed bincode frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProxyError::Serialization(format!(
            "frame too large: {} bytes (max: {})",
            len, MAX_FRAME_SIZE
        )));
    }
    let mut payload = BytesMut::zeroed(len);
    reader.read_exact(&mut payload).await?;
    let (message, _) = bincode::serde::decode_from_slice(&payload, bincode::config::standard())?;
    Ok(message)
}
