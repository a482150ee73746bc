use crate::error::KvError;
use crate::kv::KvClient;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use redis_protocol::resp2::decode::decode_bytes_mut;
use redis_protocol::resp2::encode::encode_bytes;
use redis_protocol::resp2::types::BytesFrame;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Prepends ARGV[1] to an existing key without touching its TTL.
const PREPEND_SCRIPT: &str = "if redis.call('EXISTS', KEYS[1]) == 1 then \
     redis.call('SETRANGE', KEYS[1], 0, ARGV[1] .. redis.call('GET', KEYS[1])) \
     return 1 else return 0 end";

/// [`KvClient`] speaking RESP2 to a Redis-compatible server.
///
/// Uses a single connection, opened lazily and re-opened after any failure.
/// Every request, including the connect, is bounded by `timeout`.
pub struct RespKv {
    addr: String,
    timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

struct Connection {
    stream: TcpStream,
    buf: BytesMut,
}

impl Connection {
    async fn open(addr: &str) -> Result<Self, KvError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        tracing::debug!(addr = %addr, "key/value connection opened");
        Ok(Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        })
    }

    async fn call(&mut self, args: Vec<Bytes>) -> Result<BytesFrame, KvError> {
        let frame = BytesFrame::Array(args.into_iter().map(BytesFrame::BulkString).collect());
        let mut out = BytesMut::new();
        // false = don't encode integers as bulk strings
        encode_bytes(&mut out, &frame, false).map_err(|e| KvError::Protocol(e.to_string()))?;
        self.stream.write_all(&out).await?;

        loop {
            if !self.buf.is_empty() {
                // splits the decoded frame off the front of the buffer
                match decode_bytes_mut(&mut self.buf) {
                    Ok(Some((frame, _, _))) => return Ok(frame),
                    Ok(None) => {}
                    Err(e) => return Err(KvError::Protocol(e.to_string())),
                }
            }

            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
        }
    }
}

fn arg(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

/// Redis rejects `EX 0`.
fn ttl_secs(ttl: Duration) -> Bytes {
    arg(&ttl.as_secs().max(1).to_string())
}

impl RespKv {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            conn: Mutex::new(None),
        }
    }

    /// One round trip. Waiting for the connection lock, connecting and
    /// the exchange all count against the timeout.
    async fn call(&self, args: Vec<Bytes>) -> Result<BytesFrame, KvError> {
        match tokio::time::timeout(self.timeout, self.call_locked(args)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(addr = %self.addr, "key/value request timed out");
                Err(io::Error::from(io::ErrorKind::TimedOut).into())
            }
        }
    }

    async fn call_locked(&self, args: Vec<Bytes>) -> Result<BytesFrame, KvError> {
        let mut slot = self.conn.lock().await;
        // a connection interrupted mid-call is dropped with the future
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => Connection::open(&self.addr).await?,
        };

        match conn.call(args).await {
            Ok(BytesFrame::Error(message)) => {
                *slot = Some(conn);
                Err(KvError::Server(message.to_string()))
            }
            Ok(frame) => {
                *slot = Some(conn);
                Ok(frame)
            }
            Err(e) => {
                tracing::debug!(error = %e, "key/value connection dropped");
                Err(e)
            }
        }
    }

    /// `SET` with options; true if the server stored the value.
    async fn set_with(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        condition: Option<&str>,
    ) -> Result<bool, KvError> {
        let mut args = vec![arg("SET"), arg(key), value, arg("EX"), ttl_secs(ttl)];
        if let Some(condition) = condition {
            args.push(arg(condition));
        }
        match self.call(args).await? {
            BytesFrame::SimpleString(_) => Ok(true),
            BytesFrame::Null => Ok(false),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(frame: &BytesFrame) -> KvError {
    KvError::Protocol(format!("unexpected reply {frame:?}"))
}

fn integer(frame: BytesFrame) -> Result<i64, KvError> {
    match frame {
        BytesFrame::Integer(n) => Ok(n),
        other => Err(unexpected(&other)),
    }
}

#[async_trait]
impl KvClient for RespKv {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError> {
        match self.call(vec![arg("GET"), arg(key)]).await? {
            BytesFrame::BulkString(value) => Ok(Some(value)),
            BytesFrame::Null => Ok(None),
            other => Err(unexpected(&other)),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), KvError> {
        self.set_with(key, value, ttl, None).await.map(|_| ())
    }

    async fn add(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool, KvError> {
        self.set_with(key, value, ttl, Some("NX")).await
    }

    async fn replace(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool, KvError> {
        self.set_with(key, value, ttl, Some("XX")).await
    }

    async fn prepend(&self, key: &str, value: Bytes) -> Result<bool, KvError> {
        let args = vec![arg("EVAL"), arg(PREPEND_SCRIPT), arg("1"), arg(key), value];
        Ok(integer(self.call(args).await?)? == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        Ok(integer(self.call(vec![arg("DEL"), arg(key)]).await?)? > 0)
    }

    async fn flush(&self) -> Result<(), KvError> {
        match self.call(vec![arg("FLUSHDB")]).await? {
            BytesFrame::SimpleString(_) => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}
