//! Request/response multiplexing over a plugin's stdio.
//!
//! A writer task owns the plugin's stdin and a reader task owns its stdout.
//! In-flight calls wait on a oneshot keyed by request id. When either side
//! of the pipe closes, the channel is marked closed and every waiter fails
//! with [`PluginError::ChannelClosed`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{PluginError, PluginResult};
use crate::jsonrpc::{Request, Response, encode_line};
use crate::protocol::{CallContext, CallParams, Method};

/// Outbound frames buffered before callers start waiting on the writer.
const OUTBOUND_CAPACITY: usize = 64;

type PendingMap = DashMap<u64, oneshot::Sender<Response>>;

/// An open RPC channel to one plugin process.
pub struct RpcChannel {
    module: String,
    next_id: AtomicU64,
    pending: Arc<PendingMap>,
    outbound: mpsc::Sender<String>,
    closed: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RpcChannel {
    /// Start the reader and writer tasks.
    ///
    /// `lines` is the plugin's stdout positioned after the handshake line.
    pub(crate) fn start<R, W>(module: impl Into<String>, lines: Lines<BufReader<R>>, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let module = module.into();
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let closed = CancellationToken::new();
        let (outbound, rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let reader = tokio::spawn(read_loop(
            module.clone(),
            lines,
            Arc::clone(&pending),
            closed.clone(),
        ));
        let writer = tokio::spawn(write_loop(module.clone(), writer, rx, closed.clone()));

        Self {
            module,
            next_id: AtomicU64::new(1),
            pending,
            outbound,
            closed,
            tasks: vec![reader, writer],
        }
    }

    /// The module this channel talks to.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Whether the pipe has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close the channel. Pending and future calls fail.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Number of calls awaiting a response.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Issue a call and decode its result.
    ///
    /// # Errors
    ///
    /// - [`PluginError::Cancelled`] / [`PluginError::DeadlineExceeded`] when
    ///   `ctx` fires first. The plugin process is left running.
    /// - [`PluginError::ChannelClosed`] if the pipe is or becomes closed.
    /// - [`PluginError::Rpc`] if the plugin answers with an error.
    /// - [`PluginError::Protocol`] if the result does not decode.
    pub async fn call<P, R>(&self, method: Method, request: &P, ctx: &CallContext) -> PluginResult<R>
    where
        P: Serialize + Sync,
        R: DeserializeOwned,
    {
        let name = method.as_str();
        if ctx.is_cancelled() {
            return Err(PluginError::Cancelled {
                method: name.to_owned(),
            });
        }
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let params = CallParams {
            deadline_ms: ctx
                .remaining()
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            request,
        };
        let line = encode_line(&Request::call(id, name, Some(serde_json::to_value(&params)?)))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let _slot = PendingSlot {
            pending: &self.pending,
            id,
        };

        let exchange = async {
            self.outbound
                .send(line)
                .await
                .map_err(|_| self.closed_error())?;
            rx.await.map_err(|_| self.closed_error())
        };

        trace!(module = %self.module, id, method = name, "Sending request");
        let response = tokio::select! {
            biased;
            res = exchange => res?,
            () = ctx.cancel_token().cancelled() => {
                debug!(module = %self.module, id, method = name, "Call cancelled");
                return Err(PluginError::Cancelled { method: name.to_owned() });
            },
            () = sleep_until(ctx.deadline()) => {
                debug!(module = %self.module, id, method = name, "Call deadline exceeded");
                return Err(PluginError::DeadlineExceeded { method: name.to_owned() });
            },
            () = self.closed.cancelled() => return Err(self.closed_error()),
        };

        let value = response.into_result().map_err(|e| PluginError::Rpc {
            method: name.to_owned(),
            code: e.code,
            message: e.message,
        })?;

        serde_json::from_value(value)
            .map_err(|e| PluginError::Protocol(format!("invalid {name} result: {e}")))
    }

    fn closed_error(&self) -> PluginError {
        PluginError::ChannelClosed {
            module: self.module.clone(),
        }
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        self.closed.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("module", &self.module)
            .field("closed", &self.is_closed())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

/// Removes a pending entry when the call finishes, however it finishes.
struct PendingSlot<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

async fn read_loop<R>(
    module: String,
    mut lines: Lines<BufReader<R>>,
    pending: Arc<PendingMap>,
    closed: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let line = tokio::select! {
            () = closed.cancelled() => break,
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => dispatch_line(&module, &pending, &line),
            Ok(None) => {
                debug!(module = %module, "Plugin stdout closed");
                break;
            },
            Err(e) => {
                warn!(module = %module, error = %e, "Failed to read from plugin");
                break;
            },
        }
    }

    closed.cancel();
    pending.clear();
}

fn dispatch_line(module: &str, pending: &PendingMap, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let response: Response = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            warn!(module = %module, error = %e, "Discarding malformed frame from plugin");
            return;
        },
    };

    let Some(id) = response.id else {
        warn!(module = %module, error = ?response.error, "Plugin reported an error without a request id");
        return;
    };

    match pending.remove(&id) {
        Some((_, tx)) => {
            let _ = tx.send(response);
        },
        None => debug!(module = %module, id, "Dropping response for abandoned call"),
    }
}

async fn write_loop<W>(
    module: String,
    mut writer: W,
    mut rx: mpsc::Receiver<String>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let line = tokio::select! {
            () = closed.cancelled() => break,
            line = rx.recv() => line,
        };
        let Some(line) = line else { break };

        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            warn!(module = %module, error = %e, "Failed to write to plugin");
            break;
        }
    }

    closed.cancel();
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Value, json};
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    use super::*;
    use crate::jsonrpc::APPLICATION_ERROR;
    use crate::protocol::{GetUsageRequest, MessageResponse};

    /// Host-side channel plus the plugin's ends of the pipe.
    fn pair() -> (RpcChannel, BufReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>) {
        let (host, plugin) = tokio::io::duplex(16 * 1024);
        let (host_read, host_write) = tokio::io::split(host);
        let (plugin_read, plugin_write) = tokio::io::split(plugin);
        let channel = RpcChannel::start("vps", BufReader::new(host_read).lines(), host_write);
        (channel, BufReader::new(plugin_read), plugin_write)
    }

    async fn next_request(reader: &mut BufReader<ReadHalf<DuplexStream>>) -> Request {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn reply(writer: &mut WriteHalf<DuplexStream>, response: &Response) {
        writer
            .write_all(encode_line(response).unwrap().as_bytes())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (channel, mut reader, mut writer) = pair();

        let plugin = tokio::spawn(async move {
            let req = next_request(&mut reader).await;
            assert_eq!(req.method, "provisioner.get_usage");
            let params = req.params.unwrap();
            assert_eq!(params["request"]["serviceId"], "42");
            assert!(params["deadlineMs"].as_u64().unwrap() <= 5_000);
            reply(
                &mut writer,
                &Response::success(req.id, json!({"metrics": [], "message": "ok"})),
            )
            .await;
            (reader, writer)
        });

        let ctx = CallContext::with_timeout(Duration::from_secs(5));
        let resp: crate::protocol::GetUsageResponse = channel
            .call(
                Method::GetUsage,
                &GetUsageRequest {
                    service_id: "42".into(),
                },
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(resp.message, "ok");
        assert_eq!(channel.pending_calls(), 0);
        drop(plugin.await.unwrap());
    }

    #[tokio::test]
    async fn test_responses_matched_by_id() {
        let (channel, mut reader, mut writer) = pair();
        let channel = Arc::new(channel);

        tokio::spawn(async move {
            let first = next_request(&mut reader).await;
            let second = next_request(&mut reader).await;
            // Answer in reverse order.
            for req in [second, first] {
                let tag = req.params.unwrap()["request"]["serviceId"].clone();
                reply(&mut writer, &Response::success(req.id, json!({ "message": tag }))).await;
            }
            std::future::pending::<()>().await;
        });

        let ctx = CallContext::new();
        let a = {
            let channel = Arc::clone(&channel);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                channel
                    .call::<_, MessageResponse>(Method::Ping, &json!({"serviceId": "a"}), &ctx)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let b = channel
            .call::<_, MessageResponse>(Method::Ping, &json!({"serviceId": "b"}), &ctx)
            .await
            .unwrap();

        assert_eq!(a.await.unwrap().unwrap().message, "a");
        assert_eq!(b.message, "b");
    }

    #[tokio::test]
    async fn test_rpc_error_mapped() {
        let (channel, mut reader, mut writer) = pair();

        tokio::spawn(async move {
            let req = next_request(&mut reader).await;
            reply(
                &mut writer,
                &Response::failure(Some(req.id), APPLICATION_ERROR, "no capacity in region"),
            )
            .await;
            std::future::pending::<()>().await;
        });

        let err = channel
            .call::<_, Value>(Method::Ping, &json!({}), &CallContext::new())
            .await
            .unwrap_err();
        match err {
            PluginError::Rpc {
                method,
                code,
                message,
            } => {
                assert_eq!(method, "provisioner.ping");
                assert_eq!(code, APPLICATION_ERROR);
                assert_eq!(message, "no capacity in region");
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deadline_leaves_channel_open() {
        let (channel, _reader, _writer) = pair();

        let ctx = CallContext::with_timeout(Duration::from_millis(50));
        let err = channel
            .call::<_, Value>(Method::Ping, &json!({}), &ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, PluginError::DeadlineExceeded { .. }));
        assert!(!channel.is_closed());
        assert_eq!(channel.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let (channel, _reader, _writer) = pair();
        let token = CancellationToken::new();
        let ctx = CallContext::new().with_cancel(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let err = channel
            .call::<_, Value>(Method::Ping, &json!({}), &ctx)
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, PluginError::Cancelled { .. }));
        assert!(!channel.is_closed());

        let err = channel
            .call::<_, Value>(Method::Ping, &json!({}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_plugin_exit_closes_channel() {
        let (channel, reader, writer) = pair();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(reader);
            drop(writer);
        });

        let err = channel
            .call::<_, Value>(Method::Ping, &json!({}), &CallContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::ChannelClosed { ref module } if module == "vps"));
        assert!(channel.is_closed());

        let err = channel
            .call::<_, Value>(Method::Ping, &json!({}), &CallContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::ChannelClosed { .. }));
    }

    #[tokio::test]
    async fn test_malformed_frames_ignored() {
        let (channel, mut reader, mut writer) = pair();

        tokio::spawn(async move {
            let req = next_request(&mut reader).await;
            writer.write_all(b"not json\n\n").await.unwrap();
            reply(&mut writer, &Response::success(req.id, json!({"message": "pong"}))).await;
            std::future::pending::<()>().await;
        });

        let resp: MessageResponse = channel
            .call(Method::Ping, &json!({}), &CallContext::new())
            .await
            .unwrap();
        assert_eq!(resp.message, "pong");
    }
}
