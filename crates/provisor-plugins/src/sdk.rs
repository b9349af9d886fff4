//! Plugin-side runtime.
//!
//! A provisioner binary implements [`Provisioner`] and calls [`serve`] from
//! `main`. `serve` checks the magic cookie, prints the handshake line, and
//! answers requests from stdin on stdout until stdin closes. Requests are
//! handled concurrently and each one is bounded by the deadline the host
//! sent with it.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{PluginError, PluginResult};
use crate::handshake::HandshakeConfig;
use crate::jsonrpc::{
    APPLICATION_ERROR, DEADLINE_EXCEEDED, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR, Request,
    Response, encode_line,
};
use crate::protocol::{CallContext, CallParams, Method, Provisioner};

/// Serve `provisioner` over the process's stdin and stdout.
///
/// # Errors
///
/// Returns [`PluginError::Handshake`] if the process was not started by a
/// host presenting the expected magic cookie, and [`PluginError::Io`] if
/// stdio fails.
pub async fn serve<P>(provisioner: P, handshake: &HandshakeConfig) -> PluginResult<()>
where
    P: Provisioner + 'static,
{
    let cookie = std::env::var(&handshake.cookie_key).ok();
    if !handshake.cookie_matches(cookie.as_deref()) {
        return Err(PluginError::Handshake {
            path: std::env::current_exe().unwrap_or_default(),
            message: "this binary is a provisor plugin and must be started by the host".to_owned(),
        });
    }

    serve_io(provisioner, handshake, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve `provisioner` over arbitrary streams. The cookie is not checked.
///
/// # Errors
///
/// Returns [`PluginError::Io`] if reading `input` or writing the handshake
/// fails.
pub async fn serve_io<P, R, W>(
    provisioner: P,
    handshake: &HandshakeConfig,
    input: R,
    mut output: W,
) -> PluginResult<()>
where
    P: Provisioner + 'static,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    output
        .write_all(format!("{}\n", handshake.line()).as_bytes())
        .await?;
    output.flush().await?;

    let (tx, mut rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let written = async {
                output.write_all(line.as_bytes()).await?;
                output.flush().await
            }
            .await;
            if let Err(e) = written {
                warn!(error = %e, "Failed to write response to host");
                break;
            }
        }
    });

    let provisioner: Arc<dyn Provisioner> = Arc::new(provisioner);
    let mut handlers = JoinSet::new();
    let mut lines = BufReader::new(input).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let provisioner = Arc::clone(&provisioner);
        let tx = tx.clone();
        handlers.spawn(async move {
            let response = handle_frame(provisioner.as_ref(), &line).await;
            match encode_line(&response) {
                Ok(encoded) => {
                    let _ = tx.send(encoded).await;
                },
                Err(e) => warn!(error = %e, "Failed to encode response"),
            }
        });

        while handlers.try_join_next().is_some() {}
    }

    debug!("Host closed stdin, draining in-flight requests");
    while handlers.join_next().await.is_some() {}
    drop(tx);
    let _ = writer.await;
    Ok(())
}

async fn handle_frame(provisioner: &dyn Provisioner, line: &str) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => return Response::failure(None, PARSE_ERROR, format!("invalid request: {e}")),
    };

    let Some(method) = Method::from_wire(&request.method) else {
        return Response::failure(
            Some(request.id),
            METHOD_NOT_FOUND,
            format!("unknown method '{}'", request.method),
        );
    };

    let params = request.params.unwrap_or(Value::Null);
    match dispatch(provisioner, method, params).await {
        Ok(value) => Response::success(request.id, value),
        Err(e) => {
            debug!(method = %method, error = %e, "Request failed");
            let (code, message) = error_parts(e);
            Response::failure(Some(request.id), code, message)
        },
    }
}

async fn dispatch(provisioner: &dyn Provisioner, method: Method, params: Value) -> PluginResult<Value> {
    match method {
        Method::CreateService => {
            let (ctx, req) = decode(params)?;
            respond(&ctx, method, provisioner.create_service(&ctx, req)).await
        },
        Method::Suspend => {
            let (ctx, req) = decode(params)?;
            respond(&ctx, method, provisioner.suspend(&ctx, req)).await
        },
        Method::Terminate => {
            let (ctx, req) = decode(params)?;
            respond(&ctx, method, provisioner.terminate(&ctx, req)).await
        },
        Method::ChangePackage => {
            let (ctx, req) = decode(params)?;
            respond(&ctx, method, provisioner.change_package(&ctx, req)).await
        },
        Method::PowerControl => {
            let (ctx, req) = decode(params)?;
            respond(&ctx, method, provisioner.power_control(&ctx, req)).await
        },
        Method::GetUsage => {
            let (ctx, req) = decode(params)?;
            respond(&ctx, method, provisioner.get_usage(&ctx, req)).await
        },
        Method::Ping => {
            let (ctx, _): (CallContext, Value) = decode(params)?;
            respond(&ctx, method, provisioner.ping(&ctx)).await
        },
    }
}

fn decode<T: DeserializeOwned>(params: Value) -> PluginResult<(CallContext, T)> {
    let envelope: CallParams<T> = serde_json::from_value(params)
        .map_err(|e| PluginError::Protocol(format!("invalid params: {e}")))?;
    let ctx = match envelope.deadline_ms {
        Some(ms) => CallContext::with_timeout(std::time::Duration::from_millis(ms)),
        None => CallContext::new(),
    };
    Ok((ctx, envelope.request))
}

async fn respond<T, F>(ctx: &CallContext, method: Method, fut: F) -> PluginResult<Value>
where
    T: Serialize,
    F: Future<Output = PluginResult<T>>,
{
    let result = match ctx.deadline() {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| PluginError::DeadlineExceeded {
                method: method.as_str().to_owned(),
            })?,
        None => fut.await,
    }?;
    Ok(serde_json::to_value(result)?)
}

fn error_parts(error: PluginError) -> (i64, String) {
    match error {
        PluginError::Rpc { code, message, .. } => (code, message),
        PluginError::Protocol(message) => (INVALID_PARAMS, message),
        e @ PluginError::DeadlineExceeded { .. } => (DEADLINE_EXCEEDED, e.to_string()),
        other => (APPLICATION_ERROR, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    use super::*;
    use crate::channel::RpcChannel;
    use crate::client::ProvisionerClient;
    use crate::protocol::{
        ChangePackageRequest, CreateServiceRequest, CreateServiceResponse, GetUsageRequest,
        GetUsageResponse, MessageResponse, PowerAction, PowerControlRequest, SuspendRequest,
        TerminateRequest, UsageMetric,
    };

    struct Echo;

    #[async_trait]
    impl Provisioner for Echo {
        async fn create_service(
            &self,
            _ctx: &CallContext,
            request: CreateServiceRequest,
        ) -> PluginResult<CreateServiceResponse> {
            if request.package_id == "0" {
                return Err(PluginError::application(
                    Method::CreateService.as_str(),
                    "package 0 is retired",
                ));
            }
            Ok(CreateServiceResponse {
                external_id: format!("vm-{}", request.service_id),
                message: request.options.len().to_string(),
            })
        }

        async fn suspend(
            &self,
            _ctx: &CallContext,
            request: SuspendRequest,
        ) -> PluginResult<MessageResponse> {
            Ok(MessageResponse::new(format!("suspended: {}", request.reason)))
        }

        async fn terminate(
            &self,
            ctx: &CallContext,
            _request: TerminateRequest,
        ) -> PluginResult<MessageResponse> {
            // Hangs past any deadline so the server's timeout fires.
            tokio::time::sleep(ctx.remaining().unwrap_or_default() + Duration::from_secs(5)).await;
            Ok(MessageResponse::new("too late"))
        }

        async fn change_package(
            &self,
            _ctx: &CallContext,
            request: ChangePackageRequest,
        ) -> PluginResult<MessageResponse> {
            Ok(MessageResponse::new(format!(
                "{} -> {}",
                request.current_package_id, request.target_package_id
            )))
        }

        async fn power_control(
            &self,
            _ctx: &CallContext,
            request: PowerControlRequest,
        ) -> PluginResult<MessageResponse> {
            Ok(MessageResponse::new(request.action.to_string()))
        }

        async fn get_usage(
            &self,
            _ctx: &CallContext,
            _request: GetUsageRequest,
        ) -> PluginResult<GetUsageResponse> {
            Ok(GetUsageResponse {
                metrics: vec![UsageMetric {
                    name: "bandwidth".into(),
                    unit: "GB".into(),
                    value: 12.5,
                }],
                message: String::new(),
            })
        }
    }

    fn spawn_echo<R, W>(input: R, output: W) -> tokio::task::JoinHandle<PluginResult<()>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let handshake = HandshakeConfig::default();
            serve_io(Echo, &handshake, input, output).await
        })
    }

    /// A host client wired to an in-process `serve_io`.
    async fn connect() -> ProvisionerClient {
        let (host, plugin) = tokio::io::duplex(64 * 1024);
        let (plugin_read, plugin_write) = tokio::io::split(plugin);
        spawn_echo(plugin_read, plugin_write);

        let (host_read, host_write) = tokio::io::split(host);
        let mut lines = BufReader::new(host_read).lines();
        let first = lines.next_line().await.unwrap().unwrap();
        HandshakeConfig::default().check(&first).unwrap();

        ProvisionerClient::new(Arc::new(RpcChannel::start("echo", lines, host_write)))
    }

    #[tokio::test]
    async fn test_all_operations_round_trip() {
        let client = connect().await;
        let ctx = CallContext::with_timeout(Duration::from_secs(5));

        let created = client
            .create_service(
                &ctx,
                CreateServiceRequest {
                    service_id: "42".into(),
                    customer_id: "7".into(),
                    package_id: "3".into(),
                    options: BTreeMap::from([("a".into(), "1".into()), ("b".into(), "2".into())]),
                    idempotency_key: "service-42-provision".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(created.external_id, "vm-42");
        assert_eq!(created.message, "2");

        let suspended = client
            .suspend(
                &ctx,
                SuspendRequest {
                    service_id: "42".into(),
                    reason: "overdue".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(suspended.message, "suspended: overdue");

        let changed = client
            .change_package(
                &ctx,
                ChangePackageRequest {
                    service_id: "42".into(),
                    current_package_id: "3".into(),
                    target_package_id: "4".into(),
                    reason: "upgrade".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(changed.message, "3 -> 4");

        let power = client
            .power_control(
                &ctx,
                PowerControlRequest {
                    service_id: "42".into(),
                    action: PowerAction::Reboot,
                },
            )
            .await
            .unwrap();
        assert_eq!(power.message, "reboot");

        let usage = client
            .get_usage(
                &ctx,
                GetUsageRequest {
                    service_id: "42".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(usage.metrics.len(), 1);
        assert!((usage.metrics[0].value - 12.5).abs() < f64::EPSILON);

        assert_eq!(client.ping(&ctx).await.unwrap().message, "pong");
    }

    #[tokio::test]
    async fn test_application_error_reaches_host() {
        let client = connect().await;
        let err = client
            .create_service(
                &CallContext::new(),
                CreateServiceRequest {
                    service_id: "1".into(),
                    customer_id: "1".into(),
                    package_id: "0".into(),
                    options: BTreeMap::new(),
                    idempotency_key: String::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PluginError::Rpc { code: APPLICATION_ERROR, ref message, .. } if message == "package 0 is retired"
        ));
    }

    #[tokio::test]
    async fn test_plugin_enforces_deadline() {
        let (host, plugin) = tokio::io::duplex(64 * 1024);
        let (plugin_read, plugin_write) = tokio::io::split(plugin);
        spawn_echo(plugin_read, plugin_write);

        let (host_read, mut host_write) = tokio::io::split(host);
        let mut lines = BufReader::new(host_read).lines();
        lines.next_line().await.unwrap().unwrap();

        let req = Request::call(
            1,
            Method::Terminate.as_str(),
            Some(json!({"deadlineMs": 50, "request": {"serviceId": "9", "reason": "x"}})),
        );
        host_write
            .write_all(encode_line(&req).unwrap().as_bytes())
            .await
            .unwrap();

        let line = lines.next_line().await.unwrap().unwrap();
        let resp: Response = serde_json::from_str(&line).unwrap();
        assert_eq!(resp.id, Some(1));
        assert_eq!(resp.error.unwrap().code, DEADLINE_EXCEEDED);
    }

    #[tokio::test]
    async fn test_bad_frames() {
        let (host, plugin) = tokio::io::duplex(64 * 1024);
        let (plugin_read, plugin_write) = tokio::io::split(plugin);
        spawn_echo(plugin_read, plugin_write);

        let (host_read, mut host_write) = tokio::io::split(host);
        let mut lines = BufReader::new(host_read).lines();
        lines.next_line().await.unwrap().unwrap();

        host_write.write_all(b"{garbage\n").await.unwrap();
        let resp: Response = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(resp.id, None);
        assert_eq!(resp.error.unwrap().code, PARSE_ERROR);

        let unknown = Request::call(2, "provisioner.reinstall", None);
        host_write
            .write_all(encode_line(&unknown).unwrap().as_bytes())
            .await
            .unwrap();
        let resp: Response = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);

        let bad_params = Request::call(3, Method::Suspend.as_str(), Some(json!({"request": 5})));
        host_write
            .write_all(encode_line(&bad_params).unwrap().as_bytes())
            .await
            .unwrap();
        let resp: Response = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(resp.id, Some(3));
        assert_eq!(resp.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_serve_returns_when_input_closes() {
        let (host, plugin) = tokio::io::duplex(1024);
        let (plugin_read, plugin_write) = tokio::io::split(plugin);
        let server = spawn_echo(plugin_read, plugin_write);

        let (host_read, host_write) = tokio::io::split(host);
        let mut lines = BufReader::new(host_read).lines();
        lines.next_line().await.unwrap().unwrap();
        drop(host_write);
        drop(lines);

        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
