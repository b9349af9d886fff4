//! Stub provisioner used by the integration tests.
//!
//! The installed file name selects the behaviour:
//!
//! - `*-bad-version` answers the handshake with the wrong protocol version
//! - `*-bad-cookie` answers the handshake with the wrong cookie value
//! - `*-silent` never answers the handshake
//! - `*-fail` completes the handshake and rejects every create
//! - anything else serves every operation successfully
//!
//! Every request received is appended as one JSON line to
//! `<binary>.requests.jsonl`.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use provisor_plugins::handshake::HandshakeLine;
use provisor_plugins::{
    CallContext, ChangePackageRequest, CreateServiceRequest, CreateServiceResponse,
    GetUsageRequest, GetUsageResponse, HandshakeConfig, MessageResponse, Method, PluginError,
    PluginResult, PowerControlRequest, Provisioner, SuspendRequest, TerminateRequest, UsageMetric,
};
use serde_json::json;
use tokio::io::AsyncReadExt;

struct Stub {
    log: PathBuf,
    fail_creates: bool,
}

impl Stub {
    fn record(&self, method: Method, request: &impl serde::Serialize) {
        let line = json!({"method": method.as_str(), "request": request});
        let written = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = written {
            eprintln!("stub-provisioner: cannot write {}: {e}", self.log.display());
        }
    }
}

#[async_trait]
impl Provisioner for Stub {
    async fn create_service(
        &self,
        _ctx: &CallContext,
        request: CreateServiceRequest,
    ) -> PluginResult<CreateServiceResponse> {
        self.record(Method::CreateService, &request);
        if self.fail_creates {
            return Err(PluginError::application(
                Method::CreateService.as_str(),
                "stub backend rejected the request",
            ));
        }
        Ok(CreateServiceResponse {
            external_id: format!("stub-{}", request.service_id),
            message: "created".into(),
        })
    }

    async fn suspend(
        &self,
        _ctx: &CallContext,
        request: SuspendRequest,
    ) -> PluginResult<MessageResponse> {
        self.record(Method::Suspend, &request);
        Ok(MessageResponse::new("suspended"))
    }

    async fn terminate(
        &self,
        _ctx: &CallContext,
        request: TerminateRequest,
    ) -> PluginResult<MessageResponse> {
        self.record(Method::Terminate, &request);
        Ok(MessageResponse::new("terminated"))
    }

    async fn change_package(
        &self,
        _ctx: &CallContext,
        request: ChangePackageRequest,
    ) -> PluginResult<MessageResponse> {
        self.record(Method::ChangePackage, &request);
        Ok(MessageResponse::new("package changed"))
    }

    async fn power_control(
        &self,
        _ctx: &CallContext,
        request: PowerControlRequest,
    ) -> PluginResult<MessageResponse> {
        self.record(Method::PowerControl, &request);
        Ok(MessageResponse::new(request.action.to_string()))
    }

    async fn get_usage(
        &self,
        _ctx: &CallContext,
        request: GetUsageRequest,
    ) -> PluginResult<GetUsageResponse> {
        self.record(Method::GetUsage, &request);
        Ok(GetUsageResponse {
            metrics: vec![UsageMetric {
                name: "disk".into(),
                unit: "GB".into(),
                value: 10.0,
            }],
            message: String::new(),
        })
    }
}

/// Print a handshake line and idle until the host closes stdin.
async fn answer_and_idle(line: &HandshakeLine) -> std::io::Result<()> {
    println!("{line}");
    idle().await
}

async fn idle() -> std::io::Result<()> {
    let mut sink = Vec::new();
    tokio::io::stdin().read_to_end(&mut sink).await?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::process::ExitCode {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("stub-provisioner"));
    let name = exe
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let log = PathBuf::from(format!("{}.requests.jsonl", exe.display()));
    let handshake = HandshakeConfig::default();

    let result = if name.ends_with("-bad-version") {
        let mut line = handshake.line();
        line.protocol_version = line.protocol_version.saturating_add(1);
        answer_and_idle(&line).await.map_err(PluginError::from)
    } else if name.ends_with("-bad-cookie") {
        let mut line = handshake.line();
        line.cookie_value = "not-the-cookie".into();
        answer_and_idle(&line).await.map_err(PluginError::from)
    } else if name.ends_with("-silent") {
        idle().await.map_err(PluginError::from)
    } else {
        let stub = Stub {
            log,
            fail_creates: name.ends_with("-fail"),
        };
        provisor_plugins::serve(stub, &handshake).await
    };

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("stub-provisioner: {e}");
            std::process::ExitCode::FAILURE
        },
    }
}
