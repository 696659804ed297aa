//! The shim: turns one CNI process invocation into one daemon request.

use serde_json::Value;
use std::env;
use std::io::{self, Read};
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::debug;

use crate::config::NetConf;
use crate::error::{Error, Result};
use crate::transport::{Client, CniRequest};
use crate::types::{Command, VersionInfo, DEFAULT_CNI_VERSION};

/// Extra time the shim waits beyond the daemon-side deadline for the reply.
const RESPONSE_GRACE: Duration = Duration::from_secs(5);

fn required_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("{} not found in environment", name)))
}

/// Parse command arguments from environment
pub fn parse_args(command: Command) -> Result<CniRequest> {
    let container_id = required_env("CNI_CONTAINERID")?;

    // DEL may arrive after the namespace is gone
    let netns = match command {
        Command::Del => env::var("CNI_NETNS").unwrap_or_default(),
        _ => required_env("CNI_NETNS")?,
    };
    let ifname = required_env("CNI_IFNAME")?;
    let path = env::var("CNI_PATH").unwrap_or_default();
    let args = env::var("CNI_ARGS").unwrap_or_default();

    let mut stdin = String::new();
    io::stdin()
        .read_to_string(&mut stdin)
        .map_err(|e| Error::Config(format!("failed to read network configuration from stdin: {}", e)))?;

    Ok(CniRequest {
        command,
        container_id,
        netns,
        ifname,
        args,
        path,
        stdin,
        timeout_ms: None,
    })
}

/// Sends `request` to the daemon named by `conf` and returns its success payload.
pub fn forward(conf: &NetConf, request: &CniRequest) -> Result<Option<Value>> {
    let mut client = Client::new(&conf.socket_dir());
    if let Some(timeout) = request.timeout() {
        client = client.with_timeout(timeout + RESPONSE_GRACE);
    }
    debug!(
        "Forwarding {} for {} to {}",
        request.command,
        request.container_id,
        client.socket_path().display()
    );

    let runtime = Runtime::new()?;
    let response = runtime.block_on(client.send(request))?;
    response.into_result()
}

/// Stdout body for VERSION.
pub fn version_body() -> Result<String> {
    Ok(serde_json::to_string_pretty(&VersionInfo::current())?)
}

/// Stdout body printed before the shim exits 1.
pub fn error_body(err: &Error) -> String {
    let body = err.to_cni_error(DEFAULT_CNI_VERSION);
    serde_json::to_string(&body).unwrap_or_else(|_| {
        format!(
            r#"{{"cniVersion":"{}","code":{},"msg":"internal error"}}"#,
            DEFAULT_CNI_VERSION, body.code
        )
    })
}

/// Main entry point for the CNI plugin
pub fn run_cni() -> Result<()> {
    let command: Command = required_env("CNI_COMMAND")?.parse()?;

    // Answered locally, the daemon is not needed
    if command == Command::Version {
        println!("{}", version_body()?);
        return Ok(());
    }

    let mut request = parse_args(command)?;
    let conf = NetConf::parse(request.stdin.as_bytes())?;
    request.timeout_ms = conf.timeout_seconds.map(|secs| secs.saturating_mul(1000));

    if let Some(result) = forward(&conf, &request)? {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    Ok(())
}
