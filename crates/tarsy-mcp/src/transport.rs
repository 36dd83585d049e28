//! Subprocess-backed MCP transport: one long-lived child process per server,
//! talking newline-delimited JSON-RPC 2.0 over stdio.
//!
//! Calls are serialized through a mutex rather than multiplexed by request
//! id, since a stage only ever has one tool call in flight against a given
//! server at a time.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use tarsy_core::types::{ToolDefinition, TransportConfig};
use tarsy_core::{Error, Result};

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[allow(dead_code)]
    id: u64,
    result: Option<serde_json::Value>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    message: String,
}

pub struct StdioTransport {
    #[allow(dead_code)]
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    next_id: AtomicU64,
}

impl StdioTransport {
    pub async fn spawn(config: &TransportConfig) -> Result<Self> {
        let command = config
            .command
            .as_deref()
            .ok_or_else(|| Error::configuration("stdio transport requires a command"))?;

        let mut cmd = tokio::process::Command::new(command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::with_source(tarsy_core::ErrorKind::ToolFailure, format!("failed to spawn '{command}'"), e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::internal("child process has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::internal("child process has no stdout"))?;

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = RpcRequest { jsonrpc: "2.0", id, method, params };
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        {
            let mut stdin = self.stdin.lock().await;
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| Error::with_source(tarsy_core::ErrorKind::ToolFailure, "failed writing to mcp server stdin", e))?;
            stdin
                .flush()
                .await
                .map_err(|e| Error::with_source(tarsy_core::ErrorKind::ToolFailure, "failed flushing mcp server stdin", e))?;
        }

        let mut response_line = String::new();
        {
            let mut stdout = self.stdout.lock().await;
            let bytes_read = stdout
                .read_line(&mut response_line)
                .await
                .map_err(|e| Error::with_source(tarsy_core::ErrorKind::ToolFailure, "failed reading mcp server stdout", e))?;
            if bytes_read == 0 {
                return Err(Error::tool_failure("mcp server closed its stdout"));
            }
        }

        let response: RpcResponse = serde_json::from_str(response_line.trim())?;
        if let Some(error) = response.error {
            return Err(Error::tool_failure(error.message));
        }
        Ok(response.result.unwrap_or(serde_json::Value::Null))
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        let result = self.call("tools/list", serde_json::json!({})).await?;
        let tools = result
            .get("tools")
            .cloned()
            .unwrap_or(serde_json::Value::Array(Vec::new()));
        serde_json::from_value(tools).map_err(Into::into)
    }

    pub async fn call_tool(&self, tool: &str, arguments: serde_json::Value) -> Result<serde_json::Value> {
        self.call("tools/call", serde_json::json!({ "name": tool, "arguments": arguments }))
            .await
    }

    /// Terminates the child process. Called from the stage's guaranteed-release
    /// block rather than relied on via `Drop` alone, so cleanup is observable
    /// and ordered relative to the rest of stage teardown.
    pub async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
    }
}
