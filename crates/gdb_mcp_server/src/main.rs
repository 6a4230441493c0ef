use std::{sync::Arc, time::Duration};

use gdb_bridge_core::{
    types::{ExecResponse, ProcessListResponse}, AttachRequest, BridgeConfig, BridgeError, Dispatcher,
};
use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters, ServerHandler},
    model::*,
    tool, tool_handler, tool_router, transport, ErrorData as McpError, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "info,gdb_bridge_core=debug";

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct AttachParams {
    /// Debugger process id. Defaults to the first debugger found.
    #[serde(default)]
    process_id: Option<u32>,
    /// Backend locator such as a tmux target (`work:1.0`) or an iTerm2
    /// session id.
    #[serde(default)]
    locator: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct ExecuteParams {
    command: String,
    #[serde(default)]
    session_id: Option<String>,
    /// Overall budget for this command in milliseconds.
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct SessionParams {
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct LaunchParams {
    #[serde(default)]
    executable: Option<String>,
    /// `host:port` of a gdbserver-style stub to connect to after launch.
    #[serde(default)]
    remote_target: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct BreakpointParams {
    location: String,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DeleteBreakpointParams {
    /// Breakpoint number. Deletes every breakpoint when omitted.
    #[serde(default)]
    number: Option<u32>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct StepParams {
    #[serde(default)]
    count: Option<u32>,
    /// Step one machine instruction instead of one source line.
    #[serde(default)]
    instruction: bool,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct RegistersParams {
    /// Register names, e.g. `rip rsp`. All general registers when omitted.
    #[serde(default)]
    registers: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct MemoryParams {
    address: String,
    #[serde(default = "default_memory_count")]
    count: u32,
    /// gdb `x` format letters, e.g. `x`, `gx`, `s`, `i`.
    #[serde(default = "default_memory_format")]
    format: String,
    #[serde(default)]
    session_id: Option<String>,
}

fn default_memory_count() -> u32 {
    10
}

fn default_memory_format() -> String {
    "x".to_string()
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct BacktraceParams {
    #[serde(default)]
    limit: Option<u32>,
    /// Include local variables of every frame.
    #[serde(default)]
    full: bool,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct DisassembleParams {
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct ConnectRemoteParams {
    address: String,
    #[serde(default)]
    extended: bool,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Clone)]
struct GdbMcpServer {
    tool_router: ToolRouter<Self>,
    dispatcher: Dispatcher,
    /// Session used when a tool call names none.
    default_session: Arc<Mutex<Option<String>>>,
}

fn to_mcp_error(err: BridgeError) -> McpError {
    match err {
        BridgeError::UnknownSession(_) => McpError::invalid_params(err.to_string(), None),
        other => McpError::internal_error(other.to_string(), None),
    }
}

fn invalid_params(message: impl Into<String>) -> McpError {
    McpError::invalid_params(message.into(), None)
}

/// Turns an execute outcome into a tool result. Failures that leave the
/// session usable come back as `success: false` rather than protocol errors.
fn exec_result(command: &str, result: Result<ExecResponse, BridgeError>) -> Result<CallToolResult, McpError> {
    let (response, failure) = match result {
        Ok(response) => (response, None),
        Err(err @ BridgeError::UnknownSession(_)) => return Err(to_mcp_error(err)),
        Err(err) => {
            let failure = (error_kind(&err), err.is_transient());
            (ExecResponse::failed(err.to_string()), Some(failure))
        }
    };

    let mut body = serde_json::to_value(&response)
        .map_err(|e| McpError::internal_error(format!("Failed to serialize response: {e}"), None))?;
    if let Value::Object(map) = &mut body {
        map.insert("command".to_string(), json!(command));
        if let Some((kind, retryable)) = failure {
            map.insert("error_kind".to_string(), json!(kind));
            map.insert("retryable".to_string(), json!(retryable));
        }
    }
    Ok(CallToolResult::structured(body))
}

fn error_kind(err: &BridgeError) -> &'static str {
    match err {
        BridgeError::SessionBusy(_) => "session_busy",
        BridgeError::Cancelled => "cancelled",
        BridgeError::AllTransportsFailed { .. } => "all_transports_failed",
        BridgeError::NonResponsive { .. } => "non_responsive",
        BridgeError::SessionNotFound(_) => "session_not_found",
        _ => "internal",
    }
}

fn structured<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    serde_json::to_value(value)
        .map(CallToolResult::structured)
        .map_err(|e| McpError::internal_error(format!("Failed to serialize response: {e}"), None))
}

fn breakpoint_command(location: &str, condition: Option<&str>) -> Result<String, String> {
    let location = location.trim();
    if location.is_empty() {
        return Err("Breakpoint location must not be empty".to_string());
    }
    Ok(match condition.map(str::trim).filter(|c| !c.is_empty()) {
        Some(condition) => format!("break {location} if {condition}"),
        None => format!("break {location}"),
    })
}

fn delete_breakpoint_command(number: Option<u32>) -> String {
    match number {
        Some(number) => format!("delete {number}"),
        None => "delete".to_string(),
    }
}

fn step_command(verb: &str, params: &StepParams) -> String {
    let verb = if params.instruction {
        format!("{verb}i")
    } else {
        verb.to_string()
    };
    match params.count.filter(|n| *n > 1) {
        Some(count) => format!("{verb} {count}"),
        None => verb,
    }
}

fn registers_command(registers: Option<&str>) -> String {
    match registers.map(str::trim).filter(|r| !r.is_empty()) {
        Some(registers) => format!("info registers {registers}"),
        None => "info registers".to_string(),
    }
}

fn memory_command(address: &str, count: u32, format: &str) -> Result<String, String> {
    let address = address.trim();
    if address.is_empty() {
        return Err("Memory address must not be empty".to_string());
    }
    if format.is_empty() || !format.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(format!("Invalid memory format '{format}'"));
    }
    Ok(format!("x/{}{format} {address}", count.max(1)))
}

fn backtrace_command(limit: Option<u32>, full: bool) -> String {
    let mut command = "backtrace".to_string();
    if full {
        command.push_str(" full");
    }
    if let Some(limit) = limit {
        command.push_str(&format!(" {limit}"));
    }
    command
}

fn disassemble_command(location: Option<&str>) -> String {
    match location.map(str::trim).filter(|l| !l.is_empty()) {
        Some(location) => format!("disassemble {location}"),
        None => "disassemble".to_string(),
    }
}

fn connect_remote_command(address: &str, extended: bool) -> Result<String, String> {
    let address = address.trim();
    if address.is_empty() {
        return Err("Remote address must not be empty".to_string());
    }
    let mode = if extended { "extended-remote" } else { "remote" };
    Ok(format!("target {mode} {address}"))
}

#[tool_router]
impl GdbMcpServer {
    fn new(dispatcher: Dispatcher) -> Self {
        Self {
            tool_router: Self::tool_router(),
            dispatcher,
            default_session: Arc::new(Mutex::new(None)),
        }
    }

    async fn session(&self, requested: Option<String>) -> Result<String, McpError> {
        if let Some(session_id) = requested.filter(|s| !s.trim().is_empty()) {
            return Ok(session_id);
        }
        self.default_session.lock().await.clone().ok_or_else(|| {
            invalid_params("No debugger session. Call attach_to_gdb or launch_gdb first.")
        })
    }

    async fn run(&self, session_id: Option<String>, command: String) -> Result<CallToolResult, McpError> {
        let session_id = self.session(session_id).await?;
        let result = self.dispatcher.execute(&session_id, &command).await;
        exec_result(&command, result)
    }

    #[tool(description = "List running gdb processes with their pid, tty and command line")]
    async fn find_gdb_processes(&self) -> Result<CallToolResult, McpError> {
        let processes = self.dispatcher.find_processes().await.map_err(to_mcp_error)?;
        structured(&ProcessListResponse::from(processes))
    }

    #[tool(description = "Attach to a gdb session running in a terminal. Without arguments attaches to the first gdb process found")]
    async fn attach_to_gdb(
        &self,
        params: Parameters<AttachParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let response = self
            .dispatcher
            .attach(AttachRequest {
                process_id: params.process_id,
                locator: params.locator,
            })
            .await
            .map_err(to_mcp_error)?;

        *self.default_session.lock().await = Some(response.session_id.clone());
        structured(&response)
    }

    #[tool(description = "Start a new gdb owned by this server, optionally loading an executable and connecting to a remote stub")]
    async fn launch_gdb(
        &self,
        params: Parameters<LaunchParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let response = self
            .dispatcher
            .launch(params.executable.as_deref(), params.remote_target.as_deref())
            .await
            .map_err(to_mcp_error)?;

        *self.default_session.lock().await = Some(response.session_id.clone());
        structured(&response)
    }

    #[tool(description = "Execute a gdb command and return its output. Commands that resume the program are interrupted if they do not stop and reported as blocked")]
    async fn execute_command(
        &self,
        params: Parameters<ExecuteParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let command = params.command.trim().to_string();
        if command.is_empty() {
            return Err(invalid_params("Command must not be empty"));
        }
        let session_id = self.session(params.session_id).await?;

        let result = match params.timeout_ms {
            Some(ms) => {
                self.dispatcher
                    .execute_with_budget(&session_id, &command, Duration::from_millis(ms))
                    .await
            }
            None => self.dispatcher.execute(&session_id, &command).await,
        };
        exec_result(&command, result)
    }

    #[tool(description = "Report whether the last command left the program running, without touching the terminal")]
    async fn check_blocked(
        &self,
        params: Parameters<SessionParams>,
    ) -> Result<CallToolResult, McpError> {
        let session_id = self.session(params.0.session_id).await?;
        let status = self.dispatcher.check_blocked(&session_id).map_err(to_mcp_error)?;
        structured(&status)
    }

    #[tool(description = "Cancel the command currently running on a session")]
    async fn cancel_command(
        &self,
        params: Parameters<SessionParams>,
    ) -> Result<CallToolResult, McpError> {
        let session_id = self.session(params.0.session_id).await?;
        let cancelled = self.dispatcher.cancel(&session_id).map_err(to_mcp_error)?;
        Ok(CallToolResult::structured(json!({
            "session_id": session_id,
            "cancelled": cancelled,
        })))
    }

    #[tool(description = "Show available transports for this platform and the state of every session")]
    async fn communication_status(&self) -> Result<CallToolResult, McpError> {
        let status = self.dispatcher.status();
        let default_session = self.default_session.lock().await.clone();
        let mut body = serde_json::to_value(&status)
            .map_err(|e| McpError::internal_error(format!("Failed to serialize status: {e}"), None))?;
        if let Value::Object(map) = &mut body {
            map.insert("default_session".to_string(), json!(default_session));
        }
        Ok(CallToolResult::structured(body))
    }

    #[tool(description = "Set a breakpoint at a function, file:line or *address")]
    async fn set_breakpoint(
        &self,
        params: Parameters<BreakpointParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let command =
            breakpoint_command(&params.location, params.condition.as_deref()).map_err(invalid_params)?;
        self.run(params.session_id, command).await
    }

    #[tool(description = "Delete one breakpoint by number, or all breakpoints")]
    async fn delete_breakpoint(
        &self,
        params: Parameters<DeleteBreakpointParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        self.run(params.session_id, delete_breakpoint_command(params.number))
            .await
    }

    #[tool(description = "Step into the next source line or instruction")]
    async fn step(&self, params: Parameters<StepParams>) -> Result<CallToolResult, McpError> {
        let command = step_command("step", &params.0);
        self.run(params.0.session_id, command).await
    }

    #[tool(description = "Step over the next source line or instruction")]
    async fn next(&self, params: Parameters<StepParams>) -> Result<CallToolResult, McpError> {
        let command = step_command("next", &params.0);
        self.run(params.0.session_id, command).await
    }

    #[tool(description = "Run until the current function returns")]
    async fn finish(&self, params: Parameters<SessionParams>) -> Result<CallToolResult, McpError> {
        self.run(params.0.session_id, "finish".to_string()).await
    }

    #[tool(description = "Continue execution. Reported as blocked if the program does not stop")]
    async fn continue_execution(
        &self,
        params: Parameters<SessionParams>,
    ) -> Result<CallToolResult, McpError> {
        self.run(params.0.session_id, "continue".to_string()).await
    }

    #[tool(description = "Show register values")]
    async fn get_registers(
        &self,
        params: Parameters<RegistersParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let command = registers_command(params.registers.as_deref());
        self.run(params.session_id, command).await
    }

    #[tool(description = "Examine memory with gdb's x command")]
    async fn examine_memory(
        &self,
        params: Parameters<MemoryParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let command =
            memory_command(&params.address, params.count, &params.format).map_err(invalid_params)?;
        self.run(params.session_id, command).await
    }

    #[tool(description = "Show the call stack")]
    async fn get_stack(
        &self,
        params: Parameters<BacktraceParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let command = backtrace_command(params.limit, params.full);
        self.run(params.session_id, command).await
    }

    #[tool(description = "Show local variables of the selected frame")]
    async fn get_locals(
        &self,
        params: Parameters<SessionParams>,
    ) -> Result<CallToolResult, McpError> {
        self.run(params.0.session_id, "info locals".to_string()).await
    }

    #[tool(description = "Disassemble the current function or a given location")]
    async fn disassemble(
        &self,
        params: Parameters<DisassembleParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let command = disassemble_command(params.location.as_deref());
        self.run(params.session_id, command).await
    }

    #[tool(description = "Connect the session's gdb to a remote stub such as gdbserver or QEMU")]
    async fn connect_remote(
        &self,
        params: Parameters<ConnectRemoteParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let command = connect_remote_command(&params.address, params.extended).map_err(invalid_params)?;
        self.run(params.session_id, command).await
    }
}

#[tool_handler]
impl ServerHandler for GdbMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "GDB bridge: attach to gdb running in a terminal (tmux, iTerm2) or launch one, then run commands and read their output".into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = BridgeConfig::from_env();
    tracing::debug!(?config, "Loaded bridge configuration");

    let dispatcher = Dispatcher::new(config);
    let server = GdbMcpServer::new(dispatcher.clone());
    let transport = transport::stdio();

    tracing::info!(
        transports = ?dispatcher.status().transports,
        "Starting GDB MCP Server on stdio..."
    );

    server.serve(transport).await?.waiting().await?;

    dispatcher.shutdown().await;
    Ok(())
}
