//! `zmqruntime-server` - run a runtime server from the command line.
//!
//! Registers the built-in execution server (with a demo task executor)
//! and constructs the requested server kind through the type registry,
//! then drives its event loop until a force-shutdown request arrives.
//! Clients spawn this binary through their connect-or-spawn protocol.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser, ValueEnum};
use serde_json::{json, Value};
use tracing::info;

use zmqruntime::server::execution::{
    register_execution_server, ExecutionContext, TaskExecutor, TaskOutput,
};
use zmqruntime::{
    create_server, logging, run_server, ExecuteRequest, RuntimeConfig, ServerOptions, TaskError,
    TransportMode,
};

#[derive(Parser, Debug)]
#[command(name = "zmqruntime-server", version, about = "Dual-channel runtime server")]
struct Args {
    /// Registered server type to run
    #[arg(long, default_value = "execution")]
    server_type: String,

    /// Data port; the control channel binds at port + offset
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind host for both sockets
    #[arg(long, default_value = "*")]
    host: String,

    /// Transport mode (default: ipc on POSIX, tcp on Windows)
    #[arg(long, value_enum)]
    transport: Option<TransportArg>,

    /// Log file; the path is reported back to clients in pongs
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportArg {
    Tcp,
    Ipc,
}

impl From<TransportArg> for TransportMode {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Tcp => TransportMode::Tcp,
            TransportArg::Ipc => TransportMode::Ipc,
        }
    }
}

/// Built-in executor: walks the wells named in `config_params`, emitting
/// per-well progress and an incrementing result value for each.
struct DemoExecutor;

impl TaskExecutor for DemoExecutor {
    fn execute_task(
        &self,
        execution_id: &str,
        request: &ExecuteRequest,
        ctx: &ExecutionContext,
    ) -> Result<TaskOutput, TaskError> {
        let params = request.config_params.clone().unwrap_or_default();
        let wells: Vec<String> = params
            .get("wells")
            .and_then(Value::as_array)
            .map(|wells| {
                wells
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_else(|| vec!["A1".to_string(), "A2".to_string()]);
        let delay_ms = params.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);

        let mut results = TaskOutput::new();
        for (index, well) in wells.iter().enumerate() {
            ctx.send_progress_update(well, "process", "running");
            if delay_ms > 0 {
                std::thread::sleep(Duration::from_millis(delay_ms));
            }
            ctx.send_progress_update(well, "process", "complete");
            results.insert(well.clone(), json!(index + 1));
        }
        info!("[{}] Processed {} wells", execution_id, results.len());
        Ok(results)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let _log_guard = logging::init(args.log_file.as_deref(), default_level)?;

    register_execution_server(|| Arc::new(DemoExecutor));

    let options = ServerOptions {
        port: args.port,
        host: args.host.clone(),
        log_file_path: args.log_file.as_ref().map(|p| p.display().to_string()),
        transport_mode: args.transport.map(Into::into),
        config: RuntimeConfig::default(),
    };
    let mut server = create_server(&args.server_type, &options)?;
    info!(
        "Starting {} server (pid {})",
        args.server_type,
        std::process::id()
    );
    run_server(server.as_mut(), Duration::from_millis(10))
}
