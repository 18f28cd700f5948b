use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use rand_core::{OsRng, RngCore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use wardend::{
    config::{KernelConfig, KernelEnv},
    ipc,
    nodes::Exposure,
    Kernel,
};

#[derive(Parser)]
#[command(
    name = "wardend",
    about = "Warden — capability-enforcement kernel for agent runtimes",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// JSON-RPC WebSocket server port
    #[arg(long, env = "WARDEN_PORT")]
    port: Option<u16>,

    /// Data directory for config and the auth token
    #[arg(long, env = "WARDEN_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Workspace root (ledgers live under <workspace>/.warden/)
    #[arg(long, env = "WARDEN_WORKSPACE_DIR")]
    workspace_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "WARDEN_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "WARDEN_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Declare the gateway exposure: loopback, tailnet, or exposed.
    /// Dangerous node commands refuse to run on an unsafe exposure.
    #[arg(long, env = "WARDEN_EXPOSURE", default_value = "loopback")]
    exposure: String,
}

#[derive(Subcommand)]
enum Command {
    /// Start the kernel server (default when no subcommand given).
    Serve,
    /// Verify the hash chain of a session ledger and exit non-zero on
    /// corruption.
    ///
    /// Examples:
    ///   wardend verify-ledger --session-key agent-7
    VerifyLedger {
        #[arg(long)]
        session_key: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = KernelConfig::new(
        args.port,
        args.data_dir.clone(),
        args.log.clone(),
        args.workspace_dir.clone(),
    );
    init_tracing(&config.log, args.log_file.as_deref())?;

    let runtime = tokio::runtime::Runtime::new().context("tokio runtime")?;
    runtime.block_on(run(args, config))
}

async fn run(args: Args, config: KernelConfig) -> Result<()> {
    let env = KernelEnv::from_env();
    let exposure = parse_exposure(&args.exposure);
    let auth_token = load_or_create_auth_token(&config.data_dir)?;

    let kernel = Kernel::new(config, env, exposure, auth_token);

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            info!(
                version = env!("CARGO_PKG_VERSION"),
                workspace = %kernel.config.workspace_dir.display(),
                "wardend starting"
            );
            ipc::run(Arc::clone(&kernel)).await
        }
        Command::VerifyLedger { session_key } => {
            match kernel.ledger.verify(&session_key).await {
                Ok(entries) => {
                    println!("ok: {entries} entries, chain intact");
                    Ok(())
                }
                Err(e) => {
                    eprintln!("chain verification failed: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}

fn parse_exposure(s: &str) -> Exposure {
    match s {
        "loopback" => Exposure::Loopback,
        "tailnet" => Exposure::TailnetServe,
        other => {
            if other != "exposed" {
                warn!(exposure = other, "unknown exposure — treating as exposed");
            }
            Exposure::Exposed
        }
    }
}

fn init_tracing(filter: &str, log_file: Option<&std::path::Path>) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file = path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| "wardend.log".to_string());
            let appender = tracing_appender::rolling::daily(dir, file);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(appender)
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
        }
    }
    Ok(())
}

/// Load `{data_dir}/auth_token`, creating it with a fresh random token on
/// first run. Mode 0600 on Unix.
fn load_or_create_auth_token(data_dir: &std::path::Path) -> Result<String> {
    let path = data_dir.join("auth_token");
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let token = existing.trim().to_string();
        if !token.is_empty() {
            return Ok(token);
        }
    }

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("create data dir {}", data_dir.display()))?;
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let token = hex::encode(bytes);
    std::fs::write(&path, &token).with_context(|| format!("write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
    }
    Ok(token)
}
