//! idletrace - run and inspect idle transactions from the command line

use anyhow::Context;
use clap::{Parser, Subcommand};
use idletrace_core::config::{ConfigLoader, IdletraceConfig};
use idletrace_core::heartbeat::HEARTBEAT_INTERVAL;
use idletrace_core::{
    Hub, IdleTransaction, IdleTransactionOptions, JsonlReporter, JsonlReporterConfig, LogReporter,
    MemoryReporter, MultiReporter, Reporter, SpanStatus, TransactionContext,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "idletrace")]
#[command(version)]
#[command(about = "Idle transaction tracer", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated workload on an idle transaction and print the result
    Demo {
        /// Transaction name
        #[arg(short, long, default_value = "demo")]
        name: String,

        /// Number of child spans
        #[arg(long, default_value = "3")]
        children: u32,

        /// Duration step between children, in milliseconds
        #[arg(long, default_value = "200")]
        step_ms: u64,

        /// Start one child that never finishes, so the heartbeat ends the transaction
        #[arg(long)]
        stall: bool,

        /// Override the idle timeout, in milliseconds
        #[arg(long)]
        idle_timeout_ms: Option<u64>,

        /// Also log a summary of the finished transaction
        #[arg(long)]
        log: bool,

        /// Append the finished transaction to this JSONL file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.clone());

    // CLI verbose flag takes precedence, then config
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match config.tracer.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Demo {
            name,
            children,
            step_ms,
            stall,
            idle_timeout_ms,
            log,
            output,
        } => {
            let mut options = config.idle.to_options();
            if let Some(ms) = idle_timeout_ms {
                options.idle_timeout = Duration::from_millis(ms);
            }
            let output = output.or_else(|| config.report.jsonl_path.as_ref().map(PathBuf::from));

            run_demo(
                DemoPlan {
                    name,
                    children,
                    step: Duration::from_millis(step_ms),
                    stall,
                },
                options,
                DemoReporting { output, log },
            )
            .await
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(cli_path: Option<PathBuf>) -> IdletraceConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => config,
        Err(e) => {
            // Logging is not set up yet
            eprintln!("Failed to load configuration: {}, using defaults", e);
            IdletraceConfig::default()
        }
    }
}

struct DemoReporting {
    output: Option<PathBuf>,
    log: bool,
}

struct DemoPlan {
    name: String,
    children: u32,
    step: Duration,
    stall: bool,
}

async fn run_demo(
    plan: DemoPlan,
    options: IdleTransactionOptions,
    reporting: DemoReporting,
) -> anyhow::Result<()> {
    let memory = Arc::new(MemoryReporter::new());
    let mut reporters: Vec<Arc<dyn Reporter>> = vec![memory.clone()];
    if reporting.log {
        reporters.push(Arc::new(LogReporter));
    }
    if let Some(path) = reporting.output {
        let jsonl = JsonlReporter::open(JsonlReporterConfig {
            path: path.clone(),
            ..Default::default()
        })
        .with_context(|| format!("opening {}", path.display()))?;
        reporters.push(Arc::new(jsonl));
    }

    let hub = Arc::new(Hub::with_reporter(Arc::new(MultiReporter::new(reporters))));
    hub.configure_scope(|scope| scope.set_tag("source", "idletrace-demo"));

    info!(
        "Starting demo: {} children, idle timeout {}ms, heartbeat {}ms",
        plan.children,
        options.idle_timeout.as_millis(),
        HEARTBEAT_INTERVAL.as_millis()
    );

    let transaction = hub.start_idle_transaction(TransactionContext::new(plan.name, "demo"), options)?;
    transaction.before_finish(|idle: &IdleTransaction| {
        let open = idle.activity_count();
        if open > 0 {
            warn!("Finishing with {} children still running", open);
        }
    });

    for i in 0..plan.children {
        let span = transaction.start_child("demo.task");
        span.set_description(format!("task {}", i + 1));
        let delay = plan.step * (i + 1);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            span.set_status(SpanStatus::Ok);
            span.finish(None);
        });
    }

    if plan.stall {
        let stalled = transaction.start_child("demo.stalled");
        stalled.set_description("never finishes");
    }

    transaction.wait_finished().await;

    let event = memory
        .last()
        .context("idle transaction finished without being reported")?;
    println!("{}", serde_json::to_string_pretty(&event)?);

    Ok(())
}
