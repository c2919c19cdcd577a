// Auth-callout broker entry point.
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use iam_broker::auth::BrokerOptions;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "iam-broker",
    about = "Bridges OIDC identity providers and a NATS deployment via auth callout."
)]
struct Args {
    /// Log level directive: error, warn, info, debug, trace.
    #[arg(long = "log", default_value = "info")]
    log: String,

    /// Human-readable log output instead of JSON.
    #[arg(long = "log-human")]
    log_human: bool,

    /// Log raw tokens and claim maps. Only for debugging.
    #[arg(long = "log-sensitive")]
    log_sensitive: bool,

    /// Configuration files, merged in order.
    #[arg(required = true, value_name = "CONFIG_YAML")]
    configs: Vec<PathBuf>,
}

fn init_logging(level: &str, human_readable: bool) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    if human_readable {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log, args.log_human);

    let options = BrokerOptions {
        log_sensitive: args.log_sensitive,
    };
    match iam_broker::server::run(args.configs, options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("[service stderr]: {err:#}");
            ExitCode::FAILURE
        }
    }
}
