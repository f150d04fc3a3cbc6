use portside::config::{self, ProjectPaths, CONTROL_PORT, DEFAULT_ENV};
use portside::port;
use portside::supervisor::{self, RunOptions, StartOptions};
use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, PartialEq)]
enum Command {
    Help,
    Version,
    Start(StartArgs),
}

#[derive(Debug, Default, PartialEq)]
struct StartArgs {
    processes: Vec<String>,
    env_name: Option<String>,
    timestamps: bool,
}

fn parse_command(args: &[String]) -> Command {
    if args.is_empty() {
        return Command::Help;
    }

    match args[0].as_str() {
        "help" | "--help" | "-h" => Command::Help,
        "version" | "--version" | "-V" => Command::Version,
        "start" => Command::Start(parse_start_args(&args[1..])),
        _ => Command::Help,
    }
}

fn parse_start_args(args: &[String]) -> StartArgs {
    let mut start = StartArgs::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--env" | "-e" => {
                start.env_name = args.get(i + 1).cloned();
                i += 1;
            }
            "--time" | "-t" => start.timestamps = true,
            arg => {
                if let Some(value) = arg.strip_prefix("--env=") {
                    start.env_name = Some(value.to_string());
                } else {
                    start.processes.push(arg.to_string());
                }
            }
        }
        i += 1;
    }
    start
}

fn print_help() {
    println!(
        r#"portside {VERSION} - run a project's processes behind a local router

USAGE:
    portside start [PROCESS...] [OPTIONS]

OPTIONS:
    -e, --env <NAME>    Environment to run (default: {DEFAULT_ENV})
    -t, --time          Prefix output lines with the time

Processes come from etc/environments/<env>/procfile. Routes and extra
variables are read from ~/{config_file}, keyed by project directory name.
"#,
        config_file = config::CONFIG_FILE_NAME
    );
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("portside=info".parse().expect("valid log directive")),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();

    let code = match parse_command(&args) {
        Command::Help => {
            print_help();
            0
        }
        Command::Version => {
            println!("portside {}", VERSION);
            0
        }
        Command::Start(start) => match run_start(start).await {
            Ok(code) => code,
            Err(e) => {
                error!(error = %e, "Fatal error");
                1
            }
        },
    };

    std::process::exit(code);
}

async fn run_start(args: StartArgs) -> anyhow::Result<i32> {
    let root = env::current_dir()?;
    let env_name = args.env_name.unwrap_or_else(|| DEFAULT_ENV.to_string());

    let options = RunOptions {
        paths: ProjectPaths::new(&root, env_name),
        config_path: config::config_path(),
        router_port: config::router_port(),
        control_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, CONTROL_PORT)),
        start: StartOptions {
            processes: args.processes,
            timestamps: args.timestamps,
        },
        allocate_port: port::allocate,
    };

    supervisor::run(options, shutdown_signal()).await
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received SIGINT (Ctrl+C), shutting down...");
    }
}
