//! Process supervisor
//!
//! Starts every selected procfile entry concurrently. Processes with a route
//! in the project config get a free port and are published to the router
//! before they are spawned. Each output line is prefixed with a colored,
//! width-aligned label and written to our stderr.
//!
//! [`run`] is the whole `portside start` command: load the procfile and
//! config, bring up the router, supervise, and pick the exit code.

use crate::config::{self, Config, ProjectConfig, ProjectPaths};
use crate::control::{InProcessLauncher, RouterClient};
use crate::env::{self, EnvironmentMap};
use crate::error::{ConfigError, PortError};
use crate::output::{self, exit_message, ExitReport, Labeler};
use crate::port;
use crate::procfile::{self, ProcessSpec, Procfile};
use crate::protocol::{Color, Route};
use crate::router;
use crate::shebang;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Finds a free port for a routed process
pub type PortAllocator = fn() -> Result<u16, PortError>;

/// Options from the command line
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Only start these processes (all when empty)
    pub processes: Vec<String>,
    /// Prefix output lines with a timestamp
    pub timestamps: bool,
}

/// A procfile entry chosen to run, with everything decided up front
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedProcess {
    pub spec: ProcessSpec,
    pub display_name: String,
    pub color: Color,
    pub hostname: Option<String>,
}

/// Pick processes to run and assign colors.
///
/// Colors follow procfile position, not position among the selected
/// processes, so a process keeps its color however the run is filtered.
pub fn select(
    procfile: &Procfile,
    filter: &[String],
    env_name: &str,
    project: &ProjectConfig,
) -> Vec<SelectedProcess> {
    for name in filter {
        if !procfile.contains(name) {
            warn!(process = %name, "No process named {} in procfile", name);
        }
    }

    procfile
        .iter()
        .enumerate()
        .filter(|(_, spec)| filter.is_empty() || filter.iter().any(|n| n == &spec.name))
        .map(|(index, spec)| SelectedProcess {
            spec: spec.clone(),
            display_name: output::display_name(&spec.name, env_name),
            color: Color::for_index(index),
            hostname: project.route_for(&spec.name).map(str::to_string),
        })
        .collect()
}

/// Result of one supervised process
#[derive(Debug)]
pub struct ProcessOutcome {
    pub name: String,
    pub exit: ExitReport,
}

pub struct Supervisor {
    paths: ProjectPaths,
    project: ProjectConfig,
    client: Arc<RouterClient>,
    options: StartOptions,
    allocate_port: PortAllocator,
}

impl Supervisor {
    pub fn new(
        paths: ProjectPaths,
        project: ProjectConfig,
        client: Arc<RouterClient>,
        options: StartOptions,
    ) -> Self {
        Self {
            paths,
            project,
            client,
            options,
            allocate_port: port::allocate,
        }
    }

    pub fn with_port_allocator(mut self, allocate_port: PortAllocator) -> Self {
        self.allocate_port = allocate_port;
        self
    }

    /// Start all selected processes. Each task resolves when its process exits.
    ///
    /// A task fails with [`PortError`] when no port could be found for a
    /// routed process; the process is then never spawned.
    pub fn start(self: &Arc<Self>, procfile: &Procfile) -> JoinSet<anyhow::Result<ProcessOutcome>> {
        let selected = select(
            procfile,
            &self.options.processes,
            &self.paths.env_name,
            &self.project,
        );
        let width = output::label_width(selected.iter().map(|p| p.display_name.as_str()));

        let file_env = env::resolve(&self.paths);
        let config_env = self.project.env_for(&self.paths.env_name);

        let mut tasks = JoinSet::new();
        for process in selected {
            let supervisor = Arc::clone(self);
            let file_env = file_env.clone();
            let config_env = config_env.clone();
            tasks.spawn(async move {
                supervisor
                    .run_process(process, width, &file_env, &config_env)
                    .await
            });
        }
        tasks
    }

    async fn run_process(
        &self,
        process: SelectedProcess,
        width: usize,
        file_env: &EnvironmentMap,
        config_env: &EnvironmentMap,
    ) -> anyhow::Result<ProcessOutcome> {
        let color = process.color;
        info!("{}", color.paint(&format!("Starting {} process...", process.display_name)));

        let port = match &process.hostname {
            Some(hostname) => {
                let port = (self.allocate_port)().map_err(|e| {
                    error!(process = %process.display_name, error = %e, "Port allocation failed");
                    e
                })?;
                self.client.add_route(Route {
                    process_name: process.display_name.clone(),
                    host_name: hostname.clone(),
                    port,
                    color,
                });
                Some(port)
            }
            None => None,
        };

        let environment =
            env::process_environment(file_env, config_env, &env::os_environment(), port);
        let command = shebang::resolve(&self.paths, &process.spec.command);
        let args = env::inject(&process.spec.args, &environment).args;
        let command_line = shell_command_line(&command, &args);

        let mut cmd = shell(&command_line);
        cmd.env_clear()
            .envs(&environment)
            .current_dir(&self.paths.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            anyhow::anyhow!("Failed to start {}: {}", process.display_name, e)
        })?;

        info!("{}", color.paint(&format!("Running {}", command_line)));
        info!(
            "{}",
            color.paint(&format!(
                "PID: {}, Parent PID: {}",
                child.id().unwrap_or(0),
                std::process::id()
            ))
        );

        let labeler = Labeler::new(
            process.display_name.clone(),
            width,
            color,
            self.options.timestamps,
        );

        let stdout = child.stdout.take().map(|out| {
            let labeler = labeler.clone();
            tokio::spawn(async move { forward_lines(out, &labeler).await })
        });
        let stderr = child.stderr.take().map(|err| {
            let labeler = labeler.clone();
            tokio::spawn(async move { forward_lines(err, &labeler).await })
        });

        let status = child.wait().await?;
        for pipe in [stdout, stderr].into_iter().flatten() {
            let _ = pipe.await;
        }

        let exit = ExitReport::from(status);
        eprintln!("{}", exit_message(&labeler.prefix(), exit));

        Ok(ProcessOutcome {
            name: process.spec.name,
            exit,
        })
    }
}

/// Everything `portside start` needs besides the procfile itself
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub paths: ProjectPaths,
    pub config_path: PathBuf,
    pub router_port: u16,
    pub control_addr: SocketAddr,
    pub start: StartOptions,
    pub allocate_port: PortAllocator,
}

/// Run the project's processes until `shutdown` resolves and return the exit
/// code.
///
/// The code is 1 when the procfile is missing, when the config file does not
/// parse, or when a routed process cannot get a port. Processes exiting on
/// their own do not end the run; the router stays up until `shutdown`.
pub async fn run<F>(options: RunOptions, shutdown: F) -> anyhow::Result<i32>
where
    F: Future<Output = ()>,
{
    let RunOptions {
        paths,
        config_path,
        router_port,
        control_addr,
        start,
        allocate_port,
    } = options;

    let procfile_content = match paths.read_procfile() {
        Ok(content) => content,
        Err(e @ ConfigError::MissingProcfile(_)) => {
            error!("{}", e);
            return Ok(1);
        }
        Err(e) => return Err(e.into()),
    };
    let procfile = procfile::parse(&procfile_content);

    let project = match Config::load(&config_path) {
        Ok(Some(loaded)) => {
            info!(path = %config_path.display(), "Loaded config");
            loaded.project(&config::project_name(&paths.root))
        }
        Ok(None) => {
            info!(path = %config_path.display(), "No config found, starting without routes");
            ProjectConfig::default()
        }
        Err(e) => {
            error!("{}", e);
            return Ok(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    router::ensure_running(router_port, shutdown_rx.clone()).await;

    let client = RouterClient::new(control_addr);
    let launcher = Arc::new(InProcessLauncher::new(router_port, shutdown_rx));
    let connection = tokio::spawn(Arc::clone(&client).connect_loop(launcher));

    let supervisor = Arc::new(
        Supervisor::new(paths, project, client, start).with_port_allocator(allocate_port),
    );
    let mut tasks = supervisor.start(&procfile);
    let code = supervise(&mut tasks, shutdown).await;

    let _ = shutdown_tx.send(true);
    connection.abort();
    tasks.shutdown().await;

    Ok(code)
}

async fn supervise<F>(tasks: &mut JoinSet<anyhow::Result<ProcessOutcome>>, shutdown: F) -> i32
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut running = !tasks.is_empty();
    let mut failed = 0usize;

    if !running {
        warn!("No processes selected to run");
    }

    loop {
        tokio::select! {
            joined = tasks.join_next(), if running => {
                match joined {
                    Some(Ok(Ok(outcome))) => {
                        if !outcome.exit.success() {
                            failed += 1;
                        }
                    }
                    Some(Ok(Err(e))) => {
                        if e.downcast_ref::<PortError>().is_some() {
                            return 1;
                        }
                        error!(error = %e, "Process failed to start");
                    }
                    Some(Err(e)) => error!(error = %e, "Process task panicked"),
                    None => {
                        running = false;
                        info!(failed, "All processes exited, router still running (Ctrl+C to quit)");
                    }
                }
            }
            _ = &mut shutdown => return 0,
        }
    }
}

/// The command as run by the shell: resolved command followed by arguments
pub fn shell_command_line(command: &str, args: &[String]) -> String {
    std::iter::once(command.to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(unix)]
fn shell(command_line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command_line);
    cmd
}

#[cfg(not(unix))]
fn shell(command_line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command_line);
    cmd
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, labeler: &Labeler) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                eprintln!("{}", labeler.line(text.trim_end_matches(['\n', '\r'])));
            }
            Err(e) => {
                warn!(error = %e, "Failed to read process output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procfile;
    use std::collections::HashMap;

    fn project_with_routes(routes: &[(&str, &str)]) -> ProjectConfig {
        ProjectConfig {
            routes: routes
                .iter()
                .map(|(p, h)| (p.to_string(), h.to_string()))
                .collect(),
            env: HashMap::new(),
        }
    }

    #[test]
    fn test_select_all_assigns_palette_in_order() {
        let procfile = procfile::parse("a: x\nb: x\nc: x\nd: x\ne: x\nf: x\ng: x");
        let selected = select(&procfile, &[], "development", &ProjectConfig::default());

        let colors: Vec<Color> = selected.iter().map(|p| p.color).collect();
        assert_eq!(
            colors,
            vec![
                Color::Red,
                Color::Green,
                Color::Blue,
                Color::Magenta,
                Color::Cyan,
                Color::Yellow,
                Color::Red
            ]
        );
    }

    #[test]
    fn test_select_filter_keeps_procfile_colors() {
        let procfile = procfile::parse("web: x\nworker: y\nclock: z");
        let selected = select(
            &procfile,
            &["clock".to_string(), "missing".to_string()],
            "development",
            &ProjectConfig::default(),
        );

        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].spec.name, "clock");
        assert_eq!(selected[0].color, Color::Blue);
    }

    #[test]
    fn test_select_display_names_and_routes() {
        let procfile = procfile::parse("web: x\nworker: y");
        let project = project_with_routes(&[("web", "app.test")]);
        let selected = select(&procfile, &[], "staging", &project);

        assert_eq!(selected[0].display_name, "staging:web");
        assert_eq!(selected[0].hostname.as_deref(), Some("app.test"));
        assert_eq!(selected[1].hostname, None);
    }

    #[test]
    fn test_shell_command_line() {
        assert_eq!(
            shell_command_line("python manage.py", &["runserver".to_string(), "0.0.0.0:9999".to_string()]),
            "python manage.py runserver 0.0.0.0:9999"
        );
        assert_eq!(shell_command_line("make", &[]), "make");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_runs_processes_and_publishes_routes() {
        let dir = tempfile::tempdir().unwrap();
        let env_dir = dir.path().join("etc/environments/development");
        std::fs::create_dir_all(&env_dir).unwrap();
        std::fs::write(env_dir.join("env"), "GREETING=hello\n").unwrap();

        let procfile = procfile::parse(
            "web: sh -c 'echo $PORT > port.txt'\nfail: sh -c 'exit 3'\nhello: sh -c 'echo $GREETING > greeting.txt'",
        );
        let project = project_with_routes(&[("web", "app.test")]);
        let client = RouterClient::new("127.0.0.1:1".parse().unwrap());
        let supervisor = Arc::new(Supervisor::new(
            ProjectPaths::new(dir.path(), "development"),
            project,
            Arc::clone(&client),
            StartOptions::default(),
        ));

        let mut tasks = supervisor.start(&procfile);
        let mut outcomes = HashMap::new();
        while let Some(result) = tasks.join_next().await {
            let outcome = result.unwrap().unwrap();
            outcomes.insert(outcome.name, outcome.exit);
        }

        assert_eq!(outcomes["web"], ExitReport::Code(0));
        assert_eq!(outcomes["fail"], ExitReport::Code(3));
        assert_eq!(outcomes["hello"], ExitReport::Code(0));

        let route = client.routes().remove("app.test").unwrap();
        assert_eq!(route.process_name, "web");
        let written = std::fs::read_to_string(dir.path().join("port.txt")).unwrap();
        assert_eq!(written.trim(), route.port.to_string());

        let greeting = std::fs::read_to_string(dir.path().join("greeting.txt")).unwrap();
        assert_eq!(greeting.trim(), "hello");
    }

    fn write_procfile(root: &std::path::Path, content: &str) {
        let env_dir = root.join("etc/environments/development");
        std::fs::create_dir_all(&env_dir).unwrap();
        std::fs::write(env_dir.join("procfile"), content).unwrap();
    }

    /// Options for a run whose router port is already held by `router`, so
    /// no router is started and the client never connects
    fn run_options(root: &std::path::Path, router: &std::net::TcpListener) -> RunOptions {
        RunOptions {
            paths: ProjectPaths::new(root, "development"),
            config_path: root.join("portside.json"),
            router_port: router.local_addr().unwrap().port(),
            control_addr: "127.0.0.1:1".parse().unwrap(),
            start: StartOptions::default(),
            allocate_port: port::allocate,
        }
    }

    fn held_port() -> std::net::TcpListener {
        std::net::TcpListener::bind((std::net::Ipv4Addr::UNSPECIFIED, 0)).unwrap()
    }

    async fn run_to_completion(options: RunOptions, shutdown: impl Future<Output = ()>) -> i32 {
        tokio::time::timeout(std::time::Duration::from_secs(10), run(options, shutdown))
            .await
            .expect("run did not finish")
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_missing_procfile_exits_1() {
        let dir = tempfile::tempdir().unwrap();
        let router = held_port();

        let code = run_to_completion(run_options(dir.path(), &router), std::future::pending()).await;
        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn test_run_malformed_config_exits_1() {
        let dir = tempfile::tempdir().unwrap();
        write_procfile(dir.path(), "web: true\n");
        std::fs::write(dir.path().join("portside.json"), "{ not json").unwrap();
        let router = held_port();

        let code = run_to_completion(run_options(dir.path(), &router), std::future::pending()).await;
        assert_eq!(code, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_port_exhaustion_exits_1() {
        let dir = tempfile::tempdir().unwrap();
        write_procfile(dir.path(), "web: sleep 30\n");
        let project = config::project_name(dir.path());
        std::fs::write(
            dir.path().join("portside.json"),
            format!(r#"{{"{}": {{"routes": {{"web": "app.test"}}}}}}"#, project),
        )
        .unwrap();
        let router = held_port();

        let mut options = run_options(dir.path(), &router);
        options.allocate_port = || Err(PortError::Exhausted { attempts: 101 });

        let code = run_to_completion(options, std::future::pending()).await;
        assert_eq!(code, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_exits_0_on_shutdown_after_processes_finish() {
        let dir = tempfile::tempdir().unwrap();
        write_procfile(dir.path(), "ok: true\nfail: sh -c 'exit 2'\n");
        let router = held_port();

        let shutdown = tokio::time::sleep(std::time::Duration::from_millis(500));
        let code = run_to_completion(run_options(dir.path(), &router), shutdown).await;
        assert_eq!(code, 0);
    }
}
