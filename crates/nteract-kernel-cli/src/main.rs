use anyhow::{bail, Context};
use clap::Parser;
use nteract_kernels::{
	DirectoryCatalog, KernelConfig, KernelManager, KernelRef, KernelspecCatalog, LifecycleNotification, LogSettings,
	Notification, RemoteServerConfig,
};
use nteract_messaging::{child_of, execute_request, execution_state, Channel, ExecuteOptions, ExecutionState};
use serde_json::Value;
use std::{
	env,
	fs::{File, OpenOptions},
	io::{self, Write},
	path::{Path, PathBuf},
	sync::{Arc, Mutex as StdMutex},
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::MakeWriter, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "nteract-kernel", about = "Launch a Jupyter kernel and follow its lifecycle")]
struct Args {
	/// Kernelspec name to launch.
	#[arg(long, default_value = "python3")]
	kernel: String,
	/// Working directory for the kernel. Defaults to the current directory.
	#[arg(long, default_value = "")]
	cwd: String,
	/// Code to execute once the kernel is ready; the kernel is shut down afterwards.
	#[arg(long)]
	code: Option<String>,
	/// Start the kernel on a Jupyter server instead of locally.
	#[arg(long)]
	remote: bool,
	#[arg(long, default_value = "")]
	server_url: String,
	#[arg(long, default_value = "")]
	token: String,
	#[arg(long, default_value = "")]
	runtime_dir: String,
	#[arg(long, default_value = "")]
	log_dir: String,
	/// List installed kernelspecs and exit.
	#[arg(long)]
	list: bool,
}

/// Tracing output of this process: stderr, a per-run log file, or both.
#[derive(Clone)]
struct LogSink {
	stderr: bool,
	file: Option<Arc<StdMutex<File>>>,
}

#[tokio::main]
async fn main() {
	let args = Args::parse();
	let config = load_config(&args);
	let settings = log_settings(&args, config.as_ref().map(|config| &config.log));
	init_logging(&settings, &args.kernel);

	let result = match config {
		Ok(config) => run(args, config).await,
		Err(err) => Err(err),
	};
	let exit_code = match result {
		Ok(code) => code,
		Err(err) => {
			error!(event = "cli_failed", error = %format!("{err:#}"));
			eprintln!("error: {err:#}");
			1
		}
	};
	std::process::exit(exit_code);
}

async fn run(args: Args, config: KernelConfig) -> anyhow::Result<i32> {
	let catalog = Arc::new(DirectoryCatalog::new(config.kernelspec_dirs.clone()));

	if args.list {
		for spec in catalog.list().await? {
			println!("{:<20} {:<12} {}", spec.name, spec.language, spec.display_name);
		}
		return Ok(0);
	}

	let cwd = resolve_cwd(&args.cwd);
	let (manager, mut notifications) = KernelManager::new(config, catalog);
	let kernel_ref = KernelRef::new();
	info!(event = "cli_launch", kernel_ref = %kernel_ref, kernel = %args.kernel, remote = args.remote);
	if args.remote {
		manager.launch_remote(kernel_ref, &args.kernel, &cwd);
	} else {
		manager.launch_by_name(kernel_ref, &args.kernel, &cwd);
	}

	let mut exit_code = 0;
	loop {
		tokio::select! {
			notification = notifications.recv() => {
				let Some(notification) = notification else {
					break;
				};
				print_notification(&notification);
				match &notification.event {
					LifecycleNotification::KernelInfoReceived(_) => {
						let Some(code) = args.code.as_deref() else {
							continue;
						};
						tokio::select! {
							result = run_code(&manager, kernel_ref, code) => {
								if let Err(err) = result {
									warn!(event = "cli_execute_failed", error = %format!("{err:#}"));
									exit_code = 1;
								}
							}
							_ = tokio::signal::ctrl_c() => info!(event = "cli_interrupted"),
						}
						break;
					}
					LifecycleNotification::LaunchFailed(_) | LifecycleNotification::KernelInfoFailed(_) => {
						exit_code = 1;
						break;
					}
					LifecycleNotification::StatusChanged(status) if status.is_terminal() => {
						exit_code = 1;
						break;
					}
					_ => {}
				}
			}
			_ = tokio::signal::ctrl_c() => {
				info!(event = "cli_interrupted");
				break;
			}
		}
	}

	manager.shutdown_all().await;
	while let Ok(notification) = notifications.try_recv() {
		print_notification(&notification);
	}
	Ok(exit_code)
}

fn load_config(args: &Args) -> anyhow::Result<KernelConfig> {
	let mut config = KernelConfig::from_env().context("invalid kernel environment")?;
	if !args.runtime_dir.trim().is_empty() {
		config = config.with_runtime_dir(&args.runtime_dir);
	}
	if !args.server_url.trim().is_empty() {
		let token = resolve_token(&args.token, &config);
		let server = RemoteServerConfig::new(&args.server_url, token).context("invalid --server-url")?;
		config = config.with_server(server);
	} else if !args.token.trim().is_empty() {
		match config.server.take() {
			Some(server) => {
				let server = RemoteServerConfig::new(server.base_url.as_str(), Some(args.token.clone()))?;
				config = config.with_server(server);
			}
			None => bail!("--token needs --server-url or NTERACT_SERVER_URL"),
		}
	}
	if args.remote && config.server.is_none() {
		bail!("--remote needs --server-url or NTERACT_SERVER_URL");
	}
	Ok(config)
}

/// Executes `code` and echoes its output until the kernel goes idle again.
async fn run_code(manager: &KernelManager, kernel_ref: KernelRef, code: &str) -> anyhow::Result<()> {
	let mut iopub = manager
		.subscribe(kernel_ref, Channel::Iopub)
		.await
		.context("kernel has no live session")?;
	let request = execute_request(code, &ExecuteOptions::default());
	let is_child = child_of(&request);
	manager.send(kernel_ref, request).await?;

	while let Some(message) = iopub.recv().await {
		if !is_child(&message) {
			continue;
		}
		match message.msg_type() {
			"stream" => {
				let text = message.content.get("text").and_then(Value::as_str).unwrap_or_default();
				if message.content.get("name").and_then(Value::as_str) == Some("stderr") {
					eprint!("{text}");
				} else {
					print!("{text}");
				}
			}
			"execute_result" | "display_data" => {
				if let Some(text) = message.content.pointer("/data/text~1plain").and_then(Value::as_str) {
					println!("{text}");
				}
			}
			"error" => {
				let ename = message.content.get("ename").and_then(Value::as_str).unwrap_or("Error");
				let evalue = message.content.get("evalue").and_then(Value::as_str).unwrap_or_default();
				eprintln!("{ename}: {evalue}");
			}
			_ => {
				if execution_state(&message) == Some(ExecutionState::Idle) {
					let _ = io::stdout().flush();
					return Ok(());
				}
			}
		}
	}
	bail!("kernel channels closed before execution finished")
}

fn print_notification(notification: &Notification) {
	let at = notification.at.format("%H:%M:%S%.3f");
	let detail = match &notification.event {
		LifecycleNotification::Launched(summary) => {
			let location = summary
				.connection_file
				.as_ref()
				.map(|path| path.display().to_string())
				.or_else(|| summary.remote_id.clone())
				.unwrap_or_default();
			format!("{} via {} ({location})", summary.kernelspec_name, summary.transport)
		}
		LifecycleNotification::KernelInfoReceived(info) => format!("{} {}", info.name, info.version),
		LifecycleNotification::StatusChanged(status) => status.to_string(),
		LifecycleNotification::Stdout(text) | LifecycleNotification::Stderr(text) => text.trim_end().to_string(),
		LifecycleNotification::ShutdownReplySucceeded(content) => content.to_string(),
		LifecycleNotification::ConnectionFileDeleted(path) => path.display().to_string(),
		LifecycleNotification::RestartSucceeded { clear_outputs } => format!("clear_outputs={clear_outputs}"),
		LifecycleNotification::KernelInfoFailed(err) => err.to_string(),
		LifecycleNotification::LaunchFailed(err) => err.to_string(),
		LifecycleNotification::InterruptFailed(err) => err.to_string(),
		LifecycleNotification::KillFailed(err) => err.to_string(),
		LifecycleNotification::ShutdownReplyTimedOut(err) => err.to_string(),
		LifecycleNotification::ConnectionFileDeleteFailed(err) => err.to_string(),
		LifecycleNotification::RestartFailed(err) => err.to_string(),
		LifecycleNotification::InterruptSucceeded | LifecycleNotification::KillSucceeded => String::new(),
	};
	eprintln!("[{at}] {} {} {detail}", notification.kernel_ref, notification.event.name());
}

/// Log settings from the environment, with `--log-dir` taking precedence.
/// An invalid configuration still gets the default level.
fn log_settings(args: &Args, resolved: Result<&LogSettings, &anyhow::Error>) -> LogSettings {
	let mut settings = resolved.cloned().unwrap_or_default();
	if !args.log_dir.trim().is_empty() {
		settings.dir = Some(PathBuf::from(&args.log_dir));
	}
	settings
}

fn init_logging(settings: &LogSettings, kernel: &str) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));
	let file = settings.dir.as_deref().and_then(|dir| match open_log_file(dir, kernel) {
		Ok(file) => Some(Arc::new(StdMutex::new(file))),
		Err(err) => {
			eprintln!("log file unavailable in {}: {err}", dir.display());
			None
		}
	});
	let sink = LogSink {
		stderr: settings.writes_stderr(file.is_some()),
		file,
	};
	let subscriber = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_ansi(sink.file.is_none())
		.with_writer(sink)
		.finish();
	let _ = tracing::subscriber::set_global_default(subscriber);
}

fn open_log_file(dir: &Path, kernel: &str) -> io::Result<File> {
	std::fs::create_dir_all(dir)?;
	let path = dir.join(log_file_name(kernel, std::process::id()));
	OpenOptions::new().create(true).append(true).open(path)
}

fn log_file_name(kernel: &str, pid: u32) -> String {
	let kernel: String = kernel
		.chars()
		.map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
		.collect();
	format!("nteract-kernel-{kernel}-{pid}.log")
}

impl<'a> MakeWriter<'a> for LogSink {
	type Writer = LogSink;

	fn make_writer(&'a self) -> Self::Writer {
		self.clone()
	}
}

impl Write for LogSink {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		if self.stderr {
			let _ = io::stderr().write_all(buf);
		}
		if let Some(file) = &self.file {
			let mut file = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
			file.write_all(buf)?;
		}
		Ok(buf.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		if self.stderr {
			let _ = io::stderr().flush();
		}
		match &self.file {
			Some(file) => file.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).flush(),
			None => Ok(()),
		}
	}
}

fn resolve_cwd(flag: &str) -> PathBuf {
	if !flag.trim().is_empty() {
		return PathBuf::from(flag);
	}
	env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn resolve_token(flag: &str, config: &KernelConfig) -> Option<String> {
	if !flag.trim().is_empty() {
		return Some(flag.to_string());
	}
	config.server.as_ref().and_then(|server| server.token.clone())
}
