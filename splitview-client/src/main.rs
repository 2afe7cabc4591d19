use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use clap::Parser;
use splitview_client::{
    FileTabStorage, PageLocation, RuntimeConfig, SystemClock, TabCommand, TabEvent,
    TabIdentityStore, TabRuntime,
    config::validate_relay_url,
    shell::{HELP, ShellInput, parse_line},
    store::RelayStore,
};
use splitview_core::{MIME_TEXT_PLAIN, generate_id, profile_id_from_name};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{mpsc, oneshot},
};
use tracing::{error, info};
use tracing_subscriber::fmt::MakeWriter;

#[derive(Parser, Debug, Clone)]
#[command(name = "splitview-tab")]
struct TabArgs {
    #[arg(long, default_value = "ws://127.0.0.1:8787/ws")]
    relay_url: String,
    /// Tabs of the same profile can pair with each other.
    #[arg(long, default_value = "default")]
    profile: String,
    #[arg(long, default_value = ".splitview")]
    state_dir: PathBuf,
    /// Names this tab's storage; reuse it to simulate a reload.
    #[arg(long, default_value = "tab-1")]
    tab: String,
    #[arg(long, default_value = "about:blank")]
    url: String,
    #[arg(long, default_value_t = 2_000)]
    heartbeat_ms: u64,
    #[arg(long, default_value_t = 5_000)]
    freshness_ms: u64,
    #[arg(long, default_value_t = 500)]
    poll_ms: u64,
    #[arg(long, default_value_t = 3_000)]
    pair_request_window_ms: u64,
    #[arg(long)]
    auto_bind: bool,
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl TabArgs {
    fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
            freshness_window: Duration::from_millis(self.freshness_ms),
            poll_interval: Duration::from_millis(self.poll_ms),
            pair_request_window: Duration::from_millis(self.pair_request_window_ms),
            auto_bind_new_tabs: self.auto_bind,
            ..RuntimeConfig::default()
        }
    }
}

#[derive(Clone)]
struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

/// Logs go to stderr unless a file is given, keeping stdout for events.
fn init_logging(log_file: Option<&PathBuf>) {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();

    let Some(log_path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .init();
        return;
    };

    let file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(io::stderr)
                .init();
            return;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(FileMakeWriter {
            file: Arc::new(Mutex::new(file)),
        })
        .init();
}

fn print_event(event: &TabEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(err) => error!("failed to encode event: {}", err),
    }
}

#[tokio::main]
async fn main() {
    let args = TabArgs::parse();
    init_logging(args.log_file.as_ref());

    if let Err(err) = validate_relay_url(&args.relay_url) {
        error!("{}", err);
        std::process::exit(2);
    }
    let config = args.runtime_config();
    if let Err(err) = config.validate() {
        error!("invalid timing options: {}", err);
        std::process::exit(2);
    }

    let profile_id = profile_id_from_name(&args.profile);
    let client_id = format!("{}-{}", args.tab, generate_id());
    let (store, relay_tasks) =
        match RelayStore::connect(&args.relay_url, &profile_id, &client_id).await {
            Ok(connected) => connected,
            Err(err) => {
                error!("{}", err);
                std::process::exit(1);
            }
        };

    let tab_dir = args.state_dir.join(&args.tab);
    let identity = TabIdentityStore::open(
        Box::new(FileTabStorage::new(tab_dir.join("window_name.json"))),
        Box::new(FileTabStorage::new(tab_dir.join("session.json"))),
        store.clone(),
    );

    let (runtime, mut events_rx) = TabRuntime::boot(
        store,
        Arc::new(SystemClock),
        identity,
        PageLocation::new(args.url.clone()),
        config,
    );
    info!(
        tab = %args.tab,
        tab_id = %runtime.tab_id(),
        role = %runtime.state().role,
        "tab ready"
    );

    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            print_event(&event);
        }
    });

    let (command_tx, command_rx) = mpsc::unbounded_channel::<TabCommand>();
    let runtime_task = tokio::spawn(runtime.run(command_rx));

    tokio::select! {
        _ = read_commands(command_tx.clone()) => {}
        _ = relay_tasks.closed() => error!("relay connection lost"),
    }

    let _ = command_tx.send(TabCommand::Shutdown);
    let _ = runtime_task.await;
    printer.abort();
}

async fn read_commands(command_tx: mpsc::UnboundedSender<TabCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                error!("stdin read failed: {}", err);
                break;
            }
        };

        let input = match parse_line(&line) {
            Ok(Some(input)) => input,
            Ok(None) => continue,
            Err(err) => {
                eprintln!("{err}");
                continue;
            }
        };

        let command = match input {
            ShellInput::Command(command) => command,
            ShellInput::Help => {
                println!("{HELP}");
                continue;
            }
            ShellInput::Quit => break,
            ShellInput::Drag => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if command_tx.send(TabCommand::StartDrag(reply_tx)).is_err() {
                    break;
                }
                match reply_rx.await {
                    Ok(Some(data)) => match data.get(MIME_TEXT_PLAIN) {
                        Some(text) => println!("{text}"),
                        None => eprintln!("drag payload has no text form"),
                    },
                    Ok(None) => eprintln!("only a paired tab can be dragged"),
                    Err(_) => break,
                }
                continue;
            }
            ShellInput::Status => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if command_tx.send(TabCommand::Status(reply_tx)).is_err() {
                    break;
                }
                match reply_rx.await {
                    Ok(state) => println!(
                        "role={} pair={} last_seq={} muted={}",
                        state.role,
                        state.pair_id.as_deref().unwrap_or("-"),
                        state.last_applied_seq,
                        state.muted
                    ),
                    Err(_) => break,
                }
                continue;
            }
        };

        if command_tx.send(command).is_err() {
            break;
        }
    }
}
