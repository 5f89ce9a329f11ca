use std::{
    fs::{File, OpenOptions},
    io::{self, IsTerminal, Write},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{Arc, Mutex},
};

use clap::Parser;
use naragaiden_client::{
    clock::{Clock, SystemClock},
    config::{self, ConfigOverrides},
    fetch::HttpFetcher,
    launch::{FallbackLauncher, LaunchArmer, LaunchTargets, SystemOpener},
    refresh::{RefreshCoordinator, RefreshOutcome, WidgetEvent},
    render::{Screen, render_text},
    store::{FileStore, SnapshotStore},
};
use tokio::{
    sync::mpsc,
    time::{Instant, interval, interval_at},
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::fmt::MakeWriter;

#[derive(Parser, Debug, Clone)]
#[command(name = "nara-gaiden")]
struct ClientArgs {
    /// Payload endpoint, e.g. http://192.168.2.1:8888/json.
    #[arg(long)]
    server_url: Option<String>,
    /// Seconds between network refreshes.
    #[arg(long)]
    refresh_secs: Option<u64>,
    /// Seconds between repaints from cache.
    #[arg(long)]
    tick_secs: Option<u64>,
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Refresh once, print the result and exit.
    #[arg(long, default_value_t = false)]
    once: bool,
    /// Register one tap on the open-app button and exit.
    #[arg(long, default_value_t = false)]
    tap: bool,
    /// Persist the effective settings to config.json.
    #[arg(long, default_value_t = false)]
    save_config: bool,
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

#[tokio::main]
async fn main() -> ExitCode {
    let args = ClientArgs::parse();

    let dir = config::data_dir(args.data_dir.as_deref());
    if let Err(err) = std::fs::create_dir_all(&dir) {
        eprintln!("failed to create data dir {}: {err}", dir.display());
        return ExitCode::FAILURE;
    }
    init_logging(&config::log_path(&dir));

    let overrides = ConfigOverrides {
        server_url: args.server_url.clone(),
        refresh_secs: args.refresh_secs,
        tick_secs: args.tick_secs,
    };
    let config_path = config::config_path(&dir);
    let cfg = match config::resolve_config(&config_path, &overrides) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    if args.save_config {
        if let Err(err) = config::save_config(&config_path, &cfg) {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
        info!(path = %config_path.display(), "config saved");
    }

    info!(
        server_url = %cfg.server_url,
        refresh_secs = cfg.refresh_secs,
        tick_secs = cfg.tick_secs,
        data_dir = %dir.display(),
        "client starting"
    );

    let fetcher = match HttpFetcher::new(&cfg.server_url) {
        Ok(fetcher) => fetcher,
        Err(err) => {
            error!("{err}");
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let store = Arc::new(SnapshotStore::new(FileStore::new(config::state_path(&dir))));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let interactive = !args.once && !args.tap;
    let ansi = io::stdout().is_terminal();
    let render_task = tokio::spawn(render_loop(events_rx, interactive && ansi, ansi));

    let coordinator = Arc::new(RefreshCoordinator::new(
        Arc::new(fetcher),
        Arc::clone(&store),
        Arc::clone(&clock),
        events_tx.clone(),
    ));

    let exit = if args.tap {
        let armer = LaunchArmer::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::new(FallbackLauncher::new(SystemOpener)),
            LaunchTargets::default(),
            events_tx.clone(),
        );
        let _ = events_tx.send(WidgetEvent::Render(coordinator.cached_view()));
        armer.tap();
        ExitCode::SUCCESS
    } else if args.once {
        match coordinator.refresh().await {
            RefreshOutcome::Failure(_) => ExitCode::FAILURE,
            RefreshOutcome::Success | RefreshOutcome::Skipped => ExitCode::SUCCESS,
        }
    } else {
        run_loop(&coordinator, &cfg).await;
        ExitCode::SUCCESS
    };

    drop(coordinator);
    drop(events_tx);
    if let Err(err) = render_task.await {
        warn!("render task ended abnormally: {}", err);
    }
    exit
}

async fn run_loop(coordinator: &Arc<RefreshCoordinator>, cfg: &config::ClientConfig) {
    coordinator.publish_cached();

    let mut refresh_timer = interval(cfg.refresh_interval());
    let tick_every = cfg.tick_interval();
    let mut tick_timer = interval_at(Instant::now() + tick_every, tick_every);

    loop {
        tokio::select! {
            _ = refresh_timer.tick() => {
                let _ = coordinator.spawn_refresh();
            }
            _ = tick_timer.tick() => {
                if !coordinator.is_refreshing() {
                    coordinator.publish_cached();
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    warn!("ctrl-c handler failed: {}", err);
                }
                info!("shutting down");
                break;
            }
        }
    }
}

async fn render_loop(mut events: mpsc::UnboundedReceiver<WidgetEvent>, clear: bool, ansi: bool) {
    let mut screen = Screen::default();
    while let Some(event) = events.recv().await {
        match event {
            WidgetEvent::Render(view) => screen.show(view),
            WidgetEvent::Prompt(status) => screen.set_status(status),
            WidgetEvent::DataChanged => {
                debug!("widget data changed");
                continue;
            }
        }

        let Some(view) = screen.view() else {
            continue;
        };
        let mut stdout = io::stdout().lock();
        if clear {
            let _ = write!(stdout, "\x1b[2J\x1b[H");
        }
        let _ = write!(stdout, "{}", render_text(view, ansi));
        let _ = stdout.flush();
    }
}

fn init_logging(log_path: &Path) {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();

    if let Some(dir) = log_path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
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

    let make_writer = FileMakeWriter {
        file: Arc::new(Mutex::new(file)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(make_writer)
        .with_ansi(false)
        .init();
}
