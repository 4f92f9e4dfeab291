mod app;
mod attachment;
mod cache;
mod clock;
mod config;
mod db;
mod net;
mod queue;
mod subscription;
mod worker;

use app::Command;
use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "relay-sw")]
#[command(about = "Offline cache, message queue and push relay for a chat app")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./relay-sw.yaml, then $XDG_CONFIG_HOME/relay-sw/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
  /// Install and activate the current cache version
  Start,
  /// Send a request through the worker
  Fetch {
    /// Absolute URL or a path on the origin
    url: String,
    #[arg(short, long, default_value = "GET")]
    method: String,
  },
  /// List cache versions
  Versions,
  /// Inspect or edit the offline message queue
  #[command(subcommand)]
  Queue(QueueCommand),
  /// Replay deferred messages
  Sync {
    #[arg(long)]
    tag: Option<String>,
  },
  /// Deliver a push payload, optionally clicking the resulting notification
  Push {
    payload: Option<String>,
    /// Click the notification, with an optional action (e.g. dismiss)
    #[arg(long, num_args = 0..=1, default_missing_value = "open")]
    click: Option<String>,
  },
  /// Show a new-message notification
  Notify {
    #[arg(long)]
    sender: Option<String>,
    #[arg(long)]
    text: Option<String>,
  },
  /// Activate a waiting version now
  SkipWaiting,
  /// Ask for notification permission
  Permission,
  /// Subscribe to push
  Subscribe {
    /// Server key, URL-safe base64 (default: $RELAY_SW_SERVER_KEY)
    #[arg(short, long)]
    key: Option<String>,
  },
  /// Drop the push subscription
  Unsubscribe,
  /// Print the push subscription
  Subscription,
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// Queue a message for the next sync
  Add {
    text: String,
    /// Attach a file (repeatable)
    #[arg(long = "attach")]
    attach: Vec<PathBuf>,
  },
  List,
  Clear,
}

impl From<CliCommand> for Command {
  fn from(command: CliCommand) -> Self {
    match command {
      CliCommand::Start => Command::Start,
      CliCommand::Fetch { url, method } => Command::Fetch { url, method },
      CliCommand::Versions => Command::Versions,
      CliCommand::Queue(QueueCommand::Add { text, attach }) => Command::QueueAdd { text, attach },
      CliCommand::Queue(QueueCommand::List) => Command::QueueList,
      CliCommand::Queue(QueueCommand::Clear) => Command::QueueClear,
      CliCommand::Sync { tag } => Command::Sync { tag },
      CliCommand::Push { payload, click } => Command::Push { payload, click },
      CliCommand::Notify { sender, text } => Command::Notify { sender, text },
      CliCommand::SkipWaiting => Command::SkipWaiting,
      CliCommand::Permission => Command::Permission,
      CliCommand::Subscribe { key } => Command::Subscribe { key },
      CliCommand::Unsubscribe => Command::Unsubscribe,
      CliCommand::Subscription => Command::Subscription,
    }
  }
}

/// Log to a daily file in the data directory, and to stderr with `--verbose`.
fn init_logging(verbose: bool) -> Result<WorkerGuard> {
  let dir = dirs::data_dir()
    .unwrap_or_else(|| PathBuf::from("."))
    .join("relay-sw");
  std::fs::create_dir_all(&dir)?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
    &dir,
    "relay-sw.log",
  ));
  let filter = EnvFilter::try_from_env("RELAY_SW_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(verbose.then(|| fmt::layer().with_writer(std::io::stderr)))
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.verbose)?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  tracing::info!(origin = %config.origin, version = %config.cache_version(), "starting");

  let app = app::App::new(config).await?;
  app.run(args.command.into()).await?;

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cli_parses_click_without_action() {
    let args = Args::try_parse_from(["relay-sw", "push", "{}", "--click"]).unwrap();
    match Command::from(args.command) {
      Command::Push { payload, click } => {
        assert_eq!(payload.as_deref(), Some("{}"));
        assert_eq!(click.as_deref(), Some("open"));
      }
      other => panic!("unexpected command {:?}", other),
    }
  }

  #[test]
  fn test_cli_parses_queue_attachments() {
    let args = Args::try_parse_from([
      "relay-sw", "queue", "add", "hello", "--attach", "a.png", "--attach", "b.pdf",
    ])
    .unwrap();
    match Command::from(args.command) {
      Command::QueueAdd { text, attach } => {
        assert_eq!(text, "hello");
        assert_eq!(attach.len(), 2);
      }
      other => panic!("unexpected command {:?}", other),
    }
  }

  #[test]
  fn test_args_are_consistent() {
    use clap::CommandFactory;
    Args::command().debug_assert();
  }
}
