use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use offline_engine::engine::{ControlMessage, Engine, MessageOutcome};
use offline_engine::network::{Request, Served};
use offline_engine::event::{self, HostLine, Trigger};
use offline_engine::sync::{DrainReport, Notification};
use offline_engine::{logging, Config};
use reqwest::Method;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "offline-engine")]
#[command(about = "Offline-first request routing, caching, and sync")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-engine/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin to front, overriding the config file
  #[arg(short, long)]
  origin: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the app shell, then activate
  Install {
    /// Activate without precaching
    #[arg(long)]
    skip: bool,
  },
  /// Route one request and print what was served
  Fetch {
    /// Absolute URL or path relative to the origin
    target: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Treat as a document navigation
    #[arg(long)]
    navigate: bool,
    /// JSON body (sent as a POST unless --method is given)
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Store a JSON record locally and queue it for sync
  Enqueue { partition: String, record: String },
  /// Print pending sync operations
  Queue,
  /// Fire the background sync trigger
  Sync {
    #[arg(long)]
    tag: Option<String>,
  },
  /// Deliver a push payload and print the resulting notification
  Push { payload: String },
  /// Delete every partition
  ClearCache,
  /// Fetch URLs into the dynamic partition
  CacheUrls {
    #[arg(required = true)]
    urls: Vec<String>,
  },
  /// Remove expired cache entries
  Sweep,
  /// Read control messages and triggers as JSON lines from stdin
  Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override origin if specified on command line
  let config = if let Some(origin) = args.origin {
    Config { origin, ..config }
  } else {
    config
  };
  config.origin_url()?;

  let _guard = logging::init(&config.log.level, config.log.directory.as_deref());

  let engine = Engine::open(&config).await?;
  run(&config, engine, args.command).await
}

async fn run(config: &Config, mut engine: Engine, command: Command) -> Result<()> {
  match command {
    Command::Install { skip } => {
      if skip {
        engine.skip_install().await?;
      } else {
        let assets = engine.install().await?;
        println!("precached {assets} assets");
      }
      let removed = engine.activate().await?;
      for name in removed {
        println!("removed partition {name}");
      }
      println!("active");
    }
    Command::Fetch {
      target,
      method,
      navigate,
      data,
    } => {
      let url = config.origin_url()?.join(&target)?;
      let request = match data {
        Some(body) => {
          let body: serde_json::Value = serde_json::from_str(&body)?;
          let mut request = Request::post_json(url, &body);
          if method != "GET" {
            request.method = parse_method(&method)?;
          }
          request
        }
        None if navigate => Request::navigate(url),
        None => Request::new(parse_method(&method)?, url),
      };
      let served = engine.fetch(request).await?;
      print_served(served).await;
    }
    Command::Enqueue { partition, record } => {
      let record: serde_json::Value = serde_json::from_str(&record)?;
      let key = engine.save_for_sync(&partition, record).await?;
      println!("queued {partition}/{key}");
    }
    Command::Queue => {
      let queue = engine.queue().get_sync_queue().await?;
      println!("{}", serde_json::to_string_pretty(&queue)?);
    }
    Command::Sync { tag } => {
      let tag = tag.unwrap_or_else(|| config.sync.tag.clone());
      print_drain(&tag, engine.on_sync(&tag).await?);
    }
    Command::Push { payload } => {
      print_notification(&engine.on_push(payload.as_bytes()));
    }
    Command::ClearCache => {
      let outcome = engine.handle_message(ControlMessage::ClearCache).await?;
      print_outcome(&outcome);
    }
    Command::CacheUrls { urls } => {
      let outcome = engine.handle_message(ControlMessage::CacheUrls { urls }).await?;
      print_outcome(&outcome);
    }
    Command::Sweep => {
      let removed = engine.cache().sweep_expired().await?;
      println!("removed {removed} expired entries");
    }
    Command::Serve => serve(config, engine).await?,
  }

  Ok(())
}

/// Long-running host. Each stdin line is one JSON object: a control
/// message (`CLEAR_CACHE`, `CACHE_URLS`) or a trigger (`SYNC` with an
/// optional `tag`, `PUSH` with a `payload`).
async fn serve(config: &Config, engine: Engine) -> Result<()> {
  let sweeper = engine.spawn_sweeper();
  let (handle, task) = event::spawn(engine);

  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  info!("serving host messages on stdin");
  while let Some(line) = lines.next_line().await? {
    if line.trim().is_empty() {
      continue;
    }
    let result = match HostLine::parse(line.as_bytes()) {
      Ok(HostLine::Control(message)) => handle.message(message).await.map(|o| print_outcome(&o)),
      Ok(HostLine::Trigger(Trigger::Sync { tag })) => {
        let tag = tag.unwrap_or_else(|| config.sync.tag.clone());
        handle.sync(&tag).await.map(|report| print_drain(&tag, report))
      }
      Ok(HostLine::Trigger(Trigger::Push { payload })) => {
        let bytes = serde_json::to_vec(&payload)?;
        handle.push(bytes).await.map(|n| print_notification(&n))
      }
      Err(e) => {
        warn!(error = %e, "ignoring malformed message");
        continue;
      }
    };
    if let Err(e) = result {
      warn!(error = %e, "message failed");
    }
  }

  drop(handle);
  task.await.map_err(|e| eyre!("event loop panicked: {e}"))?;
  if let Some(sweeper) = sweeper {
    sweeper.abort();
  }
  Ok(())
}

fn parse_method(method: &str) -> Result<Method> {
  Method::from_bytes(method.to_uppercase().as_bytes()).map_err(|e| eyre!("invalid method {method:?}: {e}"))
}

async fn print_served(mut served: Served) {
  println!("{} ({:?})", served.response.status, served.source);
  if let Some(at) = served.captured_at {
    println!("captured {}", at.to_rfc3339());
  }
  println!("{}", served.response.text());
  // Let a background refresh land before the process exits
  served.settle().await;
}

fn print_drain(tag: &str, report: Option<DrainReport>) {
  match report {
    Some(report) => println!(
      "delivered {} failed {} dropped {}",
      report.delivered, report.failed, report.dropped
    ),
    None => println!("tag {tag:?} ignored"),
  }
}

fn print_notification(notification: &Notification) {
  println!("{}: {} ({})", notification.title, notification.body, notification.url);
}

fn print_outcome(outcome: &MessageOutcome) {
  match outcome {
    MessageOutcome::Cleared { partitions } => println!("cleared {partitions} partitions"),
    MessageOutcome::Cached { cached, failed } => {
      println!("cached {cached}");
      for url in failed {
        println!("failed {url}");
      }
    }
  }
}
