mod cache;
mod config;
mod error;
mod event;
mod net;
mod registration;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use cache::{CacheStorage, Request, SqliteStorage};
use event::{Event, EventOutcome, Message};
use net::HttpNetwork;
use registration::{InstallOutcome, Registration};

#[derive(Parser, Debug)]
#[command(name = "swcache")]
#[command(about = "Offline cache worker for a static site")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./swcache.yaml or $XDG_CONFIG_HOME/swcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  /// Debug logging
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the configured version (activates at once if nothing is active)
  Install,
  /// Let the waiting version take over
  Activate,
  /// Request one or more URLs through the active worker
  Fetch {
    /// Absolute URLs or paths relative to the origin
    #[arg(required = true)]
    targets: Vec<String>,
    /// Treat the requests as page navigations
    #[arg(short, long)]
    navigate: bool,
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// Write the response body here (single target only)
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Post a control message, e.g. '{"action":"skip-waiting"}'
  Message { json: String },
  /// List cache stores, or the entries of one
  Caches {
    /// Cache to list entries of
    name: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.verbose, args.log_file.as_deref())?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let worker_config = config.worker()?;

  let storage = Arc::new(SqliteStorage::open(&config.database_path()?)?);
  let network = Arc::new(HttpNetwork::new()?);
  let registration = Registration::load(worker_config.clone(), storage, network)?;

  match args.command {
    Command::Install => {
      match registration.dispatch(Event::Install).await? {
        EventOutcome::Installed(InstallOutcome::AlreadyActive(v)) => {
          println!("version {} is already active", v)
        }
        EventOutcome::Installed(InstallOutcome::Waiting(v)) => println!(
          "version {} installed and waiting (active: {})",
          v,
          describe(registration.active().await)
        ),
        EventOutcome::Installed(InstallOutcome::Activated(a)) => {
          println!("version {} installed and activated", a.version)
        }
        _ => {}
      }
    }
    Command::Activate => {
      if let EventOutcome::Activated(activation) = registration.dispatch(Event::Activate).await? {
        match activation {
          Some(a) => print_activation(a.version, &a.deleted),
          None => println!("no waiting version"),
        }
      }
    }
    Command::Fetch {
      targets,
      navigate,
      method,
      output,
    } => {
      if output.is_some() && targets.len() > 1 {
        return Err(eyre!("--output needs exactly one target"));
      }

      let requests = targets
        .iter()
        .map(|t| {
          let url = worker_config
            .origin
            .join(t)
            .map_err(|e| eyre!("Invalid target '{}': {}", t, e))?;
          Ok(build_request(url, navigate, &method))
        })
        .collect::<Result<Vec<_>>>()?;

      // Independent requests, intercepted concurrently
      let results = futures::future::join_all(
        requests
          .iter()
          .map(|r| registration.dispatch(Event::Fetch(r.clone()))),
      )
      .await;

      let mut pending = Vec::new();
      let mut failed = 0;
      for (request, result) in requests.iter().zip(results) {
        match result {
          Ok(EventOutcome::Fetched(mut result)) => {
            let age = result
              .cached_at
              .map(|t| format!(", cached {}", t.format("%Y-%m-%d %H:%M:%S")))
              .unwrap_or_default();
            println!(
              "{:<8} {} {} ({} bytes, {}{})",
              result.source.as_str(),
              result.response.status,
              request.url,
              result.response.body.len(),
              result.response.header("content-type").unwrap_or("no content type"),
              age
            );
            if let Some(path) = &output {
              std::fs::write(path, &result.response.body)
                .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;
            }
            pending.extend(result.revalidation.take());
          }
          Ok(_) => {}
          Err(e) => {
            failed += 1;
            println!("{:<8} {} ({})", "error", request.url, e);
          }
        }
      }

      // Keep running until background cache updates are written
      futures::future::join_all(pending.into_iter().map(|r| r.wait())).await;

      if failed > 0 {
        return Err(eyre!("{} of {} requests failed", failed, requests.len()));
      }
    }
    Command::Message { json } => {
      let message = Message::parse(&json)?;
      if let EventOutcome::Message {
        handled,
        activation,
      } = registration.dispatch(Event::Message(message)).await?
      {
        if !handled {
          println!("message ignored");
        }
        if let Some(a) = activation {
          print_activation(a.version, &a.deleted);
        }
      }
    }
    Command::Caches { name: Some(name) } => {
      let storage = registration.storage();
      if !storage.has(&name)? {
        return Err(eyre!("No cache named '{}'", name));
      }
      for request in storage.keys(&name)? {
        println!("{} {}", request.method, request.url);
      }
    }
    Command::Caches { name: None } => {
      let live = registration.live_caches().await?;
      let storage = registration.storage();
      println!(
        "active: {}  waiting: {}",
        describe(registration.active().await),
        describe(registration.waiting().await)
      );
      for name in storage.cache_names()? {
        let marker = if live.contains(&name) { "*" } else { " " };
        println!("{} {:<24} {} entries", marker, name, storage.len(&name)?);
      }
    }
  }

  Ok(())
}

fn build_request(url: Url, navigate: bool, method: &str) -> Request {
  let request = if navigate {
    Request::navigate(url)
  } else {
    Request::get(url)
  };
  request.with_method(method)
}

fn describe(version: Option<u32>) -> String {
  version
    .map(|v| format!("v{}", v))
    .unwrap_or_else(|| "none".to_string())
}

fn print_activation(version: u32, deleted: &[String]) {
  println!("version {} activated", version);
  for name in deleted {
    println!("  deleted cache {}", name);
  }
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = if verbose {
    EnvFilter::new("debug")
  } else {
    EnvFilter::from_default_env().add_directive(Level::WARN.into())
  };

  match log_file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      let appender = tracing_appender::rolling::never(dir, name);
      let (writer, guard) = tracing_appender::non_blocking(appender);

      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(filter)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
      Ok(None)
    }
  }
}
