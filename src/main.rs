use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use offcache::cache::{CacheStorage, Namespace, SqliteStorage};
use offcache::config::Config;
use offcache::engine::version::VersionManager;
use offcache::engine::{
  control, CacheEngine, ControlMessage, ManifestSource, Registration,
};
use offcache::net::{Destination, Fetcher, HttpFetcher, Request};
use reqwest::Method;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "offcache")]
#[command(about = "Offline-first request cache with versioned namespaces")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the configured version
  Install {
    /// Precache manifest (overrides the config file)
    #[arg(short, long)]
    manifest: Option<PathBuf>,
  },
  /// Route one request through the cache
  Get {
    /// Absolute URL or path relative to the origin
    url: String,
    #[arg(short, long, value_enum, default_value_t = Destination::Document)]
    destination: Destination,
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// Extra request header as `name: value` (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Request body; anything but GET goes straight to the network
    #[arg(long)]
    data: Option<String>,
  },
  /// List cache namespaces
  Namespaces {
    /// Also list every entry with its size and SHA-256
    #[arg(short, long)]
    entries: bool,
  },
  /// Delete namespaces of older versions
  Purge,
  /// Interactive host reading commands from stdin
  Shell,
}

/// Everything a command needs to build engines.
struct Host {
  config: Config,
  storage: Arc<dyn CacheStorage>,
  fetcher: Arc<dyn Fetcher>,
}

impl Host {
  fn new(config: Config) -> Result<Self> {
    let storage = match &config.database {
      Some(path) => SqliteStorage::open_at(path)?,
      None => SqliteStorage::open()?,
    };
    Ok(Self {
      config,
      storage: Arc::new(storage),
      fetcher: Arc::new(HttpFetcher::new()),
    })
  }

  fn engine(&self, version: &str) -> Result<CacheEngine> {
    CacheEngine::new(
      self.config.engine_config_for(version)?,
      self.storage.clone(),
      self.fetcher.clone(),
    )
  }

  fn manifest(&self, explicit: Option<PathBuf>) -> Result<ManifestSource> {
    explicit
      .or_else(|| self.config.manifest.clone())
      .map(ManifestSource::Path)
      .ok_or_else(|| eyre!("No precache manifest configured. Set `manifest` or pass --manifest."))
  }

  /// Take control with the configured version, installing it first when
  /// its namespace holds nothing yet.
  async fn start(&self, registration: &Registration) -> Result<()> {
    let engine = self.engine(&self.config.version)?;
    if engine.namespace().is_empty()? {
      let (_, report) = registration.register(engine, &self.manifest(None)?).await?;
      info!(stored = report.stored, failed = report.failed.len(), "Installed on first use");
    } else {
      registration.resume(engine)?;
    }
    Ok(())
  }

  fn request(&self, raw: &str, destination: Destination, method: &str) -> Result<Request> {
    let origin = Url::parse(&self.config.origin)
      .map_err(|e| eyre!("Invalid origin {}: {}", self.config.origin, e))?;
    let url = origin
      .join(raw)
      .map_err(|e| eyre!("Invalid URL {}: {}", raw, e))?;
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", method, e))?;
    Ok(Request::get(url, destination).with_method(method))
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_tracing(&config);
  debug!(version = %config.version, origin = %config.origin, "Configuration loaded");

  let host = Host::new(config)?;
  match args.command {
    Command::Install { manifest } => install(&host, manifest).await,
    Command::Get {
      url,
      destination,
      method,
      headers,
      data,
    } => {
      let mut request = host.request(&url, destination, &method)?;
      for raw in &headers {
        let (name, value) = raw
          .split_once(':')
          .ok_or_else(|| eyre!("Invalid header {}: expected `name: value`", raw))?;
        request = request.with_header(name.trim(), value.trim());
      }
      if let Some(data) = data {
        request = request.with_body(data.into_bytes());
      }
      get(&host, &request).await
    }
    Command::Namespaces { entries } => namespaces(&host, entries),
    Command::Purge => purge(&host),
    Command::Shell => shell(&host).await,
  }
}

/// Stderr logging, plus a daily rolling file when `log_dir` is set.
/// Development mode only raises the default verbosity.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
  let default_filter = if config.dev_mode {
    "offcache=debug"
  } else {
    "offcache=warn"
  };
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
  let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);

  match &config.log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "offcache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .init();
      None
    }
  }
}

async fn install(host: &Host, manifest: Option<PathBuf>) -> Result<()> {
  let registration = Registration::new(host.fetcher.clone());
  let engine = host.engine(&host.config.version)?;
  let (engine, report) = registration
    .register(engine, &host.manifest(manifest)?)
    .await?;

  println!(
    "Installed {} into {}: {} stored, {} failed",
    engine.version(),
    engine.namespace().name(),
    report.stored,
    report.failed.len()
  );
  for url in &report.failed {
    println!("  failed: {}", url);
  }
  Ok(())
}

async fn get(host: &Host, request: &Request) -> Result<()> {
  let registration = Registration::new(host.fetcher.clone());
  host.start(&registration).await?;

  let served = registration.fetch(request).await?;
  eprintln!("{} ({:?})", served.response.status, served.source);
  std::io::stdout().write_all(&served.response.body)?;

  // Let background refreshes and trims land before exiting
  registration.unregister().await;
  Ok(())
}

fn namespaces(host: &Host, entries: bool) -> Result<()> {
  let current = format!("{}{}", host.config.prefix, host.config.version);
  for name in host.storage.namespace_names()? {
    let marker = if name == current { "*" } else { " " };
    let namespace = Namespace::new(host.storage.clone(), &name);
    println!("{} {} ({} entries)", marker, name, namespace.len()?);

    if !entries {
      continue;
    }
    for key in namespace.keys()? {
      if let Some(entry) = namespace.lookup(&key)? {
        let digest = hex::encode(Sha256::digest(&entry.response.body));
        println!(
          "    {} {:>8} {} {}",
          entry.response.status,
          entry.response.body.len(),
          &digest[..16],
          key
        );
      }
    }
  }
  Ok(())
}

fn purge(host: &Host) -> Result<()> {
  let versions = VersionManager::new(
    host.storage.clone(),
    &host.config.prefix,
    &host.config.version,
  );
  let report = versions.purge()?;
  for name in &report.deleted {
    println!("deleted {}", name);
  }
  for name in &report.failed {
    println!("failed  {}", name);
  }
  Ok(())
}

const SHELL_HELP: &str = "commands: get <url> [document|script|style|image|font|manifest|other], \
install <version>, adopt, status, namespaces, quit";

async fn shell(host: &Host) -> Result<()> {
  let registration = Arc::new(Registration::new(host.fetcher.clone()));
  host.start(&registration).await?;

  let (control_tx, control_rx) = control::channel();
  let control_task = tokio::spawn({
    let registration = Arc::clone(&registration);
    async move { registration.serve_control(control_rx).await }
  });

  println!("{}", SHELL_HELP);
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  while let Some(line) = lines.next_line().await? {
    let mut words = line.split_whitespace();
    let result = match words.next() {
      None => Ok(()),
      Some("get") => match words.next() {
        Some(url) => shell_get(host, &registration, url, words.next()).await,
        None => Err(eyre!("usage: get <url> [destination]")),
      },
      Some("install") => match words.next() {
        Some(version) => shell_install(host, &registration, version).await,
        None => Err(eyre!("usage: install <version>")),
      },
      Some("adopt") => control_tx
        .send(ControlMessage::AdoptNewVersion)
        .map(|()| println!("adoption requested")),
      Some("status") => {
        shell_status(&registration);
        Ok(())
      }
      Some("namespaces") => namespaces(host, false),
      Some("quit") | Some("exit") => break,
      Some(other) => Err(eyre!("unknown command {}; {}", other, SHELL_HELP)),
    };
    if let Err(e) = result {
      eprintln!("error: {}", e);
    }
  }

  drop(control_tx);
  control_task
    .await
    .map_err(|e| eyre!("Control task failed: {}", e))?;
  registration.unregister().await;
  Ok(())
}

async fn shell_get(
  host: &Host,
  registration: &Registration,
  url: &str,
  destination: Option<&str>,
) -> Result<()> {
  let destination = match destination {
    Some(raw) => <Destination as clap::ValueEnum>::from_str(raw, true)
      .map_err(|e| eyre!("Invalid destination {}: {}", raw, e))?,
    None => Destination::Document,
  };
  let request = host.request(url, destination, "GET")?;
  let served = registration.fetch(&request).await?;
  println!(
    "{} {:?} {} bytes",
    served.response.status,
    served.source,
    served.response.body.len()
  );
  Ok(())
}

async fn shell_install(host: &Host, registration: &Registration, version: &str) -> Result<()> {
  let engine = host.engine(version)?;
  let (engine, report) = registration.register(engine, &host.manifest(None)?).await?;
  println!(
    "installed {} ({} stored, {} failed), now {:?}",
    engine.version(),
    report.stored,
    report.failed.len(),
    engine.state()
  );
  Ok(())
}

fn shell_status(registration: &Registration) {
  match registration.controller() {
    Some(engine) => println!("active:  {} ({:?})", engine.version(), engine.state()),
    None => println!("active:  none"),
  }
  match registration.waiting() {
    Some(engine) => println!("waiting: {} ({:?})", engine.version(), engine.state()),
    None => println!("waiting: none"),
  }
}
