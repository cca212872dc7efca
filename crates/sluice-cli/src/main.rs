use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tracing_subscriber::EnvFilter;

use sluice_client::{HttpKeycheckBot, KeycheckSettings, hit_sinks_from, proxy_sources_from};
use sluice_core::traits::{HitSink, LogHitSink};
use sluice_core::{Job, JobOptions, ProxyPool};

#[derive(Parser)]
#[command(name = "sluice", version, about = "Concurrent record checker with proxy rotation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a job and control it from stdin
    Run {
        /// Path to the JSON job configuration
        #[arg(short, long, env = "SLUICE_CONFIG")]
        config: PathBuf,

        /// Override the number of concurrent bots
        #[arg(short, long, env = "SLUICE_BOTS")]
        bots: Option<usize>,

        /// Override the number of leading records to skip
        #[arg(short, long, env = "SLUICE_SKIP")]
        skip: Option<u64>,

        /// Seconds between status lines (0 disables them)
        #[arg(long, default_value_t = 5)]
        status_interval: u64,
    },

    /// Check a job configuration without running it
    Validate {
        /// Path to the JSON job configuration
        #[arg(short, long, env = "SLUICE_CONFIG")]
        config: PathBuf,
    },
}

/// Live control commands, one per stdin line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Pause,
    Resume,
    Stop,
    Abort,
    Bots(usize),
    Status,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let command = match words.next().map(str::to_ascii_lowercase).as_deref() {
            Some("pause") => Command::Pause,
            Some("resume") => Command::Resume,
            Some("stop") => Command::Stop,
            Some("abort") => Command::Abort,
            Some("status") => Command::Status,
            Some("bots") => {
                let n = words
                    .next()
                    .ok_or("usage: bots <n>")?
                    .parse()
                    .map_err(|_| "bots expects a positive number".to_string())?;
                Command::Bots(n)
            }
            Some(other) => return Err(format!("unknown command '{other}'")),
            None => return Err("empty command".to_string()),
        };
        if words.next().is_some() {
            return Err(format!("unexpected arguments in '{}'", s.trim()));
        }
        Ok(command)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sluice=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            bots,
            skip,
            status_interval,
        } => {
            let mut options = load_options(&config)?;
            if let Some(bots) = bots {
                options.bots = bots;
            }
            if let Some(skip) = skip {
                options.skip = skip;
            }
            options.validate().context("Invalid job configuration")?;
            cmd_run(options, Duration::from_secs(status_interval)).await?;
        }
        Commands::Validate { config } => {
            let options = load_options(&config)?;
            cmd_validate(&options)?;
        }
    }

    Ok(())
}

fn load_options(path: &Path) -> Result<JobOptions> {
    JobOptions::from_json_file(path)
        .with_context(|| format!("Failed to load job configuration: {}", path.display()))
}

fn cmd_validate(options: &JobOptions) -> Result<()> {
    KeycheckSettings::from_value(&options.bot).context("Invalid bot settings")?;
    let sources = proxy_sources_from(&options.proxy_sources).context("Invalid proxy sources")?;

    println!(
        "{}: OK ({} bots, {} proxy sources, {} hit sinks)",
        options.name,
        options.bots,
        sources.len(),
        options.hit_sinks.len()
    );
    Ok(())
}

async fn cmd_run(options: JobOptions, status_interval: Duration) -> Result<()> {
    let bot = HttpKeycheckBot::from_value(&options.bot).context("Invalid bot settings")?;

    let sources = proxy_sources_from(&options.proxy_sources).context("Invalid proxy sources")?;
    let proxy_pool = if sources.is_empty() {
        None
    } else {
        Some(Arc::new(ProxyPool::new(options.proxy_pool.clone(), sources)))
    };

    let mut sinks = hit_sinks_from(&options.hit_sinks)
        .await
        .context("Failed to open hit sinks")?;
    if sinks.is_empty() {
        tracing::info!("No hit sinks configured, hits will only be logged");
        sinks.push(Arc::new(LogHitSink) as Arc<dyn HitSink>);
    }

    let mut builder = Job::builder(options, bot);
    if let Some(pool) = proxy_pool {
        builder = builder.with_proxy_pool(pool);
    }
    for sink in sinks {
        builder = builder.with_hit_sink(sink);
    }
    let job = builder.build().context("Failed to build job")?;

    job.start().await.context("Failed to start job")?;
    tracing::info!("Commands: pause | resume | stop | abort | bots <n> | status");

    let mut commands = spawn_stdin_reader();
    let mut ticker = (!status_interval.is_zero()).then(|| {
        tokio::time::interval_at(Instant::now() + status_interval, status_interval)
    });

    let mut interrupts = 0u32;
    let completion = job.completion();
    tokio::pin!(completion);

    loop {
        tokio::select! {
            () = &mut completion => break,
            Some(line) = commands.recv() => {
                match line.parse::<Command>() {
                    Ok(command) => {
                        if let Err(e) = apply(&job, command).await {
                            tracing::warn!(error = %e, "Command rejected");
                        }
                    }
                    Err(e) => tracing::warn!("{e}"),
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                interrupts += 1;
                let outcome = if interrupts == 1 {
                    tracing::info!("Interrupted, stopping gracefully (Ctrl-C again to abort)");
                    apply(&job, Command::Stop).await
                } else {
                    apply(&job, Command::Abort).await
                };
                if let Err(e) = outcome {
                    tracing::warn!(error = %e, "Interrupt ignored");
                }
            }
            () = tick(&mut ticker) => tracing::info!("{}", job.snapshot()),
        }
    }

    let snapshot = job.snapshot();
    tracing::info!("{snapshot}");
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn apply(job: &Job<HttpKeycheckBot>, command: Command) -> Result<()> {
    match command {
        Command::Pause => job.pause()?,
        Command::Resume => job.resume()?,
        Command::Stop => job.request_stop()?,
        Command::Abort => job.abort().await?,
        Command::Bots(0) => bail!("bots must be at least 1"),
        Command::Bots(n) => job.change_bots(n)?,
        Command::Status => tracing::info!("{}", job.snapshot()),
    }
    Ok(())
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Forward stdin lines until EOF.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read stdin");
                    break;
                }
            }
        }
    });
    rx
}
