use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use tracing::{debug, error, info};

use capmeta::capture::{self, timestamp_to_string};
use capmeta::config::Config;
use capmeta::sink::{EventSink, TcpEventSink};
use capmeta::tracker::{ConnectionTracker, MatchPolicy};

#[derive(Parser)]
#[command(name = "capmeta")]
#[command(author, version, about = "Connection metadata extraction from packet captures")]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Input directory (capture files)
    #[arg(short, long)]
    pub directory: Option<PathBuf>,

    /// Output file (reserved, not consumed by the tracker)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Notification endpoint (tcp://ip:port)
    #[arg(short = 'z', long)]
    pub endpoint: Option<String>,

    /// Connection idle timeout for UDP/ICMP, in milliseconds
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Disable particular trackers (e.g. --disable tcp,udp,icmp)
    #[arg(long)]
    pub disable: Option<String>,

    /// Send a sync to the consumer before processing starts
    #[arg(short, long)]
    pub flush: bool,

    /// Increase verbosity
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// File config overlaid with whatever was passed on the command line.
    pub fn effective_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::load_or_default()?,
        };

        if let Some(dir) = &self.directory {
            config.directory = dir.to_string_lossy().into_owned();
        }
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if let Some(timeout) = self.timeout {
            config.timeout_ms = timeout;
        }
        if let Some(disable) = &self.disable {
            config.disable = disable.clone();
        }

        Ok(config)
    }
}

pub fn run_command(cli: Cli) -> Result<()> {
    let config = cli.effective_config()?;

    info!("Input directory: {}", config.directory);
    info!("Sink endpoint: {}", config.endpoint);
    info!("Connection timeout: {} milliseconds", config.timeout_ms);

    if let Some(output) = &cli.output {
        debug!("Output path {} is not consumed by connection tracking", output.display());
    }

    let policy = if config.strict_match {
        MatchPolicy::Strict
    } else {
        MatchPolicy::Loose
    };

    let mut sink = TcpEventSink::connect(&config.endpoint)?;
    let mut tracker = ConnectionTracker::new(config.timeout_us(), &config.disable, policy);

    if cli.flush {
        if let Err(e) = sink.flush() {
            error!("Unable to flush notification sink: {}", e);
        }
    }

    let stats = capture::run(Path::new(&config.directory), &mut tracker, &mut sink)?;

    if stats.files_failed > 0 {
        info!("{} capture files skipped due to errors", stats.files_failed);
    }

    info!("Total packets: {}", stats.total_packets);
    info!(
        "TCP connections : {:<8} opened, {:<8} closed",
        tracker.tcp().opened(),
        tracker.tcp().closed()
    );
    info!(
        "UDP connections : {:<8} opened, {:<8} closed (timeout {} milliseconds)",
        tracker.udp().opened(),
        tracker.udp().closed(),
        config.timeout_ms
    );
    info!(
        "ICMP connections: {:<8} opened, {:<8} closed (timeout {} milliseconds)",
        tracker.icmp().opened(),
        tracker.icmp().closed(),
        config.timeout_ms
    );

    if let Some((s, us)) = stats.first_seen {
        info!("Start Time : {}", timestamp_to_string(s, us));
    }
    if let Some((s, us)) = stats.last_seen {
        info!("Stop Time  : {}", timestamp_to_string(s, us));
    }

    Ok(())
}
