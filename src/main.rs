// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Recovers RTSP/RTP audio and video streams from a packet capture.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Error};
use clap::Parser;
use log::{error, info, warn};
use rtspcap::capture::PcapSource;
use rtspcap::extract::{ExtractOptions, Session, Summary};
use rtspcap::sink::{FileSinkFactory, TrackOutcome};

#[derive(Parser)]
#[command(version, about)]
struct Opts {
    /// Packet capture to read, in pcap or pcapng format.
    input: PathBuf,

    /// Output filename prefix; files are named `<prefix><track>.<ext>`.
    #[arg(short, long, default_value = "stream")]
    prefix: String,

    /// Directory to write to. Defaults to the input's file name without extension.
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Session description to use for `SETUP`s whose `DESCRIBE` wasn't captured.
    #[arg(long, value_name = "PATH")]
    sdp: Option<PathBuf>,

    /// Depacketize each track on its own thread.
    #[arg(long)]
    fast: bool,

    /// Log at debug level. `RUST_LOG` overrides.
    #[arg(short, long)]
    verbose: bool,

    /// Additional TCP port to treat as RTSP; may be repeated.
    #[arg(long = "rtsp-port", value_name = "PORT")]
    rtsp_ports: Vec<u16>,
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

#[tokio::main]
async fn main() {
    let opts = Opts::parse();
    init_logging(opts.verbose);
    if let Err(e) = main_inner(opts).await {
        error!("Fatal: {e:#}");
        std::process::exit(1);
    }
    info!("Done");
}

fn default_output_dir(input: &Path) -> Result<PathBuf, Error> {
    match input.file_stem() {
        Some(stem) => Ok(PathBuf::from(stem)),
        None => bail!(
            "can't derive an output directory from {}; use --output-dir",
            input.display()
        ),
    }
}

async fn main_inner(opts: Opts) -> Result<(), Error> {
    let output_dir = match opts.output_dir {
        Some(d) => d,
        None => default_output_dir(&opts.input)?,
    };
    if !output_dir.is_dir() {
        info!("creating output directory {}", output_dir.display());
    }
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("unable to create output directory {}", output_dir.display()))?;

    let stop = Arc::new(AtomicBool::new(false));
    let mut options = ExtractOptions::default()
        .fast(opts.fast)
        .rtsp_ports(opts.rtsp_ports)
        .stop_flag(stop.clone());
    if let Some(sdp) = opts.sdp.as_deref() {
        options = options.backup_sdp_file(sdp)?;
    }
    let input = opts.input;
    let prefix = opts.prefix;
    let mut extraction = tokio::task::spawn_blocking(move || -> Result<Summary, rtspcap::Error> {
        let source = PcapSource::open(&input)?;
        let mut sinks = FileSinkFactory::new(output_dir, prefix);
        Session::new(options).run(source, &mut sinks)
    });
    let mut stopping = false;
    let summary = loop {
        tokio::select! {
            r = &mut extraction => break r??,
            _ = tokio::signal::ctrl_c(), if !stopping => {
                info!("Received stop signal; finishing open tracks");
                stop.store(true, Ordering::Relaxed);
                stopping = true;
            }
        }
    };
    report(&summary);
    if let Some(e) = summary.capture_error {
        return Err(Error::new(e).context("capture ended early"));
    }
    let failed: Vec<usize> = summary
        .tracks
        .iter()
        .filter(|t| t.outcome == TrackOutcome::Failed)
        .map(|t| t.index)
        .collect();
    if !failed.is_empty() {
        return Err(anyhow!("unable to write tracks {failed:?}"));
    }
    Ok(())
}

fn report(summary: &Summary) {
    if summary.tracks.is_empty() {
        warn!("no tracks extracted from {} packets", summary.packets);
    }
    for t in &summary.tracks {
        info!(
            "track {} ({}): {:?}, {} units ({} incomplete) from {} packets; \
             {} lost, {} late, {} duplicate, {} invalid",
            t.index,
            t.encoding_name,
            t.outcome,
            t.units,
            t.incomplete_units,
            t.packets,
            t.lost,
            t.late,
            t.duplicates,
            t.invalid_packets + t.depacketize_errors,
        );
    }
    let diag = &summary.diagnostics;
    if !diag.is_empty() {
        info!(
            "{} diagnostics ({} not retained); see warnings above",
            diag.entries().len() + diag.omitted(),
            diag.omitted()
        );
    }
}
