//! torrent-session - Main entry point
//!
//! Adds one transfer to a session backed by local disk, checks its files,
//! reports status and writes resume data on exit.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use torrent_session::{
    cli::progress::format_bytes, AddTransferParams, CliArgs, Config, MagnetParser, Outgoing, OutgoingReceiver,
    ProgressDisplay, ResumeManager, Session, TorrentError, TorrentHandle, TorrentInfo, TorrentParser, TorrentState,
};
use tracing::{debug, error, info, trace, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at an unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    info!("torrent-session starting");
    debug!("CLI arguments: {:?}", args);

    let config = Config::from_args(&args);
    config.validate().context("Invalid configuration")?;

    let progress = ProgressDisplay::new(config.is_quiet());
    let resume_manager = ResumeManager::new(config.resume_dir.clone());

    let (session, outgoing) = Session::spawn(config.session_config()).context("Failed to start session")?;
    tokio::spawn(log_outgoing(outgoing));

    let (params, info) = build_params(&config, &resume_manager).await?;
    if let Some(info) = &info {
        display_torrent_info(info, &config);
    }
    let handle = session
        .add_transfer(params)
        .await
        .context("Failed to add transfer")?;
    apply_settings(&handle, &config, info.as_deref())?;

    let result = run(&handle, &config, &progress).await;
    if let Err(e) = &result {
        error!("{:#}", e);
        progress.print_error(&format!("{:#}", e))?;
    }

    save_resume(&handle, &resume_manager).await?;
    let name = handle.name().await?;
    progress.print_summary(&name, &handle.status().await?)?;
    session.shutdown().await?;

    info!("torrent-session finished");
    result
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
    debug!("Logging initialized at {}", args.log_level());
}

/// Build the add parameters from a .torrent file or magnet link, with resume data if any
async fn build_params(
    config: &Config,
    resume_manager: &ResumeManager,
) -> Result<(AddTransferParams, Option<Arc<TorrentInfo>>)> {
    let (params, info) = if config.is_magnet() {
        let magnet = MagnetParser::parse(&config.source).context("Failed to parse magnet link")?;
        info!("Magnet link for {}", magnet.info_hash);
        (AddTransferParams::from_magnet(magnet, config.output_dir.clone()), None)
    } else {
        let path = PathBuf::from(&config.source);
        info!("Loading torrent file: {}", path.display());
        let info = TorrentParser::parse_file(&path)
            .map_err(|e| TorrentError::parse_error_with_source("Failed to parse torrent file", format!("{:#}", e)))
            .with_context(|| format!("Failed to load {}", path.display()))?;
        let info = Arc::new(info);
        (
            AddTransferParams::from_torrent(Arc::clone(&info), config.output_dir.clone()),
            Some(info),
        )
    };
    let params = params.paused(config.paused);

    if !config.use_resume {
        return Ok((params, info));
    }
    let info_hash = params.info_hash();
    match resume_manager.load_resume_data(&info_hash).await {
        Ok(Some(resume)) => {
            info!(
                "Found resume data: {}/{} pieces",
                resume.downloaded_count(),
                resume.num_pieces
            );
            Ok((params.with_resume(resume.to_bytes()?), info))
        }
        Ok(None) => Ok((params, info)),
        Err(e) => {
            warn!("Ignoring unreadable resume data: {:#}", e);
            Ok((params, info))
        }
    }
}

/// Display torrent information
fn display_torrent_info(info: &TorrentInfo, config: &Config) {
    if config.is_quiet() {
        return;
    }
    println!("Torrent Information:");
    println!("  Name: {}", info.name);
    println!("  Size: {} ({})", info.total_size(), format_bytes(info.total_size()));
    println!("  Pieces: {} x {}", info.piece_count(), format_bytes(info.piece_length));
    println!("  Info hash: {}", info.info_hash);
    for (index, file) in info.files.iter().enumerate() {
        let skipped = if config.skip_files.contains(&index) { " (skipped)" } else { "" };
        println!("  [{}] {} {}{}", index, file.path.join("/"), format_bytes(file.length), skipped);
    }
    println!();
    println!("Configuration:");
    println!("  Output directory: {}", config.output_dir.display());
    println!("  Resume directory: {}", config.resume_dir.display());
    println!();
}

/// Apply limits, filters and the interface from the command line
fn apply_settings(handle: &TorrentHandle, config: &Config, info: Option<&TorrentInfo>) -> Result<()> {
    let limits = &config.limits;
    handle.set_upload_limit(limits.upload_limit)?;
    handle.set_download_limit(limits.download_limit)?;
    handle.set_max_uploads(limits.max_uploads)?;
    handle.set_max_connections(limits.max_connections)?;
    handle.set_ratio(limits.ratio)?;
    if let Some(interface) = &config.interface {
        handle.use_interface(interface)?;
    }
    if !config.skip_files.is_empty() {
        match info {
            Some(info) => handle.filter_files(config.file_filter(info.file_count())?)?,
            None => warn!("--skip-file ignored until metadata is known"),
        }
    }
    Ok(())
}

/// Print status until Ctrl-C, or until checking ends with `--once`
async fn run(handle: &TorrentHandle, config: &Config, progress: &ProgressDisplay) -> Result<()> {
    let name = handle.name().await?;
    let mut ticker = tokio::time::interval(config.status_interval);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(());
            }
            _ = ticker.tick() => {
                let status = handle.status().await?;
                trace!("Status: {:?}", status);
                progress.print_status(&name, &status)?;

                let checking = matches!(
                    status.state,
                    TorrentState::QueuedForChecking | TorrentState::CheckingFiles
                );
                if let Some(error) = status.error.filter(|_| checking) {
                    anyhow::bail!("Checking failed: {}", error);
                }
                if config.once && !checking && status.state != TorrentState::DownloadingMetadata {
                    info!("Files checked: {}/{} pieces present", status.num_pieces, status.pieces.len());
                    return Ok(());
                }
            }
        }
    }
}

async fn save_resume(handle: &TorrentHandle, resume_manager: &ResumeManager) -> Result<()> {
    let resume = handle.write_resume_data().await?;
    if resume.num_pieces == 0 {
        debug!("No metadata yet; not writing resume data");
        return Ok(());
    }
    resume_manager
        .save_resume_data(&resume)
        .await
        .context("Failed to write resume data")
}

/// No network layer is attached; report what the engine asks of it
async fn log_outgoing(mut outgoing: OutgoingReceiver) {
    while let Some(message) = outgoing.recv().await {
        match message {
            Outgoing::StateChanged { info_hash, state } => info!("{} is now {}", info_hash, state),
            Outgoing::Announce(request) => {
                debug!("Announce {:?} to {} (left {} bytes)", request.event, request.url, request.left)
            }
            Outgoing::HashFailed { info_hash, piece } => warn!("{}: piece {} failed its hash check", info_hash, piece),
            other => trace!("Outgoing: {:?}", other),
        }
    }
}
