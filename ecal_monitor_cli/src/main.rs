use clap::{Arg, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use simplelog::{ColorChoice, CombinedLogger, LevelFilter, TermLogger, TerminalMode, WriteLogger};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::time::Duration;

use libecal_monitor::config::Config;
use libecal_monitor::process::monitor_run;
use libecal_monitor::run_context::RunContext;

fn make_template_config(path: &Path) -> Result<(), String> {
    let config = Config::default();
    let yaml_str = serde_yaml::to_string(&config).map_err(|e| e.to_string())?;
    std::fs::write(path, yaml_str).map_err(|e| e.to_string())
}

fn terminal_logger() -> Box<TermLogger> {
    TermLogger::new(
        LevelFilter::Info,
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
}

/// Log to the terminal only; used before the output directory is known
fn init_terminal_logging(pb_manager: &MultiProgress) -> Result<(), String> {
    LogWrapper::new(pb_manager.clone(), terminal_logger())
        .try_init()
        .map_err(|e| e.to_string())?;
    log::set_max_level(LevelFilter::Info);
    Ok(())
}

/// Log to the terminal and append to the monitoring log file
fn init_logging(pb_manager: &MultiProgress, log_path: &Path) -> Result<(), String> {
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| format!("Could not open log file {}: {e}", log_path.to_string_lossy()))?;
    let logger = CombinedLogger::new(vec![
        terminal_logger(),
        WriteLogger::new(LevelFilter::Info, simplelog::Config::default(), log_file),
    ]);
    LogWrapper::new(pb_manager.clone(), logger)
        .try_init()
        .map_err(|e| e.to_string())?;
    log::set_max_level(LevelFilter::Info);
    Ok(())
}

fn main() -> ExitCode {
    // Create a cli
    let matches = Command::new("ecal_monitor")
        .about("Continuous event building and monitoring of SiW-ECAL raw data")
        .arg_required_else_help(true)
        .args_conflicts_with_subcommands(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(Arg::new("raw_run_folder").help("Folder of the run to be monitored"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .global(true)
                .default_value("monitoring.yml")
                .help("Path to the configuration file"),
        )
        .get_matches();

    let pb_manager = MultiProgress::new();
    let config_path = PathBuf::from(
        matches
            .get_one::<String>("config")
            .map(String::as_str)
            .unwrap_or("monitoring.yml"),
    );

    if let Some(("new", _)) = matches.subcommand() {
        if let Err(e) = init_terminal_logging(&pb_manager) {
            eprintln!("Could not create logging: {e}");
            return ExitCode::FAILURE;
        }
        log::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        return match make_template_config(&config_path) {
            Ok(()) => {
                log::info!("Done.");
                ExitCode::SUCCESS
            }
            Err(e) => {
                log::error!("Could not write the template config: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let raw_run_folder = match matches.get_one::<String>("raw_run_folder") {
        Some(folder) => PathBuf::from(folder),
        None => {
            eprintln!("A raw run folder is required");
            return ExitCode::FAILURE;
        }
    };

    // The log file lives in the output directory, which the config and run folder define
    let prepared = Config::read_config_file(&config_path)
        .map_err(|e| e.to_string())
        .and_then(|config| {
            let ctx = RunContext::new(&raw_run_folder, &config).map_err(|e| e.to_string())?;
            let reused = ctx.claim_output_dir().map_err(|e| e.to_string())?;
            Ok((config, ctx, reused))
        });
    let (config, ctx, reused) = match prepared {
        Ok(p) => p,
        Err(e) => {
            if init_terminal_logging(&pb_manager).is_ok() {
                log::error!("Aborted: {e}");
            } else {
                eprintln!("Aborted: {e}");
            }
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&pb_manager, &ctx.log_path()) {
        eprintln!("Could not create logging: {e}");
        return ExitCode::FAILURE;
    }
    log::info!(
        "Logging to file {} started.",
        ctx.log_path().to_string_lossy()
    );
    log::info!("Config loaded from {}.", config_path.to_string_lossy());

    let config = match ctx.prepare_output(&config, reused) {
        Ok(c) => c,
        Err(e) => {
            log::error!("Aborted: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Setup the spinner
    let pb = pb_manager.add(ProgressBar::new_spinner());
    pb.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(200));
    pb.set_message(format!("Waiting for raw data of {}", ctx.run_name));

    let (tx, rx) = channel();
    // Spawn the task!
    let handle = std::thread::spawn(move || monitor_run(&ctx, &config, Some(tx)));

    loop {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(status) => pb.set_message(status.to_string()),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => {
                if handle.is_finished() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
        if handle.is_finished() {
            break;
        }
    }
    pb.finish();

    match handle.join() {
        Ok(Ok(_summary)) => {
            log::info!("Done.");
            ExitCode::SUCCESS
        }
        Ok(Err(_)) => {
            log::error!("Monitoring aborted. See the log file for details.");
            ExitCode::FAILURE
        }
        Err(_) => {
            log::error!("Failed to join monitoring task!");
            ExitCode::FAILURE
        }
    }
}
