mod config;
mod device;
mod event_log;
mod notes;
mod session;
mod waveforms;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::LevelFilter;

use config::{ConsoleConfig, DEFAULT_CONFIG_PATH};
use session::Session;

fn cli() -> Command {
    Command::new("stim-console")
        .about("Operator console for scripted DBS stimulation sequences")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("PATH")
                .default_value(DEFAULT_CONFIG_PATH)
                .help("Console configuration file"),
        )
        .arg(
            Arg::new("transcript")
                .long("transcript")
                .value_name("PATH")
                .help("Write a timestamped session transcript"),
        )
        .arg(
            Arg::new("event-log")
                .long("event-log")
                .value_name("PATH")
                .help("JSON event log (overrides [paths].event_log)"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .help("Log at debug level")
                .action(ArgAction::SetTrue),
        )
}

fn init_logging(matches: &ArgMatches) {
    let mut builder = env_logger::Builder::from_default_env();
    if matches.get_flag("verbose") {
        builder.filter_level(LevelFilter::Debug);
    } else if std::env::var_os("RUST_LOG").is_none() {
        builder.filter_level(LevelFilter::Info);
    }
    builder.init();
}

fn main() -> Result<()> {
    let matches = cli().get_matches();
    init_logging(&matches);

    let config_path = matches
        .get_one::<String>("config")
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    let mut config = ConsoleConfig::load(&config_path)?;
    if let Some(path) = matches.get_one::<String>("transcript") {
        config.paths.transcript = Some(PathBuf::from(path));
    }
    if let Some(path) = matches.get_one::<String>("event-log") {
        config.paths.event_log = PathBuf::from(path);
    }

    let transcript = config.paths.transcript.clone();
    let event_log = config.paths.event_log.clone();
    let mut session = Session::new(config, transcript.as_deref(), &event_log)
        .context("failed to start session")?;
    log::info!("console: config {}", config_path.display());

    let (lines_tx, lines_rx) = mpsc::channel::<String>();
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if lines_tx.send(line).is_err() {
                break;
            }
        }
    });

    let stdout = io::stdout();
    let mut writer = stdout.lock();
    writeln!(
        writer,
        "Stimulation console ready. Type `help` for commands or `exit` to quit."
    )?;
    prompt(&mut writer)?;

    let tick_interval = session.tick_interval();
    let mut last_tick = Instant::now();
    loop {
        let wait = until_next_tick(last_tick, Instant::now(), tick_interval).unwrap_or_default();
        match lines_rx.recv_timeout(wait) {
            Ok(line) => {
                let trimmed = line.trim();
                if should_terminate(trimmed) {
                    print_lines(&mut writer, &session.shutdown()?)?;
                    writeln!(writer, "Session closed.")?;
                    break;
                }
                print_lines(&mut writer, &session.handle_command(trimmed)?)?;
                prompt(&mut writer)?;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                writeln!(writer)?;
                print_lines(&mut writer, &session.shutdown()?)?;
                break;
            }
        }

        // Steady typing must not hold phase transitions back.
        if until_next_tick(last_tick, Instant::now(), tick_interval).is_none() {
            last_tick = Instant::now();
            let lines = session.tick()?;
            if !lines.is_empty() {
                writeln!(writer)?;
                print_lines(&mut writer, &lines)?;
                prompt(&mut writer)?;
            }
        }
    }

    Ok(())
}

/// Time left until the next tick, or `None` once `interval` has passed since `last_tick`.
fn until_next_tick(last_tick: Instant, now: Instant, interval: Duration) -> Option<Duration> {
    let elapsed = now.saturating_duration_since(last_tick);
    (elapsed < interval).then(|| interval - elapsed)
}

fn should_terminate(input: &str) -> bool {
    input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit")
}

fn prompt(writer: &mut impl Write) -> io::Result<()> {
    write!(writer, "> ")?;
    writer.flush()
}

fn print_lines(writer: &mut impl Write, lines: &[String]) -> io::Result<()> {
    for line in lines {
        writeln!(writer, "{line}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_local_config() {
        let matches = cli().get_matches_from(["stim-console"]);
        assert_eq!(
            matches.get_one::<String>("config").map(String::as_str),
            Some(DEFAULT_CONFIG_PATH)
        );
        assert!(!matches.get_flag("verbose"));
    }

    #[test]
    fn cli_accepts_overrides() {
        let matches = cli().get_matches_from([
            "stim-console",
            "--config",
            "or.toml",
            "--event-log",
            "logs/case.json",
            "--verbose",
        ]);
        assert_eq!(
            matches.get_one::<String>("event-log").map(String::as_str),
            Some("logs/case.json")
        );
        assert!(matches.get_flag("verbose"));
        assert!(should_terminate("QUIT"));
    }

    #[test]
    fn ticks_fall_due_even_while_commands_keep_arriving() {
        let interval = Duration::from_millis(100);
        let last_tick = Instant::now();

        assert_eq!(
            until_next_tick(last_tick, last_tick + Duration::from_millis(30), interval),
            Some(Duration::from_millis(70))
        );
        assert_eq!(until_next_tick(last_tick, last_tick + interval, interval), None);

        // A line every 40 ms never lets `recv_timeout` expire; the tick is
        // still due by the third one.
        let arrivals = [40, 80, 120].map(|ms| last_tick + Duration::from_millis(ms));
        let due: Vec<bool> = arrivals
            .iter()
            .map(|now| until_next_tick(last_tick, *now, interval).is_none())
            .collect();
        assert_eq!(due, [false, false, true]);
    }
}
