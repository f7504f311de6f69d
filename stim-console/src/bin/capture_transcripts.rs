use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};

#[allow(dead_code)]
#[path = "../config.rs"]
mod config;
#[allow(dead_code)]
#[path = "../device.rs"]
mod device;
#[allow(dead_code)]
#[path = "../event_log.rs"]
mod event_log;
#[allow(dead_code)]
#[path = "../notes.rs"]
mod notes;
#[allow(dead_code)]
#[path = "../session.rs"]
mod session;
#[allow(dead_code)]
#[path = "../waveforms.rs"]
mod waveforms;

use config::{ConsoleConfig, InjectedFailure};
use session::Session;

const OUTPUT_DIR: &str = "transcripts";

#[derive(Clone, Copy, Debug)]
enum Profile {
    EpSweep,
    NovelRetry,
    Rejected,
    Manual,
}

impl Profile {
    const ALL: [Profile; 4] = [
        Profile::EpSweep,
        Profile::NovelRetry,
        Profile::Rejected,
        Profile::Manual,
    ];

    fn tag(self) -> &'static str {
        match self {
            Profile::EpSweep => "ep-sweep",
            Profile::NovelRetry => "novel-retry",
            Profile::Rejected => "rejected",
            Profile::Manual => "manual",
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let base = ConsoleConfig::load(Path::new(config::DEFAULT_CONFIG_PATH))?;
    for profile in Profile::ALL {
        record_profile(profile, base.clone())
            .with_context(|| format!("profile {} failed", profile.tag()))?;
    }
    Ok(())
}

fn record_profile(profile: Profile, mut config: ConsoleConfig) -> Result<()> {
    let out = PathBuf::from(OUTPUT_DIR);
    if let Profile::NovelRetry = profile {
        config.device.failures.push(InjectedFailure {
            call: String::from("StartAnalogStimulation"),
            times: 3,
            message: String::from("Analog output busy"),
        });
    }
    let transcript = out.join(format!("{}.log", profile.tag()));
    let event_log = out.join(format!("{}-events.json", profile.tag()));
    let _ = std::fs::remove_file(&event_log);
    config.paths.notes = out.join(format!("{}-notes.txt", profile.tag()));
    let _ = std::fs::remove_file(&config.paths.notes);
    let mut session = Session::new(config, Some(&transcript), &event_log)?;

    match profile {
        Profile::EpSweep => {
            session.handle_completion("lo", 2)?;
            session.handle_completion("start ", "start ".len())?;
            session.handle_command("load ep_sweep")?;
            session.handle_command("status")?;
            session.handle_command("start")?;
            run_until_idle(&mut session)?;
            session.handle_command("status")?;
        }
        Profile::NovelRetry => {
            session.handle_command("load novel_burst")?;
            session.handle_command("start retry-window=2s")?;
            run_until_idle(&mut session)?;
        }
        Profile::Rejected => {
            session.handle_completion("polarity ", "polarity ".len())?;
            session.handle_command("load bad_lead")?;
            session.handle_command("start")?;
            session.handle_command("stop")?;
            session.handle_command("help record")?;
        }
        Profile::Manual => {
            session.handle_completion("stimulate lead=0 ", "stimulate lead=0 ".len())?;
            session.handle_command(
                "stimulate lead=0 contacts=1,2 return=can amp=2.5 pw=60 freq=130 dur=2s",
            )?;
            session.handle_command("label tremor arrest")?;
            session.handle_command("side-effect transient")?;
            run_until_idle(&mut session)?;
            session.handle_command("status")?;
        }
    }
    session.shutdown()?;
    Ok(())
}

fn run_until_idle(session: &mut Session) -> Result<()> {
    while session.sequencer().state().armed {
        thread::sleep(session.tick_interval());
        session.tick()?;
    }
    Ok(())
}
