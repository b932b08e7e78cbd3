//! Command-line interface for ringkeeper.
//!
//! Edits the alarm store directly. A running daemon picks new and removed
//! records up on its next reconcile pass.

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use time::OffsetDateTime;

use ringkeeper::alarm::{AlarmId, AlarmRecord, NotificationContent, VolumeSettings};
use ringkeeper::registry::AlarmRegistry;
use ringkeeper::store::FileStore;
use ringkeeper::RingConfig;

const DEFAULT_AUDIO: &str = "assets/alarm.mp3";

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        usage();
        std::process::exit(1);
    }

    let config = RingConfig::from_env()?;
    let store = FileStore::open(&config.store_path)
        .with_context(|| format!("opening {}", config.store_path.display()))?;
    let registry = AlarmRegistry::new(Arc::new(store));

    match args[1].as_str() {
        "list" => cmd_list(&registry)?,
        "arm" => cmd_arm(&registry, &args[2..])?,
        "remove" => cmd_remove(&registry, &args[2..])?,
        command => {
            eprintln!("Unknown command: {}", command);
            eprintln!("Run without arguments to see usage.");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn usage() {
    eprintln!("Usage: ringkeeper-cli <command>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  list                         Show persisted alarms");
    eprintln!("  arm <id> <seconds> [--loop]  Add an alarm due in <seconds>");
    eprintln!("  remove <id>                  Delete an alarm");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  RINGKEEPER_STORE    Alarm store file (default: ringkeeper-alarms.json)");
    eprintln!("  RINGKEEPER_AUDIO    Sound for new alarms (default: {DEFAULT_AUDIO})");
}

fn cmd_list(registry: &AlarmRegistry) -> Result<()> {
    let mut records = registry.list_all()?;
    if records.is_empty() {
        println!("No alarms.");
        return Ok(());
    }
    records.sort_by_key(|r| r.fire_time);

    let now = OffsetDateTime::now_utc();
    for record in &records {
        let due = (record.fire_time - now).whole_seconds();
        let when = if due >= 0 {
            format!("in {due} s")
        } else {
            format!("{} s overdue", -due)
        };
        println!(
            "{:>16}  {}  ({when}){}",
            record.id.to_string(),
            record.fire_time,
            if record.loop_audio { "  loop" } else { "" }
        );
    }
    Ok(())
}

fn cmd_arm(registry: &AlarmRegistry, args: &[String]) -> Result<()> {
    let [id, seconds, rest @ ..] = args else {
        bail!("usage: arm <id> <seconds> [--loop]");
    };
    let id = parse_id(id)?;
    let seconds: i64 = seconds
        .parse()
        .with_context(|| format!("invalid delay {seconds:?}"))?;
    let loop_audio = match rest {
        [] => false,
        [flag] if flag == "--loop" => true,
        _ => bail!("unexpected arguments: {}", rest.join(" ")),
    };

    let record = AlarmRecord {
        id,
        fire_time: OffsetDateTime::now_utc() + time::Duration::seconds(seconds),
        audio_path: env::var("RINGKEEPER_AUDIO").unwrap_or_else(|_| DEFAULT_AUDIO.to_string()),
        loop_audio,
        volume: VolumeSettings::default(),
        vibrate: true,
        allow_overlap: false,
        stop_on_host_termination: false,
        warn_on_kill: true,
        background_audio: false,
        notification: NotificationContent {
            title: format!("Alarm {}", id.0),
            body: "Time to wake up".to_string(),
            stop_button: Some("Stop".to_string()),
        },
    };
    record.validate()?;
    registry.save(&record)?;

    println!("Armed alarm {} for {}", id, record.fire_time);
    Ok(())
}

fn cmd_remove(registry: &AlarmRegistry, args: &[String]) -> Result<()> {
    let [id] = args else {
        bail!("usage: remove <id>");
    };
    let id = parse_id(id)?;
    if !registry.exists(id)? {
        bail!("no alarm with id {}", id);
    }
    registry.remove(id)?;
    println!("Removed alarm {}", id);
    Ok(())
}

fn parse_id(raw: &str) -> Result<AlarmId> {
    let id: i64 = raw.parse().with_context(|| format!("invalid id {raw:?}"))?;
    Ok(AlarmId(id))
}
