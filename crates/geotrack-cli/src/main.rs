mod config;
mod node;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use geotrack_nav::{doctor as nav_doctor, FenceDef, GeofenceEngine, ReplaySource};
use geotrack_store::{doctor as store_doctor, load_json, save_json, FileStore, KvStore, KEY_GEOFENCES, KEY_SESSION};
use geotrack_uplink::{Credentials, RadioLink, SessionState, SimLink, SpoolLink, SystemClock, UplinkScheduler};

use config::{check_config, effective_fences, load_config, Config};
use node::{Node, Tick};

#[derive(Debug, Parser)]
#[command(name = "geotrack", version, about = "geotrack - LoRaWAN geofencing tracker")]
struct Cli {
    #[arg(long, default_value = "geotrack.toml")]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Doctor,
    Run,
    Session { #[command(subcommand)] cmd: SessionCmd },
    Fences { #[command(subcommand)] cmd: FencesCmd },
    /// Decode a hex uplink payload and print it as JSON.
    Decode {
        hex: String,
        #[arg(long, default_value_t = 1)]
        port: u8,
    },
}

#[derive(Debug, Subcommand)]
enum SessionCmd {
    Show,
    /// Forget the stored session: counters cleared, next boot rejoins.
    Reset,
}

#[derive(Debug, Subcommand)]
enum FencesCmd {
    List,
    Add {
        #[arg(long)]
        id: u8,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
        #[arg(long)]
        radius_m: f32,
    },
    Remove {
        #[arg(long)]
        id: u8,
    },
}

type TrackerNode = Node<ReplaySource, Box<dyn RadioLink>, SystemClock>;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // decode works without a config file
    if let Command::Decode { hex, port } = &cli.cmd {
        return decode(hex, *port);
    }

    let cfg = load_config(&cli.config)?;
    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Run => run(&cfg).await?,
        Command::Session { cmd } => session(&cfg, cmd)?,
        Command::Fences { cmd } => fences(&cfg, cmd)?,
        Command::Decode { .. } => {}
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    check_config(cfg)?;
    let _ = ReplaySource::open(&cfg.gnss.fix_log)?;

    store_doctor::check_store_dir(&cfg.storage.dir)?;
    let store = FileStore::open(&cfg.storage.dir)?;
    nav_doctor::check_geofences(&effective_fences(cfg, &store)?, cfg.geofence.hysteresis_m)?;

    info!("doctor: OK");
    Ok(())
}

fn open_link(cfg: &Config) -> Result<Box<dyn RadioLink>> {
    let link: Box<dyn RadioLink> = match cfg.radio.backend.as_str() {
        "sim" => Box::new(SimLink::new(cfg.radio.sim.clone())),
        "spool" => Box::new(SpoolLink::new(&cfg.radio.spool_dir, cfg.radio.spool_max_mb)),
        other => anyhow::bail!("unknown radio.backend: {}", other),
    };
    info!("run: radio backend {}", cfg.radio.backend);
    Ok(link)
}

/// Everything a power cycle would rebuild: fresh link, fresh join budget,
/// state restored from the store.
fn build_node(cfg: &Config) -> Result<TrackerNode> {
    let creds = Credentials::parse(&cfg.lorawan.dev_eui, &cfg.lorawan.join_eui, &cfg.lorawan.app_key)
        .context("lorawan credentials")?;
    let store = FileStore::open(&cfg.storage.dir)?;
    let engine = GeofenceEngine::new(effective_fences(cfg, &store)?, cfg.geofence.hysteresis_m, cfg.gnss.gate())
        .context("geofence config")?;
    let source = ReplaySource::open(&cfg.gnss.fix_log)?;
    let clock = SystemClock::default();
    let uplink = UplinkScheduler::new(
        cfg.lorawan.scheduler.clone(),
        creds,
        open_link(cfg)?,
        clock.clone(),
        Box::new(store),
    );
    Ok(Node::new(cfg.node.clone(), source, engine, uplink, clock))
}

async fn run(cfg: &Config) -> Result<()> {
    info!("run: starting");
    check_config(cfg).context("invalid configuration, see `geotrack doctor`")?;
    let mut node = build_node(cfg)?;
    info!("run: {} geofence(s) loaded", node.engine().fences().len());

    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(cfg.node.sample_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut status_every = tokio::time::interval(std::time::Duration::from_secs(60));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("run: interrupted, {}", node.uplink().status_line());
                return Ok(());
            }
            _ = status_every.tick() => {
                info!("run: {}", node.uplink().status_line());
            }
            _ = ticker.tick() => {
                match node.tick() {
                    Tick::Exhausted => {
                        warn!("run: join attempts exhausted, restarting");
                        drop(node);
                        node = build_node(cfg)?;
                    }
                    Tick::Failed(kind, e) => warn!("run: {:?} not delivered: {}", kind, e),
                    Tick::Sent(kind) => info!("run: {:?} sent", kind),
                    Tick::Idle => {}
                }
            }
        }
    }
}

fn session(cfg: &Config, cmd: SessionCmd) -> Result<()> {
    let mut store = FileStore::open(&cfg.storage.dir)?;
    match cmd {
        SessionCmd::Show => {
            let s: SessionState = load_json(&store, KEY_SESSION)?.unwrap_or_default();
            println!("joined={}", s.joined());
            println!(
                "tx attempted={} succeeded={} failed={} ({:.1}%)",
                s.attempted(),
                s.succeeded(),
                s.failed(),
                s.success_rate()
            );
            println!("last_success_unix_s={:?}", s.last_success_unix_s());
            println!("total_join_attempts={}", s.total_join_attempts());
        }
        SessionCmd::Reset => {
            store.remove(KEY_SESSION)?;
            info!("session: reset");
        }
    }
    Ok(())
}

fn fences(cfg: &Config, cmd: FencesCmd) -> Result<()> {
    let mut store = FileStore::open(&cfg.storage.dir)?;
    let mut engine = GeofenceEngine::new(effective_fences(cfg, &store)?, cfg.geofence.hysteresis_m, cfg.gnss.gate())
        .context("geofence config")?;
    match cmd {
        FencesCmd::List => {
            for f in engine.fences() {
                let d = f.def();
                println!(
                    "id={} lat={:.6} lon={:.6} radius_m={}",
                    d.id,
                    d.lat_e6 as f64 / 1e6,
                    d.lon_e6 as f64 / 1e6,
                    d.radius_m
                );
            }
            return Ok(());
        }
        FencesCmd::Add { id, lat, lon, radius_m } => {
            engine.add(FenceDef::from_degrees(id, lat, lon, radius_m)?)?;
        }
        FencesCmd::Remove { id } => {
            engine.remove(id)?;
        }
    }
    save_json(&mut store, KEY_GEOFENCES, &engine.definitions())?;
    info!("fences: {} stored", engine.fences().len());
    Ok(())
}

fn decode(hex_payload: &str, port: u8) -> Result<()> {
    let bytes = hex::decode(hex_payload.trim()).context("payload is not hex")?;
    let msg = geotrack_proto::decode(&bytes, port)?;
    println!("{}", serde_json::to_string_pretty(&msg)?);
    Ok(())
}
