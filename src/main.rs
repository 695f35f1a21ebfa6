use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use phcsync::clock::LeapSecond;
use phcsync::config::SystemConfig;
use std::path::PathBuf;

#[cfg(target_os = "linux")]
use {
    chrono::{Local, Utc},
    nix::fcntl::{flock, FlockArg},
    phcsync::clock::{ClockError, ClockHandle, ClockKind, ClockOptions, ClockRegistry, SystemClock},
    phcsync::config::parse_phc_name,
    phcsync::leap::{LeapSecondPlan, LeapState},
    phcsync::persist::StateStore,
    phcsync::phc::{linux::LinuxPhc, Phc},
    phcsync::servo::{Servo, SyncError, SyncOutcome},
    phcsync::status::DaemonStatus,
    phcsync::time::Timestamp,
    std::fs::File,
    std::os::unix::io::AsRawFd,
    std::sync::atomic::{AtomicBool, Ordering},
    std::sync::Arc,
    std::thread,
    std::time::{Duration, Instant},
};

#[cfg(target_os = "linux")]
/// State snapshots and status are rewritten this often (seconds).
const SAVE_STATE_PERIOD: u64 = 10;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// PHC index to discipline (/dev/ptpN), may be repeated
    #[arg(short, long = "phc")]
    phc: Vec<u32>,

    /// Reference clock: "system" or "phcN"
    #[arg(short, long)]
    reference: Option<String>,

    /// Compare clocks and report, but never adjust them
    #[arg(long, default_value_t = false)]
    read_only: bool,

    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// log2 of the servo period in seconds
    #[arg(long, allow_hyphen_values = true)]
    sync_interval: Option<i32>,

    /// Leap second at the end of today (UTC): "insert" or "delete"
    #[arg(long, value_parser = parse_leap_second)]
    leap_second: Option<LeapSecond>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn load_config(&self) -> Result<SystemConfig> {
        let mut config = match &self.config {
            Some(path) => SystemConfig::load(path)?,
            None => SystemConfig::default(),
        };

        if !self.phc.is_empty() {
            config.clocks.phc = self.phc.clone();
        }
        if let Some(reference) = &self.reference {
            config.clocks.reference = reference.clone();
        }
        if self.read_only {
            config.clocks.read_only = true;
        }
        if let Some(dir) = &self.state_dir {
            config.persistence.state_dir = dir.clone();
        }
        if let Some(interval) = self.sync_interval {
            config.clocks.sync_interval = interval;
        }
        if let Some(leap) = self.leap_second {
            config.clocks.leap_second = leap;
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_leap_second(s: &str) -> Result<LeapSecond, String> {
    match s {
        "insert" => Ok(LeapSecond::Insert),
        "delete" => Ok(LeapSecond::Delete),
        "none" => Ok(LeapSecond::None),
        _ => Err(format!("expected insert, delete or none, got {:?}", s)),
    }
}

#[cfg(target_os = "linux")]
fn acquire_singleton_lock() -> Result<File> {
    let lock_path = "/var/run/phcsync.lock";
    let file = File::create(lock_path).map_err(|e| anyhow!("Failed to create lock file {}: {}", lock_path, e))?;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(_) => Ok(file),
        Err(nix::errno::Errno::EAGAIN) => Err(anyhow!("Another instance of phcsync is already running! (Lockfile: {})", lock_path)),
        Err(e) => Err(e.into()),
    }
}

#[cfg(target_os = "linux")]
fn open_phc(registry: &ClockRegistry, config: &SystemConfig, index: u32) -> Result<ClockHandle> {
    let name = format!("phc{}", index);
    let order = config.diff_method_order()?;
    let device = LinuxPhc::open(index).with_context(|| format!("failed to open /dev/ptp{}", index))?;
    let mut phc = Phc::new(device, &name, &order)?;

    match phc.start() {
        Ok(method) => info!("{}: comparing with the system clock using {}", name, method),
        Err(ClockError::Unsupported) => bail!("{}: no usable method to compare with the system clock", name),
        Err(e) => return Err(e.into()),
    }

    let options = ClockOptions {
        discipline: true,
        read_only: config.clocks.read_only,
    };
    Ok(registry.register(&name, ClockKind::Phc, Box::new(phc), options))
}

#[cfg(target_os = "linux")]
fn build_servos(registry: &Arc<ClockRegistry>, config: &SystemConfig) -> Result<Vec<Servo>> {
    let reference = registry
        .find(&config.clocks.reference)
        .ok_or_else(|| anyhow!("reference clock {} is not available", config.clocks.reference))?;

    let mut servos = Vec::new();
    for slave in registry.clocks().into_iter().filter(|c| *c != reference) {
        let mut servo = Servo::new(&format!("servo-{}", slave.name()), registry.clone(), config);
        servo.set_clocks(&reference, &slave);
        servos.push(servo);
    }
    if servos.is_empty() {
        bail!("nothing to synchronize: no clock besides the reference {}", reference.name());
    }
    Ok(servos)
}

/// Whether both of a servo's clocks are still registered.
#[cfg(target_os = "linux")]
fn has_clocks(registry: &ClockRegistry, servo: &Servo) -> bool {
    let live = registry.clocks();
    let present = |h: Option<&ClockHandle>| h.map_or(false, |h| live.contains(h));
    present(servo.master()) && present(servo.slave())
}

#[cfg(target_os = "linux")]
fn publish(registry: &ClockRegistry, servos: &[Servo]) {
    for servo in servos {
        if let Err(e) = servo.save_state() {
            warn!("{}: failed to save state: {}", servo.name(), e);
        }
    }

    let Some(store) = registry.store() else {
        return;
    };
    let status = DaemonStatus {
        updated_ts: Utc::now().timestamp().max(0) as u64,
        servos: servos.iter().map(Servo::get_stats).collect(),
    };
    if let Err(e) = store.write_status(&status) {
        warn!("{:#}", e);
    }
}

#[cfg(target_os = "linux")]
fn main() -> Result<()> {
    let args = Args::parse();

    let level: log::LevelFilter = args.log_level.parse().map_err(|_| anyhow!("invalid log level {:?}", args.log_level))?;
    env_logger::builder()
        .format_timestamp(None)
        .filter_level(level)
        .parse_default_env()
        .init();

    let config = args.load_config()?;

    let _lock_file = match acquire_singleton_lock() {
        Ok(f) => f,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    info!("phcsync {} starting at {}", env!("CARGO_PKG_VERSION"), Local::now().to_rfc3339());

    let store = match StateStore::new(&config.persistence.state_dir) {
        Ok(store) => Some(store),
        Err(e) => {
            warn!("{:#}; state will not be persisted", e);
            None
        }
    };
    let registry = Arc::new(ClockRegistry::new(store));

    let system = SystemClock::new().context("failed to initialise system clock control (root required)")?;
    debug!("system clock: initial frequency {:.3}ppb", system.initial_freq_ppb());
    registry.register(
        "system",
        ClockKind::System,
        Box::new(system),
        ClockOptions {
            discipline: true,
            read_only: config.clocks.read_only,
        },
    );

    let mut phcs = config.clocks.phc.clone();
    if let Some(index) = parse_phc_name(&config.clocks.reference) {
        if !phcs.contains(&index) {
            phcs.push(index);
        }
    }
    for index in phcs {
        open_phc(&registry, &config, index)?;
    }
    registry
        .configure(&config.clocks.read_only_clocks, &config.clocks.undisciplined_clocks)
        .context("invalid per-clock options")?;

    let mut servos = build_servos(&registry, &config)?;
    let mut leap = LeapSecondPlan::schedule(
        &registry,
        config.clocks.leap_second,
        config.servo.clock_control,
        config.clocks.leap_second_guard,
        Utc::now(),
    );

    let interval = Duration::from_secs_f64(config.sync_interval_secs());
    let stats_period = Duration::from_secs(config.persistence.stats_period.max(1));
    let save_period = Duration::from_secs(SAVE_STATE_PERIOD);
    info!("{} servo(s) running every {:?}", servos.len(), interval);

    if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
        debug!("sd_notify: {}", e);
    }

    let start = Instant::now();
    let mut last_save = Instant::now();
    let mut last_stats = Instant::now();
    let mut next_cycle = Instant::now();
    let mut fatal = None;

    while running.load(Ordering::SeqCst) && fatal.is_none() {
        let now = Timestamp::from_secs_f64(start.elapsed().as_secs_f64());

        let leap_done = leap
            .as_mut()
            .map_or(false, |plan| plan.poll(&registry, Utc::now()) == Some(LeapState::Done));
        if leap_done {
            // Filter history spans the discontinuity
            servos.iter_mut().for_each(Servo::reset);
            leap = None;
        }

        let mut lost_device = false;
        for servo in servos.iter_mut() {
            match servo.synchronize(&now) {
                Ok(SyncOutcome::Stepped) => info!("{}: clock stepped", servo.name()),
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!("{}: {}", servo.name(), e);
                    fatal = Some(anyhow!("{}: clock correction is impossible", servo.name()));
                    break;
                }
                Err(SyncError::Clock(ClockError::NoDevice(e))) => {
                    warn!("{}: {}", servo.name(), e);
                    for h in servo.master().into_iter().chain(servo.slave()) {
                        registry.check_present(h);
                    }
                    lost_device = true;
                }
                Err(e) => debug!("{}: {}", servo.name(), e),
            }
        }

        if lost_device {
            servos.retain(|servo| {
                let keep = has_clocks(&registry, servo);
                if !keep {
                    warn!("{}: stopped, a clock has gone", servo.name());
                }
                keep
            });
            if servos.is_empty() {
                fatal = Some(anyhow!("no clocks left to synchronize"));
            }
        }

        if last_save.elapsed() >= save_period {
            publish(&registry, &servos);
            last_save = Instant::now();
        }
        if last_stats.elapsed() >= stats_period {
            for servo in servos.iter_mut() {
                servo.stats_end_period(&now);
            }
            last_stats = Instant::now();
        }

        let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]);

        next_cycle += interval;
        match next_cycle.checked_duration_since(Instant::now()) {
            Some(wait) => thread::sleep(wait),
            // Fell behind; don't try to catch up
            None => next_cycle = Instant::now(),
        }
    }

    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);
    if let Some(plan) = leap.as_mut() {
        plan.cancel(&registry);
    }
    publish(&registry, &servos);

    match fatal {
        Some(e) => Err(e),
        None => {
            info!("Exiting.");
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn main() -> Result<()> {
    let args = Args::parse();
    let _ = args.load_config()?;
    bail!("phcsync requires Linux PTP hardware clock support")
}
