use phcsync::clock::{ClockError, ClockKind, ClockOptions, ClockRegistry, LeapSecond};
use phcsync::config::SystemConfig;
use phcsync::servo::{Servo, SyncOutcome};
use phcsync::status::Alarms;
use phcsync::time::Timestamp;
use phcsync::traits::ClockBackend;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard};

const START: i64 = 1_700_000_000;

// --- Physics Engine ---

struct PhysicsEngine {
    time: f64,      // seconds since start
    offset_ns: f64, // slave - master

    natural_drift_ppb: f64,
    current_adj_ppb: f64,
    steps: Vec<Timestamp>,

    noise: Noise,
    link_down: bool,
}

#[derive(Clone, Copy)]
enum Noise {
    None,
    Uniform(f64),
    Gaussian(f64),
}

impl Noise {
    fn sample(self) -> f64 {
        match self {
            Noise::None => 0.0,
            Noise::Uniform(half_width) => (2.0 * rand::random::<f64>() - 1.0) * half_width,
            Noise::Gaussian(sigma) => {
                // Box-Muller
                let u1: f64 = rand::random::<f64>().max(f64::MIN_POSITIVE);
                let u2: f64 = rand::random();
                (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos() * sigma
            }
        }
    }
}

impl PhysicsEngine {
    fn new(offset_ns: f64, drift_ppb: f64, noise: Noise) -> Self {
        PhysicsEngine {
            time: 0.0,
            offset_ns,
            natural_drift_ppb: drift_ppb,
            current_adj_ppb: 0.0,
            steps: Vec::new(),
            noise,
            link_down: false,
        }
    }

    fn advance(&mut self, dt: f64) {
        self.time += dt;
        // ppb == ns/s
        self.offset_ns += (self.natural_drift_ppb + self.current_adj_ppb) * dt;
    }
}

#[derive(Clone)]
struct SharedPhysics(Arc<Mutex<PhysicsEngine>>);

impl SharedPhysics {
    fn engine(&self) -> MutexGuard<'_, PhysicsEngine> {
        self.0.lock().unwrap()
    }
}

/// The reference: its time is simulation time.
struct SimMaster(SharedPhysics);

/// The disciplined clock.
struct SimSlave(SharedPhysics);

impl ClockBackend for SimMaster {
    fn get_time(&self) -> Result<Timestamp, ClockError> {
        let t = self.0.engine().time;
        Ok(Timestamp::from_secs(START) + Timestamp::from_secs_f64(t))
    }

    fn compare_to_system(&mut self) -> Result<Timestamp, ClockError> {
        Ok(Timestamp::ZERO)
    }

    fn adjust_time(&mut self, _offset: &Timestamp) -> Result<(), ClockError> {
        Ok(())
    }

    fn adjust_frequency(&mut self, _ppb: f64) -> Result<(), ClockError> {
        Ok(())
    }

    fn max_freq_adj_ppb(&self) -> f64 {
        500_000.0
    }

    fn diff_method_name(&self) -> &'static str {
        "system"
    }

    fn record_step(&mut self) {}

    fn schedule_leap_second(&mut self, _leap: LeapSecond) -> Result<(), ClockError> {
        Ok(())
    }
}

impl ClockBackend for SimSlave {
    fn get_time(&self) -> Result<Timestamp, ClockError> {
        let phys = self.0.engine();
        Ok(Timestamp::from_secs(START) + Timestamp::from_secs_f64(phys.time) + Timestamp::from_nanos_f64(phys.offset_ns))
    }

    fn compare_to_system(&mut self) -> Result<Timestamp, ClockError> {
        let phys = self.0.engine();
        if phys.link_down {
            return Err(ClockError::Retry);
        }
        Ok(Timestamp::from_nanos_f64(phys.offset_ns + phys.noise.sample()))
    }

    fn adjust_time(&mut self, offset: &Timestamp) -> Result<(), ClockError> {
        let mut phys = self.0.engine();
        phys.offset_ns += offset.to_nanos_f64();
        phys.steps.push(*offset);
        Ok(())
    }

    fn adjust_frequency(&mut self, ppb: f64) -> Result<(), ClockError> {
        self.0.engine().current_adj_ppb = ppb;
        Ok(())
    }

    fn max_freq_adj_ppb(&self) -> f64 {
        500_000.0
    }

    fn diff_method_name(&self) -> &'static str {
        "sys-offset-precise"
    }

    fn record_step(&mut self) {}

    fn schedule_leap_second(&mut self, _leap: LeapSecond) -> Result<(), ClockError> {
        Err(ClockError::Unsupported)
    }
}

// --- The Test Runner ---

struct Simulation {
    physics: SharedPhysics,
    servo: Servo,
}

impl Simulation {
    fn new(config: SystemConfig, engine: PhysicsEngine) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let physics = SharedPhysics(Arc::new(Mutex::new(engine)));
        let registry = Arc::new(ClockRegistry::new(None));
        let master = registry.register(
            "system",
            ClockKind::System,
            Box::new(SimMaster(physics.clone())),
            ClockOptions::default(),
        );
        let slave = registry.register(
            "phc0",
            ClockKind::Phc,
            Box::new(SimSlave(physics.clone())),
            ClockOptions::default(),
        );

        let mut servo = Servo::new("servo0", registry, &config);
        servo.set_clocks(&master, &slave);
        Simulation { physics, servo }
    }

    /// One servo cycle followed by one second of free running.
    fn cycle(&mut self) -> Result<SyncOutcome, phcsync::servo::SyncError> {
        let now = Timestamp::from_secs_f64(self.physics.engine().time);
        let result = self.servo.synchronize(&now);
        self.physics.engine().advance(1.0);
        result
    }

    fn offset_ns(&self) -> f64 {
        self.physics.engine().offset_ns
    }
}

#[test]
fn test_large_offset_steps_then_converges() {
    let mut sim = Simulation::new(
        SystemConfig::default(),
        PhysicsEngine::new(2.0e9, 0.0, Noise::None),
    );

    assert_eq!(sim.cycle().unwrap(), SyncOutcome::Stepped);
    assert_eq!(sim.physics.engine().steps, vec![Timestamp::from_secs(-2)]);
    assert_eq!(sim.offset_ns(), 0.0);
    assert_eq!(sim.servo.get_offset_from_master(), Timestamp::ZERO);

    // Small measurement noise from here on
    sim.physics.engine().noise = Noise::Uniform(300.0);

    let mut synced_at = None;
    for i in 1..=120 {
        assert_eq!(sim.cycle().unwrap(), SyncOutcome::Slewed);
        if sim.servo.is_synchronized() && synced_at.is_none() {
            synced_at = Some(i);
        }
    }

    let synced_at = synced_at.expect("servo never reported in sync");
    // Offsets must stay in bounds for a full minute first
    assert!(synced_at >= 61, "in sync too early at cycle {}", synced_at);
    assert!(sim.servo.is_synchronized());
    assert_eq!(sim.physics.engine().steps.len(), 1);
    assert!(sim.servo.alarms().is_empty());
}

#[test]
fn test_drift_is_slewed_out() {
    // 50 ppm oscillator error, 300 us initial offset, 100 ns measurement noise
    let mut sim = Simulation::new(
        SystemConfig::default(),
        PhysicsEngine::new(300_000.0, 50_000.0, Noise::Gaussian(100.0)),
    );

    let mut max_offset_steady: f64 = 0.0;
    for i in 0..600 {
        sim.cycle().unwrap();
        if i >= 300 {
            max_offset_steady = max_offset_steady.max(sim.offset_ns().abs());
        }
    }

    println!(
        "Drift: final {:.1}ns, steady max {:.1}ns, freq {:.1}ppb",
        sim.offset_ns(),
        max_offset_steady,
        sim.servo.freq_adjust()
    );
    assert!(sim.physics.engine().steps.is_empty(), "offset below threshold must not be stepped");
    assert!(max_offset_steady < 1000.0, "steady-state offset too high");
    assert!((sim.servo.freq_adjust() + 50_000.0).abs() < 500.0, "integral did not absorb the drift");
    assert!(sim.servo.is_synchronized());
}

#[test]
fn test_sustained_outage_raises_and_clears_alarm() {
    let mut sim = Simulation::new(
        SystemConfig::default(),
        PhysicsEngine::new(0.0, 0.0, Noise::None),
    );
    for _ in 0..70 {
        sim.cycle().unwrap();
    }
    assert!(sim.servo.is_synchronized());

    sim.physics.engine().link_down = true;
    for _ in 0..40 {
        assert!(sim.cycle().is_err());
    }
    assert!(sim.servo.alarms().contains(Alarms::SUSTAINED_SYNC_FAILURE));
    assert!(!sim.servo.is_synchronized());
    assert_eq!(sim.servo.get_stats().offset_ns, 0.0);

    sim.physics.engine().link_down = false;
    sim.cycle().unwrap();
    assert!(!sim.servo.alarms().contains(Alarms::SUSTAINED_SYNC_FAILURE));
}

#[test]
fn test_no_step_policy_slews_large_offset() {
    let mut config = SystemConfig::default();
    config.servo.clock_control = phcsync::config::ClockControl::NoStep;
    let mut sim = Simulation::new(config, PhysicsEngine::new(5.0e6, 0.0, Noise::None));

    for _ in 0..20 {
        assert_eq!(sim.cycle().unwrap(), SyncOutcome::Slewed);
    }
    assert!(sim.physics.engine().steps.is_empty());
    assert!(sim.offset_ns().abs() < 5.0e6, "offset should shrink while slewing");
}
