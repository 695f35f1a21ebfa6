use crate::clock::LeapSecond;
use crate::filters::fir::{FIR_MAX_STIFFNESS, FIR_MIN_STIFFNESS};
use crate::filters::peirce::{PEIRCE_MAX_SAMPLES, PEIRCE_MIN_SAMPLES};
use crate::filters::pid::{PID_DEFAULT_KD, PID_DEFAULT_KI, PID_DEFAULT_KP};
use crate::filters::smallest::{SMALLEST_MAX_SAMPLES, SMALLEST_MAX_TIMEOUT, SMALLEST_MIN_SAMPLES, SMALLEST_MIN_TIMEOUT};
use crate::phc::DiffMethod;
use crate::stats::{TimestampingPrecision, DEFAULT_CONVERGENCE_MIN_PERIOD};
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const STEP_THRESHOLD_MIN: f64 = 0.1;
pub const STEP_THRESHOLD_MAX: f64 = 10.0;
pub const SYNC_INTERVAL_MIN: i32 = -7;
pub const SYNC_INTERVAL_MAX: i32 = 7;
pub const LEAP_SECOND_GUARD_MIN: f64 = 2.0;
pub const LEAP_SECOND_GUARD_MAX: f64 = 10.0;

/// When the servo may step the clock instead of slewing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClockControl {
    SlewAndStep,
    StepAtStartup,
    StepOnFirstLock,
    StepForward,
    NoStep,
}

/// What to do when a clock reads an implausible time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EpochGuard {
    AlarmOnly,
    PreventSync,
    CorrectClock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub clocks: ClocksConfig,
    pub servo: ServoConfig,
    pub filters: FilterConfig,
    pub convergence: ConvergenceConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClocksConfig {
    /// Clock every other clock is synchronized to: "system" or "phcN".
    pub reference: String,
    /// PHC device indexes (/dev/ptpN) to manage.
    pub phc: Vec<u32>,
    /// Comparison methods to try, in order.
    pub diff_methods: Vec<String>,
    /// Compare and report, but never adjust.
    pub read_only: bool,
    /// Clocks that are read-only even when the rest are not.
    pub read_only_clocks: Vec<String>,
    /// Clocks left free running; they may still act as a reference.
    pub undisciplined_clocks: Vec<String>,
    /// log2 of the servo period in seconds.
    pub sync_interval: i32,
    /// Leap second due at the end of the current UTC day.
    pub leap_second: LeapSecond,
    /// Seconds either side of a leap second during which no clock is adjusted.
    pub leap_second_guard: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub clock_control: ClockControl,
    /// Offsets at least this large (seconds) may be stepped.
    pub step_threshold: f64,
    pub epoch_guard: EpochGuard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub fir_stiffness_min: usize,
    pub fir_stiffness_max: usize,
    pub outlier_filter_enabled: bool,
    pub outlier_filter_size: usize,
    pub outlier_filter_weighting: f64,
    pub path_delay_filter_size: usize,
    /// Penalty per second of age (ns/s).
    pub path_delay_filter_ageing: f64,
    pub path_delay_filter_timeout: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Seconds the offset must stay in bounds before declaring sync.
    pub min_period: f64,
    /// Offset bound (ns). Unset means it follows the timestamping precision.
    pub max_offset: Option<f64>,
    /// Overrides the precision inferred from the diff methods in use.
    pub precision: Option<TimestampingPrecision>,
}

impl ConvergenceConfig {
    /// Offset bound for a pair whose comparison has the given precision.
    pub fn max_offset_for(&self, detected: TimestampingPrecision) -> f64 {
        match (self.max_offset, self.precision) {
            (Some(max_offset), _) => max_offset,
            (None, Some(precision)) => precision.convergence_max_offset(),
            (None, None) => detected.convergence_max_offset(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub state_dir: PathBuf,
    pub use_saved_freq_correction: bool,
    /// Seconds between statistics periods.
    pub stats_period: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            clocks: ClocksConfig::default(),
            servo: ServoConfig::default(),
            filters: FilterConfig::default(),
            convergence: ConvergenceConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Default for ClocksConfig {
    fn default() -> Self {
        ClocksConfig {
            reference: "system".to_string(),
            phc: Vec::new(),
            diff_methods: DiffMethod::DEFAULT_ORDER.iter().map(|m| m.name().to_string()).collect(),
            read_only: false,
            read_only_clocks: Vec::new(),
            undisciplined_clocks: Vec::new(),
            sync_interval: 0,
            leap_second: LeapSecond::None,
            leap_second_guard: LEAP_SECOND_GUARD_MIN,
        }
    }
}

impl Default for ServoConfig {
    fn default() -> Self {
        ServoConfig {
            kp: PID_DEFAULT_KP,
            ki: PID_DEFAULT_KI,
            kd: PID_DEFAULT_KD,
            clock_control: ClockControl::SlewAndStep,
            step_threshold: 0.9,
            epoch_guard: EpochGuard::CorrectClock,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            fir_stiffness_min: FIR_MIN_STIFFNESS,
            fir_stiffness_max: FIR_MAX_STIFFNESS,
            outlier_filter_enabled: false,
            outlier_filter_size: 30,
            outlier_filter_weighting: 1.0,
            path_delay_filter_size: 1,
            path_delay_filter_ageing: 2.0,
            path_delay_filter_timeout: 10.0,
        }
    }
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        ConvergenceConfig {
            min_period: DEFAULT_CONVERGENCE_MIN_PERIOD,
            max_offset: None,
            precision: None,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig {
            state_dir: PathBuf::from("/var/lib/phcsync"),
            use_saved_freq_correction: true,
            stats_period: 3600,
        }
    }
}

impl SystemConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        let config: SystemConfig =
            serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn diff_method_order(&self) -> Result<Vec<DiffMethod>> {
        DiffMethod::parse_order(&self.clocks.diff_methods).map_err(|e| anyhow!(e))
    }

    /// Servo period in seconds.
    pub fn sync_interval_secs(&self) -> f64 {
        2f64.powi(self.clocks.sync_interval)
    }

    /// FIR length: one sample per second of history, within the configured range.
    pub fn fir_stiffness(&self) -> usize {
        let wanted = 2f64.powi(-self.clocks.sync_interval).round() as usize;
        wanted.clamp(self.filters.fir_stiffness_min, self.filters.fir_stiffness_max)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.servo;
        if !(STEP_THRESHOLD_MIN..=STEP_THRESHOLD_MAX).contains(&s.step_threshold) {
            bail!(
                "step_threshold {} outside [{}, {}]",
                s.step_threshold,
                STEP_THRESHOLD_MIN,
                STEP_THRESHOLD_MAX
            );
        }
        if s.kp < 0.0 || s.ki < 0.0 || s.kd < 0.0 {
            bail!("PID gains must not be negative");
        }

        let c = &self.clocks;
        if !(SYNC_INTERVAL_MIN..=SYNC_INTERVAL_MAX).contains(&c.sync_interval) {
            bail!("sync_interval {} outside [{}, {}]", c.sync_interval, SYNC_INTERVAL_MIN, SYNC_INTERVAL_MAX);
        }
        if c.diff_methods.is_empty() {
            bail!("at least one diff method is required");
        }
        self.diff_method_order()?;
        if c.reference != "system" && parse_phc_name(&c.reference).is_none() {
            bail!("reference clock must be \"system\" or \"phcN\", got {:?}", c.reference);
        }

        let f = &self.filters;
        if f.fir_stiffness_min < FIR_MIN_STIFFNESS
            || f.fir_stiffness_max > FIR_MAX_STIFFNESS
            || f.fir_stiffness_min > f.fir_stiffness_max
        {
            bail!(
                "FIR stiffness range [{}, {}] invalid, must lie within [{}, {}]",
                f.fir_stiffness_min,
                f.fir_stiffness_max,
                FIR_MIN_STIFFNESS,
                FIR_MAX_STIFFNESS
            );
        }
        if !(PEIRCE_MIN_SAMPLES..=PEIRCE_MAX_SAMPLES).contains(&f.outlier_filter_size) {
            bail!("outlier_filter_size {} outside [{}, {}]", f.outlier_filter_size, PEIRCE_MIN_SAMPLES, PEIRCE_MAX_SAMPLES);
        }
        if !(0.0..=1.0).contains(&f.outlier_filter_weighting) {
            bail!("outlier_filter_weighting {} outside [0, 1]", f.outlier_filter_weighting);
        }
        if !(SMALLEST_MIN_SAMPLES..=SMALLEST_MAX_SAMPLES).contains(&f.path_delay_filter_size) {
            bail!(
                "path_delay_filter_size {} outside [{}, {}]",
                f.path_delay_filter_size,
                SMALLEST_MIN_SAMPLES,
                SMALLEST_MAX_SAMPLES
            );
        }
        if !(SMALLEST_MIN_TIMEOUT..=SMALLEST_MAX_TIMEOUT).contains(&f.path_delay_filter_timeout) {
            bail!(
                "path_delay_filter_timeout {} outside [{}, {}]",
                f.path_delay_filter_timeout,
                SMALLEST_MIN_TIMEOUT,
                SMALLEST_MAX_TIMEOUT
            );
        }

        if !(LEAP_SECOND_GUARD_MIN..=LEAP_SECOND_GUARD_MAX).contains(&c.leap_second_guard) {
            bail!(
                "leap_second_guard {} outside [{}, {}]",
                c.leap_second_guard,
                LEAP_SECOND_GUARD_MIN,
                LEAP_SECOND_GUARD_MAX
            );
        }

        let conv = &self.convergence;
        if conv.min_period < 0.0 || conv.max_offset.map_or(false, |m| m <= 0.0) {
            bail!("convergence min_period must be >= 0 and max_offset > 0");
        }
        Ok(())
    }
}

/// "phc3" -> 3
pub fn parse_phc_name(name: &str) -> Option<u32> {
    name.strip_prefix("phc")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SystemConfig::default();
        config.validate().unwrap();
        assert_eq!(config.servo.kp, 0.4);
        assert_eq!(config.servo.ki, 0.03);
        assert_eq!(config.servo.step_threshold, 0.9);
        assert_eq!(config.convergence.min_period, 60.0);
        assert_eq!(config.convergence.max_offset, None);
        assert_eq!(config.clocks.leap_second, LeapSecond::None);
        assert_eq!(config.diff_method_order().unwrap(), DiffMethod::DEFAULT_ORDER.to_vec());
    }

    #[test]
    fn test_step_threshold_range() {
        let mut config = SystemConfig::default();
        config.servo.step_threshold = 0.05;
        assert!(config.validate().is_err());
        config.servo.step_threshold = 10.0;
        assert!(config.validate().is_ok());
        config.servo.step_threshold = 10.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_filters() {
        let mut config = SystemConfig::default();
        config.filters.fir_stiffness_max = 200;
        assert!(config.validate().is_err());

        let mut config = SystemConfig::default();
        config.filters.outlier_filter_size = 4;
        assert!(config.validate().is_err());

        let mut config = SystemConfig::default();
        config.filters.path_delay_filter_timeout = 25.0;
        assert!(config.validate().is_err());

        let mut config = SystemConfig::default();
        config.clocks.diff_methods = vec!["read-time".into(), "bogus".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fir_stiffness_from_sync_interval() {
        let mut config = SystemConfig::default();
        config.clocks.sync_interval = -4;
        assert_eq!(config.fir_stiffness(), 16);
        config.clocks.sync_interval = 2;
        assert_eq!(config.fir_stiffness(), 1);
        config.filters.fir_stiffness_max = 8;
        config.clocks.sync_interval = -5;
        assert_eq!(config.fir_stiffness(), 8);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("phcsync.json");
        std::fs::write(
            &path,
            r#"{ "clocks": { "phc": [0, 1], "reference": "phc0" },
                 "servo": { "clock_control": "step-forward", "epoch_guard": "alarm-only" } }"#,
        )
        .unwrap();

        let config = SystemConfig::load(&path).unwrap();
        assert_eq!(config.clocks.phc, vec![0, 1]);
        assert_eq!(config.servo.clock_control, ClockControl::StepForward);
        assert_eq!(config.servo.epoch_guard, EpochGuard::AlarmOnly);
        assert_eq!(config.servo.kp, 0.4);
        assert_eq!(config.clocks.diff_methods.len(), 5);
    }

    #[test]
    fn test_convergence_bound_follows_precision() {
        let mut conv = ConvergenceConfig::default();
        assert_eq!(conv.max_offset_for(TimestampingPrecision::Hardware), 1000.0);
        assert_eq!(conv.max_offset_for(TimestampingPrecision::Software), 100_000.0);

        conv.precision = Some(TimestampingPrecision::Low);
        assert_eq!(conv.max_offset_for(TimestampingPrecision::Hardware), 10.0e6);

        conv.max_offset = Some(250.0);
        assert_eq!(conv.max_offset_for(TimestampingPrecision::Software), 250.0);
    }

    #[test]
    fn test_per_clock_and_leap_second_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("phcsync.json");
        std::fs::write(
            &path,
            r#"{ "clocks": { "phc": [0, 1], "read_only_clocks": ["phc1"], "leap_second": "insert",
                             "leap_second_guard": 5.0 },
                 "convergence": { "precision": "software" } }"#,
        )
        .unwrap();

        let config = SystemConfig::load(&path).unwrap();
        assert_eq!(config.clocks.read_only_clocks, vec!["phc1".to_string()]);
        assert!(config.clocks.undisciplined_clocks.is_empty());
        assert_eq!(config.clocks.leap_second, LeapSecond::Insert);
        assert_eq!(config.convergence.precision, Some(TimestampingPrecision::Software));
        assert_eq!(config.convergence.max_offset, None);

        let mut config = config;
        config.clocks.leap_second_guard = 1.0;
        assert!(config.validate().is_err());
        config.clocks.leap_second_guard = 2.0;
        config.convergence.max_offset = Some(0.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_phc_name() {
        assert_eq!(parse_phc_name("phc2"), Some(2));
        assert_eq!(parse_phc_name("system"), None);
        assert_eq!(parse_phc_name("phcx"), None);
    }
}
