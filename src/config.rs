//! Construction-time configuration surface.
//!
//! Everything the scheduler needs that doesn't belong on a per-seed record
//! or change during a run is gathered here and handed to [`crate::Scheduler::new`]
//! once, the way `StdWeightedScheduler::with_schedule` and
//! `ForkserverExecutorBuilder` build long-lived components from a small
//! options struct rather than scattering globals.

use std::path::PathBuf;
use std::time::Duration;

use crate::schedulers::frontier_cover::TieBreakPolicy;
use crate::schedulers::powersched::PowerSchedule;

/// Whether queue filenames use `id:NNNNNN` or, when the fuzzer is compiled
/// for filename-simple mode, `id_NNNNNN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileNameStyle {
    Colon,
    Underscore,
}

impl FileNameStyle {
    pub fn prefix(self) -> &'static str {
        match self {
            FileNameStyle::Colon => "id:",
            FileNameStyle::Underscore => "id_",
        }
    }

    pub fn matches(self, base_name: &str) -> bool {
        base_name.starts_with(self.prefix())
    }
}

/// Instrumentation backend flag passed through to the external minimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstrumentationMode {
    #[default]
    Native,
    Qemu,
    Unicorn,
    Frida,
    Nyx,
    Wine,
}

impl InstrumentationMode {
    /// The single-character flag afl-cmin expects, or `None` for native
    /// (no flag emitted at all).
    pub fn flag(self) -> Option<&'static str> {
        match self {
            InstrumentationMode::Native => None,
            InstrumentationMode::Qemu => Some("-Q"),
            InstrumentationMode::Unicorn => Some("-U"),
            InstrumentationMode::Frida => Some("-O"),
            InstrumentationMode::Nyx => Some("-X"),
            InstrumentationMode::Wine => Some("-W"),
        }
    }
}

/// Everything the periodic external-minimization driver (Component I)
/// needs to snapshot the queue, spawn the minimizer, and apply its result.
#[derive(Debug, Clone)]
pub struct MinimizerConfig {
    /// Path to the `afl-cmin`-equivalent minimizer binary.
    pub binary_path: PathBuf,
    /// How often a round may fire, measured against wall-clock time passed
    /// in by the caller. AFL++'s default is
    /// 300 seconds.
    pub interval: Duration,
    /// Root directory under which per-round scratch directories are
    /// created, tagged by target name and pid.
    pub scratch_root: PathBuf,
    /// Name used to tag scratch directories, derived from the target
    /// binary (the source's `extract_fixed_target_name`).
    pub target_name: String,
    /// The live queue directory the snapshot step reads seed files from.
    pub queue_dir: PathBuf,
    /// Append-only plot file the minimization summary line is written to.
    pub plot_file: PathBuf,
    /// Filename prefix style used to recognize case files and filter out
    /// anything else that might live alongside them.
    pub filename_style: FileNameStyle,
    /// Memory limit in MB passed as `-m`, or `None` for `-m none`.
    pub mem_limit_mb: Option<u32>,
    /// Timeout in milliseconds passed as `-t`.
    pub timeout_ms: u32,
    /// Instrumentation backend flag.
    pub mode: InstrumentationMode,
    /// The configured fixed output file the target reads its input from,
    /// if any (compared against target argv elements to detect file mode).
    pub out_file: Option<PathBuf>,
    /// The target program and its arguments, exactly as the harness would
    /// invoke it (the argv whose `@@`/`-`/fixed-path shape decides the
    /// minimizer's input-passing mode).
    pub target_argv: Vec<String>,
    /// Prefix substituted for everything up through a literal `...`
    /// segment in a target argv element.
    pub target_root_prefix: String,
    /// `AFL_MAP_SIZE` passed to the minimizer's environment.
    pub map_size: usize,
}

/// Top-level configuration for the scheduling core.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Fixed coverage-map size, set once at startup.
    pub map_size: usize,
    pub power_schedule: PowerSchedule,
    /// Corpus was loaded with `-i`/resumed rather than generated on the
    /// fly; fixes `fav_factor` to compare size alone.
    pub fixed_seed: bool,
    pub havoc_max_mult: f64,
    /// Whether the frontier tracker and set-cover scheduler (Components D
    /// and E) are active, or favored-culling alone (Component C) drives
    /// sampling.
    pub frontier_enabled: bool,
    pub tie_break: TieBreakPolicy,
    pub cache_max_bytes: usize,
    pub cache_max_entries: usize,
    pub minimizer: Option<MinimizerConfig>,
}

impl SchedulerConfig {
    /// A config with the frontier scheduler and minimizer both disabled,
    /// favored-culling plus the weighted sampler only — the shape most
    /// unit and property tests in this crate exercise.
    pub fn minimal(map_size: usize) -> Self {
        Self {
            map_size,
            power_schedule: PowerSchedule::Explore,
            fixed_seed: false,
            havoc_max_mult: crate::schedulers::testcase_score::DEFAULT_HAVOC_MAX_MULT,
            frontier_enabled: false,
            tie_break: TieBreakPolicy::default(),
            cache_max_bytes: 50 * 1024 * 1024,
            cache_max_entries: 4096,
            minimizer: None,
        }
    }
}
