//! Component I: periodic external-minimization driver.
//!
//! Grounded in `sched_cmin_maybe_run`/`run_cmin_once_blocking`/
//! `spawn_afl_cmin_and_wait`/`apply_filter_to_snapshot` in
//! `afl-sched-cmin.c`. Blocking, interval-gated, and re-entrant-safe: the
//! three file-scope flags the source keeps as static globals (`inited`,
//! `running`, `last_run_ms`) live on [`MinimizerDriver`] instead
//!.
//!
//! Uses `nix`'s raw `fork`/`execve`/`waitpid` rather than
//! `std::process::Command`, mirroring the source's own `fork()` +
//! `execve()` + `waitpid()` sequence and the crate's `nix` dependency
//! (added for exactly this, see `DESIGN.md`).

use std::collections::hash_map::DefaultHasher;
use std::ffi::CString;
use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execve, fork, ForkResult, Pid};

use crate::config::{FileNameStyle, InstrumentationMode, MinimizerConfig};
use crate::corpus::queue::{QueueStore, SeedId};
use crate::error::Error;
use crate::rand::Rand;

/// `hash64(buf, len, 0xa5b357ULL)` equivalent: a stable, fixed-seed 64-bit
/// content hash. Not the source's exact xxhash-derived algorithm — only
/// stability across runs on identical bytes, which is all the keep-set
/// dedup/lookup relies on.
const HASH_SEED: u64 = 0xa5b357;

fn content_hash(bytes: &[u8]) -> u64 {
    let mut h = DefaultHasher::new();
    h.write_u64(HASH_SEED);
    h.write(bytes);
    h.finish()
}

fn is_casefile_name(style: FileNameStyle, name: &str) -> bool {
    style.matches(name)
}

/// How the target's input is passed to it, decided from its configured
/// argv.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgvMode {
    /// An `@@` placeholder is present somewhere in argv; pass through.
    AtAt,
    /// A fixed path argument matches the configured out-file, or contains
    /// a `.cur_input` marker; the minimizer gets `-f <path>`.
    FileFixed,
    /// A bare `-` placeholder is already present; stdin mode, nothing to
    /// add.
    StdinExisting,
    /// None of the above; force stdin by appending `-`.
    StdinForced,
}

fn argv_has_atat(argv: &[String]) -> bool {
    argv.iter().any(|a| a.contains("@@"))
}

fn find_stdin_dash(argv: &[String]) -> Option<usize> {
    argv.iter().position(|a| a == "-")
}

fn find_fixed_path(argv: &[String], out_file: Option<&Path>) -> Option<(usize, String)> {
    for (i, arg) in argv.iter().enumerate() {
        if arg == "-" || arg.contains("@@") {
            continue;
        }
        if let Some(out_file) = out_file {
            if Path::new(arg) == out_file {
                return Some((i, arg.clone()));
            }
        }
        if arg.contains(".cur_input") {
            return Some((i, arg.clone()));
        }
    }
    None
}

fn classify_argv(argv: &[String], out_file: Option<&Path>) -> (ArgvMode, Option<String>) {
    if argv_has_atat(argv) {
        return (ArgvMode::AtAt, None);
    }
    if let Some((_, path)) = find_fixed_path(argv, out_file) {
        return (ArgvMode::FileFixed, Some(path));
    }
    if find_stdin_dash(argv).is_some() {
        return (ArgvMode::StdinExisting, None);
    }
    (ArgvMode::StdinForced, None)
}

/// Rewrites a source argv element whose path contains a literal `...`
/// segment, substituting `target_root_prefix` for everything up through
/// and including the `...` (and any following slashes). Returns `None` if
/// the element has no `...` segment, in which case the caller passes the
/// element through unchanged.
fn rewrite_ellipsis_path(target_root_prefix: &str, element: &str) -> Option<String> {
    let pos = element.find("...")?;
    let tail = element[pos + 3..].trim_start_matches('/');

    let needs_slash = !target_root_prefix.is_empty()
        && !target_root_prefix.ends_with('/')
        && !tail.is_empty()
        && !tail.starts_with('/');

    let mut out = String::with_capacity(target_root_prefix.len() + tail.len() + 1);
    out.push_str(target_root_prefix);
    if needs_slash {
        out.push('/');
    }
    out.push_str(tail);
    Some(out)
}

/// Builds the full minimizer argv, `[minimizer, -i, -o, -m, -t, mode?, -f?,
/// --, target_argv..., -?]`.
fn build_minimizer_argv(
    config: &MinimizerConfig,
    in_dir: &Path,
    out_dir: &Path,
) -> Vec<String> {
    let mem_str = match config.mem_limit_mb {
        Some(m) => m.to_string(),
        None => "none".to_string(),
    };

    let (mode, fixed_path) = classify_argv(&config.target_argv, config.out_file.as_deref());

    let mut argv = vec![
        config.binary_path.display().to_string(),
        "-i".to_string(),
        in_dir.display().to_string(),
        "-o".to_string(),
        out_dir.display().to_string(),
        "-m".to_string(),
        mem_str,
        "-t".to_string(),
        config.timeout_ms.to_string(),
    ];

    if let Some(flag) = config.mode.flag() {
        argv.push(flag.to_string());
    }

    if mode == ArgvMode::FileFixed {
        argv.push("-f".to_string());
        argv.push(fixed_path.expect("FileFixed mode carries a fixed path"));
    }

    argv.push("--".to_string());

    for src in &config.target_argv {
        if matches!(mode, ArgvMode::AtAt | ArgvMode::FileFixed) && src == "-" {
            continue;
        }
        match rewrite_ellipsis_path(&config.target_root_prefix, src) {
            Some(rewritten) => argv.push(rewritten),
            None => argv.push(src.clone()),
        }
    }

    if mode == ArgvMode::StdinForced {
        argv.push("-".to_string());
    }

    argv
}

fn build_environment(map_size: usize) -> Vec<CString> {
    let mut env: Vec<(String, String)> = std::env::vars().collect();

    let set = |env: &mut Vec<(String, String)>, key: &str, value: String| {
        if let Some(entry) = env.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value;
        } else {
            env.push((key.to_string(), value));
        }
    };

    set(&mut env, "AFL_NO_UI", "1".to_string());
    set(&mut env, "AFL_MAP_SIZE", map_size.to_string());
    if !env.iter().any(|(k, _)| k == "ASAN_OPTIONS") {
        env.push((
            "ASAN_OPTIONS".to_string(),
            "abort_on_error=1:detect_leaks=0:symbolize=0".to_string(),
        ));
    }
    if !env.iter().any(|(k, _)| k == "UBSAN_OPTIONS") {
        env.push(("UBSAN_OPTIONS".to_string(), "print_stacktrace=1".to_string()));
    }

    env.into_iter()
        .filter_map(|(k, v)| CString::new(format!("{k}={v}")).ok())
        .collect()
}

/// Creates a uniquely-named scratch directory under `root`, tagged with
/// `tag`. Generates a clean `<tag>.<random>` template rather than calling
/// `mkdtemp` on a buffer whose non-suffix bytes might contain stray `.`
/// characters.
fn make_scratch_dir<R: Rand>(root: &Path, tag: &str, rand: &mut R) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(root)?;
    for _ in 0..64 {
        let suffix: u64 = rand.next_u64();
        let candidate = root.join(format!("{tag}.{suffix:016x}"));
        match std::fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        "could not allocate a unique scratch directory after 64 attempts",
    ))
}

/// Owns a pair of scratch directories for the lifetime of one
/// minimization round, removing both on every exit path.
struct ScratchDirs {
    input: PathBuf,
    output: PathBuf,
}

impl Drop for ScratchDirs {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.input) {
            log::warn!("failed to remove minimizer scratch dir {:?}: {e}", self.input);
        }
        if let Err(e) = std::fs::remove_dir_all(&self.output) {
            log::warn!("failed to remove minimizer scratch dir {:?}: {e}", self.output);
        }
    }
}

/// One snapshot entry: the seed it came from and the content hash taken
/// at copy time.
struct SnapshotEntry {
    seed_id: SeedId,
    hash: u64,
}

/// Copies every active, non-disabled, case-file-prefixed queue entry into
/// `input_dir`, hashing its contents as it goes.
fn snapshot_queue(
    queue: &QueueStore,
    queue_dir: &Path,
    style: FileNameStyle,
    input_dir: &Path,
) -> Vec<SnapshotEntry> {
    let mut snapshot = Vec::new();
    for seed in queue.iter() {
        if seed.disabled {
            continue;
        }
        let base = match seed.file_name.file_name().and_then(|n| n.to_str()) {
            Some(b) => b,
            None => continue,
        };
        if !is_casefile_name(style, base) {
            continue;
        }
        let src = queue_dir.join(&seed.file_name);
        let bytes = match std::fs::read(&src) {
            Ok(b) => b,
            Err(e) => {
                log::warn!("minimizer snapshot: could not read {src:?}: {e}");
                continue;
            }
        };
        let dst = input_dir.join(base);
        if let Err(e) = std::fs::write(&dst, &bytes) {
            log::warn!("minimizer snapshot: could not write {dst:?}: {e}");
            continue;
        }
        snapshot.push(SnapshotEntry {
            seed_id: seed.id,
            hash: content_hash(&bytes),
        });
    }
    snapshot
}

/// Enumerates case-file-prefixed files in `output_dir`, hashes each, and
/// returns the deduplicated, ascending-sorted keep-set.
fn collect_keep_set(output_dir: &Path, style: FileNameStyle) -> Result<Vec<u64>, Error> {
    let entries = std::fs::read_dir(output_dir)
        .map_err(|e| Error::KeepSetCollection(format!("reading {output_dir:?}: {e}")))?;

    let mut hashes = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::KeepSetCollection(e.to_string()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !is_casefile_name(style, name) {
            continue;
        }
        let bytes = std::fs::read(entry.path())
            .map_err(|e| Error::KeepSetCollection(format!("reading {:?}: {e}", entry.path())))?;
        hashes.push(content_hash(&bytes));
    }
    hashes.sort_unstable();
    hashes.dedup();
    Ok(hashes)
}

/// Binary searches `keep` for `hash`.
fn keep_index(keep: &[u64], hash: u64) -> Option<usize> {
    keep.binary_search(&hash).ok()
}

/// Outcome of applying a keep-set to the live queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyReport {
    pub kept: u32,
    pub disabled: u32,
    pub total_snapshot: u32,
}

/// For each snapshot entry, enable it iff its hash is in `keep` and that
/// slot hasn't already been claimed by an earlier duplicate; disable
/// otherwise. The one-slot-per-hash rule prevents two queue entries with
/// identical contents from both surviving.
fn apply_keep_set(queue: &mut QueueStore, snapshot: &[SnapshotEntry], keep: &[u64]) -> ApplyReport {
    let mut keep_used = vec![false; keep.len()];
    let mut report = ApplyReport {
        total_snapshot: snapshot.len() as u32,
        ..Default::default()
    };

    for entry in snapshot {
        let keep_this = match keep_index(keep, entry.hash) {
            Some(idx) if !keep_used[idx] => {
                keep_used[idx] = true;
                true
            }
            _ => false,
        };
        let _ = queue.set_disabled(entry.seed_id, !keep_this);
        if keep_this {
            report.kept += 1;
        } else {
            report.disabled += 1;
        }
    }
    report
}

/// Appends the minimization summary line to the plot file, flushing
/// immediately.
fn append_plot_line(plot_file: &Path, total: usize, kept: u32) -> std::io::Result<()> {
    use std::io::Write;
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(plot_file)?;
    write!(f, "Total corpus size : [{total}]  |  Corpus size after cmin :  [{kept}]\n")?;
    f.flush()
}

/// Forks and execs the minimizer, blocking until it exits. Returns `Ok(())`
/// on a zero exit status.
///
/// # Safety / process model
/// This performs a raw `fork()` via `nix`; the child only ever calls
/// `execve` or `_exit`, never touching Rust's allocator or running
/// destructors, which is the one safe shape for code after `fork` in a
/// multi-threaded process.
fn spawn_and_wait(config: &MinimizerConfig, in_dir: &Path, out_dir: &Path) -> Result<(), Error> {
    let argv_strings = build_minimizer_argv(config, in_dir, out_dir);
    let argv: Vec<CString> = argv_strings
        .iter()
        .map(|s| CString::new(s.as_str()).expect("argv element has no interior NUL"))
        .collect();
    let binary = CString::new(config.binary_path.as_os_str().to_string_lossy().into_owned())
        .map_err(|e| Error::MinimizerSpawn(format!("binary path has an interior NUL: {e}")))?;
    let envp = build_environment(config.map_size);

    // SAFETY: the child path below only calls `execve`/`_exit`, both of
    // which are safe to call immediately after `fork` in a process that
    // may have other threads.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => wait_for_child(child),
        Ok(ForkResult::Child) => {
            let _ = execve(&binary, &argv, &envp);
            // execve only returns on failure.
            nix::unistd::_exit(127);
        }
        Err(e) => Err(Error::MinimizerSpawn(format!("fork() failed: {e}"))),
    }
}

fn wait_for_child(child: Pid) -> Result<(), Error> {
    match waitpid(child, None) {
        Ok(WaitStatus::Exited(_, 0)) => Ok(()),
        Ok(status) => Err(Error::MinimizerSpawn(format!(
            "minimizer exited abnormally: {status:?}"
        ))),
        Err(e) => Err(Error::MinimizerSpawn(format!("waitpid failed: {e}"))),
    }
}

/// Result of one call to [`MinimizerDriver::maybe_run`].
#[derive(Debug)]
pub enum MinimizerOutcome {
    /// Not yet initialized; this call only recorded `now`.
    FirstCall,
    /// A round was already running (re-entrant call observed it).
    AlreadyRunning,
    /// Less than the configured interval has elapsed.
    NotDue,
    /// Nothing active to snapshot; no round was run.
    NothingToSnapshot,
    /// The minimizer failed to spawn or exited non-zero; the live queue
    /// was left untouched.
    MinimizerFailed,
    /// Keep-set collection failed; the live queue was left untouched.
    KeepSetFailed,
    /// A full round ran and was applied.
    Applied(ApplyReport),
}

/// The scheduler-level driver for Component I: three flags
/// (`inited`/`running`/`last_run_ms`) plus the round logic itself.
#[derive(Debug, Default)]
pub struct MinimizerDriver {
    inited: bool,
    running: bool,
    last_run_ms: u64,
}

impl MinimizerDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pure interval-gating decision, split out from [`Self::maybe_run`]
    /// so the gate is testable without touching
    /// the filesystem or spawning anything.
    fn should_fire(&self, now_ms: u64, interval: Duration) -> bool {
        self.inited
            && !self.running
            && now_ms.saturating_sub(self.last_run_ms) >= interval.as_millis() as u64
    }

    /// Entry point: idempotent and re-entrant-safe. `now_ms` and `rand` are
    /// injected so the interval gate and scratch naming are deterministic
    /// in tests.
    pub fn maybe_run<R: Rand>(
        &mut self,
        config: &MinimizerConfig,
        queue: &mut QueueStore,
        rand: &mut R,
        now_ms: u64,
    ) -> MinimizerOutcome {
        if !self.inited {
            self.inited = true;
            self.last_run_ms = now_ms;
            return MinimizerOutcome::FirstCall;
        }
        if self.running {
            return MinimizerOutcome::AlreadyRunning;
        }
        if !self.should_fire(now_ms, config.interval) {
            return MinimizerOutcome::NotDue;
        }

        self.running = true;
        let outcome = self.run_round(config, queue, rand);
        self.last_run_ms = now_ms;
        self.running = false;
        outcome
    }

    fn run_round<R: Rand>(
        &mut self,
        config: &MinimizerConfig,
        queue: &mut QueueStore,
        rand: &mut R,
    ) -> MinimizerOutcome {
        let pid = std::process::id();
        let in_tag = format!("afl-cmin.{}.{pid}.in", config.target_name);
        let out_tag = format!("afl-cmin.{}.{pid}.out", config.target_name);

        let input_dir = match make_scratch_dir(&config.scratch_root, &in_tag, rand) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("minimizer: could not create input scratch dir: {e}");
                return MinimizerOutcome::NothingToSnapshot;
            }
        };
        let output_dir = match make_scratch_dir(&config.scratch_root, &out_tag, rand) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("minimizer: could not create output scratch dir: {e}");
                let _ = std::fs::remove_dir_all(&input_dir);
                return MinimizerOutcome::NothingToSnapshot;
            }
        };
        let _scratch = ScratchDirs { input: input_dir.clone(), output: output_dir.clone() };

        let snapshot = snapshot_queue(queue, &config.queue_dir, config.filename_style, &input_dir);
        if snapshot.is_empty() {
            log::info!("minimizer: nothing active to snapshot, skipping round");
            return MinimizerOutcome::NothingToSnapshot;
        }

        if let Err(e) = spawn_and_wait(config, &input_dir, &output_dir) {
            log::warn!("minimizer: {e}");
            return MinimizerOutcome::MinimizerFailed;
        }

        let keep = match collect_keep_set(&output_dir, config.filename_style) {
            Ok(k) => k,
            Err(e) => {
                log::warn!("minimizer: {e}");
                return MinimizerOutcome::KeepSetFailed;
            }
        };

        let report = apply_keep_set(queue, &snapshot, &keep);

        if let Err(e) = append_plot_line(&config.plot_file, queue.count(), report.kept) {
            log::warn!("minimizer: could not append plot line: {e}");
        }

        MinimizerOutcome::Applied(report)
    }
}
