//! Component F: per-seed weight and performance-score model.
//!
//! Grounded in `compute_weight` and `calculate_score` in
//! `afl-fuzz-queue.c`. Schedule membership is expressed with explicit
//! `matches!` sets on [`PowerSchedule`] variants rather than the source's
//! ordinal range comparisons (`schedule >= FAST && schedule <= RARE`),
//! since this crate doesn't fix an enum discriminant ordering to match.
//!
//! `MAX_FACTOR`/`POWER_BETA`/the default havoc multiplier aren't present
//! in the retrieved source; the values below are AFL++'s well-known
//! defaults (see `DESIGN.md`).

use crate::corpus::queue::{QueueStore, SeedRecord};
use crate::schedulers::powersched::PowerSchedule;

pub const MAX_FACTOR: f64 = 3.0;
pub const POWER_BETA: f64 = 1.0;
pub const DEFAULT_HAVOC_MAX_MULT: f64 = 64.0;

/// Corpus-wide statistics the weight and score formulas are relative to.
/// Recomputed once per alias-table rebuild, over active seeds only.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorpusAverages {
    pub avg_exec_us: f64,
    pub avg_log_bitmap_size: f64,
    pub avg_bitmap_size: f64,
    pub avg_top_size: f64,
    pub avg_log2_n_fuzz: f64,
}

impl CorpusAverages {
    pub fn compute(queue: &QueueStore, n_fuzz: &[u32]) -> Self {
        let mut exec_sum = 0.0;
        let mut log_bitmap_sum = 0.0;
        let mut bitmap_sum = 0.0;
        let mut top_sum = 0.0;
        let mut log2_nfuzz_sum = 0.0;
        let mut n = 0u32;

        for seed in queue.iter() {
            if seed.disabled {
                continue;
            }
            exec_sum += seed.exec_us as f64;
            let bitmap_size = (seed.bitmap_size.max(1)) as f64;
            log_bitmap_sum += bitmap_size.ln();
            bitmap_sum += bitmap_size;
            top_sum += seed.tc_ref as f64;
            let hits = n_fuzz.get(seed.n_fuzz_entry).copied().unwrap_or(0).max(1);
            log2_nfuzz_sum += (hits as f64).log2();
            n += 1;
        }

        let n = n.max(1) as f64;
        Self {
            avg_exec_us: exec_sum / n,
            avg_log_bitmap_size: (log_bitmap_sum / n).max(f64::MIN_POSITIVE),
            avg_bitmap_size: bitmap_sum / n,
            avg_top_size: (top_sum / n).max(f64::MIN_POSITIVE),
            avg_log2_n_fuzz: log2_nfuzz_sum / n,
        }
    }
}

/// Per-seed sampling weight, used by schedules that weight by speed and
/// coverage contribution rather than the flat power-schedule curve.
pub fn compute_weight(
    seed: &SeedRecord,
    avg: &CorpusAverages,
    schedule: PowerSchedule,
    n_fuzz_hits: u32,
) -> f64 {
    let mut weight = 1.0;

    if matches!(
        schedule,
        PowerSchedule::Fast
            | PowerSchedule::Coe
            | PowerSchedule::Lin
            | PowerSchedule::Quad
            | PowerSchedule::Mmopt
            | PowerSchedule::Rare
    ) && n_fuzz_hits > 0
    {
        weight /= (n_fuzz_hits as f64).log10() + 1.0;
    }

    if !schedule.is_rare() {
        weight *= avg.avg_exec_us / (seed.exec_us.max(1) as f64);
    }

    let bitmap_size = seed.bitmap_size.max(1) as f64;
    weight *= bitmap_size.ln() / avg.avg_log_bitmap_size;
    weight *= 1.0 + (seed.tc_ref as f64 / avg.avg_top_size);

    if weight < 0.1 {
        weight = 0.1;
    }
    if seed.favored {
        weight *= 5.0;
    }
    if !seed.was_fuzzed {
        weight *= 2.0;
    }
    if seed.fs_redundant {
        weight *= 0.8;
    }

    weight
}

/// Parameters for [`calculate_perf_score`] that come from corpus-wide or
/// run-wide state rather than the seed itself.
#[derive(Debug, Clone, Copy)]
pub struct ScoreContext {
    pub schedule: PowerSchedule,
    pub fixed_seed: bool,
    pub n_fuzz_hits: u32,
    pub total_execs: u64,
    pub max_depth: u32,
    pub havoc_max_mult: f64,
    /// MOpt time-limited mutation mode. When set, a seed within 3 levels
    /// of `max_depth` gets a flat ×2 bonus instead of the usual
    /// `perf_score < 1` floor.
    pub limit_time_sig: bool,
}

impl Default for ScoreContext {
    fn default() -> Self {
        Self {
            schedule: PowerSchedule::default(),
            fixed_seed: false,
            n_fuzz_hits: 0,
            total_execs: 1,
            max_depth: 0,
            havoc_max_mult: DEFAULT_HAVOC_MAX_MULT,
            limit_time_sig: false,
        }
    }
}

/// Performance score (energy), decrementing `seed.handicap` as a
/// side effect the same way the source's latecomer bonus wears off.
pub fn calculate_perf_score(seed: &mut SeedRecord, avg: &CorpusAverages, ctx: &ScoreContext) -> f64 {
    let mut perf_score = 100.0f64;

    if !ctx.schedule.is_rare() && !ctx.fixed_seed {
        let exec_us = seed.exec_us as f64;
        if exec_us * 0.1 > avg.avg_exec_us {
            perf_score = 10.0;
        } else if exec_us * 0.25 > avg.avg_exec_us {
            perf_score = 25.0;
        } else if exec_us * 0.5 > avg.avg_exec_us {
            perf_score = 50.0;
        } else if exec_us * 0.75 > avg.avg_exec_us {
            perf_score = 75.0;
        } else if exec_us * 4.0 < avg.avg_exec_us {
            perf_score = 300.0;
        } else if exec_us * 3.0 < avg.avg_exec_us {
            perf_score = 200.0;
        } else if exec_us * 2.0 < avg.avg_exec_us {
            perf_score = 150.0;
        }
    }

    let bitmap_size = seed.bitmap_size as f64;
    if bitmap_size * 0.3 > avg.avg_bitmap_size {
        perf_score *= 3.0;
    } else if bitmap_size * 0.5 > avg.avg_bitmap_size {
        perf_score *= 2.0;
    } else if bitmap_size * 0.75 > avg.avg_bitmap_size {
        perf_score *= 1.5;
    } else if bitmap_size * 3.0 < avg.avg_bitmap_size {
        perf_score *= 0.25;
    } else if bitmap_size * 2.0 < avg.avg_bitmap_size {
        perf_score *= 0.5;
    } else if bitmap_size * 1.5 < avg.avg_bitmap_size {
        perf_score *= 0.75;
    }

    if seed.handicap >= 4 {
        perf_score *= 4.0;
        seed.handicap -= 4;
    } else if seed.handicap > 0 {
        perf_score *= 2.0;
        seed.handicap -= 1;
    }

    perf_score *= match seed.depth {
        0..=3 => 1.0,
        4..=7 => 2.0,
        8..=13 => 3.0,
        14..=25 => 4.0,
        _ => 5.0,
    };

    let mut factor = 1.0f64;
    let is_coe_like = matches!(ctx.schedule, PowerSchedule::Exploit | PowerSchedule::Coe
        | PowerSchedule::Fast | PowerSchedule::Lin | PowerSchedule::Quad);

    match ctx.schedule {
        PowerSchedule::Explore | PowerSchedule::Seek => {}
        PowerSchedule::Exploit => factor = MAX_FACTOR,
        PowerSchedule::Coe => {
            if seed.fuzz_level != 0 {
                if (ctx.n_fuzz_hits.max(1) as f64).log2() > avg.avg_log2_n_fuzz {
                    if !seed.favored {
                        factor = 0.0;
                    }
                } else {
                    factor = fast_factor(seed, ctx);
                }
            }
        }
        PowerSchedule::Fast => {
            if seed.fuzz_level != 0 {
                factor = fast_factor(seed, ctx);
            }
        }
        PowerSchedule::Lin => {
            if seed.fuzz_level != 0 {
                factor = seed.fuzz_level as f64 / (ctx.n_fuzz_hits as f64 + 1.0);
            }
        }
        PowerSchedule::Quad => {
            if seed.fuzz_level != 0 {
                let fl = seed.fuzz_level as f64;
                factor = fl * fl / (ctx.n_fuzz_hits as f64 + 1.0);
            }
        }
        PowerSchedule::Mmopt => {
            if ctx.max_depth.saturating_sub(seed.depth) < 5 {
                perf_score *= 2.0;
            }
        }
        PowerSchedule::Rare => {
            perf_score += seed.tc_ref as f64 * 10.0;
            perf_score *= 1.0 - (ctx.n_fuzz_hits as f64 / ctx.total_execs.max(1) as f64);
        }
    }

    if is_coe_like {
        let clamped = factor.min(MAX_FACTOR);
        perf_score *= clamped / POWER_BETA;
    }

    if ctx.limit_time_sig && ctx.max_depth.saturating_sub(seed.depth) < 3 {
        perf_score *= 2.0;
    } else if !matches!(ctx.schedule, PowerSchedule::Coe) && perf_score < 1.0 {
        perf_score = 1.0;
    }

    perf_score.min(ctx.havoc_max_mult * 100.0)
}

/// Shared `log2(n_fuzz)` bucket curve used by both `FAST` and the
/// fallthrough from `COE`.
fn fast_factor(seed: &SeedRecord, ctx: &ScoreContext) -> f64 {
    let bucket = (ctx.n_fuzz_hits.max(1) as f64).log2() as u32;
    let mut factor = match bucket {
        0 | 1 => 4.0,
        2 | 3 => 3.0,
        4 => 2.0,
        5 => 1.0,
        6 => if seed.favored { 1.0 } else { 0.8 },
        7 => if seed.favored { 1.0 } else { 0.6 },
        _ => if seed.favored { 1.0 } else { 0.4 },
    };
    if seed.favored {
        factor *= 1.15;
    }
    factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn base_seed() -> SeedRecord {
        let mut s = SeedRecord::new(PathBuf::from("id:x"), 10, 0, None);
        s.exec_us = 100;
        s.bitmap_size = 10;
        s
    }

    #[test]
    fn weight_is_clamped_to_a_floor() {
        let mut seed = base_seed();
        seed.exec_us = 1_000_000;
        let avg = CorpusAverages {
            avg_exec_us: 100.0,
            avg_log_bitmap_size: 1.0,
            avg_bitmap_size: 10.0,
            avg_top_size: 1.0,
            avg_log2_n_fuzz: 0.0,
        };
        let w = compute_weight(&seed, &avg, PowerSchedule::Explore, 0);
        assert!(w >= 0.1);
    }

    #[test]
    fn favored_seeds_get_a_weight_bonus() {
        let avg = CorpusAverages {
            avg_exec_us: 100.0,
            avg_log_bitmap_size: (10.0f64).ln(),
            avg_bitmap_size: 10.0,
            avg_top_size: 1.0,
            avg_log2_n_fuzz: 0.0,
        };
        let mut plain = base_seed();
        plain.tc_ref = 1;
        let mut favored = base_seed();
        favored.favored = true;
        favored.tc_ref = 1;
        let w_plain = compute_weight(&plain, &avg, PowerSchedule::Explore, 0);
        let w_fav = compute_weight(&favored, &avg, PowerSchedule::Explore, 0);
        assert!(w_fav > w_plain);
    }

    #[test]
    fn exploit_schedule_pins_to_max_factor() {
        let mut seed = base_seed();
        let avg = CorpusAverages {
            avg_exec_us: 100.0,
            avg_log_bitmap_size: 1.0,
            avg_bitmap_size: 10.0,
            avg_top_size: 1.0,
            avg_log2_n_fuzz: 0.0,
        };
        let ctx = ScoreContext {
            schedule: PowerSchedule::Exploit,
            ..Default::default()
        };
        let score = calculate_perf_score(&mut seed, &avg, &ctx);
        assert!(score > 0.0);
    }

    #[test]
    fn handicap_decays_and_boosts_score() {
        let mut seed = base_seed();
        seed.handicap = 5;
        let avg = CorpusAverages {
            avg_exec_us: 100.0,
            avg_log_bitmap_size: 1.0,
            avg_bitmap_size: 10.0,
            avg_top_size: 1.0,
            avg_log2_n_fuzz: 0.0,
        };
        let ctx = ScoreContext::default();
        calculate_perf_score(&mut seed, &avg, &ctx);
        assert_eq!(seed.handicap, 1);
    }

    #[test]
    fn factor_schedules_still_get_the_floor() {
        // LIN's factor collapses toward zero with enough fuzz pressure;
        // the floor must still catch it even though LIN also goes
        // through the MAX_FACTOR clamp/multiply above it.
        let mut seed = base_seed();
        seed.fuzz_level = 1;
        let avg = CorpusAverages {
            avg_exec_us: 100.0,
            avg_log_bitmap_size: 1.0,
            avg_bitmap_size: 10.0,
            avg_top_size: 1.0,
            avg_log2_n_fuzz: 0.0,
        };
        let ctx = ScoreContext {
            schedule: PowerSchedule::Lin,
            n_fuzz_hits: 1_000_000,
            ..Default::default()
        };
        let score = calculate_perf_score(&mut seed, &avg, &ctx);
        assert_eq!(score, 1.0);
    }

    #[test]
    fn limit_time_sig_doubles_score_near_max_depth_instead_of_flooring() {
        let mut seed = base_seed();
        seed.depth = 10;
        let avg = CorpusAverages {
            avg_exec_us: 100.0,
            avg_log_bitmap_size: 1.0,
            avg_bitmap_size: 10.0,
            avg_top_size: 1.0,
            avg_log2_n_fuzz: 0.0,
        };
        let ctx = ScoreContext {
            schedule: PowerSchedule::Explore,
            max_depth: 12,
            limit_time_sig: true,
            ..Default::default()
        };
        let without_bonus_ctx = ScoreContext {
            limit_time_sig: false,
            ..ctx
        };
        let with_bonus = calculate_perf_score(&mut seed.clone(), &avg, &ctx);
        let without_bonus = calculate_perf_score(&mut seed, &avg, &without_bonus_ctx);
        assert_eq!(with_bonus, without_bonus * 2.0);
    }

    #[test]
    fn score_never_exceeds_havoc_cap() {
        let mut seed = base_seed();
        seed.depth = 999;
        seed.bitmap_size = 1000;
        let avg = CorpusAverages {
            avg_exec_us: 100.0,
            avg_log_bitmap_size: 1.0,
            avg_bitmap_size: 1.0,
            avg_top_size: 1.0,
            avg_log2_n_fuzz: 0.0,
        };
        let ctx = ScoreContext {
            schedule: PowerSchedule::Exploit,
            ..Default::default()
        };
        let score = calculate_perf_score(&mut seed, &avg, &ctx);
        assert!(score <= ctx.havoc_max_mult * 100.0);
    }
}
