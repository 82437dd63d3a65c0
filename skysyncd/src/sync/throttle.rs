use std::time::{Duration, Instant};

/// Longest single pause, so a burst of work never stalls a cycle for long.
const MAX_PAUSE: Duration = Duration::from_secs(5);

/// Keeps the process's CPU use near a per-core limit by sleeping between
/// batches.
#[derive(Debug)]
pub struct CpuThrottle {
    max_percent_per_core: u32,
    cores: usize,
    last_wall: Instant,
    last_cpu: Option<Duration>,
}

impl CpuThrottle {
    pub fn new(max_percent_per_core: u32) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|cores| cores.get())
            .unwrap_or(1);
        Self {
            max_percent_per_core,
            cores,
            last_wall: Instant::now(),
            last_cpu: process_cpu_time(),
        }
    }

    pub fn set_limit(&mut self, max_percent_per_core: u32) {
        self.max_percent_per_core = max_percent_per_core;
    }

    /// Sleeps long enough that the CPU time used since the previous call
    /// averages out under the limit.
    pub async fn pace(&mut self) {
        let now = Instant::now();
        let cpu = process_cpu_time();
        let pause = match (self.last_cpu, cpu) {
            (Some(before), Some(after)) => pause_for(
                after.saturating_sub(before),
                now.duration_since(self.last_wall),
                self.max_percent_per_core,
                self.cores,
            ),
            _ => Duration::ZERO,
        };
        if !pause.is_zero() {
            tracing::debug!(pause_ms = pause.as_millis() as u64, "throttling CPU use");
            tokio::time::sleep(pause).await;
        }
        self.last_wall = Instant::now();
        self.last_cpu = process_cpu_time();
    }
}

/// Extra wall time needed for `cpu` spent over `wall` to stay within
/// `max_percent_per_core` of every core. A limit of 0 or 100 or more disables
/// pacing.
pub fn pause_for(
    cpu: Duration,
    wall: Duration,
    max_percent_per_core: u32,
    cores: usize,
) -> Duration {
    if max_percent_per_core == 0 || max_percent_per_core >= 100 {
        return Duration::ZERO;
    }
    let budget = f64::from(max_percent_per_core) / 100.0 * cores.max(1) as f64;
    let needed = cpu.as_secs_f64() / budget;
    let pause = needed - wall.as_secs_f64();
    if pause <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(pause).min(MAX_PAUSE)
}

#[cfg(unix)]
fn process_cpu_time() -> Option<Duration> {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: getrusage only writes into the struct it is given.
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    // SAFETY: initialized by the successful call above.
    let usage = unsafe { usage.assume_init() };
    Some(timeval(usage.ru_utime) + timeval(usage.ru_stime))
}

#[cfg(unix)]
fn timeval(value: libc::timeval) -> Duration {
    Duration::from_secs(value.tv_sec.max(0) as u64)
        + Duration::from_micros(value.tv_usec.max(0) as u64)
}

#[cfg(not(unix))]
fn process_cpu_time() -> Option<Duration> {
    None
}
