//! Producer clients, demo, benchmark, and stress runners.
//!
//! Each client draws random arguments, submits one numeric task per
//! argument to a shared `TaskService<f64>`, waits for the value, and writes
//! a line per result.

use std::f64::consts::PI;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use rand::Rng;
use tracing::{debug, info};

use crate::error::ServiceError;
use crate::service::TaskService;

/// Default number of tasks each client submits.
pub const DEFAULT_TASKS_PER_CLIENT: usize = 10_000;
/// Default number of concurrent clients (one of each kind).
pub const DEFAULT_CLIENTS: usize = 3;

const CSV_HEADER: &str = "clients,tasks_per_client,total_tasks,elapsed_ms,throughput_tasks_per_s,cpu_user_s,cpu_sys_s,failed,max_concurrency,serial_violation";

/// Best-effort CPU user/system time snapshot (seconds) on Unix platforms.
#[cfg(unix)]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    use libc::{RUSAGE_SELF, getrusage, rusage};
    // SAFETY: rusage is plain data; all-zero is a valid value.
    let mut usage: rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { getrusage(RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return None;
    }
    let user = usage.ru_utime.tv_sec as f64 + (usage.ru_utime.tv_usec as f64 / 1_000_000.0);
    let sys = usage.ru_stime.tv_sec as f64 + (usage.ru_stime.tv_usec as f64 / 1_000_000.0);
    Some((user, sys))
}

/// Stub on non-Unix platforms.
#[cfg(not(unix))]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    None
}

type NumericTask = Box<dyn FnOnce() -> f64 + Send>;

/// Which numeric function a client feeds to the service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientKind {
    Sin,
    Sqrt,
    Pow,
}

impl ClientKind {
    const ALL: [ClientKind; 3] = [ClientKind::Sin, ClientKind::Sqrt, ClientKind::Pow];

    /// Kind for the `index`-th client; kinds rotate sin, sqrt, pow.
    pub fn for_index(index: usize) -> Self {
        Self::ALL[index % Self::ALL.len()]
    }

    fn name(self) -> &'static str {
        match self {
            ClientKind::Sin => "sin",
            ClientKind::Sqrt => "sqrt",
            ClientKind::Pow => "pow",
        }
    }

    /// Draw arguments, build the task, and describe it for the result file.
    fn make_task<R: Rng>(self, rng: &mut R) -> (String, NumericTask) {
        match self {
            ClientKind::Sin => {
                let arg: f64 = rng.gen_range(-PI..PI);
                (format!("sin({arg})"), Box::new(move || arg.sin()) as NumericTask)
            }
            ClientKind::Sqrt => {
                let arg: f64 = rng.gen_range(0.0..1000.0);
                (format!("sqrt({arg})"), Box::new(move || arg.sqrt()) as NumericTask)
            }
            ClientKind::Pow => {
                let base: f64 = rng.gen_range(1.0..10.0);
                let exp: f64 = rng.gen_range(1.0..10.0);
                (format!("{base}^{exp}"), Box::new(move || base.powf(exp)) as NumericTask)
            }
        }
    }
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tracks how many task bodies run at once.
#[derive(Default)]
pub struct ConcurrencyGauge {
    active: AtomicUsize,
    max_active: AtomicUsize,
    violation: AtomicBool,
}

/// Marks a task body as active until dropped, including on unwind.
pub struct ActiveGuard<'a> {
    gauge: &'a ConcurrencyGauge,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let prev = self.gauge.active.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "concurrency gauge underflow");
    }
}

impl ConcurrencyGauge {
    pub fn enter(&self) -> ActiveGuard<'_> {
        let current = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let mut prev = self.max_active.load(Ordering::SeqCst);
        while current > prev {
            match self.max_active.compare_exchange(
                prev,
                current,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(next) => prev = next,
            }
        }
        if current > 1 {
            self.violation.store(true, Ordering::SeqCst);
        }
        ActiveGuard { gauge: self }
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn has_violation(&self) -> bool {
        self.violation.load(Ordering::SeqCst)
    }
}

/// Wrap `body` so its execution is counted by `gauge`.
fn gauged(
    gauge: &Arc<ConcurrencyGauge>,
    body: NumericTask,
) -> impl FnOnce() -> f64 + Send + 'static {
    let gauge = Arc::clone(gauge);
    move || {
        let _active = gauge.enter();
        body()
    }
}

/// Outcome of one client run.
#[derive(Debug)]
pub struct ClientReport {
    pub kind: ClientKind,
    pub tasks: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

/// Submit `tasks` tasks of `kind` one at a time, writing each result line.
///
/// Task failures are counted and written as `<expr> = error: <cause>`;
/// service-level errors abort the client.
pub fn run_client<W: Write>(
    service: &TaskService<f64>,
    kind: ClientKind,
    tasks: usize,
    gauge: Option<&Arc<ConcurrencyGauge>>,
    out: &mut W,
) -> anyhow::Result<ClientReport> {
    let mut rng = rand::thread_rng();
    let mut failed = 0usize;
    let start = Instant::now();
    for _ in 0..tasks {
        let (expr, body) = kind.make_task(&mut rng);
        let handle = match gauge {
            Some(gauge) => service.submit(gauged(gauge, body)),
            None => service.submit(body),
        }
        .with_context(|| format!("{kind} client failed to submit"))?;

        match service.wait(handle) {
            Ok(value) => writeln!(out, "{expr} = {value}")?,
            Err(ServiceError::TaskFailed { cause, .. }) => {
                failed += 1;
                writeln!(out, "{expr} = error: {cause}")?;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("{kind} client failed on {handle}"));
            }
        }
    }
    out.flush()?;
    let elapsed = start.elapsed();
    debug!(%kind, tasks, failed, elapsed_ms = elapsed.as_millis() as u64, "client finished");
    Ok(ClientReport {
        kind,
        tasks,
        failed,
        elapsed,
    })
}

/// Settings for a single benchmark run.
#[derive(Clone, Debug)]
pub struct BenchConfig {
    pub clients: usize,
    pub tasks_per_client: usize,
    /// Directory for per-client result files; `None` discards results.
    pub out_dir: Option<PathBuf>,
    /// Wrap every task in a concurrency gauge.
    pub validate: bool,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            clients: DEFAULT_CLIENTS,
            tasks_per_client: DEFAULT_TASKS_PER_CLIENT,
            out_dir: None,
            validate: false,
        }
    }
}

/// Aggregated metrics from a single benchmark run.
#[derive(Debug)]
pub struct BenchResult {
    pub clients: usize,
    pub tasks_per_client: usize,
    pub total_tasks: usize,
    pub elapsed_ms: f64,
    pub throughput: f64,
    pub cpu_user_s: Option<f64>,
    pub cpu_sys_s: Option<f64>,
    pub failed: usize,
    pub max_concurrency: usize,
    pub serial_violation: bool,
}

impl BenchResult {
    fn csv_row(&self) -> String {
        let cpu_user = self
            .cpu_user_s
            .map(|v| format!("{v:.4}"))
            .unwrap_or_else(|| "NA".to_string());
        let cpu_sys = self
            .cpu_sys_s
            .map(|v| format!("{v:.4}"))
            .unwrap_or_else(|| "NA".to_string());
        format!(
            "{},{},{},{:.2},{:.2},{},{},{},{},{}",
            self.clients,
            self.tasks_per_client,
            self.total_tasks,
            self.elapsed_ms,
            self.throughput,
            cpu_user,
            cpu_sys,
            self.failed,
            self.max_concurrency,
            self.serial_violation
        )
    }
}

/// File a client writes to: `sin_results.txt` for the first of each kind,
/// then `sin_results_3.txt` and so on.
pub fn result_file_name(index: usize) -> String {
    let kind = ClientKind::for_index(index);
    if index < ClientKind::ALL.len() {
        format!("{kind}_results.txt")
    } else {
        format!("{kind}_results_{index}.txt")
    }
}

fn open_output(out_dir: Option<&Path>, index: usize) -> anyhow::Result<Box<dyn Write + Send>> {
    match out_dir {
        Some(dir) => {
            let path = dir.join(result_file_name(index));
            let file = File::create(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            Ok(Box::new(BufWriter::new(file)))
        }
        None => Ok(Box::new(io::sink())),
    }
}

/// Run `config.clients` producer threads against one service.
pub fn benchmark_once(config: &BenchConfig) -> anyhow::Result<BenchResult> {
    if config.clients == 0 {
        bail!("clients must be > 0");
    }
    if config.tasks_per_client == 0 {
        bail!("tasks_per_client must be > 0");
    }
    if let Some(dir) = &config.out_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let service = Arc::new(TaskService::new());
    service.start()?;
    let gauge = config.validate.then(|| Arc::new(ConcurrencyGauge::default()));

    let mut outputs = Vec::with_capacity(config.clients);
    for index in 0..config.clients {
        outputs.push(open_output(config.out_dir.as_deref(), index)?);
    }

    let cpu_start = cpu_times_seconds();
    let start = Instant::now();
    let mut handles = Vec::with_capacity(config.clients);
    for (index, mut out) in outputs.into_iter().enumerate() {
        let service = Arc::clone(&service);
        let gauge = gauge.clone();
        let kind = ClientKind::for_index(index);
        let tasks = config.tasks_per_client;
        let handle = thread::Builder::new()
            .name(format!("client-{kind}-{index}"))
            .spawn(move || run_client(&service, kind, tasks, gauge.as_ref(), &mut out))
            .context("failed to spawn client thread")?;
        handles.push(handle);
    }

    let mut failed = 0usize;
    for handle in handles {
        let report = handle
            .join()
            .map_err(|_| anyhow::anyhow!("client thread panicked"))??;
        failed += report.failed;
    }
    service.stop();

    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    let total_tasks = config.clients * config.tasks_per_client;
    let throughput = if elapsed_ms > 0.0 {
        (total_tasks as f64) / (elapsed_ms / 1000.0)
    } else {
        0.0
    };
    let (cpu_user_s, cpu_sys_s) = match (cpu_start, cpu_times_seconds()) {
        (Some((user_start, sys_start)), Some((user_end, sys_end))) => {
            (Some(user_end - user_start), Some(sys_end - sys_start))
        }
        _ => (None, None),
    };

    Ok(BenchResult {
        clients: config.clients,
        tasks_per_client: config.tasks_per_client,
        total_tasks,
        elapsed_ms,
        throughput,
        cpu_user_s,
        cpu_sys_s,
        failed,
        max_concurrency: gauge.as_ref().map(|p| p.max_active()).unwrap_or(0),
        serial_violation: gauge.as_ref().is_some_and(|p| p.has_violation()),
    })
}

/// Run the sin/sqrt/pow walkthrough and print a summary.
pub fn run_demo() -> anyhow::Result<()> {
    info!("demo start");
    let service = TaskService::new();
    service.start()?;

    let sin = service.submit(|| 0.0f64.sin())?;
    let sqrt = service.submit(|| 4.0f64.sqrt())?;
    let pow = service.submit(|| 2.0f64.powf(10.0))?;
    let failing = service.submit_fallible(|| Err::<f64, _>("division by zero"))?;
    let after_failure = service.submit(|| 1.0f64 + 1.0)?;

    // Results can be collected in any order.
    let pow_value = service.wait(pow)?;
    let sin_value = service.wait(sin)?;
    let sqrt_value = service.wait(sqrt)?;
    let failure_reported = matches!(
        service.wait(failing),
        Err(ServiceError::TaskFailed { .. })
    );
    let after_failure_value = service.wait(after_failure)?;
    let double_wait_rejected = matches!(
        service.wait(sin),
        Err(ServiceError::HandleAlreadyConsumed(_))
    );

    service.stop();
    let late_submit_rejected = matches!(
        service.submit(|| 0.0),
        Err(ServiceError::ServiceNotRunning)
    );
    let stats = service.stats();
    info!(?stats, "demo finished");

    println!("DEMO SUMMARY");
    println!("sin(0)={sin_value}");
    println!("sqrt(4)={sqrt_value}");
    println!("pow(2,10)={pow_value}");
    println!("failure_reported={failure_reported}");
    println!("after_failure={after_failure_value}");
    println!("double_wait_rejected={double_wait_rejected}");
    println!("late_submit_rejected={late_submit_rejected}");
    println!(
        "submitted={} completed={} failed={}",
        stats.submitted, stats.completed, stats.failed
    );
    println!("pending_after_stop={}", service.pending());
    Ok(())
}

/// Run a single benchmark and print one CSV row.
pub fn run_benchmark(config: &BenchConfig) -> anyhow::Result<()> {
    let result = benchmark_once(config)?;
    println!("{CSV_HEADER}");
    println!("{}", result.csv_row());
    if config.validate && result.serial_violation {
        eprintln!("# violation,serial_execution");
    }
    Ok(())
}

/// Sweep client and task counts, printing one CSV row per combination.
pub fn run_stress(client_sets: &[usize], task_sets: &[usize], validate: bool) -> anyhow::Result<()> {
    if client_sets.iter().any(|&clients| clients == 0) {
        bail!("client sets must be > 0");
    }
    if task_sets.iter().any(|&tasks| tasks == 0) {
        bail!("task sets must be > 0");
    }

    println!("{CSV_HEADER}");
    for &clients in client_sets {
        for &tasks_per_client in task_sets {
            let config = BenchConfig {
                clients,
                tasks_per_client,
                out_dir: None,
                validate,
            };
            let result = benchmark_once(&config)?;
            println!("{}", result.csv_row());
            if validate && result.serial_violation {
                eprintln!("# violation,serial_execution");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_writes_one_line_per_task() {
        let service = TaskService::new();
        service.start().expect("start");
        let mut out = Vec::new();
        let report =
            run_client(&service, ClientKind::Sqrt, 25, None, &mut out).expect("client run");
        assert_eq!(report.tasks, 25);
        assert_eq!(report.failed, 0);

        let text = String::from_utf8(out).expect("utf8 output");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 25);
        for line in lines {
            let (expr, value) = line.split_once(" = ").expect("line format");
            let arg: f64 = expr
                .trim_start_matches("sqrt(")
                .trim_end_matches(')')
                .parse()
                .expect("argument");
            let value: f64 = value.parse().expect("value");
            assert!((arg.sqrt() - value).abs() < 1e-9);
        }
    }

    #[test]
    fn client_stops_on_service_error() {
        let service = TaskService::new();
        let mut out = Vec::new();
        let result = run_client(&service, ClientKind::Sin, 3, None, &mut out);
        assert!(result.is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn panicking_body_does_not_leave_gauge_active() {
        let service = TaskService::new();
        service.start().expect("start");
        let gauge = Arc::new(ConcurrencyGauge::default());

        let failing = service
            .submit(gauged(&gauge, Box::new(|| -> f64 { panic!("sensor offline") })))
            .expect("submit failing");
        assert!(service.wait(failing).is_err());
        let healthy = service
            .submit(gauged(&gauge, Box::new(|| 3.0f64)))
            .expect("submit healthy");
        assert_eq!(service.wait(healthy).expect("healthy"), 3.0);

        assert_eq!(gauge.max_active(), 1);
        assert!(!gauge.has_violation());
    }

    #[test]
    fn kinds_rotate_and_name_files() {
        assert_eq!(ClientKind::for_index(0), ClientKind::Sin);
        assert_eq!(ClientKind::for_index(4), ClientKind::Sqrt);
        assert_eq!(result_file_name(2), "pow_results.txt");
        assert_eq!(result_file_name(3), "sin_results_3.txt");
    }

    #[test]
    fn validated_benchmark_sees_serial_execution() {
        let config = BenchConfig {
            clients: 4,
            tasks_per_client: 200,
            out_dir: None,
            validate: true,
        };
        let result = benchmark_once(&config).expect("benchmark");
        assert_eq!(result.total_tasks, 800);
        assert_eq!(result.failed, 0);
        assert_eq!(result.max_concurrency, 1);
        assert!(!result.serial_violation);
    }

    #[test]
    fn benchmark_rejects_zero_clients() {
        let config = BenchConfig {
            clients: 0,
            ..BenchConfig::default()
        };
        assert!(benchmark_once(&config).is_err());
    }

    #[test]
    fn benchmark_writes_result_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = BenchConfig {
            clients: 3,
            tasks_per_client: 10,
            out_dir: Some(dir.path().to_path_buf()),
            validate: false,
        };
        benchmark_once(&config).expect("benchmark");
        for name in ["sin_results.txt", "sqrt_results.txt", "pow_results.txt"] {
            let text = std::fs::read_to_string(dir.path().join(name)).expect("result file");
            assert_eq!(text.lines().count(), 10, "{name}");
        }
    }
}
