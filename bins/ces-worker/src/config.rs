use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ces_common::QueueConfig;

/// Worker configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub docker_socket: PathBuf,
    pub health_port: u16,
    pub queue: QueueConfig,
    pub runner: RunnerConfig,
    pub sandbox: SandboxConfig,
    pub storage: StorageConfig,
}

/// How a single execution is run and observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub image: String,
    /// Directory inside the container the source lands in
    pub work_dir: String,
    pub execution_timeout: Duration,
    pub logs_poll_interval: Duration,
    /// How long to wait for a killed container to report its exit code
    pub kill_grace: Duration,
}

/// Resource isolation applied to every container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    pub cap_drop: Vec<String>,
    pub cgroupns_mode: String,
    pub network_mode: String,
    pub cpuset_cpus: String,
    pub cpu_quota: i64,
    pub memory_bytes: i64,
    pub memory_swap_bytes: i64,
    pub kernel_memory_tcp_bytes: i64,
    pub pids_limit: i64,
    pub ipc_mode: String,
    pub nofile_soft: i64,
    pub nofile_hard: i64,
    pub nproc_soft: i64,
    pub nproc_hard: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub bucket: String,
    /// Local directory for downloaded sources, archives and log files
    pub scratch_dir: PathBuf,
}

fn parsed<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn text<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).unwrap_or_else(|| default.to_string())
}

fn millis<F>(lookup: &F, key: &str, default: u64) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    Duration::from_millis(parsed(lookup, key, default))
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            concurrency: parsed(&lookup, "WORKER_CONCURRENCY", 1usize).max(1),
            docker_socket: PathBuf::from(text(&lookup, "DOCKER_SOCKET", "/var/run/docker.sock")),
            health_port: parsed(&lookup, "HEALTH_PORT", 8081),
            queue: QueueConfig::from_lookup(&lookup),
            runner: RunnerConfig::from_lookup(&lookup),
            sandbox: SandboxConfig::from_lookup(&lookup),
            storage: StorageConfig::from_lookup(&lookup),
        }
    }
}

impl RunnerConfig {
    pub fn from_lookup<F>(lookup: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            image: text(lookup, "RUNNER_IMAGE", "runner-mono"),
            work_dir: text(lookup, "RUNNER_WORK_DIR", "/home/runner"),
            execution_timeout: millis(lookup, "EXECUTION_TIMEOUT_MS", 5000),
            logs_poll_interval: millis(lookup, "LOGS_POLL_INTERVAL_MS", 100),
            kill_grace: millis(lookup, "KILL_GRACE_MS", 1000),
        }
    }
}

impl SandboxConfig {
    pub fn from_lookup<F>(lookup: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            cap_drop: text(lookup, "SANDBOX_CAP_DROP", "ALL")
                .split(',')
                .map(str::trim)
                .filter(|cap| !cap.is_empty())
                .map(String::from)
                .collect(),
            cgroupns_mode: text(lookup, "SANDBOX_CGROUPNS_MODE", "private"),
            network_mode: text(lookup, "SANDBOX_NETWORK_MODE", "none"),
            cpuset_cpus: text(lookup, "SANDBOX_CPUSET_CPUS", "1"),
            cpu_quota: parsed(lookup, "SANDBOX_CPU_QUOTA", 50_000),
            memory_bytes: parsed(lookup, "SANDBOX_MEMORY_BYTES", 100_000_000),
            memory_swap_bytes: parsed(lookup, "SANDBOX_MEMORY_SWAP_BYTES", 500_000_000),
            kernel_memory_tcp_bytes: parsed(lookup, "SANDBOX_KERNEL_MEMORY_TCP_BYTES", 100_000_000),
            pids_limit: parsed(lookup, "SANDBOX_PIDS_LIMIT", 8),
            ipc_mode: text(lookup, "SANDBOX_IPC_MODE", "none"),
            nofile_soft: parsed(lookup, "SANDBOX_NOFILE_SOFT", 128),
            nofile_hard: parsed(lookup, "SANDBOX_NOFILE_HARD", 256),
            nproc_soft: parsed(lookup, "SANDBOX_NPROC_SOFT", 8),
            nproc_hard: parsed(lookup, "SANDBOX_NPROC_HARD", 16),
        }
    }
}

impl StorageConfig {
    pub fn from_lookup<F>(lookup: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            root: PathBuf::from(text(lookup, "ARTIFACT_ROOT", "/var/lib/ces/artifacts")),
            bucket: text(lookup, "ARTIFACT_BUCKET", "code-execution"),
            scratch_dir: lookup("SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(env::temp_dir),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::from_lookup(&|_: &str| None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_config_defaults() {
        let config = WorkerConfig::default();

        assert_eq!(config.concurrency, 1);
        assert_eq!(config.docker_socket, PathBuf::from("/var/run/docker.sock"));
        assert_eq!(config.health_port, 8081);
        assert_eq!(config.queue.request_queue, "code-execution-request");
        assert_eq!(config.runner.image, "runner-mono");
        assert_eq!(config.runner.work_dir, "/home/runner");
        assert_eq!(config.runner.execution_timeout, Duration::from_millis(5000));
        assert_eq!(config.runner.logs_poll_interval, Duration::from_millis(100));
        assert_eq!(config.runner.kill_grace, Duration::from_millis(1000));
        assert_eq!(config.storage.bucket, "code-execution");
        assert_eq!(config.storage.scratch_dir, env::temp_dir());
    }

    #[test]
    fn test_sandbox_defaults() {
        let sandbox = SandboxConfig::default();

        assert_eq!(sandbox.cap_drop, vec!["ALL".to_string()]);
        assert_eq!(sandbox.cgroupns_mode, "private");
        assert_eq!(sandbox.network_mode, "none");
        assert_eq!(sandbox.cpuset_cpus, "1");
        assert_eq!(sandbox.cpu_quota, 50_000);
        assert_eq!(sandbox.memory_bytes, 100_000_000);
        assert_eq!(sandbox.memory_swap_bytes, 500_000_000);
        assert_eq!(sandbox.kernel_memory_tcp_bytes, 100_000_000);
        assert_eq!(sandbox.pids_limit, 8);
        assert_eq!(sandbox.ipc_mode, "none");
        assert_eq!((sandbox.nofile_soft, sandbox.nofile_hard), (128, 256));
        assert_eq!((sandbox.nproc_soft, sandbox.nproc_hard), (8, 16));
    }

    #[test]
    fn test_overrides() {
        let config = WorkerConfig::from_lookup(lookup_from(&[
            ("WORKER_CONCURRENCY", "4"),
            ("EXECUTION_TIMEOUT_MS", "250"),
            ("SANDBOX_CAP_DROP", "NET_RAW, SYS_ADMIN"),
            ("SANDBOX_MEMORY_BYTES", "64000000"),
            ("SCRATCH_DIR", "/tmp/ces"),
            ("REQUEST_PREFETCH", "4"),
        ]));

        assert_eq!(config.concurrency, 4);
        assert_eq!(config.runner.execution_timeout, Duration::from_millis(250));
        assert_eq!(
            config.sandbox.cap_drop,
            vec!["NET_RAW".to_string(), "SYS_ADMIN".to_string()]
        );
        assert_eq!(config.sandbox.memory_bytes, 64_000_000);
        assert_eq!(config.storage.scratch_dir, PathBuf::from("/tmp/ces"));
        assert_eq!(config.queue.request_prefetch, 4);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = WorkerConfig::from_lookup(lookup_from(&[
            ("WORKER_CONCURRENCY", "0"),
            ("HEALTH_PORT", "not-a-port"),
            ("SANDBOX_PIDS_LIMIT", "lots"),
        ]));

        assert_eq!(config.concurrency, 1);
        assert_eq!(config.health_port, 8081);
        assert_eq!(config.sandbox.pids_limit, 8);
    }
}
