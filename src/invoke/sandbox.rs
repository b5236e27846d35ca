//! Built-in script execution backend.
//!
//! Each run gets a fresh workspace on the host. The interpreter starts in new
//! user and mount namespaces, plus a network namespace unless the policy
//! allows egress, and is chrooted into a read-only tmpfs. That root holds the
//! system directories bound read-only and the workspace under `/sandbox`:
//! `inputs/` and `code/` read-only, `work/` (the working directory) and
//! `tmp/` writable. Address-space and CPU-time rlimits are set before exec,
//! the environment is cleared and the child leads its own process group.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use nix::mount::{MsFlags, mount};
use nix::sched::{CloneFlags, unshare};
use nix::sys::resource::{Resource, setrlimit};
use nix::sys::signal::{Signal, killpg};
use nix::sys::statvfs::{FsFlags, statvfs};
use nix::unistd::{Pid, getgid, getuid};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, error, warn};

use crate::config::{NetworkPolicy, SandboxConfig};
use crate::discovery::ServiceEndpoint;
use crate::invoke::{AttemptFailure, AttemptOutcome, ErrorKind, ProcessTaskRequest, TaskBackend};

/// Paths as seen from inside the sandbox.
pub const INPUTS_DIR: &str = "/sandbox/inputs";
pub const CODE_DIR: &str = "/sandbox/code";
pub const WORK_DIR: &str = "/sandbox/work";
pub const TMP_DIR: &str = "/sandbox/tmp";

const SYSTEM_DIRS: &[&str] = &["/usr", "/bin", "/sbin", "/lib", "/lib32", "/lib64", "/libx32", "/etc"];
const DEVICES: &[&str] = &["/dev/null", "/dev/zero", "/dev/random", "/dev/urandom"];
const STDERR_TAIL: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub timeout: Duration,
    pub memory_mb: u64,
}

impl ResourceLimits {
    fn cpu_seconds(&self) -> u64 {
        self.timeout.as_secs() + 1
    }

    fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxRequest {
    pub code: String,
    pub language: String,
    pub limits: ResourceLimits,
    /// File name to content, exposed read-only under `inputs/`.
    pub inputs: BTreeMap<String, String>,
}

impl SandboxRequest {
    /// Reads `code`, `language`, `resourceLimits` and `inputs` from task
    /// variables. Requested limits are clamped to the configured maxima.
    pub fn from_variables(variables: &HashMap<String, Value>, config: &SandboxConfig) -> Result<Self, AttemptFailure> {
        let code = variables.get("code").and_then(Value::as_str)
            .ok_or_else(|| AttemptFailure::new(ErrorKind::ServiceRejected, "sandbox request has no `code` variable"))?
            .to_string();
        let language = variables.get("language").and_then(Value::as_str)
            .unwrap_or(&config.default_language)
            .to_lowercase();

        let requested = variables.get("resourceLimits");
        let timeout_ms = requested.and_then(|l| l.get("timeoutMs")).and_then(Value::as_u64)
            .unwrap_or(config.default_timeout_ms)
            .min(config.max_timeout_ms);
        let memory_mb = requested.and_then(|l| l.get("memoryMB")).and_then(Value::as_u64)
            .unwrap_or(config.default_memory_mb)
            .min(config.max_memory_mb);

        let mut inputs = BTreeMap::new();
        if let Some(map) = variables.get("inputs").and_then(Value::as_object) {
            for (name, content) in map {
                let content = match content {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                inputs.insert(name.clone(), content);
            }
        }

        Ok(Self {
            code,
            language,
            limits: ResourceLimits {
                timeout: Duration::from_millis(timeout_ms.max(1)),
                memory_mb: memory_mb.max(1),
            },
            inputs,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub truncated: bool,
    pub elapsed: Duration,
}

fn valid_input_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\0')
}

fn script_extension(language: &str) -> &'static str {
    match language {
        "python" => "py",
        _ => "sh",
    }
}

async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> (Vec<u8>, bool) {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    (kept, truncated)
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Host-side layout of one run.
struct Workspace {
    root: tempfile::TempDir,
    rootfs: PathBuf,
    inputs: PathBuf,
    code: PathBuf,
    work: PathBuf,
    tmp: PathBuf,
    script_name: String,
}

impl Workspace {
    fn prepare(request: &SandboxRequest) -> io::Result<Self> {
        let root = tempfile::Builder::new().prefix("taskwire-sandbox-").tempdir()?;
        let rootfs = root.path().join("rootfs");
        let inputs = root.path().join("inputs");
        let code = root.path().join("code");
        let work = root.path().join("work");
        let tmp = root.path().join("tmp");
        for dir in [&rootfs, &inputs, &code, &work, &tmp] {
            fs::create_dir(dir)?;
        }

        for (name, content) in &request.inputs {
            let path = inputs.join(name);
            fs::write(&path, content)?;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o444))?;
        }
        fs::set_permissions(&inputs, fs::Permissions::from_mode(0o555))?;

        let script_name = format!("script.{}", script_extension(&request.language));
        let script = code.join(&script_name);
        fs::write(&script, &request.code)?;
        fs::set_permissions(&script, fs::Permissions::from_mode(0o444))?;

        Ok(Self { root, rootfs, inputs, code, work, tmp, script_name })
    }

    fn script_path(&self) -> String {
        format!("{}/{}", CODE_DIR, self.script_name)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        // The read-only inputs dir would otherwise block removal.
        let _ = fs::set_permissions(&self.inputs, fs::Permissions::from_mode(0o755));
        debug!(path = %self.root.path().display(), "Removing sandbox workspace");
    }
}

/// Mount flags the kernel refuses to drop when remounting inside a user
/// namespace; a read-only remount has to repeat them.
fn locked_flags(path: &Path) -> io::Result<MsFlags> {
    let flags = statvfs(path)?.flags();
    let mut locked = MsFlags::empty();
    for (fs_flag, ms_flag) in [
        (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
        (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
        (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
        (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
        (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
        (FsFlags::ST_RELATIME, MsFlags::MS_RELATIME),
    ] {
        if flags.contains(fs_flag) {
            locked |= ms_flag;
        }
    }
    Ok(locked)
}

#[derive(Debug, Clone)]
struct Bind {
    source: PathBuf,
    target: PathBuf,
    is_dir: bool,
    /// `Some(locked flags)` remounts the bind read-only.
    read_only: Option<MsFlags>,
}

impl Bind {
    fn writable(source: &Path, target: PathBuf) -> Self {
        Self { source: source.to_path_buf(), target, is_dir: true, read_only: None }
    }

    fn read_only(source: &Path, target: PathBuf) -> io::Result<Self> {
        Ok(Self {
            source: source.to_path_buf(),
            target,
            is_dir: true,
            read_only: Some(locked_flags(source)?),
        })
    }

    fn apply(&self) -> io::Result<()> {
        if self.is_dir {
            fs::create_dir_all(&self.target)?;
        } else {
            if let Some(parent) = self.target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::File::create(&self.target)?;
        }
        let recursive = if self.is_dir { MsFlags::MS_REC } else { MsFlags::empty() };
        mount(Some(&self.source), &self.target, None::<&str>, MsFlags::MS_BIND | recursive, None::<&str>)?;
        if let Some(locked) = self.read_only {
            let flags = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY | locked;
            mount(None::<&str>, &self.target, None::<&str>, flags, None::<&str>)?;
        }
        Ok(())
    }
}

/// Everything the child needs to confine itself, worked out before fork so
/// the pre-exec hook only makes syscalls.
#[derive(Debug, Clone)]
struct Confinement {
    namespaces: CloneFlags,
    uid_map: String,
    gid_map: String,
    rootfs: PathBuf,
    /// `(link target, link path)` for system dirs that are symlinks.
    links: Vec<(PathBuf, PathBuf)>,
    binds: Vec<Bind>,
    limits: Vec<(Resource, u64)>,
}

impl Confinement {
    fn plan(workspace: &Workspace, network: NetworkPolicy, limits: ResourceLimits) -> io::Result<Self> {
        let rootfs = workspace.rootfs.clone();
        let inside = |path: &str| rootfs.join(path.trim_start_matches('/'));

        let mut links = Vec::new();
        let mut binds = Vec::new();
        for &dir in SYSTEM_DIRS {
            let source = Path::new(dir);
            let Ok(meta) = fs::symlink_metadata(source) else {
                continue;
            };
            if meta.file_type().is_symlink() {
                links.push((fs::read_link(source)?, inside(dir)));
            } else if meta.is_dir() {
                binds.push(Bind::read_only(source, inside(dir))?);
            }
        }
        for &device in DEVICES {
            if Path::new(device).exists() {
                binds.push(Bind {
                    source: PathBuf::from(device),
                    target: inside(device),
                    is_dir: false,
                    read_only: None,
                });
            }
        }
        binds.push(Bind::read_only(&workspace.code, inside(CODE_DIR))?);
        binds.push(Bind::read_only(&workspace.inputs, inside(INPUTS_DIR))?);
        binds.push(Bind::writable(&workspace.work, inside(WORK_DIR)));
        binds.push(Bind::writable(&workspace.tmp, inside(TMP_DIR)));

        let mut namespaces = CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS;
        if network == NetworkPolicy::Deny {
            namespaces |= CloneFlags::CLONE_NEWNET;
        }

        Ok(Self {
            namespaces,
            uid_map: format!("0 {} 1", getuid().as_raw()),
            gid_map: format!("0 {} 1", getgid().as_raw()),
            rootfs,
            links,
            binds,
            limits: vec![
                (Resource::RLIMIT_AS, limits.memory_bytes()),
                (Resource::RLIMIT_CPU, limits.cpu_seconds()),
            ],
        })
    }

    /// Runs in the forked child right before exec.
    fn enter(&self) -> io::Result<()> {
        unshare(self.namespaces)?;
        fs::write("/proc/self/setgroups", "deny")?;
        fs::write("/proc/self/uid_map", &self.uid_map)?;
        fs::write("/proc/self/gid_map", &self.gid_map)?;

        mount(None::<&str>, "/", None::<&str>, MsFlags::MS_REC | MsFlags::MS_PRIVATE, None::<&str>)?;
        let rootfs_flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
        mount(Some("tmpfs"), &self.rootfs, Some("tmpfs"), rootfs_flags, Some("mode=0755"))?;
        for (target, link) in &self.links {
            std::os::unix::fs::symlink(target, link)?;
        }
        for bind in &self.binds {
            bind.apply()?;
        }
        mount(None::<&str>, &self.rootfs, None::<&str>, MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | rootfs_flags, None::<&str>)?;

        std::os::unix::fs::chroot(&self.rootfs)?;
        std::env::set_current_dir(WORK_DIR)?;
        for (resource, limit) in &self.limits {
            setrlimit(*resource, *limit, *limit)?;
        }
        Ok(())
    }
}

fn launch_failure(e: io::Error) -> AttemptFailure {
    if e.kind() == io::ErrorKind::NotFound {
        AttemptFailure::new(ErrorKind::ServiceUnavailable, format!("interpreter not found: {}", e)).retryable(false)
    } else {
        AttemptFailure::new(ErrorKind::SandboxViolation, format!("failed to launch inside the sandbox: {}", e))
    }
}

#[derive(Debug)]
pub struct SandboxBackend {
    config: SandboxConfig,
    isolation: OnceCell<bool>,
}

impl SandboxBackend {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            isolation: OnceCell::new(),
        }
    }

    /// Whether this host lets us build the sandbox: user and mount namespaces
    /// always, a network namespace too when egress is denied. Checked once.
    pub async fn isolation_available(&self) -> bool {
        *self.isolation.get_or_init(|| self.check_isolation()).await
    }

    async fn check_isolation(&self) -> bool {
        let trial = SandboxRequest {
            code: String::new(),
            language: "sh".to_string(),
            limits: ResourceLimits {
                timeout: Duration::from_millis(self.config.default_timeout_ms),
                memory_mb: self.config.default_memory_mb,
            },
            inputs: BTreeMap::new(),
        };
        let outcome = async {
            let workspace = Workspace::prepare(&trial)?;
            let confinement = Confinement::plan(&workspace, self.config.network, trial.limits)?;
            let mut command = Command::new("true");
            command.env_clear()
                .env("PATH", &self.config.path)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);
            // SAFETY: `enter` only touches state prepared before fork.
            unsafe {
                command.pre_exec(move || confinement.enter());
            }
            command.status().await
        };
        match tokio::time::timeout(Duration::from_secs(5), outcome).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                warn!(error = %e, "Sandbox isolation check failed");
                false
            }
            Err(_) => false,
        }
    }

    pub async fn execute(&self, request: &SandboxRequest) -> AttemptOutcome {
        let interpreter = self.config.interpreters.get(&request.language).ok_or_else(|| {
            AttemptFailure::new(ErrorKind::ServiceRejected, format!("unsupported language {:?}", request.language))
        })?;
        for name in request.inputs.keys() {
            if !valid_input_name(name) {
                return Err(AttemptFailure::new(ErrorKind::SandboxViolation, format!("invalid input file name {:?}", name)));
            }
        }
        if !self.isolation_available().await {
            error!(network = ?self.config.network, "Sandbox isolation unavailable, refusing to run untrusted code");
            return Err(AttemptFailure::new(ErrorKind::SandboxViolation, "sandbox isolation is unavailable on this host"));
        }

        let workspace = Workspace::prepare(request).map_err(|e| {
            AttemptFailure::new(ErrorKind::ServiceUnavailable, format!("failed to prepare sandbox workspace: {}", e))
                .retryable(false)
        })?;

        let output = self.run(request, interpreter, &workspace).await?;
        classify(output, request.limits)
    }

    async fn run(&self, request: &SandboxRequest, interpreter: &[String], workspace: &Workspace) -> Result<ExecutionOutput, AttemptFailure> {
        let Some((program, args)) = interpreter.split_first() else {
            return Err(AttemptFailure::new(
                ErrorKind::ServiceRejected,
                format!("no interpreter configured for {:?}", request.language),
            ));
        };
        let confinement = Confinement::plan(workspace, self.config.network, request.limits).map_err(|e| {
            AttemptFailure::new(ErrorKind::ServiceUnavailable, format!("failed to plan sandbox mounts: {}", e))
                .retryable(false)
        })?;

        let mut command = Command::new(program);
        command.args(args)
            .arg(workspace.script_path())
            .env_clear()
            .env("PATH", &self.config.path)
            .env("HOME", WORK_DIR)
            .env("TMPDIR", TMP_DIR)
            .env("LANG", "C.UTF-8")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("TASKWIRE_INPUTS", INPUTS_DIR)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        // SAFETY: `enter` only touches state prepared before fork.
        unsafe {
            command.pre_exec(move || confinement.enter());
        }

        let started = Instant::now();
        let mut child = command.spawn().map_err(launch_failure)?;
        let pid = child.id();
        let cap = self.config.max_output_bytes;
        let stdout = child.stdout.take().map(|out| tokio::spawn(read_capped(out, cap)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(read_capped(err, cap)));

        let status = match tokio::time::timeout(request.limits.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(AttemptFailure::new(ErrorKind::SandboxViolation, format!("lost track of sandboxed process: {}", e)));
            }
            Err(_) => {
                kill_group(pid);
                let _ = child.kill().await;
                for reader in [stdout, stderr].into_iter().flatten() {
                    reader.abort();
                }
                warn!(timeout_ms = request.limits.timeout.as_millis() as u64, "Sandboxed execution timed out");
                return Err(AttemptFailure::new(
                    ErrorKind::ExecutionTimeout,
                    format!("execution exceeded {}ms", request.limits.timeout.as_millis()),
                ));
            }
        };
        let elapsed = started.elapsed();

        let collect = |reader: Option<tokio::task::JoinHandle<(Vec<u8>, bool)>>| async move {
            match reader {
                Some(handle) => match tokio::time::timeout(Duration::from_secs(1), handle).await {
                    Ok(Ok(read)) => read,
                    _ => (Vec::new(), true),
                },
                None => (Vec::new(), false),
            }
        };
        let (out, out_truncated) = collect(stdout).await;
        let (err, err_truncated) = collect(stderr).await;

        Ok(ExecutionOutput {
            stdout: String::from_utf8_lossy(&out).into_owned(),
            stderr: String::from_utf8_lossy(&err).into_owned(),
            exit_code: status.code(),
            signal: status.signal(),
            truncated: out_truncated || err_truncated,
            elapsed,
        })
    }
}

/// Background children share the group; take them down with the interpreter.
fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!(pid, error = %e, "Process group already gone");
    }
}

fn classify(output: ExecutionOutput, limits: ResourceLimits) -> AttemptOutcome {
    let details = json!({
        "stdout": output.stdout,
        "stderr": output.stderr,
        "exitCode": output.exit_code,
        "signal": output.signal,
    }).to_string();

    if let Some(signal) = output.signal {
        let message = if signal == Signal::SIGXCPU as i32 {
            format!("CPU time limit of {}s exceeded", limits.cpu_seconds())
        } else {
            format!("terminated by signal {}", signal)
        };
        return Err(AttemptFailure::new(ErrorKind::SandboxViolation, message).with_details(details));
    }

    match output.exit_code {
        Some(0) => {
            let mut vars = HashMap::from([
                ("stdout".to_string(), json!(output.stdout)),
                ("stderr".to_string(), json!(output.stderr)),
                ("exitCode".to_string(), json!(0)),
            ]);
            if output.truncated {
                vars.insert("outputTruncated".to_string(), json!(true));
            }
            debug!(elapsed_ms = output.elapsed.as_millis() as u64, "Sandboxed execution finished");
            Ok(vars)
        }
        code => {
            let stderr = output.stderr.as_str();
            if stderr.contains("MemoryError") || stderr.contains("Cannot allocate memory") {
                return Err(AttemptFailure::new(
                    ErrorKind::SandboxViolation,
                    format!("memory ceiling of {}MB exceeded", limits.memory_mb),
                ).with_details(details));
            }
            let message = format!(
                "script exited with status {}: {}",
                code.map_or_else(|| "unknown".to_string(), |c| c.to_string()),
                tail(stderr.trim(), STDERR_TAIL),
            );
            Err(AttemptFailure::new(ErrorKind::ScriptFailed, message).with_details(details))
        }
    }
}

#[async_trait]
impl TaskBackend for SandboxBackend {
    fn name(&self) -> &str {
        "sandbox"
    }

    async fn process_task(&self, _endpoint: &ServiceEndpoint, request: &ProcessTaskRequest) -> AttemptOutcome {
        let sandbox_request = SandboxRequest::from_variables(&request.variables, &self.config)?;
        debug!(
            task_id = %request.task_id,
            language = %sandbox_request.language,
            timeout_ms = sandbox_request.limits.timeout.as_millis() as u64,
            memory_mb = sandbox_request.limits.memory_mb,
            "Running sandboxed script"
        );
        self.execute(&sandbox_request).await
    }
}
