//! `ansible-playbook` wrapper for microVM lifecycle playbooks

use super::{ExecutionReport, ProvisionAction, ProvisionError, ProvisionRequest, Provisioner};
use crate::config::ProvisionerConfig;
use crate::{Error, Result};
use chrono::Utc;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How long output is still collected after the tool exits
const PIPE_GRACE: Duration = Duration::from_millis(500);

/// Runs one playbook per action against the hypervisor inventory
#[derive(Debug, Clone)]
pub struct AnsibleProvisioner {
    program: PathBuf,
    deploy_path: PathBuf,
    inventory: PathBuf,
    tool_timeout: Duration,
}

impl AnsibleProvisioner {
    /// Check the deploy directory and build the runner
    pub fn new(config: &ProvisionerConfig) -> Result<Self> {
        let deploy_path = config.deploy_path.clone();
        if !deploy_path.is_dir() {
            return Err(Error::Config(format!(
                "deploy path {} does not exist",
                deploy_path.display()
            )));
        }

        for action in ProvisionAction::ALL {
            let playbook = deploy_path.join(action.playbook());
            if !playbook.is_file() {
                return Err(Error::Config(format!(
                    "playbook {} not found",
                    playbook.display()
                )));
            }
        }

        let inventory = if config.inventory.is_absolute() {
            config.inventory.clone()
        } else {
            deploy_path.join(&config.inventory)
        };
        if !inventory.exists() {
            return Err(Error::Config(format!(
                "inventory {} not found",
                inventory.display()
            )));
        }

        tracing::debug!(
            deploy_path = %deploy_path.display(),
            inventory = %inventory.display(),
            "Provisioner ready"
        );

        Ok(Self {
            program: config.program.clone(),
            deploy_path,
            inventory,
            tool_timeout: config.tool_timeout,
        })
    }

    pub fn tool_timeout(&self) -> Duration {
        self.tool_timeout
    }

    /// Command-line arguments for one run
    pub fn command_args(&self, action: ProvisionAction, request: &ProvisionRequest) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            self.inventory.to_string_lossy().to_string(),
            self.playbook_path(action).to_string_lossy().to_string(),
            "--extra-vars".to_string(),
            request.extra_vars().to_string(),
        ];
        if let Some(host) = &request.host {
            args.push("--limit".to_string());
            args.push(host.clone());
        }
        args
    }

    fn playbook_path(&self, action: ProvisionAction) -> PathBuf {
        self.deploy_path.join(action.playbook())
    }
}

impl Provisioner for AnsibleProvisioner {
    fn run(
        &self,
        action: ProvisionAction,
        request: &ProvisionRequest,
        timeout: Duration,
    ) -> std::result::Result<ExecutionReport, ProvisionError> {
        let budget = timeout.min(self.tool_timeout);
        let args = self.command_args(action, request);
        let started_at = Utc::now();

        tracing::info!(
            vm_id = %request.vm_id,
            action = %action,
            budget_ms = budget.as_millis() as u64,
            "Running playbook"
        );

        let output = run_with_deadline(&self.program, &args, &self.deploy_path, budget)?;
        let report = ExecutionReport::parse(
            action,
            &output.stdout,
            &output.stderr,
            output.status.code(),
            started_at,
        );

        tracing::info!(
            vm_id = %request.vm_id,
            action = %action,
            exit_code = ?report.exit_code,
            steps = %report.counts(),
            duration_ms = report.duration().num_milliseconds(),
            "Playbook finished"
        );

        report.into_result()
    }
}

struct ToolOutput {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

/// Spawn the tool and wait for it, killing it once `budget` runs out
fn run_with_deadline(
    program: &Path,
    args: &[String],
    cwd: &Path,
    budget: Duration,
) -> std::result::Result<ToolOutput, ProvisionError> {
    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .env("ANSIBLE_HOST_KEY_CHECKING", "False")
        .env("ANSIBLE_NOCOLOR", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            ProvisionError::Setup(format!("failed to launch {}: {}", program.display(), e))
        })?;

    let (tx, rx) = mpsc::channel();
    drain(child.stdout.take(), Pipe::Stdout, tx.clone());
    drain(child.stderr.take(), Pipe::Stderr, tx);

    let deadline = Instant::now() + budget;
    let status = match wait_until(&mut child, deadline) {
        Ok(Some(status)) => status,
        Ok(None) => {
            tracing::warn!(program = %program.display(), "Provisioning tool killed after {:?}", budget);
            return Err(ProvisionError::Timeout(budget));
        }
        Err(e) => return Err(ProvisionError::Setup(format!("waiting for tool: {}", e))),
    };

    // Background children of the tool can keep the pipes open long after it exits
    let mut captured = Captured::default();
    if !captured.collect(&rx, deadline.min(Instant::now() + PIPE_GRACE)) {
        tracing::warn!(
            program = %program.display(),
            "Tool exited but its output pipes are still open; using output read so far"
        );
    }

    Ok(ToolOutput {
        status,
        stdout: String::from_utf8_lossy(&captured.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&captured.stderr).into_owned(),
    })
}

/// `Ok(None)` means the deadline passed and the child was killed
fn wait_until(child: &mut Child, deadline: Instant) -> std::io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

#[derive(Debug, Clone, Copy)]
enum Pipe {
    Stdout,
    Stderr,
}

enum Chunk {
    Data(Pipe, Vec<u8>),
    Closed,
}

/// Forward everything read from `pipe` until EOF, then report it closed
fn drain<R: Read + Send + 'static>(pipe: Option<R>, which: Pipe, tx: Sender<Chunk>) {
    let Some(mut pipe) = pipe else {
        let _ = tx.send(Chunk::Closed);
        return;
    };
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(Chunk::Data(which, buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let _ = tx.send(Chunk::Closed);
    });
}

#[derive(Default)]
struct Captured {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    closed: usize,
}

impl Captured {
    /// Gather output until both pipes close or `until` passes.
    /// Returns whether both pipes closed.
    fn collect(&mut self, rx: &Receiver<Chunk>, until: Instant) -> bool {
        while self.closed < 2 {
            let left = until.saturating_duration_since(Instant::now());
            match rx.recv_timeout(left) {
                Ok(Chunk::Data(Pipe::Stdout, bytes)) => self.stdout.extend_from_slice(&bytes),
                Ok(Chunk::Data(Pipe::Stderr, bytes)) => self.stderr.extend_from_slice(&bytes),
                Ok(Chunk::Closed) => self.closed += 1,
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => return true,
            }
        }
        true
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    // Script files are written and executed under one lock so no concurrent
    // fork inherits a write handle (ETXTBSY).
    static SPAWN_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

    fn deploy_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        for action in ProvisionAction::ALL {
            std::fs::write(dir.path().join(action.playbook()), "- hosts: all\n").unwrap();
        }
        std::fs::write(dir.path().join("inventory.ini"), "[microvm]\nfc-host-1\n").unwrap();
        dir
    }

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-playbook.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn provisioner(dir: &TempDir, program: PathBuf) -> AnsibleProvisioner {
        let config = ProvisionerConfig::default()
            .program(program)
            .deploy_path(dir.path())
            .inventory("inventory.ini")
            .tool_timeout(Duration::from_secs(10));
        AnsibleProvisioner::new(&config).unwrap()
    }

    fn request() -> ProvisionRequest {
        ProvisionRequest::new("srv-1a2b3c4d", 2, 256)
            .ip_address(Some("172.16.0.2".into()))
            .host(Some("fc-host-1".into()))
    }

    #[test]
    fn test_new_requires_playbooks() {
        let dir = deploy_dir();
        std::fs::remove_file(dir.path().join("stop-vm.yml")).unwrap();
        let config = ProvisionerConfig::default()
            .deploy_path(dir.path())
            .inventory("inventory.ini");
        match AnsibleProvisioner::new(&config) {
            Err(Error::Config(msg)) => assert!(msg.contains("stop-vm.yml")),
            other => panic!("expected config error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_new_requires_deploy_dir() {
        let config = ProvisionerConfig::default().deploy_path("/nonexistent/mvkube-deploy");
        assert!(matches!(AnsibleProvisioner::new(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_command_args() {
        let dir = deploy_dir();
        let p = provisioner(&dir, PathBuf::from("ansible-playbook"));
        let args = p.command_args(ProvisionAction::Create, &request());
        assert_eq!(args[0], "-i");
        assert!(args[1].ends_with("inventory.ini"));
        assert!(args[2].ends_with("create-vm.yml"));
        assert_eq!(args[3], "--extra-vars");
        let vars: serde_json::Value = serde_json::from_str(&args[4]).unwrap();
        assert_eq!(vars["vm_id"], "srv-1a2b3c4d");
        assert_eq!(&args[5..], ["--limit", "fc-host-1"]);

        let no_host = ProvisionRequest::new("srv-1a2b3c4d", 1, 128);
        assert_eq!(p.command_args(ProvisionAction::Stop, &no_host).len(), 5);
    }

    #[test]
    fn test_run_success_collects_steps() {
        let _guard = SPAWN_LOCK.lock();
        let dir = deploy_dir();
        let program = script(
            dir.path(),
            r#"printf '%s\n' "$@" > args.txt
echo 'PLAY [microvm] ***'
echo '{"name": "create jail", "status": "changed", "host": "fc-host-1"}'
echo '{"name": "boot vm", "status": "ok", "facts": {"rootfs_path": "/srv/jail/srv-1a2b3c4d/rootfs.ext4"}}'"#,
        );
        let p = provisioner(&dir, program);

        let report = p
            .run(ProvisionAction::Create, &request(), Duration::from_secs(5))
            .unwrap();
        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.output, vec!["PLAY [microvm] ***".to_string()]);
        assert_eq!(report.fact("rootfs_path"), Some("/srv/jail/srv-1a2b3c4d/rootfs.ext4"));

        let args = std::fs::read_to_string(dir.path().join("args.txt")).unwrap();
        assert!(args.lines().any(|l| l == "--limit"));
        assert!(args.lines().any(|l| l.ends_with("create-vm.yml")));
    }

    #[test]
    fn test_run_failed_step_is_rejected() {
        let _guard = SPAWN_LOCK.lock();
        let dir = deploy_dir();
        let program = script(
            dir.path(),
            r#"echo '{"name": "start firecracker", "status": "failed", "msg": "kvm not available"}'
exit 2"#,
        );
        let p = provisioner(&dir, program);

        match p.run(ProvisionAction::Start, &request(), Duration::from_secs(5)) {
            Err(ProvisionError::Rejected(msg)) => {
                assert!(msg.starts_with("start-vm.yml failed at step 'start firecracker'"));
                assert!(msg.contains("kvm not available"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_run_unreachable() {
        let _guard = SPAWN_LOCK.lock();
        let dir = deploy_dir();
        let program = script(
            dir.path(),
            r#"echo '{"name": "gather facts", "status": "unreachable", "host": "fc-host-1", "msg": "ssh timeout"}'
exit 4"#,
        );
        let p = provisioner(&dir, program);

        let err = p
            .run(ProvisionAction::Delete, &request(), Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Unreachable(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_run_nonzero_exit_without_steps() {
        let _guard = SPAWN_LOCK.lock();
        let dir = deploy_dir();
        let program = script(dir.path(), "echo 'ERROR! the playbook could not be parsed' >&2\nexit 1");
        let p = provisioner(&dir, program);

        match p.run(ProvisionAction::Stop, &request(), Duration::from_secs(5)) {
            Err(ProvisionError::Rejected(msg)) => {
                assert_eq!(msg, "stop-vm.yml exited with code 1: ERROR! the playbook could not be parsed")
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_run_times_out() {
        let _guard = SPAWN_LOCK.lock();
        let dir = deploy_dir();
        let program = script(dir.path(), "exec sleep 10");
        let p = provisioner(&dir, program);

        let started = Instant::now();
        let err = p
            .run(ProvisionAction::Create, &request(), Duration::from_millis(300))
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Timeout(d) if d == Duration::from_millis(300)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_background_child_does_not_hold_run_open() {
        let _guard = SPAWN_LOCK.lock();
        let dir = deploy_dir();
        // The backgrounded sleep inherits stdout and stderr
        let program = script(
            dir.path(),
            r#"echo '{"name": "start firecracker", "status": "ok"}'
sleep 6 &
exit 0"#,
        );
        let p = provisioner(&dir, program);

        let started = Instant::now();
        let report = p
            .run(ProvisionAction::Start, &request(), Duration::from_secs(1))
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].name, "start firecracker");
    }

    #[test]
    fn test_missing_program_is_setup_error() {
        let dir = deploy_dir();
        let p = provisioner(&dir, dir.path().join("no-such-tool"));
        let err = p
            .run(ProvisionAction::Create, &request(), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Setup(_)));
    }
}
