use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Outcome of one VBoxManage invocation.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub cmd: Vec<String>,
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Thin wrapper around VBoxManage commands.
///
/// Only the commands the orchestrator needs are wrapped; everything else
/// stays on the CLI.
#[derive(Clone)]
pub struct VBoxClient {
    vboxmanage_path: String,
}

impl VBoxClient {
    pub fn new(vboxmanage_path: String) -> Self {
        VBoxClient { vboxmanage_path }
    }

    async fn run(
        &self,
        args: &[&str],
    ) -> Result<CommandResult, Box<dyn std::error::Error + Send + Sync>> {
        let result = self.run_unchecked(args).await?;
        if result.returncode != 0 {
            let msg = if result.stderr.trim().is_empty() {
                "VBoxManage command failed".to_string()
            } else {
                result.stderr.trim().to_string()
            };
            return Err(msg.into());
        }
        Ok(result)
    }

    /// Run without mapping a non-zero exit to an error; the screenshot
    /// loop tolerates transient failures.
    pub async fn run_unchecked(
        &self,
        args: &[&str],
    ) -> Result<CommandResult, Box<dyn std::error::Error + Send + Sync>> {
        let mut cmd_line = vec![self.vboxmanage_path.clone()];
        cmd_line.extend(args.iter().map(|s| s.to_string()));

        let mut child = Command::new(&self.vboxmanage_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let run = async {
            let io = async {
                let mut out = Vec::new();
                let mut err = Vec::new();
                if let Some(ref mut pipe) = stdout_pipe {
                    let _ = pipe.read_to_end(&mut out).await;
                }
                if let Some(ref mut pipe) = stderr_pipe {
                    let _ = pipe.read_to_end(&mut err).await;
                }
                (out, err)
            };
            let (io, status) = tokio::join!(io, child.wait());
            (io, status)
        };

        match tokio::time::timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS), run).await {
            Ok(((out, err), status)) => {
                let status = status?;
                Ok(CommandResult {
                    cmd: cmd_line,
                    returncode: status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&out).to_string(),
                    stderr: String::from_utf8_lossy(&err).to_string(),
                })
            }
            Err(_) => {
                let _ = child.start_kill();
                let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
                Err(format!("VBoxManage timed out: {}", cmd_line.join(" ")).into())
            }
        }
    }

    pub async fn list_vms(&self) -> Result<CommandResult, Box<dyn std::error::Error + Send + Sync>> {
        self.run(&["list", "vms"]).await
    }

    pub async fn list_running_vms(
        &self,
    ) -> Result<CommandResult, Box<dyn std::error::Error + Send + Sync>> {
        self.run(&["list", "runningvms"]).await
    }

    pub async fn show_vm_info(
        &self,
        vm: &str,
    ) -> Result<CommandResult, Box<dyn std::error::Error + Send + Sync>> {
        self.run(&["showvminfo", vm, "--machinereadable"]).await
    }

    pub async fn start_vm(
        &self,
        vm: &str,
        headless: bool,
    ) -> Result<CommandResult, Box<dyn std::error::Error + Send + Sync>> {
        if headless {
            self.run(&["startvm", vm, "--type", "headless"]).await
        } else {
            self.run(&["startvm", vm]).await
        }
    }

    pub async fn control_vm(
        &self,
        vm: &str,
        action: &str,
    ) -> Result<CommandResult, Box<dyn std::error::Error + Send + Sync>> {
        self.run(&["controlvm", vm, action]).await
    }

    pub async fn poweroff_vm(
        &self,
        vm: &str,
    ) -> Result<CommandResult, Box<dyn std::error::Error + Send + Sync>> {
        self.control_vm(vm, "poweroff").await
    }

    pub async fn savestate_vm(
        &self,
        vm: &str,
    ) -> Result<CommandResult, Box<dyn std::error::Error + Send + Sync>> {
        self.control_vm(vm, "savestate").await
    }

    /// Power the VM down: hard off when forced, ACPI power button otherwise.
    pub async fn shutdown(
        &self,
        vm: &str,
        force: bool,
    ) -> Result<CommandResult, Box<dyn std::error::Error + Send + Sync>> {
        let action = if force { "poweroff" } else { "acpipowerbutton" };
        self.run(&["controlvm", vm, action]).await
    }

    pub async fn snapshot_take(
        &self,
        vm: &str,
        name: &str,
    ) -> Result<CommandResult, Box<dyn std::error::Error + Send + Sync>> {
        self.run(&["snapshot", vm, "take", name]).await
    }

    pub async fn snapshot_restore(
        &self,
        vm: &str,
        name: &str,
    ) -> Result<CommandResult, Box<dyn std::error::Error + Send + Sync>> {
        self.run(&["snapshot", vm, "restore", name]).await
    }

    pub async fn snapshot_restore_current(
        &self,
        vm: &str,
    ) -> Result<CommandResult, Box<dyn std::error::Error + Send + Sync>> {
        self.run(&["snapshot", vm, "restorecurrent"]).await
    }

    /// Enumerate guest properties; used to discover the VM's host-only IP.
    pub async fn guest_properties(
        &self,
        vm: &str,
    ) -> Result<CommandResult, Box<dyn std::error::Error + Send + Sync>> {
        self.run(&["guestproperty", "enumerate", vm]).await
    }

    pub async fn vm_ip(
        &self,
        vm: &str,
    ) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
        let result = self.guest_properties(vm).await?;
        Ok(parse_guest_ip(&result.stdout))
    }

    /// Capture the VM display into a PNG file.
    pub async fn screenshot_png(
        &self,
        vm: &str,
        file: &str,
    ) -> Result<CommandResult, Box<dyn std::error::Error + Send + Sync>> {
        self.run_unchecked(&["controlvm", vm, "screenshotpng", file])
            .await
    }
}

/// Pull the first IPv4 guest-info address out of `guestproperty enumerate`
/// output, e.g. `Name: /VirtualBox/GuestInfo/Net/0/V4/IP, value: 192.168.56.105, ...`.
pub fn parse_guest_ip(stdout: &str) -> Option<String> {
    for line in stdout.lines() {
        if !line.contains("/VirtualBox/GuestInfo/Net/") || !line.contains("/V4/IP") {
            continue;
        }
        if let Some(idx) = line.find("value:") {
            let rest = &line[idx + "value:".len()..];
            let value = rest.split(',').next().unwrap_or("").trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}
