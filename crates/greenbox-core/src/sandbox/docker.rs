//! Docker engine — drive the `docker` CLI for sandbox containers

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::engine::{ContainerEngine, ContainerSpec, StatsProbe};

/// `docker stats` format: CPU column, then memory usage column
const STATS_FORMAT: &str = "{{.CPUPerc}},{{.MemUsage}}";

/// Container engine backed by the `docker` binary
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn output(&self, args: &[&str]) -> Result<Output> {
        debug!("Docker: {} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to invoke '{}'", self.binary))
    }

    /// Run a command and return its stdout, failing with stderr on non-zero exit
    async fn checked(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "docker {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Interpret one line of `docker stats --format` output
pub fn parse_stats_line(stdout: &str) -> StatsProbe {
    let line = stdout.trim();
    if line.is_empty() || line.contains("--") {
        return StatsProbe::NotReady;
    }
    match line.split_once(',') {
        Some((cpu, usage)) => {
            // "12.3MiB / 256MiB": keep the used half
            let mem = usage.split('/').next().unwrap_or_default().trim();
            StatsProbe::Sample {
                cpu: cpu.trim().to_string(),
                mem: mem.to_string(),
            }
        }
        None => StatsProbe::NotReady,
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn ping(&self) -> Result<()> {
        let status = Command::new(&self.binary)
            .arg("info")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .with_context(|| format!("'{}' command not found", self.binary))?;

        if !status.success() {
            bail!("Docker daemon is not reachable. Is Docker running?");
        }
        Ok(())
    }

    async fn image_exists(&self, tag: &str) -> Result<bool> {
        let output = self.output(&["image", "inspect", tag]).await?;
        Ok(output.status.success())
    }

    async fn build_image(&self, context: &Path, tag: &str) -> Result<()> {
        info!("Docker: building image '{}' from {}", tag, context.display());

        let mut child = Command::new(&self.binary)
            .args(["build", "--rm", "-t", tag, "-f", "Dockerfile", "."])
            .current_dir(context)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to invoke '{}'", self.binary))?;

        let stdout = child.stdout.take().context("build stdout not captured")?;
        let stderr = child.stderr.take().context("build stderr not captured")?;

        // BuildKit reports progress on stderr, the classic builder on stdout
        let (last_out, last_err) =
            tokio::try_join!(stream_build_output(stdout), stream_build_output(stderr))
                .context("Failed to read build output")?;
        let status = child.wait().await?;

        if !status.success() {
            let detail = last_err
                .or(last_out)
                .unwrap_or_else(|| format!("exit status {}", status));
            return Err(anyhow!(detail));
        }

        info!("Docker: built image '{}'", tag);
        Ok(())
    }

    async fn run_detached(&self, spec: &ContainerSpec) -> Result<String> {
        let args = spec.docker_args();
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self.checked(&refs).await?;
        info!(
            "Docker: started container '{}' ({})",
            spec.name,
            &id[..id.len().min(12)]
        );
        Ok(id)
    }

    async fn stats(&self, name: &str) -> Result<StatsProbe> {
        let output = self
            .output(&["stats", "--no-stream", "--format", STATS_FORMAT, name])
            .await?;
        // Non-zero exit is expected once the container has stopped
        if !output.status.success() {
            return Ok(StatsProbe::Gone);
        }
        Ok(parse_stats_line(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn wait(&self, name: &str) -> Result<i64> {
        let stdout = self.checked(&["wait", name]).await?;
        stdout
            .lines()
            .last()
            .unwrap_or_default()
            .trim()
            .parse::<i64>()
            .with_context(|| format!("Unexpected 'docker wait' output: {}", stdout))
    }

    async fn status(&self, name: &str) -> Result<Option<String>> {
        let output = self
            .output(&["inspect", "-f", "{{.State.Status}}", name])
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let status = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Some(status).filter(|s| !s.is_empty()))
    }

    async fn stop(&self, name: &str, timeout_secs: u64) -> Result<()> {
        let timeout = timeout_secs.to_string();
        self.checked(&["stop", "-t", &timeout, name]).await?;
        info!("Docker: stopped container '{}'", name);
        Ok(())
    }

    async fn logs(&self, name: &str) -> Result<String> {
        let output = self.output(&["logs", name]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("docker logs failed: {}", stderr.trim());
        }
        let mut logs = String::from_utf8_lossy(&output.stdout).to_string();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(logs)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        match self.checked(&["rm", "-f", "-v", name]).await {
            Ok(_) => {
                debug!("Docker: removed container '{}'", name);
                Ok(())
            }
            Err(e) if e.to_string().contains("No such container") => {
                warn!("Docker: container '{}' already removed", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Log each line of build output as it arrives, returning the last non-empty one
async fn stream_build_output<R>(reader: R) -> std::io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut last_line = None;
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if !line.is_empty() {
            info!(" Build> {}", line);
            last_line = Some(line.to_string());
        }
    }
    Ok(last_line)
}
