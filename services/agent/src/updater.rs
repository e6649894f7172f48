//! Self-update for `update_agent`.
//!
//! The command is acknowledged as soon as the download task is spawned.
//! Once the new binary is in place the process exits so its supervisor
//! restarts it; there is no completion reply.

use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dockhand_bus::AgentUpdater;
use dockhand_common::UpdateAgentRequest;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};

/// Largest accepted download.
const MAX_DOWNLOAD_BYTES: u64 = 200 * 1024 * 1024;

type InstalledHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
pub struct SelfUpdater {
    client: reqwest::Client,
    target: PathBuf,
    in_progress: Arc<AtomicBool>,
    on_installed: InstalledHook,
}

impl SelfUpdater {
    /// Replace `target`, then run `on_installed`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(target: PathBuf, on_installed: impl Fn() + Send + Sync + 'static) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(600))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            target,
            in_progress: Arc::new(AtomicBool::new(false)),
            on_installed: Arc::new(on_installed),
        })
    }

    /// Replace the running executable and exit afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the executable path cannot be determined.
    pub fn for_current_exe() -> Result<Self> {
        let target = std::env::current_exe().context("cannot locate the running executable")?;
        Self::new(target, || {
            tracing::info!("agent binary replaced, exiting for restart");
            std::process::exit(0);
        })
    }

    fn binary_name(&self) -> String {
        self.target
            .file_name()
            .map_or_else(|| "dockhand-agent".to_string(), |n| n.to_string_lossy().into_owned())
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to download {url}"))?
            .error_for_status()
            .with_context(|| format!("download of {url} was refused"))?;
        if let Some(announced) = response.content_length() {
            ensure_within_limit(announced)?;
        }
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.context("failed to read download body")? {
            ensure_within_limit(u64::try_from(bytes.len() + chunk.len()).unwrap_or(u64::MAX))?;
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }

    /// Download, verify, unpack and install.
    ///
    /// # Errors
    ///
    /// Returns the first failing step; the current binary is left in place.
    pub async fn apply(&self, request: &UpdateAgentRequest) -> Result<()> {
        let bytes = self.download(&request.url).await?;
        verify_sha256(&bytes, request.sha256.as_deref())?;
        let binary = unpack(&request.url, bytes, &self.binary_name())?;
        install(&self.target, &binary)
    }
}

impl AgentUpdater for SelfUpdater {
    fn begin(&self, request: UpdateAgentRequest) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .context("self-update needs a running async runtime")?;
        if self.in_progress.swap(true, Ordering::SeqCst) {
            anyhow::bail!("an update is already in progress");
        }
        let updater = self.clone();
        handle.spawn(async move {
            tracing::info!(url = %request.url, version = ?request.version, "agent update started");
            match updater.apply(&request).await {
                Ok(()) => (updater.on_installed)(),
                Err(e) => {
                    tracing::error!(error = %format!("{e:#}"), "agent update failed");
                    updater.in_progress.store(false, Ordering::SeqCst);
                }
            }
        });
        Ok(())
    }
}

fn ensure_within_limit(len: u64) -> Result<()> {
    anyhow::ensure!(
        len <= MAX_DOWNLOAD_BYTES,
        "download is {len} bytes or more, over the {MAX_DOWNLOAD_BYTES} byte limit"
    );
    Ok(())
}

/// # Errors
///
/// Returns an error on checksum mismatch. `None` skips the check.
pub fn verify_sha256(bytes: &[u8], expected: Option<&str>) -> Result<()> {
    let Some(expected) = expected else {
        tracing::warn!("no sha256 given, skipping download verification");
        return Ok(());
    };
    let actual = format!("{:x}", Sha256::digest(bytes));
    let expected = expected.trim().to_ascii_lowercase();
    anyhow::ensure!(
        actual == expected,
        "checksum mismatch: expected {expected}, got {actual}"
    );
    Ok(())
}

fn is_gzip(url: &str, bytes: &[u8]) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.ends_with(".tar.gz") || path.ends_with(".tgz") || bytes.starts_with(&[0x1f, 0x8b])
}

/// The agent binary from a `.tar.gz` release asset, or `bytes` as-is.
///
/// # Errors
///
/// Returns an error if the archive is unreadable or has no file named
/// `binary_name`.
pub fn unpack(url: &str, bytes: Vec<u8>, binary_name: &str) -> Result<Vec<u8>> {
    if !is_gzip(url, &bytes) {
        return Ok(bytes);
    }
    let mut archive = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
    for entry in archive.entries().context("failed to read update archive")? {
        let mut entry = entry.context("corrupt entry in update archive")?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path().context("bad path in update archive")?.into_owned();
        if path.file_name().is_some_and(|name| name == binary_name) {
            let mut binary = Vec::new();
            entry
                .read_to_end(&mut binary)
                .context("failed to extract agent binary")?;
            return Ok(binary);
        }
    }
    anyhow::bail!("update archive has no '{binary_name}' binary")
}

/// Write `binary` next to `target` and swap it in.
///
/// # Errors
///
/// Returns an error if staging or the swap fails.
pub fn install(target: &Path, binary: &[u8]) -> Result<()> {
    anyhow::ensure!(!binary.is_empty(), "refusing to install an empty binary");
    let dir = target.parent().context("executable has no parent directory")?;
    let name = target
        .file_name()
        .context("executable has no file name")?
        .to_string_lossy();
    let staged = dir.join(format!(".{name}.new"));
    let backup = dir.join(format!(".{name}.old"));

    std::fs::write(&staged, binary)
        .with_context(|| format!("failed to stage {}", staged.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755))
            .context("failed to mark staged binary executable")?;
    }
    self_update::Move::from_source(&staged)
        .replace_using_temp(&backup)
        .to_dest(target)
        .with_context(|| format!("failed to replace {}", target.display()))?;
    tracing::info!(path = %target.display(), bytes = binary.len(), "agent binary installed");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::wildcard_imports)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn tarball(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn checksum_accepts_match_in_any_case() {
        let digest = format!("{:x}", Sha256::digest(b"agent"));
        verify_sha256(b"agent", Some(&digest.to_uppercase())).unwrap();
        verify_sha256(b"agent", None).unwrap();
        let err = verify_sha256(b"agent", Some("00")).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn download_limit_is_inclusive() {
        ensure_within_limit(MAX_DOWNLOAD_BYTES).unwrap();
        let err = ensure_within_limit(MAX_DOWNLOAD_BYTES + 1).unwrap_err();
        assert!(err.to_string().contains("byte limit"));
    }

    #[tokio::test]
    async fn oversized_download_is_rejected_from_its_length_header() {
        use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n",
                MAX_DOWNLOAD_BYTES + 1
            );
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(b"partial").await;
        });

        let dir = tempfile::tempdir().unwrap();
        let updater = SelfUpdater::new(dir.path().join("dockhand-agent"), || {}).unwrap();
        let err = updater
            .download(&format!("http://{addr}/agent"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("byte limit"), "{err:#}");
    }

    #[test]
    fn plain_binary_passes_through() {
        let bytes = b"\x7fELF...".to_vec();
        assert_eq!(
            unpack("https://example.com/dockhand-agent", bytes.clone(), "dockhand-agent").unwrap(),
            bytes
        );
    }

    #[test]
    fn tarball_yields_named_binary() {
        let archive = tarball(&[
            ("release/README.md", b"docs"),
            ("release/dockhand-agent", b"new-binary"),
        ]);
        let binary = unpack(
            "https://example.com/dockhand-agent-linux-amd64.tar.gz?sig=abc",
            archive,
            "dockhand-agent",
        )
        .unwrap();
        assert_eq!(binary, b"new-binary");
    }

    #[test]
    fn tarball_without_binary_is_an_error() {
        let archive = tarball(&[("README.md", b"docs")]);
        assert!(unpack("https://example.com/a.tgz", archive, "dockhand-agent").is_err());
    }

    #[test]
    fn gzip_is_detected_by_magic_bytes() {
        let archive = tarball(&[("dockhand-agent", b"bin")]);
        assert!(is_gzip("https://example.com/latest", &archive));
        assert!(!is_gzip("https://example.com/latest", b"plain"));
    }

    #[test]
    fn install_replaces_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("dockhand-agent");
        std::fs::write(&target, b"old").unwrap();
        install(&target, b"new").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"new");
        assert!(install(&target, b"").is_err());
    }

    #[tokio::test]
    async fn second_update_is_rejected_while_first_runs() {
        let dir = tempfile::tempdir().unwrap();
        let updater = SelfUpdater::new(dir.path().join("dockhand-agent"), || {}).unwrap();
        // Port 9 refuses connections, so the spawned attempt fails quietly.
        let request = UpdateAgentRequest {
            url: "http://127.0.0.1:9/agent".to_string(),
            sha256: None,
            version: None,
        };
        updater.in_progress.store(true, Ordering::SeqCst);
        assert!(updater.begin(request.clone()).is_err());
        updater.in_progress.store(false, Ordering::SeqCst);
        updater.begin(request).unwrap();
    }

    #[test]
    fn begin_outside_runtime_fails() {
        let dir = tempfile::tempdir().unwrap();
        let updater = SelfUpdater::new(dir.path().join("dockhand-agent"), || {}).unwrap();
        let request = UpdateAgentRequest {
            url: "http://127.0.0.1:9/agent".to_string(),
            sha256: None,
            version: None,
        };
        assert!(updater.begin(request).is_err());
    }
}
