//! Downloader adapter
//!
//! Wraps the external single-shot downloader binary (ngapost2md). The binary
//! is an exclusive resource: invocations are serialised through a mutex so at
//! most one child process runs at a time. A non-zero exit code is *not* a
//! hard error (the binary exits non-zero for conditions it has already
//! reported on stdout), so the outcome is always decided by parsing the
//! captured output.
//!
//! The adapter is also the authoritative reader of the binary's own ini
//! config: the forum user agent, base URL, and auth cookies all come from
//! there, and missing configs are bootstrapped with `--gen-config-file`.

use crate::error::{Error, Result};
use crate::types::TopicId;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::process::Command;

/// End-of-task marker printed by the downloader on success
const MARKER_FINISHED: &str = "任务结束";
/// Failure marker; the rest of the line is the failure message
const MARKER_BAD_CODE: &str = "返回代码不为";

/// The downloader's own ini config, next to the binary
const DOWNLOADER_INI: &str = "config.ini";

/// Placeholder values the generated config ships with (e.g. `<你的UID>`)
static PLACEHOLDER_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^<.*>$").expect("placeholder regex is valid"));

/// Outcome of one downloader invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownOutcome {
    /// Whether the output carried the end-of-task marker
    pub success: bool,
    /// Failure message (empty on success or when the output was inconclusive)
    pub message: String,
}

/// The seam between the refresh worker and the child process.
///
/// Production uses [`ProgramDownloader`]; tests substitute stubs.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Download (or re-synchronise) one topic into `workdir`.
    async fn download(&self, id: TopicId, workdir: &Path) -> DownOutcome;
}

/// Network settings read from the downloader's ini
#[derive(Clone, Debug, Default)]
pub struct NetConfig {
    /// Forum user agent
    pub ua: String,
    /// Forum base URL (e.g. `https://bbs.nga.cn`)
    pub base_url: String,
    /// Auth cookie `ngaPassportUid`
    pub passport_uid: String,
    /// Auth cookie `ngaPassportCid`
    pub passport_cid: String,
    /// Whether the downloader leaves image URLs inline instead of mirroring
    pub use_network_pic_url: bool,
}

impl NetConfig {
    /// The cookie header value for forum requests.
    pub fn cookie(&self) -> String {
        format!(
            "ngaPassportUid={};ngaPassportCid={}",
            self.passport_uid, self.passport_cid
        )
    }
}

/// Parse the downloader outcome out of its combined output.
///
/// Scans from the last non-empty line backward: the end-of-task marker wins,
/// a bad-return-code marker fails with the message from that marker onward,
/// and output with neither marker is inconclusive (treated as failure with an
/// empty message).
pub fn parse_outcome(output: &str) -> DownOutcome {
    for line in output.lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.contains(MARKER_FINISHED) {
            return DownOutcome {
                success: true,
                message: String::new(),
            };
        }
        if let Some(idx) = line.find(MARKER_BAD_CODE) {
            return DownOutcome {
                success: false,
                message: line[idx..].to_string(),
            };
        }
    }
    DownOutcome {
        success: false,
        message: String::new(),
    }
}

/// Child-process implementation of [`Downloader`]
#[derive(Debug)]
pub struct ProgramDownloader {
    program: PathBuf,
    /// The binary is an exclusive resource
    lock: tokio::sync::Mutex<()>,
}

impl ProgramDownloader {
    /// Wrap the binary at `program`; fails if the file does not exist.
    pub fn new(program: impl Into<PathBuf>) -> Result<Self> {
        let program = program.into();
        if !program.is_file() {
            return Err(Error::Downloader(format!(
                "downloader binary not found: {}",
                program.display()
            )));
        }
        Ok(Self {
            program,
            lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The directory holding the binary (and its config).
    pub fn program_dir(&self) -> &Path {
        self.program.parent().unwrap_or(Path::new("."))
    }

    /// Read the downloader's ini, bootstrapping and upgrading it as needed,
    /// and reject placeholder auth values.
    ///
    /// Called once at startup; placeholder cookies are a fatal configuration
    /// error because every download would fail against the forum anyway.
    pub async fn bootstrap(&self) -> Result<NetConfig> {
        let ini_path = self.program_dir().join(DOWNLOADER_INI);
        if !ini_path.exists() {
            tracing::info!(path = %ini_path.display(), "generating downloader config");
            self.run_in_program_dir(&["--gen-config-file"]).await?;
            if !ini_path.exists() {
                return Err(Error::Downloader(
                    "--gen-config-file produced no config".to_string(),
                ));
            }
        }

        let raw = tokio::fs::read_to_string(&ini_path).await?;
        // Case-sensitive: the cookie keys must survive a write-back upgrade.
        let mut ini = configparser::ini::Ini::new_cs();
        ini.read(raw)
            .map_err(|e| Error::Downloader(format!("unreadable downloader config: {e}")))?;

        let get = |section: &str, key: &str| -> Result<String> {
            let value = ini.get(section, key).unwrap_or_default();
            if PLACEHOLDER_RE.is_match(value.trim()) {
                return Err(Error::Config {
                    message: format!("downloader config still has placeholder value for {key}"),
                    key: Some(format!("{section}.{key}")),
                });
            }
            Ok(value)
        };

        let net = NetConfig {
            ua: get("network", "ua")?,
            base_url: get("network", "base_url")?,
            passport_uid: get("network", "ngaPassportUid")?,
            passport_cid: get("network", "ngaPassportCid")?,
            use_network_pic_url: ini
                .getbool("post", "use_network_pic_url")
                .ok()
                .flatten()
                .unwrap_or(false),
        };

        // Upgrade older configs: the remote-pic key must exist for the
        // asset-repair pipeline to know which mode the downloader runs in.
        if ini.get("post", "use_network_pic_url").is_none() {
            ini.set("post", "use_network_pic_url", Some("True".to_string()));
            ini.write(&ini_path)
                .map_err(|e| Error::Downloader(format!("failed to upgrade config: {e}")))?;
            tracing::info!("added post.use_network_pic_url to downloader config");
        }

        Ok(net)
    }

    /// Report the binary's version string (`-v`), for the startup log.
    pub async fn version(&self) -> Result<String> {
        let output = self.run_in_program_dir(&["-v"]).await?;
        Ok(output.lines().next().unwrap_or_default().trim().to_string())
    }

    async fn run_in_program_dir(&self, args: &[&str]) -> Result<String> {
        let _guard = self.lock.lock().await;
        run_captured(&self.program, args, self.program_dir()).await
    }
}

#[async_trait]
impl Downloader for ProgramDownloader {
    async fn download(&self, id: TopicId, workdir: &Path) -> DownOutcome {
        let _guard = self.lock.lock().await;
        let arg = id.to_string();
        match run_captured(&self.program, &[&arg], workdir).await {
            Ok(output) => {
                let outcome = parse_outcome(&output);
                tracing::debug!(
                    topic = id.0,
                    success = outcome.success,
                    "downloader finished"
                );
                outcome
            }
            Err(e) => DownOutcome {
                success: false,
                message: e.to_string(),
            },
        }
    }
}

/// Run the binary, inheriting the environment, capturing stdout and stderr
/// combined. A non-zero exit code is tolerated: the captured output is still
/// returned for outcome parsing.
async fn run_captured(program: &Path, args: &[&str], workdir: &Path) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .current_dir(workdir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| Error::Downloader(format!("failed to spawn {}: {e}", program.display())))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.stderr.is_empty() {
        combined.push('\n');
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
    }
    if !output.status.success() {
        tracing::debug!(code = ?output.status.code(), "downloader exited non-zero");
    }
    Ok(combined)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_outcome_success_marker() {
        let out = "下载页面 1\n下载页面 2\n任务结束\n\n";
        let outcome = parse_outcome(out);
        assert!(outcome.success);
        assert!(outcome.message.is_empty());
    }

    #[test]
    fn test_parse_outcome_failure_marker_keeps_tail() {
        let out = "下载页面 1\nGET https://example 返回代码不为 200: 403\n";
        let outcome = parse_outcome(out);
        assert!(!outcome.success);
        assert_eq!(outcome.message, "返回代码不为 200: 403");
    }

    #[test]
    fn test_parse_outcome_scans_from_last_nonempty_line() {
        // A failure on an earlier attempt followed by a final success.
        let out = "返回代码不为 200\n重试\n任务结束\n";
        assert!(parse_outcome(out).success);
    }

    #[test]
    fn test_parse_outcome_inconclusive_is_failure_with_empty_message() {
        let outcome = parse_outcome("some chatter\nwithout any marker\n");
        assert!(!outcome.success);
        assert!(outcome.message.is_empty());
        assert_eq!(parse_outcome(""), outcome);
    }

    #[test]
    fn test_placeholder_values_are_detected() {
        assert!(PLACEHOLDER_RE.is_match("<你的UID>"));
        assert!(PLACEHOLDER_RE.is_match("<uid>"));
        assert!(!PLACEHOLDER_RE.is_match("123456"));
        assert!(!PLACEHOLDER_RE.is_match("Mozilla/5.0 <compatible>x"));
    }

    #[test]
    fn test_missing_binary_is_rejected() {
        match ProgramDownloader::new("/definitely/not/here") {
            Err(Error::Downloader(msg)) => assert!(msg.contains("not found")),
            other => panic!("expected downloader error, got {other:?}"),
        }
    }

    #[test]
    fn test_net_config_cookie() {
        let net = NetConfig {
            passport_uid: "1".into(),
            passport_cid: "abc".into(),
            ..Default::default()
        };
        assert_eq!(net.cookie(), "ngaPassportUid=1;ngaPassportCid=abc");
    }
}
