//! Asset-repair pipeline
//!
//! Two things break cached images: the forum serving an HTML error page that
//! got written where an image should be, and remote-pic mode leaving image
//! URLs inline with nothing mirrored at all. Both cases funnel into one
//! repair channel drained by a single worker that sleeps a random interval
//! between tasks; the image hosts rate-limit aggressively and a burst of
//! re-fetches is indistinguishable from a scraper.

use crate::config::{RepairConfig, UaPolicy};
use crate::error::{Error, Result};
use crate::sandbox::RootDir;
use crate::topic::{ASSETS_JSON, POST_MARKDOWN, Topic};
use crate::utils::{short_sha1, url_extension};
use rand::Rng;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::mpsc;

/// Repair channel capacity; a full channel drops tasks with a log line
const REPAIR_QUEUE_SIZE: usize = 4096;

/// How many leading bytes are probed for the image heuristic
const PROBE_BYTES: usize = 1024;

/// Browser user agents for the [`UaPolicy`] rotation
static BROWSER_UAS: LazyLock<HashMap<&'static str, Vec<&'static str>>> = LazyLock::new(|| {
    HashMap::from([
        (
            "chrome",
            vec![
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
            ],
        ),
        (
            "firefox",
            vec![
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
                "Mozilla/5.0 (X11; Linux x86_64; rv:124.0) Gecko/20100101 Firefox/124.0",
            ],
        ),
        (
            "edge",
            vec![
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
            ],
        ),
    ])
});

static MD_IMG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[img\]\((https?://[^)\s]+)\)").expect("md img regex"));
static VIDEO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<video[^>]*\bsrc="(https?://[^"]+)"[^>]*\bposter="(https?://[^"]+)""#)
        .expect("video regex")
});

/// Does this buffer look like an image rather than an HTML error page?
///
/// Deliberately loose: anything at least 12 bytes long that is not an HTML
/// document passes. The forum serves `<!DOCTYPE html>` error bodies with
/// image content types, which is the failure this catches.
pub fn is_image_like(buf: &[u8]) -> bool {
    buf.len() >= 12 && !buf.starts_with(b"<!DOCTYPE html")
}

/// One queued re-fetch
#[derive(Clone, Debug)]
pub struct RepairTask {
    /// Topic directory the result is written into
    pub root: RootDir,
    /// Target path relative to the topic root
    pub filename: String,
    /// Source URL
    pub url: String,
}

/// The repair queue and its single rate-limited worker
pub struct AssetRepairer {
    cfg: RepairConfig,
    tx: mpsc::Sender<RepairTask>,
}

impl AssetRepairer {
    /// Build the HTTP client and start the worker.
    pub fn new(cfg: RepairConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(cfg.timeout);
        if let Some(proxy) = &cfg.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        let client = builder.build()?;

        let (tx, rx) = mpsc::channel(REPAIR_QUEUE_SIZE);
        let worker_cfg = cfg.clone();
        tokio::spawn(run_worker(worker_cfg, client, rx));
        Ok(Self { cfg, tx })
    }

    /// Queue a task; a full queue drops it (the next reload resubmits).
    pub fn submit(&self, task: RepairTask) {
        if let Err(e) = self.tx.try_send(task) {
            tracing::warn!(error = %e, "repair queue full, dropping task");
        }
    }

    /// Scan a freshly reloaded topic and queue every repairable asset.
    ///
    /// `remote_pic` selects the second trigger: mirroring inline image URLs
    /// that the downloader left untouched.
    pub fn scan_topic(&self, topic: &Topic, remote_pic: bool) {
        let invalid = scan_invalid_assets(topic.root());
        let remote = if remote_pic {
            scan_remote_pics(topic.root(), &self.cfg.attachment_host)
        } else {
            Vec::new()
        };
        let count = invalid.len() + remote.len();
        if count > 0 {
            tracing::info!(topic = topic.id.0, count, "queueing asset repairs");
        }
        for (filename, url) in invalid.into_iter().chain(remote) {
            self.submit(RepairTask {
                root: topic.root().clone(),
                filename,
                url,
            });
        }
    }
}

/// Find manifest entries whose cached file fails the image heuristic.
///
/// The manifest (`assets.json`) maps cached filenames to their original
/// URLs; only floor-prefixed keys (`<floor>_...`) are image assets.
pub fn scan_invalid_assets(root: &RootDir) -> Vec<(String, String)> {
    let Ok(raw) = root.read_all(ASSETS_JSON) else {
        return Vec::new();
    };
    let Ok(manifest) = serde_json::from_slice::<HashMap<String, String>>(&raw) else {
        tracing::warn!("unparseable {ASSETS_JSON}");
        return Vec::new();
    };

    let mut tasks = Vec::new();
    for (name, url) in manifest {
        let floor_prefixed = name
            .split_once('_')
            .is_some_and(|(floor, _)| floor.parse::<u64>().is_ok());
        if !floor_prefixed {
            continue;
        }
        match probe(root, &name) {
            Some(head) if is_image_like(&head) => {}
            _ => tasks.push((name, url)),
        }
    }
    tasks
}

/// Find inline image/video URLs under the attachment host whose local mirror
/// (`attachments/<short_sha1(url)><ext>`) is absent.
pub fn scan_remote_pics(root: &RootDir, attachment_host: &str) -> Vec<(String, String)> {
    let mut urls = Vec::new();
    let collect = |urls: &mut Vec<String>, raw: &str| {
        if is_under_host(raw, attachment_host) && !urls.iter().any(|u| u == raw) {
            urls.push(raw.to_string());
        }
    };
    let result = root.every_line(POST_MARKDOWN, |line, _| {
        for caps in MD_IMG_RE.captures_iter(line) {
            collect(&mut urls, &caps[1]);
        }
        for caps in VIDEO_RE.captures_iter(line) {
            collect(&mut urls, &caps[1]);
            collect(&mut urls, &caps[2]);
        }
        true
    });
    if let Err(e) = result {
        tracing::debug!(error = %e, "no markdown to scan for remote pics");
        return Vec::new();
    }

    urls.into_iter()
        .filter_map(|url| {
            let filename = format!("attachments/{}{}", short_sha1(&url), url_extension(&url));
            if root.is_exist(&filename) {
                None
            } else {
                Some((filename, url))
            }
        })
        .collect()
}

fn is_under_host(raw: &str, attachment_host: &str) -> bool {
    url::Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.ends_with(attachment_host)))
        .unwrap_or(false)
}

/// First bytes of a cached file, or `None` when it is unreadable.
fn probe(root: &RootDir, name: &str) -> Option<Vec<u8>> {
    use std::io::Read;
    let mut reader = root.open_reader(name).ok()?;
    let mut buf = vec![0u8; PROBE_BYTES];
    let n = reader.read(&mut buf).ok()?;
    buf.truncate(n);
    Some(buf)
}

fn pick_ua(policy: UaPolicy) -> &'static str {
    let mut rng = rand::thread_rng();
    let key = match policy {
        UaPolicy::Chrome => "chrome",
        UaPolicy::Firefox => "firefox",
        UaPolicy::Edge => "edge",
        UaPolicy::Random => {
            let keys: Vec<_> = BROWSER_UAS.keys().collect();
            keys[rng.gen_range(0..keys.len())]
        }
    };
    let uas = &BROWSER_UAS[key];
    uas[rng.gen_range(0..uas.len())]
}

async fn run_worker(
    cfg: RepairConfig,
    client: reqwest::Client,
    mut rx: mpsc::Receiver<RepairTask>,
) {
    tracing::debug!("asset-repair worker started");
    while let Some(task) = rx.recv().await {
        let pause = {
            let mut rng = rand::thread_rng();
            rng.gen_range(cfg.min_delay..=cfg.max_delay)
        };
        tokio::time::sleep(pause).await;

        match fetch_image(&cfg, &client, &task.url).await {
            Ok(bytes) => {
                if let Err(e) = task.root.write_all(&task.filename, &bytes) {
                    tracing::warn!(file = %task.filename, error = %e, "repair write failed");
                } else {
                    tracing::info!(file = %task.filename, url = %task.url, "asset repaired");
                }
            }
            Err(e) => {
                tracing::warn!(url = %task.url, error = %e, "asset fetch failed");
            }
        }
    }
    tracing::debug!("asset-repair worker stopped");
}

/// GET an image with bounded retries and jittered backoff; the body must
/// pass the image heuristic or the fetch counts as failed.
async fn fetch_image(cfg: &RepairConfig, client: &reqwest::Client, url: &str) -> Result<Vec<u8>> {
    let mut last_err = Error::Other("no attempts".to_string());
    for attempt in 0..cfg.retries.max(1) {
        if attempt > 0 {
            let backoff = {
                let mut rng = rand::thread_rng();
                Duration::from_millis(rng.gen_range(1000..=3000))
            };
            tokio::time::sleep(backoff).await;
        }

        let mut request = client.get(url).header("User-Agent", pick_ua(cfg.ua_policy));
        for (name, value) in &cfg.headers {
            request = request.header(name, value);
        }

        match request.send().await {
            Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                Ok(bytes) if is_image_like(&bytes) => return Ok(bytes.to_vec()),
                Ok(_) => {
                    last_err = Error::Other(format!("{url} did not return an image"));
                }
                Err(e) => last_err = e.into(),
            },
            Ok(resp) => {
                last_err = Error::Other(format!("{url} returned {}", resp.status()));
            }
            Err(e) => last_err = e.into(),
        }
        tracing::debug!(url, attempt, error = %last_err, "image fetch retrying");
    }
    Err(last_err)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> (tempfile::TempDir, RootDir) {
        let dir = tempfile::tempdir().unwrap();
        let root = RootDir::open(dir.path()).unwrap();
        (dir, root)
    }

    #[test]
    fn test_image_heuristic() {
        assert!(is_image_like(&[0xFF; 100]));
        assert!(is_image_like(b"\x89PNG\r\n\x1a\n with more data"));
        assert!(!is_image_like(b"<!DOCTYPE html><html>error</html>"));
        assert!(!is_image_like(b"short"), "under 12 bytes is suspect");
    }

    #[test]
    fn test_scan_invalid_assets_flags_html_and_missing() {
        let (_tmp, root) = temp_root();
        root.write_all(
            ASSETS_JSON,
            br#"{
                "1_good.jpg": "https://img.nga.178.com/good.jpg",
                "2_bad.jpg": "https://img.nga.178.com/bad.jpg",
                "3_gone.jpg": "https://img.nga.178.com/gone.jpg",
                "cover.jpg": "https://img.nga.178.com/cover.jpg"
            }"#,
        )
        .unwrap();
        root.write_all("1_good.jpg", &[0xFFu8; 64]).unwrap();
        root.write_all("2_bad.jpg", b"<!DOCTYPE html><html>404</html>")
            .unwrap();

        let mut tasks = scan_invalid_assets(&root);
        tasks.sort();
        assert_eq!(
            tasks,
            vec![
                (
                    "2_bad.jpg".to_string(),
                    "https://img.nga.178.com/bad.jpg".to_string()
                ),
                (
                    "3_gone.jpg".to_string(),
                    "https://img.nga.178.com/gone.jpg".to_string()
                ),
            ],
            "html body and missing file need repair; non-floor keys are skipped"
        );
    }

    #[test]
    fn test_scan_remote_pics_hashes_names_and_skips_present() {
        let (_tmp, root) = temp_root();
        let url = "https://img.nga.178.com/attachments/mon_202401/abc.jpg";
        let poster = "https://img.nga.178.com/attachments/mon_202401/poster.png";
        root.write_all(
            POST_MARKDOWN,
            format!(
                "# t\n![img]({url})\n<video controls src=\"https://img.nga.178.com/v.mp4\" poster=\"{poster}\"></video>\n![img](https://elsewhere.example.com/x.jpg)\n"
            )
            .as_bytes(),
        )
        .unwrap();

        let tasks = scan_remote_pics(&root, "img.nga.178.com");
        let names: Vec<_> = tasks.iter().map(|(f, _)| f.clone()).collect();
        assert_eq!(tasks.len(), 3, "img + video src + poster, foreign host skipped");
        let expected = format!("attachments/{}.jpg", short_sha1(url));
        assert!(names.contains(&expected), "names derive from short sha1");

        // Mirror one file: it must drop out of the scan.
        root.write_all(&expected, &[0u8; 16]).unwrap();
        let tasks = scan_remote_pics(&root, "img.nga.178.com");
        assert_eq!(tasks.len(), 2);
    }

    #[test]
    fn test_pick_ua_respects_pinning() {
        for _ in 0..10 {
            assert!(pick_ua(UaPolicy::Firefox).contains("Firefox"));
            assert!(pick_ua(UaPolicy::Edge).contains("Edg/"));
        }
        // Random must always produce something from the table.
        let ua = pick_ua(UaPolicy::Random);
        assert!(BROWSER_UAS.values().flatten().any(|&u| u == ua));
    }

    #[tokio::test]
    async fn test_fetch_image_rejects_html_bodies() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/err.jpg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("<!DOCTYPE html><html>blocked</html>", "image/jpeg"),
            )
            .mount(&server)
            .await;

        let cfg = RepairConfig {
            retries: 1,
            ..Default::default()
        };
        let client = reqwest::Client::new();
        let err = fetch_image(&cfg, &client, &format!("{}/err.jpg", server.uri())).await;
        assert!(err.is_err(), "html body must not be written as an image");
    }
}
