//! User-info cache
//!
//! Author records are looked up from the forum's profile endpoint, cached in
//! memory, and persisted one JSON file per uid. Failed lookups are negatively
//! cached, keyed by the name that failed or by a synthetic `UID<id>` key for
//! id lookups, so a misspelled author or a deleted account does not hammer
//! the forum on every subscription poll.
//!
//! The forum speaks percent-encoded GBK in query strings and GBK in response
//! bodies (gzip handled transparently by the client), so all encoding lives
//! here behind the store's fetch helpers.

use crate::collection::SyncMap;
use crate::error::{Error, Result};
use crate::sandbox::RootDir;
use crate::types::UserRecord;
use chrono::DateTime;
use percent_encoding::{NON_ALPHANUMERIC, percent_encode};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

/// Markers on the profile page that indicate a permanent lookup failure
const NEGATIVE_MARKERS: &[&str] = &["找不到", "无此用户", "no such user", "bad parameter", "not found"];

/// `__UCPUSER = {...};` field extractors. The literal is JavaScript, not
/// JSON (unquoted keys, single quotes), so fields are pulled individually.
static UID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__UCPUSER[^;]*?\buid:\s*(\d+)").expect("uid regex"));
static USERNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__UCPUSER[^;]*?\busername:'([^']*)'").expect("username regex"));
static IPLOC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__UCPUSER[^;]*?\bipLoc:'([^']*)'").expect("ipLoc regex"));
static REGDATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__UCPUSER[^;]*?\bregdate:\s*(\d+)").expect("regdate regex"));

/// One row of an author's thread list
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthorTopic {
    /// Thread id
    pub id: i64,
    /// Thread title
    pub title: String,
    /// Whether the row was `<span>`-wrapped (inaccessible thread)
    pub missing: bool,
}

/// Thread-list rows: `<a href='/read.php?tid=ID' id='...' class='topic'>Title</a>`,
/// optionally with the title wrapped in a span (inaccessible thread).
static TOPIC_ROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<a href='/read\.php\?tid=(\d+)' id='[^']*' class='topic'>(<span[^>]*>)?([^<]+)")
        .expect("topic row regex")
});

/// Percent-encode a string as GBK bytes for forum query parameters.
pub fn gbk_query_escape(s: &str) -> String {
    let (bytes, _, _) = encoding_rs::GBK.encode(s);
    percent_encode(&bytes, NON_ALPHANUMERIC).to_string()
}

/// Parse the `__UCPUSER` literal out of a profile page.
pub fn parse_profile(html: &str) -> Option<UserRecord> {
    let uid: i64 = UID_RE.captures(html)?.get(1)?.as_str().parse().ok()?;
    let name = USERNAME_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())?;
    let loc = IPLOC_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();
    let reg_date = REGDATE_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok())
        .and_then(|ts| DateTime::from_timestamp(ts, 0));
    Some(UserRecord {
        id: uid,
        name,
        loc,
        reg_date,
        ..Default::default()
    })
}

/// Parse an author thread-list page into rows.
pub fn parse_author_topics(html: &str) -> Vec<AuthorTopic> {
    TOPIC_ROW_RE
        .captures_iter(html)
        .filter_map(|caps| {
            Some(AuthorTopic {
                id: caps.get(1)?.as_str().parse().ok()?,
                title: caps.get(3)?.as_str().trim().to_string(),
                missing: caps.get(2).is_some(),
            })
        })
        .collect()
}

/// Name/uid → author record cache with persistent negative entries
pub struct UserStore {
    root: RootDir,
    users: SyncMap<i64, UserRecord>,
    names: SyncMap<String, i64>,
    /// Last lookup error per key (name or `UID<id>`)
    failures: SyncMap<String, String>,
    client: reqwest::Client,
    base_url: String,
    ua: String,
    cookie: String,
    /// Serialises record writes (`<uid>.json`)
    write_lock: tokio::sync::Mutex<()>,
}

impl UserStore {
    /// Open the store over the `users/` directory and load existing records.
    pub fn open(root: RootDir, base_url: String, ua: String, cookie: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let store = Self {
            root,
            users: SyncMap::new(),
            names: SyncMap::new(),
            failures: SyncMap::new(),
            client,
            base_url,
            ua,
            cookie,
            write_lock: tokio::sync::Mutex::new(()),
        };
        store.load()?;
        Ok(store)
    }

    fn load(&self) -> Result<()> {
        for entry in self.root.read_dir()? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            if stem.parse::<i64>().is_err() {
                continue;
            }
            match self
                .root
                .read_all(&name)
                .and_then(|raw| Ok(serde_json::from_slice::<UserRecord>(&raw)?))
            {
                Ok(record) => {
                    self.names.put(record.name.clone(), record.id);
                    self.users.put(record.id, record);
                }
                Err(e) => tracing::warn!(file = %name, error = %e, "skipping unreadable user record"),
            }
        }
        tracing::info!(count = self.users.size(), "loaded user records");
        Ok(())
    }

    /// Cached record for a uid, if any.
    pub fn get(&self, uid: i64) -> Option<UserRecord> {
        self.users.get(&uid)
    }

    /// All subscribed authors.
    pub fn subscribed(&self) -> Vec<UserRecord> {
        self.users
            .values()
            .into_iter()
            .filter(|u| u.subscribed)
            .collect()
    }

    /// Insert or replace a record and persist it.
    pub async fn put(&self, record: UserRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let data = serde_json::to_vec_pretty(&record)?;
        self.root.write_all(format!("{}.json", record.id), &data)?;
        self.names.put(record.name.clone(), record.id);
        self.users.put(record.id, record);
        Ok(())
    }

    /// Look up an author by name, hitting the forum on a cache miss.
    pub async fn by_name(&self, name: &str) -> Result<UserRecord> {
        if let Some(uid) = self.names.get(&name.to_string())
            && let Some(record) = self.users.get(&uid)
        {
            return Ok(record);
        }
        if let Some(msg) = self.failures.get(&name.to_string()) {
            return Err(Error::UserLookup(msg));
        }
        let query = format!("username={}", gbk_query_escape(name));
        self.lookup(name.to_string(), query).await
    }

    /// Look up an author by uid, hitting the forum on a cache miss.
    ///
    /// Negative entries use the synthetic key `UID<id>`.
    pub async fn by_uid(&self, uid: i64) -> Result<UserRecord> {
        if let Some(record) = self.users.get(&uid) {
            return Ok(record);
        }
        let key = format!("UID{uid}");
        if let Some(msg) = self.failures.get(&key) {
            return Err(Error::UserLookup(msg));
        }
        self.lookup(key, format!("uid={uid}")).await
    }

    async fn lookup(&self, key: String, query: String) -> Result<UserRecord> {
        let url = format!("{}/nuke.php?func=ucp&{query}", self.base_url);
        let html = match self.fetch_gbk(&url).await {
            Ok(html) => html,
            Err(e) => {
                // Transient transport failures are not negatively cached.
                tracing::warn!(key, error = %e, "user lookup fetch failed");
                return Err(e);
            }
        };

        if let Some(record) = parse_profile(&html) {
            // A rename replaces the stored name in-place; the old name's
            // index entry is overwritten by the new one on the next lookup.
            let mut record = record;
            if let Some(existing) = self.users.get(&record.id) {
                record.subscribed = existing.subscribed;
                record.filter = existing.filter;
            }
            self.put(record.clone()).await?;
            return Ok(record);
        }

        let lower = html.to_lowercase();
        if let Some(marker) = NEGATIVE_MARKERS
            .iter()
            .find(|m| lower.contains(&m.to_lowercase()))
        {
            let msg = format!("forum rejected lookup: {marker}");
            tracing::info!(key, marker, "negative-caching user lookup");
            self.failures.put(key, msg.clone());
            return Err(Error::UserLookup(msg));
        }

        Err(Error::UserLookup("profile page had no user literal".to_string()))
    }

    /// Fetch the first page of an author's thread list.
    pub async fn fetch_author_topics(&self, uid: i64) -> Result<Vec<AuthorTopic>> {
        let url = format!("{}/thread.php?authorid={uid}", self.base_url);
        let html = self.fetch_gbk(&url).await?;
        Ok(parse_author_topics(&html))
    }

    /// GET a forum page and decode it from GBK (gzip handled by the client).
    async fn fetch_gbk(&self, url: &str) -> Result<String> {
        let resp = self
            .client
            .get(url)
            .header("User-Agent", &self.ua)
            .header("Cookie", &self.cookie)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::UserLookup(format!("{url} returned {status}")));
        }
        let bytes = resp.bytes().await?;
        let (text, _, _) = encoding_rs::GBK.decode(&bytes);
        Ok(text.into_owned())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PROFILE: &str = "<script>__UCPUSER = {uid:12345,username:'写手',ipLoc:'上海',regdate:1500000000,more:1};</script>";

    #[test]
    fn test_gbk_query_escape() {
        assert_eq!(gbk_query_escape("测试"), "%B2%E2%CA%D4");
        assert_eq!(gbk_query_escape("abc123"), "abc123");
    }

    #[test]
    fn test_parse_profile() {
        let user = parse_profile(PROFILE).unwrap();
        assert_eq!(user.id, 12345);
        assert_eq!(user.name, "写手");
        assert_eq!(user.loc, "上海");
        assert_eq!(user.reg_date.unwrap().timestamp(), 1_500_000_000);
        assert!(!user.subscribed);
    }

    #[test]
    fn test_parse_profile_absent() {
        assert!(parse_profile("<html>nothing here</html>").is_none());
    }

    #[test]
    fn test_parse_author_topics_rows_and_missing_flag() {
        let html = concat!(
            "<a href='/read.php?tid=100' id='t0' class='topic'>First title</a>",
            "<a href='/read.php?tid=101' id='t1' class='topic'><span class='silver'>Hidden one</span></a>",
            "<a href='/read.php?tid=abc' id='t2' class='topic'>bad id</a>",
        );
        let rows = parse_author_topics(html);
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0],
            AuthorTopic {
                id: 100,
                title: "First title".into(),
                missing: false
            }
        );
        assert_eq!(
            rows[1],
            AuthorTopic {
                id: 101,
                title: "Hidden one".into(),
                missing: true
            }
        );
    }

    async fn store_with(base_url: String) -> (tempfile::TempDir, UserStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = RootDir::open(dir.path()).unwrap();
        let store = UserStore::open(root, base_url, "ua".into(), "c=1".into()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_by_uid_fetches_parses_and_persists() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nuke.php"))
            .and(query_param("func", "ucp"))
            .and(query_param("uid", "12345"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(PROFILE, "text/html"))
            .mount(&server)
            .await;

        let (_tmp, store) = store_with(server.uri()).await;
        let user = store.by_uid(12345).await.unwrap();
        assert_eq!(user.name, "写手");
        assert!(store.root.is_exist("12345.json"), "record persisted per uid");

        // Second call is served from cache (mock expects exactly one hit by
        // default semantics; just assert the cached record matches).
        let again = store.by_uid(12345).await.unwrap();
        assert_eq!(again.id, user.id);
    }

    #[tokio::test]
    async fn test_negative_cache_by_synthetic_uid_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nuke.php"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "<html>参数错误: no such user</html>",
                "text/html",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let (_tmp, store) = store_with(server.uri()).await;
        let first = store.by_uid(404).await;
        assert!(matches!(first, Err(Error::UserLookup(_))));
        // Second lookup must hit the negative cache, not the server
        // (the mock's expect(1) verifies no extra request on drop).
        let second = store.by_uid(404).await;
        assert!(matches!(second, Err(Error::UserLookup(_))));
    }

    #[tokio::test]
    async fn test_subscribed_filtering() {
        let dir = tempfile::tempdir().unwrap();
        let root = RootDir::open(dir.path()).unwrap();
        let store = UserStore::open(root, "http://x".into(), "ua".into(), String::new()).unwrap();
        store
            .put(UserRecord {
                id: 1,
                name: "a".into(),
                subscribed: true,
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .put(UserRecord {
                id: 2,
                name: "b".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let subs = store.subscribed();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id, 1);
    }
}
