//! In-process HTTP retriever for the retrieval stage.
//!
//! Reads sub-unit URLs from the discovery artifact, fetches the ones the
//! checkpoint has not seen yet and writes each page to the `html/` artifact
//! directory. The `CheckpointManager` decides when to rotate the session and
//! when a run of blocks makes the whole item blocked.

pub mod classify;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::checkpoint::{CheckpointManager, CheckpointSettings, CheckpointStore, Directive};
use crate::executor::{ExecutionOutcome, ExecutionRequest, TaskExecutor};
use crate::stage::Stage;
use classify::{FetchClass, classify_response};

const DEFAULT_USER_AGENTS: [&str; 3] = [
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_5) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36",
];

#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub request_timeout: Duration,
    /// Cycled on every session rotation
    pub user_agents: Vec<String>,
    pub checkpoint: CheckpointSettings,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            user_agents: DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
            checkpoint: CheckpointSettings::default(),
        }
    }
}

/// One connection pool plus identity.
struct Session {
    client: reqwest::Client,
    number: usize,
}

pub struct HttpRetriever {
    settings: RetrievalSettings,
    store: CheckpointStore,
}

impl HttpRetriever {
    pub fn new(settings: RetrievalSettings, store: CheckpointStore) -> Self {
        Self { settings, store }
    }

    fn session(&self, number: usize) -> Result<Session> {
        let agent = if self.settings.user_agents.is_empty() {
            DEFAULT_USER_AGENTS[number % DEFAULT_USER_AGENTS.len()].to_string()
        } else {
            self.settings.user_agents[number % self.settings.user_agents.len()].clone()
        };
        let client = reqwest::Client::builder()
            .user_agent(agent)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(self.settings.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Session { client, number })
    }

    /// Fetch one URL and, when it is a real page, store it.
    async fn fetch(&self, session: &Session, url: &str, out_dir: &Path) -> Result<FetchClass> {
        let response = match session.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => return Ok(FetchClass::Failed(e.to_string())),
        };
        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => return Ok(FetchClass::Failed(e.to_string())),
        };
        let class = classify_response(status, &body);
        if class == FetchClass::Ok {
            let path = page_path(out_dir, url);
            tokio::fs::write(&path, body)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        Ok(class)
    }
}

/// Artifact file for a URL: first 16 hex chars of its SHA-256.
pub fn page_path(out_dir: &Path, url: &str) -> PathBuf {
    let digest = format!("{:x}", Sha256::digest(url.as_bytes()));
    out_dir.join(format!("{}.html", &digest[..16]))
}

/// Sub-unit URLs from a discovery artifact. Lines may be `{"url": ...}`
/// objects, JSON strings or bare URLs; duplicates are dropped.
pub fn read_sub_units(path: &Path) -> Result<Vec<String>> {
    let file =
        std::fs::File::open(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    for raw in BufReader::new(file).split(b'\n') {
        let raw = raw.with_context(|| format!("Failed to read {}", path.display()))?;
        let decoded = String::from_utf8_lossy(&raw);
        let line = decoded.trim();
        if line.is_empty() {
            continue;
        }
        let url = match serde_json::from_str::<serde_json::Value>(line) {
            Ok(serde_json::Value::Object(map)) => map
                .get("url")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            Ok(serde_json::Value::String(s)) => Some(s),
            _ => Some(line.to_string()),
        };
        if let Some(url) = url
            && seen.insert(url.clone())
        {
            urls.push(url);
        }
    }
    Ok(urls)
}

#[async_trait]
impl TaskExecutor for HttpRetriever {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome> {
        let start = Instant::now();
        let ctx = &request.context;
        let finish = |raw: String| {
            ExecutionOutcome::from_transcript(request, raw, Some(0), false, start.elapsed())
        };

        let Some(upstream) = ctx.upstream_artifact_path.as_deref() else {
            return Ok(finish("no upstream artifact given".to_string()));
        };
        let urls = read_sub_units(upstream)?;
        if urls.is_empty() {
            return Ok(finish(format!("no sub-units in {}", upstream.display())));
        }
        tokio::fs::create_dir_all(&ctx.artifact_path)
            .await
            .with_context(|| format!("Failed to create {}", ctx.artifact_path.display()))?;

        let mut manager = CheckpointManager::open(
            self.store.clone(),
            &request.item_id,
            Stage::Retrieval,
            self.settings.checkpoint.clone(),
        )?;
        let mut session = self.session(0)?;
        let mut log = Vec::new();

        for url in &urls {
            if !manager.should_process(url) {
                continue;
            }
            let class = self.fetch(&session, url, &ctx.artifact_path).await?;
            match &class {
                FetchClass::Ok => tracing::debug!(item = %request.item_id, url = %url, "Fetched"),
                FetchClass::Blocked(reason) | FetchClass::Failed(reason) => {
                    tracing::debug!(item = %request.item_id, url = %url, reason = %reason, "Fetch not processed");
                    log.push(format!("{}: {}", url, reason));
                }
            }

            match manager.record(url, class.outcome())? {
                Directive::Continue => tokio::time::sleep(manager.next_delay()).await,
                Directive::Rotate { reason, cooldown } => {
                    tracing::info!(
                        item = %request.item_id,
                        session = session.number,
                        reason = ?reason,
                        cooldown_secs = cooldown.as_secs(),
                        "Rotating retrieval session"
                    );
                    tokio::time::sleep(cooldown).await;
                    session = self.session(session.number + 1)?;
                }
                Directive::Halt => {
                    let counts = manager.finish()?.counts();
                    tracing::warn!(
                        item = %request.item_id,
                        processed = counts.processed,
                        blocked = counts.blocked,
                        "Blocks persisted across session rotations"
                    );
                    log.push(format!(
                        "{} processed, {} failed, {} blocked before halting",
                        counts.processed, counts.failed, counts.blocked
                    ));
                    log.push(request.blocked_token.clone());
                    return Ok(finish(log.join("\n")));
                }
            }
        }

        let counts = manager.finish()?.counts();
        log.push(format!(
            "{} of {} sub-units attempted: {} processed, {} failed, {} blocked",
            counts.total(),
            urls.len(),
            counts.processed,
            counts.failed,
            counts.blocked
        ));
        log.push(request.done_token.clone());
        Ok(finish(log.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Checkpoint, SubUnitOutcome};
    use crate::executor::{ContextPacket, Signal};
    use crate::registry::StageProgress;
    use std::fs;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(block_burst: usize, max_block_rotations: u32) -> RetrievalSettings {
        RetrievalSettings {
            request_timeout: Duration::from_secs(5),
            user_agents: vec!["cascade-test".into()],
            checkpoint: CheckpointSettings {
                flush_every: 2,
                session_rotation: 50,
                block_burst,
                cooldown: Duration::ZERO,
                max_block_rotations,
                min_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
        }
    }

    fn request(out: &Path) -> ExecutionRequest {
        ExecutionRequest {
            item_id: "acme".into(),
            stage: Stage::Retrieval,
            attempt: 1,
            instructions: String::new(),
            context: ContextPacket {
                item_id: "acme".into(),
                name: "Acme".into(),
                url: "https://acme.test".into(),
                stage: Stage::Retrieval,
                output_dir: out.to_path_buf(),
                artifact_path: out.join("html"),
                upstream_artifact_path: Some(out.join("urls.jsonl")),
                checkpoint_path: None,
                counters: StageProgress::default(),
                attempt: 1,
                directive: None,
            },
            done_token: "RETRIEVAL_DONE".into(),
            blocked_token: "RETRIEVAL_BLOCKED".into(),
        }
    }

    async fn mount(server: &MockServer, route: &str, status: u16, body: &str) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .mount(server)
            .await;
    }

    fn write_urls(out: &Path, server: &MockServer, routes: &[&str]) {
        fs::create_dir_all(out).unwrap();
        let lines: Vec<String> = routes
            .iter()
            .map(|r| format!("{{\"url\":\"{}{}\"}}", server.uri(), r))
            .collect();
        fs::write(out.join("urls.jsonl"), lines.join("\n")).unwrap();
    }

    #[test]
    fn test_read_sub_units_formats_and_dedup() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("urls.jsonl");
        fs::write(
            &file,
            "{\"url\":\"https://a.test/1\"}\n\"https://a.test/2\"\nhttps://a.test/3\n\n{\"url\":\"https://a.test/1\"}\n{\"title\":\"no url\"}\n",
        )
        .unwrap();
        assert_eq!(
            read_sub_units(&file).unwrap(),
            vec!["https://a.test/1", "https://a.test/2", "https://a.test/3"]
        );
    }

    #[test]
    fn test_page_path_is_stable() {
        let a = page_path(Path::new("/out/html"), "https://a.test/1");
        assert_eq!(a, page_path(Path::new("/out/html"), "https://a.test/1"));
        assert_ne!(a, page_path(Path::new("/out/html"), "https://a.test/2"));
        assert_eq!(a.file_name().unwrap().len(), 21);
    }

    #[tokio::test]
    async fn test_retrieves_pages_and_records_failures() {
        let server = MockServer::start().await;
        mount(&server, "/a", 200, "<html>a</html>").await;
        mount(&server, "/b", 200, "<html>b</html>").await;
        mount(&server, "/c", 500, "oops").await;

        let dir = tempdir().unwrap();
        let out = dir.path().join("acme");
        write_urls(&out, &server, &["/a", "/b", "/c"]);
        let store = CheckpointStore::new(dir.path().join("checkpoints"));
        let retriever = HttpRetriever::new(settings(3, 2), store.clone());

        let outcome = retriever.execute(&request(&out)).await.unwrap();
        assert_eq!(outcome.signal, Signal::Completed);
        assert_eq!(fs::read_dir(out.join("html")).unwrap().count(), 2);

        let cp = store.load("acme", Stage::Retrieval).unwrap();
        assert_eq!(cp.counts().processed, 2);
        assert_eq!(cp.counts().failed, 1);
    }

    #[tokio::test]
    async fn test_resume_skips_checkpointed_urls() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>a</html>"))
            .expect(0)
            .mount(&server)
            .await;
        mount(&server, "/b", 200, "<html>b</html>").await;

        let dir = tempdir().unwrap();
        let out = dir.path().join("acme");
        write_urls(&out, &server, &["/a", "/b"]);
        let store = CheckpointStore::new(dir.path().join("checkpoints"));
        let mut cp = Checkpoint::default();
        cp.record(&format!("{}/a", server.uri()), SubUnitOutcome::Processed);
        store.save("acme", Stage::Retrieval, &mut cp).unwrap();

        let retriever = HttpRetriever::new(settings(3, 2), store.clone());
        let outcome = retriever.execute(&request(&out)).await.unwrap();
        assert!(outcome.completed());
        assert_eq!(store.load("acme", Stage::Retrieval).unwrap().counts().processed, 2);
    }

    #[tokio::test]
    async fn test_interrupted_retrieval_keeps_recorded_urls() {
        let server = MockServer::start().await;
        mount(&server, "/a", 200, "<html>a</html>").await;
        mount(&server, "/b", 200, "<html>b</html>").await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let out = dir.path().join("acme");
        write_urls(&out, &server, &["/a", "/b", "/slow"]);
        let store = CheckpointStore::new(dir.path().join("checkpoints"));
        let mut settings = settings(3, 2);
        settings.checkpoint.flush_every = 100;
        let retriever = HttpRetriever::new(settings, store.clone());

        let request = request(&out);
        let interrupted =
            tokio::time::timeout(Duration::from_millis(500), retriever.execute(&request)).await;
        assert!(interrupted.is_err());

        let cp = store.load("acme", Stage::Retrieval).unwrap();
        assert_eq!(cp.counts().processed, 2);
        assert!(!cp.contains(&format!("{}/slow", server.uri())));
    }

    #[tokio::test]
    async fn test_persistent_blocks_halt_the_item() {
        let server = MockServer::start().await;
        for route in ["/1", "/2", "/3", "/4", "/5", "/6"] {
            mount(&server, route, 403, "denied").await;
        }

        let dir = tempdir().unwrap();
        let out = dir.path().join("acme");
        write_urls(&out, &server, &["/1", "/2", "/3", "/4", "/5", "/6"]);
        let store = CheckpointStore::new(dir.path().join("checkpoints"));
        // Rotate after 2 blocks, halt on the second burst
        let retriever = HttpRetriever::new(settings(2, 1), store.clone());

        let outcome = retriever.execute(&request(&out)).await.unwrap();
        assert_eq!(outcome.signal, Signal::Blocked);
        let cp = store.load("acme", Stage::Retrieval).unwrap();
        assert_eq!(cp.counts().blocked, 4);
        assert!(!cp.contains(&format!("{}/5", server.uri())));
    }
}
