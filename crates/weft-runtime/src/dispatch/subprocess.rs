//! Out-of-process handler execution.
//!
//! Handlers packaged as external artifacts (a JVM jar addressed by a
//! Maven-style coordinate) run as subprocesses: the dispatcher resolves
//! and caches the artifact, launches the process with the step id and
//! persistence endpoint in its environment, waits up to the
//! registration's `timeout_ms`, and reads the step's returns back from
//! persistence. The subprocess writes its results through the store, not
//! through stdout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{short_name, DispatchError, HandlerDispatcher, Payload};
use crate::persistence::{HandlerRegistration, WorkflowStore};

/// Environment variable carrying the step id into the subprocess.
pub const ENV_STEP_ID: &str = "WEFT_STEP_ID";
/// Environment variable carrying the persistence endpoint.
pub const ENV_ENDPOINT: &str = "WEFT_ENDPOINT";
/// Environment variable carrying the facet name.
pub const ENV_FACET: &str = "WEFT_FACET";

/// Payload key the worker injects the claimed step id under.
pub const STEP_ID_KEY: &str = "_step_id";

/// A parsed `mvn:groupId:artifactId:version[:classifier]` coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactCoordinate {
    pub group: String,
    pub artifact: String,
    pub version: String,
    pub classifier: String,
}

impl ArtifactCoordinate {
    /// Parse an artifact URI. Fails on a wrong scheme, too few or too
    /// many components, or empty components.
    pub fn parse(uri: &str) -> Result<Self, DispatchError> {
        let rest = uri
            .strip_prefix("mvn:")
            .ok_or_else(|| DispatchError::Load(format!("invalid artifact URI scheme: {uri}")))?;

        let parts: Vec<&str> = rest.split(':').collect();
        if !(3..=4).contains(&parts.len()) {
            return Err(DispatchError::Load(format!(
                "invalid artifact URI (expected mvn:group:artifact:version[:classifier]): {uri}"
            )));
        }
        if parts.iter().take(3).any(|p| p.is_empty()) {
            return Err(DispatchError::Load(format!(
                "invalid artifact URI (empty component): {uri}"
            )));
        }

        Ok(Self {
            group: parts[0].to_string(),
            artifact: parts[1].to_string(),
            version: parts[2].to_string(),
            classifier: parts.get(3).map(|c| c.to_string()).unwrap_or_default(),
        })
    }

    /// The jar file name, `artifact-version[-classifier].jar`.
    pub fn jar_name(&self) -> String {
        if self.classifier.is_empty() {
            format!("{}-{}.jar", self.artifact, self.version)
        } else {
            format!("{}-{}-{}.jar", self.artifact, self.version, self.classifier)
        }
    }

    /// Cache path under `cache_dir` (group dots become directories).
    pub fn cache_path(&self, cache_dir: &Path) -> PathBuf {
        let mut path = cache_dir.to_path_buf();
        for segment in self.group.split('.') {
            path.push(segment);
        }
        path.push(&self.artifact);
        path.push(&self.version);
        path.push(self.jar_name());
        path
    }

    /// Download URL under a Maven-style repository root.
    pub fn download_url(&self, repository_url: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            repository_url.trim_end_matches('/'),
            self.group.replace('.', "/"),
            self.artifact,
            self.version,
            self.jar_name()
        )
    }

    fn lock_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.group, self.artifact, self.version, self.classifier
        )
    }
}

/// Subprocess dispatcher configuration.
#[derive(Debug, Clone)]
pub struct SubprocessConfig {
    /// Local artifact cache root.
    pub cache_dir: PathBuf,

    /// Maven-style repository root artifacts download from.
    pub repository_url: String,

    /// Command used to launch jars.
    pub java_command: String,

    /// Timeout applied when a registration carries none.
    pub default_timeout_ms: u64,

    /// Persistence endpoint handed to the subprocess.
    pub endpoint: String,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("weft-artifact-cache"),
            repository_url: "https://repo1.maven.org/maven2".to_string(),
            java_command: "java".to_string(),
            default_timeout_ms: 300_000,
            endpoint: String::new(),
        }
    }
}

/// Dispatcher that runs registered `mvn:` artifacts as subprocesses.
pub struct SubprocessDispatcher {
    store: Arc<dyn WorkflowStore>,
    config: SubprocessConfig,
    download_locks: DashMap<String, Arc<Mutex<()>>>,
    http: reqwest::Client,
}

impl SubprocessDispatcher {
    pub fn new(store: Arc<dyn WorkflowStore>, config: SubprocessConfig) -> Self {
        Self {
            store,
            config,
            download_locks: DashMap::new(),
            http: reqwest::Client::new(),
        }
    }

    async fn find_registration(&self, facet_name: &str) -> Option<HandlerRegistration> {
        let exact = self
            .store
            .get_handler_registration(facet_name)
            .await
            .ok()
            .flatten();
        let reg = match exact {
            Some(reg) => Some(reg),
            None => match short_name(facet_name) {
                Some(short) => self
                    .store
                    .get_handler_registration(short)
                    .await
                    .ok()
                    .flatten(),
                None => None,
            },
        };
        // Only artifact-backed registrations belong to this dispatcher.
        reg.filter(|r| r.module_uri.starts_with("mvn:"))
    }

    /// Resolve the artifact locally, downloading once per coordinate.
    async fn resolve_artifact(
        &self,
        coordinate: &ArtifactCoordinate,
    ) -> Result<PathBuf, DispatchError> {
        let jar_path = coordinate.cache_path(&self.config.cache_dir);
        if jar_is_cached(&jar_path) {
            return Ok(jar_path);
        }

        let lock = self
            .download_locks
            .entry(coordinate.lock_key())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another slot may have finished the download while we waited.
        if jar_is_cached(&jar_path) {
            return Ok(jar_path);
        }

        let url = coordinate.download_url(&self.config.repository_url);
        info!(%url, "downloading artifact");

        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .map_err(|e| DispatchError::Load(format!("artifact download failed: {e}")))?;
        if !response.status().is_success() {
            return Err(DispatchError::Load(format!(
                "artifact download failed: HTTP {} for {url}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| DispatchError::Load(format!("artifact download failed: {e}")))?;

        if let Some(parent) = jar_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DispatchError::Load(format!("cannot create cache dir: {e}")))?;
        }
        tokio::fs::write(&jar_path, &bytes)
            .await
            .map_err(|e| DispatchError::Load(format!("cannot write artifact: {e}")))?;

        debug!(path = %jar_path.display(), bytes = bytes.len(), "cached artifact");
        Ok(jar_path)
    }

    async fn run_subprocess(
        &self,
        reg: &HandlerRegistration,
        jar_path: &Path,
        facet_name: &str,
        step_id: &str,
    ) -> Result<(), DispatchError> {
        let timeout_ms = if reg.timeout_ms > 0 {
            reg.timeout_ms
        } else {
            self.config.default_timeout_ms
        };

        let mut command = Command::new(&self.config.java_command);
        command.arg("-jar").arg(jar_path);
        if !reg.entrypoint.is_empty() {
            // Explicit main class instead of the jar manifest.
            command.arg(&reg.entrypoint);
        }
        command
            .env(ENV_STEP_ID, step_id)
            .env(ENV_ENDPOINT, &self.config.endpoint)
            .env(ENV_FACET, facet_name)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| DispatchError::Subprocess(format!("failed to launch: {e}")))?;

        let status = tokio::time::timeout(Duration::from_millis(timeout_ms), child.wait()).await;

        match status {
            Err(_) => {
                // Hard-kill on timeout.
                let _ = child.kill().await;
                warn!(facet = facet_name, timeout_ms, "subprocess timed out");
                Err(DispatchError::Subprocess(format!(
                    "handler timed out after {timeout_ms}ms"
                )))
            }
            Ok(Err(e)) => Err(DispatchError::Subprocess(format!("wait failed: {e}"))),
            Ok(Ok(status)) if !status.success() => Err(DispatchError::Subprocess(format!(
                "handler exited with {status}"
            ))),
            Ok(Ok(_)) => Ok(()),
        }
    }
}

fn jar_is_cached(path: &Path) -> bool {
    path.metadata().map(|m| m.len() > 0).unwrap_or(false)
}

#[async_trait]
impl HandlerDispatcher for SubprocessDispatcher {
    async fn can_dispatch(&self, facet_name: &str) -> bool {
        self.find_registration(facet_name).await.is_some()
    }

    async fn dispatch(
        &self,
        facet_name: &str,
        payload: Payload,
    ) -> Result<Payload, DispatchError> {
        let reg = self
            .find_registration(facet_name)
            .await
            .ok_or_else(|| DispatchError::NoHandler(facet_name.to_string()))?;
        let coordinate = ArtifactCoordinate::parse(&reg.module_uri)?;

        let step_id = payload
            .get(STEP_ID_KEY)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                DispatchError::Subprocess(format!(
                    "payload for '{facet_name}' carries no step id; subprocess handlers read \
                     their step through the store"
                ))
            })?
            .to_string();

        let jar_path = self.resolve_artifact(&coordinate).await?;
        self.run_subprocess(&reg, &jar_path, facet_name, &step_id)
            .await?;

        // The subprocess wrote its returns to the step; read them back.
        let step = self
            .store
            .get_step(&step_id)
            .await
            .map_err(|e| DispatchError::Store(e.to_string()))?
            .ok_or_else(|| DispatchError::Store(format!("step not found: {step_id}")))?;

        Ok(step.attributes.returns_json())
    }
}
