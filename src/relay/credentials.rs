// Credential management for a single provider binding: loading credential
// files, selecting one per request according to the rotation policy,
// tracking per-credential health, and refreshing rotating tokens.
//
// Locking discipline: all CredentialState mutation happens under one
// manager-level mutex whose hold window is select-and-stamp only. Token
// refresh runs outside that lock behind a per-credential single-flight
// guard. The file on disk is the serialisation point across processes;
// writes are atomic (write temp + rename) and a losing writer may be
// overwritten.

use crate::relay::binding::{RotationPolicy, RotationStrategy};
use crate::relay::types::RelayError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

/// Refresh when the access token expires within this window.
const REFRESH_WINDOW_MINUTES: i64 = 5;

/// Token refresh endpoint for CWR credentials.
pub const CWR_REFRESH_URL: &str = "https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken";

/// Refresh HTTP timeout.
const REFRESH_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Credential file model
// ============================================================================

/// One credential as stored on disk. Unknown keys are preserved across
/// refreshes via the flattened `extra` map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    #[serde(skip)]
    pub source_path: String,
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_refresh_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_refreshed_by: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Credential {
    /// Whether the access token expires inside the refresh window.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - now < Duration::minutes(REFRESH_WINDOW_MINUTES),
            None => false,
        }
    }
}

/// Tokens returned by the refresh endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Apply a refresh response to a credential, preserving every field other
/// than the rotating pair and the refresh bookkeeping tags.
pub fn merge_refreshed(credential: &mut Credential, tokens: RefreshedTokens, refreshed_by: &str) {
    credential.access_token = tokens.access_token;
    if tokens.refresh_token.is_some() {
        credential.refresh_token = tokens.refresh_token;
    }
    if tokens.expires_at.is_some() {
        credential.expires_at = tokens.expires_at;
    }
    credential.last_refresh_time = Some(Utc::now());
    credential.last_refreshed_by = Some(refreshed_by.to_string());
}

// ============================================================================
// Runtime health state
// ============================================================================

/// Per-credential runtime state. Created on load, mutated under the
/// manager lock, never destroyed during the process lifetime.
#[derive(Debug, Clone, Default)]
pub struct CredentialState {
    pub active: bool,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub consecutive_errors: u32,
    pub refresh_failures: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub temp_disabled_until: Option<DateTime<Utc>>,
    pub last_refresh_attempt_at: Option<DateTime<Utc>>,
}

impl CredentialState {
    fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }

    fn health_score(&self, now: DateTime<Utc>) -> f64 {
        let minutes_since_use = self
            .last_used_at
            .map(|t| (now - t).num_seconds() as f64 / 60.0)
            .unwrap_or(0.0);
        self.consecutive_errors as f64 * 10.0 - self.success_rate() * 5.0 + minutes_since_use
    }
}

// ============================================================================
// File store seam
// ============================================================================

/// Storage abstraction for credential and gateway state files. Injected so
/// the core never touches the filesystem layout directly.
#[async_trait::async_trait]
pub trait FileStore: Send + Sync {
    async fn read(&self, path: &str) -> Result<String, RelayError>;
    /// Write with temp-file-plus-rename semantics, mode 0600.
    async fn write_atomic(&self, path: &str, contents: &str) -> Result<(), RelayError>;
}

/// On-disk store: atomic writes via a sibling temp file.
#[derive(Debug, Clone, Default)]
pub struct DiskStore;

#[async_trait::async_trait]
impl FileStore for DiskStore {
    async fn read(&self, path: &str) -> Result<String, RelayError> {
        Ok(tokio::fs::read_to_string(path).await?)
    }

    async fn write_atomic(&self, path: &str, contents: &str) -> Result<(), RelayError> {
        let path = path.to_string();
        let contents = contents.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), RelayError> {
            use std::io::Write;

            let target = Path::new(&path);
            let dir = target.parent().unwrap_or_else(|| Path::new("."));
            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(contents.as_bytes())?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o600);
                tmp.as_file().set_permissions(perms)?;
            }
            tmp.persist(target).map_err(|e| RelayError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| RelayError::Io(std::io::Error::other(e)))??;
        Ok(())
    }
}

/// In-memory store for tests and ephemeral embedders.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    files: Arc<Mutex<HashMap<String, String>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<String>, contents: impl Into<String>) {
        self.lock_files().insert(path.into(), contents.into());
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.lock_files().get(path).cloned()
    }

    fn lock_files(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        match self.files.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait::async_trait]
impl FileStore for MemStore {
    async fn read(&self, path: &str) -> Result<String, RelayError> {
        self.get(path).ok_or_else(|| {
            RelayError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such file: {}", path),
            ))
        })
    }

    async fn write_atomic(&self, path: &str, contents: &str) -> Result<(), RelayError> {
        self.insert(path, contents);
        Ok(())
    }
}

// ============================================================================
// Token refresh seam
// ============================================================================

/// Exchanges a refresh token for new tokens. Injected so the manager can be
/// exercised without the real auth service.
#[async_trait::async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, RelayError>;
}

/// Refresh client for the CWR auth service.
pub struct CwrTokenRefresher {
    client: reqwest::Client,
    url: String,
}

impl CwrTokenRefresher {
    pub fn new() -> Self {
        Self::with_url(CWR_REFRESH_URL)
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        CwrTokenRefresher {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(REFRESH_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            url: url.into(),
        }
    }
}

impl Default for CwrTokenRefresher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TokenRefresher for CwrTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, RelayError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RefreshResponse {
            access_token: String,
            refresh_token: Option<String>,
            expires_at: Option<DateTime<Utc>>,
            expires_in: Option<i64>,
        }

        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "refreshToken": refresh_token }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::UpstreamAuth {
                status: status.as_u16(),
                message: format!("token refresh failed: {}", body),
            });
        }

        let parsed: RefreshResponse = response.json().await?;
        let expires_at = parsed
            .expires_at
            .or_else(|| parsed.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)));
        Ok(RefreshedTokens {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_at,
        })
    }
}

// ============================================================================
// Credential manager
// ============================================================================

/// The credential handed to the provider client for one request.
#[derive(Debug, Clone)]
pub struct AcquiredCredential {
    pub source_path: String,
    pub access_token: String,
    pub profile_arn: Option<String>,
    pub auth_method: Option<String>,
}

struct Slot {
    path: String,
    credential: RwLock<Credential>,
    /// Single-flight guard: concurrent callers needing a refresh share one
    /// in-flight attempt.
    refresh_gate: tokio::sync::Mutex<()>,
}

impl Slot {
    fn read_credential(&self) -> std::sync::RwLockReadGuard<'_, Credential> {
        match self.credential.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_credential(&self) -> std::sync::RwLockWriteGuard<'_, Credential> {
        match self.credential.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct ManagerState {
    states: Vec<CredentialState>,
    cursor: usize,
}

/// Per-binding credential manager.
pub struct CredentialManager {
    binding_name: String,
    policy: RotationPolicy,
    slots: Vec<Arc<Slot>>,
    state: Mutex<ManagerState>,
    store: Arc<dyn FileStore>,
    refresher: Arc<dyn TokenRefresher>,
    /// Directory for gateway state files (`last-token-refresh.json`,
    /// `token-status.json`); state files are skipped when unset.
    state_dir: Option<String>,
}

impl CredentialManager {
    /// Load credentials from the given paths. Unreadable or unparsable
    /// files are logged and skipped; loading never fails the process.
    pub async fn load(
        binding_name: impl Into<String>,
        paths: &[String],
        policy: RotationPolicy,
        store: Arc<dyn FileStore>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        let binding_name = binding_name.into();
        let mut slots = Vec::new();
        let mut states = Vec::new();

        for path in paths {
            let contents = match store.read(path).await {
                Ok(c) => c,
                Err(err) => {
                    log::warn!(
                        "skipping credential {} for binding {}: {}",
                        path,
                        binding_name,
                        err
                    );
                    continue;
                }
            };
            let mut credential: Credential = match serde_json::from_str(&contents) {
                Ok(c) => c,
                Err(err) => {
                    log::warn!(
                        "skipping malformed credential {} for binding {}: {}",
                        path,
                        binding_name,
                        err
                    );
                    continue;
                }
            };
            credential.source_path = path.clone();

            // A credential without a refresh token can never recover from
            // expiry, so it starts inactive.
            let active = credential.refresh_token.is_some();
            if !active {
                log::warn!(
                    "credential {} has no refresh token; marking inactive",
                    path
                );
            }

            slots.push(Arc::new(Slot {
                path: path.clone(),
                credential: RwLock::new(credential),
                refresh_gate: tokio::sync::Mutex::new(()),
            }));
            states.push(CredentialState {
                active,
                ..CredentialState::default()
            });
        }

        log::debug!(
            "binding {}: loaded {} of {} credentials",
            binding_name,
            slots.len(),
            paths.len()
        );

        CredentialManager {
            binding_name,
            policy,
            slots,
            state: Mutex::new(ManagerState { states, cursor: 0 }),
            store,
            refresher,
            state_dir: None,
        }
    }

    /// Load the credentials a binding owns, with its rotation policy.
    pub async fn for_binding(
        binding: &crate::relay::binding::ProviderBinding,
        store: Arc<dyn FileStore>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self::load(
            binding.name.clone(),
            &binding.credential_paths,
            binding.rotation.clone(),
            store,
            refresher,
        )
        .await
    }

    /// Set the directory used for gateway state files.
    pub fn with_state_dir(mut self, dir: impl Into<String>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Select a credential for a request and hand back a live access token.
    /// `exclude` prevents re-picking the credential a retry just failed on.
    pub async fn acquire(
        &self,
        request_id: &str,
        exclude: Option<&str>,
    ) -> Result<AcquiredCredential, RelayError> {
        if self.slots.is_empty() {
            return Err(RelayError::NoCredentialAvailable(
                "no credentials loaded".to_string(),
            ));
        }

        let index = {
            let mut state = self.lock_state();
            let now = Utc::now();

            let mut candidates = self.candidate_indices(&state.states, now, exclude, true);
            if candidates.is_empty() {
                // Cooldown pacing is advisory; retry without it before the
                // escape hatch.
                candidates = self.candidate_indices(&state.states, now, exclude, false);
            }
            if candidates.is_empty() {
                // One-shot escape hatch: give error-disabled credentials
                // another chance rather than failing the request.
                for s in state.states.iter_mut().filter(|s| s.active) {
                    s.consecutive_errors = 0;
                    s.temp_disabled_until = None;
                }
                candidates = self.candidate_indices(&state.states, now, exclude, false);
            }
            let Some(index) = self.choose(&mut state, &candidates, now) else {
                return Err(RelayError::NoCredentialAvailable(
                    self.exhaustion_reason(&state.states),
                ));
            };

            let s = &mut state.states[index];
            s.last_used_at = Some(now);
            s.total_requests += 1;
            index
        };

        let slot = &self.slots[index];
        log::debug!(
            "request {}: binding {} using credential {}",
            request_id,
            self.binding_name,
            slot.path
        );

        // Refresh outside the manager lock.
        let needs_refresh = {
            let cred = slot.read_credential();
            cred.needs_refresh(Utc::now())
        };
        if needs_refresh {
            self.refresh_slot(index).await;
        }

        let cred = slot.read_credential();
        Ok(AcquiredCredential {
            source_path: slot.path.clone(),
            access_token: cred.access_token.clone(),
            profile_arn: cred.profile_arn.clone(),
            auth_method: cred.auth_method.clone(),
        })
    }

    /// Record a successful upstream call on this credential.
    pub fn report_success(&self, source_path: &str) {
        let Some(index) = self.index_of(source_path) else {
            return;
        };
        let mut state = self.lock_state();
        let s = &mut state.states[index];
        s.consecutive_errors = 0;
        s.temp_disabled_until = None;
        s.successful_requests += 1;
        // A soft-disabled credential that just worked is healthy again; a
        // refresh-failure lockout stays until a refresh succeeds.
        if !s.active && s.refresh_failures < self.policy.max_refresh_failures {
            s.active = true;
        }
    }

    /// Record a failed upstream call. Auth statuses trigger a
    /// backoff-limited refresh attempt.
    pub async fn report_failure(&self, source_path: &str, status: Option<u16>) {
        let Some(index) = self.index_of(source_path) else {
            return;
        };
        {
            let mut state = self.lock_state();
            let s = &mut state.states[index];
            s.consecutive_errors += 1;
            if s.consecutive_errors >= self.policy.max_errors_before_temp_disable {
                let until =
                    Utc::now() + Duration::milliseconds(self.policy.temp_disable_ms as i64);
                s.temp_disabled_until = Some(until);
                log::warn!(
                    "credential {} temp-disabled until {} after {} consecutive errors",
                    source_path,
                    until,
                    s.consecutive_errors
                );
            }
        }

        if matches!(status, Some(401) | Some(403)) {
            self.refresh_slot(index).await;
        }
    }

    /// Runtime state snapshot for a credential.
    pub fn state_of(&self, source_path: &str) -> Option<CredentialState> {
        let index = self.index_of(source_path)?;
        let state = self.lock_state();
        state.states.get(index).cloned()
    }

    /// Current credential contents (post-refresh) for a path.
    pub fn credential_of(&self, source_path: &str) -> Option<Credential> {
        let index = self.index_of(source_path)?;
        let cred = self.slots[index].read_credential();
        Some(cred.clone())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("credential state mutex poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    // ------------------------------------------------------------------
    // Selection internals (called under the manager lock)
    // ------------------------------------------------------------------

    fn candidate_indices(
        &self,
        states: &[CredentialState],
        now: DateTime<Utc>,
        exclude: Option<&str>,
        respect_cooldown: bool,
    ) -> Vec<usize> {
        states
            .iter()
            .enumerate()
            .filter(|(i, s)| {
                if !s.active {
                    return false;
                }
                if let Some(until) = s.temp_disabled_until {
                    if now < until {
                        return false;
                    }
                }
                if let Some(excluded) = exclude {
                    if self.slots[*i].path == excluded {
                        return false;
                    }
                }
                if respect_cooldown && self.policy.cooldown_ms > 0 {
                    if let Some(last) = s.last_used_at {
                        if now - last < Duration::milliseconds(self.policy.cooldown_ms as i64) {
                            return false;
                        }
                    }
                }
                true
            })
            .map(|(i, _)| i)
            .collect()
    }

    fn choose(
        &self,
        state: &mut ManagerState,
        candidates: &[usize],
        now: DateTime<Utc>,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let index = match self.policy.strategy {
            RotationStrategy::RoundRobin => {
                let pick = candidates[state.cursor % candidates.len()];
                state.cursor = state.cursor.wrapping_add(1);
                pick
            }
            RotationStrategy::HealthBased => candidates.iter().copied().min_by(|a, b| {
                let sa = state.states[*a].health_score(now);
                let sb = state.states[*b].health_score(now);
                sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
            })?,
            RotationStrategy::LeastUsed => candidates
                .iter()
                .copied()
                .min_by_key(|i| state.states[*i].total_requests)?,
        };
        Some(index)
    }

    fn exhaustion_reason(&self, states: &[CredentialState]) -> String {
        let now = Utc::now();
        let disabled = states.iter().filter(|s| !s.active).count();
        let cooling = states
            .iter()
            .filter(|s| s.temp_disabled_until.map(|u| now < u).unwrap_or(false))
            .count();
        if disabled == states.len() {
            format!(
                "all {} credentials disabled (refresh-failure lockout)",
                disabled
            )
        } else if cooling > 0 {
            format!(
                "{} of {} credentials cooling down, the rest disabled or excluded",
                cooling,
                states.len()
            )
        } else {
            "all credentials disabled or excluded".to_string()
        }
    }

    fn index_of(&self, source_path: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.path == source_path)
    }

    // ------------------------------------------------------------------
    // Refresh
    // ------------------------------------------------------------------

    /// Refresh a credential, honoring the single-flight guard and the
    /// per-credential backoff. Failures are recorded; the caller proceeds
    /// with the cached token either way.
    async fn refresh_slot(&self, index: usize) {
        let slot = self.slots[index].clone();
        let _gate = slot.refresh_gate.lock().await;

        // Re-check under the gate: another caller may have just refreshed,
        // and attempts are rate-limited per credential.
        let now = Utc::now();
        {
            let mut state = self.lock_state();
            let s = &mut state.states[index];
            if let Some(last_attempt) = s.last_refresh_attempt_at {
                let backoff = Duration::milliseconds(self.policy.refresh_backoff_ms as i64);
                if now - last_attempt < backoff {
                    log::debug!(
                        "credential {}: refresh attempted {}s ago, within backoff; using cached token",
                        slot.path,
                        (now - last_attempt).num_seconds()
                    );
                    return;
                }
            }
            s.last_refresh_attempt_at = Some(now);
        }

        let refresh_token = {
            let cred = slot.read_credential();
            match &cred.refresh_token {
                Some(token) => token.clone(),
                None => {
                    log::warn!("credential {} has no refresh token", slot.path);
                    return;
                }
            }
        };

        match self.refresher.refresh(&refresh_token).await {
            Ok(tokens) => {
                let serialized = {
                    let mut cred = slot.write_credential();
                    merge_refreshed(&mut cred, tokens, &self.binding_name);
                    serde_json::to_string_pretty(&*cred).ok()
                };
                {
                    let mut state = self.lock_state();
                    let s = &mut state.states[index];
                    s.refresh_failures = 0;
                    s.active = true;
                }
                if let Some(contents) = serialized {
                    if let Err(err) = self.store.write_atomic(&slot.path, &contents).await {
                        log::warn!("failed to persist credential {}: {}", slot.path, err);
                    }
                }
                self.write_state_files(true).await;
                log::debug!("credential {} refreshed", slot.path);
            }
            Err(err) => {
                let failures = {
                    let mut state = self.lock_state();
                    let s = &mut state.states[index];
                    s.refresh_failures += 1;
                    if s.refresh_failures >= self.policy.max_refresh_failures {
                        s.active = false;
                    }
                    s.refresh_failures
                };
                log::warn!(
                    "credential {} refresh failed ({} of {} allowed): {}",
                    slot.path,
                    failures,
                    self.policy.max_refresh_failures,
                    err
                );
                self.write_state_files(false).await;
            }
        }
    }

    /// Best-effort gateway state files; errors are logged, never surfaced.
    async fn write_state_files(&self, refresh_ok: bool) {
        let Some(dir) = &self.state_dir else {
            return;
        };
        let now = Utc::now();

        let last_refresh = serde_json::json!({ "lastRefreshTime": now.to_rfc3339() });
        let path = format!("{}/last-token-refresh.json", dir);
        if let Err(err) = self
            .store
            .write_atomic(&path, &last_refresh.to_string())
            .await
        {
            log::debug!("failed to write {}: {}", path, err);
        }

        let failure_count: u32 = {
            let state = self.lock_state();
            state.states.iter().map(|s| s.refresh_failures).sum()
        };
        let status = serde_json::json!({
            "isValid": refresh_ok,
            "shouldBlock": failure_count >= self.policy.max_refresh_failures,
            "lastValidation": now.to_rfc3339(),
            "failureCount": failure_count,
        });
        let path = format!("{}/token-status.json", dir);
        if let Err(err) = self.store.write_atomic(&path, &status.to_string()).await {
            log::debug!("failed to write {}: {}", path, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeRefresher {
        calls: AtomicU32,
        fail: bool,
        delay_ms: u64,
    }

    impl FakeRefresher {
        fn new() -> Self {
            FakeRefresher {
                calls: AtomicU32::new(0),
                fail: false,
                delay_ms: 0,
            }
        }

        fn failing() -> Self {
            FakeRefresher {
                fail: true,
                ..Self::new()
            }
        }
    }

    #[async_trait::async_trait]
    impl TokenRefresher for FakeRefresher {
        async fn refresh(&self, _refresh_token: &str) -> Result<RefreshedTokens, RelayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail {
                return Err(RelayError::UpstreamAuth {
                    status: 401,
                    message: "refresh denied".to_string(),
                });
            }
            Ok(RefreshedTokens {
                access_token: "fresh-token".to_string(),
                refresh_token: Some("fresh-refresh".to_string()),
                expires_at: Some(Utc::now() + Duration::hours(8)),
            })
        }
    }

    fn credential_json(token: &str) -> String {
        serde_json::json!({
            "accessToken": token,
            "refreshToken": format!("{}-refresh", token),
            "expiresAt": (Utc::now() + Duration::hours(8)).to_rfc3339(),
            "profileArn": "arn:aws:codewhisperer:us-east-1:123:profile/p",
            "authMethod": "social",
            "customKey": {"nested": true},
        })
        .to_string()
    }

    fn fast_policy() -> RotationPolicy {
        RotationPolicy {
            cooldown_ms: 0,
            ..RotationPolicy::default()
        }
    }

    async fn manager_with(
        paths: &[&str],
        policy: RotationPolicy,
        refresher: Arc<dyn TokenRefresher>,
    ) -> (CredentialManager, MemStore) {
        let store = MemStore::new();
        for path in paths {
            store.insert(*path, credential_json(path));
        }
        let paths: Vec<String> = paths.iter().map(|s| s.to_string()).collect();
        let manager = CredentialManager::load(
            "test-binding",
            &paths,
            policy,
            Arc::new(store.clone()),
            refresher,
        )
        .await;
        (manager, store)
    }

    #[tokio::test]
    async fn test_load_skips_unreadable_files() {
        let store = MemStore::new();
        store.insert("good.json", credential_json("good"));
        store.insert("bad.json", "not json at all");
        let manager = CredentialManager::load(
            "b",
            &[
                "good.json".to_string(),
                "missing.json".to_string(),
                "bad.json".to_string(),
            ],
            fast_policy(),
            Arc::new(store),
            Arc::new(FakeRefresher::new()),
        )
        .await;
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_starts_inactive() {
        let store = MemStore::new();
        store.insert(
            "norefresh.json",
            serde_json::json!({"accessToken": "t"}).to_string(),
        );
        let manager = CredentialManager::load(
            "b",
            &["norefresh.json".to_string()],
            fast_policy(),
            Arc::new(store),
            Arc::new(FakeRefresher::new()),
        )
        .await;
        assert!(!manager.state_of("norefresh.json").unwrap().active);
        assert!(manager.acquire("r1", None).await.is_err());
    }

    #[tokio::test]
    async fn test_success_report_zeroes_consecutive_errors() {
        let (manager, _) =
            manager_with(&["a.json"], fast_policy(), Arc::new(FakeRefresher::new())).await;
        let acquired = manager.acquire("r1", None).await.unwrap();
        manager.report_failure(&acquired.source_path, None).await;
        assert_eq!(
            manager.state_of("a.json").unwrap().consecutive_errors,
            1
        );
        manager.report_success(&acquired.source_path);
        let state = manager.state_of("a.json").unwrap();
        assert_eq!(state.consecutive_errors, 0);
        assert_eq!(state.successful_requests, 1);
        assert!(state.temp_disabled_until.is_none());
    }

    #[tokio::test]
    async fn test_round_robin_advances() {
        let (manager, _) = manager_with(
            &["a.json", "b.json"],
            fast_policy(),
            Arc::new(FakeRefresher::new()),
        )
        .await;
        let first = manager.acquire("r1", None).await.unwrap();
        let second = manager.acquire("r2", None).await.unwrap();
        assert_ne!(first.source_path, second.source_path);
    }

    #[tokio::test]
    async fn test_least_used_prefers_idle_credential() {
        let policy = RotationPolicy {
            strategy: RotationStrategy::LeastUsed,
            cooldown_ms: 0,
            ..RotationPolicy::default()
        };
        let (manager, _) = manager_with(
            &["a.json", "b.json"],
            policy,
            Arc::new(FakeRefresher::new()),
        )
        .await;
        let first = manager.acquire("r1", None).await.unwrap();
        let second = manager.acquire("r2", None).await.unwrap();
        assert_ne!(first.source_path, second.source_path);
    }

    #[tokio::test]
    async fn test_health_based_avoids_erroring_credential() {
        let policy = RotationPolicy {
            strategy: RotationStrategy::HealthBased,
            cooldown_ms: 0,
            max_errors_before_temp_disable: 10,
            ..RotationPolicy::default()
        };
        let (manager, _) = manager_with(
            &["a.json", "b.json"],
            policy,
            Arc::new(FakeRefresher::new()),
        )
        .await;
        manager.report_failure("a.json", None).await;
        manager.report_failure("a.json", None).await;
        let acquired = manager.acquire("r1", None).await.unwrap();
        assert_eq!(acquired.source_path, "b.json");
    }

    #[tokio::test]
    async fn test_exclusion_prevents_repick() {
        let (manager, _) = manager_with(
            &["a.json", "b.json"],
            fast_policy(),
            Arc::new(FakeRefresher::new()),
        )
        .await;
        let acquired = manager.acquire("r1", Some("a.json")).await.unwrap();
        assert_eq!(acquired.source_path, "b.json");
    }

    #[tokio::test]
    async fn test_consecutive_errors_trigger_temp_disable() {
        let policy = RotationPolicy {
            max_errors_before_temp_disable: 2,
            temp_disable_ms: 3_600_000,
            cooldown_ms: 0,
            ..RotationPolicy::default()
        };
        let (manager, _) = manager_with(
            &["a.json", "b.json"],
            policy,
            Arc::new(FakeRefresher::new()),
        )
        .await;
        manager.report_failure("a.json", None).await;
        manager.report_failure("a.json", None).await;
        assert!(manager
            .state_of("a.json")
            .unwrap()
            .temp_disabled_until
            .is_some());
        // Only the healthy credential is selectable now.
        for i in 0..4 {
            let acquired = manager.acquire(&format!("r{}", i), None).await.unwrap();
            assert_eq!(acquired.source_path, "b.json");
        }
    }

    #[tokio::test]
    async fn test_escape_hatch_revives_error_disabled_credentials() {
        let policy = RotationPolicy {
            max_errors_before_temp_disable: 1,
            temp_disable_ms: 3_600_000,
            cooldown_ms: 0,
            ..RotationPolicy::default()
        };
        let (manager, _) =
            manager_with(&["a.json"], policy, Arc::new(FakeRefresher::new())).await;
        manager.report_failure("a.json", None).await;
        assert!(manager
            .state_of("a.json")
            .unwrap()
            .temp_disabled_until
            .is_some());
        // All credentials cooling down: the one-shot reset lets the request
        // through instead of failing it.
        let acquired = manager.acquire("r1", None).await.unwrap();
        assert_eq!(acquired.source_path, "a.json");
        assert_eq!(manager.state_of("a.json").unwrap().consecutive_errors, 0);
    }

    #[tokio::test]
    async fn test_refresh_failure_lockout_deactivates() {
        let policy = RotationPolicy {
            max_refresh_failures: 2,
            refresh_backoff_ms: 0,
            cooldown_ms: 0,
            ..RotationPolicy::default()
        };
        let (manager, _) =
            manager_with(&["a.json"], policy, Arc::new(FakeRefresher::failing())).await;
        manager.report_failure("a.json", Some(401)).await;
        assert!(manager.state_of("a.json").unwrap().active);
        manager.report_failure("a.json", Some(401)).await;
        let state = manager.state_of("a.json").unwrap();
        assert_eq!(state.refresh_failures, 2);
        assert!(!state.active);
    }

    #[tokio::test]
    async fn test_refresh_backoff_limits_attempts() {
        let policy = RotationPolicy {
            refresh_backoff_ms: 60_000,
            cooldown_ms: 0,
            ..RotationPolicy::default()
        };
        let refresher = Arc::new(FakeRefresher::failing());
        let (manager, _) = manager_with(&["a.json"], policy, refresher.clone()).await;
        manager.report_failure("a.json", Some(401)).await;
        manager.report_failure("a.json", Some(401)).await;
        manager.report_failure("a.json", Some(403)).await;
        // Attempts after the first fall inside the backoff window.
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state_of("a.json").unwrap().refresh_failures, 1);
    }

    #[tokio::test]
    async fn test_refresh_preserves_unknown_keys_and_persists() {
        let store = MemStore::new();
        // Expires inside the refresh window, forcing a refresh on acquire.
        store.insert(
            "a.json",
            serde_json::json!({
                "accessToken": "stale",
                "refreshToken": "r",
                "expiresAt": (Utc::now() + Duration::minutes(1)).to_rfc3339(),
                "profileArn": "arn:aws:codewhisperer:us-east-1:123:profile/p",
                "customKey": "must-survive",
            })
            .to_string(),
        );
        let policy = RotationPolicy {
            refresh_backoff_ms: 0,
            cooldown_ms: 0,
            ..RotationPolicy::default()
        };
        let manager = CredentialManager::load(
            "binding-x",
            &["a.json".to_string()],
            policy,
            Arc::new(store.clone()),
            Arc::new(FakeRefresher::new()),
        )
        .await;

        let acquired = manager.acquire("r1", None).await.unwrap();
        assert_eq!(acquired.access_token, "fresh-token");
        assert_eq!(
            acquired.profile_arn.as_deref(),
            Some("arn:aws:codewhisperer:us-east-1:123:profile/p")
        );

        let persisted: serde_json::Value =
            serde_json::from_str(&store.get("a.json").unwrap()).unwrap();
        assert_eq!(persisted["accessToken"], "fresh-token");
        assert_eq!(persisted["refreshToken"], "fresh-refresh");
        assert_eq!(persisted["customKey"], "must-survive");
        assert_eq!(persisted["profileArn"], "arn:aws:codewhisperer:us-east-1:123:profile/p");
        assert_eq!(persisted["lastRefreshedBy"], "binding-x");
        assert!(persisted["lastRefreshTime"].is_string());
    }

    #[tokio::test]
    async fn test_refresh_single_flight() {
        let store = MemStore::new();
        store.insert(
            "a.json",
            serde_json::json!({
                "accessToken": "stale",
                "refreshToken": "r",
                "expiresAt": (Utc::now() + Duration::minutes(1)).to_rfc3339(),
            })
            .to_string(),
        );
        let refresher = Arc::new(FakeRefresher {
            delay_ms: 50,
            ..FakeRefresher::new()
        });
        let policy = RotationPolicy {
            refresh_backoff_ms: 60_000,
            cooldown_ms: 0,
            ..RotationPolicy::default()
        };
        let manager = Arc::new(
            CredentialManager::load(
                "b",
                &["a.json".to_string()],
                policy,
                Arc::new(store),
                refresher.clone(),
            )
            .await,
        );

        let m1 = manager.clone();
        let m2 = manager.clone();
        let (r1, r2) = tokio::join!(m1.acquire("r1", None), m2.acquire("r2", None));
        assert!(r1.is_ok() && r2.is_ok());
        // The second caller waited on the gate, then hit the backoff check.
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_merge_refreshed_idempotent_preservation() {
        let mut cred: Credential = serde_json::from_str(&credential_json("a")).unwrap();
        cred.source_path = "a.json".to_string();
        let before_extra = cred.extra.clone();
        let before_arn = cred.profile_arn.clone();

        for _ in 0..2 {
            merge_refreshed(
                &mut cred,
                RefreshedTokens {
                    access_token: "n".to_string(),
                    refresh_token: Some("nr".to_string()),
                    expires_at: Some(Utc::now()),
                },
                "b",
            );
        }
        assert_eq!(cred.extra, before_extra);
        assert_eq!(cred.profile_arn, before_arn);
        assert_eq!(cred.auth_method.as_deref(), Some("social"));
        assert_eq!(cred.access_token, "n");
    }

    #[tokio::test]
    async fn test_state_files_written_after_refresh() {
        let store = MemStore::new();
        store.insert(
            "a.json",
            serde_json::json!({
                "accessToken": "stale",
                "refreshToken": "r",
                "expiresAt": (Utc::now() + Duration::minutes(1)).to_rfc3339(),
            })
            .to_string(),
        );
        let policy = RotationPolicy {
            refresh_backoff_ms: 0,
            cooldown_ms: 0,
            ..RotationPolicy::default()
        };
        let manager = CredentialManager::load(
            "b",
            &["a.json".to_string()],
            policy,
            Arc::new(store.clone()),
            Arc::new(FakeRefresher::new()),
        )
        .await
        .with_state_dir("/state");

        manager.acquire("r1", None).await.unwrap();
        let last: serde_json::Value =
            serde_json::from_str(&store.get("/state/last-token-refresh.json").unwrap()).unwrap();
        assert!(last["lastRefreshTime"].is_string());
        let status: serde_json::Value =
            serde_json::from_str(&store.get("/state/token-status.json").unwrap()).unwrap();
        assert_eq!(status["isValid"], true);
        assert_eq!(status["shouldBlock"], false);
    }

    #[tokio::test]
    async fn test_disk_store_atomic_write_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cred.json");
        let store = DiskStore;
        store
            .write_atomic(path.to_str().unwrap(), "{\"accessToken\":\"t\"}")
            .await
            .unwrap();
        let contents = store.read(path.to_str().unwrap()).await.unwrap();
        assert_eq!(contents, "{\"accessToken\":\"t\"}");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
