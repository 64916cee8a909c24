//! 验证结果的发布流水线。
//!
//! Idle -> HealthChecking -> Syncing -> Publishing -> Idle，任一阶段
//! 不可恢复失败进入 Failed。健康检查失败时不写存储、不发布；
//! 存储不可用只降级去重，发布照常进行；密封回执验证失败永远向上抛。

pub mod channel;
pub mod cryptobox;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub use channel::{ChannelError, RemoteChannel, SshChannel, SshChannelConfig};
pub use cryptobox::{CryptoBox, EncryptedBlob, IntegrityError, KEY_LEN};
pub use store::{KvStore, MemoryStore, StoreError};

use crate::check::{unix_now, CheckResult, Verdict};

/// 流水线所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    HealthChecking,
    Syncing,
    Publishing,
    Failed,
}

/// 通过验证、待发布的单条链接
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidatedLink {
    pub raw: String,
    pub fingerprint: String,
    pub latency_ms: Option<u64>,
}

/// 一次发布的完整载荷，密封后作为回执落存储
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub batch_id: Uuid,
    pub created_at: u64,
    pub links: Vec<ValidatedLink>,
}

impl UpdatePayload {
    /// 从检查结果提取 Valid 子集
    pub fn from_results(results: &[CheckResult]) -> Self {
        let links = results
            .iter()
            .filter(|r| r.verdict == Verdict::Valid)
            .filter_map(|r| {
                r.descriptor.as_ref().map(|d| ValidatedLink {
                    raw: r.raw.clone(),
                    fingerprint: d.fingerprint(),
                    latency_ms: r.latency.map(|l| l.as_millis() as u64),
                })
            })
            .collect();

        Self {
            batch_id: Uuid::new_v4(),
            created_at: unix_now(),
            links,
        }
    }
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("remote health check failed: {0}")]
    HealthCheck(#[source] ChannelError),

    #[error("publish failed after {attempts} attempts: {source}")]
    Publish {
        attempts: u32,
        #[source]
        source: ChannelError,
    },

    #[error("sealed receipt failed verification: {0}")]
    Integrity(#[from] IntegrityError),
}

/// 发布重试策略：指数退避
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// 一次 run 的结果统计
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSummary {
    /// 实际发布的新链接数
    pub published: usize,
    /// 指纹命中、被去重的数量
    pub deduplicated: usize,
    /// 存储不可用，本轮跳过了去重和指纹记录
    pub skipped_store: bool,
}

/// 发布流水线
pub struct Updater {
    channel: Arc<dyn RemoteChannel>,
    store: Arc<dyn KvStore>,
    crypto: CryptoBox,
    key_prefix: String,
    dedup_ttl: Duration,
    retry: RetryPolicy,
    state: Mutex<RunState>,
}

impl Updater {
    pub fn new(
        channel: Arc<dyn RemoteChannel>,
        store: Arc<dyn KvStore>,
        crypto: CryptoBox,
        key_prefix: String,
        dedup_ttl: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            channel,
            store,
            crypto,
            key_prefix,
            dedup_ttl,
            retry,
            state: Mutex::new(RunState::Idle),
        }
    }

    pub async fn state(&self) -> RunState {
        *self.state.lock().await
    }

    async fn set_state(&self, state: RunState) {
        *self.state.lock().await = state;
    }

    fn fingerprint_key(&self, fingerprint: &str) -> String {
        format!("{}:fp:{}", self.key_prefix, fingerprint)
    }

    fn receipt_key(&self) -> String {
        format!("{}:receipt", self.key_prefix)
    }

    fn last_run_key(&self) -> String {
        format!("{}:last_run", self.key_prefix)
    }

    /// 执行一轮发布。
    ///
    /// 健康检查失败是环境级故障：不碰存储、不发布，进 Failed。
    /// 存储故障降级为全量发布（跳过去重），发布通道故障按策略重试。
    pub async fn run(&self, results: &[CheckResult]) -> Result<UpdateSummary, UpdateError> {
        self.set_state(RunState::HealthChecking).await;
        if let Err(e) = self.channel.health_check().await {
            self.set_state(RunState::Failed).await;
            return Err(UpdateError::HealthCheck(e));
        }

        self.set_state(RunState::Syncing).await;
        let payload = UpdatePayload::from_results(results);

        // 上一轮回执完整性校验；坏回执不允许静默继续
        match self.store.get(&self.receipt_key()).await {
            Ok(Some(blob)) => {
                let opened = match self.crypto.open_bytes(&blob) {
                    Ok(opened) => opened,
                    Err(e) => {
                        warn!("previous publish receipt failed verification");
                        self.set_state(RunState::Failed).await;
                        return Err(e.into());
                    }
                };
                if let Err(e) = serde_json::from_slice::<UpdatePayload>(&opened) {
                    // 解得开但读不懂：密钥没问题，格式变了，记录后继续
                    warn!(error = %e, "previous publish receipt has unreadable payload");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "store unavailable while reading receipt");
            }
        }

        let mut fresh: Vec<&ValidatedLink> = Vec::new();
        let mut deduplicated = 0usize;
        let mut skipped_store = false;

        for link in &payload.links {
            if skipped_store {
                fresh.push(link);
                continue;
            }
            match self.store.get(&self.fingerprint_key(&link.fingerprint)).await {
                Ok(Some(_)) => deduplicated += 1,
                Ok(None) => fresh.push(link),
                Err(e) => {
                    // 存储挂了：放弃去重，本轮全量发布
                    warn!(error = %e, "store unavailable, skipping dedup for this run");
                    skipped_store = true;
                    fresh.push(link);
                }
            }
        }

        if fresh.is_empty() {
            info!(deduplicated, "no fresh links, nothing to publish");
            self.set_state(RunState::Idle).await;
            return Ok(UpdateSummary {
                published: 0,
                deduplicated,
                skipped_store,
            });
        }

        self.set_state(RunState::Publishing).await;
        let content: String = fresh
            .iter()
            .map(|l| l.raw.as_str())
            .collect::<Vec<_>>()
            .join("\n")
            + "\n";
        let message = format!("update {}: {} links", payload.batch_id, fresh.len());

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.channel.publish(&content, &message).await {
                Ok(()) => break,
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let backoff = self.retry.backoff(attempt);
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "publish failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    self.set_state(RunState::Failed).await;
                    return Err(UpdateError::Publish {
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }

        // 发布已成功，存储侧的记录失败只降级不回滚
        if !skipped_store {
            for link in &fresh {
                if let Err(e) = self
                    .store
                    .set(
                        &self.fingerprint_key(&link.fingerprint),
                        link.raw.clone().into_bytes(),
                        Some(self.dedup_ttl),
                    )
                    .await
                {
                    warn!(error = %e, "failed to record fingerprint");
                    skipped_store = true;
                    break;
                }
            }
        }

        let receipt_payload = UpdatePayload {
            batch_id: payload.batch_id,
            created_at: payload.created_at,
            links: fresh.iter().map(|l| (*l).clone()).collect(),
        };
        if !skipped_store {
            match serde_json::to_vec(&receipt_payload) {
                Ok(bytes) => match self.crypto.seal_bytes(&bytes) {
                    Ok(blob) => {
                        if let Err(e) = self.store.set(&self.receipt_key(), blob, None).await {
                            warn!(error = %e, "failed to store publish receipt");
                        }
                        if let Err(e) = self
                            .store
                            .set(
                                &self.last_run_key(),
                                unix_now().to_string().into_bytes(),
                                None,
                            )
                            .await
                        {
                            warn!(error = %e, "failed to store last run timestamp");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to seal publish receipt"),
                },
                Err(e) => warn!(error = %e, "failed to serialize publish receipt"),
            }
        }

        let published = fresh.len();
        info!(
            batch_id = %payload.batch_id,
            published,
            deduplicated,
            attempts = attempt,
            "publish completed"
        );
        self.set_state(RunState::Idle).await;
        Ok(UpdateSummary {
            published,
            deduplicated,
            skipped_store,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::check::Verdict;
    use crate::link;

    fn valid_result(raw: &str) -> CheckResult {
        CheckResult {
            raw: raw.to_string(),
            descriptor: Some(link::decode(raw).unwrap()),
            verdict: Verdict::Valid,
            latency: Some(Duration::from_millis(42)),
            error: None,
            checked_at: 0,
        }
    }

    fn invalid_result(raw: &str) -> CheckResult {
        CheckResult {
            raw: raw.to_string(),
            descriptor: None,
            verdict: Verdict::Invalid,
            latency: None,
            error: Some("decode failed".to_string()),
            checked_at: 0,
        }
    }

    struct MockChannel {
        health_fails: bool,
        publish_failures: AtomicUsize,
        auth_failure: bool,
        published: Mutex<Vec<String>>,
    }

    impl MockChannel {
        fn ok() -> Self {
            Self {
                health_fails: false,
                publish_failures: AtomicUsize::new(0),
                auth_failure: false,
                published: Mutex::new(Vec::new()),
            }
        }

        fn failing_publishes(n: usize) -> Self {
            Self {
                publish_failures: AtomicUsize::new(n),
                ..Self::ok()
            }
        }
    }

    impl Default for MockChannel {
        fn default() -> Self {
            Self::ok()
        }
    }

    #[async_trait]
    impl RemoteChannel for MockChannel {
        async fn health_check(&self) -> Result<(), ChannelError> {
            if self.health_fails {
                Err(ChannelError::Connect("unreachable".to_string()))
            } else {
                Ok(())
            }
        }

        async fn publish(&self, content: &str, _message: &str) -> Result<(), ChannelError> {
            let remaining = self.publish_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.publish_failures.fetch_sub(1, Ordering::SeqCst);
                return if self.auth_failure {
                    Err(ChannelError::Auth("key rejected".to_string()))
                } else {
                    Err(ChannelError::Remote("push failed".to_string()))
                };
            }
            self.published.lock().await.push(content.to_string());
            Ok(())
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl KvStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }

        async fn set(
            &self,
            _key: &str,
            _value: Vec<u8>,
            _ttl: Option<Duration>,
        ) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
    }

    fn updater(channel: Arc<MockChannel>, store: Arc<dyn KvStore>) -> Updater {
        Updater::new(
            channel,
            store,
            CryptoBox::new(&[7u8; KEY_LEN]),
            "subcheck".to_string(),
            Duration::from_secs(3600),
            RetryPolicy {
                max_attempts: 3,
                base_backoff: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn publishes_valid_subset() {
        let channel = Arc::new(MockChannel::ok());
        let store = Arc::new(MemoryStore::new());
        let updater = updater(Arc::clone(&channel), store);

        let results = vec![
            valid_result("trojan://pw@a.test:443"),
            invalid_result("garbage"),
            valid_result("trojan://pw@b.test:443"),
        ];
        let summary = updater.run(&results).await.unwrap();

        assert_eq!(summary.published, 2);
        assert_eq!(summary.deduplicated, 0);
        assert!(!summary.skipped_store);
        assert_eq!(updater.state().await, RunState::Idle);

        let published = channel.published.lock().await;
        assert_eq!(published.len(), 1);
        assert!(published[0].contains("trojan://pw@a.test:443"));
        assert!(published[0].contains("trojan://pw@b.test:443"));
        assert!(!published[0].contains("garbage"));
    }

    #[tokio::test]
    async fn second_run_is_idempotent() {
        let channel = Arc::new(MockChannel::ok());
        let store = Arc::new(MemoryStore::new());
        let updater = updater(Arc::clone(&channel), store);

        let results = vec![valid_result("trojan://pw@a.test:443")];
        updater.run(&results).await.unwrap();
        let summary = updater.run(&results).await.unwrap();

        assert_eq!(summary.published, 0);
        assert_eq!(summary.deduplicated, 1);
        // 第二轮没有新内容，通道只被推了一次
        assert_eq!(channel.published.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn health_failure_leaves_store_untouched() {
        let channel = Arc::new(MockChannel {
            health_fails: true,
            ..MockChannel::ok()
        });
        let store = Arc::new(MemoryStore::new());
        let updater = updater(channel, Arc::clone(&store) as Arc<dyn KvStore>);

        let results = vec![valid_result("trojan://pw@a.test:443")];
        let err = updater.run(&results).await.unwrap_err();

        assert!(matches!(err, UpdateError::HealthCheck(_)));
        assert_eq!(updater.state().await, RunState::Failed);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn store_outage_degrades_but_publishes() {
        let channel = Arc::new(MockChannel::ok());
        let updater = updater(Arc::clone(&channel), Arc::new(BrokenStore));

        let results = vec![valid_result("trojan://pw@a.test:443")];
        let summary = updater.run(&results).await.unwrap();

        assert_eq!(summary.published, 1);
        assert!(summary.skipped_store);
        assert_eq!(channel.published.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn retryable_publish_failure_is_retried() {
        let channel = Arc::new(MockChannel::failing_publishes(2));
        let store = Arc::new(MemoryStore::new());
        let updater = updater(Arc::clone(&channel), store);

        let results = vec![valid_result("trojan://pw@a.test:443")];
        let summary = updater.run(&results).await.unwrap();
        assert_eq!(summary.published, 1);
        assert_eq!(channel.published.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn publish_exhausts_retries() {
        let channel = Arc::new(MockChannel::failing_publishes(10));
        let store = Arc::new(MemoryStore::new());
        let updater = updater(channel, store);

        let results = vec![valid_result("trojan://pw@a.test:443")];
        let err = updater.run(&results).await.unwrap_err();
        match err {
            UpdateError::Publish { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(updater.state().await, RunState::Failed);
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let channel = Arc::new(MockChannel {
            auth_failure: true,
            publish_failures: AtomicUsize::new(10),
            ..MockChannel::ok()
        });
        let store = Arc::new(MemoryStore::new());
        let updater = updater(channel, store);

        let results = vec![valid_result("trojan://pw@a.test:443")];
        let err = updater.run(&results).await.unwrap_err();
        match err {
            UpdateError::Publish { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn empty_fresh_set_skips_publish() {
        let channel = Arc::new(MockChannel::ok());
        let store = Arc::new(MemoryStore::new());
        let updater = updater(Arc::clone(&channel), store);

        let results = vec![invalid_result("garbage")];
        let summary = updater.run(&results).await.unwrap();
        assert_eq!(summary.published, 0);
        assert!(channel.published.lock().await.is_empty());
        assert_eq!(updater.state().await, RunState::Idle);
    }

    #[tokio::test]
    async fn tampered_receipt_surfaces_integrity_error() {
        let channel = Arc::new(MockChannel::ok());
        let store = Arc::new(MemoryStore::new());
        store
            .set("subcheck:receipt", vec![0u8; 64], None)
            .await
            .unwrap();
        let updater = updater(channel, Arc::clone(&store) as Arc<dyn KvStore>);

        let results = vec![valid_result("trojan://pw@a.test:443")];
        let err = updater.run(&results).await.unwrap_err();
        assert!(matches!(err, UpdateError::Integrity(_)));
    }

    #[test]
    fn payload_filters_to_valid() {
        let results = vec![
            valid_result("trojan://pw@a.test:443"),
            invalid_result("garbage"),
        ];
        let payload = UpdatePayload::from_results(&results);
        assert_eq!(payload.links.len(), 1);
        assert_eq!(payload.links[0].latency_ms, Some(42));
        assert_eq!(payload.links[0].fingerprint.len(), 64);
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
    }
}
