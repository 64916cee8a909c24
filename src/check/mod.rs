//! 批量可达性检查。
//!
//! 一次 check 接收一批原始链接，解码后在信号量约束下并发探测，
//! 结果顺序与输入一一对应。解码失败的链接不占探测并发额度。

pub mod probe;
pub mod ss_wire;
pub mod vmess_wire;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use probe::{Prober, ProtocolProber};

use crate::common::{Address, CheckError, CheckErrorKind, Dialer, DialerConfig};
use crate::link::{self, ConnectionDescriptor};

/// 单条链接的最终判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// 握手完成，凭据被接受
    Valid,
    /// 对端明确拒绝：解码失败、连接被拒、TLS/协议握手失败
    Invalid,
    /// 超出单条或全局时限
    Timeout,
    /// 我方内部故障，节点状态未知
    Error,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Valid => "VALID",
            Verdict::Invalid => "INVALID",
            Verdict::Timeout => "TIMEOUT",
            Verdict::Error => "ERROR",
        }
    }
}

/// 单条链接的检查结果
#[derive(Debug, Clone)]
pub struct CheckResult {
    /// 原始链接文本，原样保留
    pub raw: String,
    /// 解码成功时的描述符
    pub descriptor: Option<ConnectionDescriptor>,
    pub verdict: Verdict,
    /// 仅 Valid 时有值：从发起连接到握手验证完成
    pub latency: Option<Duration>,
    pub error: Option<String>,
    /// 判定时刻（Unix 秒）
    pub checked_at: u64,
}

/// 检查参数的缺省值
#[derive(Debug, Clone)]
pub struct CheckDefaults {
    pub max_concurrent: usize,
    pub check_timeout: Duration,
    pub check_host: String,
}

impl Default for CheckDefaults {
    fn default() -> Self {
        Self {
            max_concurrent: 50,
            check_timeout: Duration::from_secs(10),
            check_host: "cp.cloudflare.com".to_string(),
        }
    }
}

/// 一批待检查的链接
#[derive(Debug, Clone)]
pub struct CheckBatch {
    pub links: Vec<String>,
    /// 握手里声明的透传目标
    pub target: Address,
    /// 单条探测时限
    pub timeout: Duration,
    pub concurrency: usize,
    /// 整批的硬时限；过期后未完成的任务判 Timeout
    pub deadline: Option<Duration>,
}

impl CheckBatch {
    pub fn new(links: Vec<String>, defaults: &CheckDefaults) -> Self {
        Self {
            links,
            target: Address::Domain(defaults.check_host.clone(), 80),
            timeout: defaults.check_timeout,
            concurrency: defaults.max_concurrent.max(1),
            deadline: None,
        }
    }

    /// 从多行文本构批：空行和 # 注释行跳过
    pub fn from_lines(text: &str, defaults: &CheckDefaults) -> Self {
        let links = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect();
        Self::new(links, defaults)
    }
}

/// 并发批量检查器
pub struct Checker {
    prober: Arc<dyn Prober>,
}

impl Checker {
    pub fn new(prober: Arc<dyn Prober>) -> Self {
        Self { prober }
    }

    /// 用真实网络探测器构造
    pub fn with_network(dialer_config: DialerConfig) -> Self {
        Self::new(Arc::new(ProtocolProber::new(Dialer::new(dialer_config))))
    }

    /// 检查一整批链接。
    ///
    /// 返回向量与 `batch.links` 等长且同序。本函数不会 panic，
    /// 单个探测任务 panic 被隔离为该条的 Error 判定。
    pub async fn check(&self, batch: CheckBatch) -> Vec<CheckResult> {
        let started = Instant::now();
        let total = batch.links.len();
        info!(total, concurrency = batch.concurrency, "starting batch check");

        let semaphore = Arc::new(Semaphore::new(batch.concurrency));
        let target = Arc::new(batch.target.clone());

        let mut results: Vec<Option<CheckResult>> = Vec::with_capacity(total);
        results.resize_with(total, || None);
        let mut handles: Vec<(usize, String, JoinHandle<CheckResult>)> = Vec::new();

        for (idx, raw) in batch.links.iter().enumerate() {
            match link::decode(raw) {
                Err(e) => {
                    // 解码失败不上网，直接判 Invalid
                    debug!(link = %raw, error = %e, "decode failed");
                    results[idx] = Some(CheckResult {
                        raw: raw.clone(),
                        descriptor: None,
                        verdict: Verdict::Invalid,
                        latency: None,
                        error: Some(e.to_string()),
                        checked_at: unix_now(),
                    });
                }
                Ok(descriptor) => {
                    let raw = raw.clone();
                    let raw_for_handle = raw.clone();
                    let prober = Arc::clone(&self.prober);
                    let semaphore = Arc::clone(&semaphore);
                    let target = Arc::clone(&target);
                    let timeout = batch.timeout;

                    let handle = tokio::spawn(async move {
                        // 并发闸门；Semaphore 不会被关闭，acquire 不会失败
                        let _permit = semaphore.acquire().await;
                        probe_one(prober.as_ref(), raw, descriptor, &target, timeout).await
                    });
                    handles.push((idx, raw_for_handle, handle));
                }
            }
        }

        let deadline = batch.deadline.map(|d| started + d);
        for (idx, raw, handle) in handles {
            let outcome = match deadline {
                None => handle.await,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let abort = handle.abort_handle();
                    match tokio::time::timeout(remaining, handle).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            abort.abort();
                            // 全局截止：放弃这条任务
                            results[idx] = Some(CheckResult {
                                raw,
                                descriptor: None,
                                verdict: Verdict::Timeout,
                                latency: None,
                                error: Some("batch deadline exceeded".to_string()),
                                checked_at: unix_now(),
                            });
                            continue;
                        }
                    }
                }
            };

            results[idx] = Some(match outcome {
                Ok(result) => result,
                Err(join_err) => {
                    warn!(error = %join_err, "probe task failed to join");
                    CheckResult {
                        raw,
                        descriptor: None,
                        verdict: Verdict::Error,
                        latency: None,
                        error: Some(format!("probe task panicked: {}", join_err)),
                        checked_at: unix_now(),
                    }
                }
            });
        }

        let results: Vec<CheckResult> = results.into_iter().flatten().collect();
        let valid = results
            .iter()
            .filter(|r| r.verdict == Verdict::Valid)
            .count();
        info!(
            total,
            valid,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch check finished"
        );
        results
    }
}

async fn probe_one(
    prober: &dyn Prober,
    raw: String,
    descriptor: ConnectionDescriptor,
    target: &Address,
    timeout: Duration,
) -> CheckResult {
    let start = Instant::now();
    let (verdict, latency, error) =
        match tokio::time::timeout(timeout, prober.probe(&descriptor, target)).await {
            Ok(Ok(())) => (Verdict::Valid, Some(start.elapsed()), None),
            Ok(Err(e)) => {
                let kind = CheckError::classify(&e);
                let verdict = match kind {
                    CheckErrorKind::ConnectionTimeout => Verdict::Timeout,
                    k if k.is_rejection() => Verdict::Invalid,
                    _ => Verdict::Error,
                };
                (verdict, None, Some(format!("{}: {}", kind.as_str(), e)))
            }
            Err(_) => (
                Verdict::Timeout,
                None,
                Some(format!("probe exceeded {:?}", timeout)),
            ),
        };

    debug!(
        link = %descriptor.tag(),
        host = %descriptor.host(),
        verdict = verdict.as_str(),
        "probe finished"
    );

    CheckResult {
        raw,
        descriptor: Some(descriptor),
        verdict,
        latency,
        error,
        checked_at: unix_now(),
    }
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    /// 按目标 host 脚本化结果的探测器
    struct ScriptedProber {
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedProber {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, descriptor: &ConnectionDescriptor, _target: &Address) -> Result<(), anyhow::Error> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            // host 前缀决定脚本行为
            match descriptor.host() {
                h if h.starts_with("ok") => Ok(()),
                h if h.starts_with("refuse") => Err(CheckError::ConnectionRefused(h.to_string()).into()),
                h if h.starts_with("slow") => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
                h if h.starts_with("panic") => panic!("scripted panic"),
                h => Err(anyhow!("unscripted host {}", h)),
            }
        }
    }

    fn trojan_link(host: &str) -> String {
        format!("trojan://pw@{}:443", host)
    }

    fn vless_link(host: &str) -> String {
        format!("vless://{}@{}:443", UUID, host)
    }

    fn defaults() -> CheckDefaults {
        CheckDefaults {
            max_concurrent: 4,
            check_timeout: Duration::from_millis(500),
            check_host: "example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn results_preserve_input_order() {
        let prober = Arc::new(ScriptedProber::new(Duration::ZERO));
        let checker = Checker::new(prober);

        let links = vec![
            trojan_link("ok-a.test"),
            "garbage-link".to_string(),
            vless_link("refuse.test"),
            trojan_link("ok-b.test"),
        ];
        let batch = CheckBatch::new(links.clone(), &defaults());
        let results = checker.check(batch).await;

        assert_eq!(results.len(), 4);
        for (result, raw) in results.iter().zip(&links) {
            assert_eq!(&result.raw, raw);
        }
        assert_eq!(results[0].verdict, Verdict::Valid);
        assert_eq!(results[1].verdict, Verdict::Invalid);
        assert!(results[1].descriptor.is_none());
        assert_eq!(results[2].verdict, Verdict::Invalid);
        assert_eq!(results[3].verdict, Verdict::Valid);
        assert!(results[0].latency.is_some());
        assert!(results[2].latency.is_none());
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let prober = Arc::new(ScriptedProber::new(Duration::from_millis(30)));
        let checker = Checker::new(Arc::clone(&prober) as Arc<dyn Prober>);

        let links: Vec<String> = (0..20).map(|i| trojan_link(&format!("ok-{}.test", i))).collect();
        let mut d = defaults();
        d.max_concurrent = 3;
        let batch = CheckBatch::new(links, &d);
        let results = checker.check(batch).await;

        assert!(results.iter().all(|r| r.verdict == Verdict::Valid));
        assert!(prober.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn per_item_timeout_yields_timeout_verdict() {
        let prober = Arc::new(ScriptedProber::new(Duration::ZERO));
        let checker = Checker::new(prober);

        let batch = CheckBatch::new(vec![trojan_link("slow.test")], &defaults());
        let results = checker.check(batch).await;
        assert_eq!(results[0].verdict, Verdict::Timeout);
        assert!(results[0].error.as_ref().unwrap().contains("exceeded"));
    }

    #[tokio::test]
    async fn batch_deadline_marks_unfinished_as_timeout() {
        let prober = Arc::new(ScriptedProber::new(Duration::ZERO));
        let checker = Checker::new(prober);

        let mut d = defaults();
        d.check_timeout = Duration::from_secs(60);
        let mut batch = CheckBatch::new(
            vec![trojan_link("ok.test"), trojan_link("slow.test")],
            &d,
        );
        batch.deadline = Some(Duration::from_millis(200));
        let results = checker.check(batch).await;

        assert_eq!(results[0].verdict, Verdict::Valid);
        assert_eq!(results[1].verdict, Verdict::Timeout);
        assert!(results[1]
            .error
            .as_ref()
            .unwrap()
            .contains("batch deadline"));
    }

    #[tokio::test]
    async fn probe_panic_is_isolated() {
        let prober = Arc::new(ScriptedProber::new(Duration::ZERO));
        let checker = Checker::new(prober);

        let batch = CheckBatch::new(
            vec![trojan_link("panic.test"), trojan_link("ok.test")],
            &defaults(),
        );
        let results = checker.check(batch).await;
        assert_eq!(results[0].verdict, Verdict::Error);
        assert_eq!(results[1].verdict, Verdict::Valid);
    }

    #[tokio::test]
    async fn unscripted_error_is_error_verdict() {
        let prober = Arc::new(ScriptedProber::new(Duration::ZERO));
        let checker = Checker::new(prober);

        let batch = CheckBatch::new(vec![trojan_link("mystery.test")], &defaults());
        let results = checker.check(batch).await;
        assert_eq!(results[0].verdict, Verdict::Error);
    }

    #[test]
    fn from_lines_skips_blank_and_comments() {
        let text = format!(
            "\n# comment line\n{}\n\n  {}  \n",
            trojan_link("a.test"),
            vless_link("b.test")
        );
        let batch = CheckBatch::from_lines(&text, &defaults());
        assert_eq!(batch.links.len(), 2);
    }
}
