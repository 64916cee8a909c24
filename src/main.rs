use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use subcheck::check::{CheckBatch, CheckDefaults, Checker, Verdict};
use subcheck::common::DialerConfig;
use subcheck::update::{
    CryptoBox, MemoryStore, RetryPolicy, SshChannel, SshChannelConfig, Updater,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "config.yaml".to_string());
    let links_path = args.next();

    let config = subcheck::config::load_config(&config_path)?;
    info!(config = %config_path, "config loaded");

    // 链接来源：第二个参数指定文件，否则读 stdin
    let text = match links_path {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read links file {}", path))?,
        None => {
            use std::io::Read;
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    let defaults = CheckDefaults {
        max_concurrent: config.app.max_concurrent,
        check_timeout: Duration::from_millis(config.app.check_timeout_ms),
        check_host: config.app.check_host.clone(),
    };
    let batch = CheckBatch::from_lines(&text, &defaults);

    let checker = Checker::with_network(DialerConfig {
        bind_address: config.app.bind_address.clone(),
        ..Default::default()
    });
    let results = checker.check(batch).await;

    for result in &results {
        let latency = result
            .latency
            .map(|l| format!("{}ms", l.as_millis()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}\t{}\t{}\t{}",
            result.verdict.as_str(),
            latency,
            result.raw,
            result.error.as_deref().unwrap_or("")
        );
    }

    let Some(remote) = config.remote else {
        info!("no remote configured, skipping publish");
        return Ok(());
    };

    let key = remote.encryption_key_bytes()?;
    let channel = SshChannel::new(SshChannelConfig {
        host: remote.host,
        port: remote.port,
        user: remote.user,
        key_path: remote.ssh_key_path,
        key_passphrase: remote.ssh_key_passphrase,
        repo_path: remote.repo_path,
        file_path: remote.file_path,
        branch: remote.branch,
    });

    let updater = Updater::new(
        Arc::new(channel),
        Arc::new(MemoryStore::new()),
        CryptoBox::new(&key),
        config.store.key_prefix,
        Duration::from_secs(config.store.dedup_ttl_secs),
        RetryPolicy::default(),
    );

    let summary = updater.run(&results).await?;
    let valid = results
        .iter()
        .filter(|r| r.verdict == Verdict::Valid)
        .count();
    info!(
        valid,
        published = summary.published,
        deduplicated = summary.deduplicated,
        "run complete"
    );

    Ok(())
}
