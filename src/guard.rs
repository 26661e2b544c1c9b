//! 滥用防护：口令失败计数、永久封禁与上传频率限制。

use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, warn};

use crate::blocklist::BlockList;
use crate::clients::ClientTable;
use crate::config::{
    DEFAULT_FAILED_ATTEMPT_WINDOW_SECS, DEFAULT_MAX_FAILED_ATTEMPTS,
    DEFAULT_MAX_UPLOADS_PER_WINDOW, DEFAULT_UPLOAD_WINDOW_SECS,
};

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub max_failed_attempts: u32,
    pub failure_window: Duration,
    pub max_uploads: usize,
    pub upload_window: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: DEFAULT_MAX_FAILED_ATTEMPTS,
            failure_window: Duration::from_secs(DEFAULT_FAILED_ATTEMPT_WINDOW_SECS),
            max_uploads: DEFAULT_MAX_UPLOADS_PER_WINDOW,
            upload_window: Duration::from_secs(DEFAULT_UPLOAD_WINDOW_SECS),
        }
    }
}

/// Result of recording a wrong secret code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Failure counted; the address is still allowed to retry.
    Counted { attempts: u32 },
    /// This failure crossed the threshold and blocked the address.
    Blocked,
    /// The address was blocked before this call; nothing was counted.
    AlreadyBlocked,
}

/// Why an upload was refused by [`AbuseGuard::record_upload_attempt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadDenied {
    /// The address got blocked, possibly while this request was in flight.
    Blocked,
    /// Too many uploads in the window; retry after the given delay.
    RateExceeded(Duration),
}

/// Abuse-prevention state shared by all request handlers.
///
/// Failed-attempt tracking and upload-rate tracking are independent
/// counters on the same per-address record.
#[derive(Debug)]
pub struct AbuseGuard {
    config: GuardConfig,
    clients: ClientTable,
    blocklist: BlockList,
}

impl AbuseGuard {
    /// 加载持久化封禁列表并构建防护实例。
    pub async fn load(config: GuardConfig, blocklist_path: PathBuf) -> io::Result<Self> {
        let blocklist = BlockList::load(blocklist_path).await?;
        Ok(Self {
            config,
            clients: ClientTable::new(),
            blocklist,
        })
    }

    #[cfg(test)]
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    #[cfg(test)]
    pub fn blocklist(&self) -> &BlockList {
        &self.blocklist
    }

    pub async fn is_blocked(&self, address: IpAddr) -> bool {
        if self.blocklist.contains(address).await {
            return true;
        }
        match self.clients.lock_existing(address).await {
            Some(record) => record.blocked,
            None => false,
        }
    }

    pub async fn record_failed_attempt(&self, address: IpAddr) -> FailureOutcome {
        self.record_failed_attempt_at(address, Instant::now()).await
    }

    /// 记录一次口令错误；达到阈值时封禁并在返回前写入封禁列表。
    pub async fn record_failed_attempt_at(&self, address: IpAddr, now: Instant) -> FailureOutcome {
        let mut record = self.clients.lock(address).await;
        if record.blocked || self.blocklist.contains(address).await {
            return FailureOutcome::AlreadyBlocked;
        }

        let attempts = record.register_failure(now, self.config.failure_window);
        if self.config.max_failed_attempts == 0 || attempts < self.config.max_failed_attempts {
            warn!(client_ip = %address, attempts, "wrong secret code");
            return FailureOutcome::Counted { attempts };
        }

        record.blocked = true;
        warn!(client_ip = %record.address, attempts, "address blocked");
        if let Err(err) = self.blocklist.insert(address).await {
            error!(
                client_ip = %address,
                path = ?self.blocklist.path(),
                error = %err,
                "failed to persist block list entry"
            );
        }
        FailureOutcome::Blocked
    }

    /// 口令正确后清零失败计数。
    pub async fn record_success(&self, address: IpAddr) {
        if let Some(mut record) = self.clients.lock_existing(address).await {
            record.clear_failures();
        }
    }

    pub async fn record_upload_attempt(&self, address: IpAddr) -> Result<(), UploadDenied> {
        self.record_upload_attempt_at(address, Instant::now()).await
    }

    /// 上传前的最后一道检查：持有记录锁时复查封禁，再做滑动窗口限流。
    ///
    /// 超限时不登记本次上传，返回建议重试间隔。
    pub async fn record_upload_attempt_at(
        &self,
        address: IpAddr,
        now: Instant,
    ) -> Result<(), UploadDenied> {
        let mut record = self.clients.lock(address).await;
        if record.blocked || self.blocklist.contains(address).await {
            return Err(UploadDenied::Blocked);
        }
        if self.config.max_uploads == 0 {
            return Ok(());
        }
        record
            .try_record_upload(now, self.config.upload_window, self.config.max_uploads)
            .map_err(|retry_after| {
                warn!(
                    client_ip = %address,
                    retry_after_secs = retry_after.as_secs(),
                    "upload rate exceeded"
                );
                UploadDenied::RateExceeded(retry_after)
            })
    }

    #[cfg(test)]
    pub async fn failed_attempts(&self, address: IpAddr) -> u32 {
        match self.clients.lock_existing(address).await {
            Some(record) => record.failed_attempts(),
            None => 0,
        }
    }

    #[cfg(test)]
    pub async fn recent_uploads(&self, address: IpAddr) -> usize {
        match self.clients.lock_existing(address).await {
            Some(record) => record.upload_timestamps.len(),
            None => 0,
        }
    }
}
