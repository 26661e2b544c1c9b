//! 按来源地址划分的客户端记录表，每个地址一把异步锁。

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-address abuse counters. Only [`crate::guard::AbuseGuard`] mutates these.
#[derive(Debug)]
pub struct ClientRecord {
    pub address: IpAddr,
    pub failure_timestamps: VecDeque<Instant>,
    pub last_attempt_at: Option<Instant>,
    pub upload_timestamps: VecDeque<Instant>,
    pub blocked: bool,
}

impl ClientRecord {
    fn new(address: IpAddr) -> Self {
        Self {
            address,
            failure_timestamps: VecDeque::new(),
            last_attempt_at: None,
            upload_timestamps: VecDeque::new(),
            blocked: false,
        }
    }

    /// 记录一次失败并返回滑动窗口内（含本次）的失败次数。
    pub fn register_failure(&mut self, now: Instant, window: Duration) -> u32 {
        prune_window(&mut self.failure_timestamps, now, window);
        self.failure_timestamps.push_back(now);
        self.last_attempt_at = Some(now);
        u32::try_from(self.failure_timestamps.len()).unwrap_or(u32::MAX)
    }

    #[cfg(test)]
    pub fn failed_attempts(&self) -> u32 {
        u32::try_from(self.failure_timestamps.len()).unwrap_or(u32::MAX)
    }

    pub fn clear_failures(&mut self) {
        self.failure_timestamps.clear();
    }

    /// 丢弃已滑出窗口的上传时间戳。
    pub fn prune_uploads(&mut self, now: Instant, window: Duration) {
        prune_window(&mut self.upload_timestamps, now, window);
    }

    /// 窗口未满时登记本次上传；已满时返回距离最早记录过期的剩余时间。
    pub fn try_record_upload(
        &mut self,
        now: Instant,
        window: Duration,
        max_uploads: usize,
    ) -> Result<(), Duration> {
        self.prune_uploads(now, window);
        if self.upload_timestamps.len() >= max_uploads {
            let retry_after = self
                .upload_timestamps
                .front()
                .map(|oldest| window.saturating_sub(now.saturating_duration_since(*oldest)))
                .unwrap_or(window);
            return Err(retry_after);
        }
        self.upload_timestamps.push_back(now);
        Ok(())
    }
}

fn prune_window(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = timestamps.front() {
        if now.saturating_duration_since(*oldest) < window {
            break;
        }
        timestamps.pop_front();
    }
}

/// Lazily creates one [`ClientRecord`] per address behind its own mutex.
///
/// The outer map lock is held only long enough to look up or insert the
/// entry, so work on different addresses proceeds concurrently.
#[derive(Debug, Default)]
pub struct ClientTable {
    records: Mutex<HashMap<IpAddr, Arc<Mutex<ClientRecord>>>>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// 获取（必要时创建）地址对应的记录并加锁。
    pub async fn lock(&self, address: IpAddr) -> OwnedMutexGuard<ClientRecord> {
        let record = {
            let mut records = self.records.lock().await;
            records
                .entry(address)
                .or_insert_with(|| Arc::new(Mutex::new(ClientRecord::new(address))))
                .clone()
        };
        record.lock_owned().await
    }

    /// 已存在记录时加锁返回，不创建新记录。
    pub async fn lock_existing(&self, address: IpAddr) -> Option<OwnedMutexGuard<ClientRecord>> {
        let record = {
            let records = self.records.lock().await;
            records.get(&address).cloned()
        }?;
        Some(record.lock_owned().await)
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn failures_slide_out_of_window() {
        let window = Duration::from_secs(60);
        let start = Instant::now();
        let mut record = ClientRecord::new(addr(1));
        assert_eq!(record.register_failure(start, window), 1);
        assert_eq!(record.register_failure(start + Duration::from_secs(30), window), 2);
        // 只有最早的一次滑出窗口，30s 时的失败仍然计数。
        assert_eq!(record.register_failure(start + Duration::from_secs(61), window), 2);
        assert_eq!(record.register_failure(start + Duration::from_secs(200), window), 1);
        assert_eq!(record.last_attempt_at, Some(start + Duration::from_secs(200)));

        record.clear_failures();
        assert_eq!(record.failed_attempts(), 0);
    }

    #[test]
    fn upload_window_prunes_old_entries() {
        let window = Duration::from_secs(60);
        let start = Instant::now();
        let mut record = ClientRecord::new(addr(2));
        for offset in [0, 10, 20] {
            assert!(record
                .try_record_upload(start + Duration::from_secs(offset), window, 3)
                .is_ok());
        }
        let retry = record
            .try_record_upload(start + Duration::from_secs(30), window, 3)
            .expect_err("fourth upload is over the ceiling");
        assert_eq!(retry, Duration::from_secs(30));
        assert_eq!(record.upload_timestamps.len(), 3);

        assert!(record
            .try_record_upload(start + Duration::from_secs(60), window, 3)
            .is_ok());
        assert_eq!(record.upload_timestamps.len(), 3);
    }

    #[tokio::test]
    async fn table_creates_records_lazily() {
        let table = ClientTable::new();
        assert!(table.lock_existing(addr(3)).await.is_none());
        {
            let record = table.lock(addr(3)).await;
            assert_eq!(record.address, addr(3));
        }
        assert!(table.lock_existing(addr(3)).await.is_some());
        assert_eq!(table.len().await, 1);
    }
}
