//! 持久化封禁列表：每行一个地址，只追加。

use std::collections::HashSet;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug)]
struct BlockListState {
    addresses: HashSet<IpAddr>,
    file: File,
}

/// Durable set of blocked addresses backed by an append-only text file.
#[derive(Debug)]
pub struct BlockList {
    path: PathBuf,
    state: Mutex<BlockListState>,
}

impl BlockList {
    /// 读取已有封禁记录并打开追加句柄，文件不存在时创建。
    pub async fn load(path: PathBuf) -> io::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }

        let addresses = match fs::read_to_string(&path).await {
            Ok(content) => parse_entries(&path, &content),
            Err(err) if err.kind() == io::ErrorKind::NotFound => HashSet::new(),
            Err(err) => return Err(err),
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        info!(path = ?path, count = addresses.len(), "block list loaded");

        Ok(Self {
            path,
            state: Mutex::new(BlockListState { addresses, file }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn contains(&self, address: IpAddr) -> bool {
        self.state.lock().await.addresses.contains(&address)
    }

    /// 加入封禁集合并落盘；已存在时返回 `Ok(false)`。
    ///
    /// 内存中的封禁先于写盘生效，写盘失败时仍保持封禁并返回错误。
    pub async fn insert(&self, address: IpAddr) -> io::Result<bool> {
        let mut state = self.state.lock().await;
        if !state.addresses.insert(address) {
            return Ok(false);
        }
        let line = format!("{address}\n");
        state.file.write_all(line.as_bytes()).await?;
        state.file.flush().await?;
        state.file.sync_data().await?;
        Ok(true)
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.state.lock().await.addresses.len()
    }
}

fn parse_entries(path: &Path, content: &str) -> HashSet<IpAddr> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match line.parse::<IpAddr>() {
            Ok(address) => Some(address),
            Err(_) => {
                warn!(path = ?path, entry = line, "ignoring malformed block list entry");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn insert_survives_reload() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("state").join("blocked_ips.txt");
        let address: IpAddr = "10.0.0.5".parse().expect("ip");

        let list = BlockList::load(path.clone()).await.expect("load");
        assert!(!list.contains(address).await);
        assert!(list.insert(address).await.expect("insert"));
        assert!(!list.insert(address).await.expect("insert again"));
        drop(list);

        let reloaded = BlockList::load(path.clone()).await.expect("reload");
        assert!(reloaded.contains(address).await);
        assert_eq!(reloaded.len().await, 1);
        let content = std::fs::read_to_string(&path).expect("read");
        assert_eq!(content, "10.0.0.5\n");
    }

    #[tokio::test]
    async fn load_skips_malformed_lines() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("blocked_ips.txt");
        std::fs::write(&path, "192.168.1.7\n\nnot-an-ip\n::1\n").expect("seed");

        let list = BlockList::load(path).await.expect("load");
        assert_eq!(list.len().await, 2);
        assert!(list.contains("192.168.1.7".parse().expect("ip")).await);
        assert!(list.contains("::1".parse().expect("ip")).await);
    }
}
