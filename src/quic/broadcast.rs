//! 连接级广播点
//!
//! 每个广播点由连接记录持有；订阅返回 `Subscription`，丢弃即退订。
//! 慢订阅者落后时跳过丢失的消息并记录 warn，而不是阻塞发布方。

use tokio::sync::broadcast;

/// 默认缓冲容量（与包流量同量级）
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug)]
pub struct Broadcaster<T> {
    name: &'static str,
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    pub fn new(name: &'static str) -> Self {
        Self::with_capacity(name, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(name: &'static str, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { name, tx }
    }

    /// 发布给当前所有订阅者；没有订阅者时静默丢弃
    pub fn submit(&self, value: T) {
        let _ = self.tx.send(value);
    }

    pub fn subscribe(&self) -> Subscription<T> {
        Subscription {
            name: self.name,
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// 可撤销的订阅句柄
#[derive(Debug)]
pub struct Subscription<T> {
    name: &'static str,
    rx: broadcast::Receiver<T>,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    /// 等待下一条消息；广播点被销毁时返回 None。可安全用于 `select!`。
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(v) => return Some(v),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Subscriber of '{}' lagged, skipped {} messages", self.name, n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// 非阻塞读取一条已到达的消息
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.rx.try_recv() {
                Ok(v) => return Some(v),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!("Subscriber of '{}' lagged, skipped {} messages", self.name, n);
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_submit_reaches_every_subscriber() {
        let b = Broadcaster::new("test");
        let mut s1 = b.subscribe();
        let mut s2 = b.subscribe();
        b.submit(7u32);
        assert_eq!(s1.recv().await, Some(7));
        assert_eq!(s2.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_drop_revokes_subscription() {
        let b: Broadcaster<u32> = Broadcaster::new("test");
        let s = b.subscribe();
        assert_eq!(b.subscriber_count(), 1);
        drop(s);
        assert_eq!(b.subscriber_count(), 0);
        b.submit(1);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_keeps_latest() {
        let b = Broadcaster::with_capacity("test", 2);
        let mut s = b.subscribe();
        for i in 0..5u32 {
            b.submit(i);
        }
        assert_eq!(s.recv().await, Some(3));
        assert_eq!(s.try_recv(), Some(4));
        assert_eq!(s.try_recv(), None);
    }
}
