//! 帧生产者：发送 Agent 在填包时逐个询问的 Agent

use async_trait::async_trait;

use crate::quic::{EncryptionLevel, Frame};

/// 一次填包请求的剩余空间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpace {
    pub available_space: usize,
    pub level: EncryptionLevel,
    pub packet_number: u64,
}

#[async_trait]
pub trait FrameProducer: Send + Sync {
    fn producer_name(&self) -> &'static str;

    /// 返回放得下的帧与「是否还会继续生产」。
    /// 生产者停止时返回 `(vec![], false)`，发送 Agent 随即把它从本轮列表中移除。
    async fn request_frames(&self, space: FrameSpace) -> (Vec<Frame>, bool);
}

/// 按顺序取出能放进 `available` 字节的帧，遇到第一个放不下的即停止
pub(crate) fn take_fitting<I>(frames: &mut I, mut available: usize) -> Vec<Frame>
where
    I: FrameSource,
{
    let mut out = Vec::new();
    while let Some(len) = frames.peek_len() {
        if len > available {
            break;
        }
        match frames.pop() {
            Some(frame) => {
                available -= len;
                out.push(frame);
            }
            None => break,
        }
    }
    out
}

/// `take_fitting` 的帧来源
pub(crate) trait FrameSource {
    fn peek_len(&self) -> Option<usize>;
    fn pop(&mut self) -> Option<Frame>;
}

impl FrameSource for std::collections::VecDeque<Frame> {
    fn peek_len(&self) -> Option<usize> {
        self.front().map(Frame::length)
    }

    fn pop(&mut self) -> Option<Frame> {
        self.pop_front()
    }
}
