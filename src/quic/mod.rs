//! QUIC 领域模型：包 / 帧 / 加密级别、传输参数、广播点与连接记录

pub mod broadcast;
pub mod connection;
pub mod frame;
pub mod packet;
pub mod params;
pub mod types;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use broadcast::{Broadcaster, Subscription};
pub use connection::{Connection, CryptoState, PacketToSend, AEAD_OVERHEAD, QUIC_VERSION_1};
pub use frame::{AckRange, EcnCounts, Frame, FrameRequest, FrameType, QueuedFrame, StreamsType};
pub use packet::{
    FramedPacket, Header, LongHeader, Packet, RetryPacket, ShortHeader, StatelessResetPacket,
    VersionNegotiationPacket,
};
pub use params::TransportParameters;
pub use types::{DirectionalEncryptionLevel, EncryptionLevel, PacketType, PnSpace};

/// 最小 Initial 数据报长度（IPv4 / IPv6）
pub const MIN_INITIAL_LENGTH: usize = 1200;
pub const MIN_INITIAL_LENGTH_V6: usize = 1232;

/// 加锁；锁被毒化时取回内部数据继续使用
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
