//! 抽象符号：学习器看到的字母表
//!
//! 规范文本形式 `TYPE(packetNumber,version)[F1,F2,...]`：
//! - 未指定的头部字段写作 `?`，与 0 不同；
//! - 版本号写作 `0x` 加 8 位十六进制，包号为十进制；
//! - 帧种类按名字字典序排列，去重。
//!
//! 编码是单射的，解码严格：任何不符合文法的输入都返回 `ParseError`。

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

use crate::core::error::ParseError;
use crate::quic::{FrameType, PacketType};

static SYMBOL_RE: OnceLock<Regex> = OnceLock::new();

fn symbol_re() -> &'static Regex {
    SYMBOL_RE.get_or_init(|| {
        Regex::new(r"^([A-Z]+)(?:\(([^,()\[\]]+),([^,()\[\]]+)\))?\[([A-Z_,]*)\]$")
            .expect("symbol grammar regex is valid")
    })
}

/// 头部选项；None 表示「未指定」
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct HeaderOptions {
    pub packet_number: Option<u64>,
    pub version: Option<u32>,
}

impl fmt::Display for HeaderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.packet_number {
            Some(pn) => write!(f, "{}", pn)?,
            None => f.write_str("?")?,
        }
        f.write_str(",")?;
        match self.version {
            Some(v) => write!(f, "0x{:08x}", v),
            None => f.write_str("?"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AbstractSymbol {
    pub packet_type: PacketType,
    pub header_options: HeaderOptions,
    pub frame_types: BTreeSet<FrameType>,
}

impl AbstractSymbol {
    pub fn new(
        packet_type: PacketType,
        header_options: HeaderOptions,
        frame_types: impl IntoIterator<Item = FrameType>,
    ) -> Self {
        Self {
            packet_type,
            header_options,
            frame_types: frame_types.into_iter().collect(),
        }
    }

    /// 帧种类名字，按字典序
    pub fn sorted_frame_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.frame_types.iter().map(FrameType::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Display for AbstractSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({})[{}]",
            self.packet_type,
            self.header_options,
            self.sorted_frame_names().join(",")
        )
    }
}

fn parse_packet_number(symbol: &str, value: &str) -> Result<Option<u64>, ParseError> {
    if value == "?" {
        return Ok(None);
    }
    // 只接受规范十进制：纯数字，多位时不以 0 开头
    let canonical = value.bytes().all(|b| b.is_ascii_digit())
        && !(value.len() > 1 && value.starts_with('0'));
    canonical
        .then(|| value.parse::<u64>().ok())
        .flatten()
        .map(Some)
        .ok_or_else(|| ParseError::InvalidHeaderOption {
            symbol: symbol.to_string(),
            value: value.to_string(),
        })
}

fn parse_version(symbol: &str, value: &str) -> Result<Option<u32>, ParseError> {
    if value == "?" {
        return Ok(None);
    }
    value
        .strip_prefix("0x")
        .filter(|hex| {
            hex.len() == 8
                && hex
                    .bytes()
                    .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        })
        .and_then(|hex| u32::from_str_radix(hex, 16).ok())
        .map(Some)
        .ok_or_else(|| ParseError::InvalidHeaderOption {
            symbol: symbol.to_string(),
            value: value.to_string(),
        })
}

impl FromStr for AbstractSymbol {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = symbol_re()
            .captures(s)
            .ok_or_else(|| ParseError::Malformed(s.to_string()))?;

        let name = &caps[1];
        let packet_type = name
            .parse::<PacketType>()
            .map_err(ParseError::UnknownPacketType)?;

        // 省略整个头部括号等价于两个字段都未指定
        let header_options = match (caps.get(2), caps.get(3)) {
            (Some(pn), Some(version)) => HeaderOptions {
                packet_number: parse_packet_number(s, pn.as_str())?,
                version: parse_version(s, version.as_str())?,
            },
            _ => HeaderOptions::default(),
        };

        let list = &caps[4];
        let mut frame_types = BTreeSet::new();
        if !list.is_empty() {
            for item in list.split(',') {
                if item.is_empty() {
                    return Err(ParseError::Malformed(s.to_string()));
                }
                let ft = item
                    .parse::<FrameType>()
                    .map_err(ParseError::UnknownFrameKind)?;
                frame_types.insert(ft);
            }
        }

        Ok(Self {
            packet_type,
            header_options,
            frame_types,
        })
    }
}

/// 去重、无序的抽象符号集合；按成员编码排序输出
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct AbstractSet {
    members: BTreeMap<String, AbstractSymbol>,
}

impl AbstractSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入成员；已存在时返回 false
    pub fn add(&mut self, symbol: AbstractSymbol) -> bool {
        let key = symbol.to_string();
        if self.members.contains_key(&key) {
            return false;
        }
        self.members.insert(key, symbol);
        true
    }

    pub fn contains(&self, symbol: &AbstractSymbol) -> bool {
        self.members.contains_key(&symbol.to_string())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AbstractSymbol> {
        self.members.values()
    }

    pub fn contains_packet_type(&self, packet_type: PacketType) -> bool {
        self.iter().any(|s| s.packet_type == packet_type)
    }
}

impl FromIterator<AbstractSymbol> for AbstractSet {
    fn from_iter<I: IntoIterator<Item = AbstractSymbol>>(iter: I) -> Self {
        let mut set = Self::new();
        for s in iter {
            set.add(s);
        }
        set
    }
}

impl fmt::Display for AbstractSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, key) in self.members.keys().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(key)?;
        }
        f.write_str("}")
    }
}

/// 按顶层逗号切分（忽略括号内的逗号）
fn split_top_level(s: &str) -> Option<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
            }
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return None;
    }
    parts.push(&s[start..]);
    Some(parts)
}

impl FromStr for AbstractSet {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .ok_or_else(|| ParseError::Malformed(s.to_string()))?;
        if inner.is_empty() {
            return Ok(Self::new());
        }
        let parts = split_top_level(inner).ok_or_else(|| ParseError::Malformed(s.to_string()))?;
        parts.into_iter().map(str::parse::<AbstractSymbol>).collect()
    }
}

/// 一条完整查询的抽象输入 / 输出序列；规范文本即 Oracle 表的键
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct AbstractOrderedPair {
    pub inputs: Vec<AbstractSymbol>,
    pub outputs: Vec<AbstractSet>,
}

impl AbstractOrderedPair {
    pub fn new(inputs: Vec<AbstractSymbol>, outputs: Vec<AbstractSet>) -> Self {
        Self { inputs, outputs }
    }
}

impl fmt::Display for AbstractOrderedPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inputs: Vec<String> = self.inputs.iter().map(ToString::to_string).collect();
        let outputs: Vec<String> = self.outputs.iter().map(ToString::to_string).collect();
        write!(f, "([{}],[{}])", inputs.join(","), outputs.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(s: &str) -> AbstractSymbol {
        s.parse().unwrap()
    }

    #[test]
    fn test_roundtrip_canonical_forms() {
        for s in [
            "INITIAL(?,?)[CRYPTO]",
            "INITIAL(?,?)[ACK,CRYPTO]",
            "SHORT(25,0xff00001d)[ACK,STREAM]",
            "HANDSHAKE(0,?)[ACK,CRYPTO,HANDSHAKE_DONE]",
            "RETRY(?,?)[]",
        ] {
            assert_eq!(sym(s).to_string(), s);
        }
    }

    #[test]
    fn test_question_mark_is_not_zero() {
        let unset = sym("INITIAL(?,?)[PING]");
        let zero = sym("INITIAL(0,0x00000000)[PING]");
        assert_eq!(unset.header_options, HeaderOptions::default());
        assert_eq!(zero.header_options.packet_number, Some(0));
        assert_eq!(zero.header_options.version, Some(0));
        assert_ne!(unset, zero);
    }

    #[test]
    fn test_frame_kinds_sorted_by_name() {
        let s = AbstractSymbol::new(
            PacketType::Short,
            HeaderOptions::default(),
            [FrameType::Stream, FrameType::Ack, FrameType::MaxData],
        );
        assert_eq!(s.to_string(), "SHORT(?,?)[ACK,MAX_DATA,STREAM]");
        // 输入顺序无关
        assert_eq!(sym("SHORT(?,?)[STREAM,ACK,MAX_DATA]"), s);
    }

    #[test]
    fn test_missing_header_part_means_unspecified() {
        let s = sym("INITIAL[CRYPTO]");
        assert_eq!(s.header_options, HeaderOptions::default());
        assert_eq!(s.to_string(), "INITIAL(?,?)[CRYPTO]");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(matches!(
            "INITIAL(?,?)".parse::<AbstractSymbol>(),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            "INITIAL(?,?)[CRYPTO,]".parse::<AbstractSymbol>(),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            "initial(?,?)[CRYPTO]".parse::<AbstractSymbol>(),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            "BOGUS(?,?)[CRYPTO]".parse::<AbstractSymbol>(),
            Err(ParseError::UnknownPacketType(_))
        ));
        assert_eq!(
            "INITIAL(?,?)[FOO]".parse::<AbstractSymbol>(),
            Err(ParseError::UnknownFrameKind("FOO".to_string()))
        );
        assert!(matches!(
            "INITIAL(x,?)[PING]".parse::<AbstractSymbol>(),
            Err(ParseError::InvalidHeaderOption { .. })
        ));
        assert!(matches!(
            "INITIAL(?,1)[PING]".parse::<AbstractSymbol>(),
            Err(ParseError::InvalidHeaderOption { .. })
        ));
    }

    #[test]
    fn test_header_options_must_be_canonical() {
        for bad in [
            "INITIAL(+5,?)[PING]",
            "INITIAL(05,?)[PING]",
            "INITIAL(-1,?)[PING]",
            "INITIAL(?,0x1)[PING]",
            "INITIAL(?,0x0000000A)[PING]",
            "INITIAL(?,0x+0000001)[PING]",
        ] {
            assert!(
                matches!(
                    bad.parse::<AbstractSymbol>(),
                    Err(ParseError::InvalidHeaderOption { .. })
                ),
                "{} should be rejected",
                bad
            );
        }
        for good in ["INITIAL(0,?)[PING]", "INITIAL(50,0xff00001d)[PING]"] {
            assert_eq!(sym(good).to_string(), good);
        }
    }

    #[test]
    fn test_set_dedup_and_order() {
        let mut set = AbstractSet::new();
        assert_eq!(set.to_string(), "{}");
        assert!(set.add(sym("SHORT(?,?)[ACK]")));
        assert!(set.add(sym("HANDSHAKE(?,?)[CRYPTO]")));
        assert!(!set.add(sym("SHORT(?,?)[ACK]")));
        assert_eq!(set.len(), 2);
        assert_eq!(set.to_string(), "{HANDSHAKE(?,?)[CRYPTO],SHORT(?,?)[ACK]}");
        assert_eq!(set.to_string().parse::<AbstractSet>().unwrap(), set);
        assert_eq!("{}".parse::<AbstractSet>().unwrap(), AbstractSet::new());
    }

    #[test]
    fn test_set_equality_ignores_insertion_order() {
        let a: AbstractSet = [sym("SHORT(?,?)[ACK]"), sym("INITIAL(?,?)[CRYPTO]")]
            .into_iter()
            .collect();
        let b: AbstractSet = [sym("INITIAL(?,?)[CRYPTO]"), sym("SHORT(?,?)[ACK]")]
            .into_iter()
            .collect();
        assert_eq!(a, b);
        assert!(a.contains_packet_type(PacketType::Initial));
        assert!(!a.contains_packet_type(PacketType::Retry));
    }

    #[test]
    fn test_pair_encoding() {
        let pair = AbstractOrderedPair::new(
            vec![sym("INITIAL(?,?)[CRYPTO]"), sym("INITIAL(?,?)[ACK,CRYPTO]")],
            vec![
                [sym("INITIAL(?,?)[ACK,CRYPTO]"), sym("HANDSHAKE(?,?)[CRYPTO]")]
                    .into_iter()
                    .collect(),
                AbstractSet::new(),
            ],
        );
        assert_eq!(
            pair.to_string(),
            "([INITIAL(?,?)[CRYPTO],INITIAL(?,?)[ACK,CRYPTO]],\
             [{HANDSHAKE(?,?)[CRYPTO],INITIAL(?,?)[ACK,CRYPTO]},{}])"
        );
    }
}
