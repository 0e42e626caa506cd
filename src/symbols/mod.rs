//! 符号模型：抽象符号（学习器字母表）与具体符号（真实包证据）

pub mod abstract_symbol;
pub mod concrete;

pub use abstract_symbol::{AbstractOrderedPair, AbstractSet, AbstractSymbol, HeaderOptions};
pub use concrete::{ConcreteOrderedPair, ConcreteSet, ConcreteSymbol};
