//! Bencode encoding and decoding (BEP-3)
//!
//! Bencode is the serialization used by BitTorrent for torrent files and
//! extension messages. It has four value kinds: integers, byte strings,
//! lists and dictionaries. Dictionaries encode with lexicographically
//! sorted keys, so `decode(encode(v)) == v` for every valid value.

mod decode;
mod encode;
mod error;
mod value;

pub use decode::decode;
pub use encode::{encode, encode_into};
pub use error::BencodeError;
pub use value::Value;

#[cfg(test)]
mod tests;
