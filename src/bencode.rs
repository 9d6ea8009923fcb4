//! Bencode, the self-describing wire format carried in every DHT datagram.
//!
//! | Type | Format | Example |
//! |------|--------|---------|
//! | Integer | `i<number>e` | `i42e` → 42 |
//! | Byte string | `<length>:<data>` | `4:spam` → "spam" |
//! | List | `l<items>e` | `l4:spami42ee` → ["spam", 42] |
//! | Dictionary | `d<key><value>...e` | `d3:foo3:bare` → {"foo": "bar"} |
//!
//! [`decode`] rejects truncated strings, unterminated containers and
//! non-numeric length prefixes with a [`BencodeError`]. [`encode`] is pure
//! and deterministic, so `decode(&encode(&v)) == v` for every tree.
//!
//! ```
//! use rdht::bencode::{decode, encode, DictBuilder, Value};
//!
//! let tree = DictBuilder::new()
//!     .insert(b"y", Value::string("q"))
//!     .insert(b"port", Value::Integer(6881))
//!     .build();
//!
//! let wire = encode(&tree);
//! assert_eq!(wire, b"d4:porti6881e1:y1:qe");
//! assert_eq!(decode(&wire).unwrap(), tree);
//! ```

mod decode;
mod encode;
mod error;
mod value;

pub use decode::decode;
pub use encode::encode;
pub use error::BencodeError;
pub use value::{DictBuilder, Value};
