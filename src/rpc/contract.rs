//! Minimal `eth_call` payload encoding: function selectors and static
//! 32-byte argument words.

use alloy_primitives::{keccak256, Address, U256};
use anyhow::{bail, Result};

/// A static ABI argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiValue {
    Uint(U256),
    Address(Address),
    Bool(bool),
    /// Raw bytes, at most 32, left-padded with zeros.
    Bytes(Vec<u8>),
}

/// First four bytes of the keccak-256 hash of the canonical signature, as
/// eight lowercase hex characters.
pub fn selector(signature: &str) -> String {
    let hash = keccak256(signature.as_bytes());
    hex::encode(&hash[..4])
}

/// Encodes one argument to exactly 64 hex characters.
pub fn encode_argument(value: &AbiValue) -> Result<String> {
    let word: [u8; 32] = match value {
        AbiValue::Uint(value) => value.to_be_bytes::<32>(),
        AbiValue::Bool(flag) => U256::from(u8::from(*flag)).to_be_bytes::<32>(),
        AbiValue::Address(address) => {
            let mut word = [0u8; 32];
            word[12..].copy_from_slice(address.as_slice());
            word
        }
        AbiValue::Bytes(bytes) => {
            if bytes.len() > 32 {
                bail!(
                    "byte argument of {} bytes does not fit a 32-byte word",
                    bytes.len()
                );
            }
            let mut word = [0u8; 32];
            word[32 - bytes.len()..].copy_from_slice(bytes);
            word
        }
    };
    Ok(hex::encode(word))
}

/// Builds the `0x`-prefixed call data for `signature` applied to `args`.
pub fn encode_call(signature: &str, args: &[AbiValue]) -> Result<String> {
    let mut data = String::with_capacity(2 + 8 + args.len() * 64);
    data.push_str("0x");
    data.push_str(&selector(signature));
    for arg in args {
        data.push_str(&encode_argument(arg)?);
    }
    Ok(data)
}
