use std::ops::Range;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum DecodingError {
    #[error("Malformed input: {0} ({1:?})")]
    MalformedInput(String, Vec<u8>),
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("VarUInt casting: {0}")]
    VarUIntCasting(u128),
}

pub fn malformed_input<S: Into<String>>(msg: S, bytes: &[u8]) -> DecodingError {
    DecodingError::MalformedInput(msg.into(), bytes.to_vec())
}

pub type DecodingResult<'a, T> = Result<(T, &'a [u8]), DecodingError>;

pub trait Encode {
    fn encode(&self) -> Vec<u8>;
}

pub trait Decode
where
    Self: Sized,
{
    fn decode(bytes: &[u8]) -> DecodingResult<Self>;

    /// `decode` but ignoring, and not returning, any remaining bytes
    fn decode_all(bytes: &[u8]) -> Result<Self, DecodingError> {
        Self::decode(bytes).map(|x| x.0)
    }
}

#[derive(Default, Clone)]
pub struct EncodeBuilder {
    output: Vec<u8>,
}

impl EncodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append<T: Encode + ?Sized>(mut self, data: &T) -> Self {
        self.output.extend(data.encode());
        self
    }

    /// Append raw bytes with no framing; only valid as the final,
    /// self-terminating component of a key.
    pub fn append_raw(mut self, data: &[u8]) -> Self {
        self.output.extend_from_slice(data);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.output
    }
}

/// Unsigned integer with more efficient serialisation while maintaining
/// lexicographic ordering
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct VarUInt(pub u128);

macro_rules! impl_to_varuint {
    ($type:ty) => {
        impl From<$type> for VarUInt {
            fn from(val: $type) -> Self {
                VarUInt(val.try_into().unwrap())
            }
        }
    };
}

impl_to_varuint!(usize);
impl_to_varuint!(u8);
impl_to_varuint!(u16);
impl_to_varuint!(u32);
impl_to_varuint!(u64);
impl_to_varuint!(u128);

macro_rules! impl_try_from_varuint {
    ($type:ty) => {
        impl TryFrom<VarUInt> for $type {
            type Error = DecodingError;

            fn try_from(val: VarUInt) -> Result<$type, Self::Error> {
                let inner_val = val.0;
                inner_val
                    .try_into()
                    .map_err(|_| DecodingError::VarUIntCasting(inner_val))
            }
        }
    };
}

impl_try_from_varuint!(usize);
impl_try_from_varuint!(u16);
impl_try_from_varuint!(u32);
impl_try_from_varuint!(u64);
impl_try_from_varuint!(u128);

impl Encode for VarUInt {
    fn encode(&self) -> Vec<u8> {
        let bend = self.0.to_be_bytes();

        for idx in 0..16 {
            if bend[idx] != 0x00 {
                let size = 16 - idx;
                let mut out = Vec::with_capacity(1 + size);

                out.push(size.try_into().unwrap());
                out.extend_from_slice(&bend[idx..]);

                return out;
            }
        }

        vec![0]
    }
}

impl Decode for VarUInt {
    fn decode(bytes: &[u8]) -> DecodingResult<Self> {
        let len = *bytes
            .first()
            .ok_or(malformed_input("varuint insufficient bytes", bytes))?
            as usize;

        if len > 16 {
            return Err(malformed_input("varuint len exceeds maximum", bytes));
        }

        let (data, bytes) = bytes[1..]
            .split_at_checked(len)
            .ok_or(malformed_input("varuint insufficient bytes", bytes))?;

        let be_128: [u8; 16] = [vec![0; 16 - len], data.to_vec()]
            .concat()
            .try_into()
            .unwrap();

        Ok((VarUInt(u128::from_be_bytes(be_128)), bytes))
    }
}

impl<const N: usize> Encode for [u8; N] {
    fn encode(&self) -> Vec<u8> {
        self.to_vec()
    }
}

impl<const N: usize> Decode for [u8; N] {
    fn decode(bytes: &[u8]) -> DecodingResult<Self> {
        bytes
            .get(..N)
            .map(|slice| {
                (
                    slice.try_into().expect("slice with incorrect length"),
                    &bytes[N..],
                )
            })
            .ok_or(malformed_input("array insufficient bytes", bytes))
    }
}

impl Encode for u8 {
    fn encode(&self) -> Vec<u8> {
        vec![*self]
    }
}

impl Decode for u8 {
    fn decode(bytes: &[u8]) -> DecodingResult<Self> {
        bytes
            .first()
            .map(|b| (*b, &bytes[1..]))
            .ok_or(malformed_input("u8 insufficient bytes", bytes))
    }
}

macro_rules! impl_uint_encdec {
    ($type:ty) => {
        impl Encode for $type {
            fn encode(&self) -> Vec<u8> {
                Into::<VarUInt>::into(*self).encode()
            }
        }

        impl Decode for $type {
            fn decode(bytes: &[u8]) -> DecodingResult<$type> {
                let (varuint, rem) = VarUInt::decode(bytes)?;

                let casted = Self::try_from(varuint)?;

                Ok((casted, rem))
            }
        }
    };
}

// u8 encoding is more efficient than if we used our varuint
impl_uint_encdec!(usize);
impl_uint_encdec!(u16);
impl_uint_encdec!(u32);
impl_uint_encdec!(u64);
impl_uint_encdec!(u128);

impl Encode for str {
    fn encode(&self) -> Vec<u8> {
        [self.len().encode(), self.as_bytes().to_vec()].concat()
    }
}

impl Encode for String {
    fn encode(&self) -> Vec<u8> {
        self.as_str().encode()
    }
}

impl Decode for String {
    fn decode(bytes: &[u8]) -> DecodingResult<Self> {
        let (len, bytes) = usize::decode(bytes)?;

        let (data, bytes) = bytes
            .split_at_checked(len)
            .ok_or(malformed_input("string insufficient bytes", bytes))?;

        Ok((String::from_utf8(data.to_vec())?, bytes))
    }
}

pub fn prefix_key_range(prefix: &[u8]) -> Range<Vec<u8>> {
    let start = prefix.to_vec();
    let mut end = prefix.to_vec();

    // Work backwards to handle the case where the last byte(s) are 255
    for i in (0..end.len()).rev() {
        if end[i] != 255 {
            end[i] += 1;
            end.truncate(i + 1);
            return start..end;
        }
    }

    // If all bytes are 255, the range is unbounded at the upper end
    start..vec![]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varuint_roundtrip() {
        for val in [0u64, 1, 255, 256, 1_000_000_000, u64::MAX] {
            let encoded = val.encode();
            assert_eq!(u64::decode_all(&encoded).unwrap(), val);
        }
    }

    #[test]
    fn varuint_preserves_lexicographic_order() {
        let values = [0u64, 1, 7, 255, 256, 65_535, 1_000_000_000, u64::MAX];

        for pair in values.windows(2) {
            assert!(pair[0].encode() < pair[1].encode(), "{pair:?}");
        }
    }

    #[test]
    fn string_roundtrip_with_remainder() {
        let encoded = [String::from("own:addr").encode(), vec![0xAB]].concat();

        let (decoded, rest) = String::decode(&encoded).unwrap();
        assert_eq!(decoded, "own:addr");
        assert_eq!(rest, &[0xAB]);
    }

    #[test]
    fn prefix_range_bounds() {
        let range = prefix_key_range(&[b'S', 0x01]);
        assert_eq!(range.start, vec![b'S', 0x01]);
        assert_eq!(range.end, vec![b'S', 0x02]);

        let range = prefix_key_range(&[0xFF, 0xFF]);
        assert!(range.end.is_empty());
    }
}
