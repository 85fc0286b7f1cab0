pub use tokio_modbus::{Address, Quantity};

/// 16-bit value stored in Modbus register.
pub type Word = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("expected {expected} words, got {actual}")]
pub struct WordCountError {
    pub expected: usize,
    pub actual: usize,
}

/// Decode a value from big-endian ordered `Word`s (high word first).
pub trait Decode: Sized {
    fn from_be_words(words: &[Word]) -> Result<Self, WordCountError>;
}

macro_rules! impl_decode {
    ($num_type:ty) => {
        impl Decode for $num_type {
            fn from_be_words(words: &[Word]) -> Result<Self, WordCountError> {
                let bytes = words
                    .iter()
                    .copied()
                    .flat_map(u16::to_be_bytes)
                    .collect::<Vec<u8>>();
                let actual = words.len();
                let array = bytes.try_into().or(Err(WordCountError {
                    expected: std::mem::size_of::<$num_type>() / 2,
                    actual,
                }))?;
                Ok(<$num_type>::from_be_bytes(array))
            }
        }
    };
}

impl_decode!(i16);
impl_decode!(i32);
impl_decode!(u16);
impl_decode!(u32);
impl_decode!(f32);

/// Encode a value into big-endian ordered `Word`s (high word first).
pub trait Encode {
    fn to_be_words(self) -> Vec<Word>;
}

macro_rules! impl_encode {
    ($num_type:ty) => {
        impl Encode for $num_type {
            fn to_be_words(self) -> Vec<Word> {
                self.to_be_bytes()
                    .chunks_exact(2)
                    .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
                    .collect()
            }
        }
    };
}

impl_encode!(i16);
impl_encode!(i32);
impl_encode!(u16);
impl_encode!(u32);
impl_encode!(f32);

/// Pack an ASCII string into a fixed number of registers, two bytes per word,
/// zero padded. Longer strings are truncated.
pub fn string_to_words(text: &str, cnt: Quantity) -> Vec<Word> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(usize::from(cnt) * 2, 0);
    bytes
        .chunks_exact(2)
        .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
        .collect()
}
