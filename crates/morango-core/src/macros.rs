/// Defines a fixed-size byte-array newtype with the encode/decode impls this
/// crate's id types need: `Copy`, ordering, optional bincode and serde.
///
/// Mirrors the array-type family used throughout the sync stack: every
/// identifier (instance, store row, session) is a plain byte array under the
/// hood, displayed as lower-case hex per the wire format.
#[macro_export]
macro_rules! define_hex_array_type {
    (
        $(#[$outer:meta])*
        struct $t:ident, $n:literal
    ) => {
        $(#[$outer])*
        #[cfg_attr(feature = "bincode", derive(::bincode::Encode, ::bincode::Decode))]
        #[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
        #[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $t([u8; $n]);

        impl $t {
            pub const BYTE_LEN: usize = $n;

            pub const ZERO: Self = Self([0u8; $n]);
            pub const MAX: Self = Self([0xffu8; $n]);

            pub const fn from_bytes(bytes: [u8; $n]) -> Self {
                Self(bytes)
            }

            pub fn as_slice(&self) -> &[u8] {
                self.0.as_slice()
            }

            pub fn as_bytes(&self) -> &[u8; $n] {
                &self.0
            }

            pub fn random() -> Self {
                let mut bytes = [0u8; $n];
                ::rand::Rng::fill(&mut ::rand::rng(), &mut bytes);
                Self(bytes)
            }

            pub fn to_hex_string(&self) -> String {
                ::data_encoding::HEXLOWER.encode(&self.0)
            }
        }

        impl std::fmt::Debug for $t {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($t), self.to_hex_string())
            }
        }

        impl std::fmt::Display for $t {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.to_hex_string())
            }
        }

        impl std::str::FromStr for $t {
            type Err = $crate::HexIdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = ::data_encoding::HEXLOWER_PERMISSIVE
                    .decode(s.as_bytes())
                    .map_err(|_| $crate::HexIdParseError::InvalidHex)?;
                let bytes: [u8; $n] = bytes
                    .try_into()
                    .map_err(|_| $crate::HexIdParseError::InvalidLength { expected: $n })?;
                Ok(Self(bytes))
            }
        }

        impl TryFrom<String> for $t {
            type Error = $crate::HexIdParseError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }

        impl From<$t> for String {
            fn from(v: $t) -> Self {
                v.to_hex_string()
            }
        }
    };
}
