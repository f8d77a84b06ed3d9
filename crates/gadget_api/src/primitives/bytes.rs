use std::{
    fmt::Display,
    num::ParseIntError,
    ops::{Add, AddAssign},
    str::FromStr,
};

/// A non-negative count of bytes, e.g. the size of a volume structure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub const KIB: ByteSize = ByteSize(1 << 10);
    pub const MIB: ByteSize = ByteSize(1 << 20);

    pub const fn kib(count: u64) -> Self {
        ByteSize(count << 10)
    }

    pub const fn mib(count: u64) -> Self {
        ByteSize(count << 20)
    }

    pub fn bytes(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn to_human_readable(self) -> String {
        match self.0.trailing_zeros() {
            _ if self.0 == 0 => "0".to_owned(),
            0..=9 => format!("{}", self.0),
            10..=19 => format!("{}K", self.0 >> 10),
            20..=29 => format!("{}M", self.0 >> 20),
            _ => format!("{}G", self.0 >> 30),
        }
    }

    pub fn from_human_readable(mut s: &str) -> Result<Self, ParseIntError> {
        s = s.trim();
        let try_parse = |val: &str, shift: u8| Ok(Self(val.trim().parse::<u64>()? << shift));
        if let Some(p) = s.strip_suffix('K') {
            try_parse(p, 10)
        } else if let Some(p) = s.strip_suffix('M') {
            try_parse(p, 20)
        } else if let Some(p) = s.strip_suffix('G') {
            try_parse(p, 30)
        } else {
            try_parse(s, 0)
        }
    }
}

/// Display renders the raw decimal byte count. The engine's comparison errors
/// embed sizes in messages that are matched literally, so no unit suffixes.
impl Display for ByteSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ByteSize {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_human_readable(s)
    }
}

impl From<u64> for ByteSize {
    fn from(v: u64) -> Self {
        ByteSize(v)
    }
}

impl Add for ByteSize {
    type Output = ByteSize;

    fn add(self, rhs: ByteSize) -> ByteSize {
        ByteSize(self.0 + rhs.0)
    }
}

impl AddAssign for ByteSize {
    fn add_assign(&mut self, rhs: ByteSize) {
        self.0 += rhs.0;
    }
}

/// A non-negative byte position within a volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset(pub u64);

impl Offset {
    pub const ZERO: Offset = Offset(0);

    pub const fn new(position: u64) -> Self {
        Offset(position)
    }

    pub fn bytes(self) -> u64 {
        self.0
    }
}

impl Display for Offset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Offset {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Offset(ByteSize::from_human_readable(s)?.bytes()))
    }
}

impl From<ByteSize> for Offset {
    fn from(size: ByteSize) -> Self {
        Offset(size.bytes())
    }
}

impl Add<ByteSize> for Offset {
    type Output = Offset;

    fn add(self, rhs: ByteSize) -> Offset {
        Offset(self.0 + rhs.0)
    }
}

/// Rebases a relative offset onto an absolute one.
impl Add<Offset> for Offset {
    type Output = Offset;

    fn add(self, rhs: Offset) -> Offset {
        Offset(self.0 + rhs.0)
    }
}

// Sizes and offsets may be provided in YAML as a string (e.g. "1M") or as a
// pure number (e.g. 1048576). Serde forces a number when only digits are
// provided, so deserialize as a generic value and check the type.
fn u64_from_yaml<'de, D>(deserializer: D, what: &str) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    let value = serde_yaml::Value::deserialize(deserializer)?;
    match value {
        serde_yaml::Value::String(s) => ByteSize::from_human_readable(s.as_str())
            .map(ByteSize::bytes)
            .map_err(|e| serde::de::Error::custom(format!("invalid {what}: {e}"))),
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom(format!("invalid {what}, expected unsigned integer"))),
        _ => Err(serde::de::Error::custom(format!("invalid {what}"))),
    }
}

impl<'de> serde::Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<ByteSize, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        u64_from_yaml(deserializer, "size").map(ByteSize)
    }
}

impl serde::Serialize for ByteSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Offset {
    fn deserialize<D>(deserializer: D) -> Result<Offset, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        u64_from_yaml(deserializer, "offset").map(Offset)
    }
}

impl serde::Serialize for Offset {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}
