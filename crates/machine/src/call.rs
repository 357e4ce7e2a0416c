/// An argument passed to a guest function.
///
/// Integers go straight into argument registers. Strings are pushed onto the
/// guest stack NUL-terminated and passed as a pointer. Byte slices are pushed
/// as-is and take two registers: pointer and length.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Arg<'a> {
    Int(u64),
    Str(&'a str),
    Bytes(&'a [u8]),
}

impl From<u64> for Arg<'_> {
    fn from(v: u64) -> Self {
        Arg::Int(v)
    }
}

impl From<i64> for Arg<'_> {
    fn from(v: i64) -> Self {
        Arg::Int(v as u64)
    }
}

impl From<u32> for Arg<'_> {
    fn from(v: u32) -> Self {
        Arg::Int(u64::from(v))
    }
}

impl<'a> From<&'a str> for Arg<'a> {
    fn from(v: &'a str) -> Self {
        Arg::Str(v)
    }
}

impl<'a> From<&'a [u8]> for Arg<'a> {
    fn from(v: &'a [u8]) -> Self {
        Arg::Bytes(v)
    }
}

impl Arg<'_> {
    /// How many argument registers this argument occupies.
    pub fn registers(&self) -> usize {
        match self {
            Arg::Int(_) | Arg::Str(_) => 1,
            Arg::Bytes(_) => 2,
        }
    }
}
