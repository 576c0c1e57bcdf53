//! Value types naming objects in the cache and on the backend.

use std::{convert::TryFrom, fmt, str::FromStr};

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NameError {
    #[error("malformed SCO name {0:?}")]
    MalformedSco(String),
    #[error("invalid namespace {0:?}")]
    InvalidNamespace(String),
}

/// Name of a storage container object.
///
/// The printable form is fixed-width hex, `VV_NNNNNNNN_CC`
/// (version, number, clone id), and is what SCO files in the cache
/// and objects on the backend are called. Parsing and formatting are
/// inverses of each other on the set of well-formed strings.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sco {
    version: u8,
    number: u32,
    clone_id: u8,
}

impl Sco {
    pub fn new(clone_id: u8, number: u32) -> Sco {
        Sco {
            version: 0,
            number,
            clone_id,
        }
    }

    #[inline(always)]
    pub fn version(&self) -> u8 {
        self.version
    }

    #[inline(always)]
    pub fn number(&self) -> u32 {
        self.number
    }

    #[inline(always)]
    pub fn clone_id(&self) -> u8 {
        self.clone_id
    }

    /// The SCO following this one in the same clone.
    pub fn next(&self) -> Sco {
        Sco {
            version: self.version,
            number: self.number.wrapping_add(1),
            clone_id: self.clone_id,
        }
    }

    pub fn is_sco_string(s: &str) -> bool {
        Sco::from_str(s).is_ok()
    }
}

impl fmt::Display for Sco {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}_{:08x}_{:02x}",
            self.version, self.number, self.clone_id
        )
    }
}

impl fmt::Debug for Sco {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for Sco {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || NameError::MalformedSco(s.into());

        let bytes = s.as_bytes();
        if bytes.len() != 14 || bytes[2] != b'_' || bytes[11] != b'_' {
            return Err(malformed());
        }

        let lower_hex = |range: &str| {
            range
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        };

        if !lower_hex(&s[0..2]) || !lower_hex(&s[3..11]) || !lower_hex(&s[12..14]) {
            return Err(malformed());
        }

        Ok(Sco {
            version: u8::from_str_radix(&s[0..2], 16).map_err(|_| malformed())?,
            number: u32::from_str_radix(&s[3..11], 16).map_err(|_| malformed())?,
            clone_id: u8::from_str_radix(&s[12..14], 16).map_err(|_| malformed())?,
        })
    }
}

impl TryFrom<&str> for Sco {
    type Error = NameError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Address of one fixed-size logical cluster: the SCO holding it plus
/// the cluster offset within that SCO.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterLocation {
    sco: Sco,
    offset: u32,
}

impl ClusterLocation {
    pub fn new(sco: Sco, offset: u32) -> ClusterLocation {
        ClusterLocation { sco, offset }
    }

    #[inline(always)]
    pub fn sco(&self) -> Sco {
        self.sco
    }

    #[inline(always)]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    #[inline(always)]
    pub fn clone_id(&self) -> u8 {
        self.sco.clone_id()
    }

    /// The location a sequential write continues at: the next offset
    /// in the same SCO.
    pub fn advanced(&self) -> ClusterLocation {
        ClusterLocation {
            sco: self.sco,
            offset: self.offset + 1,
        }
    }
}

impl fmt::Display for ClusterLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:08x}", self.sco, self.offset)
    }
}

impl fmt::Debug for ClusterLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Storage-bucket identifier. One volume maps to one namespace, both
/// on the blob backend and inside every cache mountpoint, where it
/// doubles as a directory name.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(name: impl Into<String>) -> Result<Namespace, NameError> {
        let name = name.into();

        // "lost+found" is reserved on the mountpoint filesystems,
        // path separators and hidden names would escape the
        // per-namespace directory.
        if name.is_empty()
            || name == "lost+found"
            || name.starts_with('.')
            || name.contains('/')
        {
            return Err(NameError::InvalidNamespace(name));
        }

        Ok(Namespace(name))
    }

    #[inline(always)]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl TryFrom<&str> for Namespace {
    type Error = NameError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Namespace::new(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sco_format_parse_roundtrip() {
        let sco = Sco::new(3, 0x2d1);
        assert_eq!(sco.to_string(), "00_000002d1_03");
        assert_eq!("00_000002d1_03".parse::<Sco>().unwrap(), sco);

        for name in ["ff_ffffffff_ff", "00_00000000_00", "01_deadbeef_7f"] {
            assert_eq!(name.parse::<Sco>().unwrap().to_string(), name);
        }
    }

    #[test]
    fn sco_rejects_malformed() {
        for name in [
            "",
            "00_000002d1",
            "00_000002d1_033",
            "00-000002d1-03",
            "0g_000002d1_03",
            "00_000002D1_03",
            "xx_000002d1_03",
            "00_000002d1_03 ",
        ] {
            assert!(name.parse::<Sco>().is_err(), "accepted {:?}", name);
            assert!(!Sco::is_sco_string(name));
        }
    }

    #[test]
    fn sco_next_stays_in_clone() {
        let sco = Sco::new(2, 41);
        assert_eq!(sco.next().number(), 42);
        assert_eq!(sco.next().clone_id(), 2);
    }

    #[test]
    fn cluster_location_advance() {
        let loc = ClusterLocation::new(Sco::new(0, 7), 3);
        let next = loc.advanced();
        assert_eq!(next.sco(), loc.sco());
        assert_eq!(next.offset(), 4);
    }

    #[test]
    fn namespace_validation() {
        assert!(Namespace::new("volume-0815").is_ok());
        for bad in ["", "lost+found", ".hidden", "a/b"] {
            assert!(Namespace::new(bad).is_err(), "accepted {:?}", bad);
        }
    }
}
