use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    BufferTooShort,
    Io(io::Error),
    BadMarker(u8),
    BadVersion(u8),
    BadLength(u16),
    BadAddressFamily(u8),
    BadNexthopType(u8),
    BadRouteType(u8),
    BadCommand(u16),
    BadPrefix,
    VrfExists(String),
    NoSuchVrf(String),
    VrfIdOutOfRange(u32),
    VrfIdExhausted,
    DefaultVrfImmutable,
    NoSuchInterface(String),
    DuplicateNexthop,
    NoSuchNexthop,
    NoSuchRoute,
    WatchTimeout(String),
    ChannelClosed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BufferTooShort => write!(f, "buffer too short"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::BadMarker(m) => write!(f, "bad header marker {}", m),
            Error::BadVersion(v) => write!(f, "unsupported protocol version {}", v),
            Error::BadLength(l) => write!(f, "bad message length {}", l),
            Error::BadAddressFamily(af) => write!(f, "unknown address family {}", af),
            Error::BadNexthopType(t) => write!(f, "unknown nexthop type {}", t),
            Error::BadRouteType(t) => write!(f, "unknown route type {}", t),
            Error::BadCommand(c) => write!(f, "unknown command {}", c),
            Error::BadPrefix => write!(f, "malformed prefix"),
            Error::VrfExists(name) => write!(f, "VRF {} already exists", name),
            Error::NoSuchVrf(name) => write!(f, "VRF {} does not exist", name),
            Error::VrfIdOutOfRange(id) => write!(f, "VRF id {} out of range", id),
            Error::VrfIdExhausted => write!(f, "no free VRF id"),
            Error::DefaultVrfImmutable => write!(f, "default VRF can not be removed"),
            Error::NoSuchInterface(name) => write!(f, "interface {} does not exist", name),
            Error::DuplicateNexthop => write!(f, "nexthop already exists"),
            Error::NoSuchNexthop => write!(f, "nexthop does not exist"),
            Error::NoSuchRoute => write!(f, "route does not exist"),
            Error::WatchTimeout(name) => write!(f, "timed out waiting for {}", name),
            Error::ChannelClosed => write!(f, "server channel closed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<octets::BufferTooShortError> for Error {
    fn from(_: octets::BufferTooShortError) -> Self {
        Error::BufferTooShort
    }
}

impl From<ipnet::PrefixLenError> for Error {
    fn from(_: ipnet::PrefixLenError) -> Self {
        Error::BadPrefix
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::ChannelClosed
    }
}
