use std::error;
use std::fmt;
use std::io;

/// Errors surfaced by the socket layer. Modeled on the BSD socket error
/// names the emulated applications expect.
#[derive(Debug)]
pub enum Error {
    /// No interface matches the requested bind address.
    AddrNotAvail,

    /// The IPX socket number is already bound without `SO_REUSEADDR` on both
    /// sides.
    AddrInUse,

    /// No route to the destination, or an SPX lookup got no reply.
    NetUnreach,

    /// The carrier for this packet is down or refused the frame.
    NetDown,

    /// The operation needs a connected socket.
    NotConnected,

    /// The socket has been shut down for this direction.
    Shutdown,

    /// The payload does not fit in the selected carrier's frame, or the
    /// receive buffer was too small for the packet.
    MsgSize,

    /// A non-blocking operation would have blocked.
    WouldBlock,

    /// The operation is not valid in the socket's current state, or an
    /// argument was malformed.
    InvalidArg,

    /// The operation is not supported on this kind of socket.
    OpNotSupported,

    /// The requested protocol cannot be provided, e.g. SPX on the Ethernet
    /// or DOSBox carriers.
    ProtoNotSupported,

    /// The socket was left half bound and further operations on it are
    /// refused rather than guessing at its state.
    Inconsistent,

    /// An error from the underlying OS socket.
    Io(io::Error),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::WouldBlock,
            _ => Error::Io(e),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        let kind = match e {
            Error::AddrNotAvail => io::ErrorKind::AddrNotAvailable,
            Error::AddrInUse => io::ErrorKind::AddrInUse,
            Error::NotConnected => io::ErrorKind::NotConnected,
            Error::WouldBlock => io::ErrorKind::WouldBlock,
            Error::InvalidArg => io::ErrorKind::InvalidInput,
            Error::Io(io_e) => return io_e,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, format!("{}", e))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Error::*;
        match *self {
            AddrNotAvail => f.write_str("Address not available"),
            AddrInUse => f.write_str("Address already in use"),
            NetUnreach => f.write_str("Network unreachable"),
            NetDown => f.write_str("Network is down"),
            NotConnected => f.write_str("Socket is not connected"),
            Shutdown => f.write_str("Socket has been shut down"),
            MsgSize => f.write_str("Message too long"),
            WouldBlock => f.write_str("Operation would block"),
            InvalidArg => f.write_str("Invalid argument"),
            OpNotSupported => f.write_str("Operation not supported"),
            ProtoNotSupported => f.write_str("Protocol not supported"),
            Inconsistent => f.write_str("Socket is in an inconsistent state"),
            Io(ref e) => write!(f, "IO error: {}", e),
        }
    }
}

impl error::Error for Error {
    fn cause(&self) -> Option<&dyn error::Error> {
        if let Error::Io(ref e) = *self {
            Some(e)
        } else {
            None
        }
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

/// Reasons the router drops an incoming frame. Never surfaced to the
/// application, only logged and counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxError {
    /// Frame smaller than a full IPX header.
    TooShort,

    /// The length field in the IPX header disagrees with the observed size.
    InvalidLength,

    /// The checksum field does not carry the fixed IPX sentinel.
    InvalidChecksum,

    /// Source socket zero with a packet type that is not a known magic.
    UnknownMagic(u8),

    /// The source IP is outside the subnets of the destination interface.
    WrongSubnet,

    /// Frame did not unpack as the configured Ethernet frame type.
    BadFrame,

    /// Packet from an IP endpoint that is not the configured relay server.
    NotFromServer,
}

impl fmt::Display for RxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::RxError::*;
        match *self {
            TooShort => f.write_str("Frame too short for an IPX header"),
            InvalidLength => f.write_str("Invalid length field in IPX header"),
            InvalidChecksum => f.write_str("Invalid checksum field in IPX header"),
            UnknownMagic(t) => write!(f, "Unknown magic packet type {}", t),
            WrongSubnet => f.write_str("Source IP outside the expected subnet"),
            BadFrame => f.write_str("Malformed Ethernet frame"),
            NotFromServer => f.write_str("Packet not from the relay server"),
        }
    }
}

pub type RxResult = ::std::result::Result<(), RxError>;
