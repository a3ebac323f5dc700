// Uniform result signaling across the engine. Every public operation returns a
// Status so the host can tell a routing bug (fatal) from a bad cartridge
// (report and refuse to start) from a clean exit request.
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    Generic,
    InvalidArgument,
    // Raised by the CPU when it fetches an opcode with no table entry. Fatal:
    // the emulation loop stops and surfaces the opcode and the address it was
    // fetched from.
    UndefinedInstruction { opcode: u8, pc: u16 },
    // Raised by a bus port when a relative address exceeds its region. Fatal:
    // this is a routing bug in the engine, not reachable by game code.
    AddressOutOfBound { address: u16 },
    NotInitialized,
    AlreadyInitialized,
    // Cartridge load failures. Recoverable at the host level.
    ChecksumFailure,
    FileNotFound,
    Unsupported,
    // Used by the host key loop to signal that the user closed the window.
    // Propagates up through step() and terminates the run cleanly.
    RequestExit,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    // Recoverable errors may be reported to the user without tearing down the
    // engine; everything else stops the emulation loop.
    pub fn is_recoverable(self) -> bool {
        match self {
            Error::ChecksumFailure | Error::FileNotFound | Error::Unsupported => true,
            Error::AlreadyInitialized => true,
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Generic => write!(f, "Generic failure"),
            Error::InvalidArgument => write!(f, "Invalid argument"),
            Error::UndefinedInstruction { opcode, pc } => {
                write!(f, "Undefined instruction 0x{:02x} at 0x{:04x}", opcode, pc)
            }
            Error::AddressOutOfBound { address } => {
                write!(f, "Address 0x{:04x} is out of bound", address)
            }
            Error::NotInitialized => write!(f, "Resource is not initialized"),
            Error::AlreadyInitialized => write!(f, "Resource is already initialized"),
            Error::ChecksumFailure => write!(f, "Cartridge header checksum is incorrect"),
            Error::FileNotFound => write!(f, "File not found"),
            Error::Unsupported => write!(f, "Unsupported"),
            Error::RequestExit => write!(f, "Exit requested"),
        }
    }
}

impl std::error::Error for Error {}
