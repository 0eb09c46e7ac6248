//! A custom linker error and result, for all your linking problems

use core::fmt;
use core::result;
use std::error;
use std::io;

#[derive(Debug)]
/// A custom linker error
pub enum Error {
    /// A symbol-resolution failure: undefined symbols, duplicate symbols,
    /// weak-reference mismatches, unresolvable re-exports
    Resolve(String),
    /// A layout failure: address-range overflow, segment overlap, bad -segaddr
    Layout(String),
    /// A fixup could not be applied: displacement out of range, unexpected
    /// instruction bytes, missing mode-switch encoding
    Fixup(String),
    /// A LINKEDIT stream could not be encoded
    Linkedit(String),
    /// An input violated a structural invariant (malformed fixup cluster,
    /// bad alignment, unassigned indirect slot)
    Malformed(String),
    /// An IO-based error
    IO(io::Error),
    /// Buffer encoding error
    Scroll(scroll::Error),
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::IO(io) => io.source(),
            Error::Scroll(scroll) => scroll.source(),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IO(err)
    }
}

impl From<scroll::Error> for Error {
    fn from(err: scroll::Error) -> Error {
        Error::Scroll(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::IO(err) => write!(fmt, "{err}"),
            Error::Scroll(err) => write!(fmt, "{err}"),
            Error::Resolve(msg) => write!(fmt, "{msg}"),
            Error::Layout(msg) => write!(fmt, "{msg}"),
            Error::Fixup(msg) => write!(fmt, "{msg}"),
            Error::Linkedit(msg) => write!(fmt, "{msg}"),
            Error::Malformed(msg) => write!(fmt, "Malformed entity: {msg}"),
        }
    }
}

/// The result of asking for a link
pub type Result<T> = result::Result<T, Error>;

/// Warning sink threaded through every linking phase.
///
/// ld-style linkers historically kept a process-global warning counter; here
/// the counter is an explicit context so a library embedding the core can run
/// several links in one process.
#[derive(Debug, Default)]
pub struct Diagnostics {
    warnings: Vec<String>,
    /// promote a non-zero warning count to a failure at exit (-fatal_warnings)
    pub fatal_warnings: bool,
}

impl Diagnostics {
    pub fn new(fatal_warnings: bool) -> Self {
        Diagnostics {
            warnings: Vec::new(),
            fatal_warnings,
        }
    }
    /// Record and log one warning
    pub fn warning(&mut self, msg: String) {
        log::warn!("{msg}");
        self.warnings.push(msg);
    }
    pub fn warning_count(&self) -> usize {
        self.warnings.len()
    }
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
    /// Called once at the end of the link; fails under -fatal_warnings
    pub fn finish(&self) -> Result<()> {
        if self.fatal_warnings && !self.warnings.is_empty() {
            Err(Error::Resolve(format!(
                "treating {} warning(s) as errors because -fatal_warnings was used",
                self.warnings.len()
            )))
        } else {
            Ok(())
        }
    }
}
