//! Type aliases used in this library.

/// [`u32`]: RPC transaction identifier, as decoded from the call header.
pub type Xid = u32;

/// [`u64`]: Transport identifier, unique within the process.
pub type XprtId = u64;

/// [`u32`]: Event channel identifier.
pub type ChanId = u32;

/// [`u32`]: ONC RPC program number.
pub type Program = u32;

/// [`u32`]: ONC RPC program version.
pub type Vers = u32;
