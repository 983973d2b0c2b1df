//! Integer ids used to resolve the cyclic Bundle/Link/Contact graph without
//! Rust reference cycles, per the "typed arenas keyed by integer ids"
//! recommendation in §9.

pub type LinkId = u32;
pub type RegId = u32;
pub type ContactId = u64;
