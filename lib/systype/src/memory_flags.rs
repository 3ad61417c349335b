//! Module for abstracting memory permissions.

use bitflags::bitflags;

bitflags! {
    /// Permission bits attached to a load region, a page-table entry, or a
    /// fault classification result.
    ///
    /// - `R`: Readable
    /// - `W`: Writable
    /// - `X`: Executable
    ///
    /// Do not set any unknown bits.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MappingFlags: u8 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
    }
}
