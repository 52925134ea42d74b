//! Memory Management Subsystem

pub mod paging; // i386 page tables behind `AddressSpaces`

pub use paging::X86Paging;
