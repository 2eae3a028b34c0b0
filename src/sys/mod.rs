pub mod process;
pub mod sanoid;
pub mod ssh;
pub mod zfs;
