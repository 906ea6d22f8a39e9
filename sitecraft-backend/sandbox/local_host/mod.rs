pub mod fs_jail;
pub mod process_supervisor;
