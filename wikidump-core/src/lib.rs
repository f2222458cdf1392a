mod checksums;
mod client;

pub use checksums::{ChecksumLine, parse_checksums, split_dump_name};
pub use client::{
    ClientOptions, DEFAULT_BASE_URL, DEFAULT_USER_AGENT, DumpsClient, DumpsError, ErrorClass,
    RemoteFile,
};
