//! Protobuf records for connection-table images and handshakes.
//!
//! Field tags are part of the on-disk format; append, never renumber.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProcessIdentityEntry {
    #[prost(uint64, tag = "1")]
    pub host_id: u64,
    #[prost(int32, tag = "2")]
    pub pid: i32,
    #[prost(int64, tag = "3")]
    pub creation_time: i64,
    #[prost(uint32, tag = "4")]
    pub generation: u32,
    #[prost(string, tag = "5")]
    pub prefix: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectionIdEntry {
    #[prost(message, optional, tag = "1")]
    pub owner: ::core::option::Option<ProcessIdentityEntry>,
    #[prost(uint64, tag = "2")]
    pub sequence: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DescriptorFlagsEntry {
    #[prost(int32, tag = "1")]
    pub status_flags: i32,
    #[prost(bool, tag = "2")]
    pub close_on_exec: bool,
    #[prost(int32, tag = "3")]
    pub owner: i32,
    #[prost(int32, tag = "4")]
    pub signal: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ConnKindEntry {
    Invalid = 0,
    Tcp = 1,
    Pipe = 2,
    Pts = 3,
    File = 4,
    Stdio = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TcpStateEntry {
    Invalid = 0,
    Error = 1,
    Created = 2,
    Bound = 3,
    Listening = 4,
    Accepted = 5,
    Connected = 6,
    Preexisting = 7,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SockOptEntry {
    #[prost(int32, tag = "1")]
    pub level: i32,
    #[prost(int32, tag = "2")]
    pub option: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub value: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TcpEntry {
    #[prost(enumeration = "TcpStateEntry", tag = "1")]
    pub state: i32,
    #[prost(int32, tag = "2")]
    pub domain: i32,
    #[prost(int32, tag = "3")]
    pub sock_type: i32,
    #[prost(int32, tag = "4")]
    pub protocol: i32,
    #[prost(int32, tag = "5")]
    pub listen_backlog: i32,
    #[prost(bytes = "vec", tag = "6")]
    pub bound_addr: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, optional, tag = "7")]
    pub remote_id: ::core::option::Option<ConnectionIdEntry>,
    #[prost(message, repeated, tag = "8")]
    pub sock_opts: ::prost::alloc::vec::Vec<SockOptEntry>,
    #[prost(message, optional, tag = "9")]
    pub peer_process: ::core::option::Option<ProcessIdentityEntry>,
    #[prost(message, optional, tag = "10")]
    pub peer_conn: ::core::option::Option<ConnectionIdEntry>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PtsSubtypeEntry {
    Invalid = 0,
    Master = 1,
    Slave = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PtsEntry {
    #[prost(enumeration = "PtsSubtypeEntry", tag = "1")]
    pub subtype: i32,
    #[prost(string, tag = "2")]
    pub device: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub symlink: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "4")]
    pub termios: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileMetaEntry {
    #[prost(int64, tag = "1")]
    pub size: i64,
    #[prost(uint32, tag = "2")]
    pub mode: u32,
    #[prost(int64, tag = "3")]
    pub mtime_sec: i64,
    #[prost(int64, tag = "4")]
    pub mtime_nsec: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileConnEntry {
    #[prost(string, tag = "1")]
    pub path: ::prost::alloc::string::String,
    #[prost(int64, tag = "2")]
    pub offset: i64,
    #[prost(message, optional, tag = "3")]
    pub meta: ::core::option::Option<FileMetaEntry>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StdioStreamEntry {
    In = 0,
    Out = 1,
    Err = 2,
    Invalid = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StdioEntry {
    #[prost(enumeration = "StdioStreamEntry", tag = "1")]
    pub stream: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectionEntry {
    #[prost(message, optional, tag = "1")]
    pub id: ::core::option::Option<ConnectionIdEntry>,
    #[prost(enumeration = "ConnKindEntry", tag = "2")]
    pub kind: i32,
    #[prost(message, optional, tag = "3")]
    pub flags: ::core::option::Option<DescriptorFlagsEntry>,
    #[prost(oneof = "connection_entry::Payload", tags = "10, 11, 12, 13")]
    pub payload: ::core::option::Option<connection_entry::Payload>,
}

pub mod connection_entry {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "10")]
        Tcp(super::TcpEntry),
        #[prost(message, tag = "11")]
        Pts(super::PtsEntry),
        #[prost(message, tag = "12")]
        File(super::FileConnEntry),
        #[prost(message, tag = "13")]
        Stdio(super::StdioEntry),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnTableHead {
    #[prost(string, tag = "1")]
    pub run_id: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub this_process: ::core::option::Option<ProcessIdentityEntry>,
    #[prost(message, optional, tag = "3")]
    pub parent_process: ::core::option::Option<ProcessIdentityEntry>,
    #[prost(uint32, tag = "4")]
    pub entries: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnTableEntry {
    #[prost(message, optional, tag = "1")]
    pub conn: ::core::option::Option<ConnectionEntry>,
    #[prost(int32, repeated, tag = "2")]
    pub fds: ::prost::alloc::vec::Vec<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HandshakeEntry {
    #[prost(message, optional, tag = "1")]
    pub coordinator: ::core::option::Option<ProcessIdentityEntry>,
    #[prost(message, optional, tag = "2")]
    pub sender: ::core::option::Option<ProcessIdentityEntry>,
    #[prost(message, optional, tag = "3")]
    pub conn_id: ::core::option::Option<ConnectionIdEntry>,
}
