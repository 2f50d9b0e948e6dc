//! Error type for netlink socket and message handling.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetlinkError {
    #[error("netlink I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// NLMSG_ERROR payload from the kernel, carrying a negative errno.
    #[error("kernel refused netlink request: errno {0}")]
    Kernel(i32),

    #[error("truncated or malformed netlink message")]
    Malformed,

    #[error("receive buffer of {requested} bytes not granted (effective {effective})")]
    RecvBuffer { requested: usize, effective: usize },

    #[error("unknown interface: {0}")]
    UnknownInterface(String),
}
