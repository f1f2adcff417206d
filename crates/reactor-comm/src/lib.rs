//! Socket state machine built on top of `reactor-core`'s event reactor.
//!
//! A [`Comm`] owns one file descriptor and any combination of read, write,
//! accept, connect, and UDP read/write substates, each driven by reactor
//! event handles it creates lazily on first use. Grounded on `comm.c`'s
//! `struct fde_comm` and its `comm_cb_*`/`comm_*` functions.

mod addr;
mod comm;

pub use comm::{
    listen, udp_bind, udp_bind_reuseport, AcceptCallback, CloseCallback, Comm, CommStatus, ConnectCallback, ReadCallback,
    UdpReadCallback, UdpWriteCallback, WriteCallback,
};
