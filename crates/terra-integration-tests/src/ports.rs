//! Port helpers for dev server tests

use std::io;
use std::net::{Ipv4Addr, TcpListener};

/// Hold `count` consecutive loopback ports and make sure the one after them is free.
///
/// Returns the first held port and the listeners keeping the ports busy; the
/// ports are released when the listeners are dropped.
pub fn occupy_consecutive(count: u16) -> io::Result<(u16, Vec<TcpListener>)> {
    for _ in 0..32 {
        // Let the OS pick a base, then try to grab the ports above it
        let probe = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        let base = probe.local_addr()?.port();
        drop(probe);
        if base.checked_add(count + 1).is_none() {
            continue;
        }

        let held: io::Result<Vec<_>> = (0..count)
            .map(|offset| TcpListener::bind((Ipv4Addr::LOCALHOST, base + offset)))
            .collect();
        let Ok(held) = held else {
            continue;
        };

        if is_free(base + count) {
            return Ok((base, held));
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        "no run of consecutive free ports found",
    ))
}

/// Whether a loopback port can currently be bound
pub fn is_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}
