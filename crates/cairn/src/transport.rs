//! Moving generations between hosts over TCP.
//!
//! One connection carries exactly one bundle. The sender connects, streams
//! the bundle and half-closes; the receiver accepts a single connection and
//! unpacks it.

use std::{
    io::{BufReader, BufWriter},
    net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs},
    path::Path,
};

use tracing::info;

use crate::bundle::{self, BundleStats};
use crate::config::Options;
use crate::error::{Error, Result};

/// Send generation `name` under `root` to `addr`.
pub fn send(addr: impl ToSocketAddrs, root: &Path, name: &str) -> Result<BundleStats> {
    let stream = TcpStream::connect(addr).map_err(Error::Network)?;
    let peer = stream.peer_addr().ok();
    info!(?peer, generation = name, "Sending generation");

    let mut writer = BufWriter::new(&stream);
    let stats = bundle::write_generation(root, name, &mut writer)?;
    drop(writer);
    stream.shutdown(Shutdown::Write).map_err(Error::Network)?;

    info!(?peer, files = stats.files, bytes = stats.bytes, "Sent generation");
    Ok(stats)
}

/// Listen on `addr`, accept one connection and store the generation it
/// carries under `root`.
pub fn receive(addr: impl ToSocketAddrs, root: &Path, options: &Options) -> Result<BundleStats> {
    let listener = TcpListener::bind(addr).map_err(Error::Network)?;
    receive_from(&listener, root, options)
}

/// Accept one connection on an already bound listener.
pub fn receive_from(listener: &TcpListener, root: &Path, options: &Options) -> Result<BundleStats> {
    info!(local = ?listener.local_addr().ok(), "Waiting for generation");
    let (stream, peer) = listener.accept().map_err(Error::Network)?;
    info!(%peer, "Receiving from peer");
    bundle::read_generation(BufReader::new(stream), root, options)
}
