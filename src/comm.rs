//! Point-to-point communicator abstraction (C1)
//!
//! The concrete wire transport (MPI ports, sockets, …) is out of scope for
//! this crate; what's in scope is the interface itself — `Communicator`
//! below — plus one concrete, dependency-light realization suitable for
//! single-binary tests and simulation: `ChannelCommunicator`, a fixed
//! rank-to-rank link backed by an unbounded `crossbeam-channel`.
//!
//! Two topologies are built from the same type:
//! - [`ChannelCommunicator::pair`] creates the two endpoints of a
//!   participant↔participant link (used by the coupling scheme, C7).
//! - [`ChannelCommunicator::ring`] creates, for every rank in a slave ring of
//!   size `N`, a `(cyclic_left, cyclic_right)` pair: `cyclic_left` can only
//!   receive (from the rank's left neighbor), `cyclic_right` can only send
//!   (to the rank's right neighbor) — exactly the asymmetric pair the cyclic
//!   matmul kernel of C3 needs.
//!
//! Every `Communicator` instance addresses exactly one fixed peer rank; the
//! source's per-call `peer` argument becomes unnecessary once the
//! participant-pair and ring topologies are modeled as their own link
//! objects, which is both simpler and removes a class of "sent to the wrong
//! peer" bugs the original API allowed.

#![forbid(unsafe_code)]

use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::CoreError;

/// One message on the wire. Only the three payload kinds the core actually
/// exchanges are modeled.
#[derive(Debug, Clone)]
enum Wire {
    Int(i32),
    F64(f64),
    F64Vec(Vec<f64>),
}

/// A move-only, single-wait handle for an in-flight asynchronous send.
///
/// Dropping a `SendRequest` without calling [`SendRequest::wait`] is a bug:
/// debug builds assert on it, since there is no unsafe linear-type
/// machinery here to enforce "must be waited on" at compile time.
#[must_use = "an async send must be waited on"]
pub struct SendRequest {
    handle: Option<JoinHandle<Result<(), CoreError>>>,
}

impl SendRequest {
    /// Block until the send has completed, propagating any transport error.
    pub fn wait(mut self) -> Result<(), CoreError> {
        let handle = self.handle.take().expect("SendRequest::wait called twice");
        handle.join().map_err(|_| CoreError::transport("send worker thread panicked"))?
    }
}

impl Drop for SendRequest {
    fn drop(&mut self) {
        debug_assert!(self.handle.is_none(), "SendRequest dropped without wait() — unwaited async request");
    }
}

/// A move-only, single-wait handle for an in-flight asynchronous receive.
#[must_use = "an async receive must be waited on"]
pub struct ReceiveRequest {
    handle: Option<JoinHandle<Result<Vec<f64>, CoreError>>>,
}

impl ReceiveRequest {
    /// Block until the receive has completed, returning the received buffer.
    pub fn wait(mut self) -> Result<Vec<f64>, CoreError> {
        let handle = self.handle.take().expect("ReceiveRequest::wait called twice");
        handle.join().map_err(|_| CoreError::transport("receive worker thread panicked"))?
    }
}

impl Drop for ReceiveRequest {
    fn drop(&mut self) {
        debug_assert!(self.handle.is_none(), "ReceiveRequest dropped without wait() — unwaited async request");
    }
}

/// Ordered, typed point-to-point transport between the local rank and one
/// fixed peer rank.
///
/// `start_*_package`/`finish_*_package` delimit a batched, ordered group of
/// typed transfers (a "packaged group"); FIFO ordering within a group is
/// guaranteed by the underlying channel, so the guards here exist to catch
/// *misuse* (mismatched start/finish calls) rather than to enforce ordering
/// themselves.
pub trait Communicator: Send {
    /// The fixed peer rank this communicator talks to.
    fn peer_rank(&self) -> usize;

    /// Open a packaged send group. Errors if one is already open.
    fn start_send_package(&mut self) -> Result<(), CoreError>;
    /// Close the currently open packaged send group.
    fn finish_send_package(&mut self) -> Result<(), CoreError>;
    /// Open a packaged receive group. Errors if one is already open.
    fn start_receive_package(&mut self) -> Result<(), CoreError>;
    /// Close the currently open packaged receive group.
    fn finish_receive_package(&mut self) -> Result<(), CoreError>;

    /// Blocking send of a single `int`.
    fn send_int(&self, value: i32) -> Result<(), CoreError>;
    /// Blocking receive of a single `int`.
    fn receive_int(&self) -> Result<i32, CoreError>;
    /// Blocking send of a single `double`.
    fn send_f64(&self, value: f64) -> Result<(), CoreError>;
    /// Blocking receive of a single `double`.
    fn receive_f64(&self) -> Result<f64, CoreError>;
    /// Blocking send of a contiguous array of `double`.
    fn send_f64_slice(&self, values: &[f64]) -> Result<(), CoreError>;
    /// Blocking receive of a contiguous array of `double` into `out`; the
    /// received length must equal `out.len()`.
    fn receive_f64_slice(&self, out: &mut [f64]) -> Result<(), CoreError>;

    /// Issue an asynchronous send of `data`; completion order matches issue
    /// order for this (peer, direction).
    fn a_send_f64(&self, data: Vec<f64>) -> SendRequest;
    /// Issue an asynchronous receive of exactly `len` doubles.
    fn a_receive_f64(&self, len: usize) -> ReceiveRequest;
}

/// One fixed rank-to-rank link, backed by a pair of unbounded
/// `crossbeam-channel` queues (or just one direction, for ring links).
pub struct ChannelCommunicator {
    tx: Option<Sender<Wire>>,
    rx: Option<Receiver<Wire>>,
    peer_rank: usize,
    in_send_package: bool,
    in_receive_package: bool,
}

impl ChannelCommunicator {
    fn send_only(tx: Sender<Wire>, peer_rank: usize) -> Self {
        ChannelCommunicator { tx: Some(tx), rx: None, peer_rank, in_send_package: false, in_receive_package: false }
    }

    fn receive_only(rx: Receiver<Wire>, peer_rank: usize) -> Self {
        ChannelCommunicator { tx: None, rx: Some(rx), peer_rank, in_send_package: false, in_receive_package: false }
    }

    /// Create the two endpoints of a bidirectional participant↔participant
    /// link. `rank_a`/`rank_b` are the peer ranks each endpoint will report
    /// via [`Communicator::peer_rank`] from the *other* endpoint's point of
    /// view.
    pub fn pair(rank_a: usize, rank_b: usize) -> (ChannelCommunicator, ChannelCommunicator) {
        let (tx_ab, rx_ab) = unbounded();
        let (tx_ba, rx_ba) = unbounded();
        let a = ChannelCommunicator {
            tx: Some(tx_ab),
            rx: Some(rx_ba),
            peer_rank: rank_b,
            in_send_package: false,
            in_receive_package: false,
        };
        let b = ChannelCommunicator {
            tx: Some(tx_ba),
            rx: Some(rx_ab),
            peer_rank: rank_a,
            in_send_package: false,
            in_receive_package: false,
        };
        (a, b)
    }

    /// Build the slave ring of size `size`: for every rank `i` returns
    /// `(cyclic_left, cyclic_right)`, where `cyclic_left` receives from rank
    /// `(i - 1) mod size` and `cyclic_right` sends to rank `(i + 1) mod size`.
    pub fn ring(size: usize) -> Vec<(ChannelCommunicator, ChannelCommunicator)> {
        assert!(size > 0, "ring size must be positive");
        let edges: Vec<(Sender<Wire>, Receiver<Wire>)> = (0..size).map(|_| unbounded()).collect();
        let mut senders: Vec<Option<Sender<Wire>>> = edges.iter().map(|(tx, _)| Some(tx.clone())).collect();
        let mut receivers: Vec<Option<Receiver<Wire>>> = edges.iter().map(|(_, rx)| Some(rx.clone())).collect();

        let mut out = Vec::with_capacity(size);
        for i in 0..size {
            let right_peer = (i + 1) % size;
            let left_peer = (i + size - 1) % size;
            let cyclic_right = ChannelCommunicator::send_only(senders[i].take().unwrap(), right_peer);
            let cyclic_left = ChannelCommunicator::receive_only(receivers[left_peer].take().unwrap(), left_peer);
            out.push((cyclic_left, cyclic_right));
        }
        out
    }

    fn tx(&self) -> Result<&Sender<Wire>, CoreError> {
        self.tx.as_ref().ok_or_else(|| CoreError::transport("this link cannot send (receive-only endpoint)"))
    }

    fn rx(&self) -> Result<&Receiver<Wire>, CoreError> {
        self.rx.as_ref().ok_or_else(|| CoreError::transport("this link cannot receive (send-only endpoint)"))
    }
}

impl Communicator for ChannelCommunicator {
    fn peer_rank(&self) -> usize {
        self.peer_rank
    }

    fn start_send_package(&mut self) -> Result<(), CoreError> {
        if self.in_send_package {
            return Err(CoreError::invariant("start_send_package called while a send package is already open"));
        }
        self.in_send_package = true;
        Ok(())
    }

    fn finish_send_package(&mut self) -> Result<(), CoreError> {
        if !self.in_send_package {
            return Err(CoreError::invariant("finish_send_package called without a matching start"));
        }
        self.in_send_package = false;
        Ok(())
    }

    fn start_receive_package(&mut self) -> Result<(), CoreError> {
        if self.in_receive_package {
            return Err(CoreError::invariant("start_receive_package called while a receive package is already open"));
        }
        self.in_receive_package = true;
        Ok(())
    }

    fn finish_receive_package(&mut self) -> Result<(), CoreError> {
        if !self.in_receive_package {
            return Err(CoreError::invariant("finish_receive_package called without a matching start"));
        }
        self.in_receive_package = false;
        Ok(())
    }

    fn send_int(&self, value: i32) -> Result<(), CoreError> {
        self.tx()?.send(Wire::Int(value)).map_err(|_| CoreError::transport("peer disconnected"))
    }

    fn receive_int(&self) -> Result<i32, CoreError> {
        match self.rx()?.recv().map_err(|_| CoreError::transport("peer disconnected"))? {
            Wire::Int(v) => Ok(v),
            _ => Err(CoreError::transport("received message of unexpected type (expected int)")),
        }
    }

    fn send_f64(&self, value: f64) -> Result<(), CoreError> {
        self.tx()?.send(Wire::F64(value)).map_err(|_| CoreError::transport("peer disconnected"))
    }

    fn receive_f64(&self) -> Result<f64, CoreError> {
        match self.rx()?.recv().map_err(|_| CoreError::transport("peer disconnected"))? {
            Wire::F64(v) => Ok(v),
            _ => Err(CoreError::transport("received message of unexpected type (expected f64)")),
        }
    }

    fn send_f64_slice(&self, values: &[f64]) -> Result<(), CoreError> {
        self.tx()?.send(Wire::F64Vec(values.to_vec())).map_err(|_| CoreError::transport("peer disconnected"))
    }

    fn receive_f64_slice(&self, out: &mut [f64]) -> Result<(), CoreError> {
        match self.rx()?.recv().map_err(|_| CoreError::transport("peer disconnected"))? {
            Wire::F64Vec(v) => {
                if v.len() != out.len() {
                    return Err(CoreError::invariant(format!(
                        "received {} doubles, expected {}",
                        v.len(),
                        out.len()
                    )));
                }
                out.copy_from_slice(&v);
                Ok(())
            }
            _ => Err(CoreError::transport("received message of unexpected type (expected f64 slice)")),
        }
    }

    fn a_send_f64(&self, data: Vec<f64>) -> SendRequest {
        let tx = self.tx.clone();
        let handle = thread::spawn(move || -> Result<(), CoreError> {
            let tx = tx.ok_or_else(|| CoreError::transport("this link cannot send (receive-only endpoint)"))?;
            tx.send(Wire::F64Vec(data)).map_err(|_| CoreError::transport("peer disconnected"))
        });
        SendRequest { handle: Some(handle) }
    }

    fn a_receive_f64(&self, len: usize) -> ReceiveRequest {
        let rx = self.rx.clone();
        let handle = thread::spawn(move || -> Result<Vec<f64>, CoreError> {
            let rx = rx.ok_or_else(|| CoreError::transport("this link cannot receive (send-only endpoint)"))?;
            match rx.recv().map_err(|_| CoreError::transport("peer disconnected"))? {
                Wire::F64Vec(v) => {
                    if v.len() != len {
                        return Err(CoreError::invariant(format!("received {} doubles, expected {}", v.len(), len)));
                    }
                    Ok(v)
                }
                _ => Err(CoreError::transport("received message of unexpected type (expected f64 vec)")),
            }
        });
        ReceiveRequest { handle: Some(handle) }
    }
}
