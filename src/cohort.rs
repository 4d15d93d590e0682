//! Rank/role context for the distributed primitives (C2)
//!
//! A global mutable singleton has no honest translation into safe Rust
//! (every reader would need `unsafe` or a lock held for the program's
//! lifetime), so `Cohort` makes the rank/size/role/communication state an
//! explicit, owned value threaded through every call that would otherwise
//! reach for process-global state — every distributed primitive in
//! `matops.rs` and `qr.rs` takes `&Cohort` instead of being free to read
//! global state.
//!
//! Because a [`crate::comm::Communicator`] addresses exactly one fixed peer,
//! the master's side of a cohort holds *one link per slave* rather than a
//! single shared handle; the master picks the slave it's routing a given
//! send/receive through by index.

#![forbid(unsafe_code)]

use std::sync::Arc;

use crate::comm::Communicator;
use crate::error::CoreError;

/// The transport links a cohort member holds, depending on its role.
enum Link {
    /// The master's link to every slave, in ascending rank order.
    Master { to_slaves: Vec<Arc<dyn Communicator>> },
    /// A slave's link to the master.
    Slave { to_master: Arc<dyn Communicator> },
}

/// The rank/size/role/transport context a distributed numerical primitive
/// needs.
///
/// A cohort of size 1 carries no links at all (`link` is `None`); every
/// distributed method on `Cohort` short-circuits to the purely local
/// computation in that case.
pub struct Cohort {
    rank: usize,
    size: usize,
    master_rank: usize,
    link: Option<Link>,
}

impl Cohort {
    /// Build the master's view of a cohort of size `size`, given one link
    /// to each slave in ascending rank order (`size - 1` links).
    pub fn master(size: usize, to_slaves: Vec<Arc<dyn Communicator>>) -> Result<Self, CoreError> {
        if size == 0 {
            return Err(CoreError::configuration("cohort size must be at least 1"));
        }
        if to_slaves.len() != size - 1 {
            return Err(CoreError::configuration(format!(
                "master needs exactly {} slave links, got {}",
                size - 1,
                to_slaves.len()
            )));
        }
        Ok(Cohort {
            rank: 0,
            size,
            master_rank: 0,
            link: if size == 1 { None } else { Some(Link::Master { to_slaves }) },
        })
    }

    /// Build a slave's view of a cohort of size `size` at position `rank`,
    /// given its single link to the master.
    pub fn slave(rank: usize, size: usize, master_rank: usize, to_master: Arc<dyn Communicator>) -> Result<Self, CoreError> {
        if size == 0 || rank >= size {
            return Err(CoreError::configuration(format!("rank {rank} out of range for cohort of size {size}")));
        }
        if rank == master_rank {
            return Err(CoreError::configuration("a slave's rank must differ from the master rank"));
        }
        Ok(Cohort { rank, size, master_rank, link: Some(Link::Slave { to_master }) })
    }

    /// Build a singleton cohort (size 1, no links, no peers) — the common
    /// case for single-rank tests and demos.
    pub fn solo() -> Self {
        Cohort { rank: 0, size: 1, master_rank: 0, link: None }
    }

    /// This rank's position, `0..size`.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Total number of ranks in the cohort.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this rank is the cohort's master.
    pub fn is_master(&self) -> bool {
        self.rank == self.master_rank
    }

    /// The master's rank number, regardless of which rank we are.
    pub fn master_rank(&self) -> usize {
        self.master_rank
    }

    /// Number of slave ranks (`size - 1`).
    pub fn num_slaves(&self) -> usize {
        self.size - 1
    }

    /// The global rank number of slave `slave_index` (0-based, ascending),
    /// i.e. the inverse of the ordering `to_slaves` is built with.
    pub fn slave_rank(&self, slave_index: usize) -> usize {
        if slave_index < self.master_rank {
            slave_index
        } else {
            slave_index + 1
        }
    }

    fn as_master(&self) -> Result<&[Arc<dyn Communicator>], CoreError> {
        match &self.link {
            Some(Link::Master { to_slaves }) => Ok(to_slaves.as_slice()),
            _ => Err(CoreError::invariant("operation requires the master role")),
        }
    }

    fn as_slave(&self) -> Result<&Arc<dyn Communicator>, CoreError> {
        match &self.link {
            Some(Link::Slave { to_master }) => Ok(to_master),
            _ => Err(CoreError::invariant("operation requires the slave role")),
        }
    }

    /// Master-only: send a scalar to slave `slave_index` (0-based, ascending
    /// rank order).
    pub fn send_f64_to_slave(&self, slave_index: usize, value: f64) -> Result<(), CoreError> {
        self.as_master()?[slave_index].send_f64(value)
    }

    /// Master-only: receive a scalar from slave `slave_index`.
    pub fn receive_f64_from_slave(&self, slave_index: usize) -> Result<f64, CoreError> {
        self.as_master()?[slave_index].receive_f64()
    }

    /// Master-only: send a vector to slave `slave_index`.
    pub fn send_f64_slice_to_slave(&self, slave_index: usize, values: &[f64]) -> Result<(), CoreError> {
        self.as_master()?[slave_index].send_f64_slice(values)
    }

    /// Master-only: receive a vector from slave `slave_index`.
    pub fn receive_f64_slice_from_slave(&self, slave_index: usize, out: &mut [f64]) -> Result<(), CoreError> {
        self.as_master()?[slave_index].receive_f64_slice(out)
    }

    /// Slave-only: send a scalar to the master.
    pub fn send_f64_to_master(&self, value: f64) -> Result<(), CoreError> {
        self.as_slave()?.send_f64(value)
    }

    /// Slave-only: receive a scalar from the master.
    pub fn receive_f64_from_master(&self) -> Result<f64, CoreError> {
        self.as_slave()?.receive_f64()
    }

    /// Slave-only: send a vector to the master.
    pub fn send_f64_slice_to_master(&self, values: &[f64]) -> Result<(), CoreError> {
        self.as_slave()?.send_f64_slice(values)
    }

    /// Slave-only: receive a vector from the master.
    pub fn receive_f64_slice_from_master(&self, out: &mut [f64]) -> Result<(), CoreError> {
        self.as_slave()?.receive_f64_slice(out)
    }

    /// Global inner product of two equal-length local vectors, summed across
    /// the whole cohort.
    ///
    /// For a cohort of size 1 this is exactly the local dot product; no
    /// communication occurs.
    pub fn dot(&self, a: &[f64], b: &[f64]) -> Result<f64, CoreError> {
        crate::error::invariant!(a.len() == b.len(), "dot: length mismatch ({} vs {})", a.len(), b.len());
        let local: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        self.reduce_sum(local)
    }

    /// Global Euclidean norm of a vector distributed row-wise across the
    /// cohort (`sqrt(dot(v, v))`).
    pub fn l2norm(&self, local: &[f64]) -> Result<f64, CoreError> {
        Ok(self.dot(local, local)?.sqrt())
    }

    /// Weighted root-mean-square norm: `sqrt((1/N) * sum(local[i]^2 / weights[i]^2))`
    /// with `N` the *global* vector length.
    pub fn wrms_norm(&self, local: &[f64], weights: &[f64], global_len: usize) -> Result<f64, CoreError> {
        crate::error::invariant!(
            local.len() == weights.len(),
            "wrms_norm: length mismatch ({} vs {})",
            local.len(),
            weights.len()
        );
        crate::error::invariant!(global_len > 0, "wrms_norm: global_len must be positive");
        let local_sum: f64 = local
            .iter()
            .zip(weights.iter())
            .map(|(v, w)| {
                let scaled = v / w;
                scaled * scaled
            })
            .sum();
        let total = self.reduce_sum(local_sum)?;
        Ok((total / global_len as f64).sqrt())
    }

    /// Sum a per-rank scalar across the cohort; every rank receives the same
    /// total. On a size-1 cohort this is the identity.
    pub fn reduce_sum(&self, local: f64) -> Result<f64, CoreError> {
        match &self.link {
            None => Ok(local),
            Some(Link::Master { to_slaves }) => {
                let mut total = local;
                for link in to_slaves {
                    total += link.receive_f64()?;
                }
                for link in to_slaves {
                    link.send_f64(total)?;
                }
                Ok(total)
            }
            Some(Link::Slave { to_master }) => {
                to_master.send_f64(local)?;
                to_master.receive_f64()
            }
        }
    }

    /// Elementwise-sum a per-rank vector across the cohort; only the master
    /// gets the summed result back (this is not itself a broadcast).
    pub fn reduce_sum_vec(&self, local: &[f64]) -> Result<Vec<f64>, CoreError> {
        match &self.link {
            None => Ok(local.to_vec()),
            Some(Link::Master { to_slaves }) => {
                let mut total = local.to_vec();
                let mut buf = vec![0.0; local.len()];
                for link in to_slaves {
                    link.receive_f64_slice(&mut buf)?;
                    for (t, v) in total.iter_mut().zip(buf.iter()) {
                        *t += v;
                    }
                }
                Ok(total)
            }
            Some(Link::Slave { to_master }) => {
                to_master.send_f64_slice(local)?;
                Ok(Vec::new())
            }
        }
    }

    /// Broadcast a scalar from the master to every slave; the master passes
    /// its own value through unchanged, slaves receive it.
    pub fn broadcast_f64(&self, value: f64) -> Result<f64, CoreError> {
        match &self.link {
            None => Ok(value),
            Some(Link::Master { to_slaves }) => {
                for link in to_slaves {
                    link.send_f64(value)?;
                }
                Ok(value)
            }
            Some(Link::Slave { to_master }) => to_master.receive_f64(),
        }
    }

    /// Find the globally smallest `value` across every rank's local
    /// candidate and the global index it was paired with, broadcasting the
    /// winning `(value, index)` pair to every rank. `local` is `None` when
    /// this rank owns no candidate rows (e.g. an empty row-partition slice).
    ///
    /// Used by the QR restart heuristic (`qr.rs`) to find the row of `Q`
    /// with minimal squared length when `Q`'s rows are distributed.
    pub fn reduce_arg_min(&self, local: Option<(f64, usize)>) -> Result<(f64, usize), CoreError> {
        const NONE: (f64, usize) = (f64::INFINITY, usize::MAX);
        match &self.link {
            None => Ok(local.unwrap_or(NONE)),
            Some(Link::Master { to_slaves }) => {
                let mut best = local.unwrap_or(NONE);
                for link in to_slaves {
                    let value = link.receive_f64()?;
                    let index = link.receive_int()? as usize;
                    if value < best.0 {
                        best = (value, index);
                    }
                }
                for link in to_slaves {
                    link.send_f64(best.0)?;
                    link.send_int(best.1 as i32)?;
                }
                Ok(best)
            }
            Some(Link::Slave { to_master }) => {
                let (value, index) = local.unwrap_or(NONE);
                to_master.send_f64(value)?;
                to_master.send_int(index as i32)?;
                let value = to_master.receive_f64()?;
                let index = to_master.receive_int()? as usize;
                Ok((value, index))
            }
        }
    }

    /// Broadcast a vector from the master to every slave.
    pub fn broadcast_f64_slice(&self, values: &[f64]) -> Result<Vec<f64>, CoreError> {
        match &self.link {
            None => Ok(values.to_vec()),
            Some(Link::Master { to_slaves }) => {
                for link in to_slaves {
                    link.send_f64_slice(values)?;
                }
                Ok(values.to_vec())
            }
            Some(Link::Slave { to_master }) => {
                let mut buf = vec![0.0; values.len()];
                to_master.receive_f64_slice(&mut buf)?;
                Ok(buf)
            }
        }
    }
}
