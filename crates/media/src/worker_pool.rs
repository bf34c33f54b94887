use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use mediasoup::worker::{Worker, WorkerDtlsFiles, WorkerLogLevel, WorkerLogTag, WorkerSettings};
use mediasoup::worker_manager::WorkerManager;
use meshcast_config::WorkerPoolSettings;
use tracing::{error, info, warn};

use crate::error::WorkerInitError;

/// One entry in the pool: a live mediasoup worker process plus the counters
/// used to pick it for new rooms. Counters are recomputed from a scan of all
/// live rooms rather than bumped in place, so they stay correct even if a
/// room is torn down out of band (worker death, reconfigure).
pub struct WorkerSlot {
    pub index: u32,
    pub pid: u32,
    pub worker: Worker,
    participant_count: AtomicUsize,
    room_count: AtomicUsize,
}

impl WorkerSlot {
    pub fn participant_count(&self) -> usize {
        self.participant_count.load(Ordering::Relaxed)
    }

    pub fn room_count(&self) -> usize {
        self.room_count.load(Ordering::Relaxed)
    }
}

/// Snapshot of one worker's load, as summed from a scan of live rooms.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerLoad {
    pub worker_index: u32,
    pub participant_count: usize,
    pub room_count: usize,
}

/// Fixed-size pool of out-of-process mediasoup workers. All workers are
/// live for the lifetime of the process; a worker death puts the pool into
/// an error state rather than being replaced transparently (see the design
/// notes on worker failure).
pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
}

impl WorkerPool {
    /// Spawns every worker up front. Fails fast: if any worker cannot be
    /// created, the whole pool init fails and no partial pool is returned.
    pub async fn start(settings: &WorkerPoolSettings) -> Result<Self, WorkerInitError> {
        let size = settings.resolved_size();
        let manager = WorkerManager::new();
        let mut slots = Vec::with_capacity(size as usize);

        for index in 0..size {
            let mut worker_settings = WorkerSettings::default();
            worker_settings.rtc_ports_range = settings.rtc_min_port..=settings.rtc_max_port;
            worker_settings.log_level = parse_log_level(&settings.log_level);
            worker_settings.log_tags = settings
                .log_tags
                .iter()
                .filter_map(|tag| parse_log_tag(tag))
                .collect();

            if let (Some(cert), Some(key)) = (
                &settings.dtls_certificate_file,
                &settings.dtls_private_key_file,
            ) {
                worker_settings.dtls_files = Some(WorkerDtlsFiles {
                    certificate: PathBuf::from(cert),
                    private_key: PathBuf::from(key),
                });
            }

            let worker = manager
                .create_worker(worker_settings)
                .await
                .map_err(|e| WorkerInitError::Spawn {
                    index,
                    message: e.to_string(),
                })?;

            let pid = worker.pid();
            worker
                .on_dead(move |reason| {
                    error!(?reason, worker_index = index, pid, "mediasoup worker died");
                })
                .detach();

            info!(worker_index = index, pid, "mediasoup worker started");

            slots.push(WorkerSlot {
                index,
                pid,
                worker,
                participant_count: AtomicUsize::new(0),
                room_count: AtomicUsize::new(0),
            });
        }

        Ok(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: u32) -> Option<&WorkerSlot> {
        self.slots.get(index as usize)
    }

    /// Recomputes `participant_count`/`room_count` for every slot from a
    /// scan of currently-live rooms. Slots with no rooms are zeroed.
    pub fn refresh_counters(&self, rooms: &[WorkerLoad]) {
        let mut totals = vec![(0usize, 0usize); self.slots.len()];
        for load in rooms {
            if let Some(entry) = totals.get_mut(load.worker_index as usize) {
                entry.0 += load.participant_count;
                entry.1 += 1;
            }
        }
        for (slot, (participants, room_count)) in self.slots.iter().zip(totals) {
            slot.participant_count.store(participants, Ordering::Relaxed);
            slot.room_count.store(room_count, Ordering::Relaxed);
        }
    }

    /// Picks the slot with the fewest participants, refreshing counters from
    /// `rooms` first so the choice can't drift from reality. Ties break
    /// toward the lowest index.
    pub fn pick_least_loaded(&self, rooms: &[WorkerLoad]) -> u32 {
        self.refresh_counters(rooms);
        pick_least_loaded_index(
            &self
                .slots
                .iter()
                .map(WorkerSlot::participant_count)
                .collect::<Vec<_>>(),
        ) as u32
    }

    /// Snapshot mapping `pid -> { worker_index, participant_count, room_count }`.
    pub fn stats(&self) -> Vec<(u32, WorkerLoad)> {
        self.slots
            .iter()
            .map(|slot| {
                (
                    slot.pid,
                    WorkerLoad {
                        worker_index: slot.index,
                        participant_count: slot.participant_count(),
                        room_count: slot.room_count(),
                    },
                )
            })
            .collect()
    }
}

/// Pure selection rule, factored out so it's testable without a real
/// mediasoup worker: smallest count wins, ties go to the lowest index.
fn pick_least_loaded_index(counts: &[usize]) -> usize {
    counts
        .iter()
        .enumerate()
        .min_by_key(|(index, count)| (**count, *index))
        .map(|(index, _)| index)
        .unwrap_or(0)
}

fn parse_log_level(level: &str) -> WorkerLogLevel {
    match level.to_ascii_lowercase().as_str() {
        "debug" => WorkerLogLevel::Debug,
        "warn" => WorkerLogLevel::Warn,
        "error" => WorkerLogLevel::Error,
        "none" => WorkerLogLevel::None,
        other => {
            warn!(level = other, "unknown worker log level, defaulting to warn");
            WorkerLogLevel::Warn
        }
    }
}

fn parse_log_tag(tag: &str) -> Option<WorkerLogTag> {
    match tag.to_ascii_lowercase().as_str() {
        "info" => Some(WorkerLogTag::Info),
        "ice" => Some(WorkerLogTag::Ice),
        "dtls" => Some(WorkerLogTag::Dtls),
        "rtp" => Some(WorkerLogTag::Rtp),
        "srtp" => Some(WorkerLogTag::Srtp),
        "rtcp" => Some(WorkerLogTag::Rtcp),
        "rtx" => Some(WorkerLogTag::Rtx),
        "bwe" => Some(WorkerLogTag::Bwe),
        "score" => Some(WorkerLogTag::Score),
        "simulcast" => Some(WorkerLogTag::Simulcast),
        "svc" => Some(WorkerLogTag::Svc),
        "sctp" => Some(WorkerLogTag::Sctp),
        other => {
            warn!(tag = other, "unknown worker log tag, ignoring");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_lowest_index_on_empty_pool() {
        assert_eq!(pick_least_loaded_index(&[0, 0, 0]), 0);
    }

    #[test]
    fn picks_least_loaded_by_participants() {
        assert_eq!(pick_least_loaded_index(&[5, 2, 9]), 1);
    }

    #[test]
    fn two_back_to_back_picks_on_empty_pool_land_on_indices_zero_and_one() {
        // Mirrors testable property #5: the first room on an empty pool
        // lands on worker 0; once that room's one participant is counted,
        // the next pick moves to worker 1.
        let first = pick_least_loaded_index(&[0, 0]);
        assert_eq!(first, 0);

        let mut counts = [0, 0];
        counts[first] += 1;
        let second = pick_least_loaded_index(&counts);
        assert_eq!(second, 1);
    }
}
