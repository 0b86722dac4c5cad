//! Fleet supervisor: keeps one pipeline running per scannable station.
//!
//! Each station id is either absent or running. A registry poll spawns a
//! pipeline for every scannable station without one, and cancels pipelines
//! whose station disappeared, was disabled, or changed camera URI. Whatever
//! way a pipeline task ends, its entry is removed and the station becomes
//! eligible again on the next poll.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::registry::{CameraSource, StationId, StationRegistry};

/// Runs one station's pipeline until `cancel` fires or it fails.
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    async fn run(&self, station: CameraSource, cancel: CancellationToken) -> Result<()>;
}

struct PipelineHandle {
    uri: String,
    cancel: CancellationToken,
}

pub struct FleetSupervisor {
    registry: Arc<dyn StationRegistry>,
    runner: Arc<dyn PipelineRunner>,
    handles: Arc<Mutex<HashMap<StationId, PipelineHandle>>>,
    poll_interval: Duration,
}

impl FleetSupervisor {
    pub fn new(
        registry: Arc<dyn StationRegistry>,
        runner: Arc<dyn PipelineRunner>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            registry,
            runner,
            handles: Arc::new(Mutex::new(HashMap::new())),
            poll_interval,
        }
    }

    /// Poll the registry every `poll_interval` until `cancel` fires. Pipelines
    /// run under child tokens of `cancel`, so they stop with it.
    pub async fn run(&self, cancel: &CancellationToken) {
        log::info!(
            "supervisor started (registry poll every {:?})",
            self.poll_interval
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.reconcile(cancel) => polled,
            };
            match polled {
                Ok(0) => {}
                Ok(spawned) => log::info!(
                    "started {} pipeline(s); {} active",
                    spawned,
                    self.active_count()
                ),
                Err(e) => log::error!("registry poll failed: {:#}", e),
            }
        }
        log::info!("supervisor stopping");
    }

    /// One registry poll. Returns how many pipelines were started.
    pub async fn reconcile(&self, cancel: &CancellationToken) -> Result<usize> {
        let registry = self.registry.clone();
        let stations = tokio::task::spawn_blocking(move || registry.load_stations())
            .await
            .map_err(|e| anyhow!("registry poll task failed: {}", e))?
            .context("failed to load stations")?;

        let wanted: BTreeMap<StationId, CameraSource> = stations
            .into_iter()
            .filter(CameraSource::is_scannable)
            .map(|s| (s.station_id, s))
            .collect();

        let mut handles = self.lock_handles();
        for (id, handle) in handles.iter() {
            if handle.cancel.is_cancelled() {
                continue;
            }
            match wanted.get(id) {
                None => {
                    log::info!("station {} removed or disabled; stopping its pipeline", id);
                    handle.cancel.cancel();
                }
                Some(station) if station.uri != handle.uri => {
                    log::info!(
                        "[{}] camera URI changed; restarting pipeline",
                        station.station_name
                    );
                    handle.cancel.cancel();
                }
                Some(_) => {}
            }
        }

        let mut spawned = 0;
        for (id, station) in wanted {
            if let Entry::Vacant(slot) = handles.entry(id) {
                let token = cancel.child_token();
                slot.insert(PipelineHandle {
                    uri: station.uri.clone(),
                    cancel: token.clone(),
                });
                self.spawn_pipeline(station, token);
                spawned += 1;
            }
        }
        Ok(spawned)
    }

    /// Called with the handle map locked; the task's own removal waits for
    /// the lock, so it always runs after the insert.
    fn spawn_pipeline(&self, station: CameraSource, cancel: CancellationToken) {
        let runner = self.runner.clone();
        let handles = self.handles.clone();
        let id = station.station_id;
        let name = station.station_name.clone();
        log::info!("[{}] starting pipeline ({})", name, station.uri);

        tokio::spawn(async move {
            // Inner task so a panic is observed as a JoinError.
            let run = tokio::spawn(async move { runner.run(station, cancel).await });
            match run.await {
                Ok(Ok(())) => log::info!("[{}] pipeline stopped", name),
                Ok(Err(e)) => log::error!("[{}] pipeline failed: {:#}", name, e),
                Err(e) => log::error!("[{}] pipeline crashed: {}", name, e),
            }
            handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
        });
    }

    /// Ids of stations that currently have a pipeline, ascending.
    pub fn active_stations(&self) -> Vec<StationId> {
        let mut ids: Vec<_> = self.lock_handles().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn active_count(&self) -> usize {
        self.lock_handles().len()
    }

    /// Cancel every pipeline and wait up to `timeout` for them to exit.
    /// Returns true if all stopped in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        for handle in self.lock_handles().values() {
            handle.cancel.cancel();
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = self.active_count();
            if remaining == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                log::warn!("{} pipeline(s) still running at shutdown", remaining);
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn lock_handles(&self) -> MutexGuard<'_, HashMap<StationId, PipelineHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StaticRegistry;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Records every run; either waits for cancellation or exits right away.
    #[derive(Default)]
    struct FakeRunner {
        runs: Mutex<Vec<CameraSource>>,
        cancelled: Mutex<Vec<StationId>>,
        exit_immediately: AtomicBool,
        panic_on_run: AtomicBool,
    }

    impl FakeRunner {
        fn runs_for(&self, id: StationId) -> usize {
            self.runs
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.station_id == id)
                .count()
        }
    }

    #[async_trait]
    impl PipelineRunner for FakeRunner {
        async fn run(&self, station: CameraSource, cancel: CancellationToken) -> Result<()> {
            self.runs.lock().unwrap().push(station.clone());
            if self.panic_on_run.load(Ordering::SeqCst) {
                panic!("pipeline bug");
            }
            if self.exit_immediately.load(Ordering::SeqCst) {
                return Err(anyhow!("camera gone"));
            }
            cancel.cancelled().await;
            self.cancelled.lock().unwrap().push(station.station_id);
            Ok(())
        }
    }

    fn station(id: StationId, uri: &str) -> CameraSource {
        CameraSource {
            station_id: id,
            station_name: format!("Station {}", id),
            uri: uri.to_string(),
            enabled: true,
        }
    }

    fn supervisor(
        stations: Vec<CameraSource>,
    ) -> (FleetSupervisor, Arc<StaticRegistry>, Arc<FakeRunner>) {
        let registry = Arc::new(StaticRegistry::new(stations));
        let runner = Arc::new(FakeRunner::default());
        let supervisor =
            FleetSupervisor::new(registry.clone(), runner.clone(), Duration::from_secs(10));
        (supervisor, registry, runner)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn station_seen_twice_is_spawned_once() {
        let (supervisor, _registry, runner) = supervisor(vec![station(1, "stub://a")]);
        let cancel = CancellationToken::new();

        assert_eq!(supervisor.reconcile(&cancel).await.unwrap(), 1);
        assert_eq!(supervisor.reconcile(&cancel).await.unwrap(), 0);
        wait_until(|| runner.runs_for(1) == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runner.runs_for(1), 1);
        assert_eq!(supervisor.active_stations(), vec![1]);

        assert!(supervisor.shutdown(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn terminated_pipeline_is_respawned_on_next_poll() {
        let (supervisor, _registry, runner) = supervisor(vec![station(7, "stub://a")]);
        runner.exit_immediately.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();

        supervisor.reconcile(&cancel).await.unwrap();
        wait_until(|| runner.runs_for(7) == 1 && supervisor.active_count() == 0).await;

        runner.exit_immediately.store(false, Ordering::SeqCst);
        assert_eq!(supervisor.reconcile(&cancel).await.unwrap(), 1);
        wait_until(|| runner.runs_for(7) == 2).await;
        assert_eq!(supervisor.active_stations(), vec![7]);

        cancel.cancel();
        wait_until(|| supervisor.active_count() == 0).await;
    }

    #[tokio::test]
    async fn panicking_pipeline_frees_its_slot() {
        let (supervisor, _registry, runner) = supervisor(vec![station(3, "stub://a")]);
        runner.panic_on_run.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();

        supervisor.reconcile(&cancel).await.unwrap();
        wait_until(|| runner.runs_for(3) == 1 && supervisor.active_count() == 0).await;
    }

    #[tokio::test]
    async fn removed_or_disabled_station_is_cancelled() {
        let (supervisor, registry, runner) =
            supervisor(vec![station(1, "stub://a"), station(2, "stub://b")]);
        let cancel = CancellationToken::new();

        assert_eq!(supervisor.reconcile(&cancel).await.unwrap(), 2);
        wait_until(|| runner.runs.lock().unwrap().len() == 2).await;

        let mut disabled = station(2, "stub://b");
        disabled.enabled = false;
        registry.replace(vec![disabled]);
        supervisor.reconcile(&cancel).await.unwrap();

        wait_until(|| supervisor.active_count() == 0).await;
        let mut cancelled = runner.cancelled.lock().unwrap().clone();
        cancelled.sort_unstable();
        assert_eq!(cancelled, vec![1, 2]);
    }

    #[tokio::test]
    async fn changed_uri_restarts_pipeline() {
        let (supervisor, registry, runner) = supervisor(vec![station(4, "stub://old")]);
        let cancel = CancellationToken::new();
        supervisor.reconcile(&cancel).await.unwrap();
        wait_until(|| runner.runs_for(4) == 1).await;

        registry.replace(vec![station(4, "stub://new")]);
        supervisor.reconcile(&cancel).await.unwrap();
        wait_until(|| supervisor.active_count() == 0).await;

        supervisor.reconcile(&cancel).await.unwrap();
        wait_until(|| runner.runs_for(4) == 2).await;
        let runs = runner.runs.lock().unwrap();
        assert_eq!(runs.last().unwrap().uri, "stub://new");
        drop(runs);

        assert!(supervisor.shutdown(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn run_polls_until_cancelled() {
        let registry = Arc::new(StaticRegistry::new(vec![station(9, "stub://a")]));
        let runner = Arc::new(FakeRunner::default());
        let supervisor = Arc::new(FleetSupervisor::new(
            registry,
            runner.clone(),
            Duration::from_millis(10),
        ));
        let cancel = CancellationToken::new();

        let task = {
            let (supervisor, cancel) = (supervisor.clone(), cancel.clone());
            tokio::spawn(async move { supervisor.run(&cancel).await })
        };
        wait_until(|| runner.runs_for(9) == 1).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("supervisor exits on cancel")
            .unwrap();
        wait_until(|| supervisor.active_count() == 0).await;
        assert_eq!(runner.runs_for(9), 1);
    }

    /// Registry whose poll blocks until released.
    struct StalledRegistry {
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl StationRegistry for StalledRegistry {
        fn load_stations(&self) -> Result<Vec<CameraSource>> {
            let release = self.release.lock().unwrap();
            let _ = release.recv_timeout(Duration::from_secs(10));
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn cancel_interrupts_a_stalled_registry_poll() {
        let (release, stalled) = std::sync::mpsc::channel();
        let registry = Arc::new(StalledRegistry {
            release: Mutex::new(stalled),
        });
        let supervisor = Arc::new(FleetSupervisor::new(
            registry,
            Arc::new(FakeRunner::default()),
            Duration::from_millis(10),
        ));
        let cancel = CancellationToken::new();

        let task = {
            let (supervisor, cancel) = (supervisor.clone(), cancel.clone());
            tokio::spawn(async move { supervisor.run(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        let stopped = tokio::time::timeout(Duration::from_secs(1), task).await;
        // Unblock the poll thread so the runtime can shut down.
        let _ = release.send(());
        stopped.expect("supervisor exits during a poll").unwrap();
    }
}
