//! End-to-end orchestrator tests against in-process fake workers and the
//! real counter binary.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use lockstep::bridge::FrameCodec;
use lockstep::listener::{HandshakeError, ListenerError};
use lockstep::orchestrator::OrchestratorState;
use lockstep::{
    CommandSpawner, LaunchTemplate, LoopEvent, Orchestrator, OrchestratorConfig,
    OrchestratorError, SlotFailure, SpawnError, SpawnedWorker, StateFrame, Stimulus,
    TickHandler, WorkerConfig, WorkerError, WorkerSpawner, run_worker,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

fn fake_pid(index: usize) -> u32 {
    40_000 + index as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Echo,
    /// Drops the connection when it sees `reset == true`.
    CrashOnReset,
    /// Never answers a tick.
    Stall,
    /// Answers the first tick 300 ms late, later ones promptly.
    SlowStart,
}

struct FakeWorker {
    index: usize,
    behavior: Behavior,
}

impl FakeWorker {
    fn reply(&self, frame: &StateFrame) -> StateFrame {
        StateFrame::new()
            .with("worker", self.index as i64)
            .with("clock", frame.get_int("clock").unwrap_or(-1))
    }
}

#[async_trait::async_trait]
impl TickHandler for FakeWorker {
    async fn on_tick(&mut self, frame: &StateFrame) -> Result<StateFrame, WorkerError> {
        match self.behavior {
            Behavior::CrashOnReset if frame.get_bool("reset") == Some(true) => {
                Err(WorkerError::handler("simulated crash"))
            }
            Behavior::Stall => std::future::pending().await,
            Behavior::SlowStart if frame.get_int("clock") == Some(0) => {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(self.reply(frame))
            }
            _ => Ok(self.reply(frame)),
        }
    }
}

/// Runs each worker as a tokio task that handshakes with a fixed fake pid.
#[derive(Default)]
struct FakeSpawner {
    behaviors: Vec<Behavior>,
    delays: Vec<Duration>,
    fail_at: Option<usize>,
}

impl FakeSpawner {
    fn behaviors(mut self, behaviors: &[Behavior]) -> Self {
        self.behaviors = behaviors.to_vec();
        self
    }

    fn delays_ms(mut self, delays: &[u64]) -> Self {
        self.delays = delays.iter().map(|ms| Duration::from_millis(*ms)).collect();
        self
    }
}

impl WorkerSpawner for FakeSpawner {
    fn spawn(
        &self,
        index: usize,
        _launch: &LaunchTemplate,
        port: u16,
    ) -> Result<SpawnedWorker, SpawnError> {
        if self.fail_at == Some(index) {
            return Err(SpawnError::Other(format!("refusing to start worker {index}")));
        }
        let pid = fake_pid(index);
        let behavior = self.behaviors.get(index).copied().unwrap_or(Behavior::Echo);
        let delay = self.delays.get(index).copied().unwrap_or_default();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let worker = FakeWorker { index, behavior };
            let _ = run_worker(worker, WorkerConfig::new(port).with_pid(pid)).await;
        });
        Ok(SpawnedWorker { pid, child: None })
    }
}

fn config(workers: usize, spawner: impl WorkerSpawner + 'static) -> OrchestratorConfig {
    OrchestratorConfig::new(workers, LaunchTemplate::new("fake-worker"))
        .with_port(0)
        .with_handshake_timeout(Duration::from_secs(10))
        .with_reap_grace(Duration::from_millis(200))
        .with_spawner(Arc::new(spawner))
}

async fn ready(workers: usize, spawner: FakeSpawner) -> Orchestrator {
    let mut orchestrator = Orchestrator::new(config(workers, spawner));
    orchestrator.spawn().await.unwrap();
    orchestrator.wait_ready().await.unwrap();
    orchestrator
}

fn tick(clock: i64) -> StateFrame {
    StateFrame::new().with("clock", clock)
}

#[tokio::test]
async fn ready_once_all_bound_regardless_of_order() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let spawner = FakeSpawner::default().delays_ms(&[300, 100, 0, 200]);
        let mut orchestrator = Orchestrator::new(config(4, spawner));
        orchestrator.spawn().await.unwrap();
        assert_eq!(orchestrator.state(), OrchestratorState::Handshaking);
        assert_ne!(orchestrator.port(), 0);

        let mut bound = Vec::new();
        while !orchestrator.is_ready() {
            match orchestrator.step().await.unwrap() {
                LoopEvent::Accepted { .. } => {}
                LoopEvent::Bound { index, pid, .. } => {
                    assert_eq!(pid, fake_pid(index));
                    bound.push(index);
                    assert_eq!(orchestrator.is_ready(), bound.len() == 4);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }

        assert_eq!(bound, [2, 1, 3, 0]);
        assert_eq!(orchestrator.state(), OrchestratorState::Ready);
        for slot in orchestrator.registry().iter() {
            assert_eq!(slot.pid(), fake_pid(slot.index()));
            assert_ne!(slot.port(), 0);
        }

        // Slot index, not arrival order, addresses the worker.
        let result = orchestrator.on_tick(&tick(0)).await.unwrap();
        assert!(result.is_complete());
        for (index, frame) in &result.frames {
            assert_eq!(frame.get_int("worker"), Some(*index as i64));
            assert_eq!(frame.get_int("clock"), Some(0));
        }

        orchestrator.shutdown().await.unwrap();
        assert_eq!(orchestrator.state(), OrchestratorState::Done);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn disconnect_mid_tick_is_reported_and_unbound() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let spawner = FakeSpawner::default().behaviors(&[
            Behavior::Echo,
            Behavior::Echo,
            Behavior::CrashOnReset,
            Behavior::Echo,
        ]);
        let mut orchestrator = ready(4, spawner).await;

        let outbound = tick(1).with("reset", true);
        let result = orchestrator.on_tick(&outbound).await.unwrap();
        assert_eq!(result.cycle, 0);
        assert_eq!(result.frames.keys().copied().collect::<Vec<_>>(), [0, 1, 3]);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures.get(&2), Some(&SlotFailure::Disconnected));
        assert!(result.is_partial());
        assert!(!orchestrator.registry().slot(2).unwrap().is_bound());
        assert_eq!(orchestrator.registry().bound_count(), 3);

        // The slot stays unbound and keeps being reported.
        let result = orchestrator.on_tick(&tick(2)).await.unwrap();
        assert_eq!(result.cycle, 1);
        assert_eq!(result.frames.len(), 3);
        assert_eq!(result.failures.get(&2), Some(&SlotFailure::Unbound));

        orchestrator.shutdown().await.unwrap();
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn accept_then_close_binds_nothing() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let spawner = FakeSpawner::default().delays_ms(&[500]);
        let mut orchestrator = Orchestrator::new(config(1, spawner));
        orchestrator.spawn().await.unwrap();

        let stray = TcpStream::connect(("127.0.0.1", orchestrator.port()))
            .await
            .unwrap();
        assert!(matches!(
            orchestrator.step().await.unwrap(),
            LoopEvent::Accepted { .. }
        ));
        drop(stray);
        assert!(matches!(
            orchestrator.step().await.unwrap(),
            LoopEvent::HandshakeRejected {
                error: HandshakeError::Disconnected,
                ..
            }
        ));
        assert_eq!(orchestrator.registry().bound_count(), 0);
        assert!(!orchestrator.registry().all_bound());
        assert!(!orchestrator.is_ready());

        orchestrator.wait_ready().await.unwrap();
        assert_eq!(orchestrator.registry().slot(0).unwrap().pid(), fake_pid(0));
        orchestrator.shutdown().await.unwrap();
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn bad_handshakes_are_rejected_without_side_effects() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let spawner = FakeSpawner::default().delays_ms(&[500]);
        let mut orchestrator = Orchestrator::new(config(1, spawner));
        orchestrator.spawn().await.unwrap();
        let port = orchestrator.port();

        // Unknown pid.
        let mut impostor = Framed::new(
            TcpStream::connect(("127.0.0.1", port)).await.unwrap(),
            FrameCodec::new(),
        );
        impostor.send(StateFrame::new().with("pid", 1)).await.unwrap();
        assert!(matches!(
            orchestrator.step().await.unwrap(),
            LoopEvent::Accepted { .. }
        ));
        assert!(matches!(
            orchestrator.step().await.unwrap(),
            LoopEvent::HandshakeRejected {
                error: HandshakeError::UnknownWorkerIdentity { pid: 1 },
                ..
            }
        ));
        // Rejected connections are closed.
        assert!(impostor.next().await.is_none());

        // Not a handshake at all.
        let mut confused = Framed::new(
            TcpStream::connect(("127.0.0.1", port)).await.unwrap(),
            FrameCodec::new(),
        );
        confused.send(tick(0)).await.unwrap();
        orchestrator.step().await.unwrap();
        assert!(matches!(
            orchestrator.step().await.unwrap(),
            LoopEvent::HandshakeRejected {
                error: HandshakeError::Protocol(_),
                ..
            }
        ));

        assert_eq!(orchestrator.registry().bound_count(), 0);
        orchestrator.wait_ready().await.unwrap();
        orchestrator.shutdown().await.unwrap();
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn connections_after_ready_are_closed() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let mut orchestrator = ready(2, FakeSpawner::default()).await;

        let mut late = Framed::new(
            TcpStream::connect(("127.0.0.1", orchestrator.port()))
                .await
                .unwrap(),
            FrameCodec::new(),
        );
        late.send(StateFrame::new().with("pid", fake_pid(0)))
            .await
            .unwrap();
        assert!(matches!(
            orchestrator.step().await.unwrap(),
            LoopEvent::Refused { .. }
        ));
        // Closed before its bytes were read, so the peer may see a reset.
        assert!(!matches!(late.next().await, Some(Ok(_))));

        let result = orchestrator.on_tick(&tick(0)).await.unwrap();
        assert!(result.is_complete());
        assert_eq!(result.frames.len(), 2);
        orchestrator.shutdown().await.unwrap();
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn silent_worker_times_out_but_stays_bound() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let spawner = FakeSpawner::default().behaviors(&[Behavior::Echo, Behavior::Stall]);
        let mut orchestrator = Orchestrator::new(
            config(2, spawner).with_tick_timeout(Duration::from_millis(200)),
        );
        orchestrator.spawn().await.unwrap();
        orchestrator.wait_ready().await.unwrap();

        let result = orchestrator.on_tick(&tick(0)).await.unwrap();
        assert!(result.frame(0).is_some());
        assert_eq!(result.failures.get(&1), Some(&SlotFailure::TimedOut));
        assert!(orchestrator.registry().slot(1).unwrap().is_bound());
        orchestrator.shutdown().await.unwrap();
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn late_reply_is_not_credited_to_the_next_tick() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let spawner = FakeSpawner::default().behaviors(&[Behavior::Echo, Behavior::SlowStart]);
        let mut orchestrator = Orchestrator::new(
            config(2, spawner).with_tick_timeout(Duration::from_millis(200)),
        );
        orchestrator.spawn().await.unwrap();
        orchestrator.wait_ready().await.unwrap();

        let first = orchestrator.on_tick(&tick(0)).await.unwrap();
        assert_eq!(first.failures.get(&1), Some(&SlotFailure::TimedOut));
        assert_eq!(orchestrator.owed_replies(1), 1);

        // The tick-0 reply lands during this tick and must be skipped.
        let second = orchestrator.on_tick(&tick(1)).await.unwrap();
        assert!(second.is_complete(), "{:?}", second.failures);
        assert_eq!(second.frames.len(), 2);
        for (index, frame) in &second.frames {
            assert_eq!(frame.get_int("clock"), Some(1), "slot {index}");
        }
        assert_eq!(orchestrator.owed_replies(1), 0);

        orchestrator.shutdown().await.unwrap();
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn tick_before_ready_is_not_ready() {
    let spawner = FakeSpawner::default().delays_ms(&[60_000]);
    let mut orchestrator = Orchestrator::new(config(1, spawner));
    orchestrator.spawn().await.unwrap();

    let err = orchestrator.on_tick(&tick(0)).await.unwrap_err();
    assert!(
        matches!(
            err,
            OrchestratorError::NotReady {
                state: OrchestratorState::Handshaking
            }
        ),
        "{err}"
    );
    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn handshake_timeout_reports_progress() {
    let spawner = FakeSpawner::default().delays_ms(&[0, 60_000]);
    let mut orchestrator = Orchestrator::new(
        config(2, spawner).with_handshake_timeout(Duration::from_millis(500)),
    );
    orchestrator.spawn().await.unwrap();

    let err = orchestrator.wait_ready().await.unwrap_err();
    assert!(
        matches!(
            err,
            OrchestratorError::HandshakeTimeout {
                bound: 1,
                expected: 2
            }
        ),
        "{err}"
    );
    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_signal_interrupts_wait() {
    let spawner = FakeSpawner::default().delays_ms(&[60_000]);
    let mut orchestrator = Orchestrator::new(config(1, spawner));
    orchestrator.spawn().await.unwrap();

    let handle = orchestrator.shutdown_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown();
    });

    let err = orchestrator.wait_ready().await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Interrupted), "{err}");
    orchestrator.shutdown().await.unwrap();
    assert_eq!(orchestrator.state(), OrchestratorState::Done);
}

#[tokio::test]
async fn busy_port_is_a_bind_failure() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let mut orchestrator =
        Orchestrator::new(config(2, FakeSpawner::default()).with_port(port));
    let err = orchestrator.spawn().await.unwrap_err();
    assert!(
        matches!(err, OrchestratorError::Listener(ListenerError::Bind { .. })),
        "{err}"
    );
    assert!(orchestrator.handles().is_empty());
}

#[tokio::test]
async fn spawn_failure_is_all_or_nothing() {
    let spawner = FakeSpawner {
        fail_at: Some(2),
        ..FakeSpawner::default()
    };
    let mut orchestrator = Orchestrator::new(config(4, spawner));
    let err = orchestrator.spawn().await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Spawn(_)), "{err}");
    assert!(orchestrator.handles().is_empty());
    assert_eq!(orchestrator.state(), OrchestratorState::Done);
}

/// Starts real `sleep` processes, failing on one index.
#[cfg(unix)]
struct FlakySpawner {
    fail_at: usize,
    started: Mutex<Vec<u32>>,
}

#[cfg(unix)]
impl WorkerSpawner for FlakySpawner {
    fn spawn(
        &self,
        index: usize,
        launch: &LaunchTemplate,
        port: u16,
    ) -> Result<SpawnedWorker, SpawnError> {
        if index == self.fail_at {
            return Err(SpawnError::Other("out of process slots".to_string()));
        }
        let spawned = CommandSpawner.spawn(index, launch, port)?;
        self.started.lock().unwrap().push(spawned.pid);
        Ok(spawned)
    }
}

#[cfg(unix)]
#[tokio::test]
async fn spawn_failure_reaps_started_processes() {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let spawner = Arc::new(FlakySpawner {
        fail_at: 2,
        started: Mutex::new(Vec::new()),
    });
    let config = OrchestratorConfig::new(4, LaunchTemplate::new("sleep").with_args(["30"]))
        .with_port(0)
        .with_reap_grace(Duration::from_secs(2))
        .with_spawner(spawner.clone());
    let mut orchestrator = Orchestrator::new(config);

    assert!(matches!(
        orchestrator.spawn().await,
        Err(OrchestratorError::Spawn(SpawnError::Other(_)))
    ));
    let started = spawner.started.lock().unwrap().clone();
    assert_eq!(started.len(), 2);
    for pid in started {
        assert!(
            kill(Pid::from_raw(pid as i32), None).is_err(),
            "pid {pid} still running"
        );
    }
}

#[tokio::test]
async fn counter_binary_runs_reference_stimulus() {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let launch = LaunchTemplate::new(env!("CARGO_BIN_EXE_lockstep-counter"));
        let config = OrchestratorConfig::new(2, launch)
            .with_port(0)
            .with_handshake_timeout(Duration::from_secs(10))
            .with_tick_timeout(Duration::from_secs(5));
        let mut orchestrator = Orchestrator::new(config);
        orchestrator.spawn().await.unwrap();
        orchestrator.wait_ready().await.unwrap();

        let stimulus = Stimulus::reference();
        let mut outputs = Vec::new();
        for outbound in stimulus.frames(53) {
            let result = orchestrator.on_tick(&outbound).await.unwrap();
            assert!(result.is_complete(), "cycle {}: {:?}", result.cycle, result.failures);
            let values: Vec<i64> = result
                .frames
                .values()
                .map(|f| f.get_int("counter_out").unwrap())
                .collect();
            assert!(values.windows(2).all(|w| w[0] == w[1]));
            outputs.push(values[0]);
        }

        // Held at zero through the reset pulse, counting from cycle 12.
        assert!(outputs[..12].iter().all(|v| *v == 0));
        assert_eq!(outputs[12], 1);
        assert_eq!(outputs[20], 9);
        assert_eq!(outputs[27], 0);
        assert_eq!(outputs[49], 6);
        assert_eq!(outputs[52], 6);

        orchestrator.shutdown().await.unwrap();
    })
    .await
    .unwrap();
}
