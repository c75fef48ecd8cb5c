use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;
use tsflash_core::cancel::CancelToken;
use tsflash_core::classify::BROADCOM_VID;
use tsflash_core::device::{CLASS_MASS_STORAGE, DeviceDescriptor, PortPath};
use tsflash_core::events::{Event, EventStream};
use tsflash_core::image::SourceImage;
use tsflash_core::machine::{FailReason, Phase, Timings};
use tsflash_core::orchestrator::{Orchestrator, OrchestratorConfig, ShutdownPolicy};
use tsflash_core::rpiboot::{BootError, BootHandoff};
use tsflash_core::topology::{RootSelector, Topology, TopologyError, TopologySource};
use tsflash_core::write::{FlashOptions, Stage};

const BLOCK: usize = 4096;
const WAIT: Duration = Duration::from_secs(30);

fn port(s: &str) -> PortPath {
    s.parse().unwrap()
}

/// A hub on 1-1 with four ports; tests plug devices in and out.
#[derive(Clone)]
struct FakeHub(Arc<Mutex<Topology>>);

impl FakeHub {
    fn new() -> Self {
        let mut t = Topology::new();
        let mut hub = DeviceDescriptor::new(port("1-1"), 0x2109, 0x2813);
        hub.child_ports = 4;
        t.insert(port("1-1"), Some(hub));
        for n in 1..=4 {
            t.insert(port(&format!("1-1.{n}")), None);
        }
        Self(Arc::new(Mutex::new(t)))
    }

    fn plug(&self, device: DeviceDescriptor) {
        self.0.lock().unwrap().insert(device.port.clone(), Some(device));
    }

    fn unplug(&self, p: &PortPath) {
        self.0.lock().unwrap().insert(p.clone(), None);
    }
}

impl TopologySource for FakeHub {
    fn snapshot(&self) -> Result<Topology, TopologyError> {
        Ok(self.0.lock().unwrap().clone())
    }
}

/// Pretends to boot a ROM; optionally swaps it for a storage device shortly
/// afterwards, the way a real compute module re-enumerates.
#[derive(Clone)]
struct FakeBoot {
    hub: FakeHub,
    reenumerate_as: Option<PathBuf>,
}

impl BootHandoff for FakeBoot {
    async fn bootstrap(&self, port: &PortPath) -> Result<(), BootError> {
        if let Some(target) = &self.reenumerate_as {
            let hub = self.hub.clone();
            let device = storage(port, target);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                hub.plug(device);
            });
        }
        Ok(())
    }
}

fn storage(p: &PortPath, target: &Path) -> DeviceDescriptor {
    let mut d = DeviceDescriptor::new(p.clone(), 0x0bda, 0x0158);
    d.interface_classes = vec![CLASS_MASS_STORAGE];
    d.block_device = Some(target.to_path_buf());
    d
}

fn boot_rom(p: &PortPath) -> DeviceDescriptor {
    DeviceDescriptor::new(p.clone(), BROADCOM_VID, 0x2711)
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        root: RootSelector::FirstHub,
        poll_interval: Duration::from_millis(10),
        timings: Timings {
            stable_delay: Duration::from_millis(30),
            reenum_timeout: Duration::from_millis(200),
            cooldown: Duration::from_millis(20),
        },
        flash: FlashOptions {
            block_size: BLOCK,
            verify: true,
            length: None,
        },
        parallelism: Some(2),
        shutdown: ShutdownPolicy::Drain,
        event_capacity: 1 << 16,
    }
}

struct Fixture {
    dir: TempDir,
    image: Arc<SourceImage>,
    data: Vec<u8>,
}

impl Fixture {
    fn new(image_len: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..image_len).map(|i| (i % 251) as u8).collect();
        let path = dir.path().join("os.img");
        std::fs::write(&path, &data).unwrap();
        let image = Arc::new(SourceImage::open(&path).unwrap());
        Self { dir, image, data }
    }

    fn card(&self, name: &str, len: usize) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, vec![0u8; len]).unwrap();
        path
    }
}

async fn next_event(events: &mut EventStream) -> Event {
    timeout(WAIT, events.next())
        .await
        .expect("timed out waiting for an event")
        .expect("event bus closed")
        .event
}

#[tokio::test]
async fn two_ready_ports_flash_concurrently() {
    let fx = Fixture::new(2048 * BLOCK);
    let cards = [fx.card("sda", 4096 * BLOCK), fx.card("sdb", 4096 * BLOCK)];
    let hub = FakeHub::new();
    hub.plug(storage(&port("1-1.1"), &cards[0]));
    hub.plug(storage(&port("1-1.2"), &cards[1]));

    let boot = FakeBoot {
        hub: hub.clone(),
        reenumerate_as: None,
    };
    let orchestrator = Orchestrator::new(config(), hub, boot, fx.image.clone());
    let mut events = orchestrator.events();
    let shutdown = CancelToken::new();
    let run = tokio::spawn(orchestrator.run(shutdown.clone()));

    let mut flashing = BTreeSet::new();
    let mut max_concurrent = 0;
    let mut progress: BTreeMap<PortPath, Vec<u64>> = BTreeMap::new();
    let mut completed = BTreeSet::new();
    while completed.len() < 2 {
        match next_event(&mut events).await {
            Event::PhaseChanged { port, to: Phase::Flashing, .. } => {
                flashing.insert(port);
                max_concurrent = max_concurrent.max(flashing.len());
            }
            Event::PhaseChanged { port, from: Phase::Flashing, .. } => {
                flashing.remove(&port);
            }
            Event::Progress { port, stage: Stage::Writing, bytes, .. } => {
                progress.entry(port).or_default().push(bytes);
            }
            Event::Completed { port, report } => {
                assert_eq!(report.bytes_written, fx.data.len() as u64);
                assert!(report.sha256.is_some());
                completed.insert(port);
            }
            Event::Failed { port, reason } => panic!("{port} failed: {reason}"),
            _ => {}
        }
    }

    assert_eq!(max_concurrent, 2);
    assert_eq!(progress.len(), 2);
    for bytes in progress.values() {
        assert!(bytes.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*bytes.last().unwrap(), fx.data.len() as u64);
    }
    for card in &cards {
        let written = std::fs::read(card).unwrap();
        assert_eq!(&written[..fx.data.len()], &fx.data[..]);
    }

    shutdown.cancel();
    let summary = timeout(WAIT, run).await.unwrap().unwrap();
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.ports[&port("1-1.1")].phase, Phase::Completed);
    assert_eq!(summary.ports[&port("1-1.2")].attempts, 1);
}

#[tokio::test]
async fn boot_rom_is_handed_off_and_flashed_after_reenumeration() {
    let fx = Fixture::new(16 * BLOCK);
    let card = fx.card("mmcblk0", 32 * BLOCK);
    let hub = FakeHub::new();
    hub.plug(boot_rom(&port("1-1.3")));

    let boot = FakeBoot {
        hub: hub.clone(),
        reenumerate_as: Some(card.clone()),
    };
    let orchestrator = Orchestrator::new(config(), hub, boot, fx.image.clone());
    let mut events = orchestrator.events();
    let shutdown = CancelToken::new();
    let run = tokio::spawn(orchestrator.run(shutdown.clone()));

    let mut phases = Vec::new();
    loop {
        match next_event(&mut events).await {
            Event::PhaseChanged { to, .. } => phases.push(to),
            Event::Completed { port: p, .. } => {
                assert_eq!(p, port("1-1.3"));
                break;
            }
            Event::Failed { port, reason } => panic!("{port} failed: {reason}"),
            _ => {}
        }
    }
    let boot_at = phases.iter().position(|p| *p == Phase::BootHandoff).unwrap();
    let flash_at = phases.iter().position(|p| *p == Phase::Flashing).unwrap();
    assert!(boot_at < flash_at);
    assert!(phases[boot_at..flash_at].contains(&Phase::AwaitingReenum));
    assert_eq!(&std::fs::read(&card).unwrap()[..fx.data.len()], &fx.data[..]);

    shutdown.cancel();
    let summary = timeout(WAIT, run).await.unwrap().unwrap();
    assert_eq!(summary.completed, 1);
}

#[tokio::test]
async fn missing_reenumeration_fails_with_timeout() {
    let fx = Fixture::new(BLOCK);
    let hub = FakeHub::new();
    hub.plug(boot_rom(&port("1-1.4")));

    let boot = FakeBoot {
        hub: hub.clone(),
        reenumerate_as: None,
    };
    let orchestrator = Orchestrator::new(config(), hub, boot, fx.image.clone());
    let mut events = orchestrator.events();
    let shutdown = CancelToken::new();
    let run = tokio::spawn(orchestrator.run(shutdown.clone()));

    loop {
        if let Event::Failed { port: p, reason } = next_event(&mut events).await {
            assert_eq!(p, port("1-1.4"));
            assert_eq!(reason, FailReason::ReenumTimeout);
            break;
        }
    }

    shutdown.cancel();
    let summary = timeout(WAIT, run).await.unwrap().unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.completed, 0);
    assert_eq!(
        summary.ports[&port("1-1.4")].last_error,
        Some(FailReason::ReenumTimeout)
    );
}

#[tokio::test]
async fn short_lived_attach_never_reaches_classification() {
    let fx = Fixture::new(BLOCK);
    let card = fx.card("sdc", 2 * BLOCK);
    let hub = FakeHub::new();
    let mut cfg = config();
    cfg.timings.stable_delay = Duration::from_millis(500);

    let boot = FakeBoot {
        hub: hub.clone(),
        reenumerate_as: None,
    };
    let orchestrator = Orchestrator::new(cfg, hub.clone(), boot, fx.image.clone());
    let mut events = orchestrator.events();
    let shutdown = CancelToken::new();
    let run = tokio::spawn(orchestrator.run(shutdown.clone()));

    hub.plug(storage(&port("1-1.2"), &card));
    let mut phases = Vec::new();
    loop {
        match next_event(&mut events).await {
            Event::PhaseChanged { to: Phase::Settling, .. } => {
                phases.push(Phase::Settling);
                hub.unplug(&port("1-1.2"));
            }
            Event::PhaseChanged { to, .. } => {
                phases.push(to);
                break;
            }
            _ => {}
        }
    }
    assert_eq!(phases, vec![Phase::Settling, Phase::Idle]);

    shutdown.cancel();
    let summary = timeout(WAIT, run).await.unwrap().unwrap();
    assert_eq!(summary.completed + summary.failed, 0);
    assert!(std::fs::read(&card).unwrap().iter().all(|&b| b == 0));
}

#[tokio::test]
async fn card_too_small_is_reported_and_left_untouched() {
    let fx = Fixture::new(8 * BLOCK);
    let card = fx.card("sdd", 4 * BLOCK);
    let hub = FakeHub::new();
    hub.plug(storage(&port("1-1.1"), &card));

    let boot = FakeBoot {
        hub: hub.clone(),
        reenumerate_as: None,
    };
    let orchestrator = Orchestrator::new(config(), hub, boot, fx.image.clone());
    let mut events = orchestrator.events();
    let shutdown = CancelToken::new();
    let run = tokio::spawn(orchestrator.run(shutdown.clone()));

    loop {
        if let Event::Failed { reason, .. } = next_event(&mut events).await {
            assert_eq!(reason, FailReason::TargetTooSmall);
            break;
        }
    }
    assert!(std::fs::read(&card).unwrap().iter().all(|&b| b == 0));

    shutdown.cancel();
    let summary = timeout(WAIT, run).await.unwrap().unwrap();
    assert_eq!(summary.failed, 1);
}

#[tokio::test]
async fn single_slot_pool_queues_the_second_card() {
    let fx = Fixture::new(1024 * BLOCK);
    let cards = [fx.card("sde", 2048 * BLOCK), fx.card("sdf", 2048 * BLOCK)];
    let hub = FakeHub::new();
    hub.plug(storage(&port("1-1.1"), &cards[0]));
    hub.plug(storage(&port("1-1.2"), &cards[1]));
    let mut cfg = config();
    cfg.parallelism = Some(1);

    let boot = FakeBoot {
        hub: hub.clone(),
        reenumerate_as: None,
    };
    let orchestrator = Orchestrator::new(cfg, hub, boot, fx.image.clone());
    let mut events = orchestrator.events();
    let shutdown = CancelToken::new();
    let run = tokio::spawn(orchestrator.run(shutdown.clone()));

    let mut phases: BTreeMap<PortPath, Phase> = BTreeMap::new();
    let mut order = Vec::new();
    let mut completed = 0;
    while completed < 2 {
        match next_event(&mut events).await {
            Event::PhaseChanged { port, from, to } => {
                if to == Phase::Flashing {
                    let others = phases
                        .iter()
                        .filter(|(p, phase)| **p != port && **phase == Phase::Flashing)
                        .count();
                    assert_eq!(others, 0, "{port} started while another card was flashing");
                    order.push(port.clone());
                }
                if from == Phase::Flashing && order.len() == 1 {
                    // The first card is done; the second has been waiting.
                    let waiting = phases
                        .iter()
                        .find(|(p, _)| **p != port)
                        .map(|(_, phase)| phase.clone());
                    assert_eq!(waiting, Some(Phase::Dispatchable));
                }
                phases.insert(port, to);
            }
            Event::Completed { .. } => completed += 1,
            Event::Failed { port, reason } => panic!("{port} failed: {reason}"),
            _ => {}
        }
    }
    assert_eq!(order.len(), 2);
    assert_ne!(order[0], order[1]);
    for card in &cards {
        assert_eq!(&std::fs::read(card).unwrap()[..fx.data.len()], &fx.data[..]);
    }

    shutdown.cancel();
    let summary = timeout(WAIT, run).await.unwrap().unwrap();
    assert_eq!(summary.completed, 2);
}

#[tokio::test]
async fn cancel_policy_stops_running_flashes() {
    let fx = Fixture::new(8192 * BLOCK);
    let card = fx.card("sdg", 8192 * BLOCK);
    let hub = FakeHub::new();
    hub.plug(storage(&port("1-1.4"), &card));
    let mut cfg = config();
    cfg.shutdown = ShutdownPolicy::Cancel;
    cfg.flash.block_size = 512;

    let boot = FakeBoot {
        hub: hub.clone(),
        reenumerate_as: None,
    };
    let orchestrator = Orchestrator::new(cfg, hub, boot, fx.image.clone());
    let mut events = orchestrator.events();
    let shutdown = CancelToken::new();
    let run = tokio::spawn(orchestrator.run(shutdown.clone()));

    loop {
        if let Event::PhaseChanged { to: Phase::Flashing, .. } = next_event(&mut events).await {
            break;
        }
    }
    shutdown.cancel();
    let summary = timeout(WAIT, run).await.unwrap().unwrap();
    assert_eq!(summary.completed, 0);
    assert_eq!(summary.failed, 1);
    assert_eq!(
        summary.ports[&port("1-1.4")].phase,
        Phase::Failed(FailReason::Cancelled)
    );

    // The bus closes with the run; whatever was published is still readable.
    let mut rest = Vec::new();
    while let Some(envelope) = timeout(WAIT, events.next()).await.unwrap() {
        rest.push(envelope.event);
    }
    assert!(rest.iter().any(|e| matches!(
        e,
        Event::Failed { reason: FailReason::Cancelled, .. }
    )));
    assert!(!rest.iter().any(|e| matches!(e, Event::Completed { .. })));
}

#[tokio::test]
async fn root_ports_are_ignored_without_a_hub() {
    let fx = Fixture::new(BLOCK);
    let card = fx.card("sdh", 2 * BLOCK);
    let mut flat = Topology::new();
    flat.insert(port("1-1"), None);
    flat.insert(port("1-2"), Some(storage(&port("1-2"), &card)));
    let hub = FakeHub(Arc::new(Mutex::new(flat)));

    let boot = FakeBoot {
        hub: hub.clone(),
        reenumerate_as: None,
    };
    let orchestrator = Orchestrator::new(config(), hub, boot, fx.image.clone());
    let mut events = orchestrator.events();
    let shutdown = CancelToken::new();
    let run = tokio::spawn(orchestrator.run(shutdown.clone()));

    // Long enough for an attached card to settle and be written.
    tokio::time::sleep(Duration::from_millis(500)).await;
    shutdown.cancel();
    let summary = timeout(WAIT, run).await.unwrap().unwrap();
    assert_eq!(summary.completed + summary.failed, 0);
    assert!(summary.ports.is_empty());

    while let Some(envelope) = timeout(WAIT, events.next()).await.unwrap() {
        assert!(
            !matches!(
                envelope.event,
                Event::Attached { .. } | Event::PhaseChanged { .. } | Event::Completed { .. }
            ),
            "unexpected {:?}",
            envelope.event
        );
    }
    assert!(std::fs::read(&card).unwrap().iter().all(|&b| b == 0));
}
