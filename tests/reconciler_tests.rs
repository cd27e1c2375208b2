mod common;

use std::sync::Arc;

use common::{app_with, op_index, service, state_with, MockRuntime};
use iotistic_supervisor::reconciler::{plan_steps, Step};
use iotistic_supervisor::runtime::ContainerRuntime;
use iotistic_supervisor::state::{SimpleState, VolumeMount};
use iotistic_supervisor::store::MemoryStateStore;
use iotistic_supervisor::supervisor::{Supervisor, SupervisorConfig};

fn make_supervisor(runtime: Arc<MockRuntime>) -> Arc<Supervisor> {
    Arc::new(Supervisor::new(
        runtime as Arc<dyn ContainerRuntime>,
        Arc::new(MemoryStateStore::new()),
        SupervisorConfig::default(),
    ))
}

fn two_service_target() -> SimpleState {
    let mut web = service("app1", "web", "registry.iotistic.io/web:1.0");
    web.config.networks = vec!["backend".into()];
    web.config.volumes = vec![VolumeMount::parse("data:/var/lib/web").unwrap()];
    let db = service("app1", "db", "registry.iotistic.io/db:1.0");
    state_with(vec![app_with("app1", "plant-floor", vec![web, db])])
}

#[tokio::test]
async fn converge_twice_is_idempotent() {
    let runtime = MockRuntime::new();
    let supervisor = make_supervisor(runtime.clone());

    supervisor.set_target(two_service_target()).await.unwrap();

    let first = supervisor.converge_once().await.unwrap();
    assert!(!first.is_empty());
    assert!(first.iter().all(|r| r.executed()), "{:?}", first);

    runtime.clear_operations().await;
    let second = supervisor.converge_once().await.unwrap();
    assert!(second.is_empty(), "second pass planned {:?}", second);
    assert!(runtime.operations().await.is_empty());
}

#[tokio::test]
async fn bring_up_creates_dependencies_before_containers() {
    let runtime = MockRuntime::new();
    let supervisor = make_supervisor(runtime.clone());

    supervisor.set_target(two_service_target()).await.unwrap();
    supervisor.converge_once().await.unwrap();

    let ops = runtime.operations().await;
    let pull = op_index(&ops, "pullImage(registry.iotistic.io/web:1.0");
    let volume = op_index(&ops, "createVolume(app1_data)");
    let network = op_index(&ops, "createNetwork(app1_backend)");
    let start = op_index(&ops, "startContainer(app1/web)");
    assert!(pull < volume, "{:?}", ops);
    assert!(volume < network, "{:?}", ops);
    assert!(network < start, "{:?}", ops);
}

#[tokio::test]
async fn network_change_recreates_only_that_service() {
    let runtime = MockRuntime::new();
    let supervisor = make_supervisor(runtime.clone());

    // First converge without the network.
    let web = service("app1", "web", "registry.iotistic.io/web:1.0");
    let db = service("app1", "db", "registry.iotistic.io/db:1.0");
    supervisor
        .set_target(state_with(vec![app_with("app1", "plant-floor", vec![web, db])]))
        .await
        .unwrap();
    supervisor.converge_once().await.unwrap();
    runtime.clear_operations().await;

    // Same target except web gains a network.
    let mut web = service("app1", "web", "registry.iotistic.io/web:1.0");
    web.config.networks = vec!["backend".into()];
    let db = service("app1", "db", "registry.iotistic.io/db:1.0");
    supervisor
        .set_target(state_with(vec![app_with("app1", "plant-floor", vec![web, db])]))
        .await
        .unwrap();
    let results = supervisor.converge_once().await.unwrap();
    assert!(results.iter().all(|r| r.executed()), "{:?}", results);

    let ops = runtime.operations().await;
    let create = op_index(&ops, "createNetwork(app1_backend)");
    let stop = op_index(&ops, "stopContainer(");
    let remove = op_index(&ops, "removeContainer(");
    let start = op_index(&ops, "startContainer(app1/web)");
    assert!(create < stop, "{:?}", ops);
    assert!(stop < remove, "{:?}", ops);
    assert!(remove < start, "{:?}", ops);

    // The unrelated service is untouched.
    assert!(
        !ops.iter().any(|op| op.contains("app1/db")),
        "db was touched: {:?}",
        ops
    );
    assert_eq!(ops.iter().filter(|op| op.starts_with("stopContainer")).count(), 1);
}

#[tokio::test]
async fn removing_an_app_tears_down_containers_before_resources() {
    let runtime = MockRuntime::new();
    let supervisor = make_supervisor(runtime.clone());

    let mut cache = service("app2", "cache", "registry.iotistic.io/cache:1.0");
    cache.config.networks = vec!["backend".into()];
    cache.config.volumes = vec![VolumeMount::parse("cachedata:/data").unwrap()];
    let target = state_with(vec![
        app_with("app1", "plant-floor", vec![service("app1", "web", "registry.iotistic.io/web:1.0")]),
        app_with("app2", "cold-store", vec![cache]),
    ]);
    supervisor.set_target(target).await.unwrap();
    supervisor.converge_once().await.unwrap();
    runtime.clear_operations().await;

    // app2 leaves the target entirely.
    let target = state_with(vec![app_with(
        "app1",
        "plant-floor",
        vec![service("app1", "web", "registry.iotistic.io/web:1.0")],
    )]);
    supervisor.set_target(target).await.unwrap();
    let results = supervisor.converge_once().await.unwrap();
    assert!(results.iter().all(|r| r.executed()), "{:?}", results);

    let ops = runtime.operations().await;
    let stop = op_index(&ops, "stopContainer(");
    let remove = op_index(&ops, "removeContainer(");
    let network = op_index(&ops, "removeNetwork(app2_backend)");
    let volume = op_index(&ops, "removeVolume(app2_cachedata)");
    assert!(stop < remove, "{:?}", ops);
    assert!(remove < network, "{:?}", ops);
    assert!(remove < volume, "{:?}", ops);

    // Nothing of app2 is left in current state, and the next pass is empty.
    assert!(!supervisor.get_current().await.apps.contains_key("app2"));
    let next = supervisor.converge_once().await.unwrap();
    assert!(next.is_empty(), "{:?}", next);
}

#[tokio::test]
async fn resync_adopts_runtime_truth_after_restart() {
    let runtime = MockRuntime::new();

    // A container from a previous supervisor process, unknown to the store.
    let orphan = service("app1", "web", "registry.iotistic.io/web:1.0");
    runtime.seed_container(&orphan, "plant-floor").await;

    let supervisor = make_supervisor(runtime.clone());
    supervisor.resync().await.unwrap();

    let current = supervisor.get_current().await;
    let adopted = current.service("app1", "web").expect("adopted service");
    assert!(adopted.container_id.is_some());

    // Target with a different env: the adopted container must be replaced.
    let mut web = service("app1", "web", "registry.iotistic.io/web:1.0");
    web.config.environment.insert("MODE".into(), "prod".into());
    supervisor
        .set_target(state_with(vec![app_with("app1", "plant-floor", vec![web])]))
        .await
        .unwrap();
    let results = supervisor.converge_once().await.unwrap();
    assert!(results.iter().all(|r| r.executed()), "{:?}", results);

    let ops = runtime.operations().await;
    let stop = op_index(&ops, "stopContainer(seeded-");
    let start = op_index(&ops, "startContainer(app1/web)");
    assert!(stop < start, "{:?}", ops);
}

#[test]
fn plan_is_empty_for_converged_state() {
    // A converged current state mirrors the target configs and carries the
    // runtime fields plus network/volume bookkeeping.
    let mut current = two_service_target();
    for app in current.apps.values_mut() {
        for service in app.services.values_mut() {
            service.container_id = Some(format!("c-{}", service.service_id));
        }
        app.networks = vec!["backend".into()];
        app.volumes = vec!["data".into()];
    }
    let target = two_service_target();
    assert_eq!(plan_steps(&target, &current), Vec::<Step>::new());
}

#[test]
fn plan_orders_phases_strictly() {
    let target = two_service_target();
    let current = SimpleState::new();
    let steps = plan_steps(&target, &current);

    let phase = |step: &Step| match step {
        Step::PullImage { .. } => 0,
        Step::CreateVolume { .. } => 1,
        Step::CreateNetwork { .. } => 2,
        Step::StopContainer { .. } => 3,
        Step::RemoveContainer { .. } => 4,
        Step::StartContainer { .. } => 5,
        Step::RemoveNetwork { .. } => 6,
        Step::RemoveVolume { .. } => 7,
    };
    let phases: Vec<u8> = steps.iter().map(phase).collect();
    let mut sorted = phases.clone();
    sorted.sort();
    assert_eq!(phases, sorted, "steps out of phase order: {:?}", steps);
}
