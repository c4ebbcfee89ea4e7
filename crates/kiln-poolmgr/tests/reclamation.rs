//! Capacity and reclamation: exhaustion policies, idle sweeps, stuck
//! specializations, startup cleanup, and shutdown.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{FakeRuntime, Harness, Options, PACKAGE_BODY};
use kiln_cache::FunctionServiceCache;
use kiln_core::config::{ExhaustionPolicy, PoolManagerConfig};
use kiln_core::{FunctionIdentity, KilnError};
use kiln_poolmgr::orchestrator::{ContainerSpec, Labels, ServiceSpec, managed_labels};
use kiln_poolmgr::{LocalOrchestrator, Orchestrator, PoolManager, ServiceContext};
use kiln_store::MetadataStore;

#[tokio::test]
async fn idle_instance_is_reclaimed_but_tapped_one_survives() {
    let mut opts = Options::default();
    opts.config.idle_timeout = Duration::from_millis(600);
    let h = Harness::start(opts).await;
    let kept = h.create_function("kept", PACKAGE_BODY);
    let idle = h.create_function("idle", PACKAGE_BODY);

    let kept_addr = h.resolve("kept").await.unwrap();
    h.resolve("idle").await.unwrap();
    assert_eq!(h.orchestrator.containers().len(), 2);

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.manager.tap(std::slice::from_ref(&kept_addr)), 1);
    }
    h.manager.reap().await;

    assert_eq!(h.manager.cache().lookup(&kept.identity()), Some(kept_addr));
    assert_eq!(h.manager.cache().lookup(&idle.identity()), None);
    assert_eq!(h.orchestrator.containers().len(), 1);
    assert_eq!(h.orchestrator.services().len(), 1);

    // The reclaimed function specializes again on demand.
    h.resolve("idle").await.unwrap();
    assert_eq!(h.loads(), 3);
}

#[tokio::test]
async fn tapping_unknown_address_is_ignored() {
    let h = Harness::start(Options::default()).await;
    assert_eq!(h.manager.tap(&["nobody.kiln-function:8888".to_string()]), 0);
}

#[tokio::test]
async fn wait_policy_succeeds_once_capacity_frees_up() {
    let mut opts = Options::default();
    opts.config.max_pool_size = 1;
    opts.config.idle_timeout = Duration::from_millis(50);
    opts.config.exhaustion = ExhaustionPolicy::Wait {
        timeout: Duration::from_secs(5),
    };
    let h = Harness::start(opts).await;
    h.create_function("a", b"a");
    h.create_function("b", b"b");
    h.resolve("a").await.unwrap();

    let manager = Arc::clone(&h.manager);
    let waiting = tokio::spawn(async move {
        manager
            .get_service_for_function(&FunctionIdentity::new("default", "b", ""))
            .await
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!waiting.is_finished());
    h.manager.reap().await;

    let address = waiting.await.unwrap().unwrap();
    assert!(address.contains("kiln-function"), "{address}");
    assert_eq!(h.orchestrator.containers().len(), 1);
}

#[tokio::test]
async fn wait_policy_gives_up_after_its_timeout() {
    let mut opts = Options::default();
    opts.config.max_pool_size = 1;
    opts.config.exhaustion = ExhaustionPolicy::Wait {
        timeout: Duration::from_millis(300),
    };
    let h = Harness::start(opts).await;
    h.create_function("a", b"a");
    h.create_function("b", b"b");
    h.resolve("a").await.unwrap();

    let started = Instant::now();
    let err = h.resolve("b").await.unwrap_err();
    assert!(matches!(err, KilnError::PoolExhausted(_)), "{err:?}");
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn stuck_specialization_is_reaped() {
    let mut opts = Options {
        runtime: FakeRuntime {
            delay: Duration::from_secs(2),
            ..FakeRuntime::default()
        },
        ..Options::default()
    };
    opts.config.call_timeout = Duration::from_millis(300);
    opts.config.max_attempts = 1;
    opts.config.specializing_stale_after = Duration::from_millis(100);
    let h = Harness::start(opts).await;
    h.create_function("slow", PACKAGE_BODY);

    let err = h.resolve("slow").await.unwrap_err();
    assert!(err.is_retryable(), "{err:?}");

    // Timed-out containers are left for the reaper.
    let env = h.store.environments().require("default", common::ENV).unwrap();
    let pool = h.manager.pool_for(&env);
    assert_eq!(pool.stats().specializing, 1);
    assert_eq!(h.orchestrator.containers().len(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    h.manager.reap().await;

    assert_eq!(pool.stats().specializing, 0);
    assert!(h.orchestrator.containers().is_empty());
}

#[tokio::test]
async fn startup_removes_resources_of_other_instances() {
    let orchestrator = Arc::new(LocalOrchestrator::new("127.0.0.1"));
    let namespace = "kiln-function";

    let foreign = orchestrator
        .create_container(&container_spec("old-1", namespace, managed_labels("previous")))
        .await
        .unwrap();
    orchestrator
        .create_service(&ServiceSpec {
            name: "old-1".into(),
            namespace: namespace.into(),
            container_id: foreign.id.clone(),
            port: 8888,
            labels: managed_labels("previous"),
        })
        .await
        .unwrap();
    let ours = orchestrator
        .create_container(&container_spec("mine-1", namespace, managed_labels("current")))
        .await
        .unwrap();
    let unmanaged = orchestrator
        .create_container(&container_spec("other", namespace, Labels::new()))
        .await
        .unwrap();

    let _h = Harness::start_with(Options::default(), Arc::clone(&orchestrator), Some("current"))
        .await;

    let remaining: Vec<String> = orchestrator.containers().into_iter().map(|c| c.id).collect();
    assert!(!remaining.contains(&foreign.id));
    assert!(remaining.contains(&ours.id));
    assert!(remaining.contains(&unmanaged.id));
    assert!(orchestrator.services().is_empty());
}

#[tokio::test]
async fn shutdown_deletes_every_container() {
    let mut opts = Options::default();
    opts.config.pool_size = 2;
    opts.config.replenish_interval = Duration::from_millis(50);
    let h = Harness::start(opts).await;
    h.create_function("hello", PACKAGE_BODY);
    h.resolve("hello").await.unwrap();
    assert!(common::eventually(|| h.orchestrator.containers().len() == 3).await);

    h.manager.shutdown().await;

    assert!(h.orchestrator.containers().is_empty());
    assert!(h.orchestrator.services().is_empty());
    assert!(h.manager.cache().is_empty());
}

fn container_spec(name: &str, namespace: &str, labels: Labels) -> ContainerSpec {
    ContainerSpec {
        name: name.into(),
        namespace: namespace.into(),
        image: "kiln/python-env".into(),
        labels,
        shared_mount_path: "/userfunc".into(),
        fetcher_port: 8000,
    }
}

#[tokio::test]
async fn removing_a_pool_deletes_its_containers() {
    let mut opts = Options::default();
    opts.config.pool_size = 1;
    opts.config.replenish_interval = Duration::from_millis(50);
    let h = Harness::start(opts).await;
    assert!(common::eventually(|| h.orchestrator.containers().len() == 1).await);

    assert!(h.manager.remove_pool("default", common::ENV).await);
    assert!(h.orchestrator.containers().is_empty());
    assert!(h.manager.pool_stats().is_empty());
    assert!(!h.manager.remove_pool("default", common::ENV).await);
}

#[tokio::test]
async fn deleted_environment_stops_serving_its_addresses() {
    let h = Harness::start(Options::default()).await;
    let hello = h.create_function("hello", PACKAGE_BODY);
    let address = h.resolve("hello").await.unwrap();
    assert_eq!(h.manager.tap(std::slice::from_ref(&address)), 1);

    assert!(h.store.environments().delete("default", common::ENV).unwrap());
    assert!(h.manager.remove_pool("default", common::ENV).await);

    assert_eq!(h.manager.cache().lookup(&hello.identity()), None);
    assert!(h.manager.cache().is_empty());
    assert_eq!(h.manager.tap(std::slice::from_ref(&address)), 0);
    assert!(h.orchestrator.containers().is_empty());
    assert!(h.orchestrator.services().is_empty());

    let err = h.resolve("hello").await.unwrap_err();
    assert!(matches!(err, KilnError::NotFound(_)), "{err:?}");
}

#[tokio::test]
async fn allocation_racing_pool_removal_leaves_nothing_behind() {
    let opts = Options {
        runtime: FakeRuntime {
            delay: Duration::from_millis(300),
            ..FakeRuntime::default()
        },
        ..Options::default()
    };
    let h = Harness::start(opts).await;
    let hello = h.create_function("hello", PACKAGE_BODY);

    let manager = Arc::clone(&h.manager);
    let pending = tokio::spawn(async move {
        manager
            .get_service_for_function(&FunctionIdentity::new("default", "hello", ""))
            .await
    });
    assert!(common::eventually(|| h.loads() == 1).await);

    assert!(h.manager.remove_pool("default", common::ENV).await);
    assert!(pending.await.unwrap().is_err());

    assert_eq!(h.manager.cache().lookup(&hello.identity()), None);
    assert!(common::eventually(|| h.orchestrator.containers().is_empty()).await);
    assert!(h.orchestrator.services().is_empty());
}

#[tokio::test]
async fn zero_sweep_interval_is_rejected_at_startup() {
    let config = PoolManagerConfig {
        sweep_interval: Duration::ZERO,
        ..PoolManagerConfig::default()
    };
    let ctx = ServiceContext::new(
        Arc::new(LocalOrchestrator::new("127.0.0.1")),
        MetadataStore::open_in_memory().unwrap(),
        config,
    );

    let Err(err) = PoolManager::start(ctx, FunctionServiceCache::new()).await else {
        panic!("manager started with a zero sweep interval");
    };
    assert!(matches!(err, KilnError::Validation(_)), "{err:?}");
}
