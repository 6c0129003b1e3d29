//! Unit tests for the Foo reconciler

use super::*;
use crds::FooSpec;
use k8s_openapi::api::apps::v1::DeploymentStatus;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use reconcile_runtime::{
    Cache, CacheEvent, MockStore, QueueConfig, RecordingErrorSink, RecordingEventRecorder,
    StoreError, Verb, WorkQueue,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Fixture {
    handler: Handler,
    foos: KindHandle<Foo>,
    deployments: KindHandle<Deployment>,
    foo_store: MockStore<Foo>,
    deployment_store: MockStore<Deployment>,
    recorder: RecordingEventRecorder,
    errors: RecordingErrorSink,
}

impl Fixture {
    fn new() -> Self {
        let errors = RecordingErrorSink::new();
        let foos = Dispatcher::<Foo>::new(
            FOO_KIND,
            Cache::new(),
            WorkQueue::new(FOO_KIND, QueueConfig::default()),
            Arc::new(errors.clone()),
        )
        .handle();
        let deployments = Dispatcher::<Deployment>::new(
            "Deployment",
            Cache::new(),
            WorkQueue::new("Deployment", QueueConfig::default()),
            Arc::new(errors.clone()),
        )
        .handle();
        let mut owners = OwnerRoutes::new();
        owners.register(foos.clone());

        let foo_store = MockStore::new();
        let deployment_store = MockStore::new();
        let recorder = RecordingEventRecorder::new();
        let handler = Handler {
            deployments: deployments.clone(),
            deployment_store: Arc::new(deployment_store.clone()),
            foo_store: Arc::new(foo_store.clone()),
            owners,
            registry: KindRegistry::new().register::<Foo>().register::<Deployment>(),
            recorder: Arc::new(recorder.clone()),
            error_sink: Arc::new(errors.clone()),
        };

        Self {
            handler,
            foos,
            deployments,
            foo_store,
            deployment_store,
            recorder,
            errors,
        }
    }

    /// Makes `foo` visible in the Foo cache and the Foo store.
    fn seed_foo(&self, foo: &Foo) {
        self.foos.cache().apply(CacheEvent::Applied(foo.clone()));
        self.foo_store.insert(foo.clone());
    }

    /// Makes `deployment` visible in the Deployment cache and store.
    fn seed_deployment(&self, deployment: &Deployment) {
        self.deployments
            .cache()
            .apply(CacheEvent::Applied(deployment.clone()));
        self.deployment_store.insert(deployment.clone());
    }

    async fn reconcile(&self, foo: &Foo) -> Result<Option<Foo>, ControllerError> {
        self.handler
            .on_foo_changed(&ObjectKey::from_resource(foo), Some(foo.clone()))
            .await
    }
}

fn foo(name: &str, deployment_name: &str, replicas: Option<i32>) -> Foo {
    let mut foo = Foo::new(
        name,
        FooSpec {
            deployment_name: deployment_name.to_string(),
            replicas,
        },
    );
    foo.metadata.namespace = Some("default".to_string());
    foo.metadata.uid = Some(format!("uid-{name}"));
    foo.metadata.resource_version = Some("1".to_string());
    foo
}

fn with_status(mut foo: Foo, available: i32) -> Foo {
    foo.status = Some(FooStatus {
        available_replicas: available,
    });
    foo
}

/// Deployment as the controller would have created it, observed with
/// `replicas` and `available` ready pods.
fn owned_deployment(foo: &Foo, replicas: Option<i32>, available: i32) -> Deployment {
    let mut deployment = new_deployment(foo).unwrap();
    deployment.metadata.resource_version = Some("7".to_string());
    if let Some(spec) = deployment.spec.as_mut() {
        spec.replicas = replicas;
    }
    deployment.status = Some(DeploymentStatus {
        available_replicas: Some(available),
        ..Default::default()
    });
    deployment
}

fn foreign_owner(kind: &str, name: &str) -> OwnerReference {
    OwnerReference {
        api_version: "samplecontroller.k8s.io/v1alpha1".to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: format!("uid-{name}"),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

#[tokio::test]
async fn test_missing_deployment_is_created() {
    let fx = Fixture::new();
    let foo = foo("example-foo", "web", Some(2));
    fx.seed_foo(&foo);

    assert_eq!(fx.reconcile(&foo).await.unwrap(), None);

    let creates = fx.deployment_store.calls_for(Verb::Create);
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].key, ObjectKey::new("default", "web"));
    assert_eq!(fx.deployment_store.calls().len(), 1);
    assert!(fx.foo_store.calls().is_empty(), "status waits for the Deployment to be observed");

    let created = fx.deployment_store.object("default", "web").unwrap();
    let owner = &created.metadata.owner_references.as_ref().unwrap()[0];
    assert_eq!(owner.kind, "Foo");
    assert_eq!(owner.api_version, "samplecontroller.k8s.io/v1alpha1");
    assert_eq!(owner.name, "example-foo");
    assert_eq!(owner.uid, "uid-example-foo");
    assert_eq!(owner.controller, Some(true));
    assert_eq!(owner.block_owner_deletion, Some(true));

    let spec = created.spec.unwrap();
    assert_eq!(spec.replicas, Some(2));
    let expected = BTreeMap::from([
        ("app".to_string(), "nginx".to_string()),
        ("controller".to_string(), "example-foo".to_string()),
    ]);
    assert_eq!(spec.selector.match_labels.as_ref(), Some(&expected));
    assert_eq!(
        spec.template.metadata.unwrap().labels.as_ref(),
        Some(&expected)
    );
    let containers = spec.template.spec.unwrap().containers;
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].name, "nginx");
    assert_eq!(containers[0].image.as_deref(), Some("nginx:latest"));
}

#[tokio::test]
async fn test_replica_drift_updates_deployment_only() {
    let fx = Fixture::new();
    let foo = with_status(foo("example-foo", "web", Some(3)), 0);
    fx.seed_foo(&foo);
    fx.seed_deployment(&owned_deployment(&foo, Some(1), 1));

    fx.reconcile(&foo).await.unwrap();

    assert_eq!(fx.deployment_store.calls_for(Verb::Update).len(), 1);
    assert_eq!(fx.deployment_store.calls().len(), 1);
    assert!(fx.foo_store.calls_for(Verb::UpdateStatus).is_empty());

    let updated = fx.deployment_store.object("default", "web").unwrap();
    assert_eq!(updated.spec.unwrap().replicas, Some(3));
}

#[tokio::test]
async fn test_in_sync_pair_issues_no_store_calls() {
    let fx = Fixture::new();
    let foo = with_status(foo("example-foo", "web", Some(2)), 2);
    fx.seed_foo(&foo);
    fx.seed_deployment(&owned_deployment(&foo, Some(2), 2));

    fx.reconcile(&foo).await.unwrap();
    fx.reconcile(&foo).await.unwrap();

    assert!(fx.deployment_store.calls().is_empty());
    assert!(fx.foo_store.calls().is_empty());
    assert!(fx.recorder.events().is_empty());
    assert!(fx.errors.reports().is_empty());
}

#[tokio::test]
async fn test_unset_deployment_replicas_count_as_one() {
    let fx = Fixture::new();
    let foo = with_status(foo("example-foo", "web", Some(1)), 1);
    fx.seed_foo(&foo);
    fx.seed_deployment(&owned_deployment(&foo, None, 1));

    fx.reconcile(&foo).await.unwrap();
    assert!(fx.deployment_store.calls().is_empty());
}

#[tokio::test]
async fn test_foo_without_replicas_never_updates_deployment() {
    let fx = Fixture::new();
    let foo = with_status(foo("example-foo", "web", None), 5);
    fx.seed_foo(&foo);
    fx.seed_deployment(&owned_deployment(&foo, Some(5), 5));

    fx.reconcile(&foo).await.unwrap();
    assert!(fx.deployment_store.calls().is_empty());
}

#[tokio::test]
async fn test_foreign_deployment_is_left_alone() {
    let fx = Fixture::new();
    let foo = foo("example-foo", "web", Some(3));
    fx.seed_foo(&foo);

    let mut foreign = owned_deployment(&foo, Some(1), 1);
    foreign.metadata.owner_references = Some(vec![foreign_owner("Foo", "other-foo")]);
    fx.seed_deployment(&foreign);

    assert_eq!(fx.reconcile(&foo).await.unwrap(), None);

    assert!(fx.deployment_store.calls().is_empty());
    assert!(fx.foo_store.calls().is_empty());
    let events = fx.recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].severity, EventSeverity::Warning);
    assert_eq!(events[0].reason, ERR_RESOURCE_EXISTS);
    assert_eq!(
        events[0].message,
        "Resource \"web\" already exists and is not managed by Foo"
    );
    assert_eq!(events[0].subject.kind.as_deref(), Some("Foo"));
    assert_eq!(events[0].subject.name.as_deref(), Some("example-foo"));
    assert_eq!(events[0].subject.uid.as_deref(), Some("uid-example-foo"));
}

#[tokio::test]
async fn test_deployment_controlled_by_other_kind_is_left_alone() {
    let fx = Fixture::new();
    let foo = foo("example-foo", "web", Some(3));
    fx.seed_foo(&foo);

    let mut replicated = owned_deployment(&foo, Some(1), 1);
    let mut owner = foreign_owner("ReplicaSet", "web-7d9f8");
    owner.api_version = "apps/v1".to_string();
    replicated.metadata.owner_references = Some(vec![owner]);
    fx.seed_deployment(&replicated);

    assert_eq!(fx.reconcile(&foo).await.unwrap(), None);

    assert!(fx.deployment_store.calls().is_empty());
    assert!(fx.foo_store.calls().is_empty());
    let events = fx.recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].severity, EventSeverity::Warning);
    assert_eq!(events[0].reason, ERR_RESOURCE_EXISTS);
}

#[tokio::test]
async fn test_unowned_deployment_is_left_alone() {
    let fx = Fixture::new();
    let foo = foo("example-foo", "web", None);
    fx.seed_foo(&foo);

    let mut unowned = owned_deployment(&foo, Some(1), 1);
    unowned.metadata.owner_references = None;
    fx.seed_deployment(&unowned);

    fx.reconcile(&foo).await.unwrap();
    assert!(fx.deployment_store.calls().is_empty());
    assert_eq!(fx.recorder.events().len(), 1);
}

#[tokio::test]
async fn test_empty_deployment_name_is_reported_not_retried() {
    let fx = Fixture::new();
    let foo = foo("example-foo", "", Some(1));
    fx.seed_foo(&foo);

    assert!(fx.reconcile(&foo).await.is_ok());

    assert!(fx.deployment_store.calls().is_empty());
    assert!(fx.foo_store.calls().is_empty());
    let reports = fx.errors.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].kind, "Foo");
    assert_eq!(
        reports[0].message,
        "default/example-foo: deployment name must be specified"
    );
}

#[tokio::test]
async fn test_status_follows_deployment() {
    let fx = Fixture::new();
    let foo = foo("example-foo", "web", Some(2));
    fx.seed_foo(&foo);
    fx.seed_deployment(&owned_deployment(&foo, Some(2), 2));

    fx.reconcile(&foo).await.unwrap();

    assert_eq!(fx.foo_store.calls_for(Verb::UpdateStatus).len(), 1);
    assert!(fx.deployment_store.calls().is_empty());

    let stored = fx.foo_store.object("default", "example-foo").unwrap();
    assert_eq!(stored.status.unwrap().available_replicas, 2);
    assert_eq!(stored.spec, foo.spec);
}

#[tokio::test]
async fn test_deleted_foo_needs_nothing() {
    let fx = Fixture::new();
    let result = fx
        .handler
        .on_foo_changed(&ObjectKey::new("default", "gone"), None)
        .await
        .unwrap();
    assert_eq!(result, None);
    assert!(fx.deployment_store.calls().is_empty());
}

#[tokio::test]
async fn test_store_errors_are_returned_for_retry() {
    let fx = Fixture::new();
    let foo = foo("example-foo", "web", None);
    fx.seed_foo(&foo);
    fx.deployment_store
        .fail_next(Verb::Create, StoreError::Transient("connection reset".to_string()));

    let err = fx.reconcile(&foo).await.unwrap_err();
    assert!(matches!(err, ControllerError::Store(StoreError::Transient(_))));
}

#[tokio::test]
async fn test_stale_status_write_conflicts() {
    let fx = Fixture::new();
    let cached = foo("example-foo", "web", Some(2));
    fx.seed_foo(&cached);
    fx.seed_deployment(&owned_deployment(&cached, Some(2), 2));

    // Someone else wrote the Foo since it was cached
    let mut newer = cached.clone();
    newer.metadata.resource_version = None;
    fx.foo_store.update(&newer).await.unwrap();

    let err = fx.reconcile(&cached).await.unwrap_err();
    assert!(matches!(err, ControllerError::Store(StoreError::Conflict(_))));
}

#[tokio::test]
async fn test_deployment_change_enqueues_owner_once() {
    let fx = Fixture::new();
    let foo = foo("example-foo", "web", Some(2));
    fx.seed_foo(&foo);
    let deployment = owned_deployment(&foo, Some(2), 1);
    let key = ObjectKey::from_resource(&deployment);

    fx.handler
        .on_deployment_changed(&key, Some(deployment.clone()))
        .unwrap();
    fx.handler.on_deployment_changed(&key, Some(deployment)).unwrap();

    assert_eq!(fx.foos.queue().len(), 1);
    assert_eq!(
        fx.foos.queue().get().await,
        Some(ObjectKey::new("default", "example-foo"))
    );
}

#[tokio::test]
async fn test_deployment_removal_enqueues_owner() {
    let fx = Fixture::new();
    let foo = foo("example-foo", "web", Some(2));
    fx.seed_foo(&foo);
    let deployment = owned_deployment(&foo, Some(2), 1);

    fx.handler
        .on_deployment_removed(&ObjectKey::from_resource(&deployment), &deployment)
        .unwrap();

    assert_eq!(
        fx.foos.queue().get().await,
        Some(ObjectKey::new("default", "example-foo"))
    );
}

#[test]
fn test_orphans_and_foreign_kinds_are_ignored() {
    let fx = Fixture::new();
    let mut orphan = owned_deployment(&foo("missing-foo", "web", None), None, 0);
    let key = ObjectKey::from_resource(&orphan);
    fx.handler.on_deployment_changed(&key, Some(orphan.clone())).unwrap();
    assert!(fx.foos.queue().is_empty());

    orphan.metadata.owner_references = Some(vec![foreign_owner("Bar", "missing-foo")]);
    fx.handler.on_deployment_changed(&key, Some(orphan.clone())).unwrap();
    assert!(fx.foos.queue().is_empty());

    orphan.metadata.owner_references = None;
    fx.handler.on_deployment_changed(&key, Some(orphan)).unwrap();
    fx.handler.on_deployment_changed(&key, None).unwrap();
    assert!(fx.foos.queue().is_empty());
}

/// Polls `check` until it yields a value.
async fn eventually<T>(mut check: impl FnMut() -> Option<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(value) = check() {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_registered_handlers_bring_foo_status_up_to_date() {
    let errors = RecordingErrorSink::new();
    let mut foos = Dispatcher::<Foo>::new(
        FOO_KIND,
        Cache::new(),
        WorkQueue::new(FOO_KIND, QueueConfig::default()),
        Arc::new(errors.clone()),
    );
    let mut deployments = Dispatcher::<Deployment>::new(
        "Deployment",
        Cache::new(),
        WorkQueue::new("Deployment", QueueConfig::default()),
        Arc::new(errors.clone()),
    );
    let mut owners = OwnerRoutes::new();
    owners.register(foos.handle());

    let foo_store = MockStore::new();
    let deployment_store = MockStore::new();
    let handler = Arc::new(Handler {
        deployments: deployments.handle(),
        deployment_store: Arc::new(deployment_store.clone()),
        foo_store: Arc::new(foo_store.clone()),
        owners,
        registry: KindRegistry::new().register::<Foo>().register::<Deployment>(),
        recorder: Arc::new(RecordingEventRecorder::new()),
        error_sink: Arc::new(errors.clone()),
    });
    register(&handler, &mut foos, &mut deployments);

    let foo_handle = foos.handle();
    let deployment_handle = deployments.handle();
    let shutdown = CancellationToken::new();
    let foo_workers = tokio::spawn(foos.run(2, shutdown.clone()));
    let deployment_workers = tokio::spawn(deployments.run(2, shutdown.clone()));

    let foo = foo("example-foo", "web", Some(2));
    foo_store.insert(foo.clone());
    foo_handle.ingest(CacheEvent::Applied(foo));

    // The watch reports the created Deployment once it has rolled out
    let mut created = eventually(|| deployment_store.object("default", "web")).await;
    created.status = Some(DeploymentStatus {
        available_replicas: Some(2),
        ..Default::default()
    });
    deployment_handle.ingest(CacheEvent::Applied(created));

    let status = eventually(|| {
        foo_store
            .object("default", "example-foo")
            .and_then(|foo| foo.status)
    })
    .await;
    assert_eq!(status.available_replicas, 2);
    assert_eq!(deployment_store.calls_for(Verb::Create).len(), 1);
    assert!(errors.reports().is_empty());

    shutdown.cancel();
    foo_workers.await.unwrap();
    deployment_workers.await.unwrap();
}
