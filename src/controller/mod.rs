use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{stream, StreamExt};
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::{Action, Config as ControllerConfig};
use kube::runtime::events::{Event, Recorder, Reporter};
use kube::runtime::{watcher, Controller as PvcController, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use rand::{thread_rng, Rng};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{Config, FINALIZER_NAME, RESULTS_ANNOTATION_KEY};
use crate::errors::{Error, Result};
use crate::ext::ProvisionerResourceExt;
use crate::storage_class::StorageClassCache;

pub mod create_dataset;
pub mod create_pv;
pub mod delete_dataset;
pub mod pod_watcher;
pub mod worker_pod;

use worker_pod::{is_terminal_phase, DatasetAction};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Shared state handed to every reconcile invocation.
pub struct Context {
    pub client: Client,
    pub config: Config,
    pub storage_classes: StorageClassCache,
    reporter: Reporter,
    /// Consecutive failures per PVC, drives the retry backoff.
    failures: Mutex<HashMap<String, u32>>,
}

impl Context {
    /// Publish a Kubernetes Event for the given object. Event delivery is
    /// best effort and never fails a reconcile.
    pub async fn publish_event(&self, reference: ObjectReference, event: Event) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference);
        if let Err(err) = recorder.publish(event).await {
            warn!("Failed to publish event: {}", err);
        }
    }

    fn next_backoff(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap();
        let attempt = failures.entry(key.to_owned()).or_insert(0);
        let delay = backoff_delay(*attempt);
        *attempt = attempt.saturating_add(1);
        delay
    }

    fn clear_backoff(&self, key: &str) {
        self.failures.lock().unwrap().remove(key);
    }
}

/// The [Controller] watches cluster resources and reconciles any state
/// related to zfs-provisioner: it deploys worker pods to create and destroy
/// datasets, publishes PVs for succeeded creations and reclaims volumes on
/// PVC deletion.
pub struct Controller {
    client: Client,
    config: Config,
}

impl Controller {
    /// Creates and returns a new [Controller].
    ///
    /// The Kubernetes client credentials come from ~/.kube/config, falling
    /// back to the in-cluster service account.
    pub async fn create(config: Config) -> color_eyre::Result<Self> {
        let client = Client::try_default().await?;
        Ok(Controller { client, config })
    }

    /// Starts the Controller.
    ///
    /// This method only returns on shutdown or if a watch stream fails
    /// beyond repair.
    pub async fn run(self) -> color_eyre::Result<()> {
        let ctx = Arc::new(Context {
            client: self.client.clone(),
            reporter: Reporter {
                controller: "zfs-provisioner".into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            config: self.config,
            storage_classes: StorageClassCache::new(),
            failures: Mutex::new(HashMap::new()),
        });

        // A fresh StorageClass re-queues every PVC so claims that were
        // waiting on the class pick up without further events.
        let (class_trigger_tx, mut class_trigger_rx) = mpsc::unbounded_channel::<()>();
        let class_trigger = stream::poll_fn(move |cx| class_trigger_rx.poll_recv(cx));

        let claims = Api::<PersistentVolumeClaim>::all(self.client.clone());
        let pvc_controller = PvcController::new(claims, watcher::Config::default())
            .with_config(ControllerConfig::default().concurrency(ctx.config.workers))
            .reconcile_all_on(class_trigger)
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx.clone())
            .for_each(|reconciliation| async move {
                match reconciliation {
                    Ok((claim, _)) => debug!("Reconciled PVC {:?}", claim),
                    Err(err) => debug!("Reconciliation failed: {}", err),
                }
            });

        info!("Controller started.");

        tokio::select! {
            _ = pvc_controller => {}
            outcome = watch_storage_classes(ctx.clone(), class_trigger_tx) => outcome?,
            outcome = pod_watcher::run(ctx.clone()) => outcome?,
        }

        Ok(())
    }
}

/// Keeps the StorageClass cache current. Classes are never evicted: a PVC
/// referencing a deleted class must keep failing loudly instead of being
/// silently ignored.
async fn watch_storage_classes(
    ctx: Arc<Context>,
    class_trigger: mpsc::UnboundedSender<()>,
) -> Result<()> {
    let storage_classes = Api::<StorageClass>::all(ctx.client.clone());
    let stream = watcher(storage_classes, watcher::Config::default())
        .default_backoff()
        .applied_objects();

    tokio::pin!(stream);

    while let Some(event) = stream.next().await {
        let storage_class = match event {
            Ok(storage_class) => storage_class,
            Err(err) => {
                warn!("StorageClass watch error: {}", err);
                continue;
            }
        };

        if storage_class.provisioner != ctx.config.provisioner_name {
            continue;
        }

        let name = storage_class.name_any();
        if ctx.storage_classes.insert(&storage_class) {
            info!("Watching for PVCs with storage class: {}", name);
            let _ = class_trigger.send(());
        } else {
            debug!("Refreshed storage class {}", name);
        }
    }

    Ok(())
}

/// What a PVC event asks of us. Decided purely from the claim and cache
/// membership so the dispatch is testable without an API server.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Dispatch {
    /// Not ours, or nothing to do right now.
    Ignore,
    /// The claim carries our markers but its StorageClass is not cached.
    UnknownStorageClass(String),
    /// The claim is being deleted, run reclamation.
    Reclaim,
    /// Launch the create worker.
    CreateDataset,
    /// A worker is in flight, the watcher will report back.
    AwaitWorker,
    /// The create worker finished with this phase, publish (or fail) the PV.
    PublishVolume(String),
}

fn claim_phase(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim.status.as_ref()?.phase.as_deref()
}

/// Whether this claim was ever touched by us.
fn has_provisioner_markers(claim: &PersistentVolumeClaim) -> bool {
    claim.has_provisioner_finalizer()
        || claim.annotation(RESULTS_ANNOTATION_KEY).is_some()
        || claim
            .annotation(&DatasetAction::Create.phase_annotation_key())
            .is_some()
}

fn classify(claim: &PersistentVolumeClaim, storage_class_known: bool) -> Dispatch {
    if claim.metadata.deletion_timestamp.is_some() {
        return Dispatch::Reclaim;
    }

    if claim_phase(claim) != Some("Pending") {
        return Dispatch::Ignore;
    }

    let storage_class_name = claim
        .spec
        .as_ref()
        .and_then(|spec| spec.storage_class_name.as_deref());
    let Some(storage_class_name) = storage_class_name else {
        return Dispatch::Ignore;
    };

    if !storage_class_known {
        if has_provisioner_markers(claim) {
            return Dispatch::UnknownStorageClass(storage_class_name.to_owned());
        }
        // Most likely another provisioner's claim.
        return Dispatch::Ignore;
    }

    match claim.annotation(&DatasetAction::Create.phase_annotation_key()) {
        None => Dispatch::CreateDataset,
        Some(phase) if is_terminal_phase(phase) => Dispatch::PublishVolume(phase.to_owned()),
        Some(_) => Dispatch::AwaitWorker,
    }
}

async fn reconcile(claim: Arc<PersistentVolumeClaim>, ctx: Arc<Context>) -> Result<Action> {
    let key = claim.full_name();
    let deadline = Duration::from_secs(ctx.config.reconcile_timeout_seconds);

    match tokio::time::timeout(deadline, reconcile_inner(&claim, &ctx)).await {
        Ok(Ok(action)) => {
            ctx.clear_backoff(&key);
            Ok(action)
        }
        Ok(Err(err)) => Err(err),
        Err(_elapsed) => Err(Error::DeadlineExceeded),
    }
}

async fn reconcile_inner(claim: &PersistentVolumeClaim, ctx: &Context) -> Result<Action> {
    let storage_class = claim
        .spec
        .as_ref()
        .and_then(|spec| spec.storage_class_name.as_deref())
        .and_then(|name| ctx.storage_classes.get(name));

    match (classify(claim, storage_class.is_some()), storage_class) {
        (Dispatch::Ignore, _) => Ok(Action::await_change()),
        (Dispatch::UnknownStorageClass(name), _) => Err(Error::fatal(format!(
            "PVC {} references unknown StorageClass '{}'",
            claim.full_name(),
            name
        ))),
        (Dispatch::Reclaim, _) => delete_dataset::reconcile(claim, ctx).await,
        (Dispatch::AwaitWorker, _) => Ok(Action::requeue(Duration::from_secs(60))),
        (Dispatch::CreateDataset, Some(storage_class)) => {
            create_dataset::reconcile(claim, &storage_class, ctx).await
        }
        (Dispatch::PublishVolume(phase), Some(storage_class)) => {
            create_pv::reconcile(claim, &storage_class, &phase, ctx).await
        }
        // classify only asks for a class it knows to exist.
        (Dispatch::CreateDataset | Dispatch::PublishVolume(_), None) => {
            Ok(Action::await_change())
        }
    }
}

fn error_policy(claim: Arc<PersistentVolumeClaim>, err: &Error, ctx: Arc<Context>) -> Action {
    if err.is_fatal() {
        error!(
            "Giving up on PVC {} pending operator intervention: {}",
            claim.full_name(),
            err
        );
        return Action::await_change();
    }

    let delay = ctx.next_backoff(&claim.full_name());
    warn!(
        "Reconciliation of PVC {} failed, retrying in {:.1}s: {}",
        claim.full_name(),
        delay.as_secs_f64(),
        err
    );
    Action::requeue(delay)
}

/// Exponential backoff with jitter: 1s doubling up to a 60s cap.
fn backoff_delay(attempt: u32) -> Duration {
    let base = INITIAL_BACKOFF * 2u32.pow(attempt.min(6));
    let jittered = base.mul_f64(thread_rng().gen_range(0.5..1.5));
    jittered.min(MAX_BACKOFF)
}

/// Drops the provisioner's finalizer from a PVC. A missing claim or
/// finalizer means someone else finished first, which is fine.
pub async fn remove_finalizer(client: Client, namespace: &str, name: &str) -> Result<()> {
    let claims = Api::<PersistentVolumeClaim>::namespaced(client, namespace);
    let Some(claim) = claims.get_opt(name).await? else {
        return Ok(());
    };
    let Some(index) = claim.finalizers().iter().position(|f| f == FINALIZER_NAME) else {
        return Ok(());
    };

    debug!("Removing finalizer from PVC {}/{}", namespace, name);
    let finalizer_path = format!("/metadata/finalizers/{}", index);
    let patch: json_patch::Patch = serde_json::from_value(serde_json::json!([
        {
            "op": "test",
            "path": finalizer_path,
            "value": FINALIZER_NAME,
        },
        {
            "op": "remove",
            "path": finalizer_path,
        },
    ]))?;

    match claims
        .patch(
            name,
            &PatchParams::default(),
            &Patch::<json_patch::Patch>::Json(patch),
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(err) => Err(err.into()),
    }
}
