//! Watch plumbing: one watcher task per resource kind, each feeding the
//! cluster state cache and marking its source synced once the initial list
//! has been delivered.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use futures_util::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::storage::v1::{StorageClass, VolumeAttachment};
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::apis::NodeClaim;
use crate::scheduling::batcher::Trigger;
use crate::scheduling::pod::{self, PodKey};
use crate::state::{ClusterState, WatchSource};

fn run_watcher<K, FA, FD>(
    api: Api<K>,
    source: WatchSource,
    state: Arc<ClusterState>,
    mut shutdown: watch::Receiver<bool>,
    on_apply: FA,
    on_delete: FD,
) -> JoinHandle<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
    FA: Fn(&ClusterState, K) + Send + Sync + 'static,
    FD: Fn(&ClusterState, K) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut stream = watcher::watcher(api, watcher::Config::default().any_semantic())
            .default_backoff()
            .boxed();
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                item = stream.next() => match item {
                    Some(Ok(Event::Init)) => {}
                    Some(Ok(Event::InitApply(obj))) | Some(Ok(Event::Apply(obj))) => {
                        on_apply(&state, obj);
                    }
                    Some(Ok(Event::InitDone)) => state.mark_synced(source),
                    Some(Ok(Event::Delete(obj))) => on_delete(&state, obj),
                    Some(Err(error)) => {
                        warn!(?source, %error, "watch stream error");
                    }
                    None => return,
                },
            }
        }
    })
}

/// Spawn every watcher the cache depends on. The pod watcher additionally
/// pokes the batcher whenever a provisionable pod appears.
pub fn spawn_all(
    client: Client,
    state: Arc<ClusterState>,
    trigger: Trigger,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    handles.push(run_watcher::<Node, _, _>(
        Api::all(client.clone()),
        WatchSource::Nodes,
        state.clone(),
        shutdown.clone(),
        |s, node| s.update_node(node),
        |s, node| s.delete_node(&node.name_any()),
    ));

    handles.push(run_watcher::<NodeClaim, _, _>(
        Api::all(client.clone()),
        WatchSource::NodeClaims,
        state.clone(),
        shutdown.clone(),
        |s, claim| s.update_node_claim(claim),
        |s, claim| s.delete_node_claim(&claim.name_any()),
    ));

    let pod_trigger = trigger.clone();
    handles.push(run_watcher::<Pod, _, _>(
        Api::all(client.clone()),
        WatchSource::Pods,
        state.clone(),
        shutdown.clone(),
        move |s, p| {
            if pod::is_provisionable(&p, chrono::Utc::now()) {
                pod_trigger.poke();
            }
            s.update_pod(p);
        },
        |s, p| s.delete_pod(&PodKey::from_pod(&p)),
    ));

    handles.push(run_watcher::<DaemonSet, _, _>(
        Api::all(client.clone()),
        WatchSource::DaemonSets,
        state.clone(),
        shutdown.clone(),
        |s, ds| s.update_daemonset(ds),
        |s, ds| {
            s.delete_daemonset(
                ds.metadata.namespace.as_deref().unwrap_or_default(),
                &ds.name_any(),
            )
        },
    ));

    handles.push(run_watcher::<PersistentVolumeClaim, _, _>(
        Api::all(client.clone()),
        WatchSource::PersistentVolumeClaims,
        state.clone(),
        shutdown.clone(),
        |s, pvc| s.update_pvc(pvc),
        |s, pvc| {
            s.delete_pvc(
                pvc.metadata.namespace.as_deref().unwrap_or_default(),
                &pvc.name_any(),
            )
        },
    ));

    handles.push(run_watcher::<PersistentVolume, _, _>(
        Api::all(client.clone()),
        WatchSource::PersistentVolumes,
        state.clone(),
        shutdown.clone(),
        |s, pv| s.update_pv(pv),
        |s, pv| s.delete_pv(&pv.name_any()),
    ));

    handles.push(run_watcher::<StorageClass, _, _>(
        Api::all(client.clone()),
        WatchSource::StorageClasses,
        state.clone(),
        shutdown.clone(),
        |s, sc| s.update_storage_class(sc),
        |s, sc| s.delete_storage_class(&sc.name_any()),
    ));

    handles.push(run_watcher::<PodDisruptionBudget, _, _>(
        Api::all(client.clone()),
        WatchSource::PodDisruptionBudgets,
        state.clone(),
        shutdown.clone(),
        |s, pdb| s.update_pdb(pdb),
        |s, pdb| {
            s.delete_pdb(
                pdb.metadata.namespace.as_deref().unwrap_or_default(),
                &pdb.name_any(),
            )
        },
    ));

    handles.push(run_watcher::<VolumeAttachment, _, _>(
        Api::all(client.clone()),
        WatchSource::VolumeAttachments,
        state.clone(),
        shutdown,
        |s, va| s.update_volume_attachment(va),
        |s, va| s.delete_volume_attachment(&va.name_any()),
    ));

    handles
}
