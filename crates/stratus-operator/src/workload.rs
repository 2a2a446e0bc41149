//! Compilation of an Application spec into native workload objects.
//!
//! Every derived resource has a deterministic name computed from the
//! owning Application, so reconciles can garbage-collect by set
//! difference: anything carrying the application label whose name is no
//! longer derivable from the current spec is stale and gets deleted.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec,
};
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
    MetricSpec, MetricTarget, ResourceMetricSource,
};
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, Job, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, LocalObjectReference,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
    PodSpec, PodTemplateSpec, SecurityContext, Service, ServiceAccount, ServicePort,
    ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use stratus_common::crd::{
    Application, ApplicationPhase, DesiredState, GatewayType, SidecarType, WorkloadType,
};
use stratus_common::labels::{
    application_stable_labels, APPLICATION_EDITION_LABEL_KEY, LabelSet,
};

// =============================================================================
// Deterministic names
// =============================================================================

pub fn config_map_name(app: &str, file: &str) -> String {
    format!("cm-{app}-{file}")
}

pub fn pvc_name(app: &str, dir: &str) -> String {
    format!("pvc-{app}-{dir}")
}

pub fn service_name(app: &str, port: i32) -> String {
    format!("{app}-port-{port}")
}

/// Anchor object marking the application's footprint in the namespace
pub fn owner_anchor_name(app: &str) -> String {
    format!("{app}-application-owner")
}

// =============================================================================
// Labels
// =============================================================================

/// Labels stamped on every derived resource: the stable identity set plus
/// the current edition so a spec change rolls the pods
fn derived_labels(app: &Application) -> LabelSet {
    let space = app.namespace().unwrap_or_default();
    let mut labels = application_stable_labels(&space, &app.name_any());
    if let Some(edition) = app.edition() {
        labels.insert(APPLICATION_EDITION_LABEL_KEY.to_string(), edition.to_string());
    }
    labels
}

/// Pod selector labels. These exclude the edition label: selectors are
/// immutable on Deployments and StatefulSets, while the edition changes
/// on every rollout.
fn selector_labels(app: &Application) -> LabelSet {
    let space = app.namespace().unwrap_or_default();
    application_stable_labels(&space, &app.name_any())
}

fn meta(app: &Application, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: app.namespace(),
        labels: Some(derived_labels(app)),
        ..Default::default()
    }
}

// =============================================================================
// Pod template
// =============================================================================

/// Split a container file path into (mount directory, file name)
fn split_mount_path(path: &str) -> (String, String) {
    match path.rfind('/') {
        Some(0) => ("/".to_string(), path[1..].to_string()),
        Some(idx) => (path[..idx].to_string(), path[idx + 1..].to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}

fn main_container(app: &Application) -> Container {
    let name = app.name_any();
    let mut volume_mounts = Vec::new();

    for file in &app.spec.mount_files {
        let (dir, file_name) = split_mount_path(&file.path);
        volume_mounts.push(VolumeMount {
            name: format!("file-{}", file.name),
            mount_path: dir,
            sub_path: Some(file_name),
            ..Default::default()
        });
    }
    for dir in &app.spec.mount_directories {
        volume_mounts.push(VolumeMount {
            name: format!("dir-{}", dir.name),
            mount_path: dir.path.clone(),
            read_only: Some(dir.read_only).filter(|v| *v),
            ..Default::default()
        });
    }

    let ports: Vec<ContainerPort> = app
        .spec
        .ports
        .iter()
        .map(|p| ContainerPort {
            name: Some(format!("port-{}", p.number)),
            container_port: p.target_port(),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();

    Container {
        name,
        image: Some(app.spec.image.clone()),
        command: Some(app.spec.command.clone()).filter(|v| !v.is_empty()),
        args: Some(app.spec.args.clone()).filter(|v| !v.is_empty()),
        env: Some(app.spec.env.clone()).filter(|v| !v.is_empty()),
        resources: app.spec.resources.clone(),
        liveness_probe: app.spec.healthz.clone(),
        readiness_probe: app.spec.healthz.clone(),
        ports: Some(ports).filter(|v| !v.is_empty()),
        volume_mounts: Some(volume_mounts).filter(|v| !v.is_empty()),
        security_context: Some(app.spec.privileged)
            .filter(|p| *p)
            .map(|_| SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
        ..Default::default()
    }
}

fn sidecar_container(sidecar: &stratus_common::crd::Sidecar) -> Container {
    Container {
        name: sidecar.name.clone(),
        image: Some(sidecar.image.clone()),
        command: Some(sidecar.command.clone()).filter(|v| !v.is_empty()),
        args: Some(sidecar.args.clone()).filter(|v| !v.is_empty()),
        env: Some(sidecar.env.clone()).filter(|v| !v.is_empty()),
        resources: sidecar.resources.clone(),
        security_context: Some(sidecar.privileged)
            .filter(|p| *p)
            .map(|_| SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
        ..Default::default()
    }
}

fn pod_spec(app: &Application, restart_policy: Option<&str>) -> PodSpec {
    let mut init_containers = Vec::new();
    let mut containers = Vec::new();

    for sidecar in &app.spec.sidecars {
        match sidecar.type_ {
            SidecarType::InitRun => init_containers.push(sidecar_container(sidecar)),
            SidecarType::PreRun => containers.push(sidecar_container(sidecar)),
            SidecarType::PostRun => {}
        }
    }
    containers.push(main_container(app));
    for sidecar in &app.spec.sidecars {
        if sidecar.type_ == SidecarType::PostRun {
            containers.push(sidecar_container(sidecar));
        }
    }

    let mut volumes = Vec::new();
    let name = app.name_any();
    for file in &app.spec.mount_files {
        volumes.push(Volume {
            name: format!("file-{}", file.name),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map_name(&name, &file.name),
                default_mode: file.mode,
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    for dir in &app.spec.mount_directories {
        volumes.push(Volume {
            name: format!("dir-{}", dir.name),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: pvc_name(&name, &dir.name),
                read_only: Some(dir.read_only).filter(|v| *v),
            }),
            ..Default::default()
        });
    }

    PodSpec {
        containers,
        init_containers: Some(init_containers).filter(|v| !v.is_empty()),
        volumes: Some(volumes).filter(|v| !v.is_empty()),
        restart_policy: restart_policy.map(str::to_string),
        image_pull_secrets: Some(
            app.spec
                .image_pull_secrets
                .iter()
                .map(|s| LocalObjectReference { name: s.clone() })
                .collect::<Vec<_>>(),
        )
        .filter(|v: &Vec<_>| !v.is_empty()),
        ..Default::default()
    }
}

fn pod_template(app: &Application, restart_policy: Option<&str>) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(derived_labels(app)),
            ..Default::default()
        }),
        spec: Some(pod_spec(app, restart_policy)),
    }
}

// =============================================================================
// Workload objects
// =============================================================================

pub fn owner_anchor(app: &Application) -> ServiceAccount {
    ServiceAccount {
        metadata: meta(app, owner_anchor_name(&app.name_any())),
        ..Default::default()
    }
}

pub fn deployment(app: &Application) -> Deployment {
    Deployment {
        metadata: meta(app, app.name_any()),
        spec: Some(DeploymentSpec {
            replicas: Some(app.desired_replicas()),
            selector: LabelSelector {
                match_labels: Some(selector_labels(app)),
                ..Default::default()
            },
            template: pod_template(app, None),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn stateful_set(app: &Application) -> StatefulSet {
    let name = app.name_any();
    StatefulSet {
        metadata: meta(app, name.clone()),
        spec: Some(StatefulSetSpec {
            replicas: Some(app.desired_replicas()),
            service_name: Some(name),
            selector: LabelSelector {
                match_labels: Some(selector_labels(app)),
                ..Default::default()
            },
            template: pod_template(app, None),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn job(app: &Application) -> Job {
    Job {
        metadata: meta(app, app.name_any()),
        spec: Some(JobSpec {
            template: pod_template(app, Some("Never")),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn cron_job(app: &Application) -> CronJob {
    CronJob {
        metadata: meta(app, app.name_any()),
        spec: Some(CronJobSpec {
            schedule: app.spec.cron_schedule.clone().unwrap_or_default(),
            job_template: JobTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(derived_labels(app)),
                    ..Default::default()
                }),
                spec: Some(JobSpec {
                    template: pod_template(app, Some("Never")),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The autoscaler only applies to Deployment workloads
pub fn hpa(app: &Application) -> Option<HorizontalPodAutoscaler> {
    if app.spec.type_ != WorkloadType::Deployment {
        return None;
    }
    let autoscaler = app.spec.autoscaler.as_ref()?;
    Some(HorizontalPodAutoscaler {
        metadata: meta(app, app.name_any()),
        spec: Some(HorizontalPodAutoscalerSpec {
            min_replicas: Some(autoscaler.min_replicas),
            max_replicas: autoscaler.max_replicas,
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name: app.name_any(),
            },
            metrics: Some(vec![MetricSpec {
                type_: "Resource".to_string(),
                resource: Some(ResourceMetricSource {
                    name: "cpu".to_string(),
                    target: MetricTarget {
                        type_: "Utilization".to_string(),
                        average_utilization: Some(
                            autoscaler.target_cpu_utilization_percentage,
                        ),
                        ..Default::default()
                    },
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

// =============================================================================
// Derived resources
// =============================================================================

pub fn config_maps(app: &Application) -> Vec<ConfigMap> {
    let name = app.name_any();
    app.spec
        .mount_files
        .iter()
        .map(|file| {
            let (_, file_name) = split_mount_path(&file.path);
            ConfigMap {
                metadata: meta(app, config_map_name(&name, &file.name)),
                data: Some(BTreeMap::from([(file_name, file.content.clone())])),
                ..Default::default()
            }
        })
        .collect()
}

pub fn pvcs(app: &Application) -> Vec<PersistentVolumeClaim> {
    let name = app.name_any();
    app.spec
        .mount_directories
        .iter()
        .map(|dir| PersistentVolumeClaim {
            metadata: meta(app, pvc_name(&name, &dir.name)),
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: dir.storage_class_name.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        dir.storage_capacity.clone(),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect()
}

/// One ClusterIP Service per declared port; a TCP gateway binding
/// upgrades it to NodePort
pub fn services(app: &Application) -> Vec<Service> {
    let name = app.name_any();
    app.spec
        .ports
        .iter()
        .map(|port| {
            let node_port = port
                .gateways
                .iter()
                .find(|g| g.type_ == GatewayType::TCP)
                .and_then(|g| g.node_port);
            Service {
                metadata: meta(app, service_name(&name, port.number)),
                spec: Some(ServiceSpec {
                    selector: Some(selector_labels(app)),
                    type_: Some(if node_port.is_some() {
                        "NodePort".to_string()
                    } else {
                        "ClusterIP".to_string()
                    }),
                    ports: Some(vec![ServicePort {
                        name: Some(format!("port-{}", port.number)),
                        port: port.number,
                        target_port: Some(IntOrString::Int(port.target_port())),
                        node_port,
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            }
        })
        .collect()
}

// =============================================================================
// Garbage collection
// =============================================================================

/// Names present in the cluster but not derivable from the current spec
pub fn stale(existing: &[String], desired: impl IntoIterator<Item = String>) -> Vec<String> {
    let desired: BTreeSet<String> = desired.into_iter().collect();
    existing
        .iter()
        .filter(|name| !desired.contains(*name))
        .cloned()
        .collect()
}

pub fn desired_config_map_names(app: &Application) -> Vec<String> {
    let name = app.name_any();
    app.spec
        .mount_files
        .iter()
        .map(|f| config_map_name(&name, &f.name))
        .collect()
}

pub fn desired_pvc_names(app: &Application) -> Vec<String> {
    let name = app.name_any();
    app.spec
        .mount_directories
        .iter()
        .map(|d| pvc_name(&name, &d.name))
        .collect()
}

pub fn desired_service_names(app: &Application) -> Vec<String> {
    let name = app.name_any();
    app.spec
        .ports
        .iter()
        .map(|p| service_name(&name, p.number))
        .collect()
}

// =============================================================================
// Phase computation
// =============================================================================

/// Replica counts observed on the live workload object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkloadObservation {
    /// Total replicas the workload currently tracks
    pub replicas: i32,
    /// Replicas that are ready/available
    pub ready: i32,
}

/// Derive the application phase from desired and observed state
pub fn compute_phase(
    desired_state: DesiredState,
    desired_replicas: i32,
    observed: Option<WorkloadObservation>,
) -> ApplicationPhase {
    match desired_state {
        DesiredState::Stopped => match observed {
            None => ApplicationPhase::Stopped,
            Some(obs) if obs.replicas == 0 => ApplicationPhase::Stopped,
            Some(_) => ApplicationPhase::Stopping,
        },
        DesiredState::Running => match observed {
            None => ApplicationPhase::Starting,
            Some(obs) if obs.replicas > desired_replicas => ApplicationPhase::Rolling,
            Some(obs) if obs.replicas == desired_replicas && obs.ready == desired_replicas => {
                ApplicationPhase::Running
            }
            Some(_) => ApplicationPhase::Starting,
        },
    }
}
