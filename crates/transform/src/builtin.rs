//! Dedicated transforms for common built-in kinds.

use kollect_core::{EdgeType, Node, TransformError};
use serde_json::{json, Value};

use crate::common::{array_at, bool_at, common, i64_at, str_at};
use crate::edges::EdgeRules;
use crate::{TransformContext, TransformOutput, TransformRegistryBuilder};

pub(crate) fn register(builder: TransformRegistryBuilder) -> TransformRegistryBuilder {
    builder
        .register("Pod", "", pod)
        .register("Node", "", node)
        .register("Namespace", "", namespace)
        .register("Service", "", service)
        .register("Secret", "", secret)
        .register("PersistentVolume", "", persistent_volume)
        .register("PersistentVolumeClaim", "", persistent_volume_claim)
        .register("Deployment", "apps", workload)
        .register("ReplicaSet", "apps", workload)
        .register("StatefulSet", "apps", workload)
        .register("DaemonSet", "apps", daemon_set)
        .register("Job", "batch", job)
        .register("CronJob", "batch", cron_job)
}

fn done(node: Node, rules: EdgeRules) -> Result<TransformOutput, TransformError> {
    Ok(TransformOutput { node, edges: rules.into_fn() })
}

fn set(node: &mut Node, key: &str, value: Option<impl Into<Value>>) {
    if let Some(v) = value {
        node.properties.insert(key.to_string(), v.into());
    }
}

/// Parse plain integer quantities ("4"); anything with a unit stays a string.
fn quantity(v: Option<&str>) -> Option<Value> {
    let s = v?;
    Some(s.parse::<i64>().map(Value::from).unwrap_or_else(|_| Value::from(s)))
}

fn pod_status(raw: &Value) -> Option<String> {
    if str_at(raw, &["metadata", "deletionTimestamp"]).is_some() {
        return Some("Terminating".into());
    }
    // A waiting/terminated container reason is more telling than the phase.
    for cs in array_at(raw, &["status", "containerStatuses"]) {
        if let Some(reason) = str_at(cs, &["state", "waiting", "reason"])
            .or_else(|| str_at(cs, &["state", "terminated", "reason"]))
        {
            return Some(reason.to_string());
        }
    }
    str_at(raw, &["status", "reason"])
        .or_else(|| str_at(raw, &["status", "phase"]))
        .map(str::to_string)
}

fn pod(ctx: &TransformContext, raw: &Value) -> Result<TransformOutput, TransformError> {
    let (mut node, mut rules) = common(ctx, raw)?;
    let restarts: i64 = array_at(raw, &["status", "containerStatuses"])
        .iter()
        .filter_map(|cs| i64_at(cs, &["restartCount"]))
        .sum();
    let containers = array_at(raw, &["spec", "containers"]);
    let names: Vec<&str> = containers.iter().filter_map(|c| str_at(c, &["name"])).collect();
    let images: Vec<&str> = containers.iter().filter_map(|c| str_at(c, &["image"])).collect();

    set(&mut node, "status", pod_status(raw));
    set(&mut node, "restarts", Some(restarts));
    set(&mut node, "hostIP", str_at(raw, &["status", "hostIP"]));
    set(&mut node, "podIP", str_at(raw, &["status", "podIP"]));
    set(&mut node, "startedAt", str_at(raw, &["status", "startTime"]));
    set(&mut node, "container", Some(json!(names)));
    set(&mut node, "image", Some(json!(images)));

    if let Some(host) = str_at(raw, &["spec", "nodeName"]) {
        rules.to_cluster_scoped("Node", host, EdgeType::RunsOn);
    }
    for vol in array_at(raw, &["spec", "volumes"]) {
        if let Some(name) = str_at(vol, &["configMap", "name"]) {
            rules.to_named("ConfigMap", name, EdgeType::Uses);
        }
        if let Some(name) = str_at(vol, &["secret", "secretName"]) {
            rules.to_named("Secret", name, EdgeType::Uses);
        }
        if let Some(name) = str_at(vol, &["persistentVolumeClaim", "claimName"]) {
            rules.to_named("PersistentVolumeClaim", name, EdgeType::Uses);
        }
    }
    for c in containers {
        for src in array_at(c, &["envFrom"]) {
            if let Some(name) = str_at(src, &["configMapRef", "name"]) {
                rules.to_named("ConfigMap", name, EdgeType::Uses);
            }
            if let Some(name) = str_at(src, &["secretRef", "name"]) {
                rules.to_named("Secret", name, EdgeType::Uses);
            }
        }
        for env in array_at(c, &["env"]) {
            if let Some(name) = str_at(env, &["valueFrom", "configMapKeyRef", "name"]) {
                rules.to_named("ConfigMap", name, EdgeType::Uses);
            }
            if let Some(name) = str_at(env, &["valueFrom", "secretKeyRef", "name"]) {
                rules.to_named("Secret", name, EdgeType::Uses);
            }
        }
    }
    done(node, rules)
}

fn node(ctx: &TransformContext, raw: &Value) -> Result<TransformOutput, TransformError> {
    let (mut node, rules) = common(ctx, raw)?;
    let mut roles: Vec<&str> = raw
        .pointer("/metadata/labels")
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .keys()
                .filter_map(|k| k.strip_prefix("node-role.kubernetes.io/"))
                .filter(|r| !r.is_empty())
                .collect()
        })
        .unwrap_or_default();
    roles.sort_unstable();
    let internal_ip = array_at(raw, &["status", "addresses"])
        .iter()
        .find(|a| str_at(a, &["type"]) == Some("InternalIP"))
        .and_then(|a| str_at(a, &["address"]));

    set(&mut node, "role", Some(json!(roles)));
    set(&mut node, "architecture", str_at(raw, &["status", "nodeInfo", "architecture"]));
    set(&mut node, "osImage", str_at(raw, &["status", "nodeInfo", "osImage"]));
    set(&mut node, "cpu", quantity(str_at(raw, &["status", "capacity", "cpu"])));
    set(&mut node, "ipAddress", internal_ip);
    done(node, rules)
}

fn namespace(ctx: &TransformContext, raw: &Value) -> Result<TransformOutput, TransformError> {
    let (mut node, rules) = common(ctx, raw)?;
    set(&mut node, "status", str_at(raw, &["status", "phase"]));
    done(node, rules)
}

fn service(ctx: &TransformContext, raw: &Value) -> Result<TransformOutput, TransformError> {
    let (mut node, rules) = common(ctx, raw)?;
    let ports: Vec<String> = array_at(raw, &["spec", "ports"])
        .iter()
        .map(|p| {
            let port = i64_at(p, &["port"]).unwrap_or(0);
            let protocol = str_at(p, &["protocol"]).unwrap_or("TCP");
            match i64_at(p, &["nodePort"]) {
                Some(np) => format!("{}:{}/{}", port, np, protocol),
                None => format!("{}/{}", port, protocol),
            }
        })
        .collect();
    set(&mut node, "type", str_at(raw, &["spec", "type"]));
    set(&mut node, "clusterIP", str_at(raw, &["spec", "clusterIP"]));
    set(&mut node, "port", Some(json!(ports)));
    done(node, rules)
}

fn secret(ctx: &TransformContext, raw: &Value) -> Result<TransformOutput, TransformError> {
    let (mut node, rules) = common(ctx, raw)?;
    set(&mut node, "type", str_at(raw, &["type"]));
    done(node, rules)
}

fn persistent_volume(ctx: &TransformContext, raw: &Value) -> Result<TransformOutput, TransformError> {
    let (mut node, rules) = common(ctx, raw)?;
    set(&mut node, "status", str_at(raw, &["status", "phase"]));
    set(&mut node, "capacity", str_at(raw, &["spec", "capacity", "storage"]));
    set(&mut node, "storageClassName", str_at(raw, &["spec", "storageClassName"]));
    set(&mut node, "reclaimPolicy", str_at(raw, &["spec", "persistentVolumeReclaimPolicy"]));
    done(node, rules)
}

fn persistent_volume_claim(ctx: &TransformContext, raw: &Value) -> Result<TransformOutput, TransformError> {
    let (mut node, mut rules) = common(ctx, raw)?;
    let modes: Vec<&str> = array_at(raw, &["spec", "accessModes"]).iter().filter_map(Value::as_str).collect();
    set(&mut node, "status", str_at(raw, &["status", "phase"]));
    set(&mut node, "volumeName", str_at(raw, &["spec", "volumeName"]));
    set(&mut node, "storageClassName", str_at(raw, &["spec", "storageClassName"]));
    set(&mut node, "requestedStorage", str_at(raw, &["spec", "resources", "requests", "storage"]));
    set(&mut node, "accessMode", Some(json!(modes)));
    if let Some(pv) = str_at(raw, &["spec", "volumeName"]) {
        rules.to_cluster_scoped("PersistentVolume", pv, EdgeType::AttachedTo);
    }
    done(node, rules)
}

/// Deployment, ReplicaSet and StatefulSet share the replica counters.
fn workload(ctx: &TransformContext, raw: &Value) -> Result<TransformOutput, TransformError> {
    let (mut node, rules) = common(ctx, raw)?;
    set(&mut node, "desired", Some(i64_at(raw, &["spec", "replicas"]).unwrap_or(1)));
    set(&mut node, "current", Some(i64_at(raw, &["status", "replicas"]).unwrap_or(0)));
    set(&mut node, "ready", Some(i64_at(raw, &["status", "readyReplicas"]).unwrap_or(0)));
    set(&mut node, "available", Some(i64_at(raw, &["status", "availableReplicas"]).unwrap_or(0)));
    done(node, rules)
}

fn daemon_set(ctx: &TransformContext, raw: &Value) -> Result<TransformOutput, TransformError> {
    let (mut node, rules) = common(ctx, raw)?;
    set(&mut node, "desired", Some(i64_at(raw, &["status", "desiredNumberScheduled"]).unwrap_or(0)));
    set(&mut node, "current", Some(i64_at(raw, &["status", "currentNumberScheduled"]).unwrap_or(0)));
    set(&mut node, "ready", Some(i64_at(raw, &["status", "numberReady"]).unwrap_or(0)));
    set(&mut node, "available", Some(i64_at(raw, &["status", "numberAvailable"]).unwrap_or(0)));
    done(node, rules)
}

fn job(ctx: &TransformContext, raw: &Value) -> Result<TransformOutput, TransformError> {
    let (mut node, rules) = common(ctx, raw)?;
    set(&mut node, "completions", Some(i64_at(raw, &["spec", "completions"]).unwrap_or(1)));
    set(&mut node, "parallelism", Some(i64_at(raw, &["spec", "parallelism"]).unwrap_or(1)));
    set(&mut node, "successful", Some(i64_at(raw, &["status", "succeeded"]).unwrap_or(0)));
    set(&mut node, "failed", Some(i64_at(raw, &["status", "failed"]).unwrap_or(0)));
    done(node, rules)
}

fn cron_job(ctx: &TransformContext, raw: &Value) -> Result<TransformOutput, TransformError> {
    let (mut node, rules) = common(ctx, raw)?;
    set(&mut node, "schedule", str_at(raw, &["spec", "schedule"]));
    set(&mut node, "suspend", Some(bool_at(raw, &["spec", "suspend"]).unwrap_or(false)));
    set(&mut node, "active", Some(array_at(raw, &["status", "active"]).len() as i64));
    set(&mut node, "lastSchedule", str_at(raw, &["status", "lastScheduleTime"]));
    done(node, rules)
}
