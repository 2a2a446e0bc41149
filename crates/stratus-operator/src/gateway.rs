//! Gateway API objects built as untyped resources.
//!
//! Worker clusters may or may not serve the Gateway API group, so these
//! objects are constructed as `DynamicObject`s and only applied after a
//! capability probe confirmed the group exists. One shared Gateway per
//! GatewayClass lives in the system namespace; application HTTPRoutes
//! attach to it from their own namespaces.

use kube::api::{DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use serde_json::json;

use stratus_common::crd::{GatewayBinding, GatewayType, Port};
use stratus_common::labels::{application_stable_labels, cluster_required_labels, SYSTEM_NAMESPACE};

pub const GATEWAY_GROUP: &str = "gateway.networking.k8s.io";
pub const GATEWAY_VERSION: &str = "v1";

pub fn gateway_class_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind {
        group: GATEWAY_GROUP.to_string(),
        version: GATEWAY_VERSION.to_string(),
        kind: "GatewayClass".to_string(),
    })
}

pub fn gateway_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind {
        group: GATEWAY_GROUP.to_string(),
        version: GATEWAY_VERSION.to_string(),
        kind: "Gateway".to_string(),
    })
}

pub fn http_route_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind {
        group: GATEWAY_GROUP.to_string(),
        version: GATEWAY_VERSION.to_string(),
        kind: "HTTPRoute".to_string(),
    })
}

/// Name of the shared Gateway provisioned for one GatewayClass
pub fn gateway_name(class: &str) -> String {
    format!("stratus-gateway-{class}")
}

/// Name of the HTTPRoute exposing one application port through one class
pub fn http_route_name(app: &str, port: i32, class: &str) -> String {
    format!("{app}-port-{port}-{class}")
}

/// Build the shared HTTP Gateway for a GatewayClass: one port-80 listener
/// per wildcard domain, open to routes from all namespaces
pub fn build_gateway(cluster: &str, class: &str, domains: &[String]) -> DynamicObject {
    let listeners: Vec<serde_json::Value> = if domains.is_empty() {
        vec![json!({
            "name": "http",
            "port": 80,
            "protocol": "HTTP",
            "allowedRoutes": { "namespaces": { "from": "All" } }
        })]
    } else {
        domains
            .iter()
            .enumerate()
            .map(|(idx, domain)| {
                json!({
                    "name": format!("http-{idx}"),
                    "hostname": domain,
                    "port": 80,
                    "protocol": "HTTP",
                    "allowedRoutes": { "namespaces": { "from": "All" } }
                })
            })
            .collect()
    };

    let mut obj = DynamicObject::new(&gateway_name(class), &gateway_resource());
    obj.metadata.namespace = Some(SYSTEM_NAMESPACE.to_string());
    obj.metadata.labels = Some(cluster_required_labels(cluster));
    obj.data = json!({
        "spec": {
            "gatewayClassName": class,
            "listeners": listeners
        }
    });
    obj
}

/// Build the HTTPRoute for one HTTP gateway binding of a port.
///
/// Returns `None` when the binding carries no host or no class, which
/// makes it unroutable rather than invalid.
pub fn build_http_route(
    namespace: &str,
    app: &str,
    service: &str,
    port: &Port,
    binding: &GatewayBinding,
) -> Option<DynamicObject> {
    if binding.type_ != GatewayType::HTTP {
        return None;
    }
    let host = binding.host.as_deref()?;
    let class = binding.class_name.as_deref()?;
    let path = binding.path.as_deref().unwrap_or("/");

    let mut obj = DynamicObject::new(
        &http_route_name(app, port.number, class),
        &http_route_resource(),
    );
    obj.metadata.namespace = Some(namespace.to_string());
    obj.metadata.labels = Some(application_stable_labels(namespace, app));
    obj.data = json!({
        "spec": {
            "parentRefs": [{
                "name": gateway_name(class),
                "namespace": SYSTEM_NAMESPACE
            }],
            "hostnames": [host],
            "rules": [{
                "matches": [{
                    "path": { "type": "PathPrefix", "value": path }
                }],
                "backendRefs": [{
                    "name": service,
                    "port": port.number
                }]
            }]
        }
    });
    Some(obj)
}
