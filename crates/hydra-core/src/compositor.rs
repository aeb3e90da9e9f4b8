//! Joins pods, endpoints and identity records into device views.
//!
//! The list always mirrors the identity records: a user without a pod still
//! gets a device, just with empty runtime fields.

use std::collections::HashMap;

use crate::cluster::{Endpoint, Pod};
use crate::config::HydraConfig;
use crate::device::{DEVICE_TYPE_CPU, DEVICE_TYPE_GPU, Device, DeviceSpec, STATUS_TERMINATING};
use crate::identity::User;
use crate::labels::{SANDBOX_LABEL, USER_LABEL};
use crate::quantity;

/// Build the reachable URL(s) of one endpoint port.
///
/// With a single server address the ingress mode is honoured; with a
/// comma-separated list one `http://{address}:{port}` per address is joined
/// with commas and the ingress mode is ignored.
#[must_use]
pub fn combine_url(
    server_address: &str,
    username: &str,
    port_name: &str,
    port: u16,
    config: &HydraConfig,
) -> String {
    let addresses: Vec<&str> = server_address.split(',').collect();
    if addresses.len() <= 1 {
        let ingress = &config.ingress;
        if !ingress.enable_base_url {
            return format!("http://{server_address}:{port}");
        }
        return match ingress.port_name_mapping.get(port_name) {
            Some(suffix) => format!(
                "http://{server_address}:{}/{username}-{port_name}/{suffix}",
                ingress.port
            ),
            None => format!("http://{server_address}:{}/{username}", ingress.port),
        };
    }

    addresses
        .iter()
        .map(|address| format!("http://{address}:{port}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn index_by_user<'a, T>(
    items: &'a [T],
    labels: impl Fn(&'a T) -> Option<&'a str>,
) -> HashMap<&'a str, &'a T> {
    // later entries win; at most one per user is expected
    items.iter().filter_map(|item| labels(item).map(|user| (user, item))).collect()
}

fn fill_from_pod(device: &mut Device, user: &User, pod: &Pod, config: &HydraConfig) {
    device.metadata.labels.clone_from(&pod.metadata.labels);
    device.metadata.creation_timestamp = pod.metadata.creation_timestamp;

    let spec = &mut device.spec;
    if let Some(container) = pod.spec.primary_container() {
        let requests = &container.resources.requests;
        let canonical = |name: &str| requests.get(name).map(|q| quantity::canonical(q));
        spec.device_cpu = canonical("cpu").unwrap_or_default();
        spec.device_ram = canonical("memory").unwrap_or_default();
        match requests.get(&config.default_gpu_driver) {
            Some(count) => {
                spec.device_type = DEVICE_TYPE_GPU.to_string();
                spec.gpu_driver.clone_from(&config.default_gpu_driver);
                spec.device_gpu = quantity::parse_count(count)
                    .and_then(|n| u8::try_from(n).ok())
                    .unwrap_or_default();
            }
            None => spec.device_type = DEVICE_TYPE_CPU.to_string(),
        }
    }

    spec.device_ip = pod.status.pod_ip.clone().unwrap_or_default();
    spec.device_name.clone_from(&pod.metadata.name);
    spec.device_namespace.clone_from(&pod.metadata.namespace);
    spec.open_hydra_username = user.name().to_string();
    spec.line_no = "0".to_string();
    spec.device_status = if pod.metadata.deletion_timestamp.is_some() {
        STATUS_TERMINATING.to_string()
    } else {
        pod.status.phase.to_string()
    };
    if let Some(sandbox) = pod.metadata.label(SANDBOX_LABEL) {
        spec.sandbox_name = sandbox.to_string();
    }
}

/// Combine cluster state with identity records, one device per user.
#[must_use]
pub fn combine(
    pods: &[Pod],
    endpoints: &[Endpoint],
    users: &[User],
    config: &HydraConfig,
) -> Vec<Device> {
    let pods_by_user = index_by_user(pods, |p: &Pod| p.metadata.label(USER_LABEL));
    let endpoints_by_user = index_by_user(endpoints, |e: &Endpoint| e.metadata.label(USER_LABEL));

    users
        .iter()
        .map(|user| {
            let mut device = Device {
                metadata: crate::cluster::ObjectMeta::named(
                    user.name(),
                    user.metadata.namespace.clone(),
                ),
                spec: DeviceSpec {
                    role: user.spec.role,
                    chinese_name: user.spec.chinese_name.clone(),
                    ..Default::default()
                },
            };

            if let Some(pod) = pods_by_user.get(user.name()) {
                fill_from_pod(&mut device, user, pod, config);
            }

            if let Some(endpoint) = endpoints_by_user.get(user.name()) {
                device.spec.sandbox_urls = endpoint
                    .spec
                    .ports
                    .iter()
                    .map(|port| {
                        combine_url(
                            &config.server_ip,
                            user.name(),
                            &port.name,
                            port.node_port.unwrap_or_default(),
                            config,
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(",");
            }
            device
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{
        Container, EndpointPort, EndpointSpec, ObjectMeta, PodPhase, PodSpec, PodStatus,
        ResourceRequirements,
    };
    use crate::config::IngressConfig;
    use crate::identity::{ROLE_PRIVILEGED, ROLE_STANDARD};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use test_case::test_case;

    fn pod(user: &str, requests: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta::named(format!("openhydra-deploy-{user}-abc"), "open-hydra")
                .with_label(USER_LABEL, user)
                .with_label(SANDBOX_LABEL, "jupyter-lab"),
            spec: PodSpec {
                containers: vec![Container {
                    resources: ResourceRequirements {
                        requests: requests
                            .iter()
                            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                            .collect(),
                        limits: BTreeMap::new(),
                    },
                    ..Default::default()
                }],
                ..Default::default()
            },
            status: PodStatus {
                phase: PodPhase::Running,
                pod_ip: Some("10.1.0.5".to_string()),
            },
        }
    }

    fn endpoint(user: &str, ports: &[(&str, u16)]) -> Endpoint {
        Endpoint {
            metadata: ObjectMeta::named(format!("openhydra-service-{user}"), "open-hydra")
                .with_label(USER_LABEL, user),
            spec: EndpointSpec {
                ports: ports
                    .iter()
                    .map(|(name, node_port)| EndpointPort {
                        name: (*name).to_string(),
                        port: 8888,
                        target_port: 8888,
                        node_port: Some(*node_port),
                    })
                    .collect(),
                ..Default::default()
            },
        }
    }

    fn ingress_config() -> HydraConfig {
        HydraConfig::default().with_ingress(IngressConfig {
            enable_base_url: true,
            port: 30006,
            port_name_mapping: BTreeMap::from([("jupyter-lab".to_string(), "lab".to_string())]),
        })
    }

    #[test_case("localhost", 5000, "http://localhost:5000" ; "single address")]
    #[test_case(
        "localhost,10.0.0.10",
        5000,
        "http://localhost:5000,http://10.0.0.10:5000" ;
        "multiple addresses"
    )]
    fn test_combine_url_without_ingress(server: &str, port: u16, expected: &str) {
        let url = combine_url(server, "alice", "jupyter-lab", port, &HydraConfig::default());
        assert_eq!(url, expected);
    }

    #[test]
    fn test_combine_url_with_ingress() {
        let config = ingress_config();
        assert_eq!(
            combine_url("localhost", "alice", "jupyter-lab", 31000, &config),
            "http://localhost:30006/alice-jupyter-lab/lab"
        );
        assert_eq!(
            combine_url("localhost", "alice", "vscode", 31000, &config),
            "http://localhost:30006/alice"
        );
        assert_eq!(
            combine_url("a,b", "alice", "jupyter-lab", 31000, &config),
            "http://a:31000,http://b:31000"
        );
    }

    #[test]
    fn test_user_without_pod_still_listed() {
        let users = [User::new("alice", ROLE_STANDARD).with_chinese_name("Alice")];
        let devices = combine(&[], &[], &users, &HydraConfig::default());
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].metadata.name, "alice");
        assert_eq!(devices[0].spec.chinese_name, "Alice");
        assert_eq!(devices[0].spec.role, ROLE_STANDARD);
        assert!(devices[0].spec.device_status.is_empty());
        assert!(devices[0].spec.device_ip.is_empty());
        assert!(devices[0].spec.sandbox_urls.is_empty());
    }

    #[test]
    fn test_cpu_device_view() {
        let users = [User::new("alice", ROLE_STANDARD)];
        let pods = [pod("alice", &[("cpu", "2000m"), ("memory", "8192Mi")])];
        let endpoints = [endpoint("alice", &[("jupyter-lab", 30001), ("vscode", 30002)])];
        let config = HydraConfig::default().with_server_ip("10.0.0.1");

        let device = &combine(&pods, &endpoints, &users, &config)[0];
        assert_eq!(device.spec.device_type, DEVICE_TYPE_CPU);
        assert_eq!(device.spec.device_cpu, "2");
        assert_eq!(device.spec.device_ram, "8Gi");
        assert_eq!(device.spec.device_ip, "10.1.0.5");
        assert_eq!(device.spec.device_status, "Running");
        assert_eq!(device.spec.sandbox_name, "jupyter-lab");
        assert_eq!(device.spec.open_hydra_username, "alice");
        assert_eq!(device.spec.line_no, "0");
        assert_eq!(device.spec.sandbox_urls, "http://10.0.0.1:30001,http://10.0.0.1:30002");
        assert_eq!(device.metadata.label(USER_LABEL), Some("alice"));
    }

    #[test]
    fn test_gpu_device_view() {
        let config = HydraConfig::default();
        let users = [User::new("root", ROLE_PRIVILEGED)];
        let gpu = config.default_gpu_driver.as_str();
        let pods = [pod("root", &[("cpu", "500m"), ("memory", "1024Mi"), (gpu, "2")])];

        let device = &combine(&pods, &[], &users, &config)[0];
        assert_eq!(device.spec.device_type, DEVICE_TYPE_GPU);
        assert_eq!(device.spec.device_gpu, 2);
        assert_eq!(device.spec.gpu_driver, config.default_gpu_driver);
        assert_eq!(device.spec.device_cpu, "500m");
        assert_eq!(device.spec.device_ram, "1Gi");
    }

    #[test]
    fn test_deletion_timestamp_reports_terminating() {
        let users = [User::new("alice", ROLE_STANDARD)];
        let mut terminating = pod("alice", &[("cpu", "2000m")]);
        terminating.metadata.deletion_timestamp = Some(Utc::now());

        let devices = combine(&[terminating], &[], &users, &HydraConfig::default());
        assert_eq!(devices[0].spec.device_status, STATUS_TERMINATING);
    }

    #[test]
    fn test_objects_without_user_label_are_ignored() {
        let users = [User::new("alice", ROLE_STANDARD)];
        let mut stray = pod("alice", &[("cpu", "1000m")]);
        stray.metadata.labels.remove(USER_LABEL);

        let devices = combine(&[stray], &[], &users, &HydraConfig::default());
        assert!(devices[0].spec.device_type.is_empty());
    }
}
