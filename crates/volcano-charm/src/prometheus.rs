//! Scrape jobs the scheduler charm publishes on its `metrics-endpoint` relation.
use serde_json::{Value, json};

const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const API_SERVER: &str = "kubernetes.default.svc:443";
const ANNOTATED_ADDRESS: &str = r"([^:]+)(?::\d+)?;(\d+)";

/// Jobs scraping the API server, the nodes, annotated pods and service endpoints, cAdvisor and
/// kube-state-metrics deployed in `kube_state_metrics_namespace`.
pub fn scrape_jobs(kube_state_metrics_namespace: &str) -> Vec<Value> {
    vec![
        json!({
            "job_name": "kubernetes-apiservers",
            "kubernetes_sd_configs": [{"role": "endpoints"}],
            "scheme": "https",
            "tls_config": {"ca_file": SERVICE_ACCOUNT_CA},
            "bearer_token_file": SERVICE_ACCOUNT_TOKEN,
            "relabel_configs": [{
                "source_labels": [
                    "__meta_kubernetes_namespace",
                    "__meta_kubernetes_service_name",
                    "__meta_kubernetes_endpoint_port_name",
                ],
                "action": "keep",
                "regex": "default;kubernetes;https",
            }],
        }),
        json!({
            "job_name": "kubernetes-nodes",
            "scheme": "https",
            "tls_config": {"ca_file": SERVICE_ACCOUNT_CA},
            "bearer_token_file": SERVICE_ACCOUNT_TOKEN,
            "kubernetes_sd_configs": [{"role": "node"}],
            "relabel_configs": [
                {"action": "labelmap", "regex": "__meta_kubernetes_node_label_(.+)"},
                {"target_label": "__address__", "replacement": API_SERVER},
                {
                    "source_labels": ["__meta_kubernetes_node_name"],
                    "regex": "(.+)",
                    "target_label": "__metrics_path__",
                    "replacement": "/api/v1/nodes/${1}/proxy/metrics",
                },
            ],
        }),
        json!({
            "job_name": "kubernetes-pods",
            "kubernetes_sd_configs": [{"role": "pod"}],
            "relabel_configs": [
                {
                    "source_labels": ["__meta_kubernetes_pod_annotation_prometheus_io_scrape"],
                    "action": "keep",
                    "regex": "true",
                },
                {
                    "source_labels": ["__meta_kubernetes_pod_annotation_prometheus_io_path"],
                    "action": "replace",
                    "target_label": "__metrics_path__",
                    "regex": "(.+)",
                },
                {
                    "source_labels": [
                        "__address__",
                        "__meta_kubernetes_pod_annotation_prometheus_io_port",
                    ],
                    "action": "replace",
                    "regex": ANNOTATED_ADDRESS,
                    "replacement": "$1:$2",
                    "target_label": "__address__",
                },
                {"action": "labelmap", "regex": "__meta_kubernetes_pod_label_(.+)"},
                {
                    "source_labels": ["__meta_kubernetes_namespace"],
                    "action": "replace",
                    "target_label": "kubernetes_namespace",
                },
                {
                    "source_labels": ["__meta_kubernetes_pod_name"],
                    "action": "replace",
                    "target_label": "kubernetes_pod_name",
                },
            ],
        }),
        json!({
            "job_name": "kube-state-metrics",
            "static_configs": [{
                "targets": [format!(
                    "kube-state-metrics.{kube_state_metrics_namespace}.svc.cluster.local:8080"
                )],
            }],
        }),
        json!({
            "job_name": "kubernetes-cadvisor",
            "scheme": "https",
            "tls_config": {"ca_file": SERVICE_ACCOUNT_CA},
            "bearer_token_file": SERVICE_ACCOUNT_TOKEN,
            "kubernetes_sd_configs": [{"role": "node"}],
            "relabel_configs": [
                {"action": "labelmap", "regex": "__meta_kubernetes_node_label_(.+)"},
                {"target_label": "__address__", "replacement": API_SERVER},
                {
                    "source_labels": ["__meta_kubernetes_node_name"],
                    "regex": "(.+)",
                    "target_label": "__metrics_path__",
                    "replacement": "/api/v1/nodes/${1}/proxy/metrics/cadvisor",
                },
            ],
        }),
        json!({
            "job_name": "kubernetes-service-endpoints",
            "kubernetes_sd_configs": [{"role": "endpoints"}],
            "relabel_configs": [
                {
                    "source_labels": ["__meta_kubernetes_service_annotation_prometheus_io_scrape"],
                    "action": "keep",
                    "regex": "true",
                },
                {
                    "source_labels": ["__meta_kubernetes_service_annotation_prometheus_io_scheme"],
                    "action": "replace",
                    "target_label": "__scheme__",
                    "regex": "(https?)",
                },
                {
                    "source_labels": ["__meta_kubernetes_service_annotation_prometheus_io_path"],
                    "action": "replace",
                    "target_label": "__metrics_path__",
                    "regex": "(.+)",
                },
                {
                    "source_labels": [
                        "__address__",
                        "__meta_kubernetes_service_annotation_prometheus_io_port",
                    ],
                    "action": "replace",
                    "target_label": "__address__",
                    "regex": ANNOTATED_ADDRESS,
                    "replacement": "$1:$2",
                },
                {"action": "labelmap", "regex": "__meta_kubernetes_service_label_(.+)"},
                {
                    "source_labels": ["__meta_kubernetes_namespace"],
                    "action": "replace",
                    "target_label": "kubernetes_namespace",
                },
                {
                    "source_labels": ["__meta_kubernetes_service_name"],
                    "action": "replace",
                    "target_label": "kubernetes_name",
                },
            ],
        }),
    ]
}
