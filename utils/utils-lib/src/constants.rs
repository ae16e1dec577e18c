/// Various common constants used by the resize controller and node agent.

/// The name of the CSI driver whose volumes we resize.
pub const CSI_PLUGIN_NAME: &str = "csi.vsphere.vmware.com";

/// Annotation set by external provisioners on dynamically provisioned volumes.
pub const PROVISIONED_BY_ANNOTATION: &str = "pv.kubernetes.io/provisioned-by";

/// Default timeout for any REST or kubernetes request.
pub const DEFAULT_REQ_TIMEOUT: &str = "30s";

/// Poll interval used while waiting on a resize to complete.
pub const RESIZE_POLL_INTERVAL: &str = "2s";

/// Total wait budget for a single resize step.
pub const TOTAL_RESIZE_WAIT_PERIOD: &str = "10m";

/// Wait budget for a claim capacity update to be accepted by the api-server.
pub const CAPACITY_UPDATE_TIMEOUT: &str = "30s";

/// Delay before retrying a transient controller expansion failure.
pub const RESIZE_RETRY_INTERVAL: &str = "10s";

/// Delay before retrying a terminal controller expansion failure which was left pending.
pub const TERMINAL_RESIZE_RETRY_INTERVAL: &str = "5m";

/// Root directory where kubelet keeps the pod volume mounts.
pub const KUBELET_DIR: &str = "/var/lib/kubelet";

/// Annotations naming the provisioner responsible for a claim.
pub const STORAGE_PROVISIONER_ANNOTATIONS: [&str; 2] = [
    "volume.kubernetes.io/storage-provisioner",
    "volume.beta.kubernetes.io/storage-provisioner",
];
