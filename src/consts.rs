// Service annotations
pub const ELB_CLASS_ANN_NAME: &str = "kubernetes.io/elb.class";
pub const ELB_ID_ANN_NAME: &str = "kubernetes.io/elb.id";
pub const ELB_MARK_ANN_NAME: &str = "kubernetes.io/elb.mark";
pub const ELB_AUTOCREATE_ANN_NAME: &str = "kubernetes.io/elb.autocreate";
pub const ELB_EIP_ID_ANN_NAME: &str = "kubernetes.io/elb.eip-id";
pub const ELB_ALGORITHM_ANN_NAME: &str = "kubernetes.io/elb.lb-algorithm";
pub const ELB_SESSION_AFFINITY_MODE_ANN_NAME: &str = "kubernetes.io/elb.session-affinity-mode";
pub const ELB_SESSION_AFFINITY_OPTION_ANN_NAME: &str =
    "kubernetes.io/elb.session-affinity-option";
pub const ELB_PERSIST_AUTOCREATE_ANN_NAME: &str = "kubernetes.io/elb.persist-autocreate";
pub const ELB_HEALTH_CHECK_FLAG_ANN_NAME: &str = "kubernetes.io/elb.health-check-flag";
pub const ELB_HEALTH_CHECK_OPTION_ANN_NAME: &str = "kubernetes.io/elb.health-check-option";
pub const HOST_NETWORK_ANN_NAME: &str = "kubernetes.io/hws-hostNetwork";

// Backend classes
pub const CLASS_ELASTICITY: &str = "elasticity";
pub const CLASS_UNION: &str = "union";
pub const CLASS_PERFORMANCE: &str = "performance";
pub const CLASS_DNAT: &str = "dnat";

// Credential secret keys
pub const SECRET_CREDENTIAL_KEY: &str = "security.credential";
pub const SECRET_ACCESS_KEY: &str = "access";
pub const SECRET_SECRET_KEY: &str = "secret";
pub const CREDENTIAL_CACHE_SIZE: usize = 200;

/// Number of attempts the marker loop makes, and the marker value
/// at which the load balancer configuration is no longer retried.
pub const MAX_RETRY: u32 = 3;

pub const HEALTHZ_PORT_NAME: &str = "cce-healthz";
pub const ATTENTION: &str = "Attention! It is auto-generated by CCE service, do not modify!";

// Session persistence
pub const SESSION_NONE: &str = "None";
pub const SESSION_SOURCE_IP: &str = "SOURCE_IP";
pub const SESSION_HTTP_COOKIE: &str = "HTTP_COOKIE";
pub const SESSION_APP_COOKIE: &str = "APP_COOKIE";
pub const SESSION_DEFAULT_TIMEOUT: u32 = 60;
pub const SESSION_MIN_TIMEOUT: u32 = 1;
pub const SESSION_MAX_TIMEOUT: u32 = 60;

// Health monitor
pub const HEALTH_MONITOR_MIN_DELAY: u32 = 1;
pub const HEALTH_MONITOR_MAX_DELAY: u32 = 50;
pub const HEALTH_MONITOR_MIN_TIMEOUT: u32 = 1;
pub const HEALTH_MONITOR_MAX_TIMEOUT: u32 = 50;
pub const HEALTH_MONITOR_MIN_RETRIES: u32 = 1;
pub const HEALTH_MONITOR_MAX_RETRIES: u32 = 10;
pub const HEALTH_MONITOR_DEFAULT_DELAY: u32 = 5;
pub const HEALTH_MONITOR_DEFAULT_TIMEOUT: u32 = 10;
pub const HEALTH_MONITOR_DEFAULT_RETRIES: u32 = 3;
pub const HEALTH_MONITOR_DEFAULT_PATH: &str = "/";

// Events
pub const EVENT_REPORTER: &str = "hws-cloudprovider";
pub const REASON_CREATE_LB_FAILED: &str = "CreateLoadBalancerFailed";
pub const ACTION_RECONCILE: &str = "Reconcile";

pub const FINALIZER_NAME: &str = "hwcloud-lb/finalizer";
