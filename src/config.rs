use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;
use tracing::level_filters::LevelFilter;

use crate::error::{HwLBError, HwLBResult};

#[derive(Debug, Clone, Parser)]
pub struct OperatorConfig {
    /// Path to the cloud configuration document (JSON).
    #[arg(short = 'c', long, env = "HWCLOUD_LB_CLOUD_CONFIG")]
    pub cloud_config: PathBuf,

    /// Cluster identifier recorded in the description of every listener.
    #[arg(long, env = "HWCLOUD_LB_CLUSTER_ID", default_value = "kubernetes")]
    pub cluster_id: String,

    /// How often a successfully reconciled service is checked again, in seconds.
    #[arg(long, env = "HWCLOUD_LB_REQUEUE_INTERVAL", default_value = "30")]
    pub requeue_interval: u64,

    /// Delay before a failed reconcilation is retried, in seconds.
    #[arg(long, env = "HWCLOUD_LB_ERROR_REQUEUE_INTERVAL", default_value = "30")]
    pub error_requeue_interval: u64,

    /// Capacity of the queue between the secret watcher and the credential cache.
    #[arg(long, env = "HWCLOUD_LB_SECRET_QUEUE_SIZE", default_value = "64")]
    pub secret_queue_size: usize,

    // Log level of the operator.
    #[arg(long, env = "HWCLOUD_LB_LOG_LEVEL", default_value = "INFO")]
    pub log_level: LevelFilter,
}

/// Cloud configuration document.
///
/// It is read once at startup and handed to every component
/// that needs it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudConfig {
    #[serde(default)]
    pub load_balancer: LoadBalancerOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadBalancerOptions {
    pub apiserver: String,
    /// Name of the secret holding cloud credentials.
    /// The secret is looked up in the namespace of each service.
    pub secret_name: String,
    pub signer_type: String,
    /// Algorithm used when a service does not set one.
    pub elb_algorithm: String,
    pub tenant_id: String,
    pub region: String,
    pub vpc_id: String,
    pub subnet_id: String,
    pub ecs_endpoint: String,
    pub elb_endpoint: String,
    pub alb_endpoint: String,
    pub plb_endpoint: String,
    pub nat_endpoint: String,
    pub vpc_endpoint: String,
    pub enterprise_enable: String,
}

impl CloudConfig {
    /// Read and validate the configuration document.
    pub fn from_file(path: &std::path::Path) -> HwLBResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> HwLBResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        if config.load_balancer.secret_name.is_empty() {
            return Err(HwLBError::ConfigError(
                "loadBalancer.secretName must be set".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn log(&self) {
        let lb = &self.load_balancer;
        tracing::info!(
            apiserver = lb.apiserver,
            secret_name = lb.secret_name,
            signer_type = lb.signer_type,
            algorithm = lb.elb_algorithm,
            tenant_id = lb.tenant_id,
            region = lb.region,
            vpc_id = lb.vpc_id,
            subnet_id = lb.subnet_id,
            elb_endpoint = lb.elb_endpoint,
            alb_endpoint = lb.alb_endpoint,
            plb_endpoint = lb.plb_endpoint,
            nat_endpoint = lb.nat_endpoint,
            "Loaded cloud configuration"
        );
    }
}
