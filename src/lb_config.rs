//! Typed load balancer configuration derived from service annotations.
//!
//! Everything here is pure: the configuration is recomputed from the
//! annotation map on every reconcilation and never cached.

use std::{collections::BTreeMap, ops::RangeInclusive, str::FromStr};

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use serde::{Deserialize, Deserializer};

use crate::{
    consts,
    error::{HwLBError, HwLBResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    #[default]
    RoundRobin,
    LeastConnections,
    SourceIp,
}

impl Algorithm {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "ROUND_ROBIN",
            Self::LeastConnections => "LEAST_CONNECTIONS",
            Self::SourceIp => "SOURCE_IP",
        }
    }
}

impl FromStr for Algorithm {
    type Err = HwLBError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ROUND_ROBIN" | "" => Ok(Self::RoundRobin),
            "LEAST_CONNECTIONS" => Ok(Self::LeastConnections),
            "SOURCE_IP" => Ok(Self::SourceIp),
            _ => Err(HwLBError::invalid_annotation(
                consts::ELB_ALGORITHM_ANN_NAME,
                s,
                format!("LB algorithm [{s}] not supported"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionAffinity {
    #[default]
    None,
    ClientIp {
        persistence_timeout: u32,
    },
    Cookie {
        /// Set for application cookies, absent for cookies inserted by the balancer.
        cookie_name: Option<String>,
    },
}

impl SessionAffinity {
    /// Session persistence type as the cloud API names it.
    #[must_use]
    pub const fn persistence_type(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::ClientIp { .. } => Some(consts::SESSION_SOURCE_IP),
            Self::Cookie { cookie_name: None } => Some(consts::SESSION_HTTP_COOKIE),
            Self::Cookie { cookie_name: Some(_) } => Some(consts::SESSION_APP_COOKIE),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheckProtocol {
    Tcp,
    Http,
    UdpConnect,
}

impl HealthCheckProtocol {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Http => "HTTP",
            Self::UdpConnect => "UDP_CONNECT",
        }
    }

    /// Protocol used when the option does not name one.
    #[must_use]
    pub fn default_for(port_protocol: &str) -> Self {
        if port_protocol.eq_ignore_ascii_case("UDP") {
            Self::UdpConnect
        } else {
            Self::Tcp
        }
    }
}

impl FromStr for HealthCheckProtocol {
    type Err = HwLBError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TCP" => Ok(Self::Tcp),
            "HTTP" => Ok(Self::Http),
            "UDP_CONNECT" => Ok(Self::UdpConnect),
            _ => Err(HwLBError::invalid_annotation(
                consts::ELB_HEALTH_CHECK_OPTION_ANN_NAME,
                s,
                "protocol must be one of TCP, HTTP, UDP_CONNECT",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthMonitor {
    /// Explicit protocol. When absent, it follows the listener protocol.
    pub protocol: Option<HealthCheckProtocol>,
    pub check_port: Option<u16>,
    pub url_path: String,
    pub delay: u32,
    pub timeout: u32,
    pub max_retries: u32,
}

impl HealthMonitor {
    #[must_use]
    pub fn protocol_for(&self, port_protocol: &str) -> HealthCheckProtocol {
        self.protocol
            .unwrap_or_else(|| HealthCheckProtocol::default_for(port_protocol))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub monitor: HealthMonitor,
}

/// Bounds and defaults for the health check option.
#[derive(Debug, Clone)]
pub struct HealthCheckLimits {
    pub delay: RangeInclusive<u32>,
    pub timeout: RangeInclusive<u32>,
    pub retries: RangeInclusive<u32>,
    pub default_delay: u32,
    pub default_timeout: u32,
    pub default_retries: u32,
}

impl Default for HealthCheckLimits {
    fn default() -> Self {
        Self {
            delay: consts::HEALTH_MONITOR_MIN_DELAY..=consts::HEALTH_MONITOR_MAX_DELAY,
            timeout: consts::HEALTH_MONITOR_MIN_TIMEOUT..=consts::HEALTH_MONITOR_MAX_TIMEOUT,
            retries: consts::HEALTH_MONITOR_MIN_RETRIES..=consts::HEALTH_MONITOR_MAX_RETRIES,
            default_delay: consts::HEALTH_MONITOR_DEFAULT_DELAY,
            default_timeout: consts::HEALTH_MONITOR_DEFAULT_TIMEOUT,
            default_retries: consts::HEALTH_MONITOR_DEFAULT_RETRIES,
        }
    }
}

/// Bounds and default for the client IP persistence timeout.
#[derive(Debug, Clone)]
pub struct PersistenceLimits {
    pub timeout: RangeInclusive<u32>,
    pub default_timeout: u32,
}

impl Default for PersistenceLimits {
    fn default() -> Self {
        Self {
            timeout: consts::SESSION_MIN_TIMEOUT..=consts::SESSION_MAX_TIMEOUT,
            default_timeout: consts::SESSION_DEFAULT_TIMEOUT,
        }
    }
}

/// Values the annotations fall back to, built from the cloud configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigDefaults {
    pub algorithm: Algorithm,
    pub health_check: HealthCheckLimits,
    pub persistence: PersistenceLimits,
}

impl ConfigDefaults {
    /// Build defaults using the algorithm from the cloud configuration.
    pub fn with_algorithm(algorithm: &str) -> HwLBResult<Self> {
        Ok(Self {
            algorithm: Algorithm::from_str(algorithm)?,
            ..Self::default()
        })
    }
}

/// Specification of a load balancer the operator creates on behalf of a service.
///
/// Example annotation value:
/// `{"type":"public","bandwidth_name":"bw","bandwidth_chargemode":"traffic","bandwidth_size":10,"bandwidth_sharetype":"PER","eip_type":"5_bgp"}`
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct AutoCreateSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub network_type: String,
    pub bandwidth_name: String,
    pub bandwidth_chargemode: String,
    #[serde(deserialize_with = "lenient_u32")]
    pub bandwidth_size: Option<u32>,
    pub bandwidth_sharetype: String,
    pub eip_type: String,
}

impl AutoCreateSpec {
    #[must_use]
    pub fn is_public(&self) -> bool {
        self.network_type == "public"
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SessionAffinityOption {
    #[serde(deserialize_with = "lenient_u32")]
    persistence_timeout: Option<u32>,
    cookie_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HealthCheckOption {
    protocol: Option<String>,
    #[serde(alias = "url_path")]
    path: Option<String>,
    #[serde(deserialize_with = "lenient_u32")]
    delay: Option<u32>,
    #[serde(deserialize_with = "lenient_u32")]
    timeout: Option<u32>,
    #[serde(deserialize_with = "lenient_u32")]
    max_retries: Option<u32>,
    #[serde(deserialize_with = "lenient_u32")]
    check_port: Option<u32>,
}

/// Accepts both `10` and `"10"`, users write either.
fn lenient_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }
    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(Raw::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Derived load balancer configuration of a single service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerConfig {
    pub algorithm: Algorithm,
    pub session_affinity: SessionAffinity,
    pub health_check: HealthCheckConfig,
    /// Present only if the service has no bound load balancer yet.
    pub auto_create: Option<AutoCreateSpec>,
    pub persist_auto_create: bool,
    pub host_network: bool,
    pub eip_id: Option<String>,
}

impl LoadBalancerConfig {
    /// Parse all load balancer annotations of the service.
    pub fn try_from_svc(svc: &Service, defaults: &ConfigDefaults) -> HwLBResult<Self> {
        Self::from_annotations(svc.annotations(), defaults)
    }

    pub fn from_annotations(
        annotations: &BTreeMap<String, String>,
        defaults: &ConfigDefaults,
    ) -> HwLBResult<Self> {
        let get = |key: &str| annotations.get(key).map(String::as_str);

        let algorithm = get(consts::ELB_ALGORITHM_ANN_NAME)
            .map(Algorithm::from_str)
            .transpose()?
            .unwrap_or(defaults.algorithm);

        let session_affinity = parse_session_affinity(
            get(consts::ELB_SESSION_AFFINITY_MODE_ANN_NAME).unwrap_or_default(),
            get(consts::ELB_SESSION_AFFINITY_OPTION_ANN_NAME),
            &defaults.persistence,
        )?;

        let enabled =
            parse_health_check_flag(get(consts::ELB_HEALTH_CHECK_FLAG_ANN_NAME).unwrap_or_default())?;
        let monitor = parse_health_check_option(
            get(consts::ELB_HEALTH_CHECK_OPTION_ANN_NAME).filter(|_| enabled),
            &defaults.health_check,
        )?;

        let auto_create = if needs_auto_create(annotations) {
            get(consts::ELB_AUTOCREATE_ANN_NAME)
                .map(parse_auto_create)
                .transpose()?
        } else {
            None
        };

        Ok(Self {
            algorithm,
            session_affinity,
            health_check: HealthCheckConfig { enabled, monitor },
            auto_create,
            persist_auto_create: parse_persist_auto_create(
                get(consts::ELB_PERSIST_AUTOCREATE_ANN_NAME).unwrap_or_default(),
            ),
            host_network: is_host_network(annotations),
            eip_id: get(consts::ELB_EIP_ID_ANN_NAME)
                .filter(|id| !id.is_empty())
                .map(ToString::to_string),
        })
    }
}

pub fn parse_health_check_flag(value: &str) -> HwLBResult<bool> {
    match value {
        "on" | "" => Ok(true),
        "off" => Ok(false),
        _ => Err(HwLBError::invalid_annotation(
            consts::ELB_HEALTH_CHECK_FLAG_ANN_NAME,
            value,
            "invalid health check flag, only on/off are supported",
        )),
    }
}

/// Anything but an empty string or exactly `false` enables persistence.
#[must_use]
pub fn parse_persist_auto_create(value: &str) -> bool {
    !(value.is_empty() || value == "false")
}

pub fn parse_session_affinity(
    mode: &str,
    option: Option<&str>,
    limits: &PersistenceLimits,
) -> HwLBResult<SessionAffinity> {
    // The option of a disabled affinity is never looked at.
    if mode.is_empty() || mode == consts::SESSION_NONE {
        return Ok(SessionAffinity::None);
    }
    let option_raw = option.filter(|raw| !raw.trim().is_empty());
    let option = match option_raw {
        Some(raw) => serde_json::from_str::<SessionAffinityOption>(raw).map_err(|err| {
            HwLBError::invalid_annotation(consts::ELB_SESSION_AFFINITY_OPTION_ANN_NAME, raw, err)
        })?,
        None => SessionAffinityOption::default(),
    };
    match mode {
        consts::SESSION_SOURCE_IP => {
            let timeout = option.persistence_timeout.unwrap_or(limits.default_timeout);
            if !limits.timeout.contains(&timeout) {
                return Err(HwLBError::invalid_annotation(
                    consts::ELB_SESSION_AFFINITY_OPTION_ANN_NAME,
                    timeout.to_string(),
                    format!(
                        "persistence_timeout must be in [{}, {}]",
                        limits.timeout.start(),
                        limits.timeout.end()
                    ),
                ));
            }
            Ok(SessionAffinity::ClientIp {
                persistence_timeout: timeout,
            })
        }
        consts::SESSION_HTTP_COOKIE => Ok(SessionAffinity::Cookie { cookie_name: None }),
        consts::SESSION_APP_COOKIE => match option.cookie_name {
            Some(name) if !name.is_empty() => Ok(SessionAffinity::Cookie {
                cookie_name: Some(name),
            }),
            _ => Err(HwLBError::invalid_annotation(
                consts::ELB_SESSION_AFFINITY_OPTION_ANN_NAME,
                option_raw.unwrap_or_default(),
                "cookie_name is required for APP_COOKIE",
            )),
        },
        _ => Err(HwLBError::invalid_annotation(
            consts::ELB_SESSION_AFFINITY_MODE_ANN_NAME,
            mode,
            "session affinity mode is not supported",
        )),
    }
}

fn bounded(
    value: Option<u32>,
    default: u32,
    range: &RangeInclusive<u32>,
    field: &str,
) -> HwLBResult<u32> {
    let value = value.unwrap_or(default);
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(HwLBError::invalid_annotation(
            consts::ELB_HEALTH_CHECK_OPTION_ANN_NAME,
            value.to_string(),
            format!("{field} must be in [{}, {}]", range.start(), range.end()),
        ))
    }
}

pub fn parse_health_check_option(
    raw: Option<&str>,
    limits: &HealthCheckLimits,
) -> HwLBResult<HealthMonitor> {
    let option = match raw.filter(|raw| !raw.trim().is_empty()) {
        Some(raw) => serde_json::from_str::<HealthCheckOption>(raw).map_err(|err| {
            HwLBError::invalid_annotation(consts::ELB_HEALTH_CHECK_OPTION_ANN_NAME, raw, err)
        })?,
        None => HealthCheckOption::default(),
    };

    let protocol = option
        .protocol
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(HealthCheckProtocol::from_str)
        .transpose()?;

    let check_port = option
        .check_port
        .map(|port| {
            u16::try_from(port)
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| {
                    HwLBError::invalid_annotation(
                        consts::ELB_HEALTH_CHECK_OPTION_ANN_NAME,
                        port.to_string(),
                        "check_port must be in [1, 65535]",
                    )
                })
        })
        .transpose()?;

    Ok(HealthMonitor {
        protocol,
        check_port,
        url_path: option
            .path
            .filter(|path| !path.is_empty())
            .unwrap_or_else(|| consts::HEALTH_MONITOR_DEFAULT_PATH.to_string()),
        delay: bounded(option.delay, limits.default_delay, &limits.delay, "delay")?,
        timeout: bounded(
            option.timeout,
            limits.default_timeout,
            &limits.timeout,
            "timeout",
        )?,
        max_retries: bounded(
            option.max_retries,
            limits.default_retries,
            &limits.retries,
            "max_retries",
        )?,
    })
}

pub fn parse_auto_create(raw: &str) -> HwLBResult<AutoCreateSpec> {
    let spec: AutoCreateSpec = serde_json::from_str(raw)
        .map_err(|err| HwLBError::invalid_annotation(consts::ELB_AUTOCREATE_ANN_NAME, raw, err))?;
    match spec.network_type.as_str() {
        "public" | "inner" => Ok(spec),
        other => Err(HwLBError::invalid_annotation(
            consts::ELB_AUTOCREATE_ANN_NAME,
            raw,
            format!("unsupported load balancer type {other:?}, expected public or inner"),
        )),
    }
}

fn non_empty<'a>(annotations: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    annotations
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}

/// The service has no bound load balancer but asks for one to be created.
#[must_use]
pub fn needs_auto_create(annotations: &BTreeMap<String, String>) -> bool {
    non_empty(annotations, consts::ELB_ID_ANN_NAME).is_none()
        && non_empty(annotations, consts::ELB_AUTOCREATE_ANN_NAME).is_some()
}

/// The service is bound to a load balancer that the operator created.
#[must_use]
pub fn has_auto_created(annotations: &BTreeMap<String, String>) -> bool {
    non_empty(annotations, consts::ELB_ID_ANN_NAME).is_some()
        && non_empty(annotations, consts::ELB_AUTOCREATE_ANN_NAME).is_some()
}

#[must_use]
pub fn is_host_network(annotations: &BTreeMap<String, String>) -> bool {
    annotations
        .get(consts::HOST_NETWORK_ANN_NAME)
        .is_some_and(|value| value == "true")
}
