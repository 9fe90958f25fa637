//! One-shot start-up lookup of the account id and OIDC issuer of an EKS cluster.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_eks::error::DisplayErrorContext;
use regex::Regex;
use tracing::*;

use crate::{Error, Result};

const ISSUER_SCHEME: &str = "https://";

/// The parts of a `DescribeCluster` answer the webhook relies on
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterDescription {
    pub arn: Option<String>,
    pub oidc_issuer: Option<String>,
}

/// Cloud control plane seam
#[async_trait]
pub trait DescribeCluster: Send + Sync {
    async fn describe_cluster(&self, name: &str) -> Result<ClusterDescription>;
}

/// `DescribeCluster` against the EKS API
pub struct Eks {
    client: aws_sdk_eks::Client,
}

impl Eks {
    /// Load AWS configuration from the environment, pinned to `region` when it is not empty
    pub async fn from_env(region: &str) -> Self {
        let loader = aws_config::defaults(BehaviorVersion::latest());
        let config = if region.is_empty() {
            info!("loading AWS config with default region lookup");
            loader.load().await
        } else {
            info!(region, "loading AWS config");
            loader.region(Region::new(region.to_owned())).load().await
        };
        Eks {
            client: aws_sdk_eks::Client::new(&config),
        }
    }
}

#[async_trait]
impl DescribeCluster for Eks {
    async fn describe_cluster(&self, name: &str) -> Result<ClusterDescription> {
        let output = self
            .client
            .describe_cluster()
            .name(name)
            .send()
            .await
            .map_err(|e| Error::Introspection(format!("DescribeCluster: {}", DisplayErrorContext(&e))))?;

        let cluster = output
            .cluster()
            .ok_or_else(|| Error::Introspection(format!("cluster {name} not described")))?;
        Ok(ClusterDescription {
            arn: cluster.arn().map(str::to_owned),
            oidc_issuer: cluster
                .identity()
                .and_then(|i| i.oidc())
                .and_then(|o| o.issuer())
                .map(str::to_owned),
        })
    }
}

/// Values resolved from the cluster, fixed for the life of the process
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterIdentity {
    pub account_id: String,
    /// Issuer URL without its `https://` scheme
    pub oidc_provider: String,
}

/// Describe `cluster_name` once and extract its identity
pub async fn introspect(api: &dyn DescribeCluster, cluster_name: &str) -> Result<ClusterIdentity> {
    info!(cluster = cluster_name, "querying cluster");
    let description = api.describe_cluster(cluster_name).await?;

    let arn = description
        .arn
        .ok_or_else(|| Error::Introspection("cluster has no ARN".to_owned()))?;
    let issuer = description
        .oidc_issuer
        .ok_or_else(|| Error::Introspection("cluster has no OIDC issuer".to_owned()))?;

    let identity = ClusterIdentity {
        account_id: account_id(&arn)?,
        oidc_provider: oidc_provider(&issuer)?,
    };
    info!(
        account_id = %identity.account_id,
        oidc_provider = %identity.oidc_provider,
        "resolved cluster identity"
    );
    Ok(identity)
}

/// Account id from `arn:<partition>:eks:<region>:<account>:cluster/<name>`
pub fn account_id(arn: &str) -> Result<String> {
    let re = Regex::new(r"^arn:[^:]+:eks:[^:]+:(?P<account>\d{12}):cluster/.+$")
        .map_err(|e| Error::Introspection(e.to_string()))?;
    re.captures(arn)
        .and_then(|c| c.name("account"))
        .map(|m| m.as_str().to_owned())
        .ok_or_else(|| Error::Introspection(format!("unexpected cluster ARN {arn}")))
}

pub fn oidc_provider(issuer: &str) -> Result<String> {
    issuer
        .strip_prefix(ISSUER_SCHEME)
        .filter(|rest| !rest.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| Error::Introspection(format!("unexpected OIDC issuer {issuer}")))
}
